//! The deletion manifest: an append-only record of issue deletions,
//! co-located with the ledger and shared by all clones. The sanitizer uses it
//! to tell a resurrected id from fresh local work after a VCS merge.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};

use crate::error::CResult;
use crate::model::DeletionRecord;

/// Manifest size beyond which auto-compaction considers pruning.
pub const DEFAULT_AUTO_COMPACT_THRESHOLD: usize = 1_000;

/// How long pruned-eligible records are retained, in days.
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

pub struct DeletionManifest {
    path: PathBuf,
}

impl DeletionManifest {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one deletion record. Callers hold the exclusive ledger lock.
    pub fn append(&self, record: &DeletionRecord) -> CResult<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Loads the manifest, collapsing duplicate ids to the latest timestamp.
    pub fn load(&self) -> CResult<BTreeMap<String, DeletionRecord>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(err.into()),
        };
        let mut records: BTreeMap<String, DeletionRecord> = BTreeMap::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let record: DeletionRecord = serde_json::from_str(line)?;
            match records.get(&record.id) {
                Some(existing) if existing.deleted_at >= record.deleted_at => {}
                _ => {
                    records.insert(record.id.clone(), record);
                }
            }
        }
        Ok(records)
    }

    /// Raw line count, duplicates included. Drives the auto-compact gate.
    pub fn entry_count(&self) -> CResult<usize> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(text.lines().filter(|l| !l.trim().is_empty()).count()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    /// Prunes records older than the retention window and rewrites the file
    /// atomically (the only operation that rewrites the manifest). Returns
    /// how many records were dropped.
    pub fn compact(&self, retention_days: i64, now: DateTime<Utc>) -> CResult<usize> {
        let records = self.load()?;
        let cutoff = now - Duration::days(retention_days);
        let before = self.entry_count()?;

        let kept: Vec<&DeletionRecord> =
            records.values().filter(|r| r.deleted_at >= cutoff).collect();

        let mut out = String::new();
        for record in &kept {
            out.push_str(&serde_json::to_string(record)?);
            out.push('\n');
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        std::fs::write(&tmp, out.as_bytes())?;
        std::fs::rename(&tmp, &self.path)?;

        Ok(before.saturating_sub(kept.len()))
    }

    /// Runs compaction when enabled and the manifest exceeds the threshold.
    pub fn maybe_auto_compact(
        &self,
        enabled: bool,
        threshold: usize,
        retention_days: i64,
        now: DateTime<Utc>,
    ) -> CResult<usize> {
        if !enabled || self.entry_count()? <= threshold {
            return Ok(0);
        }
        let pruned = self.compact(retention_days, now)?;
        if pruned > 0 {
            log::info!("compacted deletion manifest, pruned {} records", pruned);
        }
        Ok(pruned)
    }
}
