//! The sanitizer: filters resurrected entries out of the ledger after a VCS
//! merge.
//!
//! A VCS content merge can reintroduce a non-tombstone line for an id that
//! the deletion manifest records as deleted. The sanitizer drops such lines,
//! with one exception: an id also present in the left snapshot taken at the
//! start of this sync is fresh local work that happens to collide with a
//! previously deleted id (possible with hash-based ids), and is protected.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;

use serde_derive::Deserialize;

use crate::error::CResult;
use crate::model::{DeletionRecord, Status};

/// Counts and id lists from one sanitizer pass. The removed count feeds
/// post-import validation so legitimate deletions don't read as data loss.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SanitizeReport {
    pub removed: Vec<String>,
    pub protected: Vec<String>,
}

impl SanitizeReport {
    pub fn removed_count(&self) -> usize {
        self.removed.len()
    }
}

/// The only fields the sanitizer reads off a ledger line.
#[derive(Deserialize)]
struct LineProbe {
    id: String,
    #[serde(default)]
    status: Status,
}

/// Reads the ledger line by line, drops resurrected non-tombstone lines for
/// manifest-listed ids (unless protected by the left snapshot), and rewrites
/// the file atomically when anything was dropped.
pub fn sanitize_ledger(
    ledger: &Path,
    deletions: &BTreeMap<String, DeletionRecord>,
    left_ids: &BTreeSet<String>,
) -> CResult<SanitizeReport> {
    let text = match std::fs::read_to_string(ledger) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(SanitizeReport::default())
        }
        Err(err) => return Err(err.into()),
    };

    // First pass: ids whose deletion is visibly represented by a tombstone
    // line in this very ledger. A non-tombstone duplicate of such an id is a
    // resurrection even when the id sits in the left snapshot; the snapshot
    // only protects ids whose manifest entry refers to an older, unrelated
    // issue that happened to get the same hash-based id.
    let mut tombstoned = BTreeSet::new();
    for line in text.lines() {
        if let Ok(probe) = serde_json::from_str::<LineProbe>(line) {
            if probe.status == Status::Tombstone {
                tombstoned.insert(probe.id);
            }
        }
    }

    let mut report = SanitizeReport::default();
    let mut kept = String::with_capacity(text.len());

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        // Only the id and status matter here; lines that don't probe cleanly
        // are kept verbatim for the parse stage to report.
        let probe: LineProbe = match serde_json::from_str(line) {
            Ok(probe) => probe,
            Err(_) => {
                kept.push_str(line);
                kept.push('\n');
                continue;
            }
        };

        if deletions.contains_key(&probe.id) && probe.status != Status::Tombstone {
            if !tombstoned.contains(&probe.id) && left_ids.contains(&probe.id) {
                report.protected.push(probe.id);
                kept.push_str(line);
                kept.push('\n');
            } else {
                log::info!("sanitizer dropping resurrected id {}", probe.id);
                report.removed.push(probe.id);
            }
            continue;
        }

        kept.push_str(line);
        kept.push('\n');
    }

    if !report.removed.is_empty() {
        let tmp = ledger.with_extension("jsonl.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(kept.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, ledger)?;
        restrict_permissions(ledger)?;
    }

    Ok(report)
}

/// The set of ids present in a ledger file, by per-line probe. Used to build
/// the left-snapshot id set; a missing file is an empty set.
pub fn ledger_ids(path: &Path) -> CResult<BTreeSet<String>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(err) => return Err(err.into()),
    };
    let mut ids = BTreeSet::new();
    for line in text.lines() {
        if let Ok(probe) = serde_json::from_str::<LineProbe>(line) {
            ids.insert(probe.id);
        }
    }
    Ok(ids)
}

#[cfg(unix)]
pub(crate) fn restrict_permissions(path: &Path) -> CResult<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn restrict_permissions(_path: &Path) -> CResult<()> {
    Ok(())
}
