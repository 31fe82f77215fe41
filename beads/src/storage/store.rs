//! The issue store: durable structured issue data plus metadata keys and the
//! dirty-id index.
//!
//! Persistence is a journal in the same line-oriented idiom as the ledger
//! itself: one tagged JSON record per line, appended on every mutation and
//! replayed into memory on open. An issue row record carries the full row in
//! its canonical encoding, so the journal needs no binary framing at all;
//! the newline is the frame. Opening the store replays the journal front to
//! back (last write per key wins), and an interrupted append can only damage
//! the final line, which replay truncates away.
//!
//! Compaction rewrites the live state to a fresh journal and renames it over
//! the old one; nothing else ever rewrites the file.
//!
//! The store is single-writer: mutations take `&mut self`, and the journal
//! file holds an exclusive OS lock for the lifetime of the handle.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use fs4::FileExt;
use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::model::{
    Comment, DeletionRecord, Dependency, DependencyType, Issue, IssueType, Priority, Status,
};
use crate::storage::StoreStats;

/// One line of the store journal.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum JournalRecord {
    /// Upsert of an issue row, in the row's canonical encoding.
    Issue(Issue),
    /// Physical removal of a row (import-path drops only; user deletion
    /// tombstones the row instead).
    Remove { id: String },
    /// A metadata key/value pair.
    Meta { key: String, value: String },
    /// The issue diverged from the ledger since the last export.
    Dirty { id: String },
    /// The issue was exported; its dirty mark is gone.
    Clean { id: String },
}

/// Typed partial update for an issue. Only `Some` fields are applied.
#[derive(Clone, Debug, Default)]
pub struct IssueUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub design: Option<String>,
    pub acceptance_criteria: Option<String>,
    pub notes: Option<String>,
    pub status: Option<Status>,
    pub priority: Option<Priority>,
    pub issue_type: Option<IssueType>,
    pub assignee: Option<String>,
    pub external_ref: Option<String>,
}

#[derive(Debug)]
pub struct IssueStore {
    path: PathBuf,
    file: std::fs::File,
    issues: BTreeMap<String, Issue>,
    meta: BTreeMap<String, String>,
    dirty: BTreeSet<String>,
    /// Journal lines on disk, live or superseded. Replay cost grows with
    /// this, not with the live row count; compact() resets it.
    record_count: usize,
}

impl IssueStore {
    /// Opens or creates the store, takes the exclusive database lock, and
    /// replays the journal into memory.
    pub fn open(path: PathBuf) -> CResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|err| Error::Internal(format!("{}: {:?}", err, dir.to_str())))?;
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|err| {
            Error::Value(format!(
                "database {} is in use by another process: {}",
                path.display(),
                err
            ))
        })?;

        let mut store = Self {
            path,
            file,
            issues: BTreeMap::new(),
            meta: BTreeMap::new(),
            dirty: BTreeSet::new(),
            record_count: 0,
        };
        store.replay()?;
        Ok(store)
    }

    /// Replays the journal front to back. The last record per key wins. A
    /// line that fails to parse is tolerated only at the very end of the
    /// file, where it is the torn tail of an interrupted append and gets
    /// truncated away; anywhere else it is corruption.
    fn replay(&mut self) -> CResult<()> {
        let mut bytes = Vec::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut bytes)?;

        let mut pos = 0usize;
        while pos < bytes.len() {
            let (line, next) = match bytes[pos..].iter().position(|b| *b == b'\n') {
                Some(at) => (&bytes[pos..pos + at], pos + at + 1),
                None => (&bytes[pos..], bytes.len()),
            };
            if line.iter().all(|b| b.is_ascii_whitespace()) {
                pos = next;
                continue;
            }

            let record = std::str::from_utf8(line)
                .ok()
                .and_then(|text| serde_json::from_str::<JournalRecord>(text).ok());
            match record {
                Some(record) => {
                    self.apply_record(record);
                    pos = next;
                }
                None if next >= bytes.len() => {
                    log::error!(
                        "dropping incomplete journal tail at byte {} of {}",
                        pos,
                        self.path.display()
                    );
                    self.file.set_len(pos as u64)?;
                    break;
                }
                None => {
                    return Err(Error::Value(format!(
                        "corrupt store journal at byte {} of {}",
                        pos,
                        self.path.display()
                    )));
                }
            }
        }
        Ok(())
    }

    fn apply_record(&mut self, record: JournalRecord) {
        self.record_count += 1;
        match record {
            JournalRecord::Issue(mut issue) => {
                issue.content_hash = issue.compute_content_hash();
                self.issues.insert(issue.id.clone(), issue);
            }
            JournalRecord::Remove { id } => {
                self.issues.remove(&id);
            }
            JournalRecord::Meta { key, value } => {
                self.meta.insert(key, value);
            }
            JournalRecord::Dirty { id } => {
                self.dirty.insert(id);
            }
            JournalRecord::Clean { id } => {
                self.dirty.remove(&id);
            }
        }
    }

    fn append(&mut self, record: &JournalRecord) -> CResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(line.as_bytes())?;
        self.record_count += 1;
        Ok(())
    }

    /// Journals and installs an issue row.
    fn write_issue(&mut self, issue: Issue) -> CResult<()> {
        self.append(&JournalRecord::Issue(issue.clone()))?;
        self.issues.insert(issue.id.clone(), issue);
        Ok(())
    }

    // -- issue rows ----------------------------------------------------------

    pub fn get_issue(&self, id: &str) -> CResult<Option<Issue>> {
        Ok(self.issues.get(id).cloned())
    }

    fn require_issue(&self, id: &str) -> CResult<Issue> {
        self.get_issue(id)?
            .ok_or_else(|| Error::Value(format!("no such issue: {}", id)))
    }

    /// All issue rows in ascending id order. Tombstones are included only on
    /// request; export always includes them.
    pub fn get_all_issues(&self, include_tombstones: bool) -> CResult<Vec<Issue>> {
        Ok(self
            .issues
            .values()
            .filter(|issue| include_tombstones || !issue.is_tombstone())
            .cloned()
            .collect())
    }

    /// Fast count of issue rows, tombstones included.
    pub fn count_issues(&self) -> usize {
        self.issues.len()
    }

    /// Journal lines on disk, live or superseded. Grows with every mutation
    /// until compact() rewrites the file.
    pub fn journal_len(&self) -> usize {
        self.record_count
    }

    pub fn stats(&self) -> CResult<StoreStats> {
        let mut stats = StoreStats::default();
        for issue in self.issues.values() {
            stats.total += 1;
            match issue.status {
                Status::Open => stats.open += 1,
                Status::InProgress => stats.in_progress += 1,
                Status::Blocked => stats.blocked += 1,
                Status::Deferred => stats.deferred += 1,
                Status::Closed => stats.closed += 1,
                Status::Tombstone => stats.tombstone += 1,
            }
        }
        Ok(stats)
    }

    // -- mutations -----------------------------------------------------------

    /// Creates a new issue. The row gets fresh timestamps, a recomputed
    /// content hash, and a dirty marker.
    pub fn create(&mut self, mut issue: Issue, _actor: &str, now: DateTime<Utc>) -> CResult<Issue> {
        if self.issues.contains_key(&issue.id) {
            return Err(Error::Value(format!("issue {} already exists", issue.id)));
        }
        issue.created_at = now;
        issue.updated_at = now;
        issue.content_hash = issue.compute_content_hash();
        issue.validate()?;
        self.write_issue(issue.clone())?;
        self.mark_dirty(&issue.id)?;
        Ok(issue)
    }

    /// Applies a partial update. Every applied update assigns a fresh
    /// `updated_at` and marks the row dirty.
    pub fn update(
        &mut self,
        id: &str,
        patch: &IssueUpdate,
        _actor: &str,
        now: DateTime<Utc>,
    ) -> CResult<Issue> {
        let mut issue = self.require_issue(id)?;
        if issue.is_tombstone() {
            return Err(Error::Value(format!("issue {} is deleted", id)));
        }
        if let Some(v) = &patch.title {
            issue.title = v.clone();
        }
        if let Some(v) = &patch.description {
            issue.description = Some(v.clone());
        }
        if let Some(v) = &patch.design {
            issue.design = Some(v.clone());
        }
        if let Some(v) = &patch.acceptance_criteria {
            issue.acceptance_criteria = Some(v.clone());
        }
        if let Some(v) = &patch.notes {
            issue.notes = Some(v.clone());
        }
        if let Some(v) = &patch.status {
            issue.status = v.clone();
            if issue.status != Status::Closed {
                issue.closed_at = None;
                issue.close_reason = None;
            }
        }
        if let Some(v) = &patch.priority {
            issue.priority = *v;
        }
        if let Some(v) = &patch.issue_type {
            issue.issue_type = v.clone();
        }
        if let Some(v) = &patch.assignee {
            issue.assignee = Some(v.clone());
        }
        if let Some(v) = &patch.external_ref {
            issue.external_ref = Some(v.clone());
        }
        issue.updated_at = now;
        issue.content_hash = issue.compute_content_hash();
        issue.validate()?;
        self.write_issue(issue.clone())?;
        self.mark_dirty(id)?;
        Ok(issue)
    }

    pub fn close(
        &mut self,
        id: &str,
        reason: &str,
        _actor: &str,
        now: DateTime<Utc>,
    ) -> CResult<Issue> {
        let mut issue = self.require_issue(id)?;
        if issue.is_tombstone() {
            return Err(Error::Value(format!("issue {} is deleted", id)));
        }
        issue.status = Status::Closed;
        issue.closed_at = Some(now);
        issue.close_reason = if reason.is_empty() { None } else { Some(reason.to_string()) };
        issue.updated_at = now;
        issue.content_hash = issue.compute_content_hash();
        self.write_issue(issue.clone())?;
        self.mark_dirty(id)?;
        Ok(issue)
    }

    /// Moves the row to tombstone and returns the deletion record the caller
    /// must append to the deletion manifest under the ledger lock. The row is
    /// not physically removed.
    pub fn delete(
        &mut self,
        id: &str,
        actor: &str,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> CResult<DeletionRecord> {
        let mut issue = self.require_issue(id)?;
        issue.status = Status::Tombstone;
        issue.deleted_at = Some(now);
        issue.deleted_by = Some(actor.to_string());
        issue.delete_reason = reason.map(|r| r.to_string());
        issue.closed_at = None;
        issue.close_reason = None;
        issue.updated_at = now;
        issue.content_hash = issue.compute_content_hash();
        self.write_issue(issue)?;
        self.mark_dirty(id)?;
        Ok(DeletionRecord {
            id: id.to_string(),
            deleted_at: now,
            deleted_by: actor.to_string(),
            reason: reason.map(|r| r.to_string()),
        })
    }

    /// Writes an issue row exactly as imported from a merged ledger. Does not
    /// touch `updated_at` and does not mark the row dirty: imported state is
    /// by definition in agreement with the ledger.
    pub fn apply_imported(&mut self, issue: &Issue) -> CResult<()> {
        self.write_issue(issue.clone())
    }

    /// Physically removes a row. Only the import path uses this, for ids the
    /// three-way merge dropped; user-facing deletion always tombstones.
    pub fn remove_issue_row(&mut self, id: &str) -> CResult<()> {
        if self.issues.remove(id).is_some() {
            self.append(&JournalRecord::Remove { id: id.to_string() })?;
        }
        if self.dirty.remove(id) {
            self.append(&JournalRecord::Clean { id: id.to_string() })?;
        }
        Ok(())
    }

    // -- dependencies, labels, comments --------------------------------------

    /// Adds a dependency edge, refusing cycles on the `blocks` subgraph.
    pub fn add_dependency(
        &mut self,
        id: &str,
        dep: Dependency,
        now: DateTime<Utc>,
    ) -> CResult<()> {
        if dep.dep_type == DependencyType::Blocks && self.blocks_path_exists(&dep.depends_on_id, id)
        {
            return Err(Error::Value(format!(
                "dependency {} -> {} would create a blocks cycle",
                id, dep.depends_on_id
            )));
        }
        let mut issue = self.require_issue(id)?;
        if issue.dependencies.iter().any(|d| d == &dep) {
            return Ok(());
        }
        issue.dependencies.push(dep);
        issue.updated_at = now;
        issue.content_hash = issue.compute_content_hash();
        self.write_issue(issue)?;
        self.mark_dirty(id)
    }

    pub fn remove_dependency(
        &mut self,
        id: &str,
        depends_on_id: &str,
        now: DateTime<Utc>,
    ) -> CResult<()> {
        let mut issue = self.require_issue(id)?;
        issue.dependencies.retain(|d| d.depends_on_id != depends_on_id);
        issue.updated_at = now;
        issue.content_hash = issue.compute_content_hash();
        self.write_issue(issue)?;
        self.mark_dirty(id)
    }

    /// True if a path of `blocks` edges leads from `from` to `to`.
    fn blocks_path_exists(&self, from: &str, to: &str) -> bool {
        let mut stack = vec![from.to_string()];
        let mut seen = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(issue) = self.issues.get(&id) {
                for edge in &issue.dependencies {
                    if edge.dep_type == DependencyType::Blocks {
                        stack.push(edge.depends_on_id.clone());
                    }
                }
            }
        }
        false
    }

    /// Mapping from issue id to its outgoing dependency edges.
    pub fn get_all_dependencies(&self) -> CResult<BTreeMap<String, Vec<Dependency>>> {
        Ok(self
            .issues
            .values()
            .filter(|issue| !issue.dependencies.is_empty())
            .map(|issue| (issue.id.clone(), issue.dependencies.clone()))
            .collect())
    }

    pub fn get_labels(&self, id: &str) -> CResult<Vec<String>> {
        Ok(self.require_issue(id)?.labels)
    }

    pub fn get_comments(&self, id: &str) -> CResult<Vec<Comment>> {
        Ok(self.require_issue(id)?.comments)
    }

    pub fn add_label(&mut self, id: &str, label: &str, now: DateTime<Utc>) -> CResult<()> {
        let mut issue = self.require_issue(id)?;
        if issue.labels.iter().any(|l| l == label) {
            return Ok(());
        }
        issue.labels.push(label.to_string());
        issue.labels.sort();
        issue.updated_at = now;
        issue.content_hash = issue.compute_content_hash();
        self.write_issue(issue)?;
        self.mark_dirty(id)
    }

    pub fn remove_label(&mut self, id: &str, label: &str, now: DateTime<Utc>) -> CResult<()> {
        let mut issue = self.require_issue(id)?;
        issue.labels.retain(|l| l != label);
        issue.updated_at = now;
        issue.content_hash = issue.compute_content_hash();
        self.write_issue(issue)?;
        self.mark_dirty(id)
    }

    pub fn add_comment(
        &mut self,
        id: &str,
        author: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> CResult<()> {
        let mut issue = self.require_issue(id)?;
        issue.comments.push(Comment {
            author: author.to_string(),
            text: text.to_string(),
            created_at: now,
        });
        issue.updated_at = now;
        issue.content_hash = issue.compute_content_hash();
        self.write_issue(issue)?;
        self.mark_dirty(id)
    }

    // -- dirty tracking ------------------------------------------------------

    pub fn mark_dirty(&mut self, id: &str) -> CResult<()> {
        if self.dirty.insert(id.to_string()) {
            self.append(&JournalRecord::Dirty { id: id.to_string() })?;
        }
        Ok(())
    }

    pub fn get_dirty_ids(&self) -> CResult<Vec<String>> {
        Ok(self.dirty.iter().cloned().collect())
    }

    pub fn clear_dirty(&mut self, ids: &[String]) -> CResult<()> {
        for id in ids {
            if self.dirty.remove(id) {
                self.append(&JournalRecord::Clean { id: id.clone() })?;
            }
        }
        Ok(())
    }

    /// True iff any dirty ids exist.
    pub fn has_uncommitted_changes(&self) -> bool {
        !self.dirty.is_empty()
    }

    // -- metadata ------------------------------------------------------------

    pub fn get_metadata(&self, key: &str) -> CResult<Option<String>> {
        Ok(self.meta.get(key).cloned())
    }

    pub fn set_metadata(&mut self, key: &str, value: &str) -> CResult<()> {
        self.append(&JournalRecord::Meta { key: key.to_string(), value: value.to_string() })?;
        self.meta.insert(key.to_string(), value.to_string());
        Ok(())
    }

    // -- maintenance ---------------------------------------------------------

    /// Rewrites the journal with only the live state and atomically replaces
    /// the old file. Replay cost on open is otherwise proportional to every
    /// superseded record ever written.
    pub fn compact(&mut self) -> CResult<()> {
        let tmp_path = self.path.with_extension("db.new");
        let mut tmp = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.try_lock_exclusive().map_err(|err| {
            Error::Value(format!("compaction target {} is locked: {}", tmp_path.display(), err))
        })?;

        let mut out = String::new();
        let mut live = 0usize;
        for issue in self.issues.values() {
            out.push_str(&serde_json::to_string(&JournalRecord::Issue(issue.clone()))?);
            out.push('\n');
            live += 1;
        }
        for (key, value) in &self.meta {
            out.push_str(&serde_json::to_string(&JournalRecord::Meta {
                key: key.clone(),
                value: value.clone(),
            })?);
            out.push('\n');
            live += 1;
        }
        for id in &self.dirty {
            out.push_str(&serde_json::to_string(&JournalRecord::Dirty { id: id.clone() })?);
            out.push('\n');
            live += 1;
        }

        tmp.write_all(out.as_bytes())?;
        tmp.sync_all()?;
        std::fs::rename(&tmp_path, &self.path).map_err(|err| {
            Error::Value(format!(
                "database compact failed, from {} to {}: {}",
                tmp_path.display(),
                self.path.display(),
                err
            ))
        })?;

        // The renamed file keeps its lock; the old handle goes with the
        // unlinked inode.
        self.file = tmp;
        self.record_count = live;
        Ok(())
    }

    pub fn flush(&mut self) -> CResult<()> {
        Ok(self.file.sync_all()?)
    }
}

/// Attempt to flush when the store is closed.
impl Drop for IssueStore {
    fn drop(&mut self) {
        if let Err(error) = self.flush() {
            log::error!("failed to flush store: {}", error)
        }
    }
}
