//! The sync engine: orchestrates export, import, merge and sanitize between
//! the issue store and the ledger, mediated by the inter-process ledger lock
//! and an optional VCS transport.
//!
//! All global state of the original design is carried explicitly in a
//! [`SyncContext`]: store handle, workspace paths, typed config, actor and
//! cancellation flag. Every entry point receives the context; nothing lives
//! in process-wide statics.

pub mod merge;
pub mod oracle;

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::codec::jsonl::LedgerCodec;
use crate::config::{ConflictStrategy, SyncConfig, SyncMode};
use crate::error::{CResult, Error};
use crate::flush::FlushScheduler;
use crate::lock::{LedgerLock, LockMode};
use crate::manifest::DeletionManifest;
use crate::model::{DeletionRecord, Issue, Status};
use crate::sanitize::{ledger_ids, restrict_permissions, sanitize_ledger, SanitizeReport};
use crate::storage::store::IssueStore;
use crate::storage::StoreStats;
use crate::sync::merge::{three_way_merge, MergeReport};
use crate::vcs::VcsTransport;

pub const BEADS_DIR: &str = ".beads";
pub const DB_FILE: &str = "beads.db";
pub const LEDGER_FILE: &str = "issues.jsonl";
pub const MANIFEST_FILE: &str = "deletions.jsonl";
pub const BASE_SNAPSHOT_FILE: &str = "issues.base.jsonl";
pub const LEFT_SNAPSHOT_FILE: &str = "issues.left.jsonl";

pub const META_LAST_IMPORT: &str = "last_import_time";
pub const META_BD_VERSION: &str = "bd_version";
pub const META_REPO_ID: &str = "repo_id";
pub const META_CLONE_ID: &str = "clone_id";
pub const META_ISSUE_PREFIX: &str = "issue_prefix";
pub const META_PENDING_CONFLICTS: &str = "conflicts.pending";

/// Export refuses when the ledger holds at least this much more than the
/// store: a sign the local database is far behind its ledger.
const STALE_COUNT_RATIO: f64 = 1.2;

/// Filesystem layout of one workspace.
#[derive(Clone, Debug)]
pub struct WorkspacePaths {
    pub root: PathBuf,
}

impl WorkspacePaths {
    pub fn at(root: PathBuf) -> Self {
        Self { root }
    }

    /// Walks upward from `start` until a `.beads` directory appears.
    pub fn discover(start: &Path) -> CResult<Self> {
        let mut dir = start.to_path_buf();
        loop {
            if dir.join(BEADS_DIR).is_dir() {
                return Ok(Self { root: dir });
            }
            if !dir.pop() {
                return Err(Error::NotAWorkspace(format!(
                    "no {} directory above {}",
                    BEADS_DIR,
                    start.display()
                )));
            }
        }
    }

    pub fn beads_dir(&self) -> PathBuf {
        self.root.join(BEADS_DIR)
    }

    pub fn db(&self) -> PathBuf {
        self.beads_dir().join(DB_FILE)
    }

    pub fn ledger(&self) -> PathBuf {
        self.beads_dir().join(LEDGER_FILE)
    }

    pub fn manifest(&self) -> PathBuf {
        self.beads_dir().join(MANIFEST_FILE)
    }

    pub fn base_snapshot(&self) -> PathBuf {
        self.beads_dir().join(BASE_SNAPSHOT_FILE)
    }

    pub fn left_snapshot(&self) -> PathBuf {
        self.beads_dir().join(LEFT_SNAPSHOT_FILE)
    }

    pub fn lock_file(&self) -> PathBuf {
        LedgerLock::lock_path_for(&self.ledger())
    }

    /// The ledger path relative to the workspace root, as staged in the VCS.
    pub fn ledger_relative(&self) -> String {
        format!("{}/{}", BEADS_DIR, LEDGER_FILE)
    }
}

/// The sync modes exposed by `sync(mode)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncAction {
    ExportOnly,
    ImportOnly,
    FromMain,
    PullFirst,
    Status,
}

#[derive(Clone, Debug, Default)]
pub struct ExportReport {
    pub exported: usize,
    pub hash: String,
    pub orphan_warnings: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ImportReport {
    pub noop: bool,
    pub before: usize,
    pub after: usize,
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
    pub tombstoned: usize,
    pub deletions_enforced: usize,
    pub sanitize_removed: Vec<String>,
    pub sanitize_protected: Vec<String>,
    pub merge: MergeReport,
}

impl ImportReport {
    fn noop(count: usize) -> Self {
        Self { noop: true, before: count, after: count, ..Default::default() }
    }
}

/// Knobs for one run of the import pipeline.
///
/// `lenient` tolerates duplicate ids in the remote text (post-VCS-merge
/// ledgers); `skip_noop` bypasses the staleness short-circuit when the remote
/// text did not come from the ledger file; `use_base_snapshot` picks the
/// saved merge ancestor or an empty base.
struct ImportOptions {
    san: SanitizeReport,
    lenient: bool,
    skip_noop: bool,
    update_base: bool,
    use_base_snapshot: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            san: SanitizeReport::default(),
            lenient: false,
            skip_noop: false,
            update_base: true,
            use_base_snapshot: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SyncStatus {
    pub mode: SyncMode,
    pub strategy: ConflictStrategy,
    pub branch: Option<String>,
    pub remote: Option<String>,
    pub dirty: Vec<String>,
    pub last_import_time: Option<String>,
    pub ledger_differs: bool,
    pub pending_conflicts: Vec<String>,
    pub stats: StoreStats,
}

#[derive(Clone, Debug)]
pub enum SyncOutcome {
    Exported(ExportReport),
    Imported(ImportReport),
    Pulled { import: ImportReport, export: ExportReport },
    Status(Box<SyncStatus>),
}

/// Everything one sync entry point needs, carried explicitly.
pub struct SyncContext {
    pub store: IssueStore,
    pub paths: WorkspacePaths,
    pub config: SyncConfig,
    pub actor: String,
    /// Namespaces the content-hash key when several repos share one store.
    pub repo_key: Option<String>,
    pub cancel: Arc<AtomicBool>,
    codec: LedgerCodec,
}

impl SyncContext {
    /// Opens an existing workspace discovered from `start`.
    pub fn open(start: &Path, actor: &str) -> CResult<Self> {
        let paths = WorkspacePaths::discover(start)?;
        let mut store = IssueStore::open(paths.db())?;

        // Version drift is detected, not migrated.
        let version = env!("CARGO_PKG_VERSION");
        match store.get_metadata(META_BD_VERSION)? {
            Some(stored) if stored != version => {
                log::warn!("store written by beads {}, running {}", stored, version);
            }
            _ => {}
        }

        let config = SyncConfig::load(&mut store)?;
        Ok(Self {
            store,
            paths,
            config,
            actor: actor.to_string(),
            repo_key: None,
            cancel: Arc::new(AtomicBool::new(false)),
            codec: LedgerCodec::new(),
        })
    }

    /// Creates a fresh workspace at `root`.
    pub fn init(root: &Path, prefix: &str, actor: &str) -> CResult<Self> {
        let paths = WorkspacePaths::at(root.to_path_buf());
        std::fs::create_dir_all(paths.beads_dir())?;
        let mut store = IssueStore::open(paths.db())?;

        store.set_metadata(META_BD_VERSION, env!("CARGO_PKG_VERSION"))?;
        store.set_metadata(META_ISSUE_PREFIX, prefix)?;
        store.set_metadata(META_REPO_ID, &random_id())?;
        store.set_metadata(META_CLONE_ID, &random_id())?;

        let config = SyncConfig::load(&mut store)?;
        Ok(Self {
            store,
            paths,
            config,
            actor: actor.to_string(),
            repo_key: None,
            cancel: Arc::new(AtomicBool::new(false)),
            codec: LedgerCodec::new(),
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    pub fn issue_prefix(&mut self) -> CResult<String> {
        Ok(self.store.get_metadata(META_ISSUE_PREFIX)?.unwrap_or_else(|| "bd".to_string()))
    }

    fn lock(&self, mode: LockMode) -> CResult<LedgerLock> {
        LedgerLock::acquire(&self.paths.lock_file(), mode, self.config.lock_timeout)
    }

    fn check_cancelled(&self) -> CResult<()> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(Error::Value("sync cancelled".to_string()));
        }
        Ok(())
    }

    /// The one public entry point.
    pub fn sync(
        &mut self,
        action: SyncAction,
        vcs: Option<&dyn VcsTransport>,
    ) -> CResult<SyncOutcome> {
        match action {
            SyncAction::ExportOnly => Ok(SyncOutcome::Exported(self.export()?)),
            SyncAction::ImportOnly => Ok(SyncOutcome::Imported(self.import()?)),
            SyncAction::FromMain => {
                let vcs = vcs
                    .ok_or_else(|| Error::Value("from-main sync requires a VCS transport".into()))?;
                Ok(SyncOutcome::Imported(self.from_main(vcs)?))
            }
            SyncAction::PullFirst => {
                let vcs = vcs
                    .ok_or_else(|| Error::Value("pull-first sync requires a VCS transport".into()))?;
                self.pull_first(vcs)
            }
            SyncAction::Status => Ok(SyncOutcome::Status(Box::new(self.status()?))),
        }
    }

    // -- export --------------------------------------------------------------

    /// Exports the store to the ledger under the exclusive lock.
    pub fn export(&mut self) -> CResult<ExportReport> {
        let mut lock = self.lock(LockMode::Exclusive)?;
        let report = self.export_locked();
        lock.release();
        report
    }

    fn export_locked(&mut self) -> CResult<ExportReport> {
        let repo_key = self.repo_key.clone();
        let ledger = self.paths.ledger();
        let ledger_count = ledger_line_count(&ledger)?;
        let store_count = self.store.count_issues();

        // Never overwrite a populated ledger with an empty store.
        if store_count == 0 && ledger_count > 0 {
            return Err(Error::StaleDatabase(format!(
                "store is empty but the ledger holds {} issues",
                ledger_count
            )));
        }

        // A ledger far ahead of the store means the database is behind.
        if ledger_count > store_count
            && ledger_count as f64 >= store_count as f64 * STALE_COUNT_RATIO
        {
            return Err(Error::StaleDatabase(format!(
                "ledger holds {} issues but the store only {}",
                ledger_count, store_count
            )));
        }

        // Content-based staleness: remote changes not yet imported.
        if ledger.exists() && oracle::ledger_differs(&mut self.store, &ledger, repo_key.as_deref())? {
            let mtime = file_mtime(&ledger)?;
            let last_import = self.last_import_time()?;
            let ledger_is_newer = match (mtime, last_import) {
                (Some(mtime), Some(imported)) => mtime > imported,
                (Some(_), None) => true,
                _ => false,
            };
            if ledger_is_newer {
                return Err(Error::StaleDatabase(
                    "ledger has changes that were never imported".to_string(),
                ));
            }
            return Err(Error::StaleLedger(
                "ledger content was rewritten out-of-band to an older state".to_string(),
            ));
        }

        let issues = self.store.get_all_issues(true)?;
        let orphan_warnings = orphaned_edges(&issues);
        for warning in &orphan_warnings {
            log::warn!("{}", warning);
        }

        // Left snapshot of the pre-export ledger state.
        if ledger.exists() {
            std::fs::copy(&ledger, self.paths.left_snapshot())?;
        }

        let text = self.codec.emit(&issues)?;
        write_atomic(&ledger, &text)?;

        let dirty = self.store.get_dirty_ids()?;
        self.store.clear_dirty(&dirty)?;

        let hash = oracle::hash_bytes(text.as_bytes());
        oracle::record_ledger_hash(&mut self.store, &hash, repo_key.as_deref())?;
        self.set_last_import_time(self.now())?;

        log::info!("exported {} issues to {}", issues.len(), ledger.display());
        Ok(ExportReport { exported: issues.len(), hash, orphan_warnings })
    }

    // -- import --------------------------------------------------------------

    /// Imports the ledger into the store under the exclusive lock.
    pub fn import(&mut self) -> CResult<ImportReport> {
        let mut lock = self.lock(LockMode::Exclusive)?;
        let text = read_or_empty(&self.paths.ledger())?;
        let report = self.import_core(&text, ImportOptions::default());
        lock.release();
        report
    }

    /// Merges the default branch's copy of the ledger into the store. The
    /// merge runs without an ancestor: main's copy usually trails the sync
    /// branch, and issues it lacks must not read as remote deletions.
    pub fn from_main(&mut self, vcs: &dyn VcsTransport) -> CResult<ImportReport> {
        if vcs.has_unmerged()? {
            return Err(Error::UnmergedPaths("a merge or rebase is in progress".to_string()));
        }
        let branch = vcs.default_branch("origin")?;
        let spec = format!("{}:{}", branch, self.paths.ledger_relative());
        let text = vcs.show(&spec)?;

        let mut lock = self.lock(LockMode::Exclusive)?;
        let report = self.import_core(
            &text,
            ImportOptions {
                lenient: true,
                skip_noop: true,
                use_base_snapshot: false,
                ..Default::default()
            },
        );
        lock.release();
        report
    }

    /// The merge-and-apply pipeline shared by all import flavors.
    fn import_core(&mut self, remote_text: &str, opts: ImportOptions) -> CResult<ImportReport> {
        let repo_key = self.repo_key.clone();
        let san = &opts.san;
        let before = self.store.count_issues();

        if !opts.skip_noop
            && !oracle::ledger_differs(&mut self.store, &self.paths.ledger(), repo_key.as_deref())?
            && san.removed.is_empty()
        {
            log::info!("ledger unchanged since last import, nothing to do");
            return Ok(ImportReport::noop(before));
        }

        let remote = if opts.lenient {
            self.codec.parse_merged(remote_text)?
        } else {
            self.codec.parse(remote_text)?
        };
        let base = if opts.use_base_snapshot {
            self.codec.parse_merged(&read_or_empty(&self.paths.base_snapshot())?)?
        } else {
            Vec::new()
        };
        let local = self.store.get_all_issues(true)?;

        let outcome = three_way_merge(&base, &local, &remote, self.config.strategy);
        let mut merged = outcome.issues;

        // Deletion-manifest enforcement: a manifest-listed id never comes
        // back as a non-tombstone, no matter whose clock was ahead, unless
        // the sanitizer protected it as fresh local work.
        let deletions = DeletionManifest::new(self.paths.manifest()).load()?;
        let exempt: BTreeSet<&str> = san.protected.iter().map(|s| s.as_str()).collect();
        let mut deletions_enforced = 0;
        for issue in merged.iter_mut() {
            if issue.is_tombstone() || exempt.contains(issue.id.as_str()) {
                continue;
            }
            if let Some(record) = deletions.get(&issue.id) {
                force_tombstone(issue, record);
                deletions_enforced += 1;
            }
        }

        // Post-import validation happens before anything is written: a count
        // decrease must be covered by sanitized removals plus recorded
        // manifest deletions, or the import is aborted untouched.
        let after = merged.len();
        if after < before {
            let decrease = before - after;
            let accounted = san.removed.len() + deletions.len();
            if decrease > accounted {
                return Err(Error::DataLoss {
                    before,
                    after,
                    accounted,
                    detail: format!(
                        "sanitized={} manifest={}; see {} and {}",
                        san.removed.len(),
                        deletions.len(),
                        self.paths.manifest().display(),
                        self.paths.left_snapshot().display()
                    ),
                });
            }
        }

        // Write the merged ledger, then apply field-level changes to the
        // store: create missing rows, rewrite changed ones, drop merged-away
        // rows. Unchanged rows are left alone.
        let merged_text = self.codec.emit(&merged)?;
        write_atomic(&self.paths.ledger(), &merged_text)?;

        let mut report = ImportReport {
            noop: false,
            before,
            after,
            deletions_enforced,
            sanitize_removed: san.removed.clone(),
            sanitize_protected: san.protected.clone(),
            merge: outcome.report,
            ..Default::default()
        };

        let merged_ids: BTreeSet<&str> = merged.iter().map(|i| i.id.as_str()).collect();
        for issue in &merged {
            match self.store.get_issue(&issue.id)? {
                None => {
                    self.store.apply_imported(issue)?;
                    report.created += 1;
                    if issue.is_tombstone() {
                        report.tombstoned += 1;
                    }
                }
                Some(existing) if existing != *issue => {
                    if issue.is_tombstone() && !existing.is_tombstone() {
                        report.tombstoned += 1;
                    }
                    self.store.apply_imported(issue)?;
                    report.updated += 1;
                }
                Some(_) => {}
            }
        }
        for issue in &local {
            if !merged_ids.contains(issue.id.as_str()) {
                self.store.remove_issue_row(&issue.id)?;
                report.removed += 1;
            }
        }

        let hash = oracle::hash_bytes(merged_text.as_bytes());
        oracle::record_ledger_hash(&mut self.store, &hash, repo_key.as_deref())?;
        self.set_last_import_time(self.now())?;

        if opts.update_base {
            write_atomic(&self.paths.base_snapshot(), &merged_text)?;
        }

        if report.merge.conflicts_manual.is_empty() {
            self.store.set_metadata(META_PENDING_CONFLICTS, "")?;
        } else {
            self.store
                .set_metadata(META_PENDING_CONFLICTS, &report.merge.conflicts_manual.join(","))?;
        }

        log::info!(
            "imported ledger: {} created, {} updated, {} removed, {} tombstoned",
            report.created,
            report.updated,
            report.removed,
            report.tombstoned
        );
        Ok(report)
    }

    // -- pull-first orchestration --------------------------------------------

    pub fn pull_first(&mut self, vcs: &dyn VcsTransport) -> CResult<SyncOutcome> {
        if vcs.has_unmerged()? {
            return Err(Error::UnmergedPaths("a merge or rebase is in progress".to_string()));
        }
        self.check_cancelled()?;
        let branch = self.config.branch.clone();
        let ledger = self.paths.ledger();

        // Absorb out-of-band ledger edits, then capture the left snapshot,
        // all under the lock; release it around the transport pull so the
        // VCS can rewrite the ledger freely.
        {
            let mut lock = self.lock(LockMode::Exclusive)?;
            let result = (|| -> CResult<()> {
                let repo_key = self.repo_key.clone();
                if oracle::ledger_differs(&mut self.store, &ledger, repo_key.as_deref())? {
                    log::warn!(
                        "{}",
                        Error::ContentHashMismatch(
                            "ledger changed since last reconciliation".to_string()
                        )
                    );
                    let text = read_or_empty(&ledger)?;
                    self.import_core(
                        &text,
                        ImportOptions { lenient: true, skip_noop: true, ..Default::default() },
                    )?;
                }
                if ledger.exists() {
                    std::fs::copy(&ledger, self.paths.left_snapshot())?;
                } else {
                    std::fs::write(self.paths.left_snapshot(), b"")?;
                }
                Ok(())
            })();
            lock.release();
            result?;
        }

        // In git-branch mode the pull happens in the sync-branch worktree and
        // the merged ledger is carried back; otherwise the transport pulls
        // into the working checkout directly.
        match self.sync_branch() {
            Some(sync_branch) => {
                let paths = self.paths.clone();
                let require_confirmation = self.config.require_confirmation_on_mass_delete;
                let controller = crate::worktree::WorktreeController::new(vcs, &paths);
                controller.pull_from_sync_branch(
                    &sync_branch,
                    false,
                    !require_confirmation,
                    require_confirmation,
                )?;
            }
            None => vcs.pull(branch.as_deref())?,
        }
        self.check_cancelled()?;

        let mut lock = self.lock(LockMode::Exclusive)?;
        let result = self.pull_first_locked(vcs);
        lock.release();
        result
    }

    /// The dedicated sync branch, when git-branch mode is active.
    fn sync_branch(&self) -> Option<String> {
        if self.config.mode == SyncMode::GitBranch {
            self.config.branch.clone()
        } else {
            None
        }
    }

    fn pull_first_locked(&mut self, vcs: &dyn VcsTransport) -> CResult<SyncOutcome> {
        let ledger = self.paths.ledger();

        let deletions = DeletionManifest::new(self.paths.manifest()).load()?;
        let left_ids = ledger_ids(&self.paths.left_snapshot())?;
        let san = sanitize_ledger(&ledger, &deletions, &left_ids)?;

        let text = read_or_empty(&ledger)?;
        let import = self.import_core(
            &text,
            ImportOptions { san, lenient: true, skip_noop: true, update_base: false, ..Default::default() },
        )?;
        let export = self.export_locked()?;

        // Commit and push the ledger: through the sync-branch worktree in
        // git-branch mode, directly otherwise, and only when the pull or
        // export actually changed the tracked files.
        let message = format!(
            "beads: sync {} issues ({} imported, {} exported)",
            self.store.count_issues(),
            import.created + import.updated,
            export.exported
        );
        match self.sync_branch() {
            Some(sync_branch) => {
                let paths = self.paths.clone();
                let controller = crate::worktree::WorktreeController::new(vcs, &paths);
                controller.commit_to_sync_branch(&sync_branch, Some(&message), true, false)?;
            }
            None => {
                let changed = !vcs.status_porcelain(Some(&self.paths.beads_dir()))?.is_empty();
                if changed {
                    let ledger_path = self.paths.ledger();
                    let manifest_path = self.paths.manifest();
                    vcs.commit(&[ledger_path.as_path(), manifest_path.as_path()], &message)?;
                    vcs.push(self.config.branch.as_deref(), false)?;
                }
            }
        }

        // Base snapshot advances only once the push is confirmed, so a
        // failed push leaves the old merge ancestor in place.
        std::fs::copy(&ledger, self.paths.base_snapshot())?;

        Ok(SyncOutcome::Pulled { import, export })
    }

    // -- status --------------------------------------------------------------

    pub fn status(&mut self) -> CResult<SyncStatus> {
        let repo_key = self.repo_key.clone();
        let ledger = self.paths.ledger();
        // Reading the ledger still happens inside a lock scope; shared mode
        // lets any number of status checks run alongside each other.
        let mut lock = self.lock(LockMode::Shared)?;
        let differs = oracle::ledger_differs(&mut self.store, &ledger, repo_key.as_deref());
        lock.release();
        let differs = differs?;
        let pending = self
            .store
            .get_metadata(META_PENDING_CONFLICTS)?
            .unwrap_or_default()
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();
        Ok(SyncStatus {
            mode: self.config.mode,
            strategy: self.config.strategy,
            branch: self.config.branch.clone(),
            remote: self.config.remote.clone(),
            dirty: self.store.get_dirty_ids()?,
            last_import_time: self.store.get_metadata(META_LAST_IMPORT)?,
            ledger_differs: differs,
            pending_conflicts: pending,
            stats: self.store.stats()?,
        })
    }

    // -- deletion ------------------------------------------------------------

    /// Tombstones an issue and appends the deletion record to the manifest,
    /// both under the exclusive ledger lock.
    pub fn delete_issue(&mut self, id: &str, reason: Option<&str>) -> CResult<DeletionRecord> {
        let mut lock = self.lock(LockMode::Exclusive)?;
        let result = (|| -> CResult<DeletionRecord> {
            let now = self.now();
            let actor = self.actor.clone();
            let record = self.store.delete(id, &actor, reason, now)?;
            let manifest = DeletionManifest::new(self.paths.manifest());
            manifest.append(&record)?;
            manifest.maybe_auto_compact(
                self.config.auto_compact,
                self.config.auto_compact_threshold,
                self.config.retention_days,
                now,
            )?;
            Ok(record)
        })();
        lock.release();
        result
    }

    // -- flush scheduler glue ------------------------------------------------

    /// Drives one scheduler cycle: if a flush is due, runs the export path
    /// and reports completion or failure back to the state machine.
    pub fn flush_with(&mut self, scheduler: &mut FlushScheduler, now: Instant) -> CResult<bool> {
        let ids = match scheduler.begin_flush(now) {
            Some(ids) => ids,
            None => return Ok(false),
        };
        match self.export() {
            Ok(_) => {
                scheduler.complete_flush(now);
                Ok(true)
            }
            Err(err) => {
                scheduler.fail_flush(ids, now);
                Err(err)
            }
        }
    }

    /// Shutdown drain: one final synchronous flush if anything is dirty.
    pub fn drain_flush(&mut self, scheduler: &mut FlushScheduler) -> CResult<bool> {
        let pending = scheduler.drain();
        if pending.is_empty() && !self.store.has_uncommitted_changes() {
            return Ok(false);
        }
        self.export()?;
        Ok(true)
    }

    fn last_import_time(&mut self) -> CResult<Option<DateTime<Utc>>> {
        match self.store.get_metadata(META_LAST_IMPORT)? {
            None => Ok(None),
            Some(raw) => Ok(Some(
                DateTime::parse_from_rfc3339(&raw)
                    .map_err(|err| Error::Parse(format!("{}: {}", META_LAST_IMPORT, err)))?
                    .with_timezone(&Utc),
            )),
        }
    }

    fn set_last_import_time(&mut self, at: DateTime<Utc>) -> CResult<()> {
        self.store
            .set_metadata(META_LAST_IMPORT, &at.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }
}

/// Atomic rewrite: temp file in the same directory, fsync, rename, 0600.
/// A crash mid-write leaves no visible artifact.
fn write_atomic(path: &Path, text: &str) -> CResult<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    restrict_permissions(path)?;
    Ok(())
}

fn read_or_empty(path: &Path) -> CResult<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err.into()),
    }
}

fn ledger_line_count(path: &Path) -> CResult<usize> {
    Ok(read_or_empty(path)?.lines().filter(|l| !l.trim().is_empty()).count())
}

fn file_mtime(path: &Path) -> CResult<Option<DateTime<Utc>>> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Some(DateTime::<Utc>::from(meta.modified()?))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Warnings for dependency edges pointing at ids the store does not know.
fn orphaned_edges(issues: &[Issue]) -> Vec<String> {
    let ids: BTreeSet<&str> = issues.iter().map(|i| i.id.as_str()).collect();
    let mut warnings = Vec::new();
    for issue in issues {
        for dep in &issue.dependencies {
            if !ids.contains(dep.depends_on_id.as_str()) {
                warnings.push(format!(
                    "orphaned dependency: {} -> {} ({})",
                    issue.id, dep.depends_on_id, dep.dep_type
                ));
            }
        }
    }
    warnings
}

fn force_tombstone(issue: &mut Issue, record: &DeletionRecord) {
    log::info!("deletion manifest forces {} to tombstone", issue.id);
    issue.status = Status::Tombstone;
    issue.deleted_at = Some(record.deleted_at);
    issue.deleted_by = Some(record.deleted_by.clone());
    issue.delete_reason = record.reason.clone();
    issue.closed_at = None;
    issue.close_reason = None;
    if issue.updated_at < record.deleted_at {
        issue.updated_at = record.deleted_at;
    }
    issue.content_hash = issue.compute_content_hash();
}

fn random_id() -> String {
    let n: u64 = rand::random();
    format!("{:016x}", n)
}
