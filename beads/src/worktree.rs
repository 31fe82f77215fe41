//! The sync-branch worktree controller: keeps ledger commits on a dedicated
//! VCS branch without ever touching the user's working checkout.
//!
//! The branch is materialized as a secondary worktree under the VCS common
//! directory. Ledger and deletion manifest are copied in, committed there,
//! and pulled back out; HEAD in the main checkout never moves.

use std::path::{Path, PathBuf};

use crate::config::{SyncConfig, KEY_SYNC_BRANCH};
use crate::error::{CResult, Error};
use crate::storage::store::IssueStore;
use crate::sync::{WorkspacePaths, BEADS_DIR, LEDGER_FILE, MANIFEST_FILE};
use crate::vcs::VcsTransport;

/// Directory under the VCS common dir holding beads worktrees.
const WORKTREE_SUBDIR: &str = "beads-worktrees";

/// A pulled ledger shrinking below half its previous line count trips the
/// mass-deletion safety check.
const MASS_DELETION_RATIO: f64 = 0.5;

#[derive(Clone, Debug, Default)]
pub struct ConfigureReport {
    pub branch: String,
    pub created_orphan: bool,
    pub recreated: bool,
    pub worktree: PathBuf,
    pub local_only: bool,
}

#[derive(Clone, Debug, Default)]
pub struct PullReport {
    pub up_to_date: bool,
    pub fast_forward: bool,
    pub before_count: usize,
    pub after_count: usize,
    pub mass_deletion: bool,
}

/// Validates a branch name against the VCS character-class rules.
pub fn validate_branch_name(name: &str) -> CResult<()> {
    let invalid = |msg: &str| Err(Error::InvalidConfig(format!("branch '{}': {}", name, msg)));
    if name.is_empty() {
        return invalid("must not be empty");
    }
    if name.starts_with('-') || name.starts_with('.') || name.starts_with('/') {
        return invalid("must not start with '-', '.' or '/'");
    }
    if name.ends_with('/') || name.ends_with('.') || name.ends_with(".lock") {
        return invalid("must not end with '/', '.' or '.lock'");
    }
    if name.contains("..") || name.contains("//") || name.contains("@{") {
        return invalid("must not contain '..', '//' or '@{'");
    }
    for c in name.chars() {
        if c.is_ascii_control()
            || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\')
        {
            return invalid("contains a character the VCS refuses in ref names");
        }
    }
    Ok(())
}

pub struct WorktreeController<'a> {
    vcs: &'a dyn VcsTransport,
    paths: &'a WorkspacePaths,
}

impl<'a> WorktreeController<'a> {
    pub fn new(vcs: &'a dyn VcsTransport, paths: &'a WorkspacePaths) -> Self {
        Self { vcs, paths }
    }

    /// The canonical worktree location for a sync branch.
    pub fn worktree_path(&self, branch: &str) -> CResult<PathBuf> {
        let common = self.vcs.rev_parse("--git-common-dir")?;
        let mut dir = PathBuf::from(common);
        if dir.is_relative() {
            dir = self.paths.root.join(dir);
        }
        Ok(dir.join(WORKTREE_SUBDIR).join(branch))
    }

    fn worktree_ledger(worktree: &Path) -> PathBuf {
        worktree.join(BEADS_DIR).join(LEDGER_FILE)
    }

    fn worktree_manifest(worktree: &Path) -> PathBuf {
        worktree.join(BEADS_DIR).join(MANIFEST_FILE)
    }

    /// Configures the dedicated sync branch: creates it (orphan when it has
    /// no history anywhere), materializes the worktree, seeds it with the
    /// current ledger, and records the branch in store metadata.
    pub fn configure(
        &self,
        store: &mut IssueStore,
        branch: &str,
        orphan: bool,
        force: bool,
    ) -> CResult<ConfigureReport> {
        validate_branch_name(branch)?;

        let mut report = ConfigureReport { branch: branch.to_string(), ..Default::default() };
        let local_ref = format!("refs/heads/{}", branch);
        let remote_ref = format!("refs/remotes/origin/{}", branch);
        let local_exists = self.vcs.rev_parse(&local_ref).is_ok();
        let remote_exists = self.vcs.rev_parse(&remote_ref).is_ok();
        let has_origin = self.vcs.has_remote("origin")?;

        if local_exists && orphan {
            // Recreating an existing branch is destructive: refuse to drop
            // unpushed commits without --force, and keep a ledger backup
            // around the delete/recreate pair.
            let unpushed = if remote_exists {
                self.vcs.rev_list_count(&format!("origin/{0}..{0}", branch))?
            } else {
                self.vcs.rev_list_count(branch).unwrap_or(1)
            };
            if unpushed > 0 && !force {
                return Err(Error::Value(format!(
                    "branch {} has {} unpushed commits; re-run with --force to discard them",
                    branch, unpushed
                )));
            }
            let backup = self.backup_ledger()?;
            let recreate = (|| -> CResult<()> {
                self.vcs.branch_delete(branch, true)?;
                self.vcs.branch_create_orphan(branch)
            })();
            if let Err(err) = recreate {
                self.restore_ledger(backup)?;
                return Err(err);
            }
            report.recreated = true;
            report.created_orphan = true;
        } else if !local_exists && !remote_exists {
            if !has_origin {
                log::warn!("no 'origin' remote; creating local-only sync branch {}", branch);
                report.local_only = true;
            }
            self.vcs.branch_create_orphan(branch)?;
            report.created_orphan = true;
        }
        // Absent locally but present remotely: `worktree add` below creates
        // the local tracking branch.

        let worktree = self.worktree_path(branch)?;
        if !worktree.exists() {
            self.vcs.worktree_create(branch, &worktree)?;
        }
        report.worktree = worktree.clone();

        self.copy_into_worktree(&worktree)?;
        let scoped = self.vcs.scoped(&worktree)?;
        let ledger = Self::worktree_ledger(&worktree);
        let manifest = Self::worktree_manifest(&worktree);
        scoped.commit(
            &[ledger.as_path(), manifest.as_path()],
            &format!("beads: seed sync branch {}", branch),
        )?;

        SyncConfig::set(store, KEY_SYNC_BRANCH, branch)?;
        log::info!("sync branch {} configured at {}", branch, worktree.display());
        Ok(report)
    }

    /// Copies the current ledger and manifest into the worktree, stages only
    /// those paths, commits, and optionally pushes.
    pub fn commit_to_sync_branch(
        &self,
        branch: &str,
        message: Option<&str>,
        push: bool,
        set_upstream: bool,
    ) -> CResult<bool> {
        let worktree = self.worktree_path(branch)?;
        if !worktree.exists() {
            return Err(Error::Value(format!(
                "no worktree for sync branch {}; run configure first",
                branch
            )));
        }

        self.copy_into_worktree(&worktree)?;
        let scoped = self.vcs.scoped(&worktree)?;
        if scoped.status_porcelain(None)?.is_empty() {
            return Ok(false);
        }

        let generated;
        let message = match message {
            Some(message) => message,
            None => {
                generated = format!(
                    "beads: update ledger ({})",
                    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
                );
                &generated
            }
        };

        let ledger = Self::worktree_ledger(&worktree);
        let manifest = Self::worktree_manifest(&worktree);
        scoped.commit(&[ledger.as_path(), manifest.as_path()], message)?;
        if push {
            scoped.push(Some(branch), set_upstream)?;
        }
        Ok(true)
    }

    /// Fetches the sync branch, fast-forwards or content-merges it in the
    /// worktree, and carries the merged ledger back into the workspace.
    pub fn pull_from_sync_branch(
        &self,
        branch: &str,
        accept_rebase: bool,
        confirmed: bool,
        require_confirmation: bool,
    ) -> CResult<PullReport> {
        let worktree = self.worktree_path(branch)?;
        if !worktree.exists() {
            return Err(Error::Value(format!(
                "no worktree for sync branch {}; run configure first",
                branch
            )));
        }
        let scoped = self.vcs.scoped(&worktree)?;
        scoped.fetch("origin", Some(branch))?;

        let local_ahead =
            scoped.rev_list_count(&format!("origin/{0}..{0}", branch)).unwrap_or(0);
        let remote_ahead =
            scoped.rev_list_count(&format!("{0}..origin/{0}", branch)).unwrap_or(0);

        let mut report = PullReport::default();
        if remote_ahead == 0 {
            report.up_to_date = true;
            return Ok(report);
        }
        if local_ahead > 0 && !accept_rebase {
            // The sync-branch protocol only appends; divergence means the
            // remote history was rewritten under us.
            let base = scoped.merge_base(branch, &format!("origin/{}", branch))?;
            return Err(Error::ForcedHistory(format!(
                "sync branch {} diverged from origin at {}",
                branch, base
            )));
        }
        report.fast_forward = local_ahead == 0;

        let wt_ledger = Self::worktree_ledger(&worktree);
        report.before_count = line_count(&wt_ledger)?;
        scoped.pull(Some(branch))?;
        report.after_count = line_count(&wt_ledger)?;

        if report.before_count > 0
            && (report.after_count as f64) < report.before_count as f64 * MASS_DELETION_RATIO
        {
            report.mass_deletion = true;
            log::warn!(
                "sync branch pull shrank the ledger from {} to {} lines",
                report.before_count,
                report.after_count
            );
            if require_confirmation && !confirmed {
                return Err(Error::Value(format!(
                    "mass deletion: ledger fell from {} to {} lines; re-run with --confirm to accept",
                    report.before_count, report.after_count
                )));
            }
        }

        // Carry the merged state back into the workspace, backed up so a
        // failed copy can be undone.
        let backup = self.backup_ledger()?;
        let carry = (|| -> CResult<()> {
            if wt_ledger.exists() {
                std::fs::copy(&wt_ledger, self.paths.ledger())?;
            }
            let wt_manifest = Self::worktree_manifest(&worktree);
            if wt_manifest.exists() {
                std::fs::copy(&wt_manifest, self.paths.manifest())?;
            }
            Ok(())
        })();
        if let Err(err) = carry {
            self.restore_ledger(backup)?;
            return Err(err);
        }

        Ok(report)
    }

    fn copy_into_worktree(&self, worktree: &Path) -> CResult<()> {
        std::fs::create_dir_all(worktree.join(BEADS_DIR))?;
        let ledger = self.paths.ledger();
        if ledger.exists() {
            std::fs::copy(&ledger, Self::worktree_ledger(worktree))?;
        }
        let manifest = self.paths.manifest();
        if manifest.exists() {
            std::fs::copy(&manifest, Self::worktree_manifest(worktree))?;
        }
        Ok(())
    }

    /// Destructive operations back the ledger up first.
    fn backup_ledger(&self) -> CResult<Option<PathBuf>> {
        let ledger = self.paths.ledger();
        if !ledger.exists() {
            return Ok(None);
        }
        let backup = ledger.with_extension("jsonl.backup");
        std::fs::copy(&ledger, &backup)?;
        Ok(Some(backup))
    }

    fn restore_ledger(&self, backup: Option<PathBuf>) -> CResult<()> {
        if let Some(backup) = backup {
            std::fs::copy(&backup, self.paths.ledger())?;
        }
        Ok(())
    }
}

fn line_count(path: &Path) -> CResult<usize> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text.lines().filter(|l| !l.trim().is_empty()).count()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::mock::MockTransport;

    fn workspace() -> (tempdir::TempDir, WorkspacePaths, IssueStore) {
        let dir = tempdir::TempDir::new("beads").unwrap();
        let paths = WorkspacePaths::at(dir.path().to_path_buf());
        std::fs::create_dir_all(paths.beads_dir()).unwrap();
        let store = IssueStore::open(paths.db()).unwrap();
        (dir, paths, store)
    }

    fn mock_with_common_dir(dir: &Path) -> MockTransport {
        let common = dir.join(".git").to_string_lossy().into_owned();
        MockTransport::with_state(|state| {
            state.rev_parse_overrides.insert("--git-common-dir".to_string(), common);
        })
    }

    #[test]
    fn branch_names_follow_vcs_rules() {
        validate_branch_name("beads-sync").unwrap();
        validate_branch_name("feature/beads").unwrap();
        for bad in [
            "", "-lead", ".hidden", "end/", "end.", "a..b", "a//b", "a b", "a:b", "a@{b",
            "star*", "q?q", "tree.lock",
        ] {
            assert!(validate_branch_name(bad).is_err(), "{:?} should be invalid", bad);
        }
    }

    #[test]
    fn configure_creates_orphan_and_seeds_worktree() -> CResult<()> {
        let (dir, paths, mut store) = workspace();
        std::fs::write(paths.ledger(), "{\"id\":\"bd-1\"}\n")?;

        let mock = mock_with_common_dir(dir.path());
        let controller = WorktreeController::new(&mock, &paths);
        let report = controller.configure(&mut store, "beads-sync", false, false)?;

        assert!(report.created_orphan);
        assert!(!report.local_only);
        assert!(mock.has_branch("beads-sync"));
        assert!(report.worktree.ends_with("beads-worktrees/beads-sync"));
        // The ledger was copied into the worktree and committed.
        assert!(WorktreeController::worktree_ledger(&report.worktree).exists());
        assert!(mock.calls().iter().any(|c| c.starts_with("commit")));
        // And the branch was recorded in metadata.
        assert_eq!(store.get_metadata(KEY_SYNC_BRANCH)?, Some("beads-sync".to_string()));
        Ok(())
    }

    #[test]
    fn configure_without_remote_warns_local_only() -> CResult<()> {
        let (dir, paths, mut store) = workspace();
        let mock = mock_with_common_dir(dir.path());
        mock.mutate(|state| {
            state.remotes.clear();
        });
        let controller = WorktreeController::new(&mock, &paths);
        let report = controller.configure(&mut store, "beads-sync", false, false)?;
        assert!(report.local_only);
        assert!(report.created_orphan);
        Ok(())
    }

    #[test]
    fn orphan_recreate_needs_force_when_unpushed() -> CResult<()> {
        let (dir, paths, mut store) = workspace();
        std::fs::write(paths.ledger(), "{\"id\":\"bd-1\"}\n")?;
        let mock = mock_with_common_dir(dir.path());
        mock.mutate(|state| {
            state.branches.insert("beads-sync".to_string());
            state.remote_branches.insert("beads-sync".to_string());
            state.rev_counts.insert("origin/beads-sync..beads-sync".to_string(), 2);
        });
        let controller = WorktreeController::new(&mock, &paths);

        let err = controller.configure(&mut store, "beads-sync", true, false).unwrap_err();
        assert!(matches!(err, Error::Value(_)));

        let report = controller.configure(&mut store, "beads-sync", true, true)?;
        assert!(report.recreated);
        let calls = mock.calls();
        assert!(calls.iter().any(|c| c.starts_with("branch_delete beads-sync")));
        assert!(calls.iter().any(|c| c.starts_with("branch_create_orphan")));
        Ok(())
    }

    #[test]
    fn commit_stages_only_ledger_and_manifest() -> CResult<()> {
        let (dir, paths, mut store) = workspace();
        std::fs::write(paths.ledger(), "{\"id\":\"bd-1\"}\n")?;
        let mock = mock_with_common_dir(dir.path());
        let controller = WorktreeController::new(&mock, &paths);
        controller.configure(&mut store, "beads-sync", false, false)?;

        mock.mutate(|state| {
            state.status_output = "M .beads/issues.jsonl".to_string();
            state.calls.clear();
        });
        let committed = controller.commit_to_sync_branch("beads-sync", None, true, true)?;
        assert!(committed);

        let calls = mock.calls();
        let commit = calls.iter().find(|c| c.starts_with("commit")).unwrap();
        assert!(commit.contains(LEDGER_FILE));
        assert!(commit.contains(MANIFEST_FILE));
        assert!(!commit.contains(super::super::sync::DB_FILE));
        assert!(calls.iter().any(|c| c.contains("upstream=true")));
        Ok(())
    }

    #[test]
    fn clean_worktree_skips_the_commit() -> CResult<()> {
        let (dir, paths, mut store) = workspace();
        let mock = mock_with_common_dir(dir.path());
        let controller = WorktreeController::new(&mock, &paths);
        controller.configure(&mut store, "beads-sync", false, false)?;

        mock.mutate(|state| state.status_output.clear());
        assert!(!controller.commit_to_sync_branch("beads-sync", None, true, false)?);
        Ok(())
    }

    #[test]
    fn divergence_is_forced_history_unless_accepted() -> CResult<()> {
        let (dir, paths, mut store) = workspace();
        let mock = mock_with_common_dir(dir.path());
        let controller = WorktreeController::new(&mock, &paths);
        controller.configure(&mut store, "beads-sync", false, false)?;
        mock.mutate(|state| {
            state.rev_counts.insert("origin/beads-sync..beads-sync".to_string(), 1);
            state.rev_counts.insert("beads-sync..origin/beads-sync".to_string(), 3);
        });

        match controller.pull_from_sync_branch("beads-sync", false, false, false) {
            Err(Error::ForcedHistory(msg)) => assert!(msg.contains("beads-sync")),
            other => panic!("expected ForcedHistory, got {:?}", other),
        }

        // --accept-rebase proceeds with a content merge.
        let report = controller.pull_from_sync_branch("beads-sync", true, false, false)?;
        assert!(!report.fast_forward);
        Ok(())
    }

    #[test]
    fn pull_carries_merged_ledger_back_to_workspace() -> CResult<()> {
        let (dir, paths, mut store) = workspace();
        std::fs::write(paths.ledger(), "{\"id\":\"bd-1\"}\n")?;
        let mock = mock_with_common_dir(dir.path());
        let controller = WorktreeController::new(&mock, &paths);
        controller.configure(&mut store, "beads-sync", false, false)?;

        let worktree = controller.worktree_path("beads-sync")?;
        let merged = "{\"id\":\"bd-1\"}\n{\"id\":\"bd-2\"}\n".to_string();
        mock.mutate(|state| {
            state.rev_counts.insert("beads-sync..origin/beads-sync".to_string(), 1);
            state.on_pull = Some((WorktreeController::worktree_ledger(&worktree), merged.clone()));
        });

        let report = controller.pull_from_sync_branch("beads-sync", false, false, false)?;
        assert!(report.fast_forward);
        assert_eq!(report.after_count, 2);
        assert_eq!(std::fs::read_to_string(paths.ledger())?, merged);
        Ok(())
    }

    #[test]
    fn mass_deletion_requires_confirmation() -> CResult<()> {
        let (dir, paths, mut store) = workspace();
        let ten: String = (0..10).map(|n| format!("{{\"id\":\"bd-{}\"}}\n", n)).collect();
        std::fs::write(paths.ledger(), &ten)?;
        let mock = mock_with_common_dir(dir.path());
        let controller = WorktreeController::new(&mock, &paths);
        controller.configure(&mut store, "beads-sync", false, false)?;

        let worktree = controller.worktree_path("beads-sync")?;
        mock.mutate(|state| {
            state.rev_counts.insert("beads-sync..origin/beads-sync".to_string(), 1);
            state.on_pull = Some((
                WorktreeController::worktree_ledger(&worktree),
                "{\"id\":\"bd-0\"}\n".to_string(),
            ));
        });

        let err = controller
            .pull_from_sync_branch("beads-sync", false, false, true)
            .unwrap_err();
        assert!(matches!(err, Error::Value(_)));

        // The refused pull already rewrote the worktree copy; re-seed it so
        // the confirmed retry sees the same shrink.
        std::fs::write(WorktreeController::worktree_ledger(&worktree), &ten)?;
        let report = controller.pull_from_sync_branch("beads-sync", false, true, true)?;
        assert!(report.mass_deletion);
        assert_eq!(report.after_count, 1);
        Ok(())
    }
}
