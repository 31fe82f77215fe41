//! An in-memory transport double for worktree and sync-engine tests. Records
//! every call and serves canned state; `scoped` clones share the same state.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{CResult, Error};
use crate::vcs::VcsTransport;

#[derive(Default)]
pub struct MockState {
    pub calls: Vec<String>,
    pub branches: BTreeSet<String>,
    pub remote_branches: BTreeSet<String>,
    pub remotes: BTreeSet<String>,
    pub current_branch: String,
    pub default_branch: String,
    pub unmerged: bool,
    pub status_output: String,
    pub worktrees: BTreeMap<PathBuf, String>,
    pub show_outputs: BTreeMap<String, String>,
    pub rev_counts: BTreeMap<String, usize>,
    pub rev_parse_overrides: BTreeMap<String, String>,
    /// Content written to a path when `pull` runs, simulating a VCS merge
    /// rewriting the ledger out-of-band.
    pub on_pull: Option<(PathBuf, String)>,
    pub object_counter: usize,
}

#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        let mut state = MockState::default();
        state.current_branch = "main".to_string();
        state.default_branch = "main".to_string();
        state.remotes.insert("origin".to_string());
        Self { state: Arc::new(Mutex::new(state)) }
    }

    pub fn with_state(f: impl FnOnce(&mut MockState)) -> Self {
        let mock = Self::new();
        f(&mut mock.state.lock().unwrap());
        mock
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn mutate(&self, f: impl FnOnce(&mut MockState)) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn has_branch(&self, name: &str) -> bool {
        self.state.lock().unwrap().branches.contains(name)
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }
}

impl VcsTransport for MockTransport {
    fn pull(&self, branch: Option<&str>) -> CResult<()> {
        self.record(format!("pull {:?}", branch));
        let effect = self.state.lock().unwrap().on_pull.clone();
        if let Some((path, content)) = effect {
            std::fs::write(path, content)?;
        }
        Ok(())
    }

    fn push(&self, branch: Option<&str>, set_upstream: bool) -> CResult<()> {
        self.record(format!("push {:?} upstream={}", branch, set_upstream));
        Ok(())
    }

    fn commit(&self, paths: &[&Path], message: &str) -> CResult<()> {
        let names: Vec<String> =
            paths.iter().map(|p| p.to_string_lossy().into_owned()).collect();
        self.record(format!("commit [{}] {}", names.join(","), message));
        Ok(())
    }

    fn has_unmerged(&self) -> CResult<bool> {
        Ok(self.state.lock().unwrap().unmerged)
    }

    fn current_branch(&self) -> CResult<String> {
        Ok(self.state.lock().unwrap().current_branch.clone())
    }

    fn default_branch(&self, _remote: &str) -> CResult<String> {
        Ok(self.state.lock().unwrap().default_branch.clone())
    }

    fn has_remote(&self, name: &str) -> CResult<bool> {
        Ok(self.state.lock().unwrap().remotes.contains(name))
    }

    fn worktree_create(&self, branch: &str, path: &Path) -> CResult<()> {
        self.record(format!("worktree_create {} {}", branch, path.display()));
        let mut state = self.state.lock().unwrap();
        if state.worktrees.contains_key(path) {
            return Err(Error::Transport(format!("worktree {} already exists", path.display())));
        }
        state.worktrees.insert(path.to_path_buf(), branch.to_string());
        // `git worktree add` creates a local (tracking) branch when needed.
        state.branches.insert(branch.to_string());
        drop(state);
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    fn worktree_remove(&self, path: &Path, force: bool) -> CResult<()> {
        self.record(format!("worktree_remove {} force={}", path.display(), force));
        self.state.lock().unwrap().worktrees.remove(path);
        Ok(())
    }

    fn branch_create_orphan(&self, name: &str) -> CResult<()> {
        self.record(format!("branch_create_orphan {}", name));
        self.state.lock().unwrap().branches.insert(name.to_string());
        Ok(())
    }

    fn branch_delete(&self, name: &str, force: bool) -> CResult<()> {
        self.record(format!("branch_delete {} force={}", name, force));
        if !self.state.lock().unwrap().branches.remove(name) {
            return Err(Error::Transport(format!("no such branch {}", name)));
        }
        Ok(())
    }

    fn commit_tree(&self, tree: &str, _message: &str, parents: &[&str]) -> CResult<String> {
        self.record(format!("commit_tree {} parents={}", tree, parents.len()));
        let mut state = self.state.lock().unwrap();
        state.object_counter += 1;
        Ok(format!("commit-{}", state.object_counter))
    }

    fn hash_object(&self, kind: &str, _content: &[u8]) -> CResult<String> {
        self.record(format!("hash_object {}", kind));
        let mut state = self.state.lock().unwrap();
        state.object_counter += 1;
        Ok(format!("object-{}", state.object_counter))
    }

    fn status_porcelain(&self, _path: Option<&Path>) -> CResult<String> {
        Ok(self.state.lock().unwrap().status_output.clone())
    }

    fn show(&self, spec: &str) -> CResult<String> {
        self.state
            .lock()
            .unwrap()
            .show_outputs
            .get(spec)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("unknown object {}", spec)))
    }

    fn symbolic_ref(&self, _name: &str) -> CResult<String> {
        let state = self.state.lock().unwrap();
        Ok(format!("refs/remotes/origin/{}", state.default_branch))
    }

    fn rev_parse(&self, rev: &str) -> CResult<String> {
        let state = self.state.lock().unwrap();
        if let Some(out) = state.rev_parse_overrides.get(rev) {
            return Ok(out.clone());
        }
        if let Some(name) = rev.strip_prefix("refs/heads/") {
            return if state.branches.contains(name) {
                Ok(format!("sha-of-{}", rev))
            } else {
                Err(Error::Transport(format!("unknown ref {}", rev)))
            };
        }
        if let Some(name) =
            rev.strip_prefix("refs/remotes/origin/").or_else(|| rev.strip_prefix("origin/"))
        {
            return if state.remote_branches.contains(name) {
                Ok(format!("sha-of-{}", rev))
            } else {
                Err(Error::Transport(format!("unknown ref {}", rev)))
            };
        }
        Ok(format!("sha-of-{}", rev))
    }

    fn merge_base(&self, a: &str, _b: &str) -> CResult<String> {
        Ok(format!("base-of-{}", a))
    }

    fn rev_list_count(&self, range: &str) -> CResult<usize> {
        Ok(self.state.lock().unwrap().rev_counts.get(range).copied().unwrap_or(0))
    }

    fn diff(&self, _range: &str, _pathspec: Option<&str>) -> CResult<String> {
        Ok(String::new())
    }

    fn fetch(&self, remote: &str, branch: Option<&str>) -> CResult<()> {
        self.record(format!("fetch {} {:?}", remote, branch));
        Ok(())
    }

    fn scoped(&self, dir: &Path) -> CResult<Box<dyn VcsTransport>> {
        self.record(format!("scoped {}", dir.display()));
        Ok(Box::new(self.clone()))
    }
}
