//! The git adapter: shells out to the `git` binary and maps non-zero exits to
//! typed transport errors.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::{CResult, Error};
use crate::vcs::VcsTransport;

pub struct GitTransport {
    workdir: PathBuf,
}

impl GitTransport {
    pub fn new(workdir: PathBuf) -> Self {
        Self { workdir }
    }

    /// Runs one git command, returning trimmed stdout.
    fn run(&self, args: &[&str]) -> CResult<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .map_err(|err| Error::Transport(format!("failed to spawn git: {}", err)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Transport(format!(
                "git {} exited with {}: {}",
                args.join(" "),
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }

    fn run_with_stdin(&self, args: &[&str], stdin: &[u8]) -> CResult<String> {
        let mut child = Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| Error::Transport(format!("failed to spawn git: {}", err)))?;
        child
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Transport("git stdin unavailable".to_string()))?
            .write_all(stdin)?;
        let output = child
            .wait_with_output()
            .map_err(|err| Error::Transport(format!("git {}: {}", args.join(" "), err)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Transport(format!(
                "git {} exited with {}: {}",
                args.join(" "),
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }
}

impl VcsTransport for GitTransport {
    fn pull(&self, branch: Option<&str>) -> CResult<()> {
        match branch {
            Some(branch) => self.run(&["pull", "origin", branch]).map(|_| ()),
            None => self.run(&["pull"]).map(|_| ()),
        }
    }

    fn push(&self, branch: Option<&str>, set_upstream: bool) -> CResult<()> {
        let mut args = vec!["push"];
        if set_upstream {
            args.push("--set-upstream");
        }
        if let Some(branch) = branch {
            args.push("origin");
            args.push(branch);
        }
        self.run(&args).map(|_| ())
    }

    fn commit(&self, paths: &[&Path], message: &str) -> CResult<()> {
        let mut add = vec!["add".to_string(), "--".to_string()];
        add.extend(paths.iter().map(|p| p.to_string_lossy().into_owned()));
        let add_args: Vec<&str> = add.iter().map(|s| s.as_str()).collect();
        self.run(&add_args)?;

        self.run(&["commit", "-m", message]).map(|_| ())
    }

    fn has_unmerged(&self) -> CResult<bool> {
        Ok(!self.run(&["ls-files", "--unmerged"])?.is_empty())
    }

    fn current_branch(&self) -> CResult<String> {
        self.run(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    fn default_branch(&self, remote: &str) -> CResult<String> {
        let reference = format!("refs/remotes/{}/HEAD", remote);
        let full = self.run(&["symbolic-ref", &reference])?;
        let prefix = format!("refs/remotes/{}/", remote);
        Ok(full.strip_prefix(&prefix).unwrap_or(&full).to_string())
    }

    fn has_remote(&self, name: &str) -> CResult<bool> {
        Ok(self.run(&["remote"])?.lines().any(|line| line.trim() == name))
    }

    fn worktree_create(&self, branch: &str, path: &Path) -> CResult<()> {
        let path = path.to_string_lossy().into_owned();
        self.run(&["worktree", "add", path.as_str(), branch]).map(|_| ())
    }

    fn worktree_remove(&self, path: &Path, force: bool) -> CResult<()> {
        let path = path.to_string_lossy().into_owned();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(path.as_str());
        self.run(&args).map(|_| ())
    }

    fn branch_create_orphan(&self, name: &str) -> CResult<()> {
        // An empty tree, an initial commit on it, and a branch ref; HEAD and
        // the working checkout stay untouched.
        let tree = self.run_with_stdin(&["mktree"], b"")?;
        let commit = self.commit_tree(&tree, "beads: initialize sync branch", &[])?;
        let reference = format!("refs/heads/{}", name);
        self.run(&["update-ref", &reference, &commit]).map(|_| ())
    }

    fn branch_delete(&self, name: &str, force: bool) -> CResult<()> {
        let flag = if force { "-D" } else { "-d" };
        self.run(&["branch", flag, name]).map(|_| ())
    }

    fn commit_tree(&self, tree: &str, message: &str, parents: &[&str]) -> CResult<String> {
        let mut args = vec!["commit-tree".to_string(), tree.to_string()];
        for parent in parents {
            args.push("-p".to_string());
            args.push((*parent).to_string());
        }
        args.push("-m".to_string());
        args.push(message.to_string());
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        self.run(&arg_refs)
    }

    fn hash_object(&self, kind: &str, content: &[u8]) -> CResult<String> {
        self.run_with_stdin(&["hash-object", "-t", kind, "-w", "--stdin"], content)
    }

    fn status_porcelain(&self, path: Option<&Path>) -> CResult<String> {
        match path {
            Some(path) => {
                let path = path.to_string_lossy().into_owned();
                self.run(&["status", "--porcelain", "--", path.as_str()])
            }
            None => self.run(&["status", "--porcelain"]),
        }
    }

    fn show(&self, spec: &str) -> CResult<String> {
        self.run(&["show", spec])
    }

    fn symbolic_ref(&self, name: &str) -> CResult<String> {
        self.run(&["symbolic-ref", name])
    }

    fn rev_parse(&self, rev: &str) -> CResult<String> {
        self.run(&["rev-parse", rev])
    }

    fn merge_base(&self, a: &str, b: &str) -> CResult<String> {
        self.run(&["merge-base", a, b])
    }

    fn rev_list_count(&self, range: &str) -> CResult<usize> {
        let out = self.run(&["rev-list", "--count", range])?;
        out.trim().parse().map_err(|_| {
            Error::Transport(format!("rev-list --count {} returned '{}'", range, out))
        })
    }

    fn diff(&self, range: &str, pathspec: Option<&str>) -> CResult<String> {
        match pathspec {
            Some(spec) => self.run(&["diff", range, "--", spec]),
            None => self.run(&["diff", range]),
        }
    }

    fn fetch(&self, remote: &str, branch: Option<&str>) -> CResult<()> {
        match branch {
            Some(branch) => self.run(&["fetch", remote, branch]).map(|_| ()),
            None => self.run(&["fetch", remote]).map(|_| ()),
        }
    }

    fn scoped(&self, dir: &Path) -> CResult<Box<dyn VcsTransport>> {
        Ok(Box::new(GitTransport::new(dir.to_path_buf())))
    }
}
