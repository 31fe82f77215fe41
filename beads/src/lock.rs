//! The inter-process ledger lock. Every operation that opens, reads, writes,
//! renames, or commits the ledger must run inside a lock scope; the lock file
//! is the sole coordination primitive between the CLI, the flush daemon, and
//! any peer process in the same workspace.
//!
//! Backed by OS file locks (via fs4), so a crashed holder releases
//! automatically.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{CResult, Error};

/// Poll interval while waiting for a contended lock.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default acquisition timeout. The config layer maps negative user values
/// back to this.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// Many readers; blocks writers. For read-only imports.
    Shared,
    /// Blocks all others. Required for export, flush, and any rewrite.
    Exclusive,
}

/// A held ledger lock. Released on drop; `release` is idempotent.
pub struct LedgerLock {
    file: std::fs::File,
    path: PathBuf,
    mode: LockMode,
    held: bool,
}

impl LedgerLock {
    /// The lock file guarding a given ledger path.
    pub fn lock_path_for(ledger: &Path) -> PathBuf {
        let mut name = ledger
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "ledger".to_string());
        name.push_str(".lock");
        ledger.with_file_name(name)
    }

    /// Acquires the lock, polling every 50 ms until the timeout. A zero
    /// timeout means exactly one attempt.
    pub fn acquire(lock_path: &Path, mode: LockMode, timeout: Duration) -> CResult<Self> {
        if let Some(dir) = lock_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(lock_path)?;

        let start = Instant::now();
        loop {
            let attempt = match mode {
                LockMode::Shared => fs4::FileExt::try_lock_shared(&file),
                LockMode::Exclusive => fs4::FileExt::try_lock_exclusive(&file),
            };
            match attempt {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: lock_path.to_path_buf(),
                        mode,
                        held: true,
                    })
                }
                Err(_) if timeout.is_zero() || start.elapsed() >= timeout => {
                    return Err(Error::LockTimeout(format!(
                        "{:?} lock on {} not acquired within {:?}",
                        mode,
                        lock_path.display(),
                        timeout
                    )));
                }
                Err(_) => std::thread::sleep(POLL_INTERVAL),
            }
        }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases the lock. Safe to call more than once.
    pub fn release(&mut self) {
        if self.held {
            if let Err(err) = self.file.unlock() {
                log::warn!("failed to unlock {}: {}", self.path.display(), err);
            }
            self.held = false;
        }
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        self.release();
    }
}
