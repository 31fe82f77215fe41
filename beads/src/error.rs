use std::fmt::{Display, Formatter};

/// Crate-wide result type.
pub type CResult<T> = Result<T, Error>;

/// All errors surfaced by the sync core. The library never terminates the
/// process; the CLI shell maps these to exit codes and prints the
/// remediation hint where one exists.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// No `.beads` directory discoverable from the working directory upward.
    NotAWorkspace(String),

    /// The ledger lock could not be acquired within the timeout.
    LockTimeout(String),

    /// The local store is clearly older than the ledger; an import is
    /// required before the store may be exported.
    StaleDatabase(String),

    /// The ledger on disk is older than the store state and non-empty;
    /// refusing to overwrite it without an explicit re-import.
    StaleLedger(String),

    /// A post-import issue count decrease exceeded the sum of sanitized and
    /// manifest-recorded deletions.
    DataLoss {
        before: usize,
        after: usize,
        accounted: usize,
        detail: String,
    },

    /// The ledger hash differs from the stored hash unexpectedly.
    ContentHashMismatch(String),

    /// The VCS reports a merge or rebase in progress.
    UnmergedPaths(String),

    /// The remote sync branch diverged by a force-push.
    ForcedHistory(String),

    /// Duplicate issue ids; database-level corruption.
    DuplicateIds(Vec<String>),

    /// Malformed configuration value.
    InvalidConfig(String),

    /// Non-zero exit or I/O failure from the VCS adapter.
    Transport(String),

    /// Input could not be parsed.
    Parse(String),

    /// An invalid or unexpected value.
    Value(String),

    /// An unexpected internal error.
    Internal(String),
}

impl Error {
    /// Stable name of the error kind, for logs and CLI summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotAWorkspace(_) => "NotAWorkspace",
            Error::LockTimeout(_) => "LockTimeout",
            Error::StaleDatabase(_) => "StaleDatabase",
            Error::StaleLedger(_) => "StaleLedger",
            Error::DataLoss { .. } => "DataLoss",
            Error::ContentHashMismatch(_) => "ContentHashMismatch",
            Error::UnmergedPaths(_) => "UnmergedPaths",
            Error::ForcedHistory(_) => "ForcedHistory",
            Error::DuplicateIds(_) => "DuplicateIds",
            Error::InvalidConfig(_) => "InvalidConfig",
            Error::Transport(_) => "TransportError",
            Error::Parse(_) => "Parse",
            Error::Value(_) => "Value",
            Error::Internal(_) => "Internal",
        }
    }

    /// The suggested next command for the user, if there is one.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            Error::NotAWorkspace(_) => Some("run `beadscli init` to create a workspace"),
            Error::LockTimeout(_) => {
                Some("another process holds the ledger lock; retry, or raise lock-timeout")
            }
            Error::StaleDatabase(_) => Some("run `beadscli sync --import-only` first"),
            Error::StaleLedger(_) => Some("run `beadscli sync --import-only` to re-import the ledger"),
            Error::DataLoss { .. } => {
                Some("inspect the deletion manifest and the left snapshot before retrying")
            }
            Error::ContentHashMismatch(_) => Some("run `beadscli sync --import-only`"),
            Error::UnmergedPaths(_) => Some("finish or abort the in-progress merge, then retry"),
            Error::ForcedHistory(_) => Some("re-run with --accept-rebase to adopt the rewritten history"),
            Error::DuplicateIds(_) => Some("run `beadscli doctor` against the database"),
            _ => None,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotAWorkspace(msg) => write!(f, "not a beads workspace: {}", msg),
            Error::LockTimeout(msg) => write!(f, "ledger lock timeout: {}", msg),
            Error::StaleDatabase(msg) => write!(f, "stale database: {}", msg),
            Error::StaleLedger(msg) => write!(f, "stale ledger: {}", msg),
            Error::DataLoss { before, after, accounted, detail } => write!(
                f,
                "refusing import: issue count fell from {} to {} with only {} deletions accounted for ({})",
                before, after, accounted, detail
            ),
            Error::ContentHashMismatch(msg) => write!(f, "ledger content hash mismatch: {}", msg),
            Error::UnmergedPaths(msg) => write!(f, "unmerged paths: {}", msg),
            Error::ForcedHistory(msg) => write!(f, "forced history: {}", msg),
            Error::DuplicateIds(ids) => write!(f, "duplicate issue ids: {}", ids.join(", ")),
            Error::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            Error::Transport(msg) => write!(f, "vcs transport: {}", msg),
            Error::Parse(msg) => write!(f, "parse error: {}", msg),
            Error::Value(msg) => write!(f, "{}", msg),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_counts() {
        let err = Error::DataLoss {
            before: 10,
            after: 6,
            accounted: 1,
            detail: "sanitized=0 manifest=1".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("10"));
        assert!(text.contains("6"));
        assert!(err.remediation().is_some());
    }

    #[test]
    fn io_errors_become_internal() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        match Error::from(io) {
            Error::Internal(msg) => assert!(msg.contains("boom")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
