//! The staleness oracle: decides whether the ledger and the store agree.
//!
//! The decision is purely content-based. VCS operations restore files with
//! fresh mtimes but unchanged content, and checkouts can do the reverse, so
//! mtime is never consulted; the oracle compares the SHA-256 of the ledger
//! bytes against the hash recorded in store metadata at the last
//! reconciliation.

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::codec::jsonl::LedgerCodec;
use crate::error::{CResult, Error};
use crate::storage::store::IssueStore;

/// Metadata key holding the ledger hash as of the last reconciliation.
pub const HASH_META_KEY: &str = "jsonl_content_hash";

/// Separator for multi-repo hash keys. Must not appear inside a repo key.
const REPO_KEY_SEPARATOR: char = ':';

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// SHA-256 over the file bytes, or None if the file does not exist.
pub fn hash_file(path: &Path) -> CResult<Option<String>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(hash_bytes(&bytes))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// The costlier tie-break path: canonical serialization of all issues
/// (tombstones included, dependencies/labels/comments populated on the rows)
/// hashed the same way the ledger bytes would be.
pub fn store_content_hash(store: &mut IssueStore) -> CResult<String> {
    let issues = store.get_all_issues(true)?;
    let text = LedgerCodec::new().emit(&issues)?;
    Ok(hash_bytes(text.as_bytes()))
}

/// The metadata key for a given repo, `jsonl_content_hash` or
/// `jsonl_content_hash:<repo_key>` when several repos share one store.
pub fn hash_meta_key(repo_key: Option<&str>) -> CResult<String> {
    match repo_key {
        None => Ok(HASH_META_KEY.to_string()),
        Some(key) => {
            if key.contains(REPO_KEY_SEPARATOR) {
                return Err(Error::InvalidConfig(format!(
                    "repo key '{}' must not contain '{}'",
                    key, REPO_KEY_SEPARATOR
                )));
            }
            Ok(format!("{}{}{}", HASH_META_KEY, REPO_KEY_SEPARATOR, key))
        }
    }
}

/// True iff the ledger's content hash differs from the recorded hash.
pub fn ledger_differs(
    store: &mut IssueStore,
    ledger: &Path,
    repo_key: Option<&str>,
) -> CResult<bool> {
    let key = hash_meta_key(repo_key)?;
    let recorded = store.get_metadata(&key)?;
    let current = hash_file(ledger)?;
    Ok(current != recorded)
}

/// Records the reconciled ledger hash.
pub fn record_ledger_hash(
    store: &mut IssueStore,
    hash: &str,
    repo_key: Option<&str>,
) -> CResult<()> {
    let key = hash_meta_key(repo_key)?;
    store.set_metadata(&key, hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Issue;
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;

    fn setup() -> (tempdir::TempDir, IssueStore, PathBuf) {
        let dir = tempdir::TempDir::new("beads").unwrap();
        let store = IssueStore::open(dir.path().join("beads.db")).unwrap();
        let ledger = dir.path().join("issues.jsonl");
        (dir, store, ledger)
    }

    #[test]
    fn differs_tracks_content_not_rewrites() -> CResult<()> {
        let (_dir, mut store, ledger) = setup();
        std::fs::write(&ledger, b"{\"id\":\"bd-1\"}\n")?;

        // Nothing recorded yet: the ledger differs.
        assert!(ledger_differs(&mut store, &ledger, None)?);

        let hash = hash_file(&ledger)?.unwrap();
        record_ledger_hash(&mut store, &hash, None)?;
        assert!(!ledger_differs(&mut store, &ledger, None)?);

        // Rewriting identical bytes (fresh mtime) is not a difference.
        std::fs::write(&ledger, b"{\"id\":\"bd-1\"}\n")?;
        assert!(!ledger_differs(&mut store, &ledger, None)?);

        // Changed bytes are.
        std::fs::write(&ledger, b"{\"id\":\"bd-2\"}\n")?;
        assert!(ledger_differs(&mut store, &ledger, None)?);
        Ok(())
    }

    #[test]
    fn missing_ledger_matches_missing_record() -> CResult<()> {
        let (_dir, mut store, ledger) = setup();
        assert!(!ledger_differs(&mut store, &ledger, None)?);
        Ok(())
    }

    #[test]
    fn store_hash_equals_emitted_ledger_hash() -> CResult<()> {
        let (_dir, mut store, _ledger) = setup();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        store.create(Issue::new("bd-1", "alpha", now), "alice", now)?;
        store.create(Issue::new("bd-2", "beta", now), "alice", now)?;

        let issues = store.get_all_issues(true)?;
        let text = LedgerCodec::new().emit(&issues)?;
        assert_eq!(store_content_hash(&mut store)?, hash_bytes(text.as_bytes()));
        Ok(())
    }

    #[test]
    fn repo_keys_namespace_the_hash() -> CResult<()> {
        let (_dir, mut store, ledger) = setup();
        std::fs::write(&ledger, b"content\n")?;
        let hash = hash_file(&ledger)?.unwrap();

        record_ledger_hash(&mut store, &hash, Some("backend"))?;
        assert!(!ledger_differs(&mut store, &ledger, Some("backend"))?);
        // A different repo key has no recorded hash, so it differs.
        assert!(ledger_differs(&mut store, &ledger, Some("frontend"))?);
        Ok(())
    }

    #[test]
    fn separator_in_repo_key_is_invalid_config() {
        assert!(matches!(hash_meta_key(Some("a:b")), Err(Error::InvalidConfig(_))));
        // Spaces are tolerated.
        assert_eq!(hash_meta_key(Some("a b")).unwrap(), "jsonl_content_hash:a b");
    }
}
