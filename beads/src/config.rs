//! Typed configuration for the sync core.
//!
//! Options live in store metadata under the stable key names of the ledger
//! format; selected keys may be overridden through `BEADS_*` environment
//! variables. Every value passes a validator on the way in and on load, so
//! the engine never sees a malformed setting.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CResult, Error};
use crate::flush::DEFAULT_DEBOUNCE;
use crate::lock::DEFAULT_LOCK_TIMEOUT;
use crate::manifest::{DEFAULT_AUTO_COMPACT_THRESHOLD, DEFAULT_RETENTION_DAYS};
use crate::storage::store::IssueStore;
use crate::worktree::validate_branch_name;

pub const KEY_SYNC_MODE: &str = "sync.mode";
pub const KEY_SYNC_REMOTE: &str = "sync.remote";
pub const KEY_SYNC_BRANCH: &str = "sync.branch";
pub const KEY_CONFLICT_STRATEGY: &str = "conflict.strategy";
pub const KEY_FLUSH_DEBOUNCE: &str = "flush-debounce";
pub const KEY_LOCK_TIMEOUT: &str = "lock-timeout";
pub const KEY_AUTO_COMPACT: &str = "deletions.auto_compact";
pub const KEY_AUTO_COMPACT_THRESHOLD: &str = "deletions.auto_compact_threshold";
pub const KEY_RETENTION_DAYS: &str = "deletions.retention_days";
pub const KEY_CONFIRM_MASS_DELETE: &str = "sync.require_confirmation_on_mass_delete";

const ALL_KEYS: &[&str] = &[
    KEY_SYNC_MODE,
    KEY_SYNC_REMOTE,
    KEY_SYNC_BRANCH,
    KEY_CONFLICT_STRATEGY,
    KEY_FLUSH_DEBOUNCE,
    KEY_LOCK_TIMEOUT,
    KEY_AUTO_COMPACT,
    KEY_AUTO_COMPACT_THRESHOLD,
    KEY_RETENTION_DAYS,
    KEY_CONFIRM_MASS_DELETE,
];

const REMOTE_SCHEMES: &[&str] =
    &["dolthub://", "gs://", "s3://", "file://", "https://", "http://", "ssh://"];

/// How ledger changes travel between clones.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncMode {
    /// Ledger lives in the working tree; the user drives the VCS.
    #[default]
    Local,
    /// Ledger commits are isolated on a dedicated branch via a worktree.
    GitBranch,
    /// An external transport owns replication; the core only exports/imports.
    External,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Local => "local",
            SyncMode::GitBranch => "git-branch",
            SyncMode::External => "external",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(SyncMode::Local),
            "git-branch" => Ok(SyncMode::GitBranch),
            "external" => Ok(SyncMode::External),
            other => Err(Error::InvalidConfig(format!("unknown sync.mode '{}'", other))),
        }
    }
}

/// How the three-way merge resolves a same-field divergence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConflictStrategy {
    /// Larger `updated_at` wins; ties broken by the larger content hash.
    #[default]
    Newest,
    Ours,
    Theirs,
    /// Preserve local and emit a conflict record pending a decision.
    Manual,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::Newest => "newest",
            ConflictStrategy::Ours => "ours",
            ConflictStrategy::Theirs => "theirs",
            ConflictStrategy::Manual => "manual",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "newest" => Ok(ConflictStrategy::Newest),
            "ours" => Ok(ConflictStrategy::Ours),
            "theirs" => Ok(ConflictStrategy::Theirs),
            "manual" => Ok(ConflictStrategy::Manual),
            other => Err(Error::InvalidConfig(format!("unknown conflict.strategy '{}'", other))),
        }
    }
}

/// The enumerated configuration surface recognized by the core.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncConfig {
    pub mode: SyncMode,
    pub remote: Option<String>,
    pub branch: Option<String>,
    pub strategy: ConflictStrategy,
    pub flush_debounce: Duration,
    pub lock_timeout: Duration,
    pub auto_compact: bool,
    pub auto_compact_threshold: usize,
    pub retention_days: i64,
    pub require_confirmation_on_mass_delete: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::default(),
            remote: None,
            branch: None,
            strategy: ConflictStrategy::default(),
            flush_debounce: DEFAULT_DEBOUNCE,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            auto_compact: false,
            auto_compact_threshold: DEFAULT_AUTO_COMPACT_THRESHOLD,
            retention_days: DEFAULT_RETENTION_DAYS,
            require_confirmation_on_mass_delete: false,
        }
    }
}

impl SyncConfig {
    /// Loads the config from store metadata, applying environment overrides.
    pub fn load(store: &mut IssueStore) -> CResult<Self> {
        let mut config = Self::default();
        for key in ALL_KEYS {
            let value = match env_override(key) {
                Some(value) => Some(value),
                None => store.get_metadata(key)?,
            };
            if let Some(value) = value {
                config.apply(key, &value)?;
            }
        }
        Ok(config)
    }

    /// Validates and persists one key, then returns the refreshed view.
    pub fn set(store: &mut IssueStore, key: &str, value: &str) -> CResult<()> {
        if !ALL_KEYS.contains(&key) {
            return Err(Error::InvalidConfig(format!("unknown config key '{}'", key)));
        }
        // Parse into a throwaway record first so bad values never persist.
        let mut scratch = SyncConfig::default();
        scratch.apply(key, value)?;
        store.set_metadata(key, value)
    }

    pub fn known_keys() -> &'static [&'static str] {
        ALL_KEYS
    }

    fn apply(&mut self, key: &str, value: &str) -> CResult<()> {
        match key {
            KEY_SYNC_MODE => self.mode = value.parse()?,
            KEY_SYNC_REMOTE => {
                validate_remote_url(value)?;
                self.remote = Some(value.to_string());
            }
            KEY_SYNC_BRANCH => {
                validate_branch_name(value)?;
                self.branch = Some(value.to_string());
            }
            KEY_CONFLICT_STRATEGY => self.strategy = value.parse()?,
            KEY_FLUSH_DEBOUNCE => self.flush_debounce = parse_duration(value)?,
            KEY_LOCK_TIMEOUT => self.lock_timeout = parse_lock_timeout(value)?,
            KEY_AUTO_COMPACT => self.auto_compact = parse_bool(key, value)?,
            KEY_AUTO_COMPACT_THRESHOLD => {
                self.auto_compact_threshold = value
                    .parse()
                    .map_err(|_| Error::InvalidConfig(format!("{}: '{}'", key, value)))?;
            }
            KEY_RETENTION_DAYS => {
                let days: i64 = value
                    .parse()
                    .map_err(|_| Error::InvalidConfig(format!("{}: '{}'", key, value)))?;
                if days < 0 {
                    return Err(Error::InvalidConfig(format!(
                        "{} must not be negative: {}",
                        key, days
                    )));
                }
                self.retention_days = days;
            }
            KEY_CONFIRM_MASS_DELETE => {
                self.require_confirmation_on_mass_delete = parse_bool(key, value)?;
            }
            other => return Err(Error::InvalidConfig(format!("unknown config key '{}'", other))),
        }
        Ok(())
    }
}

/// `sync.mode` -> `BEADS_SYNC_MODE`, `flush-debounce` -> `BEADS_FLUSH_DEBOUNCE`.
fn env_var_for(key: &str) -> String {
    let mut name = String::from("BEADS_");
    for c in key.chars() {
        if c.is_ascii_alphanumeric() {
            name.push(c.to_ascii_uppercase());
        } else {
            name.push('_');
        }
    }
    name
}

fn env_override(key: &str) -> Option<String> {
    std::env::var(env_var_for(key)).ok()
}

fn parse_bool(key: &str, value: &str) -> CResult<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(Error::InvalidConfig(format!("{}: expected a boolean, got '{}'", key, other))),
    }
}

/// Parses `"200ms"`, `"5s"`, `"2m"`, `"1h"`, or a bare integer in seconds.
pub fn parse_duration(value: &str) -> CResult<Duration> {
    let value = value.trim();
    let (digits, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        None => (value, "s"),
        Some(at) => value.split_at(at),
    };
    if digits.is_empty() {
        return Err(Error::InvalidConfig(format!("invalid duration '{}'", value)));
    }
    let n: u64 = digits
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("invalid duration '{}'", value)))?;
    match unit.trim() {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3_600)),
        other => Err(Error::InvalidConfig(format!("invalid duration unit '{}'", other))),
    }
}

/// Like [`parse_duration`], with the lock-timeout contract: zero means one
/// attempt, a negative value collapses to the default.
pub fn parse_lock_timeout(value: &str) -> CResult<Duration> {
    let value = value.trim();
    if let Some(stripped) = value.strip_prefix('-') {
        // Sanity-check the remainder is a duration at all.
        parse_duration(stripped)?;
        return Ok(DEFAULT_LOCK_TIMEOUT);
    }
    parse_duration(value)
}

/// Remote URLs must use a recognized scheme, or look like `user@host:path`.
pub fn validate_remote_url(url: &str) -> CResult<()> {
    if REMOTE_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
        return Ok(());
    }
    // scp-like: user@host:path, with no scheme separator anywhere.
    if !url.contains("://") {
        if let Some((user_host, path)) = url.split_once(':') {
            if user_host.contains('@') && !path.is_empty() {
                return Ok(());
            }
        }
    }
    Err(Error::InvalidConfig(format!("unrecognized sync.remote '{}'", url)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn setup_store() -> (tempdir::TempDir, IssueStore) {
        let dir = tempdir::TempDir::new("beads").unwrap();
        let store = IssueStore::open(dir.path().join("beads.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn durations_parse_with_units() {
        assert_eq!(parse_duration("200ms").unwrap(), Duration::from_millis(200));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("5 parsecs").is_err());
    }

    #[test]
    fn lock_timeout_contract() {
        assert_eq!(parse_lock_timeout("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_lock_timeout("-1").unwrap(), DEFAULT_LOCK_TIMEOUT);
        assert_eq!(parse_lock_timeout("-5s").unwrap(), DEFAULT_LOCK_TIMEOUT);
        assert_eq!(parse_lock_timeout("10s").unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn remote_url_schemes() {
        for url in [
            "https://example.com/repo",
            "ssh://host/repo",
            "s3://bucket/key",
            "gs://bucket/key",
            "dolthub://org/db",
            "file:///var/beads",
            "git@github.com:org/repo.git",
        ] {
            validate_remote_url(url).unwrap();
        }
        assert!(matches!(validate_remote_url("ftp://x"), Err(Error::InvalidConfig(_))));
        assert!(matches!(validate_remote_url("just-a-name"), Err(Error::InvalidConfig(_))));
    }

    #[test]
    #[serial]
    fn load_reads_metadata_and_applies_defaults() -> CResult<()> {
        let (_dir, mut store) = setup_store();
        SyncConfig::set(&mut store, KEY_SYNC_MODE, "git-branch")?;
        SyncConfig::set(&mut store, KEY_CONFLICT_STRATEGY, "theirs")?;
        SyncConfig::set(&mut store, KEY_FLUSH_DEBOUNCE, "2s")?;

        let config = SyncConfig::load(&mut store)?;
        assert_eq!(config.mode, SyncMode::GitBranch);
        assert_eq!(config.strategy, ConflictStrategy::Theirs);
        assert_eq!(config.flush_debounce, Duration::from_secs(2));
        // Untouched keys keep their defaults.
        assert_eq!(config.lock_timeout, DEFAULT_LOCK_TIMEOUT);
        assert_eq!(config.auto_compact_threshold, DEFAULT_AUTO_COMPACT_THRESHOLD);
        Ok(())
    }

    #[test]
    #[serial]
    fn environment_overrides_metadata() -> CResult<()> {
        let (_dir, mut store) = setup_store();
        SyncConfig::set(&mut store, KEY_CONFLICT_STRATEGY, "ours")?;

        std::env::set_var("BEADS_CONFLICT_STRATEGY", "manual");
        let config = SyncConfig::load(&mut store);
        std::env::remove_var("BEADS_CONFLICT_STRATEGY");

        assert_eq!(config?.strategy, ConflictStrategy::Manual);
        Ok(())
    }

    #[test]
    fn bad_values_never_persist() {
        let (_dir, mut store) = setup_store();
        assert!(SyncConfig::set(&mut store, KEY_SYNC_MODE, "telepathy").is_err());
        assert!(SyncConfig::set(&mut store, KEY_SYNC_REMOTE, "ftp://nope").is_err());
        assert!(SyncConfig::set(&mut store, "sync.unknown", "x").is_err());
        assert_eq!(store.get_metadata(KEY_SYNC_MODE).unwrap(), None);
    }

    #[test]
    fn env_var_names() {
        assert_eq!(env_var_for("sync.mode"), "BEADS_SYNC_MODE");
        assert_eq!(env_var_for("flush-debounce"), "BEADS_FLUSH_DEBOUNCE");
        assert_eq!(
            env_var_for("deletions.auto_compact_threshold"),
            "BEADS_DELETIONS_AUTO_COMPACT_THRESHOLD"
        );
    }
}
