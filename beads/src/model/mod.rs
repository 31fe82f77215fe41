//! Core data types: issues, dependency edges, comments and deletion records,
//! plus the canonical timestamp encoding shared by the ledger and the
//! deletion manifest.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CResult, Error};

/// RFC 3339 timestamps with a fixed nanosecond fraction, so that emitting the
/// same issue twice yields byte-identical lines.
pub mod ts {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Optional variant of [`ts`].
pub mod ts_opt {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match t {
            Some(t) => s.serialize_str(&t.to_rfc3339_opts(SecondsFormat::Nanos, true)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        match raw {
            None => Ok(None),
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Issue lifecycle status. A tombstone is a first-class state: deleted issues
/// keep their row so concurrent clones converge on the deletion.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Open,
    InProgress,
    Blocked,
    Deferred,
    Closed,
    Tombstone,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Open => "open",
            Status::InProgress => "in_progress",
            Status::Blocked => "blocked",
            Status::Deferred => "deferred",
            Status::Closed => "closed",
            Status::Tombstone => "tombstone",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open" => Ok(Status::Open),
            "in_progress" | "inprogress" => Ok(Status::InProgress),
            "blocked" => Ok(Status::Blocked),
            "deferred" => Ok(Status::Deferred),
            "closed" => Ok(Status::Closed),
            "tombstone" => Ok(Status::Tombstone),
            other => Err(Error::Parse(format!("unknown status '{}'", other))),
        }
    }
}

/// Issue priority, 0 (critical) through 5.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    pub const CRITICAL: Self = Self(0);
    pub const HIGH: Self = Self(1);
    pub const MEDIUM: Self = Self(2);
    pub const LOW: Self = Self(3);
    pub const BACKLOG: Self = Self(4);
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_uppercase();
        let raw = s.strip_prefix('P').unwrap_or(&s);
        match raw.parse::<i32>() {
            Ok(p) if (0..=5).contains(&p) => Ok(Self(p)),
            _ => Err(Error::Parse(format!("invalid priority '{}'", s))),
        }
    }
}

/// Issue type category.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    #[default]
    Task,
    Bug,
    Feature,
    Epic,
    Chore,
    #[serde(untagged)]
    Custom(String),
}

impl IssueType {
    pub fn as_str(&self) -> &str {
        match self {
            IssueType::Task => "task",
            IssueType::Bug => "bug",
            IssueType::Feature => "feature",
            IssueType::Epic => "epic",
            IssueType::Chore => "chore",
            IssueType::Custom(value) => value,
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IssueType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "task" => Ok(IssueType::Task),
            "bug" => Ok(IssueType::Bug),
            "feature" => Ok(IssueType::Feature),
            "epic" => Ok(IssueType::Epic),
            "chore" => Ok(IssueType::Chore),
            other => Ok(IssueType::Custom(other.to_string())),
        }
    }
}

/// Dependency edge type. Only the `blocks` subgraph must stay acyclic.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    Blocks,
    RelatesTo,
    ParentOf,
    ChildOf,
}

impl DependencyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyType::Blocks => "blocks",
            DependencyType::RelatesTo => "relates_to",
            DependencyType::ParentOf => "parent_of",
            DependencyType::ChildOf => "child_of",
        }
    }
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DependencyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "blocks" => Ok(DependencyType::Blocks),
            "relates_to" => Ok(DependencyType::RelatesTo),
            "parent_of" => Ok(DependencyType::ParentOf),
            "child_of" => Ok(DependencyType::ChildOf),
            other => Err(Error::Parse(format!("unknown dependency type '{}'", other))),
        }
    }
}

/// A directed dependency edge; the source issue is the row the edge lives on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub depends_on_id: String,
    #[serde(rename = "type")]
    pub dep_type: DependencyType,
}

/// A comment on an issue. Ordered by creation time within the issue row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub author: String,
    pub text: String,
    #[serde(with = "ts")]
    pub created_at: DateTime<Utc>,
}

/// One line of the deletion manifest. Duplicates by id are tolerated and
/// collapsed to the latest timestamp on load.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionRecord {
    pub id: String,
    #[serde(with = "ts")]
    pub deleted_at: DateTime<Utc>,
    pub deleted_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The primary issue entity. Field declaration order is the canonical ledger
/// field order; unknown fields ride along in `extra` and serialize after all
/// known fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,

    pub title: String,

    #[serde(default)]
    pub status: Status,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub issue_type: IssueType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub design: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance_criteria: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    #[serde(with = "ts")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "ts")]
    pub updated_at: DateTime<Utc>,

    /// Present iff status == closed.
    #[serde(default, with = "ts_opt", skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,

    /// Present iff status == tombstone.
    #[serde(default, with = "ts_opt", skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compaction_level: Option<i32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<Comment>,

    /// Fingerprint of the sync-relevant fields. Recomputed on every mutation
    /// and after parse; never emitted.
    #[serde(skip)]
    pub content_hash: String,

    /// Unknown fields preserved verbatim for forward compatibility.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Issue {
    /// A fresh open issue with both timestamps set to `now`.
    pub fn new(id: impl Into<String>, title: impl Into<String>, now: DateTime<Utc>) -> Self {
        let mut issue = Issue {
            id: id.into(),
            title: title.into(),
            status: Status::Open,
            priority: Priority::default(),
            issue_type: IssueType::default(),
            description: None,
            design: None,
            acceptance_criteria: None,
            notes: None,
            assignee: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
            close_reason: None,
            deleted_at: None,
            deleted_by: None,
            delete_reason: None,
            external_ref: None,
            compaction_level: None,
            labels: Vec::new(),
            dependencies: Vec::new(),
            comments: Vec::new(),
            content_hash: String::new(),
            extra: BTreeMap::new(),
        };
        issue.content_hash = issue.compute_content_hash();
        issue
    }

    pub fn is_tombstone(&self) -> bool {
        self.status == Status::Tombstone
    }

    /// Deterministic fingerprint over the sync-relevant fields, with NUL
    /// separators so adjacent fields cannot collide.
    pub fn compute_content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        let mut update = |s: &str| {
            hasher.update(s.as_bytes());
            hasher.update([0]);
        };
        update(&self.title);
        update(self.description.as_deref().unwrap_or(""));
        update(self.design.as_deref().unwrap_or(""));
        update(self.acceptance_criteria.as_deref().unwrap_or(""));
        update(self.notes.as_deref().unwrap_or(""));
        update(self.status.as_str());
        update(&self.priority.0.to_string());
        update(self.issue_type.as_str());
        update(self.assignee.as_deref().unwrap_or(""));
        update(self.external_ref.as_deref().unwrap_or(""));
        update(&self.labels.join("\u{1}"));
        format!("{:x}", hasher.finalize())
    }

    /// Checks the structural invariants the sync engine relies on.
    pub fn validate(&self) -> CResult<()> {
        if self.id.is_empty() {
            return Err(Error::Value("issue id must not be empty".to_string()));
        }
        if self.title.is_empty() {
            return Err(Error::Value(format!("{}: title must not be empty", self.id)));
        }
        if self.updated_at < self.created_at {
            return Err(Error::Value(format!(
                "{}: updated_at precedes created_at",
                self.id
            )));
        }
        if (self.status == Status::Closed) != self.closed_at.is_some() {
            return Err(Error::Value(format!(
                "{}: closed_at present iff status is closed",
                self.id
            )));
        }
        if (self.status == Status::Tombstone) != self.deleted_at.is_some() {
            return Err(Error::Value(format!(
                "{}: deleted_at present iff status is tombstone",
                self.id
            )));
        }
        Ok(())
    }
}

/// Generates an issue id `<prefix>-<6 hex digits>` from the title, the
/// creation instant and a random nonce.
pub fn new_issue_id(prefix: &str, title: &str, now: DateTime<Utc>) -> String {
    let nonce: u64 = rand::random();
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(now.timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
    hasher.update(nonce.to_be_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}-{}", prefix, &digest[..6])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap()
    }

    #[test]
    fn timestamps_round_trip_with_nanos() {
        let issue = Issue::new("bd-1", "nanosecond fidelity", t0());
        let line = serde_json::to_string(&issue).unwrap();
        assert!(line.contains("2023-11-14T22:13:20.123456789Z"));
        let back: Issue = serde_json::from_str(&line).unwrap();
        assert_eq!(back.created_at, issue.created_at);
        assert_eq!(back.updated_at, issue.updated_at);
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let json = r#"{"id":"bd-2","title":"keep me","status":"open","priority":1,
            "issue_type":"task",
            "created_at":"2023-11-14T22:13:20.000000000Z",
            "updated_at":"2023-11-14T22:13:20.000000000Z",
            "future_field":{"nested":true},"another":"x"}"#;
        let issue: Issue = serde_json::from_str(json).unwrap();
        assert_eq!(issue.extra.len(), 2);
        let out = serde_json::to_string(&issue).unwrap();
        assert!(out.contains("future_field"));
        assert!(out.contains("another"));
        // Known fields emit before unknown ones.
        assert!(out.find("\"id\"").unwrap() < out.find("future_field").unwrap());
    }

    #[test]
    fn content_hash_is_stable_and_sensitive() {
        let a = Issue::new("bd-3", "hash me", t0());
        let mut b = a.clone();
        assert_eq!(a.compute_content_hash(), b.compute_content_hash());
        b.title = "hash me harder".to_string();
        assert_ne!(a.compute_content_hash(), b.compute_content_hash());
    }

    #[test]
    fn validate_enforces_lifecycle_fields() {
        let mut issue = Issue::new("bd-4", "check", t0());
        issue.validate().unwrap();

        issue.status = Status::Closed;
        assert!(issue.validate().is_err());
        issue.closed_at = Some(t0());
        issue.validate().unwrap();

        issue.status = Status::Tombstone;
        issue.closed_at = None;
        assert!(issue.validate().is_err());
        issue.deleted_at = Some(t0());
        issue.validate().unwrap();
    }

    #[test]
    fn status_parsing() {
        assert_eq!("in_progress".parse::<Status>().unwrap(), Status::InProgress);
        assert_eq!("TOMBSTONE".parse::<Status>().unwrap(), Status::Tombstone);
        assert!("gone".parse::<Status>().is_err());
    }

    #[test]
    fn priority_parsing() {
        assert_eq!("P2".parse::<Priority>().unwrap(), Priority::MEDIUM);
        assert_eq!("4".parse::<Priority>().unwrap(), Priority::BACKLOG);
        assert!("P9".parse::<Priority>().is_err());
    }

    #[test]
    fn issue_ids_carry_prefix_and_hash() {
        let id = new_issue_id("bd", "some title", t0());
        assert!(id.starts_with("bd-"));
        assert_eq!(id.len(), "bd-".len() + 6);
        // A second id for the same title must differ thanks to the nonce.
        assert_ne!(id, new_issue_id("bd", "some title", t0()));
    }
}
