//! The ledger codec: deterministic serialization of issues to the
//! line-oriented ledger format, and parsing back.
//!
//! One canonical JSON object per line, LF-terminated, lines sorted by
//! ascending id. Emission is deterministic: the same issue always produces
//! byte-identical lines, which is what makes content-hash staleness
//! detection possible.

use std::collections::BTreeMap;

use crate::codec::Codec;
use crate::error::{CResult, Error};
use crate::model::Issue;

#[derive(Clone, Copy, Default)]
pub struct LedgerCodec;

impl LedgerCodec {
    pub fn new() -> Self {
        LedgerCodec
    }

    /// Encodes a single issue as its canonical ledger line (no trailing LF).
    pub fn encode_line(&self, issue: &Issue) -> CResult<String> {
        Ok(serde_json::to_string(issue)?)
    }

    /// Parses one ledger line. The content hash is recomputed since it is
    /// never emitted.
    pub fn parse_line(&self, line: &str) -> CResult<Issue> {
        let mut issue: Issue = serde_json::from_str(line)?;
        issue.content_hash = issue.compute_content_hash();
        Ok(issue)
    }

    /// Emits the full ledger text: one line per issue, sorted ascending by
    /// id, every line LF-terminated. Duplicate ids are corruption.
    pub fn emit(&self, issues: &[Issue]) -> CResult<String> {
        let mut sorted: Vec<&Issue> = issues.iter().collect();
        sorted.sort_by(|a, b| a.id.cmp(&b.id));

        let dups = duplicate_ids(sorted.iter().map(|i| i.id.as_str()));
        if !dups.is_empty() {
            return Err(Error::DuplicateIds(dups));
        }

        let mut out = String::new();
        for issue in sorted {
            out.push_str(&self.encode_line(issue)?);
            out.push('\n');
        }
        Ok(out)
    }

    /// Parses a full ledger. Blank lines are skipped; a duplicate id is an
    /// error (see [`parse_merged`](Self::parse_merged) for the post-VCS-merge
    /// case where duplicates are expected).
    pub fn parse(&self, text: &str) -> CResult<Vec<Issue>> {
        let issues = self.parse_lenient(text)?;
        let dups = duplicate_ids(issues.iter().map(|i| i.id.as_str()));
        if !dups.is_empty() {
            return Err(Error::DuplicateIds(dups));
        }
        Ok(issues)
    }

    /// Parses a ledger that may contain several lines for the same id, as
    /// happens after a VCS content merge. Duplicates collapse to a single
    /// issue: a tombstone no older than the other line wins, otherwise the
    /// larger `updated_at`, ties broken by the larger content hash.
    pub fn parse_merged(&self, text: &str) -> CResult<Vec<Issue>> {
        let mut by_id: BTreeMap<String, Issue> = BTreeMap::new();
        for issue in self.parse_lenient(text)? {
            match by_id.remove(&issue.id) {
                None => {
                    by_id.insert(issue.id.clone(), issue);
                }
                Some(existing) => {
                    let winner = collapse(existing, issue);
                    by_id.insert(winner.id.clone(), winner);
                }
            }
        }
        Ok(by_id.into_values().collect())
    }

    fn parse_lenient(&self, text: &str) -> CResult<Vec<Issue>> {
        let mut issues = Vec::new();
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let issue = self
                .parse_line(line)
                .map_err(|err| Error::Parse(format!("ledger line {}: {}", n + 1, err)))?;
            issues.push(issue);
        }
        Ok(issues)
    }
}

impl Codec for LedgerCodec {
    fn codec_name(&self) -> String {
        "LedgerCodec".to_string()
    }
}

/// Picks the surviving issue for two ledger lines with the same id.
fn collapse(a: Issue, b: Issue) -> Issue {
    if a.is_tombstone() && a.updated_at >= b.updated_at {
        return a;
    }
    if b.is_tombstone() && b.updated_at >= a.updated_at {
        return b;
    }
    if a.updated_at != b.updated_at {
        if a.updated_at > b.updated_at {
            a
        } else {
            b
        }
    } else if a.content_hash >= b.content_hash {
        a
    } else {
        b
    }
}

fn duplicate_ids<'a>(ids: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    let mut dups = std::collections::BTreeSet::new();
    for id in ids {
        if !seen.insert(id) {
            dups.insert(id.to_string());
        }
    }
    dups.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Status;
    use chrono::{TimeZone, Utc};

    fn issue(id: &str, title: &str) -> Issue {
        Issue::new(id, title, Utc.timestamp_opt(1_700_000_000, 42).unwrap())
    }

    #[test]
    fn emission_is_deterministic_and_sorted() {
        let codec = LedgerCodec::new();
        let issues = vec![issue("bd-b", "second"), issue("bd-a", "first")];

        let one = codec.emit(&issues).unwrap();
        let two = codec.emit(&issues).unwrap();
        assert_eq!(one, two);

        let lines: Vec<&str> = one.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("bd-a"));
        assert!(lines[1].contains("bd-b"));
        assert!(one.ends_with('\n'));
    }

    #[test]
    fn emit_parse_emit_is_idempotent() {
        let codec = LedgerCodec::new();
        let mut a = issue("bd-1", "round trip");
        a.labels = vec!["sync".to_string(), "core".to_string()];
        let text = codec.emit(&[a]).unwrap();
        let parsed = codec.parse(&text).unwrap();
        assert_eq!(codec.emit(&parsed).unwrap(), text);
    }

    #[test]
    fn parse_recomputes_content_hash() {
        let codec = LedgerCodec::new();
        let a = issue("bd-1", "hash me");
        let text = codec.emit(&[a.clone()]).unwrap();
        let parsed = codec.parse(&text).unwrap();
        assert_eq!(parsed[0].content_hash, a.compute_content_hash());
    }

    #[test]
    fn parse_rejects_duplicate_ids() {
        let codec = LedgerCodec::new();
        let text = codec.emit(&[issue("bd-1", "one")]).unwrap().repeat(2);
        match codec.parse(&text) {
            Err(Error::DuplicateIds(ids)) => assert_eq!(ids, vec!["bd-1".to_string()]),
            other => panic!("expected DuplicateIds, got {:?}", other),
        }
    }

    #[test]
    fn parse_merged_prefers_tombstones_no_older_than_the_edit() {
        let codec = LedgerCodec::new();
        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let mut edited = issue("bd-1", "edited title");
        edited.updated_at = t;
        let mut tomb = issue("bd-1", "original");
        tomb.status = Status::Tombstone;
        tomb.deleted_at = Some(t);
        tomb.updated_at = t + chrono::Duration::seconds(1);

        let text = format!(
            "{}\n{}\n",
            codec.encode_line(&edited).unwrap(),
            codec.encode_line(&tomb).unwrap()
        );
        let merged = codec.parse_merged(&text).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, Status::Tombstone);
    }

    #[test]
    fn parse_merged_picks_newest_otherwise() {
        let codec = LedgerCodec::new();
        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let mut old = issue("bd-1", "old");
        old.updated_at = t;
        let mut new = issue("bd-1", "new");
        new.updated_at = t + chrono::Duration::seconds(5);

        let text = format!(
            "{}\n{}\n",
            codec.encode_line(&old).unwrap(),
            codec.encode_line(&new).unwrap()
        );
        let merged = codec.parse_merged(&text).unwrap();
        assert_eq!(merged[0].title, "new");
    }

    #[test]
    fn blank_lines_are_skipped() {
        let codec = LedgerCodec::new();
        let text = format!("\n{}\n\n", codec.encode_line(&issue("bd-1", "x")).unwrap());
        assert_eq!(codec.parse(&text).unwrap().len(), 1);
    }

    #[test]
    fn parse_errors_carry_line_numbers() {
        let codec = LedgerCodec::new();
        let good = codec.encode_line(&issue("bd-1", "x")).unwrap();
        let text = format!("{}\nnot json\n", good);
        match codec.parse(&text) {
            Err(Error::Parse(msg)) => assert!(msg.contains("line 2")),
            other => panic!("expected Parse, got {:?}", other),
        }
    }
}
