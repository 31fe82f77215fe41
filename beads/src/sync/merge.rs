//! The three-way merge at the heart of the import path.
//!
//! For every id in base ∪ local ∪ remote the merge decides a single surviving
//! issue. Divergent sides are merged field by field, so edits to different
//! fields combine without any conflict at all; only a same-field divergence
//! consults the configured conflict strategy. Tombstones take precedence
//! whenever the deleting side is no older than the other.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::ConflictStrategy;
use crate::model::{Issue, Status};

/// Counters reported by one merge pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub local_wins: usize,
    pub remote_wins: usize,
    pub same: usize,
    /// Field-split merges where no field diverged on both sides.
    pub merged_clean: usize,
    pub conflicts_auto_resolved: usize,
    /// Ids preserved as local pending a manual decision.
    pub conflicts_manual: Vec<String>,
    /// Ids absent on both sides and dropped.
    pub dropped: usize,
}

#[derive(Clone, Debug)]
pub struct MergeOutcome {
    pub issues: Vec<Issue>,
    pub report: MergeReport,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Local,
    Remote,
}

pub fn three_way_merge(
    base: &[Issue],
    local: &[Issue],
    remote: &[Issue],
    strategy: ConflictStrategy,
) -> MergeOutcome {
    let base_by_id: BTreeMap<&str, &Issue> = base.iter().map(|i| (i.id.as_str(), i)).collect();
    let local_by_id: BTreeMap<&str, &Issue> = local.iter().map(|i| (i.id.as_str(), i)).collect();
    let remote_by_id: BTreeMap<&str, &Issue> = remote.iter().map(|i| (i.id.as_str(), i)).collect();

    let mut ids: BTreeSet<&str> = BTreeSet::new();
    ids.extend(base_by_id.keys());
    ids.extend(local_by_id.keys());
    ids.extend(remote_by_id.keys());

    let mut report = MergeReport::default();
    let mut issues = Vec::new();

    for id in ids {
        let b = base_by_id.get(id).copied();
        let l = local_by_id.get(id).copied();
        let r = remote_by_id.get(id).copied();

        match (l, r) {
            (None, None) => report.dropped += 1,

            // Present only locally: a new creation, or a remote deletion.
            (Some(l), None) => match b {
                None => {
                    report.local_wins += 1;
                    issues.push(l.clone());
                }
                Some(b) if b == l => {
                    // Unchanged here, gone there: accept the removal.
                    report.remote_wins += 1;
                    report.dropped += 1;
                }
                Some(_) => {
                    // Edited here, physically gone there with no tombstone to
                    // date the removal. Keep the edit.
                    log::warn!("{}: modified locally but absent remotely, keeping local", id);
                    report.local_wins += 1;
                    issues.push(l.clone());
                }
            },

            (None, Some(r)) => match b {
                None => {
                    report.remote_wins += 1;
                    issues.push(r.clone());
                }
                Some(b) if b == r => {
                    report.local_wins += 1;
                    report.dropped += 1;
                }
                Some(_) => {
                    log::warn!("{}: modified remotely but absent locally, keeping remote", id);
                    report.remote_wins += 1;
                    issues.push(r.clone());
                }
            },

            (Some(l), Some(r)) => {
                if l == r {
                    report.same += 1;
                    issues.push(l.clone());
                } else if l.is_tombstone() || r.is_tombstone() {
                    // One side survives wholesale: the tombstone when it is
                    // no older than the other side, the edit when the
                    // tombstone aged out. Never field-merge against a dead
                    // row; pick_field would re-derive the deletion the
                    // precedence check just rejected (only the tombstone
                    // side changed `status` relative to base).
                    let (winner, survivor) = match tombstone_winner(l, r) {
                        Some(Side::Local) => (Side::Local, l),
                        Some(Side::Remote) => (Side::Remote, r),
                        None if l.is_tombstone() => (Side::Remote, r),
                        None => (Side::Local, l),
                    };
                    match winner {
                        Side::Local => report.local_wins += 1,
                        Side::Remote => report.remote_wins += 1,
                    }
                    issues.push(survivor.clone());
                } else if b == Some(l) {
                    report.remote_wins += 1;
                    issues.push(r.clone());
                } else if b == Some(r) {
                    report.local_wins += 1;
                    issues.push(l.clone());
                } else {
                    let (merged, conflicted) = merge_fields(b, l, r, strategy);
                    if conflicted == 0 {
                        report.merged_clean += 1;
                    } else if strategy == ConflictStrategy::Manual {
                        report.conflicts_manual.push(merged.id.clone());
                    } else {
                        report.conflicts_auto_resolved += 1;
                    }
                    issues.push(merged);
                }
            }
        }
    }

    MergeOutcome { issues, report }
}

/// Tombstone precedence: the deleting side wins if its `updated_at` is no
/// older than the other side's. Returns None for a tombstone older than the
/// other side's edit; the caller resolves that to the editing side, which
/// revives the issue as the editor last saw it.
fn tombstone_winner(l: &Issue, r: &Issue) -> Option<Side> {
    match (l.is_tombstone(), r.is_tombstone()) {
        (false, false) => None,
        (true, false) if l.updated_at >= r.updated_at => Some(Side::Local),
        (false, true) if r.updated_at >= l.updated_at => Some(Side::Remote),
        (true, true) => {
            if l.updated_at >= r.updated_at {
                Some(Side::Local)
            } else {
                Some(Side::Remote)
            }
        }
        _ => None,
    }
}

/// The winning side for fields both sides changed.
fn conflict_winner(l: &Issue, r: &Issue, strategy: ConflictStrategy) -> Side {
    match strategy {
        ConflictStrategy::Ours | ConflictStrategy::Manual => Side::Local,
        ConflictStrategy::Theirs => Side::Remote,
        ConflictStrategy::Newest => {
            if l.updated_at > r.updated_at {
                Side::Local
            } else if r.updated_at > l.updated_at {
                Side::Remote
            } else if l.content_hash >= r.content_hash {
                Side::Local
            } else {
                Side::Remote
            }
        }
    }
}

/// Field-level merge. Returns the merged issue and how many fields diverged
/// on both sides and needed the strategy.
fn merge_fields(
    b: Option<&Issue>,
    l: &Issue,
    r: &Issue,
    strategy: ConflictStrategy,
) -> (Issue, usize) {
    let winner = conflict_winner(l, r, strategy);
    let mut conflicts = 0usize;

    macro_rules! pick {
        ($field:ident) => {
            pick_field(b.map(|b| &b.$field), &l.$field, &r.$field, winner, &mut conflicts)
        };
    }

    let mut merged = Issue {
        id: l.id.clone(),
        title: pick!(title),
        status: pick!(status),
        priority: pick!(priority),
        issue_type: pick!(issue_type),
        description: pick!(description),
        design: pick!(design),
        acceptance_criteria: pick!(acceptance_criteria),
        notes: pick!(notes),
        assignee: pick!(assignee),
        created_at: l.created_at.min(r.created_at),
        updated_at: l.updated_at.max(r.updated_at),
        closed_at: pick!(closed_at),
        close_reason: pick!(close_reason),
        deleted_at: pick!(deleted_at),
        deleted_by: pick!(deleted_by),
        delete_reason: pick!(delete_reason),
        external_ref: pick!(external_ref),
        compaction_level: pick!(compaction_level),
        labels: pick!(labels),
        dependencies: pick!(dependencies),
        comments: pick!(comments),
        content_hash: String::new(),
        extra: pick!(extra),
    };

    // Keep the lifecycle fields coupled to the merged status.
    if merged.status != Status::Closed {
        merged.closed_at = None;
        merged.close_reason = None;
    } else if merged.closed_at.is_none() {
        merged.closed_at = Some(merged.updated_at);
    }
    if merged.status != Status::Tombstone {
        merged.deleted_at = None;
        merged.deleted_by = None;
        merged.delete_reason = None;
    } else if merged.deleted_at.is_none() {
        merged.deleted_at = Some(merged.updated_at);
    }

    merged.content_hash = merged.compute_content_hash();
    (merged, conflicts)
}

fn pick_field<T: Clone + PartialEq>(
    b: Option<&T>,
    l: &T,
    r: &T,
    winner: Side,
    conflicts: &mut usize,
) -> T {
    if l == r {
        return l.clone();
    }
    match b {
        Some(b) if b == l => r.clone(),
        Some(b) if b == r => l.clone(),
        _ => {
            *conflicts += 1;
            match winner {
                Side::Local => l.clone(),
                Side::Remote => r.clone(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Priority;
    use chrono::{DateTime, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn issue(id: &str, title: &str, at: DateTime<Utc>) -> Issue {
        let mut i = Issue::new(id, title, at);
        i.content_hash = i.compute_content_hash();
        i
    }

    fn ids(outcome: &MergeOutcome) -> Vec<&str> {
        outcome.issues.iter().map(|i| i.id.as_str()).collect()
    }

    #[test]
    fn unchanged_side_accepts_the_other() {
        let b = issue("bd-1", "base", t(0));
        let mut l = b.clone();
        l.title = "local edit".to_string();
        l.updated_at = t(10);
        l.content_hash = l.compute_content_hash();

        // L = B: merge is R.
        let out = three_way_merge(
            std::slice::from_ref(&b),
            std::slice::from_ref(&b),
            std::slice::from_ref(&l),
            ConflictStrategy::Newest,
        );
        assert_eq!(out.issues[0].title, "local edit");
        assert_eq!(out.report.remote_wins, 1);

        // R = B: merge is L.
        let out = three_way_merge(
            std::slice::from_ref(&b),
            std::slice::from_ref(&l),
            std::slice::from_ref(&b),
            ConflictStrategy::Newest,
        );
        assert_eq!(out.issues[0].title, "local edit");
        assert_eq!(out.report.local_wins, 1);

        // L = R: merge is L.
        let out = three_way_merge(
            std::slice::from_ref(&b),
            std::slice::from_ref(&l),
            std::slice::from_ref(&l),
            ConflictStrategy::Newest,
        );
        assert_eq!(out.issues[0].title, "local edit");
        assert_eq!(out.report.same, 1);
    }

    #[test]
    fn disjoint_field_edits_combine_without_conflict() {
        let mut base = issue("bd-7", "X", t(0));
        base.priority = Priority(3);
        base.content_hash = base.compute_content_hash();

        let mut local = base.clone();
        local.priority = Priority(4);
        local.updated_at = t(5);
        local.content_hash = local.compute_content_hash();

        let mut remote = base.clone();
        remote.title = "Y".to_string();
        remote.updated_at = t(6);
        remote.content_hash = remote.compute_content_hash();

        let out = three_way_merge(
            std::slice::from_ref(&base),
            std::slice::from_ref(&local),
            std::slice::from_ref(&remote),
            ConflictStrategy::Newest,
        );
        let merged = &out.issues[0];
        assert_eq!(merged.priority, Priority(4));
        assert_eq!(merged.title, "Y");
        assert_eq!(merged.updated_at, t(6));
        assert_eq!(out.report.conflicts_auto_resolved, 0);
        assert_eq!(out.report.merged_clean, 1);
    }

    #[test]
    fn same_field_divergence_resolves_by_newest() {
        let base = issue("bd-1", "original", t(0));
        let mut local = base.clone();
        local.title = "local title".to_string();
        local.updated_at = t(5);
        local.content_hash = local.compute_content_hash();
        let mut remote = base.clone();
        remote.title = "remote title".to_string();
        remote.updated_at = t(9);
        remote.content_hash = remote.compute_content_hash();

        let out = three_way_merge(
            std::slice::from_ref(&base),
            std::slice::from_ref(&local),
            std::slice::from_ref(&remote),
            ConflictStrategy::Newest,
        );
        assert_eq!(out.issues[0].title, "remote title");
        assert_eq!(out.report.conflicts_auto_resolved, 1);
    }

    #[test]
    fn newest_ties_break_on_content_hash() {
        let base = issue("bd-1", "original", t(0));
        let mut local = base.clone();
        local.title = "aaa".to_string();
        local.updated_at = t(5);
        local.content_hash = local.compute_content_hash();
        let mut remote = base.clone();
        remote.title = "zzz".to_string();
        remote.updated_at = t(5);
        remote.content_hash = remote.compute_content_hash();

        let out = three_way_merge(
            std::slice::from_ref(&base),
            std::slice::from_ref(&local),
            std::slice::from_ref(&remote),
            ConflictStrategy::Newest,
        );
        let expect = if local.content_hash >= remote.content_hash { "aaa" } else { "zzz" };
        assert_eq!(out.issues[0].title, expect);
    }

    #[test]
    fn ours_theirs_and_manual_strategies() {
        let base = issue("bd-1", "original", t(0));
        let mut local = base.clone();
        local.title = "ours".to_string();
        local.updated_at = t(5);
        local.content_hash = local.compute_content_hash();
        let mut remote = base.clone();
        remote.title = "theirs".to_string();
        remote.updated_at = t(9);
        remote.content_hash = remote.compute_content_hash();

        let out = three_way_merge(
            std::slice::from_ref(&base),
            std::slice::from_ref(&local),
            std::slice::from_ref(&remote),
            ConflictStrategy::Ours,
        );
        assert_eq!(out.issues[0].title, "ours");

        let out = three_way_merge(
            std::slice::from_ref(&base),
            std::slice::from_ref(&local),
            std::slice::from_ref(&remote),
            ConflictStrategy::Theirs,
        );
        assert_eq!(out.issues[0].title, "theirs");

        let out = three_way_merge(
            std::slice::from_ref(&base),
            std::slice::from_ref(&local),
            std::slice::from_ref(&remote),
            ConflictStrategy::Manual,
        );
        assert_eq!(out.issues[0].title, "ours");
        assert_eq!(out.report.conflicts_manual, vec!["bd-1".to_string()]);
        assert_eq!(out.report.conflicts_auto_resolved, 0);
    }

    #[test]
    fn tombstone_no_older_than_edit_wins() {
        let base = issue("bd-1", "alive", t(0));
        let mut local = base.clone();
        local.title = "edited".to_string();
        local.updated_at = t(5);
        local.content_hash = local.compute_content_hash();

        let mut remote = base.clone();
        remote.status = Status::Tombstone;
        remote.deleted_at = Some(t(7));
        remote.updated_at = t(7);
        remote.content_hash = remote.compute_content_hash();

        let out = three_way_merge(
            std::slice::from_ref(&base),
            std::slice::from_ref(&local),
            std::slice::from_ref(&remote),
            ConflictStrategy::Newest,
        );
        assert!(out.issues[0].is_tombstone());
        assert_eq!(out.report.remote_wins, 1);
    }

    #[test]
    fn older_tombstone_loses_to_a_later_edit() {
        let base = issue("bd-1", "alive", t(0));
        let mut local = base.clone();
        local.status = Status::Tombstone;
        local.deleted_at = Some(t(3));
        local.updated_at = t(3);
        local.content_hash = local.compute_content_hash();

        let mut remote = base.clone();
        remote.title = "revived edit".to_string();
        remote.updated_at = t(8);
        remote.content_hash = remote.compute_content_hash();

        let out = three_way_merge(
            std::slice::from_ref(&base),
            std::slice::from_ref(&local),
            std::slice::from_ref(&remote),
            ConflictStrategy::Newest,
        );
        // The edit revives the issue wholesale; no deletion field survives.
        assert!(!out.issues[0].is_tombstone());
        assert_eq!(out.issues[0].title, "revived edit");
        assert_eq!(out.issues[0].deleted_at, None);
        assert_eq!(out.report.remote_wins, 1);
        out.issues[0].validate().unwrap();
    }

    #[test]
    fn creations_survive_on_either_side() {
        let local_new = issue("bd-l", "local only", t(1));
        let remote_new = issue("bd-r", "remote only", t(2));

        let out = three_way_merge(
            &[],
            std::slice::from_ref(&local_new),
            std::slice::from_ref(&remote_new),
            ConflictStrategy::Newest,
        );
        assert_eq!(ids(&out), vec!["bd-l", "bd-r"]);
        assert_eq!(out.report.local_wins, 1);
        assert_eq!(out.report.remote_wins, 1);
    }

    #[test]
    fn absent_on_both_sides_drops() {
        let base = issue("bd-1", "forgotten", t(0));
        let out = three_way_merge(std::slice::from_ref(&base), &[], &[], ConflictStrategy::Newest);
        assert!(out.issues.is_empty());
        assert_eq!(out.report.dropped, 1);
    }

    #[test]
    fn local_edit_survives_remote_physical_absence() {
        let base = issue("bd-1", "old", t(0));
        let mut local = base.clone();
        local.title = "edited since".to_string();
        local.updated_at = t(4);
        local.content_hash = local.compute_content_hash();

        let out = three_way_merge(
            std::slice::from_ref(&base),
            std::slice::from_ref(&local),
            &[],
            ConflictStrategy::Newest,
        );
        assert_eq!(out.issues[0].title, "edited since");
    }

    #[test]
    fn merged_status_keeps_lifecycle_fields_coupled() {
        // Local closes; remote edits the title. The merged issue is closed
        // with closed_at intact, and the title edit survives.
        let base = issue("bd-1", "work", t(0));
        let mut local = base.clone();
        local.status = Status::Closed;
        local.closed_at = Some(t(5));
        local.updated_at = t(5);
        local.content_hash = local.compute_content_hash();
        let mut remote = base.clone();
        remote.title = "work, renamed".to_string();
        remote.updated_at = t(6);
        remote.content_hash = remote.compute_content_hash();

        let out = three_way_merge(
            std::slice::from_ref(&base),
            std::slice::from_ref(&local),
            std::slice::from_ref(&remote),
            ConflictStrategy::Newest,
        );
        let merged = &out.issues[0];
        assert_eq!(merged.status, Status::Closed);
        assert_eq!(merged.closed_at, Some(t(5)));
        assert_eq!(merged.title, "work, renamed");
        merged.validate().unwrap();
    }
}
