//! The deferred-flush scheduler: a single cooperative timer that debounces
//! ledger exports while mutations keep arriving.
//!
//! This is deliberately not a background thread pool. One timer, one queue,
//! one state machine: `Idle -> Scheduled -> Flushing -> Idle`. The driver
//! (CLI or daemon loop) polls `due`, runs the export path under the exclusive
//! ledger lock with the ids from `begin_flush`, and reports back with
//! `complete_flush` or `fail_flush`. Concurrent user writes are serialized by
//! the store; concurrent processes by the ledger lock.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

/// Default debounce between the first mutation and the flush.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(5);

/// How many debounce intervals a busy writer may extend the window before the
/// flush fires anyway.
const WINDOW_CAP_FACTOR: u32 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushState {
    Idle,
    Scheduled,
    Flushing,
}

pub struct FlushScheduler {
    debounce: Duration,
    state: FlushState,
    /// When the scheduled flush fires.
    deadline: Option<Instant>,
    /// Start of the current debounce window; marks may not extend the
    /// deadline past `window_start + debounce * WINDOW_CAP_FACTOR`.
    window_start: Option<Instant>,
    pending: BTreeSet<String>,
}

impl FlushScheduler {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            state: FlushState::Idle,
            deadline: None,
            window_start: None,
            pending: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> FlushState {
        self.state
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Records a dirty id. Idle transitions to Scheduled after `debounce`
    /// (immediately when urgent); further marks while Scheduled extend the
    /// window up to the cap; marks while Flushing accumulate for the next
    /// cycle.
    pub fn mark_dirty(&mut self, id: &str, urgent: bool, now: Instant) {
        self.pending.insert(id.to_string());
        match self.state {
            FlushState::Idle => {
                self.state = FlushState::Scheduled;
                self.window_start = Some(now);
                self.deadline = Some(if urgent { now } else { now + self.debounce });
            }
            FlushState::Scheduled => {
                if urgent {
                    self.deadline = Some(now);
                    return;
                }
                let cap = self.window_start.unwrap_or(now) + self.debounce * WINDOW_CAP_FACTOR;
                let extended = now + self.debounce;
                self.deadline = Some(extended.min(cap));
            }
            FlushState::Flushing => {
                // The running flush snapshotted its ids; these wait for the
                // next cycle, scheduled in complete_flush.
            }
        }
    }

    /// True when a scheduled flush should fire.
    pub fn due(&self, now: Instant) -> bool {
        self.state == FlushState::Scheduled && self.deadline.map_or(false, |d| now >= d)
    }

    /// Transitions to Flushing and hands the driver the ids to export.
    /// Returns None if nothing is due.
    pub fn begin_flush(&mut self, now: Instant) -> Option<Vec<String>> {
        if !self.due(now) {
            return None;
        }
        self.state = FlushState::Flushing;
        self.deadline = None;
        self.window_start = None;
        let ids: Vec<String> = std::mem::take(&mut self.pending).into_iter().collect();
        Some(ids)
    }

    /// The flush wrote and recorded the ledger hash. If marks arrived while
    /// flushing, the next cycle is scheduled.
    pub fn complete_flush(&mut self, now: Instant) {
        if self.pending.is_empty() {
            self.state = FlushState::Idle;
        } else {
            self.state = FlushState::Scheduled;
            self.window_start = Some(now);
            self.deadline = Some(now + self.debounce);
        }
    }

    /// The flush failed; its ids stay dirty and a retry is scheduled.
    pub fn fail_flush(&mut self, ids: Vec<String>, now: Instant) {
        self.pending.extend(ids);
        self.state = FlushState::Scheduled;
        self.window_start = Some(now);
        self.deadline = Some(now + self.debounce);
    }

    /// Shutdown drain: hands back whatever is pending for one final
    /// synchronous flush and resets to Idle. The only path where a flush may
    /// block user-visible exit.
    pub fn drain(&mut self) -> Vec<String> {
        self.state = FlushState::Idle;
        self.deadline = None;
        self.window_start = None;
        std::mem::take(&mut self.pending).into_iter().collect()
    }
}

impl Default for FlushScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn rapid_marks_collapse_to_one_flush() {
        let mut s = FlushScheduler::new(Duration::from_secs(5));
        let t0 = Instant::now();

        // create, update, update within 200 ms.
        s.mark_dirty("bd-1", false, t0);
        s.mark_dirty("bd-1", false, t0 + 100 * MS);
        s.mark_dirty("bd-1", false, t0 + 200 * MS);

        assert_eq!(s.state(), FlushState::Scheduled);
        assert!(!s.due(t0 + Duration::from_secs(5)));
        // One flush fires once the extended debounce elapses.
        let fire_at = t0 + 200 * MS + Duration::from_secs(5);
        assert!(s.due(fire_at));
        let ids = s.begin_flush(fire_at).unwrap();
        assert_eq!(ids, vec!["bd-1".to_string()]);

        s.complete_flush(fire_at);
        assert_eq!(s.state(), FlushState::Idle);
        assert!(s.begin_flush(fire_at + Duration::from_secs(60)).is_none());
    }

    #[test]
    fn urgent_collapses_the_delay() {
        let mut s = FlushScheduler::new(Duration::from_secs(5));
        let t0 = Instant::now();
        s.mark_dirty("bd-1", true, t0);
        assert!(s.due(t0));
    }

    #[test]
    fn window_extension_is_capped() {
        let debounce = Duration::from_secs(5);
        let mut s = FlushScheduler::new(debounce);
        let t0 = Instant::now();
        let cap = t0 + debounce * 4;

        // A writer that never stops marking cannot defer the flush forever.
        let mut now = t0;
        for n in 0..100 {
            s.mark_dirty(&format!("bd-{}", n), false, now);
            now += Duration::from_secs(4);
            if now >= cap {
                break;
            }
        }
        assert!(s.due(cap));
    }

    #[test]
    fn marks_while_flushing_schedule_the_next_cycle() {
        let mut s = FlushScheduler::new(Duration::from_secs(5));
        let t0 = Instant::now();
        s.mark_dirty("bd-1", true, t0);
        let ids = s.begin_flush(t0).unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(s.state(), FlushState::Flushing);

        s.mark_dirty("bd-2", false, t0 + MS);
        s.complete_flush(t0 + 2 * MS);
        assert_eq!(s.state(), FlushState::Scheduled);
        let next = s.begin_flush(t0 + 2 * MS + Duration::from_secs(5)).unwrap();
        assert_eq!(next, vec!["bd-2".to_string()]);
    }

    #[test]
    fn failed_flush_retries_with_same_ids() {
        let mut s = FlushScheduler::new(Duration::from_secs(5));
        let t0 = Instant::now();
        s.mark_dirty("bd-1", true, t0);
        let ids = s.begin_flush(t0).unwrap();
        s.fail_flush(ids, t0);
        assert_eq!(s.state(), FlushState::Scheduled);
        let retry = s.begin_flush(t0 + Duration::from_secs(5)).unwrap();
        assert_eq!(retry, vec!["bd-1".to_string()]);
    }

    #[test]
    fn drain_returns_remainder_and_goes_idle() {
        let mut s = FlushScheduler::new(Duration::from_secs(5));
        let t0 = Instant::now();
        s.mark_dirty("bd-1", false, t0);
        s.mark_dirty("bd-2", false, t0);
        let drained = s.drain();
        assert_eq!(drained, vec!["bd-1".to_string(), "bd-2".to_string()]);
        assert_eq!(s.state(), FlushState::Idle);
        assert_eq!(s.pending_len(), 0);
    }
}
