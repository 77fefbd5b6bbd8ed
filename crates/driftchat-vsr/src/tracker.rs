//! Quorum and timeout bookkeeping.
//!
//! Three small trackers, each owning one counting problem:
//! [`PrepareTracker`] counts `PrepareOk` votes per in-flight op,
//! [`TimeoutTracker`] watches for primary silence on backups, and
//! [`VoteAccumulator`] / [`Election`] count view-change votes and log
//! states. All of them deduplicate by replica so a chatty peer counts
//! once.

use driftchat_types::{OpNumber, ReplicaId, ViewNumber, CLUSTER_SIZE, QUORUM};

use crate::message::LogSummary;

/// Per-op `PrepareOk` accounting on the primary.
#[derive(Debug, Clone)]
pub struct PrepareTracker {
    op: OpNumber,
    prepare_ok_from: [bool; CLUSTER_SIZE as usize],
    count: u8,
    /// When the op was accepted, for the prepare latency histogram.
    started_at_us: u64,
}

impl PrepareTracker {
    /// Creates a tracker with the primary's own vote already counted.
    pub fn new(op: OpNumber, primary: ReplicaId, now_us: u64) -> Self {
        let mut tracker = Self {
            op,
            prepare_ok_from: [false; CLUSTER_SIZE as usize],
            count: 0,
            started_at_us: now_us,
        };
        tracker.record(primary);
        tracker
    }

    pub fn op(&self) -> OpNumber {
        self.op
    }

    pub fn started_at_us(&self) -> u64 {
        self.started_at_us
    }

    /// Records a vote; duplicate votes from the same replica are
    /// ignored. Returns true if the vote was new.
    pub fn record(&mut self, from: ReplicaId) -> bool {
        let slot = &mut self.prepare_ok_from[from.as_usize()];
        if *slot {
            return false;
        }
        *slot = true;
        self.count += 1;
        true
    }

    pub fn count(&self) -> u8 {
        self.count
    }

    pub fn has_quorum(&self) -> bool {
        usize::from(self.count) >= QUORUM
    }
}

/// Primary-silence detection on backups.
///
/// A replica that has never recorded a prepare does not time out; a
/// freshly started cluster with no traffic must not elect in a storm.
#[derive(Debug, Clone, Default)]
pub struct TimeoutTracker {
    last_prepare_time_us: Option<u64>,
}

impl TimeoutTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records evidence of a live primary.
    pub fn record_prepare(&mut self, now_us: u64) {
        self.last_prepare_time_us = Some(now_us);
    }

    /// True iff a prepare was ever recorded and the timeout has since
    /// elapsed.
    pub fn has_timed_out(&self, now_us: u64, prepare_timeout_us: u64) -> bool {
        match self.last_prepare_time_us {
            Some(last) => now_us.saturating_sub(last) >= prepare_timeout_us,
            None => false,
        }
    }
}

/// `StartViewChange` vote accounting for one pending view.
#[derive(Debug, Clone)]
pub struct VoteAccumulator {
    view: ViewNumber,
    votes: [bool; CLUSTER_SIZE as usize],
    count: u8,
}

impl VoteAccumulator {
    pub fn new(view: ViewNumber) -> Self {
        Self {
            view,
            votes: [false; CLUSTER_SIZE as usize],
            count: 0,
        }
    }

    pub fn view(&self) -> ViewNumber {
        self.view
    }

    /// Records a vote, deduplicated per replica.
    pub fn record(&mut self, from: ReplicaId) -> bool {
        let slot = &mut self.votes[from.as_usize()];
        if *slot {
            return false;
        }
        *slot = true;
        self.count += 1;
        true
    }

    pub fn count(&self) -> u8 {
        self.count
    }

    pub fn has_quorum(&self) -> bool {
        usize::from(self.count) >= QUORUM
    }
}

/// `DoViewChange` log-state collection at the prospective primary.
#[derive(Debug, Clone)]
pub struct Election {
    view: ViewNumber,
    log_states: [Option<LogSummary>; CLUSTER_SIZE as usize],
    count: u8,
    started_at_us: u64,
}

impl Election {
    pub fn new(view: ViewNumber, now_us: u64) -> Self {
        Self {
            view,
            log_states: [None, None, None],
            count: 0,
            started_at_us: now_us,
        }
    }

    pub fn view(&self) -> ViewNumber {
        self.view
    }

    pub fn started_at_us(&self) -> u64 {
        self.started_at_us
    }

    /// Records a log state, deduplicated per sender.
    pub fn record(&mut self, from: ReplicaId, summary: LogSummary) -> bool {
        let slot = &mut self.log_states[from.as_usize()];
        if slot.is_some() {
            return false;
        }
        *slot = Some(summary);
        self.count += 1;
        true
    }

    pub fn count(&self) -> u8 {
        self.count
    }

    pub fn has_quorum(&self) -> bool {
        usize::from(self.count) >= QUORUM
    }

    /// Selects the authoritative log state: the maximum by
    /// `(last_op, commit_num)`.
    ///
    /// States with equal `last_op` agree on the committed prefix, so
    /// preferring the greater `commit_num` is both safe and
    /// deterministic; fully equal pairs are interchangeable.
    pub fn merged(&self) -> Option<&LogSummary> {
        self.log_states
            .iter()
            .flatten()
            .max_by_key(|s| (s.last_op, s.commit_num))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftchat_types::CommitNumber;

    #[test]
    fn prepare_tracker_counts_distinct_voters() {
        let mut t = PrepareTracker::new(OpNumber::new(1), ReplicaId::new(0), 0);
        assert_eq!(t.count(), 1);
        assert!(!t.has_quorum());

        // Duplicate self-vote is ignored.
        assert!(!t.record(ReplicaId::new(0)));
        assert_eq!(t.count(), 1);

        assert!(t.record(ReplicaId::new(1)));
        assert!(t.has_quorum());

        assert!(!t.record(ReplicaId::new(1)));
        assert_eq!(t.count(), 2);
    }

    #[test]
    fn timeout_requires_prior_prepare() {
        let t = TimeoutTracker::new();
        assert!(!t.has_timed_out(1_000_000, 50_000));

        let mut t = TimeoutTracker::new();
        t.record_prepare(1_000);
        assert!(!t.has_timed_out(50_999, 50_000));
        assert!(t.has_timed_out(51_000, 50_000));
    }

    #[test]
    fn timeout_resets_on_new_prepare() {
        let mut t = TimeoutTracker::new();
        t.record_prepare(1_000);
        t.record_prepare(60_000);
        assert!(!t.has_timed_out(100_000, 50_000));
        assert!(t.has_timed_out(110_000, 50_000));
    }

    #[test]
    fn vote_accumulator_quorum() {
        let mut v = VoteAccumulator::new(ViewNumber::new(1));
        assert!(v.record(ReplicaId::new(1)));
        assert!(!v.has_quorum());
        assert!(!v.record(ReplicaId::new(1)));
        assert!(v.record(ReplicaId::new(2)));
        assert!(v.has_quorum());
    }

    fn summary(last_op: u64, commit: u64) -> LogSummary {
        LogSummary::new(OpNumber::new(last_op), CommitNumber::new(commit), Vec::new())
    }

    #[test]
    fn election_merges_by_last_op_then_commit() {
        // Three reported states; the highest op wins regardless of the
        // reporters' commit numbers.
        let mut e = Election::new(ViewNumber::new(1), 0);
        e.record(ReplicaId::new(0), summary(5, 3));
        e.record(ReplicaId::new(1), summary(7, 5));
        e.record(ReplicaId::new(2), summary(6, 6));

        let merged = e.merged().expect("quorum");
        assert_eq!(merged.last_op, OpNumber::new(7));
        assert_eq!(merged.commit_num, CommitNumber::new(5));
    }

    #[test]
    fn election_tie_break_prefers_higher_commit() {
        let mut e = Election::new(ViewNumber::new(1), 0);
        e.record(ReplicaId::new(1), summary(7, 3));
        e.record(ReplicaId::new(2), summary(7, 5));

        let merged = e.merged().expect("quorum");
        assert_eq!(merged.commit_num, CommitNumber::new(5));
    }

    #[test]
    fn election_dedups_per_sender() {
        let mut e = Election::new(ViewNumber::new(1), 0);
        assert!(e.record(ReplicaId::new(1), summary(7, 3)));
        assert!(!e.record(ReplicaId::new(1), summary(9, 9)));
        assert_eq!(e.count(), 1);
        // The first record wins; later duplicates do not replace it.
        assert_eq!(e.merged().unwrap().last_op, OpNumber::new(7));
    }
}
