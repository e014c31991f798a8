use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tracing::debug;

use crate::config::{AckMode, ContainerProperties};
use crate::types::{OffsetAndMetadata, TopicPartition};

/// Offset bookkeeping for one consumer: pending commits, last successful
/// commits, position snapshots, and commits retained across a rebalance.
///
/// All offsets stored here are commit offsets, i.e. `record.offset + 1`.
/// The pending entry for a partition only ever advances; it is reset by an
/// explicit seek or a revocation, never by a lower ack.
pub(crate) struct OffsetLedger {
    pending: HashMap<TopicPartition, OffsetAndMetadata>,
    last_committed: HashMap<TopicPartition, i64>,
    saved_positions: HashMap<TopicPartition, i64>,
    retained: HashMap<TopicPartition, OffsetAndMetadata>,
    count_since_commit: u32,
    last_commit_at: Instant,
}

impl OffsetLedger {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            last_committed: HashMap::new(),
            saved_positions: HashMap::new(),
            retained: HashMap::new(),
            count_since_commit: 0,
            last_commit_at: Instant::now(),
        }
    }

    /// Record a handled record: pending commit becomes `offset + 1` unless a
    /// higher commit is already pending.
    pub fn add_record(&mut self, tp: &TopicPartition, record_offset: i64) {
        let commit = record_offset + 1;
        match self.pending.get_mut(tp) {
            Some(existing) if existing.offset() >= commit => {}
            Some(existing) => *existing = OffsetAndMetadata::new(commit),
            None => {
                self.pending.insert(tp.clone(), OffsetAndMetadata::new(commit));
            }
        }
        self.count_since_commit += 1;
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_count(&self) -> u32 {
        self.count_since_commit
    }

    pub fn pending_offset(&self, tp: &TopicPartition) -> Option<i64> {
        self.pending.get(tp).map(|o| o.offset())
    }

    /// Whether the active ack mode calls for a commit now. Manual modes
    /// commit whenever acks arrived; Record commits per record in the
    /// dispatch path and Batch at the poll boundary, so both are
    /// unconditional here when anything is pending.
    pub fn should_commit(&self, props: &ContainerProperties, now: Instant) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        let elapsed = now.duration_since(self.last_commit_at);
        match props.ack_mode {
            AckMode::Record | AckMode::Batch | AckMode::Manual | AckMode::ManualImmediate => true,
            AckMode::Time => elapsed >= props.ack_time,
            AckMode::Count => self.count_since_commit >= props.ack_count,
            AckMode::CountTime => {
                self.count_since_commit >= props.ack_count || elapsed >= props.ack_time
            }
        }
    }

    /// Take everything pending for commit; the clocks reset on commit
    /// success, not here, so a failed commit keeps its timing pressure.
    pub fn take_pending(&mut self) -> HashMap<TopicPartition, OffsetAndMetadata> {
        std::mem::take(&mut self.pending)
    }

    pub fn restore_pending(&mut self, commits: HashMap<TopicPartition, OffsetAndMetadata>) {
        for (tp, offset) in commits {
            match self.pending.get(&tp) {
                Some(existing) if existing.offset() >= offset.offset() => {}
                _ => {
                    self.pending.insert(tp, offset);
                }
            }
        }
    }

    pub fn on_commit_success(
        &mut self,
        commits: &HashMap<TopicPartition, OffsetAndMetadata>,
        now: Instant,
    ) {
        for (tp, offset) in commits {
            let slot = self.last_committed.entry(tp.clone()).or_insert(-1);
            if offset.offset() > *slot {
                *slot = offset.offset();
            }
        }
        self.count_since_commit = 0;
        self.last_commit_at = now;
    }

    pub fn last_committed(&self, tp: &TopicPartition) -> Option<i64> {
        self.last_committed.get(tp).copied()
    }

    /// Commits that failed because a rebalance was in progress; retried once
    /// the assignment stabilizes.
    pub fn retain_for_rebalance(&mut self, commits: HashMap<TopicPartition, OffsetAndMetadata>) {
        for (tp, offset) in commits {
            match self.retained.get(&tp) {
                Some(existing) if existing.offset() >= offset.offset() => {}
                _ => {
                    self.retained.insert(tp, offset);
                }
            }
        }
    }

    pub fn has_retained(&self) -> bool {
        !self.retained.is_empty()
    }

    /// Drain retained commits, keeping only partitions we still own.
    pub fn take_retained_for(
        &mut self,
        still_owned: &HashSet<TopicPartition>,
    ) -> HashMap<TopicPartition, OffsetAndMetadata> {
        let retained = std::mem::take(&mut self.retained);
        let (keep, drop): (HashMap<_, _>, HashMap<_, _>) = retained
            .into_iter()
            .partition(|(tp, _)| still_owned.contains(tp));
        if !drop.is_empty() {
            debug!(dropped = drop.len(), "dropping retained commits for partitions no longer owned");
        }
        keep
    }

    /// Snapshot positions right before a listener invocation, for seek
    /// detection in the fix-tx-offsets pass.
    pub fn save_positions(&mut self, positions: HashMap<TopicPartition, i64>) {
        self.saved_positions = positions;
    }

    /// Partitions whose position moved past the last commit with no
    /// intervening seek: candidates for a transactional offset re-send.
    pub fn fix_tx_candidates(
        &self,
        positions: &HashMap<TopicPartition, i64>,
    ) -> Vec<(TopicPartition, i64)> {
        positions
            .iter()
            .filter_map(|(tp, position)| {
                let committed = self.last_committed.get(tp)?;
                if position > committed && self.saved_positions.get(tp) == Some(position) {
                    Some((tp.clone(), *position))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Revocation cleanup: pending, snapshots and commit history for these
    /// partitions are dropped (retained commits survive; they are filtered
    /// against the next stable assignment instead).
    pub fn remove_partitions(&mut self, partitions: &[TopicPartition]) {
        for tp in partitions {
            self.pending.remove(tp);
            self.last_committed.remove(tp);
            self.saved_positions.remove(tp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tp(p: i32) -> TopicPartition {
        TopicPartition::new("events", p)
    }

    #[test]
    fn pending_commit_is_offset_plus_one() {
        let mut ledger = OffsetLedger::new();
        ledger.add_record(&tp(0), 41);
        assert_eq!(ledger.pending_offset(&tp(0)), Some(42));
    }

    #[test]
    fn pending_commit_never_regresses() {
        let mut ledger = OffsetLedger::new();
        ledger.add_record(&tp(0), 50);
        ledger.add_record(&tp(0), 40);
        assert_eq!(ledger.pending_offset(&tp(0)), Some(51));
    }

    #[test]
    fn take_and_restore_pending_keeps_highest() {
        let mut ledger = OffsetLedger::new();
        ledger.add_record(&tp(0), 10);
        let taken = ledger.take_pending();
        assert!(!ledger.has_pending());

        ledger.add_record(&tp(0), 20);
        ledger.restore_pending(taken);
        assert_eq!(ledger.pending_offset(&tp(0)), Some(21));
    }

    #[test]
    fn time_mode_waits_for_interval() {
        let mut props = ContainerProperties::default().with_ack_mode(AckMode::Time);
        props.ack_time = Duration::from_secs(5);

        let mut ledger = OffsetLedger::new();
        let start = Instant::now();
        ledger.last_commit_at = start;
        ledger.add_record(&tp(0), 1);

        assert!(!ledger.should_commit(&props, start + Duration::from_secs(2)));
        assert!(ledger.should_commit(&props, start + Duration::from_secs(5)));
    }

    #[test]
    fn count_mode_triggers_on_count() {
        let mut props = ContainerProperties::default().with_ack_mode(AckMode::Count);
        props.ack_count = 3;

        let mut ledger = OffsetLedger::new();
        let now = Instant::now();
        ledger.add_record(&tp(0), 1);
        ledger.add_record(&tp(0), 2);
        assert!(!ledger.should_commit(&props, now));
        ledger.add_record(&tp(0), 3);
        assert!(ledger.should_commit(&props, now));
    }

    #[test]
    fn count_time_triggers_on_either() {
        let mut props = ContainerProperties::default().with_ack_mode(AckMode::CountTime);
        props.ack_count = 100;
        props.ack_time = Duration::from_secs(5);

        let mut ledger = OffsetLedger::new();
        let start = Instant::now();
        ledger.last_commit_at = start;
        ledger.add_record(&tp(0), 1);

        assert!(!ledger.should_commit(&props, start + Duration::from_secs(1)));
        assert!(ledger.should_commit(&props, start + Duration::from_secs(6)));
    }

    #[test]
    fn commit_success_resets_clocks_and_tracks_last() {
        let mut props = ContainerProperties::default().with_ack_mode(AckMode::Count);
        props.ack_count = 2;

        let mut ledger = OffsetLedger::new();
        ledger.add_record(&tp(0), 1);
        ledger.add_record(&tp(0), 2);
        let commits = ledger.take_pending();
        assert!(!commits.is_empty());

        let now = Instant::now();
        ledger.on_commit_success(&commits, now);
        assert_eq!(ledger.last_committed(&tp(0)), Some(3));
        assert_eq!(ledger.pending_count(), 0);
    }

    #[test]
    fn retained_commits_filtered_to_still_owned() {
        let mut ledger = OffsetLedger::new();
        let mut commits = HashMap::new();
        commits.insert(tp(0), OffsetAndMetadata::new(5));
        commits.insert(tp(1), OffsetAndMetadata::new(9));
        ledger.retain_for_rebalance(commits);

        let still_owned: HashSet<_> = [tp(0)].into_iter().collect();
        let replay = ledger.take_retained_for(&still_owned);
        assert_eq!(replay.len(), 1);
        assert_eq!(replay.get(&tp(0)).map(|o| o.offset()), Some(5));
        assert!(!ledger.has_retained());
    }

    #[test]
    fn fix_tx_candidates_require_unmoved_snapshot() {
        let mut ledger = OffsetLedger::new();
        let mut commits = HashMap::new();
        commits.insert(tp(0), OffsetAndMetadata::new(10));
        commits.insert(tp(1), OffsetAndMetadata::new(10));
        ledger.on_commit_success(&commits, Instant::now());

        // tp(0): position advanced and matches the snapshot -> candidate.
        // tp(1): position advanced but a seek moved it since the snapshot.
        let mut saved = HashMap::new();
        saved.insert(tp(0), 15);
        saved.insert(tp(1), 20);
        ledger.save_positions(saved);

        let mut positions = HashMap::new();
        positions.insert(tp(0), 15);
        positions.insert(tp(1), 12);

        let candidates = ledger.fix_tx_candidates(&positions);
        assert_eq!(candidates, vec![(tp(0), 15)]);
    }

    #[test]
    fn revocation_drops_partition_state() {
        let mut ledger = OffsetLedger::new();
        ledger.add_record(&tp(0), 1);
        ledger.add_record(&tp(1), 1);
        ledger.remove_partitions(&[tp(0)]);

        assert_eq!(ledger.pending_offset(&tp(0)), None);
        assert_eq!(ledger.pending_offset(&tp(1)), Some(2));
    }
}
