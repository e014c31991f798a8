use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use crate::types::TopicPartition;

/// Reconciles the pause sources against what has actually been applied to the
/// client: user pause (whole consumer or partitions), async-ack backpressure,
/// nack sleep, and pending-records retention.
///
/// Pauses are applied before poll; resumes after dispatch, and only while no
/// retention is active. Lives inside the shared sync mutex together with the
/// out-of-order table.
#[derive(Default)]
pub(crate) struct PauseController {
    pause_requested: bool,
    consumer_paused: bool,
    requested_partitions: BTreeSet<TopicPartition>,
    applied_partitions: BTreeSet<TopicPartition>,
    async_backpressure: bool,
    nack_sleep_until: Option<Instant>,
    nack_paused: BTreeSet<TopicPartition>,
    retention_partitions: BTreeSet<TopicPartition>,
}

impl PauseController {
    pub fn request_pause(&mut self) {
        self.pause_requested = true;
    }

    pub fn request_resume(&mut self) {
        self.pause_requested = false;
    }

    pub fn is_pause_requested(&self) -> bool {
        self.pause_requested
    }

    pub fn request_pause_partitions(&mut self, partitions: &[TopicPartition]) {
        self.requested_partitions.extend(partitions.iter().cloned());
    }

    pub fn request_resume_partitions(&mut self, partitions: &[TopicPartition]) {
        for tp in partitions {
            self.requested_partitions.remove(tp);
        }
    }

    pub fn is_partition_pause_requested(&self, tp: &TopicPartition) -> bool {
        self.requested_partitions.contains(tp)
    }

    pub fn set_async_backpressure(&mut self, backpressure: bool) {
        self.async_backpressure = backpressure;
    }

    pub fn async_backpressure(&self) -> bool {
        self.async_backpressure
    }

    pub fn set_retention_partitions(
        &mut self,
        partitions: impl IntoIterator<Item = TopicPartition>,
    ) {
        self.retention_partitions.extend(partitions);
    }

    pub fn clear_retention(&mut self) {
        self.retention_partitions.clear();
    }

    pub fn remove_retention_partitions(&mut self, partitions: &[TopicPartition]) {
        for tp in partitions {
            self.retention_partitions.remove(tp);
        }
    }

    pub fn has_retention(&self) -> bool {
        !self.retention_partitions.is_empty()
    }

    pub fn retention_partitions(&self) -> Vec<TopicPartition> {
        self.retention_partitions.iter().cloned().collect()
    }

    /// Start a nack sleep: everything assigned and not already paused is
    /// paused until `until`. Returns the partitions to pause at the client;
    /// call `rollback_nack` with the same set if that client call fails
    /// (rebalance in progress).
    pub fn start_nack_sleep(
        &mut self,
        until: Instant,
        assigned: &[TopicPartition],
    ) -> Vec<TopicPartition> {
        self.nack_sleep_until = Some(until);
        let newly: Vec<TopicPartition> = assigned
            .iter()
            .filter(|tp| !self.applied_partitions.contains(*tp))
            .cloned()
            .collect();
        self.nack_paused.extend(newly.iter().cloned());
        newly
    }

    pub fn rollback_nack(&mut self, partitions: &[TopicPartition]) {
        for tp in partitions {
            self.nack_paused.remove(tp);
        }
        if self.nack_paused.is_empty() {
            self.nack_sleep_until = None;
        }
    }

    pub fn nack_sleep_active(&self) -> bool {
        self.nack_sleep_until.is_some()
    }

    pub fn nack_wakeup_due(&self, now: Instant) -> bool {
        self.nack_sleep_until.map(|until| now >= until).unwrap_or(false)
    }

    pub fn remaining_nack_sleep(&self, now: Instant) -> Option<Duration> {
        self.nack_sleep_until
            .map(|until| until.saturating_duration_since(now))
    }

    /// End the nack sleep, returning the partitions that were paused for it.
    pub fn finish_nack_sleep(&mut self) -> Vec<TopicPartition> {
        self.nack_sleep_until = None;
        std::mem::take(&mut self.nack_paused).into_iter().collect()
    }

    fn consumer_pause_desired(&self) -> bool {
        self.pause_requested || self.async_backpressure
    }

    fn desired_paused(&self, assigned: &[TopicPartition]) -> BTreeSet<TopicPartition> {
        let mut desired = BTreeSet::new();
        if self.consumer_pause_desired() {
            desired.extend(assigned.iter().cloned());
        }
        for tp in assigned {
            if self.requested_partitions.contains(tp)
                || self.nack_paused.contains(tp)
                || self.retention_partitions.contains(tp)
            {
                desired.insert(tp.clone());
            }
        }
        desired
    }

    /// Partitions to pause at the client before the next poll.
    pub fn pauses_due(&self, assigned: &[TopicPartition]) -> Vec<TopicPartition> {
        self.desired_paused(assigned)
            .difference(&self.applied_partitions)
            .cloned()
            .collect()
    }

    /// Partitions to resume after dispatch. The caller must not apply these
    /// while a retention buffer is active.
    pub fn resumes_due(&self, assigned: &[TopicPartition]) -> Vec<TopicPartition> {
        let desired = self.desired_paused(assigned);
        self.applied_partitions
            .iter()
            .filter(|tp| !desired.contains(*tp) && assigned.contains(*tp))
            .cloned()
            .collect()
    }

    pub fn mark_paused(&mut self, partitions: &[TopicPartition]) {
        self.applied_partitions.extend(partitions.iter().cloned());
    }

    pub fn mark_resumed(&mut self, partitions: &[TopicPartition]) {
        for tp in partitions {
            self.applied_partitions.remove(tp);
        }
    }

    pub fn is_paused(&self, tp: &TopicPartition) -> bool {
        self.applied_partitions.contains(tp)
    }

    pub fn paused_partitions(&self) -> Vec<TopicPartition> {
        self.applied_partitions.iter().cloned().collect()
    }

    pub fn set_consumer_paused(&mut self, paused: bool) -> bool {
        let changed = self.consumer_paused != paused;
        self.consumer_paused = paused;
        changed
    }

    pub fn consumer_paused(&self) -> bool {
        self.consumer_paused
    }

    /// Whether this iteration's poll runs with everything paused (drives the
    /// shorter poll timeout).
    pub fn effectively_paused(&self, assigned: &[TopicPartition]) -> bool {
        if assigned.is_empty() {
            return false;
        }
        let desired = self.desired_paused(assigned);
        assigned.iter().all(|tp| desired.contains(tp))
    }

    /// Kafka clears client pause flags across a rebalance; forget what was
    /// applied so the next reconciliation re-pauses.
    pub fn reset_applied(&mut self) {
        self.applied_partitions.clear();
        self.consumer_paused = false;
    }

    pub fn remove_partitions(&mut self, partitions: &[TopicPartition]) {
        for tp in partitions {
            self.applied_partitions.remove(tp);
            self.nack_paused.remove(tp);
            self.retention_partitions.remove(tp);
        }
        if self.nack_paused.is_empty() && self.nack_sleep_until.is_some() {
            // every nacked partition was revoked; nothing left to wake up for
            self.nack_sleep_until = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tp(p: i32) -> TopicPartition {
        TopicPartition::new("events", p)
    }

    fn assigned() -> Vec<TopicPartition> {
        vec![tp(0), tp(1), tp(2)]
    }

    #[test]
    fn user_pause_pauses_everything() {
        let mut pause = PauseController::default();
        pause.request_pause();

        let due = pause.pauses_due(&assigned());
        assert_eq!(due.len(), 3);
        pause.mark_paused(&due);

        assert!(pause.pauses_due(&assigned()).is_empty());
        assert!(pause.effectively_paused(&assigned()));

        pause.request_resume();
        let resumes = pause.resumes_due(&assigned());
        assert_eq!(resumes.len(), 3);
    }

    #[test]
    fn partition_pause_is_scoped() {
        let mut pause = PauseController::default();
        pause.request_pause_partitions(&[tp(1)]);

        let due = pause.pauses_due(&assigned());
        assert_eq!(due, vec![tp(1)]);
        pause.mark_paused(&due);
        assert!(!pause.effectively_paused(&assigned()));

        pause.request_resume_partitions(&[tp(1)]);
        assert_eq!(pause.resumes_due(&assigned()), vec![tp(1)]);
    }

    #[test]
    fn async_backpressure_pauses_and_releases() {
        let mut pause = PauseController::default();
        pause.set_async_backpressure(true);
        let due = pause.pauses_due(&assigned());
        assert_eq!(due.len(), 3);
        pause.mark_paused(&due);

        pause.set_async_backpressure(false);
        assert_eq!(pause.resumes_due(&assigned()).len(), 3);
    }

    #[test]
    fn nack_pauses_unpaused_assignment_and_rolls_back() {
        let mut pause = PauseController::default();
        pause.request_pause_partitions(&[tp(0)]);
        let user = pause.pauses_due(&assigned());
        pause.mark_paused(&user);

        let until = Instant::now() + Duration::from_millis(200);
        let newly = pause.start_nack_sleep(until, &assigned());
        // tp(0) was already paused for the user; only the rest are added
        assert_eq!(newly, vec![tp(1), tp(2)]);

        // client pause failed mid-rebalance: roll back
        pause.rollback_nack(&newly);
        assert!(!pause.nack_sleep_active());
        assert!(pause.pauses_due(&assigned()).iter().all(|p| *p != tp(0)));
    }

    #[test]
    fn nack_wakeup_and_finish() {
        let mut pause = PauseController::default();
        let until = Instant::now() + Duration::from_millis(1);
        let newly = pause.start_nack_sleep(until, &assigned());
        pause.mark_paused(&newly);

        assert!(!pause.nack_wakeup_due(until - Duration::from_millis(1)));
        assert!(pause.nack_wakeup_due(until));

        let was_paused = pause.finish_nack_sleep();
        assert_eq!(was_paused.len(), 3);
        assert_eq!(pause.resumes_due(&assigned()).len(), 3);
    }

    #[test]
    fn retention_keeps_partition_paused() {
        let mut pause = PauseController::default();
        pause.set_retention_partitions([tp(2)]);
        let due = pause.pauses_due(&assigned());
        assert_eq!(due, vec![tp(2)]);
        pause.mark_paused(&due);

        // still desired while retained
        assert!(pause.resumes_due(&assigned()).is_empty());

        pause.clear_retention();
        assert_eq!(pause.resumes_due(&assigned()), vec![tp(2)]);
    }

    #[test]
    fn revoked_partitions_are_forgotten() {
        let mut pause = PauseController::default();
        let until = Instant::now() + Duration::from_secs(1);
        let newly = pause.start_nack_sleep(until, &[tp(0)]);
        pause.mark_paused(&newly);

        pause.remove_partitions(&[tp(0)]);
        assert!(!pause.nack_sleep_active());
        assert!(pause.paused_partitions().is_empty());
    }

    #[test]
    fn reset_applied_forces_repause() {
        let mut pause = PauseController::default();
        pause.request_pause_partitions(&[tp(0)]);
        let due = pause.pauses_due(&assigned());
        pause.mark_paused(&due);
        assert!(pause.pauses_due(&assigned()).is_empty());

        // rebalance wiped client pause flags
        pause.reset_applied();
        assert_eq!(pause.pauses_due(&assigned()), vec![tp(0)]);
    }
}
