use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use rdkafka::consumer::Consumer;
use rdkafka::message::OwnedMessage;
use rdkafka::{Message, Offset, TopicPartitionList};
use tracing::{error, info, warn};

use crate::errors::ListenerError;
use crate::listener::ListenerContext;
use crate::rebalance::ListenerClient;
use crate::types::{TopicPartition, TopicPartitionOffset};

const SEEK_TIMEOUT: Duration = Duration::from_secs(10);

/// Pluggable policy for listener failures.
///
/// The loop consults `seeks_after_handling()` to decide which entry point to
/// use: seek-style handlers get the failing record plus the unconsumed tail
/// (`handle_remaining`) and are expected to reposition the consumer; other
/// handlers get just the failing record (`handle_one`) and the loop retains
/// the tail when they report the record as unrecovered.
pub trait ErrorHandler: Send + Sync {
    /// Handle a single failed record. Return `true` when the record was
    /// recovered and the loop may commit through it.
    fn handle_one(
        &self,
        error: &ListenerError,
        record: &OwnedMessage,
        _client: &ListenerClient,
        ctx: &ListenerContext,
    ) -> bool {
        error!(
            group = ctx.group_id(),
            topic = record.topic(),
            partition = record.partition(),
            offset = record.offset(),
            %error,
            "listener failed; record not recovered"
        );
        false
    }

    /// Handle the failing record and everything not yet consumed from the
    /// poll. Implementations seek so the records are redelivered.
    fn handle_remaining(
        &self,
        error: &ListenerError,
        records: &[OwnedMessage],
        client: &ListenerClient,
        ctx: &ListenerContext,
    );

    /// Handle a failed batch; returns the records to retain for redelivery
    /// (empty when the batch was recovered).
    fn handle_batch(
        &self,
        error: &ListenerError,
        records: Vec<OwnedMessage>,
        _client: &ListenerClient,
        ctx: &ListenerContext,
    ) -> Vec<OwnedMessage> {
        error!(
            group = ctx.group_id(),
            size = records.len(),
            %error,
            "batch listener failed; retaining batch"
        );
        records
    }

    /// Whether the loop should commit the offset of records this handler
    /// reports as recovered.
    fn is_ack_after_handle(&self) -> bool {
        true
    }

    /// Whether this handler repositions the consumer itself (the loop then
    /// skips record retention).
    fn seeks_after_handling(&self) -> bool {
        false
    }

    /// Invoked from the rebalance listener after assignment; the callback
    /// pauses the given partitions before the next poll.
    fn on_partitions_assigned(
        &self,
        _client: &ListenerClient,
        _partitions: &[TopicPartition],
        _pause: &mut dyn FnMut(&[TopicPartition]),
    ) {
    }

    /// 1-based attempt number for the next delivery of this offset.
    fn delivery_attempt(&self, _tpo: &TopicPartitionOffset) -> i32 {
        1
    }
}

/// Invoked with the unprocessed tail after a transaction rolls back.
pub trait AfterRollbackProcessor: Send + Sync {
    /// `recoverable` is false when the same batch will inevitably fail again
    /// (e.g. the error was a fencing).
    fn process(
        &self,
        records: &[OwnedMessage],
        client: &ListenerClient,
        error: &ListenerError,
        recoverable: bool,
    );

    /// When true, the processor runs inside a fresh transaction.
    fn is_process_in_transaction(&self) -> bool {
        false
    }
}

pub type Recoverer = Box<dyn Fn(&OwnedMessage, &ListenerError) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct FixedBackOff {
    pub interval: Duration,
    pub max_retries: u32,
}

impl FixedBackOff {
    pub const fn new(interval: Duration, max_retries: u32) -> Self {
        Self {
            interval,
            max_retries,
        }
    }
}

impl Default for FixedBackOff {
    fn default() -> Self {
        // matches the classic 9-retries-then-recover default
        Self::new(Duration::ZERO, 9)
    }
}

#[derive(Debug, Clone)]
struct Failure {
    offset: i64,
    attempts: u32,
}

/// Per-partition failure bookkeeping. A failure at a new offset resets the
/// count, so the map stays bounded by the assignment size.
#[derive(Default)]
struct FailureTracker {
    failures: Mutex<HashMap<TopicPartition, Failure>>,
}

impl FailureTracker {
    /// Record a failure and return the attempt count so far (1 for first).
    fn record_failure(&self, tp: &TopicPartition, offset: i64) -> u32 {
        let mut failures = self.failures.lock().unwrap();
        let failure = failures
            .entry(tp.clone())
            .and_modify(|f| {
                if f.offset != offset {
                    f.offset = offset;
                    f.attempts = 0;
                }
            })
            .or_insert(Failure {
                offset,
                attempts: 0,
            });
        failure.attempts += 1;
        failure.attempts
    }

    fn clear(&self, tp: &TopicPartition) {
        self.failures.lock().unwrap().remove(tp);
    }

    fn attempts(&self, tp: &TopicPartition, offset: i64) -> u32 {
        self.failures
            .lock()
            .unwrap()
            .get(tp)
            .filter(|f| f.offset == offset)
            .map(|f| f.attempts)
            .unwrap_or(0)
    }
}

/// Seek each partition back to its earliest offset among `records` so they
/// are redelivered on the next poll.
pub(crate) fn seek_to_earliest(client: &ListenerClient, records: &[OwnedMessage]) {
    let mut earliest: HashMap<TopicPartition, i64> = HashMap::new();
    for record in records {
        let tp = TopicPartition::new(record.topic(), record.partition());
        let slot = earliest.entry(tp).or_insert(record.offset());
        if record.offset() < *slot {
            *slot = record.offset();
        }
    }
    for (tp, offset) in earliest {
        if let Err(e) = client.seek(tp.topic(), tp.partition(), Offset::Offset(offset), SEEK_TIMEOUT)
        {
            warn!(partition = %tp, offset, "seek back for redelivery failed: {e}");
        }
    }
}

/// Seek-and-retry with a fixed backoff, then recover.
///
/// While attempts remain, the failing record and the tail are sought back so
/// the whole run is redelivered; once retries are exhausted the failing
/// record is passed to the recoverer and only the tail is replayed.
pub struct DefaultErrorHandler {
    backoff: FixedBackOff,
    tracker: FailureTracker,
    recoverer: Option<Recoverer>,
    /// Commit the recovered record's offset through the consumer.
    commit_recovered: bool,
    ack_after_handle: bool,
}

impl DefaultErrorHandler {
    pub fn new(backoff: FixedBackOff) -> Self {
        Self {
            backoff,
            tracker: FailureTracker::default(),
            recoverer: None,
            commit_recovered: false,
            ack_after_handle: true,
        }
    }

    pub fn with_recoverer(mut self, recoverer: Recoverer) -> Self {
        self.recoverer = Some(recoverer);
        self
    }

    pub fn with_commit_recovered(mut self, commit_recovered: bool) -> Self {
        self.commit_recovered = commit_recovered;
        self
    }

    pub fn with_ack_after_handle(mut self, ack_after_handle: bool) -> Self {
        self.ack_after_handle = ack_after_handle;
        self
    }

    fn exhausted(&self, attempts: u32) -> bool {
        attempts > self.backoff.max_retries
    }

    fn recover(&self, record: &OwnedMessage, error: &ListenerError) {
        match &self.recoverer {
            Some(recoverer) => recoverer(record, error),
            None => error!(
                topic = record.topic(),
                partition = record.partition(),
                offset = record.offset(),
                %error,
                "retries exhausted; record dropped"
            ),
        }
    }

    fn backoff_sleep(&self) {
        if !self.backoff.interval.is_zero() {
            std::thread::sleep(self.backoff.interval);
        }
    }
}

impl Default for DefaultErrorHandler {
    fn default() -> Self {
        Self::new(FixedBackOff::default())
    }
}

impl ErrorHandler for DefaultErrorHandler {
    fn handle_one(
        &self,
        error: &ListenerError,
        record: &OwnedMessage,
        _client: &ListenerClient,
        _ctx: &ListenerContext,
    ) -> bool {
        let tp = TopicPartition::new(record.topic(), record.partition());
        let attempts = self.tracker.record_failure(&tp, record.offset());
        if self.exhausted(attempts) {
            self.recover(record, error);
            self.tracker.clear(&tp);
            true
        } else {
            self.backoff_sleep();
            false
        }
    }

    fn handle_remaining(
        &self,
        error: &ListenerError,
        records: &[OwnedMessage],
        client: &ListenerClient,
        ctx: &ListenerContext,
    ) {
        let Some(failed) = records.first() else {
            return;
        };
        let tp = TopicPartition::new(failed.topic(), failed.partition());
        let attempts = self.tracker.record_failure(&tp, failed.offset());

        if self.exhausted(attempts) {
            self.recover(failed, error);
            self.tracker.clear(&tp);
            if self.commit_recovered {
                let mut tpl = TopicPartitionList::new();
                if tpl
                    .add_partition_offset(
                        tp.topic(),
                        tp.partition(),
                        Offset::Offset(failed.offset() + 1),
                    )
                    .is_ok()
                {
                    if let Err(e) =
                        client.commit(&tpl, rdkafka::consumer::CommitMode::Sync)
                    {
                        warn!(partition = %tp, "commit of recovered record failed: {e}");
                    }
                }
            }
            seek_to_earliest(client, &records[1..]);
        } else {
            info!(
                group = ctx.group_id(),
                partition = %tp,
                offset = failed.offset(),
                attempts,
                "seeking back for retry"
            );
            seek_to_earliest(client, records);
            self.backoff_sleep();
        }
    }

    fn handle_batch(
        &self,
        error: &ListenerError,
        records: Vec<OwnedMessage>,
        client: &ListenerClient,
        _ctx: &ListenerContext,
    ) -> Vec<OwnedMessage> {
        let Some(first) = records.first() else {
            return records;
        };
        let tp = TopicPartition::new(first.topic(), first.partition());
        let attempts = self.tracker.record_failure(&tp, first.offset());

        if self.exhausted(attempts) {
            for record in &records {
                self.recover(record, error);
            }
            self.tracker.clear(&tp);
            Vec::new()
        } else {
            // reposition so the broker redelivers the whole batch
            seek_to_earliest(client, &records);
            self.backoff_sleep();
            records
        }
    }

    fn is_ack_after_handle(&self) -> bool {
        self.ack_after_handle
    }

    fn seeks_after_handling(&self) -> bool {
        true
    }

    fn delivery_attempt(&self, tpo: &TopicPartitionOffset) -> i32 {
        self.tracker.attempts(tpo.partition(), tpo.offset()) as i32 + 1
    }
}

/// Default transactional rollback policy: seek everything back while retries
/// remain, then recover the head and replay only the tail.
pub struct DefaultAfterRollbackProcessor {
    backoff: FixedBackOff,
    tracker: FailureTracker,
    recoverer: Option<Recoverer>,
    process_in_transaction: bool,
}

impl DefaultAfterRollbackProcessor {
    pub fn new(backoff: FixedBackOff) -> Self {
        Self {
            backoff,
            tracker: FailureTracker::default(),
            recoverer: None,
            process_in_transaction: false,
        }
    }

    pub fn with_recoverer(mut self, recoverer: Recoverer) -> Self {
        self.recoverer = Some(recoverer);
        self
    }

    pub fn with_process_in_transaction(mut self, in_transaction: bool) -> Self {
        self.process_in_transaction = in_transaction;
        self
    }
}

impl Default for DefaultAfterRollbackProcessor {
    fn default() -> Self {
        Self::new(FixedBackOff::default())
    }
}

impl AfterRollbackProcessor for DefaultAfterRollbackProcessor {
    fn process(
        &self,
        records: &[OwnedMessage],
        client: &ListenerClient,
        error: &ListenerError,
        recoverable: bool,
    ) {
        let Some(failed) = records.first() else {
            return;
        };
        let tp = TopicPartition::new(failed.topic(), failed.partition());
        let attempts = self.tracker.record_failure(&tp, failed.offset());

        if recoverable && attempts > self.backoff.max_retries {
            match &self.recoverer {
                Some(recoverer) => recoverer(failed, error),
                None => error!(
                    partition = %tp,
                    offset = failed.offset(),
                    %error,
                    "rollback retries exhausted; record dropped"
                ),
            }
            self.tracker.clear(&tp);
            seek_to_earliest(client, &records[1..]);
        } else {
            seek_to_earliest(client, records);
            if !self.backoff.interval.is_zero() {
                std::thread::sleep(self.backoff.interval);
            }
        }
    }

    fn is_process_in_transaction(&self) -> bool {
        self.process_in_transaction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tp(p: i32) -> TopicPartition {
        TopicPartition::new("events", p)
    }

    #[test]
    fn failure_tracker_counts_per_offset() {
        let tracker = FailureTracker::default();
        assert_eq!(tracker.record_failure(&tp(0), 5), 1);
        assert_eq!(tracker.record_failure(&tp(0), 5), 2);
        // a different offset resets the count
        assert_eq!(tracker.record_failure(&tp(0), 6), 1);
        // partitions are independent
        assert_eq!(tracker.record_failure(&tp(1), 5), 1);
    }

    #[test]
    fn failure_tracker_clear() {
        let tracker = FailureTracker::default();
        tracker.record_failure(&tp(0), 5);
        tracker.clear(&tp(0));
        assert_eq!(tracker.attempts(&tp(0), 5), 0);
    }

    #[test]
    fn delivery_attempt_reflects_failures() {
        let handler = DefaultErrorHandler::new(FixedBackOff::new(Duration::ZERO, 3));
        let tpo = TopicPartitionOffset::new(tp(0), 5);
        assert_eq!(handler.delivery_attempt(&tpo), 1);
        handler.tracker.record_failure(&tp(0), 5);
        assert_eq!(handler.delivery_attempt(&tpo), 2);
    }

    #[test]
    fn exhaustion_is_after_max_retries() {
        let handler = DefaultErrorHandler::new(FixedBackOff::new(Duration::ZERO, 2));
        assert!(!handler.exhausted(1));
        assert!(!handler.exhausted(2));
        assert!(handler.exhausted(3));
    }

    #[test]
    fn default_handler_seeks_after_handling() {
        let handler = DefaultErrorHandler::default();
        assert!(handler.seeks_after_handling());
        assert!(handler.is_ack_after_handle());
    }
}
