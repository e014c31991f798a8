use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

use rdkafka::message::OwnedMessage;
use rdkafka::Message;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::config::AckMode;
use crate::errors::ListenerError;
use crate::metrics_consts::{LISTENER_DEFERRED_ACK_DEPTH, LISTENER_OUT_OF_ORDER_ACKS};
use crate::pause::PauseController;
use crate::types::TopicPartition;

/// Messages posted to the consumer thread by acknowledgement handles.
/// Offsets are record offsets; the ledger applies the +1 commit rule.
#[derive(Debug)]
pub(crate) enum AckEvent {
    Offsets {
        entries: Vec<(TopicPartition, i64)>,
        /// ManualImmediate: commit synchronously before the next poll.
        immediate: bool,
    },
    /// Failure reported off the consumer thread; drained at the top of the
    /// next poll iteration and routed through the error handler.
    AsyncFailure {
        message: Box<OwnedMessage>,
        error: String,
    },
    /// Acknowledgement misuse detected off the consumer thread; the loop
    /// treats this as fatal.
    Illegal(String),
}

/// A nack observed during an invocation; the loop reads it right after the
/// listener returns.
#[derive(Debug, Clone)]
pub(crate) struct NackRequest {
    pub partition: TopicPartition,
    pub offset: i64,
    pub sleep: Duration,
    /// For batch listeners: index of the first record to replay.
    pub batch_index: Option<usize>,
}

/// State shared between the consumer thread and acknowledgement handles.
/// One mutex guards the out-of-order table and the pause state together;
/// it is taken briefly and never nested.
pub(crate) struct SyncState {
    pub out_of_order: OutOfOrderTracker,
    pub pause: PauseController,
    pub nack: Option<NackRequest>,
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            out_of_order: OutOfOrderTracker::default(),
            pause: PauseController::default(),
            nack: None,
        }
    }
}

/// Re-sequences out-of-order completions into a monotonic commit stream.
///
/// Every polled offset is tracked in arrival order. An ack of the head emits
/// a commit for that offset; acks of later offsets are deferred until the gap
/// closes. A deferred run that closes out the whole tracked window is
/// committed through its tail so the final offsets are never stranded.
#[derive(Default)]
pub(crate) struct OutOfOrderTracker {
    pending: HashMap<TopicPartition, VecDeque<i64>>,
    deferred: HashMap<TopicPartition, Vec<i64>>,
}

impl OutOfOrderTracker {
    pub fn track_polled(&mut self, tp: &TopicPartition, offset: i64) {
        self.pending.entry(tp.clone()).or_default().push_back(offset);
    }

    /// True while any offset is awaiting acknowledgement; drives the
    /// async-ack backpressure pause.
    pub fn has_pending(&self) -> bool {
        self.pending.values().any(|offsets| !offsets.is_empty())
    }

    pub fn remove_partitions(&mut self, partitions: &[TopicPartition]) {
        for tp in partitions {
            self.pending.remove(tp);
            self.deferred.remove(tp);
        }
    }

    /// Withdraw an offset that will not be acked after all (retained for
    /// redelivery, or failed asynchronously). It re-enters via
    /// `track_polled` when the record is dispatched again.
    pub fn untrack_polled(&mut self, tp: &TopicPartition, offset: i64) {
        if let Some(pending) = self.pending.get_mut(tp) {
            pending.retain(|&o| o != offset);
            if pending.is_empty() {
                self.pending.remove(tp);
                self.deferred.remove(tp);
            }
        }
        if let Some(deferred) = self.deferred.get_mut(tp) {
            deferred.retain(|&o| o != offset);
        }
    }

    /// Ack one offset. Returns the record offset to commit through, if any.
    /// A stale ack (below the head) is a programmer error.
    pub fn ack(
        &mut self,
        tp: &TopicPartition,
        offset: i64,
    ) -> Result<Option<i64>, ListenerError> {
        let Some(pending) = self.pending.get_mut(tp) else {
            return Err(ListenerError::IllegalAck(format!(
                "ack of {offset} for untracked partition {tp}"
            )));
        };
        let Some(&head) = pending.front() else {
            return Err(ListenerError::IllegalAck(format!(
                "ack of {offset} for {tp} with nothing in flight"
            )));
        };

        if offset < head {
            return Err(ListenerError::IllegalAck(format!(
                "stale ack of {offset} for {tp}; head is {head}"
            )));
        }

        if offset > head {
            if !pending.contains(&offset) {
                return Err(ListenerError::IllegalAck(format!(
                    "ack of unknown offset {offset} for {tp}"
                )));
            }
            let deferred = self.deferred.entry(tp.clone()).or_default();
            if deferred.contains(&offset) {
                // idempotent re-ack
                return Ok(None);
            }
            deferred.push(offset);
            metrics::counter!(LISTENER_OUT_OF_ORDER_ACKS).increment(1);
            metrics::gauge!(LISTENER_DEFERRED_ACK_DEPTH).set(deferred.len() as f64);
            return Ok(None);
        }

        pending.pop_front();
        let mut commit_through = offset;

        // Fold already-acked successors out of the window. They only raise
        // the commit when they close out the window entirely; otherwise the
        // commit stays at the acked head and the next head ack advances it.
        let deferred = self.deferred.entry(tp.clone()).or_default();
        deferred.sort_unstable();
        let mut merged_tail = None;
        while let Some(&next) = pending.front() {
            if deferred.first() == Some(&next) {
                deferred.remove(0);
                pending.pop_front();
                merged_tail = Some(next);
            } else {
                break;
            }
        }
        metrics::gauge!(LISTENER_DEFERRED_ACK_DEPTH).set(deferred.len() as f64);

        if pending.is_empty() {
            if let Some(tail) = merged_tail {
                commit_through = tail;
            }
            self.pending.remove(tp);
            self.deferred.remove(tp);
        }

        Ok(Some(commit_through))
    }
}

/// What one acknowledgement handle refers to.
#[derive(Clone)]
enum AckScope {
    Record {
        message: Arc<OwnedMessage>,
    },
    /// (partition, offset) per record, in listener order.
    Batch {
        entries: Arc<Vec<(TopicPartition, i64)>>,
    },
}

/// Per-invocation bookkeeping shared between the handle and the loop.
pub(crate) struct AckState {
    acked: AtomicBool,
    partial_through: Mutex<Option<usize>>,
}

impl AckState {
    fn new() -> Self {
        Self {
            acked: AtomicBool::new(false),
            partial_through: Mutex::new(None),
        }
    }
}

/// Handle given to acknowledging listeners. Clonable and owned, so async-ack
/// handlers can move it to another thread and complete later.
#[derive(Clone)]
pub struct Acknowledgment {
    scope: AckScope,
    state: Arc<AckState>,
    sync: Arc<Mutex<SyncState>>,
    ack_tx: UnboundedSender<AckEvent>,
    ack_mode: AckMode,
    async_acks: bool,
    consumer_thread: ThreadId,
}

impl Acknowledgment {
    pub(crate) fn for_record(
        message: Arc<OwnedMessage>,
        sync: Arc<Mutex<SyncState>>,
        ack_tx: UnboundedSender<AckEvent>,
        ack_mode: AckMode,
        async_acks: bool,
        consumer_thread: ThreadId,
    ) -> Self {
        Self {
            scope: AckScope::Record { message },
            state: Arc::new(AckState::new()),
            sync,
            ack_tx,
            ack_mode,
            async_acks,
            consumer_thread,
        }
    }

    pub(crate) fn for_batch(
        entries: Vec<(TopicPartition, i64)>,
        sync: Arc<Mutex<SyncState>>,
        ack_tx: UnboundedSender<AckEvent>,
        ack_mode: AckMode,
        async_acks: bool,
        consumer_thread: ThreadId,
    ) -> Self {
        Self {
            scope: AckScope::Batch {
                entries: Arc::new(entries),
            },
            state: Arc::new(AckState::new()),
            sync,
            ack_tx,
            ack_mode,
            async_acks,
            consumer_thread,
        }
    }

    /// Whether async replies are enabled, i.e. completions may arrive out of
    /// record order and commits are re-sequenced.
    pub fn is_out_of_order_commit(&self) -> bool {
        self.async_acks
    }

    /// Acknowledge the record, or the whole batch. After a partial
    /// `acknowledge_index`, acknowledges the rest. Re-acking is a no-op.
    pub fn acknowledge(&self) -> Result<(), ListenerError> {
        if self.state.acked.swap(true, Ordering::SeqCst) {
            warn!("acknowledgment already completed; ignoring");
            return Ok(());
        }

        let entries: Vec<(TopicPartition, i64)> = match &self.scope {
            AckScope::Record { message } => vec![(
                TopicPartition::new(message.topic(), message.partition()),
                message.offset(),
            )],
            AckScope::Batch { entries } => {
                let from = self
                    .state
                    .partial_through
                    .lock()
                    .unwrap()
                    .map(|i| i + 1)
                    .unwrap_or(0);
                highest_per_partition(&entries[from.min(entries.len())..])
            }
        };

        if entries.is_empty() {
            return Ok(());
        }
        self.route(entries)
    }

    /// Commit through the i-th record of the batch. ManualImmediate only,
    /// consumer thread only; indices must be strictly increasing.
    pub fn acknowledge_index(&self, index: usize) -> Result<(), ListenerError> {
        let AckScope::Batch { entries } = &self.scope else {
            return Err(ListenerError::IllegalAck(
                "acknowledge_index requires a batch of records".into(),
            ));
        };
        if self.ack_mode != AckMode::ManualImmediate {
            return Err(ListenerError::IllegalAck(
                "acknowledge_index requires ack mode ManualImmediate".into(),
            ));
        }
        if std::thread::current().id() != self.consumer_thread {
            return Err(ListenerError::IllegalAck(
                "acknowledge_index may only be called on the consumer thread".into(),
            ));
        }
        if index >= entries.len() {
            return Err(ListenerError::IllegalAck(format!(
                "acknowledge_index {index} out of range for batch of {}",
                entries.len()
            )));
        }
        if self.state.acked.load(Ordering::SeqCst) {
            return Err(ListenerError::IllegalAck(
                "batch already fully acknowledged".into(),
            ));
        }

        let mut partial = self.state.partial_through.lock().unwrap();
        let from = match *partial {
            Some(prev) if index <= prev => {
                return Err(ListenerError::IllegalAck(format!(
                    "acknowledge_index must be strictly increasing; got {index} after {prev}"
                )));
            }
            Some(prev) => prev + 1,
            None => 0,
        };
        *partial = Some(index);
        drop(partial);

        self.route(highest_per_partition(&entries[from..=index]))
    }

    /// Negative-acknowledge this record (the remainder of the poll is
    /// replayed after `sleep`).
    pub fn nack(&self, sleep: Duration) -> Result<(), ListenerError> {
        self.nack_inner(None, sleep)
    }

    /// Negative-acknowledge the batch suffix starting at `index`.
    pub fn nack_index(&self, index: usize, sleep: Duration) -> Result<(), ListenerError> {
        self.nack_inner(Some(index), sleep)
    }

    /// Report a failure for a record completed off the consumer thread; the
    /// loop routes it through the error handler on its next iteration.
    pub fn fail(&self, error: impl Into<String>) -> Result<(), ListenerError> {
        let AckScope::Record { message } = &self.scope else {
            return Err(ListenerError::IllegalAck(
                "fail() is only supported for record acknowledgments".into(),
            ));
        };
        if self.state.acked.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.async_acks {
            // the offset will never be acked; withdraw it so the window can
            // close (it is re-tracked if the record is redelivered)
            let tp = TopicPartition::new(message.topic(), message.partition());
            let mut sync = self.sync.lock().unwrap();
            sync.out_of_order.untrack_polled(&tp, message.offset());
            let backpressure = sync.out_of_order.has_pending();
            sync.pause.set_async_backpressure(backpressure);
        }
        let _ = self.ack_tx.send(AckEvent::AsyncFailure {
            message: Box::new(message.as_ref().clone()),
            error: error.into(),
        });
        Ok(())
    }

    fn nack_inner(&self, index: Option<usize>, sleep: Duration) -> Result<(), ListenerError> {
        if self.async_acks {
            return Err(ListenerError::IllegalAck(
                "nack is not supported with out-of-order commits".into(),
            ));
        }
        if std::thread::current().id() != self.consumer_thread {
            return Err(ListenerError::IllegalAck(
                "nack may only be called on the consumer thread".into(),
            ));
        }

        let (partition, offset, batch_index) = match (&self.scope, index) {
            (AckScope::Record { message }, None) => (
                TopicPartition::new(message.topic(), message.partition()),
                message.offset(),
                None,
            ),
            (AckScope::Record { .. }, Some(_)) => {
                return Err(ListenerError::IllegalAck(
                    "nack_index requires a batch of records".into(),
                ));
            }
            (AckScope::Batch { entries }, index) => {
                let index = index.unwrap_or(0);
                let Some((tp, offset)) = entries.get(index) else {
                    return Err(ListenerError::IllegalAck(format!(
                        "nack index {index} out of range for batch of {}",
                        entries.len()
                    )));
                };
                (tp.clone(), *offset, Some(index))
            }
        };

        self.state.acked.store(true, Ordering::SeqCst);
        let mut sync = self.sync.lock().unwrap();
        sync.nack = Some(NackRequest {
            partition,
            offset,
            sleep,
            batch_index,
        });
        Ok(())
    }

    fn route(&self, entries: Vec<(TopicPartition, i64)>) -> Result<(), ListenerError> {
        if self.async_acks {
            let mut sync = self.sync.lock().unwrap();
            let mut commits = Vec::new();
            for (tp, offset) in &entries {
                match sync.out_of_order.ack(tp, *offset) {
                    Ok(Some(commit_through)) => commits.push((tp.clone(), commit_through)),
                    Ok(None) => {}
                    Err(e) => {
                        // Raise to the loop as well: a stale ack stops the
                        // container even when the caller drops the error.
                        let _ = self.ack_tx.send(AckEvent::Illegal(e.to_string()));
                        return Err(e);
                    }
                }
            }
            let backpressure = sync.out_of_order.has_pending();
            sync.pause.set_async_backpressure(backpressure);
            drop(sync);

            if !commits.is_empty() {
                let _ = self.ack_tx.send(AckEvent::Offsets {
                    entries: commits,
                    immediate: self.ack_mode == AckMode::ManualImmediate,
                });
            }
            Ok(())
        } else {
            let _ = self.ack_tx.send(AckEvent::Offsets {
                entries,
                immediate: self.ack_mode == AckMode::ManualImmediate,
            });
            Ok(())
        }
    }
}

impl Drop for Acknowledgment {
    fn drop(&mut self) {
        if Arc::strong_count(&self.state) == 1
            && self.ack_mode.is_manual()
            && !self.state.acked.load(Ordering::SeqCst)
        {
            match &self.scope {
                AckScope::Record { message } => warn!(
                    topic = message.topic(),
                    partition = message.partition(),
                    offset = message.offset(),
                    "acknowledgment dropped without ack or nack"
                ),
                AckScope::Batch { .. } => {
                    warn!("batch acknowledgment dropped without ack or nack")
                }
            }
        }
    }
}

/// Collapse per-record entries to the highest offset per partition.
fn highest_per_partition(entries: &[(TopicPartition, i64)]) -> Vec<(TopicPartition, i64)> {
    let mut highest: HashMap<&TopicPartition, i64> = HashMap::new();
    for (tp, offset) in entries {
        let slot = highest.entry(tp).or_insert(*offset);
        if *offset > *slot {
            *slot = *offset;
        }
    }
    highest
        .into_iter()
        .map(|(tp, offset)| (tp.clone(), offset))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::{OwnedHeaders, Timestamp};
    use tokio::sync::mpsc::unbounded_channel;

    fn tp(partition: i32) -> TopicPartition {
        TopicPartition::new("events", partition)
    }

    fn message(partition: i32, offset: i64) -> OwnedMessage {
        OwnedMessage::new(
            Some(b"payload".to_vec()),
            Some(b"key".to_vec()),
            "events".to_string(),
            Timestamp::now(),
            partition,
            offset,
            Some(OwnedHeaders::new()),
        )
    }

    #[test]
    fn in_order_acks_commit_each_offset() {
        let mut tracker = OutOfOrderTracker::default();
        for offset in 10..13 {
            tracker.track_polled(&tp(0), offset);
        }

        assert_eq!(tracker.ack(&tp(0), 10).unwrap(), Some(10));
        assert_eq!(tracker.ack(&tp(0), 11).unwrap(), Some(11));
        assert_eq!(tracker.ack(&tp(0), 12).unwrap(), Some(12));
        assert!(!tracker.has_pending());
    }

    #[test]
    fn out_of_order_acks_resequence() {
        // Offsets 10..=14 acked in the order 11, 10, 13, 12, 14: commits are
        // issued at 10, 12 and 14, with deferred successors folded silently
        // until the window closes (commit offsets are these +1).
        let mut tracker = OutOfOrderTracker::default();
        for offset in 10..=14 {
            tracker.track_polled(&tp(0), offset);
        }

        assert_eq!(tracker.ack(&tp(0), 11).unwrap(), None);
        assert_eq!(tracker.ack(&tp(0), 10).unwrap(), Some(10));
        assert_eq!(tracker.ack(&tp(0), 13).unwrap(), None);
        assert_eq!(tracker.ack(&tp(0), 12).unwrap(), Some(12));
        assert_eq!(tracker.ack(&tp(0), 14).unwrap(), Some(14));
        assert!(!tracker.has_pending());
    }

    #[test]
    fn closing_run_commits_through_tail() {
        let mut tracker = OutOfOrderTracker::default();
        tracker.track_polled(&tp(0), 10);
        tracker.track_polled(&tp(0), 11);
        tracker.track_polled(&tp(0), 12);

        assert_eq!(tracker.ack(&tp(0), 11).unwrap(), None);
        assert_eq!(tracker.ack(&tp(0), 12).unwrap(), None);
        // Acking the head closes the whole window; commit through the tail.
        assert_eq!(tracker.ack(&tp(0), 10).unwrap(), Some(12));
        assert!(!tracker.has_pending());
    }

    #[test]
    fn stale_ack_is_fatal() {
        let mut tracker = OutOfOrderTracker::default();
        tracker.track_polled(&tp(0), 10);
        tracker.track_polled(&tp(0), 11);

        assert_eq!(tracker.ack(&tp(0), 10).unwrap(), Some(10));
        let err = tracker.ack(&tp(0), 9).unwrap_err();
        assert!(matches!(err, ListenerError::IllegalAck(_)));
    }

    #[test]
    fn deferred_re_ack_is_noop() {
        let mut tracker = OutOfOrderTracker::default();
        tracker.track_polled(&tp(0), 10);
        tracker.track_polled(&tp(0), 11);

        assert_eq!(tracker.ack(&tp(0), 11).unwrap(), None);
        assert_eq!(tracker.ack(&tp(0), 11).unwrap(), None);
        assert_eq!(tracker.ack(&tp(0), 10).unwrap(), Some(11));
    }

    #[test]
    fn partitions_are_independent() {
        let mut tracker = OutOfOrderTracker::default();
        tracker.track_polled(&tp(0), 5);
        tracker.track_polled(&tp(1), 50);

        assert_eq!(tracker.ack(&tp(1), 50).unwrap(), Some(50));
        assert!(tracker.has_pending());
        assert_eq!(tracker.ack(&tp(0), 5).unwrap(), Some(5));
        assert!(!tracker.has_pending());
    }

    fn record_ack(offset: i64, ack_mode: AckMode, async_acks: bool) -> (Acknowledgment, tokio::sync::mpsc::UnboundedReceiver<AckEvent>, Arc<Mutex<SyncState>>) {
        let (tx, rx) = unbounded_channel();
        let sync = Arc::new(Mutex::new(SyncState::new()));
        let ack = Acknowledgment::for_record(
            Arc::new(message(0, offset)),
            sync.clone(),
            tx,
            ack_mode,
            async_acks,
            std::thread::current().id(),
        );
        (ack, rx, sync)
    }

    #[test]
    fn record_ack_posts_offset() {
        let (ack, mut rx, _sync) = record_ack(42, AckMode::Manual, false);
        ack.acknowledge().unwrap();

        match rx.try_recv().unwrap() {
            AckEvent::Offsets { entries, immediate } => {
                assert_eq!(entries, vec![(tp(0), 42)]);
                assert!(!immediate);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn re_ack_is_idempotent() {
        let (ack, mut rx, _sync) = record_ack(42, AckMode::Manual, false);
        ack.acknowledge().unwrap();
        ack.acknowledge().unwrap();

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn manual_immediate_is_flagged() {
        let (ack, mut rx, _sync) = record_ack(7, AckMode::ManualImmediate, false);
        ack.acknowledge().unwrap();
        match rx.try_recv().unwrap() {
            AckEvent::Offsets { immediate, .. } => assert!(immediate),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn nack_rejected_with_async_acks() {
        let (ack, _rx, sync) = record_ack(7, AckMode::Manual, true);
        {
            let mut guard = sync.lock().unwrap();
            guard.out_of_order.track_polled(&tp(0), 7);
        }
        let err = ack.nack(Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, ListenerError::IllegalAck(_)));
    }

    #[test]
    fn nack_rejected_off_consumer_thread() {
        let (tx, _rx) = unbounded_channel();
        let sync = Arc::new(Mutex::new(SyncState::new()));
        let ack = Acknowledgment::for_record(
            Arc::new(message(0, 3)),
            sync,
            tx,
            AckMode::Manual,
            false,
            std::thread::current().id(),
        );

        let err = std::thread::spawn(move || ack.nack(Duration::from_millis(50)))
            .join()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ListenerError::IllegalAck(_)));
    }

    #[test]
    fn nack_records_request() {
        let (ack, _rx, sync) = record_ack(3, AckMode::Manual, false);
        ack.nack(Duration::from_millis(200)).unwrap();

        let guard = sync.lock().unwrap();
        let nack = guard.nack.as_ref().expect("nack recorded");
        assert_eq!(nack.partition, tp(0));
        assert_eq!(nack.offset, 3);
        assert_eq!(nack.sleep, Duration::from_millis(200));
    }

    fn batch_ack(
        ack_mode: AckMode,
    ) -> (
        Acknowledgment,
        tokio::sync::mpsc::UnboundedReceiver<AckEvent>,
    ) {
        let (tx, rx) = unbounded_channel();
        let sync = Arc::new(Mutex::new(SyncState::new()));
        let entries = vec![(tp(0), 10), (tp(0), 11), (tp(1), 5), (tp(0), 12)];
        let ack = Acknowledgment::for_batch(
            entries,
            sync,
            tx,
            ack_mode,
            false,
            std::thread::current().id(),
        );
        (ack, rx)
    }

    #[test]
    fn batch_ack_seeds_highest_per_partition() {
        let (ack, mut rx) = batch_ack(AckMode::Manual);
        ack.acknowledge().unwrap();

        match rx.try_recv().unwrap() {
            AckEvent::Offsets { mut entries, .. } => {
                entries.sort();
                assert_eq!(entries, vec![(tp(0), 12), (tp(1), 5)]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn partial_ack_requires_manual_immediate() {
        let (ack, _rx) = batch_ack(AckMode::Manual);
        assert!(ack.acknowledge_index(1).is_err());
    }

    #[test]
    fn partial_ack_indices_strictly_increase() {
        let (ack, mut rx) = batch_ack(AckMode::ManualImmediate);
        ack.acknowledge_index(1).unwrap();
        assert!(ack.acknowledge_index(1).is_err());
        assert!(ack.acknowledge_index(0).is_err());
        ack.acknowledge_index(3).unwrap();

        let first = match rx.try_recv().unwrap() {
            AckEvent::Offsets { mut entries, immediate } => {
                assert!(immediate);
                entries.sort();
                entries
            }
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(first, vec![(tp(0), 11)]);

        let second = match rx.try_recv().unwrap() {
            AckEvent::Offsets { mut entries, .. } => {
                entries.sort();
                entries
            }
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(second, vec![(tp(0), 12), (tp(1), 5)]);
    }

    #[test]
    fn full_ack_after_partial_commits_the_rest() {
        let (ack, mut rx) = batch_ack(AckMode::ManualImmediate);
        ack.acknowledge_index(1).unwrap();
        let _ = rx.try_recv().unwrap();

        ack.acknowledge().unwrap();
        match rx.try_recv().unwrap() {
            AckEvent::Offsets { mut entries, .. } => {
                entries.sort();
                assert_eq!(entries, vec![(tp(0), 12), (tp(1), 5)]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn async_ack_routes_through_out_of_order_table() {
        let (tx, mut rx) = unbounded_channel();
        let sync = Arc::new(Mutex::new(SyncState::new()));
        {
            let mut guard = sync.lock().unwrap();
            for offset in 10..=11 {
                guard.out_of_order.track_polled(&tp(0), offset);
            }
            guard.pause.set_async_backpressure(true);
        }

        let ack11 = Acknowledgment::for_record(
            Arc::new(message(0, 11)),
            sync.clone(),
            tx.clone(),
            AckMode::Manual,
            true,
            std::thread::current().id(),
        );
        let ack10 = Acknowledgment::for_record(
            Arc::new(message(0, 10)),
            sync.clone(),
            tx,
            AckMode::Manual,
            true,
            std::thread::current().id(),
        );

        ack11.acknowledge().unwrap();
        assert!(rx.try_recv().is_err(), "deferred ack emits nothing");

        ack10.acknowledge().unwrap();
        match rx.try_recv().unwrap() {
            AckEvent::Offsets { entries, .. } => assert_eq!(entries, vec![(tp(0), 11)]),
            other => panic!("unexpected event {other:?}"),
        }

        // Window closed: backpressure released.
        assert!(!sync.lock().unwrap().pause.async_backpressure());
    }

    #[test]
    fn async_fail_posts_deferred_failure() {
        let (ack, mut rx, _sync) = record_ack(9, AckMode::Manual, true);
        ack.fail("handler exploded").unwrap();

        match rx.try_recv().unwrap() {
            AckEvent::AsyncFailure { message, error } => {
                assert_eq!(message.offset(), 9);
                assert_eq!(error, "handler exploded");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
