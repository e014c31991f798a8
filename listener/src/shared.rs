use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rdkafka::message::OwnedMessage;
use rdkafka::Message;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::ack::{AckEvent, SyncState};
use crate::config::ContainerProperties;
use crate::events::{ContainerEvent, EventSink};
use crate::offsets::OffsetLedger;
use crate::seek::SeekRequest;
use crate::types::TopicPartition;

/// Records held over after a failure, replayed once the offending partitions
/// are unpaused. While this buffer is non-empty, a poll returning records is
/// a message-loss risk and triggers the emergency stop.
pub(crate) struct RetainedRecords {
    pub records: Vec<OwnedMessage>,
    pub partitions: BTreeSet<TopicPartition>,
}

impl RetainedRecords {
    pub fn new(records: Vec<OwnedMessage>) -> Self {
        let partitions = records
            .iter()
            .map(|r| TopicPartition::new(r.topic(), r.partition()))
            .collect();
        Self {
            records,
            partitions,
        }
    }

    /// Drop retained records for partitions we no longer own.
    pub fn remove_partitions(&mut self, partitions: &[TopicPartition]) {
        self.records.retain(|r| {
            let tp = TopicPartition::new(r.topic(), r.partition());
            !partitions.contains(&tp)
        });
        for tp in partitions {
            self.partitions.remove(tp);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// State shared between the consumer thread, the rebalance callbacks, the
/// acknowledgement handles, the liveness monitor, and the container handle.
/// The consumer-thread-only pieces sit behind mutexes that are uncontended in
/// practice; the rebalance callbacks run on the consumer thread inside poll.
pub(crate) struct ContainerShared {
    pub id: String,
    pub group_id: String,
    pub reset_policy: String,
    pub props: ContainerProperties,
    pub running: AtomicBool,
    pub started: AtomicBool,
    pub sync: Arc<Mutex<SyncState>>,
    pub ledger: Mutex<OffsetLedger>,
    pub retained: Mutex<Option<RetainedRecords>>,
    pub assignment: Mutex<Vec<TopicPartition>>,
    pub ack_tx: UnboundedSender<AckEvent>,
    pub ack_rx: Mutex<UnboundedReceiver<AckEvent>>,
    pub seek_tx: UnboundedSender<SeekRequest>,
    pub seek_rx: Mutex<UnboundedReceiver<SeekRequest>>,
    /// Async failures drained at the top of each poll iteration.
    pub pending_failures: Mutex<Vec<(Box<OwnedMessage>, String)>>,
    /// Fatal acknowledgement misuse reported off the consumer thread.
    pub fatal_ack: Mutex<Option<String>>,
    pub events: Arc<dyn EventSink>,
    pub last_poll: Mutex<Instant>,
}

impl ContainerShared {
    pub fn new(
        id: String,
        group_id: String,
        reset_policy: String,
        props: ContainerProperties,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let (ack_tx, ack_rx) = unbounded_channel();
        let (seek_tx, seek_rx) = unbounded_channel();
        Arc::new(Self {
            id,
            group_id,
            reset_policy,
            props,
            running: AtomicBool::new(false),
            started: AtomicBool::new(false),
            sync: Arc::new(Mutex::new(SyncState::new())),
            ledger: Mutex::new(OffsetLedger::new()),
            retained: Mutex::new(None),
            assignment: Mutex::new(Vec::new()),
            ack_tx,
            ack_rx: Mutex::new(ack_rx),
            seek_tx,
            seek_rx: Mutex::new(seek_rx),
            pending_failures: Mutex::new(Vec::new()),
            fatal_ack: Mutex::new(None),
            events,
            last_poll: Mutex::new(Instant::now()),
        })
    }

    pub fn publish(&self, event: ContainerEvent) {
        self.events.publish(&self.id, event);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn assignment(&self) -> Vec<TopicPartition> {
        self.assignment.lock().unwrap().clone()
    }

    pub fn touch_poll_clock(&self) {
        *self.last_poll.lock().unwrap() = Instant::now();
    }

    pub fn since_last_poll(&self) -> std::time::Duration {
        self.last_poll.lock().unwrap().elapsed()
    }

    /// Drain the ack channel into the offset ledger. Offset events advance
    /// pending commits; async failures and illegal-ack reports are parked for
    /// the poll loop. Returns true when a ManualImmediate commit is due.
    pub fn drain_acks_into_ledger(&self) -> bool {
        let mut immediate = false;
        let mut ack_rx = self.ack_rx.lock().unwrap();
        let mut ledger = self.ledger.lock().unwrap();
        while let Ok(event) = ack_rx.try_recv() {
            match event {
                AckEvent::Offsets { entries, immediate: now } => {
                    for (tp, offset) in entries {
                        ledger.add_record(&tp, offset);
                    }
                    immediate |= now;
                }
                AckEvent::AsyncFailure { message, error } => {
                    self.pending_failures.lock().unwrap().push((message, error));
                }
                AckEvent::Illegal(detail) => {
                    let mut fatal = self.fatal_ack.lock().unwrap();
                    if fatal.is_none() {
                        *fatal = Some(detail);
                    }
                }
            }
        }
        immediate
    }

    /// Retained-record partitions, for re-pause after a rebalance.
    pub fn retained_partitions(&self) -> Vec<TopicPartition> {
        self.retained
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| r.partitions.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn retained_count(&self) -> usize {
        self.retained
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| r.records.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TracingEventSink;
    use rdkafka::message::Timestamp;

    fn message(partition: i32, offset: i64) -> OwnedMessage {
        OwnedMessage::new(
            None,
            None,
            "events".to_string(),
            Timestamp::now(),
            partition,
            offset,
            None,
        )
    }

    fn shared() -> Arc<ContainerShared> {
        ContainerShared::new(
            "test-container".into(),
            "test-group".into(),
            "earliest".into(),
            ContainerProperties::default(),
            Arc::new(TracingEventSink),
        )
    }

    #[test]
    fn retained_records_derive_partitions() {
        let retained = RetainedRecords::new(vec![message(0, 1), message(1, 2), message(0, 3)]);
        assert_eq!(retained.partitions.len(), 2);
        assert_eq!(retained.records.len(), 3);
    }

    #[test]
    fn retained_records_prune_revoked() {
        let mut retained = RetainedRecords::new(vec![message(0, 1), message(1, 2)]);
        retained.remove_partitions(&[TopicPartition::new("events", 0)]);
        assert_eq!(retained.records.len(), 1);
        assert_eq!(retained.partitions.len(), 1);
        assert!(!retained.is_empty());
    }

    #[test]
    fn ack_drain_advances_ledger() {
        let shared = shared();
        shared
            .ack_tx
            .send(AckEvent::Offsets {
                entries: vec![(TopicPartition::new("events", 0), 9)],
                immediate: false,
            })
            .unwrap();

        assert!(!shared.drain_acks_into_ledger());
        assert_eq!(
            shared
                .ledger
                .lock()
                .unwrap()
                .pending_offset(&TopicPartition::new("events", 0)),
            Some(10)
        );
    }

    #[test]
    fn ack_drain_parks_failures_and_fatal() {
        let shared = shared();
        shared
            .ack_tx
            .send(AckEvent::AsyncFailure {
                message: Box::new(message(0, 4)),
                error: "boom".into(),
            })
            .unwrap();
        shared
            .ack_tx
            .send(AckEvent::Illegal("stale ack".into()))
            .unwrap();

        shared.drain_acks_into_ledger();
        assert_eq!(shared.pending_failures.lock().unwrap().len(), 1);
        assert_eq!(
            shared.fatal_ack.lock().unwrap().as_deref(),
            Some("stale ack")
        );
    }

    #[test]
    fn immediate_flag_propagates() {
        let shared = shared();
        shared
            .ack_tx
            .send(AckEvent::Offsets {
                entries: vec![(TopicPartition::new("events", 0), 1)],
                immediate: true,
            })
            .unwrap();
        assert!(shared.drain_acks_into_ledger());
    }
}
