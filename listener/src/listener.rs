use std::collections::HashMap;

use rdkafka::message::OwnedMessage;
use rdkafka::Message;

use crate::ack::Acknowledgment;
use crate::rebalance::ListenerClient;
use crate::seek::SeekHandle;
use crate::types::TopicPartition;

/// Explicit per-container context handed to listeners, interceptors and error
/// handlers instead of thread-local group-id propagation.
#[derive(Debug, Clone)]
pub struct ListenerContext {
    group_id: String,
    client_id: Option<String>,
    listener_info: Option<Vec<u8>>,
}

impl ListenerContext {
    pub(crate) fn new(
        group_id: String,
        client_id: Option<String>,
        listener_info: Option<Vec<u8>>,
    ) -> Self {
        Self {
            group_id,
            client_id,
            listener_info,
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn listener_info(&self) -> Option<&[u8]> {
        self.listener_info.as_deref()
    }
}

/// One poll's worth of records, for the full-poll batch listener shape.
pub struct PolledRecords {
    records: Vec<OwnedMessage>,
}

impl PolledRecords {
    pub(crate) fn new(records: Vec<OwnedMessage>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[OwnedMessage] {
        &self.records
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn partitions(&self) -> Vec<TopicPartition> {
        let mut partitions: Vec<TopicPartition> = self
            .records
            .iter()
            .map(|r| TopicPartition::new(r.topic(), r.partition()))
            .collect();
        partitions.sort();
        partitions.dedup();
        partitions
    }

    pub fn records_for(&self, tp: &TopicPartition) -> Vec<&OwnedMessage> {
        self.records
            .iter()
            .filter(|r| r.topic() == tp.topic() && r.partition() == tp.partition())
            .collect()
    }
}

pub type RecordFn =
    Box<dyn FnMut(&OwnedMessage, &ListenerContext) -> anyhow::Result<()> + Send>;
pub type RecordConsumerAwareFn = Box<
    dyn FnMut(&OwnedMessage, &ListenerClient, &ListenerContext) -> anyhow::Result<()> + Send,
>;
pub type RecordAckFn =
    Box<dyn FnMut(&OwnedMessage, Acknowledgment, &ListenerContext) -> anyhow::Result<()> + Send>;
pub type RecordAckConsumerAwareFn = Box<
    dyn FnMut(&OwnedMessage, Acknowledgment, &ListenerClient, &ListenerContext) -> anyhow::Result<()>
        + Send,
>;
pub type BatchFn =
    Box<dyn FnMut(&[OwnedMessage], &ListenerContext) -> anyhow::Result<()> + Send>;
pub type BatchConsumerAwareFn = Box<
    dyn FnMut(&[OwnedMessage], &ListenerClient, &ListenerContext) -> anyhow::Result<()> + Send,
>;
pub type BatchAckFn =
    Box<dyn FnMut(&[OwnedMessage], Acknowledgment, &ListenerContext) -> anyhow::Result<()> + Send>;
pub type BatchAckConsumerAwareFn = Box<
    dyn FnMut(
            &[OwnedMessage],
            Acknowledgment,
            &ListenerClient,
            &ListenerContext,
        ) -> anyhow::Result<()>
        + Send,
>;
pub type BatchFullPollFn = Box<
    dyn FnMut(&PolledRecords, Acknowledgment, &ListenerClient, &ListenerContext) -> anyhow::Result<()>
        + Send,
>;

/// The listener's capability set, as a tagged variant: dispatch is a match on
/// the tag, not an adapter hierarchy.
pub enum MessageListener {
    Record(RecordFn),
    RecordConsumerAware(RecordConsumerAwareFn),
    RecordAcknowledging(RecordAckFn),
    RecordAcknowledgingConsumerAware(RecordAckConsumerAwareFn),
    Batch(BatchFn),
    BatchConsumerAware(BatchConsumerAwareFn),
    BatchAcknowledging(BatchAckFn),
    BatchAcknowledgingConsumerAware(BatchAckConsumerAwareFn),
    BatchFullPoll(BatchFullPollFn),
}

impl MessageListener {
    pub fn is_batch(&self) -> bool {
        matches!(
            self,
            MessageListener::Batch(_)
                | MessageListener::BatchConsumerAware(_)
                | MessageListener::BatchAcknowledging(_)
                | MessageListener::BatchAcknowledgingConsumerAware(_)
                | MessageListener::BatchFullPoll(_)
        )
    }

    pub(crate) fn wants_ack(&self) -> bool {
        matches!(
            self,
            MessageListener::RecordAcknowledging(_)
                | MessageListener::RecordAcknowledgingConsumerAware(_)
                | MessageListener::BatchAcknowledging(_)
                | MessageListener::BatchAcknowledgingConsumerAware(_)
                | MessageListener::BatchFullPoll(_)
        )
    }
}

impl std::fmt::Debug for MessageListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            MessageListener::Record(_) => "Record",
            MessageListener::RecordConsumerAware(_) => "RecordConsumerAware",
            MessageListener::RecordAcknowledging(_) => "RecordAcknowledging",
            MessageListener::RecordAcknowledgingConsumerAware(_) => {
                "RecordAcknowledgingConsumerAware"
            }
            MessageListener::Batch(_) => "Batch",
            MessageListener::BatchConsumerAware(_) => "BatchConsumerAware",
            MessageListener::BatchAcknowledging(_) => "BatchAcknowledging",
            MessageListener::BatchAcknowledgingConsumerAware(_) => {
                "BatchAcknowledgingConsumerAware"
            }
            MessageListener::BatchFullPoll(_) => "BatchFullPoll",
        };
        f.write_str(tag)
    }
}

/// Implemented by handlers that want to drive seeks. The callback handle can
/// be cloned and used from any thread; seeks apply on the consumer thread
/// before the next poll.
pub trait SeekAware: Send + Sync {
    /// Called once when the container starts, before the first poll.
    fn register_seek_callback(&self, _handle: SeekHandle) {}

    /// Called on the consumer thread after partitions are assigned, with the
    /// current position of each.
    fn on_partitions_assigned(
        &self,
        _positions: &HashMap<TopicPartition, i64>,
        _handle: &SeekHandle,
    ) {
    }

    fn on_partitions_revoked(&self, _partitions: &[TopicPartition]) {}

    /// Called when the container goes idle (when idle events are enabled).
    fn on_idle(&self, _positions: &HashMap<TopicPartition, i64>, _handle: &SeekHandle) {}
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[test]
    fn polled_records_group_by_partition() {
        let polled = PolledRecords::new(vec![message(0, 1), message(1, 7), message(0, 2)]);
        assert_eq!(polled.count(), 3);
        assert_eq!(
            polled.partitions(),
            vec![
                TopicPartition::new("events", 0),
                TopicPartition::new("events", 1)
            ]
        );
        assert_eq!(
            polled
                .records_for(&TopicPartition::new("events", 0))
                .iter()
                .map(|r| r.offset())
                .collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn listener_tags_classify_batch_and_ack() {
        let record = MessageListener::Record(Box::new(|_, _| Ok(())));
        assert!(!record.is_batch());
        assert!(!record.wants_ack());

        let batch_ack = MessageListener::BatchAcknowledging(Box::new(|_, _, _| Ok(())));
        assert!(batch_ack.is_batch());
        assert!(batch_ack.wants_ack());
    }
}
