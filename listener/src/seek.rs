use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use crate::types::TopicPartition;

/// Where to reposition a partition's read pointer.
#[derive(Clone)]
pub enum SeekTarget {
    Absolute(i64),
    /// Relative to the current position when `to_current`; otherwise relative
    /// to the beginning for non-negative offsets and to the end for negative
    /// ones.
    Relative { offset: i64, to_current: bool },
    Beginning,
    End,
    /// Seek to the earliest offset whose timestamp is >= this (epoch millis).
    Timestamp(i64),
    /// Compute the new offset from the current position.
    Function(Arc<dyn Fn(i64) -> i64 + Send + Sync>),
}

impl fmt::Debug for SeekTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeekTarget::Absolute(o) => write!(f, "Absolute({o})"),
            SeekTarget::Relative { offset, to_current } => {
                write!(f, "Relative({offset}, to_current: {to_current})")
            }
            SeekTarget::Beginning => write!(f, "Beginning"),
            SeekTarget::End => write!(f, "End"),
            SeekTarget::Timestamp(ts) => write!(f, "Timestamp({ts})"),
            SeekTarget::Function(_) => write!(f, "Function(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SeekRequest {
    pub partition: TopicPartition,
    pub target: SeekTarget,
}

/// Enqueues seek intents from any thread; they are drained and applied on the
/// consumer thread before the next poll.
#[derive(Clone)]
pub struct SeekHandle {
    tx: UnboundedSender<SeekRequest>,
}

impl SeekHandle {
    pub(crate) fn new(tx: UnboundedSender<SeekRequest>) -> Self {
        Self { tx }
    }

    pub fn seek(&self, topic: &str, partition: i32, offset: i64) {
        self.enqueue(topic, partition, SeekTarget::Absolute(offset));
    }

    pub fn seek_to_beginning(&self, topic: &str, partition: i32) {
        self.enqueue(topic, partition, SeekTarget::Beginning);
    }

    pub fn seek_to_end(&self, topic: &str, partition: i32) {
        self.enqueue(topic, partition, SeekTarget::End);
    }

    pub fn seek_relative(&self, topic: &str, partition: i32, offset: i64, to_current: bool) {
        self.enqueue(topic, partition, SeekTarget::Relative { offset, to_current });
    }

    pub fn seek_to_timestamp(&self, topic: &str, partition: i32, timestamp_ms: i64) {
        self.enqueue(topic, partition, SeekTarget::Timestamp(timestamp_ms));
    }

    pub fn seek_with(
        &self,
        topic: &str,
        partition: i32,
        f: impl Fn(i64) -> i64 + Send + Sync + 'static,
    ) {
        self.enqueue(topic, partition, SeekTarget::Function(Arc::new(f)));
    }

    fn enqueue(&self, topic: &str, partition: i32, target: SeekTarget) {
        let _ = self.tx.send(SeekRequest {
            partition: TopicPartition::new(topic, partition),
            target,
        });
    }
}

/// Split drained requests into directly-applicable seeks and timestamp seeks.
/// Timestamp lookups are batched into a single offsets-for-times round-trip;
/// the last timestamp wins when a partition is requested twice.
pub(crate) fn split_requests(
    requests: Vec<SeekRequest>,
    assigned: &[TopicPartition],
) -> (Vec<SeekRequest>, HashMap<TopicPartition, i64>, Vec<SeekRequest>) {
    let mut direct = Vec::new();
    let mut timestamps = HashMap::new();
    let mut dropped = Vec::new();

    for request in requests {
        if !assigned.contains(&request.partition) {
            dropped.push(request);
            continue;
        }
        match request.target {
            SeekTarget::Timestamp(ts) => {
                timestamps.insert(request.partition.clone(), ts);
            }
            _ => direct.push(request),
        }
    }

    (direct, timestamps, dropped)
}

/// Clamp a computed target offset at zero; a relative seek can never go
/// before the start of the partition.
pub(crate) fn clamp_offset(offset: i64) -> i64 {
    offset.max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn tp(p: i32) -> TopicPartition {
        TopicPartition::new("events", p)
    }

    #[test]
    fn handle_enqueues_requests() {
        let (tx, mut rx) = unbounded_channel();
        let handle = SeekHandle::new(tx);

        handle.seek("events", 0, 42);
        handle.seek_to_beginning("events", 1);
        handle.seek_relative("events", 2, -5, true);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.partition, tp(0));
        assert!(matches!(first.target, SeekTarget::Absolute(42)));

        let second = rx.try_recv().unwrap();
        assert!(matches!(second.target, SeekTarget::Beginning));

        let third = rx.try_recv().unwrap();
        assert!(matches!(
            third.target,
            SeekTarget::Relative { offset: -5, to_current: true }
        ));
    }

    #[test]
    fn unassigned_partitions_are_dropped() {
        let requests = vec![
            SeekRequest { partition: tp(0), target: SeekTarget::Absolute(1) },
            SeekRequest { partition: tp(9), target: SeekTarget::Absolute(2) },
        ];
        let (direct, timestamps, dropped) = split_requests(requests, &[tp(0)]);
        assert_eq!(direct.len(), 1);
        assert!(timestamps.is_empty());
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].partition, tp(9));
    }

    #[test]
    fn timestamp_seeks_are_batched_last_wins() {
        let requests = vec![
            SeekRequest { partition: tp(0), target: SeekTarget::Timestamp(100) },
            SeekRequest { partition: tp(1), target: SeekTarget::Timestamp(200) },
            SeekRequest { partition: tp(0), target: SeekTarget::Timestamp(300) },
        ];
        let (direct, timestamps, dropped) = split_requests(requests, &[tp(0), tp(1)]);
        assert!(direct.is_empty());
        assert!(dropped.is_empty());
        assert_eq!(timestamps.get(&tp(0)), Some(&300));
        assert_eq!(timestamps.get(&tp(1)), Some(&200));
    }

    #[test]
    fn relative_seeks_clamp_at_zero() {
        assert_eq!(clamp_offset(-3), 0);
        assert_eq!(clamp_offset(0), 0);
        assert_eq!(clamp_offset(17), 17);
    }
}
