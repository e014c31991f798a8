use std::collections::HashMap;
use std::fmt;

use rdkafka::error::KafkaResult;
use rdkafka::topic_partition_list::TopicPartitionListElem;
use rdkafka::{Offset, TopicPartitionList};

/// A (topic, partition) pair with value identity, used as a map key everywhere
/// offsets are tracked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    topic: String,
    partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

impl From<TopicPartitionListElem<'_>> for TopicPartition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic().to_string(), elem.partition())
    }
}

/// A commit marker. "Commit offset N" means "the next record to fetch has
/// offset N", so the commit for a processed record is `record.offset + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetAndMetadata {
    offset: i64,
    metadata: Option<String>,
}

impl OffsetAndMetadata {
    pub fn new(offset: i64) -> Self {
        Self {
            offset,
            metadata: None,
        }
    }

    pub fn with_metadata(offset: i64, metadata: impl Into<String>) -> Self {
        Self {
            offset,
            metadata: Some(metadata.into()),
        }
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn metadata(&self) -> Option<&str> {
        self.metadata.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartitionOffset {
    partition: TopicPartition,
    offset: i64,
}

impl TopicPartitionOffset {
    pub fn new(partition: TopicPartition, offset: i64) -> Self {
        Self { partition, offset }
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

/// Build a `TopicPartitionList` from a commit map.
pub(crate) fn commits_to_tpl(
    commits: &HashMap<TopicPartition, OffsetAndMetadata>,
) -> KafkaResult<TopicPartitionList> {
    let mut tpl = TopicPartitionList::new();
    for (tp, offset) in commits {
        tpl.add_partition_offset(tp.topic(), tp.partition(), Offset::Offset(offset.offset()))?;
    }
    Ok(tpl)
}

pub(crate) fn partitions_to_tpl(partitions: &[TopicPartition]) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for tp in partitions {
        tpl.add_partition(tp.topic(), tp.partition());
    }
    tpl
}

pub(crate) fn tpl_to_partitions(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements().into_iter().map(TopicPartition::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_map_round_trips_through_tpl() {
        let mut commits = HashMap::new();
        commits.insert(
            TopicPartition::new("events", 0),
            OffsetAndMetadata::new(42),
        );
        commits.insert(
            TopicPartition::new("events", 3),
            OffsetAndMetadata::new(7),
        );

        let tpl = commits_to_tpl(&commits).expect("tpl");
        assert_eq!(tpl.count(), 2);
        assert_eq!(
            tpl.find_partition("events", 0).map(|e| e.offset()),
            Some(Offset::Offset(42))
        );
        assert_eq!(
            tpl.find_partition("events", 3).map(|e| e.offset()),
            Some(Offset::Offset(7))
        );
    }

    #[test]
    fn partition_display_matches_kafka_convention() {
        let tp = TopicPartition::new("events", 12);
        assert_eq!(tp.to_string(), "events-12");
    }
}
