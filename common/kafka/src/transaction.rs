use std::{collections::HashMap, time::Duration};

use rdkafka::{
    consumer::ConsumerGroupMetadata,
    error::KafkaError,
    producer::{BaseProducer, BaseRecord, Producer},
    TopicPartitionList,
};
use tracing::{debug, error, info};

use crate::{client::producer_client_config, config::KafkaConfig};

/// A producer whose sends and offset commits are atomic. The listener runtime
/// drives it synchronously from the consumer thread, so the blocking
/// `BaseProducer` is the right client here.
pub struct TransactionalProducer {
    inner: BaseProducer,
    timeout: Duration,
}

impl TransactionalProducer {
    pub fn from_config(
        config: &KafkaConfig,
        transactional_id: &str,
        timeout: Duration,
    ) -> Result<Self, KafkaError> {
        let mut client_config = producer_client_config(config);
        client_config.set("transactional.id", transactional_id);

        debug!("rdkafka transactional configuration: {:?}", client_config);
        let inner: BaseProducer = client_config.create()?;

        // "Ping" the Kafka brokers by requesting metadata
        match inner
            .client()
            .fetch_metadata(None, std::time::Duration::from_secs(15))
        {
            Ok(metadata) => {
                info!(
                    "Successfully connected to Kafka brokers. Found {} topics.",
                    metadata.topics().len()
                );
            }
            Err(error) => {
                error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(error);
            }
        }

        inner.init_transactions(timeout)?;

        Ok(TransactionalProducer { inner, timeout })
    }

    pub fn begin(&mut self) -> Result<KafkaTransaction<'_>, KafkaError> {
        self.inner.begin_transaction()?;
        Ok(KafkaTransaction { producer: self })
    }

    pub fn set_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    // Expose the inner at the producer level, but not at the transaction level -
    // during a transaction, we want strong control over the operations done, but
    // outside of the transaction, we want to be able to do things like fetch metadata
    pub fn inner(&self) -> &BaseProducer {
        &self.inner
    }
}

pub struct KafkaTransaction<'a> {
    // NOTE: kafka requires any producer have only a single transaction running at
    // any time. We enforce this by having transactions mutably borrow the
    // initiating producer, although this is not strictly necessary by the rdkafka
    // interface itself
    producer: &'a mut TransactionalProducer,
}

impl<'a> KafkaTransaction<'a> {
    pub fn send<'b>(
        &self,
        record: BaseRecord<'b, [u8], [u8]>,
    ) -> Result<(), (KafkaError, BaseRecord<'b, [u8], [u8]>)> {
        self.producer.inner.send(record)
    }

    /// Associate the consumed offsets with this transaction. Each entry is the
    /// offset of the last record processed on that partition; the +1 the broker
    /// expects ("next message the application will consume") is applied here.
    pub fn associate_offsets(
        &self,
        offsets: Vec<(String, i32, i64)>,
        metadata: &ConsumerGroupMetadata,
    ) -> Result<(), KafkaError> {
        let tpl = to_topic_partition_list(offsets)?;
        self.producer
            .inner
            .send_offsets_to_transaction(&tpl, metadata, self.producer.timeout)
    }

    pub fn commit(self) -> Result<(), KafkaError> {
        self.producer
            .inner
            .commit_transaction(self.producer.timeout)?;
        Ok(())
    }

    pub fn abort(self) -> Result<(), KafkaError> {
        self.producer
            .inner
            .abort_transaction(self.producer.timeout)?;
        Ok(())
    }
}

fn to_topic_partition_list(
    offsets: Vec<(String, i32, i64)>,
) -> Result<TopicPartitionList, KafkaError> {
    let mut topic_map = HashMap::new();
    for (topic, partition, offset) in offsets.into_iter() {
        let stored = topic_map.entry((topic, partition)).or_insert(offset);
        if *stored < offset {
            *stored = offset
        }
    }

    let topic_map = topic_map
        .into_iter()
        // The broker wants "the next message your application will consume", i.e.
        // one greater than the last processed offset on each partition.
        .map(|(k, v)| (k, rdkafka::Offset::from_raw(v + 1)))
        .collect();

    TopicPartitionList::from_topic_map(&topic_map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::Offset;

    #[test]
    fn offsets_deduped_to_highest_plus_one() {
        let tpl = to_topic_partition_list(vec![
            ("events".to_string(), 0, 4),
            ("events".to_string(), 0, 9),
            ("events".to_string(), 1, 2),
        ])
        .expect("tpl");

        assert_eq!(
            tpl.find_partition("events", 0).map(|p| p.offset()),
            Some(Offset::Offset(10))
        );
        assert_eq!(
            tpl.find_partition("events", 1).map(|p| p.offset()),
            Some(Offset::Offset(3))
        );
    }

    #[test]
    fn empty_offsets_make_empty_list() {
        let tpl = to_topic_partition_list(vec![]).expect("tpl");
        assert_eq!(tpl.count(), 0);
    }
}
