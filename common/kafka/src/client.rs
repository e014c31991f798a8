use rdkafka::ClientConfig;

use crate::config::{ConsumerConfig, KafkaConfig};

/// Consumer `ClientConfig` builder with the defaults our services run with.
///
/// Offset storing and committing are both disabled by default: the listener
/// runtime decides when an offset is safe, and commits it explicitly.
pub struct ConsumerClientBuilder {
    config: ClientConfig,
}

impl ConsumerClientBuilder {
    pub fn new(common: &KafkaConfig, consumer: &ConsumerConfig) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", &common.kafka_hosts)
            .set("group.id", &consumer.kafka_consumer_group);

        config
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", consumer.kafka_consumer_auto_commit.to_string())
            .set(
                "auto.commit.interval.ms",
                consumer.kafka_consumer_auto_commit_interval_ms.to_string(),
            )
            .set("auto.offset.reset", &consumer.kafka_consumer_offset_reset)
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "5000")
            .set(
                "max.poll.interval.ms",
                consumer.kafka_consumer_max_poll_interval_ms.to_string(),
            );

        if common.kafka_tls {
            config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }

        Self { config }
    }

    /// Client id, also enabling static group membership for sticky assignments.
    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.config.set("client.id", client_id);
        self.config.set("group.instance.id", client_id);
        self
    }

    pub fn with_cooperative_rebalancing(mut self) -> Self {
        self.config
            .set("partition.assignment.strategy", "cooperative-sticky");
        self
    }

    /// Arbitrary overrides, applied last.
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Producer `ClientConfig` shared by plain and transactional producers.
pub fn producer_client_config(common: &KafkaConfig) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", &common.kafka_hosts)
        .set("linger.ms", common.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            common.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            common.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (common.kafka_producer_queue_mib * 1024).to_string(),
        )
        .set(
            "queue.buffering.max.messages",
            common.kafka_producer_queue_messages.to_string(),
        );

    if common.kafka_tls {
        config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use envconfig::Envconfig;

    fn test_configs() -> (KafkaConfig, ConsumerConfig) {
        ConsumerConfig::set_defaults("common-kafka-tests", false);
        (
            KafkaConfig::init_from_env().expect("kafka env"),
            ConsumerConfig::init_from_env().expect("consumer env"),
        )
    }

    #[test]
    fn consumer_builder_disables_offset_store() {
        let (common, consumer) = test_configs();
        let config = ConsumerClientBuilder::new(&common, &consumer).build();
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
    }

    #[test]
    fn client_id_enables_static_membership() {
        let (common, consumer) = test_configs();
        let config = ConsumerClientBuilder::new(&common, &consumer)
            .with_client_id("listener-0")
            .build();
        assert_eq!(config.get("client.id"), Some("listener-0"));
        assert_eq!(config.get("group.instance.id"), Some("listener-0"));
    }

    #[test]
    fn overrides_apply_last() {
        let (common, consumer) = test_configs();
        let config = ConsumerClientBuilder::new(&common, &consumer)
            .set("session.timeout.ms", "45000")
            .build();
        assert_eq!(config.get("session.timeout.ms"), Some("45000"));
    }
}
