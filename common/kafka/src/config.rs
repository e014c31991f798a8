use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "10000000")]
    pub kafka_producer_queue_messages: u32, // Maximum number of messages in the in-memory producer queue

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    pub kafka_consumer_group: String,

    // We default to "earliest" for this, but if you're bringing up a new service,
    // you probably want "latest"
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest, none

    // Note: consumers used in a transactional fashion should disable auto offset
    // commits, as their offsets are committed via the transactional producer. All
    // consumers disable auto offset /storing/.
    #[envconfig(default = "false")]
    pub kafka_consumer_auto_commit: bool,

    #[envconfig(default = "5000")]
    pub kafka_consumer_auto_commit_interval_ms: i32,

    #[envconfig(default = "300000")]
    pub kafka_consumer_max_poll_interval_ms: u32,
}

impl ConsumerConfig {
    /// Because the consumer config is so application specific, we can't set good
    /// defaults in the derive macro, so we expose a way for users to set them here
    /// before init'ing their main config struct
    pub fn set_defaults(consumer_group: &str, auto_commit: bool) {
        if std::env::var("KAFKA_CONSUMER_GROUP").is_err() {
            std::env::set_var("KAFKA_CONSUMER_GROUP", consumer_group);
        };
        if std::env::var("KAFKA_CONSUMER_AUTO_COMMIT").is_err() {
            std::env::set_var("KAFKA_CONSUMER_AUTO_COMMIT", auto_commit.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_defaults_are_applied_once() {
        ConsumerConfig::set_defaults("common-kafka-tests", false);
        let config = ConsumerConfig::init_from_env().expect("env init");
        assert_eq!(config.kafka_consumer_group, "common-kafka-tests");
        assert!(!config.kafka_consumer_auto_commit);
        assert_eq!(config.kafka_consumer_offset_reset, "earliest");
        assert_eq!(config.kafka_consumer_max_poll_interval_ms, 300_000);
    }
}
