pub const LISTENER_RECORDS_HANDLED: &str = "kafka_listener_records_handled";
pub const LISTENER_RECORDS_FAILED: &str = "kafka_listener_records_failed";
pub const LISTENER_BATCHES_HANDLED: &str = "kafka_listener_batches_handled";
pub const LISTENER_BATCHES_FAILED: &str = "kafka_listener_batches_failed";
pub const LISTENER_HANDLE_DURATION_MS: &str = "kafka_listener_handle_duration_ms";

pub const LISTENER_COMMITS_ISSUED: &str = "kafka_listener_commits_issued";
pub const LISTENER_COMMITS_FAILED: &str = "kafka_listener_commits_failed";
pub const LISTENER_COMMITS_RETAINED: &str = "kafka_listener_commits_retained_for_rebalance";

pub const LISTENER_POLL_INTERVAL_MS: &str = "kafka_listener_poll_interval_ms";
pub const LISTENER_POLL_RECORDS: &str = "kafka_listener_poll_records";

pub const LISTENER_PARTITIONS_PAUSED: &str = "kafka_listener_partitions_paused";
pub const LISTENER_NACKS: &str = "kafka_listener_nacks";
pub const LISTENER_SEEKS_APPLIED: &str = "kafka_listener_seeks_applied";
pub const LISTENER_SEEKS_DROPPED: &str = "kafka_listener_seeks_dropped";

pub const LISTENER_OUT_OF_ORDER_ACKS: &str = "kafka_listener_out_of_order_acks";
pub const LISTENER_DEFERRED_ACK_DEPTH: &str = "kafka_listener_deferred_ack_depth";

pub const LISTENER_REBALANCES: &str = "kafka_listener_rebalances";
pub const LISTENER_TRANSACTIONS_COMMITTED: &str = "kafka_listener_transactions_committed";
pub const LISTENER_TRANSACTIONS_ABORTED: &str = "kafka_listener_transactions_aborted";
pub const LISTENER_EMERGENCY_STOPS: &str = "kafka_listener_emergency_stops";
