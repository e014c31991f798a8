use std::time::Duration;

use crate::errors::ConfigError;

/// When offsets are committed relative to record handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Commit after each successfully handled record.
    Record,
    /// Commit after every poll's records have all been handled.
    #[default]
    Batch,
    /// Commit no more often than every `ack_time`.
    Time,
    /// Commit every `ack_count` handled records.
    Count,
    /// Whichever of count or time triggers first.
    CountTime,
    /// User calls `acknowledge()`; commit happens at the next poll boundary.
    Manual,
    /// User calls `acknowledge()`; commit is attempted synchronously from the
    /// consumer thread before the next poll.
    ManualImmediate,
}

impl AckMode {
    pub fn is_manual(&self) -> bool {
        matches!(self, AckMode::Manual | AckMode::ManualImmediate)
    }
}

/// Whether to commit the current position for newly assigned partitions that
/// have no stored commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssignmentCommitOption {
    Never,
    Always,
    /// Only when the reset policy is "latest" (protects against a later group
    /// offset reset replaying from earliest).
    LatestOnly,
    /// Like `LatestOnly`, but skipped when a transactional producer is
    /// configured (the first transaction will commit instead).
    #[default]
    LatestOnlyNoTx,
}

/// Exactly-once semantics mode. Only the fetch-offset-request fencing
/// generation survives in modern brokers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EosMode {
    #[default]
    V2,
}

/// Level used for successful-commit log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitLogLevel {
    Error,
    Warn,
    Info,
    #[default]
    Debug,
    Trace,
}

/// Runtime options for one listener container. Constructed with `Default` and
/// adjusted field-by-field or through the `with_*` helpers; validated when the
/// container is built.
#[derive(Debug, Clone)]
pub struct ContainerProperties {
    /// Max time to block in the client poll call.
    pub poll_timeout: Duration,
    /// Poll timeout while the whole consumer is paused, kept short so pause
    /// and stop requests stay responsive.
    pub poll_timeout_while_paused: Duration,
    /// Upper bound on records collected per poll cycle.
    pub max_poll_records: usize,
    /// Sleep between polls (throttling); capped so the consumer cannot fall
    /// out of the group.
    pub idle_between_polls: Duration,
    /// Multiplier applied to `idle_event_interval` until the first record is
    /// received.
    pub idle_before_data_multiplier: f64,
    pub idle_event_interval: Option<Duration>,
    pub idle_partition_event_interval: Option<Duration>,
    /// How often the liveness monitor inspects the last-poll timestamp.
    pub monitor_interval: Duration,
    /// The monitor publishes NonResponsive when the poll loop has not ticked
    /// for `monitor_interval * no_poll_threshold`.
    pub no_poll_threshold: f64,
    /// How long `start()` waits for the consumer thread to come up.
    pub consumer_start_timeout: Duration,
    pub ack_mode: AckMode,
    pub ack_count: u32,
    pub ack_time: Duration,
    /// Synchronous commits; async commits log failures through the commit log
    /// level instead of raising.
    pub sync_commits: bool,
    pub sync_commit_timeout: Duration,
    /// Retries for retriable commit failures (sync commits only).
    pub commit_retries: u32,
    /// Out-of-order completion mode: the ack handle may be completed from any
    /// thread, and commits are re-sequenced per partition.
    pub async_acks: bool,
    /// When set, an authentication failure sleeps this long and retries
    /// instead of stopping the container.
    pub auth_exception_retry_interval: Option<Duration>,
    pub stop_container_when_fenced: bool,
    /// Break mid-batch on stop instead of finishing the current poll's records.
    pub stop_immediate: bool,
    /// A pause request takes effect mid-batch, retaining the unconsumed tail.
    pub pause_immediate: bool,
    /// Re-send transactional offsets when the position advances past the last
    /// commit without records (e.g. after compaction).
    pub fix_tx_offsets: bool,
    /// Batch listeners receive one partition's slice per invocation.
    pub sub_batch_per_partition: bool,
    /// After a batch transaction rollback, route the batch through the error
    /// handler's batch recovery instead of the after-rollback processor alone.
    pub batch_recover_after_rollback: bool,
    /// Write the delivery-attempt header before the handler sees the record.
    pub delivery_attempt_header: bool,
    pub assignment_commit_option: AssignmentCommitOption,
    pub eos_mode: EosMode,
    /// Configuring a transactional id turns on transactional dispatch.
    pub transactional_id: Option<String>,
    pub transaction_timeout: Duration,
    pub commit_log_level: CommitLogLevel,
    pub metrics_enabled: bool,
    pub observation_enabled: bool,
    /// Opaque bytes surfaced to the listener through its context.
    pub listener_info: Option<Vec<u8>>,
    pub client_id: Option<String>,
    /// Mirrors the client `max.poll.interval.ms`; bounds idle-between-polls.
    pub max_poll_interval: Duration,
}

impl Default for ContainerProperties {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(5),
            poll_timeout_while_paused: Duration::from_millis(100),
            max_poll_records: 500,
            idle_between_polls: Duration::ZERO,
            idle_before_data_multiplier: 5.0,
            idle_event_interval: None,
            idle_partition_event_interval: None,
            monitor_interval: Duration::from_secs(30),
            no_poll_threshold: 3.0,
            consumer_start_timeout: Duration::from_secs(30),
            ack_mode: AckMode::default(),
            ack_count: 1,
            ack_time: Duration::from_secs(5),
            sync_commits: true,
            sync_commit_timeout: Duration::from_secs(30),
            commit_retries: 3,
            async_acks: false,
            auth_exception_retry_interval: None,
            stop_container_when_fenced: false,
            stop_immediate: false,
            pause_immediate: false,
            fix_tx_offsets: false,
            sub_batch_per_partition: false,
            batch_recover_after_rollback: false,
            delivery_attempt_header: false,
            assignment_commit_option: AssignmentCommitOption::default(),
            eos_mode: EosMode::default(),
            transactional_id: None,
            transaction_timeout: Duration::from_secs(10),
            commit_log_level: CommitLogLevel::default(),
            metrics_enabled: true,
            observation_enabled: false,
            listener_info: None,
            client_id: None,
            max_poll_interval: Duration::from_secs(300),
        }
    }
}

impl ContainerProperties {
    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_async_acks(mut self, async_acks: bool) -> Self {
        self.async_acks = async_acks;
        self
    }

    pub fn with_transactional_id(mut self, id: impl Into<String>) -> Self {
        self.transactional_id = Some(id.into());
        self
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional_id.is_some()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.async_acks && !self.ack_mode.is_manual() {
            return Err(ConfigError::new(
                "async_acks requires ack_mode Manual or ManualImmediate",
            ));
        }
        if matches!(self.ack_mode, AckMode::Count | AckMode::CountTime) && self.ack_count == 0 {
            return Err(ConfigError::new("ack_count must be positive"));
        }
        if matches!(self.ack_mode, AckMode::Time | AckMode::CountTime) && self.ack_time.is_zero() {
            return Err(ConfigError::new("ack_time must be positive"));
        }
        if self.max_poll_records == 0 {
            return Err(ConfigError::new("max_poll_records must be positive"));
        }
        if self.no_poll_threshold <= 0.0 {
            return Err(ConfigError::new("no_poll_threshold must be positive"));
        }
        if self.is_transactional() && self.ack_mode.is_manual() {
            return Err(ConfigError::new(
                "manual ack modes cannot be combined with transactions",
            ));
        }
        Ok(())
    }

    /// Poll timeout for this iteration, shortened while paused so the loop
    /// stays responsive to resume and stop requests.
    pub(crate) fn effective_poll_timeout(&self, consumer_paused: bool) -> Duration {
        if consumer_paused {
            self.poll_timeout_while_paused.min(self.poll_timeout)
        } else {
            self.poll_timeout
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ContainerProperties::default().validate().expect("defaults");
    }

    #[test]
    fn async_acks_require_manual_mode() {
        let props = ContainerProperties::default().with_async_acks(true);
        assert!(props.validate().is_err());

        let props = ContainerProperties::default()
            .with_ack_mode(AckMode::Manual)
            .with_async_acks(true);
        props.validate().expect("manual + async acks");
    }

    #[test]
    fn count_modes_need_positive_count() {
        let mut props = ContainerProperties::default().with_ack_mode(AckMode::Count);
        props.ack_count = 0;
        assert!(props.validate().is_err());
    }

    #[test]
    fn transactions_exclude_manual_acks() {
        let props = ContainerProperties::default()
            .with_ack_mode(AckMode::Manual)
            .with_transactional_id("txn-listener");
        assert!(props.validate().is_err());
    }

    #[test]
    fn paused_poll_timeout_is_shorter() {
        let props = ContainerProperties::default();
        assert_eq!(
            props.effective_poll_timeout(true),
            props.poll_timeout_while_paused
        );
        assert_eq!(props.effective_poll_timeout(false), props.poll_timeout);
    }
}
