use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

use crate::types::TopicPartition;

#[derive(Debug, Error)]
#[error("invalid container configuration: {0}")]
pub struct ConfigError(String);

impl ConfigError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Failure raised by (or on behalf of) a listener invocation, routed through
/// the error-handler bridge.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listener execution failed for group {group_id}: {source}")]
    ExecutionFailed {
        group_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// The record carried a deserialization-failure header; raised before the
    /// listener is invoked.
    #[error("deserialization failed for {partition} offset {offset}: {detail}")]
    Deserialization {
        partition: TopicPartition,
        offset: i64,
        detail: String,
    },

    /// Programmer error in acknowledgement usage: stale out-of-order ack,
    /// nack off the consumer thread, nack under async acks, non-increasing
    /// partial-batch index.
    #[error("illegal acknowledgement: {0}")]
    IllegalAck(String),
}

impl ListenerError {
    pub fn execution(group_id: impl Into<String>, source: anyhow::Error) -> Self {
        Self::ExecutionFailed {
            group_id: group_id.into(),
            source,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ListenerError::IllegalAck(_))
    }
}

/// Terminal and infrastructure failures of the consumer loop itself.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error(transparent)]
    Kafka(#[from] KafkaError),

    #[error("no offset available for {partitions:?} and reset policy is none")]
    NoOffset { partitions: Vec<TopicPartition> },

    #[error("instance fenced: {0}")]
    Fenced(String),

    #[error("authentication failed: {0}")]
    Auth(KafkaError),

    #[error("emergency stop: {0}")]
    EmergencyStop(String),

    #[error("commit failed: {0}")]
    CommitFailed(KafkaError),

    #[error("stop requested")]
    Stopped,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Classification helpers over the raw client errors. Mirrors the way the
/// poll loop discriminates transient, retriable, and terminal conditions.
pub(crate) fn error_code(err: &KafkaError) -> Option<RDKafkaErrorCode> {
    match err {
        KafkaError::MessageConsumption(code)
        | KafkaError::MessageConsumptionFatal(code)
        | KafkaError::ConsumerCommit(code)
        | KafkaError::Global(code)
        | KafkaError::OffsetFetch(code)
        | KafkaError::MetadataFetch(code) => Some(*code),
        KafkaError::Transaction(e) => Some(e.code()),
        _ => None,
    }
}

pub(crate) fn is_auth_error(err: &KafkaError) -> bool {
    matches!(
        error_code(err),
        Some(RDKafkaErrorCode::Authentication)
            | Some(RDKafkaErrorCode::SaslAuthenticationFailed)
            | Some(RDKafkaErrorCode::TopicAuthorizationFailed)
            | Some(RDKafkaErrorCode::GroupAuthorizationFailed)
    )
}

pub(crate) fn is_fenced_error(err: &KafkaError) -> bool {
    matches!(
        error_code(err),
        Some(RDKafkaErrorCode::Fenced)
            | Some(RDKafkaErrorCode::FencedInstanceId)
            | Some(RDKafkaErrorCode::InvalidProducerEpoch)
    )
}

pub(crate) fn is_rebalance_in_progress(err: &KafkaError) -> bool {
    matches!(error_code(err), Some(RDKafkaErrorCode::RebalanceInProgress))
}

pub(crate) fn is_no_offset_error(err: &KafkaError) -> bool {
    matches!(error_code(err), Some(RDKafkaErrorCode::AutoOffsetReset))
}

/// Commit failures worth retrying up to `commit_retries` times.
pub(crate) fn is_retriable_commit(err: &KafkaError) -> bool {
    matches!(
        error_code(err),
        Some(RDKafkaErrorCode::RequestTimedOut)
            | Some(RDKafkaErrorCode::OperationTimedOut)
            | Some(RDKafkaErrorCode::NetworkException)
            | Some(RDKafkaErrorCode::CoordinatorLoadInProgress)
            | Some(RDKafkaErrorCode::CoordinatorNotAvailable)
            | Some(RDKafkaErrorCode::NotCoordinator)
    )
}

/// Fatal poll failures: the loop exits rather than retrying.
pub(crate) fn is_fatal_consumer_error(err: &KafkaError) -> bool {
    if matches!(err, KafkaError::MessageConsumptionFatal(_)) {
        return true;
    }
    is_fenced_error(err) || is_no_offset_error(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_are_classified() {
        let err = KafkaError::Global(RDKafkaErrorCode::Authentication);
        assert!(is_auth_error(&err));
        assert!(!is_fenced_error(&err));
    }

    #[test]
    fn rebalance_in_progress_is_not_retriable_commit() {
        let err = KafkaError::ConsumerCommit(RDKafkaErrorCode::RebalanceInProgress);
        assert!(is_rebalance_in_progress(&err));
        assert!(!is_retriable_commit(&err));
    }

    #[test]
    fn timed_out_commit_is_retriable() {
        let err = KafkaError::ConsumerCommit(RDKafkaErrorCode::RequestTimedOut);
        assert!(is_retriable_commit(&err));
    }

    #[test]
    fn fatal_classification_covers_fencing_and_reset_none() {
        assert!(is_fatal_consumer_error(&KafkaError::Global(
            RDKafkaErrorCode::FencedInstanceId
        )));
        assert!(is_fatal_consumer_error(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::AutoOffsetReset
        )));
        assert!(!is_fatal_consumer_error(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::OperationTimedOut
        )));
    }

    #[test]
    fn illegal_ack_is_fatal_listener_error() {
        assert!(ListenerError::IllegalAck("stale ack".into()).is_fatal());
        assert!(!ListenerError::execution("g", anyhow::anyhow!("boom")).is_fatal());
    }
}
