use rdkafka::message::OwnedMessage;

use crate::errors::ListenerError;
use crate::rebalance::ListenerClient;

/// Hooks around each record invocation. `early_intercept` runs outside any
/// transaction; `intercept` runs inside one when transactions are configured.
/// Returning `None` from either acknowledges the record and skips the
/// listener.
pub trait RecordInterceptor: Send + Sync {
    fn early_intercept(
        &self,
        record: OwnedMessage,
        _client: &ListenerClient,
    ) -> Option<OwnedMessage> {
        Some(record)
    }

    fn intercept(&self, record: OwnedMessage, _client: &ListenerClient) -> Option<OwnedMessage> {
        Some(record)
    }

    fn success(&self, _record: &OwnedMessage, _client: &ListenerClient) {}

    fn failure(&self, _record: &OwnedMessage, _error: &ListenerError, _client: &ListenerClient) {}

    /// Runs after the record completes, success or failure, outside any
    /// transaction.
    fn after_record(&self, _record: &OwnedMessage, _client: &ListenerClient) {}
}

/// Batch-shaped variant of `RecordInterceptor`.
pub trait BatchInterceptor: Send + Sync {
    fn intercept(
        &self,
        records: Vec<OwnedMessage>,
        _client: &ListenerClient,
    ) -> Option<Vec<OwnedMessage>> {
        Some(records)
    }

    fn success(&self, _records: &[OwnedMessage], _client: &ListenerClient) {}

    fn failure(
        &self,
        _records: &[OwnedMessage],
        _error: &ListenerError,
        _client: &ListenerClient,
    ) {
    }
}
