use common_kafka::transaction::{KafkaTransaction, TransactionalProducer};
use rdkafka::error::KafkaError;
use tracing::{info, warn};

use crate::errors::is_fenced_error;

pub type TxnProducerFactory =
    Box<dyn Fn() -> Result<TransactionalProducer, KafkaError> + Send + Sync>;

/// Owns the transactional producer for one consumer. A fenced producer is
/// terminal for the instance; unless the container is configured to stop on
/// fencing, a replacement is created from the factory and processing
/// continues.
pub(crate) struct TxnCoordinator {
    producer: TransactionalProducer,
    factory: TxnProducerFactory,
}

impl TxnCoordinator {
    pub fn new(factory: TxnProducerFactory) -> Result<Self, KafkaError> {
        let producer = factory()?;
        Ok(Self { producer, factory })
    }

    pub fn begin(&mut self) -> Result<KafkaTransaction<'_>, KafkaError> {
        self.producer.begin()
    }

    /// Replace a fenced producer with a fresh one from the factory.
    pub fn recreate(&mut self) -> Result<(), KafkaError> {
        info!("re-creating transactional producer after fencing");
        self.producer = (self.factory)()?;
        Ok(())
    }

    /// Handle a transactional failure: returns true when the error was a
    /// fencing (the caller decides whether that stops the container).
    pub fn note_failure(&mut self, error: &KafkaError, stop_when_fenced: bool) -> bool {
        if !is_fenced_error(error) {
            return false;
        }
        warn!("transactional producer fenced: {error}");
        if !stop_when_fenced {
            if let Err(e) = self.recreate() {
                warn!("failed to re-create fenced producer: {e}");
            }
        }
        true
    }
}
