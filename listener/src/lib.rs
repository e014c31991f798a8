//! Single-consumer Kafka message listener runtime.
//!
//! One container drives one consumer through its lifecycle: subscribing or
//! assigning partitions, polling, dispatching records to a handler, managing
//! offset commits under the configured acknowledgement mode, coordinating
//! transactions, pausing/resuming partitions, honoring nacks and seeks, and
//! routing failures through a pluggable error handler. Everything touching
//! the (non-thread-safe) client happens on one dedicated consumer thread;
//! other threads communicate through queues and the pause/seek request APIs.

pub mod ack;
pub mod config;
pub mod container;
pub mod error_handler;
pub mod errors;
pub mod events;
pub mod intercept;
pub mod listener;
pub mod seek;
pub mod types;

mod dispatch;
mod idle;
mod metrics_consts;
mod offsets;
mod pause;
mod rebalance;
mod run_loop;
mod shared;
mod transaction;

pub use ack::Acknowledgment;
pub use config::{AckMode, AssignmentCommitOption, CommitLogLevel, ContainerProperties, EosMode};
pub use container::{ListenerContainerBuilder, MessageListenerContainer};
pub use dispatch::{DELIVERY_ATTEMPT_HEADER, DESERIALIZER_ERROR_HEADER};
pub use error_handler::{
    AfterRollbackProcessor, DefaultAfterRollbackProcessor, DefaultErrorHandler, ErrorHandler,
    FixedBackOff,
};
pub use errors::{ConfigError, ContainerError, ListenerError};
pub use events::{ContainerEvent, ConsumerStoppedReason, EventSink, TracingEventSink};
pub use listener::{ListenerContext, MessageListener, PolledRecords, SeekAware};
pub use rebalance::{DefaultRebalanceHooks, ListenerClient, RebalanceHooks};
pub use seek::{SeekHandle, SeekRequest, SeekTarget};
pub use transaction::TxnProducerFactory;
pub use types::{OffsetAndMetadata, TopicPartition, TopicPartitionOffset};
