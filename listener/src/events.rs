use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::types::TopicPartition;

/// Why the consumer loop exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStoppedReason {
    /// Clean stop requested through the container.
    Normal,
    /// The loop exited without a stop request (e.g. emergency stop).
    Abnormal,
    /// An unclassified error escaped the loop.
    Error,
    /// A producer or consumer instance was fenced by a newer one.
    Fenced,
    /// Unrecoverable authentication failure.
    Auth,
    /// No offset for a partition and the reset policy is "none".
    NoOffset,
}

#[derive(Debug, Clone)]
pub enum ContainerEvent {
    Starting,
    Started,
    FailedToStart,
    /// Whole-consumer pause took effect.
    Paused,
    Resumed,
    PartitionsPaused {
        partitions: Vec<TopicPartition>,
    },
    PartitionsResumed {
        partitions: Vec<TopicPartition>,
    },
    Idle {
        idle_for: Duration,
    },
    NoLongerIdle,
    PartitionIdle {
        partition: TopicPartition,
        idle_for: Duration,
    },
    PartitionNoLongerIdle {
        partition: TopicPartition,
    },
    /// Published by the liveness monitor, not the poll loop.
    NonResponsive {
        since_last_poll: Duration,
    },
    Stopping,
    Stopped {
        reason: ConsumerStoppedReason,
    },
    RetryAuth {
        error: String,
    },
    RetryAuthSuccessful,
}

/// Sink for container lifecycle events. Events that carry consumer-thread
/// state are published from the consumer thread, so implementations must not
/// block for long.
pub trait EventSink: Send + Sync {
    fn publish(&self, container_id: &str, event: ContainerEvent);
}

/// Default sink: structured log lines.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, container_id: &str, event: ContainerEvent) {
        match &event {
            ContainerEvent::Starting => info!(container = container_id, "consumer starting"),
            ContainerEvent::Started => info!(container = container_id, "consumer started"),
            ContainerEvent::FailedToStart => {
                error!(container = container_id, "consumer failed to start in time")
            }
            ContainerEvent::Paused => info!(container = container_id, "consumer paused"),
            ContainerEvent::Resumed => info!(container = container_id, "consumer resumed"),
            ContainerEvent::PartitionsPaused { partitions } => {
                info!(container = container_id, ?partitions, "partitions paused")
            }
            ContainerEvent::PartitionsResumed { partitions } => {
                info!(container = container_id, ?partitions, "partitions resumed")
            }
            ContainerEvent::Idle { idle_for } => {
                debug!(container = container_id, ?idle_for, "consumer idle")
            }
            ContainerEvent::NoLongerIdle => {
                debug!(container = container_id, "consumer no longer idle")
            }
            ContainerEvent::PartitionIdle { partition, idle_for } => debug!(
                container = container_id,
                partition = %partition,
                ?idle_for,
                "partition idle"
            ),
            ContainerEvent::PartitionNoLongerIdle { partition } => debug!(
                container = container_id,
                partition = %partition,
                "partition no longer idle"
            ),
            ContainerEvent::NonResponsive { since_last_poll } => warn!(
                container = container_id,
                ?since_last_poll,
                "consumer is not polling"
            ),
            ContainerEvent::Stopping => info!(container = container_id, "consumer stopping"),
            ContainerEvent::Stopped { reason } => {
                info!(container = container_id, ?reason, "consumer stopped")
            }
            ContainerEvent::RetryAuth { error } => warn!(
                container = container_id,
                error, "authentication failed, will retry"
            ),
            ContainerEvent::RetryAuthSuccessful => {
                info!(container = container_id, "authentication recovered")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingEventSink {
        events: Mutex<Vec<ContainerEvent>>,
    }

    impl EventSink for RecordingEventSink {
        fn publish(&self, _container_id: &str, event: ContainerEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[test]
    fn sink_receives_events_in_order() {
        let sink = RecordingEventSink {
            events: Mutex::new(Vec::new()),
        };
        sink.publish("c", ContainerEvent::Starting);
        sink.publish("c", ContainerEvent::Started);
        sink.publish(
            "c",
            ContainerEvent::Stopped {
                reason: ConsumerStoppedReason::Normal,
            },
        );

        let events = sink.events.lock().unwrap();
        assert!(matches!(events[0], ContainerEvent::Starting));
        assert!(matches!(events[1], ContainerEvent::Started));
        assert!(matches!(
            events[2],
            ContainerEvent::Stopped {
                reason: ConsumerStoppedReason::Normal
            }
        ));
    }

    #[test]
    fn tracing_sink_handles_every_variant() {
        let sink = TracingEventSink;
        sink.publish("c", ContainerEvent::NonResponsive {
            since_last_poll: Duration::from_secs(90),
        });
        sink.publish("c", ContainerEvent::PartitionIdle {
            partition: TopicPartition::new("events", 0),
            idle_for: Duration::from_secs(60),
        });
        sink.publish("c", ContainerEvent::RetryAuth {
            error: "sasl".into(),
        });
    }
}
