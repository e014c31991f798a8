use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common_kafka::client::ConsumerClientBuilder;
use common_kafka::config::{ConsumerConfig, KafkaConfig};
use rdkafka::consumer::Consumer;
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use crate::config::ContainerProperties;
use crate::error_handler::{
    AfterRollbackProcessor, DefaultAfterRollbackProcessor, DefaultErrorHandler, ErrorHandler,
};
use crate::errors::{ConfigError, ContainerError};
use crate::events::{ContainerEvent, ConsumerStoppedReason, EventSink, TracingEventSink};
use crate::idle::{non_responsive_threshold, IdleTracker};
use crate::intercept::{BatchInterceptor, RecordInterceptor};
use crate::listener::{ListenerContext, MessageListener, SeekAware};
use crate::rebalance::{DefaultRebalanceHooks, ListenerClient, ListenerClientContext, RebalanceHooks};
use crate::run_loop::ListenerConsumer;
use crate::seek::SeekHandle;
use crate::shared::ContainerShared;
use crate::transaction::{TxnCoordinator, TxnProducerFactory};
use crate::types::TopicPartition;

/// Explicit registration API for one single-consumer listener runtime:
/// configure a handler, a subscription (topics or a manual assignment), and
/// the container properties, then `start()` to get a running container
/// handle.
pub struct ListenerContainerBuilder {
    kafka_config: KafkaConfig,
    consumer_config: ConsumerConfig,
    client_overrides: Vec<(String, String)>,
    topics: Option<Vec<String>>,
    assignment: Option<Vec<(TopicPartition, Option<i64>)>>,
    properties: ContainerProperties,
    listener: Option<MessageListener>,
    error_handler: Arc<dyn ErrorHandler>,
    record_interceptor: Option<Arc<dyn RecordInterceptor>>,
    batch_interceptor: Option<Arc<dyn BatchInterceptor>>,
    after_rollback: Arc<dyn AfterRollbackProcessor>,
    rebalance_hooks: Arc<dyn RebalanceHooks>,
    seek_aware: Option<Arc<dyn SeekAware>>,
    event_sink: Arc<dyn EventSink>,
    txn_factory: Option<TxnProducerFactory>,
    id: Option<String>,
}

impl ListenerContainerBuilder {
    pub fn new(kafka_config: KafkaConfig, consumer_config: ConsumerConfig) -> Self {
        Self {
            kafka_config,
            consumer_config,
            client_overrides: Vec::new(),
            topics: None,
            assignment: None,
            properties: ContainerProperties::default(),
            listener: None,
            error_handler: Arc::new(DefaultErrorHandler::default()),
            record_interceptor: None,
            batch_interceptor: None,
            after_rollback: Arc::new(DefaultAfterRollbackProcessor::default()),
            rebalance_hooks: Arc::new(DefaultRebalanceHooks),
            seek_aware: None,
            event_sink: Arc::new(TracingEventSink),
            txn_factory: None,
            id: None,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn topics(mut self, topics: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.topics = Some(topics.into_iter().map(Into::into).collect());
        self
    }

    /// Manual partition assignment (no group rebalancing for these); each
    /// entry optionally carries the initial offset to start from.
    pub fn assignment(
        mut self,
        assignment: impl IntoIterator<Item = (TopicPartition, Option<i64>)>,
    ) -> Self {
        self.assignment = Some(assignment.into_iter().collect());
        self
    }

    pub fn properties(mut self, properties: ContainerProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn listener(mut self, listener: MessageListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    pub fn record_interceptor(mut self, interceptor: Arc<dyn RecordInterceptor>) -> Self {
        self.record_interceptor = Some(interceptor);
        self
    }

    pub fn batch_interceptor(mut self, interceptor: Arc<dyn BatchInterceptor>) -> Self {
        self.batch_interceptor = Some(interceptor);
        self
    }

    pub fn after_rollback_processor(mut self, processor: Arc<dyn AfterRollbackProcessor>) -> Self {
        self.after_rollback = processor;
        self
    }

    pub fn rebalance_hooks(mut self, hooks: Arc<dyn RebalanceHooks>) -> Self {
        self.rebalance_hooks = hooks;
        self
    }

    pub fn seek_aware(mut self, seek_aware: Arc<dyn SeekAware>) -> Self {
        self.seek_aware = Some(seek_aware);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Supplying a factory (together with `transactional_id` in the
    /// properties) turns on transactional dispatch; the factory is re-used
    /// to replace a fenced producer.
    pub fn transactional_producer_factory(mut self, factory: TxnProducerFactory) -> Self {
        self.txn_factory = Some(factory);
        self
    }

    /// Raw client config override, applied last.
    pub fn client_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.client_overrides.push((key.into(), value.into()));
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.properties.validate()?;
        let Some(listener) = &self.listener else {
            return Err(ConfigError::new("a listener is required"));
        };
        if self.topics.is_none() && self.assignment.is_none() {
            return Err(ConfigError::new(
                "either topics or a manual assignment is required",
            ));
        }
        if self.topics.is_some() && self.assignment.is_some() {
            return Err(ConfigError::new(
                "topics and manual assignment are mutually exclusive",
            ));
        }
        if self.properties.is_transactional() {
            if self.txn_factory.is_none() {
                return Err(ConfigError::new(
                    "transactional_id is set but no producer factory was supplied",
                ));
            }
            if listener.wants_ack() {
                return Err(ConfigError::new(
                    "acknowledging listeners cannot be combined with transactions",
                ));
            }
        }
        if self.txn_factory.is_some() && !self.properties.is_transactional() {
            return Err(ConfigError::new(
                "a producer factory was supplied but transactional_id is not set",
            ));
        }
        Ok(())
    }

    /// Create the consumer, subscribe or assign, and spawn the consumer
    /// thread and the liveness monitor.
    pub fn start(self) -> Result<MessageListenerContainer, ContainerError> {
        self.validate()?;

        let group_id = self.consumer_config.kafka_consumer_group.clone();
        let reset_policy = self.consumer_config.kafka_consumer_offset_reset.clone();
        let auto_commit = self.consumer_config.kafka_consumer_auto_commit;
        let id = self
            .id
            .clone()
            .unwrap_or_else(|| format!("{group_id}-listener"));

        let shared = ContainerShared::new(
            id.clone(),
            group_id.clone(),
            reset_policy,
            self.properties.clone(),
            self.event_sink.clone(),
        );
        shared.running.store(true, Ordering::SeqCst);
        shared.publish(ContainerEvent::Starting);

        let txn = match self.txn_factory {
            Some(factory) => match TxnCoordinator::new(factory) {
                Ok(coordinator) => Some(coordinator),
                Err(e) => {
                    shared.publish(ContainerEvent::FailedToStart);
                    return Err(ContainerError::Kafka(e));
                }
            },
            None => None,
        };

        let mut client_builder =
            ConsumerClientBuilder::new(&self.kafka_config, &self.consumer_config);
        if let Some(client_id) = &self.properties.client_id {
            client_builder = client_builder.with_client_id(client_id);
        }
        for (key, value) in &self.client_overrides {
            client_builder = client_builder.set(key, value);
        }
        let client_config = client_builder.build();

        let context = ListenerClientContext::new(
            shared.clone(),
            self.rebalance_hooks,
            self.error_handler.clone(),
            self.seek_aware.clone(),
        );
        let consumer: ListenerClient = match client_config.create_with_context(context) {
            Ok(consumer) => consumer,
            Err(e) => {
                shared.publish(ContainerEvent::FailedToStart);
                return Err(ContainerError::Kafka(e));
            }
        };

        match (&self.topics, &self.assignment) {
            (Some(topics), None) => {
                let refs: Vec<&str> = topics.iter().map(String::as_str).collect();
                consumer.subscribe(&refs)?;
                info!(container = id, ?topics, "subscribed");
            }
            (None, Some(assignment)) => {
                let mut tpl = TopicPartitionList::new();
                for (tp, offset) in assignment {
                    let offset = match offset {
                        Some(offset) => Offset::Offset(*offset),
                        None => Offset::Invalid,
                    };
                    tpl.add_partition_offset(tp.topic(), tp.partition(), offset)?;
                }
                consumer.assign(&tpl)?;
                // manual assignment bypasses the rebalance callbacks
                *shared.assignment.lock().unwrap() =
                    assignment.iter().map(|(tp, _)| tp.clone()).collect();
                info!(container = id, count = assignment.len(), "manually assigned");
            }
            _ => unreachable!("validated above"),
        }

        let ctx = ListenerContext::new(
            group_id.clone(),
            self.properties.client_id.clone(),
            self.properties.listener_info.clone(),
        );
        let consumer_loop = ListenerConsumer {
            consumer,
            shared: shared.clone(),
            listener: self.listener.expect("validated above"),
            error_handler: self.error_handler,
            record_interceptor: self.record_interceptor,
            batch_interceptor: self.batch_interceptor,
            after_rollback: self.after_rollback,
            txn,
            seek_aware: self.seek_aware,
            seek_handle: SeekHandle::new(shared.seek_tx.clone()),
            ctx,
            idle: IdleTracker::new(Instant::now()),
            auto_commit,
            auth_retrying: false,
            consumer_paused_published: false,
        };

        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let thread = std::thread::Builder::new()
            .name(format!("{id}-consumer"))
            .spawn(move || consumer_loop.run(started_tx))
            .map_err(|e| ConfigError::new(format!("failed to spawn consumer thread: {e}")))?;

        if started_rx
            .recv_timeout(self.properties.consumer_start_timeout)
            .is_err()
        {
            shared.publish(ContainerEvent::FailedToStart);
        }

        let monitor = spawn_monitor(shared.clone());

        Ok(MessageListenerContainer {
            seek_handle: SeekHandle::new(shared.seek_tx.clone()),
            shared,
            thread: Some(thread),
            monitor: Some(monitor),
        })
    }
}

/// The liveness monitor runs outside the poll loop and reports a consumer
/// that stopped polling.
fn spawn_monitor(shared: Arc<ContainerShared>) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("{}-monitor", shared.id))
        .spawn(move || {
            let threshold = non_responsive_threshold(&shared.props);
            let mut next_check = Instant::now() + shared.props.monitor_interval;
            while shared.is_running() {
                std::thread::sleep(Duration::from_millis(200));
                if Instant::now() < next_check {
                    continue;
                }
                next_check = Instant::now() + shared.props.monitor_interval;
                let since_last_poll = shared.since_last_poll();
                if since_last_poll > threshold {
                    shared.publish(ContainerEvent::NonResponsive { since_last_poll });
                }
            }
            debug!(container = shared.id, "liveness monitor stopped");
        })
        .expect("failed to spawn monitor thread")
}

/// Handle to a running container. Pause, resume, and seek requests enqueue
/// for the consumer thread; `stop` joins it.
pub struct MessageListenerContainer {
    shared: Arc<ContainerShared>,
    thread: Option<std::thread::JoinHandle<ConsumerStoppedReason>>,
    monitor: Option<std::thread::JoinHandle<()>>,
    seek_handle: SeekHandle,
}

impl MessageListenerContainer {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn group_id(&self) -> &str {
        &self.shared.group_id
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Whether the consumer thread reached its first poll cycle.
    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    /// Pause the whole consumer at the next reconciliation point.
    pub fn pause(&self) {
        self.shared.sync.lock().unwrap().pause.request_pause();
    }

    pub fn resume(&self) {
        self.shared.sync.lock().unwrap().pause.request_resume();
    }

    pub fn is_pause_requested(&self) -> bool {
        self.shared.sync.lock().unwrap().pause.is_pause_requested()
    }

    pub fn pause_partitions(&self, partitions: &[TopicPartition]) {
        self.shared
            .sync
            .lock()
            .unwrap()
            .pause
            .request_pause_partitions(partitions);
    }

    pub fn resume_partitions(&self, partitions: &[TopicPartition]) {
        self.shared
            .sync
            .lock()
            .unwrap()
            .pause
            .request_resume_partitions(partitions);
    }

    /// Seek callback usable from any thread.
    pub fn seek_handle(&self) -> SeekHandle {
        self.seek_handle.clone()
    }

    // Introspection surface, for tests and operational tooling.

    pub fn assignment(&self) -> Vec<TopicPartition> {
        self.shared.assignment()
    }

    pub fn paused_partitions(&self) -> Vec<TopicPartition> {
        self.shared.sync.lock().unwrap().pause.paused_partitions()
    }

    pub fn retained_record_count(&self) -> usize {
        self.shared.retained_count()
    }

    pub fn time_since_last_poll(&self) -> Duration {
        self.shared.since_last_poll()
    }

    /// Request a stop without waiting for the consumer thread.
    pub fn request_stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
    }

    /// Stop and join the consumer thread; idempotent with `request_stop`.
    /// The loop notices the flag within the poll timeout, commits pending
    /// acks, and closes the consumer.
    pub fn stop(mut self) -> ConsumerStoppedReason {
        self.request_stop();
        let reason = match self.thread.take() {
            Some(thread) => match thread.join() {
                Ok(reason) => reason,
                Err(_) => {
                    warn!("consumer thread panicked");
                    ConsumerStoppedReason::Error
                }
            },
            None => ConsumerStoppedReason::Normal,
        };
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.join();
        }
        reason
    }
}

impl Drop for MessageListenerContainer {
    fn drop(&mut self) {
        // don't leave the consumer thread running unattended
        self.shared.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envconfig::Envconfig;

    fn configs() -> (KafkaConfig, ConsumerConfig) {
        ConsumerConfig::set_defaults("container-builder-test", false);
        (
            KafkaConfig::init_from_env().expect("kafka env"),
            ConsumerConfig::init_from_env().expect("consumer env"),
        )
    }

    fn record_listener() -> MessageListener {
        MessageListener::Record(Box::new(|_, _| Ok(())))
    }

    #[test]
    fn listener_is_required() {
        let (kafka, consumer) = configs();
        let builder = ListenerContainerBuilder::new(kafka, consumer).topics(["events"]);
        assert!(builder.validate().is_err());
    }

    #[test]
    fn subscription_is_required() {
        let (kafka, consumer) = configs();
        let builder = ListenerContainerBuilder::new(kafka, consumer).listener(record_listener());
        assert!(builder.validate().is_err());
    }

    #[test]
    fn topics_and_assignment_are_exclusive() {
        let (kafka, consumer) = configs();
        let builder = ListenerContainerBuilder::new(kafka, consumer)
            .listener(record_listener())
            .topics(["events"])
            .assignment([(TopicPartition::new("events", 0), None)]);
        assert!(builder.validate().is_err());
    }

    #[test]
    fn transactional_id_requires_factory() {
        let (kafka, consumer) = configs();
        let builder = ListenerContainerBuilder::new(kafka, consumer)
            .listener(record_listener())
            .topics(["events"])
            .properties(ContainerProperties::default().with_transactional_id("txn-1"));
        assert!(builder.validate().is_err());
    }

    #[test]
    fn valid_builder_passes_validation() {
        let (kafka, consumer) = configs();
        let builder = ListenerContainerBuilder::new(kafka, consumer)
            .listener(record_listener())
            .topics(["events"]);
        builder.validate().expect("valid");
    }
}
