use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rdkafka::consumer::{CommitMode, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::message::OwnedMessage;
use rdkafka::{Message, Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::config::AckMode;
use crate::error_handler::{AfterRollbackProcessor, ErrorHandler};
use crate::errors::{
    is_auth_error, is_fatal_consumer_error, is_fenced_error, is_no_offset_error,
    is_rebalance_in_progress, is_retriable_commit, ContainerError,
};
use crate::events::{ContainerEvent, ConsumerStoppedReason};
use crate::idle::IdleTracker;
use crate::intercept::{BatchInterceptor, RecordInterceptor};
use crate::listener::{ListenerContext, MessageListener, SeekAware};
use crate::metrics_consts::{
    LISTENER_COMMITS_FAILED, LISTENER_COMMITS_ISSUED, LISTENER_COMMITS_RETAINED,
    LISTENER_EMERGENCY_STOPS, LISTENER_POLL_INTERVAL_MS, LISTENER_POLL_RECORDS,
    LISTENER_SEEKS_APPLIED, LISTENER_SEEKS_DROPPED,
};
use crate::rebalance::{
    commit_sync, log_commit, partition_positions, pause_partitions, resume_partitions,
    ListenerClient,
};
use crate::seek::{clamp_offset, split_requests, SeekHandle, SeekRequest, SeekTarget};
use crate::shared::ContainerShared;
use crate::transaction::TxnCoordinator;
use crate::types::{OffsetAndMetadata, TopicPartition};

/// Margin kept from `max.poll.interval.ms` when sleeping between polls, so a
/// configured idle can never push the consumer out of the group.
const POLL_INTERVAL_MARGIN: Duration = Duration::from_secs(5);

/// The single thread of control for one consumer: polls, dispatches, commits,
/// and owns every interaction with the (non-thread-safe) client.
pub(crate) struct ListenerConsumer {
    pub(crate) consumer: ListenerClient,
    pub(crate) shared: Arc<ContainerShared>,
    pub(crate) listener: MessageListener,
    pub(crate) error_handler: Arc<dyn ErrorHandler>,
    pub(crate) record_interceptor: Option<Arc<dyn RecordInterceptor>>,
    pub(crate) batch_interceptor: Option<Arc<dyn BatchInterceptor>>,
    pub(crate) after_rollback: Arc<dyn AfterRollbackProcessor>,
    pub(crate) txn: Option<TxnCoordinator>,
    pub(crate) seek_aware: Option<Arc<dyn SeekAware>>,
    pub(crate) seek_handle: SeekHandle,
    pub(crate) ctx: ListenerContext,
    pub(crate) idle: IdleTracker,
    pub(crate) auto_commit: bool,
    pub(crate) auth_retrying: bool,
    pub(crate) consumer_paused_published: bool,
}

impl ListenerConsumer {
    pub fn run(mut self, started_tx: std::sync::mpsc::Sender<()>) -> ConsumerStoppedReason {
        if let Some(seek_aware) = &self.seek_aware {
            seek_aware.register_seek_callback(self.seek_handle.clone());
        }
        self.shared.started.store(true, Ordering::SeqCst);
        let _ = started_tx.send(());
        self.shared.publish(ContainerEvent::Started);

        // nothing may escape the top-level run; a panicking listener turns
        // into an abnormal stop with its event, not a dead silent thread
        let reason =
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.run_inner())) {
                Ok(reason) => reason,
                Err(_) => {
                    error!("listener panicked; stopping consumer");
                    ConsumerStoppedReason::Error
                }
            };

        self.shared.publish(ContainerEvent::Stopping);
        self.shared.running.store(false, Ordering::SeqCst);
        if reason == ConsumerStoppedReason::Normal {
            // commit whatever was acked before closing
            self.shared.drain_acks_into_ledger();
            if let Err(e) = self.commit_pending_now() {
                warn!("final commit on stop failed: {e}");
            }
        }
        self.consumer.unsubscribe();
        debug!("consumer unsubscribed");
        self.shared.publish(ContainerEvent::Stopped { reason });
        reason
    }

    fn run_inner(&mut self) -> ConsumerStoppedReason {
        while self.shared.is_running() {
            match self.poll_and_invoke() {
                Ok(()) => {}
                Err(ContainerError::Stopped) => return ConsumerStoppedReason::Normal,
                Err(e) => {
                    let reason = stopped_reason(&e);
                    error!("consumer loop exiting: {e}");
                    return reason;
                }
            }
        }
        ConsumerStoppedReason::Normal
    }

    /// One iteration of the poll-and-invoke cycle, in its fixed order.
    fn poll_and_invoke(&mut self) -> Result<(), ContainerError> {
        self.process_deferred_failures()?;
        if let Some(detail) = self.shared.fatal_ack.lock().unwrap().take() {
            metrics::counter!(LISTENER_EMERGENCY_STOPS).increment(1);
            return Err(ContainerError::EmergencyStop(detail));
        }

        let immediate = self.shared.drain_acks_into_ledger();
        if immediate {
            self.commit_pending_now()?;
        } else if !self.auto_commit && self.shared.props.ack_mode != AckMode::Record {
            self.commit_if_due()?;
        }

        if self.shared.props.fix_tx_offsets && self.txn.is_some() {
            self.fix_tx_offsets()?;
        }

        self.sleep_between_polls();
        self.apply_seeks();

        let effectively_paused = self.reconcile_pauses();
        let poll_started = Instant::now();
        let records = self.poll_records(effectively_paused)?;
        self.shared.touch_poll_clock();
        metrics::histogram!(LISTENER_POLL_INTERVAL_MS)
            .record(poll_started.elapsed().as_millis() as f64);

        // a stop that arrived while blocked in poll discards the records
        if !self.shared.is_running() {
            return Err(ContainerError::Stopped);
        }

        let records = self.merge_retained(records)?;
        metrics::histogram!(LISTENER_POLL_RECORDS).record(records.len() as f64);

        let partitions_with_data = partitions_of(&records);
        if !records.is_empty() {
            self.dispatch(records)?;
        }

        self.idle
            .on_assignment(&self.shared.assignment(), Instant::now());
        let idle_events =
            self.idle
                .on_poll(&self.shared.props, &partitions_with_data, Instant::now());
        for event in idle_events {
            if matches!(event, ContainerEvent::Idle { .. }) {
                if let Some(seek_aware) = &self.seek_aware {
                    let assigned = self.shared.assignment();
                    let positions = partition_positions(&self.consumer, &assigned);
                    seek_aware.on_idle(&positions, &self.seek_handle);
                }
            }
            self.shared.publish(event);
        }

        self.reconcile_resumes();
        Ok(())
    }

    /// Failures reported by async completions are handed to the error
    /// handler before anything else happens in the iteration.
    fn process_deferred_failures(&mut self) -> Result<(), ContainerError> {
        let failures = std::mem::take(&mut *self.shared.pending_failures.lock().unwrap());
        for (message, detail) in failures {
            let error = crate::errors::ListenerError::execution(
                self.shared.group_id.clone(),
                anyhow::anyhow!(detail),
            );
            if self.error_handler.seeks_after_handling() {
                let records = vec![*message];
                self.error_handler
                    .handle_remaining(&error, &records, &self.consumer, &self.ctx);
            } else {
                let recovered =
                    self.error_handler
                        .handle_one(&error, &message, &self.consumer, &self.ctx);
                if recovered {
                    if self.error_handler.is_ack_after_handle() {
                        let tp = TopicPartition::new(message.topic(), message.partition());
                        self.shared
                            .ledger
                            .lock()
                            .unwrap()
                            .add_record(&tp, message.offset());
                    }
                } else {
                    self.retain_records(vec![*message])?;
                }
            }
        }
        Ok(())
    }

    /// Re-send transactional offsets for partitions whose position advanced
    /// past the last commit without a seek (e.g. compacted gaps).
    fn fix_tx_offsets(&mut self) -> Result<(), ContainerError> {
        let assigned = self.shared.assignment();
        if assigned.is_empty() {
            return Ok(());
        }
        let positions = partition_positions(&self.consumer, &assigned);
        let candidates = self
            .shared
            .ledger
            .lock()
            .unwrap()
            .fix_tx_candidates(&positions);
        if candidates.is_empty() {
            return Ok(());
        }

        let Some(metadata) = self.consumer.group_metadata() else {
            return Ok(());
        };
        let mut coordinator = self.txn.take().expect("fix_tx_offsets requires txn");
        let result = (|| -> Result<(), KafkaError> {
            let txn = coordinator.begin()?;
            // associate_offsets applies the +1; positions are already the
            // next offset, so step back by one record
            let entries = candidates
                .iter()
                .map(|(tp, position)| (tp.topic().to_string(), tp.partition(), position - 1))
                .collect();
            match txn.associate_offsets(entries, &metadata) {
                Ok(()) => txn.commit(),
                Err(e) => {
                    let _ = txn.abort();
                    Err(e)
                }
            }
        })();
        match result {
            Ok(()) => {
                info!(count = candidates.len(), "re-sent transactional offsets");
                let commits: HashMap<_, _> = candidates
                    .into_iter()
                    .map(|(tp, position)| (tp, OffsetAndMetadata::new(position)))
                    .collect();
                self.shared
                    .ledger
                    .lock()
                    .unwrap()
                    .on_commit_success(&commits, Instant::now());
                self.txn = Some(coordinator);
                Ok(())
            }
            Err(e) => {
                let fenced =
                    coordinator.note_failure(&e, self.shared.props.stop_container_when_fenced);
                self.txn = Some(coordinator);
                if fenced && self.shared.props.stop_container_when_fenced {
                    Err(ContainerError::Fenced(e.to_string()))
                } else {
                    warn!("fix-tx-offsets transaction failed: {e}");
                    Ok(())
                }
            }
        }
    }

    /// Optional throttle, capped so the consumer cannot exceed the max poll
    /// interval and drop out of the group.
    fn sleep_between_polls(&mut self) {
        let idle = self.shared.props.idle_between_polls;
        if idle.is_zero() || self.shared.assignment().is_empty() {
            return;
        }
        let elapsed = self.shared.since_last_poll();
        let cap = self
            .shared
            .props
            .max_poll_interval
            .saturating_sub(POLL_INTERVAL_MARGIN)
            .saturating_sub(elapsed);
        let sleep = idle.min(cap);
        if !sleep.is_zero() {
            std::thread::sleep(sleep);
        }
    }

    fn apply_seeks(&mut self) {
        let mut requests: Vec<SeekRequest> = Vec::new();
        {
            let mut seek_rx = self.shared.seek_rx.lock().unwrap();
            while let Ok(request) = seek_rx.try_recv() {
                requests.push(request);
            }
        }
        if requests.is_empty() {
            return;
        }

        let assigned = self.shared.assignment();
        let (direct, timestamps, dropped) = split_requests(requests, &assigned);
        for request in &dropped {
            warn!(partition = %request.partition, "dropping seek for unassigned partition");
        }
        if !dropped.is_empty() {
            metrics::counter!(LISTENER_SEEKS_DROPPED).increment(dropped.len() as u64);
        }

        for request in direct {
            if let Err(e) = self.apply_one_seek(&request) {
                warn!(partition = %request.partition, "seek failed: {e}");
            } else {
                metrics::counter!(LISTENER_SEEKS_APPLIED).increment(1);
            }
        }

        if !timestamps.is_empty() {
            self.apply_timestamp_seeks(timestamps);
        }
    }

    fn apply_one_seek(&self, request: &SeekRequest) -> Result<(), KafkaError> {
        let tp = &request.partition;
        let timeout = self.shared.props.sync_commit_timeout;
        let offset = match &request.target {
            SeekTarget::Absolute(offset) => Offset::Offset(clamp_offset(*offset)),
            SeekTarget::Beginning => Offset::Beginning,
            SeekTarget::End => Offset::End,
            SeekTarget::Relative { offset, to_current } => {
                let base = if *to_current {
                    self.position_of(tp)
                } else if *offset >= 0 {
                    self.consumer
                        .fetch_watermarks(tp.topic(), tp.partition(), timeout)
                        .map(|(low, _)| Some(low))?
                } else {
                    self.consumer
                        .fetch_watermarks(tp.topic(), tp.partition(), timeout)
                        .map(|(_, high)| Some(high))?
                };
                match base {
                    Some(base) => Offset::Offset(clamp_offset(base + offset)),
                    None => return Ok(()),
                }
            }
            SeekTarget::Function(f) => match self.position_of(tp) {
                Some(position) => Offset::Offset(clamp_offset(f(position))),
                None => return Ok(()),
            },
            SeekTarget::Timestamp(_) => unreachable!("timestamp seeks are batched"),
        };
        self.consumer.seek(tp.topic(), tp.partition(), offset, timeout)
    }

    /// All timestamp seeks resolved in one offsets-for-times round trip.
    fn apply_timestamp_seeks(&self, timestamps: HashMap<TopicPartition, i64>) {
        let timeout = self.shared.props.sync_commit_timeout;
        let mut lookup = TopicPartitionList::new();
        for (tp, ts) in &timestamps {
            if lookup
                .add_partition_offset(tp.topic(), tp.partition(), Offset::Offset(*ts))
                .is_err()
            {
                warn!(partition = %tp, "invalid timestamp seek");
            }
        }
        match self.consumer.offsets_for_times(lookup, timeout) {
            Ok(resolved) => {
                for elem in resolved.elements() {
                    let target = match elem.offset() {
                        Offset::Offset(offset) => Offset::Offset(offset),
                        // no record at or after the timestamp: go to the end
                        _ => Offset::End,
                    };
                    if let Err(e) =
                        self.consumer.seek(elem.topic(), elem.partition(), target, timeout)
                    {
                        warn!("timestamp seek failed for {}-{}: {e}", elem.topic(), elem.partition());
                    } else {
                        metrics::counter!(LISTENER_SEEKS_APPLIED).increment(1);
                    }
                }
            }
            Err(e) => warn!("offsets_for_times failed: {e}"),
        }
    }

    fn position_of(&self, tp: &TopicPartition) -> Option<i64> {
        partition_positions(&self.consumer, std::slice::from_ref(tp))
            .get(tp)
            .copied()
    }

    /// Apply due pauses before the poll; returns whether the whole consumer
    /// is effectively paused (shortening the poll timeout).
    fn reconcile_pauses(&mut self) -> bool {
        let assigned = self.shared.assignment();
        let retained = self.shared.retained_partitions();
        let (to_pause, effectively_paused) = {
            let mut sync = self.shared.sync.lock().unwrap();
            if !retained.is_empty() {
                sync.pause.set_retention_partitions(retained);
            }
            (
                sync.pause.pauses_due(&assigned),
                sync.pause.effectively_paused(&assigned),
            )
        };

        if !to_pause.is_empty() {
            match pause_partitions(&self.consumer, &to_pause) {
                Ok(()) => {
                    let mut sync = self.shared.sync.lock().unwrap();
                    sync.pause.mark_paused(&to_pause);
                    drop(sync);
                    metrics::gauge!(crate::metrics_consts::LISTENER_PARTITIONS_PAUSED)
                        .increment(to_pause.len() as f64);
                    self.shared
                        .publish(ContainerEvent::PartitionsPaused { partitions: to_pause });
                }
                Err(e) => warn!("pause reconciliation failed: {e}"),
            }
        }

        let pause_requested = self.shared.sync.lock().unwrap().pause.is_pause_requested();
        if pause_requested && effectively_paused && !self.consumer_paused_published {
            self.consumer_paused_published = true;
            self.shared.publish(ContainerEvent::Paused);
        }
        effectively_paused
    }

    /// Resumes run after dispatch, and never while records are retained.
    /// That covers every resume source, including an elapsed nack sleep:
    /// releasing it here folds the nacked partitions into the same gated
    /// resume pass (the seeks back to the nacked offsets were applied while
    /// the partitions were paused).
    fn reconcile_resumes(&mut self) {
        if self.shared.retained.lock().unwrap().is_some() {
            return;
        }
        let assigned = self.shared.assignment();
        let to_resume = {
            let mut sync = self.shared.sync.lock().unwrap();
            if sync.pause.nack_wakeup_due(Instant::now()) {
                let released = sync.pause.finish_nack_sleep();
                debug!(count = released.len(), "nack sleep elapsed");
            }
            sync.pause.resumes_due(&assigned)
        };
        if !to_resume.is_empty() {
            match resume_partitions(&self.consumer, &to_resume) {
                Ok(()) => {
                    let mut sync = self.shared.sync.lock().unwrap();
                    sync.pause.mark_resumed(&to_resume);
                    drop(sync);
                    metrics::gauge!(crate::metrics_consts::LISTENER_PARTITIONS_PAUSED)
                        .decrement(to_resume.len() as f64);
                    self.shared
                        .publish(ContainerEvent::PartitionsResumed { partitions: to_resume });
                }
                Err(e) => warn!("resume reconciliation failed: {e}"),
            }
        }

        let pause_requested = self.shared.sync.lock().unwrap().pause.is_pause_requested();
        if !pause_requested && self.consumer_paused_published {
            self.consumer_paused_published = false;
            self.shared.publish(ContainerEvent::Resumed);
        }
    }

    /// Poll once with the effective timeout, then drain whatever else is
    /// ready without blocking, up to `max_poll_records`.
    fn poll_records(&mut self, paused: bool) -> Result<Vec<OwnedMessage>, ContainerError> {
        let mut timeout = self.shared.props.effective_poll_timeout(paused);
        if let Some(remaining) = self
            .shared
            .sync
            .lock()
            .unwrap()
            .pause
            .remaining_nack_sleep(Instant::now())
        {
            timeout = timeout.min(remaining.max(Duration::from_millis(10)));
        }

        let mut records = Vec::new();
        match self.consumer.poll(timeout) {
            None => {}
            Some(Ok(message)) => records.push(message.detach()),
            Some(Err(e)) => return self.classify_poll_error(e),
        }
        if self.auth_retrying {
            self.auth_retrying = false;
            self.shared.publish(ContainerEvent::RetryAuthSuccessful);
        }

        // the first message is in hand; drain whatever else is already
        // buffered without blocking
        while !records.is_empty() && records.len() < self.shared.props.max_poll_records {
            match self.consumer.poll(Duration::ZERO) {
                Some(Ok(message)) => records.push(message.detach()),
                Some(Err(e)) => {
                    if is_fatal_consumer_error(&e) {
                        return Err(self.terminal_poll_error(e));
                    }
                    debug!("transient error during poll drain: {e}");
                    break;
                }
                None => break,
            }
        }
        Ok(records)
    }

    fn classify_poll_error(
        &mut self,
        error: KafkaError,
    ) -> Result<Vec<OwnedMessage>, ContainerError> {
        if is_auth_error(&error) {
            return match self.shared.props.auth_exception_retry_interval {
                Some(interval) => {
                    self.auth_retrying = true;
                    self.shared.publish(ContainerEvent::RetryAuth {
                        error: error.to_string(),
                    });
                    self.interruptible_sleep(interval);
                    Ok(Vec::new())
                }
                None => Err(ContainerError::Auth(error)),
            };
        }
        if is_fatal_consumer_error(&error) {
            return Err(self.terminal_poll_error(error));
        }
        // transient: log, count, let the next iteration retry
        warn!("consumer poll error: {error}");
        Ok(Vec::new())
    }

    fn terminal_poll_error(&self, error: KafkaError) -> ContainerError {
        if is_fenced_error(&error) {
            ContainerError::Fenced(error.to_string())
        } else if is_no_offset_error(&error) {
            ContainerError::NoOffset {
                partitions: self.shared.assignment(),
            }
        } else {
            ContainerError::Kafka(error)
        }
    }

    /// Sleep for the auth-retry interval, waking early when a stop arrives.
    fn interruptible_sleep(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while self.shared.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(100)));
        }
    }

    /// Substitute retained records for the poll result once their partitions
    /// are unpaused; a non-empty poll while they are still paused means the
    /// pause did not hold and processing must stop before records are lost.
    fn merge_retained(
        &mut self,
        polled: Vec<OwnedMessage>,
    ) -> Result<Vec<OwnedMessage>, ContainerError> {
        let mut retained_guard = self.shared.retained.lock().unwrap();
        let Some(buffer) = retained_guard.take() else {
            return Ok(polled);
        };

        if !polled.is_empty() {
            let still_paused = {
                let sync = self.shared.sync.lock().unwrap();
                buffer.partitions.iter().any(|tp| sync.pause.is_paused(tp))
            };
            if still_paused {
                *retained_guard = Some(buffer);
                metrics::counter!(LISTENER_EMERGENCY_STOPS).increment(1);
                return Err(ContainerError::EmergencyStop(format!(
                    "poll returned {} records while records were retained and paused",
                    polled.len()
                )));
            }
        }

        drop(retained_guard);
        {
            let mut sync = self.shared.sync.lock().unwrap();
            sync.pause.clear_retention();
        }

        debug!(
            replayed = buffer.records.len(),
            appended = polled.len(),
            "replaying retained records"
        );
        let mut records = buffer.records;
        records.extend(polled);
        Ok(records)
    }

    fn commit_if_due(&mut self) -> Result<(), ContainerError> {
        let due = {
            let ledger = self.shared.ledger.lock().unwrap();
            ledger.should_commit(&self.shared.props, Instant::now())
        };
        if due {
            self.commit_pending_now()?;
        }
        Ok(())
    }

    pub(crate) fn commit_pending_now(&mut self) -> Result<(), ContainerError> {
        let commits = self.shared.ledger.lock().unwrap().take_pending();
        if commits.is_empty() {
            return Ok(());
        }
        self.commit_with_retries(commits)
    }

    /// Commit sync or async per configuration. Sync commits retry retriable
    /// failures up to `commit_retries`; a rebalance in progress retains the
    /// offsets for the next stable assignment.
    pub(crate) fn commit_with_retries(
        &mut self,
        commits: HashMap<TopicPartition, OffsetAndMetadata>,
    ) -> Result<(), ContainerError> {
        if !self.shared.props.sync_commits {
            let tpl = crate::types::commits_to_tpl(&commits).map_err(ContainerError::Kafka)?;
            match self.consumer.commit(&tpl, CommitMode::Async) {
                Ok(()) => {
                    metrics::counter!(LISTENER_COMMITS_ISSUED).increment(1);
                    self.shared
                        .ledger
                        .lock()
                        .unwrap()
                        .on_commit_success(&commits, Instant::now());
                }
                Err(e) => {
                    metrics::counter!(LISTENER_COMMITS_FAILED).increment(1);
                    warn!("async commit enqueue failed: {e}");
                }
            }
            return Ok(());
        }

        let mut attempt = 0;
        loop {
            match commit_sync(&self.consumer, &commits, self.shared.props.commit_log_level) {
                Ok(()) => {
                    metrics::counter!(LISTENER_COMMITS_ISSUED).increment(1);
                    self.shared
                        .ledger
                        .lock()
                        .unwrap()
                        .on_commit_success(&commits, Instant::now());
                    log_commit(
                        self.shared.props.commit_log_level,
                        &format!("commit complete after {attempt} retries"),
                    );
                    return Ok(());
                }
                Err(e) if is_rebalance_in_progress(&e) => {
                    metrics::counter!(LISTENER_COMMITS_RETAINED).increment(commits.len() as u64);
                    warn!("commit hit rebalance-in-progress; retaining offsets");
                    self.shared
                        .ledger
                        .lock()
                        .unwrap()
                        .retain_for_rebalance(commits);
                    return Ok(());
                }
                Err(e) if is_retriable_commit(&e) && attempt < self.shared.props.commit_retries => {
                    attempt += 1;
                    warn!(attempt, "retriable commit failure: {e}");
                }
                Err(e) => {
                    metrics::counter!(LISTENER_COMMITS_FAILED).increment(1);
                    return Err(ContainerError::CommitFailed(e));
                }
            }
        }
    }
}

pub(crate) fn stopped_reason(error: &ContainerError) -> ConsumerStoppedReason {
    match error {
        ContainerError::Stopped => ConsumerStoppedReason::Normal,
        ContainerError::EmergencyStop(_) => ConsumerStoppedReason::Abnormal,
        ContainerError::Fenced(_) => ConsumerStoppedReason::Fenced,
        ContainerError::Auth(_) => ConsumerStoppedReason::Auth,
        ContainerError::NoOffset { .. } => ConsumerStoppedReason::NoOffset,
        ContainerError::Kafka(_) | ContainerError::CommitFailed(_) | ContainerError::Config(_) => {
            ConsumerStoppedReason::Error
        }
    }
}

pub(crate) fn partitions_of(records: &[OwnedMessage]) -> Vec<TopicPartition> {
    let mut partitions: Vec<TopicPartition> = records
        .iter()
        .map(|r| TopicPartition::new(r.topic(), r.partition()))
        .collect();
    partitions.sort();
    partitions.dedup();
    partitions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reasons_map_from_errors() {
        assert_eq!(
            stopped_reason(&ContainerError::Stopped),
            ConsumerStoppedReason::Normal
        );
        assert_eq!(
            stopped_reason(&ContainerError::EmergencyStop("x".into())),
            ConsumerStoppedReason::Abnormal
        );
        assert_eq!(
            stopped_reason(&ContainerError::Fenced("f".into())),
            ConsumerStoppedReason::Fenced
        );
        assert_eq!(
            stopped_reason(&ContainerError::NoOffset { partitions: vec![] }),
            ConsumerStoppedReason::NoOffset
        );
    }

    #[test]
    fn partitions_of_dedupes() {
        use rdkafka::message::Timestamp;
        let records = vec![
            OwnedMessage::new(None, None, "t".into(), Timestamp::now(), 0, 1, None),
            OwnedMessage::new(None, None, "t".into(), Timestamp::now(), 0, 2, None),
            OwnedMessage::new(None, None, "t".into(), Timestamp::now(), 1, 1, None),
        ];
        assert_eq!(
            partitions_of(&records),
            vec![TopicPartition::new("t", 0), TopicPartition::new("t", 1)]
        );
    }
}
