use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use rdkafka::consumer::Consumer;
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, Headers, OwnedHeaders, OwnedMessage};
use rdkafka::Message;
use tracing::{debug, warn};

use crate::ack::{Acknowledgment, NackRequest};
use crate::config::AckMode;
use crate::errors::{ContainerError, ListenerError};
use crate::events::ContainerEvent;
use crate::listener::{MessageListener, PolledRecords};
use crate::metrics_consts::{
    LISTENER_BATCHES_FAILED, LISTENER_BATCHES_HANDLED, LISTENER_HANDLE_DURATION_MS,
    LISTENER_NACKS, LISTENER_RECORDS_FAILED, LISTENER_RECORDS_HANDLED,
    LISTENER_TRANSACTIONS_ABORTED, LISTENER_TRANSACTIONS_COMMITTED,
};
use crate::rebalance::{partition_positions, pause_partitions};
use crate::run_loop::ListenerConsumer;
use crate::shared::RetainedRecords;
use crate::types::{OffsetAndMetadata, TopicPartition, TopicPartitionOffset};

/// 4-byte big-endian delivery attempt, written before the listener sees the
/// record when enabled.
pub const DELIVERY_ATTEMPT_HEADER: &str = "kafka_deliveryAttempt";

/// Marker header set by an upstream deserializer that could not decode the
/// record's key or value; the loop raises before invoking the listener.
pub const DESERIALIZER_ERROR_HEADER: &str = "kafka_deserializerException";

enum RecordOutcome {
    Success(Arc<OwnedMessage>),
    Skipped,
    Failure(OwnedMessage, ListenerError),
    /// Transaction rolled back and the after-rollback processor consumed the
    /// failing record and the tail.
    RolledBack,
}

impl ListenerConsumer {
    pub(crate) fn dispatch(&mut self, records: Vec<OwnedMessage>) -> Result<(), ContainerError> {
        if self.shared.props.fix_tx_offsets && self.txn.is_some() {
            let assigned = self.shared.assignment();
            let positions = partition_positions(&self.consumer, &assigned);
            self.shared.ledger.lock().unwrap().save_positions(positions);
        }

        if self.listener.is_batch() {
            if self.shared.props.sub_batch_per_partition {
                for slice in partition_slices(records) {
                    if !self.shared.is_running() && self.shared.props.stop_immediate {
                        return Err(ContainerError::Stopped);
                    }
                    if !self.invoke_batch(slice)? {
                        break;
                    }
                }
                Ok(())
            } else {
                self.invoke_batch(records).map(|_| ())
            }
        } else {
            self.invoke_records(records)
        }
    }

    fn invoke_records(&mut self, records: Vec<OwnedMessage>) -> Result<(), ContainerError> {
        if self.shared.props.async_acks {
            let mut sync = self.shared.sync.lock().unwrap();
            for record in &records {
                let tp = TopicPartition::new(record.topic(), record.partition());
                sync.out_of_order.track_polled(&tp, record.offset());
            }
            sync.pause.set_async_backpressure(true);
        }

        let mut queue: VecDeque<OwnedMessage> = records.into();
        while let Some(record) = queue.pop_front() {
            if !self.shared.is_running() && self.shared.props.stop_immediate {
                return Err(ContainerError::Stopped);
            }

            if let Some(detail) = deserialization_failure(&record) {
                let error = ListenerError::Deserialization {
                    partition: TopicPartition::new(record.topic(), record.partition()),
                    offset: record.offset(),
                    detail,
                };
                match self.handle_record_error(record, error, queue)? {
                    Some(rest) => {
                        queue = rest;
                        continue;
                    }
                    None => return Ok(()),
                }
            }

            // early interceptor, outside any transaction
            let record = match &self.record_interceptor {
                Some(interceptor) => {
                    let tp = TopicPartition::new(record.topic(), record.partition());
                    let offset = record.offset();
                    match interceptor.early_intercept(record, &self.consumer) {
                        Some(record) => record,
                        None => {
                            // intercepted away: acknowledged and skipped
                            if !self.shared.props.ack_mode.is_manual() && self.txn.is_none() {
                                self.shared.ledger.lock().unwrap().add_record(&tp, offset);
                            }
                            continue;
                        }
                    }
                }
                None => record,
            };
            let record = self.maybe_stamp_delivery_attempt(record);

            let started = Instant::now();
            let outcome = if self.txn.is_some() {
                self.invoke_record_in_txn(record, &mut queue)?
            } else {
                self.invoke_record_plain(record)
            };

            match outcome {
                RecordOutcome::Success(record) => {
                    if let Some(interceptor) = &self.record_interceptor {
                        interceptor.after_record(&record, &self.consumer);
                    }
                    if self.shared.props.metrics_enabled {
                        metrics::counter!(LISTENER_RECORDS_HANDLED).increment(1);
                        metrics::histogram!(LISTENER_HANDLE_DURATION_MS)
                            .record(started.elapsed().as_millis() as f64);
                    }

                    if let Some(nack) = self.take_nack() {
                        let tail: Vec<OwnedMessage> = queue.into_iter().collect();
                        self.handle_nack(&record, tail, nack)?;
                        return Ok(());
                    }

                    self.after_successful_record(&record)?;

                    if self.shared.props.pause_immediate && !queue.is_empty() {
                        let pause_requested = {
                            let sync = self.shared.sync.lock().unwrap();
                            sync.pause.is_pause_requested()
                        };
                        if pause_requested {
                            debug!("pause requested with pause_immediate; retaining tail");
                            self.retain_records(queue.into_iter().collect())?;
                            return Ok(());
                        }
                    }
                }
                RecordOutcome::Skipped => {}
                RecordOutcome::Failure(record, error) => {
                    if self.shared.props.metrics_enabled {
                        metrics::counter!(LISTENER_RECORDS_FAILED).increment(1);
                    }
                    match self.handle_record_error(record, error, queue)? {
                        Some(rest) => {
                            queue = rest;
                            continue;
                        }
                        None => return Ok(()),
                    }
                }
                RecordOutcome::RolledBack => return Ok(()),
            }
        }
        Ok(())
    }

    fn invoke_record_plain(&mut self, record: OwnedMessage) -> RecordOutcome {
        let record = match &self.record_interceptor {
            Some(interceptor) => match interceptor.intercept(record, &self.consumer) {
                Some(record) => record,
                None => return RecordOutcome::Skipped,
            },
            None => record,
        };
        let record = Arc::new(record);
        let ack = self
            .listener
            .wants_ack()
            .then(|| self.make_record_ack(record.clone()));

        match self.call_record_listener(&record, ack) {
            Ok(()) => {
                if let Some(interceptor) = &self.record_interceptor {
                    interceptor.success(&record, &self.consumer);
                }
                RecordOutcome::Success(record)
            }
            Err(source) => {
                let error = ListenerError::execution(self.shared.group_id.clone(), source);
                if let Some(interceptor) = &self.record_interceptor {
                    interceptor.failure(&record, &error, &self.consumer);
                }
                let record = Arc::try_unwrap(record).unwrap_or_else(|arc| (*arc).clone());
                RecordOutcome::Failure(record, error)
            }
        }
    }

    fn invoke_record_in_txn(
        &mut self,
        record: OwnedMessage,
        queue: &mut VecDeque<OwnedMessage>,
    ) -> Result<RecordOutcome, ContainerError> {
        let Some(metadata) = self.consumer.group_metadata() else {
            return Err(ContainerError::Config(crate::errors::ConfigError::new(
                "consumer has no group metadata; transactions need a group",
            )));
        };
        let mut coordinator = self.txn.take().expect("transactional dispatch without producer");

        enum TxnFlow {
            Done(RecordOutcome),
            TxnError(OwnedMessage, KafkaError),
        }

        let flow = 'txn: {
            let txn = match coordinator.begin() {
                Ok(txn) => txn,
                Err(e) => {
                    // nothing was invoked; surface as a transactional failure
                    break 'txn TxnFlow::TxnError(record, e);
                }
            };

            let record = match &self.record_interceptor {
                Some(interceptor) => match interceptor.intercept(record, &self.consumer) {
                    Some(record) => record,
                    None => {
                        let _ = txn.abort();
                        break 'txn TxnFlow::Done(RecordOutcome::Skipped);
                    }
                },
                None => record,
            };
            let record = Arc::new(record);

            match self.call_record_listener(&record, None) {
                Ok(()) => {
                    if let Some(interceptor) = &self.record_interceptor {
                        interceptor.success(&record, &self.consumer);
                    }
                    let entries = vec![(
                        record.topic().to_string(),
                        record.partition(),
                        record.offset(),
                    )];
                    match txn
                        .associate_offsets(entries, &metadata)
                        .and_then(|()| txn.commit())
                    {
                        Ok(()) => {
                            metrics::counter!(LISTENER_TRANSACTIONS_COMMITTED).increment(1);
                            let tp = TopicPartition::new(record.topic(), record.partition());
                            let commits: HashMap<_, _> = [(
                                tp,
                                OffsetAndMetadata::new(record.offset() + 1),
                            )]
                            .into();
                            self.shared
                                .ledger
                                .lock()
                                .unwrap()
                                .on_commit_success(&commits, Instant::now());
                            break 'txn TxnFlow::Done(RecordOutcome::Success(record));
                        }
                        Err(e) => {
                            metrics::counter!(LISTENER_TRANSACTIONS_ABORTED).increment(1);
                            let record =
                                Arc::try_unwrap(record).unwrap_or_else(|arc| (*arc).clone());
                            break 'txn TxnFlow::TxnError(record, e);
                        }
                    }
                }
                Err(source) => {
                    let error = ListenerError::execution(self.shared.group_id.clone(), source);
                    if let Some(interceptor) = &self.record_interceptor {
                        interceptor.failure(&record, &error, &self.consumer);
                    }
                    let _ = txn.abort();
                    metrics::counter!(LISTENER_TRANSACTIONS_ABORTED).increment(1);
                    let record = Arc::try_unwrap(record).unwrap_or_else(|arc| (*arc).clone());
                    break 'txn TxnFlow::Done(RecordOutcome::Failure(record, error));
                }
            }
        };

        match flow {
            TxnFlow::Done(RecordOutcome::Failure(record, error)) => {
                self.txn = Some(coordinator);
                // rollback path: the after-rollback processor gets the failed
                // record plus everything not yet consumed from the poll
                let mut unprocessed = vec![record];
                unprocessed.extend(std::mem::take(queue));
                self.run_after_rollback(&unprocessed, &error)?;
                Ok(RecordOutcome::RolledBack)
            }
            TxnFlow::Done(outcome) => {
                self.txn = Some(coordinator);
                Ok(outcome)
            }
            TxnFlow::TxnError(record, e) => {
                let fenced =
                    coordinator.note_failure(&e, self.shared.props.stop_container_when_fenced);
                self.txn = Some(coordinator);
                if fenced && self.shared.props.stop_container_when_fenced {
                    return Err(ContainerError::Fenced(e.to_string()));
                }
                let error =
                    ListenerError::execution(self.shared.group_id.clone(), anyhow::anyhow!(e));
                let mut unprocessed = vec![record];
                unprocessed.extend(std::mem::take(queue));
                self.run_after_rollback(&unprocessed, &error)?;
                Ok(RecordOutcome::RolledBack)
            }
        }
    }

    fn run_after_rollback(
        &mut self,
        records: &[OwnedMessage],
        error: &ListenerError,
    ) -> Result<(), ContainerError> {
        if self.after_rollback.is_process_in_transaction() {
            let mut coordinator = self.txn.take().expect("after-rollback transaction");
            let result = (|| -> Result<(), KafkaError> {
                let txn = coordinator.begin()?;
                self.after_rollback
                    .process(records, &self.consumer, error, true);
                txn.commit()
            })();
            if let Err(e) = result {
                let fenced =
                    coordinator.note_failure(&e, self.shared.props.stop_container_when_fenced);
                self.txn = Some(coordinator);
                if fenced && self.shared.props.stop_container_when_fenced {
                    return Err(ContainerError::Fenced(e.to_string()));
                }
                warn!("after-rollback transaction failed: {e}");
                return Ok(());
            }
            self.txn = Some(coordinator);
        } else {
            self.after_rollback
                .process(records, &self.consumer, error, true);
        }
        Ok(())
    }

    fn after_successful_record(&mut self, record: &OwnedMessage) -> Result<(), ContainerError> {
        let tp = TopicPartition::new(record.topic(), record.partition());
        match self.shared.props.ack_mode {
            AckMode::Record => {
                if self.txn.is_none() {
                    self.shared
                        .ledger
                        .lock()
                        .unwrap()
                        .add_record(&tp, record.offset());
                    if !self.auto_commit {
                        self.commit_pending_now()?;
                    }
                }
            }
            AckMode::Batch | AckMode::Time | AckMode::Count | AckMode::CountTime => {
                if self.txn.is_none() {
                    self.shared
                        .ledger
                        .lock()
                        .unwrap()
                        .add_record(&tp, record.offset());
                }
            }
            AckMode::Manual => {}
            AckMode::ManualImmediate => {
                self.process_immediate_acks()?;
            }
        }
        Ok(())
    }

    /// ManualImmediate: commit acknowledged offsets synchronously, before the
    /// next record is handled and strictly before the next poll.
    pub(crate) fn process_immediate_acks(&mut self) -> Result<(), ContainerError> {
        let immediate = self.shared.drain_acks_into_ledger();
        if immediate {
            self.commit_pending_now()?;
        }
        Ok(())
    }

    fn handle_record_error(
        &mut self,
        failed: OwnedMessage,
        error: ListenerError,
        queue: VecDeque<OwnedMessage>,
    ) -> Result<Option<VecDeque<OwnedMessage>>, ContainerError> {
        if error.is_fatal() {
            return Err(ContainerError::EmergencyStop(error.to_string()));
        }

        if self.error_handler.seeks_after_handling() {
            let mut all = vec![failed];
            all.extend(queue);
            self.error_handler
                .handle_remaining(&error, &all, &self.consumer, &self.ctx);
            // the handler repositioned the consumer; nothing is retained and
            // the rest of this poll is abandoned for redelivery
            return Ok(None);
        }

        let recovered = self
            .error_handler
            .handle_one(&error, &failed, &self.consumer, &self.ctx);
        if recovered {
            if self.error_handler.is_ack_after_handle() && !self.shared.props.ack_mode.is_manual()
            {
                let tp = TopicPartition::new(failed.topic(), failed.partition());
                self.shared
                    .ledger
                    .lock()
                    .unwrap()
                    .add_record(&tp, failed.offset());
                if self.shared.props.ack_mode == AckMode::Record && !self.auto_commit {
                    self.commit_pending_now()?;
                }
            }
            Ok(Some(queue))
        } else {
            let mut retained = vec![failed];
            retained.extend(queue);
            self.retain_records(retained)?;
            Ok(None)
        }
    }

    fn invoke_batch(&mut self, records: Vec<OwnedMessage>) -> Result<bool, ContainerError> {
        if records.is_empty() {
            return Ok(true);
        }

        let records = match &self.batch_interceptor {
            Some(interceptor) => match interceptor.intercept(records, &self.consumer) {
                Some(records) => records,
                None => return Ok(true),
            },
            None => records,
        };
        if records.is_empty() {
            return Ok(true);
        }

        if let Some(bad) = records.iter().find_map(|r| {
            deserialization_failure(r).map(|detail| {
                (
                    TopicPartition::new(r.topic(), r.partition()),
                    r.offset(),
                    detail,
                )
            })
        }) {
            let error = ListenerError::Deserialization {
                partition: bad.0,
                offset: bad.1,
                detail: bad.2,
            };
            return self.handle_batch_error(records, error);
        }

        let records: Vec<OwnedMessage> = if self.shared.props.delivery_attempt_header {
            records
                .into_iter()
                .map(|r| self.maybe_stamp_delivery_attempt(r))
                .collect()
        } else {
            records
        };

        if self.shared.props.async_acks {
            let mut sync = self.shared.sync.lock().unwrap();
            for (tp, offset) in highest_offsets(&records) {
                sync.out_of_order.track_polled(&tp, offset);
            }
            sync.pause.set_async_backpressure(true);
        }

        let started = Instant::now();
        let result = if self.txn.is_some() {
            match self.invoke_batch_in_txn(records)? {
                Some(result) => result,
                None => return Ok(false),
            }
        } else {
            self.invoke_batch_plain(records)
        };

        match result {
            Ok(records) => {
                if self.shared.props.metrics_enabled {
                    metrics::counter!(LISTENER_BATCHES_HANDLED).increment(1);
                    metrics::histogram!(LISTENER_HANDLE_DURATION_MS)
                        .record(started.elapsed().as_millis() as f64);
                }

                if let Some(nack) = self.take_nack() {
                    self.handle_batch_nack(records, nack)?;
                    return Ok(false);
                }

                if !self.shared.props.ack_mode.is_manual() && self.txn.is_none() {
                    // seed the commit path with the highest offset per
                    // partition present in the batch
                    let mut ledger = self.shared.ledger.lock().unwrap();
                    for (tp, offset) in highest_offsets(&records) {
                        ledger.add_record(&tp, offset);
                    }
                }
                if self.shared.props.ack_mode == AckMode::ManualImmediate {
                    self.process_immediate_acks()?;
                }
                Ok(true)
            }
            Err((records, error)) => {
                if self.shared.props.metrics_enabled {
                    metrics::counter!(LISTENER_BATCHES_FAILED).increment(1);
                }
                self.handle_batch_error(records, error)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn invoke_batch_plain(
        &mut self,
        records: Vec<OwnedMessage>,
    ) -> Result<Vec<OwnedMessage>, (Vec<OwnedMessage>, ListenerError)> {
        let ack = self
            .listener
            .wants_ack()
            .then(|| self.make_batch_ack(&records));

        match self.call_batch_listener(&records, ack) {
            Ok(()) => {
                if let Some(interceptor) = &self.batch_interceptor {
                    interceptor.success(&records, &self.consumer);
                }
                Ok(records)
            }
            Err(source) => {
                let error = ListenerError::execution(self.shared.group_id.clone(), source);
                if let Some(interceptor) = &self.batch_interceptor {
                    interceptor.failure(&records, &error, &self.consumer);
                }
                Err((records, error))
            }
        }
    }

    /// Whole batch in one transaction; offsets sent are the highest per
    /// partition. Returns None when the rollback path consumed the batch.
    fn invoke_batch_in_txn(
        &mut self,
        records: Vec<OwnedMessage>,
    ) -> Result<Option<Result<Vec<OwnedMessage>, (Vec<OwnedMessage>, ListenerError)>>, ContainerError>
    {
        let Some(metadata) = self.consumer.group_metadata() else {
            return Err(ContainerError::Config(crate::errors::ConfigError::new(
                "consumer has no group metadata; transactions need a group",
            )));
        };
        let mut coordinator = self.txn.take().expect("transactional dispatch without producer");

        enum BatchFlow {
            Committed(Vec<OwnedMessage>),
            ListenerFailed(Vec<OwnedMessage>, ListenerError),
            TxnError(Vec<OwnedMessage>, KafkaError),
        }

        let flow = 'txn: {
            let txn = match coordinator.begin() {
                Ok(txn) => txn,
                Err(e) => break 'txn BatchFlow::TxnError(records, e),
            };

            match self.call_batch_listener(&records, None) {
                Ok(()) => {
                    if let Some(interceptor) = &self.batch_interceptor {
                        interceptor.success(&records, &self.consumer);
                    }
                    let entries = highest_offsets(&records)
                        .into_iter()
                        .map(|(tp, offset)| (tp.topic().to_string(), tp.partition(), offset))
                        .collect();
                    match txn
                        .associate_offsets(entries, &metadata)
                        .and_then(|()| txn.commit())
                    {
                        Ok(()) => {
                            metrics::counter!(LISTENER_TRANSACTIONS_COMMITTED).increment(1);
                            break 'txn BatchFlow::Committed(records);
                        }
                        Err(e) => {
                            metrics::counter!(LISTENER_TRANSACTIONS_ABORTED).increment(1);
                            break 'txn BatchFlow::TxnError(records, e);
                        }
                    }
                }
                Err(source) => {
                    let error = ListenerError::execution(self.shared.group_id.clone(), source);
                    if let Some(interceptor) = &self.batch_interceptor {
                        interceptor.failure(&records, &error, &self.consumer);
                    }
                    let _ = txn.abort();
                    metrics::counter!(LISTENER_TRANSACTIONS_ABORTED).increment(1);
                    break 'txn BatchFlow::ListenerFailed(records, error);
                }
            }
        };

        match flow {
            BatchFlow::Committed(records) => {
                self.txn = Some(coordinator);
                let commits: HashMap<_, _> = highest_offsets(&records)
                    .into_iter()
                    .map(|(tp, offset)| (tp, OffsetAndMetadata::new(offset + 1)))
                    .collect();
                self.shared
                    .ledger
                    .lock()
                    .unwrap()
                    .on_commit_success(&commits, Instant::now());
                Ok(Some(Ok(records)))
            }
            BatchFlow::ListenerFailed(records, error) => {
                self.txn = Some(coordinator);
                if self.shared.props.batch_recover_after_rollback {
                    // recovery is the error handler's job, not the ARP's
                    Ok(Some(Err((records, error))))
                } else {
                    self.run_after_rollback(&records, &error)?;
                    Ok(None)
                }
            }
            BatchFlow::TxnError(records, e) => {
                let fenced =
                    coordinator.note_failure(&e, self.shared.props.stop_container_when_fenced);
                self.txn = Some(coordinator);
                if fenced && self.shared.props.stop_container_when_fenced {
                    return Err(ContainerError::Fenced(e.to_string()));
                }
                let error =
                    ListenerError::execution(self.shared.group_id.clone(), anyhow::anyhow!(e));
                self.run_after_rollback(&records, &error)?;
                Ok(None)
            }
        }
    }

    fn handle_batch_error(
        &mut self,
        records: Vec<OwnedMessage>,
        error: ListenerError,
    ) -> Result<bool, ContainerError> {
        if error.is_fatal() {
            return Err(ContainerError::EmergencyStop(error.to_string()));
        }
        let offsets = highest_offsets(&records);
        let remaining =
            self.error_handler
                .handle_batch(&error, records, &self.consumer, &self.ctx);
        if remaining.is_empty() {
            // recovered: commit through the batch when the handler says so
            if self.error_handler.is_ack_after_handle()
                && !self.shared.props.ack_mode.is_manual()
                && self.txn.is_none()
            {
                let mut ledger = self.shared.ledger.lock().unwrap();
                for (tp, offset) in offsets {
                    ledger.add_record(&tp, offset);
                }
            }
            return Ok(true);
        }
        if self.error_handler.seeks_after_handling() {
            // the handler already repositioned; replay comes from the broker
            return Ok(false);
        }
        self.retain_records(remaining)?;
        Ok(false)
    }

    /// Install (or extend) the remaining-records buffer and pause its
    /// partitions so the next poll returns nothing for them.
    pub(crate) fn retain_records(
        &mut self,
        records: Vec<OwnedMessage>,
    ) -> Result<(), ContainerError> {
        if records.is_empty() {
            return Ok(());
        }
        if self.shared.props.async_acks {
            // retained records will be re-tracked when they are replayed
            let mut sync = self.shared.sync.lock().unwrap();
            for record in &records {
                let tp = TopicPartition::new(record.topic(), record.partition());
                sync.out_of_order.untrack_polled(&tp, record.offset());
            }
            let backpressure = sync.out_of_order.has_pending();
            sync.pause.set_async_backpressure(backpressure);
        }
        let mut retained = self.shared.retained.lock().unwrap();
        match retained.as_mut() {
            Some(buffer) => buffer.records.extend(records),
            None => *retained = Some(RetainedRecords::new(records)),
        }
        if let Some(buffer) = retained.as_mut() {
            let partitions: Vec<TopicPartition> = buffer
                .records
                .iter()
                .map(|r| TopicPartition::new(r.topic(), r.partition()))
                .collect();
            buffer.partitions.extend(partitions);
        }
        let partitions: Vec<TopicPartition> = retained
            .as_ref()
            .map(|b| b.partitions.iter().cloned().collect())
            .unwrap_or_default();
        drop(retained);

        let due = {
            let mut sync = self.shared.sync.lock().unwrap();
            sync.pause.set_retention_partitions(partitions.clone());
            sync.pause.pauses_due(&partitions)
        };
        if !due.is_empty() {
            match pause_partitions(&self.consumer, &due) {
                Ok(()) => {
                    self.shared.sync.lock().unwrap().pause.mark_paused(&due);
                    self.shared
                        .publish(ContainerEvent::PartitionsPaused { partitions: due });
                }
                Err(e) => warn!("pause for retained records failed: {e}"),
            }
        }
        Ok(())
    }

    fn take_nack(&self) -> Option<NackRequest> {
        self.shared.sync.lock().unwrap().nack.take()
    }

    /// Record-listener nack: pause everything assigned, sleep, then the
    /// nacked record and the tail are re-read.
    fn handle_nack(
        &mut self,
        failed: &OwnedMessage,
        tail: Vec<OwnedMessage>,
        nack: NackRequest,
    ) -> Result<(), ContainerError> {
        metrics::counter!(LISTENER_NACKS).increment(1);
        let mut targets: HashMap<TopicPartition, i64> = HashMap::new();
        targets.insert(
            TopicPartition::new(failed.topic(), failed.partition()),
            failed.offset(),
        );
        for record in &tail {
            let tp = TopicPartition::new(record.topic(), record.partition());
            let slot = targets.entry(tp).or_insert(record.offset());
            if record.offset() < *slot {
                *slot = record.offset();
            }
        }
        self.nack_pause_and_seek(targets, nack)
    }

    /// Batch-listener nack: records before the index are acknowledged, the
    /// suffix is replayed.
    fn handle_batch_nack(
        &mut self,
        records: Vec<OwnedMessage>,
        nack: NackRequest,
    ) -> Result<(), ContainerError> {
        metrics::counter!(LISTENER_NACKS).increment(1);
        let index = nack.batch_index.unwrap_or(0);

        if !self.shared.props.ack_mode.is_manual() && index > 0 {
            let mut ledger = self.shared.ledger.lock().unwrap();
            for (tp, offset) in highest_offsets(&records[..index]) {
                ledger.add_record(&tp, offset);
            }
        }

        let mut targets: HashMap<TopicPartition, i64> = HashMap::new();
        for record in &records[index..] {
            let tp = TopicPartition::new(record.topic(), record.partition());
            let slot = targets.entry(tp).or_insert(record.offset());
            if record.offset() < *slot {
                *slot = record.offset();
            }
        }
        self.nack_pause_and_seek(targets, nack)
    }

    fn nack_pause_and_seek(
        &mut self,
        targets: HashMap<TopicPartition, i64>,
        nack: NackRequest,
    ) -> Result<(), ContainerError> {
        // seeks are enqueued now and applied (while paused) before the next
        // poll; the replay happens once the sleep expires and resumes run
        for (tp, offset) in &targets {
            self.seek_handle.seek(tp.topic(), tp.partition(), *offset);
        }

        let assigned = self.shared.assignment();
        let until = Instant::now() + nack.sleep;
        let newly = {
            let mut sync = self.shared.sync.lock().unwrap();
            sync.pause.start_nack_sleep(until, &assigned)
        };
        if newly.is_empty() {
            return Ok(());
        }
        match pause_partitions(&self.consumer, &newly) {
            Ok(()) => {
                self.shared.sync.lock().unwrap().pause.mark_paused(&newly);
                self.shared
                    .publish(ContainerEvent::PartitionsPaused { partitions: newly });
            }
            Err(e) => {
                // a rebalance is in flight; withdraw the pauses we just added
                warn!("pause for nack sleep failed, rolling back: {e}");
                self.shared.sync.lock().unwrap().pause.rollback_nack(&newly);
            }
        }
        Ok(())
    }

    fn make_record_ack(&self, record: Arc<OwnedMessage>) -> Acknowledgment {
        Acknowledgment::for_record(
            record,
            self.shared.sync.clone(),
            self.shared.ack_tx.clone(),
            self.shared.props.ack_mode,
            self.shared.props.async_acks,
            std::thread::current().id(),
        )
    }

    fn make_batch_ack(&self, records: &[OwnedMessage]) -> Acknowledgment {
        let entries = records
            .iter()
            .map(|r| {
                (
                    TopicPartition::new(r.topic(), r.partition()),
                    r.offset(),
                )
            })
            .collect();
        Acknowledgment::for_batch(
            entries,
            self.shared.sync.clone(),
            self.shared.ack_tx.clone(),
            self.shared.props.ack_mode,
            self.shared.props.async_acks,
            std::thread::current().id(),
        )
    }

    fn call_record_listener(
        &mut self,
        record: &OwnedMessage,
        ack: Option<Acknowledgment>,
    ) -> anyhow::Result<()> {
        let _span = self.shared.props.observation_enabled.then(|| {
            tracing::info_span!(
                "listener_record",
                group = self.ctx.group_id(),
                topic = record.topic(),
                partition = record.partition(),
                offset = record.offset()
            )
            .entered()
        });
        let Self {
            listener,
            consumer,
            ctx,
            ..
        } = self;
        match listener {
            MessageListener::Record(f) => f(record, ctx),
            MessageListener::RecordConsumerAware(f) => f(record, consumer, ctx),
            MessageListener::RecordAcknowledging(f) => {
                f(record, ack.expect("acknowledging listener without ack"), ctx)
            }
            MessageListener::RecordAcknowledgingConsumerAware(f) => f(
                record,
                ack.expect("acknowledging listener without ack"),
                consumer,
                ctx,
            ),
            other => unreachable!("batch listener {other:?} in record dispatch"),
        }
    }

    fn call_batch_listener(
        &mut self,
        records: &[OwnedMessage],
        ack: Option<Acknowledgment>,
    ) -> anyhow::Result<()> {
        let _span = self.shared.props.observation_enabled.then(|| {
            tracing::info_span!(
                "listener_batch",
                group = self.ctx.group_id(),
                size = records.len()
            )
            .entered()
        });
        let Self {
            listener,
            consumer,
            ctx,
            ..
        } = self;
        match listener {
            MessageListener::Batch(f) => f(records, ctx),
            MessageListener::BatchConsumerAware(f) => f(records, consumer, ctx),
            MessageListener::BatchAcknowledging(f) => {
                f(records, ack.expect("acknowledging listener without ack"), ctx)
            }
            MessageListener::BatchAcknowledgingConsumerAware(f) => f(
                records,
                ack.expect("acknowledging listener without ack"),
                consumer,
                ctx,
            ),
            MessageListener::BatchFullPoll(f) => {
                let polled = PolledRecords::new(records.to_vec());
                f(
                    &polled,
                    ack.expect("acknowledging listener without ack"),
                    consumer,
                    ctx,
                )
            }
            other => unreachable!("record listener {other:?} in batch dispatch"),
        }
    }

    fn maybe_stamp_delivery_attempt(&self, record: OwnedMessage) -> OwnedMessage {
        if !self.shared.props.delivery_attempt_header {
            return record;
        }
        let tpo = TopicPartitionOffset::new(
            TopicPartition::new(record.topic(), record.partition()),
            record.offset(),
        );
        let attempt = self.error_handler.delivery_attempt(&tpo);
        with_delivery_attempt(&record, attempt)
    }
}

/// Split a poll's records into per-partition slices, preserving record order
/// within each partition.
pub(crate) fn partition_slices(records: Vec<OwnedMessage>) -> Vec<Vec<OwnedMessage>> {
    let mut slices: Vec<(TopicPartition, Vec<OwnedMessage>)> = Vec::new();
    for record in records {
        let tp = TopicPartition::new(record.topic(), record.partition());
        match slices.iter_mut().find(|(slice_tp, _)| *slice_tp == tp) {
            Some((_, slice)) => slice.push(record),
            None => slices.push((tp, vec![record])),
        }
    }
    slices.into_iter().map(|(_, slice)| slice).collect()
}

/// Highest record offset per partition.
pub(crate) fn highest_offsets(records: &[OwnedMessage]) -> Vec<(TopicPartition, i64)> {
    let mut highest: HashMap<TopicPartition, i64> = HashMap::new();
    for record in records {
        let tp = TopicPartition::new(record.topic(), record.partition());
        let slot = highest.entry(tp).or_insert(record.offset());
        if record.offset() > *slot {
            *slot = record.offset();
        }
    }
    highest.into_iter().collect()
}

pub(crate) fn deserialization_failure(record: &OwnedMessage) -> Option<String> {
    let headers = record.headers()?;
    for header in headers.iter() {
        if header.key == DESERIALIZER_ERROR_HEADER {
            return Some(
                header
                    .value
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .unwrap_or_else(|| "deserialization failed".to_string()),
            );
        }
    }
    None
}

pub(crate) fn with_delivery_attempt(record: &OwnedMessage, attempt: i32) -> OwnedMessage {
    let attempt_bytes = attempt.to_be_bytes();
    let mut headers = OwnedHeaders::new();
    if let Some(existing) = record.headers() {
        for header in existing.iter() {
            if header.key == DELIVERY_ATTEMPT_HEADER {
                continue;
            }
            headers = headers.insert(Header {
                key: header.key,
                value: header.value,
            });
        }
    }
    headers = headers.insert(Header {
        key: DELIVERY_ATTEMPT_HEADER,
        value: Some(&attempt_bytes[..]),
    });

    OwnedMessage::new(
        record.payload().map(|p| p.to_vec()),
        record.key().map(|k| k.to_vec()),
        record.topic().to_string(),
        record.timestamp(),
        record.partition(),
        record.offset(),
        Some(headers),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::Timestamp;

    fn message(partition: i32, offset: i64) -> OwnedMessage {
        OwnedMessage::new(
            Some(b"payload".to_vec()),
            Some(b"key".to_vec()),
            "events".to_string(),
            Timestamp::now(),
            partition,
            offset,
            Some(OwnedHeaders::new()),
        )
    }

    #[test]
    fn partition_slices_preserve_order() {
        let slices = partition_slices(vec![
            message(0, 1),
            message(1, 5),
            message(0, 2),
            message(1, 6),
        ]);
        assert_eq!(slices.len(), 2);
        assert_eq!(
            slices[0].iter().map(|r| r.offset()).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(
            slices[1].iter().map(|r| r.offset()).collect::<Vec<_>>(),
            vec![5, 6]
        );
    }

    #[test]
    fn highest_offsets_per_partition() {
        let records = vec![message(0, 3), message(0, 9), message(1, 4)];
        let mut highest = highest_offsets(&records);
        highest.sort();
        assert_eq!(
            highest,
            vec![
                (TopicPartition::new("events", 0), 9),
                (TopicPartition::new("events", 1), 4)
            ]
        );
    }

    #[test]
    fn delivery_attempt_header_round_trips() {
        let record = message(0, 1);
        let stamped = with_delivery_attempt(&record, 3);

        let headers = stamped.headers().expect("headers");
        let value = headers
            .iter()
            .find(|h| h.key == DELIVERY_ATTEMPT_HEADER)
            .and_then(|h| h.value)
            .expect("attempt header");
        assert_eq!(value, 3i32.to_be_bytes());

        // re-stamping replaces rather than duplicates
        let restamped = with_delivery_attempt(&stamped, 4);
        let count = restamped
            .headers()
            .expect("headers")
            .iter()
            .filter(|h| h.key == DELIVERY_ATTEMPT_HEADER)
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn deserialization_sentinel_detected() {
        let headers = OwnedHeaders::new().insert(Header {
            key: DESERIALIZER_ERROR_HEADER,
            value: Some(b"bad json".as_slice()),
        });
        let record = OwnedMessage::new(
            None,
            None,
            "events".to_string(),
            Timestamp::now(),
            0,
            1,
            Some(headers),
        );
        assert_eq!(deserialization_failure(&record).as_deref(), Some("bad json"));
        assert!(deserialization_failure(&message(0, 1)).is_none());
    }
}
