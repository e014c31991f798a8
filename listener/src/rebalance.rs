use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaError;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tracing::{debug, error, info, trace, warn};

use crate::config::{AssignmentCommitOption, CommitLogLevel};
use crate::error_handler::ErrorHandler;
use crate::errors::is_rebalance_in_progress;
use crate::events::ContainerEvent;
use crate::listener::SeekAware;
use crate::metrics_consts::LISTENER_REBALANCES;
use crate::seek::SeekHandle;
use crate::shared::ContainerShared;
use crate::types::{commits_to_tpl, tpl_to_partitions, TopicPartition};

/// User hooks around the rebalance protocol. The commit hooks run on the
/// consumer thread inside the revoke callback, before and after the
/// pre-revoke commit.
pub trait RebalanceHooks: Send + Sync {
    fn on_partitions_revoked_before_commit(
        &self,
        _client: &ListenerClient,
        _partitions: &[TopicPartition],
    ) {
    }

    fn on_partitions_revoked_after_commit(
        &self,
        _client: &ListenerClient,
        _partitions: &[TopicPartition],
    ) {
    }

    fn on_partitions_assigned(&self, _client: &ListenerClient, _partitions: &[TopicPartition]) {}

    /// Partitions taken away without a commit opportunity.
    fn on_partitions_lost(&self, _client: &ListenerClient, _partitions: &[TopicPartition]) {}
}

/// Default no-op hooks.
pub struct DefaultRebalanceHooks;

impl RebalanceHooks for DefaultRebalanceHooks {}

/// The consumer client used throughout the runtime: a `BaseConsumer` whose
/// context wires rebalance callbacks into the container state.
pub type ListenerClient = BaseConsumer<ListenerClientContext>;

pub struct ListenerClientContext {
    shared: Arc<ContainerShared>,
    hooks: Arc<dyn RebalanceHooks>,
    error_handler: Arc<dyn ErrorHandler>,
    seek_aware: Option<Arc<dyn SeekAware>>,
    seek_handle: SeekHandle,
}

impl ListenerClientContext {
    pub(crate) fn new(
        shared: Arc<ContainerShared>,
        hooks: Arc<dyn RebalanceHooks>,
        error_handler: Arc<dyn ErrorHandler>,
        seek_aware: Option<Arc<dyn SeekAware>>,
    ) -> Self {
        let seek_handle = SeekHandle::new(shared.seek_tx.clone());
        Self {
            shared,
            hooks,
            error_handler,
            seek_aware,
            seek_handle,
        }
    }

    fn on_revoke(&self, consumer: &ListenerClient, tpl: &TopicPartitionList) {
        let revoked = tpl_to_partitions(tpl);
        info!(count = revoked.len(), "partitions revoked");
        metrics::counter!(LISTENER_REBALANCES, "kind" => "revoke").increment(1);

        // Drop retained records for partitions we are losing; replaying them
        // after reassignment would bypass the new owner.
        {
            let mut retained = self.shared.retained.lock().unwrap();
            if let Some(buffer) = retained.as_mut() {
                buffer.remove_partitions(&revoked);
                if buffer.is_empty() {
                    *retained = None;
                }
            }
        }

        self.hooks
            .on_partitions_revoked_before_commit(consumer, &revoked);

        // Commit whatever was acked before we lose the partitions.
        self.shared.drain_acks_into_ledger();
        let commits = self.shared.ledger.lock().unwrap().take_pending();
        if !commits.is_empty() {
            match commit_sync(consumer, &commits, self.shared.props.commit_log_level) {
                Ok(()) => {
                    let now = std::time::Instant::now();
                    self.shared
                        .ledger
                        .lock()
                        .unwrap()
                        .on_commit_success(&commits, now);
                }
                Err(e) if is_rebalance_in_progress(&e) => {
                    warn!("commit during revoke hit rebalance-in-progress; retaining offsets");
                    metrics::counter!(crate::metrics_consts::LISTENER_COMMITS_RETAINED)
                        .increment(commits.len() as u64);
                    self.shared
                        .ledger
                        .lock()
                        .unwrap()
                        .retain_for_rebalance(commits);
                }
                Err(e) => {
                    error!("commit during revoke failed: {e}");
                }
            }
        }

        self.hooks
            .on_partitions_revoked_after_commit(consumer, &revoked);

        if let Some(seek_aware) = &self.seek_aware {
            seek_aware.on_partitions_revoked(&revoked);
        }

        // Forget per-partition state for everything revoked.
        {
            let mut sync = self.shared.sync.lock().unwrap();
            sync.out_of_order.remove_partitions(&revoked);
            let backpressure = sync.out_of_order.has_pending();
            sync.pause.set_async_backpressure(backpressure);
            sync.pause.remove_partitions(&revoked);
        }
        self.shared.ledger.lock().unwrap().remove_partitions(&revoked);

        let mut assignment = self.shared.assignment.lock().unwrap();
        assignment.retain(|tp| !revoked.contains(tp));
    }

    fn on_assign(&self, consumer: &ListenerClient, _tpl: &TopicPartitionList) {
        // With cooperative protocols the callback carries only the delta;
        // read back the full assignment from the client.
        let assigned = match consumer.assignment() {
            Ok(tpl) => tpl_to_partitions(&tpl),
            Err(e) => {
                error!("failed to read assignment after rebalance: {e}");
                return;
            }
        };
        info!(count = assigned.len(), "partitions assigned");
        metrics::counter!(LISTENER_REBALANCES, "kind" => "assign").increment(1);

        *self.shared.assignment.lock().unwrap() = assigned.clone();

        // Kafka cleared any client-side pauses across the rebalance: re-apply
        // everything still requested, plus partitions held by a retention
        // buffer, before the next poll can fetch from them.
        {
            let mut sync = self.shared.sync.lock().unwrap();
            sync.pause.reset_applied();
            sync.pause
                .set_retention_partitions(self.shared.retained_partitions());
            let due = sync.pause.pauses_due(&assigned);
            if !due.is_empty() {
                match pause_partitions(consumer, &due) {
                    Ok(()) => {
                        sync.pause.mark_paused(&due);
                        drop(sync);
                        self.shared
                            .publish(ContainerEvent::PartitionsPaused { partitions: due });
                    }
                    Err(e) => {
                        error!("re-pause after assignment failed: {e}");
                    }
                }
            }
        }

        self.maybe_commit_assignment_positions(consumer, &assigned);
        self.replay_retained_commits(consumer, &assigned);

        if let Some(seek_aware) = &self.seek_aware {
            let positions = partition_positions(consumer, &assigned);
            seek_aware.on_partitions_assigned(&positions, &self.seek_handle);
        }

        let shared = self.shared.clone();
        let mut pause_cb = |partitions: &[TopicPartition]| {
            let mut sync = shared.sync.lock().unwrap();
            sync.pause.request_pause_partitions(partitions);
            let due = sync.pause.pauses_due(partitions);
            if !due.is_empty() {
                if let Err(e) = pause_partitions(consumer, &due) {
                    error!("error-handler pause after assignment failed: {e}");
                } else {
                    sync.pause.mark_paused(&due);
                }
            }
        };
        self.error_handler
            .on_partitions_assigned(consumer, &assigned, &mut pause_cb);

        self.hooks.on_partitions_assigned(consumer, &assigned);
    }

    fn on_lost(&self, consumer: &ListenerClient, error: &KafkaError) {
        // No commit opportunity: same cleanup as revoke, minus the commit.
        let lost = self.shared.assignment();
        warn!(count = lost.len(), "partitions lost: {error}");
        metrics::counter!(LISTENER_REBALANCES, "kind" => "lost").increment(1);

        {
            let mut retained = self.shared.retained.lock().unwrap();
            if let Some(buffer) = retained.as_mut() {
                buffer.remove_partitions(&lost);
                if buffer.is_empty() {
                    *retained = None;
                }
            }
        }
        {
            let mut sync = self.shared.sync.lock().unwrap();
            sync.out_of_order.remove_partitions(&lost);
            let backpressure = sync.out_of_order.has_pending();
            sync.pause.set_async_backpressure(backpressure);
            sync.pause.remove_partitions(&lost);
        }
        self.shared.ledger.lock().unwrap().remove_partitions(&lost);
        self.shared.assignment.lock().unwrap().clear();

        self.hooks.on_partitions_lost(consumer, &lost);
    }

    /// Commit the current position for newly assigned partitions without a
    /// stored commit, per the assignment-commit option.
    fn maybe_commit_assignment_positions(
        &self,
        consumer: &ListenerClient,
        assigned: &[TopicPartition],
    ) {
        let option = self.shared.props.assignment_commit_option;
        let transactional = self.shared.props.is_transactional();
        let latest = self.shared.reset_policy.eq_ignore_ascii_case("latest");
        let due = match option {
            AssignmentCommitOption::Never => false,
            AssignmentCommitOption::Always => true,
            AssignmentCommitOption::LatestOnly => latest,
            AssignmentCommitOption::LatestOnlyNoTx => latest && !transactional,
        };
        if !due || assigned.is_empty() {
            return;
        }

        let mut tpl = TopicPartitionList::new();
        for tp in assigned {
            tpl.add_partition(tp.topic(), tp.partition());
        }
        let committed = match consumer
            .committed_offsets(tpl, self.shared.props.sync_commit_timeout)
        {
            Ok(committed) => committed,
            Err(e) => {
                warn!("failed to read committed offsets after assignment: {e}");
                return;
            }
        };

        let uncommitted: Vec<TopicPartition> = committed
            .elements()
            .into_iter()
            .filter(|e| !matches!(e.offset(), Offset::Offset(_)))
            .map(TopicPartition::from)
            .collect();
        if uncommitted.is_empty() {
            return;
        }

        let positions = partition_positions(consumer, &uncommitted);
        let commits: HashMap<_, _> = positions
            .into_iter()
            .map(|(tp, position)| (tp, crate::types::OffsetAndMetadata::new(position)))
            .collect();
        if commits.is_empty() {
            return;
        }

        debug!(count = commits.len(), "committing current positions for new assignment");
        if let Err(e) = commit_sync(consumer, &commits, self.shared.props.commit_log_level) {
            warn!("assignment-position commit failed: {e}");
        }
    }

    /// Commits retained during a rebalance-in-progress are re-issued for the
    /// partitions we still own.
    fn replay_retained_commits(&self, consumer: &ListenerClient, assigned: &[TopicPartition]) {
        let still_owned: HashSet<TopicPartition> = assigned.iter().cloned().collect();
        let retained = self
            .shared
            .ledger
            .lock()
            .unwrap()
            .take_retained_for(&still_owned);
        if retained.is_empty() {
            return;
        }

        info!(count = retained.len(), "replaying commits retained across rebalance");
        match commit_sync(consumer, &retained, self.shared.props.commit_log_level) {
            Ok(()) => {
                let now = std::time::Instant::now();
                self.shared
                    .ledger
                    .lock()
                    .unwrap()
                    .on_commit_success(&retained, now);
            }
            Err(e) if is_rebalance_in_progress(&e) => {
                self.shared
                    .ledger
                    .lock()
                    .unwrap()
                    .retain_for_rebalance(retained);
            }
            Err(e) => {
                error!("replay of retained commits failed: {e}");
            }
        }
    }
}

impl ClientContext for ListenerClientContext {}

impl ConsumerContext for ListenerClientContext {
    fn pre_rebalance(&self, consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        debug!("pre-rebalance: {rebalance:?}");
        match rebalance {
            Rebalance::Revoke(tpl) => self.on_revoke(consumer, tpl),
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => self.on_lost(consumer, e),
        }
    }

    fn post_rebalance(&self, consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        debug!("post-rebalance: {rebalance:?}");
        match rebalance {
            Rebalance::Assign(tpl) => self.on_assign(consumer, tpl),
            Rebalance::Revoke(_) => {}
            Rebalance::Error(e) => error!("post-rebalance error: {e}"),
        }
    }

    fn commit_callback(&self, result: rdkafka::error::KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => log_commit(
                self.shared.props.commit_log_level,
                &format!("committed offsets for {} partitions", offsets.count()),
            ),
            Err(e) => warn!("async commit failed: {e}"),
        }
    }
}

pub(crate) fn pause_partitions(
    consumer: &ListenerClient,
    partitions: &[TopicPartition],
) -> Result<(), KafkaError> {
    let tpl = crate::types::partitions_to_tpl(partitions);
    consumer.pause(&tpl)
}

pub(crate) fn resume_partitions(
    consumer: &ListenerClient,
    partitions: &[TopicPartition],
) -> Result<(), KafkaError> {
    let tpl = crate::types::partitions_to_tpl(partitions);
    consumer.resume(&tpl)
}

/// Current positions of the given partitions; partitions whose position is
/// not yet resolved are skipped.
pub(crate) fn partition_positions(
    consumer: &ListenerClient,
    partitions: &[TopicPartition],
) -> HashMap<TopicPartition, i64> {
    let mut positions = HashMap::new();
    match consumer.position() {
        Ok(tpl) => {
            for elem in tpl.elements() {
                let offset = elem.offset();
                let tp = TopicPartition::from(elem);
                if !partitions.contains(&tp) {
                    continue;
                }
                if let Offset::Offset(position) = offset {
                    positions.insert(tp, position);
                }
            }
        }
        Err(e) => warn!("failed to read consumer positions: {e}"),
    }
    positions
}

/// One synchronous commit of the given offsets.
pub(crate) fn commit_sync(
    consumer: &ListenerClient,
    commits: &HashMap<TopicPartition, crate::types::OffsetAndMetadata>,
    log_level: CommitLogLevel,
) -> Result<(), KafkaError> {
    let tpl = commits_to_tpl(commits)?;
    consumer.commit(&tpl, CommitMode::Sync)?;
    log_commit(log_level, &format!("committed {} offsets", commits.len()));
    Ok(())
}

pub(crate) fn log_commit(level: CommitLogLevel, message: &str) {
    match level {
        CommitLogLevel::Error => error!("{message}"),
        CommitLogLevel::Warn => warn!("{message}"),
        CommitLogLevel::Info => info!("{message}"),
        CommitLogLevel::Debug => debug!("{message}"),
        CommitLogLevel::Trace => trace!("{message}"),
    }
}
