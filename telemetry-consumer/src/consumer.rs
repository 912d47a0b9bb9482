//! Poll loop of the partitioned consumer.
//!
//! One task polls the log, groups records per partition and routes each
//! group to that partition's worker. Committable offsets are committed on an
//! interval between polls and once more after the workers are drained at
//! shutdown.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::config::ConsumerConfig;
use crate::handler::RecordHandler;
use crate::log::{LogConsumer, LogError};
use crate::metrics_consts::{
    CONSUMER_POLL_SIZE, CONSUMER_RECORDS_RECEIVED, OFFSET_COMMITS,
    OFFSET_COMMITS_SKIPPED_REBALANCING,
};
use crate::offset_tracker::{OffsetTracker, OffsetTrackerError};
use crate::partition_router::{shutdown_workers, PartitionRouter};
use crate::partition_worker::PartitionWorkerConfig;
use crate::record::ConsumerRecord;
use crate::types::Partition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Read side of a consumer's lifecycle state.
#[derive(Clone)]
pub struct ConsumerStatus {
    receiver: watch::Receiver<ConsumerState>,
}

impl ConsumerStatus {
    pub fn current(&self) -> ConsumerState {
        *self.receiver.borrow()
    }

    /// Resolves once the consumer reaches `state`. False if the consumer was
    /// dropped first.
    pub async fn wait_for(&mut self, state: ConsumerState) -> bool {
        self.receiver.wait_for(|s| *s == state).await.is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub max_poll_records: usize,
    pub poll_timeout: Duration,
    pub commit_interval: Duration,
    pub shutdown_timeout: Duration,
    pub worker_count: usize,
    pub worker_config: PartitionWorkerConfig,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_poll_records: 500,
            poll_timeout: Duration::from_millis(500),
            commit_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
            worker_count: 8,
            worker_config: PartitionWorkerConfig::default(),
        }
    }
}

impl From<&ConsumerConfig> for ConsumerSettings {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            max_poll_records: config.kafka_consumer_max_poll_records.max(1),
            poll_timeout: config.poll_timeout(),
            commit_interval: config.commit_interval(),
            shutdown_timeout: config.shutdown_timeout(),
            worker_count: config.kafka_consumer_worker_count,
            worker_config: config.worker_config(),
        }
    }
}

pub struct PartitionedLogConsumer<H>
where
    H: RecordHandler + ?Sized + 'static,
{
    log: Arc<dyn LogConsumer>,
    router: Arc<PartitionRouter<H>>,
    offset_tracker: Arc<OffsetTracker>,
    settings: ConsumerSettings,
    liveness: Option<HealthHandle>,
    state: watch::Sender<ConsumerState>,
}

impl<H> PartitionedLogConsumer<H>
where
    H: RecordHandler + ?Sized + 'static,
{
    /// `offset_tracker` must be the tracker the backend reports rebalances
    /// to, if it does.
    pub fn new(
        log: Arc<dyn LogConsumer>,
        handler: Arc<H>,
        offset_tracker: Arc<OffsetTracker>,
        settings: ConsumerSettings,
    ) -> Self {
        let router = Arc::new(PartitionRouter::new(
            handler,
            offset_tracker.clone(),
            settings.worker_count,
            settings.worker_config.clone(),
        ));
        let (state, _) = watch::channel(ConsumerState::Stopped);

        Self {
            log,
            router,
            offset_tracker,
            settings,
            liveness: None,
            state,
        }
    }

    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn status(&self) -> ConsumerStatus {
        ConsumerStatus {
            receiver: self.state.subscribe(),
        }
    }

    fn set_state(&self, state: ConsumerState) {
        info!(?state, "consumer state changed");
        self.state.send_replace(state);
    }

    /// Runs until `shutdown` turns true or the backend fails fatally, then
    /// drains the partition workers and commits what they finished.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), LogError> {
        self.set_state(ConsumerState::Starting);
        if let Err(e) = self.log.subscribe().await {
            error!("failed to subscribe: {}", e);
            self.set_state(ConsumerState::Stopped);
            return Err(e);
        }
        self.set_state(ConsumerState::Running);

        let mut last_commit = Instant::now();
        let result = loop {
            if *shutdown.borrow() {
                info!("shutdown requested, leaving poll loop");
                break Ok(());
            }
            if let Some(liveness) = &self.liveness {
                liveness.report_healthy().await;
            }

            let polled = self
                .log
                .poll(self.settings.max_poll_records, self.settings.poll_timeout)
                .await;
            // the backend learns about revocations while polling; release them
            // before dispatching or committing anything from this round
            self.release_revoked();

            match polled {
                Ok(records) => self.dispatch(records).await,
                Err(LogError::Fatal(e)) => {
                    error!("log consumer failed: {}", e);
                    break Err(LogError::Fatal(e));
                }
                Err(e) => {
                    warn!("poll failed, retrying: {}", e);
                    sleep(Duration::from_millis(100)).await;
                }
            }

            if last_commit.elapsed() >= self.settings.commit_interval {
                self.commit_offsets(true);
                last_commit = Instant::now();
            }
        };

        self.set_state(ConsumerState::Stopping);
        let workers = self.router.shutdown_all();
        if tokio::time::timeout(self.settings.shutdown_timeout, shutdown_workers(workers))
            .await
            .is_err()
        {
            error!(
                timeout_ms = self.settings.shutdown_timeout.as_millis() as u64,
                "timed out draining partition workers"
            );
        }
        self.commit_offsets(false);
        self.set_state(ConsumerState::Stopped);

        result
    }

    async fn dispatch(&self, records: Vec<ConsumerRecord>) {
        if records.is_empty() {
            return;
        }
        metrics::counter!(CONSUMER_RECORDS_RECEIVED).increment(records.len() as u64);
        metrics::histogram!(CONSUMER_POLL_SIZE).record(records.len() as f64);

        let mut by_partition: BTreeMap<Partition, Vec<ConsumerRecord>> = BTreeMap::new();
        for record in records {
            by_partition
                .entry(record.partition.clone())
                .or_default()
                .push(record);
        }

        for (partition, records) in by_partition {
            let batch_id = self.offset_tracker.assign_batch_id();
            if let Err(e) = self.router.route_batch(partition, records, batch_id).await {
                error!("failed to route batch {}: {}", batch_id, e);
            }
        }
    }

    /// Detach workers of partitions the group took away. They finish what
    /// they already hold in the background. A partition's offsets are only
    /// forgotten if it was not assigned back to us in the meantime.
    fn release_revoked(&self) {
        let revoked = self.log.take_revoked();
        if revoked.is_empty() {
            return;
        }
        info!(partitions = revoked.len(), "releasing revoked partitions");
        let workers = self.router.remove_partitions(&revoked);
        let tracker = self.offset_tracker.clone();
        let router = self.router.clone();
        tokio::spawn(async move {
            shutdown_workers(workers).await;
            for partition in &revoked {
                if router.has_partition(partition) {
                    debug!(partition = %partition, "partition reassigned, keeping its offsets");
                    continue;
                }
                tracker.clear_partition(partition);
            }
        });
    }

    /// With `owned_only`, partitions without a live worker are skipped so
    /// nothing is committed for a revoked partition.
    fn commit_offsets(&self, owned_only: bool) {
        let offsets = match self.offset_tracker.get_committable_offsets() {
            Ok(offsets) => offsets,
            Err(OffsetTrackerError::RebalanceInProgress) => {
                debug!("rebalance in progress, skipping commit");
                metrics::counter!(OFFSET_COMMITS_SKIPPED_REBALANCING).increment(1);
                return;
            }
        };
        let offsets: HashMap<Partition, i64> = offsets
            .into_iter()
            .filter(|(partition, _)| !owned_only || self.router.has_partition(partition))
            .collect();
        if offsets.is_empty() {
            return;
        }

        match self.log.commit(&offsets) {
            Ok(()) => {
                debug!(partitions = offsets.len(), "committed offsets");
                metrics::counter!(OFFSET_COMMITS, "outcome" => "ok").increment(1);
                self.offset_tracker.mark_committed(&offsets);
            }
            Err(e) => {
                warn!("offset commit failed: {}", e);
                metrics::counter!(OFFSET_COMMITS, "outcome" => "error").increment(1);
            }
        }
    }
}
