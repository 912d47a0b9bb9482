//! Routes each partition's records to its own worker, creating the worker on
//! the first record seen for that partition.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{mpsc, Semaphore};
use tracing::info;

use crate::handler::RecordHandler;
use crate::metrics_consts::WORKER_BACKPRESSURE;
use crate::offset_tracker::OffsetTracker;
use crate::partition_worker::{PartitionBatch, PartitionWorker, PartitionWorkerConfig};
use crate::record::ConsumerRecord;
use crate::types::Partition;

pub struct PartitionRouter<H>
where
    H: RecordHandler + ?Sized + 'static,
{
    workers: DashMap<Partition, PartitionWorker>,
    handler: Arc<H>,
    offset_tracker: Arc<OffsetTracker>,
    permits: Arc<Semaphore>,
    config: PartitionWorkerConfig,
}

impl<H> PartitionRouter<H>
where
    H: RecordHandler + ?Sized + 'static,
{
    /// `worker_count` bounds how many partitions process a batch at once.
    pub fn new(
        handler: Arc<H>,
        offset_tracker: Arc<OffsetTracker>,
        worker_count: usize,
        config: PartitionWorkerConfig,
    ) -> Self {
        Self {
            workers: DashMap::new(),
            handler,
            offset_tracker,
            permits: Arc::new(Semaphore::new(worker_count.max(1))),
            config,
        }
    }

    /// Sender for `partition`, spawning its worker if needed. The map guard
    /// is released before the caller awaits on the channel.
    fn partition_sender(&self, partition: &Partition) -> mpsc::Sender<PartitionBatch> {
        self.workers
            .entry(partition.clone())
            .or_insert_with(|| {
                info!(partition = %partition, "creating partition worker");
                PartitionWorker::new(
                    partition.clone(),
                    self.handler.clone(),
                    self.offset_tracker.clone(),
                    self.permits.clone(),
                    &self.config,
                )
            })
            .sender()
    }

    pub async fn route_batch(
        &self,
        partition: Partition,
        records: Vec<ConsumerRecord>,
        batch_id: u64,
    ) -> Result<()> {
        let sender = self.partition_sender(&partition);
        if sender.capacity() == 0 {
            metrics::counter!(
                WORKER_BACKPRESSURE,
                "topic" => partition.topic().to_string(),
                "partition" => partition.partition_number().to_string()
            )
            .increment(1);
        }

        sender
            .send(PartitionBatch::new(partition.clone(), records, batch_id))
            .await
            .map_err(|_| anyhow!("worker for {partition} is gone"))
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn has_partition(&self, partition: &Partition) -> bool {
        self.workers.contains_key(partition)
    }

    /// Detach the workers of revoked partitions. They still drain what was
    /// queued before the revocation.
    pub fn remove_partitions(&self, partitions: &[Partition]) -> Vec<PartitionWorker> {
        partitions
            .iter()
            .filter_map(|partition| self.workers.remove(partition).map(|(_, w)| w))
            .collect()
    }

    pub fn shutdown_all(&self) -> Vec<PartitionWorker> {
        let keys: Vec<Partition> = self.workers.iter().map(|r| r.key().clone()).collect();
        info!(workers = keys.len(), "shutting down partition workers");
        self.remove_partitions(&keys)
    }
}

/// Drain workers concurrently.
pub async fn shutdown_workers(workers: Vec<PartitionWorker>) {
    join_all(workers.into_iter().map(|w| w.shutdown())).await;
}
