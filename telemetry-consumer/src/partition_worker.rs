//! Serial worker for one partition.
//!
//! Batches for a partition are queued on a bounded channel and processed one
//! record at a time, so records of a partition reach the handler in offset
//! order while other partitions run concurrently. A shared semaphore bounds
//! how many partitions are processing at once.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::handler::RecordHandler;
use crate::metrics_consts::{WORKER_PERMIT_WAIT_MS, WORKER_RECORDS_HANDLED};
use crate::offset_tracker::OffsetTracker;
use crate::record::ConsumerRecord;
use crate::types::Partition;

/// Records of one partition from one poll, in offset order.
pub struct PartitionBatch {
    pub partition: Partition,
    pub records: Vec<ConsumerRecord>,
    pub batch_id: u64,
}

impl PartitionBatch {
    pub fn new(partition: Partition, records: Vec<ConsumerRecord>, batch_id: u64) -> Self {
        Self {
            partition,
            records,
            batch_id,
        }
    }

    pub fn max_offset(&self) -> Option<i64> {
        self.records.iter().map(|r| r.offset).max()
    }
}

#[derive(Debug, Clone)]
pub struct PartitionWorkerConfig {
    /// Batches buffered per partition before the poll task waits
    pub channel_buffer_size: usize,
}

impl Default for PartitionWorkerConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: 10,
        }
    }
}

pub struct PartitionWorker {
    partition: Partition,
    sender: mpsc::Sender<PartitionBatch>,
    handle: Option<JoinHandle<()>>,
}

impl PartitionWorker {
    pub fn new<H>(
        partition: Partition,
        handler: Arc<H>,
        offset_tracker: Arc<OffsetTracker>,
        permits: Arc<Semaphore>,
        config: &PartitionWorkerConfig,
    ) -> Self
    where
        H: RecordHandler + ?Sized + 'static,
    {
        let (sender, receiver) = mpsc::channel(config.channel_buffer_size);
        let worker_partition = partition.clone();

        let handle = tokio::spawn(async move {
            run_worker(worker_partition, receiver, handler, offset_tracker, permits).await;
        });

        Self {
            partition,
            sender,
            handle: Some(handle),
        }
    }

    /// A clone of the sender, so callers can await capacity without holding
    /// a map guard.
    pub fn sender(&self) -> mpsc::Sender<PartitionBatch> {
        self.sender.clone()
    }

    pub fn capacity(&self) -> usize {
        self.sender.capacity()
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Close the channel and wait until every queued batch is processed.
    pub async fn shutdown(mut self) {
        drop(self.sender);

        if let Some(handle) = self.handle.take() {
            match handle.await {
                Ok(()) => debug!(partition = %self.partition, "partition worker drained"),
                Err(e) => warn!(partition = %self.partition, "partition worker failed: {}", e),
            }
        }
    }
}

async fn run_worker<H>(
    partition: Partition,
    mut receiver: mpsc::Receiver<PartitionBatch>,
    handler: Arc<H>,
    offset_tracker: Arc<OffsetTracker>,
    permits: Arc<Semaphore>,
) where
    H: RecordHandler + ?Sized,
{
    info!(partition = %partition, "starting partition worker");

    while let Some(batch) = receiver.recv().await {
        let wait_start = Instant::now();
        let Ok(_permit) = permits.acquire().await else {
            warn!(partition = %partition, "worker pool closed, dropping queued batches");
            break;
        };
        metrics::histogram!(WORKER_PERMIT_WAIT_MS).record(wait_start.elapsed().as_millis() as f64);

        debug!(
            partition = %partition,
            batch_id = batch.batch_id,
            records = batch.records.len(),
            "processing batch"
        );

        let batch_id = batch.batch_id;
        if let Some(next_offset) = process_batch(&partition, handler.as_ref(), batch).await {
            offset_tracker.mark_processed(&partition, batch_id, next_offset);
        }
    }

    info!(partition = %partition, "partition worker shutting down");
}

/// Hands every record to the handler. Returns the offset that is safe to
/// commit: the first failed offset if any record failed, else one past the
/// last record. `None` for an empty batch.
async fn process_batch<H>(partition: &Partition, handler: &H, batch: PartitionBatch) -> Option<i64>
where
    H: RecordHandler + ?Sized,
{
    let next_offset = batch.max_offset().map(|offset| offset + 1);
    let mut first_failed: Option<i64> = None;

    for record in &batch.records {
        let outcome = AssertUnwindSafe(handler.handle(record))
            .catch_unwind()
            .await;

        let label = match outcome {
            Ok(Ok(())) => "ok",
            Ok(Err(e)) => {
                error!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = record.offset,
                    key = record.key_str(),
                    error = %e,
                    error_chain = ?e,
                    "record processing failed"
                );
                "error"
            }
            Err(panic) => {
                error!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = record.offset,
                    key = record.key_str(),
                    panic = panic_message(panic.as_ref()),
                    "record handler panicked"
                );
                "panic"
            }
        };
        if label != "ok" && first_failed.is_none() {
            first_failed = Some(record.offset);
        }
        metrics::counter!(WORKER_RECORDS_HANDLED, "outcome" => label).increment(1);
    }

    first_failed.or(next_offset)
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tokio::time::{sleep, Duration};

    /// Records offsets in arrival order; fails or panics on chosen offsets.
    #[derive(Default)]
    struct ScriptedHandler {
        seen: Mutex<Vec<i64>>,
        fail_on: HashSet<i64>,
        panic_on: HashSet<i64>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl RecordHandler for ScriptedHandler {
        async fn handle(&self, record: &ConsumerRecord) -> Result<()> {
            if let Some(delay) = self.delay {
                sleep(delay).await;
            }
            self.seen.lock().unwrap().push(record.offset);
            if self.panic_on.contains(&record.offset) {
                panic!("handler blew up at {}", record.offset);
            }
            if self.fail_on.contains(&record.offset) {
                return Err(anyhow!("cannot handle {}", record.offset));
            }
            Ok(())
        }
    }

    fn partition() -> Partition {
        Partition::new("raw-device-events", 0)
    }

    fn batch(offsets: std::ops::Range<i64>, batch_id: u64) -> PartitionBatch {
        let records = offsets
            .map(|offset| ConsumerRecord::new(partition(), offset, format!("payload-{offset}")))
            .collect();
        PartitionBatch::new(partition(), records, batch_id)
    }

    fn worker(handler: Arc<ScriptedHandler>, tracker: Arc<OffsetTracker>) -> PartitionWorker {
        PartitionWorker::new(
            partition(),
            handler,
            tracker,
            Arc::new(Semaphore::new(2)),
            &PartitionWorkerConfig::default(),
        )
    }

    #[tokio::test]
    async fn records_are_handled_in_offset_order() {
        let handler = Arc::new(ScriptedHandler::default());
        let tracker = Arc::new(OffsetTracker::new());
        let worker = worker(handler.clone(), tracker.clone());

        worker.sender().send(batch(0..5, 1)).await.unwrap();
        worker.sender().send(batch(5..9, 2)).await.unwrap();
        worker.shutdown().await;

        assert_eq!(*handler.seen.lock().unwrap(), (0..9).collect::<Vec<_>>());
        assert_eq!(tracker.get_partition_offset(&partition()), Some(9));
    }

    #[tokio::test]
    async fn failed_record_caps_the_committable_offset() {
        let handler = Arc::new(ScriptedHandler {
            fail_on: HashSet::from([3]),
            ..Default::default()
        });
        let tracker = Arc::new(OffsetTracker::new());
        let worker = worker(handler.clone(), tracker.clone());

        worker.sender().send(batch(0..6, 1)).await.unwrap();
        worker.shutdown().await;

        // every record was still handed to the handler
        assert_eq!(handler.seen.lock().unwrap().len(), 6);
        assert_eq!(tracker.get_partition_offset(&partition()), Some(3));
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_the_partition() {
        let handler = Arc::new(ScriptedHandler {
            panic_on: HashSet::from([1]),
            ..Default::default()
        });
        let tracker = Arc::new(OffsetTracker::new());
        let worker = worker(handler.clone(), tracker.clone());

        worker.sender().send(batch(0..3, 1)).await.unwrap();
        worker.sender().send(batch(3..5, 2)).await.unwrap();
        worker.shutdown().await;

        assert_eq!(*handler.seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(tracker.get_partition_offset(&partition()), Some(5));
    }

    #[tokio::test]
    async fn shutdown_drains_queued_batches() {
        let handler = Arc::new(ScriptedHandler {
            delay: Some(Duration::from_millis(5)),
            ..Default::default()
        });
        let tracker = Arc::new(OffsetTracker::new());
        let worker = worker(handler.clone(), tracker.clone());

        for i in 0..4 {
            worker
                .sender()
                .send(batch(i * 2..i * 2 + 2, i as u64 + 1))
                .await
                .unwrap();
        }
        worker.shutdown().await;

        assert_eq!(handler.seen.lock().unwrap().len(), 8);
        assert_eq!(tracker.get_partition_offset(&partition()), Some(8));
    }

    #[tokio::test]
    async fn empty_batch_does_not_touch_offsets() {
        let handler = Arc::new(ScriptedHandler::default());
        let tracker = Arc::new(OffsetTracker::new());
        let worker = worker(handler, tracker.clone());

        worker
            .sender()
            .send(PartitionBatch::new(partition(), vec![], 1))
            .await
            .unwrap();
        worker.shutdown().await;

        assert_eq!(tracker.get_partition_offset(&partition()), None);
    }
}
