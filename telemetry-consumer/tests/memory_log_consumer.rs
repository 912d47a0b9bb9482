use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use telemetry_consumer::consumer::ConsumerSettings;
use telemetry_consumer::memory::MemoryLog;
use telemetry_consumer::{
    ConsumerRecord, ConsumerState, OffsetTracker, Partition, PartitionedLogConsumer,
    RecordHandler,
};
use tokio::sync::{watch, Notify};
use tokio::time::{sleep, timeout, Instant};

#[derive(Default)]
struct RecordingHandler {
    seen: Mutex<Vec<(i32, i64, String)>>,
    fail_on: HashSet<(i32, i64)>,
    panic_on: HashSet<(i32, i64)>,
}

impl RecordingHandler {
    fn offsets_for(&self, partition: i32) -> Vec<i64> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _, _)| *p == partition)
            .map(|(_, o, _)| *o)
            .collect()
    }
}

#[async_trait]
impl RecordHandler for RecordingHandler {
    async fn handle(&self, record: &ConsumerRecord) -> Result<()> {
        let partition = record.partition.partition_number();
        self.seen.lock().unwrap().push((
            partition,
            record.offset,
            String::from_utf8_lossy(&record.value).into_owned(),
        ));
        // give other partitions a chance to interleave
        tokio::task::yield_now().await;

        if self.panic_on.contains(&(partition, record.offset)) {
            panic!("handler panicked on {partition}:{}", record.offset);
        }
        if self.fail_on.contains(&(partition, record.offset)) {
            return Err(anyhow!("rejected {partition}:{}", record.offset));
        }
        Ok(())
    }
}

fn settings() -> ConsumerSettings {
    ConsumerSettings {
        max_poll_records: 7,
        poll_timeout: Duration::from_millis(10),
        commit_interval: Duration::from_millis(15),
        shutdown_timeout: Duration::from_secs(5),
        worker_count: 2,
        ..Default::default()
    }
}

/// Runs a consumer over `log` until every appended record was polled, then
/// shuts it down and waits for it to stop.
async fn run_to_completion(log: Arc<MemoryLog>, handler: Arc<RecordingHandler>) {
    let consumer = PartitionedLogConsumer::new(
        log.clone(),
        handler,
        Arc::new(OffsetTracker::new()),
        settings(),
    );
    let status = consumer.status();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(consumer.run(shutdown_rx));

    while log.pending() > 0 {
        sleep(Duration::from_millis(5)).await;
    }
    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(status.current(), ConsumerState::Stopped);
}

#[tokio::test]
async fn records_of_a_partition_are_handled_in_offset_order() {
    let log = Arc::new(MemoryLog::new("device-events"));
    for i in 0..30 {
        log.append(i % 3, Some(&format!("dev-{}", i % 3)), format!("event-{i}"));
    }
    let handler = Arc::new(RecordingHandler::default());

    run_to_completion(log.clone(), handler.clone()).await;

    for partition in 0..3 {
        assert_eq!(handler.offsets_for(partition), (0..10).collect::<Vec<_>>());
        assert_eq!(log.committed(partition), Some(10));
    }
}

#[tokio::test]
async fn commit_never_passes_a_failed_record() {
    let log = Arc::new(MemoryLog::new("device-events"));
    for i in 0..6 {
        log.append(0, None, format!("p0-{i}"));
        log.append(1, None, format!("p1-{i}"));
    }
    let handler = Arc::new(RecordingHandler {
        fail_on: HashSet::from([(0, 2)]),
        ..Default::default()
    });

    run_to_completion(log.clone(), handler.clone()).await;

    // the partition kept going after the failure
    assert_eq!(handler.offsets_for(0), (0..6).collect::<Vec<_>>());
    let committed = log.committed(0).unwrap();
    assert!(committed <= 2, "committed {committed} past failed offset 2");
    assert_eq!(log.committed(1), Some(6));
}

#[tokio::test]
async fn panicking_handler_is_isolated_to_the_record() {
    let log = Arc::new(MemoryLog::new("device-events"));
    for i in 0..4 {
        log.append(0, None, format!("p0-{i}"));
    }
    let handler = Arc::new(RecordingHandler {
        panic_on: HashSet::from([(0, 1)]),
        ..Default::default()
    });

    run_to_completion(log.clone(), handler.clone()).await;

    assert_eq!(handler.offsets_for(0), vec![0, 1, 2, 3]);
    assert!(log.committed(0).unwrap() <= 1);
}

#[tokio::test]
async fn shutdown_drains_in_flight_work_before_the_final_commit() {
    let log = Arc::new(MemoryLog::new("device-events"));
    for i in 0..50 {
        log.append(i % 2, None, format!("event-{i}"));
    }
    let handler = Arc::new(RecordingHandler::default());

    run_to_completion(log.clone(), handler.clone()).await;

    assert_eq!(handler.seen.lock().unwrap().len(), 50);
    assert_eq!(log.committed(0), Some(25));
    assert_eq!(log.committed(1), Some(25));
    assert!(log.commit_count() >= 1);
}

/// Holds the record at `gate` until `open` is notified, which may be never.
struct GatedHandler {
    gate: (i32, i64),
    open: Notify,
    started: Mutex<Vec<(i32, i64)>>,
    finished: Mutex<Vec<(i32, i64)>>,
}

impl GatedHandler {
    fn new(partition: i32, offset: i64) -> Self {
        Self {
            gate: (partition, offset),
            open: Notify::new(),
            started: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
        }
    }

    fn started(&self, partition: i32, offset: i64) -> bool {
        self.started.lock().unwrap().contains(&(partition, offset))
    }

    fn finished(&self, partition: i32, offset: i64) -> bool {
        self.finished.lock().unwrap().contains(&(partition, offset))
    }
}

#[async_trait]
impl RecordHandler for GatedHandler {
    async fn handle(&self, record: &ConsumerRecord) -> Result<()> {
        let key = (record.partition.partition_number(), record.offset);
        self.started.lock().unwrap().push(key);
        if key == self.gate {
            self.open.notified().await;
        }
        self.finished.lock().unwrap().push(key);
        Ok(())
    }
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !done() {
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn stuck_handler_does_not_hold_up_shutdown() {
    let log = Arc::new(MemoryLog::new("device-events"));
    for i in 0..4 {
        log.append(0, None, format!("p0-{i}"));
    }
    let handler = Arc::new(GatedHandler::new(0, 2));
    let shutdown_timeout = Duration::from_millis(100);
    let consumer = PartitionedLogConsumer::new(
        log.clone(),
        handler.clone(),
        Arc::new(OffsetTracker::new()),
        ConsumerSettings {
            shutdown_timeout,
            ..settings()
        },
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(consumer.run(shutdown_rx));

    wait_until(|| handler.started(0, 2)).await;
    let requested = Instant::now();
    shutdown_tx.send(true).unwrap();

    let stopped = timeout(shutdown_timeout + Duration::from_secs(1), task).await;
    assert!(stopped.is_ok(), "run() did not return after the drain timeout");
    stopped.unwrap().unwrap().unwrap();
    assert!(requested.elapsed() >= shutdown_timeout);

    assert!(!handler.finished(0, 2));
    assert!(!handler.started(0, 3));
    let committed = log.committed(0).unwrap_or(0);
    assert!(committed <= 2, "committed {committed} past stuck offset 2");
}

#[tokio::test]
async fn revoked_partition_is_released_before_the_next_commit() {
    let log = Arc::new(MemoryLog::new("device-events"));
    let handler = Arc::new(GatedHandler::new(0, 1));
    let tracker = Arc::new(OffsetTracker::new());
    let consumer = PartitionedLogConsumer::new(
        log.clone(),
        handler.clone(),
        tracker.clone(),
        ConsumerSettings {
            poll_timeout: Duration::from_millis(50),
            commit_interval: Duration::ZERO,
            ..settings()
        },
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(consumer.run(shutdown_rx));
    let p0 = Partition::new("device-events", 0);

    log.append(0, None, "first");
    wait_until(|| log.committed(0) == Some(1)).await;
    log.append(0, None, "gated");
    wait_until(|| handler.started(0, 1)).await;

    // the gated record finishes while the revoking poll is in progress
    handler.open.notify_one();
    log.revoke(0);
    wait_until(|| log.revocations_pending() == 0).await;
    wait_until(|| handler.finished(0, 1) && tracker.get_partition_offset(&p0).is_none()).await;

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(log.commits_after_revocation(), 0);
    assert_eq!(log.committed(0), Some(1));
}

#[tokio::test]
async fn partition_assigned_back_keeps_its_offsets() {
    let log = Arc::new(MemoryLog::new("device-events"));
    let handler = Arc::new(GatedHandler::new(0, 1));
    let tracker = Arc::new(OffsetTracker::new());
    let consumer = PartitionedLogConsumer::new(
        log.clone(),
        handler.clone(),
        tracker.clone(),
        settings(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(consumer.run(shutdown_rx));
    let p0 = Partition::new("device-events", 0);

    log.append(0, None, "first");
    wait_until(|| tracker.get_partition_offset(&p0) == Some(1)).await;
    log.append(0, None, "gated");
    wait_until(|| handler.started(0, 1)).await;

    log.revoke(0);
    wait_until(|| log.revocations_pending() == 0).await;

    // assigned back while the old worker is still stuck
    log.append(0, None, "after");
    wait_until(|| tracker.get_partition_offset(&p0) == Some(3)).await;

    handler.open.notify_one();
    wait_until(|| handler.finished(0, 1)).await;
    // let the released worker's cleanup run
    sleep(Duration::from_millis(50)).await;

    assert_eq!(tracker.get_partition_offset(&p0), Some(3));
    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(log.committed(0), Some(3));
}
