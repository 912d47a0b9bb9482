use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use crate::log::{LogConsumer, LogError};
use crate::record::ConsumerRecord;
use crate::types::Partition;

#[derive(Default)]
struct MemoryLogState {
    subscribed: bool,
    pending: BTreeMap<i32, VecDeque<ConsumerRecord>>,
    next_offset: HashMap<i32, i64>,
    committed: HashMap<Partition, i64>,
    commit_count: usize,
    // revoked by the next poll, then handed out by take_revoked
    revoking: Vec<Partition>,
    revoked: Vec<Partition>,
    unowned: HashSet<Partition>,
    commits_after_revocation: usize,
}

/// In-process log for one topic. Records appended here are delivered once,
/// in offset order per partition; commits are recorded for inspection.
///
/// [`MemoryLog::revoke`] takes a partition away the way a group rebalance
/// does: inside the next poll, just before it returns. Appending to it again assigns it back.
pub struct MemoryLog {
    topic: String,
    state: Mutex<MemoryLogState>,
    appended: Notify,
}

impl MemoryLog {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            state: Mutex::new(MemoryLogState::default()),
            appended: Notify::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Append a record and return its offset.
    pub fn append(&self, partition: i32, key: Option<&str>, value: impl Into<Bytes>) -> i64 {
        let offset = {
            let mut state = self.lock();
            let next = state.next_offset.entry(partition).or_insert(0);
            let offset = *next;
            *next += 1;

            let owned = Partition::new(self.topic.clone(), partition);
            state.unowned.remove(&owned);
            let mut record = ConsumerRecord::new(owned, offset, value);
            if let Some(key) = key {
                record = record.with_key(key.to_owned());
            }
            state.pending.entry(partition).or_default().push_back(record);
            offset
        };
        self.appended.notify_waiters();
        offset
    }

    pub fn committed(&self, partition: i32) -> Option<i64> {
        self.lock()
            .committed
            .get(&Partition::new(self.topic.clone(), partition))
            .copied()
    }

    pub fn commit_count(&self) -> usize {
        self.lock().commit_count
    }

    /// Revoke `partition` at the end of the next poll. Records of it not yet polled
    /// are dropped, as another group member would consume them.
    pub fn revoke(&self, partition: i32) {
        let mut state = self.lock();
        state.pending.remove(&partition);
        state
            .revoking
            .push(Partition::new(self.topic.clone(), partition));
    }

    /// Revocations not yet handed out by `take_revoked`.
    pub fn revocations_pending(&self) -> usize {
        let state = self.lock();
        state.revoking.len() + state.revoked.len()
    }

    /// Commits that named a partition after it was revoked.
    pub fn commits_after_revocation(&self) -> usize {
        self.lock().commits_after_revocation
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.values().map(VecDeque::len).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryLogState> {
        // a poisoned lock only means a test thread panicked mid-update
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take(&self, max_records: usize) -> Vec<ConsumerRecord> {
        let mut state = self.lock();
        let mut records = Vec::new();
        for queue in state.pending.values_mut() {
            while records.len() < max_records {
                match queue.pop_front() {
                    Some(record) => records.push(record),
                    None => break,
                }
            }
        }
        records
    }
}

#[async_trait]
impl LogConsumer for MemoryLog {
    async fn subscribe(&self) -> Result<(), LogError> {
        self.lock().subscribed = true;
        Ok(())
    }

    async fn poll(
        &self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<ConsumerRecord>, LogError> {
        if !self.lock().subscribed {
            return Err(LogError::Fatal("poll before subscribe".to_string()));
        }

        let mut records = self.take(max_records);
        if records.is_empty() {
            let _ = tokio::time::timeout(timeout, self.appended.notified()).await;
            records = self.take(max_records);
        }

        let mut state = self.lock();
        let revoking = std::mem::take(&mut state.revoking);
        state.unowned.extend(revoking.iter().cloned());
        state.revoked.extend(revoking);
        Ok(records)
    }

    fn commit(&self, offsets: &HashMap<Partition, i64>) -> Result<(), LogError> {
        let mut state = self.lock();
        for (partition, offset) in offsets {
            if state.unowned.contains(partition) {
                state.commits_after_revocation += 1;
                continue;
            }
            state.committed.insert(partition.clone(), *offset);
        }
        state.commit_count += 1;
        Ok(())
    }

    fn take_revoked(&self) -> Vec<Partition> {
        std::mem::take(&mut self.lock().revoked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_each_record_once_in_order() {
        let log = MemoryLog::new("raw-device-events");
        log.subscribe().await.unwrap();
        for i in 0..5 {
            log.append(i % 2, Some("dev-123"), format!("r{i}"));
        }

        let first = log.poll(3, Duration::from_millis(10)).await.unwrap();
        let rest = log.poll(10, Duration::from_millis(10)).await.unwrap();
        let empty = log.poll(10, Duration::from_millis(10)).await.unwrap();

        assert_eq!(first.len() + rest.len(), 5);
        assert!(empty.is_empty());
        let p0: Vec<i64> = first
            .iter()
            .chain(rest.iter())
            .filter(|r| r.partition.partition_number() == 0)
            .map(|r| r.offset)
            .collect();
        assert_eq!(p0, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn revocation_happens_during_poll() {
        let log = MemoryLog::new("raw-device-events");
        log.subscribe().await.unwrap();
        log.append(0, None, "a");
        log.append(1, None, "b");

        log.revoke(0);
        assert!(log.take_revoked().is_empty());
        assert_eq!(log.revocations_pending(), 1);

        let records = log.poll(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].partition.partition_number(), 1);
        assert_eq!(
            log.take_revoked(),
            vec![Partition::new("raw-device-events", 0)]
        );
        assert_eq!(log.revocations_pending(), 0);

        let offsets = HashMap::from([
            (Partition::new("raw-device-events", 0), 1),
            (Partition::new("raw-device-events", 1), 1),
        ]);
        log.commit(&offsets).unwrap();
        assert_eq!(log.committed(0), None);
        assert_eq!(log.committed(1), Some(1));
        assert_eq!(log.commits_after_revocation(), 1);

        // appending assigns the partition back
        log.append(0, None, "c");
        log.commit(&offsets).unwrap();
        assert_eq!(log.committed(0), Some(1));
    }

    #[tokio::test]
    async fn poll_requires_subscription() {
        let log = MemoryLog::new("raw-device-events");
        assert!(matches!(
            log.poll(1, Duration::from_millis(1)).await,
            Err(LogError::Fatal(_))
        ));
    }
}
