//! Committable offsets per partition.
//!
//! Partition workers report the next offset that is safe to commit after
//! each batch; the poll task periodically takes the partitions that advanced
//! since their last commit and commits them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::metrics_consts::OFFSET_OUT_OF_ORDER_BATCH;
use crate::types::Partition;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum OffsetTrackerError {
    #[error("rebalance in progress, offset commits are skipped")]
    RebalanceInProgress,
}

struct PartitionState {
    /// Next offset to consume
    processed_offset: i64,
    last_processed_batch_id: u64,
    /// Last offset handed to the backend for commit
    committed_offset: Option<i64>,
}

pub struct OffsetTracker {
    partition_state: DashMap<Partition, PartitionState>,
    next_batch_id: AtomicU64,
    rebalancing: AtomicBool,
}

impl Default for OffsetTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self {
            partition_state: DashMap::new(),
            // 0 means "no batch"
            next_batch_id: AtomicU64::new(1),
            rebalancing: AtomicBool::new(false),
        }
    }

    /// While set, `get_committable_offsets` refuses to return anything so no
    /// commit is attempted for partitions being revoked.
    pub fn set_rebalancing(&self, rebalancing: bool) {
        let was_rebalancing = self.rebalancing.swap(rebalancing, Ordering::SeqCst);
        if was_rebalancing != rebalancing {
            info!(rebalancing, "offset tracker rebalancing state changed");
        }
    }

    pub fn is_rebalancing(&self) -> bool {
        self.rebalancing.load(Ordering::SeqCst)
    }

    /// Globally unique, increasing batch ids, used to detect reordering.
    pub fn assign_batch_id(&self) -> u64 {
        self.next_batch_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Record `next_offset` as safe to commit for `partition`. Never moves
    /// an offset backwards.
    pub fn mark_processed(&self, partition: &Partition, batch_id: u64, next_offset: i64) {
        self.partition_state
            .entry(partition.clone())
            .and_modify(|state| {
                if batch_id <= state.last_processed_batch_id {
                    warn!(
                        partition = %partition,
                        batch_id,
                        last_batch_id = state.last_processed_batch_id,
                        "batch processed out of order"
                    );
                    metrics::counter!(
                        OFFSET_OUT_OF_ORDER_BATCH,
                        "topic" => partition.topic().to_string(),
                        "partition" => partition.partition_number().to_string()
                    )
                    .increment(1);
                } else {
                    state.last_processed_batch_id = batch_id;
                }

                if next_offset > state.processed_offset {
                    debug!(
                        partition = %partition,
                        batch_id,
                        previous_offset = state.processed_offset,
                        new_offset = next_offset,
                        "advancing processed offset"
                    );
                    state.processed_offset = next_offset;
                }
            })
            .or_insert_with(|| PartitionState {
                processed_offset: next_offset,
                last_processed_batch_id: batch_id,
                committed_offset: None,
            });
    }

    /// Partitions whose processed offset moved since their last commit.
    pub fn get_committable_offsets(&self) -> Result<HashMap<Partition, i64>, OffsetTrackerError> {
        if self.is_rebalancing() {
            return Err(OffsetTrackerError::RebalanceInProgress);
        }

        Ok(self
            .partition_state
            .iter()
            .filter(|entry| entry.committed_offset != Some(entry.processed_offset))
            .map(|entry| (entry.key().clone(), entry.processed_offset))
            .collect())
    }

    /// Called once the backend accepted a commit for `offsets`.
    pub fn mark_committed(&self, offsets: &HashMap<Partition, i64>) {
        for (partition, offset) in offsets {
            if let Some(mut state) = self.partition_state.get_mut(partition) {
                if state.committed_offset.map_or(true, |c| *offset > c) {
                    state.committed_offset = Some(*offset);
                }
            }
        }
    }

    pub fn get_partition_offset(&self, partition: &Partition) -> Option<i64> {
        self.partition_state
            .get(partition)
            .map(|state| state.processed_offset)
    }

    pub fn get_committed_offset(&self, partition: &Partition) -> Option<i64> {
        self.partition_state
            .get(partition)
            .and_then(|state| state.committed_offset)
    }

    /// Forget a revoked partition.
    pub fn clear_partition(&self, partition: &Partition) {
        if self.partition_state.remove(partition).is_some() {
            debug!(partition = %partition, "cleared offset tracking for revoked partition");
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partition_state.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition(num: i32) -> Partition {
        Partition::new("device-events", num)
    }

    #[test]
    fn batch_ids_are_sequential() {
        let tracker = OffsetTracker::new();
        assert_eq!(tracker.assign_batch_id(), 1);
        assert_eq!(tracker.assign_batch_id(), 2);
        assert_eq!(tracker.assign_batch_id(), 3);
    }

    #[test]
    fn offsets_never_regress() {
        let tracker = OffsetTracker::new();
        let p0 = partition(0);

        let first = tracker.assign_batch_id();
        let second = tracker.assign_batch_id();
        tracker.mark_processed(&p0, second, 200);
        tracker.mark_processed(&p0, first, 100);

        assert_eq!(tracker.get_partition_offset(&p0), Some(200));
    }

    #[test]
    fn only_advanced_partitions_are_committable() {
        let tracker = OffsetTracker::new();
        let (p0, p1) = (partition(0), partition(1));

        tracker.mark_processed(&p0, tracker.assign_batch_id(), 10);
        tracker.mark_processed(&p1, tracker.assign_batch_id(), 5);

        let offsets = tracker.get_committable_offsets().unwrap();
        assert_eq!(offsets.len(), 2);
        tracker.mark_committed(&offsets);
        assert!(tracker.get_committable_offsets().unwrap().is_empty());

        tracker.mark_processed(&p1, tracker.assign_batch_id(), 8);
        let offsets = tracker.get_committable_offsets().unwrap();
        assert_eq!(offsets, HashMap::from([(p1.clone(), 8)]));
        assert_eq!(tracker.get_committed_offset(&p1), Some(5));
    }

    #[test]
    fn rebalancing_blocks_commits() {
        let tracker = OffsetTracker::new();
        let p0 = partition(0);
        tracker.mark_processed(&p0, tracker.assign_batch_id(), 42);

        tracker.set_rebalancing(true);
        assert_eq!(
            tracker.get_committable_offsets(),
            Err(OffsetTrackerError::RebalanceInProgress)
        );

        tracker.clear_partition(&p0);
        tracker.set_rebalancing(false);
        assert!(tracker.get_committable_offsets().unwrap().is_empty());
        assert_eq!(tracker.partition_count(), 0);
    }
}
