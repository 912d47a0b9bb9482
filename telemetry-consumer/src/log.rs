use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::record::ConsumerRecord;
use crate::types::Partition;

#[derive(Error, Debug)]
pub enum LogError {
    /// Worth polling again after a pause
    #[error("transient log error: {0}")]
    Transient(String),
    /// Ends the poll loop
    #[error("fatal log error: {0}")]
    Fatal(String),
    #[error("offset commit failed: {0}")]
    Commit(String),
    #[error("subscription failed: {0}")]
    Subscribe(String),
}

/// Backend of a partitioned consumer: a subscription under a group id that
/// yields records and accepts offset commits.
#[async_trait]
pub trait LogConsumer: Send + Sync {
    async fn subscribe(&self) -> Result<(), LogError>;

    /// Up to `max_records` records, waiting at most `timeout` for the first.
    /// An empty vector is a normal outcome.
    async fn poll(
        &self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<ConsumerRecord>, LogError>;

    /// Offsets are "next offset to consume" per partition. Asynchronous:
    /// success means the commit was queued, not acknowledged.
    fn commit(&self, offsets: &HashMap<Partition, i64>) -> Result<(), LogError>;

    /// Partitions revoked by the group since the last call.
    fn take_revoked(&self) -> Vec<Partition> {
        Vec::new()
    }
}
