use anyhow::Result;
use async_trait::async_trait;

use crate::record::ConsumerRecord;

/// Business logic of a log-driven stage, invoked once per record in
/// partition order. An `Err` or a panic is logged with the record
/// coordinates and the partition moves on.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, record: &ConsumerRecord) -> Result<()>;
}
