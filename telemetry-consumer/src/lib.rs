//! Generic partitioned log consumer shared by every log-driven stage.
//!
//! One poll task pulls records from a `LogConsumer` backend and fans them out
//! to one serial `PartitionWorker` per partition. Workers hand each record to
//! a `RecordHandler` and report committable offsets to the `OffsetTracker`,
//! which the poll task commits on an interval.

pub mod config;
pub mod consumer;
pub mod handler;
pub mod kafka;
pub mod log;
pub mod memory;
pub mod metrics_consts;
pub mod offset_tracker;
pub mod partition_router;
pub mod partition_worker;
pub mod producer;
pub mod record;
pub mod types;

pub use consumer::{ConsumerState, ConsumerStatus, PartitionedLogConsumer};
pub use handler::RecordHandler;
pub use log::{LogConsumer, LogError};
pub use offset_tracker::OffsetTracker;
pub use record::ConsumerRecord;
pub use types::Partition;
