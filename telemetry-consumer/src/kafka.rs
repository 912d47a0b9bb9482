//! Kafka backend for the partitioned consumer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Headers};
use rdkafka::{ClientConfig, ClientContext, Message, Offset, TopicPartitionList};
use telemetry_common::error::InfrastructureFailure;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{ConsumerConfig, KafkaConfig};
use crate::log::{LogConsumer, LogError};
use crate::metrics_consts::{CONSUMER_LOG_ERRORS, REBALANCE_EVENTS};
use crate::offset_tracker::OffsetTracker;
use crate::record::ConsumerRecord;
use crate::types::Partition;

/// Client context that keeps the offset tracker in step with group
/// rebalances: commits are suspended while partitions are being revoked and
/// revoked partitions are forgotten.
pub struct TrackingConsumerContext {
    offset_tracker: Arc<OffsetTracker>,
    revoked: Mutex<Vec<Partition>>,
}

impl TrackingConsumerContext {
    pub fn new(offset_tracker: Arc<OffsetTracker>) -> Self {
        Self {
            offset_tracker,
            revoked: Mutex::new(Vec::new()),
        }
    }

    fn take_revoked(&self) -> Vec<Partition> {
        match self.revoked.lock() {
            Ok(mut revoked) => std::mem::take(&mut *revoked),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl ClientContext for TrackingConsumerContext {}

impl ConsumerContext for TrackingConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                metrics::counter!(REBALANCE_EVENTS, "event_type" => "revoke").increment(1);
                if partitions.count() == 0 {
                    debug!("skipping empty revoke");
                    return;
                }
                info!(partitions = partitions.count(), "revoking partitions");
                self.offset_tracker.set_rebalancing(true);

                let partitions: Vec<Partition> = partitions
                    .elements()
                    .into_iter()
                    .map(Partition::from)
                    .collect();
                for partition in &partitions {
                    self.offset_tracker.clear_partition(partition);
                }
                match self.revoked.lock() {
                    Ok(mut revoked) => revoked.extend(partitions),
                    Err(poisoned) => poisoned.into_inner().extend(partitions),
                }
            }
            Rebalance::Assign(partitions) => {
                info!(partitions = partitions.count(), "pre-rebalance assign");
            }
            Rebalance::Error(e) => {
                error!("rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                metrics::counter!(REBALANCE_EVENTS, "event_type" => "assign").increment(1);
                info!(partitions = partitions.count(), "partitions assigned");
            }
            Rebalance::Revoke(_) => {
                debug!("post-rebalance revoke");
            }
            Rebalance::Error(e) => {
                error!("post-rebalance error: {}", e);
            }
        }
        self.offset_tracker.set_rebalancing(false);
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(partitions = offsets.count(), "offsets committed"),
            // superseded by the next commit
            Err(e) => warn!(partitions = offsets.count(), "failed to commit offsets: {}", e),
        }
    }
}

pub struct KafkaLogConsumer {
    consumer: StreamConsumer<TrackingConsumerContext>,
    topics: Vec<String>,
    consecutive_errors: AtomicU64,
}

impl KafkaLogConsumer {
    /// Builds the consumer and checks that the brokers answer a metadata
    /// request before returning.
    pub fn new(
        kafka: &KafkaConfig,
        config: &ConsumerConfig,
        offset_tracker: Arc<OffsetTracker>,
    ) -> Result<Self, InfrastructureFailure> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &kafka.kafka_hosts)
            .set("group.id", &config.kafka_consumer_group)
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        if kafka.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }

        debug!("rdkafka consumer configuration: {:?}", client_config);
        let consumer: StreamConsumer<TrackingConsumerContext> = client_config
            .create_with_context(TrackingConsumerContext::new(offset_tracker))
            .map_err(|e| InfrastructureFailure::Kafka(e.to_string()))?;

        match consumer
            .client()
            .fetch_metadata(None, Duration::from_secs(15))
        {
            Ok(metadata) => info!(
                "connected to Kafka brokers, found {} topics",
                metadata.topics().len()
            ),
            Err(e) => {
                error!("failed to fetch metadata from Kafka brokers: {:?}", e);
                return Err(InfrastructureFailure::BrokerUnreachable(e.to_string()));
            }
        }

        Ok(Self {
            consumer,
            topics: config.topics(),
            consecutive_errors: AtomicU64::new(0),
        })
    }

    /// Logs and backs off on recoverable errors; returns the error when the
    /// consumer cannot continue.
    async fn handle_kafka_error(e: KafkaError, error_count: u64) -> Option<LogError> {
        match &e {
            KafkaError::MessageConsumption(code) => {
                match code {
                    RDKafkaErrorCode::PartitionEOF | RDKafkaErrorCode::OperationTimedOut => {
                        metrics::counter!(CONSUMER_LOG_ERRORS, "level" => "info").increment(1);
                    }
                    RDKafkaErrorCode::OffsetOutOfRange => {
                        // auto.offset.reset repositions the consumer
                        warn!("offset out of range, resetting to configured policy");
                        metrics::counter!(CONSUMER_LOG_ERRORS, "level" => "info").increment(1);
                        sleep(Duration::from_millis(500)).await;
                    }
                    _ => {
                        warn!("kafka consumer error: {code:?}");
                        metrics::counter!(CONSUMER_LOG_ERRORS, "level" => "warn").increment(1);
                        sleep(Duration::from_millis(100 * error_count.min(10))).await;
                    }
                }
                None
            }
            KafkaError::MessageConsumptionFatal(code) => {
                error!("fatal kafka consumer error: {code:?}");
                metrics::counter!(CONSUMER_LOG_ERRORS, "level" => "fatal").increment(1);
                Some(LogError::Fatal(e.to_string()))
            }
            KafkaError::Global(RDKafkaErrorCode::Authentication) => {
                error!("kafka authentication failed");
                metrics::counter!(CONSUMER_LOG_ERRORS, "level" => "fatal").increment(1);
                Some(LogError::Fatal(e.to_string()))
            }
            KafkaError::Global(code) => {
                warn!("global kafka error: {code:?}, waiting for reconnect");
                metrics::counter!(CONSUMER_LOG_ERRORS, "level" => "warn").increment(1);
                sleep(Duration::from_secs(error_count.min(5))).await;
                None
            }
            KafkaError::Canceled => {
                info!("kafka consumer canceled");
                Some(LogError::Fatal(e.to_string()))
            }
            _ => {
                error!("unexpected kafka error: {:?}", e);
                metrics::counter!(CONSUMER_LOG_ERRORS, "level" => "error").increment(1);
                sleep(Duration::from_millis(100 * error_count.min(10))).await;
                None
            }
        }
    }
}

fn to_record(message: &BorrowedMessage<'_>) -> ConsumerRecord {
    let mut record = ConsumerRecord::new(
        Partition::new(message.topic(), message.partition()),
        message.offset(),
        message
            .payload()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default(),
    );
    if let Some(key) = message.key() {
        record = record.with_key(Bytes::copy_from_slice(key));
    }
    record.timestamp = message.timestamp().to_millis();
    if let Some(headers) = message.headers() {
        for header in headers.iter() {
            let value = header
                .value
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default();
            record = record.with_header(header.key, value);
        }
    }
    record
}

#[async_trait]
impl LogConsumer for KafkaLogConsumer {
    async fn subscribe(&self) -> Result<(), LogError> {
        let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&topics)
            .map_err(|e| LogError::Subscribe(e.to_string()))?;
        info!(topics = ?self.topics, "subscribed");
        Ok(())
    }

    async fn poll(
        &self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<ConsumerRecord>, LogError> {
        let deadline = Instant::now() + timeout;
        let mut records = Vec::with_capacity(max_records);

        while records.len() < max_records {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Ok(Ok(message)) => {
                    records.push(to_record(&message));
                    self.consecutive_errors.store(0, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    let count = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
                    if let Some(fatal) = Self::handle_kafka_error(e, count).await {
                        return Err(fatal);
                    }
                    break;
                }
                Err(_) => break,
            }
        }

        Ok(records)
    }

    fn commit(&self, offsets: &HashMap<Partition, i64>) -> Result<(), LogError> {
        let mut list = TopicPartitionList::new();
        for (partition, offset) in offsets {
            list.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(*offset),
            )
            .map_err(|e| LogError::Commit(e.to_string()))?;
        }
        self.consumer
            .commit(&list, CommitMode::Async)
            .map_err(|e| LogError::Commit(e.to_string()))
    }

    fn take_revoked(&self) -> Vec<Partition> {
        self.consumer.context().take_revoked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revoked_partitions_are_handed_out_once() {
        let context = TrackingConsumerContext::new(Arc::new(OffsetTracker::new()));
        let p0 = Partition::new("raw-device-events", 0);
        context.revoked.lock().unwrap().push(p0.clone());

        assert_eq!(context.take_revoked(), vec![p0]);
        assert!(context.take_revoked().is_empty());
    }
}
