use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientContext;
use telemetry_common::model::DecodedEventRequest;
use tracing::error;

use crate::metrics_consts::{EVENTS_DROPPED_TOO_BIG, EVENTS_PUBLISHED};

/// Receives the event requests decoded from one device message, in order.
#[async_trait]
pub trait DecodedEventSink: Send + Sync {
    async fn publish(&self, events: &[DecodedEventRequest]) -> Result<()>;
}

/// Publishes event requests as JSON, keyed by device token so a device's
/// events land on one partition in order.
pub struct KafkaEventSink<C: ClientContext + 'static> {
    producer: FutureProducer<C>,
    topic: String,
}

impl<C: ClientContext + 'static> KafkaEventSink<C> {
    pub fn new(producer: FutureProducer<C>, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl<C: ClientContext + 'static> DecodedEventSink for KafkaEventSink<C> {
    async fn publish(&self, events: &[DecodedEventRequest]) -> Result<()> {
        let mut deliveries = Vec::with_capacity(events.len());

        for event in events {
            let payload =
                serde_json::to_string(event).context("failed to serialize event request")?;
            let record = FutureRecord {
                topic: self.topic.as_str(),
                payload: Some(&payload),
                partition: None,
                key: Some(&event.device_token),
                timestamp: None,
                headers: None,
            };

            // Enqueue everything first, then wait for the acks together
            match self.producer.send_result(record) {
                Ok(delivery) => deliveries.push(delivery),
                Err((e, _)) => match e.rdkafka_error_code() {
                    Some(RDKafkaErrorCode::MessageSizeTooLarge) => {
                        metrics::counter!(EVENTS_DROPPED_TOO_BIG).increment(1);
                        error!(
                            device_token = %event.device_token,
                            "dropping event request larger than the producer allows"
                        );
                    }
                    _ => return Err(anyhow!("failed to enqueue event request: {}", e)),
                },
            }
        }

        for result in join_all(deliveries).await {
            match result {
                Ok(Ok(_)) => metrics::counter!(EVENTS_PUBLISHED).increment(1),
                Ok(Err((e, _))) => {
                    return Err(anyhow!(
                        "failed to publish event request to {}: {}",
                        self.topic,
                        e
                    ))
                }
                Err(_) => return Err(anyhow!("producer dropped delivery of event request")),
            }
        }
        Ok(())
    }
}
