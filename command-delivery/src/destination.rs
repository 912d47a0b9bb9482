use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::ClientContext;
use serde::Serialize;
use telemetry_common::model::CommandInvocation;
use tracing::{debug, error};

use crate::routing::RouteTarget;
use crate::system::SystemCommand;

/// Transport that carries an encoded command to a device.
#[async_trait]
pub trait CommandDestination: Send + Sync {
    fn id(&self) -> &RouteTarget;

    async fn deliver(&self, device_token: &str, payload: Bytes) -> Result<()>;
}

/// Receives invocations that could not be routed, so they are kept instead
/// of dropped.
#[async_trait]
pub trait UndeliveredCommandSink: Send + Sync {
    async fn publish(&self, invocation: &CommandInvocation, reason: &str) -> Result<()>;

    async fn publish_system(
        &self,
        device_token: &str,
        command: &SystemCommand,
        reason: &str,
    ) -> Result<()>;
}

/// Produces encoded commands to a topic, keyed by device token so a device's
/// commands stay in order.
pub struct KafkaCommandDestination<C: ClientContext + 'static> {
    id: RouteTarget,
    producer: FutureProducer<C>,
    topic: String,
    send_timeout: Duration,
}

impl<C: ClientContext + 'static> KafkaCommandDestination<C> {
    pub fn new(
        id: RouteTarget,
        producer: FutureProducer<C>,
        topic: impl Into<String>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            id,
            producer,
            topic: topic.into(),
            send_timeout,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl<C: ClientContext + 'static> CommandDestination for KafkaCommandDestination<C> {
    fn id(&self) -> &RouteTarget {
        &self.id
    }

    async fn deliver(&self, device_token: &str, payload: Bytes) -> Result<()> {
        let record = FutureRecord::to(&self.topic)
            .key(device_token)
            .payload(payload.as_ref());

        match self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
        {
            Ok(_) => {
                debug!(
                    destination = %self.id,
                    topic = %self.topic,
                    device_token,
                    "delivered command"
                );
                Ok(())
            }
            Err((e, _)) => {
                error!(
                    destination = %self.id,
                    topic = %self.topic,
                    device_token,
                    "failed to deliver command: {}",
                    e
                );
                Err(anyhow!(
                    "failed to deliver command for '{}' to topic '{}': {}",
                    device_token,
                    self.topic,
                    e
                ))
            }
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UndeliveredCommand<'a> {
    invocation: &'a CommandInvocation,
    reason: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UndeliveredSystemCommand<'a> {
    device_token: &'a str,
    system_command: &'a SystemCommand,
    reason: &'a str,
}

pub struct KafkaUndeliveredSink<C: ClientContext + 'static> {
    producer: FutureProducer<C>,
    topic: String,
    send_timeout: Duration,
}

impl<C: ClientContext + 'static> KafkaUndeliveredSink<C> {
    pub fn new(
        producer: FutureProducer<C>,
        topic: impl Into<String>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            producer,
            topic: topic.into(),
            send_timeout,
        }
    }

    async fn send(&self, key: &str, payload: &str) -> Result<()> {
        let record = FutureRecord::to(&self.topic).key(key).payload(payload);
        self.producer
            .send(record, Timeout::After(self.send_timeout))
            .await
            .map(|_| ())
            .map_err(|(e, _)| anyhow!("topic '{}': {}", self.topic, e))
    }
}

#[async_trait]
impl<C: ClientContext + 'static> UndeliveredCommandSink for KafkaUndeliveredSink<C> {
    async fn publish(&self, invocation: &CommandInvocation, reason: &str) -> Result<()> {
        let payload = serde_json::to_string(&UndeliveredCommand { invocation, reason })
            .context("failed to serialize undelivered command")?;
        self.send(&invocation.target_device, &payload)
            .await
            .with_context(|| {
                format!(
                    "failed to publish undelivered command {}",
                    invocation.invocation_id
                )
            })
    }

    async fn publish_system(
        &self,
        device_token: &str,
        command: &SystemCommand,
        reason: &str,
    ) -> Result<()> {
        let payload = serde_json::to_string(&UndeliveredSystemCommand {
            device_token,
            system_command: command,
            reason,
        })
        .context("failed to serialize undelivered system command")?;
        self.send(device_token, &payload).await.with_context(|| {
            format!(
                "failed to publish undelivered {} for {}",
                command.name(),
                device_token
            )
        })
    }
}
