//! Event stage: decoded event requests in, commands out to devices.
//!
//! Persisting measurements, locations, alerts and state changes belongs to
//! event management. This stage only accounts for them. Command invocations
//! and registration answers go through the [`CommandProcessor`].

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use command_delivery::{CommandProcessor, DeliveryOutcome};
use telemetry_common::model::{
    AlertRequest, CommandInvocation, CommandResponseRequest, LocationRequest, MeasurementRequest,
    RegistrationRequest, StateChangeRequest,
};
use telemetry_consumer::{ConsumerRecord, RecordHandler};
use tracing::{debug, info, warn};

use crate::event_router::{EventContext, EventHandlers, EventTypeRouter};
use crate::metrics_consts::COMMAND_OUTCOMES;

pub struct CommandEventHandlers {
    processor: CommandProcessor,
}

impl CommandEventHandlers {
    pub fn new(processor: CommandProcessor) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl EventHandlers for CommandEventHandlers {
    async fn registration(
        &self,
        context: &EventContext,
        request: &RegistrationRequest,
    ) -> Result<()> {
        let outcome = self
            .processor
            .acknowledge_registration(
                &context.device_token,
                request,
                context.originator.as_deref(),
            )
            .await
            .with_context(|| format!("registration of {} failed", context.device_token))?;
        if let DeliveryOutcome::Undelivered(reason) = outcome {
            warn!(
                device_token = %context.device_token,
                reason = %reason,
                "registration answer parked as undelivered"
            );
        }
        Ok(())
    }

    async fn measurement(
        &self,
        context: &EventContext,
        request: &MeasurementRequest,
    ) -> Result<()> {
        debug!(
            device_token = %context.device_token,
            name = %request.name,
            value = request.value,
            "measurement"
        );
        Ok(())
    }

    async fn location(&self, context: &EventContext, request: &LocationRequest) -> Result<()> {
        debug!(
            device_token = %context.device_token,
            latitude = request.latitude,
            longitude = request.longitude,
            "location"
        );
        Ok(())
    }

    async fn alert(&self, context: &EventContext, request: &AlertRequest) -> Result<()> {
        debug!(
            device_token = %context.device_token,
            alert_type = %request.alert_type,
            level = ?request.level,
            "alert"
        );
        Ok(())
    }

    async fn state_change(
        &self,
        context: &EventContext,
        request: &StateChangeRequest,
    ) -> Result<()> {
        debug!(
            device_token = %context.device_token,
            attribute = %request.attribute,
            new_state = %request.new_state,
            "state change"
        );
        Ok(())
    }

    async fn command_invocation(
        &self,
        context: &EventContext,
        invocation: &CommandInvocation,
    ) -> Result<()> {
        match self
            .processor
            .process(invocation, context.originator.as_deref())
            .await
        {
            Ok(DeliveryOutcome::Delivered(destinations)) => {
                metrics::counter!(COMMAND_OUTCOMES, "outcome" => "delivered").increment(1);
                info!(
                    invocation_id = %invocation.invocation_id,
                    target_device = %invocation.target_device,
                    originator = ?context.originator,
                    destinations = destinations.len(),
                    "command delivered"
                );
                Ok(())
            }
            Ok(DeliveryOutcome::Undelivered(reason)) => {
                metrics::counter!(COMMAND_OUTCOMES, "outcome" => "undelivered").increment(1);
                warn!(
                    invocation_id = %invocation.invocation_id,
                    reason = %reason,
                    "command parked as undelivered"
                );
                Ok(())
            }
            Err(e) => {
                metrics::counter!(COMMAND_OUTCOMES, "outcome" => "failed").increment(1);
                Err(e.context(format!(
                    "command invocation {} failed",
                    invocation.invocation_id
                )))
            }
        }
    }

    async fn command_response(
        &self,
        context: &EventContext,
        response: &CommandResponseRequest,
    ) -> Result<()> {
        debug!(
            device_token = %context.device_token,
            originating_event_id = %response.originating_event_id,
            "command response"
        );
        Ok(())
    }
}

/// Routes every event request in a record. Unknown tags and handler
/// failures fail the record.
pub struct EventRecordHandler<H: EventHandlers + ?Sized> {
    router: EventTypeRouter<H>,
}

impl<H: EventHandlers + ?Sized> EventRecordHandler<H> {
    pub fn new(handlers: Arc<H>) -> Self {
        Self {
            router: EventTypeRouter::new(handlers),
        }
    }
}

#[async_trait]
impl<H: EventHandlers + ?Sized + 'static> RecordHandler for EventRecordHandler<H> {
    async fn handle(&self, record: &ConsumerRecord) -> Result<()> {
        let routed = self.router.route_payload(&record.value).await?;
        debug!(
            topic = record.topic(),
            offset = record.offset,
            routed,
            "routed event requests"
        );
        Ok(())
    }
}
