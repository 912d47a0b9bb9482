//! Dispatch of decoded event requests to typed handlers.
//!
//! Each event request carries an `eventType` tag. [`EventTypeRouter::route`]
//! calls exactly one method of [`EventHandlers`] for it. Tags the envelope
//! does not know fail before any handler runs.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use telemetry_common::model::{
    AlertRequest, CommandInvocation, CommandResponseRequest, DecodedEventRequest, EventRequest,
    LocationRequest, MeasurementRequest, RegistrationRequest, SourceMetadata, StateChangeRequest,
};
use telemetry_decoder::{DeviceEventDecoder, JsonEventDecoder};

use crate::metrics_consts::EVENTS_ROUTED;

/// Identity of the device an event request belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    pub device_token: String,
    pub originator: Option<String>,
}

impl From<&DecodedEventRequest> for EventContext {
    fn from(event: &DecodedEventRequest) -> Self {
        Self {
            device_token: event.device_token.clone(),
            originator: event.originator.clone(),
        }
    }
}

#[async_trait]
pub trait EventHandlers: Send + Sync {
    async fn registration(
        &self,
        context: &EventContext,
        request: &RegistrationRequest,
    ) -> Result<()>;

    async fn measurement(&self, context: &EventContext, request: &MeasurementRequest)
        -> Result<()>;

    async fn location(&self, context: &EventContext, request: &LocationRequest) -> Result<()>;

    async fn alert(&self, context: &EventContext, request: &AlertRequest) -> Result<()>;

    async fn state_change(
        &self,
        context: &EventContext,
        request: &StateChangeRequest,
    ) -> Result<()>;

    async fn command_invocation(
        &self,
        context: &EventContext,
        invocation: &CommandInvocation,
    ) -> Result<()>;

    async fn command_response(
        &self,
        context: &EventContext,
        response: &CommandResponseRequest,
    ) -> Result<()>;
}

pub struct EventTypeRouter<H: EventHandlers + ?Sized> {
    handlers: Arc<H>,
}

impl<H: EventHandlers + ?Sized> EventTypeRouter<H> {
    pub fn new(handlers: Arc<H>) -> Self {
        Self { handlers }
    }

    pub async fn route(&self, context: &EventContext, event: &EventRequest) -> Result<()> {
        let handled = match event {
            EventRequest::Registration(request) => {
                self.handlers.registration(context, request).await
            }
            EventRequest::Measurement(request) => {
                self.handlers.measurement(context, request).await
            }
            EventRequest::Location(request) => self.handlers.location(context, request).await,
            EventRequest::Alert(request) => self.handlers.alert(context, request).await,
            EventRequest::StateChange(request) => {
                self.handlers.state_change(context, request).await
            }
            EventRequest::CommandInvocation(invocation) => {
                self.handlers.command_invocation(context, invocation).await
            }
            EventRequest::CommandResponse(response) => {
                self.handlers.command_response(context, response).await
            }
        };
        handled?;

        metrics::counter!(EVENTS_ROUTED, "event_type" => event.event_type().as_str())
            .increment(1);
        Ok(())
    }

    /// Parse a JSON envelope (one request or an array of them) and route each
    /// request in order. Stops at the first failing request. Returns how many
    /// were routed.
    pub async fn route_payload(&self, payload: &Bytes) -> Result<usize> {
        let events = JsonEventDecoder.decode(payload, &SourceMetadata::new())?;
        for event in &events {
            self.route(&EventContext::from(event), &event.request).await?;
        }
        Ok(events.len())
    }
}
