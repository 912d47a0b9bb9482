//! Turns a command invocation, or a system command such as a registration
//! answer, into device payloads and hands them to every destination mapped
//! for the target's device type.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use telemetry_common::directory::{CommandCatalog, DeviceDirectory};
use telemetry_common::error::{ConfigurationError, RoutingFailure};
use telemetry_common::model::{CommandInvocation, RegistrationRequest};
use tracing::{debug, error, info, warn};

use crate::destination::{CommandDestination, UndeliveredCommandSink};
use crate::encoder::DynamicProtocolEncoder;
use crate::metrics_consts::{
    COMMANDS_DELIVERED, COMMANDS_UNDELIVERED, COMMAND_DELIVERY_ERRORS, COMMAND_ENCODE_FAILURES,
    COMMAND_UNKNOWN_DESTINATIONS, SYSTEM_COMMANDS_DELIVERED,
};
use crate::routing::{DeviceTypeMappingRouter, RouteTarget};
use crate::system::{RegistrationFailureReason, RegistrationSuccess, SystemCommand};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered(Vec<RouteTarget>),
    /// Published to the undelivered sink
    Undelivered(String),
}

pub struct CommandProcessor {
    catalog: Arc<dyn CommandCatalog>,
    directory: Arc<dyn DeviceDirectory>,
    router: Arc<DeviceTypeMappingRouter>,
    encoder: DynamicProtocolEncoder,
    destinations: HashMap<RouteTarget, Arc<dyn CommandDestination>>,
    undelivered: Arc<dyn UndeliveredCommandSink>,
}

impl CommandProcessor {
    /// Every destination the current mapping names must be registered.
    pub fn new(
        catalog: Arc<dyn CommandCatalog>,
        directory: Arc<dyn DeviceDirectory>,
        router: Arc<DeviceTypeMappingRouter>,
        destinations: Vec<Arc<dyn CommandDestination>>,
        undelivered: Arc<dyn UndeliveredCommandSink>,
    ) -> Result<Self, ConfigurationError> {
        let destinations: HashMap<RouteTarget, Arc<dyn CommandDestination>> = destinations
            .into_iter()
            .map(|d| (d.id().clone(), d))
            .collect();

        let snapshot = router.snapshot();
        if let Some(missing) = snapshot
            .destinations()
            .into_iter()
            .find(|target| !destinations.contains_key(*target))
        {
            return Err(ConfigurationError::InvalidSetting {
                name: "destinations".to_string(),
                reason: format!("mapping names unregistered destination {missing}"),
            });
        }
        info!(destinations = destinations.len(), "command processor ready");

        Ok(Self {
            catalog,
            directory,
            router,
            encoder: DynamicProtocolEncoder::new(),
            destinations,
            undelivered,
        })
    }

    /// Unknown commands or devices and encode failures are errors for this
    /// invocation only. A routing failure is not an error: the invocation
    /// goes to the undelivered sink.
    pub async fn process(
        &self,
        invocation: &CommandInvocation,
        originator: Option<&str>,
    ) -> Result<DeliveryOutcome> {
        let command = self
            .catalog
            .get_command(&invocation.command_token)
            .await?
            .ok_or_else(|| anyhow!("unknown command {}", invocation.command_token))?;
        let device = self
            .directory
            .get_device_by_identity(&invocation.target_device)
            .await?
            .ok_or_else(|| anyhow!("unknown target device {}", invocation.target_device))?;

        let targets = match self.resolve(&device.device_type_token) {
            Ok(targets) => targets,
            Err(failure) => {
                let reason = self.routing_failed(&invocation.target_device, failure);
                self.undelivered
                    .publish(invocation, &reason)
                    .await
                    .inspect_err(|e| {
                        error!(
                            invocation_id = %invocation.invocation_id,
                            "failed to publish undelivered command: {}",
                            e
                        )
                    })?;
                return Ok(DeliveryOutcome::Undelivered(reason));
            }
        };

        let payload = self
            .encoder
            .encode(&command, invocation, originator)
            .inspect_err(|_| {
                metrics::counter!(COMMAND_ENCODE_FAILURES, "command" => command.token.clone())
                    .increment(1);
            })?;

        let delivered = self
            .fan_out(&targets, &device.token, payload)
            .await
            .with_context(|| format!("invocation {}", invocation.invocation_id))?;

        metrics::counter!(COMMANDS_DELIVERED).increment(1);
        debug!(
            invocation_id = %invocation.invocation_id,
            device_token = %device.token,
            destinations = delivered.len(),
            "command delivered"
        );
        Ok(DeliveryOutcome::Delivered(delivered))
    }

    /// Routes by `device_type` rather than a directory lookup, so a device
    /// that is not registered yet can still be answered.
    pub async fn deliver_system_command(
        &self,
        device_token: &str,
        device_type: &str,
        command: &SystemCommand,
        originator: Option<&str>,
    ) -> Result<DeliveryOutcome> {
        let targets = match self.resolve(device_type) {
            Ok(targets) => targets,
            Err(failure) => {
                let reason = self.routing_failed(device_token, failure);
                self.undelivered
                    .publish_system(device_token, command, &reason)
                    .await?;
                return Ok(DeliveryOutcome::Undelivered(reason));
            }
        };

        let payload = self
            .encoder
            .encode_system_command(command, originator)
            .inspect_err(|_| {
                metrics::counter!(COMMAND_ENCODE_FAILURES, "command" => command.name())
                    .increment(1);
            })?;
        let delivered = self
            .fan_out(&targets, device_token, payload)
            .await
            .with_context(|| format!("{} for {}", command.name(), device_token))?;

        metrics::counter!(SYSTEM_COMMANDS_DELIVERED, "command" => command.name()).increment(1);
        debug!(
            device_token,
            command = command.name(),
            destinations = delivered.len(),
            "system command delivered"
        );
        Ok(DeliveryOutcome::Delivered(delivered))
    }

    /// Answers a registration request. The directory is read-only, so a
    /// device it does not know yet is refused rather than created.
    pub async fn acknowledge_registration(
        &self,
        device_token: &str,
        request: &RegistrationRequest,
        originator: Option<&str>,
    ) -> Result<DeliveryOutcome> {
        let device = self.directory.get_device_by_identity(device_token).await?;
        let requested_type = self
            .directory
            .get_device_type(&request.device_type_token)
            .await?;

        let (command, route_by) = match (&device, requested_type) {
            (Some(device), _) if device.device_type_token == request.device_type_token => (
                SystemCommand::RegistrationAck {
                    reason: RegistrationSuccess::AlreadyRegistered,
                },
                device.device_type_token.as_str(),
            ),
            (Some(device), _) => (
                invalid_device_type(&request.device_type_token),
                device.device_type_token.as_str(),
            ),
            (None, None) => (
                invalid_device_type(&request.device_type_token),
                request.device_type_token.as_str(),
            ),
            (None, Some(_)) => (
                SystemCommand::RegistrationFailure {
                    reason: RegistrationFailureReason::NewDevicesNotAllowed,
                    error_message: "new devices are not allowed".to_string(),
                },
                request.device_type_token.as_str(),
            ),
        };
        info!(
            device_token,
            device_type = %request.device_type_token,
            answer = command.name(),
            "handling registration"
        );

        self.deliver_system_command(device_token, route_by, &command, originator)
            .await
    }

    /// Delivers to every target even after a failure. Any failure fails the
    /// whole delivery.
    async fn fan_out(
        &self,
        targets: &[Arc<dyn CommandDestination>],
        device_token: &str,
        payload: Bytes,
    ) -> Result<Vec<RouteTarget>> {
        let mut delivered = Vec::with_capacity(targets.len());
        let mut failures = Vec::new();
        for destination in targets {
            match destination.deliver(device_token, payload.clone()).await {
                Ok(()) => delivered.push(destination.id().clone()),
                Err(e) => {
                    metrics::counter!(
                        COMMAND_DELIVERY_ERRORS,
                        "destination" => destination.id().to_string()
                    )
                    .increment(1);
                    failures.push(format!("{}: {}", destination.id(), e));
                }
            }
        }

        if !failures.is_empty() {
            return Err(anyhow!(
                "failed for {} of {} destinations: {}",
                failures.len(),
                targets.len(),
                failures.join("; ")
            ));
        }
        Ok(delivered)
    }

    fn resolve(
        &self,
        device_type: &str,
    ) -> Result<Vec<Arc<dyn CommandDestination>>, RoutingFailure> {
        let mut resolved = Vec::new();
        let mut unknown = None;
        for target in self.router.resolve_destinations(device_type)? {
            match self.destinations.get(&target) {
                Some(destination) => resolved.push(destination.clone()),
                None => {
                    // a reloaded mapping may name a destination this process lacks
                    warn!(destination = %target, device_type, "destination not registered");
                    metrics::counter!(COMMAND_UNKNOWN_DESTINATIONS).increment(1);
                    unknown = Some(target);
                }
            }
        }

        match (resolved.is_empty(), unknown) {
            (true, Some(target)) => Err(RoutingFailure::UnknownDestination {
                destination: target.0,
            }),
            _ => Ok(resolved),
        }
    }

    fn routing_failed(&self, device_token: &str, failure: RoutingFailure) -> String {
        let reason = failure.to_string();
        warn!(device_token, reason = %reason, "command could not be routed");
        let label = match failure {
            RoutingFailure::NoDestination { .. } => "no_destination",
            RoutingFailure::UnknownDestination { .. } => "unknown_destination",
        };
        metrics::counter!(COMMANDS_UNDELIVERED, "reason" => label).increment(1);
        reason
    }
}

fn invalid_device_type(device_type: &str) -> SystemCommand {
    SystemCommand::RegistrationFailure {
        reason: RegistrationFailureReason::InvalidDeviceTypeToken,
        error_message: format!("device type {device_type} is not valid for this device"),
    }
}
