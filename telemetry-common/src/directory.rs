use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::error::DirectoryError;
use crate::model::{Device, DeviceCommand, DeviceType};

/// Read-only lookups against device management.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn get_device_by_identity(&self, token: &str) -> Result<Option<Device>, DirectoryError>;

    async fn get_device_type(&self, reference: &str)
        -> Result<Option<DeviceType>, DirectoryError>;
}

/// Command definitions (parameters and their logical types) by token.
#[async_trait]
pub trait CommandCatalog: Send + Sync {
    async fn get_command(&self, token: &str) -> Result<Option<DeviceCommand>, DirectoryError>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistryDocument {
    #[serde(default)]
    device_types: Vec<DeviceType>,
    #[serde(default)]
    devices: Vec<Device>,
    #[serde(default)]
    commands: Vec<DeviceCommand>,
}

/// In-process directory and command catalog, loaded from a JSON document:
///
/// ```json
/// {
///   "deviceTypes": [{"token": "location-asset", "name": "Tracker"}],
///   "devices": [{"token": "dev-123", "deviceTypeToken": "location-asset"}],
///   "commands": [{"token": "ping", "name": "ping", "parameters": []}]
/// }
/// ```
#[derive(Debug, Default, Clone)]
pub struct StaticDeviceRegistry {
    devices: HashMap<String, Device>,
    device_types: HashMap<String, DeviceType>,
    commands: HashMap<String, DeviceCommand>,
}

impl StaticDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(raw: &str) -> Result<Self, DirectoryError> {
        let document: RegistryDocument = serde_json::from_str(raw)?;
        let mut registry = Self::new();
        for device_type in document.device_types {
            registry.add_device_type(device_type);
        }
        for device in document.devices {
            registry.add_device(device);
        }
        for command in document.commands {
            registry.add_command(command);
        }
        Ok(registry)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let registry = Self::from_json(&raw)?;
        info!(
            path = %path.as_ref().display(),
            devices = registry.devices.len(),
            device_types = registry.device_types.len(),
            commands = registry.commands.len(),
            "loaded device registry"
        );
        Ok(registry)
    }

    pub fn add_device(&mut self, device: Device) {
        self.devices.insert(device.token.clone(), device);
    }

    pub fn add_device_type(&mut self, device_type: DeviceType) {
        self.device_types
            .insert(device_type.token.clone(), device_type);
    }

    pub fn add_command(&mut self, command: DeviceCommand) {
        self.commands.insert(command.token.clone(), command);
    }
}

#[async_trait]
impl DeviceDirectory for StaticDeviceRegistry {
    async fn get_device_by_identity(&self, token: &str) -> Result<Option<Device>, DirectoryError> {
        Ok(self.devices.get(token).cloned())
    }

    async fn get_device_type(
        &self,
        reference: &str,
    ) -> Result<Option<DeviceType>, DirectoryError> {
        Ok(self.device_types.get(reference).cloned())
    }
}

#[async_trait]
impl CommandCatalog for StaticDeviceRegistry {
    async fn get_command(&self, token: &str) -> Result<Option<DeviceCommand>, DirectoryError> {
        Ok(self.commands.get(token).cloned())
    }
}
