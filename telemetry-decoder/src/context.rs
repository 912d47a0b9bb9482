use std::sync::Arc;

use telemetry_common::directory::DeviceDirectory;
use telemetry_common::error::DecodeFailure;
use telemetry_common::model::{DeviceContext, MessageMetadata};

/// Resolves a device token to its device and device type. Two read-only
/// directory lookups per message.
#[derive(Clone)]
pub struct DeviceContextResolver {
    directory: Arc<dyn DeviceDirectory>,
}

impl DeviceContextResolver {
    pub fn new(directory: Arc<dyn DeviceDirectory>) -> Self {
        Self { directory }
    }

    pub async fn build_context(
        &self,
        metadata: MessageMetadata,
    ) -> Result<DeviceContext, DecodeFailure> {
        let device = self
            .directory
            .get_device_by_identity(&metadata.device_token)
            .await?
            .ok_or_else(|| DecodeFailure::UnknownDevice {
                token: metadata.device_token.clone(),
            })?;

        let device_type = self
            .directory
            .get_device_type(&device.device_type_token)
            .await?
            .ok_or_else(|| DecodeFailure::UnknownDeviceType {
                device: device.token.clone(),
                device_type: device.device_type_token.clone(),
            })?;

        Ok(DeviceContext::new(device, device_type, metadata.payload))
    }
}
