use bytes::{BufMut, Bytes};
use prost::Message;
use telemetry_common::error::EncodeFailure;
use telemetry_common::model::{CommandInvocation, DeviceCommand, ParameterValue};
use tracing::debug;

use crate::schema::DynamicSchema;
use crate::system::{RegistrationAck, SystemCommand};

/// Precedes every encoded command so the device can pick the schema for the
/// body that follows. `originator` names the event the command answers.
#[derive(Clone, PartialEq, Message)]
pub struct CommandHeader {
    #[prost(string, tag = "1")]
    pub command: String,
    #[prost(string, tag = "2")]
    pub invocation_id: String,
    #[prost(string, optional, tag = "3")]
    pub originator: Option<String>,
}

/// A decoded command, for verification on the sending side.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedCommand {
    pub header: CommandHeader,
    pub values: std::collections::BTreeMap<String, ParameterValue>,
}

/// Encodes invocations as a length-delimited [`CommandHeader`] followed by a
/// length-delimited body laid out by [`DynamicSchema`]. The schema is rebuilt
/// on every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct DynamicProtocolEncoder;

impl DynamicProtocolEncoder {
    pub fn new() -> Self {
        Self
    }

    pub fn encode(
        &self,
        command: &DeviceCommand,
        invocation: &CommandInvocation,
        originator: Option<&str>,
    ) -> Result<Bytes, EncodeFailure> {
        let schema = DynamicSchema::build(command)?;

        let mut body = Vec::new();
        schema.encode_body(&invocation.parameter_values, &mut body)?;

        let header = CommandHeader {
            command: schema.command().to_string(),
            invocation_id: invocation.invocation_id.clone(),
            originator: originator.map(str::to_string),
        };
        let buf = frame(&header, &body)?;

        debug!(
            command = schema.command(),
            invocation_id = %invocation.invocation_id,
            bytes = buf.len(),
            "encoded command"
        );
        Ok(buf)
    }

    /// Same framing as [`DynamicProtocolEncoder::encode`]: the header names
    /// the system command and the body is a [`RegistrationAck`].
    pub fn encode_system_command(
        &self,
        command: &SystemCommand,
        originator: Option<&str>,
    ) -> Result<Bytes, EncodeFailure> {
        let header = CommandHeader {
            command: command.name().to_string(),
            invocation_id: String::new(),
            originator: originator.map(str::to_string),
        };
        let body = command.to_message().encode_to_vec();
        frame(&header, &body)
    }

    pub fn decode_system_command(
        &self,
        payload: &[u8],
    ) -> Result<(CommandHeader, RegistrationAck), EncodeFailure> {
        let mut buf = payload;
        let header = CommandHeader::decode_length_delimited(&mut buf)
            .map_err(|e| EncodeFailure::Malformed(e.to_string()))?;
        let body = RegistrationAck::decode_length_delimited(&mut buf)
            .map_err(|e| EncodeFailure::Malformed(e.to_string()))?;
        Ok((header, body))
    }

    pub fn decode(
        &self,
        command: &DeviceCommand,
        payload: &[u8],
    ) -> Result<DecodedCommand, EncodeFailure> {
        let schema = DynamicSchema::build(command)?;
        let mut buf = payload;

        let header = CommandHeader::decode_length_delimited(&mut buf)
            .map_err(|e| EncodeFailure::Malformed(e.to_string()))?;
        let body_len = prost::encoding::decode_varint(&mut buf)
            .map_err(|e| EncodeFailure::Malformed(e.to_string()))? as usize;
        if buf.len() < body_len {
            return Err(EncodeFailure::Malformed(format!(
                "body declares {} bytes, {} available",
                body_len,
                buf.len()
            )));
        }
        let values = schema.decode_body(&buf[..body_len])?;

        Ok(DecodedCommand { header, values })
    }
}

fn frame(header: &CommandHeader, body: &[u8]) -> Result<Bytes, EncodeFailure> {
    let mut buf = Vec::with_capacity(header.encoded_len() + body.len() + 20);
    header
        .encode_length_delimited(&mut buf)
        .map_err(|e| EncodeFailure::Malformed(e.to_string()))?;
    prost::encoding::encode_varint(body.len() as u64, &mut buf);
    buf.put_slice(body);
    Ok(Bytes::from(buf))
}
