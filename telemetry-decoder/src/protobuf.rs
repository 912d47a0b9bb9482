//! Binary device protocol.
//!
//! A message is a length-delimited `Header` followed by one length-delimited
//! body whose type is selected by `Header.command`. Every body carries the
//! hardware id of the sending device.

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use prost::Message;
use telemetry_common::error::DecodeFailure;
use telemetry_common::model::{
    AlertLevel, AlertRequest, CommandResponseRequest, DecodedEventRequest, EventRequest,
    LocationRequest, MeasurementRequest, RegistrationRequest, SourceMetadata, StateChangeRequest,
};
use tracing::debug;

use crate::DeviceEventDecoder;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Command {
    SendRegistration = 1,
    SendAcknowledgement = 2,
    SendDeviceMeasurements = 3,
    SendDeviceLocation = 4,
    SendDeviceAlert = 5,
    SendDeviceStateChange = 6,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Header {
    #[prost(enumeration = "Command", tag = "1")]
    pub command: i32,
    #[prost(string, optional, tag = "2")]
    pub originator: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Metadata {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RegisterDevice {
    #[prost(string, tag = "1")]
    pub hardware_id: String,
    #[prost(string, tag = "2")]
    pub device_type_token: String,
    #[prost(string, optional, tag = "3")]
    pub area_token: Option<String>,
    #[prost(message, repeated, tag = "4")]
    pub metadata: Vec<Metadata>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Acknowledge {
    #[prost(string, tag = "1")]
    pub hardware_id: String,
    #[prost(string, optional, tag = "2")]
    pub message: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Measurement {
    #[prost(string, tag = "1")]
    pub measurement_id: String,
    #[prost(double, tag = "2")]
    pub measurement_value: f64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeviceMeasurements {
    #[prost(string, tag = "1")]
    pub hardware_id: String,
    #[prost(message, repeated, tag = "2")]
    pub measurement: Vec<Measurement>,
    #[prost(fixed64, optional, tag = "3")]
    pub event_date: Option<u64>,
    #[prost(message, repeated, tag = "4")]
    pub metadata: Vec<Metadata>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeviceLocation {
    #[prost(string, tag = "1")]
    pub hardware_id: String,
    #[prost(double, tag = "2")]
    pub latitude: f64,
    #[prost(double, tag = "3")]
    pub longitude: f64,
    #[prost(double, optional, tag = "4")]
    pub elevation: Option<f64>,
    #[prost(fixed64, optional, tag = "5")]
    pub event_date: Option<u64>,
    #[prost(message, repeated, tag = "6")]
    pub metadata: Vec<Metadata>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Level {
    Info = 0,
    Warning = 1,
    Error = 2,
    Critical = 3,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeviceAlert {
    #[prost(string, tag = "1")]
    pub hardware_id: String,
    #[prost(string, tag = "2")]
    pub alert_type: String,
    #[prost(string, tag = "3")]
    pub alert_message: String,
    #[prost(enumeration = "Level", tag = "4")]
    pub level: i32,
    #[prost(fixed64, optional, tag = "5")]
    pub event_date: Option<u64>,
    #[prost(message, repeated, tag = "6")]
    pub metadata: Vec<Metadata>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeviceStateChange {
    #[prost(string, tag = "1")]
    pub hardware_id: String,
    #[prost(string, tag = "2")]
    pub attribute: String,
    #[prost(string, tag = "3")]
    pub state_type: String,
    #[prost(string, optional, tag = "4")]
    pub previous_state: Option<String>,
    #[prost(string, tag = "5")]
    pub new_state: String,
    #[prost(fixed64, optional, tag = "6")]
    pub event_date: Option<u64>,
}

/// Decoder for the binary device protocol above.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProtobufEventDecoder;

impl DeviceEventDecoder for ProtobufEventDecoder {
    fn decode(
        &self,
        payload: &Bytes,
        _source_metadata: &SourceMetadata,
    ) -> Result<Vec<DecodedEventRequest>, DecodeFailure> {
        let mut buf = payload.clone();
        let header = Header::decode_length_delimited(&mut buf).map_err(malformed("header"))?;
        let command = Command::try_from(header.command).map_err(|_| {
            DecodeFailure::UnknownEventType(format!("protobuf command {}", header.command))
        })?;
        let originator = header.originator;

        let events = match command {
            Command::SendRegistration => {
                let body =
                    RegisterDevice::decode_length_delimited(&mut buf).map_err(malformed("body"))?;
                debug!(device = body.hardware_id, "decoded registration");
                vec![DecodedEventRequest::new(
                    body.hardware_id,
                    EventRequest::Registration(RegistrationRequest {
                        device_type_token: body.device_type_token,
                        area_token: body.area_token,
                        customer_token: None,
                        metadata: metadata_map(body.metadata),
                    }),
                )]
            }
            Command::SendAcknowledgement => {
                let body =
                    Acknowledge::decode_length_delimited(&mut buf).map_err(malformed("body"))?;
                debug!(device = body.hardware_id, "decoded acknowledgement");
                vec![DecodedEventRequest::new(
                    body.hardware_id,
                    EventRequest::CommandResponse(CommandResponseRequest {
                        originating_event_id: originator.clone().unwrap_or_default(),
                        response_event_id: None,
                        response: body.message,
                        event_date: None,
                    }),
                )]
            }
            Command::SendDeviceMeasurements => {
                let body = DeviceMeasurements::decode_length_delimited(&mut buf)
                    .map_err(malformed("body"))?;
                debug!(
                    device = body.hardware_id,
                    count = body.measurement.len(),
                    "decoded measurements"
                );
                let event_date = event_date(body.event_date);
                let metadata = metadata_map(body.metadata);
                body.measurement
                    .into_iter()
                    .map(|m| {
                        DecodedEventRequest::new(
                            body.hardware_id.clone(),
                            EventRequest::Measurement(MeasurementRequest {
                                name: m.measurement_id,
                                value: m.measurement_value,
                                event_date,
                                metadata: metadata.clone(),
                            }),
                        )
                    })
                    .collect()
            }
            Command::SendDeviceLocation => {
                let body =
                    DeviceLocation::decode_length_delimited(&mut buf).map_err(malformed("body"))?;
                debug!(device = body.hardware_id, "decoded location");
                vec![DecodedEventRequest::new(
                    body.hardware_id,
                    EventRequest::Location(LocationRequest {
                        latitude: body.latitude,
                        longitude: body.longitude,
                        elevation: body.elevation,
                        event_date: event_date(body.event_date),
                        metadata: metadata_map(body.metadata),
                    }),
                )]
            }
            Command::SendDeviceAlert => {
                let body =
                    DeviceAlert::decode_length_delimited(&mut buf).map_err(malformed("body"))?;
                debug!(device = body.hardware_id, "decoded alert");
                let level = match Level::try_from(body.level) {
                    Ok(Level::Warning) => AlertLevel::Warning,
                    Ok(Level::Error) => AlertLevel::Error,
                    Ok(Level::Critical) => AlertLevel::Critical,
                    _ => AlertLevel::Info,
                };
                vec![DecodedEventRequest::new(
                    body.hardware_id,
                    EventRequest::Alert(AlertRequest {
                        alert_type: body.alert_type,
                        level,
                        message: body.alert_message,
                        event_date: event_date(body.event_date),
                        metadata: metadata_map(body.metadata),
                    }),
                )]
            }
            Command::SendDeviceStateChange => {
                let body = DeviceStateChange::decode_length_delimited(&mut buf)
                    .map_err(malformed("body"))?;
                debug!(device = body.hardware_id, "decoded state change");
                vec![DecodedEventRequest::new(
                    body.hardware_id,
                    EventRequest::StateChange(StateChangeRequest {
                        attribute: body.attribute,
                        state_type: body.state_type,
                        previous_state: body.previous_state,
                        new_state: body.new_state,
                        event_date: event_date(body.event_date),
                    }),
                )]
            }
        };

        Ok(events
            .into_iter()
            .map(|event| event.with_originator(originator.clone()))
            .collect())
    }
}

fn malformed(part: &'static str) -> impl Fn(prost::DecodeError) -> DecodeFailure {
    move |e| DecodeFailure::MalformedPayload(format!("protobuf {part}: {e}"))
}

fn metadata_map(entries: Vec<Metadata>) -> HashMap<String, String> {
    entries.into_iter().map(|m| (m.name, m.value)).collect()
}

/// Milliseconds since the epoch.
fn event_date(millis: Option<u64>) -> Option<DateTime<Utc>> {
    millis
        .and_then(|ms| i64::try_from(ms).ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

/// Frame a header and body the way devices send them.
pub fn encode_message<M: Message>(
    header: &Header,
    body: &M,
) -> Result<Bytes, prost::EncodeError> {
    let mut buf = Vec::with_capacity(header.encoded_len() + body.encoded_len() + 8);
    header.encode_length_delimited(&mut buf)?;
    body.encode_length_delimited(&mut buf)?;
    Ok(Bytes::from(buf))
}
