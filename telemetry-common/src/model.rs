use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transport-provided key/value pairs travelling with a raw payload
/// (source topic, client id, receive time...).
pub type SourceMetadata = HashMap<String, String>;

/// Raw bytes as received from a device transport.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub payload: Bytes,
    pub source_metadata: SourceMetadata,
}

impl RawMessage {
    pub fn new(payload: impl Into<Bytes>, source_metadata: SourceMetadata) -> Self {
        Self {
            payload: payload.into(),
            source_metadata,
        }
    }
}

/// Output of a metadata extractor: who sent the message, and the part of
/// the payload that is left for the event decoders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    pub device_token: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub token: String,
    pub device_type_token: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceType {
    pub token: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Resolved device, device type and payload for one message.
///
/// Built once per message by the context resolver and read by decoder
/// choice predicates. There are no setters.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    device: Device,
    device_type: DeviceType,
    payload: Bytes,
}

impl DeviceContext {
    pub fn new(device: Device, device_type: DeviceType, payload: Bytes) -> Self {
        Self {
            device,
            device_type,
            payload,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn device_type(&self) -> &DeviceType {
        &self.device_type
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// One typed event extracted from a device payload, ready to be published
/// to the decoded events topic. An empty `device_token` is filled in with
/// the resolved device by the composite decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedEventRequest {
    #[serde(default)]
    pub device_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub originator: Option<String>,
    pub request: EventRequest,
}

impl DecodedEventRequest {
    pub fn new(device_token: impl Into<String>, request: EventRequest) -> Self {
        Self {
            device_token: device_token.into(),
            originator: None,
            request,
        }
    }

    pub fn with_originator(mut self, originator: Option<String>) -> Self {
        self.originator = originator;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Registration,
    Measurement,
    Location,
    Alert,
    StateChange,
    CommandInvocation,
    CommandResponse,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::Registration,
        EventType::Measurement,
        EventType::Location,
        EventType::Alert,
        EventType::StateChange,
        EventType::CommandInvocation,
        EventType::CommandResponse,
    ];

    /// Parse an `eventType` tag as found on the wire.
    pub fn parse(tag: &str) -> Option<EventType> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Registration => "Registration",
            EventType::Measurement => "Measurement",
            EventType::Location => "Location",
            EventType::Alert => "Alert",
            EventType::StateChange => "StateChange",
            EventType::CommandInvocation => "CommandInvocation",
            EventType::CommandResponse => "CommandResponse",
        }
    }
}

/// Event payloads, tagged on the wire by `eventType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType")]
pub enum EventRequest {
    Registration(RegistrationRequest),
    Measurement(MeasurementRequest),
    Location(LocationRequest),
    Alert(AlertRequest),
    StateChange(StateChangeRequest),
    CommandInvocation(CommandInvocation),
    CommandResponse(CommandResponseRequest),
}

impl EventRequest {
    pub fn event_type(&self) -> EventType {
        match self {
            EventRequest::Registration(_) => EventType::Registration,
            EventRequest::Measurement(_) => EventType::Measurement,
            EventRequest::Location(_) => EventType::Location,
            EventRequest::Alert(_) => EventType::Alert,
            EventRequest::StateChange(_) => EventType::StateChange,
            EventRequest::CommandInvocation(_) => EventType::CommandInvocation,
            EventRequest::CommandResponse(_) => EventType::CommandResponse,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub device_type_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_token: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementRequest {
    pub name: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationRequest {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRequest {
    #[serde(rename = "type")]
    pub alert_type: String,
    pub level: AlertLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChangeRequest {
    pub attribute: String,
    pub state_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<String>,
    pub new_state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponseRequest {
    pub originating_event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_date: Option<DateTime<Utc>>,
}

/// A value supplied for one command parameter.
///
/// Untagged on the wire: JSON `true`, `42`, `1.5`, `"abc"` and `[1, 2]` map
/// to the variants in declaration order. Integers above `i64::MAX` land in
/// `UInt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl ParameterValue {
    pub fn kind(&self) -> &'static str {
        match self {
            ParameterValue::Bool(_) => "bool",
            ParameterValue::Int(_) => "int",
            ParameterValue::UInt(_) => "uint",
            ParameterValue::Float(_) => "float",
            ParameterValue::Text(_) => "text",
            ParameterValue::Bytes(_) => "bytes",
        }
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::Text(value.to_owned())
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Int(value)
    }
}

impl From<u64> for ParameterValue {
    fn from(value: u64) -> Self {
        i64::try_from(value)
            .map(ParameterValue::Int)
            .unwrap_or(ParameterValue::UInt(value))
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Float(value)
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Bool(value)
    }
}

/// A request to execute a catalog command on one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandInvocation {
    pub invocation_id: String,
    pub command_token: String,
    pub target_device: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator: Option<String>,
    #[serde(default)]
    pub parameter_values: BTreeMap<String, ParameterValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_date: Option<DateTime<Utc>>,
}

/// A parameter declared by a catalog command. `type_name` is one of the
/// logical type names understood by the command encoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCommand {
    pub token: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub parameters: Vec<CommandParameter>,
}
