use thiserror::Error;

/// A device message could not be turned into event requests. Fatal to that
/// message only.
#[derive(Error, Debug)]
pub enum DecodeFailure {
    #[error("malformed message metadata: {0}")]
    MalformedMetadata(String),
    #[error("no device registered for token {token}")]
    UnknownDevice { token: String },
    #[error("device {device} references unknown device type {device_type}")]
    UnknownDeviceType { device: String, device_type: String },
    #[error("unrecognized event type: {0}")]
    UnknownEventType(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("device directory lookup failed: {0}")]
    Directory(#[from] DirectoryError),
}

impl DecodeFailure {
    /// Short label used as a metrics tag.
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeFailure::MalformedMetadata(_) => "malformed_metadata",
            DecodeFailure::UnknownDevice { .. } => "unknown_device",
            DecodeFailure::UnknownDeviceType { .. } => "unknown_device_type",
            DecodeFailure::UnknownEventType(_) => "unknown_event_type",
            DecodeFailure::MalformedPayload(_) => "malformed_payload",
            DecodeFailure::Directory(_) => "directory",
        }
    }
}

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
    #[error("failed to read registry file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse registry file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// No destination could be resolved for a command. Fatal to one command.
#[derive(Error, Debug)]
pub enum RoutingFailure {
    #[error("no destination configured for device type {device_type}")]
    NoDestination { device_type: String },
    #[error("destination {destination} is not registered")]
    UnknownDestination { destination: String },
}

/// A command could not be encoded. Fatal to one encode.
#[derive(Error, Debug, PartialEq)]
pub enum EncodeFailure {
    #[error("parameter {parameter} has unmapped logical type {type_name}")]
    UnmappedType { parameter: String, type_name: String },
    #[error("required parameter {parameter} has no value")]
    MissingParameter { parameter: String },
    #[error("value supplied for undeclared parameter {parameter}")]
    UndeclaredParameter { parameter: String },
    #[error("parameter {parameter} expects {expected}, got {actual}")]
    MistypedValue {
        parameter: String,
        expected: String,
        actual: String,
    },
    #[error("malformed encoded command: {0}")]
    Malformed(String),
}

/// A dependency could not be reached at startup. Prevents the process from
/// accepting traffic.
#[derive(Error, Debug)]
pub enum InfrastructureFailure {
    #[error("kafka error: {0}")]
    Kafka(String),
    #[error("broker unreachable: {0}")]
    BrokerUnreachable(String),
    #[error("directory unreachable: {0}")]
    Directory(#[from] DirectoryError),
}

/// Invalid wiring, detected before any traffic is accepted.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("at least one decoder choice must be configured")]
    NoDecoderChoices,
    #[error("a metadata extractor must be configured")]
    MissingMetadataExtractor,
    #[error("only one metadata extractor may be configured")]
    DuplicateMetadataExtractor,
    #[error("invalid mapping pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("failed to load mapping file: {0}")]
    MappingFile(String),
    #[error("invalid setting {name}: {reason}")]
    InvalidSetting { name: String, reason: String },
}
