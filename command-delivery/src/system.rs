//! Commands the platform sends to devices on its own behalf, outside the
//! command catalog. Registration answers are the only ones so far.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RegistrationSuccess {
    NewRegistration,
    AlreadyRegistered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RegistrationFailureReason {
    NewDevicesNotAllowed,
    InvalidDeviceTypeToken,
    SiteTokenRequired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum SystemCommand {
    RegistrationAck {
        reason: RegistrationSuccess,
    },
    RegistrationFailure {
        reason: RegistrationFailureReason,
        #[serde(rename = "errorMessage")]
        error_message: String,
    },
}

impl SystemCommand {
    pub fn name(&self) -> &'static str {
        match self {
            SystemCommand::RegistrationAck { .. } => "RegistrationAck",
            SystemCommand::RegistrationFailure { .. } => "RegistrationFailure",
        }
    }

    pub(crate) fn to_message(&self) -> RegistrationAck {
        match self {
            SystemCommand::RegistrationAck { reason } => {
                let state = match reason {
                    RegistrationSuccess::NewRegistration => RegistrationAckState::NewRegistration,
                    RegistrationSuccess::AlreadyRegistered => {
                        RegistrationAckState::AlreadyRegistered
                    }
                };
                RegistrationAck {
                    state: state as i32,
                    error_type: None,
                    error_message: None,
                }
            }
            SystemCommand::RegistrationFailure {
                reason,
                error_message,
            } => {
                let error_type = match reason {
                    RegistrationFailureReason::NewDevicesNotAllowed => {
                        RegistrationAckError::NewDevicesNotAllowed
                    }
                    RegistrationFailureReason::InvalidDeviceTypeToken => {
                        RegistrationAckError::InvalidSpecification
                    }
                    RegistrationFailureReason::SiteTokenRequired => {
                        RegistrationAckError::SiteTokenRequired
                    }
                };
                RegistrationAck {
                    state: RegistrationAckState::RegistrationError as i32,
                    error_type: Some(error_type as i32),
                    error_message: Some(error_message.clone()),
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum RegistrationAckState {
    NewRegistration = 1,
    AlreadyRegistered = 2,
    RegistrationError = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum RegistrationAckError {
    InvalidSpecification = 1,
    SiteTokenRequired = 2,
    NewDevicesNotAllowed = 3,
}

/// Body of a registration answer, after the command header.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RegistrationAck {
    #[prost(enumeration = "RegistrationAckState", tag = "1")]
    pub state: i32,
    #[prost(enumeration = "RegistrationAckError", optional, tag = "2")]
    pub error_type: Option<i32>,
    #[prost(string, optional, tag = "3")]
    pub error_message: Option<String>,
}
