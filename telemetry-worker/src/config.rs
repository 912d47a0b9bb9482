use std::collections::HashSet;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use telemetry_common::error::ConfigurationError;
use telemetry_consumer::config::{ConsumerConfig, KafkaConfig};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "::")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3320")]
    pub port: u16,

    #[envconfig(default = "inbound")]
    pub worker_mode: WorkerMode,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    #[envconfig(default = "decoded_device_events")]
    pub decoded_events_topic: String,

    #[envconfig(default = "undelivered_device_commands")]
    pub undelivered_commands_topic: String,

    #[envconfig(default = "5000")]
    pub producer_send_timeout: EnvMsDuration,

    #[envconfig(default = "device-registry.json")]
    pub device_registry_path: String,

    /// Source metadata key holding the device token. Unset means the token
    /// is framed at the start of the payload.
    pub device_token_header: Option<String>,

    /// `device-type=format` pairs evaluated in order, `*` matches any type.
    /// Formats: `protobuf`, `json`.
    #[envconfig(default = "*=protobuf")]
    pub decoder_choices: String,

    #[envconfig(default = "command-mapping.json")]
    pub command_mapping_path: String,

    #[envconfig(default = "30000")]
    pub mapping_reload_interval: EnvMsDuration,

    /// `destination=topic` pairs, e.g. `mqtt=device_commands_mqtt`.
    #[envconfig(default = "")]
    pub command_destinations: String,
}

impl Config {
    /// Read the config after seeding the consumer group and topic for the
    /// selected worker mode.
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        let mode = std::env::var("WORKER_MODE")
            .ok()
            .and_then(|mode| mode.parse::<WorkerMode>().ok())
            .unwrap_or(WorkerMode::Inbound);
        ConsumerConfig::set_defaults(mode.consumer_group(), mode.default_topic());
        Self::init_from_env()
    }

    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn decoder_choices(&self) -> Result<Vec<(String, PayloadFormat)>, ConfigurationError> {
        let pairs = parse_pairs("DECODER_CHOICES", &self.decoder_choices)?;
        if pairs.is_empty() {
            return Err(ConfigurationError::NoDecoderChoices);
        }
        pairs
            .into_iter()
            .map(|(device_type, format)| {
                let format = format
                    .parse::<PayloadFormat>()
                    .map_err(|_| ConfigurationError::InvalidSetting {
                        name: "DECODER_CHOICES".to_string(),
                        reason: format!("unknown payload format {format}"),
                    })?;
                Ok((device_type, format))
            })
            .collect()
    }

    pub fn command_destinations(&self) -> Result<Vec<DestinationTopic>, ConfigurationError> {
        let pairs = parse_pairs("COMMAND_DESTINATIONS", &self.command_destinations)?;
        let mut seen = HashSet::new();
        pairs
            .into_iter()
            .map(|(id, topic)| {
                if !seen.insert(id.clone()) {
                    return Err(ConfigurationError::InvalidSetting {
                        name: "COMMAND_DESTINATIONS".to_string(),
                        reason: format!("destination {id} declared twice"),
                    });
                }
                Ok(DestinationTopic { id, topic })
            })
            .collect()
    }
}

fn parse_pairs(name: &str, raw: &str) -> Result<Vec<(String, String)>, ConfigurationError> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| match item.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() && !value.trim().is_empty() => {
                Ok((key.trim().to_string(), value.trim().to_string()))
            }
            _ => Err(ConfigurationError::InvalidSetting {
                name: name.to_string(),
                reason: format!("expected key=value, got {item}"),
            }),
        })
        .collect()
}

/// Which stage of the pipeline this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// Decode raw device payloads and publish event requests
    Inbound,
    /// Route decoded event requests, delivering command invocations
    Events,
}

impl WorkerMode {
    pub fn consumer_group(&self) -> &'static str {
        match self {
            WorkerMode::Inbound => "telemetry-inbound",
            WorkerMode::Events => "telemetry-events",
        }
    }

    pub fn default_topic(&self) -> &'static str {
        match self {
            WorkerMode::Inbound => "raw_device_events",
            WorkerMode::Events => "decoded_device_events",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseWorkerModeError(String);

impl std::fmt::Display for ParseWorkerModeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown worker mode {}, expected inbound or events", self.0)
    }
}

impl FromStr for WorkerMode {
    type Err = ParseWorkerModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inbound" => Ok(WorkerMode::Inbound),
            "events" => Ok(WorkerMode::Events),
            _ => Err(ParseWorkerModeError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Protobuf,
    Json,
}

impl FromStr for PayloadFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "protobuf" | "proto" => Ok(PayloadFormat::Protobuf),
            "json" => Ok(PayloadFormat::Json),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationTopic {
    pub id: String,
    pub topic: String,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let mut env: HashMap<String, String> = HashMap::from([
            ("KAFKA_CONSUMER_GROUP".to_string(), "telemetry-events".to_string()),
            (
                "KAFKA_CONSUMER_TOPIC".to_string(),
                "decoded_device_events".to_string(),
            ),
        ]);
        for (k, v) in vars {
            env.insert(k.to_string(), v.to_string());
        }
        Config::init_from_hashmap(&env).unwrap()
    }

    #[test]
    fn defaults_apply() {
        let config = config(&[]);
        assert_eq!(config.worker_mode, WorkerMode::Inbound);
        assert_eq!(config.bind(), ":::3320");
        assert_eq!(config.mapping_reload_interval.0, time::Duration::from_secs(30));
        assert_eq!(
            config.decoder_choices().unwrap(),
            vec![("*".to_string(), PayloadFormat::Protobuf)]
        );
        assert!(config.command_destinations().unwrap().is_empty());
        assert!(config.device_token_header.is_none());
    }

    #[test]
    fn worker_mode_parses_case_insensitively() {
        let config = config(&[("WORKER_MODE", "Events")]);
        assert_eq!(config.worker_mode, WorkerMode::Events);
        assert!("decode".parse::<WorkerMode>().is_err());
    }

    #[test]
    fn command_destinations_are_parsed_in_order() {
        let config = config(&[(
            "COMMAND_DESTINATIONS",
            "mqtt=device_commands_mqtt, coap = device_commands_coap,",
        )]);
        assert_eq!(
            config.command_destinations().unwrap(),
            vec![
                DestinationTopic {
                    id: "mqtt".to_string(),
                    topic: "device_commands_mqtt".to_string(),
                },
                DestinationTopic {
                    id: "coap".to_string(),
                    topic: "device_commands_coap".to_string(),
                },
            ]
        );
    }

    #[test]
    fn malformed_and_duplicate_destinations_are_rejected() {
        let missing_topic = config(&[("COMMAND_DESTINATIONS", "mqtt=")]);
        assert!(missing_topic.command_destinations().is_err());

        let duplicate = config(&[("COMMAND_DESTINATIONS", "mqtt=a,mqtt=b")]);
        assert!(duplicate.command_destinations().is_err());
    }

    #[test]
    fn decoder_choices_reject_unknown_formats() {
        let unknown = config(&[("DECODER_CHOICES", "location-asset=protobuf,*=xml")]);
        assert!(matches!(
            unknown.decoder_choices(),
            Err(ConfigurationError::InvalidSetting { .. })
        ));

        let empty = config(&[("DECODER_CHOICES", " , ")]);
        assert!(matches!(
            empty.decoder_choices(),
            Err(ConfigurationError::NoDecoderChoices)
        ));
    }
}
