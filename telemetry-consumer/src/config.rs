use std::time::Duration;

use envconfig::Envconfig;

use crate::partition_worker::PartitionWorkerConfig;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "1000000")]
    pub kafka_producer_queue_messages: u32,

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    pub kafka_consumer_group: String,

    /// Comma separated
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "500")]
    pub kafka_consumer_max_poll_records: usize,

    #[envconfig(default = "500")]
    pub kafka_consumer_poll_timeout_ms: u64,

    #[envconfig(default = "5000")]
    pub kafka_consumer_commit_interval_ms: u64,

    #[envconfig(default = "30000")]
    pub kafka_consumer_shutdown_timeout_ms: u64,

    /// Partitions allowed to process a batch at the same time
    #[envconfig(default = "8")]
    pub kafka_consumer_worker_count: usize,

    #[envconfig(default = "10")]
    pub kafka_consumer_channel_buffer_size: usize,
}

impl ConsumerConfig {
    /// Consumer settings are stage specific, so binaries seed their own
    /// group and topic before the config is read from the environment.
    pub fn set_defaults(consumer_group: &str, consumer_topic: &str) {
        if std::env::var("KAFKA_CONSUMER_GROUP").is_err() {
            std::env::set_var("KAFKA_CONSUMER_GROUP", consumer_group);
        };
        if std::env::var("KAFKA_CONSUMER_TOPIC").is_err() {
            std::env::set_var("KAFKA_CONSUMER_TOPIC", consumer_topic);
        };
    }

    pub fn topics(&self) -> Vec<String> {
        self.kafka_consumer_topic
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_consumer_poll_timeout_ms)
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.kafka_consumer_commit_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_consumer_shutdown_timeout_ms)
    }

    pub fn worker_config(&self) -> PartitionWorkerConfig {
        PartitionWorkerConfig {
            channel_buffer_size: self.kafka_consumer_channel_buffer_size.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> ConsumerConfig {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ConsumerConfig::init_from_hashmap(&env).unwrap()
    }

    #[test]
    fn topics_are_split_and_trimmed() {
        let config = config(&[
            ("KAFKA_CONSUMER_GROUP", "inbound"),
            ("KAFKA_CONSUMER_TOPIC", "raw-device-events, raw-mqtt-events,"),
        ]);
        assert_eq!(config.topics(), vec!["raw-device-events", "raw-mqtt-events"]);
    }

    #[test]
    fn defaults_apply() {
        let config = config(&[
            ("KAFKA_CONSUMER_GROUP", "inbound"),
            ("KAFKA_CONSUMER_TOPIC", "raw-device-events"),
        ]);
        assert_eq!(config.kafka_consumer_offset_reset, "earliest");
        assert_eq!(config.poll_timeout(), Duration::from_millis(500));
        assert_eq!(config.commit_interval(), Duration::from_secs(5));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));
        assert_eq!(config.worker_config().channel_buffer_size, 10);
    }

    #[test]
    fn group_is_required() {
        let env = HashMap::from([(
            "KAFKA_CONSUMER_TOPIC".to_string(),
            "raw-device-events".to_string(),
        )]);
        assert!(ConsumerConfig::init_from_hashmap(&env).is_err());
    }
}
