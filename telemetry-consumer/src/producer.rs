use health::HealthHandle;
use rdkafka::producer::{FutureProducer, Producer};
use rdkafka::ClientConfig;
use telemetry_common::error::InfrastructureFailure;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(value: HealthHandle) -> Self {
        KafkaContext { liveness: value }
    }
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, _: rdkafka::Statistics) {
        // librdkafka's main loop is alive if it is calling us
        self.liveness.try_report_healthy();
    }
}

pub fn create_kafka_producer(
    config: &KafkaConfig,
    liveness: HealthHandle,
) -> Result<FutureProducer<KafkaContext>, InfrastructureFailure> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        )
        .set(
            "queue.buffering.max.messages",
            config.kafka_producer_queue_messages.to_string(),
        );

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    debug!("rdkafka producer configuration: {:?}", client_config);
    let producer: FutureProducer<KafkaContext> = client_config
        .create_with_context(liveness.into())
        .map_err(|e| InfrastructureFailure::Kafka(e.to_string()))?;

    match producer
        .client()
        .fetch_metadata(None, std::time::Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                "producer connected to Kafka brokers, found {} topics",
                metadata.topics().len()
            );
        }
        Err(e) => {
            error!("failed to fetch metadata from Kafka brokers: {:?}", e);
            return Err(InfrastructureFailure::BrokerUnreachable(e.to_string()));
        }
    }

    Ok(producer)
}
