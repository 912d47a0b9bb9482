use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use command_delivery::destination::{KafkaCommandDestination, KafkaUndeliveredSink};
use command_delivery::routing::load_mapping_file;
use command_delivery::{
    CommandDestination, CommandProcessor, DeviceTypeMappingRouter, RouteTarget,
};
use health::HealthRegistry;
use telemetry_common::directory::StaticDeviceRegistry;
use telemetry_common::metrics::{install_recorder, serve, setup_metrics_routes};
use telemetry_consumer::consumer::ConsumerSettings;
use telemetry_consumer::kafka::KafkaLogConsumer;
use telemetry_consumer::producer::create_kafka_producer;
use telemetry_consumer::{OffsetTracker, PartitionedLogConsumer};
use telemetry_worker::config::{Config, WorkerMode};
use telemetry_worker::events::{CommandEventHandlers, EventRecordHandler};
use telemetry_worker::inbound::{build_decoder, InboundRecordHandler};
use telemetry_worker::reload::MappingReloader;
use telemetry_worker::sink::KafkaEventSink;
use tracing::level_filters::LevelFilter;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("rdkafka=warn".parse().unwrap()),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "telemetry worker"
}

#[tokio::main]
pub async fn main() -> Result<(), anyhow::Error> {
    setup_tracing();
    info!("Starting telemetry worker...");

    let config = Config::init_with_defaults()?;
    info!(
        mode = ?config.worker_mode,
        topics = ?config.consumer.topics(),
        group_id = config.consumer.kafka_consumer_group,
        "Configuration loaded"
    );

    let liveness = HealthRegistry::new("liveness");
    let consumer_liveness = liveness
        .register("consumer".to_string(), Duration::from_secs(60))
        .await;
    let producer_liveness = liveness
        .register("kafka-producer".to_string(), Duration::from_secs(30))
        .await;
    let reload_liveness = if config.worker_mode == WorkerMode::Events {
        let deadline = config.mapping_reload_interval.0 * 3 + Duration::from_secs(10);
        Some(
            liveness
                .register("mapping-reload".to_string(), deadline)
                .await,
        )
    } else {
        None
    };

    // Health and metrics server
    let recorder = install_recorder()?;
    let bind = config.bind();
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router, recorder);
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start health server");
    });

    // Shutdown signal
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
        info!("Shutdown signal received");
        if shutdown_tx.send(true).is_err() {
            info!("consumer already stopped");
        }
    });

    let registry = Arc::new(StaticDeviceRegistry::from_file(
        &config.device_registry_path,
    )?);
    let producer = create_kafka_producer(&config.kafka, producer_liveness)?;
    let offset_tracker = Arc::new(OffsetTracker::new());
    let log = Arc::new(KafkaLogConsumer::new(
        &config.kafka,
        &config.consumer,
        offset_tracker.clone(),
    )?);
    let settings = ConsumerSettings::from(&config.consumer);

    match config.worker_mode {
        WorkerMode::Inbound => {
            let decoder = Arc::new(build_decoder(&config, registry)?);
            let sink = Arc::new(KafkaEventSink::new(
                producer,
                config.decoded_events_topic.clone(),
            ));
            let handler = Arc::new(InboundRecordHandler::new(decoder, sink));

            PartitionedLogConsumer::new(log, handler, offset_tracker, settings)
                .with_liveness(consumer_liveness)
                .run(shutdown_rx)
                .await?;
        }
        WorkerMode::Events => {
            let send_timeout = config.producer_send_timeout.0;
            let mapping = load_mapping_file(&config.command_mapping_path)?;
            let mapping_router = Arc::new(DeviceTypeMappingRouter::new(mapping));

            let destinations = config
                .command_destinations()?
                .into_iter()
                .map(|destination| {
                    let destination: Arc<dyn CommandDestination> =
                        Arc::new(KafkaCommandDestination::new(
                            RouteTarget::new(destination.id),
                            producer.clone(),
                            destination.topic,
                            send_timeout,
                        ));
                    destination
                })
                .collect();
            let undelivered = Arc::new(KafkaUndeliveredSink::new(
                producer.clone(),
                config.undelivered_commands_topic.clone(),
                send_timeout,
            ));
            let processor = CommandProcessor::new(
                registry.clone(),
                registry,
                mapping_router.clone(),
                destinations,
                undelivered,
            )?;

            let reload = MappingReloader::new(mapping_router, &config.command_mapping_path)
                .spawn(
                    config.mapping_reload_interval.0,
                    reload_liveness,
                    shutdown_rx.clone(),
                );

            let handler = Arc::new(EventRecordHandler::new(Arc::new(
                CommandEventHandlers::new(processor),
            )));
            PartitionedLogConsumer::new(log, handler, offset_tracker, settings)
                .with_liveness(consumer_liveness)
                .run(shutdown_rx)
                .await?;
            reload.abort();
        }
    }

    info!("Telemetry worker shut down");
    Ok(())
}
