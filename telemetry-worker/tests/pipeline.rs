use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use command_delivery::routing::{MappingConfig, MappingEntry};
use command_delivery::system::RegistrationAckState;
use command_delivery::{
    CommandDestination, CommandProcessor, DeviceTypeMappingRouter, DynamicProtocolEncoder,
    MappingTable, RouteTarget, SystemCommand, UndeliveredCommandSink,
};
use envconfig::Envconfig;
use telemetry_common::directory::StaticDeviceRegistry;
use telemetry_common::model::{
    CommandInvocation, DecodedEventRequest, EventRequest, MeasurementRequest, ParameterValue,
    RegistrationRequest,
};
use telemetry_consumer::consumer::ConsumerSettings;
use telemetry_consumer::memory::MemoryLog;
use telemetry_consumer::{OffsetTracker, PartitionedLogConsumer, RecordHandler};
use telemetry_decoder::protobuf::{encode_message, Command, DeviceLocation, Header};
use telemetry_decoder::DelimitedTokenExtractor;
use telemetry_worker::config::Config;
use telemetry_worker::events::{CommandEventHandlers, EventRecordHandler};
use telemetry_worker::inbound::{build_decoder, InboundRecordHandler};
use telemetry_worker::sink::DecodedEventSink;
use tokio::sync::watch;
use tokio::time::sleep;

const REGISTRY: &str = r#"{
    "deviceTypes": [
        {"token": "location-asset", "name": "GPS tracker"},
        {"token": "json-sensor", "name": "JSON sensor"}
    ],
    "devices": [
        {"token": "dev-123", "deviceTypeToken": "location-asset"},
        {"token": "dev-789", "deviceTypeToken": "json-sensor"}
    ],
    "commands": [{
        "token": "set-interval",
        "name": "setReportingInterval",
        "parameters": [{"name": "seconds", "type": "uint32", "required": true}]
    }]
}"#;

fn registry() -> Arc<StaticDeviceRegistry> {
    Arc::new(StaticDeviceRegistry::from_json(REGISTRY).unwrap())
}

fn settings() -> ConsumerSettings {
    ConsumerSettings {
        poll_timeout: Duration::from_millis(10),
        commit_interval: Duration::from_millis(15),
        shutdown_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

async fn run_to_completion<H: RecordHandler + 'static>(log: Arc<MemoryLog>, handler: Arc<H>) {
    let consumer = PartitionedLogConsumer::new(
        log.clone(),
        handler,
        Arc::new(OffsetTracker::new()),
        settings(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(consumer.run(shutdown_rx));

    while log.pending() > 0 {
        sleep(Duration::from_millis(5)).await;
    }
    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<DecodedEventRequest>>,
}

#[async_trait]
impl DecodedEventSink for RecordingSink {
    async fn publish(&self, events: &[DecodedEventRequest]) -> Result<()> {
        self.events.lock().unwrap().extend_from_slice(events);
        Ok(())
    }
}

#[tokio::test]
async fn inbound_stage_decodes_and_skips_undecodable_messages() {
    let env = HashMap::from([
        ("KAFKA_CONSUMER_GROUP".to_string(), "telemetry-inbound".to_string()),
        ("KAFKA_CONSUMER_TOPIC".to_string(), "raw_device_events".to_string()),
        (
            "DECODER_CHOICES".to_string(),
            "location-asset=protobuf,json-sensor=json".to_string(),
        ),
    ]);
    let config = Config::init_from_hashmap(&env).unwrap();
    let decoder = Arc::new(build_decoder(&config, registry()).unwrap());
    let sink = Arc::new(RecordingSink::default());
    let handler = Arc::new(InboundRecordHandler::new(decoder, sink.clone()));

    let location = encode_message(
        &Header {
            command: Command::SendDeviceLocation as i32,
            originator: None,
        },
        &DeviceLocation {
            hardware_id: "dev-123".to_string(),
            latitude: 33.755,
            longitude: -84.39,
            elevation: None,
            event_date: None,
            metadata: vec![],
        },
    )
    .unwrap();
    let measurement =
        br#"{"request": {"eventType": "Measurement", "name": "humidity", "value": 0.41}}"#;

    let log = Arc::new(MemoryLog::new("raw_device_events"));
    log.append(0, Some("dev-123"), DelimitedTokenExtractor::frame("dev-123", &location));
    log.append(0, Some("dev-404"), DelimitedTokenExtractor::frame("dev-404", b"\x00"));
    log.append(0, Some("dev-789"), DelimitedTokenExtractor::frame("dev-789", measurement));

    run_to_completion(log.clone(), handler).await;

    let events = sink.events.lock().unwrap().clone();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].device_token, "dev-123");
    assert!(matches!(
        &events[0].request,
        EventRequest::Location(location) if location.latitude == 33.755
    ));
    assert_eq!(events[1].device_token, "dev-789");
    assert!(matches!(events[1].request, EventRequest::Measurement(_)));
    // the unknown device was skipped, not retried
    assert_eq!(log.committed(0), Some(3));
}

struct RecordingDestination {
    id: RouteTarget,
    delivered: Mutex<Vec<(String, Bytes)>>,
}

#[async_trait]
impl CommandDestination for RecordingDestination {
    fn id(&self) -> &RouteTarget {
        &self.id
    }

    async fn deliver(&self, device_token: &str, payload: Bytes) -> Result<()> {
        self.delivered
            .lock()
            .unwrap()
            .push((device_token.to_string(), payload));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingUndelivered {
    invocations: Mutex<Vec<String>>,
}

#[async_trait]
impl UndeliveredCommandSink for RecordingUndelivered {
    async fn publish(&self, invocation: &CommandInvocation, _reason: &str) -> Result<()> {
        self.invocations
            .lock()
            .unwrap()
            .push(invocation.invocation_id.clone());
        Ok(())
    }

    async fn publish_system(
        &self,
        device_token: &str,
        command: &SystemCommand,
        _reason: &str,
    ) -> Result<()> {
        self.invocations
            .lock()
            .unwrap()
            .push(format!("{}:{}", command.name(), device_token));
        Ok(())
    }
}

fn invocation_event(invocation_id: &str, target: &str) -> Vec<u8> {
    let event = DecodedEventRequest::new(
        target,
        EventRequest::CommandInvocation(CommandInvocation {
            invocation_id: invocation_id.to_string(),
            command_token: "set-interval".to_string(),
            target_device: target.to_string(),
            initiator: Some("operator".to_string()),
            parameter_values: BTreeMap::from([(
                "seconds".to_string(),
                ParameterValue::Int(60),
            )]),
            event_date: None,
        }),
    );
    serde_json::to_vec(&event).unwrap()
}

#[tokio::test]
async fn events_stage_delivers_commands_and_parks_unroutable_ones() {
    let registration = DecodedEventRequest::new(
        "dev-123",
        EventRequest::Registration(RegistrationRequest {
            device_type_token: "location-asset".to_string(),
            area_token: None,
            customer_token: None,
            metadata: HashMap::new(),
        }),
    )
    .with_originator(Some("reg-7".to_string()));
    let registry = registry();
    let mapping = MappingTable::build(MappingConfig {
        mappings: vec![MappingEntry::new("location-*", &["mqtt"])],
        default_destinations: Vec::new(),
    })
    .unwrap();
    let mqtt = Arc::new(RecordingDestination {
        id: RouteTarget::new("mqtt"),
        delivered: Mutex::new(Vec::new()),
    });
    let mqtt_destination: Arc<dyn CommandDestination> = mqtt.clone();
    let undelivered = Arc::new(RecordingUndelivered::default());
    let processor = CommandProcessor::new(
        registry.clone(),
        registry,
        Arc::new(DeviceTypeMappingRouter::new(mapping)),
        vec![mqtt_destination],
        undelivered.clone(),
    )
    .unwrap();
    let handler = Arc::new(EventRecordHandler::new(Arc::new(
        CommandEventHandlers::new(processor),
    )));

    let measurement = DecodedEventRequest::new(
        "dev-789",
        EventRequest::Measurement(MeasurementRequest {
            name: "humidity".to_string(),
            value: 0.41,
            event_date: None,
            metadata: HashMap::new(),
        }),
    );
    let log = Arc::new(MemoryLog::new("decoded_device_events"));
    log.append(0, Some("dev-789"), serde_json::to_vec(&measurement).unwrap());
    log.append(1, Some("dev-123"), invocation_event("inv-1", "dev-123"));
    log.append(2, Some("dev-789"), invocation_event("inv-2", "dev-789"));
    log.append(3, Some("dev-123"), serde_json::to_vec(&registration).unwrap());

    run_to_completion(log.clone(), handler).await;

    let encoder = DynamicProtocolEncoder::new();
    let delivered = mqtt.delivered.lock().unwrap().clone();
    assert_eq!(delivered.len(), 2);
    assert!(delivered.iter().all(|(device, _)| device == "dev-123"));
    // both payloads share the header framing, partition order is not fixed
    let (acks, commands): (Vec<_>, Vec<_>) = delivered.iter().partition(|(_, payload)| {
        encoder.decode_system_command(payload).unwrap().0.command == "RegistrationAck"
    });

    let decoded = encoder.decode(&registry_command(), &commands[0].1).unwrap();
    assert_eq!(decoded.header.invocation_id, "inv-1");
    assert_eq!(decoded.values["seconds"], ParameterValue::Int(60));

    let (header, ack) = encoder.decode_system_command(&acks[0].1).unwrap();
    assert_eq!(header.originator.as_deref(), Some("reg-7"));
    assert_eq!(ack.state(), RegistrationAckState::AlreadyRegistered);

    assert_eq!(*undelivered.invocations.lock().unwrap(), vec!["inv-2"]);
    for partition in 0..4 {
        assert_eq!(log.committed(partition), Some(1));
    }
}

fn registry_command() -> telemetry_common::model::DeviceCommand {
    serde_json::from_str(
        r#"{
            "token": "set-interval",
            "name": "setReportingInterval",
            "parameters": [{"name": "seconds", "type": "uint32", "required": true}]
        }"#,
    )
    .unwrap()
}
