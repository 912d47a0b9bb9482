//! Inbound stage: raw device payloads in, decoded event requests out.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use telemetry_common::directory::DeviceDirectory;
use telemetry_common::error::ConfigurationError;
use telemetry_consumer::{ConsumerRecord, RecordHandler};
use telemetry_decoder::{
    CompositeDecoder, DecoderChoice, DelimitedTokenExtractor, JsonEventDecoder,
    ProtobufEventDecoder, SourceMetadataExtractor,
};
use tracing::{debug, warn};

use crate::config::{Config, PayloadFormat};
use crate::metrics_consts::{INBOUND_DECODE_FAILURES, INBOUND_NOTHING_DECODED};
use crate::sink::DecodedEventSink;

/// Source metadata key carrying the topic a record was read from.
pub const SOURCE_TOPIC: &str = "topic";

pub fn build_decoder(
    config: &Config,
    directory: Arc<dyn DeviceDirectory>,
) -> Result<CompositeDecoder, ConfigurationError> {
    let mut builder = CompositeDecoder::builder(directory);
    builder = match &config.device_token_header {
        Some(key) => {
            builder.metadata_extractor(SourceMetadataExtractor::new(key).last_path_segment())
        }
        None => builder.metadata_extractor(DelimitedTokenExtractor),
    };

    for (device_type, format) in config.decoder_choices()? {
        builder = builder.choice(decoder_choice(&device_type, format)?);
    }
    builder.build()
}

/// `device_type` may use `*` wildcards, matched the same way as destination
/// mappings.
fn decoder_choice(
    device_type: &str,
    format: PayloadFormat,
) -> Result<DecoderChoice, ConfigurationError> {
    match format {
        PayloadFormat::Protobuf => {
            DecoderChoice::for_device_type_pattern(device_type, ProtobufEventDecoder)
        }
        PayloadFormat::Json => DecoderChoice::for_device_type_pattern(device_type, JsonEventDecoder),
    }
}

/// Decodes each record and hands the event requests to the sink. A message
/// that cannot be decoded is logged and skipped; a sink failure fails the
/// record.
pub struct InboundRecordHandler {
    decoder: Arc<CompositeDecoder>,
    sink: Arc<dyn DecodedEventSink>,
}

impl InboundRecordHandler {
    pub fn new(decoder: Arc<CompositeDecoder>, sink: Arc<dyn DecodedEventSink>) -> Self {
        Self { decoder, sink }
    }
}

#[async_trait]
impl RecordHandler for InboundRecordHandler {
    async fn handle(&self, record: &ConsumerRecord) -> Result<()> {
        let mut source_metadata = record.headers.clone();
        source_metadata
            .entry(SOURCE_TOPIC.to_string())
            .or_insert_with(|| record.topic().to_string());

        let events = match self.decoder.decode(&record.value, &source_metadata).await {
            Ok(events) => events,
            Err(e) => {
                metrics::counter!(INBOUND_DECODE_FAILURES, "reason" => e.reason()).increment(1);
                warn!(
                    topic = record.topic(),
                    partition = record.partition.partition_number(),
                    offset = record.offset,
                    "failed to decode device message: {}",
                    e
                );
                return Ok(());
            }
        };

        if events.is_empty() {
            metrics::counter!(INBOUND_NOTHING_DECODED).increment(1);
            debug!(
                topic = record.topic(),
                offset = record.offset,
                "nothing to decode"
            );
            return Ok(());
        }
        self.sink.publish(&events).await
    }
}
