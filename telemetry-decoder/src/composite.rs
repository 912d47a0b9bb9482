use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use telemetry_common::directory::DeviceDirectory;
use telemetry_common::error::{ConfigurationError, DecodeFailure};
use telemetry_common::model::{DecodedEventRequest, SourceMetadata};
use tracing::debug;

use crate::choice::DecoderChoice;
use crate::context::DeviceContextResolver;
use crate::extractor::MetadataExtractor;
use crate::metrics_consts::{
    DECODER_DURATION_SECONDS, DECODER_EVENTS_DECODED, DECODER_FAILURES, DECODER_NO_MATCH,
};

/// Context-sensitive decoder: picks a leaf decoder per message based on the
/// resolved device. Immutable once built.
pub struct CompositeDecoder {
    extractor: Box<dyn MetadataExtractor>,
    resolver: DeviceContextResolver,
    choices: Vec<DecoderChoice>,
}

impl CompositeDecoder {
    pub fn builder(directory: Arc<dyn DeviceDirectory>) -> CompositeDecoderBuilder {
        CompositeDecoderBuilder {
            directory,
            extractors: Vec::new(),
            choices: Vec::new(),
        }
    }

    pub fn choices(&self) -> &[DecoderChoice] {
        &self.choices
    }

    /// Decode one raw payload. An empty result means no choice matched the
    /// device, which is not a failure.
    ///
    /// Leaf decoders may leave `device_token` empty on the events they
    /// return; those events are attributed to the device resolved from the
    /// payload's metadata. A token the leaf did set is kept as is.
    pub async fn decode(
        &self,
        payload: &Bytes,
        source_metadata: &SourceMetadata,
    ) -> Result<Vec<DecodedEventRequest>, DecodeFailure> {
        let start = Instant::now();
        let result = self.decode_inner(payload, source_metadata).await;
        metrics::histogram!(DECODER_DURATION_SECONDS).record(start.elapsed().as_secs_f64());

        match &result {
            Ok(events) => {
                for event in events {
                    metrics::counter!(
                        DECODER_EVENTS_DECODED,
                        "event_type" => event.request.event_type().as_str()
                    )
                    .increment(1);
                }
            }
            Err(e) => {
                metrics::counter!(DECODER_FAILURES, "reason" => e.reason()).increment(1);
            }
        }
        result
    }

    async fn decode_inner(
        &self,
        payload: &Bytes,
        source_metadata: &SourceMetadata,
    ) -> Result<Vec<DecodedEventRequest>, DecodeFailure> {
        let metadata = self.extractor.extract_metadata(payload, source_metadata)?;
        let context = self.resolver.build_context(metadata).await?;

        let Some(choice) = self.choices.iter().find(|choice| choice.matches(&context)) else {
            debug!(
                device = context.device().token,
                device_type = context.device_type().token,
                "no decoder choice matched, nothing to decode"
            );
            metrics::counter!(DECODER_NO_MATCH).increment(1);
            return Ok(Vec::new());
        };

        debug!(
            device = context.device().token,
            choice = choice.name(),
            "decoding payload"
        );
        let mut events = choice
            .decoder()
            .decode(context.payload(), source_metadata)?;
        for event in events.iter_mut() {
            // leaf decoders see only the payload, not the resolved device
            if event.device_token.is_empty() {
                event.device_token.clone_from(&context.device().token);
            }
        }
        Ok(events)
    }
}

pub struct CompositeDecoderBuilder {
    directory: Arc<dyn DeviceDirectory>,
    extractors: Vec<Box<dyn MetadataExtractor>>,
    choices: Vec<DecoderChoice>,
}

impl CompositeDecoderBuilder {
    pub fn metadata_extractor<E>(mut self, extractor: E) -> Self
    where
        E: MetadataExtractor + 'static,
    {
        self.extractors.push(Box::new(extractor));
        self
    }

    /// Appends a choice. Declaration order is evaluation order.
    pub fn choice(mut self, choice: DecoderChoice) -> Self {
        self.choices.push(choice);
        self
    }

    pub fn build(mut self) -> Result<CompositeDecoder, ConfigurationError> {
        if self.choices.is_empty() {
            return Err(ConfigurationError::NoDecoderChoices);
        }
        if self.extractors.len() > 1 {
            return Err(ConfigurationError::DuplicateMetadataExtractor);
        }
        let extractor = self
            .extractors
            .pop()
            .ok_or(ConfigurationError::MissingMetadataExtractor)?;

        Ok(CompositeDecoder {
            extractor,
            resolver: DeviceContextResolver::new(self.directory),
            choices: self.choices,
        })
    }
}
