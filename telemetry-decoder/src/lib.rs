//! Turns raw device payloads into typed event requests.
//!
//! A `CompositeDecoder` extracts the device token from the payload, resolves
//! the device and its type through the directory, then hands the rest of the
//! payload to the first `DecoderChoice` whose predicate accepts the context.

pub mod choice;
pub mod composite;
pub mod context;
pub mod extractor;
pub mod json;
pub mod metrics_consts;
pub mod protobuf;

use bytes::Bytes;
use telemetry_common::error::DecodeFailure;
use telemetry_common::model::{DecodedEventRequest, SourceMetadata};

pub use choice::DecoderChoice;
pub use composite::{CompositeDecoder, CompositeDecoderBuilder};
pub use context::DeviceContextResolver;
pub use extractor::{DelimitedTokenExtractor, MetadataExtractor, SourceMetadataExtractor};
pub use json::JsonEventDecoder;
pub use protobuf::ProtobufEventDecoder;

/// A leaf decoder for one payload format. Pure CPU work, no I/O.
pub trait DeviceEventDecoder: Send + Sync {
    fn decode(
        &self,
        payload: &Bytes,
        source_metadata: &SourceMetadata,
    ) -> Result<Vec<DecodedEventRequest>, DecodeFailure>;
}
