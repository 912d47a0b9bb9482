use bytes::Bytes;
use serde_json::Value;
use telemetry_common::error::DecodeFailure;
use telemetry_common::model::{DecodedEventRequest, EventType, SourceMetadata};

use crate::DeviceEventDecoder;

/// Payload is a JSON event request, or an array of them, in the same shape
/// as published on the decoded events topic.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonEventDecoder;

impl DeviceEventDecoder for JsonEventDecoder {
    fn decode(
        &self,
        payload: &Bytes,
        _source_metadata: &SourceMetadata,
    ) -> Result<Vec<DecodedEventRequest>, DecodeFailure> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| DecodeFailure::MalformedPayload(format!("json: {e}")))?;

        match value {
            Value::Array(items) => items.into_iter().map(parse_request).collect(),
            item @ Value::Object(_) => Ok(vec![parse_request(item)?]),
            other => Err(DecodeFailure::MalformedPayload(format!(
                "expected object or array, got {other}"
            ))),
        }
    }
}

fn parse_request(item: Value) -> Result<DecodedEventRequest, DecodeFailure> {
    let tag = item
        .get("request")
        .and_then(|request| request.get("eventType"))
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeFailure::MalformedPayload("missing request.eventType".to_string()))?;
    if EventType::parse(tag).is_none() {
        return Err(DecodeFailure::UnknownEventType(tag.to_string()));
    }

    serde_json::from_value(item).map_err(|e| DecodeFailure::MalformedPayload(format!("json: {e}")))
}
