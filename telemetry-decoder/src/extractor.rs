use bytes::{Buf, BufMut, Bytes, BytesMut};
use telemetry_common::error::DecodeFailure;
use telemetry_common::model::{MessageMetadata, SourceMetadata};

/// Finds the device token for a raw payload. Implementations never touch
/// the device directory.
pub trait MetadataExtractor: Send + Sync {
    fn extract_metadata(
        &self,
        payload: &Bytes,
        source_metadata: &SourceMetadata,
    ) -> Result<MessageMetadata, DecodeFailure>;
}

/// Payloads framed as `varint(len) | token | body`. The body is passed on to
/// the event decoders untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct DelimitedTokenExtractor;

impl DelimitedTokenExtractor {
    pub fn frame(device_token: &str, body: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(device_token.len() + body.len() + 4);
        prost::encoding::encode_varint(device_token.len() as u64, &mut buf);
        buf.put_slice(device_token.as_bytes());
        buf.put_slice(body);
        buf.freeze()
    }
}

impl MetadataExtractor for DelimitedTokenExtractor {
    fn extract_metadata(
        &self,
        payload: &Bytes,
        _source_metadata: &SourceMetadata,
    ) -> Result<MessageMetadata, DecodeFailure> {
        let mut buf = payload.clone();
        let len = prost::encoding::decode_varint(&mut buf)
            .map_err(|e| DecodeFailure::MalformedMetadata(format!("token length: {e}")))?;
        let len = usize::try_from(len)
            .map_err(|_| DecodeFailure::MalformedMetadata(format!("token length {len}")))?;

        if len == 0 {
            return Err(DecodeFailure::MalformedMetadata(
                "empty device token".to_string(),
            ));
        }
        if buf.remaining() < len {
            return Err(DecodeFailure::MalformedMetadata(format!(
                "token length {len} exceeds payload ({} bytes left)",
                buf.remaining()
            )));
        }

        let token = buf.split_to(len);
        let device_token = std::str::from_utf8(&token)
            .map_err(|e| DecodeFailure::MalformedMetadata(format!("token is not utf-8: {e}")))?
            .to_owned();

        Ok(MessageMetadata {
            device_token,
            payload: buf,
        })
    }
}

/// Reads the device token from a key the transport put in the source
/// metadata, e.g. the MQTT topic a message arrived on.
#[derive(Debug, Clone)]
pub struct SourceMetadataExtractor {
    key: String,
    last_segment: bool,
}

impl SourceMetadataExtractor {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            last_segment: false,
        }
    }

    /// Use only the part after the last `/`, for topics like `devices/dev-123`.
    pub fn last_path_segment(mut self) -> Self {
        self.last_segment = true;
        self
    }
}

impl MetadataExtractor for SourceMetadataExtractor {
    fn extract_metadata(
        &self,
        payload: &Bytes,
        source_metadata: &SourceMetadata,
    ) -> Result<MessageMetadata, DecodeFailure> {
        let value = source_metadata.get(&self.key).ok_or_else(|| {
            DecodeFailure::MalformedMetadata(format!("missing source metadata key {}", self.key))
        })?;

        let token = match self.last_segment {
            true => value.rsplit('/').next().unwrap_or_default(),
            false => value.as_str(),
        };
        if token.is_empty() {
            return Err(DecodeFailure::MalformedMetadata(format!(
                "empty device token in {}",
                self.key
            )));
        }

        Ok(MessageMetadata {
            device_token: token.to_owned(),
            payload: payload.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delimited_token_splits_payload() {
        let payload = DelimitedTokenExtractor::frame("dev-123", b"\x08\x01rest");
        let metadata = DelimitedTokenExtractor
            .extract_metadata(&payload, &SourceMetadata::new())
            .unwrap();

        assert_eq!(metadata.device_token, "dev-123");
        assert_eq!(&metadata.payload[..], b"\x08\x01rest");
    }

    #[test]
    fn delimited_token_rejects_truncated_payload() {
        let payload = Bytes::from_static(b"\x10dev");
        let err = DelimitedTokenExtractor
            .extract_metadata(&payload, &SourceMetadata::new())
            .unwrap_err();
        assert!(matches!(err, DecodeFailure::MalformedMetadata(_)));
    }

    #[test]
    fn delimited_token_rejects_empty_and_garbage() {
        for raw in [&b""[..], &b"\x00body"[..], &b"\x02\xff\xfe"[..]] {
            let err = DelimitedTokenExtractor
                .extract_metadata(&Bytes::copy_from_slice(raw), &SourceMetadata::new())
                .unwrap_err();
            assert!(matches!(err, DecodeFailure::MalformedMetadata(_)), "{raw:?}");
        }
    }

    #[test]
    fn source_metadata_token() {
        let mut source = SourceMetadata::new();
        source.insert("topic".to_string(), "sitewhere/input/dev-123".to_string());
        let payload = Bytes::from_static(b"{}");

        let full = SourceMetadataExtractor::new("topic")
            .extract_metadata(&payload, &source)
            .unwrap();
        assert_eq!(full.device_token, "sitewhere/input/dev-123");

        let segment = SourceMetadataExtractor::new("topic")
            .last_path_segment()
            .extract_metadata(&payload, &source)
            .unwrap();
        assert_eq!(segment.device_token, "dev-123");
        assert_eq!(segment.payload, payload);
    }

    #[test]
    fn source_metadata_missing_key() {
        let err = SourceMetadataExtractor::new("clientId")
            .extract_metadata(&Bytes::new(), &SourceMetadata::new())
            .unwrap_err();
        assert!(matches!(err, DecodeFailure::MalformedMetadata(_)));
    }
}
