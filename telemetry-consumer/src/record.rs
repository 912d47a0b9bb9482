use std::collections::HashMap;

use bytes::Bytes;

use crate::types::Partition;

/// An owned record pulled from the log. Offsets are strictly increasing
/// within a partition.
#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub partition: Partition,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    /// Milliseconds since the epoch, when the broker provides one
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl ConsumerRecord {
    pub fn new(partition: Partition, offset: i64, value: impl Into<Bytes>) -> Self {
        Self {
            partition,
            offset,
            key: None,
            value: value.into(),
            timestamp: None,
            headers: HashMap::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn key_str(&self) -> Option<&str> {
        self.key
            .as_ref()
            .and_then(|key| std::str::from_utf8(key).ok())
    }
}
