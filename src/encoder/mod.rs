//! Event encoding: inbound body to keyed, serialized [`Record`].

pub mod key_strategy;

pub use key_strategy::{KeyGenerator, KeyStrategy};

use crate::config::EncoderConfig;
use crate::record::{Record, RecordId};
use crate::{Error, Result};
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// Longest partition key accepted by the stream.
pub const MAX_KEY_BYTES: usize = 256;

pub struct EventEncoder {
    max_payload_bytes: usize,
    data_field: Option<String>,
    key_strategy: KeyStrategy,
    keys: KeyGenerator,
    next_id: AtomicU64,
}

impl EventEncoder {
    pub fn new(config: &EncoderConfig) -> Self {
        Self {
            max_payload_bytes: config.max_payload_bytes,
            data_field: config.data_field.clone().filter(|f| !f.is_empty()),
            key_strategy: config.key.clone(),
            keys: KeyGenerator::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Serializes the event carried by `body` and assigns it a key and id.
    ///
    /// A body without the configured data member forwards `null`. Fails with
    /// [`Error::Encoding`] when the body cannot be represented as JSON or
    /// serializes past the payload limit.
    pub fn encode<T: Serialize + ?Sized>(&self, body: &T) -> Result<Record> {
        let body = serde_json::to_value(body)
            .map_err(|e| Error::Encoding(format!("payload is not serializable: {}", e)))?;

        let event = match &self.data_field {
            Some(field) => body.get(field).unwrap_or(&Value::Null),
            None => &body,
        };

        let payload = serde_json::to_vec(event)
            .map_err(|e| Error::Encoding(format!("event is not serializable: {}", e)))?;
        if payload.len() > self.max_payload_bytes {
            return Err(Error::Encoding(format!(
                "payload of {} bytes exceeds the {} byte limit",
                payload.len(),
                self.max_payload_bytes
            )));
        }

        let key = self
            .key_strategy
            .extract_key(&body)
            .unwrap_or_else(|| self.keys.generate());
        if key.len() > MAX_KEY_BYTES {
            return Err(Error::Encoding(format!(
                "partition key of {} bytes exceeds the {} byte limit",
                key.len(),
                MAX_KEY_BYTES
            )));
        }

        let id = RecordId(self.next_id.fetch_add(1, Ordering::Relaxed));
        Ok(Record::new(id, key, Bytes::from(payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn encoder() -> EventEncoder {
        EventEncoder::new(&EncoderConfig::default())
    }

    #[test]
    fn test_encodes_data_member_only() {
        let record = encoder()
            .encode(&json!({"data": {"event": "page_view", "n": 1}, "noise": true}))
            .unwrap();
        let payload: Value = serde_json::from_slice(&record.payload).unwrap();
        assert_eq!(payload, json!({"event": "page_view", "n": 1}));
        assert!(!record.key.is_empty());
    }

    #[test]
    fn test_whole_body_when_no_data_field() {
        let config = EncoderConfig {
            data_field: None,
            ..EncoderConfig::default()
        };
        let record = EventEncoder::new(&config).encode(&json!({"a": 1})).unwrap();
        assert_eq!(&record.payload[..], br#"{"a":1}"#);

        let config = EncoderConfig {
            data_field: Some(String::new()),
            ..EncoderConfig::default()
        };
        let record = EventEncoder::new(&config).encode(&json!({"a": 2})).unwrap();
        assert_eq!(&record.payload[..], br#"{"a":2}"#);
    }

    #[test]
    fn test_missing_data_member_forwards_null() {
        let record = encoder().encode(&json!({"other": 1})).unwrap();
        assert_eq!(&record.payload[..], b"null");

        let record = encoder().encode(&json!({"data": null})).unwrap();
        assert_eq!(&record.payload[..], b"null");

        // Non-object bodies have no members at all.
        let record = encoder().encode(&json!([1, 2, 3])).unwrap();
        assert_eq!(&record.payload[..], b"null");
    }

    #[test]
    fn test_unserializable_payload_is_encoding_error() {
        let mut data = HashMap::new();
        data.insert((1, 2), "tuple keys cannot become JSON object keys");
        let mut body = HashMap::new();
        body.insert("data", data);

        let err = encoder().encode(&body).unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let config = EncoderConfig {
            max_payload_bytes: 16,
            ..EncoderConfig::default()
        };
        let err = EventEncoder::new(&config)
            .encode(&json!({"data": "a string well past sixteen bytes"}))
            .unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
    }

    #[test]
    fn test_grouping_key_shared_and_ids_increase() {
        let config = EncoderConfig {
            key: KeyStrategy::Field {
                path: "data.session".to_string(),
            },
            ..EncoderConfig::default()
        };
        let encoder = EventEncoder::new(&config);
        let a = encoder.encode(&json!({"data": {"session": "s1", "n": 1}})).unwrap();
        let b = encoder.encode(&json!({"data": {"session": "s1", "n": 2}})).unwrap();
        assert_eq!(a.key, "s1");
        assert_eq!(b.key, "s1");
        assert!(b.id > a.id);
    }

    #[test]
    fn test_same_millisecond_submissions_get_distinct_keys() {
        let encoder = encoder();
        let keys: std::collections::HashSet<String> = (0..1000)
            .map(|i| encoder.encode(&json!({"data": i})).unwrap().key)
            .collect();
        assert_eq!(keys.len(), 1000);
    }
}
