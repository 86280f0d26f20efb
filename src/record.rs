//! Records, batches and shipment outcomes.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a submitted record, unique for the lifetime of a forwarder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An encoded event waiting to be shipped.
///
/// Owned by the buffer until it is drained into exactly one batch, then by
/// the shipper until it reaches a terminal outcome.
#[derive(Debug, Clone)]
pub struct Record {
    pub id: RecordId,
    pub key: String,
    pub payload: Bytes,
    pub submitted_at: DateTime<Utc>,
    /// Number of shipment attempts made so far.
    pub attempt: u32,
}

impl Record {
    pub fn new(id: RecordId, key: String, payload: Bytes) -> Self {
        Self {
            id,
            key,
            payload,
            submitted_at: Utc::now(),
            attempt: 0,
        }
    }

    /// Bytes counted against buffer and batch limits (key plus payload).
    pub fn size(&self) -> usize {
        self.key.len() + self.payload.len()
    }
}

/// A group of records shipped together in one request.
#[derive(Debug)]
pub struct Batch {
    pub id: u64,
    pub records: Vec<Record>,
    pub cut_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(id: u64, records: Vec<Record>) -> Self {
        Self {
            id,
            records,
            cut_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.records.iter().map(Record::size).sum()
    }

    /// Distinct keys in first-seen order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for record in &self.records {
            if !keys.iter().any(|k| k == &record.key) {
                keys.push(record.key.clone());
            }
        }
        keys
    }
}

/// Classified reason a record was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The endpoint asked us to slow down.
    Throttled,
    /// Network or service error that may clear on its own.
    Transient,
    /// The record exceeds the endpoint's size limit.
    PayloadTooLarge,
    /// The endpoint refused the record's shape.
    Malformed,
    /// Credentials do not allow writing to the stream.
    Unauthorized,
    /// The shutdown grace period expired before the record resolved.
    Shutdown,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Throttled | ErrorKind::Transient)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Throttled => "throttled",
            ErrorKind::Transient => "transient",
            ErrorKind::PayloadTooLarge => "payload_too_large",
            ErrorKind::Malformed => "malformed",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal or per-attempt result for a single record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ShipmentOutcome {
    Delivered {
        shard_id: String,
        sequence_number: String,
    },
    Failed {
        error_kind: ErrorKind,
        retryable: bool,
    },
}

impl ShipmentOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, ShipmentOutcome::Delivered { .. })
    }

    /// A terminal failure; never retryable once reported to the ack tracker.
    pub fn failed(error_kind: ErrorKind) -> Self {
        ShipmentOutcome::Failed {
            error_kind,
            retryable: false,
        }
    }
}
