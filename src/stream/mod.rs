//! Egress to the shard-partitioned stream.
//!
//! [`StreamClient`] is the seam between the shipper and the endpoint. A client
//! is built once from [`StreamConfig`](crate::config::StreamConfig) and shared
//! read-only by every flush worker.

pub mod kafka;
pub mod memory;


pub use kafka::KafkaStreamClient;
pub use memory::{MemoryStream, StoredRecord};

use crate::record::{ErrorKind, Record};
use crate::Result;
use bytes::Bytes;
use std::future::Future;

/// One record as sent to the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutEntry {
    pub partition_key: String,
    pub data: Bytes,
}

impl From<&Record> for PutEntry {
    fn from(record: &Record) -> Self {
        Self {
            partition_key: record.key.clone(),
            data: record.payload.clone(),
        }
    }
}

/// Where the endpoint stored an accepted entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutSuccess {
    pub shard_id: String,
    pub sequence_number: String,
}

/// Why the endpoint rejected an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl PutFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

pub type EntryResult = std::result::Result<PutSuccess, PutFailure>;

pub trait StreamClient: Send + Sync + 'static {
    /// Appends `entries` in a single request.
    ///
    /// On `Ok` there is exactly one result per entry, in entry order, and
    /// results may mix successes and failures. `Err` means the request as a
    /// whole failed and no entry was stored.
    fn put_records(
        &self,
        entries: &[PutEntry],
    ) -> impl Future<Output = Result<Vec<EntryResult>>> + Send;
}
