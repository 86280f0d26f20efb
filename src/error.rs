//! Error types and result handling for stream-forwarder.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! Errors fall in two groups. Submission errors ([`Error::Encoding`],
//! [`Error::Backpressure`], [`Error::Closed`]) surface synchronously to the
//! caller of [`Forwarder::submit`](crate::Forwarder::submit). Shipment errors
//! are handled internally by the retry loop and only reach callers as a
//! terminal [`ShipmentOutcome`](crate::record::ShipmentOutcome).
//!
//! # Example
//!
//! ```rust
//! use stream_forwarder::{Error, Result};
//!
//! fn submit_event() -> Result<()> {
//!     Err(Error::Backpressure { records: 10, bytes: 4096 })
//! }
//!
//! match submit_event() {
//!     Ok(()) => println!("Accepted"),
//!     Err(e) if e.is_retryable() => eprintln!("Unavailable, retry later: {}", e),
//!     Err(e) => eprintln!("Rejected: {}", e),
//! }
//! ```

use crate::record::ErrorKind;
use thiserror::Error;

/// The main error type for stream-forwarder operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration values.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration could not be loaded from its sources.
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// Kafka client or producer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The payload cannot be turned into a record. Caller's fault, never retried.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// The buffer is over its high-water mark. The caller should retry later.
    #[error("Backpressure: buffer holds {records} records / {bytes} bytes, retry later")]
    Backpressure {
        /// Records buffered when the submission was rejected
        records: usize,
        /// Bytes buffered when the submission was rejected
        bytes: usize,
    },

    /// The stream endpoint rejected a request or a record.
    #[error("Shipment error ({kind}, retryable={retryable}): {message}")]
    Shipment {
        /// Classified failure
        kind: ErrorKind,
        /// Whether another attempt may succeed
        retryable: bool,
        /// Endpoint-provided detail
        message: String,
    },

    /// A synchronous caller waited past its deadline.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// The forwarder is shutting down and no longer admits records.
    #[error("Forwarder is shutting down")]
    Closed,
}

impl Error {
    /// Builds a shipment error whose retryability follows the error kind.
    pub fn shipment(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error::Shipment {
            kind,
            retryable: kind.is_retryable(),
            message: message.into(),
        }
    }

    /// Whether the caller may succeed by trying the same operation later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Backpressure { .. } | Error::Closed | Error::Timeout { .. } => true,
            Error::Shipment { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Whether the error is caused by the submitted payload itself.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::Encoding(_))
    }

    /// Classifies the error for the shipment retry loop.
    ///
    /// Errors that are not shipment errors are treated as transient transport
    /// failures.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Shipment { kind, .. } => *kind,
            Error::Kafka(e) => crate::stream::kafka::classify(e),
            Error::Timeout { .. } => ErrorKind::Transient,
            Error::Encoding(_) => ErrorKind::Malformed,
            _ => ErrorKind::Transient,
        }
    }
}

/// A convenient Result type alias for stream-forwarder operations.
///
/// This is equivalent to `std::result::Result<T, stream_forwarder::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
