pub mod ack;
pub mod admission;
pub mod buffer;
pub mod config;
pub mod encoder;
pub mod error;
pub mod forwarder;
pub mod record;
pub mod scheduler;
pub mod shipper;
pub mod stats;

pub mod stream;

pub use ack::PendingAck;
pub use config::Config;
pub use encoder::KeyStrategy;
pub use error::{Error, Result};
pub use forwarder::Forwarder;
pub use record::{ErrorKind, RecordId, ShipmentOutcome};
pub use stats::StatsSnapshot;
pub use stream::{KafkaStreamClient, MemoryStream, StreamClient};
