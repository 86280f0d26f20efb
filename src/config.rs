use crate::buffer::Occupancy;
use crate::encoder::{KeyStrategy, MAX_KEY_BYTES};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub stream: StreamConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// Target stream. Fixed at construction; never changed per call.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    pub region: String,
    pub stream_name: String,
    #[serde(default)]
    pub brokers: Vec<String>,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BufferConfig {
    #[serde(default = "default_buffer_max_records")]
    pub max_records: usize,
    #[serde(default = "default_buffer_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_high_water_ratio")]
    pub high_water_ratio: f64,
    #[serde(default = "default_low_water_ratio")]
    pub low_water_ratio: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_max_records")]
    pub max_records: usize,
    #[serde(default = "default_batch_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    #[serde(default = "default_flush_workers")]
    pub flush_workers: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Total attempts per record, the first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_max_total_backoff_ms")]
    pub max_total_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Fraction of each delay that is randomized, 0.0 to 1.0.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EncoderConfig {
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Body member carrying the event. `None` or an empty name forwards the
    /// whole body.
    #[serde(default = "default_data_field")]
    pub data_field: Option<String>,
    #[serde(default)]
    pub key: KeyStrategy,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Default wait for synchronous submissions.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("STREAM_FORWARDER")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// A configuration with defaults everywhere except the target stream.
    pub fn for_stream(region: impl Into<String>, stream_name: impl Into<String>) -> Self {
        Self {
            stream: StreamConfig {
                region: region.into(),
                stream_name: stream_name.into(),
                brokers: Vec::new(),
                compression: default_compression(),
                acks: default_acks(),
                request_timeout_ms: default_request_timeout_ms(),
            },
            buffer: BufferConfig::default(),
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
            encoder: EncoderConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.stream.region.trim().is_empty() {
            return Err(Error::Config("stream.region must not be empty".into()));
        }
        if self.stream.stream_name.trim().is_empty() {
            return Err(Error::Config("stream.stream_name must not be empty".into()));
        }
        if self.buffer.max_records == 0 || self.buffer.max_bytes == 0 {
            return Err(Error::Config("buffer capacity must be non-zero".into()));
        }
        let (low, high) = (self.buffer.low_water_ratio, self.buffer.high_water_ratio);
        if !(0.0..=1.0).contains(&high) || !(0.0..=1.0).contains(&low) || low >= high {
            return Err(Error::Config(format!(
                "water marks must satisfy 0 <= low ({}) < high ({}) <= 1",
                low, high
            )));
        }
        let (high_mark, low_mark) = self.buffer.water_marks();
        if low_mark.records == 0 || low_mark.bytes == 0 {
            return Err(Error::Config(format!(
                "low-water mark rounds down to {} records / {} bytes; admission could never resume",
                low_mark.records, low_mark.bytes
            )));
        }
        if high_mark.records <= low_mark.records || high_mark.bytes <= low_mark.bytes {
            return Err(Error::Config(format!(
                "high-water mark ({} records / {} bytes) must exceed low-water mark ({} records / {} bytes) after rounding",
                high_mark.records, high_mark.bytes, low_mark.records, low_mark.bytes
            )));
        }
        if self.batch.max_records == 0 || self.batch.max_bytes == 0 {
            return Err(Error::Config("batch limits must be non-zero".into()));
        }
        if self.batch.flush_workers == 0 {
            return Err(Error::Config("batch.flush_workers must be at least 1".into()));
        }
        if self.encoder.max_payload_bytes == 0 {
            return Err(Error::Config("encoder.max_payload_bytes must be non-zero".into()));
        }
        if self.encoder.max_payload_bytes + MAX_KEY_BYTES > self.batch.max_bytes {
            return Err(Error::Config(format!(
                "encoder.max_payload_bytes ({}) plus a {}-byte key must fit in batch.max_bytes ({})",
                self.encoder.max_payload_bytes, MAX_KEY_BYTES, self.batch.max_bytes
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(Error::Config("retry.multiplier must be >= 1.0".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(Error::Config("retry.jitter must be within 0.0..=1.0".into()));
        }
        Ok(())
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.batch.linger_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown.grace_period_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown.ack_timeout_ms)
    }
}

impl StreamConfig {
    /// Client id presented to the endpoint.
    pub fn client_id(&self) -> String {
        format!("stream-forwarder-{}-{}", self.region, self.stream_name)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl BufferConfig {
    /// High and low water marks, each ratio applied to capacity and floored.
    pub fn water_marks(&self) -> (Occupancy, Occupancy) {
        (
            self.mark(self.high_water_ratio),
            self.mark(self.low_water_ratio),
        )
    }

    fn mark(&self, ratio: f64) -> Occupancy {
        Occupancy {
            records: ((self.max_records as f64) * ratio).floor() as usize,
            bytes: ((self.max_bytes as f64) * ratio).floor() as usize,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_records: default_buffer_max_records(),
            max_bytes: default_buffer_max_bytes(),
            high_water_ratio: default_high_water_ratio(),
            low_water_ratio: default_low_water_ratio(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_records: default_batch_max_records(),
            max_bytes: default_batch_max_bytes(),
            linger_ms: default_linger_ms(),
            flush_workers: default_flush_workers(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_total_backoff_ms: default_max_total_backoff_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            data_field: default_data_field(),
            key: KeyStrategy::default(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
        }
    }
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_buffer_max_records() -> usize {
    10_000
}

fn default_buffer_max_bytes() -> usize {
    33_554_432 // 32MB
}

fn default_high_water_ratio() -> f64 {
    0.9
}

fn default_low_water_ratio() -> f64 {
    0.6
}

fn default_batch_max_records() -> usize {
    500
}

fn default_batch_max_bytes() -> usize {
    5_242_880 // 5MB
}

fn default_linger_ms() -> u64 {
    100
}

fn default_flush_workers() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_max_total_backoff_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

fn default_max_payload_bytes() -> usize {
    1_048_576 // 1MB
}

fn default_data_field() -> Option<String> {
    Some("data".to_string())
}

fn default_grace_period_ms() -> u64 {
    10_000
}

fn default_ack_timeout_ms() -> u64 {
    5_000
}
