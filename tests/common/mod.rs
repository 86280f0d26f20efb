#![allow(dead_code)]

use std::env;
use std::time::Duration;
use stream_forwarder::config::Config;
use stream_forwarder::KeyStrategy;

/// Forwarder configuration tuned for fast, deterministic tests.
pub fn get_test_config() -> Config {
    let mut config = Config::for_stream("local", format!("test_stream_{}", std::process::id()));
    config.stream.brokers = env::var("TEST_KAFKA_BROKERS")
        .unwrap_or_else(|_| "localhost:9092".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .collect();

    config.buffer.max_records = 1_000;
    config.buffer.max_bytes = 1_048_576;
    config.batch.max_records = 100;
    config.batch.max_bytes = 1_048_576;
    config.encoder.max_payload_bytes = 65_536;
    config.batch.linger_ms = 10;
    config.batch.flush_workers = 2;
    config.retry.initial_backoff_ms = 5;
    config.retry.max_backoff_ms = 40;
    config.retry.max_total_backoff_ms = 2_000;
    config.shutdown.grace_period_ms = 2_000;
    config.shutdown.ack_timeout_ms = 2_000;
    config
}

/// Keys every event by its `user` field.
pub fn keyed_by_user(mut config: Config) -> Config {
    config.encoder.key = KeyStrategy::Field {
        path: "user".to_string(),
    };
    config
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("stream_forwarder=debug")
        .with_test_writer()
        .try_init()
        .ok();
}

/// Polls `condition` until it holds or `timeout` passes.
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
