use super::{EntryResult, PutEntry, PutFailure, PutSuccess, StreamClient};
use crate::config::StreamConfig;
use crate::record::ErrorKind;
use crate::{Error, Result};
use futures::future::join_all;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::info;

/// Stream client backed by a Kafka topic; partitions play the role of shards.
///
/// librdkafka's own retries are disabled so that every retry decision is made
/// by the shipper, and a single in-flight request per connection keeps
/// entries in the order they were handed over.
pub struct KafkaStreamClient {
    producer: FutureProducer,
    topic: String,
    request_timeout: Duration,
}

impl KafkaStreamClient {
    pub fn new(config: &StreamConfig) -> Result<Self> {
        if config.brokers.is_empty() {
            return Err(Error::Config(
                "stream.brokers must list at least one broker".to_string(),
            ));
        }

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("client.id", config.client_id())
            .set("client.rack", &config.region)
            .set("compression.type", &config.compression)
            .set("acks", &config.acks)
            .set("message.send.max.retries", "0")
            .set("enable.idempotence", "false")
            .set("max.in.flight.requests.per.connection", "1")
            .set("linger.ms", "5")
            .set("message.timeout.ms", config.request_timeout_ms.to_string())
            .create()?;

        info!(
            stream = %config.stream_name,
            region = %config.region,
            brokers = ?config.brokers,
            "Kafka stream client created"
        );

        Ok(Self {
            producer,
            topic: config.stream_name.clone(),
            request_timeout: config.request_timeout(),
        })
    }
}

impl StreamClient for KafkaStreamClient {
    async fn put_records(&self, entries: &[PutEntry]) -> Result<Vec<EntryResult>> {
        let deliveries = entries.iter().map(|entry| {
            let record = FutureRecord::to(&self.topic)
                .key(entry.partition_key.as_str())
                .payload(entry.data.as_ref());
            self.producer
                .send(record, Timeout::After(self.request_timeout))
        });

        let results = join_all(deliveries)
            .await
            .into_iter()
            .map(|delivery| match delivery {
                Ok((partition, offset)) => Ok(PutSuccess {
                    shard_id: format!("partition-{}", partition),
                    sequence_number: offset.to_string(),
                }),
                Err((e, _)) => Err(PutFailure::new(classify(&e), e.to_string())),
            })
            .collect();

        Ok(results)
    }
}

/// Maps a Kafka error onto the shipper's retry classes.
pub fn classify(error: &KafkaError) -> ErrorKind {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::MessageSizeTooLarge)
        | Some(RDKafkaErrorCode::InvalidMessageSize) => ErrorKind::PayloadTooLarge,
        Some(RDKafkaErrorCode::InvalidMessage)
        | Some(RDKafkaErrorCode::InvalidRecord)
        | Some(RDKafkaErrorCode::BadMessage) => ErrorKind::Malformed,
        Some(RDKafkaErrorCode::TopicAuthorizationFailed)
        | Some(RDKafkaErrorCode::ClusterAuthorizationFailed)
        | Some(RDKafkaErrorCode::SaslAuthenticationFailed)
        | Some(RDKafkaErrorCode::Authentication) => ErrorKind::Unauthorized,
        Some(RDKafkaErrorCode::ThrottlingQuotaExceeded) | Some(RDKafkaErrorCode::QueueFull) => {
            ErrorKind::Throttled
        }
        _ => ErrorKind::Transient,
    }
}
