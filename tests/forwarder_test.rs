mod common;

use common::{eventually, get_test_config, init_tracing, keyed_by_user};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stream_forwarder::stream::PutEntry;
use stream_forwarder::{Error, ErrorKind, Forwarder, MemoryStream, RecordId, ShipmentOutcome};

fn event(user: &str, n: u64) -> Value {
    json!({"user": user, "data": {"user": user, "n": n}})
}

fn sequence_of(data: &[u8]) -> u64 {
    let value: Value = serde_json::from_slice(data).unwrap();
    value["n"].as_u64().unwrap()
}

fn entry_is(n: u64) -> impl Fn(&PutEntry) -> bool + Send + Sync + 'static {
    move |entry| sequence_of(&entry.data) == n
}

#[tokio::test]
async fn test_same_key_records_share_one_batch_in_order() {
    init_tracing();
    let stream = Arc::new(MemoryStream::new(4));
    let forwarder = Forwarder::start(keyed_by_user(get_test_config()), stream.clone()).unwrap();

    for n in 1..=3 {
        forwarder.submit(&event("A", n)).unwrap();
    }

    assert!(eventually(Duration::from_secs(2), || stream.records().len() == 3).await);

    let requests = stream.requests();
    assert_eq!(requests.len(), 1);
    let sent: Vec<u64> = requests[0].iter().map(|e| sequence_of(&e.data)).collect();
    assert_eq!(sent, vec![1, 2, 3]);
    assert!(requests[0].iter().all(|e| e.partition_key == "A"));

    let stored: Vec<u64> = stream
        .records_for_key("A")
        .iter()
        .map(|r| sequence_of(&r.data))
        .collect();
    assert_eq!(stored, vec![1, 2, 3]);

    let stats = forwarder.shutdown().await;
    assert_eq!(stats.records_delivered, 3);
    assert_eq!(stats.batches_shipped, 1);
}

#[tokio::test]
async fn test_backpressure_holds_until_low_water_mark() {
    init_tracing();
    let mut config = keyed_by_user(get_test_config());
    config.buffer.max_records = 10;
    config.buffer.high_water_ratio = 0.8;
    config.buffer.low_water_ratio = 0.3;
    config.batch.max_records = 4;
    config.batch.linger_ms = 60_000;

    let stream = Arc::new(MemoryStream::new(1).with_latency(Duration::from_millis(300)));
    let forwarder = Forwarder::start(config, stream.clone()).unwrap();

    for n in 1..=8 {
        forwarder.submit(&event("A", n)).unwrap();
    }
    let err = forwarder.submit(&event("A", 9)).unwrap_err();
    assert!(matches!(err, Error::Backpressure { .. }));
    assert!(err.is_retryable());

    // One batch of four is in flight; the other four wait behind it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(forwarder.occupancy().records, 4);
    assert!(matches!(
        forwarder.submit(&event("A", 9)),
        Err(Error::Backpressure { .. })
    ));

    assert!(eventually(Duration::from_secs(2), || forwarder.occupancy().records == 0).await);
    forwarder.submit(&event("A", 9)).unwrap();

    let stats = forwarder.shutdown().await;
    assert_eq!(stats.rejected_backpressure, 2);
    assert_eq!(stats.records_delivered, 9);

    let stored: Vec<u64> = stream
        .records_for_key("A")
        .iter()
        .map(|r| sequence_of(&r.data))
        .collect();
    assert_eq!(stored, (1..=9).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_transient_failure_retries_only_failed_record() {
    init_tracing();
    let stream = Arc::new(MemoryStream::new(4));
    stream.fail_entries(entry_is(2), ErrorKind::Throttled, 1);
    let forwarder = Forwarder::start(keyed_by_user(get_test_config()), stream.clone()).unwrap();

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let seen = outcomes.clone();
    forwarder.subscribe(move |id, outcome| seen.lock().push((id, outcome.clone())));

    forwarder.submit(&event("A", 1)).unwrap();
    forwarder.submit(&event("B", 2)).unwrap();
    forwarder.submit(&event("C", 3)).unwrap();

    assert!(eventually(Duration::from_secs(2), || outcomes.lock().len() == 3).await);

    let requests = stream.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].len(), 3);
    assert_eq!(requests[1].len(), 1);
    assert_eq!(sequence_of(&requests[1][0].data), 2);
    assert!(outcomes.lock().iter().all(|(_, o)| o.is_delivered()));

    let stats = forwarder.shutdown().await;
    assert_eq!(stats.records_delivered, 3);
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.requests_sent, 2);
}

#[tokio::test]
async fn test_key_order_survives_retries_across_batches() {
    init_tracing();
    let mut config = keyed_by_user(get_test_config());
    config.batch.max_records = 1;
    config.batch.flush_workers = 4;

    let stream = Arc::new(MemoryStream::new(2));
    stream.fail_entries(entry_is(1), ErrorKind::Transient, 2);
    let forwarder = Forwarder::start(config, stream.clone()).unwrap();

    for n in 1..=6 {
        forwarder.submit(&event("A", n)).unwrap();
        forwarder.submit(&event("B", 100 + n)).unwrap();
    }

    assert!(eventually(Duration::from_secs(3), || stream.records().len() == 12).await);

    let order = |key: &str| -> Vec<u64> {
        stream
            .records_for_key(key)
            .iter()
            .map(|r| sequence_of(&r.data))
            .collect()
    };
    assert_eq!(order("A"), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(order("B"), vec![101, 102, 103, 104, 105, 106]);

    let stats = forwarder.shutdown().await;
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.records_failed, 0);
}

#[tokio::test]
async fn test_every_record_resolves_exactly_once() {
    init_tracing();
    let stream = Arc::new(MemoryStream::new(8));
    stream.fail_entries(|e| sequence_of(&e.data) % 7 == 0, ErrorKind::Throttled, 20);
    stream.fail_entries(entry_is(13), ErrorKind::PayloadTooLarge, 1);
    let forwarder = Forwarder::start(keyed_by_user(get_test_config()), stream.clone()).unwrap();

    let resolutions: Arc<Mutex<HashMap<RecordId, Vec<ShipmentOutcome>>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let seen = resolutions.clone();
    forwarder.subscribe(move |id, outcome| {
        seen.lock().entry(id).or_default().push(outcome.clone());
    });

    let mut ids = HashMap::new();
    for n in 1..=200u64 {
        let user = format!("user-{}", n % 10);
        let id = forwarder.submit(&event(&user, n)).unwrap();
        ids.insert(n, id);
    }

    let stats = forwarder.shutdown().await;
    assert_eq!(stats.submitted, 200);
    assert_eq!(stats.records_delivered + stats.records_failed, 200);
    assert_eq!(stats.unresolved(), 0);

    let resolutions = resolutions.lock();
    assert_eq!(resolutions.len(), 200);
    assert!(resolutions.values().all(|outcomes| outcomes.len() == 1));
    assert_eq!(
        resolutions[&ids[&13]][0],
        ShipmentOutcome::Failed {
            error_kind: ErrorKind::PayloadTooLarge,
            retryable: false,
        }
    );
    assert_eq!(stream.records().len() as u64, stats.records_delivered);
}

#[tokio::test]
async fn test_synchronous_submit_waits_for_outcome() {
    init_tracing();
    let stream = Arc::new(MemoryStream::new(2));
    let forwarder = Forwarder::start(get_test_config(), stream.clone()).unwrap();

    let outcome = forwarder
        .submit_and_wait(&json!({"data": {"page": "/home"}}), Duration::from_secs(2))
        .await
        .unwrap();
    match outcome {
        ShipmentOutcome::Delivered {
            shard_id,
            sequence_number,
        } => {
            assert!(shard_id.starts_with("shard-"));
            assert_eq!(sequence_number, "1");
        }
        other => panic!("expected delivery, got {:?}", other),
    }

    forwarder.shutdown().await;
}

#[tokio::test]
async fn test_wait_timeout_does_not_cancel_shipment() {
    init_tracing();
    let stream = Arc::new(MemoryStream::new(2).with_latency(Duration::from_millis(300)));
    let forwarder = Forwarder::start(get_test_config(), stream.clone()).unwrap();

    let err = forwarder
        .submit_and_wait(&json!({"data": 1}), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));

    assert!(eventually(Duration::from_secs(2), || forwarder.stats().records_delivered == 1).await);
    let stats = forwarder.shutdown().await;
    assert_eq!(stats.abandoned_waits, 1);
    assert_eq!(stream.records().len(), 1);
}

#[tokio::test]
async fn test_tracked_submit_then_wait() {
    init_tracing();
    let stream = Arc::new(MemoryStream::new(1));
    let forwarder = Forwarder::start(get_test_config(), stream.clone()).unwrap();

    let first = forwarder.submit_tracked(&json!({"data": "x"})).unwrap();
    let second = forwarder.submit_tracked(&json!({"data": "y"})).unwrap();
    assert!(second.id() > first.id());

    let outcome = forwarder.wait(second, Duration::from_secs(2)).await.unwrap();
    assert!(outcome.is_delivered());
    let outcome = forwarder.wait(first, Duration::from_secs(2)).await.unwrap();
    assert!(outcome.is_delivered());

    // A handle nobody waits on does not hold the record back.
    drop(forwarder.submit_tracked(&json!({"data": "z"})).unwrap());
    assert!(eventually(Duration::from_secs(2), || stream.records().len() == 3).await);

    let stats = forwarder.shutdown().await;
    assert_eq!(stats.records_delivered, 3);
    assert_eq!(stats.unresolved(), 0);
}

#[tokio::test]
async fn test_encoding_errors_never_reach_the_stream() {
    init_tracing();
    let mut config = get_test_config();
    config.encoder.max_payload_bytes = 64;
    let stream = Arc::new(MemoryStream::new(1));
    let forwarder = Forwarder::start(config, stream.clone()).unwrap();

    let oversized = forwarder
        .submit(&json!({"data": {"blob": "x".repeat(100)}}))
        .unwrap_err();
    assert!(matches!(oversized, Error::Encoding(_)));
    assert!(oversized.is_client_error());

    let stats = forwarder.shutdown().await;
    assert_eq!(stats.rejected_encoding, 1);
    assert_eq!(stats.submitted, 0);
    assert!(stream.requests().is_empty());
}

#[tokio::test]
async fn test_body_without_data_member_ships_null() {
    init_tracing();
    let stream = Arc::new(MemoryStream::new(1));
    let forwarder = Forwarder::start(get_test_config(), stream.clone()).unwrap();

    let outcome = forwarder
        .submit_and_wait(&json!({"payload": {"n": 1}}), Duration::from_secs(2))
        .await
        .unwrap();
    assert!(outcome.is_delivered());

    let stats = forwarder.shutdown().await;
    assert_eq!(stats.rejected_encoding, 0);
    let records = stream.records();
    assert_eq!(records.len(), 1);
    assert_eq!(&records[0].data[..], b"null");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_keep_their_order() {
    init_tracing();
    let mut config = keyed_by_user(get_test_config());
    config.batch.max_records = 16;
    config.batch.flush_workers = 4;
    let stream = Arc::new(MemoryStream::new(4));
    let forwarder = Arc::new(Forwarder::start(config, stream.clone()).unwrap());

    let mut producers = Vec::new();
    for p in 0..4 {
        let forwarder = forwarder.clone();
        producers.push(tokio::spawn(async move {
            let user = format!("producer-{}", p);
            for n in 1..=50u64 {
                forwarder.submit(&event(&user, n)).unwrap();
                if n % 10 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    let stats = forwarder.shutdown().await;
    assert_eq!(stats.records_delivered, 200);

    for p in 0..4 {
        let stored: Vec<u64> = stream
            .records_for_key(&format!("producer-{}", p))
            .iter()
            .map(|r| sequence_of(&r.data))
            .collect();
        assert_eq!(stored, (1..=50).collect::<Vec<_>>(), "producer-{}", p);
    }
}
