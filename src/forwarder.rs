//! The buffered stream forwarder.
//!
//! ```text
//! submit -> encode -> admit -> enqueue ─┐
//!                                       │ RecordBuffer
//!            scheduling task <──────────┘
//!                 │ cut batch
//!                 v
//!         flush workers (N) -> Shipper -> StreamClient
//!                 │
//!                 v
//!            AckTracker -> waiters, subscribers, stats
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use stream_forwarder::stream::MemoryStream;
//! use stream_forwarder::{Config, Forwarder};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> stream_forwarder::Result<()> {
//! let config = Config::for_stream("eu-west-1", "clickstream");
//! let forwarder = Forwarder::start(config, Arc::new(MemoryStream::new(4)))?;
//!
//! let body = serde_json::json!({"data": {"event": "page_view"}});
//! let outcome = forwarder.submit_and_wait(&body, Duration::from_secs(5)).await?;
//! println!("{:?}", outcome);
//!
//! forwarder.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::ack::{AckTracker, PendingAck};
use crate::admission::AdmissionController;
use crate::buffer::{Occupancy, RecordBuffer};
use crate::encoder::EventEncoder;
use crate::record::{Batch, ErrorKind, Record, RecordId, ShipmentOutcome};
use crate::scheduler::{BatchLimits, BatchScheduler};
use crate::shipper::{RetryPolicy, Shipper};
use crate::stats::{ForwarderStats, StatsSnapshot};
use crate::stream::StreamClient;
use crate::{Config, Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct Inner<C> {
    config: Config,
    encoder: EventEncoder,
    buffer: RecordBuffer,
    admission: AdmissionController,
    acks: AckTracker,
    shipper: Shipper<C>,
    stats: Arc<ForwarderStats>,
}

pub struct Forwarder<C: StreamClient> {
    inner: Arc<Inner<C>>,
    /// Stops batching on thresholds and starts the final drain.
    stop: CancellationToken,
    /// Fires when the shutdown grace period is over.
    abort: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: StreamClient> Forwarder<C> {
    /// Builds the forwarder and spawns its scheduling task and flush workers.
    ///
    /// Must be called from within a tokio runtime. `client` is shared by all
    /// workers for the forwarder's lifetime.
    pub fn start(config: Config, client: Arc<C>) -> Result<Self> {
        config.validate()?;

        let stats = Arc::new(ForwarderStats::new());
        let inner = Arc::new(Inner {
            encoder: EventEncoder::new(&config.encoder),
            buffer: RecordBuffer::new(config.buffer.max_records, config.buffer.max_bytes),
            admission: AdmissionController::new(&config.buffer),
            acks: AckTracker::new(stats.clone()),
            shipper: Shipper::new(client, RetryPolicy::from(&config.retry), stats.clone()),
            stats,
            config,
        });

        let stop = CancellationToken::new();
        let abort = CancellationToken::new();
        let workers = inner.config.batch.flush_workers;
        let (batch_tx, batch_rx) = mpsc::channel::<Batch>(workers);
        let batch_rx = Arc::new(tokio::sync::Mutex::new(batch_rx));

        let mut tasks = Vec::with_capacity(workers + 1);
        tasks.push(tokio::spawn(run_scheduler(
            inner.clone(),
            batch_tx,
            stop.clone(),
            abort.clone(),
        )));
        for worker_id in 0..workers {
            tasks.push(tokio::spawn(run_worker(
                inner.clone(),
                batch_rx.clone(),
                abort.clone(),
                worker_id,
            )));
        }

        info!(
            stream = %inner.config.stream.stream_name,
            region = %inner.config.stream.region,
            workers,
            max_batch_records = inner.config.batch.max_records,
            linger_ms = inner.config.batch.linger_ms,
            "Forwarder started"
        );

        Ok(Self {
            inner,
            stop,
            abort,
            tasks: Mutex::new(tasks),
        })
    }

    /// Accepts a payload for asynchronous delivery.
    ///
    /// Returns once the record is buffered; its outcome reaches subscribers
    /// only. Never waits on the network.
    pub fn submit<T: Serialize + ?Sized>(&self, body: &T) -> Result<RecordId> {
        let record = self.prepare(body)?;
        let id = record.id;
        self.buffer(record)?;
        Ok(id)
    }

    /// Accepts a payload and hands back a [`PendingAck`] through which
    /// [`Forwarder::wait`] collects its outcome.
    ///
    /// Dropping the handle without waiting is fine; the outcome still reaches
    /// subscribers and nothing is retained once the record resolves.
    pub fn submit_tracked<T: Serialize + ?Sized>(&self, body: &T) -> Result<PendingAck> {
        let record = self.prepare(body)?;
        let pending = self.inner.acks.register(record.id);
        if let Err(e) = self.buffer(record) {
            self.inner.acks.forget(pending.id());
            return Err(e);
        }
        Ok(pending)
    }

    /// Waits for the outcome of a record from [`Forwarder::submit_tracked`].
    pub async fn wait(&self, pending: PendingAck, timeout: Duration) -> Result<ShipmentOutcome> {
        self.inner.acks.wait(pending, timeout).await
    }

    /// Synchronous submission: accepts and waits for the terminal outcome.
    pub async fn submit_and_wait<T: Serialize + ?Sized>(
        &self,
        body: &T,
        timeout: Duration,
    ) -> Result<ShipmentOutcome> {
        let pending = self.submit_tracked(body)?;
        self.wait(pending, timeout).await
    }

    /// Registers a callback for every terminal outcome, including records
    /// that failed for good.
    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(RecordId, &ShipmentOutcome) + Send + Sync + 'static,
    {
        self.inner.acks.subscribe(observer);
    }

    /// Readiness check. Reads in-memory flags only.
    pub fn is_ready(&self) -> bool {
        !self.stop.is_cancelled() && !self.inner.admission.is_closed()
    }

    pub fn occupancy(&self) -> Occupancy {
        self.inner.buffer.occupancy()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Stops admitting, ships what is buffered and waits up to the grace
    /// period for outstanding records. Records still unresolved afterwards
    /// fail with [`ErrorKind::Shutdown`].
    pub async fn shutdown(&self) -> StatsSnapshot {
        info!(
            buffered = self.inner.buffer.occupancy().records,
            "Shutting down forwarder"
        );
        self.inner.admission.close();
        self.stop.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let grace = self.inner.config.grace_period();
        let abort = self.abort.clone();
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            abort.cancel();
        });

        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Forwarder task failed");
            }
        }
        watchdog.abort();

        let stats = self.stats();
        info!(
            delivered = stats.records_delivered,
            failed = stats.records_failed,
            failed_on_shutdown = stats.failed_on_shutdown,
            "Forwarder stopped"
        );
        stats
    }

    /// Encodes `body` and checks it against admission.
    fn prepare<T: Serialize + ?Sized>(&self, body: &T) -> Result<Record> {
        let inner = &self.inner;
        let record = inner.encoder.encode(body).map_err(|e| {
            inner.stats.rejected_encoding.fetch_add(1, Ordering::Relaxed);
            debug!(error = %e, "Rejected unencodable payload");
            e
        })?;

        if let Err(e) = inner.admission.admit(&record, &inner.buffer) {
            self.count_rejection(&e);
            return Err(e);
        }
        Ok(record)
    }

    fn buffer(&self, record: Record) -> Result<()> {
        if let Err(e) = self.inner.buffer.enqueue(record) {
            self.count_rejection(&e);
            return Err(e);
        }
        self.inner.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn count_rejection(&self, error: &Error) {
        let counter = match error {
            Error::Closed => &self.inner.stats.rejected_closed,
            _ => &self.inner.stats.rejected_backpressure,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl<C: StreamClient> Drop for Forwarder<C> {
    fn drop(&mut self) {
        if !self.tasks.lock().is_empty() {
            warn!("Forwarder dropped without shutdown, abandoning buffered records");
            self.inner.admission.close();
            self.stop.cancel();
            self.abort.cancel();
        }
    }
}

async fn run_scheduler<C: StreamClient>(
    inner: Arc<Inner<C>>,
    batches: mpsc::Sender<Batch>,
    stop: CancellationToken,
    abort: CancellationToken,
) {
    let mut scheduler = BatchScheduler::new(BatchLimits::from(&inner.config.batch));

    loop {
        let now = Instant::now();
        if let Some(trigger) = scheduler.poll(inner.buffer.occupancy(), now) {
            match scheduler.cut(&inner.buffer, trigger, now) {
                Some(batch) => {
                    if !dispatch(&inner, &batches, batch, &abort).await {
                        return;
                    }
                }
                // Every queued key is in flight. Enqueues of those keys do not
                // signal, so this sleeps until a release or a fresh key.
                None => {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = inner.buffer.changed() => {}
                    }
                }
            }
            continue;
        }

        let linger = scheduler.linger_deadline();
        let wake_at = linger.unwrap_or_else(|| now + Duration::from_secs(3600));
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = inner.buffer.changed() => {}
            _ = tokio::time::sleep_until(wake_at.into()), if linger.is_some() => {}
        }
    }

    debug!(
        buffered = inner.buffer.occupancy().records,
        "Draining buffer into final batches"
    );
    while !inner.buffer.is_empty() {
        let now = Instant::now();
        let trigger = scheduler.force(now);
        match scheduler.cut(&inner.buffer, trigger, now) {
            Some(batch) => {
                if !dispatch(&inner, &batches, batch, &abort).await {
                    break;
                }
            }
            None => {
                tokio::select! {
                    _ = abort.cancelled() => break,
                    _ = inner.buffer.changed() => {}
                }
            }
        }
    }

    fail_on_shutdown(&inner, inner.buffer.drain_all());
}

/// Hands a batch to a worker. Returns false if the batch could not be handed
/// over because the grace period ran out.
async fn dispatch<C: StreamClient>(
    inner: &Inner<C>,
    batches: &mpsc::Sender<Batch>,
    batch: Batch,
    abort: &CancellationToken,
) -> bool {
    let permit = tokio::select! {
        permit = batches.reserve() => permit.ok(),
        _ = abort.cancelled() => None,
    };

    match permit {
        Some(permit) => {
            permit.send(batch);
            true
        }
        None => {
            let keys = batch.keys();
            fail_on_shutdown(inner, batch.records);
            inner.buffer.release(&keys);
            false
        }
    }
}

fn fail_on_shutdown<C>(inner: &Inner<C>, records: Vec<Record>) {
    if records.is_empty() {
        return;
    }
    warn!(
        records = records.len(),
        "Records left unshipped at end of grace period"
    );
    for record in records {
        inner
            .acks
            .resolve(record.id, ShipmentOutcome::failed(ErrorKind::Shutdown));
    }
}

async fn run_worker<C: StreamClient>(
    inner: Arc<Inner<C>>,
    batches: Arc<tokio::sync::Mutex<mpsc::Receiver<Batch>>>,
    abort: CancellationToken,
    worker_id: usize,
) {
    loop {
        let batch = {
            let mut rx = batches.lock().await;
            rx.recv().await
        };
        let Some(batch) = batch else {
            break;
        };

        let keys = batch.keys();
        let acks = &inner.acks;
        inner
            .shipper
            .ship(batch, &abort, |id, outcome| acks.resolve(id, outcome.clone()))
            .await;
        inner.buffer.release(&keys);
    }
    debug!(worker_id, "Flush worker stopped");
}
