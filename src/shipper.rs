//! Ships batches to the stream and drives per-record retry.
//!
//! A batch goes out as one request. The endpoint answers per record, so a
//! single response routinely mixes deliveries, permanent rejections and
//! retryable failures; each record is resolved on its own. Retryable records
//! are re-sent together, in their original relative order, after an
//! exponential backoff with jitter.

use crate::config::RetryConfig;
use crate::record::{Batch, ErrorKind, Record, RecordId, ShipmentOutcome};
use crate::stats::ForwarderStats;
use crate::stream::{EntryResult, PutEntry, PutFailure, StreamClient};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_total_backoff: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            max_total_backoff: Duration::from_millis(config.max_total_backoff_ms),
            multiplier: config.multiplier,
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay after `failed_attempts` failures (1-based), capped
    /// at `max_backoff`.
    pub fn base_delay(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(30) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay in `[base * (1 - jitter), base]`, drawn uniformly.
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        let base = self.base_delay(failed_attempts);
        if self.jitter == 0.0 || base.is_zero() {
            return base;
        }
        let spread = base.mul_f64(self.jitter);
        let offset = rand::thread_rng().gen_range(Duration::ZERO..=spread);
        base - spread + offset
    }

    /// Backoff before the next attempt, or `None` when the record has used
    /// up its attempts or its total backoff budget.
    pub fn next_delay(&self, state: &RetryState) -> Option<Duration> {
        if state.record.attempt >= self.max_attempts {
            return None;
        }
        let delay = self.delay(state.record.attempt);
        if state.total_backoff + delay > self.max_total_backoff {
            return None;
        }
        Some(delay)
    }
}

/// A record that failed retryably and is waiting for its next attempt.
#[derive(Debug)]
pub struct RetryState {
    pub record: Record,
    pub next_eligible_at: Instant,
    pub total_backoff: Duration,
}

impl RetryState {
    fn new(record: Record) -> Self {
        Self {
            record,
            next_eligible_at: Instant::now(),
            total_backoff: Duration::ZERO,
        }
    }

    fn schedule(&mut self, delay: Duration) {
        self.total_backoff += delay;
        self.next_eligible_at = Instant::now() + delay;
    }
}

/// Terminal outcome of every record in a batch.
#[derive(Debug)]
pub struct ShipmentReport {
    pub batch_id: u64,
    pub outcomes: BTreeMap<RecordId, ShipmentOutcome>,
    /// Requests made for this batch, retries included.
    pub requests: u32,
}

impl ShipmentReport {
    fn new(batch_id: u64) -> Self {
        Self {
            batch_id,
            outcomes: BTreeMap::new(),
            requests: 0,
        }
    }

    fn resolve<F>(&mut self, id: RecordId, outcome: ShipmentOutcome, on_outcome: &mut F)
    where
        F: FnMut(RecordId, &ShipmentOutcome),
    {
        on_outcome(id, &outcome);
        self.outcomes.insert(id, outcome);
    }

    pub fn delivered(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_delivered()).count()
    }
}

/// Sends batches through a [`StreamClient`] and retries what the endpoint
/// rejects as retryable.
///
/// Per-key order holds across batches, but not inside one: when an earlier
/// record of a key fails retryably and a later same-key record in the same
/// request is delivered, the later one lands first. Configure
/// `batch.max_records = 1` where strict per-key order matters more than
/// throughput.
pub struct Shipper<C> {
    client: Arc<C>,
    policy: RetryPolicy,
    stats: Arc<ForwarderStats>,
}

impl<C: StreamClient> Shipper<C> {
    pub fn new(client: Arc<C>, policy: RetryPolicy, stats: Arc<ForwarderStats>) -> Self {
        Self {
            client,
            policy,
            stats,
        }
    }

    /// Ships `batch` until every record has a terminal outcome.
    ///
    /// `on_outcome` is called as soon as each record resolves, so delivered
    /// records do not wait for their retrying neighbours. When `abort` fires,
    /// everything still unresolved fails with [`ErrorKind::Shutdown`].
    pub async fn ship<F>(
        &self,
        batch: Batch,
        abort: &CancellationToken,
        mut on_outcome: F,
    ) -> ShipmentReport
    where
        F: FnMut(RecordId, &ShipmentOutcome),
    {
        let mut report = ShipmentReport::new(batch.id);
        self.stats.batches_shipped.fetch_add(1, Ordering::Relaxed);

        let mut pending: Vec<RetryState> = batch.records.into_iter().map(RetryState::new).collect();

        while !pending.is_empty() {
            let eligible_at = pending
                .iter()
                .map(|s| s.next_eligible_at)
                .max()
                .unwrap_or_else(Instant::now);

            let entries: Vec<PutEntry> = pending.iter().map(|s| PutEntry::from(&s.record)).collect();
            let response = tokio::select! {
                biased;
                _ = abort.cancelled() => {
                    self.abandon(pending, &mut report, &mut on_outcome);
                    return report;
                }
                response = async {
                    tokio::time::sleep_until(eligible_at).await;
                    self.client.put_records(&entries).await
                } => response,
            };

            report.requests += 1;
            self.stats.requests_sent.fetch_add(1, Ordering::Relaxed);
            for state in pending.iter_mut() {
                state.record.attempt += 1;
            }

            let results: Vec<EntryResult> = match response {
                Ok(results) if results.len() == entries.len() => results,
                Ok(results) => {
                    warn!(
                        batch_id = report.batch_id,
                        expected = entries.len(),
                        received = results.len(),
                        "Endpoint returned a mismatched result count, retrying all records"
                    );
                    let failure = PutFailure::new(ErrorKind::Transient, "mismatched result count");
                    vec![Err(failure); entries.len()]
                }
                Err(e) => {
                    let kind = e.kind();
                    warn!(
                        batch_id = report.batch_id,
                        records = entries.len(),
                        error_kind = %kind,
                        error = %e,
                        "Request failed"
                    );
                    vec![Err(PutFailure::new(kind, e.to_string())); entries.len()]
                }
            };

            let mut retry = Vec::new();
            for (mut state, result) in pending.into_iter().zip(results) {
                let id = state.record.id;
                match result {
                    Ok(success) => {
                        let outcome = ShipmentOutcome::Delivered {
                            shard_id: success.shard_id,
                            sequence_number: success.sequence_number,
                        };
                        report.resolve(id, outcome, &mut on_outcome);
                    }
                    Err(failure) if !failure.kind.is_retryable() => {
                        warn!(
                            record_id = %id,
                            key = %state.record.key,
                            error_kind = %failure.kind,
                            error = %failure.message,
                            "Record rejected permanently"
                        );
                        report.resolve(id, ShipmentOutcome::failed(failure.kind), &mut on_outcome);
                    }
                    Err(failure) => match self.policy.next_delay(&state) {
                        Some(delay) => {
                            debug!(
                                record_id = %id,
                                attempt = state.record.attempt,
                                error_kind = %failure.kind,
                                ?delay,
                                "Retrying record"
                            );
                            self.stats.retries.fetch_add(1, Ordering::Relaxed);
                            state.schedule(delay);
                            retry.push(state);
                        }
                        None => {
                            warn!(
                                record_id = %id,
                                key = %state.record.key,
                                attempts = state.record.attempt,
                                error_kind = %failure.kind,
                                "Retries exhausted"
                            );
                            self.stats.retries_exhausted.fetch_add(1, Ordering::Relaxed);
                            report.resolve(
                                id,
                                ShipmentOutcome::failed(failure.kind),
                                &mut on_outcome,
                            );
                        }
                    },
                }
            }
            pending = retry;
        }

        debug!(
            batch_id = report.batch_id,
            delivered = report.delivered(),
            records = report.outcomes.len(),
            requests = report.requests,
            "Batch resolved"
        );
        report
    }

    fn abandon<F>(&self, pending: Vec<RetryState>, report: &mut ShipmentReport, on_outcome: &mut F)
    where
        F: FnMut(RecordId, &ShipmentOutcome),
    {
        if !pending.is_empty() {
            warn!(
                batch_id = report.batch_id,
                records = pending.len(),
                "Shutdown grace period expired with records unresolved"
            );
        }
        for state in pending {
            report.resolve(
                state.record.id,
                ShipmentOutcome::failed(ErrorKind::Shutdown),
                on_outcome,
            );
        }
    }
}
