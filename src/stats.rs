use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-lifetime counters shared by every forwarder component.
#[derive(Debug, Default)]
pub struct ForwarderStats {
    pub(crate) submitted: AtomicU64,
    pub(crate) rejected_backpressure: AtomicU64,
    pub(crate) rejected_encoding: AtomicU64,
    pub(crate) rejected_closed: AtomicU64,
    pub(crate) batches_shipped: AtomicU64,
    pub(crate) requests_sent: AtomicU64,
    pub(crate) records_delivered: AtomicU64,
    pub(crate) records_failed: AtomicU64,
    pub(crate) retries: AtomicU64,
    pub(crate) retries_exhausted: AtomicU64,
    pub(crate) failed_on_shutdown: AtomicU64,
    pub(crate) abandoned_waits: AtomicU64,
}

impl ForwarderStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected_backpressure: self.rejected_backpressure.load(Ordering::Relaxed),
            rejected_encoding: self.rejected_encoding.load(Ordering::Relaxed),
            rejected_closed: self.rejected_closed.load(Ordering::Relaxed),
            batches_shipped: self.batches_shipped.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            records_delivered: self.records_delivered.load(Ordering::Relaxed),
            records_failed: self.records_failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            retries_exhausted: self.retries_exhausted.load(Ordering::Relaxed),
            failed_on_shutdown: self.failed_on_shutdown.load(Ordering::Relaxed),
            abandoned_waits: self.abandoned_waits.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ForwarderStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Records admitted into the buffer
    pub submitted: u64,
    pub rejected_backpressure: u64,
    pub rejected_encoding: u64,
    /// Submissions refused because shutdown had begun
    pub rejected_closed: u64,
    pub batches_shipped: u64,
    /// Endpoint requests, retries included
    pub requests_sent: u64,
    pub records_delivered: u64,
    /// Terminal failures of every kind, shutdown included
    pub records_failed: u64,
    pub retries: u64,
    pub retries_exhausted: u64,
    pub failed_on_shutdown: u64,
    /// Synchronous callers that gave up before their record resolved
    pub abandoned_waits: u64,
}

impl StatsSnapshot {
    pub fn success_rate(&self) -> f64 {
        let resolved = self.records_delivered + self.records_failed;
        if resolved == 0 {
            1.0
        } else {
            self.records_delivered as f64 / resolved as f64
        }
    }

    /// Admitted records without a terminal outcome yet.
    pub fn unresolved(&self) -> u64 {
        self.submitted
            .saturating_sub(self.records_delivered + self.records_failed)
    }
}
