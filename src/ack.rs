//! Correlates shipment outcomes back to submitters.
//!
//! A tracked submission gets a [`PendingAck`] that owns the receiving end of
//! its slot; the tracker keeps only the sending end until the record resolves.
//! Every terminal outcome, tracked or not, is counted and fanned out to
//! subscribers.

use crate::record::{ErrorKind, RecordId, ShipmentOutcome};
use crate::stats::ForwarderStats;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Callback invoked once per terminal outcome.
pub type Observer = Arc<dyn Fn(RecordId, &ShipmentOutcome) + Send + Sync>;

/// Caller's handle on the outcome of one tracked record.
#[derive(Debug)]
pub struct PendingAck {
    id: RecordId,
    rx: oneshot::Receiver<ShipmentOutcome>,
}

impl PendingAck {
    pub fn id(&self) -> RecordId {
        self.id
    }
}

pub struct AckTracker {
    senders: Mutex<HashMap<RecordId, oneshot::Sender<ShipmentOutcome>>>,
    observers: RwLock<Vec<Observer>>,
    stats: Arc<ForwarderStats>,
}

impl AckTracker {
    pub fn new(stats: Arc<ForwarderStats>) -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            stats,
        }
    }

    /// Opens a resolution slot for `id`. Must happen before the record can
    /// possibly resolve.
    pub fn register(&self, id: RecordId) -> PendingAck {
        let (tx, rx) = oneshot::channel();
        self.senders.lock().insert(id, tx);
        PendingAck { id, rx }
    }

    /// Drops the slot of a record that never made it into the buffer.
    pub fn forget(&self, id: RecordId) {
        self.senders.lock().remove(&id);
    }

    /// Waits for the terminal outcome of a registered record.
    ///
    /// On timeout the slot is removed; the record keeps shipping and is still
    /// counted when it resolves.
    pub async fn wait(&self, pending: PendingAck, timeout: Duration) -> Result<ShipmentOutcome> {
        let PendingAck { id, rx } = pending;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                self.senders.lock().remove(&id);
                self.stats.abandoned_waits.fetch_add(1, Ordering::Relaxed);
                debug!(record_id = %id, ?timeout, "Caller stopped waiting for outcome");
                Err(Error::Timeout {
                    message: format!("record {} unresolved after {:?}", id, timeout),
                })
            }
        }
    }

    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(RecordId, &ShipmentOutcome) + Send + Sync + 'static,
    {
        self.observers.write().push(Arc::new(observer));
    }

    /// Records the terminal outcome of `id`. Called exactly once per record.
    pub fn resolve(&self, id: RecordId, outcome: ShipmentOutcome) {
        match &outcome {
            ShipmentOutcome::Delivered { .. } => {
                self.stats.records_delivered.fetch_add(1, Ordering::Relaxed);
            }
            ShipmentOutcome::Failed { error_kind, .. } => {
                self.stats.records_failed.fetch_add(1, Ordering::Relaxed);
                if *error_kind == ErrorKind::Shutdown {
                    self.stats.failed_on_shutdown.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let observers: Vec<Observer> = self.observers.read().clone();
        for observer in &observers {
            observer(id, &outcome);
        }

        if let Some(tx) = self.senders.lock().remove(&id) {
            // The caller may have gone away; the outcome is already counted.
            let _ = tx.send(outcome);
        }
    }

    /// Slots still awaiting resolution.
    pub fn pending(&self) -> usize {
        self.senders.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn delivered() -> ShipmentOutcome {
        ShipmentOutcome::Delivered {
            shard_id: "shard-0".to_string(),
            sequence_number: "42".to_string(),
        }
    }

    fn tracker() -> (AckTracker, Arc<ForwarderStats>) {
        let stats = Arc::new(ForwarderStats::new());
        (AckTracker::new(stats.clone()), stats)
    }

    #[tokio::test]
    async fn test_wait_receives_outcome() {
        let (tracker, stats) = tracker();
        let tracker = Arc::new(tracker);
        let pending = tracker.register(RecordId(1));

        let resolver = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                tracker.resolve(RecordId(1), delivered());
            })
        };

        let outcome = tracker.wait(pending, Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, delivered());
        resolver.await.unwrap();
        assert_eq!(tracker.pending(), 0);
        assert_eq!(stats.snapshot().records_delivered, 1);
    }

    #[tokio::test]
    async fn test_resolution_before_wait_is_kept() {
        let (tracker, _) = tracker();
        let pending = tracker.register(RecordId(5));
        tracker.resolve(RecordId(5), ShipmentOutcome::failed(ErrorKind::Malformed));
        assert_eq!(tracker.pending(), 0);
        let outcome = tracker.wait(pending, Duration::from_millis(10)).await.unwrap();
        assert_eq!(outcome, ShipmentOutcome::failed(ErrorKind::Malformed));
    }

    #[tokio::test]
    async fn test_timeout_removes_slot_but_late_delivery_counts() {
        let (tracker, stats) = tracker();
        let pending = tracker.register(RecordId(2));

        let err = tracker.wait(pending, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(tracker.pending(), 0);

        tracker.resolve(RecordId(2), delivered());
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.records_delivered, 1);
        assert_eq!(snapshot.abandoned_waits, 1);
    }

    #[test]
    fn test_unawaited_outcomes_are_not_retained() {
        let (tracker, stats) = tracker();
        let handles: Vec<PendingAck> = (0..1000).map(|n| tracker.register(RecordId(n))).collect();
        assert_eq!(tracker.pending(), 1000);

        for n in 0..1000 {
            tracker.resolve(RecordId(n), delivered());
        }
        assert_eq!(tracker.pending(), 0);
        drop(handles);

        // Handles dropped before resolution leave nothing behind either.
        for n in 1000..1010 {
            drop(tracker.register(RecordId(n)));
            tracker.resolve(RecordId(n), delivered());
        }
        assert_eq!(tracker.pending(), 0);
        assert_eq!(stats.snapshot().records_delivered, 1010);
    }

    #[tokio::test]
    async fn test_forget_closes_the_handle() {
        let (tracker, _) = tracker();
        let pending = tracker.register(RecordId(7));
        assert_eq!(pending.id(), RecordId(7));
        tracker.forget(RecordId(7));
        assert_eq!(tracker.pending(), 0);

        let err = tracker.wait(pending, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::Closed));
    }

    #[test]
    fn test_subscribers_see_untracked_outcomes() {
        let (tracker, stats) = tracker();
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            tracker.subscribe(move |_, outcome| {
                if !outcome.is_delivered() {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        tracker.resolve(RecordId(3), ShipmentOutcome::failed(ErrorKind::Shutdown));
        tracker.resolve(RecordId(4), delivered());

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.records_failed, 1);
        assert_eq!(snapshot.failed_on_shutdown, 1);
    }
}
