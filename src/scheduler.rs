//! Decides when to cut a batch from the buffer.
//!
//! The scheduler is a synchronous state machine; the forwarder's scheduling
//! task drives it with the current time and buffer occupancy.
//!
//! ```text
//! Idle --first record--> Accumulating --count | bytes | linger--> CuttingBatch
//!   ^                        ^                                        |
//!   +------ buffer empty ----+--------- records remain ---------------+
//! ```

use crate::buffer::{Occupancy, RecordBuffer};
use crate::config::BatchConfig;
use crate::record::Batch;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Accumulating { since: Instant },
    CuttingBatch { since: Instant },
}

/// Why a batch was cut. When several fire together the earliest variant wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CutTrigger {
    Count,
    Bytes,
    Linger,
    /// Cut regardless of thresholds, used while draining on shutdown.
    Flush,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub max_records: usize,
    pub max_bytes: usize,
    pub linger: Duration,
}

impl From<&BatchConfig> for BatchLimits {
    fn from(config: &BatchConfig) -> Self {
        Self {
            max_records: config.max_records,
            max_bytes: config.max_bytes,
            linger: Duration::from_millis(config.linger_ms),
        }
    }
}

pub struct BatchScheduler {
    limits: BatchLimits,
    state: SchedulerState,
    next_batch_id: u64,
}

impl BatchScheduler {
    pub fn new(limits: BatchLimits) -> Self {
        Self {
            limits,
            state: SchedulerState::Idle,
            next_batch_id: 1,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Advances the state machine and reports the trigger that fired, if any.
    pub fn poll(&mut self, occupancy: Occupancy, now: Instant) -> Option<CutTrigger> {
        let since = match self.state {
            SchedulerState::Idle if occupancy.is_empty() => return None,
            SchedulerState::Idle => {
                self.state = SchedulerState::Accumulating { since: now };
                now
            }
            SchedulerState::Accumulating { .. } if occupancy.is_empty() => {
                self.state = SchedulerState::Idle;
                return None;
            }
            SchedulerState::Accumulating { since } => since,
            SchedulerState::CuttingBatch { .. } => return None,
        };

        let trigger = if occupancy.records >= self.limits.max_records {
            CutTrigger::Count
        } else if occupancy.bytes >= self.limits.max_bytes {
            CutTrigger::Bytes
        } else if now >= since + self.limits.linger {
            CutTrigger::Linger
        } else {
            return None;
        };

        self.state = SchedulerState::CuttingBatch { since };
        Some(trigger)
    }

    /// Moves to `CuttingBatch` unconditionally.
    pub fn force(&mut self, now: Instant) -> CutTrigger {
        let since = match self.state {
            SchedulerState::Accumulating { since } | SchedulerState::CuttingBatch { since } => since,
            SchedulerState::Idle => now,
        };
        self.state = SchedulerState::CuttingBatch { since };
        CutTrigger::Flush
    }

    /// Drains what fits into one batch.
    ///
    /// Returns `None` when nothing was drainable (empty buffer or every
    /// queued key held by an in-flight batch); the linger timer keeps running
    /// in that case.
    pub fn cut(&mut self, buffer: &RecordBuffer, trigger: CutTrigger, now: Instant) -> Option<Batch> {
        let since = match self.state {
            SchedulerState::CuttingBatch { since } => since,
            SchedulerState::Accumulating { since } => since,
            SchedulerState::Idle => now,
        };

        let records = buffer.drain(self.limits.max_records, self.limits.max_bytes);
        let remaining = buffer.occupancy();

        if records.is_empty() {
            self.state = if remaining.is_empty() {
                SchedulerState::Idle
            } else {
                SchedulerState::Accumulating { since }
            };
            return None;
        }

        let batch = Batch::new(self.next_batch_id, records);
        self.next_batch_id += 1;
        self.state = if remaining.is_empty() {
            SchedulerState::Idle
        } else {
            SchedulerState::Accumulating { since: now }
        };

        debug!(
            batch_id = batch.id,
            records = batch.len(),
            bytes = batch.size_bytes(),
            trigger = ?trigger,
            remaining = remaining.records,
            "Cut batch"
        );
        Some(batch)
    }

    /// When the linger timer fires, if accumulating.
    pub fn linger_deadline(&self) -> Option<Instant> {
        match self.state {
            SchedulerState::Accumulating { since } => Some(since + self.limits.linger),
            _ => None,
        }
    }
}
