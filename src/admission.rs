//! Backpressure at the buffer boundary.
//!
//! Admission flips to rejecting once a submission would push the buffer past
//! its high-water mark and stays there until occupancy falls strictly below
//! the low-water mark.

use crate::buffer::{Occupancy, RecordBuffer};
use crate::config::BufferConfig;
use crate::record::Record;
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

pub struct AdmissionController {
    high: Occupancy,
    low: Occupancy,
    rejecting: AtomicBool,
    closed: AtomicBool,
}

impl AdmissionController {
    pub fn new(config: &BufferConfig) -> Self {
        let (high, low) = config.water_marks();
        Self::with_marks(high, low)
    }

    pub fn with_marks(high: Occupancy, low: Occupancy) -> Self {
        Self {
            high,
            low,
            rejecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Decides whether `record` may be enqueued into `buffer` right now.
    pub fn admit(&self, record: &Record, buffer: &RecordBuffer) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let occupancy = buffer.occupancy();

        if self.rejecting.load(Ordering::Acquire) {
            if occupancy.records < self.low.records && occupancy.bytes < self.low.bytes {
                if self.rejecting.swap(false, Ordering::AcqRel) {
                    info!(
                        records = occupancy.records,
                        bytes = occupancy.bytes,
                        "Buffer below low-water mark, admitting again"
                    );
                }
            } else {
                return Err(backpressure(occupancy));
            }
        }

        let after = occupancy.with_record(record.size());
        if after.records > self.high.records || after.bytes > self.high.bytes {
            if !self.rejecting.swap(true, Ordering::AcqRel) {
                warn!(
                    records = occupancy.records,
                    bytes = occupancy.bytes,
                    high_records = self.high.records,
                    high_bytes = self.high.bytes,
                    "Buffer at high-water mark, rejecting submissions"
                );
            }
            return Err(backpressure(occupancy));
        }

        Ok(())
    }

    pub fn is_rejecting(&self) -> bool {
        self.rejecting.load(Ordering::Acquire)
    }

    /// Stops admitting for good.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn backpressure(occupancy: Occupancy) -> Error {
    Error::Backpressure {
        records: occupancy.records,
        bytes: occupancy.bytes,
    }
}
