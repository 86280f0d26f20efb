//! Bounded holding area for encoded records awaiting shipment.
//!
//! The buffer is the only shared mutable structure between submitters and
//! flush workers. All access goes through one short-held lock; nothing in here
//! awaits I/O.
//!
//! Per-key ordering across batches is enforced here: once a record of key `K`
//! is drained into a batch, `K` is *held* and later `K` records stay queued
//! until the batch that owns the earlier one resolves and calls
//! [`RecordBuffer::release`].

use crate::record::Record;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use tokio::sync::Notify;

/// Records and bytes currently queued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Occupancy {
    pub records: usize,
    pub bytes: usize,
}

impl Occupancy {
    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Occupancy after adding one record of `bytes`.
    pub fn with_record(&self, bytes: usize) -> Occupancy {
        Occupancy {
            records: self.records + 1,
            bytes: self.bytes + bytes,
        }
    }
}

struct BufferState {
    queue: VecDeque<Record>,
    bytes: usize,
    held_keys: HashSet<String>,
}

pub struct RecordBuffer {
    state: Mutex<BufferState>,
    max_records: usize,
    max_bytes: usize,
    changed: Notify,
}

impl RecordBuffer {
    pub fn new(max_records: usize, max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(BufferState {
                queue: VecDeque::new(),
                bytes: 0,
                held_keys: HashSet::new(),
            }),
            max_records,
            max_bytes,
            changed: Notify::new(),
        }
    }

    pub fn capacity(&self) -> Occupancy {
        Occupancy {
            records: self.max_records,
            bytes: self.max_bytes,
        }
    }

    /// Appends a record, failing immediately if it would exceed capacity.
    ///
    /// Waiters on [`RecordBuffer::changed`] are woken only if the record's key
    /// is not held, since a drain could not take it before the next release.
    pub fn enqueue(&self, record: Record) -> Result<()> {
        let drainable = {
            let mut state = self.state.lock();
            let size = record.size();
            if state.queue.len() + 1 > self.max_records || state.bytes + size > self.max_bytes {
                return Err(Error::Backpressure {
                    records: state.queue.len(),
                    bytes: state.bytes,
                });
            }
            let drainable = !state.held_keys.contains(&record.key);
            state.bytes += size;
            state.queue.push_back(record);
            drainable
        };
        if drainable {
            self.changed.notify_one();
        }
        Ok(())
    }

    /// Removes up to `max_records` / `max_bytes` worth of records in
    /// submission order.
    ///
    /// Records whose key is held by an in-flight batch are skipped, as is any
    /// record queued behind a same-key record left behind by this call. Keys
    /// of the returned records become held. The scan stops once `max_records`
    /// are taken, and the queue is left untouched when nothing is.
    pub fn drain(&self, max_records: usize, max_bytes: usize) -> Vec<Record> {
        let mut state = self.state.lock();
        let BufferState {
            queue,
            bytes,
            held_keys,
        } = &mut *state;

        let mut picked = Vec::new();
        let mut taken_bytes = 0;
        {
            let mut left_behind: HashSet<&str> = HashSet::new();
            for (index, record) in queue.iter().enumerate() {
                if picked.len() == max_records {
                    break;
                }
                let key = record.key.as_str();
                if held_keys.contains(key) || left_behind.contains(key) {
                    continue;
                }
                if taken_bytes + record.size() <= max_bytes {
                    taken_bytes += record.size();
                    picked.push(index);
                } else {
                    left_behind.insert(key);
                }
            }
        }
        if picked.is_empty() {
            return Vec::new();
        }

        // Picked indices are ascending; a contiguous head comes off directly.
        let taken: Vec<Record> = if picked[picked.len() - 1] == picked.len() - 1 {
            queue.drain(..picked.len()).collect()
        } else {
            let mut taken = Vec::with_capacity(picked.len());
            let mut kept = VecDeque::with_capacity(queue.len() - picked.len());
            let mut next = picked.iter().peekable();
            for (index, record) in queue.drain(..).enumerate() {
                if next.peek() == Some(&&index) {
                    next.next();
                    taken.push(record);
                } else {
                    kept.push_back(record);
                }
            }
            *queue = kept;
            taken
        };

        *bytes -= taken_bytes;
        for record in &taken {
            held_keys.insert(record.key.clone());
        }
        taken
    }

    /// Removes every queued record regardless of held keys.
    pub fn drain_all(&self) -> Vec<Record> {
        let mut state = self.state.lock();
        state.bytes = 0;
        state.queue.drain(..).collect()
    }

    /// Lets queued records of `keys` be drained again.
    pub fn release<S: AsRef<str>>(&self, keys: &[S]) {
        {
            let mut state = self.state.lock();
            for key in keys {
                state.held_keys.remove(key.as_ref());
            }
        }
        self.changed.notify_one();
    }

    pub fn occupancy(&self) -> Occupancy {
        let state = self.state.lock();
        Occupancy {
            records: state.queue.len(),
            bytes: state.bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// Resolves after the next release or enqueue of an unheld key (or
    /// immediately if one happened since the last call).
    pub async fn changed(&self) {
        self.changed.notified().await
    }
}
