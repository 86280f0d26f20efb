//! In-process stand-in for the stream endpoint.
//!
//! Records are hashed by partition key onto a fixed number of shards and
//! appended with per-shard sequence numbers. Failures and latency can be
//! scripted, which is what the forwarder's tests and `--dry-run` use.

use super::{EntryResult, PutEntry, PutFailure, PutSuccess, StreamClient};
use crate::record::ErrorKind;
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

/// A record the stream has accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub shard: u32,
    pub sequence_number: u64,
    pub partition_key: String,
    pub data: Bytes,
}

type Matcher = Box<dyn Fn(&PutEntry) -> bool + Send + Sync>;

struct EntryFault {
    matches: Matcher,
    kind: ErrorKind,
    remaining: usize,
}

#[derive(Default)]
struct MemoryState {
    shards: Vec<Vec<StoredRecord>>,
    next_sequence: u64,
    requests: Vec<Vec<PutEntry>>,
    entry_faults: Vec<EntryFault>,
    request_faults: VecDeque<ErrorKind>,
}

pub struct MemoryStream {
    shard_count: u32,
    latency: Duration,
    state: Mutex<MemoryState>,
}

impl MemoryStream {
    pub fn new(shard_count: u32) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shard_count,
            latency: Duration::ZERO,
            state: Mutex::new(MemoryState {
                shards: vec![Vec::new(); shard_count as usize],
                ..MemoryState::default()
            }),
        }
    }

    /// Delays every request by `latency` before it takes effect.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Rejects the next `times` attempts of every entry matching `matches`.
    pub fn fail_entries<F>(&self, matches: F, kind: ErrorKind, times: usize)
    where
        F: Fn(&PutEntry) -> bool + Send + Sync + 'static,
    {
        self.state.lock().entry_faults.push(EntryFault {
            matches: Box::new(matches),
            kind,
            remaining: times,
        });
    }

    /// Fails the next `times` requests as a whole.
    pub fn fail_requests(&self, kind: ErrorKind, times: usize) {
        let mut state = self.state.lock();
        for _ in 0..times {
            state.request_faults.push_back(kind);
        }
    }

    pub fn shard_for(&self, partition_key: &str) -> u32 {
        (fnv1a(partition_key.as_bytes()) % u64::from(self.shard_count)) as u32
    }

    /// Every stored record in acceptance order.
    pub fn records(&self) -> Vec<StoredRecord> {
        let state = self.state.lock();
        let mut all: Vec<StoredRecord> = state.shards.iter().flatten().cloned().collect();
        all.sort_by_key(|r| r.sequence_number);
        all
    }

    /// Stored records of one key, in shard order.
    pub fn records_for_key(&self, partition_key: &str) -> Vec<StoredRecord> {
        let shard = self.shard_for(partition_key) as usize;
        self.state.lock().shards[shard]
            .iter()
            .filter(|r| r.partition_key == partition_key)
            .cloned()
            .collect()
    }

    /// Entries of every request received so far, including failed ones.
    pub fn requests(&self) -> Vec<Vec<PutEntry>> {
        self.state.lock().requests.clone()
    }

    fn apply(&self, entries: &[PutEntry]) -> Result<Vec<EntryResult>> {
        let mut state = self.state.lock();
        if let Some(kind) = state.request_faults.pop_front() {
            return Err(Error::shipment(kind, "injected request failure"));
        }

        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let fault = state
                .entry_faults
                .iter_mut()
                .find(|f| f.remaining > 0 && (f.matches)(entry));
            if let Some(fault) = fault {
                fault.remaining -= 1;
                results.push(Err(PutFailure::new(fault.kind, "injected entry failure")));
                continue;
            }

            let shard = self.shard_for(&entry.partition_key);
            state.next_sequence += 1;
            let sequence_number = state.next_sequence;
            state.shards[shard as usize].push(StoredRecord {
                shard,
                sequence_number,
                partition_key: entry.partition_key.clone(),
                data: entry.data.clone(),
            });
            results.push(Ok(PutSuccess {
                shard_id: format!("shard-{:06}", shard),
                sequence_number: sequence_number.to_string(),
            }));
        }
        Ok(results)
    }
}

impl StreamClient for MemoryStream {
    async fn put_records(&self, entries: &[PutEntry]) -> Result<Vec<EntryResult>> {
        self.state.lock().requests.push(entries.to_vec());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.apply(entries)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
