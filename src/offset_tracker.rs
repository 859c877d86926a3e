//! Offset tracker - the highest consumed-but-uncommitted offset per partition.
//!
//! The processing worker registers offsets here as records are consumed; the
//! consumer loop (and the revocation callback) drain the whole map in one
//! atomic step and hand the result to a synchronous commit. Storing the *next*
//! offset to read (consumed + 1) means drained values can be committed as-is.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::metrics_consts::PENDING_OFFSET_PARTITIONS_GAUGE;
use crate::types::Partition;

/// Thread-safe record of offsets that are consumed but not yet committed.
///
/// `drain_all` swaps the entire map out under the lock, so no concurrent
/// `record` call can land between "read the offsets" and "clear them" - an
/// update either makes it into the drained snapshot or stays for the next
/// drain, never vanishes.
pub struct OffsetTracker {
    pending: Mutex<HashMap<Partition, i64>>,
}

impl Default for OffsetTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register the next offset to read for a partition.
    ///
    /// Callers supply strictly increasing offsets per partition (records are
    /// consumed in order), so this degenerates to an overwrite; the max guard
    /// keeps a late caller from ever moving a commit position backwards.
    pub fn record(&self, partition: &Partition, next_offset: i64) {
        let mut pending = self.pending.lock().unwrap();
        let entry = pending.entry(partition.clone()).or_insert(next_offset);
        if next_offset < *entry {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                tracked = *entry,
                stale = next_offset,
                "Ignoring stale offset registration"
            );
        } else {
            *entry = next_offset;
        }
        metrics::gauge!(PENDING_OFFSET_PARTITIONS_GAUGE).set(pending.len() as f64);
    }

    /// Atomically take every pending offset and reset the tracker to empty.
    ///
    /// A drain immediately followed by another drain returns an empty map.
    pub fn drain_all(&self) -> HashMap<Partition, i64> {
        let mut pending = self.pending.lock().unwrap();
        let drained = std::mem::take(&mut *pending);
        metrics::gauge!(PENDING_OFFSET_PARTITIONS_GAUGE).set(0.0);
        drained
    }

    /// Number of partitions with uncommitted offsets.
    pub fn pending_partitions(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}
