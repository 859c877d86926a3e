//! Reaction to consumer-group ownership changes.
//!
//! The coordinator owns two pieces of state the loop reads but never
//! writes: the set of currently assigned partitions and a revocation flag.
//! Both callbacks are invoked synchronously by the client from inside
//! `fetch`/`probe_liveness`/`commit` on the polling thread, which is what
//! makes committing from `on_revoked` safe: ownership does not transfer
//! until the callback returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use tracing::{debug, info, warn};

use crate::client::OffsetOps;
use crate::metrics_consts::{
    ASSIGNED_PARTITIONS_GAUGE, COMMITS_COUNTER, REBALANCE_ASSIGNMENTS_COUNTER,
    REBALANCE_REVOCATIONS_COUNTER,
};
use crate::offset_tracker::OffsetTracker;
use crate::types::Partition;

pub struct RebalanceCoordinator {
    /// Offsets consumed but not yet committed; flushed on revocation.
    tracker: Arc<OffsetTracker>,

    /// Partitions currently owned by this instance. Mutated only by the
    /// callbacks (add on assign, remove on revoke), which handles both the
    /// eager protocol (revoke-all then assign-full) and cooperative deltas.
    assignment: DashSet<Partition>,

    /// Raised by `on_revoked`, consumed by the loop via `take_revocation`.
    revoked: AtomicBool,

    client_id: String,
}

impl RebalanceCoordinator {
    pub fn new(tracker: Arc<OffsetTracker>, client_id: impl Into<String>) -> Self {
        Self {
            tracker,
            assignment: DashSet::new(),
            revoked: AtomicBool::new(false),
            client_id: client_id.into(),
        }
    }

    /// Partitions are about to be taken away. Flush every pending offset
    /// through a synchronous commit before the callback returns - the last
    /// chance to commit this instance's progress before the next owner
    /// starts from the committed position.
    pub fn on_revoked(&self, ops: &dyn OffsetOps, partitions: &[Partition]) {
        if partitions.is_empty() {
            debug!(client_id = %self.client_id, "Revocation callback with no partitions, skipping");
            return;
        }

        // Raise the flag before committing so the loop can react to the
        // revocation even if the commit itself stalls.
        self.revoked.store(true, Ordering::SeqCst);
        metrics::counter!(REBALANCE_REVOCATIONS_COUNTER).increment(1);

        info!(
            client_id = %self.client_id,
            revoked = partitions.len(),
            "Partitions being revoked, flushing pending offsets"
        );

        // Commit everything pending, not only the revoked partitions'
        // offsets: the superset is safe and avoids splitting the drain.
        let pending = self.tracker.drain_all();
        if !pending.is_empty() {
            match ops.commit_sync(&pending) {
                Ok(()) => {
                    metrics::counter!(COMMITS_COUNTER, "result" => "ok", "trigger" => "revocation")
                        .increment(1);
                    info!(
                        client_id = %self.client_id,
                        partitions = pending.len(),
                        "Committed pending offsets ahead of revocation"
                    );
                }
                Err(e) => {
                    // Best effort: the offsets are lost from the tracker but
                    // redelivery to the next owner restores correctness.
                    metrics::counter!(COMMITS_COUNTER, "result" => e.error_type(), "trigger" => "revocation")
                        .increment(1);
                    warn!(
                        client_id = %self.client_id,
                        error = %e,
                        "Failed to flush offsets during revocation, records will be redelivered"
                    );
                }
            }
        }

        for partition in partitions {
            self.assignment.remove(partition);
        }
        metrics::gauge!(ASSIGNED_PARTITIONS_GAUGE).set(self.assignment.len() as f64);
    }

    /// Partitions have been granted. Resume each one from its last
    /// committed offset when the group has one; otherwise leave the cursor
    /// alone and let the client's configured reset policy pick the start.
    pub fn on_assigned(&self, ops: &dyn OffsetOps, partitions: &[Partition]) {
        if partitions.is_empty() {
            debug!(client_id = %self.client_id, "Assignment callback with no partitions, skipping");
            return;
        }

        metrics::counter!(REBALANCE_ASSIGNMENTS_COUNTER).increment(1);

        for partition in partitions {
            self.assignment.insert(partition.clone());

            match ops.last_committed(partition) {
                Ok(Some(offset)) => match ops.seek(partition, offset) {
                    Ok(()) => info!(
                        client_id = %self.client_id,
                        partition = %partition,
                        offset,
                        "Assigned partition, resuming from committed offset"
                    ),
                    Err(e) => warn!(
                        client_id = %self.client_id,
                        partition = %partition,
                        offset,
                        error = %e,
                        "Failed to seek to committed offset"
                    ),
                },
                Ok(None) => info!(
                    client_id = %self.client_id,
                    partition = %partition,
                    "Assigned partition with no committed offset, using reset policy"
                ),
                Err(e) => warn!(
                    client_id = %self.client_id,
                    partition = %partition,
                    error = %e,
                    "Failed to look up committed offset"
                ),
            }
        }
        metrics::gauge!(ASSIGNED_PARTITIONS_GAUGE).set(self.assignment.len() as f64);
    }

    /// Consume the revocation flag. Returns true at most once per
    /// revocation signal.
    pub fn take_revocation(&self) -> bool {
        self.revoked.swap(false, Ordering::SeqCst)
    }

    /// Peek at the flag without consuming it.
    pub fn is_revocation_pending(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }

    /// Snapshot of current ownership, used to drive pause/resume.
    pub fn assigned_partitions(&self) -> Vec<Partition> {
        self.assignment.iter().map(|p| p.key().clone()).collect()
    }

    pub fn assigned_count(&self) -> usize {
        self.assignment.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::client::{ClientError, CommitError};

    /// Records every OffsetOps call in order and serves scripted committed
    /// offsets.
    #[derive(Default)]
    struct RecordingOps {
        calls: Mutex<Vec<String>>,
        committed: HashMap<Partition, i64>,
        fail_commit: bool,
    }

    impl RecordingOps {
        fn with_committed(partition: Partition, offset: i64) -> Self {
            Self {
                committed: HashMap::from([(partition, offset)]),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl OffsetOps for RecordingOps {
        fn commit_sync(&self, offsets: &HashMap<Partition, i64>) -> Result<(), CommitError> {
            let mut entries: Vec<String> = offsets
                .iter()
                .map(|(p, o)| format!("{p}={o}"))
                .collect();
            entries.sort();
            self.calls
                .lock()
                .unwrap()
                .push(format!("commit[{}]", entries.join(",")));
            if self.fail_commit {
                return Err(CommitError::Connection(
                    rdkafka::error::KafkaError::ConsumerCommit(
                        rdkafka::types::RDKafkaErrorCode::AllBrokersDown,
                    ),
                ));
            }
            Ok(())
        }

        fn last_committed(&self, partition: &Partition) -> Result<Option<i64>, ClientError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("last_committed[{partition}]"));
            Ok(self.committed.get(partition).copied())
        }

        fn seek(&self, partition: &Partition, offset: i64) -> Result<(), ClientError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("seek[{partition}={offset}]"));
            Ok(())
        }
    }

    fn partition(n: i32) -> Partition {
        Partition::new("test-topic", n)
    }

    fn coordinator_with_tracker() -> (Arc<OffsetTracker>, RebalanceCoordinator) {
        let tracker = Arc::new(OffsetTracker::new());
        let coordinator = RebalanceCoordinator::new(Arc::clone(&tracker), "test-client");
        (tracker, coordinator)
    }

    #[test]
    fn revocation_commits_pending_offsets_before_returning() {
        let (tracker, coordinator) = coordinator_with_tracker();
        let ops = RecordingOps::default();

        tracker.record(&partition(0), 3);
        tracker.record(&partition(1), 2);
        coordinator.on_assigned(&ops, &[partition(0), partition(1)]);

        coordinator.on_revoked(&ops, &[partition(0)]);

        // The commit happened inside the callback and covered every
        // pending partition, not only the revoked one.
        let calls = ops.calls();
        assert!(
            calls.contains(&"commit[test-topic[0]=3,test-topic[1]=2]".to_string()),
            "expected flush commit in {calls:?}"
        );
        assert!(tracker.drain_all().is_empty(), "tracker must be flushed");
        assert!(coordinator.is_revocation_pending());
    }

    #[test]
    fn revocation_shrinks_assignment_but_keeps_other_partitions() {
        let (_tracker, coordinator) = coordinator_with_tracker();
        let ops = RecordingOps::default();

        coordinator.on_assigned(&ops, &[partition(0), partition(1), partition(2)]);
        coordinator.on_revoked(&ops, &[partition(1)]);

        let mut remaining = coordinator.assigned_partitions();
        remaining.sort_by_key(|p| p.partition_number());
        assert_eq!(remaining, vec![partition(0), partition(2)]);
    }

    #[test]
    fn revocation_with_failing_commit_still_raises_flag_and_shrinks() {
        let (tracker, coordinator) = coordinator_with_tracker();
        let ops = RecordingOps {
            fail_commit: true,
            ..Default::default()
        };

        tracker.record(&partition(0), 10);
        coordinator.on_assigned(&ops, &[partition(0)]);
        coordinator.on_revoked(&ops, &[partition(0)]);

        assert!(coordinator.is_revocation_pending());
        assert_eq!(coordinator.assigned_count(), 0);
    }

    #[test]
    fn empty_revocation_is_a_no_op() {
        let (tracker, coordinator) = coordinator_with_tracker();
        let ops = RecordingOps::default();

        tracker.record(&partition(0), 5);
        coordinator.on_revoked(&ops, &[]);

        assert!(!coordinator.is_revocation_pending());
        assert_eq!(tracker.pending_partitions(), 1);
        assert!(ops.calls().is_empty());
    }

    #[test]
    fn assignment_seeks_to_exactly_the_committed_offset() {
        let (_tracker, coordinator) = coordinator_with_tracker();
        let ops = RecordingOps::with_committed(partition(0), 42);

        coordinator.on_assigned(&ops, &[partition(0)]);

        assert_eq!(
            ops.calls(),
            vec![
                "last_committed[test-topic[0]]".to_string(),
                "seek[test-topic[0]=42]".to_string(),
            ]
        );
        assert_eq!(coordinator.assigned_partitions(), vec![partition(0)]);
    }

    #[test]
    fn assignment_without_committed_offset_never_seeks() {
        let (_tracker, coordinator) = coordinator_with_tracker();
        let ops = RecordingOps::default();

        coordinator.on_assigned(&ops, &[partition(3)]);

        assert_eq!(ops.calls(), vec!["last_committed[test-topic[3]]".to_string()]);
    }

    #[test]
    fn take_revocation_consumes_the_flag_once() {
        let (tracker, coordinator) = coordinator_with_tracker();
        let ops = RecordingOps::default();

        tracker.record(&partition(0), 1);
        coordinator.on_revoked(&ops, &[partition(0)]);

        assert!(coordinator.take_revocation());
        assert!(!coordinator.take_revocation());
    }
}
