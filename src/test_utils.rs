//! Test support: a scripted in-memory client implementing the consumer
//! contract, plus handlers used across unit and integration tests.
//!
//! `FakeClient` mimics the real client's callback discipline: scripted
//! rebalance events are delivered synchronously inside `fetch` and
//! `probe_liveness`, before those calls return, and every interaction is
//! appended to an ordered call log so tests can assert sequencing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;

use crate::batch_processor::RecordHandler;
use crate::client::{ClientError, CommitError, ConsumerClient, OffsetOps};
use crate::rebalance_coordinator::RebalanceCoordinator;
use crate::types::{Partition, Record, RecordBatch};

/// One scripted outcome for a `fetch` call.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Return these records immediately.
    Records(Vec<Record>),
    /// Return an empty batch immediately.
    Empty,
    /// Wait out the full fetch timeout, then return an empty batch.
    Block,
    /// Deliver an assignment callback inline, then return the records.
    Assign {
        partitions: Vec<Partition>,
        records: Vec<Record>,
    },
    /// Deliver a revocation callback inline, then return the records.
    Revoke {
        partitions: Vec<Partition>,
        records: Vec<Record>,
    },
    /// Fail the fetch.
    Fail(KafkaError),
}

/// One scripted outcome for a liveness probe.
#[derive(Debug)]
pub enum ProbeOutcome {
    Quiet,
    Revoke(Vec<Partition>),
    Assign(Vec<Partition>),
}

/// Scripted commit failure modes.
#[derive(Debug, Clone, Copy)]
pub enum CommitFailure {
    OwnershipLost,
    Connection,
}

fn fmt_partitions(partitions: &[Partition]) -> String {
    let mut parts: Vec<String> = partitions.iter().map(|p| p.to_string()).collect();
    parts.sort();
    parts.join(",")
}

fn fmt_offsets(offsets: &HashMap<Partition, i64>) -> String {
    let mut entries: Vec<String> = offsets.iter().map(|(p, o)| format!("{p}={o}")).collect();
    entries.sort();
    entries.join(",")
}

/// Observable state shared between the fake client, its `OffsetOps` view
/// and the test making assertions after the loop has consumed the client.
#[derive(Default)]
pub struct FakeState {
    calls: Mutex<Vec<String>>,
    committed: Mutex<HashMap<Partition, i64>>,
    commit_failures: Mutex<VecDeque<CommitFailure>>,
    paused: Mutex<HashSet<Partition>>,
    fetch_calls: AtomicUsize,
    probe_calls: AtomicUsize,
    commit_calls: AtomicUsize,
    close_calls: AtomicUsize,
}

impl FakeState {
    fn log(&self, entry: impl Into<String>) {
        self.calls.lock().unwrap().push(entry.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn committed(&self) -> HashMap<Partition, i64> {
        self.committed.lock().unwrap().clone()
    }

    pub fn committed_offset(&self, partition: &Partition) -> Option<i64> {
        self.committed.lock().unwrap().get(partition).copied()
    }

    pub fn paused_partitions(&self) -> Vec<Partition> {
        let mut paused: Vec<Partition> = self.paused.lock().unwrap().iter().cloned().collect();
        paused.sort_by(|a, b| {
            (a.topic(), a.partition_number()).cmp(&(b.topic(), b.partition_number()))
        });
        paused
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub fn commit_calls(&self) -> usize {
        self.commit_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn apply_commit(&self, offsets: &HashMap<Partition, i64>) -> Result<(), CommitError> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        self.log(format!("commit[{}]", fmt_offsets(offsets)));

        if let Some(failure) = self.commit_failures.lock().unwrap().pop_front() {
            return Err(match failure {
                CommitFailure::OwnershipLost => CommitError::OwnershipLost(
                    KafkaError::ConsumerCommit(RDKafkaErrorCode::RebalanceInProgress),
                ),
                CommitFailure::Connection => CommitError::Connection(
                    KafkaError::ConsumerCommit(RDKafkaErrorCode::AllBrokersDown),
                ),
            });
        }

        let mut committed = self.committed.lock().unwrap();
        for (partition, offset) in offsets {
            committed.insert(partition.clone(), *offset);
        }
        Ok(())
    }
}

/// The commit/lookup/seek view handed to rebalance callbacks.
pub struct FakeOps {
    state: Arc<FakeState>,
}

impl OffsetOps for FakeOps {
    fn commit_sync(&self, offsets: &HashMap<Partition, i64>) -> Result<(), CommitError> {
        self.state.apply_commit(offsets)
    }

    fn last_committed(&self, partition: &Partition) -> Result<Option<i64>, ClientError> {
        self.state.log(format!("last_committed[{partition}]"));
        Ok(self.state.committed_offset(partition))
    }

    fn seek(&self, partition: &Partition, offset: i64) -> Result<(), ClientError> {
        self.state.log(format!("seek[{partition}={offset}]"));
        Ok(())
    }
}

/// In-memory `ConsumerClient` driven by scripts.
///
/// Unscripted fetches behave like a quiet topic: they wait out the fetch
/// timeout and return an empty batch. Unscripted probes are quiet.
pub struct FakeClient {
    coordinator: Arc<RebalanceCoordinator>,
    state: Arc<FakeState>,
    fetches: Mutex<VecDeque<FetchOutcome>>,
    probes: Mutex<VecDeque<ProbeOutcome>>,
    closed: bool,
}

impl FakeClient {
    pub fn new(coordinator: Arc<RebalanceCoordinator>) -> Self {
        Self {
            coordinator,
            state: Arc::new(FakeState::default()),
            fetches: Mutex::new(VecDeque::new()),
            probes: Mutex::new(VecDeque::new()),
            closed: false,
        }
    }

    /// Shared handle to the observable state; grab one before the loop
    /// consumes the client.
    pub fn state(&self) -> Arc<FakeState> {
        Arc::clone(&self.state)
    }

    pub fn script_fetches(&self, outcomes: impl IntoIterator<Item = FetchOutcome>) {
        self.fetches.lock().unwrap().extend(outcomes);
    }

    pub fn script_probes(&self, outcomes: impl IntoIterator<Item = ProbeOutcome>) {
        self.probes.lock().unwrap().extend(outcomes);
    }

    /// Seed the committed-offset store, as if a previous owner committed.
    pub fn set_committed(&self, partition: Partition, offset: i64) {
        self.state.committed.lock().unwrap().insert(partition, offset);
    }

    /// Make the next commit fail with the given mode.
    pub fn fail_next_commit(&self, failure: CommitFailure) {
        self.state.commit_failures.lock().unwrap().push_back(failure);
    }

    fn ops(&self) -> FakeOps {
        FakeOps {
            state: Arc::clone(&self.state),
        }
    }

    fn deliver_revoke(&self, partitions: &[Partition]) {
        self.state
            .log(format!("revoke_begin[{}]", fmt_partitions(partitions)));
        self.coordinator.on_revoked(&self.ops(), partitions);
        self.state.log("revoke_end");
    }

    fn deliver_assign(&self, partitions: &[Partition]) {
        self.state
            .log(format!("assign_begin[{}]", fmt_partitions(partitions)));
        self.coordinator.on_assigned(&self.ops(), partitions);
        self.state.log("assign_end");
    }
}

#[async_trait]
impl ConsumerClient for FakeClient {
    async fn fetch(&mut self, max_wait: Duration) -> Result<RecordBatch, ClientError> {
        if self.closed {
            return Err(ClientError::Closed);
        }
        self.state.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.state.log("fetch");

        let outcome = self.fetches.lock().unwrap().pop_front();
        match outcome {
            None | Some(FetchOutcome::Block) => {
                tokio::time::sleep(max_wait).await;
                Ok(RecordBatch::default())
            }
            Some(FetchOutcome::Empty) => Ok(RecordBatch::default()),
            Some(FetchOutcome::Records(records)) => Ok(RecordBatch::new(records)),
            Some(FetchOutcome::Assign {
                partitions,
                records,
            }) => {
                self.deliver_assign(&partitions);
                Ok(RecordBatch::new(records))
            }
            Some(FetchOutcome::Revoke {
                partitions,
                records,
            }) => {
                self.deliver_revoke(&partitions);
                Ok(RecordBatch::new(records))
            }
            Some(FetchOutcome::Fail(e)) => Err(ClientError::Kafka(e)),
        }
    }

    fn pause(&self, partitions: &[Partition]) -> Result<(), ClientError> {
        self.state.log(format!("pause[{}]", fmt_partitions(partitions)));
        let mut paused = self.state.paused.lock().unwrap();
        for partition in partitions {
            paused.insert(partition.clone());
        }
        Ok(())
    }

    fn resume(&self, partitions: &[Partition]) -> Result<(), ClientError> {
        self.state
            .log(format!("resume[{}]", fmt_partitions(partitions)));
        let mut paused = self.state.paused.lock().unwrap();
        for partition in partitions {
            paused.remove(partition);
        }
        Ok(())
    }

    async fn probe_liveness(&mut self) -> Result<(), ClientError> {
        if self.closed {
            return Err(ClientError::Closed);
        }
        self.state.probe_calls.fetch_add(1, Ordering::SeqCst);
        self.state.log("probe");

        let outcome = self.probes.lock().unwrap().pop_front();
        match outcome {
            None | Some(ProbeOutcome::Quiet) => Ok(()),
            Some(ProbeOutcome::Revoke(partitions)) => {
                self.deliver_revoke(&partitions);
                Ok(())
            }
            Some(ProbeOutcome::Assign(partitions)) => {
                self.deliver_assign(&partitions);
                Ok(())
            }
        }
    }

    async fn commit(&mut self, offsets: &HashMap<Partition, i64>) -> Result<(), CommitError> {
        self.state.apply_commit(offsets)
    }

    fn close(&mut self) -> Result<(), ClientError> {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        self.state.log("close");
        self.closed = true;
        Ok(())
    }
}

/// Counts handled records.
#[derive(Default)]
pub struct CountingHandler {
    pub handled: AtomicUsize,
}

impl CountingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordHandler for CountingHandler {
    async fn handle(&self, _record: &Record) -> anyhow::Result<()> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Sleeps per record to model slow downstream work.
pub struct SlowHandler {
    pub delay: Duration,
    pub handled: AtomicUsize,
}

impl SlowHandler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            handled: AtomicUsize::new(0),
        }
    }

    pub fn count(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordHandler for SlowHandler {
    async fn handle(&self, _record: &Record) -> anyhow::Result<()> {
        tokio::time::sleep(self.delay).await;
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Panics once, at the given offset, taking the worker task down with it.
/// Records at that offset handled later (redelivery) succeed.
pub struct PanickingHandler {
    pub panic_at: i64,
    fired: std::sync::atomic::AtomicBool,
    handled: AtomicUsize,
}

impl PanickingHandler {
    pub fn new(panic_at: i64) -> Self {
        Self {
            panic_at,
            fired: std::sync::atomic::AtomicBool::new(false),
            handled: AtomicUsize::new(0),
        }
    }

    pub fn count(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordHandler for PanickingHandler {
    async fn handle(&self, record: &Record) -> anyhow::Result<()> {
        if record.offset() == self.panic_at && !self.fired.swap(true, Ordering::SeqCst) {
            panic!("handler blew up at offset {}", record.offset());
        }
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fails every record, for poison-record policy tests.
#[derive(Default)]
pub struct FailingHandler {
    pub attempted: AtomicUsize,
}

impl FailingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.attempted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordHandler for FailingHandler {
    async fn handle(&self, record: &Record) -> anyhow::Result<()> {
        self.attempted.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("refusing record at offset {}", record.offset())
    }
}
