//! The client contract the consumer loop drives.
//!
//! `ConsumerClient` is the loop-facing surface of the underlying group
//! client; `OffsetOps` is the narrow commit/lookup/seek view handed to
//! rebalance callbacks, which the client invokes synchronously from inside
//! `fetch`, `probe_liveness` or `commit` - never from another thread.
//! Splitting the two keeps the callback side from needing a handle on the
//! whole client it is being called from.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use thiserror::Error;

use crate::types::{Partition, RecordBatch};

/// Errors from fetch/pause/resume/probe/seek/lookup operations.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("kafka client error: {0}")]
    Kafka(#[from] KafkaError),

    /// Operation attempted after `close`.
    #[error("client already closed")]
    Closed,
}

impl ClientError {
    /// True when the instance cannot make further progress and its loop
    /// should terminate. Everything else is logged and retried with backoff.
    pub fn is_fatal(&self) -> bool {
        match self {
            ClientError::Closed => true,
            ClientError::Kafka(KafkaError::MessageConsumptionFatal(_)) => true,
            ClientError::Kafka(KafkaError::Global(RDKafkaErrorCode::Fatal)) => true,
            ClientError::Kafka(KafkaError::Global(RDKafkaErrorCode::Authentication)) => true,
            _ => false,
        }
    }

    /// Error type tag for metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            ClientError::Kafka(_) => "kafka",
            ClientError::Closed => "closed",
        }
    }
}

/// Errors from a synchronous offset commit, split along the line that
/// matters to the loop: offsets rejected because ownership moved are
/// expected noise during a rebalance, anything else means this instance
/// cannot guarantee its offsets reach the coordinator.
#[derive(Error, Debug)]
pub enum CommitError {
    /// The group reassigned partitions while the commit was in flight; the
    /// offsets belong to a membership generation that no longer exists.
    /// The new owner re-processes from its own committed position.
    #[error("commit rejected after ownership change: {0}")]
    OwnershipLost(#[source] KafkaError),

    /// The commit could not reach the group coordinator.
    #[error("commit failed: {0}")]
    Connection(#[source] KafkaError),
}

impl CommitError {
    /// Sort a commit failure into the tolerable/fatal split.
    pub fn classify(e: KafkaError) -> CommitError {
        let code = match &e {
            KafkaError::ConsumerCommit(code) => Some(*code),
            _ => None,
        };
        match code {
            Some(
                RDKafkaErrorCode::UnknownMemberId
                | RDKafkaErrorCode::IllegalGeneration
                | RDKafkaErrorCode::RebalanceInProgress
                | RDKafkaErrorCode::UnknownTopicOrPartition,
            ) => CommitError::OwnershipLost(e),
            _ => CommitError::Connection(e),
        }
    }

    /// Error type tag for metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            CommitError::OwnershipLost(_) => "ownership_lost",
            CommitError::Connection(_) => "connection",
        }
    }
}

/// The group-client surface the consumer loop drives.
///
/// The handle is not safe for concurrent use: the loop owns it by value and
/// every callback-delivering operation takes `&mut self`. Rebalance
/// callbacks run synchronously inside `fetch`, `probe_liveness` and
/// `commit` before those calls return.
#[async_trait]
pub trait ConsumerClient: Send {
    /// Pull the next batch of records, waiting at most `max_wait`. An empty
    /// batch is a normal outcome. May deliver rebalance callbacks inline.
    async fn fetch(&mut self, max_wait: Duration) -> Result<RecordBatch, ClientError>;

    /// Stop record delivery for the given partitions. Idempotent; pausing
    /// an already-paused partition is a no-op.
    fn pause(&self, partitions: &[Partition]) -> Result<(), ClientError>;

    /// Re-enable record delivery for the given partitions. Idempotent.
    fn resume(&self, partitions: &[Partition]) -> Result<(), ClientError>;

    /// Zero-duration fetch that serves heartbeats and callbacks but never
    /// returns records (delivery is paused while a batch is in flight).
    async fn probe_liveness(&mut self) -> Result<(), ClientError>;

    /// Synchronously commit the given next-to-read offsets. Returns only
    /// once the coordinator has acknowledged or rejected them.
    async fn commit(&mut self, offsets: &HashMap<Partition, i64>) -> Result<(), CommitError>;

    /// Release the group membership and the underlying handle. Idempotent.
    fn close(&mut self) -> Result<(), ClientError>;
}

/// Commit/lookup/seek primitives available to rebalance callbacks.
///
/// Implementations borrow the client that is currently delivering the
/// callback and must only be used on the polling thread, for the duration
/// of the callback.
pub trait OffsetOps {
    /// Synchronous commit of next-to-read offsets.
    fn commit_sync(&self, offsets: &HashMap<Partition, i64>) -> Result<(), CommitError>;

    /// The last committed offset for a partition, `None` when the group has
    /// never committed one.
    fn last_committed(&self, partition: &Partition) -> Result<Option<i64>, ClientError>;

    /// Reposition the fetch cursor for a partition.
    fn seek(&self, partition: &Partition, offset: i64) -> Result<(), ClientError>;
}
