//! Rebalance-safe batch consumer for Kafka consumer groups.
//!
//! The crate pulls batches from assigned partitions, processes them on a
//! dedicated worker while feeding the group coordinator manual liveness
//! probes, and commits consumed offsets synchronously - surviving
//! concurrent partition reassignment with at-least-once delivery.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types with a cause chain,
//! use formats that keep the full chain visible:
//!
//! - **Inline format:** `{e:#}` — full chain on one line.
//! - **Structured field:** `error = ?e` — full chain with `Caused by:` sections.
//!
//! Avoid `{}` / `%e` (Display) for chained errors — they only show the
//! top-level message. When constructing errors, prefer `.context()` /
//! `.with_context()` so the original error remains the source.

pub mod batch_processor;
pub mod client;
pub mod config;
pub mod consumer_loop;
pub mod kafka_client;
pub mod metrics_consts;
pub mod offset_tracker;
pub mod rebalance_coordinator;
pub mod serve;
pub mod test_utils;
pub mod types;

// Re-export the types most callers need
pub use batch_processor::{BatchOutcome, BatchProcessor, RecordHandler};
pub use client::{ClientError, CommitError, ConsumerClient, OffsetOps};
pub use consumer_loop::{ConsumerHandle, ConsumerLoop, LoopSettings};
pub use offset_tracker::OffsetTracker;
pub use rebalance_coordinator::RebalanceCoordinator;
pub use types::{LifecycleState, Partition, Record, RecordBatch};
