//! Per-batch processing on a dedicated worker task.
//!
//! The worker never touches the group client; it only feeds records to the
//! handler and registers consumed offsets with the tracker. Cancellation is
//! cooperative and only observed between records - a record's handling is
//! never interrupted part-way.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::metrics_consts::{
    BATCHES_CANCELLED_COUNTER, BATCHES_DISPATCHED_COUNTER, BATCH_DURATION_HISTOGRAM,
    BATCH_SIZE_HISTOGRAM, RECORDS_PROCESSED_COUNTER, RECORDS_SKIPPED_COUNTER,
};
use crate::offset_tracker::OffsetTracker;
use crate::types::{Record, RecordBatch};

/// Per-record processing plugged in by the application.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, record: &Record) -> anyhow::Result<()>;
}

/// How a dispatched batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every record was handled (or deliberately skipped).
    Completed { records: usize },
    /// Cancellation observed at a record boundary; `processed` records were
    /// fully handled and registered before the worker stopped.
    Cancelled { processed: usize },
}

pub struct BatchProcessor<H> {
    handler: Arc<H>,
    tracker: Arc<OffsetTracker>,
    client_id: String,
}

impl<H: RecordHandler + 'static> BatchProcessor<H> {
    pub fn new(handler: Arc<H>, tracker: Arc<OffsetTracker>, client_id: impl Into<String>) -> Self {
        Self {
            handler,
            tracker,
            client_id: client_id.into(),
        }
    }

    /// Spawn a worker task for one batch. The caller keeps the token and
    /// cancels it to stop the worker at the next record boundary.
    pub fn dispatch(&self, batch: RecordBatch, cancel: CancellationToken) -> JoinHandle<BatchOutcome> {
        metrics::counter!(BATCHES_DISPATCHED_COUNTER).increment(1);
        metrics::histogram!(BATCH_SIZE_HISTOGRAM).record(batch.len() as f64);

        let handler = Arc::clone(&self.handler);
        let tracker = Arc::clone(&self.tracker);
        let client_id = self.client_id.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            let total = batch.len();
            let mut processed = 0usize;

            for record in batch.into_records() {
                // Boundary check only: an in-flight record always runs to
                // completion before cancellation takes effect.
                if cancel.is_cancelled() {
                    metrics::counter!(BATCHES_CANCELLED_COUNTER).increment(1);
                    metrics::histogram!(BATCH_DURATION_HISTOGRAM)
                        .record(started.elapsed().as_secs_f64());
                    warn!(
                        client_id = %client_id,
                        processed,
                        total,
                        "Batch cancelled at record boundary"
                    );
                    return BatchOutcome::Cancelled { processed };
                }

                if let Err(e) = handler.handle(&record).await {
                    // Poison-record policy: skip, but still register the
                    // offset below so the partition moves past it instead of
                    // redelivering the same record forever.
                    metrics::counter!(RECORDS_SKIPPED_COUNTER).increment(1);
                    error!(
                        client_id = %client_id,
                        partition = %record.partition(),
                        offset = record.offset(),
                        error = format!("{e:#}"),
                        "Record handler failed, skipping record"
                    );
                } else {
                    metrics::counter!(RECORDS_PROCESSED_COUNTER).increment(1);
                }

                tracker.record(record.partition(), record.next_offset());
                processed += 1;
            }

            metrics::histogram!(BATCH_DURATION_HISTOGRAM).record(started.elapsed().as_secs_f64());
            debug!(client_id = %client_id, records = total, "Batch completed");
            BatchOutcome::Completed { records: total }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::types::Partition;

    struct CountingHandler {
        handled: AtomicUsize,
    }

    impl CountingHandler {
        fn new() -> Self {
            Self {
                handled: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RecordHandler for CountingHandler {
        async fn handle(&self, _record: &Record) -> anyhow::Result<()> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Fails every record whose offset is odd.
    struct OddOffsetFailingHandler;

    #[async_trait]
    impl RecordHandler for OddOffsetFailingHandler {
        async fn handle(&self, record: &Record) -> anyhow::Result<()> {
            if record.offset() % 2 == 1 {
                anyhow::bail!("synthetic failure at offset {}", record.offset());
            }
            Ok(())
        }
    }

    /// Cancels the batch token from inside the handler once `after` records
    /// have been handled, modelling a revocation arriving while a record is
    /// in flight.
    struct CancelAfterHandler {
        cancel: CancellationToken,
        after: usize,
        handled: AtomicUsize,
    }

    #[async_trait]
    impl RecordHandler for CancelAfterHandler {
        async fn handle(&self, _record: &Record) -> anyhow::Result<()> {
            let n = self.handled.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.after {
                self.cancel.cancel();
            }
            Ok(())
        }
    }

    fn batch_of(partition: &Partition, offsets: std::ops::Range<i64>) -> RecordBatch {
        offsets.map(|o| Record::new(partition.clone(), o)).collect()
    }

    fn processor<H: RecordHandler + 'static>(
        handler: H,
    ) -> (Arc<OffsetTracker>, BatchProcessor<H>) {
        let tracker = Arc::new(OffsetTracker::new());
        let processor = BatchProcessor::new(Arc::new(handler), Arc::clone(&tracker), "test-client");
        (tracker, processor)
    }

    #[tokio::test]
    async fn completes_batch_and_registers_every_offset() {
        let partition = Partition::new("test-topic", 0);
        let (tracker, processor) = processor(CountingHandler::new());

        let outcome = processor
            .dispatch(batch_of(&partition, 0..5), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, BatchOutcome::Completed { records: 5 });
        let drained = tracker.drain_all();
        assert_eq!(drained[&partition], 5);
    }

    #[tokio::test]
    async fn cancelled_before_start_processes_nothing() {
        let partition = Partition::new("test-topic", 0);
        let (tracker, processor) = processor(CountingHandler::new());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = processor
            .dispatch(batch_of(&partition, 0..5), cancel)
            .await
            .unwrap();

        assert_eq!(outcome, BatchOutcome::Cancelled { processed: 0 });
        assert!(tracker.drain_all().is_empty());
    }

    #[tokio::test]
    async fn cancelling_after_k_records_registers_exactly_k() {
        let partition = Partition::new("test-topic", 0);
        let cancel = CancellationToken::new();
        let (tracker, processor) = processor(CancelAfterHandler {
            cancel: cancel.clone(),
            after: 3,
            handled: AtomicUsize::new(0),
        });

        let outcome = processor
            .dispatch(batch_of(&partition, 10..20), cancel)
            .await
            .unwrap();

        assert_eq!(outcome, BatchOutcome::Cancelled { processed: 3 });
        // Offsets 10, 11, 12 were handled, so the next offset to read is 13.
        let drained = tracker.drain_all();
        assert_eq!(drained[&partition], 13);
    }

    #[tokio::test]
    async fn failing_records_are_skipped_but_still_advance_the_offset() {
        let partition = Partition::new("test-topic", 0);
        let (tracker, processor) = processor(OddOffsetFailingHandler);

        let outcome = processor
            .dispatch(batch_of(&partition, 0..4), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, BatchOutcome::Completed { records: 4 });
        let drained = tracker.drain_all();
        assert_eq!(drained[&partition], 4, "skipped records must not stall the partition");
    }

    #[tokio::test]
    async fn worker_runs_without_client_access_across_partitions() {
        let p0 = Partition::new("test-topic", 0);
        let p1 = Partition::new("test-topic", 1);
        let (tracker, processor) = processor(CountingHandler::new());

        let records: Vec<Record> = vec![
            Record::new(p0.clone(), 0),
            Record::new(p1.clone(), 5),
            Record::new(p0.clone(), 1),
        ];
        let outcome = processor
            .dispatch(RecordBatch::new(records), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, BatchOutcome::Completed { records: 3 });
        let drained = tracker.drain_all();
        assert_eq!(drained[&p0], 2);
        assert_eq!(drained[&p1], 6);
    }
}
