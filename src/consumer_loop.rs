//! The drive cycle: fetch, pause, dispatch, bounded wait with liveness
//! probing, resume, drain-and-commit - plus the shutdown protocol.
//!
//! One loop instance owns one client handle by value and is the only code
//! that touches it. The processing worker runs on its own task and shares
//! nothing with the client; rebalance callbacks run synchronously inside
//! the client calls made from here, so every mutation of the assignment
//! model happens on this task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch_processor::{BatchOutcome, BatchProcessor, RecordHandler};
use crate::client::{CommitError, ConsumerClient};
use crate::metrics_consts::{COMMITS_COUNTER, EMPTY_FETCHES_COUNTER, LIVENESS_PROBES_COUNTER};
use crate::offset_tracker::OffsetTracker;
use crate::rebalance_coordinator::RebalanceCoordinator;
use crate::types::LifecycleState;

/// Timing knobs for the cycle. Defaults match the original deployment
/// tuning: second-scale fetches, a few-second wait between liveness
/// probes, and a five-second drain bound on shutdown.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Upper bound on one fetch call.
    pub poll_timeout: Duration,
    /// Sleep after an empty fetch before the next cycle.
    pub idle_backoff: Duration,
    /// How long to wait on the worker between liveness probes.
    pub completion_wait: Duration,
    /// Bound on draining the worker once it has been cancelled for
    /// shutdown or has overstayed a revocation.
    pub shutdown_timeout: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(1000),
            idle_backoff: Duration::from_millis(500),
            completion_wait: Duration::from_millis(3000),
            shutdown_timeout: Duration::from_millis(5000),
        }
    }
}

/// Cloneable handle for stopping and observing a running consumer.
#[derive(Clone)]
pub struct ConsumerHandle {
    shutdown: CancellationToken,
    state: watch::Receiver<LifecycleState>,
}

impl ConsumerHandle {
    /// Request shutdown and wait until the underlying client has been
    /// closed. Idempotent, callable from any task, and returns immediately
    /// when the loop has already exited.
    pub async fn close(&mut self) {
        self.shutdown.cancel();
        // Err means the sender is gone, which only happens once the loop
        // has finished; either way the consumer is down.
        self.state
            .wait_for(|state| *state == LifecycleState::Closed)
            .await
            .ok();
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }
}

pub struct ConsumerLoop<C, H> {
    client: C,
    tracker: Arc<OffsetTracker>,
    coordinator: Arc<RebalanceCoordinator>,
    processor: BatchProcessor<H>,
    settings: LoopSettings,
    shutdown: CancellationToken,
    state_tx: watch::Sender<LifecycleState>,
    state_rx: watch::Receiver<LifecycleState>,
    client_id: String,
}

impl<C, H> ConsumerLoop<C, H>
where
    C: ConsumerClient,
    H: RecordHandler + 'static,
{
    pub fn new(
        client: C,
        handler: Arc<H>,
        tracker: Arc<OffsetTracker>,
        coordinator: Arc<RebalanceCoordinator>,
        settings: LoopSettings,
        client_id: impl Into<String>,
    ) -> Self {
        let client_id = client_id.into();
        let (state_tx, state_rx) = watch::channel(LifecycleState::Running);
        let processor =
            BatchProcessor::new(handler, Arc::clone(&tracker), client_id.clone());
        Self {
            client,
            tracker,
            coordinator,
            processor,
            settings,
            shutdown: CancellationToken::new(),
            state_tx,
            state_rx,
            client_id,
        }
    }

    /// Handle for `close()` and state observation. Grab one before `run`
    /// consumes the loop.
    pub fn handle(&self) -> ConsumerHandle {
        ConsumerHandle {
            shutdown: self.shutdown.clone(),
            state: self.state_rx.clone(),
        }
    }

    /// Drive fetch/process/commit cycles until close is requested or a
    /// fatal error ends this instance. Always closes the client on the way
    /// out, whatever the exit path.
    pub async fn run(mut self) -> Result<()> {
        info!(client_id = %self.client_id, "Consumer loop starting");
        let result = self.run_cycles().await;
        self.finalize();
        if let Err(e) = &result {
            error!(
                client_id = %self.client_id,
                error = format!("{e:#}"),
                "Consumer loop terminated with error"
            );
        }
        result
    }

    async fn run_cycles(&mut self) -> Result<()> {
        loop {
            if self.shutdown.is_cancelled() {
                info!(client_id = %self.client_id, "Close requested, leaving consume loop");
                self.state_tx.send_replace(LifecycleState::ShuttingDown);
                return Ok(());
            }

            let batch = match self.client.fetch(self.settings.poll_timeout).await {
                Ok(batch) => batch,
                Err(e) if e.is_fatal() => {
                    self.state_tx.send_replace(LifecycleState::ShuttingDown);
                    return Err(anyhow::Error::new(e).context("fatal fetch error"));
                }
                Err(e) => {
                    warn!(client_id = %self.client_id, error = %e, "Fetch failed, backing off");
                    self.idle_sleep().await;
                    continue;
                }
            };

            if batch.is_empty() {
                metrics::counter!(EMPTY_FETCHES_COUNTER).increment(1);
                self.idle_sleep().await;
                continue;
            }

            debug!(
                client_id = %self.client_id,
                records = batch.len(),
                "Fetched batch, pausing assigned partitions"
            );

            // Pause everything we own so in-wait probes serve heartbeats and
            // callbacks without delivering records.
            let assigned = self.coordinator.assigned_partitions();
            if let Err(e) = self.client.pause(&assigned) {
                warn!(client_id = %self.client_id, error = %e, "Failed to pause assigned partitions");
            }

            let cancel = CancellationToken::new();
            let mut worker = self.processor.dispatch(batch, cancel.clone());
            let outcome = match self.await_batch(&mut worker, &cancel).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // Fatal while a batch is in flight: stop the worker
                    // before surfacing the error so nothing runs detached.
                    cancel.cancel();
                    self.drain_worker(&mut worker).await;
                    self.state_tx.send_replace(LifecycleState::ShuttingDown);
                    return Err(e);
                }
            };
            if let BatchOutcome::Cancelled { processed } = outcome {
                info!(
                    client_id = %self.client_id,
                    processed,
                    "Batch stopped before completion"
                );
            }

            // Resume only what we still own - the assignment may have
            // shrunk while the batch was in flight.
            let assigned = self.coordinator.assigned_partitions();
            if let Err(e) = self.client.resume(&assigned) {
                warn!(client_id = %self.client_id, error = %e, "Failed to resume assigned partitions");
            }

            self.commit_pending().await?;
        }
    }

    /// Wait for the worker while keeping the group convinced this member
    /// is alive. Every wait is bounded by `completion_wait`; each timeout
    /// issues a zero-duration probe unless a revocation or close request
    /// asks for the worker to be cancelled first.
    async fn await_batch(
        &mut self,
        worker: &mut JoinHandle<BatchOutcome>,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome> {
        let mut elapsed_waits: u32 = 0;
        loop {
            tokio::select! {
                joined = &mut *worker => {
                    return Ok(Self::unwrap_outcome(&self.client_id, joined));
                }
                _ = tokio::time::sleep(self.settings.completion_wait) => {
                    // One revocation signal cancels the batch only if a full
                    // wait interval had already elapsed before the signal
                    // was consumed; a signal seen on the first timeout
                    // tolerates one more interval. Either way the stall
                    // after a revocation stays under two wait intervals.
                    if self.coordinator.take_revocation() && elapsed_waits > 0 {
                        warn!(
                            client_id = %self.client_id,
                            elapsed_waits,
                            "Revocation observed while batch in flight, cancelling worker"
                        );
                        cancel.cancel();
                        return Ok(self.drain_worker(worker).await);
                    }

                    self.probe().await?;
                    elapsed_waits += 1;
                }
                _ = self.shutdown.cancelled() => {
                    info!(client_id = %self.client_id, "Close requested mid-batch, cancelling worker");
                    self.state_tx.send_replace(LifecycleState::ShuttingDown);
                    cancel.cancel();
                    return Ok(self.drain_worker(worker).await);
                }
            }
        }
    }

    /// After cancellation, wait for the worker to stop at its record
    /// boundary, probing in between so a slow final record cannot cost the
    /// group membership. Gives up and aborts the task once
    /// `shutdown_timeout` has passed.
    async fn drain_worker(&mut self, worker: &mut JoinHandle<BatchOutcome>) -> BatchOutcome {
        let deadline = Instant::now() + self.settings.shutdown_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    client_id = %self.client_id,
                    "Worker did not stop within the drain deadline, aborting task"
                );
                worker.abort();
                return BatchOutcome::Cancelled { processed: 0 };
            }

            match timeout(remaining.min(self.settings.completion_wait), &mut *worker).await {
                Ok(joined) => return Self::unwrap_outcome(&self.client_id, joined),
                Err(_) => {
                    if let Err(e) = self.probe().await {
                        warn!(client_id = %self.client_id, error = format!("{e:#}"), "Probe failed while draining worker");
                    }
                }
            }
        }
    }

    fn unwrap_outcome(
        client_id: &str,
        joined: std::result::Result<BatchOutcome, tokio::task::JoinError>,
    ) -> BatchOutcome {
        match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                // Offsets registered before the panic still commit; the
                // unregistered remainder will be redelivered.
                error!(client_id = %client_id, error = %e, "Batch worker panicked");
                BatchOutcome::Cancelled { processed: 0 }
            }
        }
    }

    async fn probe(&mut self) -> Result<()> {
        metrics::counter!(LIVENESS_PROBES_COUNTER).increment(1);
        match self.client.probe_liveness().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => {
                Err(anyhow::Error::new(e).context("liveness probe failed"))
            }
            Err(e) => {
                warn!(client_id = %self.client_id, error = %e, "Liveness probe failed, will retry");
                Ok(())
            }
        }
    }

    /// Drain consumed offsets and commit them synchronously. Rejection due
    /// to lost ownership is tolerated; anything else ends this instance.
    async fn commit_pending(&mut self) -> Result<()> {
        let pending = self.tracker.drain_all();
        if pending.is_empty() {
            return Ok(());
        }

        match self.client.commit(&pending).await {
            Ok(()) => {
                metrics::counter!(COMMITS_COUNTER, "result" => "ok", "trigger" => "cycle")
                    .increment(1);
                debug!(
                    client_id = %self.client_id,
                    partitions = pending.len(),
                    "Committed consumed offsets"
                );
                Ok(())
            }
            Err(e @ CommitError::OwnershipLost(_)) => {
                metrics::counter!(COMMITS_COUNTER, "result" => e.error_type(), "trigger" => "cycle")
                    .increment(1);
                warn!(
                    client_id = %self.client_id,
                    error = %e,
                    "Commit rejected after ownership change, new owner re-processes"
                );
                Ok(())
            }
            Err(e) => {
                metrics::counter!(COMMITS_COUNTER, "result" => e.error_type(), "trigger" => "cycle")
                    .increment(1);
                Err(anyhow::Error::new(e).context("offset commit failed"))
            }
        }
    }

    async fn idle_sleep(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.idle_backoff) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    /// Runs on every exit path: no further fetches can happen, the worker
    /// has been joined, so closing the client and publishing `Closed` is
    /// all that is left.
    fn finalize(&mut self) {
        self.state_tx.send_replace(LifecycleState::ShuttingDown);
        if let Err(e) = self.client.close() {
            warn!(client_id = %self.client_id, error = %e, "Error closing client");
        }
        self.state_tx.send_replace(LifecycleState::Closed);
        info!(client_id = %self.client_id, "Consumer closed");
    }
}
