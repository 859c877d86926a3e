// ==== Consumer loop metrics ====
/// Counter for records handed to the record handler
pub const RECORDS_PROCESSED_COUNTER: &str = "batch_consumer_records_processed_total";

/// Counter for records skipped after a handler failure
pub const RECORDS_SKIPPED_COUNTER: &str = "batch_consumer_records_skipped_total";

/// Counter for batches dispatched to the processing worker
pub const BATCHES_DISPATCHED_COUNTER: &str = "batch_consumer_batches_dispatched_total";

/// Counter for batches cancelled before completion
pub const BATCHES_CANCELLED_COUNTER: &str = "batch_consumer_batches_cancelled_total";

/// Histogram for wall-clock batch processing time
pub const BATCH_DURATION_HISTOGRAM: &str = "batch_consumer_batch_duration_seconds";

/// Histogram for records per fetched batch
pub const BATCH_SIZE_HISTOGRAM: &str = "batch_consumer_batch_size";

/// Counter for fetches that returned no records
pub const EMPTY_FETCHES_COUNTER: &str = "batch_consumer_empty_fetches_total";

/// Counter for zero-duration liveness probes issued while a batch was in flight
pub const LIVENESS_PROBES_COUNTER: &str = "batch_consumer_liveness_probes_total";

// ==== Offset and commit metrics ====
/// Counter for offset commits, labelled by result
pub const COMMITS_COUNTER: &str = "batch_consumer_commits_total";

/// Gauge for partitions with consumed-but-uncommitted offsets
pub const PENDING_OFFSET_PARTITIONS_GAUGE: &str = "batch_consumer_pending_offset_partitions";

// ==== Rebalance metrics ====
/// Counter for partition revocation callbacks
pub const REBALANCE_REVOCATIONS_COUNTER: &str = "batch_consumer_rebalance_revocations_total";

/// Counter for partition assignment callbacks
pub const REBALANCE_ASSIGNMENTS_COUNTER: &str = "batch_consumer_rebalance_assignments_total";

/// Gauge for partitions currently owned by this instance
pub const ASSIGNED_PARTITIONS_GAUGE: &str = "batch_consumer_assigned_partitions";
