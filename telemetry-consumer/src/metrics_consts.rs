// ==== Poll loop ====
/// Counter of records pulled from the log
pub const CONSUMER_RECORDS_RECEIVED: &str = "telemetry_consumer_records_received_total";

/// Counter of backend errors, labelled by `level`
pub const CONSUMER_LOG_ERRORS: &str = "telemetry_consumer_log_errors_total";

/// Histogram of records per poll
pub const CONSUMER_POLL_SIZE: &str = "telemetry_consumer_poll_size";

// ==== Partition workers ====
/// Counter of records handled, labelled by `outcome` (ok, error, panic)
pub const WORKER_RECORDS_HANDLED: &str = "telemetry_consumer_records_handled_total";

/// Histogram of time spent waiting for a worker pool permit, in milliseconds
pub const WORKER_PERMIT_WAIT_MS: &str = "telemetry_consumer_permit_wait_ms";

/// Counter of batches routed while the partition channel was full
pub const WORKER_BACKPRESSURE: &str = "telemetry_consumer_worker_backpressure_total";

// ==== Offsets ====
/// Counter of commit attempts, labelled by `outcome`
pub const OFFSET_COMMITS: &str = "telemetry_consumer_offset_commits_total";

/// Counter of commits skipped while a rebalance is in progress
pub const OFFSET_COMMITS_SKIPPED_REBALANCING: &str =
    "telemetry_consumer_offset_commits_skipped_rebalancing_total";

/// Counter of batches marked processed out of order
pub const OFFSET_OUT_OF_ORDER_BATCH: &str = "telemetry_consumer_out_of_order_batches_total";

/// Counter of rebalance events, labelled by `event_type`
pub const REBALANCE_EVENTS: &str = "telemetry_consumer_rebalance_events_total";
