//! Metrics definitions for the cache client.
//!
//! All metrics follow Prometheus naming conventions:
//! - `cache_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! The library only records through the `metrics` facade. Installing an
//! exporter is left to the embedding application.
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `operation`: bounded by store commands (~12 values)
//! - `outcome`: bounded per metric (2-5 values)

use metrics::{counter, histogram};
use std::future::Future;
use std::time::{Duration, Instant};

// ============================================================================
// Store Operation Metrics
// ============================================================================

/// Record store operation latency.
///
/// Metric: `cache_operation_duration_seconds`
/// Labels: `operation`, `status`
///
/// Operations: get, set, del, exists, pexpire, flushdb, publish, lock,
/// unlock, extend, owner
pub fn record_operation(operation: &'static str, status: &'static str, duration: Duration) {
    histogram!("cache_operation_duration_seconds",
        "operation" => operation,
        "status" => status
    )
    .record(duration.as_secs_f64());
}

/// Await `operation_future` and record its latency under `operation`.
pub(crate) async fn timed<T, E, Fut>(operation: &'static str, operation_future: Fut) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    let result = operation_future.await;
    let status = if result.is_ok() { "success" } else { "error" };
    record_operation(operation, status, start.elapsed());
    result
}

// ============================================================================
// Lock Metrics
// ============================================================================

/// Record a lock operation outcome.
///
/// Metric: `cache_lock_attempts_total`
/// Labels: `operation` (lock, unlock, extend), `outcome`
///
/// Outcomes: acquired, contended, released, not_owner, extended, error
pub fn record_lock_attempt(operation: &'static str, outcome: &'static str) {
    counter!("cache_lock_attempts_total",
        "operation" => operation,
        "outcome" => outcome
    )
    .increment(1);
}

// ============================================================================
// Pub/Sub Metrics
// ============================================================================

/// Record a pub/sub message event.
///
/// Metric: `cache_pubsub_messages_total`
/// Labels: `outcome`
///
/// Outcomes: published, delivered, dropped, unrouted, panicked
///
/// Non-zero `dropped` means a channel worker fell behind; `panicked` counts
/// callbacks that panicked during delivery.
pub fn record_pubsub_message(outcome: &'static str) {
    counter!("cache_pubsub_messages_total", "outcome" => outcome).increment(1);
}

// ============================================================================
// Connection Metrics
// ============================================================================

/// Record a connection attempt to one endpoint.
///
/// Metric: `cache_connections_total`
/// Labels: `outcome` (success, error)
pub fn record_connection_attempt(outcome: &'static str) {
    counter!("cache_connections_total", "outcome" => outcome).increment(1);
}
