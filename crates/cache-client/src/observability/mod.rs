//! Observability for the cache client.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit field
//! allow-listing; keys, values and payloads are never recorded as fields.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `cache_operation_duration_seconds` | Histogram | `operation`, `status` | Store command latency |
//! | `cache_lock_attempts_total` | Counter | `operation`, `outcome` | Lock acquire/release/extend outcomes |
//! | `cache_pubsub_messages_total` | Counter | `outcome` | Published, delivered and dropped messages |
//! | `cache_connections_total` | Counter | `outcome` | Endpoint connection attempts |

pub mod metrics;

pub(crate) use metrics::timed;
pub use metrics::{
    record_connection_attempt, record_lock_attempt, record_operation, record_pubsub_message,
};
