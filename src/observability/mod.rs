//! Observability: metrics and tracing for device memory operations.
//!
//! - **Metrics**: counters via `metrics-rs`
//! - **Tracing**: structured events and spans via `tracing`
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `peermem_validation_failures` | Counter | Operations rejected by validation |
//! | `peermem_transfer_copies` | Counter | Ownership transfers that copied data |
//! | `peermem_transfer_bytes` | Counter | Bytes copied by ownership transfers |
//! | `peermem_transfer_barriers` | Counter | Ownership transfers done as a pure barrier |
//! | `peermem_state_flips` | Counter | Ownership changes without any transfer |
//! | `peermem_queue_drains` | Counter | Queue drains issued by ownership transfers |
//! | `peermem_staging_maps` | Counter | Maps served through a staging allocation |
//!
//! ## Example
//!
//! ```rust,ignore
//! use peermem::observability::init_metrics;
//!
//! // Describe metrics once at startup, then install any metrics exporter.
//! init_metrics();
//! ```

mod metrics;
mod tracing_support;

pub use metrics::{
    TransferKind, init_metrics, record_queue_drain, record_staging_map, record_state_flip,
    record_transfer, record_validation_failure,
};
pub use tracing_support::{TracingConfig, span_create, span_transfer, trace_transition};
