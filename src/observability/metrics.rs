//! Metrics collection using metrics-rs.

use metrics::{Unit, counter};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been described.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const VALIDATION_FAILURES: &str = "peermem_validation_failures";
const TRANSFER_COPIES: &str = "peermem_transfer_copies";
const TRANSFER_BYTES: &str = "peermem_transfer_bytes";
const TRANSFER_BARRIERS: &str = "peermem_transfer_barriers";
const STATE_FLIPS: &str = "peermem_state_flips";
const QUEUE_DRAINS: &str = "peermem_queue_drains";
const STAGING_MAPS: &str = "peermem_staging_maps";

/// How an ownership transfer moved data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Data was copied between the two allocations.
    Copy,
    /// Both sides address the same memory; only synchronization happened.
    Barrier,
}

impl TransferKind {
    fn as_str(self) -> &'static str {
        match self {
            TransferKind::Copy => "copy",
            TransferKind::Barrier => "barrier",
        }
    }
}

/// Describe all metrics.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        VALIDATION_FAILURES,
        Unit::Count,
        "Device memory operations rejected by validation"
    );
    metrics::describe_counter!(
        TRANSFER_COPIES,
        Unit::Count,
        "Ownership transfers that copied data between compute and peer"
    );
    metrics::describe_counter!(
        TRANSFER_BYTES,
        Unit::Bytes,
        "Bytes copied by ownership transfers"
    );
    metrics::describe_counter!(
        TRANSFER_BARRIERS,
        Unit::Count,
        "Ownership transfers performed as a synchronization barrier only"
    );
    metrics::describe_counter!(
        STATE_FLIPS,
        Unit::Count,
        "Ownership changes that needed no transfer"
    );
    metrics::describe_counter!(
        QUEUE_DRAINS,
        Unit::Count,
        "Queue drains issued by ownership transfers"
    );
    metrics::describe_counter!(
        STAGING_MAPS,
        Unit::Count,
        "Maps served through a temporary staging allocation"
    );
}

/// Record an operation rejected by validation.
#[inline]
pub fn record_validation_failure(op: &'static str) {
    counter!(VALIDATION_FAILURES, "op" => op).increment(1);
}

/// Record an ownership transfer.
#[inline]
pub fn record_transfer(backend: &'static str, kind: TransferKind, bytes: usize) {
    match kind {
        TransferKind::Copy => {
            counter!(TRANSFER_COPIES, "backend" => backend).increment(1);
            counter!(TRANSFER_BYTES, "backend" => backend).increment(bytes as u64);
        }
        TransferKind::Barrier => {
            counter!(TRANSFER_BARRIERS, "backend" => backend, "kind" => kind.as_str())
                .increment(1);
        }
    }
}

/// Record an ownership change that did not need a transfer.
#[inline]
pub fn record_state_flip(backend: &'static str) {
    counter!(STATE_FLIPS, "backend" => backend).increment(1);
}

/// Record a queue drain issued by the ownership protocol.
#[inline]
pub fn record_queue_drain(side: &'static str) {
    counter!(QUEUE_DRAINS, "side" => side).increment(1);
}

/// Record a staging-backed map.
#[inline]
pub fn record_staging_map(backend: &'static str, bytes: usize) {
    counter!(STAGING_MAPS, "backend" => backend).increment(1);
    tracing::trace!(backend, bytes, "staging map");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        init_metrics();
        // idempotent
        init_metrics();
    }

    #[test]
    fn test_recording_without_recorder() {
        record_validation_failure("read");
        record_transfer("host", TransferKind::Copy, 64);
        record_transfer("accel", TransferKind::Barrier, 0);
        record_state_flip("host");
        record_queue_drain("peer");
        record_staging_map("accel", 128);
    }

    #[test]
    fn test_transfer_kind_labels() {
        assert_eq!(TransferKind::Copy.as_str(), "copy");
        assert_eq!(TransferKind::Barrier.as_str(), "barrier");
    }
}
