//! Default sizes and backend configuration.
//!
//! These are the values devices use unless a `*Config` overrides them.

use crate::observability::TracingConfig;

/// Smallest resource the host backend allocates. Smaller requests produce
/// an empty result instead of a resource.
pub const HOST_MIN_ALLOCATION: usize = 4;

/// Smallest resource the accelerator backend allocates.
pub const ACCEL_MIN_ALLOCATION: usize = 4;

/// Pattern sizes the host backend fills natively.
///
/// 1/2/4 bytes are the primitive widths; the larger blocks are the
/// vector-register sized patterns. Any other pattern size is tiled into a
/// temporary buffer first.
pub const HOST_NATIVE_FILL_BLOCKS: &[usize] = &[1, 2, 4, 8, 16, 32, 64, 128];

/// Pattern sizes the accelerator driver fills natively (8/16/32-bit memset).
pub const ACCEL_NATIVE_FILL_BLOCKS: &[usize] = &[1, 2, 4];

/// Standard page size assumed for staging allocations.
pub const PAGE_SIZE: usize = 4096;

/// Round `size` up to a whole number of pages.
pub const fn page_align(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Configuration of the host (CPU-resident) backend.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Minimum allocation granularity in bytes.
    pub min_allocation: usize,
    /// Debug name prefix of the memfd backing stores.
    pub segment_name: String,
    /// Span emission for creation and ownership transfers.
    pub tracing: TracingConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            min_allocation: HOST_MIN_ALLOCATION,
            segment_name: "peermem-host".to_string(),
            tracing: TracingConfig::default(),
        }
    }
}

/// Configuration of the accelerator backend.
#[derive(Debug, Clone)]
pub struct AccelConfig {
    /// Minimum allocation granularity in bytes.
    pub min_allocation: usize,
    /// Import peer memory when the driver supports it. When disabled, or
    /// when the driver lacks support, shared resources keep a private
    /// allocation and transfers copy.
    pub import_peer_memory: bool,
    /// Import the peer's semaphore when both sides support it.
    pub import_peer_semaphore: bool,
    /// Span emission for creation and ownership transfers.
    pub tracing: TracingConfig,
}

impl Default for AccelConfig {
    fn default() -> Self {
        Self {
            min_allocation: ACCEL_MIN_ALLOCATION,
            import_peer_memory: true,
            import_peer_semaphore: true,
            tracing: TracingConfig::default(),
        }
    }
}
