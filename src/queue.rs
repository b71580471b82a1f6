//! Queue and device contracts.
//!
//! Queues are owned by the application; every device memory operation is
//! submitted to one. Ordering within a queue is submission order. `finish`
//! is the only blocking call.

use crate::error::{Error, Result};
use crate::flags::PeerApi;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter for generating device identities.
static DEVICE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Global counter for generating queue identities.
static QUEUE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identity of a device (execution context) within this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u64);

impl DeviceId {
    /// Allocate a fresh device identity.
    pub fn next() -> Self {
        Self(DEVICE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value.
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Opaque queue handle, unique per queue within this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle(u64);

impl QueueHandle {
    /// Allocate a fresh queue handle.
    pub fn next() -> Self {
        Self(QUEUE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value.
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Which backend a device or queue belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// CPU-resident compute backend.
    Host,
    /// Discrete accelerator compute backend.
    Accelerator,
    /// Vulkan render backend (peer).
    Vulkan,
    /// Metal render backend (peer).
    Metal,
}

impl BackendKind {
    /// Short name used in logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Host => "host",
            BackendKind::Accelerator => "accel",
            BackendKind::Vulkan => "vulkan",
            BackendKind::Metal => "metal",
        }
    }
}

impl From<PeerApi> for BackendKind {
    fn from(api: PeerApi) -> Self {
        match api {
            PeerApi::Vulkan => BackendKind::Vulkan,
            PeerApi::Metal => BackendKind::Metal,
        }
    }
}

/// A device: identifies the backend and context resources belong to.
pub trait Device: Send + Sync {
    /// Device identity.
    fn id(&self) -> DeviceId;

    /// Backend this device belongs to.
    fn backend(&self) -> BackendKind;

    /// Human-readable name.
    fn name(&self) -> &str;
}

/// An ordered submission channel of one backend.
pub trait Queue: Send + Sync {
    /// Block until all previously submitted work has completed.
    fn finish(&self) -> Result<()>;

    /// Submit any batched work without waiting for it.
    fn flush(&self) -> Result<()>;

    /// Backend-unique handle of this queue.
    fn queue_handle(&self) -> QueueHandle;

    /// Identity of the device this queue submits to.
    fn device_id(&self) -> DeviceId;

    /// Backend this queue belongs to.
    fn backend(&self) -> BackendKind;
}

/// Check that a queue passed to a sharing call is a compute queue of the
/// expected backend and device. Only performed in debug builds.
pub(crate) fn check_compute_queue(
    queue: &dyn Queue,
    backend: BackendKind,
    device: DeviceId,
) -> Result<()> {
    if cfg!(debug_assertions) {
        if queue.backend() != backend {
            return Err(Error::SharingProtocol(format!(
                "specified queue is not a {} compute queue (got {})",
                backend.as_str(),
                queue.backend().as_str()
            )));
        }
        if queue.device_id() != device {
            return Err(Error::SharingProtocol(
                "specified queue belongs to another device".into(),
            ));
        }
    }
    Ok(())
}

/// Check that a queue passed as the peer queue belongs to the peer API.
/// Only performed in debug builds.
pub(crate) fn check_peer_queue(queue: &dyn Queue, api: PeerApi) -> Result<()> {
    if cfg!(debug_assertions) && queue.backend() != BackendKind::from(api) {
        return Err(Error::SharingProtocol(format!(
            "specified queue is not a {api} queue (got {})",
            queue.backend().as_str()
        )));
    }
    Ok(())
}
