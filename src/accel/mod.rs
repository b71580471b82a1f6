//! Discrete accelerator compute backend.
//!
//! Resources are device allocations behind a [`Driver`]. Copies and fills
//! are enqueued on the queue's stream and complete asynchronously;
//! `read`, `write`, `map` and `unmap` synchronize before returning.
//!
//! When the driver can import external memory, a shared resource aliases
//! its peer's allocation and ownership transfers become barriers. Otherwise
//! it keeps a private allocation and transfers copy.
//!
//! # Example
//!
//! ```rust,ignore
//! use peermem::accel::{AccelBuffer, AccelDevice, EmulatedDriver};
//!
//! let device = Arc::new(AccelDevice::new(
//!     Arc::new(EmulatedDriver::new()),
//!     AccelConfig::default(),
//! ));
//! let queue = device.create_queue()?;
//! let buffer = AccelBuffer::new(&queue, BufferDesc::new(1024, flags))?.unwrap();
//! buffer.fill(&queue, &[0, 0, 0x80, 0x3f], 0, 0)?;
//! queue.finish()?;
//! ```

mod buffer;
mod driver;
mod emulated;

pub use buffer::AccelBuffer;
pub use driver::{DevicePtr, Driver, DriverCapabilities, SemaphoreHandle, StreamId};
pub use emulated::{DriverStats, EmulatedDriver};

use crate::defaults::AccelConfig;
use crate::error::Result;
use crate::peer::{PeerBackend, PeerBackends};
use crate::queue::{BackendKind, Device, DeviceId, Queue, QueueHandle};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// An accelerator compute device.
pub struct AccelDevice {
    id: DeviceId,
    name: String,
    driver: Arc<dyn Driver>,
    config: AccelConfig,
    peers: PeerBackends,
}

impl AccelDevice {
    /// Create a device on `driver` without peer backends.
    pub fn new(driver: Arc<dyn Driver>, config: AccelConfig) -> Self {
        let name = format!("accel:{}", driver.name());
        Self {
            id: DeviceId::next(),
            name,
            driver,
            config,
            peers: PeerBackends::default(),
        }
    }

    /// Register a peer backend resources of this device can share with.
    pub fn with_peer(mut self, backend: Arc<dyn PeerBackend>) -> Self {
        self.peers.register(backend);
        self
    }

    /// The driver.
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Device configuration.
    pub fn config(&self) -> &AccelConfig {
        &self.config
    }

    /// Registered peer backends.
    pub fn peers(&self) -> &PeerBackends {
        &self.peers
    }

    /// Create a queue backed by a new driver stream.
    pub fn create_queue(self: &Arc<Self>) -> Result<AccelQueue> {
        let stream = self.driver.create_stream()?;
        tracing::trace!(stream = stream.0, device = %self.name, "created accelerator stream");
        Ok(AccelQueue {
            inner: Arc::new(QueueInner {
                handle: QueueHandle::next(),
                device: Arc::clone(self),
                stream,
                finishes: AtomicU64::new(0),
                flushes: AtomicU64::new(0),
            }),
        })
    }
}

impl Device for AccelDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Accelerator
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for AccelDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelDevice")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("capabilities", &self.driver.capabilities())
            .field("config", &self.config)
            .field("peers", &self.peers)
            .finish()
    }
}

#[derive(Debug)]
struct QueueInner {
    handle: QueueHandle,
    device: Arc<AccelDevice>,
    stream: StreamId,
    finishes: AtomicU64,
    flushes: AtomicU64,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        if let Err(e) = self.device.driver.destroy_stream(self.stream) {
            tracing::warn!(stream = self.stream.0, error = %e, "failed to destroy accelerator stream");
        }
    }
}

/// An accelerator queue: one driver stream. Clones refer to the same
/// stream, which is destroyed with the last clone.
#[derive(Debug, Clone)]
pub struct AccelQueue {
    inner: Arc<QueueInner>,
}

impl AccelQueue {
    /// The device this queue submits to.
    pub fn device(&self) -> &Arc<AccelDevice> {
        &self.inner.device
    }

    /// The driver stream.
    pub fn stream(&self) -> StreamId {
        self.inner.stream
    }

    pub(crate) fn driver(&self) -> &dyn Driver {
        self.inner.device.driver.as_ref()
    }

    /// Number of `finish` calls so far.
    pub fn finish_count(&self) -> u64 {
        self.inner.finishes.load(Ordering::Relaxed)
    }

    /// Number of `flush` calls so far.
    pub fn flush_count(&self) -> u64 {
        self.inner.flushes.load(Ordering::Relaxed)
    }
}

impl Queue for AccelQueue {
    fn finish(&self) -> Result<()> {
        self.inner.finishes.fetch_add(1, Ordering::Relaxed);
        self.driver().synchronize(self.inner.stream)
    }

    fn flush(&self) -> Result<()> {
        // Driver streams start work at enqueue time.
        self.inner.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn queue_handle(&self) -> QueueHandle {
        self.inner.handle
    }

    fn device_id(&self) -> DeviceId {
        self.inner.device.id
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Accelerator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> (Arc<EmulatedDriver>, Arc<AccelDevice>) {
        let driver = Arc::new(EmulatedDriver::new());
        let device = Arc::new(AccelDevice::new(driver.clone(), AccelConfig::default()));
        (driver, device)
    }

    #[test]
    fn test_device_identity() {
        let (_, device) = device();
        assert_eq!(device.backend(), BackendKind::Accelerator);
        assert_eq!(device.name(), "accel:emulated");
    }

    #[test]
    fn test_queue_owns_stream() {
        let (driver, device) = device();
        let queue = device.create_queue().unwrap();
        let clone = queue.clone();
        assert_eq!(driver.live_streams(), 1);

        clone.finish().unwrap();
        assert_eq!(queue.finish_count(), 1);
        assert_eq!(driver.stats().synchronizations, 1);

        drop(queue);
        assert_eq!(driver.live_streams(), 1);
        drop(clone);
        assert_eq!(driver.live_streams(), 0);
    }

    #[test]
    fn test_queues_are_distinct_streams() {
        let (_, device) = device();
        let a = device.create_queue().unwrap();
        let b = device.create_queue().unwrap();
        assert_ne!(a.stream(), b.stream());
        assert_ne!(a.queue_handle(), b.queue_handle());
        assert_eq!(a.device_id(), b.device_id());
    }
}
