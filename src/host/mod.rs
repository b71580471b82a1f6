//! CPU-resident compute backend.
//!
//! Resources live in memfd host segments (or caller memory). Every
//! operation runs synchronously on the calling thread, so the queue only
//! orders and counts.
//!
//! # Example
//!
//! ```rust,ignore
//! use peermem::host::{HostBuffer, HostDevice};
//! use peermem::peer::soft::SoftPeerBackend;
//!
//! let device = Arc::new(
//!     HostDevice::new(HostConfig::default())
//!         .with_peer(Arc::new(SoftPeerBackend::new(PeerApi::Vulkan))),
//! );
//! let queue = device.create_queue();
//! let flags = MemoryFlags::READ_WRITE | MemoryFlags::HOST_READ_WRITE | MemoryFlags::VULKAN_SHARING;
//! let buffer = HostBuffer::new(&queue, BufferDesc::new(1024, flags))?.unwrap();
//! buffer.release_peer(None, None)?;
//! ```

mod buffer;

pub use buffer::HostBuffer;

use crate::defaults::HostConfig;
use crate::error::Result;
use crate::peer::{PeerBackend, PeerBackends};
use crate::queue::{BackendKind, Device, DeviceId, Queue, QueueHandle};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A host compute device.
#[derive(Debug)]
pub struct HostDevice {
    id: DeviceId,
    name: String,
    config: HostConfig,
    peers: PeerBackends,
}

impl HostDevice {
    /// Create a device without peer backends.
    pub fn new(config: HostConfig) -> Self {
        Self {
            id: DeviceId::next(),
            name: "host".to_string(),
            config,
            peers: PeerBackends::default(),
        }
    }

    /// Register a peer backend resources of this device can share with.
    pub fn with_peer(mut self, backend: Arc<dyn PeerBackend>) -> Self {
        self.peers.register(backend);
        self
    }

    /// Device configuration.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Registered peer backends.
    pub fn peers(&self) -> &PeerBackends {
        &self.peers
    }

    /// Create a queue on this device.
    pub fn create_queue(self: &Arc<Self>) -> HostQueue {
        HostQueue {
            inner: Arc::new(QueueInner {
                handle: QueueHandle::next(),
                device: Arc::clone(self),
                finishes: AtomicU64::new(0),
                flushes: AtomicU64::new(0),
            }),
        }
    }
}

impl Device for HostDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Host
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug)]
struct QueueInner {
    handle: QueueHandle,
    device: Arc<HostDevice>,
    finishes: AtomicU64,
    flushes: AtomicU64,
}

/// A host queue. Clones refer to the same queue.
#[derive(Debug, Clone)]
pub struct HostQueue {
    inner: Arc<QueueInner>,
}

impl HostQueue {
    /// The device this queue submits to.
    pub fn device(&self) -> &Arc<HostDevice> {
        &self.inner.device
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

impl Queue for HostQueue {
    fn finish(&self) -> Result<()> {
        self.inner.finishes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
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
        BackendKind::Host
    }
}
