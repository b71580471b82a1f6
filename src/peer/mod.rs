//! Peer (render) backends.
//!
//! A peer is the render-side half of a shared resource. The compute side
//! only needs a narrow contract from it: blocking reads and writes for the
//! copy path, and exportable memory and semaphores for the import path.
//!
//! # Backends
//!
//! - [`soft`]: memfd + eventfd software peer, usable for either API tag
//! - `vulkan` (feature `vulkan`): exportable Vulkan buffer memory via ash

pub mod soft;
#[cfg(feature = "vulkan")]
pub mod vulkan;

use crate::error::{Error, Result};
use crate::flags::{MemoryFlags, PeerApi};
use crate::memory::{BufferDesc, Ownership};
use crate::queue::Queue;
use std::ops::Deref;
use std::os::fd::OwnedFd;
use std::sync::Arc;

/// Memory exported by a peer as a file descriptor.
#[derive(Debug)]
pub struct ExternalMemory {
    /// Opaque fd referring to the peer's allocation.
    pub fd: OwnedFd,
    /// Size of the exported allocation in bytes.
    pub size: usize,
}

/// A peer semaphore exported as a file descriptor.
#[derive(Debug)]
pub struct ExternalSemaphore {
    /// Opaque fd referring to the semaphore.
    pub fd: OwnedFd,
}

/// One resource of a peer API.
pub trait PeerBuffer: Send + Sync {
    /// API this resource belongs to.
    fn api(&self) -> PeerApi;

    /// Size in bytes.
    fn size(&self) -> usize;

    /// Blocking read of `dst.len()` bytes at `offset`.
    fn read(&self, dst: &mut [u8], offset: usize) -> Result<()>;

    /// Blocking write of `src` at `offset`.
    fn write(&self, src: &[u8], offset: usize) -> Result<()>;

    /// Export the backing memory, if the peer supports it.
    fn export_memory(&self) -> Result<Option<ExternalMemory>>;

    /// Export the resource's semaphore, if the peer supports it.
    fn export_semaphore(&self) -> Result<Option<ExternalSemaphore>>;

    /// Signal the semaphore once the peer work submitted to `queue` is done.
    fn signal_semaphore(&self, queue: &dyn Queue) -> Result<()>;

    /// Make `queue` wait for the semaphore before running further work.
    fn wait_semaphore(&self, queue: &dyn Queue) -> Result<()>;

    /// The queue the resource was created on.
    fn queue(&self) -> &dyn Queue;
}

/// Creates peer resources for one API.
pub trait PeerBackend: Send + Sync {
    /// API of the created resources.
    fn api(&self) -> PeerApi;

    /// Queue new resources are created on when the caller has none.
    fn default_queue(&self) -> Arc<dyn Queue>;

    /// Create a resource of `size` bytes, initialized from `host_data`.
    fn create_buffer(
        &self,
        queue: Arc<dyn Queue>,
        size: usize,
        host_data: Option<&[u8]>,
        flags: MemoryFlags,
    ) -> Result<Box<dyn PeerBuffer>>;
}

/// How a compute resource holds its peer.
pub enum PeerHandle {
    /// Created by the compute resource and destroyed with it.
    Owned(Box<dyn PeerBuffer>),
    /// Supplied by the caller; only our reference is released.
    Wrapped(Arc<dyn PeerBuffer>),
}

impl PeerHandle {
    /// Was the peer created by the compute resource?
    pub fn is_owned(&self) -> bool {
        matches!(self, PeerHandle::Owned(_))
    }
}

impl Deref for PeerHandle {
    type Target = dyn PeerBuffer;

    fn deref(&self) -> &Self::Target {
        match self {
            PeerHandle::Owned(buffer) => buffer.as_ref(),
            PeerHandle::Wrapped(buffer) => buffer.as_ref(),
        }
    }
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_owned() { "Owned" } else { "Wrapped" };
        f.debug_struct(kind)
            .field("api", &self.api())
            .field("size", &self.size())
            .finish()
    }
}

/// The peer of a shared resource, tagged by sharing target.
#[derive(Debug)]
pub enum SharedPeer {
    /// Shared with a Vulkan resource.
    Vulkan(PeerHandle),
    /// Shared with a Metal resource.
    Metal(PeerHandle),
}

impl SharedPeer {
    pub(crate) fn new(api: PeerApi, handle: PeerHandle) -> Self {
        match api {
            PeerApi::Vulkan => SharedPeer::Vulkan(handle),
            PeerApi::Metal => SharedPeer::Metal(handle),
        }
    }

    /// The sharing target.
    pub fn api(&self) -> PeerApi {
        match self {
            SharedPeer::Vulkan(_) => PeerApi::Vulkan,
            SharedPeer::Metal(_) => PeerApi::Metal,
        }
    }

    /// The handle, whatever the target.
    pub fn handle(&self) -> &PeerHandle {
        match self {
            SharedPeer::Vulkan(handle) | SharedPeer::Metal(handle) => handle,
        }
    }

    /// The peer resource itself.
    pub fn buffer(&self) -> &dyn PeerBuffer {
        self.handle().deref()
    }
}

/// Peer backends a compute device can share with, one per API.
#[derive(Clone, Default)]
pub struct PeerBackends {
    vulkan: Option<Arc<dyn PeerBackend>>,
    metal: Option<Arc<dyn PeerBackend>>,
}

impl PeerBackends {
    /// Register `backend` for its API, replacing any previous one.
    pub fn register(&mut self, backend: Arc<dyn PeerBackend>) {
        match backend.api() {
            PeerApi::Vulkan => self.vulkan = Some(backend),
            PeerApi::Metal => self.metal = Some(backend),
        }
    }

    /// The backend registered for `api`.
    pub fn get(&self, api: PeerApi) -> Option<&Arc<dyn PeerBackend>> {
        match api {
            PeerApi::Vulkan => self.vulkan.as_ref(),
            PeerApi::Metal => self.metal.as_ref(),
        }
    }
}

impl std::fmt::Debug for PeerBackends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerBackends")
            .field("vulkan", &self.vulkan.is_some())
            .field("metal", &self.metal.is_some())
            .finish()
    }
}

/// Create or adopt the peer of a new shared resource.
///
/// Returns the peer and the initial owner: `Compute` for a created peer
/// (initialized with `initial`), `Peer` for a wrapped one.
pub(crate) fn attach_peer(
    backends: &PeerBackends,
    api: PeerApi,
    desc: &BufferDesc<'_>,
    initial: Option<&[u8]>,
) -> Result<(SharedPeer, Ownership)> {
    let backend = backends.get(api).ok_or_else(|| {
        Error::UnsupportedConfiguration(format!("no {api} peer backend registered"))
    })?;

    match &desc.peer {
        Some(peer) => {
            if peer.api() != api {
                return Err(Error::UnsupportedConfiguration(format!(
                    "resource shares with {api} but the supplied peer is a {} resource",
                    peer.api()
                )));
            }
            if peer.size() < desc.size {
                return Err(Error::Import(format!(
                    "peer holds {} bytes, resource needs {}",
                    peer.size(),
                    desc.size
                )));
            }
            if desc.host_data.is_some() {
                tracing::warn!(%api, "host data ignored when wrapping an existing peer");
            }
            let handle = PeerHandle::Wrapped(Arc::clone(peer));
            Ok((SharedPeer::new(api, handle), Ownership::Peer))
        }
        None => {
            let buffer = backend.create_buffer(
                backend.default_queue(),
                desc.size,
                initial,
                desc.flags.peer_flags(),
            )?;
            tracing::debug!(%api, size = desc.size, "created peer resource");
            Ok((SharedPeer::new(api, PeerHandle::Owned(buffer)), Ownership::Compute))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::soft::SoftPeerBackend;
    use super::*;

    fn backends() -> PeerBackends {
        let mut backends = PeerBackends::default();
        backends.register(Arc::new(SoftPeerBackend::new(PeerApi::Vulkan)));
        backends
    }

    #[test]
    fn test_registry() {
        let backends = backends();
        assert!(backends.get(PeerApi::Vulkan).is_some());
        assert!(backends.get(PeerApi::Metal).is_none());
    }

    #[test]
    fn test_attach_creates_owned_peer() {
        let data = [5u8; 8];
        let desc = BufferDesc::new(16, MemoryFlags::READ_WRITE | MemoryFlags::VULKAN_SHARING)
            .with_host_data(&data);
        let (peer, ownership) =
            attach_peer(&backends(), PeerApi::Vulkan, &desc, desc.initial_data()).unwrap();
        assert_eq!(ownership, Ownership::Compute);
        assert_eq!(peer.api(), PeerApi::Vulkan);
        assert!(peer.handle().is_owned());

        let mut out = [0u8; 16];
        peer.buffer().read(&mut out, 0).unwrap();
        assert_eq!(&out[..8], &data);
        assert_eq!(&out[8..], &[0; 8]);
    }

    #[test]
    fn test_attach_missing_backend() {
        let desc = BufferDesc::new(16, MemoryFlags::READ_WRITE | MemoryFlags::METAL_SHARING);
        assert!(matches!(
            attach_peer(&backends(), PeerApi::Metal, &desc, None),
            Err(Error::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn test_attach_wraps_peer() {
        let backend = SoftPeerBackend::new(PeerApi::Vulkan);
        let existing: Arc<dyn PeerBuffer> = backend
            .create_buffer(backend.default_queue(), 32, None, MemoryFlags::READ_WRITE)
            .unwrap()
            .into();

        let desc = BufferDesc::new(16, MemoryFlags::READ_WRITE | MemoryFlags::VULKAN_SHARING)
            .with_peer(Arc::clone(&existing));
        let (peer, ownership) =
            attach_peer(&backends(), PeerApi::Vulkan, &desc, desc.initial_data()).unwrap();
        assert_eq!(ownership, Ownership::Peer);
        assert!(!peer.handle().is_owned());
        drop(peer);
        assert_eq!(Arc::strong_count(&existing), 1);
    }

    #[test]
    fn test_attach_rejects_small_peer() {
        let backend = SoftPeerBackend::new(PeerApi::Vulkan);
        let small: Arc<dyn PeerBuffer> = backend
            .create_buffer(backend.default_queue(), 8, None, MemoryFlags::READ_WRITE)
            .unwrap()
            .into();
        let desc = BufferDesc::new(16, MemoryFlags::READ_WRITE | MemoryFlags::VULKAN_SHARING)
            .with_peer(small);
        assert!(matches!(
            attach_peer(&backends(), PeerApi::Vulkan, &desc, None),
            Err(Error::Import(_))
        ));
    }

    #[test]
    fn test_attach_rejects_api_mismatch() {
        let metal = SoftPeerBackend::new(PeerApi::Metal);
        let peer: Arc<dyn PeerBuffer> = metal
            .create_buffer(metal.default_queue(), 16, None, MemoryFlags::READ_WRITE)
            .unwrap()
            .into();
        let desc = BufferDesc::new(16, MemoryFlags::READ_WRITE | MemoryFlags::VULKAN_SHARING)
            .with_peer(peer);
        assert!(matches!(
            attach_peer(&backends(), PeerApi::Vulkan, &desc, None),
            Err(Error::UnsupportedConfiguration(_))
        ));
    }
}
