//! Device memory resources.
//!
//! A device memory resource is a fixed-size linear allocation owned by one
//! compute backend, optionally shared with a peer (render) API.
//!
//! # Architecture
//!
//! - [`DeviceMemory`]: the operation surface every buffer backend provides
//! - [`BufferDesc`]: constructor input (size, flags, initial data, peer)
//! - [`Ownership`] / [`SyncPolicy`]: the ownership-transfer protocol
//! - [`MemorySegment`]: host-addressable backing stores (memfd, mapped fd,
//!   caller memory)
//!
//! # Example
//!
//! ```rust,ignore
//! use peermem::prelude::*;
//!
//! let device = HostDevice::new(HostConfig::default());
//! let queue = device.create_queue();
//! let flags = MemoryFlags::READ_WRITE | MemoryFlags::HOST_READ_WRITE;
//! let buffer = HostBuffer::new(&queue, BufferDesc::new(16, flags))?
//!     .expect("above minimum size");
//!
//! buffer.fill(&queue, &[0xAB], 0, 0)?;
//! let bytes = buffer.read_vec(&queue, 0, 0)?;
//! ```

mod segment;
mod staging;
mod transfer;

pub use segment::{ForeignSegment, HostSegment, MappedSegment, MemorySegment, SegmentKind};
pub use transfer::{Ownership, SyncPolicy};

pub(crate) use staging::{StagingMap, StagingRegistry};
pub(crate) use transfer::{SharingState, drain_both};

use crate::error::Result;
use crate::flags::{MapFlags, MemoryFlags};
use crate::peer::{PeerBuffer, SharedPeer};
use crate::queue::Queue;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lock a mutex, ignoring poisoning.
///
/// The guarded data is either `()` or plain state that stays consistent
/// across a panicking holder.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Constructor input shared by every buffer backend.
#[derive(Clone)]
pub struct BufferDesc<'a> {
    /// Size in bytes. Fixed for the lifetime of the resource.
    pub size: usize,
    /// Access, lifecycle and sharing flags.
    pub flags: MemoryFlags,
    /// Initial contents. `min(len, size)` bytes are copied in unless
    /// `NO_INITIAL_COPY` is set.
    pub host_data: Option<&'a [u8]>,
    /// Existing peer resource to wrap instead of creating one.
    pub peer: Option<Arc<dyn PeerBuffer>>,
}

impl<'a> BufferDesc<'a> {
    /// A resource of `size` bytes with `flags` and no initial data.
    pub fn new(size: usize, flags: MemoryFlags) -> Self {
        Self {
            size,
            flags,
            host_data: None,
            peer: None,
        }
    }

    /// Initial contents.
    pub fn with_host_data(mut self, data: &'a [u8]) -> Self {
        self.host_data = Some(data);
        self
    }

    /// Wrap an existing peer resource.
    pub fn with_peer(mut self, peer: Arc<dyn PeerBuffer>) -> Self {
        self.peer = Some(peer);
        self
    }

    /// The initial data that should actually be copied in.
    pub(crate) fn initial_data(&self) -> Option<&'a [u8]> {
        if self.flags.contains(MemoryFlags::NO_INITIAL_COPY) {
            return None;
        }
        self.host_data
            .filter(|data| !data.is_empty())
            .map(|data| &data[..data.len().min(self.size)])
    }
}

impl std::fmt::Debug for BufferDesc<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferDesc")
            .field("size", &self.size)
            .field("flags", &self.flags)
            .field("host_data", &self.host_data.map(<[u8]>::len))
            .field("peer", &self.peer.as_ref().map(|p| p.api()))
            .finish()
    }
}

/// Size, flags and sharing state common to every resource.
#[derive(Debug)]
pub(crate) struct MemoryInfo {
    pub(crate) size: usize,
    pub(crate) flags: MemoryFlags,
    pub(crate) sharing: Option<SharingState>,
}

impl MemoryInfo {
    pub(crate) fn new(size: usize, flags: MemoryFlags, sharing: Option<SharingState>) -> Self {
        Self {
            size,
            flags,
            sharing,
        }
    }

    /// The sharing state, or `NotShared` for unshared resources.
    pub(crate) fn sharing(&self, op: &'static str) -> Result<&SharingState> {
        match &self.sharing {
            Some(state) => Ok(state),
            None => crate::validate::reject(op, crate::error::ValidationError::NotShared),
        }
    }
}

/// Operations every device buffer supports.
///
/// All data operations validate their arguments first (see
/// [`crate::validate`]); a rejected operation returns
/// [`Error::Validation`](crate::Error::Validation) and performs no work.
///
/// `read`, `write`, `map` and `unmap` complete before returning. `copy`,
/// `fill` and `zero` may complete asynchronously on the queue.
pub trait DeviceMemory: Send + Sync {
    /// The compute queue type of this backend.
    type Queue: Queue;

    /// Size in bytes.
    fn size(&self) -> usize;

    /// Flags the resource was created with.
    fn flags(&self) -> MemoryFlags;

    /// Copy `dst.len()` bytes starting at `offset` into `dst`.
    fn read(&self, queue: &Self::Queue, dst: &mut [u8], offset: usize) -> Result<()>;

    /// Read `size` bytes at `offset` into a new vector. `size == 0` reads
    /// the whole resource.
    fn read_vec(&self, queue: &Self::Queue, size: usize, offset: usize) -> Result<Vec<u8>> {
        let len = if size == 0 { self.size() } else { size };
        let mut out = vec![0u8; len];
        self.read(queue, &mut out, offset)?;
        Ok(out)
    }

    /// Copy `src` into the resource at `offset`.
    fn write(&self, queue: &Self::Queue, src: &[u8], offset: usize) -> Result<()>;

    /// Copy `size` bytes from `src` at `src_offset` to `dst_offset`.
    ///
    /// `size == 0` copies `min(src.size(), self.size())` bytes. Overlapping
    /// ranges of the same resource behave like `memmove`.
    fn copy(
        &self,
        queue: &Self::Queue,
        src: &Self,
        size: usize,
        src_offset: usize,
        dst_offset: usize,
    ) -> Result<()>
    where
        Self: Sized;

    /// Repeat `pattern` over `size` bytes at `offset`. `size == 0` fills the
    /// whole resource.
    fn fill(&self, queue: &Self::Queue, pattern: &[u8], size: usize, offset: usize) -> Result<()>;

    /// Zero the whole resource.
    fn zero(&self, queue: &Self::Queue) -> Result<()> {
        let pattern: &[u8] = if self.size() % 4 == 0 { &[0; 4] } else { &[0] };
        self.fill(queue, pattern, 0, 0)
    }

    /// Map `size` bytes at `offset` for host access.
    ///
    /// `size == 0` maps from `offset` to the end of the resource. The
    /// returned pointer stays valid until the matching [`unmap`](Self::unmap).
    fn map(
        &self,
        queue: &Self::Queue,
        flags: MapFlags,
        size: usize,
        offset: usize,
    ) -> Result<NonNull<u8>>;

    /// Release a pointer returned by [`map`](Self::map), writing back any
    /// modifications the map flags announced.
    fn unmap(&self, queue: &Self::Queue, ptr: NonNull<u8>) -> Result<()>;

    /// Create a resource with the same size and flags, optionally copying
    /// the contents. Sharing resources get a freshly created peer.
    fn try_clone(&self, queue: &Self::Queue, copy_contents: bool) -> Result<Option<Self>>
    where
        Self: Sized;

    /// The peer this resource shares its memory with.
    fn shared_peer(&self) -> Option<&SharedPeer>;

    /// Current owner of a shared resource.
    fn ownership(&self) -> Option<Ownership>;

    /// Move ownership from the peer to compute.
    fn acquire_peer(
        &self,
        queue: Option<&Self::Queue>,
        peer_queue: Option<&dyn Queue>,
    ) -> Result<()>;

    /// Move ownership from compute to the peer.
    fn release_peer(
        &self,
        queue: Option<&Self::Queue>,
        peer_queue: Option<&dyn Queue>,
    ) -> Result<()>;

    /// Publish compute's contents to the peer while keeping ownership.
    fn sync_peer(&self, queue: Option<&Self::Queue>, peer_queue: Option<&dyn Queue>)
    -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_data_clamped_to_size() {
        let data = [1u8; 32];
        let desc = BufferDesc::new(8, MemoryFlags::READ).with_host_data(&data);
        assert_eq!(desc.initial_data().map(<[u8]>::len), Some(8));
    }

    #[test]
    fn test_initial_data_skipped() {
        let data = [1u8; 4];
        let desc = BufferDesc::new(8, MemoryFlags::READ | MemoryFlags::NO_INITIAL_COPY)
            .with_host_data(&data);
        assert!(desc.initial_data().is_none());

        let empty: [u8; 0] = [];
        let desc = BufferDesc::new(8, MemoryFlags::READ).with_host_data(&empty);
        assert!(desc.initial_data().is_none());
    }

    #[test]
    fn test_lock_ignores_poison() {
        let mutex = Arc::new(Mutex::new(5));
        let clone = Arc::clone(&mutex);
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert_eq!(*lock(&mutex), 5);
    }
}
