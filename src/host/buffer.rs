//! Host buffer implementation.

use super::HostQueue;
use crate::defaults::HOST_NATIVE_FILL_BLOCKS;
use crate::error::{Error, Result, ValidationError};
use crate::flags::{MapFlags, MemoryFlags};
use crate::memory::{
    BufferDesc, DeviceMemory, ForeignSegment, HostSegment, MemoryInfo, MemorySegment, Ownership,
    SharingState, drain_both, lock,
};
use crate::observability::TransferKind;
use crate::peer::{SharedPeer, attach_peer};
use crate::queue::{self, BackendKind, Queue};
use crate::validate;
use std::ptr::NonNull;
use std::sync::Mutex;

const BACKEND: &str = "host";

/// A linear buffer of the host backend.
///
/// Data operations take the buffer's lock; `map` hands out pointers into
/// the store without synchronization.
pub struct HostBuffer {
    info: MemoryInfo,
    store: Box<dyn MemorySegment>,
    lock: Mutex<()>,
    queue: HostQueue,
}

impl HostBuffer {
    /// Create a buffer on `queue`'s device.
    ///
    /// Returns `Ok(None)` when `desc.size` is below the device's minimum
    /// allocation. `USE_HOST_MEMORY` is rejected here; see
    /// [`new_with_host_memory`](Self::new_with_host_memory).
    pub fn new(queue: &HostQueue, desc: BufferDesc<'_>) -> Result<Option<Self>> {
        if desc.flags.contains(MemoryFlags::USE_HOST_MEMORY) {
            return Err(Error::UnsupportedConfiguration(
                "USE_HOST_MEMORY requires HostBuffer::new_with_host_memory".into(),
            ));
        }
        let initial = desc.initial_data();
        Self::create(queue, desc, None, initial)
    }

    /// Create a buffer that uses `size` bytes at `ptr` as its store.
    ///
    /// `USE_HOST_MEMORY` is added to `flags`. Nothing is allocated or
    /// copied; a created peer starts zeroed until the first release.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `size` bytes until the
    /// buffer is dropped, and must not be accessed otherwise meanwhile
    /// (except through pointers returned by `map`).
    pub unsafe fn new_with_host_memory(
        queue: &HostQueue,
        ptr: NonNull<u8>,
        size: usize,
        flags: MemoryFlags,
    ) -> Result<Option<Self>> {
        // SAFETY: forwarded from the caller.
        let store = unsafe { ForeignSegment::new(ptr, size) };
        let desc = BufferDesc::new(size, flags | MemoryFlags::USE_HOST_MEMORY);
        Self::create(queue, desc, Some(Box::new(store)), None)
    }

    fn create(
        queue: &HostQueue,
        desc: BufferDesc<'_>,
        store: Option<Box<dyn MemorySegment>>,
        initial: Option<&[u8]>,
    ) -> Result<Option<Self>> {
        desc.flags.validate()?;
        let device = queue.device();
        let config = device.config();
        if desc.size < config.min_allocation {
            tracing::debug!(
                size = desc.size,
                min = config.min_allocation,
                "host allocation below minimum size"
            );
            return Ok(None);
        }
        let _span = config.tracing.enter_create(BACKEND, desc.size);

        let sharing = match desc.flags.sharing_target() {
            Some(api) => {
                let (peer, ownership) = attach_peer(device.peers(), api, &desc, initial)?;
                Some(SharingState::new(
                    peer,
                    desc.flags,
                    ownership,
                    BACKEND,
                    desc.size,
                    config.tracing.clone(),
                ))
            }
            None => {
                if desc.peer.is_some() {
                    tracing::warn!("peer supplied for a resource without a sharing target");
                }
                None
            }
        };
        let wraps_peer = sharing
            .as_ref()
            .is_some_and(|state| state.ownership() == Ownership::Peer);

        let store = match store {
            Some(store) => store,
            None => Box::new(HostSegment::new(&config.segment_name, desc.size)?),
        };
        if let Some(data) = initial.filter(|_| !wraps_peer) {
            // SAFETY: fresh store, not shared with anyone yet.
            unsafe { store.as_mut_slice()[..data.len()].copy_from_slice(data) };
        }

        tracing::debug!(
            size = desc.size,
            flags = ?desc.flags,
            store = ?store.kind(),
            shared = ?desc.flags.sharing_target(),
            "created host buffer"
        );

        Ok(Some(Self {
            info: MemoryInfo::new(desc.size, desc.flags, sharing),
            store,
            lock: Mutex::new(()),
            queue: queue.clone(),
        }))
    }

    /// The compute queue for a sharing call: the caller's or the creation
    /// queue.
    fn sharing_queue<'a>(&'a self, queue: Option<&'a HostQueue>) -> Result<&'a HostQueue> {
        let queue = queue.unwrap_or(&self.queue);
        queue::check_compute_queue(queue, BackendKind::Host, self.queue.device_id())?;
        Ok(queue)
    }

    /// The buffer's store, for the ownership copies.
    ///
    /// # Safety
    ///
    /// The caller must hold `self.lock`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn bytes_mut(&self) -> &mut [u8] {
        // SAFETY: store length equals `info.size`; exclusivity per caller.
        unsafe { &mut self.store.as_mut_slice()[..self.info.size] }
    }
}

/// Repeat `pattern` over `dst`.
fn fill_pattern(dst: &mut [u8], pattern: &[u8]) {
    match pattern.len() {
        1 => dst.fill(pattern[0]),
        n if HOST_NATIVE_FILL_BLOCKS.contains(&n) => {
            for chunk in dst.chunks_exact_mut(n) {
                chunk.copy_from_slice(pattern);
            }
        }
        _ => {
            let tiled: Vec<u8> = pattern.iter().copied().cycle().take(dst.len()).collect();
            dst.copy_from_slice(&tiled);
        }
    }
}

impl DeviceMemory for HostBuffer {
    type Queue = HostQueue;

    fn size(&self) -> usize {
        self.info.size
    }

    fn flags(&self) -> MemoryFlags {
        self.info.flags
    }

    fn read(&self, _queue: &HostQueue, dst: &mut [u8], offset: usize) -> Result<()> {
        validate::read_check(self.info.size, dst.len(), offset, self.info.flags)?;
        if dst.is_empty() {
            return Ok(());
        }
        let _guard = lock(&self.lock);
        // SAFETY: guarded; mapped pointers are the caller's responsibility.
        let store = unsafe { self.store.as_slice() };
        dst.copy_from_slice(&store[offset..offset + dst.len()]);
        Ok(())
    }

    fn write(&self, _queue: &HostQueue, src: &[u8], offset: usize) -> Result<()> {
        validate::write_check(self.info.size, src.len(), offset, self.info.flags)?;
        if src.is_empty() {
            return Ok(());
        }
        let _guard = lock(&self.lock);
        // SAFETY: as in `read`.
        let store = unsafe { self.bytes_mut() };
        store[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn copy(
        &self,
        _queue: &HostQueue,
        src: &Self,
        size: usize,
        src_offset: usize,
        dst_offset: usize,
    ) -> Result<()> {
        let size = if size == 0 {
            src.info.size.min(self.info.size)
        } else {
            size
        };
        validate::copy_check(self.info.size, src.info.size, size, dst_offset, src_offset)?;

        if std::ptr::eq(self, src) {
            let _guard = lock(&self.lock);
            // SAFETY: guarded.
            let store = unsafe { self.bytes_mut() };
            store.copy_within(src_offset..src_offset + size, dst_offset);
            return Ok(());
        }

        // Lock in address order so that concurrent copies in both
        // directions can not deadlock.
        let (_first, _second) = if (self as *const Self) < (src as *const Self) {
            (lock(&self.lock), lock(&src.lock))
        } else {
            (lock(&src.lock), lock(&self.lock))
        };
        // SAFETY: both guards held; distinct buffers never alias.
        let (dst_store, src_store) = unsafe { (self.bytes_mut(), src.store.as_slice()) };
        dst_store[dst_offset..dst_offset + size]
            .copy_from_slice(&src_store[src_offset..src_offset + size]);
        Ok(())
    }

    fn fill(&self, _queue: &HostQueue, pattern: &[u8], size: usize, offset: usize) -> Result<()> {
        let size = if size == 0 { self.info.size } else { size };
        validate::fill_check(self.info.size, size, pattern.len(), offset)?;
        let _guard = lock(&self.lock);
        // SAFETY: guarded.
        let store = unsafe { self.bytes_mut() };
        fill_pattern(&mut store[offset..offset + size], pattern);
        Ok(())
    }

    fn map(
        &self,
        queue: &HostQueue,
        flags: MapFlags,
        size: usize,
        offset: usize,
    ) -> Result<NonNull<u8>> {
        let size = if size == 0 { self.info.size.saturating_sub(offset) } else { size };
        validate::map_check(self.info.size, size, self.info.flags, flags, offset)?;
        if flags.contains(MapFlags::BLOCK) {
            queue.finish()?;
        }
        NonNull::new(self.store.as_mut_ptr().wrapping_add(offset))
            .ok_or_else(|| Error::AllocationFailed("host store has no address".into()))
    }

    fn unmap(&self, _queue: &HostQueue, ptr: NonNull<u8>) -> Result<()> {
        if !self.store.contains(ptr.as_ptr()) {
            return validate::reject("unmap", ValidationError::UnknownMapping);
        }
        Ok(())
    }

    fn try_clone(&self, queue: &HostQueue, copy_contents: bool) -> Result<Option<Self>> {
        let snapshot = copy_contents.then(|| {
            let _guard = lock(&self.lock);
            // SAFETY: guarded.
            unsafe { self.store.as_slice() }.to_vec()
        });
        let desc = BufferDesc::new(
            self.info.size,
            self.info.flags - MemoryFlags::USE_HOST_MEMORY,
        );
        Self::create(queue, desc, None, snapshot.as_deref())
    }

    fn shared_peer(&self) -> Option<&SharedPeer> {
        self.info.sharing.as_ref().map(SharingState::peer)
    }

    fn ownership(&self) -> Option<Ownership> {
        self.info.sharing.as_ref().map(SharingState::ownership)
    }

    fn acquire_peer(&self, queue: Option<&HostQueue>, peer_queue: Option<&dyn Queue>) -> Result<()> {
        let sharing = self.info.sharing("acquire")?;
        let queue = self.sharing_queue(queue)?;
        let peer_queue = sharing.peer_queue(peer_queue)?;
        sharing.acquire(|peer| {
            drain_both(queue, peer_queue)?;
            let _guard = lock(&self.lock);
            // SAFETY: guarded.
            peer.read(unsafe { self.bytes_mut() }, 0)?;
            Ok(TransferKind::Copy)
        })?;
        Ok(())
    }

    fn release_peer(&self, queue: Option<&HostQueue>, peer_queue: Option<&dyn Queue>) -> Result<()> {
        let sharing = self.info.sharing("release")?;
        let queue = self.sharing_queue(queue)?;
        let peer_queue = sharing.peer_queue(peer_queue)?;
        sharing.release(|peer| {
            drain_both(queue, peer_queue)?;
            let _guard = lock(&self.lock);
            // SAFETY: guarded.
            peer.write(unsafe { self.bytes_mut() }, 0)?;
            Ok(TransferKind::Copy)
        })?;
        Ok(())
    }

    fn sync_peer(&self, queue: Option<&HostQueue>, peer_queue: Option<&dyn Queue>) -> Result<()> {
        let sharing = self.info.sharing("sync")?;
        let queue = self.sharing_queue(queue)?;
        let peer_queue = sharing.peer_queue(peer_queue)?;
        sharing.sync(|peer| {
            drain_both(queue, peer_queue)?;
            let _guard = lock(&self.lock);
            // SAFETY: guarded.
            peer.write(unsafe { self.bytes_mut() }, 0)?;
            Ok(TransferKind::Copy)
        })?;
        Ok(())
    }
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuffer")
            .field("size", &self.info.size)
            .field("flags", &self.info.flags)
            .field("store", &self.store.kind())
            .field("sharing", &self.info.sharing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::HostConfig;
    use crate::flags::PeerApi;
    use crate::host::HostDevice;
    use crate::peer::soft::SoftPeerBackend;
    use std::sync::Arc;

    const RW: MemoryFlags = MemoryFlags::READ_WRITE.union(MemoryFlags::HOST_READ_WRITE);

    fn queue() -> HostQueue {
        Arc::new(HostDevice::new(HostConfig::default())).create_queue()
    }

    fn buffer(queue: &HostQueue, size: usize) -> HostBuffer {
        HostBuffer::new(queue, BufferDesc::new(size, RW))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_below_minimum_is_empty() {
        let queue = queue();
        assert!(HostBuffer::new(&queue, BufferDesc::new(3, RW)).unwrap().is_none());
        assert!(HostBuffer::new(&queue, BufferDesc::new(4, RW)).unwrap().is_some());
    }

    #[test]
    fn test_invalid_flags() {
        let queue = queue();
        let result = HostBuffer::new(&queue, BufferDesc::new(16, MemoryFlags::HOST_READ));
        assert!(matches!(result, Err(Error::UnsupportedConfiguration(_))));

        let result = HostBuffer::new(
            &queue,
            BufferDesc::new(16, RW | MemoryFlags::USE_HOST_MEMORY),
        );
        assert!(matches!(result, Err(Error::UnsupportedConfiguration(_))));
    }

    #[test]
    fn test_initial_data() {
        let queue = queue();
        let data = [1u8, 2, 3, 4, 5, 6];
        let buf = HostBuffer::new(&queue, BufferDesc::new(8, RW).with_host_data(&data))
            .unwrap()
            .unwrap();
        assert_eq!(buf.read_vec(&queue, 0, 0).unwrap(), [1, 2, 3, 4, 5, 6, 0, 0]);

        let skipped = HostBuffer::new(
            &queue,
            BufferDesc::new(8, RW | MemoryFlags::NO_INITIAL_COPY).with_host_data(&data),
        )
        .unwrap()
        .unwrap();
        assert_eq!(skipped.read_vec(&queue, 0, 0).unwrap(), [0; 8]);
    }

    #[test]
    fn test_fill_pattern_paths() {
        let mut dst = [0u8; 12];
        fill_pattern(&mut dst, &[7]);
        assert_eq!(dst, [7; 12]);
        fill_pattern(&mut dst, &[1, 2, 3, 4]);
        assert_eq!(dst, [1, 2, 3, 4, 1, 2, 3, 4, 1, 2, 3, 4]);
        fill_pattern(&mut dst, &[9, 8, 7]);
        assert_eq!(dst, [9, 8, 7, 9, 8, 7, 9, 8, 7, 9, 8, 7]);
    }

    #[test]
    fn test_copy_within_same_buffer_overlaps() {
        let queue = queue();
        let buf = buffer(&queue, 8);
        buf.write(&queue, &[1, 2, 3, 4, 5, 6, 7, 8], 0).unwrap();
        buf.copy(&queue, &buf, 6, 0, 2).unwrap();
        assert_eq!(buf.read_vec(&queue, 0, 0).unwrap(), [1, 2, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_copy_default_size_is_smaller_buffer() {
        let queue = queue();
        let small = buffer(&queue, 4);
        let large = buffer(&queue, 8);
        large.fill(&queue, &[5], 0, 0).unwrap();
        small.copy(&queue, &large, 0, 0, 0).unwrap();
        assert_eq!(small.read_vec(&queue, 0, 0).unwrap(), [5; 4]);
    }

    #[test]
    fn test_map_direct_pointer() {
        let queue = queue();
        let buf = buffer(&queue, 16);
        let ptr = buf
            .map(&queue, MapFlags::WRITE | MapFlags::BLOCK, 4, 8)
            .unwrap();
        assert_eq!(queue.finish_count(), 1);
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0xEE, 4) };
        buf.unmap(&queue, ptr).unwrap();
        assert_eq!(buf.read_vec(&queue, 4, 8).unwrap(), [0xEE; 4]);

        let mut outside = 0u8;
        let result = buf.unmap(&queue, NonNull::from(&mut outside));
        assert!(matches!(
            result,
            Err(Error::Validation(ValidationError::UnknownMapping))
        ));
    }

    #[test]
    fn test_host_memory_is_used_in_place() {
        let queue = queue();
        let mut backing = vec![0u8; 16];
        let ptr = NonNull::new(backing.as_mut_ptr()).unwrap();
        let buf = unsafe { HostBuffer::new_with_host_memory(&queue, ptr, 16, RW) }
            .unwrap()
            .unwrap();
        assert!(buf.flags().contains(MemoryFlags::USE_HOST_MEMORY));
        buf.fill(&queue, &[3, 4], 0, 0).unwrap();
        drop(buf);
        assert_eq!(&backing[..4], &[3, 4, 3, 4]);
    }

    #[test]
    fn test_try_clone() {
        let queue = queue();
        let buf = buffer(&queue, 8);
        buf.fill(&queue, &[6], 0, 0).unwrap();
        let copy = buf.try_clone(&queue, true).unwrap().unwrap();
        let blank = buf.try_clone(&queue, false).unwrap().unwrap();
        assert_eq!(copy.read_vec(&queue, 0, 0).unwrap(), [6; 8]);
        assert_eq!(blank.read_vec(&queue, 0, 0).unwrap(), [0; 8]);
        assert_eq!(copy.flags(), buf.flags());
    }

    #[test]
    fn test_unshared_ownership_calls() {
        let queue = queue();
        let buf = buffer(&queue, 8);
        assert!(buf.shared_peer().is_none());
        assert!(buf.ownership().is_none());
        assert!(matches!(
            buf.acquire_peer(None, None),
            Err(Error::Validation(ValidationError::NotShared))
        ));
    }

    #[test]
    fn test_release_copies_to_peer() {
        let peer = Arc::new(SoftPeerBackend::new(PeerApi::Metal));
        let device = Arc::new(HostDevice::new(HostConfig::default()).with_peer(peer.clone()));
        let queue = device.create_queue();
        let flags = RW | MemoryFlags::METAL_SHARING;
        let buf = HostBuffer::new(&queue, BufferDesc::new(8, flags))
            .unwrap()
            .unwrap();
        assert_eq!(buf.ownership(), Some(Ownership::Compute));

        buf.fill(&queue, &[0x11], 0, 0).unwrap();
        buf.release_peer(None, None).unwrap();
        assert_eq!(buf.ownership(), Some(Ownership::Peer));

        let mut out = [0u8; 8];
        buf.shared_peer().unwrap().buffer().read(&mut out, 0).unwrap();
        assert_eq!(out, [0x11; 8]);
    }
}
