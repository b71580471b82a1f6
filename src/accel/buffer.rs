//! Accelerator buffer implementation.

use super::AccelQueue;
use super::driver::{DevicePtr, Driver, SemaphoreHandle};
use crate::defaults::ACCEL_NATIVE_FILL_BLOCKS;
use crate::error::{Error, Result, ValidationError};
use crate::flags::{MapFlags, MemoryFlags};
use crate::memory::{
    BufferDesc, DeviceMemory, MemoryInfo, Ownership, SharingState, StagingMap, StagingRegistry,
    drain_both,
};
use crate::observability::{self, TransferKind};
use crate::peer::{PeerBuffer, SharedPeer, attach_peer};
use crate::queue::{self, BackendKind, Queue};
use crate::validate;
use std::ptr::NonNull;

const BACKEND: &str = "accel";

/// Where the device address of a buffer comes from. Decides how it is
/// released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backing {
    /// `Driver::allocate`.
    Allocated,
    /// `Driver::register_host` over caller memory.
    Registered,
    /// `Driver::import_memory` of the peer's allocation.
    Imported,
}

/// A linear buffer of the accelerator backend.
pub struct AccelBuffer {
    info: MemoryInfo,
    ptr: DevicePtr,
    backing: Backing,
    semaphore: Option<SemaphoreHandle>,
    maps: StagingRegistry,
    queue: AccelQueue,
}

impl AccelBuffer {
    /// Create a buffer on `queue`'s device.
    ///
    /// Returns `Ok(None)` below the device's minimum allocation.
    /// `USE_HOST_MEMORY` is rejected here; see
    /// [`new_with_host_memory`](Self::new_with_host_memory).
    pub fn new(queue: &AccelQueue, desc: BufferDesc<'_>) -> Result<Option<Self>> {
        if desc.flags.contains(MemoryFlags::USE_HOST_MEMORY) {
            return Err(Error::UnsupportedConfiguration(
                "USE_HOST_MEMORY requires AccelBuffer::new_with_host_memory".into(),
            ));
        }
        let initial = desc.initial_data();
        Self::create(queue, desc, None, initial)
    }

    /// Create a buffer over `size` bytes of host memory at `ptr`,
    /// registered with the driver. `USE_HOST_MEMORY` is added to `flags`.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `size` bytes until the
    /// buffer is dropped, and must not be accessed otherwise meanwhile.
    pub unsafe fn new_with_host_memory(
        queue: &AccelQueue,
        ptr: NonNull<u8>,
        size: usize,
        flags: MemoryFlags,
    ) -> Result<Option<Self>> {
        let desc = BufferDesc::new(size, flags | MemoryFlags::USE_HOST_MEMORY);
        Self::create(queue, desc, Some(ptr), None)
    }

    fn create(
        queue: &AccelQueue,
        desc: BufferDesc<'_>,
        host_ptr: Option<NonNull<u8>>,
        initial: Option<&[u8]>,
    ) -> Result<Option<Self>> {
        desc.flags.validate()?;
        let device = queue.device();
        let config = device.config();
        if desc.size < config.min_allocation {
            tracing::debug!(
                size = desc.size,
                min = config.min_allocation,
                "accelerator allocation below minimum size"
            );
            return Ok(None);
        }
        let _span = config.tracing.enter_create(BACKEND, desc.size);
        let driver = queue.driver();
        let caps = driver.capabilities();

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

        let importing =
            host_ptr.is_none() && sharing.is_some() && caps.external_memory && config.import_peer_memory;
        let (ptr, backing) = match (host_ptr, &sharing) {
            // SAFETY: forwarded from `new_with_host_memory`'s caller.
            (Some(host), _) => (unsafe { driver.register_host(host, desc.size)? }, Backing::Registered),
            (None, Some(state)) if importing => {
                (import_memory(driver, state.peer().buffer(), desc.size)?, Backing::Imported)
            }
            _ => (driver.allocate(desc.size)?, Backing::Allocated),
        };

        let mut buffer = Self {
            info: MemoryInfo::new(desc.size, desc.flags, sharing),
            ptr,
            backing,
            semaphore: None,
            maps: StagingRegistry::default(),
            queue: queue.clone(),
        };

        if backing == Backing::Imported && caps.external_semaphore && config.import_peer_semaphore {
            let exported = match buffer.info.sharing.as_ref() {
                Some(state) => state.peer().buffer().export_semaphore()?,
                None => None,
            };
            if let Some(semaphore) = exported {
                buffer.semaphore = Some(driver.import_semaphore(semaphore)?);
            }
        }

        // An imported peer already holds the initial data, a wrapped one is
        // authoritative.
        let wraps_peer = buffer.ownership() == Some(Ownership::Peer);
        if let Some(data) = initial.filter(|_| backing == Backing::Allocated && !wraps_peer) {
            driver.copy_htod(queue.stream(), ptr, 0, data)?;
            queue.finish()?;
        }

        tracing::debug!(
            size = desc.size,
            flags = ?desc.flags,
            backing = ?backing,
            semaphore = buffer.semaphore.is_some(),
            shared = ?desc.flags.sharing_target(),
            "created accelerator buffer"
        );
        Ok(Some(buffer))
    }

    /// The buffer's device address.
    pub fn device_ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Does the buffer alias its peer's memory?
    pub fn is_imported(&self) -> bool {
        self.backing == Backing::Imported
    }

    /// Was the peer's semaphore imported?
    pub fn has_semaphore(&self) -> bool {
        self.semaphore.is_some()
    }

    /// Maps not yet released by `unmap`.
    pub fn outstanding_maps(&self) -> usize {
        self.maps.outstanding()
    }

    fn sharing_queue<'a>(&'a self, queue: Option<&'a AccelQueue>) -> Result<&'a AccelQueue> {
        let queue = queue.unwrap_or(&self.queue);
        queue::check_compute_queue(queue, BackendKind::Accelerator, self.queue.device_id())?;
        self.same_device("sharing", queue)?;
        Ok(queue)
    }

    /// Reject a queue of another device. Checked in every build, with or
    /// without `validation`: a foreign driver would resolve `self.ptr` to
    /// some other allocation.
    fn same_device(&self, op: &'static str, queue: &AccelQueue) -> Result<()> {
        if queue.device_id() != self.queue.device_id() {
            return validate::reject(op, ValidationError::ForeignDevice);
        }
        Ok(())
    }

    /// Make compute work wait for the peer. No data moves.
    fn barrier_to_compute(
        &self,
        queue: &AccelQueue,
        peer: &dyn PeerBuffer,
        peer_queue: &dyn Queue,
    ) -> Result<TransferKind> {
        match self.semaphore {
            Some(semaphore) => {
                peer.signal_semaphore(peer_queue)?;
                queue.driver().wait_semaphore(queue.stream(), semaphore)?;
            }
            None => drain_both(queue, peer_queue)?,
        }
        Ok(TransferKind::Barrier)
    }

    /// Make peer work wait for compute. No data moves.
    fn barrier_to_peer(
        &self,
        queue: &AccelQueue,
        peer: &dyn PeerBuffer,
        peer_queue: &dyn Queue,
    ) -> Result<TransferKind> {
        match self.semaphore {
            Some(semaphore) => {
                queue.driver().signal_semaphore(queue.stream(), semaphore)?;
                peer.wait_semaphore(peer_queue)?;
            }
            None => drain_both(queue, peer_queue)?,
        }
        Ok(TransferKind::Barrier)
    }

    /// Drain both sides and copy the peer's contents into the private
    /// allocation.
    fn copy_from_peer(
        &self,
        queue: &AccelQueue,
        peer: &dyn PeerBuffer,
        peer_queue: &dyn Queue,
    ) -> Result<TransferKind> {
        drain_both(queue, peer_queue)?;
        let mut staging = vec![0u8; self.info.size];
        peer.read(&mut staging, 0)?;
        queue.driver().copy_htod(queue.stream(), self.ptr, 0, &staging)?;
        queue.finish()?;
        Ok(TransferKind::Copy)
    }

    /// Drain both sides and publish the private allocation to the peer.
    fn copy_to_peer(
        &self,
        queue: &AccelQueue,
        peer: &dyn PeerBuffer,
        peer_queue: &dyn Queue,
    ) -> Result<TransferKind> {
        drain_both(queue, peer_queue)?;
        let mut staging = vec![0u8; self.info.size];
        queue.driver().copy_dtoh(queue.stream(), &mut staging, self.ptr, 0)?;
        queue.finish()?;
        peer.write(&staging, 0)?;
        Ok(TransferKind::Copy)
    }

    fn publish(
        &self,
        queue: &AccelQueue,
        peer: &dyn PeerBuffer,
        peer_queue: &dyn Queue,
    ) -> Result<TransferKind> {
        if self.is_imported() {
            self.barrier_to_peer(queue, peer, peer_queue)
        } else {
            self.copy_to_peer(queue, peer, peer_queue)
        }
    }
}

/// Import the peer's exported memory as the buffer's device address.
fn import_memory(driver: &dyn Driver, peer: &dyn PeerBuffer, size: usize) -> Result<DevicePtr> {
    let memory = peer
        .export_memory()?
        .ok_or_else(|| Error::Import(format!("{} peer does not export its memory", peer.api())))?;
    if memory.size < size {
        return Err(Error::Import(format!(
            "exported peer memory holds {} bytes, resource needs {size}",
            memory.size
        )));
    }
    driver.import_memory(memory)
}

impl DeviceMemory for AccelBuffer {
    type Queue = AccelQueue;

    fn size(&self) -> usize {
        self.info.size
    }

    fn flags(&self) -> MemoryFlags {
        self.info.flags
    }

    fn read(&self, queue: &AccelQueue, dst: &mut [u8], offset: usize) -> Result<()> {
        self.same_device("read", queue)?;
        validate::read_check(self.info.size, dst.len(), offset, self.info.flags)?;
        if dst.is_empty() {
            return Ok(());
        }
        queue.driver().copy_dtoh(queue.stream(), dst, self.ptr, offset)?;
        queue.finish()
    }

    fn write(&self, queue: &AccelQueue, src: &[u8], offset: usize) -> Result<()> {
        self.same_device("write", queue)?;
        validate::write_check(self.info.size, src.len(), offset, self.info.flags)?;
        if src.is_empty() {
            return Ok(());
        }
        queue.driver().copy_htod(queue.stream(), self.ptr, offset, src)?;
        queue.finish()
    }

    fn copy(
        &self,
        queue: &AccelQueue,
        src: &Self,
        size: usize,
        src_offset: usize,
        dst_offset: usize,
    ) -> Result<()> {
        self.same_device("copy", queue)?;
        src.same_device("copy", queue)?;
        let size = if size == 0 {
            src.info.size.min(self.info.size)
        } else {
            size
        };
        validate::copy_check(self.info.size, src.info.size, size, dst_offset, src_offset)?;
        queue
            .driver()
            .copy_dtod(queue.stream(), self.ptr, dst_offset, src.ptr, src_offset, size)
    }

    fn fill(&self, queue: &AccelQueue, pattern: &[u8], size: usize, offset: usize) -> Result<()> {
        self.same_device("fill", queue)?;
        let size = if size == 0 { self.info.size } else { size };
        validate::fill_check(self.info.size, size, pattern.len(), offset)?;
        let driver = queue.driver();
        let stream = queue.stream();
        let native = ACCEL_NATIVE_FILL_BLOCKS.contains(&pattern.len());
        match (native, pattern) {
            (true, &[byte]) => driver.memset_d8(stream, self.ptr, offset, byte, size),
            (true, &[a, b]) => {
                driver.memset_d16(stream, self.ptr, offset, u16::from_ne_bytes([a, b]), size / 2)
            }
            (true, &[a, b, c, d]) => driver.memset_d32(
                stream,
                self.ptr,
                offset,
                u32::from_ne_bytes([a, b, c, d]),
                size / 4,
            ),
            _ => {
                let tiled: Vec<u8> = pattern.iter().copied().cycle().take(size).collect();
                driver.copy_htod(stream, self.ptr, offset, &tiled)?;
                // `tiled` must outlive the upload.
                queue.finish()
            }
        }
    }

    fn map(
        &self,
        queue: &AccelQueue,
        flags: MapFlags,
        size: usize,
        offset: usize,
    ) -> Result<NonNull<u8>> {
        self.same_device("map", queue)?;
        let size = if size == 0 { self.info.size.saturating_sub(offset) } else { size };
        validate::map_check(self.info.size, size, self.info.flags, flags, offset)?;
        let staging = StagingMap::allocate(size, offset, flags)?;
        // Write-only maps start from zeroed staging.
        if !flags.contains(MapFlags::READ) {
            if flags.contains(MapFlags::BLOCK) {
                queue.finish()?;
            }
        } else {
            // SAFETY: the staging memory is not handed out yet.
            let bytes = unsafe { staging.bytes_mut() };
            queue.driver().copy_dtoh(queue.stream(), bytes, self.ptr, offset)?;
            queue.finish()?;
        }
        observability::record_staging_map(BACKEND, size);
        Ok(self.maps.insert(staging))
    }

    fn unmap(&self, queue: &AccelQueue, ptr: NonNull<u8>) -> Result<()> {
        self.same_device("unmap", queue)?;
        let Some(staging) = self.maps.take(ptr) else {
            return validate::reject("unmap", ValidationError::UnknownMapping);
        };
        if staging.writes_back() {
            // SAFETY: the caller gave the pointer back; nobody else writes.
            let bytes = unsafe { staging.bytes() };
            queue
                .driver()
                .copy_htod(queue.stream(), self.ptr, staging.offset, bytes)?;
            queue.finish()?;
        }
        Ok(())
    }

    fn try_clone(&self, queue: &AccelQueue, copy_contents: bool) -> Result<Option<Self>> {
        self.same_device("try_clone", queue)?;
        let desc = BufferDesc::new(
            self.info.size,
            self.info.flags - MemoryFlags::USE_HOST_MEMORY,
        );
        let Some(clone) = Self::create(queue, desc, None, None)? else {
            return Ok(None);
        };
        if copy_contents {
            clone.copy(queue, self, 0, 0, 0)?;
        }
        Ok(Some(clone))
    }

    fn shared_peer(&self) -> Option<&SharedPeer> {
        self.info.sharing.as_ref().map(SharingState::peer)
    }

    fn ownership(&self) -> Option<Ownership> {
        self.info.sharing.as_ref().map(SharingState::ownership)
    }

    fn acquire_peer(
        &self,
        queue: Option<&AccelQueue>,
        peer_queue: Option<&dyn Queue>,
    ) -> Result<()> {
        let sharing = self.info.sharing("acquire")?;
        let queue = self.sharing_queue(queue)?;
        let peer_queue = sharing.peer_queue(peer_queue)?;
        sharing.acquire(|peer| {
            if self.is_imported() {
                self.barrier_to_compute(queue, peer, peer_queue)
            } else {
                self.copy_from_peer(queue, peer, peer_queue)
            }
        })?;
        Ok(())
    }

    fn release_peer(
        &self,
        queue: Option<&AccelQueue>,
        peer_queue: Option<&dyn Queue>,
    ) -> Result<()> {
        let sharing = self.info.sharing("release")?;
        let queue = self.sharing_queue(queue)?;
        let peer_queue = sharing.peer_queue(peer_queue)?;
        sharing.release(|peer| self.publish(queue, peer, peer_queue))?;
        Ok(())
    }

    fn sync_peer(&self, queue: Option<&AccelQueue>, peer_queue: Option<&dyn Queue>) -> Result<()> {
        let sharing = self.info.sharing("sync")?;
        let queue = self.sharing_queue(queue)?;
        let peer_queue = sharing.peer_queue(peer_queue)?;
        sharing.sync(|peer| self.publish(queue, peer, peer_queue))?;
        Ok(())
    }
}

impl Drop for AccelBuffer {
    fn drop(&mut self) {
        let outstanding = self.maps.outstanding();
        if outstanding > 0 {
            tracing::warn!(outstanding, "accelerator buffer dropped while mapped");
        }
        let driver = self.queue.driver();
        if let Some(semaphore) = self.semaphore.take() {
            if let Err(e) = driver.destroy_external_semaphore(semaphore) {
                tracing::warn!(error = %e, "failed to destroy imported semaphore");
            }
        }
        let released = match self.backing {
            Backing::Allocated => driver.free(self.ptr),
            Backing::Registered => driver.unregister_host(self.ptr),
            Backing::Imported => driver.destroy_external_memory(self.ptr),
        };
        if let Err(e) = released {
            tracing::warn!(backing = ?self.backing, error = %e, "failed to release device memory");
        }
    }
}

impl std::fmt::Debug for AccelBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelBuffer")
            .field("size", &self.info.size)
            .field("flags", &self.info.flags)
            .field("ptr", &self.ptr)
            .field("backing", &self.backing)
            .field("semaphore", &self.semaphore)
            .field("sharing", &self.info.sharing)
            .finish()
    }
}
