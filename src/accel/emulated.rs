//! Software accelerator driver.
//!
//! Executes every operation eagerly on host memory: allocations are boxed
//! slices, registered host ranges are used in place, imported peer memory is
//! mmap'd from the exported fd, and imported semaphores are the peer's
//! eventfds. Streams therefore never have pending work, but all calls are
//! still validated against live streams and allocations, and counted.

use super::driver::{DevicePtr, Driver, DriverCapabilities, SemaphoreHandle, StreamId};
use crate::error::{Error, Result};
use crate::memory::{MappedSegment, MemorySegment, lock};
use crate::peer::soft::{eventfd_signal, eventfd_wait};
use crate::peer::{ExternalMemory, ExternalSemaphore};
use rustix::fd::OwnedFd;
use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

enum Region {
    Owned(Box<[u8]>),
    Registered { addr: usize, len: usize },
    Imported(MappedSegment),
}

impl Region {
    fn raw(&mut self) -> (*mut u8, usize) {
        match self {
            Region::Owned(bytes) => (bytes.as_mut_ptr(), bytes.len()),
            Region::Registered { addr, len } => (*addr as *mut u8, *len),
            Region::Imported(segment) => (segment.as_mut_ptr(), segment.len()),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Region::Owned(_) => "allocation",
            Region::Registered { .. } => "registration",
            Region::Imported(_) => "import",
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    allocations: AtomicU64,
    frees: AtomicU64,
    registrations: AtomicU64,
    memory_imports: AtomicU64,
    semaphore_imports: AtomicU64,
    htod_bytes: AtomicU64,
    dtoh_bytes: AtomicU64,
    dtod_bytes: AtomicU64,
    memsets: AtomicU64,
    synchronizations: AtomicU64,
    semaphore_signals: AtomicU64,
    semaphore_waits: AtomicU64,
}

/// Point-in-time driver counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    /// Device allocations.
    pub allocations: u64,
    /// Device frees.
    pub frees: u64,
    /// Host registrations.
    pub registrations: u64,
    /// External memory imports.
    pub memory_imports: u64,
    /// External semaphore imports.
    pub semaphore_imports: u64,
    /// Bytes copied host to device.
    pub htod_bytes: u64,
    /// Bytes copied device to host.
    pub dtoh_bytes: u64,
    /// Bytes copied device to device.
    pub dtod_bytes: u64,
    /// Memset calls of any width.
    pub memsets: u64,
    /// Stream synchronizations.
    pub synchronizations: u64,
    /// Semaphore signals.
    pub semaphore_signals: u64,
    /// Semaphore waits.
    pub semaphore_waits: u64,
}

/// Emulated accelerator driver.
pub struct EmulatedDriver {
    capabilities: DriverCapabilities,
    memory_limit: Option<usize>,
    allocated: AtomicUsize,
    next_id: AtomicU64,
    streams: Mutex<HashSet<u64>>,
    regions: Mutex<HashMap<u64, Region>>,
    semaphores: Mutex<HashMap<u64, OwnedFd>>,
    counters: Counters,
}

impl EmulatedDriver {
    /// Driver with every optional feature.
    pub fn new() -> Self {
        Self::with_capabilities(DriverCapabilities::ALL)
    }

    /// Driver with the given optional features.
    pub fn with_capabilities(capabilities: DriverCapabilities) -> Self {
        Self {
            capabilities,
            memory_limit: None,
            allocated: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            streams: Mutex::new(HashSet::new()),
            regions: Mutex::new(HashMap::new()),
            semaphores: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Fail allocations once `bytes` of device memory are in use.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> DriverStats {
        let c = &self.counters;
        DriverStats {
            allocations: c.allocations.load(Ordering::Relaxed),
            frees: c.frees.load(Ordering::Relaxed),
            registrations: c.registrations.load(Ordering::Relaxed),
            memory_imports: c.memory_imports.load(Ordering::Relaxed),
            semaphore_imports: c.semaphore_imports.load(Ordering::Relaxed),
            htod_bytes: c.htod_bytes.load(Ordering::Relaxed),
            dtoh_bytes: c.dtoh_bytes.load(Ordering::Relaxed),
            dtod_bytes: c.dtod_bytes.load(Ordering::Relaxed),
            memsets: c.memsets.load(Ordering::Relaxed),
            synchronizations: c.synchronizations.load(Ordering::Relaxed),
            semaphore_signals: c.semaphore_signals.load(Ordering::Relaxed),
            semaphore_waits: c.semaphore_waits.load(Ordering::Relaxed),
        }
    }

    /// Allocations, registrations and imports currently alive.
    pub fn live_regions(&self) -> usize {
        lock(&self.regions).len()
    }

    /// Imported semaphores currently alive.
    pub fn live_semaphores(&self) -> usize {
        lock(&self.semaphores).len()
    }

    /// Streams currently alive.
    pub fn live_streams(&self) -> usize {
        lock(&self.streams).len()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_stream(&self, stream: StreamId) -> Result<()> {
        if lock(&self.streams).contains(&stream.0) {
            Ok(())
        } else {
            Err(Error::Driver(format!("unknown stream {}", stream.0)))
        }
    }

    fn insert_region(&self, region: Region) -> DevicePtr {
        let id = self.next_id();
        lock(&self.regions).insert(id, region);
        DevicePtr(id)
    }

    fn remove_region(&self, ptr: DevicePtr, expected: &'static str) -> Result<Region> {
        let mut regions = lock(&self.regions);
        match regions.get(&ptr.0) {
            Some(region) if region.kind() == expected => {}
            Some(region) => {
                return Err(Error::Driver(format!(
                    "device pointer {} is a {}, not a {expected}",
                    ptr.0,
                    region.kind()
                )));
            }
            None => return Err(Error::Driver(format!("unknown device pointer {}", ptr.0))),
        }
        regions
            .remove(&ptr.0)
            .ok_or_else(|| Error::Driver(format!("unknown device pointer {}", ptr.0)))
    }

    /// Run `f` on `len` bytes of `ptr` at `offset`.
    fn with_range<R>(
        &self,
        ptr: DevicePtr,
        offset: usize,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let mut regions = lock(&self.regions);
        let region = regions
            .get_mut(&ptr.0)
            .ok_or_else(|| Error::Driver(format!("unknown device pointer {}", ptr.0)))?;
        let (base, size) = region.raw();
        check_bounds(offset, len, size)?;
        // SAFETY: in bounds of a live region; the regions lock is held.
        let bytes = unsafe { std::slice::from_raw_parts_mut(base.add(offset), len) };
        Ok(f(bytes))
    }

    fn semaphore_op(
        &self,
        stream: StreamId,
        semaphore: SemaphoreHandle,
        f: impl FnOnce(&OwnedFd) -> Result<()>,
    ) -> Result<()> {
        self.check_stream(stream)?;
        let semaphores = lock(&self.semaphores);
        let fd = semaphores
            .get(&semaphore.0)
            .ok_or_else(|| Error::Driver(format!("unknown semaphore {}", semaphore.0)))?;
        f(fd)
    }
}

impl Default for EmulatedDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn check_bounds(offset: usize, len: usize, size: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(Error::Driver(format!(
            "range {offset}+{len} exceeds region of {size} bytes"
        ))),
    }
}

impl Driver for EmulatedDriver {
    fn name(&self) -> &str {
        "emulated"
    }

    fn capabilities(&self) -> DriverCapabilities {
        self.capabilities
    }

    fn create_stream(&self) -> Result<StreamId> {
        let id = self.next_id();
        lock(&self.streams).insert(id);
        Ok(StreamId(id))
    }

    fn destroy_stream(&self, stream: StreamId) -> Result<()> {
        if lock(&self.streams).remove(&stream.0) {
            Ok(())
        } else {
            Err(Error::Driver(format!("unknown stream {}", stream.0)))
        }
    }

    fn synchronize(&self, stream: StreamId) -> Result<()> {
        self.check_stream(stream)?;
        self.counters.synchronizations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn allocate(&self, size: usize) -> Result<DevicePtr> {
        if let Some(limit) = self.memory_limit {
            let in_use = self.allocated.load(Ordering::Relaxed);
            if in_use.saturating_add(size) > limit {
                return Err(Error::AllocationFailed(format!(
                    "{size} bytes requested, {} of {limit} available",
                    limit.saturating_sub(in_use)
                )));
            }
        }
        self.allocated.fetch_add(size, Ordering::Relaxed);
        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(self.insert_region(Region::Owned(vec![0u8; size].into_boxed_slice())))
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        if let Region::Owned(bytes) = self.remove_region(ptr, "allocation")? {
            self.allocated.fetch_sub(bytes.len(), Ordering::Relaxed);
        }
        self.counters.frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    unsafe fn register_host(&self, ptr: NonNull<u8>, size: usize) -> Result<DevicePtr> {
        self.counters.registrations.fetch_add(1, Ordering::Relaxed);
        Ok(self.insert_region(Region::Registered {
            addr: ptr.as_ptr() as usize,
            len: size,
        }))
    }

    fn unregister_host(&self, ptr: DevicePtr) -> Result<()> {
        self.remove_region(ptr, "registration").map(drop)
    }

    fn copy_htod(
        &self,
        stream: StreamId,
        dst: DevicePtr,
        dst_offset: usize,
        src: &[u8],
    ) -> Result<()> {
        self.check_stream(stream)?;
        self.with_range(dst, dst_offset, src.len(), |bytes| bytes.copy_from_slice(src))?;
        self.counters
            .htod_bytes
            .fetch_add(src.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn copy_dtoh(
        &self,
        stream: StreamId,
        dst: &mut [u8],
        src: DevicePtr,
        src_offset: usize,
    ) -> Result<()> {
        self.check_stream(stream)?;
        let len = dst.len();
        self.with_range(src, src_offset, len, |bytes| dst.copy_from_slice(bytes))?;
        self.counters
            .dtoh_bytes
            .fetch_add(len as u64, Ordering::Relaxed);
        Ok(())
    }

    fn copy_dtod(
        &self,
        stream: StreamId,
        dst: DevicePtr,
        dst_offset: usize,
        src: DevicePtr,
        src_offset: usize,
        size: usize,
    ) -> Result<()> {
        self.check_stream(stream)?;
        let mut regions = lock(&self.regions);
        let (src_base, src_len) = regions
            .get_mut(&src.0)
            .ok_or_else(|| Error::Driver(format!("unknown device pointer {}", src.0)))?
            .raw();
        let (dst_base, dst_len) = regions
            .get_mut(&dst.0)
            .ok_or_else(|| Error::Driver(format!("unknown device pointer {}", dst.0)))?
            .raw();
        check_bounds(src_offset, size, src_len)?;
        check_bounds(dst_offset, size, dst_len)?;
        // SAFETY: both ranges in bounds of live regions, lock held; `copy`
        // tolerates overlap.
        unsafe { std::ptr::copy(src_base.add(src_offset), dst_base.add(dst_offset), size) };
        self.counters
            .dtod_bytes
            .fetch_add(size as u64, Ordering::Relaxed);
        Ok(())
    }

    fn memset_d8(
        &self,
        stream: StreamId,
        dst: DevicePtr,
        offset: usize,
        value: u8,
        count: usize,
    ) -> Result<()> {
        self.check_stream(stream)?;
        self.with_range(dst, offset, count, |bytes| bytes.fill(value))?;
        self.counters.memsets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn memset_d16(
        &self,
        stream: StreamId,
        dst: DevicePtr,
        offset: usize,
        value: u16,
        count: usize,
    ) -> Result<()> {
        self.check_stream(stream)?;
        let len = count
            .checked_mul(2)
            .ok_or_else(|| Error::Driver("memset size overflows".into()))?;
        self.with_range(dst, offset, len, |bytes| {
            for word in bytes.chunks_exact_mut(2) {
                word.copy_from_slice(&value.to_ne_bytes());
            }
        })?;
        self.counters.memsets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn memset_d32(
        &self,
        stream: StreamId,
        dst: DevicePtr,
        offset: usize,
        value: u32,
        count: usize,
    ) -> Result<()> {
        self.check_stream(stream)?;
        let len = count
            .checked_mul(4)
            .ok_or_else(|| Error::Driver("memset size overflows".into()))?;
        self.with_range(dst, offset, len, |bytes| {
            for word in bytes.chunks_exact_mut(4) {
                word.copy_from_slice(&value.to_ne_bytes());
            }
        })?;
        self.counters.memsets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn import_memory(&self, memory: ExternalMemory) -> Result<DevicePtr> {
        if !self.capabilities.external_memory {
            return Err(Error::Import("driver can not import external memory".into()));
        }
        let segment = MappedSegment::from_fd(memory.fd, memory.size)?;
        self.counters.memory_imports.fetch_add(1, Ordering::Relaxed);
        Ok(self.insert_region(Region::Imported(segment)))
    }

    fn destroy_external_memory(&self, ptr: DevicePtr) -> Result<()> {
        self.remove_region(ptr, "import").map(drop)
    }

    fn import_semaphore(&self, semaphore: ExternalSemaphore) -> Result<SemaphoreHandle> {
        if !self.capabilities.external_semaphore {
            return Err(Error::Import(
                "driver can not import external semaphores".into(),
            ));
        }
        let id = self.next_id();
        lock(&self.semaphores).insert(id, semaphore.fd);
        self.counters
            .semaphore_imports
            .fetch_add(1, Ordering::Relaxed);
        Ok(SemaphoreHandle(id))
    }

    fn destroy_external_semaphore(&self, semaphore: SemaphoreHandle) -> Result<()> {
        match lock(&self.semaphores).remove(&semaphore.0) {
            Some(_) => Ok(()),
            None => Err(Error::Driver(format!("unknown semaphore {}", semaphore.0))),
        }
    }

    fn signal_semaphore(&self, stream: StreamId, semaphore: SemaphoreHandle) -> Result<()> {
        self.semaphore_op(stream, semaphore, |fd| eventfd_signal(fd))?;
        self.counters
            .semaphore_signals
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn wait_semaphore(&self, stream: StreamId, semaphore: SemaphoreHandle) -> Result<()> {
        self.semaphore_op(stream, semaphore, |fd| eventfd_wait(fd))?;
        self.counters
            .semaphore_waits
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl std::fmt::Debug for EmulatedDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatedDriver")
            .field("capabilities", &self.capabilities)
            .field("live_regions", &self.live_regions())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HostSegment;

    #[test]
    fn test_copy_roundtrip() {
        let driver = EmulatedDriver::new();
        let stream = driver.create_stream().unwrap();
        let ptr = driver.allocate(16).unwrap();

        driver.copy_htod(stream, ptr, 4, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 8];
        driver.copy_dtoh(stream, &mut out, ptr, 0).unwrap();
        driver.synchronize(stream).unwrap();
        assert_eq!(out, [0, 0, 0, 0, 1, 2, 3, 4]);

        let stats = driver.stats();
        assert_eq!(stats.htod_bytes, 4);
        assert_eq!(stats.dtoh_bytes, 8);
        assert_eq!(stats.synchronizations, 1);
    }

    #[test]
    fn test_bounds_and_unknown_handles() {
        let driver = EmulatedDriver::new();
        let stream = driver.create_stream().unwrap();
        let ptr = driver.allocate(8).unwrap();
        assert!(driver.copy_htod(stream, ptr, 6, &[0; 4]).is_err());
        assert!(driver.copy_htod(StreamId(9999), ptr, 0, &[0; 4]).is_err());
        assert!(driver.free(DevicePtr(9999)).is_err());
        assert!(driver.unregister_host(ptr).is_err());
        driver.free(ptr).unwrap();
        assert!(driver.free(ptr).is_err());
    }

    #[test]
    fn test_memsets() {
        let driver = EmulatedDriver::new();
        let stream = driver.create_stream().unwrap();
        let ptr = driver.allocate(8).unwrap();
        driver.memset_d32(stream, ptr, 0, 0x0403_0201, 2).unwrap();
        driver.memset_d16(stream, ptr, 4, 0xAAAA, 1).unwrap();
        driver.memset_d8(stream, ptr, 7, 0xFF, 1).unwrap();

        let mut out = [0u8; 8];
        driver.copy_dtoh(stream, &mut out, ptr, 0).unwrap();
        let w = 0x0403_0201u32.to_ne_bytes();
        assert_eq!(&out[..4], &w);
        assert_eq!(&out[4..6], &[0xAA, 0xAA]);
        assert_eq!(out[6], w[2]);
        assert_eq!(out[7], 0xFF);
        assert_eq!(driver.stats().memsets, 3);
    }

    #[test]
    fn test_overlapping_dtod() {
        let driver = EmulatedDriver::new();
        let stream = driver.create_stream().unwrap();
        let ptr = driver.allocate(8).unwrap();
        driver
            .copy_htod(stream, ptr, 0, &[1, 2, 3, 4, 5, 6, 7, 8])
            .unwrap();
        driver.copy_dtod(stream, ptr, 2, ptr, 0, 6).unwrap();
        let mut out = [0u8; 8];
        driver.copy_dtoh(stream, &mut out, ptr, 0).unwrap();
        assert_eq!(out, [1, 2, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_registered_host_memory() {
        let driver = EmulatedDriver::new();
        let stream = driver.create_stream().unwrap();
        let mut host = vec![0u8; 4];
        let ptr = NonNull::new(host.as_mut_ptr()).unwrap();
        let dev = unsafe { driver.register_host(ptr, 4) }.unwrap();
        driver.memset_d8(stream, dev, 0, 9, 4).unwrap();
        driver.unregister_host(dev).unwrap();
        assert_eq!(host, [9; 4]);
    }

    #[test]
    fn test_import_aliases_exporter() {
        let driver = EmulatedDriver::new();
        let stream = driver.create_stream().unwrap();
        let segment = HostSegment::new("test-import", 4096).unwrap();
        let fd = segment.export_fd().unwrap().unwrap();

        let dev = driver
            .import_memory(ExternalMemory { fd, size: 4096 })
            .unwrap();
        driver.copy_htod(stream, dev, 100, &[77]).unwrap();
        unsafe { assert_eq!(segment.as_slice()[100], 77) };
        driver.destroy_external_memory(dev).unwrap();
        assert_eq!(driver.live_regions(), 0);
    }

    #[test]
    fn test_import_without_capability() {
        let driver = EmulatedDriver::with_capabilities(DriverCapabilities::NONE);
        let segment = HostSegment::new("test-noimport", 4096).unwrap();
        let fd = segment.export_fd().unwrap().unwrap();
        assert!(matches!(
            driver.import_memory(ExternalMemory { fd, size: 4096 }),
            Err(Error::Import(_))
        ));
    }

    #[test]
    fn test_memory_limit() {
        let driver = EmulatedDriver::new().with_memory_limit(16);
        let a = driver.allocate(12).unwrap();
        assert!(matches!(driver.allocate(8), Err(Error::AllocationFailed(_))));
        driver.free(a).unwrap();
        assert!(driver.allocate(8).is_ok());
    }
}
