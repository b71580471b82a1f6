//! Host-addressable backing segments.
//!
//! - [`HostSegment`]: memfd-backed memory, mapped `MAP_SHARED`, exportable
//!   as a file descriptor so that another API can import the same pages.
//! - [`MappedSegment`]: a mapping of a received file descriptor.
//! - [`ForeignSegment`]: caller-owned memory used directly as a backing store.

use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter for generating unique segment IDs.
static SEGMENT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_segment_id() -> u64 {
    SEGMENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Where a segment's memory comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    /// Anonymous memfd owned by this process.
    Memfd,
    /// Mapping of a file descriptor received from elsewhere.
    Mapped,
    /// Memory owned by the caller.
    Foreign,
}

/// A contiguous, host-addressable memory region.
///
/// # Safety
///
/// Implementations must keep the pointer valid and stable for the lifetime
/// of the segment.
pub trait MemorySegment: Send + Sync {
    /// Pointer to the start of the segment.
    fn as_ptr(&self) -> *const u8;

    /// Mutable pointer to the start of the segment.
    fn as_mut_ptr(&self) -> *mut u8;

    /// Size of the segment in bytes.
    fn len(&self) -> usize;

    /// Returns true if the segment has zero length.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Where the memory comes from.
    fn kind(&self) -> SegmentKind;

    /// Duplicate a file descriptor that refers to this memory, if the
    /// segment is fd-backed.
    fn export_fd(&self) -> Result<Option<OwnedFd>> {
        Ok(None)
    }

    /// Does `ptr` point into this segment?
    fn contains(&self, ptr: *const u8) -> bool {
        let start = self.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr < start + self.len()
    }

    /// Get the segment as a byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure no mutable references exist to this memory.
    unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: Caller guarantees no mutable references exist.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len()) }
    }

    /// Get the segment as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure exclusive access to this memory.
    #[allow(clippy::mut_from_ref)]
    unsafe fn as_mut_slice(&self) -> &mut [u8] {
        // SAFETY: Caller guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), self.len()) }
    }
}

fn map_shared(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>> {
    let ptr = unsafe {
        rustix::mm::mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )?
    };
    NonNull::new(ptr.cast::<u8>())
        .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))
}

/// memfd-backed host memory.
///
/// Zero-initialized, mapped `MAP_SHARED`, so a duplicated fd mapped by
/// another API sees the same physical pages.
pub struct HostSegment {
    /// The memfd file descriptor.
    fd: OwnedFd,
    /// Pointer to the mmap'd region.
    ptr: NonNull<u8>,
    /// Size of the segment in bytes.
    len: usize,
    /// Unique ID for this segment.
    id: u64,
    /// Debug name.
    name: String,
}

impl HostSegment {
    /// Allocate `size` bytes of zeroed host memory.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is 0 or if `memfd_create`, `ftruncate` or
    /// `mmap` fail.
    pub fn new(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailed(
                "size must be greater than 0".into(),
            ));
        }

        let fd = rustix::fs::memfd_create(name, rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, size as u64)?;
        let ptr = map_shared(&fd, size)?;

        Ok(Self {
            fd,
            ptr,
            len: size,
            id: next_segment_id(),
            name: name.to_string(),
        })
    }

    /// Borrow the memfd.
    #[inline]
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Unique segment ID.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Debug name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl MemorySegment for HostSegment {
    #[inline]
    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    fn len(&self) -> usize {
        self.len
    }

    fn kind(&self) -> SegmentKind {
        SegmentKind::Memfd
    }

    fn export_fd(&self) -> Result<Option<OwnedFd>> {
        Ok(Some(rustix::io::fcntl_dupfd_cloexec(&self.fd, 0)?))
    }
}

impl Drop for HostSegment {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
        // fd is closed when OwnedFd is dropped
    }
}

// SAFETY: the mapping can be accessed from any thread; concurrent access
// requires external synchronization, as with any shared memory.
unsafe impl Send for HostSegment {}
unsafe impl Sync for HostSegment {}

impl std::fmt::Debug for HostSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSegment")
            .field("fd", &self.fd.as_raw_fd())
            .field("len", &self.len)
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// A mapping of a file descriptor received from another API.
pub struct MappedSegment {
    fd: OwnedFd,
    ptr: NonNull<u8>,
    len: usize,
}

impl MappedSegment {
    /// Map `len` bytes of `fd` read/write.
    ///
    /// Fails if the descriptor is smaller than `len` or is not mappable.
    pub fn from_fd(fd: OwnedFd, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Import("mapping size must be greater than 0".into()));
        }
        let stat = rustix::fs::fstat(&fd)?;
        if (stat.st_size as u64) < len as u64 {
            return Err(Error::Import(format!(
                "descriptor holds {} bytes, {} requested",
                stat.st_size, len
            )));
        }
        let ptr = map_shared(&fd, len).map_err(|e| Error::Import(format!("mmap failed: {e}")))?;
        Ok(Self { fd, ptr, len })
    }
}

impl MemorySegment for MappedSegment {
    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }

    fn kind(&self) -> SegmentKind {
        SegmentKind::Mapped
    }

    fn export_fd(&self) -> Result<Option<OwnedFd>> {
        Ok(Some(rustix::io::fcntl_dupfd_cloexec(&self.fd, 0)?))
    }
}

impl Drop for MappedSegment {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

// SAFETY: same reasoning as HostSegment.
unsafe impl Send for MappedSegment {}
unsafe impl Sync for MappedSegment {}

impl std::fmt::Debug for MappedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedSegment")
            .field("fd", &self.fd.as_raw_fd())
            .field("len", &self.len)
            .finish()
    }
}

/// Caller-owned memory used in place as a backing store.
#[derive(Debug)]
pub struct ForeignSegment {
    ptr: NonNull<u8>,
    len: usize,
}

impl ForeignSegment {
    /// Wrap `len` bytes at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for as long
    /// as the segment (and anything built on it) lives, and must not be
    /// accessed through other references while it is in use.
    pub unsafe fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }
}

impl MemorySegment for ForeignSegment {
    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }

    fn kind(&self) -> SegmentKind {
        SegmentKind::Foreign
    }
}

// SAFETY: the creator of a ForeignSegment guarantees the memory outlives it
// and is not aliased; moving the pointer between threads is then sound.
unsafe impl Send for ForeignSegment {}
unsafe impl Sync for ForeignSegment {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_segment_creation() {
        let segment = HostSegment::new("test-host", 4096).unwrap();
        assert_eq!(segment.len(), 4096);
        assert_eq!(segment.kind(), SegmentKind::Memfd);
        assert_eq!(segment.name(), "test-host");
        assert!(segment.id() > 0);
    }

    #[test]
    fn test_host_segment_zero_size_fails() {
        assert!(HostSegment::new("test", 0).is_err());
    }

    #[test]
    fn test_host_segment_is_zeroed() {
        let segment = HostSegment::new("test-zero", 1024).unwrap();
        unsafe {
            assert!(segment.as_slice().iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_exported_fd_shares_pages() {
        let segment = HostSegment::new("test-export", 4096).unwrap();
        unsafe {
            segment.as_mut_slice()[0] = 77;
        }

        let fd = segment.export_fd().unwrap().unwrap();
        let mapped = MappedSegment::from_fd(fd, 4096).unwrap();
        assert_eq!(mapped.kind(), SegmentKind::Mapped);
        unsafe {
            assert_eq!(mapped.as_slice()[0], 77);
            mapped.as_mut_slice()[100] = 88;
            assert_eq!(segment.as_slice()[100], 88);
        }
    }

    #[test]
    fn test_mapped_segment_rejects_short_fd() {
        let segment = HostSegment::new("test-short", 1024).unwrap();
        let fd = segment.export_fd().unwrap().unwrap();
        assert!(matches!(
            MappedSegment::from_fd(fd, 8192),
            Err(Error::Import(_))
        ));
    }

    #[test]
    fn test_foreign_segment() {
        let mut data = vec![1u8, 2, 3, 4];
        let ptr = NonNull::new(data.as_mut_ptr()).unwrap();
        let segment = unsafe { ForeignSegment::new(ptr, data.len()) };
        assert_eq!(segment.kind(), SegmentKind::Foreign);
        assert!(segment.export_fd().unwrap().is_none());
        assert!(segment.contains(segment.as_ptr()));
        assert!(!segment.contains(unsafe { segment.as_ptr().add(4) }));
        unsafe {
            segment.as_mut_slice()[0] = 9;
        }
        drop(segment);
        assert_eq!(data[0], 9);
    }
}
