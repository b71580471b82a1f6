//! Staging allocations backing `map` on backends without host access to
//! device memory.

use super::lock;
use super::segment::{HostSegment, MemorySegment};
use crate::defaults::page_align;
use crate::error::Result;
use crate::flags::MapFlags;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Mutex;

/// One outstanding map.
#[derive(Debug)]
pub(crate) struct StagingMap {
    /// Host memory handed out to the caller.
    pub(crate) segment: HostSegment,
    /// Mapped byte count.
    pub(crate) size: usize,
    /// Offset of the mapped range within the resource.
    pub(crate) offset: usize,
    /// Flags the range was mapped with.
    pub(crate) flags: MapFlags,
}

impl StagingMap {
    /// Allocate page-aligned staging memory for `size` bytes, rounded up to
    /// whole pages.
    pub(crate) fn allocate(size: usize, offset: usize, flags: MapFlags) -> Result<Self> {
        let segment = HostSegment::new("peermem-staging", page_align(size.max(1)))?;
        Ok(Self {
            segment,
            size,
            offset,
            flags,
        })
    }

    /// Does unmapping have to write the staging contents back?
    pub(crate) fn writes_back(&self) -> bool {
        self.flags
            .intersects(MapFlags::WRITE | MapFlags::WRITE_INVALIDATE)
    }

    /// The mapped bytes.
    ///
    /// # Safety
    ///
    /// The caller must ensure nobody writes through the mapped pointer
    /// while the slice is alive.
    pub(crate) unsafe fn bytes(&self) -> &[u8] {
        unsafe { &self.segment.as_slice()[..self.size] }
    }

    /// The mapped bytes, mutably.
    ///
    /// # Safety
    ///
    /// The caller must ensure exclusive access.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn bytes_mut(&self) -> &mut [u8] {
        unsafe { &mut self.segment.as_mut_slice()[..self.size] }
    }
}

/// Outstanding maps keyed by the pointer returned to the caller.
#[derive(Debug, Default)]
pub(crate) struct StagingRegistry {
    maps: Mutex<HashMap<usize, StagingMap>>,
}

impl StagingRegistry {
    /// Record a map and return the pointer handed to the caller.
    pub(crate) fn insert(&self, map: StagingMap) -> NonNull<u8> {
        let ptr = map.segment.as_mut_ptr();
        lock(&self.maps).insert(ptr as usize, map);
        // SAFETY: mmap never returns null on success.
        unsafe { NonNull::new_unchecked(ptr) }
    }

    /// Remove and return the map that produced `ptr`.
    pub(crate) fn take(&self, ptr: NonNull<u8>) -> Option<StagingMap> {
        lock(&self.maps).remove(&(ptr.as_ptr() as usize))
    }

    /// Number of outstanding maps.
    pub(crate) fn outstanding(&self) -> usize {
        lock(&self.maps).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_take() {
        let registry = StagingRegistry::default();
        let map = StagingMap::allocate(64, 16, MapFlags::READ).unwrap();
        let ptr = registry.insert(map);
        assert_eq!(registry.outstanding(), 1);

        let map = registry.take(ptr).unwrap();
        assert_eq!(map.size, 64);
        assert_eq!(map.offset, 16);
        assert!(!map.writes_back());
        assert_eq!(registry.outstanding(), 0);
        assert!(registry.take(ptr).is_none());
    }

    #[test]
    fn test_writes_back() {
        for flags in [MapFlags::WRITE, MapFlags::WRITE_INVALIDATE, MapFlags::READ_WRITE] {
            assert!(StagingMap::allocate(8, 0, flags).unwrap().writes_back());
        }
    }

    #[test]
    fn test_staging_is_page_aligned() {
        let map = StagingMap::allocate(10, 0, MapFlags::WRITE).unwrap();
        assert_eq!(map.segment.as_ptr() as usize % crate::defaults::PAGE_SIZE, 0);
        assert_eq!(map.segment.len(), crate::defaults::PAGE_SIZE);
        unsafe {
            map.bytes_mut().copy_from_slice(&[7; 10]);
            assert_eq!(map.bytes(), &[7; 10]);
        }
    }
}
