//! Accelerator driver contract.
//!
//! The accelerator backend talks to hardware only through [`Driver`].
//! Operations taking a [`StreamId`] are enqueued on that stream and may
//! complete asynchronously; [`Driver::synchronize`] is the only wait.

use crate::error::Result;
use crate::peer::{ExternalMemory, ExternalSemaphore};
use std::ptr::NonNull;

/// A device address returned by allocation, registration or import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub u64);

/// A driver stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

/// An imported external semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreHandle(pub u64);

/// Optional driver features.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverCapabilities {
    /// Can import peer memory exported as an fd.
    pub external_memory: bool,
    /// Can import peer semaphores exported as an fd.
    pub external_semaphore: bool,
}

impl DriverCapabilities {
    /// No optional features.
    pub const NONE: Self = Self {
        external_memory: false,
        external_semaphore: false,
    };

    /// Every optional feature.
    pub const ALL: Self = Self {
        external_memory: true,
        external_semaphore: true,
    };
}

/// A compute accelerator driver.
pub trait Driver: Send + Sync {
    /// Driver name, for logs.
    fn name(&self) -> &str;

    /// Optional features.
    fn capabilities(&self) -> DriverCapabilities;

    /// Create a stream.
    fn create_stream(&self) -> Result<StreamId>;

    /// Destroy a stream. Pending work is completed first.
    fn destroy_stream(&self, stream: StreamId) -> Result<()>;

    /// Block until all work enqueued on `stream` has completed.
    fn synchronize(&self, stream: StreamId) -> Result<()>;

    /// Allocate `size` bytes of device memory.
    fn allocate(&self, size: usize) -> Result<DevicePtr>;

    /// Free memory returned by [`allocate`](Self::allocate).
    fn free(&self, ptr: DevicePtr) -> Result<()>;

    /// Make `size` bytes of host memory at `ptr` device-accessible.
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid for reads and writes of `size` bytes until
    /// [`unregister_host`](Self::unregister_host).
    unsafe fn register_host(&self, ptr: NonNull<u8>, size: usize) -> Result<DevicePtr>;

    /// Undo [`register_host`](Self::register_host).
    fn unregister_host(&self, ptr: DevicePtr) -> Result<()>;

    /// Copy `src` to `dst + dst_offset`.
    ///
    /// `src` must stay untouched until the stream is synchronized.
    fn copy_htod(
        &self,
        stream: StreamId,
        dst: DevicePtr,
        dst_offset: usize,
        src: &[u8],
    ) -> Result<()>;

    /// Copy `dst.len()` bytes at `src + src_offset` into `dst`.
    ///
    /// `dst` holds the data only after the stream is synchronized.
    fn copy_dtoh(
        &self,
        stream: StreamId,
        dst: &mut [u8],
        src: DevicePtr,
        src_offset: usize,
    ) -> Result<()>;

    /// Copy `size` bytes between device ranges. Overlap behaves like
    /// `memmove`.
    #[allow(clippy::too_many_arguments)]
    fn copy_dtod(
        &self,
        stream: StreamId,
        dst: DevicePtr,
        dst_offset: usize,
        src: DevicePtr,
        src_offset: usize,
        size: usize,
    ) -> Result<()>;

    /// Set `count` bytes at `dst + offset` to `value`.
    fn memset_d8(
        &self,
        stream: StreamId,
        dst: DevicePtr,
        offset: usize,
        value: u8,
        count: usize,
    ) -> Result<()>;

    /// Set `count` 16-bit words at `dst + offset` to `value`.
    fn memset_d16(
        &self,
        stream: StreamId,
        dst: DevicePtr,
        offset: usize,
        value: u16,
        count: usize,
    ) -> Result<()>;

    /// Set `count` 32-bit words at `dst + offset` to `value`.
    fn memset_d32(
        &self,
        stream: StreamId,
        dst: DevicePtr,
        offset: usize,
        value: u32,
        count: usize,
    ) -> Result<()>;

    /// Import peer memory. The returned address aliases the peer's pages.
    fn import_memory(&self, memory: ExternalMemory) -> Result<DevicePtr>;

    /// Release memory returned by [`import_memory`](Self::import_memory).
    fn destroy_external_memory(&self, ptr: DevicePtr) -> Result<()>;

    /// Import a peer semaphore.
    fn import_semaphore(&self, semaphore: ExternalSemaphore) -> Result<SemaphoreHandle>;

    /// Release a semaphore returned by
    /// [`import_semaphore`](Self::import_semaphore).
    fn destroy_external_semaphore(&self, semaphore: SemaphoreHandle) -> Result<()>;

    /// Signal `semaphore` once the work enqueued on `stream` is done.
    fn signal_semaphore(&self, stream: StreamId, semaphore: SemaphoreHandle) -> Result<()>;

    /// Make `stream` wait for `semaphore`.
    fn wait_semaphore(&self, stream: StreamId, semaphore: SemaphoreHandle) -> Result<()>;
}
