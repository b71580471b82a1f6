//! Software peer backend.
//!
//! Stands in for a render API: resources are memfd segments, semaphores are
//! eventfds, and the queue executes everything immediately. Exports can be
//! switched off to exercise the copy-based transfer path, and every
//! resource counts the transfers it served.

use crate::error::{Error, Result, ValidationError};
use crate::flags::{MemoryFlags, PeerApi};
use crate::memory::{HostSegment, MemorySegment};
use crate::peer::{ExternalMemory, ExternalSemaphore, PeerBackend, PeerBuffer};
use crate::queue::{BackendKind, DeviceId, Queue, QueueHandle};
use rustix::event::EventfdFlags;
use rustix::fd::{AsFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Signal an eventfd-backed semaphore.
pub(crate) fn eventfd_signal(fd: impl AsFd) -> Result<()> {
    rustix::io::write(fd, &1u64.to_ne_bytes())?;
    Ok(())
}

/// Consume a pending signal of an eventfd-backed semaphore.
///
/// Fails if the semaphore was never signaled: with immediate execution a
/// wait that would block can never be satisfied.
pub(crate) fn eventfd_wait(fd: impl AsFd) -> Result<()> {
    let mut buf = [0u8; 8];
    match rustix::io::read(fd, &mut buf) {
        Ok(_) => Ok(()),
        Err(rustix::io::Errno::AGAIN) => Err(Error::SharingProtocol(
            "semaphore wait without a pending signal".into(),
        )),
        Err(e) => Err(e.into()),
    }
}

/// Create a non-blocking eventfd semaphore.
pub(crate) fn eventfd_create() -> Result<OwnedFd> {
    Ok(rustix::event::eventfd(
        0,
        EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK,
    )?)
}

/// Queue of the software peer. Work is executed at submission, so `finish`
/// only counts.
#[derive(Debug)]
pub struct SoftQueue {
    handle: QueueHandle,
    device: DeviceId,
    api: PeerApi,
    finishes: AtomicU64,
    flushes: AtomicU64,
}

impl SoftQueue {
    /// Create a queue on a fresh device of `api`.
    pub fn new(api: PeerApi) -> Self {
        Self {
            handle: QueueHandle::next(),
            device: DeviceId::next(),
            api,
            finishes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    /// Number of `finish` calls so far.
    pub fn finish_count(&self) -> u64 {
        self.finishes.load(Ordering::Relaxed)
    }

    /// Number of `flush` calls so far.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

impl Queue for SoftQueue {
    fn finish(&self) -> Result<()> {
        self.finishes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn queue_handle(&self) -> QueueHandle {
        self.handle
    }

    fn device_id(&self) -> DeviceId {
        self.device
    }

    fn backend(&self) -> BackendKind {
        self.api.into()
    }
}

/// What the software peer exports.
#[derive(Debug, Clone, Copy)]
pub struct SoftPeerConfig {
    /// Export resource memory as a memfd.
    pub export_memory: bool,
    /// Export an eventfd semaphore per resource.
    pub export_semaphore: bool,
}

impl Default for SoftPeerConfig {
    fn default() -> Self {
        Self {
            export_memory: true,
            export_semaphore: true,
        }
    }
}

/// Transfer counters of software peer resources.
#[derive(Debug, Default)]
pub struct TransferStats {
    reads: AtomicU64,
    writes: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    signals: AtomicU64,
    waits: AtomicU64,
}

/// Point-in-time copy of [`TransferStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSnapshot {
    /// `read` calls.
    pub reads: u64,
    /// `write` calls.
    pub writes: u64,
    /// Bytes read.
    pub bytes_read: u64,
    /// Bytes written.
    pub bytes_written: u64,
    /// Semaphore signals issued by the peer.
    pub signals: u64,
    /// Semaphore waits issued by the peer.
    pub waits: u64,
}

impl TransferSnapshot {
    /// Number of data copies in either direction.
    pub fn copies(&self) -> u64 {
        self.reads + self.writes
    }
}

impl TransferStats {
    /// Take a snapshot.
    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            signals: self.signals.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
        }
    }
}

/// Software peer backend for one API tag.
///
/// Transfer counters are shared by all resources the backend creates.
pub struct SoftPeerBackend {
    api: PeerApi,
    queue: Arc<SoftQueue>,
    config: SoftPeerConfig,
    stats: Arc<TransferStats>,
}

impl SoftPeerBackend {
    /// Backend exporting memory and semaphores.
    pub fn new(api: PeerApi) -> Self {
        Self::with_config(api, SoftPeerConfig::default())
    }

    /// Backend with explicit export settings.
    pub fn with_config(api: PeerApi, config: SoftPeerConfig) -> Self {
        Self {
            api,
            queue: Arc::new(SoftQueue::new(api)),
            config,
            stats: Arc::default(),
        }
    }

    /// The default queue, with its counters.
    pub fn queue(&self) -> &Arc<SoftQueue> {
        &self.queue
    }

    /// Transfer counters of every resource created by this backend.
    pub fn stats(&self) -> Arc<TransferStats> {
        Arc::clone(&self.stats)
    }

    /// Create a resource directly, keeping the concrete type.
    pub fn create(&self, size: usize, host_data: Option<&[u8]>) -> Result<SoftPeerBuffer> {
        SoftPeerBuffer::new(
            self.api,
            self.queue.clone(),
            size,
            host_data,
            self.config,
            self.stats(),
        )
    }
}

impl PeerBackend for SoftPeerBackend {
    fn api(&self) -> PeerApi {
        self.api
    }

    fn default_queue(&self) -> Arc<dyn Queue> {
        self.queue.clone()
    }

    fn create_buffer(
        &self,
        queue: Arc<dyn Queue>,
        size: usize,
        host_data: Option<&[u8]>,
        flags: MemoryFlags,
    ) -> Result<Box<dyn PeerBuffer>> {
        tracing::trace!(api = %self.api, size, ?flags, "soft peer create");
        Ok(Box::new(SoftPeerBuffer::new(
            self.api,
            queue,
            size,
            host_data,
            self.config,
            self.stats(),
        )?))
    }
}

impl std::fmt::Debug for SoftPeerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftPeerBackend")
            .field("api", &self.api)
            .field("config", &self.config)
            .finish()
    }
}

/// A software peer resource.
pub struct SoftPeerBuffer {
    api: PeerApi,
    segment: HostSegment,
    size: usize,
    semaphore: Option<OwnedFd>,
    queue: Arc<dyn Queue>,
    config: SoftPeerConfig,
    stats: Arc<TransferStats>,
}

impl SoftPeerBuffer {
    fn new(
        api: PeerApi,
        queue: Arc<dyn Queue>,
        size: usize,
        host_data: Option<&[u8]>,
        config: SoftPeerConfig,
        stats: Arc<TransferStats>,
    ) -> Result<Self> {
        let segment = HostSegment::new("peermem-soft-peer", size)?;
        if let Some(data) = host_data {
            let len = data.len().min(size);
            // SAFETY: the segment was just created and is not shared yet.
            unsafe { segment.as_mut_slice()[..len].copy_from_slice(&data[..len]) };
        }
        let semaphore = if config.export_semaphore {
            Some(eventfd_create()?)
        } else {
            None
        };
        Ok(Self {
            api,
            segment,
            size,
            semaphore,
            queue,
            config,
            stats,
        })
    }

    /// Transfer counters (shared with the creating backend).
    pub fn stats(&self) -> Arc<TransferStats> {
        Arc::clone(&self.stats)
    }

    fn check_range(&self, len: usize, offset: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(ValidationError::RangeOutOfBounds {
                offset,
                len,
                size: self.size,
            }
            .into()),
        }
    }

    fn semaphore(&self) -> Result<&OwnedFd> {
        self.semaphore.as_ref().ok_or_else(|| {
            Error::UnsupportedConfiguration("peer resource has no semaphore".into())
        })
    }
}

impl PeerBuffer for SoftPeerBuffer {
    fn api(&self) -> PeerApi {
        self.api
    }

    fn size(&self) -> usize {
        self.size
    }

    fn read(&self, dst: &mut [u8], offset: usize) -> Result<()> {
        self.check_range(dst.len(), offset)?;
        // SAFETY: range checked; ownership protocol serializes access.
        let src = unsafe { &self.segment.as_slice()[offset..offset + dst.len()] };
        dst.copy_from_slice(src);
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_read
            .fetch_add(dst.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn write(&self, src: &[u8], offset: usize) -> Result<()> {
        self.check_range(src.len(), offset)?;
        // SAFETY: as in `read`.
        let dst = unsafe { &mut self.segment.as_mut_slice()[offset..offset + src.len()] };
        dst.copy_from_slice(src);
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_written
            .fetch_add(src.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn export_memory(&self) -> Result<Option<ExternalMemory>> {
        if !self.config.export_memory {
            return Ok(None);
        }
        Ok(self.segment.export_fd()?.map(|fd| ExternalMemory {
            fd,
            size: self.size,
        }))
    }

    fn export_semaphore(&self) -> Result<Option<ExternalSemaphore>> {
        match &self.semaphore {
            Some(fd) => Ok(Some(ExternalSemaphore {
                fd: rustix::io::fcntl_dupfd_cloexec(fd, 0)?,
            })),
            None => Ok(None),
        }
    }

    fn signal_semaphore(&self, _queue: &dyn Queue) -> Result<()> {
        eventfd_signal(self.semaphore()?)?;
        self.stats.signals.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn wait_semaphore(&self, _queue: &dyn Queue) -> Result<()> {
        eventfd_wait(self.semaphore()?)?;
        self.stats.waits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn queue(&self) -> &dyn Queue {
        self.queue.as_ref()
    }
}

impl std::fmt::Debug for SoftPeerBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftPeerBuffer")
            .field("api", &self.api)
            .field("size", &self.size)
            .field("segment", &self.segment)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MappedSegment;

    #[test]
    fn test_read_write() {
        let backend = SoftPeerBackend::new(PeerApi::Metal);
        let buffer = backend.create(16, Some(&[1, 2, 3, 4])).unwrap();
        let mut out = [0u8; 4];
        buffer.read(&mut out, 0).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);

        buffer.write(&[9, 9], 14).unwrap();
        let mut tail = [0u8; 2];
        buffer.read(&mut tail, 14).unwrap();
        assert_eq!(tail, [9, 9]);

        let stats = buffer.stats().snapshot();
        assert_eq!(stats.reads, 2);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.bytes_written, 2);
    }

    #[test]
    fn test_out_of_range() {
        let backend = SoftPeerBackend::new(PeerApi::Vulkan);
        let buffer = backend.create(8, None).unwrap();
        let mut out = [0u8; 4];
        assert!(buffer.read(&mut out, 6).is_err());
        assert!(buffer.write(&[0; 4], usize::MAX).is_err());
        assert_eq!(buffer.stats().snapshot().copies(), 0);
    }

    #[test]
    fn test_exported_memory_aliases() {
        let backend = SoftPeerBackend::new(PeerApi::Vulkan);
        let buffer = backend.create(4096, None).unwrap();
        let exported = buffer.export_memory().unwrap().unwrap();
        assert_eq!(exported.size, 4096);

        let mapped = MappedSegment::from_fd(exported.fd, 4096).unwrap();
        buffer.write(&[42], 10).unwrap();
        unsafe { assert_eq!(mapped.as_slice()[10], 42) };
    }

    #[test]
    fn test_exports_disabled() {
        let config = SoftPeerConfig {
            export_memory: false,
            export_semaphore: false,
        };
        let backend = SoftPeerBackend::with_config(PeerApi::Vulkan, config);
        let buffer = backend.create(16, None).unwrap();
        assert!(buffer.export_memory().unwrap().is_none());
        assert!(buffer.export_semaphore().unwrap().is_none());
        assert!(buffer.signal_semaphore(backend.queue().as_ref()).is_err());
    }

    #[test]
    fn test_semaphore_signal_wait() {
        let backend = SoftPeerBackend::new(PeerApi::Vulkan);
        let buffer = backend.create(16, None).unwrap();
        let queue = backend.queue().as_ref();

        assert!(matches!(
            buffer.wait_semaphore(queue),
            Err(Error::SharingProtocol(_))
        ));
        buffer.signal_semaphore(queue).unwrap();
        buffer.wait_semaphore(queue).unwrap();

        // An exported handle refers to the same semaphore.
        let exported = buffer.export_semaphore().unwrap().unwrap();
        eventfd_signal(&exported.fd).unwrap();
        buffer.wait_semaphore(queue).unwrap();
    }

    #[test]
    fn test_queue_counters() {
        let queue = SoftQueue::new(PeerApi::Metal);
        queue.finish().unwrap();
        queue.flush().unwrap();
        queue.finish().unwrap();
        assert_eq!(queue.finish_count(), 2);
        assert_eq!(queue.flush_count(), 1);
        assert_eq!(queue.backend(), BackendKind::Metal);
    }
}
