//! Integration tests for the ownership-transfer protocol on both compute
//! backends, observed through software peer statistics and queue counters.

use peermem::accel::{AccelBuffer, AccelDevice, AccelQueue, EmulatedDriver};
use peermem::peer::soft::{SoftPeerConfig, SoftQueue};
use peermem::peer::{ExternalMemory, ExternalSemaphore};
use peermem::prelude::*;
use std::sync::Arc;

const RW: MemoryFlags = MemoryFlags::READ_WRITE.union(MemoryFlags::HOST_READ_WRITE);

struct HostSetup {
    peer: Arc<SoftPeerBackend>,
    queue: HostQueue,
}

fn host(api: PeerApi) -> HostSetup {
    let peer = Arc::new(SoftPeerBackend::new(api));
    let device = Arc::new(HostDevice::new(HostConfig::default()).with_peer(peer.clone()));
    HostSetup {
        peer,
        queue: device.create_queue(),
    }
}

struct AccelSetup {
    driver: Arc<EmulatedDriver>,
    peer: Arc<SoftPeerBackend>,
    queue: AccelQueue,
}

fn accel(peer_config: SoftPeerConfig) -> AccelSetup {
    let driver = Arc::new(EmulatedDriver::new());
    let peer = Arc::new(SoftPeerBackend::with_config(PeerApi::Vulkan, peer_config));
    let device = Arc::new(
        AccelDevice::new(driver.clone(), AccelConfig::default()).with_peer(peer.clone()),
    );
    AccelSetup {
        driver,
        peer,
        queue: device.create_queue().unwrap(),
    }
}

fn host_shared(setup: &HostSetup, size: usize, extra: MemoryFlags) -> HostBuffer {
    let flags = RW | setup.peer.api().sharing_flag() | extra;
    HostBuffer::new(&setup.queue, BufferDesc::new(size, flags))
        .unwrap()
        .unwrap()
}

// ============================================================================
// No-op Transitions
// ============================================================================

/// Acquire on a compute-owned resource and release/sync on a peer-owned one
/// move no data and drain no queue.
#[test]
fn test_redundant_transitions_are_free() {
    let setup = host(PeerApi::Vulkan);
    let buf = host_shared(&setup, 64, MemoryFlags::empty());
    let stats = setup.peer.stats();

    let before = stats.snapshot();
    buf.acquire_peer(None, None).unwrap();
    assert_eq!(stats.snapshot(), before);
    assert_eq!(setup.queue.finish_count(), 0);
    assert_eq!(setup.peer.queue().finish_count(), 0);

    buf.release_peer(None, None).unwrap();
    let after_release = stats.snapshot();
    assert_eq!(after_release.writes, 1);
    let finishes = (setup.queue.finish_count(), setup.peer.queue().finish_count());

    buf.release_peer(None, None).unwrap();
    buf.sync_peer(None, None).unwrap();
    assert_eq!(stats.snapshot(), after_release);
    assert_eq!(
        (setup.queue.finish_count(), setup.peer.queue().finish_count()),
        finishes
    );
    assert_eq!(buf.ownership(), Some(Ownership::Peer));
}

// ============================================================================
// Sync Policy
// ============================================================================

/// The peer never writes: acquire is a pure state flip.
#[test]
fn test_render_read_only_acquire_flips() {
    let setup = host(PeerApi::Metal);
    let buf = host_shared(
        &setup,
        64,
        MemoryFlags::SHARING_SYNC
            | MemoryFlags::SHARING_COMPUTE_READ_WRITE
            | MemoryFlags::SHARING_RENDER_READ,
    );
    let stats = setup.peer.stats();

    buf.release_peer(None, None).unwrap();
    assert_eq!(stats.snapshot().writes, 1);

    let drains = setup.queue.finish_count();
    buf.acquire_peer(None, None).unwrap();
    assert_eq!(buf.ownership(), Some(Ownership::Compute));
    assert_eq!(stats.snapshot().reads, 0);
    assert_eq!(setup.queue.finish_count(), drains);
}

/// Compute never writes: release and sync are state-only.
#[test]
fn test_compute_read_only_release_flips() {
    let setup = host(PeerApi::Vulkan);
    let buf = host_shared(
        &setup,
        64,
        MemoryFlags::SHARING_SYNC
            | MemoryFlags::SHARING_COMPUTE_READ
            | MemoryFlags::SHARING_RENDER_READ_WRITE,
    );
    let stats = setup.peer.stats();

    buf.sync_peer(None, None).unwrap();
    buf.release_peer(None, None).unwrap();
    assert_eq!(stats.snapshot().copies(), 0);
    assert_eq!(setup.queue.finish_count(), 0);

    // What the peer renders while it owns the data reaches compute.
    buf.shared_peer().unwrap().buffer().write(&[0x5A; 64], 0).unwrap();
    buf.acquire_peer(None, None).unwrap();
    assert_eq!(stats.snapshot().reads, 1);
    assert_eq!(buf.read_vec(&setup.queue, 0, 0).unwrap(), [0x5A; 64]);
}

/// Same policy on an accelerator that copies instead of importing.
#[test]
fn test_accel_compute_read_only_release_flips() {
    let setup = accel(SoftPeerConfig {
        export_memory: false,
        export_semaphore: false,
    });
    let config = AccelConfig {
        import_peer_memory: false,
        ..AccelConfig::default()
    };
    let device = Arc::new(
        AccelDevice::new(setup.driver.clone(), config).with_peer(setup.peer.clone()),
    );
    let queue = device.create_queue().unwrap();
    let flags = RW
        | MemoryFlags::VULKAN_SHARING
        | MemoryFlags::SHARING_SYNC
        | MemoryFlags::SHARING_COMPUTE_READ
        | MemoryFlags::SHARING_RENDER_READ_WRITE;
    let buf = AccelBuffer::new(&queue, BufferDesc::new(64, flags))
        .unwrap()
        .unwrap();
    assert!(!buf.is_imported());
    let stats = setup.peer.stats();

    buf.fill(&queue, &[1], 0, 0).unwrap();
    let dtoh = setup.driver.stats().dtoh_bytes;
    buf.release_peer(Some(&queue), None).unwrap();
    assert_eq!(stats.snapshot().copies(), 0);
    assert_eq!(setup.driver.stats().dtoh_bytes, dtoh);

    buf.shared_peer().unwrap().buffer().write(&[0x5A; 64], 0).unwrap();
    buf.acquire_peer(Some(&queue), None).unwrap();
    assert_eq!(stats.snapshot().reads, 1);
    assert_eq!(buf.read_vec(&queue, 0, 0).unwrap(), [0x5A; 64]);
}

/// `SHARING_SYNC` with every direction, `SHARING_SYNC` alone and no
/// `SHARING_SYNC` at all behave the same.
#[test]
fn test_policy_equivalence() {
    let variants = [
        MemoryFlags::empty(),
        MemoryFlags::SHARING_SYNC,
        MemoryFlags::SHARING_SYNC
            | MemoryFlags::SHARING_COMPUTE_READ_WRITE
            | MemoryFlags::SHARING_RENDER_READ_WRITE,
    ];
    let observed: Vec<_> = variants
        .into_iter()
        .map(|extra| {
            let setup = host(PeerApi::Vulkan);
            let buf = host_shared(&setup, 32, extra);
            buf.sync_peer(None, None).unwrap();
            buf.release_peer(None, None).unwrap();
            buf.acquire_peer(None, None).unwrap();
            (
                setup.peer.stats().snapshot(),
                setup.queue.finish_count(),
                setup.peer.queue().finish_count(),
            )
        })
        .collect();
    assert_eq!(observed[0], observed[1]);
    assert_eq!(observed[0], observed[2]);
    assert_eq!(observed[0].0.copies(), 3);
}

// ============================================================================
// Data Movement
// ============================================================================

/// Release publishes compute data, the peer modifies it, acquire brings the
/// modification back.
#[test]
fn test_host_round_trip_through_peer() {
    let setup = host(PeerApi::Vulkan);
    let buf = host_shared(&setup, 16, MemoryFlags::empty());
    let queue = &setup.queue;

    buf.fill(queue, &[1], 0, 0).unwrap();
    buf.release_peer(Some(queue), None).unwrap();

    let peer = buf.shared_peer().unwrap().buffer();
    let mut seen = [0u8; 16];
    peer.read(&mut seen, 0).unwrap();
    assert_eq!(seen, [1; 16]);
    peer.write(&[2; 8], 8).unwrap();

    buf.acquire_peer(Some(queue), Some(peer.queue())).unwrap();
    let bytes = buf.read_vec(queue, 0, 0).unwrap();
    assert_eq!(&bytes[..8], &[1; 8]);
    assert_eq!(&bytes[8..], &[2; 8]);
}

/// Sync publishes but keeps compute ownership.
#[test]
fn test_sync_keeps_ownership() {
    let setup = host(PeerApi::Metal);
    let buf = host_shared(&setup, 16, MemoryFlags::empty());
    buf.write(&setup.queue, &[5; 16], 0).unwrap();
    buf.sync_peer(None, None).unwrap();
    assert_eq!(buf.ownership(), Some(Ownership::Compute));

    let mut seen = [0u8; 16];
    buf.shared_peer().unwrap().buffer().read(&mut seen, 0).unwrap();
    assert_eq!(seen, [5; 16]);
}

/// A wrapped peer is authoritative at creation and survives the resource.
#[test]
fn test_wrapped_peer() {
    let setup = host(PeerApi::Vulkan);
    let existing = setup.peer.create(32, Some(&[7; 32])).unwrap();
    let existing: Arc<dyn PeerBuffer> = Arc::new(existing);

    let ignored = [1u8; 16];
    let buf = HostBuffer::new(
        &setup.queue,
        BufferDesc::new(16, RW | MemoryFlags::VULKAN_SHARING)
            .with_peer(existing.clone())
            .with_host_data(&ignored),
    )
    .unwrap()
    .unwrap();
    assert_eq!(buf.ownership(), Some(Ownership::Peer));
    assert!(!buf.shared_peer().unwrap().handle().is_owned());

    buf.acquire_peer(None, None).unwrap();
    assert_eq!(buf.read_vec(&setup.queue, 0, 0).unwrap(), [7; 16]);

    drop(buf);
    assert_eq!(Arc::strong_count(&existing), 1);
    let mut out = [0u8; 4];
    existing.read(&mut out, 28).unwrap();
    assert_eq!(out, [7; 4]);
}

#[test]
fn test_missing_peer_backend() {
    let device = Arc::new(HostDevice::new(HostConfig::default()));
    let queue = device.create_queue();
    assert!(matches!(
        HostBuffer::new(&queue, BufferDesc::new(16, RW | MemoryFlags::METAL_SHARING)),
        Err(Error::UnsupportedConfiguration(_))
    ));
}

// ============================================================================
// Failure Handling
// ============================================================================

/// A peer whose data path always fails.
struct BrokenPeer {
    queue: SoftQueue,
}

impl PeerBuffer for BrokenPeer {
    fn api(&self) -> PeerApi {
        PeerApi::Vulkan
    }
    fn size(&self) -> usize {
        64
    }
    fn read(&self, _dst: &mut [u8], _offset: usize) -> Result<()> {
        Err(Error::Driver("device lost".into()))
    }
    fn write(&self, _src: &[u8], _offset: usize) -> Result<()> {
        Err(Error::Driver("device lost".into()))
    }
    fn export_memory(&self) -> Result<Option<ExternalMemory>> {
        Ok(None)
    }
    fn export_semaphore(&self) -> Result<Option<ExternalSemaphore>> {
        Ok(None)
    }
    fn signal_semaphore(&self, _queue: &dyn Queue) -> Result<()> {
        Ok(())
    }
    fn wait_semaphore(&self, _queue: &dyn Queue) -> Result<()> {
        Ok(())
    }
    fn queue(&self) -> &dyn Queue {
        &self.queue
    }
}

#[test]
fn test_failed_transfer_keeps_state() {
    let setup = host(PeerApi::Vulkan);
    let broken: Arc<dyn PeerBuffer> = Arc::new(BrokenPeer {
        queue: SoftQueue::new(PeerApi::Vulkan),
    });
    let buf = HostBuffer::new(
        &setup.queue,
        BufferDesc::new(64, RW | MemoryFlags::VULKAN_SHARING).with_peer(broken),
    )
    .unwrap()
    .unwrap();

    assert!(matches!(buf.acquire_peer(None, None), Err(Error::Driver(_))));
    assert_eq!(buf.ownership(), Some(Ownership::Peer));
}

#[test]
fn test_queue_identity_checked_in_debug() {
    let setup = host(PeerApi::Vulkan);
    let buf = host_shared(&setup, 16, MemoryFlags::empty());

    let stranger = Arc::new(HostDevice::new(HostConfig::default())).create_queue();
    let metal_queue = SoftQueue::new(PeerApi::Metal);

    let wrong_device = buf.release_peer(Some(&stranger), None);
    let wrong_api = buf.release_peer(None, Some(&metal_queue));
    if cfg!(debug_assertions) {
        assert!(matches!(wrong_device, Err(Error::SharingProtocol(_))));
        assert!(matches!(wrong_api, Err(Error::SharingProtocol(_))));
        assert_eq!(buf.ownership(), Some(Ownership::Compute));
    } else {
        assert!(wrong_device.is_ok());
    }
}

#[test]
fn test_unshared_resource_rejects_sharing_calls() {
    let setup = host(PeerApi::Vulkan);
    let buf = HostBuffer::new(&setup.queue, BufferDesc::new(16, RW))
        .unwrap()
        .unwrap();
    for result in [
        buf.acquire_peer(None, None),
        buf.release_peer(None, None),
        buf.sync_peer(None, None),
    ] {
        assert!(matches!(
            result,
            Err(Error::Validation(ValidationError::NotShared))
        ));
    }
}

// ============================================================================
// Accelerator Import Path
// ============================================================================

/// With imported memory and semaphore, transfers are semaphore barriers:
/// no copies, no drains.
#[test]
fn test_accel_semaphore_barriers() {
    let setup = accel(SoftPeerConfig::default());
    let buf = AccelBuffer::new(
        &setup.queue,
        BufferDesc::new(256, RW | MemoryFlags::VULKAN_SHARING),
    )
    .unwrap()
    .unwrap();
    assert!(buf.is_imported());
    assert!(buf.has_semaphore());

    buf.fill(&setup.queue, &[0xC0], 0, 0).unwrap();
    let finishes = setup.queue.finish_count();
    buf.release_peer(None, None).unwrap();
    buf.acquire_peer(None, None).unwrap();

    let peer = setup.peer.stats().snapshot();
    assert_eq!(peer.copies(), 0);
    assert_eq!((peer.signals, peer.waits), (1, 1));
    let driver = setup.driver.stats();
    assert_eq!((driver.semaphore_signals, driver.semaphore_waits), (1, 1));
    assert_eq!(setup.queue.finish_count(), finishes);
    assert_eq!(setup.peer.queue().finish_count(), 0);

    let mut seen = [0u8; 256];
    buf.shared_peer().unwrap().buffer().read(&mut seen, 0).unwrap();
    assert_eq!(seen, [0xC0; 256]);
}

/// Imported memory without a semaphore: transfers drain both queues.
#[test]
fn test_accel_drain_barriers() {
    let setup = accel(SoftPeerConfig {
        export_memory: true,
        export_semaphore: false,
    });
    let buf = AccelBuffer::new(
        &setup.queue,
        BufferDesc::new(64, RW | MemoryFlags::VULKAN_SHARING),
    )
    .unwrap()
    .unwrap();
    assert!(buf.is_imported());
    assert!(!buf.has_semaphore());

    let finishes = setup.queue.finish_count();
    buf.release_peer(None, None).unwrap();
    assert_eq!(setup.queue.finish_count(), finishes + 1);
    assert_eq!(setup.peer.queue().finish_count(), 1);
    assert_eq!(setup.peer.stats().snapshot().copies(), 0);
}

/// Without imported memory the accelerator copies like the host backend.
#[test]
fn test_accel_copy_path() {
    let setup = accel(SoftPeerConfig {
        export_memory: false,
        export_semaphore: false,
    });
    let config = AccelConfig {
        import_peer_memory: false,
        ..AccelConfig::default()
    };
    let device = Arc::new(
        AccelDevice::new(setup.driver.clone(), config).with_peer(setup.peer.clone()),
    );
    let queue = device.create_queue().unwrap();
    let buf = AccelBuffer::new(&queue, BufferDesc::new(32, RW | MemoryFlags::VULKAN_SHARING))
        .unwrap()
        .unwrap();
    assert!(!buf.is_imported());

    buf.fill(&queue, &[9], 0, 0).unwrap();
    buf.release_peer(Some(&queue), None).unwrap();
    let peer = buf.shared_peer().unwrap().buffer();
    let mut seen = [0u8; 32];
    peer.read(&mut seen, 0).unwrap();
    assert_eq!(seen, [9; 32]);

    peer.write(&[3; 32], 0).unwrap();
    buf.acquire_peer(Some(&queue), None).unwrap();
    assert_eq!(buf.read_vec(&queue, 0, 0).unwrap(), [3; 32]);

    let stats = setup.peer.stats().snapshot();
    assert_eq!(stats.bytes_written, 32 + 32);
    assert_eq!(stats.bytes_read, 32 + 32);
}
