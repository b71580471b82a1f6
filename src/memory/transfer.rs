//! Ownership transfer between a compute resource and its peer.
//!
//! A shared resource is authoritative on exactly one side at a time:
//!
//! ```text
//!              release (transfer if policy requires)
//!   Compute  ─────────────────────────────────────▶  Peer
//!      ▲  │                                            │
//!      │  └─ sync: transfer to peer, stay Compute      │
//!      └──────────────────────────────────────────────┘
//!              acquire (transfer if policy requires)
//! ```
//!
//! The state machine lives here; the data movement itself is supplied by
//! each backend as a closure (drain + copy, or a pure barrier when both
//! sides address the same memory).

use super::lock;
use crate::error::Result;
use crate::flags::MemoryFlags;
use crate::observability::{self, TransferKind, TracingConfig};
use crate::peer::{PeerBuffer, SharedPeer};
use crate::queue::{self, Queue};
use std::sync::Mutex;

/// Which side holds the authoritative copy of a shared resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ownership {
    /// The compute backend owns the data.
    Compute,
    /// The peer (render) backend owns the data.
    Peer,
}

/// Which transitions have to move data, derived from the sharing flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    selective: bool,
    directions: MemoryFlags,
}

impl SyncPolicy {
    /// Build the policy from a resource's flags.
    ///
    /// `SHARING_SYNC` without any direction bit is treated as all four
    /// directions.
    pub fn from_flags(flags: MemoryFlags) -> Self {
        let selective = flags.contains(MemoryFlags::SHARING_SYNC);
        let mut directions = flags & MemoryFlags::SHARING_DIRECTIONS;
        if selective && directions.is_empty() {
            directions = MemoryFlags::SHARING_DIRECTIONS;
        }
        Self {
            selective,
            directions,
        }
    }

    /// Does `Peer -> Compute` have to bring the peer's data over?
    ///
    /// Only when the peer may have written and compute will read.
    pub fn acquire_transfers(&self) -> bool {
        !self.selective
            || self.directions.contains(
                MemoryFlags::SHARING_RENDER_WRITE | MemoryFlags::SHARING_COMPUTE_READ,
            )
    }

    /// Does `Compute -> Peer` (or `sync`) have to publish compute's data?
    ///
    /// Only when compute may have written and the peer will read.
    pub fn release_transfers(&self) -> bool {
        !self.selective
            || self.directions.contains(
                MemoryFlags::SHARING_COMPUTE_WRITE | MemoryFlags::SHARING_RENDER_READ,
            )
    }
}

/// Sharing state of one resource: the peer, the policy and the current
/// owner.
pub(crate) struct SharingState {
    peer: SharedPeer,
    policy: SyncPolicy,
    ownership: Mutex<Ownership>,
    backend: &'static str,
    size: usize,
    tracing: TracingConfig,
}

impl SharingState {
    pub(crate) fn new(
        peer: SharedPeer,
        flags: MemoryFlags,
        initial: Ownership,
        backend: &'static str,
        size: usize,
        tracing: TracingConfig,
    ) -> Self {
        Self {
            peer,
            policy: SyncPolicy::from_flags(flags),
            ownership: Mutex::new(initial),
            backend,
            size,
            tracing,
        }
    }

    pub(crate) fn peer(&self) -> &SharedPeer {
        &self.peer
    }

    pub(crate) fn ownership(&self) -> Ownership {
        *lock(&self.ownership)
    }

    /// The peer queue to use: the caller's (after the identity check) or
    /// the peer's own queue.
    pub(crate) fn peer_queue<'a>(&'a self, given: Option<&'a dyn Queue>) -> Result<&'a dyn Queue> {
        match given {
            Some(queue) => {
                queue::check_peer_queue(queue, self.peer.api())?;
                Ok(queue)
            }
            None => Ok(self.peer.buffer().queue()),
        }
    }

    /// `Peer -> Compute`. Returns whether data was transferred.
    pub(crate) fn acquire<F>(&self, transfer: F) -> Result<bool>
    where
        F: FnOnce(&dyn PeerBuffer) -> Result<TransferKind>,
    {
        let _span = self.tracing.enter_transfer(self.backend, "acquire");
        let mut state = lock(&self.ownership);
        if *state == Ownership::Compute {
            return Ok(false);
        }
        let transferred = self.run(self.policy.acquire_transfers(), transfer)?;
        *state = Ownership::Compute;
        observability::trace_transition("acquire", Ownership::Peer, Ownership::Compute, transferred);
        Ok(transferred)
    }

    /// `Compute -> Peer`. Returns whether data was transferred.
    pub(crate) fn release<F>(&self, transfer: F) -> Result<bool>
    where
        F: FnOnce(&dyn PeerBuffer) -> Result<TransferKind>,
    {
        let _span = self.tracing.enter_transfer(self.backend, "release");
        let mut state = lock(&self.ownership);
        if *state == Ownership::Peer {
            return Ok(false);
        }
        let transferred = self.run(self.policy.release_transfers(), transfer)?;
        *state = Ownership::Peer;
        observability::trace_transition("release", Ownership::Compute, Ownership::Peer, transferred);
        Ok(transferred)
    }

    /// Publish compute's data to the peer without giving up ownership.
    pub(crate) fn sync<F>(&self, transfer: F) -> Result<bool>
    where
        F: FnOnce(&dyn PeerBuffer) -> Result<TransferKind>,
    {
        let _span = self.tracing.enter_transfer(self.backend, "sync");
        let state = lock(&self.ownership);
        if *state == Ownership::Peer {
            return Ok(false);
        }
        let transferred = self.run(self.policy.release_transfers(), transfer)?;
        observability::trace_transition("sync", Ownership::Compute, Ownership::Compute, transferred);
        Ok(transferred)
    }

    fn run<F>(&self, required: bool, transfer: F) -> Result<bool>
    where
        F: FnOnce(&dyn PeerBuffer) -> Result<TransferKind>,
    {
        if !required {
            observability::record_state_flip(self.backend);
            return Ok(false);
        }
        let kind = transfer(self.peer.buffer())?;
        let bytes = match kind {
            TransferKind::Copy => self.size,
            TransferKind::Barrier => 0,
        };
        observability::record_transfer(self.backend, kind, bytes);
        Ok(true)
    }
}

/// Drain the compute queue and the peer queue, in that order.
pub(crate) fn drain_both(compute: &dyn Queue, peer: &dyn Queue) -> Result<()> {
    compute.finish()?;
    observability::record_queue_drain("compute");
    peer.finish()?;
    observability::record_queue_drain("peer");
    Ok(())
}

impl std::fmt::Debug for SharingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharingState")
            .field("peer", &self.peer)
            .field("policy", &self.policy)
            .field("ownership", &self.ownership())
            .finish()
    }
}
