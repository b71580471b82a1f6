//! Access, lifecycle and sharing flags.
//!
//! [`MemoryFlags`] are fixed when a resource is created. [`MapFlags`] are
//! passed to every `map` call.

use crate::error::{Error, Result};

bitflags::bitflags! {
    /// Flags attached to every device memory resource.
    ///
    /// Exactly one device access bit (`READ`, `WRITE` or `READ_WRITE`) must
    /// be set, and at most one sharing target.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryFlags: u32 {
        /// Device may only read.
        const READ = 1 << 0;
        /// Device may only write.
        const WRITE = 1 << 1;
        /// Device may read and write.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();

        /// Host may read (read, map with READ).
        const HOST_READ = 1 << 2;
        /// Host may write (write, map with WRITE/WRITE_INVALIDATE).
        const HOST_WRITE = 1 << 3;
        /// Host may read and write.
        const HOST_READ_WRITE = Self::HOST_READ.bits() | Self::HOST_WRITE.bits();

        /// Do not copy the supplied host data into the new resource.
        const NO_INITIAL_COPY = 1 << 4;
        /// Use the supplied host memory as the backing store itself.
        const USE_HOST_MEMORY = 1 << 5;

        /// Share with a Vulkan peer.
        const VULKAN_SHARING = 1 << 6;
        /// Share with a Metal peer.
        const METAL_SHARING = 1 << 7;

        /// Only transfer data in the directions declared below.
        const SHARING_SYNC = 1 << 8;
        /// Compute reads the shared data.
        const SHARING_COMPUTE_READ = 1 << 9;
        /// Compute writes the shared data.
        const SHARING_COMPUTE_WRITE = 1 << 10;
        /// Compute reads and writes the shared data.
        const SHARING_COMPUTE_READ_WRITE =
            Self::SHARING_COMPUTE_READ.bits() | Self::SHARING_COMPUTE_WRITE.bits();
        /// The render peer reads the shared data.
        const SHARING_RENDER_READ = 1 << 11;
        /// The render peer writes the shared data.
        const SHARING_RENDER_WRITE = 1 << 12;
        /// The render peer reads and writes the shared data.
        const SHARING_RENDER_READ_WRITE =
            Self::SHARING_RENDER_READ.bits() | Self::SHARING_RENDER_WRITE.bits();
    }
}

bitflags::bitflags! {
    /// Per-call map intent.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        /// Mapped memory will be read.
        const READ = 1 << 0;
        /// Mapped memory will be written.
        const WRITE = 1 << 1;
        /// The whole mapped range will be overwritten; prior contents are
        /// not needed.
        const WRITE_INVALIDATE = 1 << 2;
        /// Drain the queue before touching device memory.
        const BLOCK = 1 << 3;
        /// Read and write.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// The peer API a resource shares its memory with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerApi {
    /// Vulkan render backend.
    Vulkan,
    /// Metal render backend.
    Metal,
}

impl std::fmt::Display for PeerApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerApi::Vulkan => write!(f, "Vulkan"),
            PeerApi::Metal => write!(f, "Metal"),
        }
    }
}

impl PeerApi {
    /// The sharing flag that selects this API.
    pub fn sharing_flag(self) -> MemoryFlags {
        match self {
            PeerApi::Vulkan => MemoryFlags::VULKAN_SHARING,
            PeerApi::Metal => MemoryFlags::METAL_SHARING,
        }
    }
}

impl MemoryFlags {
    /// All sharing target bits.
    pub const SHARING_TARGETS: Self = Self::VULKAN_SHARING.union(Self::METAL_SHARING);

    /// All sharing direction bits.
    pub const SHARING_DIRECTIONS: Self =
        Self::SHARING_COMPUTE_READ_WRITE.union(Self::SHARING_RENDER_READ_WRITE);

    /// Check the flag set itself.
    ///
    /// Fails when no device access bit is set or when both sharing targets
    /// are requested.
    pub fn validate(self) -> Result<()> {
        if !self.intersects(Self::READ_WRITE) {
            return Err(Error::UnsupportedConfiguration(
                "one of READ, WRITE or READ_WRITE must be set".into(),
            ));
        }
        if self.contains(Self::SHARING_TARGETS) {
            return Err(Error::UnsupportedConfiguration(
                "VULKAN_SHARING and METAL_SHARING are mutually exclusive".into(),
            ));
        }
        Ok(())
    }

    /// The peer API selected by the sharing bits, if any.
    ///
    /// Returns `None` for both "no target" and the invalid "both targets"
    /// combination; [`MemoryFlags::validate`] rejects the latter.
    pub fn sharing_target(self) -> Option<PeerApi> {
        match (
            self.contains(Self::VULKAN_SHARING),
            self.contains(Self::METAL_SHARING),
        ) {
            (true, false) => Some(PeerApi::Vulkan),
            (false, true) => Some(PeerApi::Metal),
            _ => None,
        }
    }

    /// Is any host access bit set?
    #[inline]
    pub fn has_host_access(self) -> bool {
        self.intersects(Self::HOST_READ_WRITE)
    }

    /// Flags used when creating a peer resource on the render side.
    ///
    /// The peer always gets full device access; host access is kept so that
    /// the copy-based transfer path can read and write the peer.
    pub fn peer_flags(self) -> MemoryFlags {
        Self::READ_WRITE | Self::HOST_READ_WRITE
    }
}
