//! # peermem
//!
//! Device memory resources for compute backends, with explicit ownership
//! transfer to a peer render API.
//!
//! A resource is a fixed-size allocation owned by one compute backend: the
//! CPU-resident [`host`] backend or the discrete-accelerator [`accel`]
//! backend. A resource created with a sharing flag is paired with exactly
//! one peer resource (Vulkan or Metal) and is authoritative on one side at
//! a time. Moving authority is explicit: `acquire_peer`, `release_peer`,
//! `sync_peer`.
//!
//! ## Features
//!
//! - **Validated data path**: read, write, copy, fill, map; every call is
//!   bounds- and permission-checked before any device work
//! - **Ownership protocol**: flag-driven policy that skips transfers no side
//!   can observe
//! - **Zero-copy sharing**: import-capable drivers alias the peer's exported
//!   memory and turn transfers into semaphore barriers
//! - **Linux plumbing**: memfd stores, fd export, eventfd semaphores
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use peermem::prelude::*;
//!
//! let device = Arc::new(
//!     HostDevice::new(HostConfig::default())
//!         .with_peer(Arc::new(SoftPeerBackend::new(PeerApi::Vulkan))),
//! );
//! let queue = device.create_queue();
//! let flags = MemoryFlags::READ_WRITE | MemoryFlags::HOST_READ_WRITE | MemoryFlags::VULKAN_SHARING;
//! let buffer = HostBuffer::new(&queue, BufferDesc::new(1024, flags))?.unwrap();
//!
//! buffer.fill(&queue, &[0xFF], 0, 0)?;
//! buffer.release_peer(None, None)?; // the peer now sees 0xFF
//! // ... peer renders ...
//! buffer.acquire_peer(None, None)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod accel;
pub mod defaults;
pub mod error;
pub mod flags;
pub mod host;
pub mod image;
pub mod memory;
pub mod observability;
pub mod peer;
pub mod queue;
pub mod validate;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::accel::{AccelBuffer, AccelDevice, AccelQueue, Driver, EmulatedDriver};
    pub use crate::defaults::{AccelConfig, HostConfig};
    pub use crate::error::{Error, Result, ValidationError};
    pub use crate::flags::{MapFlags, MemoryFlags, PeerApi};
    pub use crate::host::{HostBuffer, HostDevice, HostQueue};
    pub use crate::image::{DeviceImage, ImageDesc};
    pub use crate::memory::{BufferDesc, DeviceMemory, Ownership};
    pub use crate::peer::soft::SoftPeerBackend;
    pub use crate::peer::{PeerBackend, PeerBuffer, SharedPeer};
    pub use crate::queue::{Device, Queue};
}

pub use error::{Error, Result};
