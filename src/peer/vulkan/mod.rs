//! Vulkan peer backend.
//!
//! Peer resources are host-visible, host-coherent buffers. When the device
//! supports it, their memory is allocated exportable as an opaque fd
//! (`VK_KHR_external_memory_fd`) and each resource carries an exportable
//! semaphore (`VK_KHR_external_semaphore_fd`), so an import-capable compute
//! driver can use the same allocation without copies.
//!
//! # Requirements
//!
//! - Vulkan 1.1+
//! - A graphics or compute queue family
//! - A host-visible, host-coherent memory type

mod buffer;
mod context;
mod error;

pub use buffer::{VulkanPeerBackend, VulkanPeerBuffer};
pub use context::{VulkanContext, VulkanQueue};
pub use error::VulkanError;
