//! Vulkan-specific error types.

use ash::vk;
use thiserror::Error;

/// Vulkan peer backend error.
#[derive(Error, Debug)]
pub enum VulkanError {
    /// Vulkan library not found.
    #[error("Vulkan library not found")]
    LibraryNotFound,

    /// No GPU with a graphics or compute queue.
    #[error("no Vulkan device with a graphics or compute queue found")]
    NoCompatibleDevice,

    /// Required extension not supported.
    #[error("required Vulkan extension {0} not supported")]
    ExtensionNotSupported(&'static str),

    /// No memory type is both host-visible and host-coherent.
    #[error("no host-visible coherent memory type")]
    NoHostVisibleMemory,

    /// Out of host or device memory.
    #[error("out of GPU memory")]
    OutOfMemory,

    /// Vulkan initialization failed.
    #[error("Vulkan initialization failed")]
    InitializationFailed,

    /// GPU device lost (driver crash or device removal).
    #[error("GPU device lost")]
    DeviceLost,

    /// Other Vulkan error.
    #[error("Vulkan error: {0}")]
    Other(String),
}

impl From<ash::LoadingError> for VulkanError {
    fn from(_: ash::LoadingError) -> Self {
        Self::LibraryNotFound
    }
}

impl From<vk::Result> for VulkanError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                Self::OutOfMemory
            }
            vk::Result::ERROR_INITIALIZATION_FAILED => Self::InitializationFailed,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            _ => Self::Other(format!("{result:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vk_result_mapping() {
        assert!(matches!(
            VulkanError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            VulkanError::OutOfMemory
        ));
        assert!(matches!(
            VulkanError::from(vk::Result::ERROR_DEVICE_LOST),
            VulkanError::DeviceLost
        ));
        assert!(matches!(
            VulkanError::from(vk::Result::TIMEOUT),
            VulkanError::Other(_)
        ));
    }
}
