//! Exportable Vulkan buffers.

use super::context::{VulkanContext, VulkanQueue};
use super::error::VulkanError;
use crate::error::{Result, ValidationError};
use crate::flags::{MemoryFlags, PeerApi};
use crate::peer::{ExternalMemory, ExternalSemaphore, PeerBackend, PeerBuffer};
use crate::queue::Queue;

use ash::vk;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Arc;

/// Vulkan peer backend.
pub struct VulkanPeerBackend {
    queue: Arc<VulkanQueue>,
}

impl VulkanPeerBackend {
    /// Backend on a fresh context.
    pub fn new() -> std::result::Result<Self, VulkanError> {
        Ok(Self::with_context(Arc::new(VulkanContext::new()?)))
    }

    /// Backend on an existing context.
    pub fn with_context(ctx: Arc<VulkanContext>) -> Self {
        Self {
            queue: Arc::new(VulkanQueue::new(ctx)),
        }
    }

    /// The backend's queue.
    pub fn queue(&self) -> &Arc<VulkanQueue> {
        &self.queue
    }
}

impl PeerBackend for VulkanPeerBackend {
    fn api(&self) -> PeerApi {
        PeerApi::Vulkan
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
        tracing::trace!(size, ?flags, "Vulkan peer create");
        let buffer = VulkanPeerBuffer::new(Arc::clone(self.queue.context()), queue, size)?;
        if let Some(data) = host_data {
            buffer.write(&data[..data.len().min(size)], 0)?;
        }
        Ok(Box::new(buffer))
    }
}

/// A host-visible Vulkan buffer whose memory and semaphore are exportable
/// as opaque fds when the device supports it.
pub struct VulkanPeerBuffer {
    ctx: Arc<VulkanContext>,
    queue: Arc<dyn Queue>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    allocation_size: u64,
    mapped: *mut u8,
    size: usize,
    semaphore: Option<vk::Semaphore>,
}

impl VulkanPeerBuffer {
    fn new(
        ctx: Arc<VulkanContext>,
        queue: Arc<dyn Queue>,
        size: usize,
    ) -> std::result::Result<Self, VulkanError> {
        let device = ctx.device();
        let exportable = ctx.external_memory_fd().is_some();

        let mut external_info = vk::ExternalMemoryBufferCreateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);
        let mut buffer_info = vk::BufferCreateInfo::default()
            .size(size as u64)
            .usage(
                vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::STORAGE_BUFFER,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        if exportable {
            buffer_info = buffer_info.push_next(&mut external_info);
        }
        let buffer = unsafe { device.create_buffer(&buffer_info, None)? };

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let mut export_info = vk::ExportMemoryAllocateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);
        let mut alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(ctx.host_visible_memory_type());
        if exportable {
            alloc_info = alloc_info.push_next(&mut export_info);
        }

        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e.into());
            }
        };

        let mapped = unsafe {
            device
                .bind_buffer_memory(buffer, memory, 0)
                .and_then(|()| {
                    device.map_memory(memory, 0, requirements.size, vk::MemoryMapFlags::empty())
                })
        };
        let mapped = match mapped {
            Ok(ptr) => ptr.cast::<u8>(),
            Err(e) => {
                unsafe {
                    device.free_memory(memory, None);
                    device.destroy_buffer(buffer, None);
                }
                return Err(e.into());
            }
        };
        // Fresh allocations are not guaranteed to be zeroed.
        unsafe { std::ptr::write_bytes(mapped, 0, size) };

        let semaphore = if ctx.external_semaphore_fd().is_some() {
            let mut export = vk::ExportSemaphoreCreateInfo::default()
                .handle_types(vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD);
            let info = vk::SemaphoreCreateInfo::default().push_next(&mut export);
            unsafe { device.create_semaphore(&info, None) }.ok()
        } else {
            None
        };

        Ok(Self {
            ctx,
            queue,
            buffer,
            memory,
            allocation_size: requirements.size,
            mapped,
            size,
            semaphore,
        })
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

    fn semaphore(&self) -> std::result::Result<vk::Semaphore, VulkanError> {
        self.semaphore
            .ok_or(VulkanError::ExtensionNotSupported("VK_KHR_external_semaphore_fd"))
    }
}

impl PeerBuffer for VulkanPeerBuffer {
    fn api(&self) -> PeerApi {
        PeerApi::Vulkan
    }

    fn size(&self) -> usize {
        self.size
    }

    fn read(&self, dst: &mut [u8], offset: usize) -> Result<()> {
        self.check_range(dst.len(), offset)?;
        self.queue.finish()?;
        // SAFETY: persistent coherent mapping; range checked.
        unsafe {
            std::ptr::copy_nonoverlapping(self.mapped.add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    fn write(&self, src: &[u8], offset: usize) -> Result<()> {
        self.check_range(src.len(), offset)?;
        self.queue.finish()?;
        // SAFETY: as in `read`.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.mapped.add(offset), src.len());
        }
        Ok(())
    }

    fn export_memory(&self) -> Result<Option<ExternalMemory>> {
        let Some(loader) = self.ctx.external_memory_fd() else {
            return Ok(None);
        };
        let info = vk::MemoryGetFdInfoKHR::default()
            .memory(self.memory)
            .handle_type(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);
        let fd = unsafe { loader.get_memory_fd(&info).map_err(VulkanError::from)? };
        Ok(Some(ExternalMemory {
            // SAFETY: vkGetMemoryFdKHR returns a new fd owned by the caller.
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            size: self.allocation_size as usize,
        }))
    }

    fn export_semaphore(&self) -> Result<Option<ExternalSemaphore>> {
        let (Some(loader), Some(semaphore)) = (self.ctx.external_semaphore_fd(), self.semaphore)
        else {
            return Ok(None);
        };
        let info = vk::SemaphoreGetFdInfoKHR::default()
            .semaphore(semaphore)
            .handle_type(vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD);
        let fd = unsafe { loader.get_semaphore_fd(&info).map_err(VulkanError::from)? };
        Ok(Some(ExternalSemaphore {
            // SAFETY: vkGetSemaphoreFdKHR returns a new fd owned by the caller.
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }))
    }

    fn signal_semaphore(&self, _queue: &dyn Queue) -> Result<()> {
        self.ctx.submit_semaphores(&[], &[self.semaphore()?])?;
        Ok(())
    }

    fn wait_semaphore(&self, _queue: &dyn Queue) -> Result<()> {
        self.ctx.submit_semaphores(&[self.semaphore()?], &[])?;
        Ok(())
    }

    fn queue(&self) -> &dyn Queue {
        self.queue.as_ref()
    }
}

impl Drop for VulkanPeerBuffer {
    fn drop(&mut self) {
        let device = self.ctx.device();
        if let Err(e) = self.ctx.wait_idle() {
            tracing::warn!(error = %e, "Vulkan queue wait failed while destroying peer buffer");
        }
        unsafe {
            device.unmap_memory(self.memory);
            device.free_memory(self.memory, None);
            device.destroy_buffer(self.buffer, None);
            if let Some(semaphore) = self.semaphore {
                device.destroy_semaphore(semaphore, None);
            }
        }
    }
}

// SAFETY: the mapping is owned by this buffer; access is serialized by the
// ownership protocol.
unsafe impl Send for VulkanPeerBuffer {}
unsafe impl Sync for VulkanPeerBuffer {}
