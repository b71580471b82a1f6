//! Vulkan context for peer resources.
//!
//! Owns the instance, the logical device and one queue able to run
//! transfer work, plus the extension loaders needed to export memory and
//! semaphores as file descriptors.

use super::error::VulkanError;
use crate::error::Result;
use crate::queue::{BackendKind, DeviceId, Queue, QueueHandle};

use ash::vk;
use std::ffi::CStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Vulkan instance, device and queue.
pub struct VulkanContext {
    /// Vulkan entry point; keeps the library loaded.
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue_family: u32,
    /// Queue access must be externally synchronized.
    queue: Mutex<vk::Queue>,
    host_visible_memory_type: u32,
    external_memory_fd: Option<ash::khr::external_memory_fd::Device>,
    external_semaphore_fd: Option<ash::khr::external_semaphore_fd::Device>,
    device_properties: vk::PhysicalDeviceProperties,
}

impl VulkanContext {
    /// Create a context on the best available GPU.
    ///
    /// Prefers discrete GPUs. External memory and semaphore export are
    /// enabled when the device supports them.
    pub fn new() -> std::result::Result<Self, VulkanError> {
        let entry = unsafe { ash::Entry::load()? };

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"peermem")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"peermem")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);
        let instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .map_err(|_| VulkanError::InitializationFailed)?
        };

        let physical_devices = unsafe {
            instance
                .enumerate_physical_devices()
                .map_err(|_| VulkanError::NoCompatibleDevice)?
        };
        let (physical_device, device_properties, queue_family) =
            Self::select_physical_device(&instance, &physical_devices)?;

        let available_extensions = unsafe {
            instance
                .enumerate_device_extension_properties(physical_device)
                .unwrap_or_default()
        };
        let extension_names: Vec<&CStr> = available_extensions
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok())
            .collect();

        let has_memory_fd = extension_names.contains(&ash::khr::external_memory_fd::NAME);
        let has_semaphore_fd = extension_names.contains(&ash::khr::external_semaphore_fd::NAME);
        let mut device_extensions = Vec::new();
        if has_memory_fd {
            device_extensions.push(ash::khr::external_memory_fd::NAME.as_ptr());
        }
        if has_semaphore_fd {
            device_extensions.push(ash::khr::external_semaphore_fd::NAME.as_ptr());
        }

        let queue_priority = [1.0f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priority)];
        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&device_extensions);

        let device = unsafe {
            instance
                .create_device(physical_device, &device_create_info, None)
                .map_err(|e| VulkanError::Other(format!("failed to create device: {e:?}")))?
        };
        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let host_visible_memory_type = Self::find_memory_type(
            &memory_properties,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .ok_or(VulkanError::NoHostVisibleMemory)?;

        let external_memory_fd =
            has_memory_fd.then(|| ash::khr::external_memory_fd::Device::new(&instance, &device));
        let external_semaphore_fd = has_semaphore_fd
            .then(|| ash::khr::external_semaphore_fd::Device::new(&instance, &device));

        let ctx = Self {
            entry,
            instance,
            physical_device,
            device,
            queue_family,
            queue: Mutex::new(queue),
            host_visible_memory_type,
            external_memory_fd,
            external_semaphore_fd,
            device_properties,
        };
        tracing::debug!(
            device = %ctx.device_name(),
            memory_fd = has_memory_fd,
            semaphore_fd = has_semaphore_fd,
            "Vulkan peer context created"
        );
        Ok(ctx)
    }

    /// Pick the best device that has a graphics or compute queue family.
    fn select_physical_device(
        instance: &ash::Instance,
        devices: &[vk::PhysicalDevice],
    ) -> std::result::Result<(vk::PhysicalDevice, vk::PhysicalDeviceProperties, u32), VulkanError>
    {
        let mut best = None;
        let mut best_score = 0;

        for &device in devices {
            let properties = unsafe { instance.get_physical_device_properties(device) };
            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };

            let Some(family) = queue_families.iter().position(|qf| {
                qf.queue_flags
                    .intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            }) else {
                continue;
            };

            let score = match properties.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                vk::PhysicalDeviceType::VIRTUAL_GPU => 10,
                _ => 1,
            };
            if score > best_score {
                best_score = score;
                best = Some((device, properties, family as u32));
            }
        }

        best.ok_or(VulkanError::NoCompatibleDevice)
    }

    /// Find a memory type index having all of `required_flags`.
    fn find_memory_type(
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        required_flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        (0..memory_properties.memory_type_count).find(|&i| {
            memory_properties.memory_types[i as usize]
                .property_flags
                .contains(required_flags)
        })
    }

    /// Device name.
    pub fn device_name(&self) -> String {
        self.device_properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// The logical device.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// The physical device.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Queue family of the context's queue.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Memory type used for peer allocations.
    pub(crate) fn host_visible_memory_type(&self) -> u32 {
        self.host_visible_memory_type
    }

    /// Loader for `VK_KHR_external_memory_fd`, if enabled.
    pub(crate) fn external_memory_fd(&self) -> Option<&ash::khr::external_memory_fd::Device> {
        self.external_memory_fd.as_ref()
    }

    /// Loader for `VK_KHR_external_semaphore_fd`, if enabled.
    pub(crate) fn external_semaphore_fd(
        &self,
    ) -> Option<&ash::khr::external_semaphore_fd::Device> {
        self.external_semaphore_fd.as_ref()
    }

    /// Submit an empty batch that waits on and/or signals semaphores.
    pub(crate) fn submit_semaphores(
        &self,
        wait: &[vk::Semaphore],
        signal: &[vk::Semaphore],
    ) -> std::result::Result<(), VulkanError> {
        let stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; wait.len()];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(wait)
            .wait_dst_stage_mask(&stages)
            .signal_semaphores(signal);
        let queue = crate::memory::lock(&self.queue);
        unsafe {
            self.device
                .queue_submit(*queue, &[submit], vk::Fence::null())?;
        }
        Ok(())
    }

    /// Block until the queue is idle.
    pub(crate) fn wait_idle(&self) -> std::result::Result<(), VulkanError> {
        let queue = crate::memory::lock(&self.queue);
        unsafe { self.device.queue_wait_idle(*queue)? };
        Ok(())
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

// SAFETY: ash handles are plain identifiers; the queue is behind a mutex.
unsafe impl Send for VulkanContext {}
unsafe impl Sync for VulkanContext {}

/// A [`Queue`] over the context's Vulkan queue.
pub struct VulkanQueue {
    ctx: Arc<VulkanContext>,
    handle: QueueHandle,
    device: DeviceId,
    finishes: AtomicU64,
}

impl VulkanQueue {
    /// Wrap the context's queue.
    pub fn new(ctx: Arc<VulkanContext>) -> Self {
        Self {
            ctx,
            handle: QueueHandle::next(),
            device: DeviceId::next(),
            finishes: AtomicU64::new(0),
        }
    }

    /// The context.
    pub fn context(&self) -> &Arc<VulkanContext> {
        &self.ctx
    }

    /// Number of `finish` calls so far.
    pub fn finish_count(&self) -> u64 {
        self.finishes.load(Ordering::Relaxed)
    }
}

impl Queue for VulkanQueue {
    fn finish(&self) -> Result<()> {
        self.finishes.fetch_add(1, Ordering::Relaxed);
        self.ctx.wait_idle()?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        // Submissions are issued immediately.
        Ok(())
    }

    fn queue_handle(&self) -> QueueHandle {
        self.handle
    }

    fn device_id(&self) -> DeviceId {
        self.device
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Vulkan
    }
}
