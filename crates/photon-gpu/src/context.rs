//! GPU context management.

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device, DeviceCandidate};
use crate::memory::GpuAllocator;
use crate::queues::QueueFamilyIndices;
use crate::surface::SurfaceContext;
use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::{c_char, CStr};
use std::sync::Arc;

/// Main GPU context holding Vulkan resources.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) capabilities: GpuCapabilities,
    pub(crate) allocator: Mutex<GpuAllocator>,

    pub(crate) queue_families: QueueFamilyIndices,
    pub(crate) compute_queue: vk::Queue,
    pub(crate) transfer_queue: vk::Queue,
    pub(crate) present_queue: Option<vk::Queue>,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Shared device handle for objects that destroy their own resources.
    pub fn device_arc(&self) -> Arc<ash::Device> {
        Arc::clone(&self.device)
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Selected queue families.
    pub fn queue_families(&self) -> QueueFamilyIndices {
        self.queue_families
    }

    /// Get the compute queue.
    pub fn compute_queue(&self) -> vk::Queue {
        self.compute_queue
    }

    /// Get the transfer queue.
    pub fn transfer_queue(&self) -> vk::Queue {
        self.transfer_queue
    }

    /// Get the present queue. Fails on a headless context.
    pub fn present_queue(&self) -> Result<vk::Queue> {
        self.present_queue
            .ok_or_else(|| GpuError::InvalidState("Context has no present queue".to_string()))
    }

    /// Get the compute queue family index.
    pub fn compute_queue_family(&self) -> u32 {
        self.queue_families.compute
    }

    /// Get the transfer queue family index.
    pub fn transfer_queue_family(&self) -> u32 {
        self.queue_families.transfer
    }

    /// Get the present queue family index. Fails on a headless context.
    pub fn present_queue_family(&self) -> Result<u32> {
        self.queue_families
            .present
            .ok_or_else(|| GpuError::InvalidState("Context has no present queue".to_string()))
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the Vulkan entry point.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// Wait for device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Shutdown allocator BEFORE destroying device
            // This frees all VkDeviceMemory allocations
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Photon".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Build a headless context with compute and transfer queues only.
    pub fn build(self) -> Result<GpuContext> {
        let entry = load_entry()?;
        let instance =
            unsafe { create_instance(&entry, &self.app_name, self.enable_validation, &[]) }?;

        let candidate = match unsafe { select_physical_device(&instance, None) } {
            Ok(candidate) => candidate,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };

        finish(entry, instance, candidate)
    }

    /// Build a context that can present to `window`.
    ///
    /// The surface is created first so device selection only accepts devices
    /// with a queue family able to present to it.
    pub fn build_with_window<W>(self, window: &W) -> Result<(GpuContext, SurfaceContext)>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        let entry = load_entry()?;
        let surface_extensions: &[*const c_char] =
            ash_window::enumerate_required_extensions(display.as_raw())
                .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;
        let instance = unsafe {
            create_instance(
                &entry,
                &self.app_name,
                self.enable_validation,
                surface_extensions,
            )
        }?;

        let surface = match unsafe {
            ash_window::create_surface(
                &entry,
                &instance,
                display.as_raw(),
                window_handle.as_raw(),
                None,
            )
        } {
            Ok(surface) => surface,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(GpuError::SurfaceCreation(e.to_string()));
            }
        };
        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);

        let supports_present = |device: vk::PhysicalDevice, family: u32| unsafe {
            surface_loader
                .get_physical_device_surface_support(device, family, surface)
                .unwrap_or(false)
        };
        let candidate = match unsafe { select_physical_device(&instance, Some(&supports_present)) }
        {
            Ok(candidate) => candidate,
            Err(e) => {
                unsafe {
                    surface_loader.destroy_surface(surface, None);
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };

        let gpu = finish(entry, instance, candidate)?;
        let surface = SurfaceContext::new(&gpu, surface, surface_loader);
        Ok((gpu, surface))
    }
}

fn load_entry() -> Result<ash::Entry> {
    unsafe { ash::Entry::load() }
        .map_err(|e| GpuError::DeviceInit(format!("Failed to load Vulkan: {e}")))
}

fn finish(
    entry: ash::Entry,
    instance: ash::Instance,
    candidate: DeviceCandidate,
) -> Result<GpuContext> {
    let DeviceCandidate {
        physical_device,
        capabilities,
        queue_families,
    } = candidate;

    tracing::info!("Selected GPU: {}", capabilities.summary());
    tracing::debug!(?queue_families, "Queue families selected");

    let device = unsafe { create_device(&instance, physical_device, &queue_families) }?;

    let compute_queue = unsafe { device.get_device_queue(queue_families.compute, 0) };
    let transfer_queue = unsafe { device.get_device_queue(queue_families.transfer, 0) };
    let present_queue = queue_families
        .present
        .map(|family| unsafe { device.get_device_queue(family, 0) });

    let device = Arc::new(device);
    let allocator = unsafe { GpuAllocator::new(&instance, &device, physical_device) }?;

    Ok(GpuContext {
        entry,
        instance,
        physical_device,
        device,
        capabilities,
        allocator: Mutex::new(allocator),
        queue_families,
        compute_queue,
        transfer_queue,
        present_queue,
    })
}

/// Create the logical device.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_families: &QueueFamilyIndices,
) -> Result<ash::Device> {
    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = queue_families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let extensions: Vec<&CStr> = if queue_families.present.is_some() {
        vec![ash::khr::swapchain::NAME]
    } else {
        vec![]
    };
    let extension_names: Vec<*const c_char> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .synchronization2(true)
        .maintenance4(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_1_3_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    instance
        .create_device(physical_device, &device_create_info, None)
        .map_err(|e| GpuError::DeviceInit(format!("Logical device creation failed: {e}")))
}
