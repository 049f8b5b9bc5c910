//! Surface management for windowed rendering.

use crate::context::GpuContext;
use crate::error::Result;
use crate::swapchain::{calculate_extent, select_present_mode, select_surface_format, Swapchain};
use ash::vk;

/// Surface context for windowed rendering.
///
/// Created together with the [`GpuContext`] by
/// [`GpuContextBuilder::build_with_window`](crate::GpuContextBuilder::build_with_window),
/// and must be destroyed before the context is dropped.
pub struct SurfaceContext {
    /// The Vulkan surface handle.
    pub surface: vk::SurfaceKHR,
    /// Surface extension loader.
    pub surface_loader: ash::khr::surface::Instance,
    /// Swapchain extension loader.
    pub swapchain_loader: ash::khr::swapchain::Device,
}

impl SurfaceContext {
    pub(crate) fn new(
        gpu: &GpuContext,
        surface: vk::SurfaceKHR,
        surface_loader: ash::khr::surface::Instance,
    ) -> Self {
        let swapchain_loader = ash::khr::swapchain::Device::new(gpu.instance(), gpu.device());
        Self {
            surface,
            surface_loader,
            swapchain_loader,
        }
    }

    /// Query surface capabilities.
    pub fn capabilities(&self, gpu: &GpuContext) -> Result<SurfaceCapabilities> {
        unsafe {
            let caps = self
                .surface_loader
                .get_physical_device_surface_capabilities(gpu.physical_device(), self.surface)?;

            let formats = self
                .surface_loader
                .get_physical_device_surface_formats(gpu.physical_device(), self.surface)?;

            let present_modes = self
                .surface_loader
                .get_physical_device_surface_present_modes(gpu.physical_device(), self.surface)?;

            Ok(SurfaceCapabilities {
                capabilities: caps,
                formats,
                present_modes,
            })
        }
    }

    /// Create a swapchain for this surface.
    ///
    /// # Safety
    /// `old_swapchain`, if given, must not be in use and is retired by this call.
    pub unsafe fn create_swapchain(
        &self,
        gpu: &GpuContext,
        width: u32,
        height: u32,
        vsync: bool,
        old_swapchain: Option<vk::SwapchainKHR>,
    ) -> Result<Swapchain> {
        let caps = self.capabilities(gpu)?;

        let surface_format = select_surface_format(&caps.formats)?;
        let present_mode = select_present_mode(&caps.present_modes, vsync);
        let extent = calculate_extent(&caps.capabilities, width, height);

        Swapchain::new(
            &self.swapchain_loader,
            self.surface,
            &caps.capabilities,
            surface_format,
            present_mode,
            extent,
            old_swapchain,
            gpu.present_queue_family()?,
        )
    }

    /// Replace `swapchain` with one sized for the new dimensions.
    ///
    /// # Safety
    /// The old swapchain must not be in use.
    pub unsafe fn recreate_swapchain(
        &self,
        gpu: &GpuContext,
        swapchain: &mut Swapchain,
        width: u32,
        height: u32,
        vsync: bool,
    ) -> Result<()> {
        let new = self.create_swapchain(gpu, width, height, vsync, Some(swapchain.swapchain))?;
        let old = std::mem::replace(swapchain, new);
        old.destroy(&self.swapchain_loader);
        Ok(())
    }

    /// Destroy the surface.
    ///
    /// # Safety
    /// The surface must not be in use.
    pub unsafe fn destroy(&self) {
        self.surface_loader.destroy_surface(self.surface, None);
    }
}

/// Surface capabilities query result.
pub struct SurfaceCapabilities {
    /// Raw surface capabilities.
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats.
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes.
    pub present_modes: Vec<vk::PresentModeKHR>,
}
