//! Swapchain management.
//!
//! Frames reach the screen by a buffer-to-image copy, so swapchain images
//! only need `TRANSFER_DST` usage and are never rendered to directly.

use crate::error::{GpuError, Result};
use ash::vk;

/// Swapchain wrapper.
pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a new swapchain.
    ///
    /// # Safety
    /// All handles must be valid.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn new(
        swapchain_loader: &ash::khr::swapchain::Device,
        surface: vk::SurfaceKHR,
        surface_capabilities: &vk::SurfaceCapabilitiesKHR,
        surface_format: vk::SurfaceFormatKHR,
        present_mode: vk::PresentModeKHR,
        extent: vk::Extent2D,
        old_swapchain: Option<vk::SwapchainKHR>,
        present_queue_family: u32,
    ) -> Result<Self> {
        if !surface_capabilities
            .supported_usage_flags
            .contains(vk::ImageUsageFlags::TRANSFER_DST)
        {
            return Err(GpuError::SwapchainCreation(
                "surface images cannot be transfer destinations".to_string(),
            ));
        }

        let mut image_count = surface_capabilities.min_image_count + 1;
        if surface_capabilities.max_image_count > 0
            && image_count > surface_capabilities.max_image_count
        {
            image_count = surface_capabilities.max_image_count;
        }

        let queue_families = [present_queue_family];
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_families)
            .pre_transform(surface_capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain.unwrap_or(vk::SwapchainKHR::null()));

        let swapchain = swapchain_loader
            .create_swapchain(&create_info, None)
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        let images = swapchain_loader.get_swapchain_images(swapchain)?;

        tracing::debug!(
            images = images.len(),
            format = ?surface_format.format,
            ?present_mode,
            "Swapchain created at {}x{}",
            extent.width,
            extent.height
        );

        Ok(Self {
            swapchain,
            images,
            format: surface_format.format,
            extent,
        })
    }

    /// Number of presentable images.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Whether the trace kernel must write pixels as BGRA for this format.
    pub fn needs_bgra_swizzle(&self) -> bool {
        is_bgra(self.format)
    }

    /// Acquire the next image, signalling `semaphore` when it is ready.
    ///
    /// Returns the image index and whether the swapchain is suboptimal.
    ///
    /// # Safety
    /// All handles must be valid.
    pub unsafe fn acquire_next_image(
        &self,
        swapchain_loader: &ash::khr::swapchain::Device,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<(u32, bool)> {
        match swapchain_loader.acquire_next_image(
            self.swapchain,
            timeout_ns,
            semaphore,
            vk::Fence::null(),
        ) {
            Ok(acquired) => Ok(acquired),
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => Err(GpuError::Timeout("acquire")),
            // OUT_OF_DATE means no image was acquired; caller must recreate the swapchain.
            Err(code) => Err(GpuError::PresentFailed {
                operation: "acquire",
                code,
            }),
        }
    }

    /// Present an image.
    ///
    /// Returns `true` if the swapchain should be recreated.
    ///
    /// # Safety
    /// All handles must be valid.
    pub unsafe fn present(
        &self,
        swapchain_loader: &ash::khr::swapchain::Device,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match swapchain_loader.queue_present(queue, &present_info) {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(code) => Err(GpuError::PresentFailed {
                operation: "present",
                code,
            }),
        }
    }

    /// Destroy the swapchain.
    ///
    /// # Safety
    /// The swapchain must not be in use.
    pub unsafe fn destroy(&self, swapchain_loader: &ash::khr::swapchain::Device) {
        swapchain_loader.destroy_swapchain(self.swapchain, None);
    }
}

fn is_bgra(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB
    )
}

/// Select the surface format.
///
/// The kernel writes packed RGBA, so an RGBA format is copied verbatim; a
/// BGRA format is accepted with a swizzle in the kernel. UNORM is preferred so
/// the copy does not re-encode colors.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    let preferred = [
        vk::Format::R8G8B8A8_UNORM,
        vk::Format::B8G8R8A8_UNORM,
        vk::Format::R8G8B8A8_SRGB,
        vk::Format::B8G8R8A8_SRGB,
    ];

    preferred
        .iter()
        .find_map(|&wanted| {
            available.iter().copied().find(|f| {
                f.format == wanted && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
        })
        .ok_or_else(|| {
            GpuError::SwapchainCreation("no 8-bit RGBA or BGRA surface format".to_string())
        })
}

/// Select the best present mode.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| available.contains(mode))
        // FIFO is always supported
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn prefers_rgba_unorm() {
        let available = [
            format(vk::Format::B8G8R8A8_SRGB),
            format(vk::Format::R8G8B8A8_UNORM),
        ];
        let chosen = select_surface_format(&available).unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
        assert!(!is_bgra(chosen.format));
    }

    #[test]
    fn accepts_bgra_with_swizzle() {
        let available = [format(vk::Format::B8G8R8A8_UNORM)];
        let chosen = select_surface_format(&available).unwrap();
        assert!(is_bgra(chosen.format));
    }

    #[test]
    fn rejects_unusable_formats() {
        let available = [format(vk::Format::A2B10G10R10_UNORM_PACK32)];
        assert!(select_surface_format(&available).is_err());
    }

    #[test]
    fn present_mode_fallbacks() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
        ];
        assert_eq!(select_present_mode(&all, true), vk::PresentModeKHR::FIFO);
        assert_eq!(select_present_mode(&all, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            select_present_mode(&[vk::PresentModeKHR::FIFO], false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_clamps_when_surface_is_flexible() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        };
        let extent = calculate_extent(&caps, 4000, 600);
        assert_eq!((extent.width, extent.height), (1920, 600));
    }
}
