//! Vulkan instance creation and physical device selection.

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result};
use crate::queues::{select_queue_families, QueueFamilyIndices};
use ash::vk;
use std::ffi::{c_char, CStr, CString};

/// Engine name reported to the driver.
pub const ENGINE_NAME: &CStr = c"Photon";

/// Validation layers to enable when requested.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Create a Vulkan instance.
///
/// `surface_extensions` is empty for headless rendering, or the list
/// `ash_window::enumerate_required_extensions` returns for the target display.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
    surface_extensions: &[*const c_char],
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::DeviceInit(format!("Invalid application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(ENGINE_NAME)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let mut extension_names = surface_extensions.to_vec();
    #[cfg(target_os = "macos")]
    extension_names.push(ash::khr::portability_enumeration::NAME.as_ptr());

    let layers = if enable_validation {
        validation_layers()
    } else {
        vec![]
    };

    // Missing layers are dropped with a warning instead of failing instance creation.
    let available_layers = entry.enumerate_instance_layer_properties()?;
    let layers: Vec<&CStr> = layers
        .into_iter()
        .filter(|layer| {
            let found = available_layers
                .iter()
                .any(|props| CStr::from_ptr(props.layer_name.as_ptr()) == *layer);
            if !found {
                tracing::warn!("Validation layer {} not available", layer.to_string_lossy());
            }
            found
        })
        .collect();
    let layer_names: Vec<*const c_char> = layers.iter().map(|l| l.as_ptr()).collect();

    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = entry
        .create_instance(&create_info, None)
        .map_err(|e| GpuError::DeviceInit(format!("Instance creation failed: {e}")))?;

    Ok(instance)
}

/// A physical device that passed every requirement check.
pub struct DeviceCandidate {
    pub physical_device: vk::PhysicalDevice,
    pub capabilities: GpuCapabilities,
    pub queue_families: QueueFamilyIndices,
}

/// Select the best physical device.
///
/// `supports_present` is asked for each `(device, family)` pair when a surface
/// is targeted; pass `None` for headless rendering.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
    supports_present: Option<&dyn Fn(vk::PhysicalDevice, u32) -> bool>,
) -> Result<DeviceCandidate> {
    let devices = instance.enumerate_physical_devices()?;

    let mut best: Option<(i64, DeviceCandidate)> = None;

    for physical_device in devices {
        let capabilities = GpuCapabilities::query(instance, physical_device);
        if !capabilities.meets_requirements() {
            tracing::debug!("Skipping {}: requirements not met", capabilities.device_name);
            continue;
        }
        if supports_present.is_some() && !capabilities.has_extension(ash::khr::swapchain::NAME) {
            tracing::debug!("Skipping {}: no swapchain support", capabilities.device_name);
            continue;
        }

        let families = instance.get_physical_device_queue_family_properties(physical_device);
        let queue_families = match select_queue_families(
            &families,
            |family| supports_present.is_some_and(|f| f(physical_device, family)),
            supports_present.is_some(),
        ) {
            Ok(indices) => indices,
            Err(e) => {
                tracing::debug!("Skipping {}: {e}", capabilities.device_name);
                continue;
            }
        };

        let score = score_device(&capabilities);
        if best.as_ref().map_or(true, |(s, _)| score > *s) {
            best = Some((
                score,
                DeviceCandidate {
                    physical_device,
                    capabilities,
                    queue_families,
                },
            ));
        }
    }

    best.map(|(_, candidate)| candidate)
        .ok_or(GpuError::NoSuitableDevice)
}

/// Rank a device: discrete first, then by VRAM.
fn score_device(capabilities: &GpuCapabilities) -> i64 {
    let type_score = match capabilities.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        _ => 0,
    };
    // +1 per GB
    type_score + (capabilities.device_local_memory_mb / 1024) as i64
}
