//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// Smallest workgroup the trace kernel is compiled for: 32 x 32 invocations.
pub const REQUIRED_WORKGROUP_INVOCATIONS: u32 = 1024;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Physical device type, used to rank candidates
    pub device_type: vk::PhysicalDeviceType,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Synchronization2 support (VK 1.3 core)
    pub supports_synchronization2: bool,

    // Memory info
    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Maximum memory allocation count
    pub max_memory_allocation_count: u32,

    // Alignment limits that bound sub-allocation granularity
    pub min_storage_buffer_offset_alignment: u64,
    pub min_uniform_buffer_offset_alignment: u64,
    pub non_coherent_atom_size: u64,

    // Compute limits
    /// Maximum compute workgroup size
    pub max_compute_workgroup_size: [u32; 3],
    /// Maximum compute workgroup invocations
    pub max_compute_workgroup_invocations: u32,
    /// Maximum push constant block size
    pub max_push_constants_size: u32,

    // Available extensions
    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let limits = &properties.limits;

        Self {
            vendor,
            device_name,
            device_type: properties.device_type,
            api_version: properties.api_version,
            driver_version: properties.driver_version,

            supports_synchronization2: has_vulkan_1_3(properties.api_version)
                || available_extensions.contains("VK_KHR_synchronization2"),

            device_local_memory_mb,
            max_memory_allocation_count: limits.max_memory_allocation_count,

            min_storage_buffer_offset_alignment: limits.min_storage_buffer_offset_alignment,
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            non_coherent_atom_size: limits.non_coherent_atom_size,

            max_compute_workgroup_size: limits.max_compute_work_group_size,
            max_compute_workgroup_invocations: limits.max_compute_work_group_invocations,
            max_push_constants_size: limits.max_push_constants_size,

            available_extensions,
        }
    }

    /// Check if the GPU can run the trace kernel and the frame pipeline.
    pub fn meets_requirements(&self) -> bool {
        has_vulkan_1_3(self.api_version)
            && self.supports_synchronization2
            && self.max_compute_workgroup_invocations >= REQUIRED_WORKGROUP_INVOCATIONS
            && self.max_compute_workgroup_size[0] >= 32
            && self.max_compute_workgroup_size[1] >= 32
    }

    /// Whether a device extension is available.
    pub fn has_extension(&self, name: &CStr) -> bool {
        name.to_str()
            .is_ok_and(|name| self.available_extensions.contains(name))
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

fn has_vulkan_1_3(api_version: u32) -> bool {
    let major = vk::api_version_major(api_version);
    let minor = vk::api_version_minor(api_version);
    major > 1 || (major == 1 && minor >= 3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn api_version_gate() {
        assert!(has_vulkan_1_3(vk::make_api_version(0, 1, 3, 0)));
        assert!(has_vulkan_1_3(vk::make_api_version(0, 1, 4, 2)));
        assert!(!has_vulkan_1_3(vk::make_api_version(0, 1, 2, 198)));
    }
}
