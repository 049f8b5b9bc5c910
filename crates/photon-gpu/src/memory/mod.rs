//! GPU memory management.
//!
//! gpu-allocator provides the few large backing blocks; everything inside a
//! block is sub-allocated by [`MemoryPool`] using the bookkeeping in
//! [`MemoryBlock`].

mod block;
mod pool;

pub use block::{BlockStats, MemoryBlock, Region, Relocation, UsedRegion};
pub use pool::{MemoryPool, MemoryPoolDesc};

use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;

/// Backing-memory allocator wrapper.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
        })
    }

    /// Allocate one backing block for a memory pool.
    pub fn allocate_block(
        &mut self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
    ) -> Result<Allocation> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    /// Return a backing block.
    pub fn free_block(&mut self, allocation: Allocation) -> Result<()> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?
            .free(allocation)
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    /// Any remaining allocations will be freed (and logged as leaks).
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
