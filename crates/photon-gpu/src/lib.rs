//! Vulkan resource layer for the Photon ray tracer.
//!
//! This crate provides:
//! - Vulkan instance and device management, with present-queue discovery
//! - GPU capability detection
//! - A sub-allocating memory pool over gpu-allocator blocks
//! - A command buffer registry with handle reuse
//! - Swapchain and synchronization helpers

pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod handle;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod queues;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use capabilities::{GpuCapabilities, GpuVendor};
pub use command::{CommandPool, EndAction, SemaphoreWait, SubmitDesc};
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptors::{DescriptorPool, DescriptorSetLayoutBuilder, DescriptorWriter};
pub use error::{GpuError, Result};
pub use handle::{BufferHandle, CommandBufferHandle};
pub use memory::{BlockStats, GpuAllocator, MemoryBlock, MemoryPool, MemoryPoolDesc, Relocation};
pub use pipeline::ComputePipeline;
pub use queues::{select_queue_families, QueueFamilyIndices};
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use swapchain::Swapchain;
pub use sync::{create_fence, create_semaphore, wait_for_fence, SlotSync};
