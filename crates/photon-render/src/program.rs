//! The trace kernel: compute pipeline, descriptor layout and push constants.
//!
//! Binding layout (set 0):
//! - 0: camera uniform buffer
//! - 1: render target storage buffer, one packed RGBA `u32` per pixel
//! - 2..: one storage buffer per scene geometry blob

use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use photon_core::FrameExtent;
use photon_gpu::{
    ComputePipeline, DescriptorPool, DescriptorSetLayoutBuilder, DescriptorWriter, GpuContext,
    GpuError, Result,
};
use tracing::info;

pub const CAMERA_BINDING: u32 = 0;
pub const TARGET_BINDING: u32 = 1;
pub const FIRST_GEOMETRY_BINDING: u32 = 2;

/// Push constant flag: write pixels as BGRA for a BGRA swapchain.
pub const FLAG_BGRA: u32 = 1;

/// Per-dispatch constants.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct TracePushConstants {
    pub width: u32,
    pub height: u32,
    pub frame_index: u32,
    pub flags: u32,
}

impl TracePushConstants {
    pub fn new(extent: FrameExtent, frame_index: u64, bgra: bool) -> Self {
        Self {
            width: extent.width,
            height: extent.height,
            // Wraps; the kernel only uses it to vary sampling.
            frame_index: frame_index as u32,
            flags: if bgra { FLAG_BGRA } else { 0 },
        }
    }
}

/// Descriptors the trace kernel reads for one frame slot.
#[derive(Clone, Copy, Debug)]
pub struct ProgramBindings<'a> {
    pub camera: vk::Buffer,
    pub target: vk::Buffer,
    pub geometry: &'a [vk::Buffer],
}

/// Compute pipeline plus one descriptor set per frame slot.
pub struct ComputeProgram {
    device: Arc<ash::Device>,
    pipeline: ComputePipeline,
    set_layout: vk::DescriptorSetLayout,
    descriptor_pool: DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
    geometry_bindings: u32,
}

impl ComputeProgram {
    /// Build the kernel from SPIR-V file bytes.
    ///
    /// `geometry_bindings` storage buffers follow the render target;
    /// `set_count` descriptor sets are allocated, one per frame slot.
    pub fn from_spirv_bytes(
        ctx: &GpuContext,
        bytes: &[u8],
        geometry_bindings: u32,
        set_count: u32,
    ) -> Result<Self> {
        let device = ctx.device_arc();

        let push_size = std::mem::size_of::<TracePushConstants>() as u32;
        if push_size > ctx.capabilities().max_push_constants_size {
            return Err(GpuError::PipelineCreation(format!(
                "push constants of {push_size} bytes exceed device limit"
            )));
        }

        let mut layout_builder = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(CAMERA_BINDING, vk::ShaderStageFlags::COMPUTE)
            .storage_buffer(TARGET_BINDING, vk::ShaderStageFlags::COMPUTE);
        for i in 0..geometry_bindings {
            layout_builder = layout_builder
                .storage_buffer(FIRST_GEOMETRY_BINDING + i, vk::ShaderStageFlags::COMPUTE);
        }

        let set_layout = unsafe { layout_builder.build(&device)? };

        let push_constant_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(push_size);

        let pipeline = match unsafe {
            ComputePipeline::from_spirv_bytes(&device, bytes, &[set_layout], &[push_constant_range])
        } {
            Ok(pipeline) => pipeline,
            Err(e) => {
                unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(e);
            }
        };

        let set_count = set_count.max(1);
        let descriptor_pool = unsafe {
            DescriptorPool::new(&device, set_count, &layout_builder.pool_sizes(set_count))?
        };
        let layouts = vec![set_layout; set_count as usize];
        let sets = unsafe { descriptor_pool.allocate(&device, &layouts)? };

        info!(
            "Trace program created: {} geometry bindings, {} descriptor sets",
            geometry_bindings, set_count
        );

        Ok(Self {
            device,
            pipeline,
            set_layout,
            descriptor_pool,
            sets,
            geometry_bindings,
        })
    }

    /// Number of geometry storage buffers the layout expects.
    pub fn geometry_bindings(&self) -> u32 {
        self.geometry_bindings
    }

    /// Descriptor set for frame slot `slot`.
    pub fn descriptor_set(&self, slot: usize) -> Result<vk::DescriptorSet> {
        self.sets.get(slot).copied().ok_or_else(|| {
            GpuError::InvalidState(format!("No descriptor set for frame slot {slot}"))
        })
    }

    /// Point slot `slot`'s descriptors at its buffers.
    ///
    /// Must be called again for every slot after a memory pool defrag, since
    /// moved buffers are recreated.
    pub fn write_bindings(&self, slot: usize, bindings: &ProgramBindings<'_>) -> Result<()> {
        if bindings.geometry.len() != self.geometry_bindings as usize {
            return Err(GpuError::InvalidState(format!(
                "Program expects {} geometry buffers, got {}",
                self.geometry_bindings,
                bindings.geometry.len()
            )));
        }

        let set = self.descriptor_set(slot)?;
        let mut writer = DescriptorWriter::new()
            .uniform_buffer(set, CAMERA_BINDING, bindings.camera)
            .storage_buffer(set, TARGET_BINDING, bindings.target);
        for (i, &buffer) in bindings.geometry.iter().enumerate() {
            writer = writer.storage_buffer(set, FIRST_GEOMETRY_BINDING + i as u32, buffer);
        }
        unsafe { writer.update(&self.device) };
        Ok(())
    }

    /// Bind the pipeline and a descriptor set.
    ///
    /// # Safety
    /// `cmd` must be recording.
    pub unsafe fn bind(&self, cmd: vk::CommandBuffer, set: vk::DescriptorSet) {
        self.device
            .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipeline.pipeline);
        self.device.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::COMPUTE,
            self.pipeline.layout,
            0,
            &[set],
            &[],
        );
    }

    /// Record push constants.
    ///
    /// # Safety
    /// `cmd` must be recording with this program bound.
    pub unsafe fn push_constants(&self, cmd: vk::CommandBuffer, constants: &TracePushConstants) {
        self.device.cmd_push_constants(
            cmd,
            self.pipeline.layout,
            vk::ShaderStageFlags::COMPUTE,
            0,
            bytemuck::bytes_of(constants),
        );
    }

    /// Record a dispatch of `x * y * z` workgroups.
    ///
    /// # Safety
    /// `cmd` must be recording with this program bound.
    pub unsafe fn dispatch(&self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.device.cmd_dispatch(cmd, x, y, z);
    }

    /// Destroy the pipeline, descriptor pool and layout.
    ///
    /// # Safety
    /// No submission may still reference the program.
    pub unsafe fn destroy(&self) {
        self.pipeline.destroy(&self.device);
        self.descriptor_pool.destroy(&self.device);
        self.device.destroy_descriptor_set_layout(self.set_layout, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_constants_are_sixteen_bytes() {
        assert_eq!(std::mem::size_of::<TracePushConstants>(), 16);
    }

    #[test]
    fn push_constants_carry_extent_and_flags() {
        let extent = FrameExtent::new(640, 480).unwrap();
        let pc = TracePushConstants::new(extent, 7, true);
        assert_eq!((pc.width, pc.height, pc.frame_index), (640, 480, 7));
        assert_eq!(pc.flags & FLAG_BGRA, FLAG_BGRA);
        assert_eq!(TracePushConstants::new(extent, 0, false).flags, 0);
    }
}
