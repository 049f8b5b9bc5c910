//! Compute pipeline creation.

use crate::error::{GpuError, Result};
use ash::vk;
use std::io::Cursor;

/// Compute pipeline wrapper.
pub struct ComputePipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl ComputePipeline {
    /// Create a compute pipeline from SPIR-V words.
    ///
    /// # Safety
    /// The device must be valid and the shader code must be valid SPIR-V.
    pub unsafe fn new(
        device: &ash::Device,
        shader_code: &[u32],
        descriptor_set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self> {
        let shader_info = vk::ShaderModuleCreateInfo::default().code(shader_code);
        let shader_module = device
            .create_shader_module(&shader_info, None)
            .map_err(|e| GpuError::ShaderCompilation(e.to_string()))?;

        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(descriptor_set_layouts)
            .push_constant_ranges(push_constant_ranges);

        let layout = match device.create_pipeline_layout(&layout_info, None) {
            Ok(layout) => layout,
            Err(e) => {
                device.destroy_shader_module(shader_module, None);
                return Err(GpuError::PipelineCreation(e.to_string()));
            }
        };

        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader_module)
            .name(c"main");

        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(layout);

        let created =
            device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None);

        // The module is baked into the pipeline and no longer needed.
        device.destroy_shader_module(shader_module, None);

        let pipeline = match created {
            Ok(pipelines) => pipelines.first().copied(),
            Err((_, e)) => {
                device.destroy_pipeline_layout(layout, None);
                return Err(GpuError::PipelineCreation(e.to_string()));
            }
        }
        .ok_or_else(|| GpuError::PipelineCreation("driver returned no pipeline".to_string()))?;

        Ok(Self { pipeline, layout })
    }

    /// Create a compute pipeline from raw SPIR-V file bytes.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn from_spirv_bytes(
        device: &ash::Device,
        bytes: &[u8],
        descriptor_set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self> {
        let code = spirv_words(bytes)?;
        Self::new(device, &code, descriptor_set_layouts, push_constant_ranges)
    }

    /// Destroy the pipeline.
    ///
    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
    }
}

/// Decode SPIR-V file bytes into words, checking size and magic number.
pub fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(bytes))
        .map_err(|e| GpuError::ShaderCompilation(format!("Invalid SPIR-V: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn decodes_little_endian_words() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0300u32.to_le_bytes());
        let words = spirv_words(&bytes).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0300]);
    }

    #[test]
    fn rejects_truncated_input() {
        let bytes = [0x03, 0x02, 0x23, 0x07, 0x00];
        assert!(matches!(
            spirv_words(&bytes),
            Err(GpuError::ShaderCompilation(_))
        ));
    }

    #[test]
    fn rejects_wrong_magic() {
        let bytes = 0xDEAD_BEEFu32.to_le_bytes();
        assert!(spirv_words(&bytes).is_err());
    }
}
