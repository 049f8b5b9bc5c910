//! Descriptor set management.

use crate::error::Result;
use ash::vk;

/// Descriptor set layout builder.
pub struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
}

impl<'a> DescriptorSetLayoutBuilder<'a> {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(1)
                .stage_flags(stage_flags),
        );
        self
    }

    /// Add a storage buffer binding.
    pub fn storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_BUFFER, stage_flags)
    }

    /// Add a uniform buffer binding.
    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, stage_flags)
    }

    /// Per-type descriptor counts for sizing a pool that holds `sets` of this layout.
    pub fn pool_sizes(&self, sets: u32) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for binding in &self.bindings {
            match sizes.iter_mut().find(|s| s.ty == binding.descriptor_type) {
                Some(size) => size.descriptor_count += sets,
                None => sizes.push(
                    vk::DescriptorPoolSize::default()
                        .ty(binding.descriptor_type)
                        .descriptor_count(sets),
                ),
            }
        }
        sizes
    }

    /// Build the descriptor set layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(&self, device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.bindings);

        let layout = device.create_descriptor_set_layout(&layout_info, None)?;
        Ok(layout)
    }
}

impl Default for DescriptorSetLayoutBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Descriptor pool for allocating descriptor sets.
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
}

impl DescriptorPool {
    /// Create a new descriptor pool.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Self> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);

        let pool = device.create_descriptor_pool(&create_info, None)?;
        Ok(Self { pool })
    }

    /// Allocate one set per layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(
        &self,
        device: &ash::Device,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(layouts);

        let sets = device.allocate_descriptor_sets(&alloc_info)?;
        Ok(sets)
    }

    /// Destroy the pool, freeing all descriptor sets.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_descriptor_pool(self.pool, None);
    }
}

/// Collects buffer descriptor writes and applies them in one update.
#[derive(Default)]
pub struct DescriptorWriter {
    writes: Vec<(vk::DescriptorSet, u32, vk::DescriptorType, vk::DescriptorBufferInfo)>,
}

impl DescriptorWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a whole-buffer uniform descriptor.
    pub fn uniform_buffer(self, set: vk::DescriptorSet, binding: u32, buffer: vk::Buffer) -> Self {
        self.buffer(set, binding, vk::DescriptorType::UNIFORM_BUFFER, buffer)
    }

    /// Queue a whole-buffer storage descriptor.
    pub fn storage_buffer(self, set: vk::DescriptorSet, binding: u32, buffer: vk::Buffer) -> Self {
        self.buffer(set, binding, vk::DescriptorType::STORAGE_BUFFER, buffer)
    }

    fn buffer(
        mut self,
        set: vk::DescriptorSet,
        binding: u32,
        ty: vk::DescriptorType,
        buffer: vk::Buffer,
    ) -> Self {
        let info = vk::DescriptorBufferInfo::default()
            .buffer(buffer)
            .offset(0)
            .range(vk::WHOLE_SIZE);
        self.writes.push((set, binding, ty, info));
        self
    }

    /// Number of queued writes.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Apply every queued write.
    ///
    /// # Safety
    /// The device, sets and buffers must be valid, and no set may be in use by
    /// a pending submission.
    pub unsafe fn update(self, device: &ash::Device) {
        let writes: Vec<vk::WriteDescriptorSet> = self
            .writes
            .iter()
            .map(|(set, binding, ty, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(*set)
                    .dst_binding(*binding)
                    .descriptor_type(*ty)
                    .buffer_info(std::slice::from_ref(info))
            })
            .collect();
        device.update_descriptor_sets(&writes, &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_sizes_group_by_type() {
        let builder = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::COMPUTE)
            .storage_buffer(1, vk::ShaderStageFlags::COMPUTE)
            .storage_buffer(2, vk::ShaderStageFlags::COMPUTE);

        let sizes = builder.pool_sizes(3);
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 3);
        assert_eq!(sizes[1].ty, vk::DescriptorType::STORAGE_BUFFER);
        assert_eq!(sizes[1].descriptor_count, 6);
    }

    #[test]
    fn writer_queues_without_device() {
        let writer = DescriptorWriter::new()
            .uniform_buffer(vk::DescriptorSet::null(), 0, vk::Buffer::null())
            .storage_buffer(vk::DescriptorSet::null(), 1, vk::Buffer::null());
        assert_eq!(writer.len(), 2);
        assert!(!writer.is_empty());
    }
}
