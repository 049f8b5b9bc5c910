//! Device-backed sub-allocator.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use tracing::{debug, info, warn};

use super::block::{BlockStats, MemoryBlock, Relocation, UsedRegion};
use super::GpuAllocator;
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::handle::BufferHandle;

/// Parameters for one memory pool.
#[derive(Clone, Debug)]
pub struct MemoryPoolDesc {
    /// Debug name, also used in log lines.
    pub name: String,
    /// Requested block size in bytes. Rounded down to the pool granularity.
    pub capacity: u64,
    /// Memory class the block lives in.
    pub location: MemoryLocation,
    /// Every usage a buffer from this pool may request.
    pub usage: vk::BufferUsageFlags,
}

impl MemoryPoolDesc {
    /// Device-local pool for render targets, uniforms and geometry.
    pub fn device_local(capacity: u64) -> Self {
        Self {
            name: "device-local".to_string(),
            capacity,
            location: MemoryLocation::GpuOnly,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::UNIFORM_BUFFER
                | vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::TRANSFER_DST,
        }
    }

    /// Host-visible pool for staging uploads and readback.
    pub fn host_visible(capacity: u64) -> Self {
        Self {
            name: "host-visible".to_string(),
            capacity,
            location: MemoryLocation::CpuToGpu,
            usage: vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
        }
    }
}

struct PoolBuffer {
    raw: vk::Buffer,
    size: u64,
    usage: vk::BufferUsageFlags,
}

/// One large device memory block carved into logical buffers.
///
/// Callers only ever hold [`BufferHandle`]s. The raw `vk::Buffer` behind a
/// handle is recreated by [`defrag`](Self::defrag), so it must be looked up
/// again with [`raw`](Self::raw) (and any descriptor referencing it rewritten)
/// after a defrag.
pub struct MemoryPool {
    name: String,
    device: Arc<ash::Device>,
    block: MemoryBlock,
    allocation: Option<Allocation>,
    memory: vk::DeviceMemory,
    base_offset: u64,
    mapped: Option<NonNull<u8>>,
    coherent: bool,
    usage: vk::BufferUsageFlags,
    memory_type_bits: u32,
    buffers: HashMap<BufferHandle, PoolBuffer>,
}

impl MemoryPool {
    /// Allocate the backing block and set up an empty pool.
    pub fn new(ctx: &GpuContext, desc: &MemoryPoolDesc) -> Result<Self> {
        let device = ctx.device_arc();

        // A scratch buffer tells us which memory types and alignment the pool's
        // usages need.
        let scratch_info = vk::BufferCreateInfo::default()
            .size(desc.capacity)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let requirements = unsafe {
            let scratch = device.create_buffer(&scratch_info, None)?;
            let requirements = device.get_buffer_memory_requirements(scratch);
            device.destroy_buffer(scratch, None);
            requirements
        };

        let caps = ctx.capabilities();
        let granularity = requirements
            .alignment
            .max(caps.min_storage_buffer_offset_alignment)
            .max(caps.min_uniform_buffer_offset_alignment)
            .max(caps.non_coherent_atom_size)
            .next_power_of_two();
        let capacity = desc.capacity / granularity * granularity;
        if capacity == 0 {
            return Err(GpuError::AllocationFailed(format!(
                "pool '{}' capacity {} is below its granularity {granularity}",
                desc.name, desc.capacity
            )));
        }

        let allocation = ctx.allocator().lock().allocate_block(
            &desc.name,
            vk::MemoryRequirements {
                size: capacity,
                alignment: granularity,
                memory_type_bits: requirements.memory_type_bits,
            },
            desc.location,
        )?;

        let memory = unsafe { allocation.memory() };
        let base_offset = allocation.offset();
        let mapped = allocation.mapped_ptr().map(NonNull::cast::<u8>);
        let coherent = allocation
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT);

        info!(
            "Memory pool '{}' created: {} KiB, granularity {} B, {}",
            desc.name,
            capacity / 1024,
            granularity,
            if mapped.is_some() {
                "host-visible"
            } else {
                "device-local"
            }
        );

        Ok(Self {
            name: desc.name.clone(),
            device,
            block: MemoryBlock::with_alignment(capacity, granularity),
            allocation: Some(allocation),
            memory,
            base_offset,
            mapped,
            coherent,
            usage: desc.usage,
            memory_type_bits: requirements.memory_type_bits,
            buffers: HashMap::new(),
        })
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether buffers from this pool can be written and read by the host.
    pub fn is_host_visible(&self) -> bool {
        self.mapped.is_some()
    }

    /// Region bookkeeping.
    pub fn block(&self) -> &MemoryBlock {
        &self.block
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> BlockStats {
        self.block.stats()
    }

    /// Create a buffer of `size` bytes inside the block.
    ///
    /// The space reserved is the device-reported size rounded up to the pool
    /// granularity, not the raw request.
    pub fn allocate(&mut self, size: u64, usage: vk::BufferUsageFlags) -> Result<BufferHandle> {
        if !self.usage.contains(usage) {
            return Err(GpuError::InvalidState(format!(
                "pool '{}' does not serve usage {usage:?}",
                self.name
            )));
        }

        let raw = unsafe { self.create_raw(size, usage)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(raw) };

        if requirements.alignment > self.block.alignment()
            || requirements.memory_type_bits & self.memory_type_bits == 0
        {
            unsafe { self.device.destroy_buffer(raw, None) };
            return Err(GpuError::AllocationFailed(format!(
                "buffer requirements {requirements:?} incompatible with pool '{}'",
                self.name
            )));
        }

        let handle = match self.block.allocate(requirements.size, usage) {
            Ok(handle) => handle,
            Err(e) => {
                unsafe { self.device.destroy_buffer(raw, None) };
                return Err(e);
            }
        };

        let region = self.block.region(handle)?;
        if let Err(e) = unsafe { self.bind(raw, region) } {
            unsafe { self.device.destroy_buffer(raw, None) };
            self.block.deallocate(handle)?;
            return Err(e);
        }

        self.buffers.insert(handle, PoolBuffer { raw, size, usage });
        debug!(
            pool = %self.name,
            %handle,
            offset = region.offset,
            length = region.length,
            "buffer allocated"
        );
        Ok(handle)
    }

    /// Allocate, and on [`GpuError::Fragmented`] defragment once and retry.
    pub fn allocate_or_defrag(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> Result<BufferHandle> {
        match self.allocate(size, usage) {
            Err(GpuError::Fragmented {
                requested,
                free,
                largest,
            }) => {
                warn!(
                    pool = %self.name,
                    requested, free, largest,
                    "pool fragmented, defragmenting before retry"
                );
                self.defrag()?;
                self.allocate(size, usage)
            }
            other => other,
        }
    }

    /// Destroy a buffer and return its bytes to the free list.
    pub fn deallocate(&mut self, handle: BufferHandle) -> Result<()> {
        let buffer = self.buffers.remove(&handle).ok_or_else(|| {
            GpuError::InvalidHandle(format!("{handle} is not live in pool '{}'", self.name))
        })?;
        self.block.deallocate(handle)?;
        unsafe { self.device.destroy_buffer(buffer.raw, None) };
        debug!(pool = %self.name, %handle, "buffer freed");
        Ok(())
    }

    /// Repack every live buffer to the front of the block.
    ///
    /// Waits for the device to go idle first, so no submission can still be
    /// reading a buffer that moves. Host-visible contents are preserved;
    /// device-local contents of moved buffers are undefined afterwards.
    /// Returns the number of buffers that moved.
    ///
    /// Replacement buffers are created and bound before anything moves. If
    /// that fails the pool is left exactly as it was.
    pub fn defrag(&mut self) -> Result<usize> {
        unsafe { self.device.device_wait_idle()? };

        let snapshot = self.block.clone();
        let relocations = self.block.defrag();

        let staged = stage_all(
            &relocations,
            |relocation| unsafe { self.replacement(relocation) },
            |raw| unsafe { self.device.destroy_buffer(raw, None) },
        );
        let replacements = match staged {
            Ok(replacements) => replacements,
            Err(e) => {
                self.block = snapshot;
                warn!(pool = %self.name, error = %e, "defrag rolled back");
                return Err(e);
            }
        };

        for (relocation, raw) in relocations.iter().zip(replacements) {
            if let Some(base) = self.mapped {
                // Ascending order with new <= old: each move only lands on bytes
                // already vacated, so a forward memmove per buffer is safe.
                unsafe {
                    std::ptr::copy(
                        base.as_ptr().add(relocation.old_offset as usize),
                        base.as_ptr().add(relocation.new_offset as usize),
                        relocation.length as usize,
                    );
                }
            }
            match self.buffers.get_mut(&relocation.handle) {
                Some(buffer) => {
                    let old = std::mem::replace(&mut buffer.raw, raw);
                    unsafe { self.device.destroy_buffer(old, None) };
                }
                None => unsafe { self.device.destroy_buffer(raw, None) },
            }
        }

        if self.mapped.is_some() && !self.coherent && !relocations.is_empty() {
            let ranges = relocations
                .iter()
                .map(|relocation| self.mapped_range(relocation.handle))
                .collect::<Result<Vec<_>>>()?;
            unsafe { self.device.flush_mapped_memory_ranges(&ranges)? };
        }

        info!(
            pool = %self.name,
            moved = relocations.len(),
            free = self.block.free_bytes(),
            "pool defragmented"
        );
        Ok(relocations.len())
    }

    /// Raw buffer behind a handle.
    pub fn raw(&self, handle: BufferHandle) -> Result<vk::Buffer> {
        self.buffer(handle).map(|b| b.raw)
    }

    /// Size the buffer was requested with.
    pub fn size(&self, handle: BufferHandle) -> Result<u64> {
        self.buffer(handle).map(|b| b.size)
    }

    /// Copy bytes into a host-visible buffer at `offset`.
    pub fn write(&self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self.host_ptr(handle, offset, data.len() as u64)?;
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
        Ok(())
    }

    /// Copy a plain-old-data value into the start of a host-visible buffer.
    pub fn write_pod<T: bytemuck::Pod>(&self, handle: BufferHandle, value: &T) -> Result<()> {
        self.write(handle, 0, bytemuck::bytes_of(value))
    }

    /// Make host writes to a buffer visible to the device.
    pub fn flush(&self, handle: BufferHandle) -> Result<()> {
        if self.coherent {
            return Ok(());
        }
        let range = self.mapped_range(handle)?;
        unsafe { self.device.flush_mapped_memory_ranges(&[range])? };
        Ok(())
    }

    /// Copy a host-visible buffer's contents out.
    pub fn read(&self, handle: BufferHandle) -> Result<Vec<u8>> {
        let size = self.size(handle)?;
        if !self.coherent {
            let range = self.mapped_range(handle)?;
            unsafe { self.device.invalidate_mapped_memory_ranges(&[range])? };
        }
        let ptr = self.host_ptr(handle, 0, size)?;
        let mut data = vec![0u8; size as usize];
        unsafe { std::ptr::copy_nonoverlapping(ptr, data.as_mut_ptr(), data.len()) };
        Ok(data)
    }

    /// Destroy every outstanding buffer and return the backing block.
    ///
    /// # Safety
    /// No submission may still reference any buffer of this pool.
    pub unsafe fn destroy(&mut self, allocator: &mut GpuAllocator) -> Result<()> {
        for (_, buffer) in self.buffers.drain() {
            self.device.destroy_buffer(buffer.raw, None);
        }
        if let Some(allocation) = self.allocation.take() {
            allocator.free_block(allocation)?;
        }
        self.mapped = None;
        debug!(pool = %self.name, "pool destroyed");
        Ok(())
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&PoolBuffer> {
        self.buffers.get(&handle).ok_or_else(|| {
            GpuError::InvalidHandle(format!("{handle} is not live in pool '{}'", self.name))
        })
    }

    fn host_ptr(&self, handle: BufferHandle, offset: u64, len: u64) -> Result<*mut u8> {
        let base = self.mapped.ok_or_else(|| {
            GpuError::InvalidState(format!("pool '{}' is not host-visible", self.name))
        })?;
        let size = self.size(handle)?;
        let end = offset
            .checked_add(len)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > size {
            return Err(GpuError::InvalidState(format!(
                "range {offset}..{end} exceeds {handle} of {size} bytes"
            )));
        }
        let region = self.block.region(handle)?;
        Ok(unsafe { base.as_ptr().add((region.offset + offset) as usize) })
    }

    fn mapped_range(&self, handle: BufferHandle) -> Result<vk::MappedMemoryRange<'static>> {
        let region = self.block.region(handle)?;
        Ok(vk::MappedMemoryRange::default()
            .memory(self.memory)
            .offset(self.base_offset + region.offset)
            .size(region.length))
    }

    unsafe fn create_raw(&self, size: u64, usage: vk::BufferUsageFlags) -> Result<vk::Buffer> {
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        Ok(self.device.create_buffer(&info, None)?)
    }

    unsafe fn bind(&self, raw: vk::Buffer, region: UsedRegion) -> Result<()> {
        self.device
            .bind_buffer_memory(raw, self.memory, self.base_offset + region.offset)?;
        Ok(())
    }

    /// New buffer for a relocated handle, bound at its new offset.
    unsafe fn replacement(&self, relocation: &Relocation) -> Result<vk::Buffer> {
        let (size, usage) = {
            let buffer = self.buffer(relocation.handle)?;
            (buffer.size, buffer.usage)
        };
        let region = self.block.region(relocation.handle)?;
        let raw = self.create_raw(size, usage)?;
        if let Err(e) = self.bind(raw, region) {
            self.device.destroy_buffer(raw, None);
            return Err(e);
        }
        Ok(raw)
    }
}

/// Build one replacement per relocation, in order. On the first failure the
/// replacements already built go to `discard` and the error is returned.
fn stage_all<T>(
    relocations: &[Relocation],
    mut build: impl FnMut(&Relocation) -> Result<T>,
    mut discard: impl FnMut(T),
) -> Result<Vec<T>> {
    let mut staged = Vec::with_capacity(relocations.len());
    for relocation in relocations {
        match build(relocation) {
            Ok(item) => staged.push(item),
            Err(e) => {
                for item in staged {
                    discard(item);
                }
                return Err(e);
            }
        }
    }
    Ok(staged)
}

#[cfg(test)]
mod tests {
    use super::*;

    const USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::STORAGE_BUFFER;

    /// Three buffers with a hole in front, so defrag moves two of them.
    fn fragmented_block() -> (MemoryBlock, Vec<BufferHandle>) {
        let mut block = MemoryBlock::new(1024);
        let handles: Vec<_> = (0..3).map(|_| block.allocate(100, USAGE).unwrap()).collect();
        block.deallocate(handles[0]).unwrap();
        (block, handles)
    }

    #[test]
    fn staging_builds_every_replacement_in_order() {
        let (mut block, _) = fragmented_block();
        let relocations = block.defrag();
        assert_eq!(relocations.len(), 2);

        let mut discarded: Vec<u64> = Vec::new();
        let staged = stage_all(
            &relocations,
            |relocation| Ok(relocation.new_offset),
            |offset| discarded.push(offset),
        )
        .unwrap();
        assert_eq!(staged, [0, 100]);
        assert!(discarded.is_empty());
    }

    #[test]
    fn failed_staging_discards_built_replacements_and_restores_block() {
        let (mut block, handles) = fragmented_block();
        let snapshot = block.clone();
        let relocations = block.defrag();

        let mut discarded: Vec<BufferHandle> = Vec::new();
        let result = stage_all(
            &relocations,
            |relocation| {
                if relocation.handle == handles[2] {
                    Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY))
                } else {
                    Ok(relocation.handle)
                }
            },
            |handle| discarded.push(handle),
        );
        assert!(matches!(
            result,
            Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY))
        ));
        assert_eq!(discarded, [handles[1]]);

        // What `MemoryPool::defrag` does on that error.
        block = snapshot;
        assert_eq!(block.region(handles[1]).unwrap().offset, 100);
        assert_eq!(block.region(handles[2]).unwrap().offset, 200);
        block.validate().unwrap();
    }
}
