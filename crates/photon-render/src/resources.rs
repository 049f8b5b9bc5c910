//! GPU resources shared by the offline and interactive renderers.
//!
//! Owns the two memory pools, the compute command pool, the scene geometry
//! and the trace program. Geometry is uploaded once by [`prerender`]
//! through host-visible staging.
//!
//! [`prerender`]: TraceResources::prerender

use std::sync::Arc;

use ash::vk;
use photon_core::FrameExtent;
use photon_gpu::{
    BufferHandle, CommandPool, GpuContext, GpuError, MemoryPool, MemoryPoolDesc, Result,
};
use tracing::{debug, info, warn};

use crate::camera::CameraUniforms;
use crate::program::ComputeProgram;
use crate::scene::{GeometryBlob, Scene};

/// Default device-local pool size: render targets, uniforms and geometry.
pub const DEFAULT_DEVICE_POOL_BYTES: u64 = 256 * 1024 * 1024;
/// Default host-visible pool size: staging and readback.
pub const DEFAULT_HOST_POOL_BYTES: u64 = 64 * 1024 * 1024;

/// Sizes of the two memory pools.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolSizes {
    pub device_local: u64,
    pub host_visible: u64,
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self {
            device_local: DEFAULT_DEVICE_POOL_BYTES,
            host_visible: DEFAULT_HOST_POOL_BYTES,
        }
    }
}

/// Usage for per-slot render targets.
pub const TARGET_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::STORAGE_BUFFER.as_raw() | vk::BufferUsageFlags::TRANSFER_SRC.as_raw(),
);

/// Usage for device-local camera uniforms.
pub const UNIFORM_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::UNIFORM_BUFFER.as_raw() | vk::BufferUsageFlags::TRANSFER_DST.as_raw(),
);

const GEOMETRY_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::STORAGE_BUFFER.as_raw() | vk::BufferUsageFlags::TRANSFER_DST.as_raw(),
);

/// Size of one camera uniform buffer.
pub const CAMERA_BYTES: u64 = std::mem::size_of::<CameraUniforms>() as u64;

/// Memory pools, compute commands, geometry and the trace program.
pub struct TraceResources {
    gpu: Arc<GpuContext>,
    device_pool: MemoryPool,
    host_pool: MemoryPool,
    commands: CommandPool,
    program_spirv: Vec<u8>,
    program: Option<ComputeProgram>,
    set_count: u32,
    scene: Vec<GeometryBlob>,
    geometry: Vec<BufferHandle>,
    /// Bumped whenever a device-local buffer may have been recreated.
    generation: u64,
}

impl TraceResources {
    /// Create both pools and the compute command pool.
    ///
    /// `set_count` descriptor sets are allocated for the program, one per
    /// frame slot.
    pub fn new(
        gpu: Arc<GpuContext>,
        program_spirv: Vec<u8>,
        pools: PoolSizes,
        set_count: u32,
    ) -> Result<Self> {
        let mut device_pool =
            MemoryPool::new(&gpu, &MemoryPoolDesc::device_local(pools.device_local))?;
        let host_pool =
            match MemoryPool::new(&gpu, &MemoryPoolDesc::host_visible(pools.host_visible)) {
                Ok(pool) => pool,
                Err(e) => {
                    unsafe { device_pool.destroy(&mut gpu.allocator().lock())? };
                    return Err(e);
                }
            };
        let commands = unsafe {
            CommandPool::new(
                gpu.device_arc(),
                gpu.compute_queue_family(),
                gpu.compute_queue(),
            )?
        };

        Ok(Self {
            gpu,
            device_pool,
            host_pool,
            commands,
            program_spirv,
            program: None,
            set_count,
            scene: Vec::new(),
            geometry: Vec::new(),
            generation: 0,
        })
    }

    pub fn gpu(&self) -> &Arc<GpuContext> {
        &self.gpu
    }

    pub fn device(&self) -> &ash::Device {
        self.gpu.device()
    }

    pub fn device_pool(&self) -> &MemoryPool {
        &self.device_pool
    }

    pub fn host_pool(&self) -> &MemoryPool {
        &self.host_pool
    }

    pub fn host_pool_mut(&mut self) -> &mut MemoryPool {
        &mut self.host_pool
    }

    pub fn commands(&self) -> &CommandPool {
        &self.commands
    }

    pub fn commands_mut(&mut self) -> &mut CommandPool {
        &mut self.commands
    }

    /// Changes whenever raw device-local buffers may have been recreated, so
    /// descriptor sets written before must be rewritten.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The trace program. Available after [`prerender`](Self::prerender).
    pub fn program(&self) -> Result<&ComputeProgram> {
        self.program.as_ref().ok_or_else(|| {
            GpuError::InvalidState("prerender must run before rendering".to_string())
        })
    }

    /// Raw geometry buffers in binding order.
    pub fn geometry_buffers(&self) -> Result<Vec<vk::Buffer>> {
        self.geometry
            .iter()
            .map(|&handle| self.device_pool.raw(handle))
            .collect()
    }

    /// Upload the scene's geometry and build the trace program around it.
    ///
    /// Replaces any previously uploaded scene.
    pub fn prerender(&mut self, scene: &dyn Scene) -> Result<()> {
        self.gpu.wait_idle()?;
        self.release_scene()?;

        let blobs = scene.geometry().to_vec();
        for blob in &blobs {
            let handle = self.allocate_device(blob.len().max(4) as u64, GEOMETRY_USAGE)?;
            self.geometry.push(handle);
            self.upload(handle, &blob.bytes)?;
            debug!(label = %blob.label, bytes = blob.len(), %handle, "Geometry uploaded");
        }
        self.scene = blobs;

        self.program = Some(ComputeProgram::from_spirv_bytes(
            &self.gpu,
            &self.program_spirv,
            self.geometry.len() as u32,
            self.set_count,
        )?);
        self.generation += 1;

        info!(
            "Scene ready: {} geometry buffers, device pool {:?}",
            self.geometry.len(),
            self.device_pool.stats()
        );
        Ok(())
    }

    /// Allocate a device-local buffer, defragmenting the pool if it is
    /// fragmented.
    ///
    /// A defrag recreates moved buffers with undefined contents, so the scene
    /// geometry is uploaded again and the generation bumped.
    pub fn allocate_device(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> Result<BufferHandle> {
        match self.device_pool.allocate(size, usage) {
            Err(GpuError::Fragmented {
                requested,
                free,
                largest,
            }) => {
                warn!(requested, free, largest, "Device pool fragmented, defragmenting");
                let moved = self.device_pool.defrag()?;
                if moved > 0 {
                    self.generation += 1;
                    self.reupload_geometry()?;
                }
                self.device_pool.allocate(size, usage)
            }
            other => other,
        }
    }

    pub fn free_device(&mut self, handle: BufferHandle) -> Result<()> {
        self.device_pool.deallocate(handle)
    }

    /// Raw buffer for a device-local handle.
    pub fn device_buffer(&self, handle: BufferHandle) -> Result<vk::Buffer> {
        self.device_pool.raw(handle)
    }

    /// Allocate a render target for `extent`.
    pub fn allocate_target(&mut self, extent: FrameExtent) -> Result<BufferHandle> {
        self.allocate_device(extent.byte_size(), TARGET_USAGE)
    }

    /// Copy `bytes` into a device-local buffer through staging, waiting for
    /// the copy to finish.
    pub fn upload(&mut self, dst: BufferHandle, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let staging = self
            .host_pool
            .allocate_or_defrag(bytes.len() as u64, vk::BufferUsageFlags::TRANSFER_SRC)?;

        let result = self.copy_via_staging(staging, dst, bytes);
        self.host_pool.deallocate(staging)?;
        result
    }

    fn copy_via_staging(
        &mut self,
        staging: BufferHandle,
        dst: BufferHandle,
        bytes: &[u8],
    ) -> Result<()> {
        self.host_pool.write(staging, 0, bytes)?;
        self.host_pool.flush(staging)?;

        let src = self.host_pool.raw(staging)?;
        let dst = self.device_pool.raw(dst)?;
        let device = self.gpu.device_arc();
        let size = bytes.len() as u64;

        self.commands.execute_once("geometry upload", |cmd| {
            unsafe {
                let region = vk::BufferCopy::default().size(size);
                device.cmd_copy_buffer(cmd, src, dst, &[region]);
            }
            Ok(())
        })
    }

    fn reupload_geometry(&mut self) -> Result<()> {
        let scene = std::mem::take(&mut self.scene);
        let result = scene
            .iter()
            .zip(self.geometry.clone())
            .try_for_each(|(blob, handle)| self.upload(handle, &blob.bytes));
        self.scene = scene;
        result
    }

    fn release_scene(&mut self) -> Result<()> {
        if let Some(program) = self.program.take() {
            unsafe { program.destroy() };
        }
        for handle in std::mem::take(&mut self.geometry) {
            self.device_pool.deallocate(handle)?;
        }
        self.scene.clear();
        Ok(())
    }

    /// Destroy everything. Idempotent.
    ///
    /// # Safety
    /// No submission may still reference these resources.
    pub unsafe fn destroy(&mut self) -> Result<()> {
        self.release_scene()?;
        self.commands.destroy();
        let mut allocator = self.gpu.allocator().lock();
        self.device_pool.destroy(&mut allocator)?;
        self.host_pool.destroy(&mut allocator)?;
        Ok(())
    }
}

/// Record the staging-to-uniform camera copy and make it visible to the
/// compute shader.
///
/// # Safety
/// `cmd` must be recording on a transfer-capable queue.
pub unsafe fn record_camera_copy(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    staging: vk::Buffer,
    uniform: vk::Buffer,
) {
    let region = vk::BufferCopy::default().size(CAMERA_BYTES);
    device.cmd_copy_buffer(cmd, staging, uniform, &[region]);

    let barrier = vk::BufferMemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::COPY)
        .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
        .dst_stage_mask(vk::PipelineStageFlags2::COMPUTE_SHADER)
        .dst_access_mask(vk::AccessFlags2::UNIFORM_READ)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(uniform)
        .offset(0)
        .size(vk::WHOLE_SIZE);
    let dependency =
        vk::DependencyInfo::default().buffer_memory_barriers(std::slice::from_ref(&barrier));
    device.cmd_pipeline_barrier2(cmd, &dependency);
}
