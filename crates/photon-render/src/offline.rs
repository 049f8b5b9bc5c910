//! Headless single-frame rendering.
//!
//! No swapchain and no pipelining: the dispatch is submitted and the compute
//! queue drained, then [`OfflineRenderer::sync`] copies the target into a
//! host-visible readback buffer.

use std::path::Path;
use std::sync::Arc;

use ash::vk;
use photon_core::{pixels_from_bytes, FrameExtent, PackedRgba};
use photon_gpu::{
    BufferHandle, CommandBufferHandle, EndAction, GpuContext, GpuError, Result, SubmitDesc,
};
use tracing::{debug, info};

use crate::camera::CameraUniforms;
use crate::encode::encoder_for_path;
use crate::program::{ProgramBindings, TracePushConstants};
use crate::renderer::RenderError;
use crate::resources::{
    record_camera_copy, PoolSizes, TraceResources, CAMERA_BYTES, UNIFORM_USAGE,
};
use crate::scene::Scene;

/// Renders single frames into host memory.
pub struct OfflineRenderer {
    resources: TraceResources,
    extent: FrameExtent,
    target: BufferHandle,
    camera_staging: BufferHandle,
    camera_uniform: BufferHandle,
    readback: BufferHandle,
    cmd: CommandBufferHandle,
    bindings_generation: Option<u64>,
    frame: u64,
    destroyed: bool,
}

impl OfflineRenderer {
    pub fn new(
        gpu: Arc<GpuContext>,
        program_spirv: Vec<u8>,
        pools: PoolSizes,
        extent: FrameExtent,
    ) -> Result<Self> {
        let mut resources = TraceResources::new(gpu, program_spirv, pools, 1)?;
        let target = resources.allocate_target(extent)?;
        let camera_uniform = resources.allocate_device(CAMERA_BYTES, UNIFORM_USAGE)?;
        let host = resources.host_pool_mut();
        let camera_staging =
            host.allocate_or_defrag(CAMERA_BYTES, vk::BufferUsageFlags::TRANSFER_SRC)?;
        let readback =
            host.allocate_or_defrag(extent.byte_size(), vk::BufferUsageFlags::TRANSFER_DST)?;
        let cmd = resources.commands_mut().allocate()?;

        info!("Offline renderer ready: {}x{}", extent.width, extent.height);

        Ok(Self {
            resources,
            extent,
            target,
            camera_staging,
            camera_uniform,
            readback,
            cmd,
            bindings_generation: None,
            frame: 0,
            destroyed: false,
        })
    }

    pub fn extent(&self) -> FrameExtent {
        self.extent
    }

    pub fn frame_count(&self) -> u64 {
        self.frame
    }

    pub fn resources(&self) -> &TraceResources {
        &self.resources
    }

    /// Upload scene geometry and build the trace program.
    pub fn prerender(&mut self, scene: &dyn Scene) -> Result<()> {
        self.resources.prerender(scene)
    }

    /// Trace one frame into the device-local target and wait for it.
    pub fn render(&mut self, camera: &CameraUniforms) -> Result<()> {
        self.refresh_bindings()?;

        let host = self.resources.host_pool();
        host.write_pod(self.camera_staging, camera)?;
        host.flush(self.camera_staging)?;

        let staging = host.raw(self.camera_staging)?;
        let uniform = self.resources.device_buffer(self.camera_uniform)?;
        let program = self.resources.program()?;
        let set = program.descriptor_set(0)?;
        let push = TracePushConstants::new(self.extent, self.frame, false);
        let [gx, gy, gz] = self.extent.dispatch_groups();

        let commands = self.resources.commands();
        let cmd = commands.begin(self.cmd)?;
        unsafe {
            record_camera_copy(self.resources.device(), cmd, staging, uniform);
            program.bind(cmd, set);
            program.push_constants(cmd, &push);
            program.dispatch(cmd, gx, gy, gz);
        }
        commands.end(
            self.cmd,
            EndAction::SubmitAndWait(SubmitDesc::bare("offline render")),
        )?;

        self.frame += 1;
        debug!(frame = self.frame, "Offline frame rendered");
        Ok(())
    }

    /// Copy the last rendered frame back to the host.
    pub fn sync(&mut self) -> Result<Vec<PackedRgba>> {
        let src = self.resources.device_buffer(self.target)?;
        let dst = self.resources.host_pool().raw(self.readback)?;
        let size = self.extent.byte_size();
        let device = self.resources.gpu().device_arc();

        self.resources
            .commands_mut()
            .execute_once("frame readback", |cmd| {
                unsafe {
                    let visible = vk::MemoryBarrier2::default()
                        .src_stage_mask(vk::PipelineStageFlags2::COMPUTE_SHADER)
                        .src_access_mask(vk::AccessFlags2::SHADER_WRITE)
                        .dst_stage_mask(vk::PipelineStageFlags2::COPY)
                        .dst_access_mask(vk::AccessFlags2::TRANSFER_READ);
                    device.cmd_pipeline_barrier2(
                        cmd,
                        &vk::DependencyInfo::default()
                            .memory_barriers(std::slice::from_ref(&visible)),
                    );

                    let region = vk::BufferCopy::default().size(size);
                    device.cmd_copy_buffer(cmd, src, dst, &[region]);

                    let host_read = vk::MemoryBarrier2::default()
                        .src_stage_mask(vk::PipelineStageFlags2::COPY)
                        .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                        .dst_stage_mask(vk::PipelineStageFlags2::HOST)
                        .dst_access_mask(vk::AccessFlags2::HOST_READ);
                    device.cmd_pipeline_barrier2(
                        cmd,
                        &vk::DependencyInfo::default()
                            .memory_barriers(std::slice::from_ref(&host_read)),
                    );
                }
                Ok(())
            })?;

        // The readback buffer may be padded past the frame by pool alignment.
        let mut bytes = self.resources.host_pool().read(self.readback)?;
        bytes.truncate(size as usize);
        pixels_from_bytes(self.extent, &bytes).map_err(|e| GpuError::InvalidState(e.to_string()))
    }

    /// Render one frame and write it to `path`, PNG or PPM by extension.
    pub fn render_to_file(
        &mut self,
        camera: &CameraUniforms,
        path: &Path,
    ) -> std::result::Result<(), RenderError> {
        let encoder = encoder_for_path(path)?;
        self.render(camera)?;
        let pixels = self.sync()?;
        encoder.encode(path, &pixels, self.extent.width, self.extent.height)?;
        Ok(())
    }

    fn refresh_bindings(&mut self) -> Result<()> {
        let generation = self.resources.generation();
        if self.bindings_generation == Some(generation) {
            return Ok(());
        }
        let geometry = self.resources.geometry_buffers()?;
        self.resources.program()?.write_bindings(
            0,
            &ProgramBindings {
                camera: self.resources.device_buffer(self.camera_uniform)?,
                target: self.resources.device_buffer(self.target)?,
                geometry: &geometry,
            },
        )?;
        self.bindings_generation = Some(generation);
        Ok(())
    }

    /// Wait for the device and release every resource. Idempotent.
    pub fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        self.resources.gpu().wait_idle()?;
        self.resources.free_device(self.target)?;
        self.resources.free_device(self.camera_uniform)?;
        let host = self.resources.host_pool_mut();
        host.deallocate(self.camera_staging)?;
        host.deallocate(self.readback)?;
        self.resources.commands_mut().deallocate(self.cmd)?;
        unsafe { self.resources.destroy()? };
        self.destroyed = true;
        Ok(())
    }
}
