//! Device implementation of the frame loop.
//!
//! Each slot owns a device-local render target that moves between two queue
//! families every frame: the compute family writes it, the present family
//! copies it into the acquired swapchain image. Ownership is handed over
//! with release/acquire buffer barriers on both sides. When both roles share
//! a family the same barriers still run and act as plain execution and
//! memory dependencies.

use std::cell::Cell;
use std::sync::Arc;

use ash::vk;
use photon_core::FrameExtent;
use photon_gpu::sync::{reset_fence, wait_for_fence};
use photon_gpu::{
    BufferHandle, CommandBufferHandle, CommandPool, EndAction, GpuContext, GpuError, Result,
    SemaphoreWait, SlotSync, SubmitDesc, SurfaceContext, Swapchain,
};
use tracing::{debug, info, warn};

use crate::camera::CameraUniforms;
use crate::frame::{FrameBackend, FrameConfig, FrameSlot};
use crate::program::{ProgramBindings, TracePushConstants};
use crate::resources::{
    record_camera_copy, PoolSizes, TraceResources, CAMERA_BYTES, UNIFORM_USAGE,
};

/// Device resources owned by one frame slot.
#[derive(Debug)]
pub struct SlotResources {
    pub render_target: BufferHandle,
    /// Host-visible source of the camera upload.
    pub camera_staging: BufferHandle,
    /// Device-local uniform the kernel reads.
    pub camera_uniform: BufferHandle,
    pub compute_cmd: CommandBufferHandle,
    pub copy_cmd: CommandBufferHandle,
    /// Set once a copy has released the target back to the compute family.
    released_to_compute: Cell<bool>,
    /// Resource generation the slot's descriptor set was written for.
    bindings_generation: Cell<Option<u64>>,
}

/// [`FrameBackend`] over a real device, surface and swapchain.
pub struct VulkanFrameBackend {
    resources: TraceResources,
    surface: SurfaceContext,
    swapchain: Swapchain,
    present_commands: CommandPool,
    present_queue: vk::Queue,
    compute_family: u32,
    present_family: u32,
    extent: FrameExtent,
    vsync: bool,
    destroyed: bool,
}

impl VulkanFrameBackend {
    /// Create the swapchain, memory pools and command pools.
    pub fn new(
        gpu: Arc<GpuContext>,
        surface: SurfaceContext,
        program_spirv: Vec<u8>,
        pools: PoolSizes,
        config: &FrameConfig,
    ) -> Result<Self> {
        let swapchain = unsafe {
            surface.create_swapchain(
                &gpu,
                config.extent.width,
                config.extent.height,
                config.vsync,
                None,
            )?
        };
        let extent = FrameExtent::new(swapchain.extent.width, swapchain.extent.height)
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        let present_family = gpu.present_queue_family()?;
        let present_queue = gpu.present_queue()?;
        let compute_family = gpu.compute_queue_family();
        let ownership_transfer = gpu.queue_families().needs_ownership_transfer();

        let present_commands =
            unsafe { CommandPool::new(gpu.device_arc(), present_family, present_queue)? };
        let resources =
            TraceResources::new(gpu, program_spirv, pools, config.frames_in_flight as u32)?;

        info!(
            "Swapchain created: {}x{} ({} images, {:?}), compute family {}, present family {}",
            extent.width,
            extent.height,
            swapchain.image_count(),
            swapchain.format,
            compute_family,
            present_family
        );
        if ownership_transfer {
            info!("Render targets cross queue families with ownership transfers");
        } else {
            debug!("Compute and present share a family, ownership barriers are plain dependencies");
        }

        Ok(Self {
            resources,
            surface,
            swapchain,
            present_commands,
            present_queue,
            compute_family,
            present_family,
            extent,
            vsync: config.vsync,
            destroyed: false,
        })
    }

    pub fn resources(&self) -> &TraceResources {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut TraceResources {
        &mut self.resources
    }

    /// Extent of the swapchain and render targets.
    pub fn extent(&self) -> FrameExtent {
        self.extent
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    fn device(&self) -> &ash::Device {
        self.resources.device()
    }

    /// Point the slot's descriptor set at its current raw buffers if they may
    /// have been recreated since it was last written.
    fn refresh_bindings(&self, slot: &FrameSlot<SlotResources>) -> Result<()> {
        let generation = self.resources.generation();
        if slot.resources.bindings_generation.get() == Some(generation) {
            return Ok(());
        }
        let geometry = self.resources.geometry_buffers()?;
        self.resources.program()?.write_bindings(
            slot.index,
            &ProgramBindings {
                camera: self.resources.device_buffer(slot.resources.camera_uniform)?,
                target: self.resources.device_buffer(slot.resources.render_target)?,
                geometry: &geometry,
            },
        )?;
        slot.resources.bindings_generation.set(Some(generation));
        debug!(slot = slot.index, generation, "Descriptor set rewritten");
        Ok(())
    }

    /// Buffer barrier moving `buffer` from `src_family` to `dst_family`.
    ///
    /// Recorded twice per transfer: as the release on the source queue and
    /// as the acquire on the destination queue.
    fn ownership_barrier(
        buffer: vk::Buffer,
        src_family: u32,
        dst_family: u32,
        src: (vk::PipelineStageFlags2, vk::AccessFlags2),
        dst: (vk::PipelineStageFlags2, vk::AccessFlags2),
    ) -> vk::BufferMemoryBarrier2<'static> {
        vk::BufferMemoryBarrier2::default()
            .src_stage_mask(src.0)
            .src_access_mask(src.1)
            .dst_stage_mask(dst.0)
            .dst_access_mask(dst.1)
            .src_queue_family_index(src_family)
            .dst_queue_family_index(dst_family)
            .buffer(buffer)
            .offset(0)
            .size(vk::WHOLE_SIZE)
    }

    fn image_barrier(
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src: (vk::PipelineStageFlags2, vk::AccessFlags2),
        dst: (vk::PipelineStageFlags2, vk::AccessFlags2),
    ) -> vk::ImageMemoryBarrier2<'static> {
        vk::ImageMemoryBarrier2::default()
            .src_stage_mask(src.0)
            .src_access_mask(src.1)
            .dst_stage_mask(dst.0)
            .dst_access_mask(dst.1)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1),
            )
    }

    /// Destroy the swapchain, surface, pools and command pools. Idempotent.
    ///
    /// Every slot must already be destroyed.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        // SAFETY: Caller guarantees the device is idle
        unsafe {
            self.present_commands.destroy();
            self.resources.destroy()?;
            self.swapchain.destroy(&self.surface.swapchain_loader);
            self.surface.destroy();
        }
        self.destroyed = true;
        info!("Presentation resources destroyed");
        Ok(())
    }
}

impl Drop for VulkanFrameBackend {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        // Reached when the render loop failed to build or was never shut down.
        if let Err(e) = self.resources.gpu().wait_idle() {
            warn!("Wait idle before dropping presentation failed: {e}");
        }
        // SAFETY: The device is idle
        if let Err(e) = unsafe { self.destroy() } {
            warn!("Destroying presentation resources on drop failed: {e}");
        }
    }
}

const COMPUTE_WRITE: (vk::PipelineStageFlags2, vk::AccessFlags2) = (
    vk::PipelineStageFlags2::COMPUTE_SHADER,
    vk::AccessFlags2::SHADER_WRITE,
);
const COPY_READ: (vk::PipelineStageFlags2, vk::AccessFlags2) = (
    vk::PipelineStageFlags2::COPY,
    vk::AccessFlags2::TRANSFER_READ,
);
const COPY_WRITE: (vk::PipelineStageFlags2, vk::AccessFlags2) = (
    vk::PipelineStageFlags2::COPY,
    vk::AccessFlags2::TRANSFER_WRITE,
);
const PRESENT: (vk::PipelineStageFlags2, vk::AccessFlags2) = (
    vk::PipelineStageFlags2::NONE,
    vk::AccessFlags2::NONE,
);

impl FrameBackend for VulkanFrameBackend {
    type Slot = SlotResources;

    fn create_slot(&mut self, index: usize) -> Result<(SlotResources, SlotSync)> {
        let render_target = self.resources.allocate_target(self.extent)?;
        let camera_uniform = self.resources.allocate_device(CAMERA_BYTES, UNIFORM_USAGE)?;
        let camera_staging = self
            .resources
            .host_pool_mut()
            .allocate_or_defrag(CAMERA_BYTES, vk::BufferUsageFlags::TRANSFER_SRC)?;
        let compute_cmd = self.resources.commands_mut().allocate()?;
        let copy_cmd = self.present_commands.allocate()?;
        let sync = unsafe { SlotSync::new(self.device())? };

        debug!(
            slot = index,
            %render_target,
            %compute_cmd,
            %copy_cmd,
            "Frame slot created"
        );

        Ok((
            SlotResources {
                render_target,
                camera_staging,
                camera_uniform,
                compute_cmd,
                copy_cmd,
                released_to_compute: Cell::new(false),
                bindings_generation: Cell::new(None),
            },
            sync,
        ))
    }

    fn destroy_slot(&mut self, slot: FrameSlot<SlotResources>) -> Result<()> {
        let r = slot.resources;
        self.resources.free_device(r.render_target)?;
        self.resources.free_device(r.camera_uniform)?;
        self.resources.host_pool_mut().deallocate(r.camera_staging)?;
        self.resources.commands_mut().deallocate(r.compute_cmd)?;
        self.present_commands.deallocate(r.copy_cmd)?;
        unsafe { slot.sync.destroy(self.device()) };
        Ok(())
    }

    fn image_count(&self) -> usize {
        self.swapchain.image_count()
    }

    fn wait_fence(&mut self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        unsafe { wait_for_fence(self.device(), fence, timeout_ns) }
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()> {
        unsafe { reset_fence(self.device(), fence) }
    }

    fn acquire_image(&mut self, signal: vk::Semaphore, timeout_ns: u64) -> Result<(u32, bool)> {
        unsafe {
            self.swapchain
                .acquire_next_image(&self.surface.swapchain_loader, signal, timeout_ns)
        }
    }

    fn upload_camera(
        &mut self,
        slot: &FrameSlot<SlotResources>,
        camera: &CameraUniforms,
    ) -> Result<()> {
        let staging = slot.resources.camera_staging;
        let pool = self.resources.host_pool();
        pool.write_pod(staging, camera)?;
        pool.flush(staging)
    }

    fn record_compute(&mut self, slot: &FrameSlot<SlotResources>, frame: u64) -> Result<()> {
        self.refresh_bindings(slot)?;

        let r = &slot.resources;
        let target = self.resources.device_buffer(r.render_target)?;
        let staging = self.resources.host_pool().raw(r.camera_staging)?;
        let uniform = self.resources.device_buffer(r.camera_uniform)?;
        let program = self.resources.program()?;
        let set = program.descriptor_set(slot.index)?;
        let push = TracePushConstants::new(self.extent, frame, self.swapchain.needs_bgra_swizzle());
        let [gx, gy, gz] = self.extent.dispatch_groups();

        let commands = self.resources.commands();
        let cmd = commands.begin(r.compute_cmd)?;
        let device = self.resources.device();

        unsafe {
            if r.released_to_compute.get() {
                let acquire = Self::ownership_barrier(
                    target,
                    self.present_family,
                    self.compute_family,
                    COPY_READ,
                    COMPUTE_WRITE,
                );
                device.cmd_pipeline_barrier2(
                    cmd,
                    &vk::DependencyInfo::default()
                        .buffer_memory_barriers(std::slice::from_ref(&acquire)),
                );
            }

            record_camera_copy(device, cmd, staging, uniform);

            program.bind(cmd, set);
            program.push_constants(cmd, &push);
            program.dispatch(cmd, gx, gy, gz);

            let release = Self::ownership_barrier(
                target,
                self.compute_family,
                self.present_family,
                COMPUTE_WRITE,
                COPY_READ,
            );
            device.cmd_pipeline_barrier2(
                cmd,
                &vk::DependencyInfo::default()
                    .buffer_memory_barriers(std::slice::from_ref(&release)),
            );
        }

        commands.end(r.compute_cmd, EndAction::Record)
    }

    fn submit_compute(&mut self, slot: &FrameSlot<SlotResources>) -> Result<()> {
        let wait = [SemaphoreWait {
            semaphore: slot.sync.image_ready,
            stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
        }];
        let signal = [slot.sync.render_ready];
        self.resources.commands().submit(
            slot.resources.compute_cmd,
            &SubmitDesc {
                operation: "compute submit",
                wait: &wait,
                signal: &signal,
                fence: vk::Fence::null(),
            },
        )
    }

    fn record_copy(&mut self, slot: &FrameSlot<SlotResources>, image_index: u32) -> Result<()> {
        let r = &slot.resources;
        let target = self.resources.device_buffer(r.render_target)?;
        let image = self
            .swapchain
            .images
            .get(image_index as usize)
            .copied()
            .ok_or_else(|| {
                GpuError::InvalidState(format!("Swapchain has no image {image_index}"))
            })?;

        let cmd = self.present_commands.begin(r.copy_cmd)?;
        let device = self.resources.device();

        unsafe {
            let acquire = Self::ownership_barrier(
                target,
                self.compute_family,
                self.present_family,
                COMPUTE_WRITE,
                COPY_READ,
            );
            let to_transfer = Self::image_barrier(
                image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                (vk::PipelineStageFlags2::COPY, vk::AccessFlags2::NONE),
                COPY_WRITE,
            );
            device.cmd_pipeline_barrier2(
                cmd,
                &vk::DependencyInfo::default()
                    .buffer_memory_barriers(std::slice::from_ref(&acquire))
                    .image_memory_barriers(std::slice::from_ref(&to_transfer)),
            );

            let region = vk::BufferImageCopy::default()
                .buffer_offset(0)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .mip_level(0)
                        .base_array_layer(0)
                        .layer_count(1),
                )
                .image_extent(vk::Extent3D {
                    width: self.extent.width,
                    height: self.extent.height,
                    depth: 1,
                });
            device.cmd_copy_buffer_to_image(
                cmd,
                target,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );

            let to_present = Self::image_barrier(
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
                COPY_WRITE,
                PRESENT,
            );
            let release = Self::ownership_barrier(
                target,
                self.present_family,
                self.compute_family,
                COPY_READ,
                COMPUTE_WRITE,
            );
            device.cmd_pipeline_barrier2(
                cmd,
                &vk::DependencyInfo::default()
                    .buffer_memory_barriers(std::slice::from_ref(&release))
                    .image_memory_barriers(std::slice::from_ref(&to_present)),
            );
        }

        self.present_commands.end(r.copy_cmd, EndAction::Record)
    }

    fn submit_copy(&mut self, slot: &FrameSlot<SlotResources>) -> Result<()> {
        let wait = [SemaphoreWait {
            semaphore: slot.sync.render_ready,
            stage: vk::PipelineStageFlags2::COPY,
        }];
        let signal = [slot.sync.copy_ready];
        self.present_commands.submit(
            slot.resources.copy_cmd,
            &SubmitDesc {
                operation: "copy submit",
                wait: &wait,
                signal: &signal,
                fence: slot.sync.in_flight,
            },
        )?;
        slot.resources.released_to_compute.set(true);
        Ok(())
    }

    fn present(&mut self, slot: &FrameSlot<SlotResources>, image_index: u32) -> Result<bool> {
        unsafe {
            self.swapchain.present(
                &self.surface.swapchain_loader,
                self.present_queue,
                image_index,
                &[slot.sync.copy_ready],
            )
        }
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.resources.gpu().wait_idle()
    }

    fn extent(&self) -> FrameExtent {
        self.extent
    }

    fn rebuild(
        &mut self,
        slots: &mut [FrameSlot<SlotResources>],
        extent: FrameExtent,
    ) -> Result<()> {
        let gpu = Arc::clone(self.resources.gpu());
        unsafe {
            self.surface.recreate_swapchain(
                &gpu,
                &mut self.swapchain,
                extent.width,
                extent.height,
                self.vsync,
            )?;
        }
        let actual = FrameExtent::new(self.swapchain.extent.width, self.swapchain.extent.height)
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;
        let resized = actual != self.extent;
        self.extent = actual;

        for slot in slots.iter_mut() {
            // Semaphores may be left signaled and fences unsignaled by an
            // aborted frame; fresh objects restart the slot cleanly.
            unsafe {
                slot.sync.destroy(gpu.device());
                slot.sync = SlotSync::new(gpu.device())?;
            }
            if resized {
                self.resources.free_device(slot.resources.render_target)?;
                slot.resources.render_target = self.resources.allocate_target(actual)?;
            }
            slot.resources.released_to_compute.set(false);
            slot.resources.bindings_generation.set(None);
        }

        info!(
            "Swapchain recreated: {}x{} ({} images)",
            actual.width,
            actual.height,
            self.swapchain.image_count()
        );
        Ok(())
    }
}
