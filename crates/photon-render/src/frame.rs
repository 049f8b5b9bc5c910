//! Multi-frame-in-flight render/present loop.
//!
//! [`FramePipeline`] owns the per-frame choreography: which fence to wait
//! on, which semaphores chain which submissions, and which presentable image
//! may be reused. Everything that touches the device goes through a
//! [`FrameBackend`], so the ordering can be exercised without a GPU.
//!
//! One iteration for slot `i = frame % F`:
//!
//! 1. wait `in_flight[i]`
//! 2. acquire image `k`, signalling `image_ready[i]`
//! 3. if image `k` is still owned by another slot's fence, wait that fence
//! 4. upload the camera, re-record the compute list
//! 5. submit compute: wait `image_ready[i]`, signal `render_ready[i]`
//! 6. re-record the copy list
//! 7. reset `in_flight[i]`, submit copy: wait `render_ready[i]`, signal
//!    `copy_ready[i]` and `in_flight[i]`
//! 8. present, waiting `copy_ready[i]`

use ash::vk;
use photon_core::constants::DEFAULT_FRAMES_IN_FLIGHT;
use photon_core::FrameExtent;
use photon_gpu::{GpuError, Result, SlotSync};
use tracing::{debug, trace_span, warn};

use crate::camera::CameraUniforms;

/// Default bound on fence waits and image acquisition in interactive mode.
pub const DEFAULT_TIMEOUT_NS: u64 = 1_000_000_000;

/// How failures that a new swapchain could fix are handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderMode {
    /// Recoverable errors become [`FrameStatus::NeedsRecreate`].
    Interactive,
    /// Every error is fatal; waits are unbounded.
    Offline,
}

/// Frame loop parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameConfig {
    pub extent: FrameExtent,
    /// Number of frame slots, at least 1.
    pub frames_in_flight: usize,
    /// Bound on each fence wait and acquire, in nanoseconds.
    pub timeout_ns: u64,
    pub vsync: bool,
    pub mode: RenderMode,
}

impl FrameConfig {
    /// Windowed rendering with a bounded timeout.
    pub fn interactive(extent: FrameExtent) -> Self {
        Self {
            extent,
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            timeout_ns: DEFAULT_TIMEOUT_NS,
            vsync: false,
            mode: RenderMode::Interactive,
        }
    }

    /// One-shot rendering; waits are unbounded.
    pub fn offline(extent: FrameExtent) -> Self {
        Self {
            extent,
            frames_in_flight: 1,
            timeout_ns: u64::MAX,
            vsync: false,
            mode: RenderMode::Offline,
        }
    }

    /// Set the number of frame slots (clamped to at least 1).
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames.max(1);
        self
    }

    pub fn with_timeout_ns(mut self, timeout_ns: u64) -> Self {
        self.timeout_ns = timeout_ns;
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_extent(mut self, extent: FrameExtent) -> Self {
        self.extent = extent;
        self
    }
}

/// Where a frame slot is in its cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Acquiring,
    Recording,
    SubmittedCompute,
    SubmittedCopy,
    Presenting,
}

/// One frame in flight: synchronization plus backend-owned resources.
///
/// Created once before the loop and reused every iteration.
#[derive(Debug)]
pub struct FrameSlot<R> {
    pub index: usize,
    pub sync: SlotSync,
    pub resources: R,
    pub state: SlotState,
}

/// Outcome of one loop iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    /// The frame was queued for presentation.
    Presented { image_index: u32, suboptimal: bool },
    /// The surface changed or a submission failed recoverably; call
    /// [`FramePipeline::recreate`] before the next frame. Nothing was shown.
    NeedsRecreate,
}

/// Device operations the frame loop drives.
pub trait FrameBackend {
    /// Per-slot resources: render target, command buffers, descriptors.
    type Slot;

    /// Allocate slot `index` and its synchronization objects.
    fn create_slot(&mut self, index: usize) -> Result<(Self::Slot, SlotSync)>;

    /// Release a slot. Only called after [`wait_idle`](Self::wait_idle).
    fn destroy_slot(&mut self, slot: FrameSlot<Self::Slot>) -> Result<()>;

    /// Number of presentable images.
    fn image_count(&self) -> usize;

    fn wait_fence(&mut self, fence: vk::Fence, timeout_ns: u64) -> Result<()>;

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()>;

    /// Acquire the next image, signalling `signal`. Returns `(index, suboptimal)`.
    fn acquire_image(&mut self, signal: vk::Semaphore, timeout_ns: u64) -> Result<(u32, bool)>;

    /// Write camera data into the slot's host-visible staging buffer.
    fn upload_camera(&mut self, slot: &FrameSlot<Self::Slot>, camera: &CameraUniforms)
        -> Result<()>;

    /// Re-record the slot's compute list (uniform copy, dispatch, release).
    fn record_compute(&mut self, slot: &FrameSlot<Self::Slot>, frame: u64) -> Result<()>;

    /// Submit compute: wait `image_ready`, signal `render_ready`, no fence.
    fn submit_compute(&mut self, slot: &FrameSlot<Self::Slot>) -> Result<()>;

    /// Re-record the slot's copy list targeting image `image_index`.
    fn record_copy(&mut self, slot: &FrameSlot<Self::Slot>, image_index: u32) -> Result<()>;

    /// Submit copy: wait `render_ready`, signal `copy_ready` and `in_flight`.
    fn submit_copy(&mut self, slot: &FrameSlot<Self::Slot>) -> Result<()>;

    /// Present image `image_index` after `copy_ready`. Returns `true` if the
    /// swapchain should be recreated.
    fn present(&mut self, slot: &FrameSlot<Self::Slot>, image_index: u32) -> Result<bool>;

    fn wait_idle(&mut self) -> Result<()>;

    /// Extent frames are rendered at. After [`rebuild`](Self::rebuild) this
    /// may differ from the requested one if the surface clamped it.
    fn extent(&self) -> FrameExtent;

    /// Rebuild presentation for `extent` after a device idle.
    ///
    /// Must leave every slot with fresh synchronization (fence signaled) and
    /// resources sized for the extent.
    fn rebuild(&mut self, slots: &mut [FrameSlot<Self::Slot>], extent: FrameExtent) -> Result<()>;
}

/// The frame loop.
pub struct FramePipeline<B: FrameBackend> {
    backend: B,
    slots: Vec<FrameSlot<B::Slot>>,
    /// Fence of the slot that last used each presentable image.
    images: Vec<Option<vk::Fence>>,
    frame: u64,
    config: FrameConfig,
}

impl<B: FrameBackend> FramePipeline<B> {
    /// Allocate every frame slot up front.
    ///
    /// If a slot cannot be created, the slots created before it are released
    /// again and the backend is dropped.
    pub fn new(mut backend: B, config: FrameConfig) -> Result<Self> {
        let mut slots = Vec::with_capacity(config.frames_in_flight);
        for index in 0..config.frames_in_flight.max(1) {
            let (resources, sync) = match backend.create_slot(index) {
                Ok(created) => created,
                Err(e) => {
                    release_slots(&mut backend, slots);
                    return Err(e);
                }
            };
            slots.push(FrameSlot {
                index,
                sync,
                resources,
                state: SlotState::Idle,
            });
        }
        let images = vec![None; backend.image_count()];

        debug!(
            frames_in_flight = slots.len(),
            images = images.len(),
            "Frame pipeline ready"
        );

        Ok(Self {
            backend,
            slots,
            images,
            frame: 0,
            config,
        })
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn slots(&self) -> &[FrameSlot<B::Slot>] {
        &self.slots
    }

    /// Frames completed so far.
    pub fn frame_count(&self) -> u64 {
        self.frame
    }

    /// Run one iteration of the loop.
    pub fn render_frame(&mut self, camera: &CameraUniforms) -> Result<FrameStatus> {
        if self.slots.is_empty() {
            return Err(GpuError::InvalidState(
                "Frame pipeline has been shut down".to_string(),
            ));
        }

        match self.run_frame(camera) {
            Ok(status) => Ok(status),
            Err(e) if self.config.mode == RenderMode::Interactive && e.is_recoverable() => {
                warn!("Frame {} needs swapchain recreation: {e}", self.frame);
                Ok(FrameStatus::NeedsRecreate)
            }
            Err(e) => Err(e),
        }
    }

    fn run_frame(&mut self, camera: &CameraUniforms) -> Result<FrameStatus> {
        let _span = trace_span!("frame", frame = self.frame).entered();

        let i = (self.frame % self.slots.len() as u64) as usize;
        let timeout = self.config.timeout_ns;
        let in_flight = self.slots[i].sync.in_flight;

        self.backend.wait_fence(in_flight, timeout)?;

        self.slots[i].state = SlotState::Acquiring;
        let (image_index, acquire_suboptimal) = self
            .backend
            .acquire_image(self.slots[i].sync.image_ready, timeout)?;

        let k = image_index as usize;
        if k >= self.images.len() {
            self.images.resize(k + 1, None);
        }
        if let Some(owner) = self.images[k] {
            if owner != in_flight {
                self.backend.wait_fence(owner, timeout)?;
            }
        }
        self.images[k] = Some(in_flight);

        self.slots[i].state = SlotState::Recording;
        self.backend.upload_camera(&self.slots[i], camera)?;
        self.backend.record_compute(&self.slots[i], self.frame)?;
        self.backend.submit_compute(&self.slots[i])?;
        self.slots[i].state = SlotState::SubmittedCompute;

        self.backend.record_copy(&self.slots[i], image_index)?;
        self.backend.reset_fence(in_flight)?;
        self.backend.submit_copy(&self.slots[i])?;
        self.slots[i].state = SlotState::SubmittedCopy;

        self.slots[i].state = SlotState::Presenting;
        let present_suboptimal = self.backend.present(&self.slots[i], image_index)?;
        self.slots[i].state = SlotState::Idle;

        self.frame += 1;
        Ok(FrameStatus::Presented {
            image_index,
            suboptimal: acquire_suboptimal || present_suboptimal,
        })
    }

    /// Rebuild presentation resources after [`FrameStatus::NeedsRecreate`]
    /// or a resize. Returns the extent the backend actually renders at.
    pub fn recreate(&mut self, extent: FrameExtent) -> Result<FrameExtent> {
        self.backend.wait_idle()?;
        self.backend.rebuild(&mut self.slots, extent)?;
        for slot in &mut self.slots {
            slot.state = SlotState::Idle;
        }
        self.images = vec![None; self.backend.image_count()];
        let actual = self.backend.extent();
        self.config.extent = actual;
        debug!(
            "Frame pipeline recreated at {}x{} (requested {}x{}) with {} images",
            actual.width,
            actual.height,
            extent.width,
            extent.height,
            self.images.len()
        );
        Ok(actual)
    }

    /// Wait for the device to go idle, then release every slot.
    ///
    /// Safe to call more than once.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.slots.is_empty() {
            return Ok(());
        }
        self.backend.wait_idle()?;
        for slot in self.slots.drain(..) {
            self.backend.destroy_slot(slot)?;
        }
        self.images.clear();
        Ok(())
    }
}

fn release_slots<B: FrameBackend>(backend: &mut B, slots: Vec<FrameSlot<B::Slot>>) {
    if slots.is_empty() {
        return;
    }
    if let Err(e) = backend.wait_idle() {
        warn!("Wait idle before releasing slots failed: {e}");
    }
    for slot in slots {
        let index = slot.index;
        if let Err(e) = backend.destroy_slot(slot) {
            warn!("Releasing frame slot {index} failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_in_flight_is_at_least_one() {
        let extent = FrameExtent::new(8, 8).unwrap();
        let config = FrameConfig::interactive(extent).with_frames_in_flight(0);
        assert_eq!(config.frames_in_flight, 1);
    }

    #[test]
    fn offline_waits_are_unbounded() {
        let extent = FrameExtent::new(8, 8).unwrap();
        let config = FrameConfig::offline(extent);
        assert_eq!(config.timeout_ns, u64::MAX);
        assert_eq!(config.mode, RenderMode::Offline);

        let interactive = FrameConfig::interactive(extent);
        assert_eq!(interactive.timeout_ns, DEFAULT_TIMEOUT_NS);
        assert_eq!(interactive.frames_in_flight, DEFAULT_FRAMES_IN_FLIGHT);
    }
}
