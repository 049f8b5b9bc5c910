//! Frame loop ordering against a recording mock backend.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use ash::vk::{self, Handle};
use photon_core::FrameExtent;
use photon_gpu::{GpuError, Result, SlotSync};
use photon_render::{
    Camera, CameraUniforms, FrameBackend, FrameConfig, FramePipeline, FrameSlot, FrameStatus,
    SlotState,
};

#[derive(Clone, Debug, PartialEq, Eq)]
enum Call {
    CreateSlot(usize),
    DestroySlot(usize),
    WaitFence(u64),
    ResetFence(u64),
    Acquire(usize),
    UploadCamera(usize),
    RecordCompute(usize, u64),
    SubmitCompute(usize),
    RecordCopy(usize, u32),
    SubmitCopy(usize),
    Present(usize, u32),
    WaitIdle,
    Rebuild(u32, u32),
}

/// Fences are `100 + slot`, semaphores `10 * (slot + 1) + n`.
fn fence_of(slot: usize) -> u64 {
    100 + slot as u64
}

struct MockBackend {
    calls: Vec<Call>,
    image_count: usize,
    next_image: u32,
    /// Errors returned by upcoming acquires, in order.
    acquire_failures: VecDeque<GpuError>,
    present_out_of_date: bool,
    rebuild_generation: u64,
    extent: FrameExtent,
    /// Largest extent the fake surface supports.
    surface_limit: Option<(u32, u32)>,
    /// Slot index whose creation fails.
    fail_slot: Option<usize>,
    /// Receives the call log when the backend is dropped.
    journal: Option<Rc<RefCell<Vec<Call>>>>,
}

impl MockBackend {
    fn new(image_count: usize) -> Self {
        Self {
            calls: Vec::new(),
            image_count,
            next_image: 0,
            acquire_failures: VecDeque::new(),
            present_out_of_date: false,
            rebuild_generation: 0,
            extent: extent(),
            surface_limit: None,
            fail_slot: None,
            journal: None,
        }
    }

    fn fence_waits(&self) -> Vec<(usize, u64)> {
        self.calls
            .iter()
            .enumerate()
            .filter_map(|(i, c)| match c {
                Call::WaitFence(f) => Some((i, *f)),
                _ => None,
            })
            .collect()
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        if let Some(journal) = &self.journal {
            journal.borrow_mut().extend(self.calls.drain(..));
        }
    }
}

fn slot_of(fence: vk::Fence) -> usize {
    (fence.as_raw() - 100) as usize
}

impl FrameBackend for MockBackend {
    type Slot = u64;

    fn create_slot(&mut self, index: usize) -> Result<(u64, SlotSync)> {
        self.calls.push(Call::CreateSlot(index));
        if self.fail_slot == Some(index) {
            return Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        let base = 10 * (index as u64 + 1);
        let sync = SlotSync {
            image_ready: vk::Semaphore::from_raw(base + 1),
            render_ready: vk::Semaphore::from_raw(base + 2),
            copy_ready: vk::Semaphore::from_raw(base + 3),
            in_flight: vk::Fence::from_raw(fence_of(index)),
        };
        Ok((self.rebuild_generation, sync))
    }

    fn destroy_slot(&mut self, slot: FrameSlot<u64>) -> Result<()> {
        self.calls.push(Call::DestroySlot(slot.index));
        Ok(())
    }

    fn image_count(&self) -> usize {
        self.image_count
    }

    fn wait_fence(&mut self, fence: vk::Fence, _timeout_ns: u64) -> Result<()> {
        self.calls.push(Call::WaitFence(fence.as_raw()));
        Ok(())
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()> {
        self.calls.push(Call::ResetFence(fence.as_raw()));
        Ok(())
    }

    fn acquire_image(&mut self, signal: vk::Semaphore, _timeout_ns: u64) -> Result<(u32, bool)> {
        let slot = (signal.as_raw() / 10 - 1) as usize;
        self.calls.push(Call::Acquire(slot));
        if let Some(err) = self.acquire_failures.pop_front() {
            return Err(err);
        }
        let image = self.next_image;
        self.next_image = (self.next_image + 1) % self.image_count as u32;
        Ok((image, false))
    }

    fn upload_camera(&mut self, slot: &FrameSlot<u64>, _camera: &CameraUniforms) -> Result<()> {
        self.calls.push(Call::UploadCamera(slot.index));
        Ok(())
    }

    fn record_compute(&mut self, slot: &FrameSlot<u64>, frame: u64) -> Result<()> {
        assert_eq!(slot.state, SlotState::Recording);
        self.calls.push(Call::RecordCompute(slot.index, frame));
        Ok(())
    }

    fn submit_compute(&mut self, slot: &FrameSlot<u64>) -> Result<()> {
        self.calls.push(Call::SubmitCompute(slot.index));
        Ok(())
    }

    fn record_copy(&mut self, slot: &FrameSlot<u64>, image_index: u32) -> Result<()> {
        self.calls.push(Call::RecordCopy(slot.index, image_index));
        Ok(())
    }

    fn submit_copy(&mut self, slot: &FrameSlot<u64>) -> Result<()> {
        self.calls.push(Call::SubmitCopy(slot.index));
        Ok(())
    }

    fn present(&mut self, slot: &FrameSlot<u64>, image_index: u32) -> Result<bool> {
        assert_eq!(slot.state, SlotState::Presenting);
        self.calls.push(Call::Present(slot.index, image_index));
        Ok(self.present_out_of_date)
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.calls.push(Call::WaitIdle);
        Ok(())
    }

    fn extent(&self) -> FrameExtent {
        self.extent
    }

    fn rebuild(&mut self, slots: &mut [FrameSlot<u64>], extent: FrameExtent) -> Result<()> {
        self.calls.push(Call::Rebuild(extent.width, extent.height));
        self.extent = match self.surface_limit {
            Some((w, h)) => FrameExtent::new(extent.width.min(w), extent.height.min(h))
                .map_err(|e| GpuError::InvalidState(e.to_string()))?,
            None => extent,
        };
        self.rebuild_generation += 1;
        for slot in slots {
            slot.resources = self.rebuild_generation;
        }
        self.next_image = 0;
        Ok(())
    }
}

fn camera() -> CameraUniforms {
    Camera::default().uniforms()
}

fn extent() -> FrameExtent {
    FrameExtent::new(64, 48).unwrap()
}

fn pipeline(images: usize, frames_in_flight: usize) -> FramePipeline<MockBackend> {
    let config = FrameConfig::interactive(extent()).with_frames_in_flight(frames_in_flight);
    FramePipeline::new(MockBackend::new(images), config).unwrap()
}

fn run(pipeline: &mut FramePipeline<MockBackend>, frames: usize) {
    let camera = camera();
    for _ in 0..frames {
        let status = pipeline.render_frame(&camera).unwrap();
        assert!(matches!(status, FrameStatus::Presented { .. }));
    }
}

/// Calls made during frame `n`, delimited by `Present`.
fn frame_calls(calls: &[Call], n: usize) -> Vec<Call> {
    let start = calls
        .iter()
        .position(|c| !matches!(c, Call::CreateSlot(_)))
        .unwrap_or(calls.len());
    calls[start..]
        .split_inclusive(|c| matches!(c, Call::Present(..)))
        .nth(n)
        .map(<[Call]>::to_vec)
        .unwrap_or_default()
}

#[test]
fn slots_are_created_once_up_front() {
    let mut p = pipeline(3, 2);
    run(&mut p, 6);
    let created: Vec<_> = p
        .backend()
        .calls
        .iter()
        .filter(|c| matches!(c, Call::CreateSlot(_)))
        .cloned()
        .collect();
    assert_eq!(created, [Call::CreateSlot(0), Call::CreateSlot(1)]);
    assert_eq!(p.frame_count(), 6);
}

#[test]
fn one_frame_runs_in_protocol_order() {
    let mut p = pipeline(3, 2);
    run(&mut p, 1);
    let fence = fence_of(0);
    assert_eq!(
        frame_calls(&p.backend().calls, 0),
        [
            Call::WaitFence(fence),
            Call::Acquire(0),
            Call::UploadCamera(0),
            Call::RecordCompute(0, 0),
            Call::SubmitCompute(0),
            Call::RecordCopy(0, 0),
            Call::ResetFence(fence),
            Call::SubmitCopy(0),
            Call::Present(0, 0),
        ]
    );
}

#[test]
fn slot_fence_gates_its_own_reuse() {
    // Two slots, three images: the first three frames each use a fresh image.
    let mut p = pipeline(3, 2);
    run(&mut p, 3);
    let calls = &p.backend().calls;

    for frame in 0..3 {
        let slot = frame % 2;
        let waits: Vec<_> = frame_calls(calls, frame)
            .into_iter()
            .filter_map(|c| match c {
                Call::WaitFence(f) => Some(f),
                _ => None,
            })
            .collect();
        assert_eq!(waits, [fence_of(slot)], "frame {frame}");
    }

    // Slot 0's fence is reset on iteration 0, next waited on iteration 2.
    let slot0_waits: Vec<_> = p
        .backend()
        .fence_waits()
        .into_iter()
        .filter(|&(_, f)| f == fence_of(0))
        .collect();
    assert_eq!(slot0_waits.len(), 2);
    let second_wait = slot0_waits[1].0;
    let frame1_present = calls
        .iter()
        .position(|c| *c == Call::Present(1, 1))
        .unwrap();
    assert!(second_wait > frame1_present);
}

#[test]
fn shared_image_waits_on_previous_owner() {
    // One presentable image shared by two slots.
    let mut p = pipeline(1, 2);
    run(&mut p, 3);
    let calls = &p.backend().calls;

    // Frame 0 claims the image; frame 1 (slot 1) must wait slot 0's fence
    // after acquiring, then frame 2 (slot 0) waits slot 1's fence.
    assert_eq!(
        frame_calls(calls, 1)[..3],
        [
            Call::WaitFence(fence_of(1)),
            Call::Acquire(1),
            Call::WaitFence(fence_of(0)),
        ]
    );
    assert_eq!(
        frame_calls(calls, 2)[..3],
        [
            Call::WaitFence(fence_of(0)),
            Call::Acquire(0),
            Call::WaitFence(fence_of(1)),
        ]
    );
}

#[test]
fn own_image_is_not_waited_twice() {
    // One slot, one image: the owner is always the current slot.
    let mut p = pipeline(1, 1);
    run(&mut p, 3);
    for frame in 0..3 {
        let waits = frame_calls(&p.backend().calls, frame)
            .into_iter()
            .filter(|c| matches!(c, Call::WaitFence(_)))
            .count();
        assert_eq!(waits, 1);
    }
}

#[test]
fn recoverable_failure_asks_for_recreate_in_interactive_mode() {
    let mut p = pipeline(3, 2);
    p.backend_mut().acquire_failures.push_back(GpuError::PresentFailed {
        operation: "acquire",
        code: vk::Result::ERROR_OUT_OF_DATE_KHR,
    });

    let status = p.render_frame(&camera()).unwrap();
    assert_eq!(status, FrameStatus::NeedsRecreate);
    assert_eq!(p.frame_count(), 0);
    assert!(!p.backend().calls.iter().any(|c| matches!(c, Call::Present(..))));
}

#[test]
fn timeout_asks_for_recreate_in_interactive_mode() {
    let mut p = pipeline(3, 2);
    p.backend_mut()
        .acquire_failures
        .push_back(GpuError::Timeout("acquire"));
    let status = p.render_frame(&camera()).unwrap();
    assert_eq!(status, FrameStatus::NeedsRecreate);
}

#[test]
fn recoverable_failure_is_fatal_offline() {
    let config = FrameConfig::offline(extent());
    let mut p = FramePipeline::new(MockBackend::new(1), config).unwrap();
    p.backend_mut().acquire_failures.push_back(GpuError::PresentFailed {
        operation: "acquire",
        code: vk::Result::ERROR_SURFACE_LOST_KHR,
    });

    let err = p.render_frame(&camera()).unwrap_err();
    assert!(matches!(err, GpuError::PresentFailed { .. }));
}

#[test]
fn fatal_errors_propagate_in_interactive_mode() {
    let mut p = pipeline(3, 2);
    p.backend_mut()
        .acquire_failures
        .push_back(GpuError::InvalidHandle("buffer 9".to_string()));
    let err = p.render_frame(&camera()).unwrap_err();
    assert!(matches!(err, GpuError::InvalidHandle(_)));
}

#[test]
fn suboptimal_present_is_reported() {
    let mut p = pipeline(2, 2);
    p.backend_mut().present_out_of_date = true;
    let status = p.render_frame(&camera()).unwrap();
    assert_eq!(
        status,
        FrameStatus::Presented {
            image_index: 0,
            suboptimal: true
        }
    );
}

#[test]
fn failed_slot_creation_releases_earlier_slots() {
    let journal = Rc::new(RefCell::new(Vec::new()));
    let mut backend = MockBackend::new(2);
    backend.fail_slot = Some(2);
    backend.journal = Some(Rc::clone(&journal));
    let config = FrameConfig::interactive(extent()).with_frames_in_flight(3);

    let err = FramePipeline::new(backend, config).err().unwrap();

    assert!(matches!(
        err,
        GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
    ));
    assert_eq!(
        *journal.borrow(),
        [
            Call::CreateSlot(0),
            Call::CreateSlot(1),
            Call::CreateSlot(2),
            Call::WaitIdle,
            Call::DestroySlot(0),
            Call::DestroySlot(1),
        ]
    );
}

#[test]
fn recreate_reports_the_clamped_extent() {
    let mut p = pipeline(2, 2);
    p.backend_mut().surface_limit = Some((100, 80));
    let requested = FrameExtent::new(128, 96).unwrap();

    let actual = p.recreate(requested).unwrap();

    assert_eq!(actual, FrameExtent::new(100, 80).unwrap());
    assert_eq!(p.config().extent, actual);
    assert_eq!(p.backend().calls.last(), Some(&Call::Rebuild(128, 96)));
}

#[test]
fn recreate_waits_idle_then_rebuilds() {
    let mut p = pipeline(3, 2);
    run(&mut p, 2);
    let resized = FrameExtent::new(128, 96).unwrap();
    assert_eq!(p.recreate(resized).unwrap(), resized);

    let calls = &p.backend().calls;
    let tail = &calls[calls.len() - 2..];
    assert_eq!(tail, [Call::WaitIdle, Call::Rebuild(128, 96)]);
    let before = calls.len();
    assert_eq!(p.config().extent, resized);
    assert!(p.slots().iter().all(|s| s.state == SlotState::Idle));
    assert!(p.slots().iter().all(|s| s.resources == 1));

    // Image ownership is forgotten: the first frame on image 0 does not wait
    // on a fence from before the rebuild.
    run(&mut p, 1);
    let waits = p.backend().fence_waits();
    let after: Vec<_> = waits
        .iter()
        .filter(|&&(i, _)| i >= before)
        .map(|&(_, f)| f)
        .collect();
    assert_eq!(after, [fence_of(0)]);
}

#[test]
fn shutdown_waits_idle_before_destroying_slots() {
    let mut p = pipeline(3, 2);
    run(&mut p, 3);
    p.shutdown().unwrap();

    let calls = &p.backend().calls;
    let idle = calls.iter().rposition(|c| *c == Call::WaitIdle).unwrap();
    let destroys: Vec<_> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c, Call::DestroySlot(_)))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(destroys.len(), 2);
    assert!(destroys.iter().all(|&i| i > idle));
    assert!(p.slots().is_empty());

    // Idempotent, and rendering afterwards is a state error.
    p.shutdown().unwrap();
    assert_eq!(
        p.backend()
            .calls
            .iter()
            .filter(|c| matches!(c, Call::DestroySlot(_)))
            .count(),
        2
    );
    let err = p.render_frame(&camera()).unwrap_err();
    assert!(matches!(err, GpuError::InvalidState(_)));
}

#[test]
fn fence_handles_map_back_to_slots() {
    let p = pipeline(2, 3);
    for slot in p.slots() {
        assert_eq!(slot_of(slot.sync.in_flight), slot.index);
    }
}
