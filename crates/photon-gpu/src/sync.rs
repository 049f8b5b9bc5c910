//! Synchronization primitives.

use crate::error::{GpuError, Result};
use ash::vk;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    let semaphore = device.create_semaphore(&create_info, None)?;
    Ok(semaphore)
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = device.create_fence(&create_info, None)?;
    Ok(fence)
}

/// Wait for a fence to be signaled.
///
/// An expired timeout is reported as [`GpuError::Timeout`].
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn wait_for_fence(
    device: &ash::Device,
    fence: vk::Fence,
    timeout_ns: u64,
) -> Result<()> {
    match device.wait_for_fences(&[fence], true, timeout_ns) {
        Ok(()) => Ok(()),
        Err(vk::Result::TIMEOUT) => Err(GpuError::Timeout("frame fence")),
        Err(e) => Err(e.into()),
    }
}

/// Reset a fence to unsignaled state.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    device.reset_fences(&[fence])?;
    Ok(())
}

/// Synchronization objects owned by one frame slot.
///
/// The three semaphores chain acquire, trace, copy and present; the fence
/// covers the whole slot and starts signaled so the first wait returns
/// immediately.
#[derive(Clone, Copy, Debug)]
pub struct SlotSync {
    /// Signaled by acquire when the presentable image is ready.
    pub image_ready: vk::Semaphore,
    /// Signaled by the compute submission.
    pub render_ready: vk::Semaphore,
    /// Signaled by the copy submission; present waits on it.
    pub copy_ready: vk::Semaphore,
    /// Signaled when the slot's copy submission retires.
    pub in_flight: vk::Fence,
}

impl SlotSync {
    /// Create a slot's synchronization objects.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        Ok(Self {
            image_ready: create_semaphore(device)?,
            render_ready: create_semaphore(device)?,
            copy_ready: create_semaphore(device)?,
            in_flight: create_fence(device, true)?,
        })
    }

    /// Destroy synchronization resources.
    ///
    /// # Safety
    /// The device must be valid and resources must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_semaphore(self.image_ready, None);
        device.destroy_semaphore(self.render_ready, None);
        device.destroy_semaphore(self.copy_ready, None);
        device.destroy_fence(self.in_flight, None);
    }
}
