//! Command buffer management.
//!
//! A [`CommandPool`] is bound to one queue family and hands out
//! [`CommandBufferHandle`]s. The device command buffer behind a handle is
//! created on allocate and lives until the handle is released or the pool is
//! destroyed; between frames it is reset and re-recorded in place.

use crate::error::{GpuError, Result};
use crate::handle::{CommandBufferHandle, HandleAllocator};
use ash::vk;
use std::ops::Index;
use std::sync::Arc;

/// A semaphore a submission waits on, and the stages that wait.
#[derive(Clone, Copy, Debug)]
pub struct SemaphoreWait {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags2,
}

/// Synchronization for one queue submission.
#[derive(Clone, Copy, Debug)]
pub struct SubmitDesc<'a> {
    /// Names the submission in errors.
    pub operation: &'static str,
    pub wait: &'a [SemaphoreWait],
    pub signal: &'a [vk::Semaphore],
    /// Signaled when the submission retires. May be null.
    pub fence: vk::Fence,
}

impl SubmitDesc<'_> {
    /// A submission with no semaphores and no fence.
    pub const fn bare(operation: &'static str) -> Self {
        Self {
            operation,
            wait: &[],
            signal: &[],
            fence: vk::Fence::null(),
        }
    }
}

/// What [`CommandPool::end`] does after closing the recording.
#[derive(Clone, Copy, Debug)]
pub enum EndAction<'a> {
    /// Only finish recording; the caller submits later.
    Record,
    /// Submit to the pool's queue without blocking.
    Submit(SubmitDesc<'a>),
    /// Submit, then block until the queue drains. Offline use only.
    SubmitAndWait(SubmitDesc<'a>),
}

/// Command pool with a handle registry over its command buffers.
pub struct CommandPool {
    device: Arc<ash::Device>,
    pool: vk::CommandPool,
    queue_family: u32,
    queue: vk::Queue,
    handles: HandleAllocator,
    buffers: Vec<Option<vk::CommandBuffer>>,
}

impl CommandPool {
    /// Create a new command pool submitting to `queue` of `queue_family`.
    ///
    /// # Safety
    /// The queue must belong to the queue family.
    pub unsafe fn new(
        device: Arc<ash::Device>,
        queue_family: u32,
        queue: vk::Queue,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = device.create_command_pool(&create_info, None)?;

        Ok(Self {
            device,
            pool,
            queue_family,
            queue,
            handles: HandleAllocator::new(),
            buffers: Vec::new(),
        })
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Queue this pool submits to.
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Number of live command buffers.
    pub fn live_count(&self) -> usize {
        self.handles.live_count()
    }

    /// Create a primary command buffer and return its handle.
    pub fn allocate(&mut self) -> Result<CommandBufferHandle> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = unsafe { self.device.allocate_command_buffers(&alloc_info)? }
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::AllocationFailed("driver returned no command buffer".into()))?;

        let id = self.handles.acquire();
        let slot = id as usize;
        if slot >= self.buffers.len() {
            self.buffers.resize(slot + 1, None);
        }
        self.buffers[slot] = Some(cmd);

        let handle = CommandBufferHandle(id);
        tracing::trace!(%handle, family = self.queue_family, "command buffer allocated");
        Ok(handle)
    }

    /// Free the command buffer behind `handle`.
    ///
    /// The buffer must not be pending execution.
    pub fn deallocate(&mut self, handle: CommandBufferHandle) -> Result<()> {
        if !self.handles.release(handle.0) {
            return Err(GpuError::InvalidHandle(format!(
                "{handle} is not live in command pool"
            )));
        }
        if let Some(cmd) = self.buffers.get_mut(handle.0 as usize).and_then(Option::take) {
            unsafe { self.device.free_command_buffers(self.pool, &[cmd]) };
        }
        Ok(())
    }

    /// Checked lookup.
    pub fn at(&self, handle: CommandBufferHandle) -> Result<vk::CommandBuffer> {
        self.buffers
            .get(handle.0 as usize)
            .copied()
            .flatten()
            .ok_or_else(|| GpuError::InvalidHandle(format!("{handle} is not live in command pool")))
    }

    /// Reset the buffer and start a one-time recording.
    pub fn begin(&self, handle: CommandBufferHandle) -> Result<vk::CommandBuffer> {
        let cmd = self.at(handle)?;
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device.begin_command_buffer(cmd, &begin_info)?;
        }
        Ok(cmd)
    }

    /// Close the recording and optionally submit it.
    pub fn end(&self, handle: CommandBufferHandle, action: EndAction<'_>) -> Result<()> {
        let cmd = self.at(handle)?;
        unsafe { self.device.end_command_buffer(cmd)? };

        match action {
            EndAction::Record => Ok(()),
            EndAction::Submit(desc) => self.submit(handle, &desc),
            EndAction::SubmitAndWait(desc) => {
                self.submit(handle, &desc)?;
                unsafe { self.device.queue_wait_idle(self.queue) }.map_err(|code| {
                    GpuError::SubmissionFailed {
                        operation: desc.operation,
                        code,
                    }
                })
            }
        }
    }

    /// Submit an already recorded buffer to the pool's queue.
    pub fn submit(&self, handle: CommandBufferHandle, desc: &SubmitDesc<'_>) -> Result<()> {
        let cmd = self.at(handle)?;

        let waits: Vec<vk::SemaphoreSubmitInfo> = desc
            .wait
            .iter()
            .map(|w| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(w.semaphore)
                    .stage_mask(w.stage)
            })
            .collect();
        let signals: Vec<vk::SemaphoreSubmitInfo> = desc
            .signal
            .iter()
            .map(|&s| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(s)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .collect();
        let cmds = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];

        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(&cmds)
            .signal_semaphore_infos(&signals);

        unsafe {
            self.device
                .queue_submit2(self.queue, &[submit], desc.fence)
                .map_err(|code| GpuError::SubmissionFailed {
                    operation: desc.operation,
                    code,
                })
        }
    }

    /// Record with `f` into a temporary buffer, submit it, and wait for the
    /// queue to drain.
    pub fn execute_once<F>(&mut self, operation: &'static str, f: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer) -> Result<()>,
    {
        let handle = self.allocate()?;
        let result = self
            .begin(handle)
            .and_then(f)
            .and_then(|()| self.end(handle, EndAction::SubmitAndWait(SubmitDesc::bare(operation))));
        // On failure the buffer may still be recording; freeing it is valid either way.
        self.deallocate(handle)?;
        result
    }

    /// Free every command buffer and the pool itself.
    ///
    /// # Safety
    /// No buffer from this pool may be pending execution.
    pub unsafe fn destroy(&mut self) {
        let live: Vec<vk::CommandBuffer> = self.buffers.drain(..).flatten().collect();
        if !live.is_empty() {
            self.device.free_command_buffers(self.pool, &live);
        }
        self.handles = HandleAllocator::new();
        self.device.destroy_command_pool(self.pool, None);
        self.pool = vk::CommandPool::null();
    }
}

impl Index<CommandBufferHandle> for CommandPool {
    type Output = vk::CommandBuffer;

    /// Unchecked-style lookup for hot paths.
    ///
    /// # Panics
    /// Panics if the handle is not live; a stale handle is a logic bug.
    fn index(&self, handle: CommandBufferHandle) -> &Self::Output {
        match self.buffers.get(handle.0 as usize).and_then(Option::as_ref) {
            Some(cmd) => cmd,
            None => panic!("{handle} is not live in command pool"),
        }
    }
}
