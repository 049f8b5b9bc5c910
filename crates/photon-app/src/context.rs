//! Application context.

use std::sync::Arc;
use std::time::Instant;

use photon_core::FrameExtent;
use photon_gpu::GpuContext;
use winit::window::Window;

/// State shared with every [`PhotonApp`](crate::PhotonApp) callback.
pub struct AppContext {
    /// The window handle.
    pub window: Arc<Window>,
    /// GPU context with device and queues.
    pub gpu: Arc<GpuContext>,
    /// Extent the render loop currently renders at.
    pub extent: FrameExtent,
    /// Total frames presented.
    pub frame_count: u64,
    /// Time of last frame (for delta time calculation).
    pub(crate) last_frame_time: Instant,
}

impl AppContext {
    pub(crate) fn new(window: Arc<Window>, gpu: Arc<GpuContext>, extent: FrameExtent) -> Self {
        Self {
            window,
            gpu,
            extent,
            frame_count: 0,
            last_frame_time: Instant::now(),
        }
    }

    /// Get the render width.
    pub fn width(&self) -> u32 {
        self.extent.width
    }

    /// Get the render height.
    pub fn height(&self) -> u32 {
        self.extent.height
    }

    /// Get the aspect ratio (width / height).
    pub fn aspect_ratio(&self) -> f32 {
        self.extent.aspect_ratio()
    }

    /// Extent of the window's drawable area, or `None` while minimized.
    pub fn window_extent(&self) -> Option<FrameExtent> {
        let size = self.window.inner_size();
        FrameExtent::new(size.width, size.height).ok()
    }
}
