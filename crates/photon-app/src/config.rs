//! Application configuration.

use photon_core::constants::DEFAULT_FRAMES_IN_FLIGHT;
use photon_core::FrameExtent;
use photon_render::frame::DEFAULT_TIMEOUT_NS;
use photon_render::{FrameConfig, PoolSizes};

/// Application configuration.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Window title.
    pub title: String,
    /// Initial window width, and the output width offline.
    pub width: u32,
    /// Initial window height, and the output height offline.
    pub height: u32,
    /// Frame slots in the render loop.
    pub frames_in_flight: usize,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    /// Enable vsync.
    pub vsync: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Bound on fence waits and image acquisition, in nanoseconds.
    pub timeout_ns: u64,
    /// Memory block sizes.
    pub pools: PoolSizes,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Photon".to_string(),
            width: 1280,
            height: 720,
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            target_fps: None,
            vsync: false,
            validation: cfg!(debug_assertions),
            timeout_ns: DEFAULT_TIMEOUT_NS,
            pools: PoolSizes::default(),
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the window dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the number of frames in flight (at least 1).
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames.max(1);
        self
    }

    /// Set the target FPS.
    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    /// Enable or disable vsync.
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_pools(mut self, pools: PoolSizes) -> Self {
        self.pools = pools;
        self
    }

    /// Initial frame extent.
    pub fn extent(&self) -> anyhow::Result<FrameExtent> {
        Ok(FrameExtent::new(self.width, self.height)?)
    }

    /// Render loop parameters for a window of `extent`.
    pub fn frame_config(&self, extent: FrameExtent) -> FrameConfig {
        FrameConfig::interactive(extent)
            .with_frames_in_flight(self.frames_in_flight)
            .with_timeout_ns(self.timeout_ns)
            .with_vsync(self.vsync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let config = AppConfig::new("test")
            .with_size(320, 200)
            .with_frames_in_flight(3)
            .with_vsync(true)
            .with_target_fps(30);

        assert_eq!(config.title, "test");
        assert_eq!((config.width, config.height), (320, 200));
        assert_eq!(config.target_fps, Some(30));

        let frame = config.frame_config(config.extent().unwrap());
        assert_eq!(frame.frames_in_flight, 3);
        assert!(frame.vsync);
        assert_eq!(frame.timeout_ns, DEFAULT_TIMEOUT_NS);
    }

    #[test]
    fn zero_frames_in_flight_is_clamped() {
        assert_eq!(AppConfig::default().with_frames_in_flight(0).frames_in_flight, 1);
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(AppConfig::default().with_size(0, 10).extent().is_err());
    }
}
