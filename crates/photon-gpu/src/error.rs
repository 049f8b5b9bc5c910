//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// Device bring-up failed. Unrecoverable.
    #[error("Device initialization failed: {0}")]
    DeviceInit(String),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// The memory block cannot hold the request even after defragmentation.
    #[error("Out of pool memory: requested {requested} bytes, {free} bytes free")]
    OutOfMemory { requested: u64, free: u64 },

    /// Enough bytes are free in total, but no single free region is large enough.
    /// Recoverable with `defrag()` followed by a retry.
    #[error(
        "Pool memory fragmented: requested {requested} bytes, {free} bytes free, \
         largest free region {largest} bytes"
    )]
    Fragmented {
        requested: u64,
        free: u64,
        largest: u64,
    },

    /// A handle that is not live in its owning pool. Always a logic bug.
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// A queue submission was rejected by the device.
    #[error("Submission failed during {operation}: {code}")]
    SubmissionFailed {
        operation: &'static str,
        code: vk::Result,
    },

    /// Acquire or present failed, typically because the surface changed.
    #[error("Presentation failed during {operation}: {code}")]
    PresentFailed {
        operation: &'static str,
        code: vk::Result,
    },

    /// A bounded wait expired.
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Shader module creation failed.
    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Whether an interactive renderer should recreate its surface resources
    /// and continue instead of aborting.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::SubmissionFailed { .. } | Self::PresentFailed { .. } | Self::Timeout(_) => true,
            Self::Vulkan(code) => matches!(
                *code,
                vk::Result::ERROR_OUT_OF_DATE_KHR
                    | vk::Result::SUBOPTIMAL_KHR
                    | vk::Result::ERROR_SURFACE_LOST_KHR
            ),
            _ => false,
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        assert!(GpuError::PresentFailed {
            operation: "present",
            code: vk::Result::ERROR_OUT_OF_DATE_KHR,
        }
        .is_recoverable());
        assert!(GpuError::Timeout("fence").is_recoverable());
        assert!(GpuError::Vulkan(vk::Result::ERROR_SURFACE_LOST_KHR).is_recoverable());

        assert!(!GpuError::OutOfMemory {
            requested: 10,
            free: 0
        }
        .is_recoverable());
        assert!(!GpuError::InvalidHandle("buffer#3".into()).is_recoverable());
        assert!(!GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST).is_recoverable());
    }
}
