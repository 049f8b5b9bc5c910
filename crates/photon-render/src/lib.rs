//! Compute ray tracing renderer for Photon.
//!
//! This crate provides:
//! - The trace kernel's pipeline, bindings and push constants
//! - Scene geometry upload through the memory pools
//! - The multi-frame-in-flight render/present loop and its device backend
//! - A headless single-frame renderer with PNG/PPM output

pub mod camera;
pub mod encode;
pub mod frame;
pub mod offline;
pub mod program;
pub mod renderer;
pub mod resources;
pub mod scene;
pub mod vulkan_frame;

pub use camera::{Camera, CameraUniforms};
pub use encode::{encoder_for_path, read_frame, EncodeError, ImageEncoder, PngWriter, PpmWriter};
pub use frame::{
    FrameBackend, FrameConfig, FramePipeline, FrameSlot, FrameStatus, RenderMode, SlotState,
};
pub use offline::OfflineRenderer;
pub use program::{ComputeProgram, ProgramBindings, TracePushConstants};
pub use renderer::{RenderError, RenderOutput, Renderer};
pub use resources::{PoolSizes, TraceResources};
pub use scene::{GeometryBlob, Scene, StaticScene};
pub use vulkan_frame::{SlotResources, VulkanFrameBackend};
