//! One entry point over the offline and interactive paths.

use std::path::Path;

use photon_core::{FrameExtent, PackedRgba};
use photon_gpu::GpuError;
use thiserror::Error;

use crate::camera::CameraUniforms;
use crate::encode::EncodeError;
use crate::frame::{FramePipeline, FrameStatus};
use crate::offline::OfflineRenderer;
use crate::scene::Scene;
use crate::vulkan_frame::VulkanFrameBackend;

/// Errors from rendering or writing a frame.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("{0} is only available in {1} mode")]
    WrongMode(&'static str, &'static str),
}

/// What a call to [`Renderer::render`] produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RenderOutput {
    /// Offline: the frame read back to the host.
    Pixels(Vec<PackedRgba>),
    /// Interactive: the presentation outcome.
    Frame(FrameStatus),
}

/// Offline or interactive ray tracer.
pub enum Renderer {
    Offline(OfflineRenderer),
    Interactive(Box<FramePipeline<VulkanFrameBackend>>),
}

impl Renderer {
    /// Upload scene geometry and build the trace program. Must run before the
    /// first [`render`](Self::render); calling it again replaces the scene.
    pub fn prerender(&mut self, scene: &dyn Scene) -> Result<(), RenderError> {
        match self {
            Self::Offline(offline) => offline.prerender(scene)?,
            Self::Interactive(pipeline) => {
                pipeline.backend_mut().resources_mut().prerender(scene)?;
            }
        }
        Ok(())
    }

    /// Render one frame from `camera`.
    pub fn render(&mut self, camera: &CameraUniforms) -> Result<RenderOutput, RenderError> {
        match self {
            Self::Offline(offline) => {
                offline.render(camera)?;
                Ok(RenderOutput::Pixels(offline.sync()?))
            }
            Self::Interactive(pipeline) => {
                Ok(RenderOutput::Frame(pipeline.render_frame(camera)?))
            }
        }
    }

    /// Rebuild presentation at `extent` after [`FrameStatus::NeedsRecreate`]
    /// or a resize. Returns the extent actually rendered at.
    pub fn recreate(&mut self, extent: FrameExtent) -> Result<FrameExtent, RenderError> {
        match self {
            Self::Offline(_) => Err(RenderError::WrongMode("recreate", "interactive")),
            Self::Interactive(pipeline) => Ok(pipeline.recreate(extent)?),
        }
    }

    /// Frames rendered so far.
    pub fn frame_count(&self) -> u64 {
        match self {
            Self::Offline(offline) => offline.frame_count(),
            Self::Interactive(pipeline) => pipeline.frame_count(),
        }
    }

    /// Render one frame and write it to `path`.
    pub fn render_to_file(
        &mut self,
        camera: &CameraUniforms,
        path: &Path,
    ) -> Result<(), RenderError> {
        match self {
            Self::Offline(offline) => offline.render_to_file(camera, path),
            Self::Interactive(_) => Err(RenderError::WrongMode("render_to_file", "offline")),
        }
    }

    /// Wait for the device and release every resource.
    pub fn shutdown(&mut self) -> Result<(), RenderError> {
        match self {
            Self::Offline(offline) => offline.destroy()?,
            Self::Interactive(pipeline) => {
                pipeline.shutdown()?;
                unsafe { pipeline.backend_mut().destroy()? };
            }
        }
        Ok(())
    }
}
