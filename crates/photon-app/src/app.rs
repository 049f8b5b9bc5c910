//! `PhotonApp` trait definition.

use photon_render::{CameraUniforms, Scene};
use winit::event::WindowEvent;

use crate::context::AppContext;

/// Trait for Photon applications.
///
/// The framework owns the window, the GPU context and the render loop; the
/// application supplies the trace kernel, the scene and a camera per frame.
pub trait PhotonApp: Sized {
    /// Data prepared before the event loop starts (parsed arguments, loaded
    /// assets), handed to [`init`](Self::init).
    type Setup;

    /// Initialize the application.
    ///
    /// Called once after the window and GPU context exist and before the
    /// render loop is built.
    fn init(ctx: &AppContext, setup: Self::Setup) -> anyhow::Result<Self>;

    /// SPIR-V bytes of the trace kernel.
    fn program_spirv(&self) -> &[u8];

    /// Geometry uploaded once before the first frame.
    fn scene(&self) -> &dyn Scene;

    /// Update application state.
    ///
    /// Called every frame before rendering with the time since the last
    /// frame in seconds.
    fn update(&mut self, ctx: &AppContext, dt: f32);

    /// Camera for the frame about to be rendered.
    fn camera(&self, ctx: &AppContext) -> CameraUniforms;

    /// Handle window resize.
    ///
    /// Called after the render loop has been rebuilt for the new size.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle window events.
    ///
    /// Return `true` if the event was handled and should not be processed
    /// further.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Cleanup before shutdown. The GPU is idle when this is called.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &AppContext) {}
}
