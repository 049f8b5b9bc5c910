//! Application framework for the Photon ray tracer.
//!
//! This crate handles the boilerplate around the renderer:
//! - Logging setup
//! - Window creation and the winit event loop
//! - GPU context and render loop construction
//! - Swapchain recreation on resize or surface loss
//! - Headless single-frame rendering to a file
//!
//! # Example
//!
//! ```no_run
//! use photon_app::{run_app, AppConfig, AppContext, PhotonApp};
//! use photon_render::{Camera, CameraUniforms, Scene, StaticScene};
//!
//! struct MyApp {
//!     spirv: Vec<u8>,
//!     scene: StaticScene,
//!     camera: Camera,
//! }
//!
//! impl PhotonApp for MyApp {
//!     type Setup = Vec<u8>;
//!
//!     fn init(_ctx: &AppContext, spirv: Vec<u8>) -> anyhow::Result<Self> {
//!         Ok(MyApp {
//!             spirv,
//!             scene: StaticScene::new(),
//!             camera: Camera::default(),
//!         })
//!     }
//!
//!     fn program_spirv(&self) -> &[u8] {
//!         &self.spirv
//!     }
//!
//!     fn scene(&self) -> &dyn Scene {
//!         &self.scene
//!     }
//!
//!     fn update(&mut self, ctx: &AppContext, _dt: f32) {
//!         self.camera.set_aspect(ctx.aspect_ratio());
//!     }
//!
//!     fn camera(&self, _ctx: &AppContext) -> CameraUniforms {
//!         self.camera.uniforms()
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let spirv = std::fs::read("trace.spv")?;
//!     run_app::<MyApp>(AppConfig::default(), spirv)
//! }
//! ```

mod app;
mod config;
mod context;
mod offline;
mod runner;

pub use app::PhotonApp;
pub use config::AppConfig;
pub use context::AppContext;
pub use offline::render_offline;
pub use runner::{init_logging, run_app};

// Re-export commonly used types for convenience
pub use photon_gpu::{GpuContext, GpuContextBuilder};
pub use photon_render::Camera;
pub use winit::event::WindowEvent;
