//! Interactive viewer: an orbiting camera around the scene.

use std::path::Path;

use glam::Vec3;
use photon_app::{AppContext, Camera, PhotonApp, WindowEvent};
use photon_render::{CameraUniforms, Scene, StaticScene};
use tracing::info;
use winit::event::ElementState;
use winit::keyboard::{KeyCode, PhysicalKey};

use crate::args::ViewerArgs;
use crate::scene::load_scene;

/// Orbit speed in radians per second.
const ORBIT_SPEED: f32 = 0.3;
const ORBIT_RADIUS: f32 = 6.0;
const ORBIT_HEIGHT: f32 = 2.0;

/// Trace kernel and scene, loaded once from the parsed arguments.
pub struct ViewerSetup {
    pub spirv: Vec<u8>,
    pub scene: StaticScene,
}

impl ViewerSetup {
    pub fn load(args: &ViewerArgs) -> anyhow::Result<Self> {
        Ok(Self {
            spirv: read_shader(&args.shader)?,
            scene: load_scene(&args.geometry)?,
        })
    }
}

/// Read the trace kernel's SPIR-V file.
fn read_shader(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to read trace kernel {}: {e} (compile shaders/trace.comp with glslc)",
            path.display()
        )
    })
}

/// Viewer application state.
pub struct Viewer {
    spirv: Vec<u8>,
    scene: StaticScene,
    camera: Camera,
    angle: f32,
    paused: bool,
}

impl PhotonApp for Viewer {
    type Setup = ViewerSetup;

    fn init(ctx: &AppContext, setup: ViewerSetup) -> anyhow::Result<Self> {
        let ViewerSetup { spirv, scene } = setup;

        info!(
            "Viewer: {} geometry blobs ({} bytes), press Space to pause the orbit",
            scene.geometry().len(),
            scene.total_bytes()
        );

        let mut camera = Camera::default();
        camera.set_aspect(ctx.aspect_ratio());
        camera.orbit(Vec3::ZERO, ORBIT_RADIUS, ORBIT_HEIGHT, 0.0);

        Ok(Self {
            spirv,
            scene,
            camera,
            angle: 0.0,
            paused: false,
        })
    }

    fn program_spirv(&self) -> &[u8] {
        &self.spirv
    }

    fn scene(&self) -> &dyn Scene {
        &self.scene
    }

    fn update(&mut self, _ctx: &AppContext, dt: f32) {
        if !self.paused {
            self.angle = (self.angle + ORBIT_SPEED * dt) % std::f32::consts::TAU;
        }
        self.camera.orbit(Vec3::ZERO, ORBIT_RADIUS, ORBIT_HEIGHT, self.angle);
    }

    fn camera(&self, _ctx: &AppContext) -> CameraUniforms {
        self.camera.uniforms()
    }

    fn on_resize(&mut self, _ctx: &AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        self.camera.set_aspect(width as f32 / height as f32);
        Ok(())
    }

    fn on_event(&mut self, event: &WindowEvent) -> bool {
        if let WindowEvent::KeyboardInput { event, .. } = event {
            if event.state == ElementState::Pressed
                && !event.repeat
                && event.physical_key == PhysicalKey::Code(KeyCode::Space)
            {
                self.paused = !self.paused;
                return true;
            }
        }
        false
    }
}
