//! Photon viewer
//!
//! Ray traces a scene with a compute kernel, either in a window with several
//! frames in flight or headless into a single image file.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p photon-viewer -- [OPTIONS]
//! ```
//!
//! The trace kernel is loaded as SPIR-V; compile the bundled GLSL first:
//!
//! ```bash
//! glslc apps/photon-viewer/shaders/trace.comp -o apps/photon-viewer/shaders/trace.spv
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;
mod args;
mod scene;

use glam::Vec3;
use photon_app::{render_offline, run_app, AppConfig, Camera};

use crate::app::{Viewer, ViewerSetup};
use crate::args::ViewerArgs;

const TITLE: &str = "Photon Viewer";

fn main() -> anyhow::Result<()> {
    let args = ViewerArgs::from_env()?;
    if args.help {
        print_help();
        return Ok(());
    }

    let config = AppConfig::new(TITLE)
        .with_size(args.width, args.height)
        .with_frames_in_flight(args.frames_in_flight)
        .with_vsync(args.vsync)
        .with_validation(args.validation);

    let setup = ViewerSetup::load(&args)?;

    if args.offline {
        let mut camera = Camera::default();
        camera.orbit(Vec3::ZERO, 6.0, 2.0, 0.0);
        return render_offline(&config, setup.spirv, &setup.scene, &camera, &args.output);
    }

    run_app::<Viewer>(config, setup)
}

fn print_help() {
    eprintln!(
        "Photon Viewer

USAGE:
    cargo run -p photon-viewer -- [OPTIONS]

OPTIONS:
    --width <N>             Frame width (default: 1280)
    --height <N>            Frame height (default: 720)
    --frames-in-flight <N>  Frame slots in the render loop (default: 2)
    --shader <PATH>         SPIR-V trace kernel
                            Default: {}
    --geometry <PATH>       Geometry blob bound after the render target;
                            repeat for more (default: built-in spheres)
    --offline               Render one frame without a window
    -o, --output <PATH>     Offline output, .png or .ppm (default: {})
    --vsync                 Enable vsync
    --validation            Enable Vulkan validation layers
    -h, --help              Print this help message

EXAMPLES:
    # Interactive, three frames in flight
    cargo run -p photon-viewer -- --frames-in-flight 3

    # Headless render to a PPM file
    cargo run -p photon-viewer -- --offline --width 800 --height 600 -o frame.ppm

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)",
        args::DEFAULT_SHADER,
        args::DEFAULT_OUTPUT
    );
}
