//! Headless rendering to an image file.

use std::path::Path;
use std::sync::Arc;

use photon_gpu::GpuContextBuilder;
use photon_render::{Camera, OfflineRenderer, Renderer, Scene};
use tracing::info;

use crate::config::AppConfig;
use crate::runner::init_logging;

/// Render one frame of `scene` without a window and write it to `output`.
///
/// The output format follows the file extension (`.png` or `.ppm`). The
/// camera's aspect ratio is overridden to match the configured size.
pub fn render_offline(
    config: &AppConfig,
    program_spirv: Vec<u8>,
    scene: &dyn Scene,
    camera: &Camera,
    output: &Path,
) -> anyhow::Result<()> {
    init_logging();

    let extent = config.extent()?;
    let gpu = GpuContextBuilder::new()
        .app_name(&config.title)
        .validation(config.validation)
        .build()?;
    let gpu = Arc::new(gpu);

    info!("GPU: {}", gpu.capabilities().summary());

    let offline = OfflineRenderer::new(gpu, program_spirv, config.pools, extent)?;
    let mut renderer = Renderer::Offline(offline);

    let mut camera = camera.clone();
    camera.set_aspect(extent.aspect_ratio());

    let start = std::time::Instant::now();
    let result = renderer
        .prerender(scene)
        .and_then(|()| renderer.render_to_file(&camera.uniforms(), output));
    renderer.shutdown()?;
    result?;

    info!(
        "Wrote {}x{} frame to {} in {:.1} ms",
        extent.width,
        extent.height,
        output.display(),
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(())
}
