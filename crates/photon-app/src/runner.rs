//! Application runner and event loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use photon_core::FrameExtent;
use photon_gpu::GpuContextBuilder;
use photon_render::{FramePipeline, FrameStatus, RenderOutput, Renderer, VulkanFrameBackend};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::PhotonApp;
use crate::config::AppConfig;
use crate::context::AppContext;

/// Install the global `tracing` subscriber, filtered by `RUST_LOG`
/// (default `info`). Later calls are no-ops.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

/// Run a `PhotonApp` in a window until it is closed.
///
/// Initializes logging, creates the window, GPU context and render loop,
/// passes `setup` to [`PhotonApp::init`] and returns the first fatal error,
/// if any.
pub fn run_app<A: PhotonApp + 'static>(
    config: AppConfig,
    setup: A::Setup,
) -> anyhow::Result<()> {
    init_logging();

    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        setup: Some(setup),
        state: None,
        error: None,
    };

    event_loop.run_app(&mut runner)?;

    match runner.error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Internal application runner that implements winit's ApplicationHandler.
struct AppRunner<A: PhotonApp> {
    config: AppConfig,
    /// Consumed by the first `resumed`.
    setup: Option<A::Setup>,
    state: Option<AppState<A>>,
    /// First fatal error; ends the event loop.
    error: Option<anyhow::Error>,
}

/// Internal application state.
struct AppState<A: PhotonApp> {
    ctx: AppContext,
    app: A,
    renderer: Renderer,
    /// Set by a resize or a frame that asked for a new swapchain.
    needs_recreate: bool,
    target_frame_time: Option<Duration>,
    // FPS tracking
    min_fps: f64,
    max_fps: f64,
    fps_sum: f64,
}

impl<A: PhotonApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                self.error = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        // Let the app handle the event first
        if let Some(state) = &mut self.state {
            if state.app.on_event(&event) {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                if let Some(mut state) = self.state.take() {
                    state.cleanup();
                }
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                if let Some(state) = &mut self.state {
                    if let Err(e) = state.render_frame() {
                        error!("Render error: {e:#}");
                        self.error = Some(e);
                        if let Some(mut state) = self.state.take() {
                            state.cleanup();
                        }
                        event_loop.exit();
                        return;
                    }
                    state.ctx.window.request_redraw();
                }
            }
            WindowEvent::Resized(size) => {
                if let Some(state) = &mut self.state {
                    state.handle_resize(size.width, size.height);
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(mut state) = self.state.take() {
            state.cleanup();
        }
    }
}

impl<A: PhotonApp + 'static> AppRunner<A> {
    fn create_state(&mut self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let setup = self
            .setup
            .take()
            .ok_or_else(|| anyhow::anyhow!("application setup was already consumed"))?;

        // Create window
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));

        let window = Arc::new(event_loop.create_window(window_attrs)?);

        // Create GPU context; the surface must exist before device selection
        let (gpu, surface) = GpuContextBuilder::new()
            .app_name(&self.config.title)
            .validation(self.config.validation)
            .build_with_window(window.as_ref())?;
        let gpu = Arc::new(gpu);

        info!("GPU: {}", gpu.capabilities().summary());

        let size = window.inner_size();
        let extent = FrameExtent::new(size.width.max(1), size.height.max(1))?;
        let mut ctx = AppContext::new(window, Arc::clone(&gpu), extent);

        // Initialize the application
        let app = A::init(&ctx, setup)?;

        let frame_config = self.config.frame_config(extent);
        let backend = VulkanFrameBackend::new(
            gpu,
            surface,
            app.program_spirv().to_vec(),
            self.config.pools,
            &frame_config,
        )?;
        ctx.extent = backend.extent();

        let pipeline = FramePipeline::new(backend, frame_config)?;
        let mut renderer = Renderer::Interactive(Box::new(pipeline));
        if let Err(e) = renderer.prerender(app.scene()) {
            if let Err(shutdown) = renderer.shutdown() {
                warn!("Shutdown after failed prerender: {shutdown}");
            }
            return Err(e.into());
        }

        let target_frame_time = self
            .config
            .target_fps
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps.max(1))));

        Ok(AppState {
            ctx,
            app,
            renderer,
            needs_recreate: false,
            target_frame_time,
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
        })
    }
}

impl<A: PhotonApp> AppState<A> {
    fn render_frame(&mut self) -> anyhow::Result<()> {
        if self.needs_recreate {
            // Minimized: nothing to present until the window has an area again.
            let Some(extent) = self.ctx.window_extent() else {
                return Ok(());
            };
            self.recreate(extent)?;
        }

        let frame_start = Instant::now();

        // Calculate delta time
        let now = Instant::now();
        let dt = now.duration_since(self.ctx.last_frame_time).as_secs_f32();
        self.ctx.last_frame_time = now;

        if dt > 0.0 {
            let fps = 1.0 / f64::from(dt);
            self.min_fps = self.min_fps.min(fps);
            self.max_fps = self.max_fps.max(fps);
            self.fps_sum += fps;
        }

        self.app.update(&self.ctx, dt);
        let camera = self.app.camera(&self.ctx);

        match self.renderer.render(&camera)? {
            RenderOutput::Frame(FrameStatus::Presented { suboptimal, .. }) => {
                self.ctx.frame_count += 1;
                if suboptimal {
                    self.needs_recreate = true;
                }
            }
            RenderOutput::Frame(FrameStatus::NeedsRecreate) => self.needs_recreate = true,
            RenderOutput::Pixels(_) => {}
        }

        // Frame pacing
        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                thread::sleep(target - elapsed);
            }
        }

        Ok(())
    }

    /// Resizes are applied on the next redraw so a drag rebuilds once.
    fn handle_resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        if self.ctx.extent.width != width || self.ctx.extent.height != height {
            self.needs_recreate = true;
        }
    }

    fn recreate(&mut self, requested: FrameExtent) -> anyhow::Result<()> {
        // The swapchain may clamp the window size.
        let extent = self.renderer.recreate(requested)?;
        self.ctx.extent = extent;
        self.needs_recreate = false;

        // Notify the application
        self.app.on_resize(&self.ctx, extent.width, extent.height)?;

        info!("Resized to {}x{}", extent.width, extent.height);
        Ok(())
    }

    fn cleanup(&mut self) {
        // Print FPS statistics
        if self.ctx.frame_count > 0 {
            let avg_fps = self.fps_sum / self.ctx.frame_count as f64;
            info!("FPS Statistics:");
            info!("  Min: {:.1}", self.min_fps);
            info!("  Max: {:.1}", self.max_fps);
            info!("  Avg: {:.1}", avg_fps);
            info!("  Total frames: {}", self.ctx.frame_count);
        }

        info!("Starting cleanup...");
        if let Err(e) = self.ctx.gpu.wait_idle() {
            error!("Failed to wait idle: {e}");
        }

        // Let the app cleanup first
        self.app.cleanup(&self.ctx);

        // Then release the render loop, pools and swapchain
        if let Err(e) = self.renderer.shutdown() {
            error!("Renderer shutdown failed: {e}");
        }

        info!("Cleanup complete");
    }
}
