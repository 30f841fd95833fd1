//! ember sample application.
//!
//! Opens a window, streams a model through the resource manager and draws it
//! every frame once it has reached the GPU.
//!
//! ```text
//! ember [config.toml] [model.model.toml]
//! ```
//!
//! The config defaults to `ember.toml` in the working directory; a missing
//! file means default settings. The model path is resolved against the
//! configured asset root.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::WindowId;

use ember_core::{EngineConfig, FrameTimer};
use ember_platform::Window;
use ember_renderer::Renderer;
use ember_resources::{ModelResource, ResourceHandle, ResourceManager};

const DEFAULT_CONFIG: &str = "ember.toml";
const DEFAULT_MODEL: &str = "models/scene.model.toml";

struct App {
    config: EngineConfig,
    resources: ResourceManager,
    model_path: PathBuf,
    model: Option<ResourceHandle<ModelResource>>,
    window: Option<Window>,
    renderer: Option<Renderer>,
    timer: FrameTimer,
}

impl App {
    fn new(config: EngineConfig, resources: ResourceManager, model_path: PathBuf) -> Self {
        Self {
            config,
            resources,
            model_path,
            model: None,
            window: None,
            renderer: None,
            timer: FrameTimer::new(),
        }
    }

    fn init_graphics(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = Window::new(event_loop, &self.config.window)?;
        let renderer = Renderer::new(&window, &self.config.renderer)?;

        self.resources.set_backend(renderer.backend());
        self.resources
            .set_recording_lock(renderer.recording_lock().clone());

        match self.resources.load::<ModelResource>(&self.model_path) {
            Ok(handle) => self.model = Some(handle),
            Err(e) => error!("Failed to request model {:?}: {}", self.model_path, e),
        }

        info!("Initialization complete, entering main loop");
        self.window = Some(window);
        self.renderer = Some(renderer);
        Ok(())
    }

    fn render_frame(&mut self) -> Result<()> {
        let (Some(window), Some(renderer)) = (self.window.as_ref(), self.renderer.as_mut()) else {
            return Ok(());
        };

        // One upload per frame keeps loading off the frame-time budget.
        self.resources.update_resource_to_send();

        if window.is_minimized() {
            return Ok(());
        }
        if !renderer.begin_frame()? {
            debug!("Frame {} skipped", renderer.frame_number());
            return Ok(());
        }
        renderer.clear_color()?;

        if let Some(model) = &self.model
            && let Ok(model) = model.resolve()
            && let Err(e) = model.draw(renderer)
        {
            renderer.cancel_frame()?;
            return Err(e.into());
        }

        renderer.end_frame()?;

        let (_delta, fps) = self.timer.tick();
        if let Some(fps) = fps {
            let stats = renderer.last_frame_stats();
            debug!(
                "{:.1} fps, {} draws, {} pipeline binds, {} pending uploads",
                fps,
                stats.draw_calls,
                stats.pipeline_binds,
                self.resources.pending_uploads()
            );
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(renderer) = &self.renderer
            && let Err(e) = renderer.wait_for_gpu()
        {
            warn!("Failed to wait for the GPU on shutdown: {}", e);
        }
        if let Err(e) = self.resources.save_cache() {
            warn!("Failed to save the resource cache: {}", e);
        }
        self.model = None;
        self.renderer = None;
        self.window = None;
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        if let Err(e) = self.init_graphics(event_loop) {
            error!("Failed to initialize graphics: {:#}", e);
            event_loop.exit();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested, shutting down");
                self.shutdown();
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.resize(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => {
                if let Err(e) = self.render_frame() {
                    error!("Render error: {:#}", e);
                    self.shutdown();
                    event_loop.exit();
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }
}

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let model_path = PathBuf::from(args.next().unwrap_or_else(|| DEFAULT_MODEL.to_string()));

    let config = EngineConfig::load_or_default(&config_path)
        .with_context(|| format!("loading {config_path}"))?;
    match config.log_filter.as_deref() {
        Some(filter) => ember_core::init_logging_with(filter),
        None => ember_core::init_logging(),
    }
    info!("Starting ember");

    // Loads may start before the window exists; uploads wait for the device.
    let resources = ResourceManager::new(&config.resources, ember_renderer::Backend::Headless)
        .context("starting the resource manager")?;

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config, resources, model_path);
    event_loop.run_app(&mut app)?;
    Ok(())
}
