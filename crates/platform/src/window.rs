//! winit window backend.
//!
//! [`Window`] wraps a winit window and implements [`WindowSurface`] so the
//! renderer can create its surface and query the drawable size without
//! knowing about winit.

use std::ffi::{CStr, c_char};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ash::vk;
use ember_core::{Error, Result, WindowConfig};
use ember_rhi::surface::{Surface, WindowSurface};
use ember_rhi::{RhiError, RhiResult};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::dpi::PhysicalSize;
use winit::event_loop::ActiveEventLoop;
use winit::window::{Window as WinitWindow, WindowAttributes};

/// Sleep between size polls while the window is minimized. winit delivers
/// events on the thread that owns the event loop, so the size is re-read
/// from the window itself.
const MINIMIZED_POLL: Duration = Duration::from_millis(16);

/// A resizable application window.
pub struct Window {
    window: Arc<WinitWindow>,
}

impl Window {
    /// Creates a window sized and titled from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Window`] if the platform refuses to create it.
    pub fn new(event_loop: &ActiveEventLoop, config: &WindowConfig) -> Result<Self> {
        let attrs = WindowAttributes::default()
            .with_title(config.title.clone())
            .with_inner_size(PhysicalSize::new(config.width, config.height))
            .with_resizable(true);

        let window = event_loop
            .create_window(attrs)
            .map_err(|e| Error::Window(e.to_string()))?;

        tracing::info!("Window created: {}x{}", config.width, config.height);

        Ok(Self {
            window: Arc::new(window),
        })
    }

    /// Get a reference to the underlying winit window.
    #[inline]
    pub fn inner(&self) -> &WinitWindow {
        &self.window
    }

    #[inline]
    pub fn inner_arc(&self) -> Arc<WinitWindow> {
        self.window.clone()
    }

    /// True while the window has no drawable area.
    pub fn is_minimized(&self) -> bool {
        let (width, height) = self.size();
        width == 0 || height == 0
    }

    /// Width over height, or 1.0 while minimized.
    pub fn aspect_ratio(&self) -> f32 {
        let (width, height) = self.size();
        if height == 0 {
            1.0
        } else {
            width as f32 / height as f32
        }
    }

    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }
}

impl WindowSurface for Window {
    fn required_extensions(&self) -> RhiResult<Vec<*const c_char>> {
        let display_handle = self
            .window
            .display_handle()
            .map_err(|e| RhiError::SurfaceError(format!("Failed to get display handle: {}", e)))?;
        let extensions = ash_window::enumerate_required_extensions(display_handle.as_raw())?;

        tracing::debug!(
            "Required Vulkan extensions for surface: {:?}",
            extensions
                .iter()
                // SAFETY: ash_window returns pointers to static, null-terminated
                // extension name constants.
                .map(|&ext| unsafe { CStr::from_ptr(ext) })
                .collect::<Vec<_>>()
        );
        Ok(extensions.to_vec())
    }

    fn create_surface(&self, entry: &ash::Entry, instance: &ash::Instance) -> RhiResult<Surface> {
        let display_handle = self
            .window
            .display_handle()
            .map_err(|e| RhiError::SurfaceError(format!("Failed to get display handle: {}", e)))?;
        let window_handle = self
            .window
            .window_handle()
            .map_err(|e| RhiError::SurfaceError(format!("Failed to get window handle: {}", e)))?;

        // SAFETY: entry and instance are valid for the duration of the call and
        // the handles come from a live winit window. The returned Surface
        // destroys the handle.
        let handle: vk::SurfaceKHR = unsafe {
            ash_window::create_surface(
                entry,
                instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }
        .map_err(|e| RhiError::SurfaceError(format!("Failed to create Vulkan surface: {}", e)))?;

        let loader = ash::khr::surface::Instance::new(entry, instance);
        tracing::info!("Vulkan surface created");
        Ok(Surface::from_raw(handle, loader))
    }

    fn size(&self) -> (u32, u32) {
        let size = self.window.inner_size();
        (size.width, size.height)
    }

    fn wait_events(&self) {
        thread::sleep(MINIMIZED_POLL);
    }
}
