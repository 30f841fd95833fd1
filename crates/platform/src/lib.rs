//! Platform layer for the ember renderer.
//!
//! Provides a winit-backed [`Window`] implementing
//! [`ember_rhi::surface::WindowSurface`], which is all the renderer needs
//! from a window: instance extensions, surface creation and the drawable
//! size.

mod window;

pub use window::Window;

// Re-export winit types the application loop needs.
pub use winit::event::WindowEvent;
pub use winit::event_loop::{ActiveEventLoop, EventLoop};
