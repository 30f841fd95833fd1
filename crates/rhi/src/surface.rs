//! Window surface abstraction.
//!
//! The RHI never creates windows. It consumes any type implementing
//! [`WindowSurface`], which supplies the instance extensions it needs, creates
//! the native `VkSurfaceKHR`, and reports the current drawable size.
//!
//! # Overview
//!
//! - [`WindowSurface`] is implemented by the platform crate for each window
//!   backend
//! - [`Surface`] owns the created `VkSurfaceKHR` and destroys it on drop
//! - [`wait_for_nonzero_size`] blocks a caller while the window is minimized

use std::ffi::c_char;

use ash::vk;
use tracing::debug;

use crate::error::{RhiError, RhiResult};

/// Contract the renderer needs from a window backend.
pub trait WindowSurface {
    /// Instance extensions required to create a surface for this window.
    ///
    /// The returned pointers reference static strings owned by the loader.
    fn required_extensions(&self) -> RhiResult<Vec<*const c_char>>;

    /// Creates a Vulkan surface for this window.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::SurfaceError`] if the native handles are unavailable
    /// or surface creation fails.
    fn create_surface(&self, entry: &ash::Entry, instance: &ash::Instance) -> RhiResult<Surface>;

    /// Current drawable size in physical pixels. `(0, 0)` while minimized.
    fn size(&self) -> (u32, u32);

    /// Waits for (or pumps) window events so `size` can change.
    ///
    /// Backends driven by an external event loop may simply yield.
    fn wait_events(&self);
}

/// RAII wrapper for a Vulkan surface.
///
/// # Ownership
/// The surface is destroyed automatically when this struct is dropped.
/// The caller must ensure that the Vulkan instance outlives this surface.
pub struct Surface {
    handle: vk::SurfaceKHR,
    loader: ash::khr::surface::Instance,
}

impl Surface {
    /// Wraps a surface created by a window backend.
    ///
    /// Ownership of `handle` moves into the returned value.
    pub fn from_raw(handle: vk::SurfaceKHR, loader: ash::khr::surface::Instance) -> Self {
        Self { handle, loader }
    }

    /// Returns the raw Vulkan surface handle.
    #[inline]
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// Returns the surface extension loader used for capability queries.
    #[inline]
    pub fn loader(&self) -> &ash::khr::surface::Instance {
        &self.loader
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        // SAFETY: the handle was created for the instance this loader wraps and
        // is destroyed exactly once.
        unsafe {
            self.loader.destroy_surface(self.handle, None);
        }
        debug!("Vulkan surface destroyed");
    }
}

/// Blocks until `window` reports a non-zero size.
///
/// Calls [`WindowSurface::wait_events`] between polls. With `max_polls` set,
/// gives up after that many polls and returns [`RhiError::ZeroExtent`];
/// `None` waits indefinitely.
///
/// # Errors
///
/// Returns [`RhiError::ZeroExtent`] if the poll budget runs out.
pub fn wait_for_nonzero_size(
    window: &dyn WindowSurface,
    max_polls: Option<u32>,
) -> RhiResult<(u32, u32)> {
    let mut polls = 0u32;
    loop {
        let (width, height) = window.size();
        if width > 0 && height > 0 {
            return Ok((width, height));
        }
        if max_polls.is_some_and(|max| polls >= max) {
            return Err(RhiError::ZeroExtent);
        }
        if polls == 0 {
            debug!("Window minimized, waiting for a non-zero size");
        }
        window.wait_events();
        polls += 1;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::Cell;

    use super::*;

    /// Window that stays minimized for a fixed number of event waits.
    pub(crate) struct MinimizedWindow {
        pub(crate) remaining: Cell<u32>,
        pub(crate) size: (u32, u32),
        pub(crate) waits: Cell<u32>,
    }

    impl WindowSurface for MinimizedWindow {
        fn required_extensions(&self) -> RhiResult<Vec<*const c_char>> {
            Ok(Vec::new())
        }

        fn create_surface(&self, _: &ash::Entry, _: &ash::Instance) -> RhiResult<Surface> {
            Err(RhiError::SurfaceError("test window has no surface".into()))
        }

        fn size(&self) -> (u32, u32) {
            if self.remaining.get() > 0 {
                (0, 0)
            } else {
                self.size
            }
        }

        fn wait_events(&self) {
            self.waits.set(self.waits.get() + 1);
            self.remaining.set(self.remaining.get().saturating_sub(1));
        }
    }

    #[test]
    fn test_wait_blocks_until_restored() {
        let window = MinimizedWindow {
            remaining: Cell::new(3),
            size: (800, 600),
            waits: Cell::new(0),
        };
        let size = wait_for_nonzero_size(&window, None).unwrap();
        assert_eq!(size, (800, 600));
        assert_eq!(window.waits.get(), 3);
    }

    #[test]
    fn test_wait_gives_up_after_budget() {
        let window = MinimizedWindow {
            remaining: Cell::new(10),
            size: (800, 600),
            waits: Cell::new(0),
        };
        let result = wait_for_nonzero_size(&window, Some(2));
        assert!(matches!(result, Err(RhiError::ZeroExtent)));
        assert_eq!(window.waits.get(), 2);
    }

    #[test]
    fn test_no_wait_when_visible() {
        let window = MinimizedWindow {
            remaining: Cell::new(0),
            size: (1, 1),
            waits: Cell::new(0),
        };
        assert_eq!(wait_for_nonzero_size(&window, Some(0)).unwrap(), (1, 1));
        assert_eq!(window.waits.get(), 0);
    }
}
