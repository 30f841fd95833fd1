//! Swapchain management.
//!
//! This module handles VkSwapchainKHR creation, image acquisition, and
//! presentation.
//!
//! # Overview
//!
//! A [`Swapchain`] owns its presentable images and one view per image. Format,
//! extent and present mode are fixed for its lifetime; a resize or an
//! `OUT_OF_DATE`/`SUBOPTIMAL` signal is handled by [`Swapchain::recreate`],
//! which builds a replacement (passing the old handle as `old_swapchain`) and
//! then destroys the old one.
//!
//! A zero window size never produces a swapchain: [`choose_extent`] returns
//! `None` and creation fails with [`RhiError::ZeroExtent`], leaving the caller
//! to wait for the window to be restored.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ember_rhi::device::Device;
//! use ember_rhi::instance::Instance;
//! use ember_rhi::surface::Surface;
//! use ember_rhi::swapchain::Swapchain;
//! use ember_rhi::vk;
//!
//! # fn example(instance: &Instance, device: Arc<Device>, surface: &Surface) -> ember_rhi::RhiResult<()> {
//! let mut swapchain = Swapchain::new(instance, device, surface, (800, 600), vk::PresentModeKHR::MAILBOX)?;
//!
//! // After a resize event:
//! swapchain.recreate(instance, surface, (1024, 768))?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, warn};

use crate::device::{Device, SharedQueue};
use crate::error::RhiError;
use crate::instance::Instance;
use crate::surface::Surface;

/// Swapchain surface support details.
#[derive(Debug, Clone)]
pub struct SwapchainSupportDetails {
    /// Surface capabilities (min/max image count, extents, transforms, etc.)
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats (format and color space combinations)
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes (FIFO, MAILBOX, IMMEDIATE, etc.)
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupportDetails {
    /// Queries swapchain support details for a physical device and surface.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the queries fail.
    pub fn query(physical_device: vk::PhysicalDevice, surface: &Surface) -> Result<Self, RhiError> {
        let loader = surface.loader();
        let capabilities = unsafe {
            loader.get_physical_device_surface_capabilities(physical_device, surface.handle())?
        };
        let formats = unsafe {
            loader.get_physical_device_surface_formats(physical_device, surface.handle())?
        };
        let present_modes = unsafe {
            loader.get_physical_device_surface_present_modes(physical_device, surface.handle())?
        };

        Ok(Self {
            capabilities,
            formats,
            present_modes,
        })
    }

    /// Returns true if at least one format and one present mode are available.
    #[inline]
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Vulkan swapchain wrapper.
///
/// # Thread Safety
///
/// The swapchain is driven from the render thread only. Presentation goes
/// through the mutex-guarded present queue.
pub struct Swapchain {
    device: Arc<Device>,
    swapchain_loader: ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    /// Swapchain images (owned by the swapchain)
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::Format,
    color_space: vk::ColorSpaceKHR,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    /// Present mode requested by configuration, reused on recreation.
    preferred_present_mode: vk::PresentModeKHR,
}

impl Swapchain {
    /// Creates a new swapchain.
    ///
    /// # Arguments
    ///
    /// * `instance` - The Vulkan instance
    /// * `device` - The logical device
    /// * `surface` - The window surface
    /// * `window_size` - Current drawable size of the window
    /// * `preferred_present_mode` - Mode to use when the surface supports it
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::ZeroExtent`] while the window is minimized, or an
    /// error if surface queries, swapchain creation or view creation fail.
    pub fn new(
        instance: &Instance,
        device: Arc<Device>,
        surface: &Surface,
        window_size: (u32, u32),
        preferred_present_mode: vk::PresentModeKHR,
    ) -> Result<Self, RhiError> {
        Self::create_internal(
            instance,
            device,
            surface,
            window_size,
            preferred_present_mode,
            vk::SwapchainKHR::null(),
        )
    }

    fn create_internal(
        instance: &Instance,
        device: Arc<Device>,
        surface: &Surface,
        window_size: (u32, u32),
        preferred_present_mode: vk::PresentModeKHR,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Self, RhiError> {
        let support = SwapchainSupportDetails::query(device.physical_device(), surface)?;
        if !support.is_adequate() {
            return Err(RhiError::SwapchainError(
                "Inadequate swapchain support (no formats or present modes)".to_string(),
            ));
        }

        let extent = choose_extent(&support.capabilities, window_size.0, window_size.1)
            .ok_or(RhiError::ZeroExtent)?;
        let surface_format = choose_surface_format(&support.formats);
        let present_mode = choose_present_mode(&support.present_modes, preferred_present_mode);
        let image_count = determine_image_count(&support.capabilities);

        let queue_families = device.queue_families();
        let families = [
            device.graphics_queue().family(),
            device.present_queue().family(),
        ];
        let (sharing_mode, family_indices) = if queue_families.is_shared() {
            (vk::SharingMode::EXCLUSIVE, &[][..])
        } else {
            (vk::SharingMode::CONCURRENT, &families[..])
        };

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle())
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(family_indices)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain_loader = ash::khr::swapchain::Device::new(instance.handle(), device.handle());
        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None)? };

        let images = match unsafe { swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(e.into());
            }
        };
        let image_views = match create_image_views(&device, &images, surface_format.format) {
            Ok(views) => views,
            Err(e) => {
                unsafe { swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(e);
            }
        };

        info!(
            "Swapchain created: {}x{}, {:?}/{:?}, {:?}, {} images",
            extent.width,
            extent.height,
            surface_format.format,
            surface_format.color_space,
            present_mode,
            images.len()
        );

        Ok(Self {
            device,
            swapchain_loader,
            swapchain,
            images,
            image_views,
            format: surface_format.format,
            color_space: surface_format.color_space,
            extent,
            present_mode,
            preferred_present_mode,
        })
    }

    /// Replaces this swapchain with one sized for `window_size`.
    ///
    /// Waits for the device to go idle first, so no in-flight command buffer
    /// can still reference the old images. On error `self` is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::ZeroExtent`] while the window is minimized, or the
    /// creation error.
    pub fn recreate(
        &mut self,
        instance: &Instance,
        surface: &Surface,
        window_size: (u32, u32),
    ) -> Result<(), RhiError> {
        self.device.wait_idle()?;

        debug!(
            "Recreating swapchain for {}x{}",
            window_size.0, window_size.1
        );

        let replacement = Self::create_internal(
            instance,
            self.device.clone(),
            surface,
            window_size,
            self.preferred_present_mode,
            self.swapchain,
        )?;
        // Dropping the retired swapchain destroys its views and handle.
        drop(std::mem::replace(self, replacement));
        Ok(())
    }

    /// Acquires the next swapchain image.
    ///
    /// Returns `(image_index, suboptimal)`. `ERROR_OUT_OF_DATE_KHR` is
    /// returned as an error; callers treat it as a request to recreate.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<(u32, bool), vk::Result> {
        unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        }
    }

    /// Presents `image_index` after `wait_semaphore` signals.
    ///
    /// Returns `true` if the swapchain is suboptimal.
    ///
    /// # Errors
    ///
    /// `ERROR_OUT_OF_DATE_KHR` is returned as an error.
    pub fn present(
        &self,
        queue: &SharedQueue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<bool, vk::Result> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let wait_semaphores = [wait_semaphore];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        queue.present(&self.swapchain_loader, &present_info)
    }

    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    #[inline]
    pub fn color_space(&self) -> vk::ColorSpaceKHR {
        self.color_space
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    #[inline]
    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    /// Returns the swapchain image at the given index.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    pub fn image(&self, index: usize) -> vk::Image {
        self.images[index]
    }

    /// Returns the image view at the given index.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    pub fn image_view(&self, index: usize) -> vk::ImageView {
        self.image_views[index]
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        for &view in &self.image_views {
            unsafe { self.device.handle().destroy_image_view(view, None) };
        }
        unsafe {
            self.swapchain_loader
                .destroy_swapchain(self.swapchain, None);
        }
        debug!(
            "Swapchain destroyed (was {}x{}, {} images)",
            self.extent.width,
            self.extent.height,
            self.images.len()
        );
    }
}

/// Chooses the surface format.
///
/// Prefers B8G8R8A8_SRGB, then any sRGB format with the SRGB_NONLINEAR color
/// space, then the first format offered.
///
/// # Panics
///
/// Panics if `formats` is empty; callers check [`SwapchainSupportDetails::is_adequate`].
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    let nonlinear = |f: &&vk::SurfaceFormatKHR| f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR;

    if let Some(&format) = formats
        .iter()
        .filter(nonlinear)
        .find(|f| f.format == vk::Format::B8G8R8A8_SRGB)
    {
        return format;
    }

    if let Some(&format) = formats
        .iter()
        .filter(nonlinear)
        .find(|f| matches!(f.format, vk::Format::R8G8B8A8_SRGB | vk::Format::A8B8G8R8_SRGB_PACK32))
    {
        return format;
    }

    warn!("No sRGB surface format, using {:?}", formats[0].format);
    formats[0]
}

/// Chooses the present mode.
///
/// Uses `preferred` if offered, then MAILBOX (low-latency triple buffering),
/// and finally FIFO, which every implementation must support.
pub fn choose_present_mode(
    present_modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if present_modes.contains(&preferred) {
        return preferred;
    }
    if preferred != vk::PresentModeKHR::FIFO && present_modes.contains(&vk::PresentModeKHR::MAILBOX) {
        return vk::PresentModeKHR::MAILBOX;
    }
    vk::PresentModeKHR::FIFO
}

/// Chooses the swapchain extent.
///
/// Returns `None` when the window or the surface reports a zero size
/// (minimized). When the surface reports the special `u32::MAX` current
/// extent, the window size is clamped to the min/max image extents.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> Option<vk::Extent2D> {
    if width == 0 || height == 0 {
        return None;
    }

    let extent = if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    };

    (extent.width > 0 && extent.height > 0).then_some(extent)
}

/// Returns `min_image_count + 1`, capped by `max_image_count` when it is set.
pub fn determine_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let preferred = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        preferred.min(capabilities.max_image_count)
    } else {
        preferred
    }
}

fn create_image_views(
    device: &Device,
    images: &[vk::Image],
    format: vk::Format,
) -> Result<Vec<vk::ImageView>, RhiError> {
    let mut image_views = Vec::with_capacity(images.len());

    for &image in images {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1),
            );

        match unsafe { device.handle().create_image_view(&create_info, None) } {
            Ok(view) => image_views.push(view),
            Err(e) => {
                for view in image_views {
                    unsafe { device.handle().destroy_image_view(view, None) };
                }
                return Err(RhiError::SwapchainError(format!(
                    "Failed to create swapchain image view: {e}"
                )));
            }
        }
    }

    Ok(image_views)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface_format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    fn resizable_caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: min,
                height: min,
            },
            max_image_extent: vk::Extent2D {
                width: max,
                height: max,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_choose_surface_format_prefers_bgra_srgb() {
        let formats = [
            surface_format(vk::Format::R8G8B8A8_UNORM),
            surface_format(vk::Format::R8G8B8A8_SRGB),
            surface_format(vk::Format::B8G8R8A8_SRGB),
        ];
        assert_eq!(
            choose_surface_format(&formats).format,
            vk::Format::B8G8R8A8_SRGB
        );
    }

    #[test]
    fn test_choose_surface_format_any_srgb_before_first() {
        let formats = [
            surface_format(vk::Format::B8G8R8A8_UNORM),
            surface_format(vk::Format::R8G8B8A8_SRGB),
        ];
        assert_eq!(
            choose_surface_format(&formats).format,
            vk::Format::R8G8B8A8_SRGB
        );
    }

    #[test]
    fn test_choose_surface_format_fallback_to_first() {
        let formats = [surface_format(vk::Format::R16G16B16A16_SFLOAT)];
        assert_eq!(
            choose_surface_format(&formats).format,
            vk::Format::R16G16B16A16_SFLOAT
        );
    }

    #[test]
    fn test_present_mode_preference_honored() {
        let modes = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::FIFO),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_present_mode_falls_back_to_mailbox_then_fifo() {
        let with_mailbox = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&with_mailbox, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::MAILBOX
        );

        let fifo_only = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&fifo_only, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_choose_extent_uses_current() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..resizable_caps(1, 4096)
        };
        let extent = choose_extent(&capabilities, 800, 600).unwrap();
        assert_eq!((extent.width, extent.height), (1920, 1080));
    }

    #[test]
    fn test_choose_extent_clamps_to_limits() {
        let capabilities = resizable_caps(100, 2000);

        let extent = choose_extent(&capabilities, 3000, 3000).unwrap();
        assert_eq!((extent.width, extent.height), (2000, 2000));

        let extent = choose_extent(&capabilities, 50, 50).unwrap();
        assert_eq!((extent.width, extent.height), (100, 100));

        let extent = choose_extent(&capabilities, 800, 600).unwrap();
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn test_minimized_window_yields_no_extent() {
        // min=(2,2), max=(4096,4096), window (0,0): never clamp up to 2x2
        let capabilities = resizable_caps(2, 4096);
        assert!(choose_extent(&capabilities, 0, 0).is_none());
        assert!(choose_extent(&capabilities, 0, 600).is_none());
    }

    #[test]
    fn test_zero_current_extent_yields_no_extent() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 0,
                height: 0,
            },
            ..resizable_caps(0, 4096)
        };
        assert!(choose_extent(&capabilities, 800, 600).is_none());
    }

    #[test]
    fn test_determine_image_count() {
        let capped = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 2,
            ..Default::default()
        };
        assert_eq!(determine_image_count(&capped), 2);

        let roomy = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            ..Default::default()
        };
        assert_eq!(determine_image_count(&roomy), 3);

        let unlimited = vk::SurfaceCapabilitiesKHR {
            min_image_count: 3,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(determine_image_count(&unlimited), 4);
    }

    #[test]
    fn test_swapchain_support_details_is_adequate() {
        let adequate = SwapchainSupportDetails {
            capabilities: vk::SurfaceCapabilitiesKHR::default(),
            formats: vec![vk::SurfaceFormatKHR::default()],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        assert!(adequate.is_adequate());

        let no_modes = SwapchainSupportDetails {
            present_modes: vec![],
            ..adequate.clone()
        };
        assert!(!no_modes.is_adequate());
    }
}
