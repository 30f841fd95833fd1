//! Depth buffer management.
//!
//! The depth buffer is a device-local D32 image sized to the swapchain. It is
//! rebuilt whenever the swapchain is recreated.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ash::vk;
//! use ember_rhi::device::Device;
//! use ember_renderer::depth_buffer::DepthBuffer;
//!
//! # fn example(device: Arc<Device>) -> ember_rhi::RhiResult<()> {
//! let depth_buffer = DepthBuffer::new(device, vk::Extent2D { width: 1920, height: 1080 })?;
//! let _view = depth_buffer.image_view();
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::info;

use ember_rhi::RhiResult;
use ember_rhi::device::Device;
use ember_rhi::texture::{GpuImage, TransitionMasks, layout_barrier};

/// Default depth buffer format (32-bit floating point).
pub const DEFAULT_DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Depth attachment for the frame's dynamic-rendering scope.
pub struct DepthBuffer {
    image: GpuImage,
}

impl DepthBuffer {
    /// Creates a depth buffer with [`DEFAULT_DEPTH_FORMAT`].
    ///
    /// # Errors
    ///
    /// Returns [`ember_rhi::RhiError::ZeroExtent`] for a zero extent, or an
    /// error if image creation fails.
    pub fn new(device: Arc<Device>, extent: vk::Extent2D) -> RhiResult<Self> {
        let image = GpuImage::new(
            device,
            extent,
            DEFAULT_DEPTH_FORMAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
            "depth buffer",
        )?;

        info!(
            "Depth buffer created: {}x{}",
            extent.width, extent.height
        );

        Ok(Self { image })
    }

    /// Barrier moving the image from `UNDEFINED` to depth-attachment layout.
    ///
    /// The previous contents are discarded each frame, so the old layout is
    /// always `UNDEFINED`.
    pub fn begin_frame_barrier(&self) -> RhiResult<(vk::ImageMemoryBarrier<'static>, TransitionMasks)> {
        layout_barrier(
            self.image.image(),
            vk::ImageAspectFlags::DEPTH,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        )
    }

    #[inline]
    pub fn image(&self) -> vk::Image {
        self.image.image()
    }

    #[inline]
    pub fn image_view(&self) -> vk::ImageView {
        self.image.view()
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.image.format()
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.image.extent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_rhi::texture::layout_transition_masks;

    #[test]
    fn test_default_depth_format() {
        assert_eq!(DEFAULT_DEPTH_FORMAT, vk::Format::D32_SFLOAT);
    }

    #[test]
    fn test_depth_transition_targets_fragment_tests() {
        let masks = layout_transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        )
        .unwrap();
        assert!(
            masks
                .dst_access
                .contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
        );
        assert!(
            masks
                .dst_stage
                .contains(vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS)
        );
    }
}
