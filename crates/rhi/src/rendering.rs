//! Dynamic rendering helpers (Vulkan 1.3).
//!
//! The renderer never creates VkRenderPass objects. A frame's color and depth
//! targets are described with [`ColorAttachment`] and [`DepthAttachment`], and
//! [`RenderingInfoBundle`] keeps the attachment infos alive for as long as the
//! `VkRenderingInfo` that references them.
//!
//! # Example
//!
//! ```no_run
//! use ash::vk;
//! use ember_rhi::rendering::{ColorAttachment, DepthAttachment, RenderingInfoBundle};
//! use ember_rhi::command::CommandBuffer;
//!
//! # fn example(color_view: vk::ImageView, depth_view: vk::ImageView, cmd: &CommandBuffer) {
//! let extent = vk::Extent2D { width: 800, height: 600 };
//! let bundle = RenderingInfoBundle::new(
//!     extent,
//!     ColorAttachment::new(color_view).with_clear_color([0.1, 0.1, 0.1, 1.0]),
//!     Some(DepthAttachment::new(depth_view)),
//! );
//! cmd.begin_rendering(&bundle.info());
//! // ... draw commands ...
//! cmd.end_rendering();
//! # }
//! ```

use ash::vk;

/// Color attachment configuration.
///
/// Defaults to `COLOR_ATTACHMENT_OPTIMAL`, clear on load, store, black clear
/// color.
#[derive(Clone, Copy, Debug)]
pub struct ColorAttachment {
    image_view: vk::ImageView,
    load_op: vk::AttachmentLoadOp,
    clear_color: [f32; 4],
}

impl ColorAttachment {
    /// Creates a cleared color attachment for the given view.
    pub fn new(image_view: vk::ImageView) -> Self {
        Self {
            image_view,
            load_op: vk::AttachmentLoadOp::CLEAR,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }

    /// Sets the clear color.
    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    /// Keeps the previous contents instead of clearing.
    pub fn load(mut self) -> Self {
        self.load_op = vk::AttachmentLoadOp::LOAD;
        self
    }

    /// Returns the configured clear color.
    #[inline]
    pub fn clear_color(&self) -> [f32; 4] {
        self.clear_color
    }

    /// Converts to a Vulkan rendering attachment info.
    pub fn to_rendering_attachment_info(&self) -> vk::RenderingAttachmentInfo<'static> {
        vk::RenderingAttachmentInfo::default()
            .image_view(self.image_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(self.load_op)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            })
    }
}

/// Depth attachment configuration.
///
/// Clears to 1.0 and discards the result after the pass.
#[derive(Clone, Copy, Debug)]
pub struct DepthAttachment {
    image_view: vk::ImageView,
    clear_depth: f32,
}

impl DepthAttachment {
    /// Creates a depth attachment that clears to 1.0.
    pub fn new(image_view: vk::ImageView) -> Self {
        Self {
            image_view,
            clear_depth: 1.0,
        }
    }

    /// Sets the depth clear value.
    pub fn with_clear_depth(mut self, depth: f32) -> Self {
        self.clear_depth = depth;
        self
    }

    /// Converts to a Vulkan rendering attachment info.
    pub fn to_rendering_attachment_info(&self) -> vk::RenderingAttachmentInfo<'static> {
        vk::RenderingAttachmentInfo::default()
            .image_view(self.image_view)
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: self.clear_depth,
                    stencil: 0,
                },
            })
    }
}

/// Owns the attachment infos referenced by a `VkRenderingInfo`.
pub struct RenderingInfoBundle {
    color_attachments: [vk::RenderingAttachmentInfo<'static>; 1],
    depth_attachment: Option<vk::RenderingAttachmentInfo<'static>>,
    render_area: vk::Rect2D,
}

impl RenderingInfoBundle {
    /// Creates a bundle covering the full `extent`.
    pub fn new(
        extent: vk::Extent2D,
        color: ColorAttachment,
        depth: Option<DepthAttachment>,
    ) -> Self {
        Self {
            color_attachments: [color.to_rendering_attachment_info()],
            depth_attachment: depth.map(|d| d.to_rendering_attachment_info()),
            render_area: full_scissor(extent),
        }
    }

    /// Returns the `VkRenderingInfo` referencing this bundle's data.
    pub fn info(&self) -> vk::RenderingInfo<'_> {
        let mut info = vk::RenderingInfo::default()
            .render_area(self.render_area)
            .layer_count(1)
            .color_attachments(&self.color_attachments);

        if let Some(ref depth) = self.depth_attachment {
            info = info.depth_attachment(depth);
        }

        info
    }

    /// Returns whether a depth attachment is present.
    #[inline]
    pub fn has_depth(&self) -> bool {
        self.depth_attachment.is_some()
    }

    /// Returns the render area.
    #[inline]
    pub fn render_area(&self) -> vk::Rect2D {
        self.render_area
    }
}

/// Returns a viewport covering `extent` with depth range `0..1`.
pub fn full_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

/// Returns a scissor rectangle covering `extent`.
pub fn full_scissor(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 1280,
        height: 720,
    };

    #[test]
    fn test_color_attachment_defaults() {
        let info = ColorAttachment::new(vk::ImageView::null()).to_rendering_attachment_info();
        assert_eq!(info.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(info.store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(info.image_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    }

    #[test]
    fn test_color_attachment_clear_color() {
        let attachment =
            ColorAttachment::new(vk::ImageView::null()).with_clear_color([0.2, 0.3, 0.4, 1.0]);
        assert_eq!(attachment.clear_color(), [0.2, 0.3, 0.4, 1.0]);
        let info = attachment.to_rendering_attachment_info();
        assert_eq!(unsafe { info.clear_value.color.float32 }, [0.2, 0.3, 0.4, 1.0]);
    }

    #[test]
    fn test_color_attachment_load() {
        let info = ColorAttachment::new(vk::ImageView::null())
            .load()
            .to_rendering_attachment_info();
        assert_eq!(info.load_op, vk::AttachmentLoadOp::LOAD);
    }

    #[test]
    fn test_depth_attachment_defaults() {
        let info = DepthAttachment::new(vk::ImageView::null()).to_rendering_attachment_info();
        assert_eq!(info.image_layout, vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL);
        assert_eq!(info.store_op, vk::AttachmentStoreOp::DONT_CARE);
        assert_eq!(unsafe { info.clear_value.depth_stencil.depth }, 1.0);
    }

    #[test]
    fn test_bundle_info() {
        let bundle = RenderingInfoBundle::new(
            EXTENT,
            ColorAttachment::new(vk::ImageView::null()),
            Some(DepthAttachment::new(vk::ImageView::null())),
        );
        assert!(bundle.has_depth());
        let info = bundle.info();
        assert_eq!(info.color_attachment_count, 1);
        assert_eq!(info.layer_count, 1);
        assert!(!info.p_depth_attachment.is_null());
        assert_eq!(info.render_area.extent, EXTENT);
    }

    #[test]
    fn test_bundle_without_depth() {
        let bundle =
            RenderingInfoBundle::new(EXTENT, ColorAttachment::new(vk::ImageView::null()), None);
        assert!(!bundle.has_depth());
        assert!(bundle.info().p_depth_attachment.is_null());
    }

    #[test]
    fn test_full_viewport_and_scissor() {
        let viewport = full_viewport(EXTENT);
        assert_eq!(viewport.width, 1280.0);
        assert_eq!(viewport.height, 720.0);
        assert_eq!(viewport.max_depth, 1.0);

        let scissor = full_scissor(EXTENT);
        assert_eq!(scissor.offset.x, 0);
        assert_eq!(scissor.extent, EXTENT);
    }
}
