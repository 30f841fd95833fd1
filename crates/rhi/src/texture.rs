//! Images, samplers and sampled textures.
//!
//! # Overview
//!
//! - [`GpuImage`] wraps a 2D VkImage, its view and gpu-allocator memory
//! - [`Sampler`] wraps VkSampler
//! - [`Texture`] is an image plus sampler, uploaded from RGBA8 pixels
//! - [`layout_transition_masks`] gives the access and stage masks for the
//!   layout transitions the renderer performs
//!
//! Uploads use the same staging pattern as buffers, with two layout
//! transitions around the copy:
//!
//! ```text
//! UNDEFINED -> TRANSFER_DST_OPTIMAL -> (copy) -> SHADER_READ_ONLY_OPTIMAL
//! ```
//!
//! # Example
//!
//! ```no_run
//! use ember_rhi::command::TransferContext;
//! use ember_rhi::texture::Texture;
//!
//! # fn example(transfer: &TransferContext) -> ember_rhi::RhiResult<()> {
//! let checker = [255u8, 255, 255, 255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255, 255];
//! let texture = Texture::from_rgba8(transfer, 2, 2, &checker)?;
//! let placeholder = Texture::placeholder(transfer)?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use tracing::{debug, error};

use crate::buffer::{Buffer, BufferUsage};
use crate::command::TransferContext;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Format used for color textures.
pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// Access and stage masks for an image layout transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Returns the masks for `old -> new`.
///
/// # Errors
///
/// Returns [`RhiError::SyncError`] for transitions the renderer never issues.
pub fn layout_transition_masks(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> RhiResult<TransitionMasks> {
    let masks = match (old, new) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        },
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => {
            TransitionMasks {
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::SHADER_READ,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER
                    | vk::PipelineStageFlags::COMPUTE_SHADER,
            }
        }
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL) => {
            TransitionMasks {
                src_access: vk::AccessFlags::empty(),
                dst_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                src_stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                dst_stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            }
        }
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL) => {
            TransitionMasks {
                src_access: vk::AccessFlags::empty(),
                dst_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                dst_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            }
        }
        (vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, vk::ImageLayout::PRESENT_SRC_KHR) => {
            TransitionMasks {
                src_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                dst_access: vk::AccessFlags::empty(),
                src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                dst_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            }
        }
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::PRESENT_SRC_KHR) => TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::empty(),
            src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        },
        _ => {
            return Err(RhiError::SyncError(format!(
                "unsupported image layout transition {old:?} -> {new:?}"
            )));
        }
    };
    Ok(masks)
}

/// Builds the image barrier for `old -> new` on the first mip and layer.
pub fn layout_barrier(
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> RhiResult<(vk::ImageMemoryBarrier<'static>, TransitionMasks)> {
    let masks = layout_transition_masks(old, new)?;
    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(aspect)
                .level_count(1)
                .layer_count(1),
        )
        .src_access_mask(masks.src_access)
        .dst_access_mask(masks.dst_access);
    Ok((barrier, masks))
}

/// A device-local 2D image with one view.
pub struct GpuImage {
    device: Arc<Device>,
    image: vk::Image,
    view: vk::ImageView,
    allocation: Option<Allocation>,
    format: vk::Format,
    extent: vk::Extent2D,
}

impl GpuImage {
    /// Creates an image, binds GPU-only memory and creates its view.
    ///
    /// # Errors
    ///
    /// Returns an error for a zero extent or if any creation step fails;
    /// objects created before the failure are released.
    pub fn new(
        device: Arc<Device>,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
        name: &str,
    ) -> RhiResult<Self> {
        if extent.width == 0 || extent.height == 0 {
            return Err(RhiError::ZeroExtent);
        }

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.handle().create_image(&image_info, None)? };
        let requirements = unsafe { device.handle().get_image_memory_requirements(image) };

        let allocation = device.allocator().lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.handle().destroy_image(image, None) };
                return Err(e.into());
            }
        };

        // Drop now releases the image and allocation; the view is still null.
        let mut gpu_image = Self {
            device,
            image,
            view: vk::ImageView::null(),
            allocation: Some(allocation),
            format,
            extent,
        };

        if let Some(allocation) = gpu_image.allocation.as_ref() {
            unsafe {
                gpu_image.device.handle().bind_image_memory(
                    image,
                    allocation.memory(),
                    allocation.offset(),
                )?;
            }
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect)
                    .level_count(1)
                    .layer_count(1),
            );
        gpu_image.view = unsafe { gpu_image.device.handle().create_image_view(&view_info, None)? };

        debug!(
            "Created image '{}': {}x{} ({:?})",
            name, extent.width, extent.height, format
        );
        Ok(gpu_image)
    }

    #[inline]
    pub fn image(&self) -> vk::Image {
        self.image
    }

    #[inline]
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.device.handle().destroy_image_view(self.view, None);
            }
            self.device.handle().destroy_image(self.image, None);
        }

        if let Some(allocation) = self.allocation.take()
            && let Err(e) = self.device.allocator().lock().free(allocation)
        {
            error!("Failed to free image allocation: {:?}", e);
        }
    }
}

/// Vulkan sampler wrapper.
pub struct Sampler {
    device: Arc<Device>,
    sampler: vk::Sampler,
}

impl Sampler {
    /// Creates a linear, repeating sampler; anisotropic when the device
    /// enabled it.
    ///
    /// # Errors
    ///
    /// Returns an error if sampler creation fails.
    pub fn linear(device: Arc<Device>) -> RhiResult<Self> {
        let anisotropy = device.supports_anisotropy();
        let max_anisotropy = device.limits().max_sampler_anisotropy.min(16.0);

        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(anisotropy)
            .max_anisotropy(if anisotropy { max_anisotropy } else { 1.0 })
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .max_lod(vk::LOD_CLAMP_NONE);

        let sampler = unsafe { device.handle().create_sampler(&create_info, None)? };
        Ok(Self { device, sampler })
    }

    #[inline]
    pub fn handle(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_sampler(self.sampler, None);
        }
    }
}

/// Checks that `pixels` holds exactly `width * height` RGBA8 texels.
pub fn validate_rgba8(width: u32, height: u32, pixels: &[u8]) -> RhiResult<()> {
    if width == 0 || height == 0 {
        return Err(RhiError::ZeroExtent);
    }
    let expected = width as u64 * height as u64 * 4;
    if pixels.len() as u64 != expected {
        return Err(RhiError::InvalidHandle(format!(
            "{}x{} RGBA8 texture needs {} bytes, got {}",
            width,
            height,
            expected,
            pixels.len()
        )));
    }
    Ok(())
}

/// A sampled 2D texture in SHADER_READ_ONLY_OPTIMAL layout.
pub struct Texture {
    image: GpuImage,
    sampler: Sampler,
}

impl Texture {
    /// Uploads RGBA8 pixels into a new device-local texture.
    ///
    /// Blocks until the upload has completed; the staging buffer is released
    /// on every path.
    ///
    /// # Errors
    ///
    /// Returns an error if the pixel count does not match the extent or any
    /// creation or submission step fails.
    pub fn from_rgba8(
        transfer: &TransferContext,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> RhiResult<Self> {
        validate_rgba8(width, height, pixels)?;
        let device = transfer.device().clone();

        let staging = Buffer::new(device.clone(), BufferUsage::Staging, pixels.len() as u64)?;
        staging.write_data(0, pixels)?;

        let image = GpuImage::new(
            device.clone(),
            vk::Extent2D { width, height },
            TEXTURE_FORMAT,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
            "texture",
        )?;

        let (to_transfer, to_transfer_masks) = layout_barrier(
            image.image(),
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;
        let (to_shader, to_shader_masks) = layout_barrier(
            image.image(),
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;

        transfer.immediate(|cmd| {
            cmd.image_barrier(
                to_transfer_masks.src_stage,
                to_transfer_masks.dst_stage,
                &[to_transfer],
            );
            let region = vk::BufferImageCopy::default()
                .image_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .layer_count(1),
                )
                .image_extent(vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                });
            cmd.copy_buffer_to_image(
                staging.handle(),
                image.image(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
            cmd.image_barrier(to_shader_masks.src_stage, to_shader_masks.dst_stage, &[to_shader]);
            Ok(())
        })?;
        drop(staging);

        let sampler = Sampler::linear(device)?;
        debug!("Uploaded {}x{} texture", width, height);
        Ok(Self { image, sampler })
    }

    /// A 1x1 opaque white texture bound wherever a sampler has no texture.
    ///
    /// # Errors
    ///
    /// Returns an error if the upload fails.
    pub fn placeholder(transfer: &TransferContext) -> RhiResult<Self> {
        Self::from_rgba8(transfer, 1, 1, &[255, 255, 255, 255])
    }

    #[inline]
    pub fn image(&self) -> &GpuImage {
        &self.image
    }

    #[inline]
    pub fn sampler(&self) -> vk::Sampler {
        self.sampler.handle()
    }

    /// Descriptor info for a combined image sampler binding.
    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo::default()
            .sampler(self.sampler.handle())
            .image_view(self.image.view())
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.image.extent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_transitions() {
        let to_transfer = layout_transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert_eq!(to_transfer.src_access, vk::AccessFlags::empty());
        assert_eq!(to_transfer.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_transfer.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(to_transfer.dst_stage, vk::PipelineStageFlags::TRANSFER);

        let to_shader = layout_transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(to_shader.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_shader.dst_access, vk::AccessFlags::SHADER_READ);
        assert!(to_shader.dst_stage.contains(vk::PipelineStageFlags::FRAGMENT_SHADER));
    }

    #[test]
    fn test_present_transition_waits_for_color_writes() {
        let masks = layout_transition_masks(
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        )
        .unwrap();
        assert_eq!(masks.src_access, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
        assert_eq!(masks.dst_stage, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
    }

    #[test]
    fn test_uncleared_image_can_be_presented() {
        let masks =
            layout_transition_masks(vk::ImageLayout::UNDEFINED, vk::ImageLayout::PRESENT_SRC_KHR)
                .unwrap();
        assert_eq!(masks.src_stage, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert!(masks.dst_access.is_empty());
    }

    #[test]
    fn test_unsupported_transition_rejected() {
        assert!(matches!(
            layout_transition_masks(
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageLayout::UNDEFINED
            ),
            Err(RhiError::SyncError(_))
        ));
    }

    #[test]
    fn test_layout_barrier_fields() {
        let (barrier, _) = layout_barrier(
            vk::Image::null(),
            vk::ImageAspectFlags::DEPTH,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        )
        .unwrap();
        assert_eq!(barrier.new_layout, vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL);
        assert_eq!(barrier.subresource_range.aspect_mask, vk::ImageAspectFlags::DEPTH);
        assert_eq!(barrier.subresource_range.layer_count, 1);
    }

    #[test]
    fn test_validate_rgba8() {
        assert!(validate_rgba8(2, 2, &[0; 16]).is_ok());
        assert!(matches!(validate_rgba8(0, 2, &[]), Err(RhiError::ZeroExtent)));
        assert!(validate_rgba8(2, 2, &[0; 15]).is_err());
    }
}
