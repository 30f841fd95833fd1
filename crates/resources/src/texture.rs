//! Texture resources decoded with the `image` crate.

use std::sync::Arc;

use ember_renderer::Backend;
use ember_rhi::texture::Texture;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{ResourceError, ResourceResult};
use crate::manager::ResourceManager;
use crate::resource::{Loadable, Resource, ResourceHeader, ResourceKind, UploadStatus};

/// Decoded RGBA8 pixels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rgba8Image {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Rgba8Image {
    /// Checks that `pixels` holds exactly `width * height` texels.
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        let expected = width as usize * height as usize * 4;
        (width > 0 && height > 0 && pixels.len() == expected).then_some(Self {
            width,
            height,
            pixels,
        })
    }
}

/// A sampled 2D texture.
pub struct TextureResource {
    header: ResourceHeader,
    image: Mutex<Option<Rgba8Image>>,
    gpu: RwLock<Option<Arc<Texture>>>,
}

impl TextureResource {
    /// Wraps already decoded pixels.
    pub fn from_image(header: ResourceHeader, image: Rgba8Image) -> Self {
        Self {
            header,
            image: Mutex::new(Some(image)),
            gpu: RwLock::new(None),
        }
    }

    pub fn gpu(&self) -> Option<Arc<Texture>> {
        self.gpu.read().clone()
    }

    /// Width and height, once decoded.
    pub fn size(&self) -> Option<(u32, u32)> {
        if let Some(texture) = self.gpu.read().as_ref() {
            let extent = texture.extent();
            return Some((extent.width, extent.height));
        }
        self.image
            .lock()
            .as_ref()
            .map(|image| (image.width, image.height))
    }
}

impl Resource for TextureResource {
    fn header(&self) -> &ResourceHeader {
        &self.header
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Texture
    }

    fn load(&self, _manager: &ResourceManager) -> ResourceResult<()> {
        let mut image = self.image.lock();
        if image.is_some() {
            return Ok(());
        }

        let decoded = image::open(self.header.path())?.to_rgba8();
        let (width, height) = decoded.dimensions();
        debug!("Decoded {:?}: {}x{}", self.header.path(), width, height);
        *image = Some(
            Rgba8Image::new(width, height, decoded.into_raw()).ok_or_else(|| {
                ResourceError::Load {
                    path: self.header.path().to_path_buf(),
                    message: "image has no pixels".to_string(),
                }
            })?,
        );
        Ok(())
    }

    fn send_to_gpu(&self, backend: &Backend) -> ResourceResult<UploadStatus> {
        let Backend::Vulkan(context) = backend else {
            return Ok(UploadStatus::Uploaded);
        };

        let mut image = self.image.lock();
        if self.gpu.read().is_some() {
            return Ok(UploadStatus::Uploaded);
        }
        let Some(pixels) = image.as_ref() else {
            return Err(ResourceError::Load {
                path: self.header.path().to_path_buf(),
                message: "pixels missing at upload".to_string(),
            });
        };
        let texture = Texture::from_rgba8(
            context.transfer(),
            pixels.width,
            pixels.height,
            &pixels.pixels,
        )?;
        *self.gpu.write() = Some(Arc::new(texture));
        *image = None;
        Ok(UploadStatus::Uploaded)
    }

    fn is_resident(&self) -> bool {
        self.gpu.read().is_some()
    }
}

impl Loadable for TextureResource {
    const KIND: ResourceKind = ResourceKind::Texture;

    fn from_header(header: ResourceHeader) -> Self {
        Self {
            header,
            image: Mutex::new(None),
            gpu: RwLock::new(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgba8_image_checks_length() {
        assert!(Rgba8Image::new(2, 2, vec![0; 16]).is_some());
        assert!(Rgba8Image::new(2, 2, vec![0; 15]).is_none());
        assert!(Rgba8Image::new(0, 2, Vec::new()).is_none());
    }

    #[test]
    fn test_in_memory_texture_reports_size() {
        let header = ResourceHeader::new(uuid::Uuid::nil(), "/mem/white".into());
        let image = Rgba8Image::new(4, 2, vec![255; 32]).unwrap();
        let texture = TextureResource::from_image(header, image);
        assert_eq!(texture.size(), Some((4, 2)));
        assert_eq!(
            texture.send_to_gpu(&Backend::Headless).unwrap(),
            UploadStatus::Uploaded
        );
    }
}
