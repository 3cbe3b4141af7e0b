//! Replicated GPU images

use std::sync::Arc;

use crate::render::device::LogicalDevice;
use crate::render::error::{RenderError, RenderResult};
use crate::render::hal::{ImageDesc, ImageFormat, ImageHandle, ImageUsage};
use crate::render::resources::registry::GpuResource;
use crate::render::resources::replicate::Replicated;

/// Creation parameters of an [`Image`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// Width in texels
    pub width: u32,
    /// Height in texels
    pub height: u32,
    /// Texel format
    pub format: ImageFormat,
    /// Usage
    pub usage: ImageUsage,
    /// Pixels uploaded at creation (tightly packed, full image)
    pub pixels: Option<Vec<u8>>,
}

impl ImageInfo {
    /// Sampled RGBA8 sRGB image filled with `pixels`
    pub fn sampled_rgba8(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format: ImageFormat::Rgba8Srgb,
            usage: ImageUsage::Sampled,
            pixels: Some(pixels),
        }
    }
}

/// One logical image with an instance (and default view) on every device
pub struct Image {
    width: u32,
    height: u32,
    format: ImageFormat,
    instances: Replicated<ImageHandle>,
}

impl Image {
    /// Create and upload the image on every device
    pub fn new(id: &str, info: ImageInfo, devices: &[Arc<LogicalDevice>]) -> RenderResult<Self> {
        let desc = ImageDesc {
            label: id.to_string(),
            width: info.width,
            height: info.height,
            format: info.format,
            usage: info.usage,
        };
        if info.width == 0 || info.height == 0 {
            return Err(RenderError::InvalidArgument(format!("image '{}' has an empty extent", id)));
        }
        if let Some(pixels) = &info.pixels {
            if pixels.len() as u64 != desc.byte_size() {
                return Err(RenderError::InvalidArgument(format!(
                    "image '{}' expects {} bytes of pixels, got {}",
                    id,
                    desc.byte_size(),
                    pixels.len()
                )));
            }
        }

        let pixels = info.pixels.map(Arc::new);
        let instances = Replicated::build("image", id, devices, move |driver| {
            driver.create_image(&desc, pixels.as_ref().map(|p| p.as_slice()))
        });

        Ok(Self {
            width: info.width,
            height: info.height,
            format: info.format,
            instances,
        })
    }

    /// Identifier
    pub fn id(&self) -> &str {
        self.instances.id()
    }

    /// Width and height
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Texel format
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// Whether every device holds an instance
    pub fn is_ready(&self) -> bool {
        self.instances.is_ready()
    }

    /// Number of per-device instances
    pub fn device_count(&self) -> usize {
        self.instances.device_count()
    }

    /// Native handle on device `device_index`
    pub fn handle(&self, device_index: usize) -> Option<ImageHandle> {
        self.instances.handle(device_index)
    }
}

impl GpuResource for Image {
    const KIND: &'static str = "image";
    type Info = ImageInfo;

    fn create(id: &str, info: ImageInfo, devices: &[Arc<LogicalDevice>]) -> RenderResult<Self> {
        Self::new(id, info, devices)
    }

    fn identifier(&self) -> &str {
        self.id()
    }

    fn status(&self) -> RenderResult<()> {
        self.instances.status()
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        self.instances.tear_down(|driver, handle| driver.destroy_image(handle));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::headless::ResourceKind;
    use crate::test_support::TestRig;

    #[test]
    fn test_image_replicated_and_released() {
        let rig = TestRig::new(2);
        let image = Image::new("checker", ImageInfo::sampled_rgba8(2, 2, vec![255; 16]), rig.devices()).unwrap();
        assert!(image.is_ready());
        assert_eq!(image.device_count(), 2);

        drop(image);
        for index in 0..2 {
            assert_eq!(rig.headless(index).created(ResourceKind::Image), 1);
            assert_eq!(rig.headless(index).destroyed(ResourceKind::Image), 1);
        }
    }

    #[test]
    fn test_pixel_size_checked() {
        let rig = TestRig::new(1);
        assert!(Image::new("bad", ImageInfo::sampled_rgba8(2, 2, vec![0; 3]), rig.devices()).is_err());
        assert!(Image::new("empty", ImageInfo::sampled_rgba8(0, 2, vec![]), rig.devices()).is_err());
    }
}
