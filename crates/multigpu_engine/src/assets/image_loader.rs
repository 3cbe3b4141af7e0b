//! Image loading for texture data
//!
//! The renderer treats decoding as a black box behind [`ImageLoader`]; the
//! default [`FileImageLoader`] uses the `image` crate and always hands back
//! RGBA8 pixels.

use std::path::Path;

use crate::render::error::{RenderError, RenderResult};

/// Decoded pixels ready for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    /// Tightly packed pixel data
    pub pixels: Vec<u8>,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Channels per pixel
    pub channels: u8,
}

impl LoadedImage {
    /// A solid color RGBA8 image
    pub fn solid_color(width: u32, height: u32, color: [u8; 4]) -> Self {
        let pixel_count = width as usize * height as usize;
        Self {
            pixels: color.repeat(pixel_count),
            width,
            height,
            channels: 4,
        }
    }

    /// Size of the pixel data in bytes
    pub fn size_bytes(&self) -> usize {
        self.pixels.len()
    }

    /// Convert 1-, 2- and 3-channel data to RGBA8
    pub fn into_rgba8(self) -> RenderResult<Self> {
        let expected = self.width as usize * self.height as usize * usize::from(self.channels);
        if self.pixels.len() != expected {
            return Err(RenderError::ImageLoad(format!(
                "{}x{}x{} image has {} bytes",
                self.width,
                self.height,
                self.channels,
                self.pixels.len()
            )));
        }
        let pixels = match self.channels {
            4 => self.pixels,
            3 => self.pixels.chunks_exact(3).flat_map(|p| [p[0], p[1], p[2], 255]).collect(),
            2 => self.pixels.chunks_exact(2).flat_map(|p| [p[0], p[0], p[0], p[1]]).collect(),
            1 => self.pixels.iter().flat_map(|&g| [g, g, g, 255]).collect(),
            n => return Err(RenderError::ImageLoad(format!("unsupported channel count {}", n))),
        };
        Ok(Self {
            pixels,
            width: self.width,
            height: self.height,
            channels: 4,
        })
    }
}

/// Decodes an image file
pub trait ImageLoader: Send + Sync {
    /// Load `path`, or fail with a diagnostic
    fn load(&self, path: &Path) -> RenderResult<LoadedImage>;
}

/// Loader backed by the `image` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct FileImageLoader;

impl FileImageLoader {
    /// Decode an in-memory encoded image
    pub fn load_from_memory(bytes: &[u8]) -> RenderResult<LoadedImage> {
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| RenderError::ImageLoad(format!("failed to decode image from memory: {}", e)))?;
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        Ok(LoadedImage {
            pixels: rgba.into_raw(),
            width,
            height,
            channels: 4,
        })
    }
}

impl ImageLoader for FileImageLoader {
    fn load(&self, path: &Path) -> RenderResult<LoadedImage> {
        log::debug!("Loading image from {:?}", path);
        let decoded = image::open(path)
            .map_err(|e| RenderError::ImageLoad(format!("{}: {}", path.display(), e)))?;
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        log::info!("Loaded image {}x{} from {:?}", width, height, path);
        Ok(LoadedImage {
            pixels: rgba.into_raw(),
            width,
            height,
            channels: 4,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solid_color() {
        let image = LoadedImage::solid_color(4, 4, [255, 0, 0, 255]);
        assert_eq!(image.size_bytes(), 64);
        assert_eq!(&image.pixels[0..4], &[255, 0, 0, 255]);
    }

    #[test]
    fn test_rgb_expands_to_rgba() {
        let rgb = LoadedImage {
            pixels: vec![10, 20, 30, 40, 50, 60],
            width: 2,
            height: 1,
            channels: 3,
        };
        let rgba = rgb.into_rgba8().unwrap();
        assert_eq!(rgba.channels, 4);
        assert_eq!(rgba.pixels, vec![10, 20, 30, 255, 40, 50, 60, 255]);
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let broken = LoadedImage {
            pixels: vec![0; 5],
            width: 2,
            height: 1,
            channels: 3,
        };
        assert!(broken.into_rgba8().is_err());
    }

    #[test]
    fn test_missing_file() {
        let result = FileImageLoader.load(Path::new("does/not/exist.png"));
        assert!(matches!(result, Err(RenderError::ImageLoad(_))));
    }

    #[test]
    fn test_decode_png_from_memory() {
        let mut encoded = Vec::new();
        let source = image::RgbImage::from_pixel(2, 2, image::Rgb([1, 2, 3]));
        source
            .write_to(&mut std::io::Cursor::new(&mut encoded), image::ImageFormat::Png)
            .unwrap();
        let loaded = FileImageLoader::load_from_memory(&encoded).unwrap();
        assert_eq!((loaded.width, loaded.height, loaded.channels), (2, 2, 4));
        assert_eq!(&loaded.pixels[0..4], &[1, 2, 3, 255]);
    }
}
