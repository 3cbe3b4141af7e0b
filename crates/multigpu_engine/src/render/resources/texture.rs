//! Sampled textures: a replicated image plus a replicated sampler

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::assets::{ImageLoader, LoadedImage};
use crate::render::device::LogicalDevice;
use crate::render::error::RenderResult;
use crate::render::hal::{Binding, SamplerDesc, SamplerHandle};
use crate::render::resources::image::{Image, ImageInfo};
use crate::render::resources::registry::GpuResource;
use crate::render::resources::replicate::Replicated;

/// Where a texture's pixels come from
#[derive(Clone)]
pub enum TextureSource {
    /// Decoded pixels
    Pixels(LoadedImage),
    /// File decoded by the given loader
    File {
        /// Image path
        path: PathBuf,
        /// Decoder
        loader: Arc<dyn ImageLoader>,
    },
}

/// Creation parameters of a [`Texture`]
#[derive(Clone)]
pub struct TextureInfo {
    /// Pixel source
    pub source: TextureSource,
    /// Sampling parameters
    pub sampler: SamplerDesc,
}

impl TextureInfo {
    /// Texture from decoded pixels with the default sampler
    pub fn from_pixels(image: LoadedImage) -> Self {
        Self {
            source: TextureSource::Pixels(image),
            sampler: SamplerDesc::default(),
        }
    }

    /// Texture decoded from `path` with the default sampler
    pub fn from_file(path: impl AsRef<Path>, loader: Arc<dyn ImageLoader>) -> Self {
        Self {
            source: TextureSource::File {
                path: path.as_ref().to_path_buf(),
                loader,
            },
            sampler: SamplerDesc::default(),
        }
    }
}

/// Image and sampler on every device
pub struct Texture {
    image: Image,
    samplers: Replicated<SamplerHandle>,
}

impl Texture {
    /// Decode if needed, then replicate image and sampler
    pub fn new(id: &str, info: TextureInfo, devices: &[Arc<LogicalDevice>]) -> RenderResult<Self> {
        let decoded = match info.source {
            TextureSource::Pixels(image) => image,
            TextureSource::File { path, loader } => loader.load(&path)?,
        }
        .into_rgba8()?;

        let image = Image::new(
            id,
            ImageInfo::sampled_rgba8(decoded.width, decoded.height, decoded.pixels),
            devices,
        )?;
        let sampler = info.sampler;
        let samplers = Replicated::build("sampler", id, devices, move |driver| driver.create_sampler(&sampler));

        Ok(Self { image, samplers })
    }

    /// Identifier
    pub fn id(&self) -> &str {
        self.image.id()
    }

    /// Underlying image
    pub fn image(&self) -> &Image {
        &self.image
    }

    /// Binding for device `device_index`, if both halves exist there
    pub fn binding(&self, device_index: usize) -> Option<Binding> {
        Some(Binding::Texture {
            image: self.image.handle(device_index)?,
            sampler: self.samplers.handle(device_index)?,
        })
    }
}

impl GpuResource for Texture {
    const KIND: &'static str = "texture";
    type Info = TextureInfo;

    fn create(id: &str, info: TextureInfo, devices: &[Arc<LogicalDevice>]) -> RenderResult<Self> {
        Self::new(id, info, devices)
    }

    fn identifier(&self) -> &str {
        self.id()
    }

    fn status(&self) -> RenderResult<()> {
        self.image.status()?;
        self.samplers.status()
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        self.samplers.tear_down(|driver, handle| driver.destroy_sampler(handle));
    }
}
