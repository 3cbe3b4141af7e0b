//! External asset decoding consumed by the renderer

pub mod image_loader;

pub use image_loader::{FileImageLoader, ImageLoader, LoadedImage};
