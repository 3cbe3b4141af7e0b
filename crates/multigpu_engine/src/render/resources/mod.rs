//! Resources replicated across every device of the group

pub mod buffer;
pub mod image;
pub mod material;
pub mod registry;
pub mod replicate;
pub mod shader;
pub mod texture;

pub use buffer::{Buffer, BufferInfo};
pub use image::{Image, ImageInfo};
pub use material::{Material, MaterialDesc, MaterialInfo, TargetFormats};
pub use registry::{BufferRegistry, GpuResource, MaterialRegistry, ResourceRegistry, TextureRegistry};
pub use replicate::{DeviceSlot, Replicated};
pub use shader::{CompiledShader, GlslcCompiler, ShaderCompiler, ShaderStage};
pub use texture::{Texture, TextureInfo, TextureSource};
