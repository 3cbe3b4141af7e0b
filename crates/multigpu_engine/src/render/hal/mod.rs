//! Hardware abstraction layer
//!
//! The traits in this module are the seam between the backend-agnostic core
//! (device group, replicated resources, scene) and a concrete native API.
//! [`GpuBackend`] enumerates and opens devices; each opened device is a
//! [`DeviceDriver`] whose methods are only ever invoked from that device's
//! worker thread, with the exception of host-side mapped memory access and
//! command recording into a frame slot the caller owns.

use std::sync::Arc;

use crate::render::capabilities::{CapabilityChain, InstanceSupport};
use crate::render::device::PhysicalDeviceInfo;
use crate::render::error::RenderResult;

slotmap::new_key_type! {
    /// Buffer handle local to one device driver
    pub struct BufferHandle;
    /// Image (with its default view) handle local to one device driver
    pub struct ImageHandle;
    /// Sampler handle local to one device driver
    pub struct SamplerHandle;
    /// Graphics pipeline handle local to one device driver
    pub struct PipelineHandle;
    /// Descriptor set handle local to one device driver
    pub struct BindingSetHandle;
}

bitflags::bitflags! {
    /// How a buffer is consumed by the GPU
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Vertex input
        const VERTEX = 1 << 0;
        /// Index input
        const INDEX = 1 << 1;
        /// Uniform block
        const UNIFORM = 1 << 2;
        /// Storage block
        const STORAGE = 1 << 3;
        /// Copy source
        const TRANSFER_SRC = 1 << 4;
        /// Copy destination
        const TRANSFER_DST = 1 << 5;
    }
}

/// Memory placement of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryMode {
    /// Persistently host-mapped; updates copy straight into the mapping
    Dynamic,
    /// Device-local; filled once through a staging buffer and never updated
    Static,
}

/// Parameters for one per-device buffer
#[derive(Debug, Clone)]
pub struct BufferDesc {
    /// Debug label
    pub label: String,
    /// Size in bytes
    pub size: u64,
    /// GPU usage
    pub usage: BufferUsage,
    /// Memory placement
    pub mode: MemoryMode,
}

/// Texel formats understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    /// 8-bit RGBA, sRGB encoded
    Rgba8Srgb,
    /// 8-bit RGBA, linear
    Rgba8Unorm,
    /// 8-bit BGRA, sRGB encoded (common swapchain format)
    Bgra8Srgb,
    /// 8-bit BGRA, linear
    Bgra8Unorm,
    /// 32-bit float depth
    Depth32Float,
}

impl ImageFormat {
    /// Bytes per texel
    pub fn bytes_per_pixel(self) -> u32 {
        4
    }

    /// Whether this is a depth format
    pub fn is_depth(self) -> bool {
        matches!(self, Self::Depth32Float)
    }
}

/// How an image is consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageUsage {
    /// Sampled from shaders, filled by upload
    Sampled,
    /// Depth attachment
    DepthAttachment,
}

/// Parameters for one per-device image
#[derive(Debug, Clone)]
pub struct ImageDesc {
    /// Debug label
    pub label: String,
    /// Width in texels
    pub width: u32,
    /// Height in texels
    pub height: u32,
    /// Texel format
    pub format: ImageFormat,
    /// Usage
    pub usage: ImageUsage,
}

impl ImageDesc {
    /// Bytes needed for a full upload
    pub fn byte_size(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * u64::from(self.format.bytes_per_pixel())
    }
}

/// Texture filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterMode {
    /// Nearest texel
    Nearest,
    /// Bilinear
    Linear,
}

/// Texture addressing outside [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressMode {
    /// Tile
    Repeat,
    /// Clamp to the edge texel
    ClampToEdge,
}

/// Sampler parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    /// Min/mag filter
    pub filter: FilterMode,
    /// Address mode for all axes
    pub address_mode: AddressMode,
    /// Use anisotropic filtering when the device supports it
    pub anisotropy: bool,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            filter: FilterMode::Linear,
            address_mode: AddressMode::Repeat,
            anisotropy: true,
        }
    }
}

/// Face culling, set dynamically per draw batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullMode {
    /// No culling
    None,
    /// Cull back faces
    Back,
    /// Cull front faces
    Front,
}

/// Graphics pipeline parameters
///
/// Descriptor layout is fixed: binding 0 is the per-object uniform block,
/// bindings `1..=texture_slots` are combined image samplers. The camera
/// view-projection travels as a 64 byte push constant.
#[derive(Debug, Clone)]
pub struct PipelineDesc {
    /// Debug label
    pub label: String,
    /// Vertex stage SPIR-V
    pub vertex_spirv: Arc<Vec<u32>>,
    /// Vertex stage entry point
    pub vertex_entry: String,
    /// Fragment stage SPIR-V
    pub fragment_spirv: Arc<Vec<u32>>,
    /// Fragment stage entry point
    pub fragment_entry: String,
    /// Number of sampled textures
    pub texture_slots: u32,
    /// Color attachment format
    pub color_format: ImageFormat,
    /// Depth attachment format, if depth testing is used
    pub depth_format: Option<ImageFormat>,
    /// Face culling
    pub cull_mode: CullMode,
}

/// One resource bound into a binding set, at the binding index of its position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// Uniform buffer range starting at 0
    Uniform {
        /// Buffer on the same device
        buffer: BufferHandle,
        /// Bound range in bytes
        size: u64,
    },
    /// Combined image sampler
    Texture {
        /// Image on the same device
        image: ImageHandle,
        /// Sampler on the same device
        sampler: SamplerHandle,
    },
}

/// Two-dimensional extent in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2D {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Extent2D {
    /// Create an extent
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether either dimension is zero (minimized window)
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Swapchain creation request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwapchainRequest {
    /// Desired extent; clamped to the surface limits
    pub extent: Extent2D,
    /// Forced format (secondary devices mirror the primary); negotiated when `None`
    pub format: Option<ImageFormat>,
    /// Prefer FIFO over mailbox
    pub vsync: bool,
}

/// Result of swapchain creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainInfo {
    /// Actual extent
    pub extent: Extent2D,
    /// Actual color format
    pub format: ImageFormat,
    /// Number of presentable images
    pub image_count: u32,
}

/// Result of acquiring a presentable image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image is ready for recording
    Acquired {
        /// Swapchain image index
        image_index: u32,
        /// The swapchain still works but no longer matches the surface exactly
        suboptimal: bool,
    },
    /// The swapchain must be recreated before rendering
    OutOfDate,
}

/// Result of submitting and presenting a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// Presented normally
    Presented,
    /// Presented, but the swapchain should be recreated
    Suboptimal,
    /// Not presented; the swapchain must be recreated
    OutOfDate,
}

/// Clear values for the frame attachments
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearValues {
    /// Color attachment clear
    pub color: [f32; 4],
    /// Depth attachment clear
    pub depth: f32,
}

impl Default for ClearValues {
    fn default() -> Self {
        Self {
            color: [0.0, 0.0, 0.0, 1.0],
            depth: 1.0,
        }
    }
}

/// Records draw commands into one frame slot's command buffer
pub trait CommandRecorder {
    /// Bind a graphics pipeline (also applies its dynamic cull mode)
    fn bind_pipeline(&mut self, pipeline: PipelineHandle) -> RenderResult<()>;

    /// Write the vertex-stage push constant block of `pipeline`
    fn push_constants(&mut self, pipeline: PipelineHandle, data: &[u8]) -> RenderResult<()>;

    /// Bind a descriptor set compatible with `pipeline`
    fn bind_binding_set(&mut self, pipeline: PipelineHandle, set: BindingSetHandle) -> RenderResult<()>;

    /// Bind the vertex buffer at binding 0
    fn bind_vertex_buffer(&mut self, buffer: BufferHandle) -> RenderResult<()>;

    /// Bind a `u32` index buffer
    fn bind_index_buffer(&mut self, buffer: BufferHandle) -> RenderResult<()>;

    /// Issue an indexed draw
    fn draw_indexed(&mut self, index_count: u32, first_index: u32);

    /// Close the command buffer
    fn finish(self: Box<Self>) -> RenderResult<()>;
}

/// Native operations of one opened device
///
/// Implementations must be `Send + Sync` so a handle can be shared with the
/// device's worker thread, but every creating/destroying/submitting call is
/// routed through [`crate::render::device::LogicalDevice::execute`].
pub trait DeviceDriver: Send + Sync {
    /// Human-readable device label
    fn label(&self) -> &str;

    /// Create a buffer, optionally filled with `initial_data`
    ///
    /// Dynamic buffers are persistently mapped and filled by copy. Static
    /// buffers are filled through a staging buffer and a one-shot transfer,
    /// waiting for the transfer queue before the staging buffer is destroyed.
    fn create_buffer(&self, desc: &BufferDesc, initial_data: Option<&[u8]>) -> RenderResult<BufferHandle>;

    /// Copy into the persistent mapping of a dynamic buffer
    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> RenderResult<()>;

    /// Read back from the persistent mapping of a dynamic buffer
    fn read_buffer(&self, buffer: BufferHandle, offset: u64, len: u64) -> RenderResult<Vec<u8>>;

    /// Destroy a buffer and free its memory
    fn destroy_buffer(&self, buffer: BufferHandle);

    /// Create an image with a default view, optionally uploading `pixels`
    fn create_image(&self, desc: &ImageDesc, pixels: Option<&[u8]>) -> RenderResult<ImageHandle>;

    /// Destroy an image and its view
    fn destroy_image(&self, image: ImageHandle);

    /// Create a sampler
    fn create_sampler(&self, desc: &SamplerDesc) -> RenderResult<SamplerHandle>;

    /// Destroy a sampler
    fn destroy_sampler(&self, sampler: SamplerHandle);

    /// Build a graphics pipeline
    fn create_pipeline(&self, desc: &PipelineDesc) -> RenderResult<PipelineHandle>;

    /// Destroy a pipeline and its layouts
    fn destroy_pipeline(&self, pipeline: PipelineHandle);

    /// Allocate and write a descriptor set for `pipeline`
    fn create_binding_set(&self, pipeline: PipelineHandle, bindings: &[Binding]) -> RenderResult<BindingSetHandle>;

    /// Free a descriptor set
    fn destroy_binding_set(&self, set: BindingSetHandle);

    /// Create (or replace) the swapchain and its per-image views and depth buffers
    fn create_swapchain(&self, request: &SwapchainRequest) -> RenderResult<SwapchainInfo>;

    /// Destroy the swapchain and everything sized by it
    fn destroy_swapchain(&self);

    /// Recreate fences, semaphores and frame command buffers
    fn recreate_frame_sync(&self, frames_in_flight: usize) -> RenderResult<()>;

    /// Wait for the frame slot's fence and acquire the next image
    fn acquire_frame(&self, frame_slot: usize) -> RenderResult<AcquireOutcome>;

    /// Start recording the frame slot's command buffer targeting `image_index`
    fn begin_commands(
        &self,
        frame_slot: usize,
        image_index: u32,
        clear: &ClearValues,
    ) -> RenderResult<Box<dyn CommandRecorder + '_>>;

    /// Submit the frame slot's commands and present `image_index`
    fn submit_and_present(&self, frame_slot: usize, image_index: u32) -> RenderResult<PresentOutcome>;

    /// Block until the device has no pending GPU work
    fn wait_idle(&self) -> RenderResult<()>;
}

/// Entry point of a native API: enumerates and opens devices
pub trait GpuBackend: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &str;

    /// Layers and extensions the instance was able to offer
    fn instance_support(&self) -> InstanceSupport;

    /// Enumerate physical devices in stable order
    fn enumerate_physical_devices(&self) -> RenderResult<Vec<PhysicalDeviceInfo>>;

    /// Open a logical device on `info` with the given feature chain and extensions
    fn open_device(
        &self,
        info: &PhysicalDeviceInfo,
        features: &CapabilityChain,
        device_extensions: &[String],
    ) -> RenderResult<Arc<dyn DeviceDriver>>;
}
