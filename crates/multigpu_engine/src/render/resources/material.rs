//! Materials: shader pair plus fixed-function state, one pipeline per device
//!
//! A material starts uninitialized. [`Material::initialize`] compiles its
//! shaders through the external compiler and fans pipeline creation out to
//! every device; until then entities using it are skipped when drawing.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::core::ShaderConfig;
use crate::render::device::LogicalDevice;
use crate::render::error::RenderResult;
use crate::render::hal::{CullMode, ImageFormat, PipelineDesc, PipelineHandle};
use crate::render::resources::registry::GpuResource;
use crate::render::resources::replicate::Replicated;
use crate::render::resources::shader::{CompiledShader, ShaderCompiler, ShaderStage};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Shader sources and fixed-function state of a material
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterialDesc {
    /// Vertex shader source (resolved against the shader search dirs)
    pub vertex_shader: PathBuf,
    /// Fragment shader source
    pub fragment_shader: PathBuf,
    /// Vertex entry point
    pub vertex_entry: String,
    /// Fragment entry point
    pub fragment_entry: String,
    /// Number of sampled textures bound after the object uniforms
    pub texture_slots: u32,
    /// Face culling
    pub cull_mode: CullMode,
    /// Depth testing
    pub depth_test: bool,
}

impl MaterialDesc {
    /// Untextured material with back-face culling and depth testing
    pub fn new(vertex_shader: impl Into<PathBuf>, fragment_shader: impl Into<PathBuf>) -> Self {
        Self {
            vertex_shader: vertex_shader.into(),
            fragment_shader: fragment_shader.into(),
            vertex_entry: "main".to_string(),
            fragment_entry: "main".to_string(),
            texture_slots: 0,
            cull_mode: CullMode::Back,
            depth_test: true,
        }
    }

    /// Set the number of sampled textures
    pub fn with_textures(mut self, slots: u32) -> Self {
        self.texture_slots = slots;
        self
    }

    /// Set face culling
    pub fn with_cull_mode(mut self, cull_mode: CullMode) -> Self {
        self.cull_mode = cull_mode;
        self
    }
}

/// Attachment formats pipelines render into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetFormats {
    /// Color attachment
    pub color: ImageFormat,
    /// Depth attachment
    pub depth: Option<ImageFormat>,
}

impl Default for TargetFormats {
    fn default() -> Self {
        Self {
            color: ImageFormat::Bgra8Srgb,
            depth: Some(ImageFormat::Depth32Float),
        }
    }
}

/// Creation parameters of a [`Material`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterialInfo {
    /// Shaders and state
    pub desc: MaterialDesc,
    /// Attachment formats
    pub targets: TargetFormats,
}

/// Lazily compiled material with a pipeline on every device
pub struct Material {
    id: String,
    instance: u64,
    desc: MaterialDesc,
    targets: TargetFormats,
    devices: Vec<Arc<LogicalDevice>>,
    pipelines: Mutex<Option<Replicated<PipelineHandle>>>,
    initializing: Mutex<()>,
    initialized: AtomicBool,
}

impl Material {
    /// Uninitialized material for `devices`
    pub fn new(id: &str, info: MaterialInfo, devices: &[Arc<LogicalDevice>]) -> Self {
        Self {
            id: id.to_string(),
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            desc: info.desc,
            targets: info.targets,
            devices: devices.to_vec(),
            pipelines: Mutex::new(None),
            initializing: Mutex::new(()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Process-unique instance number; differs between materials that reuse an identifier
    pub fn instance_id(&self) -> u64 {
        self.instance
    }

    /// Shaders and state
    pub fn desc(&self) -> &MaterialDesc {
        &self.desc
    }

    /// Sampled texture count
    pub fn texture_slots(&self) -> u32 {
        self.desc.texture_slots
    }

    /// Whether pipelines exist on every device
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Pipeline on device `device_index`; `None` until initialized
    pub fn pipeline(&self, device_index: usize) -> Option<PipelineHandle> {
        if !self.is_initialized() {
            return None;
        }
        self.pipelines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|pipelines| pipelines.handle(device_index))
    }

    /// Compile both stages and build the pipelines; no-op once initialized
    pub fn initialize(&self, compiler: &dyn ShaderCompiler, shaders: &ShaderConfig) -> RenderResult<()> {
        if self.is_initialized() {
            return Ok(());
        }
        let vertex = compiler.compile(
            &shaders.resolve(&self.desc.vertex_shader),
            ShaderStage::Vertex,
            &self.desc.vertex_entry,
        )?;
        let fragment = compiler.compile(
            &shaders.resolve(&self.desc.fragment_shader),
            ShaderStage::Fragment,
            &self.desc.fragment_entry,
        )?;
        self.initialize_with(vertex, fragment)
    }

    /// Build the pipelines from already compiled stages
    ///
    /// Pipelines left over from a failed attempt are destroyed first.
    pub fn initialize_with(&self, vertex: CompiledShader, fragment: CompiledShader) -> RenderResult<()> {
        let _guard = self.initializing.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_initialized() {
            return Ok(());
        }

        let previous = self.pipelines.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut previous) = previous {
            log::debug!("Discarding partial pipelines of material '{}'", self.id);
            previous.tear_down(|driver, handle| driver.destroy_pipeline(handle));
        }

        let desc = PipelineDesc {
            label: self.id.clone(),
            vertex_spirv: vertex.words,
            vertex_entry: vertex.entry_point,
            fragment_spirv: fragment.words,
            fragment_entry: fragment.entry_point,
            texture_slots: self.desc.texture_slots,
            color_format: self.targets.color,
            depth_format: if self.desc.depth_test { self.targets.depth } else { None },
            cull_mode: self.desc.cull_mode,
        };
        let pipelines = Replicated::build("material", &self.id, &self.devices, move |driver| {
            driver.create_pipeline(&desc)
        });
        let status = pipelines.status();
        *self.pipelines.lock().unwrap_or_else(PoisonError::into_inner) = Some(pipelines);

        if status.is_ok() {
            self.initialized.store(true, Ordering::Release);
            log::info!("Material '{}' initialized on {} device(s)", self.id, self.devices.len());
        }
        status
    }
}

impl GpuResource for Material {
    const KIND: &'static str = "material";
    type Info = MaterialInfo;

    fn create(id: &str, info: MaterialInfo, devices: &[Arc<LogicalDevice>]) -> RenderResult<Self> {
        Ok(Self::new(id, info, devices))
    }

    fn identifier(&self) -> &str {
        self.id()
    }

    fn status(&self) -> RenderResult<()> {
        match self.pipelines.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(pipelines) => pipelines.status(),
            None => Ok(()),
        }
    }
}

impl Drop for Material {
    fn drop(&mut self) {
        let pipelines = self.pipelines.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut pipelines) = pipelines {
            pipelines.tear_down(|driver, handle| driver.destroy_pipeline(handle));
        }
    }
}

impl std::fmt::Debug for Material {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Material")
            .field("id", &self.id)
            .field("instance", &self.instance)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
