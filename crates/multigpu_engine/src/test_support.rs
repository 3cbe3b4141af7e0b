//! Shared fixtures for unit tests

use std::path::Path;
use std::sync::Arc;

use crate::core::{EngineConfig, EngineContext, ShaderConfig};
use crate::render::backends::headless::{HeadlessBackend, HeadlessDevice, RecordedCommand};
use crate::render::device::{DeviceGroup, LogicalDevice};
use crate::render::error::{RenderError, RenderResult};
use crate::render::hal::{AcquireOutcome, ClearValues, CommandRecorder, DeviceDriver, Extent2D, GpuBackend};
use crate::render::resources::{
    BufferRegistry, CompiledShader, Material, MaterialDesc, MaterialInfo, MaterialRegistry, ShaderCompiler,
    ShaderStage, TargetFormats, TextureRegistry,
};

/// SPIR-V magic followed by a minimal header
const FAKE_SPIRV: [u32; 5] = [0x0723_0203, 0x0001_0000, 0, 1, 0];

/// Shader compiler returning canned SPIR-V, or always failing
#[derive(Debug, Default)]
pub(crate) struct FakeCompiler {
    fail: bool,
}

impl FakeCompiler {
    pub(crate) fn failing() -> Self {
        Self { fail: true }
    }
}

impl ShaderCompiler for FakeCompiler {
    fn compile(&self, source: &Path, stage: ShaderStage, entry_point: &str) -> RenderResult<CompiledShader> {
        if self.fail {
            return Err(RenderError::ShaderCompilation {
                path: source.display().to_string(),
                diagnostics: "error: simulated failure".to_string(),
            });
        }
        Ok(CompiledShader {
            stage,
            entry_point: entry_point.to_string(),
            words: Arc::new(FAKE_SPIRV.to_vec()),
        })
    }
}

/// Headless device group with a swapchain and empty registries
pub(crate) struct TestRig {
    buffers: Arc<BufferRegistry>,
    materials: Arc<MaterialRegistry>,
    textures: Arc<TextureRegistry>,
    group: DeviceGroup,
    backend: Arc<HeadlessBackend>,
    context: Arc<EngineContext>,
}

impl TestRig {
    pub(crate) fn new(device_count: usize) -> Self {
        let backend = Arc::new(HeadlessBackend::with_devices(device_count));
        let config = EngineConfig::new("test").with_multi_gpu(true);
        let context = Arc::new(
            EngineContext::new(config)
                .expect("context")
                .with_shader_compiler(Arc::new(FakeCompiler::default())),
        );
        let mut group = DeviceGroup::new(Arc::clone(&backend) as Arc<dyn GpuBackend>, Arc::clone(&context));
        group.enumerate().expect("enumerate");
        group.initialize_devices().expect("initialize");
        group.create_swapchain(Extent2D::new(800, 600)).expect("swapchain");

        Self {
            buffers: Arc::new(BufferRegistry::new(group.devices())),
            materials: Arc::new(MaterialRegistry::new(group.devices())),
            textures: Arc::new(TextureRegistry::new(group.devices())),
            group,
            backend,
            context,
        }
    }

    pub(crate) fn devices(&self) -> &[Arc<LogicalDevice>] {
        self.group.devices()
    }

    pub(crate) fn headless(&self, physical_index: usize) -> Arc<HeadlessDevice> {
        self.backend.device(physical_index).expect("headless device")
    }

    pub(crate) fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    pub(crate) fn buffers(&self) -> Arc<BufferRegistry> {
        Arc::clone(&self.buffers)
    }

    pub(crate) fn materials(&self) -> Arc<MaterialRegistry> {
        Arc::clone(&self.materials)
    }

    pub(crate) fn textures(&self) -> Arc<TextureRegistry> {
        Arc::clone(&self.textures)
    }

    /// Register an untextured material, optionally compiling it
    pub(crate) fn material(&self, id: &str, initialized: bool) -> Arc<Material> {
        let info = MaterialInfo {
            desc: MaterialDesc::new("object.vert", "object.frag"),
            targets: TargetFormats::default(),
        };
        let material = self.materials.create(id, info).expect("material");
        if initialized {
            material
                .initialize(&FakeCompiler::default(), &ShaderConfig::default())
                .expect("initialize");
        }
        material
    }

    /// Open a recorder for frame slot 0 on one device
    pub(crate) fn frame_recorder(&self, device_index: usize) -> FrameRecorder<'_> {
        let device = self
            .devices()
            .iter()
            .find(|d| d.index() == device_index)
            .expect("device");
        let driver = device.driver();
        let image_index = match driver.acquire_frame(0).expect("acquire") {
            AcquireOutcome::Acquired { image_index, .. } => image_index,
            AcquireOutcome::OutOfDate => panic!("swapchain out of date"),
        };
        let recorder = driver
            .begin_commands(0, image_index, &ClearValues::default())
            .expect("begin");
        FrameRecorder {
            driver,
            headless: self.headless(device_index),
            image_index,
            recorder: Some(recorder),
        }
    }
}

/// One frame's command recording against a headless device
pub(crate) struct FrameRecorder<'a> {
    driver: &'a dyn DeviceDriver,
    headless: Arc<HeadlessDevice>,
    image_index: u32,
    recorder: Option<Box<dyn CommandRecorder + 'a>>,
}

impl FrameRecorder<'_> {
    pub(crate) fn recorder(&mut self) -> &mut dyn CommandRecorder {
        &mut **self.recorder.as_mut().expect("recorder finished")
    }

    /// Finish, submit and return the recorded commands
    pub(crate) fn finish(mut self) -> Vec<RecordedCommand> {
        self.recorder.take().expect("recorder finished").finish().expect("finish");
        self.driver.submit_and_present(0, self.image_index).expect("present");
        self.headless.last_frame_commands()
    }
}
