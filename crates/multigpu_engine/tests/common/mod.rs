//! Fixtures shared by the integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use multigpu_engine::prelude::*;
use multigpu_engine::render::backends::headless::HeadlessBackend;
use multigpu_engine::render::resources::{CompiledShader, ShaderCompiler, ShaderStage};

/// Minimal SPIR-V header
const SPIRV_HEADER: [u32; 5] = [0x0723_0203, 0x0001_0000, 0, 1, 0];

/// Compiler that hands back a canned module for any source
pub struct CannedCompiler;

impl ShaderCompiler for CannedCompiler {
    fn compile(&self, _source: &Path, stage: ShaderStage, entry_point: &str) -> RenderResult<CompiledShader> {
        Ok(CompiledShader {
            stage,
            entry_point: entry_point.to_string(),
            words: Arc::new(SPIRV_HEADER.to_vec()),
        })
    }
}

pub fn context(multi_gpu: bool) -> Arc<EngineContext> {
    let config = EngineConfig::new("integration").with_multi_gpu(multi_gpu);
    Arc::new(
        EngineContext::new(config)
            .expect("engine context")
            .with_shader_compiler(Arc::new(CannedCompiler)),
    )
}

/// Initialized device group over `devices` simulated GPUs
pub fn device_group(devices: usize) -> (DeviceGroup, Arc<HeadlessBackend>) {
    let backend = Arc::new(HeadlessBackend::with_devices(devices));
    let mut group = DeviceGroup::new(backend.clone(), context(true));
    group.enumerate().expect("enumerate");
    group.initialize_devices().expect("initialize devices");
    (group, backend)
}

/// Frame coordinator with one "basic" material registered
pub fn coordinator(devices: usize) -> (FrameCoordinator, Arc<HeadlessBackend>) {
    let backend = Arc::new(HeadlessBackend::with_devices(devices));
    let frames = FrameCoordinator::new(context(true), backend.clone(), Extent2D::new(800, 600))
        .expect("frame coordinator");
    frames
        .create_material("basic", MaterialDesc::new("object.vert", "object.frag"))
        .expect("material");
    (frames, backend)
}
