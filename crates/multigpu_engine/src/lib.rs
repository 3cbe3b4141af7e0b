//! # Multi-GPU Engine
//!
//! Rendering core that drives one or more GPUs as a single device group.
//!
//! ## Features
//!
//! - **Device selection**: scores every adapter and picks a primary plus optional secondaries
//! - **Per-device workers**: every native call for a device runs on that device's own thread
//! - **Replicated resources**: buffers, images, textures and materials exist once per device
//! - **Registries**: identifier-keyed, idempotent resource stores
//! - **Scene orchestration**: material-batched render queue and a lock-step frame loop
//! - **Backends**: Vulkan through `ash` + `vk-mem`, and a headless simulation for tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use multigpu_engine::prelude::*;
//! use multigpu_engine::render::backends::headless::HeadlessBackend;
//!
//! fn main() -> Result<(), RenderError> {
//!     let config = EngineConfig::new("demo").with_multi_gpu(true);
//!     let context = Arc::new(EngineContext::new(config)?);
//!     let backend = Arc::new(HeadlessBackend::with_devices(2));
//!     let mut frames = FrameCoordinator::new(context, backend, Extent2D::new(1280, 720))?;
//!
//!     frames.scene_mut().create_object("cube", MeshData::cube(1.0), "basic", Transform::default())?;
//!     frames.render_frame()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod assets;
pub mod config;
pub mod core;
pub mod foundation;
pub mod render;
pub mod scene;

#[cfg(test)]
pub(crate) mod test_support;

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        assets::{FileImageLoader, ImageLoader, LoadedImage},
        core::{EngineConfig, EngineContext},
        foundation::math::{Mat4, Point3, Vec3},
        render::{
            hal::{Extent2D, GpuBackend},
            resources::{BufferInfo, MaterialDesc, MaterialInfo, TargetFormats, TextureInfo},
            DeviceGroup, FrameCoordinator, FrameStatus, LoopControl, PresentationSurface, RenderError,
            RenderResult, SurfaceEvent,
        },
        scene::{Camera, MeshData, ObjectDesc, SceneOrchestrator, Submesh, Transform, TransformMode},
    };
}
