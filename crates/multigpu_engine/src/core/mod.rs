//! Engine core: configuration, the shared engine context and CPU-side scheduling

pub mod config;
pub mod context;
pub mod thread_pool;

pub use config::{EngineConfig, DeviceConfig, RendererConfig, ThreadingConfig, ShaderConfig};
pub use context::EngineContext;
pub use thread_pool::{ThreadPool, JobHandle};
