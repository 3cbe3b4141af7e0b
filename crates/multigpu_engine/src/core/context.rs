//! Shared engine context
//!
//! Built once at startup and handed to every component as `Arc<EngineContext>`
//! instead of process-wide singletons.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::assets::{FileImageLoader, ImageLoader};
use crate::core::config::EngineConfig;
use crate::core::thread_pool::ThreadPool;
use crate::render::capabilities::Capabilities;
use crate::render::error::RenderResult;
use crate::render::resources::shader::{GlslcCompiler, ShaderCompiler};

/// Configuration, capability lists, CPU pool and external collaborators
pub struct EngineContext {
    config: EngineConfig,
    capabilities: RwLock<Capabilities>,
    thread_pool: ThreadPool,
    shader_compiler: Arc<dyn ShaderCompiler>,
    image_loader: Arc<dyn ImageLoader>,
}

impl EngineContext {
    /// Validate `config` and build the default collaborators
    pub fn new(config: EngineConfig) -> RenderResult<Self> {
        config.validate()?;

        // Only the primary's worker is known before devices are opened
        let pool_size = ThreadPool::recommended_size(
            config.threading.pool_fraction,
            1,
            config.threading.min_pool_threads,
        );

        log::info!(
            "Engine context for '{}': {} CPU pool threads, multi-GPU {}",
            config.application_name,
            pool_size,
            if config.devices.multi_gpu { "on" } else { "off" }
        );

        Ok(Self {
            capabilities: RwLock::new(Capabilities::for_config(&config.devices)),
            thread_pool: ThreadPool::new(pool_size),
            shader_compiler: Arc::new(GlslcCompiler::from_config(&config.shaders)),
            image_loader: Arc::new(FileImageLoader),
            config,
        })
    }

    /// Replace the shader compiler
    pub fn with_shader_compiler(mut self, compiler: Arc<dyn ShaderCompiler>) -> Self {
        self.shader_compiler = compiler;
        self
    }

    /// Replace the image loader
    pub fn with_image_loader(mut self, loader: Arc<dyn ImageLoader>) -> Self {
        self.image_loader = loader;
        self
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Capability lists for reading
    pub fn capabilities(&self) -> RwLockReadGuard<'_, Capabilities> {
        self.capabilities.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Capability lists for adding requirements (e.g. window surface extensions)
    pub fn capabilities_mut(&self) -> RwLockWriteGuard<'_, Capabilities> {
        self.capabilities.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// CPU thread pool
    pub fn thread_pool(&self) -> &ThreadPool {
        &self.thread_pool
    }

    /// Resize the CPU pool around `gpu_workers` device worker threads
    pub fn reserve_gpu_workers(&self, gpu_workers: usize) {
        let size = ThreadPool::recommended_size(
            self.config.threading.pool_fraction,
            gpu_workers,
            self.config.threading.min_pool_threads,
        );
        if size != self.thread_pool.thread_count() {
            log::info!("CPU pool sized to {} threads for {} GPU worker(s)", size, gpu_workers);
            self.thread_pool.resize(size);
        }
    }

    /// Shader compiler
    pub fn shader_compiler(&self) -> &Arc<dyn ShaderCompiler> {
        &self.shader_compiler
    }

    /// Image loader
    pub fn image_loader(&self) -> &Arc<dyn ImageLoader> {
        &self.image_loader
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("application", &self.config.application_name)
            .field("pool_threads", &self.thread_pool.thread_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::capabilities::SWAPCHAIN_EXTENSION;

    #[test]
    fn test_context_from_default_config() {
        let context = EngineContext::new(EngineConfig::default()).unwrap();
        assert!(context.thread_pool().thread_count() >= 1);
        assert!(context
            .capabilities()
            .required_device_extensions()
            .iter()
            .any(|e| e == SWAPCHAIN_EXTENSION));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig::default().with_frames_in_flight(0);
        assert!(EngineContext::new(config).is_err());
    }

    #[test]
    fn test_capabilities_are_mutable() {
        let context = EngineContext::new(EngineConfig::default()).unwrap();
        context.capabilities_mut().require_device_extension("VK_KHR_test");
        assert!(context
            .capabilities()
            .required_device_extensions()
            .iter()
            .any(|e| e == "VK_KHR_test"));
    }

    #[test]
    fn test_pool_shrinks_for_gpu_workers() {
        let mut config = EngineConfig::default();
        config.threading.pool_fraction = 1.0;
        let context = EngineContext::new(config).unwrap();

        context.reserve_gpu_workers(3);
        assert_eq!(context.thread_pool().thread_count(), ThreadPool::recommended_size(1.0, 3, 1));
        context.reserve_gpu_workers(1);
        assert_eq!(context.thread_pool().thread_count(), ThreadPool::recommended_size(1.0, 1, 1));
    }
}
