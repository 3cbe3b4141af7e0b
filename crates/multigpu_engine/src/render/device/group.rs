//! Device group and swapchain lifecycle
//!
//! Owns the ordered list of logical devices (index 0 is the primary) and the
//! swapchain state. Secondary devices mirror the primary's swapchain format
//! and extent; a secondary whose swapchain cannot be created stays in the group
//! for resource replication but is excluded from presentation.

use std::sync::Arc;

use crate::core::EngineContext;
use crate::render::device::physical::select_devices;
use crate::render::device::worker::join_all;
use crate::render::device::{LogicalDevice, PhysicalDeviceInfo};
use crate::render::error::{RenderError, RenderResult};
use crate::render::hal::{Extent2D, GpuBackend, SwapchainInfo, SwapchainRequest};

/// Lifecycle state of a [`DeviceGroup`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceGroupState {
    /// Nothing enumerated yet
    Uninitialized,
    /// Physical devices enumerated
    Enumerated,
    /// Logical devices opened
    DevicesInitialized,
    /// Swapchains exist and match the surface
    SwapchainCreated,
    /// Swapchains must be recreated before the next frame
    SwapchainStale,
}

/// Primary plus optional secondary logical devices
pub struct DeviceGroup {
    backend: Arc<dyn GpuBackend>,
    context: Arc<EngineContext>,
    physical_devices: Vec<PhysicalDeviceInfo>,
    devices: Vec<Arc<LogicalDevice>>,
    presenting: Vec<bool>,
    multi_gpu: bool,
    state: DeviceGroupState,
    swapchain: Option<SwapchainInfo>,
}

impl DeviceGroup {
    /// Create an empty group; multi-GPU defaults to the configured value
    pub fn new(backend: Arc<dyn GpuBackend>, context: Arc<EngineContext>) -> Self {
        let multi_gpu = context.config().devices.multi_gpu;
        Self {
            backend,
            context,
            physical_devices: Vec::new(),
            devices: Vec::new(),
            presenting: Vec::new(),
            multi_gpu,
            state: DeviceGroupState::Uninitialized,
            swapchain: None,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> DeviceGroupState {
        self.state
    }

    /// Enumerated physical devices
    pub fn physical_devices(&self) -> &[PhysicalDeviceInfo] {
        &self.physical_devices
    }

    /// Opened logical devices, primary first
    pub fn devices(&self) -> &[Arc<LogicalDevice>] {
        &self.devices
    }

    /// Number of opened devices
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// The primary device
    pub fn primary(&self) -> Option<&Arc<LogicalDevice>> {
        self.devices.first()
    }

    /// Device with stable index `index`
    pub fn device(&self, index: usize) -> Option<&Arc<LogicalDevice>> {
        self.devices.iter().find(|device| device.index() == index)
    }

    /// Devices that currently present
    pub fn presenting_devices(&self) -> Vec<Arc<LogicalDevice>> {
        self.devices
            .iter()
            .zip(&self.presenting)
            .filter(|(_, presenting)| **presenting)
            .map(|(device, _)| Arc::clone(device))
            .collect()
    }

    /// Primary swapchain description
    pub fn swapchain_info(&self) -> Option<SwapchainInfo> {
        self.swapchain
    }

    /// Whether secondary devices are opened by the next [`Self::initialize_devices`]
    pub fn multi_gpu_enabled(&self) -> bool {
        self.multi_gpu
    }

    /// Takes effect on the next [`Self::initialize_devices`]
    pub fn set_multi_gpu_enabled(&mut self, enabled: bool) {
        if enabled != self.multi_gpu && !self.devices.is_empty() {
            log::info!("Multi-GPU set to {}; re-initialize devices to apply", enabled);
        }
        self.multi_gpu = enabled;
    }

    /// Enumerate physical devices; zero devices is fatal
    pub fn enumerate(&mut self) -> RenderResult<&[PhysicalDeviceInfo]> {
        self.context
            .capabilities()
            .validate_instance_requirements(&self.backend.instance_support())?;
        let devices = self.backend.enumerate_physical_devices()?;
        if devices.is_empty() {
            return Err(RenderError::NoDevices);
        }
        for device in &devices {
            log::info!(
                "Found GPU {}: {} ({:?}, score {})",
                device.index,
                device.name,
                device.class,
                device.calculate_score()
            );
        }
        self.physical_devices = devices;
        if self.state == DeviceGroupState::Uninitialized {
            self.state = DeviceGroupState::Enumerated;
        }
        Ok(&self.physical_devices)
    }

    /// Open the primary and, with multi-GPU on, every other eligible device
    ///
    /// An existing device set is torn down and rebuilt. Failure to open the
    /// primary is fatal; a failing secondary is logged and skipped.
    pub fn initialize_devices(&mut self) -> RenderResult<()> {
        if !self.devices.is_empty() {
            log::info!("Re-initializing device set");
            self.shutdown();
        }
        if self.physical_devices.is_empty() {
            self.enumerate()?;
        }

        let selection = select_devices(&self.physical_devices, &self.context.capabilities())?;

        let primary_info = self.physical_devices[selection.primary].clone();
        let primary = self.open(0, &primary_info).map_err(|e| {
            if e.is_fatal() {
                e
            } else {
                RenderError::InitializationFailed(format!("primary GPU {}: {}", primary_info.name, e))
            }
        })?;
        self.devices.push(Arc::new(primary));
        self.presenting.push(true);

        if self.multi_gpu {
            for position in selection.secondaries {
                let info = self.physical_devices[position].clone();
                let index = self.devices.len();
                match self.open(index, &info) {
                    Ok(device) => {
                        log::info!("Opened secondary GPU {} as device {}", info.name, index);
                        self.devices.push(Arc::new(device));
                        self.presenting.push(true);
                    }
                    Err(e) => log::warn!("Skipping secondary GPU {}: {}", info.name, e),
                }
            }
        }

        self.state = DeviceGroupState::DevicesInitialized;
        self.context.reserve_gpu_workers(self.devices.len());
        log::info!("Initialized {} device(s)", self.devices.len());
        Ok(())
    }

    fn open(&self, index: usize, info: &PhysicalDeviceInfo) -> RenderResult<LogicalDevice> {
        let (features, extensions) = {
            let capabilities = self.context.capabilities();
            (capabilities.get_features(info)?, capabilities.resolve_device_extensions(info))
        };
        let driver = self.backend.open_device(info, &features, &extensions)?;
        LogicalDevice::spawn(index, info.clone(), driver)
    }

    /// Remove a secondary device after waiting for the group to go idle
    ///
    /// Resources replicated onto it keep the device alive until they drop.
    pub fn remove_secondary(&mut self, index: usize) -> RenderResult<()> {
        if index == 0 {
            return Err(RenderError::InvalidArgument("the primary device cannot be removed".into()));
        }
        let position = self
            .devices
            .iter()
            .position(|device| device.index() == index)
            .ok_or_else(|| RenderError::InvalidArgument(format!("no device with index {}", index)))?;

        self.wait_idle()?;
        let device = self.devices.remove(position);
        let presented = self.presenting.remove(position);
        if presented && self.swapchain.is_some() {
            device.execute(|driver| driver.destroy_swapchain()).wait()?;
        }
        log::info!("Removed secondary device {} ({})", index, device.name());
        Ok(())
    }

    /// Create swapchains on every device; secondaries mirror the primary
    pub fn create_swapchain(&mut self, extent: Extent2D) -> RenderResult<SwapchainInfo> {
        let primary = Arc::clone(self.devices.first().ok_or_else(|| {
            RenderError::InitializationFailed("swapchain requested before devices were initialized".into())
        })?);

        let frames_in_flight = self.context.config().renderer.frames_in_flight;
        let request = SwapchainRequest {
            extent,
            format: None,
            vsync: self.context.config().renderer.vsync,
        };
        let info = primary
            .execute(move |driver| -> RenderResult<SwapchainInfo> {
                let info = driver.create_swapchain(&request)?;
                driver.recreate_frame_sync(frames_in_flight)?;
                Ok(info)
            })
            .wait()??;
        self.presenting[0] = true;

        let mirrored = SwapchainRequest {
            extent: info.extent,
            format: Some(info.format),
            vsync: request.vsync,
        };
        let handles: Vec<_> = self.devices[1..]
            .iter()
            .map(|device| {
                device.execute(move |driver| -> RenderResult<SwapchainInfo> {
                    let info = driver.create_swapchain(&mirrored)?;
                    driver.recreate_frame_sync(frames_in_flight)?;
                    Ok(info)
                })
            })
            .collect();
        for (offset, result) in join_all(handles).into_iter().enumerate() {
            let position = offset + 1;
            match result.and_then(|created| created) {
                Ok(_) => self.presenting[position] = true,
                Err(e) => {
                    log::warn!(
                        "Device {} excluded from presentation: {}",
                        self.devices[position].index(),
                        e
                    );
                    self.presenting[position] = false;
                }
            }
        }

        log::info!(
            "Swapchain {}x{} {:?} with {} images on {} presenting device(s)",
            info.extent.width,
            info.extent.height,
            info.format,
            info.image_count,
            self.presenting.iter().filter(|&&p| p).count()
        );
        self.swapchain = Some(info);
        self.state = DeviceGroupState::SwapchainCreated;
        Ok(info)
    }

    /// Flag the swapchain for recreation before the next frame
    pub fn mark_swapchain_stale(&mut self) {
        if self.swapchain.is_some() {
            self.state = DeviceGroupState::SwapchainStale;
        }
    }

    /// Whether the swapchain must be recreated
    pub fn needs_recreation(&self) -> bool {
        self.state == DeviceGroupState::SwapchainStale
    }

    /// Wait for idle, destroy every swapchain and recreate against `extent`
    pub fn recreate_swapchain(&mut self, extent: Extent2D) -> RenderResult<SwapchainInfo> {
        log::debug!("Recreating swapchain at {}x{}", extent.width, extent.height);
        self.wait_idle()?;
        self.destroy_swapchains();
        self.create_swapchain(extent)
    }

    fn destroy_swapchains(&mut self) {
        let handles: Vec<_> = self
            .devices
            .iter()
            .map(|device| device.execute(|driver| driver.destroy_swapchain()))
            .collect();
        for result in join_all(handles) {
            if let Err(e) = result {
                log::warn!("Swapchain teardown: {}", e);
            }
        }
        self.swapchain = None;
    }

    /// Flush every worker queue and wait for every GPU to go idle
    pub fn wait_idle(&self) -> RenderResult<()> {
        let handles: Vec<_> = self
            .devices
            .iter()
            .map(|device| device.execute(|driver| driver.wait_idle()))
            .collect();
        let mut first_error = None;
        for result in join_all(handles) {
            if let Err(e) = result.and_then(|idle| idle) {
                log::warn!("wait_idle: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Release swapchains and the group's references to every device
    ///
    /// Devices are destroyed once the last resource holding them drops.
    pub fn shutdown(&mut self) {
        if self.devices.is_empty() {
            return;
        }
        if let Err(e) = self.wait_idle() {
            log::warn!("Device shutdown without idle: {}", e);
        }
        if self.swapchain.is_some() {
            self.destroy_swapchains();
        }
        for device in self.devices.drain(..) {
            let holders = Arc::strong_count(&device) - 1;
            if holders > 0 {
                log::debug!("Device {} still referenced by {} resource(s)", device.index(), holders);
            }
        }
        self.presenting.clear();
        self.state = if self.physical_devices.is_empty() {
            DeviceGroupState::Uninitialized
        } else {
            DeviceGroupState::Enumerated
        };
    }
}

impl Drop for DeviceGroup {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EngineConfig, ThreadPool};
    use crate::render::backends::headless::{HeadlessBackend, ResourceKind};
    use crate::render::device::{DeviceClass, PhysicalDeviceInfo};
    use crate::render::hal::ImageFormat;

    fn group(backend: &Arc<HeadlessBackend>, multi_gpu: bool) -> DeviceGroup {
        let context = Arc::new(EngineContext::new(EngineConfig::new("test").with_multi_gpu(multi_gpu)).unwrap());
        DeviceGroup::new(Arc::clone(backend) as Arc<dyn GpuBackend>, context)
    }

    #[test]
    fn test_state_transitions() {
        let backend = Arc::new(HeadlessBackend::with_devices(1));
        let mut group = group(&backend, false);
        assert_eq!(group.state(), DeviceGroupState::Uninitialized);

        group.enumerate().unwrap();
        assert_eq!(group.state(), DeviceGroupState::Enumerated);

        group.initialize_devices().unwrap();
        assert_eq!(group.state(), DeviceGroupState::DevicesInitialized);

        group.create_swapchain(Extent2D::new(800, 600)).unwrap();
        assert_eq!(group.state(), DeviceGroupState::SwapchainCreated);

        group.mark_swapchain_stale();
        assert!(group.needs_recreation());

        let info = group.recreate_swapchain(Extent2D::new(1024, 768)).unwrap();
        assert_eq!(info.extent, Extent2D::new(1024, 768));
        assert_eq!(group.state(), DeviceGroupState::SwapchainCreated);

        let device = backend.device(0).unwrap();
        assert_eq!(device.created(ResourceKind::Swapchain), 2);
        assert_eq!(device.live(ResourceKind::Swapchain), 1);
    }

    #[test]
    fn test_single_gpu_ignores_secondaries() {
        let backend = Arc::new(HeadlessBackend::with_devices(3));
        let mut group = group(&backend, false);
        group.initialize_devices().unwrap();
        assert_eq!(group.device_count(), 1);
    }

    #[test]
    fn test_primary_is_best_device() {
        let backend = Arc::new(HeadlessBackend::new(vec![
            PhysicalDeviceInfo::simulated(0, "integrated", DeviceClass::Integrated),
            PhysicalDeviceInfo::simulated(1, "discrete", DeviceClass::Discrete),
        ]));
        let mut group = group(&backend, true);
        group.initialize_devices().unwrap();

        assert_eq!(group.primary().unwrap().name(), "discrete");
        assert_eq!(group.devices()[1].name(), "integrated");
    }

    #[test]
    fn test_secondary_open_failure_is_skipped() {
        let backend = Arc::new(HeadlessBackend::with_devices(3));
        backend.fail_open(1);
        let mut group = group(&backend, true);
        group.initialize_devices().unwrap();

        assert_eq!(group.device_count(), 2);
        assert_eq!(group.devices()[1].info().index, 2);
    }

    #[test]
    fn test_primary_open_failure_is_fatal() {
        let backend = Arc::new(HeadlessBackend::with_devices(2));
        backend.fail_open(0);
        let mut group = group(&backend, true);
        let error = group.initialize_devices().unwrap_err();
        assert!(error.is_fatal());
    }

    #[test]
    fn test_secondaries_mirror_primary_swapchain() {
        let backend = Arc::new(HeadlessBackend::with_devices(2));
        let mut group = group(&backend, true);
        group.initialize_devices().unwrap();
        let info = group.create_swapchain(Extent2D::new(640, 480)).unwrap();

        let secondary = backend.device(1).unwrap().swapchain().unwrap();
        assert_eq!(secondary.extent, info.extent);
        assert_eq!(secondary.format, ImageFormat::Bgra8Srgb);
        assert_eq!(group.presenting_devices().len(), 2);
    }

    #[test]
    fn test_secondary_swapchain_failure_excludes_presentation() {
        let backend = Arc::new(HeadlessBackend::with_devices(2));
        let mut group = group(&backend, true);
        group.initialize_devices().unwrap();
        backend.device(1).unwrap().set_fail_swapchain_creation(true);

        group.create_swapchain(Extent2D::new(640, 480)).unwrap();
        assert_eq!(group.device_count(), 2);
        assert_eq!(group.presenting_devices().len(), 1);
    }

    #[test]
    fn test_multi_gpu_toggle_applies_on_reinitialize() {
        let backend = Arc::new(HeadlessBackend::with_devices(2));
        let mut group = group(&backend, false);
        group.initialize_devices().unwrap();
        assert_eq!(group.device_count(), 1);

        group.set_multi_gpu_enabled(true);
        assert_eq!(group.device_count(), 1);

        group.initialize_devices().unwrap();
        assert_eq!(group.device_count(), 2);
        assert_eq!(backend.open_count(), 3);
    }

    #[test]
    fn test_remove_secondary() {
        let backend = Arc::new(HeadlessBackend::with_devices(2));
        let mut group = group(&backend, true);
        group.initialize_devices().unwrap();
        group.create_swapchain(Extent2D::new(64, 64)).unwrap();

        assert!(group.remove_secondary(0).is_err());
        group.remove_secondary(1).unwrap();
        assert_eq!(group.device_count(), 1);
        assert_eq!(backend.device(1).unwrap().live(ResourceKind::Swapchain), 0);
    }

    #[test]
    fn test_cpu_pool_sized_for_opened_devices() {
        let backend = Arc::new(HeadlessBackend::with_devices(3));
        let context = Arc::new(EngineContext::new(EngineConfig::new("test").with_multi_gpu(true)).unwrap());
        let mut group = DeviceGroup::new(Arc::clone(&backend) as Arc<dyn GpuBackend>, Arc::clone(&context));
        group.initialize_devices().unwrap();

        let threading = &context.config().threading;
        let expected = ThreadPool::recommended_size(threading.pool_fraction, 3, threading.min_pool_threads);
        assert_eq!(context.thread_pool().thread_count(), expected);
    }
}
