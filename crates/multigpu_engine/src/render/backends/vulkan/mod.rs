//! Vulkan backend
//!
//! One [`VulkanInstance`] owns the loader, instance and window surface; each
//! physical device in the group is opened as a [`VulkanDevice`] with its own
//! allocator, queues, swapchain and frame synchronization.

mod driver;
mod frame;
mod instance;
mod pipeline;
mod swapchain;

use std::sync::Arc;

use ash::vk::{self, Handle};

pub use driver::VulkanDevice;
pub use instance::VulkanInstance;

use crate::core::EngineContext;
use crate::render::capabilities::{CapabilityChain, InstanceSupport};
use crate::render::device::PhysicalDeviceInfo;
use crate::render::error::{RenderError, RenderResult};
use crate::render::hal::{DeviceDriver, GpuBackend, ImageFormat};

/// [`GpuBackend`] over the system Vulkan loader
pub struct VulkanBackend {
    instance: Arc<VulkanInstance>,
}

impl VulkanBackend {
    /// Create the instance and the presentation surface
    ///
    /// `window_extensions` are the instance extensions the window system needs
    /// and become hard requirements. `create_surface` receives the raw instance
    /// handle and returns the surface all presenting devices target.
    pub fn new<F>(context: &EngineContext, window_extensions: &[String], create_surface: F) -> RenderResult<Self>
    where
        F: FnOnce(vk::Instance) -> Result<vk::SurfaceKHR, String>,
    {
        let capabilities = context.capabilities().clone();
        let instance = VulkanInstance::new(
            &context.config().application_name,
            &capabilities,
            window_extensions,
            create_surface,
        )?;
        Ok(Self {
            instance: Arc::new(instance),
        })
    }

    /// Shared instance objects
    pub fn instance(&self) -> &Arc<VulkanInstance> {
        &self.instance
    }
}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> &str {
        "vulkan"
    }

    fn instance_support(&self) -> InstanceSupport {
        self.instance.support().clone()
    }

    fn enumerate_physical_devices(&self) -> RenderResult<Vec<PhysicalDeviceInfo>> {
        self.instance.enumerate_physical_devices()
    }

    fn open_device(
        &self,
        info: &PhysicalDeviceInfo,
        features: &CapabilityChain,
        device_extensions: &[String],
    ) -> RenderResult<Arc<dyn DeviceDriver>> {
        let physical = vk::PhysicalDevice::from_raw(info.raw_handle);
        let device = VulkanDevice::open(
            Arc::clone(&self.instance),
            physical,
            info,
            features,
            device_extensions,
        )?;
        Ok(Arc::new(device))
    }
}

pub(crate) fn to_vk_format(format: ImageFormat) -> vk::Format {
    match format {
        ImageFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        ImageFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        ImageFormat::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        ImageFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        ImageFormat::Depth32Float => vk::Format::D32_SFLOAT,
    }
}

pub(crate) fn from_vk_format(format: vk::Format) -> RenderResult<ImageFormat> {
    match format {
        vk::Format::R8G8B8A8_SRGB => Ok(ImageFormat::Rgba8Srgb),
        vk::Format::R8G8B8A8_UNORM => Ok(ImageFormat::Rgba8Unorm),
        vk::Format::B8G8R8A8_SRGB => Ok(ImageFormat::Bgra8Srgb),
        vk::Format::B8G8R8A8_UNORM => Ok(ImageFormat::Bgra8Unorm),
        vk::Format::D32_SFLOAT => Ok(ImageFormat::Depth32Float),
        other => Err(RenderError::InvalidArgument(format!("unsupported format {:?}", other))),
    }
}
