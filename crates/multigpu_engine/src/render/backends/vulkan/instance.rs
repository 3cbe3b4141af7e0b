//! Vulkan instance, debug messenger, surface and physical device queries

use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::Surface;
use ash::vk::{self, Handle};
use ash::{Entry, Instance};

use crate::render::capabilities::{Capabilities, InstanceSupport, DEBUG_UTILS_EXTENSION};
use crate::render::device::{DeviceClass, DeviceFeatures, DeviceLimits, PhysicalDeviceInfo, QueueFamilyInfo};
use crate::render::error::{RenderError, RenderResult};

/// Instance-level objects shared by every device opened from it
///
/// Devices hold an `Arc` to this, so the surface and instance are destroyed
/// only after the last device.
pub struct VulkanInstance {
    /// Loader entry points
    pub entry: Entry,
    /// Instance
    pub instance: Instance,
    /// Surface extension loader
    pub surface_loader: Surface,
    /// Presentation surface
    pub surface: vk::SurfaceKHR,
    debug: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    support: InstanceSupport,
}

impl VulkanInstance {
    /// Create an instance with the resolved layers and extensions, then the surface
    ///
    /// `window_extensions` are required in addition to the capability lists.
    pub fn new<F>(
        app_name: &str,
        capabilities: &Capabilities,
        window_extensions: &[String],
        create_surface: F,
    ) -> RenderResult<Self>
    where
        F: FnOnce(vk::Instance) -> Result<vk::SurfaceKHR, String>,
    {
        let entry = unsafe { Entry::load() }
            .map_err(|e| RenderError::InitializationFailed(format!("Failed to load Vulkan: {:?}", e)))?;
        let support = query_instance_support(&entry)?;

        let mut capabilities = capabilities.clone();
        for extension in window_extensions {
            capabilities.require_instance_extension(extension);
        }
        capabilities.validate_instance_requirements(&support)?;
        let layers = to_cstrings(&capabilities.resolve_instance_layers(&support))?;
        let extensions = to_cstrings(&capabilities.resolve_instance_extensions(&support))?;
        let layer_ptrs: Vec<*const c_char> = layers.iter().map(|l| l.as_ptr()).collect();
        let extension_ptrs: Vec<*const c_char> = extensions.iter().map(|e| e.as_ptr()).collect();

        let app_name = CString::new(app_name)
            .map_err(|_| RenderError::InvalidArgument("application name contains NUL".into()))?;
        let engine_name = CString::new("MultiGpuEngine").map_err(|_| RenderError::InvalidArgument("engine name".into()))?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_3);
        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_layer_names(&layer_ptrs)
            .enabled_extension_names(&extension_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None)? };
        log::info!(
            "Vulkan instance created with layers {:?}",
            layers.iter().map(|l| l.to_string_lossy()).collect::<Vec<_>>()
        );

        let debug = if extensions.iter().any(|e| e.to_bytes() == DEBUG_UTILS_EXTENSION.as_bytes()) {
            let debug_utils = DebugUtils::new(&entry, &instance);
            match setup_debug_messenger(&debug_utils) {
                Ok(messenger) => Some((debug_utils, messenger)),
                Err(e) => {
                    log::warn!("Debug messenger unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let surface_loader = Surface::new(&entry, &instance);
        let surface = match create_surface(instance.handle()) {
            Ok(surface) => surface,
            Err(reason) => {
                unsafe {
                    if let Some((debug_utils, messenger)) = &debug {
                        debug_utils.destroy_debug_utils_messenger(*messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(RenderError::InitializationFailed(format!("Surface creation: {}", reason)));
            }
        };

        Ok(Self {
            entry,
            instance,
            surface_loader,
            surface,
            debug,
            support,
        })
    }

    /// Layers and extensions the loader offered
    pub fn support(&self) -> &InstanceSupport {
        &self.support
    }

    /// Describe every physical device, resolving present support against the surface
    pub fn enumerate_physical_devices(&self) -> RenderResult<Vec<PhysicalDeviceInfo>> {
        let devices = unsafe { self.instance.enumerate_physical_devices()? };
        devices
            .into_iter()
            .enumerate()
            .map(|(index, device)| self.describe(index, device))
            .collect()
    }

    fn describe(&self, index: usize, device: vk::PhysicalDevice) -> RenderResult<PhysicalDeviceInfo> {
        let properties = unsafe { self.instance.get_physical_device_properties(device) };
        let features = unsafe { self.instance.get_physical_device_features(device) };
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let core_13 = properties.api_version >= vk::API_VERSION_1_3;
        let mut vulkan13 = vk::PhysicalDeviceVulkan13Features::default();
        if core_13 {
            let mut features2 = vk::PhysicalDeviceFeatures2::builder().push_next(&mut vulkan13);
            unsafe { self.instance.get_physical_device_features2(device, &mut features2) };
        }

        let families = unsafe { self.instance.get_physical_device_queue_family_properties(device) };
        let mut queue_families = Vec::with_capacity(families.len());
        for (family_index, family) in families.iter().enumerate() {
            let family_index = family_index as u32;
            let present = unsafe {
                self.surface_loader
                    .get_physical_device_surface_support(device, family_index, self.surface)
                    .unwrap_or(false)
            };
            queue_families.push(QueueFamilyInfo {
                index: family_index,
                queue_count: family.queue_count,
                graphics: family.queue_flags.contains(vk::QueueFlags::GRAPHICS),
                transfer: family.queue_flags.contains(vk::QueueFlags::TRANSFER),
                present,
            });
        }

        let extensions = unsafe { self.instance.enumerate_device_extension_properties(device)? }
            .iter()
            .map(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) }.to_string_lossy().into_owned())
            .collect();

        Ok(PhysicalDeviceInfo {
            index,
            raw_handle: device.as_raw(),
            name,
            vendor_id: properties.vendor_id,
            device_id: properties.device_id,
            api_version: properties.api_version,
            class: match properties.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => DeviceClass::Discrete,
                vk::PhysicalDeviceType::INTEGRATED_GPU => DeviceClass::Integrated,
                vk::PhysicalDeviceType::VIRTUAL_GPU => DeviceClass::Virtual,
                vk::PhysicalDeviceType::CPU => DeviceClass::Cpu,
                _ => DeviceClass::Other,
            },
            limits: DeviceLimits {
                max_image_dimension_2d: properties.limits.max_image_dimension2_d,
                max_push_constants_size: properties.limits.max_push_constants_size,
                max_sampler_anisotropy: properties.limits.max_sampler_anisotropy,
            },
            features: DeviceFeatures {
                geometry_shader: features.geometry_shader == vk::TRUE,
                sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
                dynamic_rendering: vulkan13.dynamic_rendering == vk::TRUE,
                extended_dynamic_state: core_13,
            },
            queue_families,
            extensions,
        })
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if self.surface != vk::SurfaceKHR::null() {
                self.surface_loader.destroy_surface(self.surface, None);
            }
            if let Some((debug_utils, messenger)) = self.debug.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn query_instance_support(entry: &Entry) -> RenderResult<InstanceSupport> {
    let layers = entry
        .enumerate_instance_layer_properties()?
        .iter()
        .map(|l| unsafe { CStr::from_ptr(l.layer_name.as_ptr()) }.to_string_lossy().into_owned())
        .collect();
    let extensions = entry
        .enumerate_instance_extension_properties(None)?
        .iter()
        .map(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) }.to_string_lossy().into_owned())
        .collect();
    Ok(InstanceSupport { layers, extensions })
}

pub(crate) fn to_cstrings(names: &[String]) -> RenderResult<Vec<CString>> {
    names
        .iter()
        .map(|name| {
            CString::new(name.as_str())
                .map_err(|_| RenderError::InvalidArgument(format!("name '{}' contains NUL", name)))
        })
        .collect()
}

fn setup_debug_messenger(debug_utils: &DebugUtils) -> RenderResult<vk::DebugUtilsMessengerEXT> {
    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));
    Ok(unsafe { debug_utils.create_debug_utils_messenger(&create_info, None)? })
}

/// Routes validation output into `log`
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if callback_data.is_null() || (*callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }
    vk::FALSE
}
