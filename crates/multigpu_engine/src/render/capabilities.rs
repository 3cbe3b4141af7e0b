//! Capability provider
//!
//! Owns the mutable lists of required and optional instance layers, instance
//! extensions and device extensions, validates them against what the loader
//! and each physical device offer, and produces the feature chain used to
//! open a logical device.

use crate::core::DeviceConfig;
use crate::render::device::PhysicalDeviceInfo;
use crate::render::error::{RenderError, RenderResult};

/// Khronos validation layer
pub const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";
/// Debug utils instance extension
pub const DEBUG_UTILS_EXTENSION: &str = "VK_EXT_debug_utils";
/// Swapchain device extension
pub const SWAPCHAIN_EXTENSION: &str = "VK_KHR_swapchain";

/// Layers and extensions offered by the instance loader
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceSupport {
    /// Available instance layers
    pub layers: Vec<String>,
    /// Available instance extensions
    pub extensions: Vec<String>,
}

/// Features enabled when opening a logical device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityChain {
    /// Dynamic rendering (no render pass objects)
    pub dynamic_rendering: bool,
    /// Extended dynamic state (dynamic cull mode)
    pub extended_dynamic_state: bool,
    /// Anisotropic sampling
    pub sampler_anisotropy: bool,
    /// Geometry shader stage
    pub geometry_shader: bool,
}

/// Required/optional layer and extension lists with their validation rules
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    required_instance_layers: Vec<String>,
    optional_instance_layers: Vec<String>,
    required_instance_extensions: Vec<String>,
    optional_instance_extensions: Vec<String>,
    required_device_extensions: Vec<String>,
    optional_device_extensions: Vec<String>,
}

fn push_unique(list: &mut Vec<String>, name: &str) {
    if !list.iter().any(|existing| existing == name) {
        list.push(name.to_string());
    }
}

fn missing<'a>(required: &'a [String], available: &[String]) -> Vec<&'a str> {
    required
        .iter()
        .filter(|name| !available.contains(name))
        .map(String::as_str)
        .collect()
}

impl Capabilities {
    /// Baseline capabilities: the swapchain device extension is always required
    pub fn new() -> Self {
        let mut capabilities = Self::default();
        capabilities.require_device_extension(SWAPCHAIN_EXTENSION);
        capabilities
    }

    /// Baseline plus validation layer and debug utils when validation is enabled
    pub fn for_config(config: &DeviceConfig) -> Self {
        let mut capabilities = Self::new();
        if config.validation_enabled() {
            capabilities.request_instance_layer(VALIDATION_LAYER);
            capabilities.request_instance_extension(DEBUG_UTILS_EXTENSION);
        }
        capabilities
    }

    /// Add a required instance layer
    pub fn require_instance_layer(&mut self, name: &str) {
        push_unique(&mut self.required_instance_layers, name);
    }

    /// Add an optional instance layer
    pub fn request_instance_layer(&mut self, name: &str) {
        push_unique(&mut self.optional_instance_layers, name);
    }

    /// Add a required instance extension (e.g. the window system's surface extensions)
    pub fn require_instance_extension(&mut self, name: &str) {
        push_unique(&mut self.required_instance_extensions, name);
    }

    /// Add an optional instance extension
    pub fn request_instance_extension(&mut self, name: &str) {
        push_unique(&mut self.optional_instance_extensions, name);
    }

    /// Add a required device extension
    pub fn require_device_extension(&mut self, name: &str) {
        push_unique(&mut self.required_device_extensions, name);
    }

    /// Add an optional device extension
    pub fn request_device_extension(&mut self, name: &str) {
        push_unique(&mut self.optional_device_extensions, name);
    }

    /// Required device extensions
    pub fn required_device_extensions(&self) -> &[String] {
        &self.required_device_extensions
    }

    /// Fail if any required instance layer or extension is unavailable
    pub fn validate_instance_requirements(&self, support: &InstanceSupport) -> RenderResult<()> {
        let missing_layers = missing(&self.required_instance_layers, &support.layers);
        let missing_extensions = missing(&self.required_instance_extensions, &support.extensions);
        if missing_layers.is_empty() && missing_extensions.is_empty() {
            return Ok(());
        }
        Err(RenderError::MissingCapability(format!(
            "instance layers {:?}, instance extensions {:?}",
            missing_layers, missing_extensions
        )))
    }

    /// Required layers plus the optional ones that are available
    pub fn resolve_instance_layers(&self, support: &InstanceSupport) -> Vec<String> {
        let mut layers = self.required_instance_layers.clone();
        for layer in &self.optional_instance_layers {
            if support.layers.contains(layer) {
                push_unique(&mut layers, layer);
            } else {
                log::warn!("Optional instance layer {} not available", layer);
            }
        }
        layers
    }

    /// Required extensions plus the optional ones that are available
    pub fn resolve_instance_extensions(&self, support: &InstanceSupport) -> Vec<String> {
        let mut extensions = self.required_instance_extensions.clone();
        for extension in &self.optional_instance_extensions {
            if support.extensions.contains(extension) {
                push_unique(&mut extensions, extension);
            } else {
                log::warn!("Optional instance extension {} not available", extension);
            }
        }
        extensions
    }

    /// Fail if `device` lacks a required extension or mandatory feature
    pub fn validate_device_requirements(&self, device: &PhysicalDeviceInfo) -> RenderResult<()> {
        let missing_extensions = missing(&self.required_device_extensions, &device.extensions);
        if !missing_extensions.is_empty() {
            return Err(RenderError::MissingCapability(format!(
                "{}: device extensions {:?}",
                device.name, missing_extensions
            )));
        }
        if !device.supports_required_features() {
            return Err(RenderError::MissingCapability(format!(
                "{}: dynamic rendering and extended dynamic state are required",
                device.name
            )));
        }
        Ok(())
    }

    /// Required device extensions plus the optional ones `device` offers
    pub fn resolve_device_extensions(&self, device: &PhysicalDeviceInfo) -> Vec<String> {
        let mut extensions = self.required_device_extensions.clone();
        for extension in &self.optional_device_extensions {
            if device.extensions.contains(extension) {
                push_unique(&mut extensions, extension);
            }
        }
        extensions
    }

    /// Feature chain to enable on `device`
    pub fn get_features(&self, device: &PhysicalDeviceInfo) -> RenderResult<CapabilityChain> {
        self.validate_device_requirements(device)?;
        Ok(CapabilityChain {
            dynamic_rendering: true,
            extended_dynamic_state: true,
            sampler_anisotropy: device.features.sampler_anisotropy,
            geometry_shader: device.features.geometry_shader,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::device::{DeviceClass, DeviceFeatures, PhysicalDeviceInfo};

    fn device(features: DeviceFeatures, extensions: &[&str]) -> PhysicalDeviceInfo {
        let mut info = PhysicalDeviceInfo::simulated(0, "test", DeviceClass::Discrete);
        info.features = features;
        info.extensions = extensions.iter().map(|e| e.to_string()).collect();
        info
    }

    #[test]
    fn test_instance_validation() {
        let mut capabilities = Capabilities::new();
        capabilities.require_instance_extension("VK_KHR_surface");
        capabilities.request_instance_layer(VALIDATION_LAYER);

        let support = InstanceSupport {
            layers: vec![],
            extensions: vec!["VK_KHR_surface".into()],
        };
        assert!(capabilities.validate_instance_requirements(&support).is_ok());
        assert!(capabilities.resolve_instance_layers(&support).is_empty());

        let empty = InstanceSupport::default();
        let error = capabilities.validate_instance_requirements(&empty).unwrap_err();
        assert!(error.is_fatal());
    }

    #[test]
    fn test_device_requirements() {
        let capabilities = Capabilities::new();
        let full = DeviceFeatures {
            dynamic_rendering: true,
            extended_dynamic_state: true,
            ..DeviceFeatures::default()
        };

        assert!(capabilities
            .validate_device_requirements(&device(full, &[SWAPCHAIN_EXTENSION]))
            .is_ok());
        assert!(capabilities.validate_device_requirements(&device(full, &[])).is_err());

        let no_dynamic = DeviceFeatures {
            dynamic_rendering: false,
            ..full
        };
        assert!(capabilities
            .validate_device_requirements(&device(no_dynamic, &[SWAPCHAIN_EXTENSION]))
            .is_err());
    }

    #[test]
    fn test_feature_chain_enables_optional_features() {
        let capabilities = Capabilities::new();
        let features = DeviceFeatures {
            dynamic_rendering: true,
            extended_dynamic_state: true,
            sampler_anisotropy: true,
            geometry_shader: false,
        };
        let chain = capabilities
            .get_features(&device(features, &[SWAPCHAIN_EXTENSION]))
            .unwrap();
        assert!(chain.dynamic_rendering && chain.extended_dynamic_state);
        assert!(chain.sampler_anisotropy);
        assert!(!chain.geometry_shader);
    }
}
