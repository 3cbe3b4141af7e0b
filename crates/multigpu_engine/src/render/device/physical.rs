//! Physical device descriptors, scoring and selection

use crate::render::capabilities::{Capabilities, SWAPCHAIN_EXTENSION};
use crate::render::error::{RenderError, RenderResult};

/// Bonus for discrete GPUs
pub const DISCRETE_BONUS: i64 = 10_000;
/// Bonus for integrated GPUs
pub const INTEGRATED_BONUS: i64 = 1_000;
/// Bonus for geometry shader support
pub const GEOMETRY_SHADER_BONUS: i64 = 500;
/// Bonus for a queue family that can both draw and present
pub const GRAPHICS_PRESENT_BONUS: i64 = 50_000;
/// Max image dimension counted toward the score
pub const IMAGE_DIMENSION_CAP: u32 = 32_768;
/// Divisor applied to the capped max image dimension
pub const IMAGE_DIMENSION_DIVISOR: i64 = 8;

/// Physical device class as reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    /// Dedicated GPU
    Discrete,
    /// GPU sharing memory with the CPU
    Integrated,
    /// Virtualized GPU
    Virtual,
    /// Software rasterizer
    Cpu,
    /// Anything else
    Other,
}

/// One queue family of a physical device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    /// Family index
    pub index: u32,
    /// Number of queues
    pub queue_count: u32,
    /// Supports graphics operations
    pub graphics: bool,
    /// Supports transfer operations
    pub transfer: bool,
    /// Can present to the target surface
    pub present: bool,
}

/// Feature bits relevant to selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    /// Geometry shader stage
    pub geometry_shader: bool,
    /// Anisotropic sampling
    pub sampler_anisotropy: bool,
    /// Dynamic rendering
    pub dynamic_rendering: bool,
    /// Extended dynamic state
    pub extended_dynamic_state: bool,
}

/// Limits relevant to selection and resource creation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceLimits {
    /// Largest 2D image side
    pub max_image_dimension_2d: u32,
    /// Push constant budget in bytes
    pub max_push_constants_size: u32,
    /// Anisotropy ceiling
    pub max_sampler_anisotropy: f32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_image_dimension_2d: 4096,
            max_push_constants_size: 128,
            max_sampler_anisotropy: 1.0,
        }
    }
}

/// Immutable snapshot of one enumerated GPU
///
/// Queue family present support is resolved against the target surface at
/// enumeration time, so scoring needs no further surface queries.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalDeviceInfo {
    /// Position in enumeration order
    pub index: usize,
    /// Backend-specific opaque handle
    pub raw_handle: u64,
    /// Device name
    pub name: String,
    /// PCI vendor id
    pub vendor_id: u32,
    /// PCI device id
    pub device_id: u32,
    /// Supported API version
    pub api_version: u32,
    /// Device class
    pub class: DeviceClass,
    /// Limits
    pub limits: DeviceLimits,
    /// Features
    pub features: DeviceFeatures,
    /// Queue families
    pub queue_families: Vec<QueueFamilyInfo>,
    /// Supported device extensions
    pub extensions: Vec<String>,
}

impl PhysicalDeviceInfo {
    /// Descriptor of a fully capable device with one universal queue family
    pub fn simulated(index: usize, name: &str, class: DeviceClass) -> Self {
        Self {
            index,
            raw_handle: index as u64,
            name: name.to_string(),
            vendor_id: 0,
            device_id: index as u32,
            api_version: 0,
            class,
            limits: DeviceLimits {
                max_image_dimension_2d: 16_384,
                max_push_constants_size: 256,
                max_sampler_anisotropy: 16.0,
            },
            features: DeviceFeatures {
                geometry_shader: true,
                sampler_anisotropy: true,
                dynamic_rendering: true,
                extended_dynamic_state: true,
            },
            queue_families: vec![QueueFamilyInfo {
                index: 0,
                queue_count: 1,
                graphics: true,
                transfer: true,
                present: true,
            }],
            extensions: vec![SWAPCHAIN_EXTENSION.to_string()],
        }
    }

    /// First queue family supporting both graphics and presentation
    pub fn graphics_present_queue(&self) -> Option<u32> {
        self.queue_families
            .iter()
            .find(|family| family.graphics && family.present && family.queue_count > 0)
            .map(|family| family.index)
    }

    /// Dedicated transfer family if present, otherwise the graphics+present family
    pub fn transfer_queue(&self) -> Option<u32> {
        self.queue_families
            .iter()
            .find(|family| family.transfer && !family.graphics && family.queue_count > 0)
            .map(|family| family.index)
            .or_else(|| self.graphics_present_queue())
    }

    /// Mandatory feature gate: dynamic rendering and extended dynamic state
    pub fn supports_required_features(&self) -> bool {
        self.features.dynamic_rendering && self.features.extended_dynamic_state
    }

    /// Deterministic desirability score
    ///
    /// Eligibility is decided separately; a high score never makes a device
    /// without a graphics+present queue selectable.
    pub fn calculate_score(&self) -> i64 {
        let mut score = match self.class {
            DeviceClass::Discrete => DISCRETE_BONUS,
            DeviceClass::Integrated => INTEGRATED_BONUS,
            _ => 0,
        };
        score += i64::from(self.limits.max_image_dimension_2d.min(IMAGE_DIMENSION_CAP)) / IMAGE_DIMENSION_DIVISOR;
        if self.features.geometry_shader {
            score += GEOMETRY_SHADER_BONUS;
        }
        if self.graphics_present_queue().is_some() {
            score += GRAPHICS_PRESENT_BONUS;
        }
        score
    }

    /// Why this device cannot be used, if it cannot
    pub fn ineligibility(&self, capabilities: &Capabilities) -> Option<String> {
        if self.graphics_present_queue().is_none() {
            return Some(format!("{}: no queue family supports graphics and present", self.name));
        }
        capabilities
            .validate_device_requirements(self)
            .err()
            .map(|e| e.to_string())
    }
}

/// Outcome of device selection, as indices into the enumerated list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSelection {
    /// Highest scoring eligible device
    pub primary: usize,
    /// Remaining eligible devices in enumeration order
    pub secondaries: Vec<usize>,
}

/// Pick the primary (strict max score, first encountered on ties) and the secondaries
pub fn select_devices(devices: &[PhysicalDeviceInfo], capabilities: &Capabilities) -> RenderResult<DeviceSelection> {
    if devices.is_empty() {
        return Err(RenderError::NoDevices);
    }

    let mut reasons = Vec::new();
    let mut eligible = Vec::new();
    for (position, device) in devices.iter().enumerate() {
        match device.ineligibility(capabilities) {
            Some(reason) => {
                log::info!("Skipping GPU {}: {}", device.name, reason);
                reasons.push(reason);
            }
            None => eligible.push((position, device.calculate_score())),
        }
    }

    let mut best: Option<(usize, i64)> = None;
    for &(position, score) in &eligible {
        if best.map_or(true, |(_, best_score)| score > best_score) {
            best = Some((position, score));
        }
    }
    let (primary, score) = best.ok_or_else(|| RenderError::NoEligibleDevice(reasons.join("; ")))?;
    log::info!("Selected primary GPU {} (score {})", devices[primary].name, score);

    let secondaries = eligible
        .iter()
        .map(|&(position, _)| position)
        .filter(|&position| position != primary)
        .collect();

    Ok(DeviceSelection { primary, secondaries })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn without_present(mut info: PhysicalDeviceInfo) -> PhysicalDeviceInfo {
        for family in &mut info.queue_families {
            family.present = false;
        }
        info
    }

    #[test]
    fn test_discrete_beats_integrated() {
        let mut integrated = PhysicalDeviceInfo::simulated(0, "igpu", DeviceClass::Integrated);
        integrated.limits.max_image_dimension_2d = u32::MAX;
        let mut discrete = PhysicalDeviceInfo::simulated(1, "dgpu", DeviceClass::Discrete);
        discrete.limits.max_image_dimension_2d = 0;
        discrete.features.geometry_shader = false;

        assert!(discrete.calculate_score() > integrated.calculate_score());
    }

    #[test]
    fn test_score_is_deterministic() {
        let device = PhysicalDeviceInfo::simulated(0, "gpu", DeviceClass::Discrete);
        let expected = DISCRETE_BONUS + 16_384 / 8 + GEOMETRY_SHADER_BONUS + GRAPHICS_PRESENT_BONUS;
        assert_eq!(device.calculate_score(), expected);
        assert_eq!(device.calculate_score(), device.clone().calculate_score());
    }

    #[test]
    fn test_queue_gate_overrides_score() {
        let capabilities = Capabilities::new();
        let headless = without_present(PhysicalDeviceInfo::simulated(0, "dgpu", DeviceClass::Discrete));
        let weak = PhysicalDeviceInfo::simulated(1, "cpu", DeviceClass::Cpu);

        let selection = select_devices(&[headless, weak], &capabilities).unwrap();
        assert_eq!(selection.primary, 1);
        assert!(selection.secondaries.is_empty());
    }

    #[test]
    fn test_ties_pick_first() {
        let capabilities = Capabilities::new();
        let devices = vec![
            PhysicalDeviceInfo::simulated(0, "a", DeviceClass::Discrete),
            PhysicalDeviceInfo::simulated(1, "b", DeviceClass::Discrete),
            PhysicalDeviceInfo::simulated(2, "c", DeviceClass::Integrated),
        ];
        let selection = select_devices(&devices, &capabilities).unwrap();
        assert_eq!(selection.primary, 0);
        assert_eq!(selection.secondaries, vec![1, 2]);
    }

    #[test]
    fn test_feature_gate_excludes() {
        let capabilities = Capabilities::new();
        let mut best = PhysicalDeviceInfo::simulated(0, "fast", DeviceClass::Discrete);
        best.features.extended_dynamic_state = false;
        let fallback = PhysicalDeviceInfo::simulated(1, "slow", DeviceClass::Integrated);

        let selection = select_devices(&[best, fallback], &capabilities).unwrap();
        assert_eq!(selection.primary, 1);
    }

    #[test]
    fn test_selection_errors() {
        let capabilities = Capabilities::new();
        assert!(matches!(select_devices(&[], &capabilities), Err(RenderError::NoDevices)));

        let only = without_present(PhysicalDeviceInfo::simulated(0, "gpu", DeviceClass::Discrete));
        let error = select_devices(&[only], &capabilities).unwrap_err();
        assert!(matches!(error, RenderError::NoEligibleDevice(_)));
        assert!(error.is_fatal());
    }
}
