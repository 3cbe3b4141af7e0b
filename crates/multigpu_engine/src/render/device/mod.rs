//! GPU devices: physical device selection, per-device workers and the device group

pub mod group;
pub mod physical;
pub mod worker;

pub use group::{DeviceGroup, DeviceGroupState};
pub use physical::{
    select_devices, DeviceClass, DeviceFeatures, DeviceLimits, DeviceSelection, PhysicalDeviceInfo,
    QueueFamilyInfo,
};
pub use worker::{join_all, LogicalDevice, TaskHandle};
