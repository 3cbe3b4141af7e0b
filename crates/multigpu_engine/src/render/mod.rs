//! Multi-device rendering core
//!
//! Device selection and per-device workers live in [`device`], replicated
//! resources and their registries in [`resources`], the native API seam in
//! [`hal`] with implementations in [`backends`], and the per-frame protocol
//! in [`frame_coordinator`].

pub mod backends;
pub mod capabilities;
pub mod device;
pub mod error;
pub mod frame_coordinator;
pub mod hal;
pub mod resources;
pub mod surface;

pub use capabilities::{Capabilities, CapabilityChain, InstanceSupport};
pub use device::{DeviceGroup, DeviceGroupState, LogicalDevice, PhysicalDeviceInfo};
pub use error::{RenderError, RenderResult};
pub use frame_coordinator::{FrameCoordinator, FrameStatus, LoopControl};
pub use surface::{PresentationSurface, SurfaceEvent};
