//! Backend implementations of the hardware abstraction layer

pub mod headless;
pub mod vulkan;
