//! Error taxonomy for the rendering core
//!
//! Construction-time failures that leave the system unusable are fatal and abort
//! startup; per-device and per-resource failures are reported and degrade
//! gracefully; usage errors reject the call without partial mutation.

use ash::vk;
use thiserror::Error;

use crate::config::ConfigError;

/// Rendering errors
#[derive(Error, Debug)]
pub enum RenderError {
    /// Enumeration returned no devices at all
    #[error("No Vulkan-capable devices found")]
    NoDevices,

    /// Devices exist but none passed the eligibility gates
    #[error("No eligible GPU: {0}")]
    NoEligibleDevice(String),

    /// A required layer, extension or feature is missing
    #[error("Missing required capability: {0}")]
    MissingCapability(String),

    /// Backend or instance initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// A single device failed an operation
    #[error("Device {device}: {reason}")]
    Device {
        /// Index of the device in the group
        device: usize,
        /// What went wrong
        reason: String,
    },

    /// Some per-device instances of a replicated resource failed to build
    #[error("{kind} '{id}' failed on devices {failed:?}")]
    ReplicationFailed {
        /// Resource kind (buffer, image, ...)
        kind: &'static str,
        /// Resource identifier
        id: String,
        /// Device indices whose slot failed
        failed: Vec<usize>,
    },

    /// Attempted to update a buffer that lives in device-local memory
    #[error("Buffer '{id}' is static and cannot be updated")]
    StaticBufferUpdate {
        /// Buffer identifier
        id: String,
    },

    /// A write would run past the end of a buffer
    #[error("Write of {size} bytes at offset {offset} exceeds '{id}' size {capacity}")]
    OutOfBounds {
        /// Resource identifier
        id: String,
        /// Requested write offset
        offset: u64,
        /// Requested write size
        size: u64,
        /// Declared size of the resource
        capacity: u64,
    },

    /// Invalid argument to an engine call
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A handle did not resolve on the device it was used with
    #[error("Unknown {kind} handle on device '{device}'")]
    UnknownHandle {
        /// Handle kind
        kind: &'static str,
        /// Device label
        device: String,
    },

    /// The device worker has shut down and can no longer accept tasks
    #[error("Worker for device {0} has stopped")]
    WorkerStopped(usize),

    /// The swapchain no longer matches the surface
    #[error("Swapchain out of date")]
    SwapchainOutOfDate,

    /// External shader compiler failed
    #[error("Shader compilation failed for {path}: {diagnostics}")]
    ShaderCompilation {
        /// Source path
        path: String,
        /// Compiler output
        diagnostics: String,
    },

    /// External image loader failed
    #[error("Image load failed: {0}")]
    ImageLoad(String),

    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Configuration could not be loaded or validated
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl RenderError {
    /// Whether this error must abort startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NoDevices
                | Self::NoEligibleDevice(_)
                | Self::MissingCapability(_)
                | Self::InitializationFailed(_)
        )
    }

    /// Whether the swapchain has to be rebuilt before rendering can continue
    pub fn is_out_of_date(&self) -> bool {
        matches!(self, Self::SwapchainOutOfDate | Self::Api(vk::Result::ERROR_OUT_OF_DATE_KHR))
    }
}

impl From<vk::Result> for RenderError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::SwapchainOutOfDate,
            other => Self::Api(other),
        }
    }
}

/// Result type for rendering operations
pub type RenderResult<T> = Result<T, RenderError>;
