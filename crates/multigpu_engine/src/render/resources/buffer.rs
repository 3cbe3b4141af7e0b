//! Replicated GPU buffers
//!
//! Dynamic buffers are persistently mapped on every device and updated by
//! copying straight into each mapping. Static buffers live in device-local
//! memory, are filled once through a staging upload and reject updates.

use std::sync::Arc;

use crate::render::device::LogicalDevice;
use crate::render::error::{RenderError, RenderResult};
use crate::render::hal::{BufferDesc, BufferHandle, BufferUsage, MemoryMode};
use crate::render::resources::registry::GpuResource;
use crate::render::resources::replicate::Replicated;

/// Creation parameters of a [`Buffer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    /// Size in bytes
    pub size: u64,
    /// GPU usage
    pub usage: BufferUsage,
    /// Memory placement
    pub mode: MemoryMode,
    /// Contents uploaded at creation
    pub initial_data: Option<Vec<u8>>,
}

impl BufferInfo {
    /// Host-mapped buffer of `size` bytes
    pub fn dynamic(size: u64, usage: BufferUsage) -> Self {
        Self {
            size,
            usage,
            mode: MemoryMode::Dynamic,
            initial_data: None,
        }
    }

    /// Device-local buffer holding exactly `data`
    pub fn static_data(usage: BufferUsage, data: Vec<u8>) -> Self {
        Self {
            size: data.len() as u64,
            usage,
            mode: MemoryMode::Static,
            initial_data: Some(data),
        }
    }

    /// Host-mapped buffer initialized with `data`
    pub fn dynamic_data(usage: BufferUsage, data: Vec<u8>) -> Self {
        Self {
            size: data.len() as u64,
            usage,
            mode: MemoryMode::Dynamic,
            initial_data: Some(data),
        }
    }
}

/// One logical buffer with an instance on every device
pub struct Buffer {
    size: u64,
    usage: BufferUsage,
    mode: MemoryMode,
    instances: Replicated<BufferHandle>,
}

impl Buffer {
    /// Create the buffer on every device
    ///
    /// Invalid parameters fail immediately. Per-device failures do not fail
    /// construction; check [`Self::is_ready`].
    pub fn new(id: &str, info: BufferInfo, devices: &[Arc<LogicalDevice>]) -> RenderResult<Self> {
        if info.size == 0 {
            return Err(RenderError::InvalidArgument(format!("buffer '{}' has zero size", id)));
        }
        if let Some(data) = &info.initial_data {
            if data.len() as u64 > info.size {
                return Err(RenderError::InvalidArgument(format!(
                    "buffer '{}': {} bytes of initial data exceed size {}",
                    id,
                    data.len(),
                    info.size
                )));
            }
        }

        let desc = BufferDesc {
            label: id.to_string(),
            size: info.size,
            usage: info.usage,
            mode: info.mode,
        };
        let data = info.initial_data.map(Arc::new);
        let instances = Replicated::build("buffer", id, devices, move |driver| {
            driver.create_buffer(&desc, data.as_ref().map(|d| d.as_slice()))
        });

        Ok(Self {
            size: info.size,
            usage: info.usage,
            mode: info.mode,
            instances,
        })
    }

    /// Identifier
    pub fn id(&self) -> &str {
        self.instances.id()
    }

    /// Declared size in bytes
    pub fn get_size(&self) -> u64 {
        self.size
    }

    /// GPU usage
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Memory placement
    pub fn mode(&self) -> MemoryMode {
        self.mode
    }

    /// Whether every device holds an instance
    pub fn is_ready(&self) -> bool {
        self.instances.is_ready()
    }

    /// Devices whose instance failed to build
    pub fn failed_devices(&self) -> &[usize] {
        self.instances.failed_devices()
    }

    /// Number of per-device instances
    pub fn device_count(&self) -> usize {
        self.instances.device_count()
    }

    /// Native handle on device `device_index`
    pub fn handle(&self, device_index: usize) -> Option<BufferHandle> {
        self.instances.handle(device_index)
    }

    fn check_write(&self, offset: u64, len: usize) -> RenderResult<()> {
        if self.mode == MemoryMode::Static {
            return Err(RenderError::StaticBufferUpdate { id: self.id().to_string() });
        }
        let fits = offset
            .checked_add(len as u64)
            .map_or(false, |end| end <= self.size);
        if !fits {
            return Err(RenderError::OutOfBounds {
                id: self.id().to_string(),
                offset,
                size: len as u64,
                capacity: self.size,
            });
        }
        Ok(())
    }

    /// Copy `data` to `offset` in every device's mapping
    ///
    /// Rejected without touching any device if the buffer is static, the
    /// write runs past the declared size, or an instance is missing.
    pub fn update_data(&self, data: &[u8], offset: u64) -> RenderResult<()> {
        self.check_write(offset, data.len())?;
        self.instances.status()?;
        for slot in self.instances.slots() {
            if let Some(handle) = slot.handle() {
                slot.device().driver().write_buffer(handle, offset, data)?;
            }
        }
        Ok(())
    }

    /// Copy `data` to `offset` in one device's mapping
    pub fn update_device_data(&self, device_index: usize, data: &[u8], offset: u64) -> RenderResult<()> {
        self.check_write(offset, data.len())?;
        let slot = self.instances.slot(device_index).ok_or_else(|| {
            RenderError::InvalidArgument(format!("buffer '{}' has no slot for device {}", self.id(), device_index))
        })?;
        let handle = slot.handle().ok_or_else(|| self.missing(device_index))?;
        slot.device().driver().write_buffer(handle, offset, data)
    }

    /// Read back `len` bytes at `offset` from one device's mapping
    pub fn read_data(&self, device_index: usize, offset: u64, len: u64) -> RenderResult<Vec<u8>> {
        let slot = self.instances.slot(device_index).ok_or_else(|| self.missing(device_index))?;
        let handle = slot.handle().ok_or_else(|| self.missing(device_index))?;
        slot.device().driver().read_buffer(handle, offset, len)
    }

    fn missing(&self, device_index: usize) -> RenderError {
        RenderError::Device {
            device: device_index,
            reason: format!("buffer '{}' has no instance", self.id()),
        }
    }
}

impl GpuResource for Buffer {
    const KIND: &'static str = "buffer";
    type Info = BufferInfo;

    fn create(id: &str, info: BufferInfo, devices: &[Arc<LogicalDevice>]) -> RenderResult<Self> {
        Self::new(id, info, devices)
    }

    fn identifier(&self) -> &str {
        self.id()
    }

    fn status(&self) -> RenderResult<()> {
        self.instances.status()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.instances.tear_down(|driver, handle| driver.destroy_buffer(handle));
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id())
            .field("size", &self.size)
            .field("mode", &self.mode)
            .field("failed", &self.failed_devices())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::headless::ResourceKind;
    use crate::test_support::TestRig;

    #[test]
    fn test_static_buffer_rejects_updates() {
        let rig = TestRig::new(1);
        let data: Vec<u8> = (0..16).collect();
        let buffer = Buffer::new("vb", BufferInfo::static_data(BufferUsage::VERTEX, data.clone()), rig.devices()).unwrap();

        assert_eq!(buffer.get_size(), 16);
        assert!(matches!(
            buffer.update_data(&[0; 4], 0),
            Err(RenderError::StaticBufferUpdate { .. })
        ));
        let handle = buffer.handle(0).unwrap();
        assert_eq!(rig.headless(0).buffer_contents(handle).unwrap(), data);
        assert_eq!(rig.headless(0).uploads(), 1);
    }

    #[test]
    fn test_bounds_law() {
        let rig = TestRig::new(2);
        let buffer = Buffer::new("ub", BufferInfo::dynamic(32, BufferUsage::UNIFORM), rig.devices()).unwrap();

        assert!(buffer.update_data(&[1; 32], 0).is_ok());
        assert!(buffer.update_data(&[2; 16], 16).is_ok());
        assert!(matches!(
            buffer.update_data(&[3; 17], 16),
            Err(RenderError::OutOfBounds { capacity: 32, .. })
        ));
        assert!(buffer.update_data(&[4; 1], u64::MAX).is_err());

        for device in 0..2 {
            let contents = buffer.read_data(device, 0, 32).unwrap();
            assert_eq!(&contents[..16], &[1; 16]);
            assert_eq!(&contents[16..], &[2; 16]);
        }
    }

    #[test]
    fn test_partial_failure_is_reported_not_rolled_back() {
        let rig = TestRig::new(2);
        rig.headless(1).set_fail_buffer_creation(true);
        let buffer = Buffer::new("ub", BufferInfo::dynamic(16, BufferUsage::UNIFORM), rig.devices()).unwrap();

        assert!(!buffer.is_ready());
        assert_eq!(buffer.failed_devices(), &[1]);
        assert_eq!(rig.headless(0).live(ResourceKind::Buffer), 1);
        assert!(matches!(
            buffer.update_data(&[0; 4], 0),
            Err(RenderError::ReplicationFailed { .. })
        ));

        drop(buffer);
        assert_eq!(rig.headless(0).live(ResourceKind::Buffer), 0);
    }

    #[test]
    fn test_invalid_parameters() {
        let rig = TestRig::new(1);
        assert!(Buffer::new("empty", BufferInfo::dynamic(0, BufferUsage::UNIFORM), rig.devices()).is_err());

        let mut info = BufferInfo::dynamic(4, BufferUsage::UNIFORM);
        info.initial_data = Some(vec![0; 8]);
        assert!(Buffer::new("overflow", info, rig.devices()).is_err());
        assert_eq!(rig.headless(0).created(ResourceKind::Buffer), 0);
    }

    #[test]
    fn test_single_device_update() {
        let rig = TestRig::new(2);
        let buffer = Buffer::new("ub", BufferInfo::dynamic(8, BufferUsage::UNIFORM), rig.devices()).unwrap();
        buffer.update_device_data(1, &[9; 8], 0).unwrap();

        assert_eq!(buffer.read_data(0, 0, 8).unwrap(), vec![0; 8]);
        assert_eq!(buffer.read_data(1, 0, 8).unwrap(), vec![9; 8]);
    }
}
