//! Fan-out/join replication of a resource across devices
//!
//! A replicated resource owns one slot per device in the group at
//! construction time. Creation submits one task per device worker and joins
//! them all; a failing device is logged and leaves its slot empty without
//! rolling back the others. Teardown mirrors creation.
//!
//! Teardown blocks on the device workers, so a replicated resource must never
//! be dropped from inside a device task.

use std::sync::Arc;

use crate::render::device::{join_all, LogicalDevice};
use crate::render::error::{RenderError, RenderResult};
use crate::render::hal::DeviceDriver;

/// One device's instance of a replicated resource
pub struct DeviceSlot<H> {
    device: Arc<LogicalDevice>,
    handle: Option<H>,
}

impl<H: Copy> DeviceSlot<H> {
    /// Device owning this slot
    pub fn device(&self) -> &Arc<LogicalDevice> {
        &self.device
    }

    /// Native handle, if creation succeeded
    pub fn handle(&self) -> Option<H> {
        self.handle
    }
}

/// Per-device handles of one logical resource
pub struct Replicated<H> {
    kind: &'static str,
    id: String,
    slots: Vec<DeviceSlot<H>>,
    failed: Vec<usize>,
}

impl<H> Replicated<H>
where
    H: Copy + Send + 'static,
{
    /// Run `create` on every device worker and join all results
    pub fn build<F>(kind: &'static str, id: &str, devices: &[Arc<LogicalDevice>], create: F) -> Self
    where
        F: Fn(&dyn DeviceDriver) -> RenderResult<H> + Send + Sync + 'static,
    {
        let create = Arc::new(create);
        let handles: Vec<_> = devices
            .iter()
            .map(|device| {
                let create = Arc::clone(&create);
                device.execute(move |driver| (*create)(driver))
            })
            .collect();

        let mut slots = Vec::with_capacity(devices.len());
        let mut failed = Vec::new();
        for (device, result) in devices.iter().zip(join_all(handles)) {
            let handle = match result.and_then(|created| created) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    log::error!("Failed to create {} '{}' on device {}: {}", kind, id, device.index(), e);
                    failed.push(device.index());
                    None
                }
            };
            slots.push(DeviceSlot {
                device: Arc::clone(device),
                handle,
            });
        }

        log::debug!("Created {} '{}' on {} device(s)", kind, id, slots.len() - failed.len());
        Self {
            kind,
            id: id.to_string(),
            slots,
            failed,
        }
    }

    /// Resource identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether every device holds an instance
    pub fn is_ready(&self) -> bool {
        self.failed.is_empty()
    }

    /// Indices of the devices whose instance failed to build
    pub fn failed_devices(&self) -> &[usize] {
        &self.failed
    }

    /// `Ok` if every device holds an instance
    pub fn status(&self) -> RenderResult<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(RenderError::ReplicationFailed {
                kind: self.kind,
                id: self.id.clone(),
                failed: self.failed.clone(),
            })
        }
    }

    /// Per-device slots in construction order
    pub fn slots(&self) -> &[DeviceSlot<H>] {
        &self.slots
    }

    /// Number of slots (devices at construction time)
    pub fn device_count(&self) -> usize {
        self.slots.len()
    }

    /// Slot belonging to the device with stable index `device_index`
    pub fn slot(&self, device_index: usize) -> Option<&DeviceSlot<H>> {
        self.slots.iter().find(|slot| slot.device.index() == device_index)
    }

    /// Handle on the device with stable index `device_index`
    pub fn handle(&self, device_index: usize) -> Option<H> {
        self.slot(device_index).and_then(|slot| slot.handle)
    }

    /// Destroy every live instance on its own worker and wait for all of them
    pub fn tear_down<D>(&mut self, destroy: D)
    where
        D: Fn(&dyn DeviceDriver, H) + Send + Sync + 'static,
    {
        let destroy = Arc::new(destroy);
        let handles: Vec<_> = self
            .slots
            .iter_mut()
            .filter_map(|slot| {
                let handle = slot.handle.take()?;
                let destroy = Arc::clone(&destroy);
                Some((slot.device.index(), slot.device.execute(move |driver| (*destroy)(driver, handle))))
            })
            .collect();

        for (device, handle) in handles {
            if let Err(e) = handle.wait() {
                log::error!("Failed to destroy {} '{}' on device {}: {}", self.kind, self.id, device, e);
            }
        }
    }
}
