//! Identifier-keyed registries of replicated resources
//!
//! One mutex guards each registry's map and is held only for the map
//! operation itself. Building a resource blocks on every device worker, so
//! it happens outside the lock under a reservation that concurrent creators
//! of the same identifier wait on.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::core::EngineContext;
use crate::core::thread_pool::JobHandle;
use crate::render::device::LogicalDevice;
use crate::render::error::{RenderError, RenderResult};
use crate::render::resources::buffer::Buffer;
use crate::render::resources::material::{Material, MaterialInfo};
use crate::render::resources::texture::Texture;

/// A resource replicated across the devices of a registry
pub trait GpuResource: Send + Sync + Sized + 'static {
    /// Kind name for logs and errors
    const KIND: &'static str;
    /// Creation parameters
    type Info;

    /// Build the resource on every device
    fn create(id: &str, info: Self::Info, devices: &[Arc<LogicalDevice>]) -> RenderResult<Self>;

    /// Registry key
    fn identifier(&self) -> &str;

    /// `Ok` if every device holds a usable instance
    fn status(&self) -> RenderResult<()>;
}

enum Slot<T> {
    Ready(Arc<T>),
    Building,
}

/// Thread-safe map from identifier to shared resource
pub struct ResourceRegistry<T: GpuResource> {
    devices: Vec<Arc<LogicalDevice>>,
    entries: Mutex<HashMap<String, Slot<T>>>,
    built: Condvar,
}

/// Registry of buffers
pub type BufferRegistry = ResourceRegistry<Buffer>;
/// Registry of materials
pub type MaterialRegistry = ResourceRegistry<Material>;
/// Registry of textures
pub type TextureRegistry = ResourceRegistry<Texture>;

/// An identifier claimed by one builder; released again if never filled
struct Reservation<'a, T: GpuResource> {
    registry: &'a ResourceRegistry<T>,
    id: String,
    filled: bool,
}

impl<T: GpuResource> Reservation<'_, T> {
    fn fill(mut self, resource: Arc<T>) {
        self.registry.entries().insert(self.id.clone(), Slot::Ready(resource));
        self.filled = true;
        self.registry.built.notify_all();
    }
}

impl<T: GpuResource> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        if !self.filled {
            self.registry.entries().remove(&self.id);
            self.registry.built.notify_all();
        }
    }
}

impl<T: GpuResource> ResourceRegistry<T> {
    /// Empty registry replicating onto `devices`
    pub fn new(devices: &[Arc<LogicalDevice>]) -> Self {
        Self {
            devices: devices.to_vec(),
            entries: Mutex::new(HashMap::new()),
            built: Condvar::new(),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Slot<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Devices every resource is replicated onto
    pub fn devices(&self) -> &[Arc<LogicalDevice>] {
        &self.devices
    }

    /// Claim `id`, waiting out a concurrent build; `Err` holds the existing entry
    fn reserve(&self, id: &str) -> Result<Reservation<'_, T>, Arc<T>> {
        let mut entries = self.entries();
        loop {
            match entries.get(id) {
                Some(Slot::Ready(existing)) => return Err(Arc::clone(existing)),
                Some(Slot::Building) => {
                    entries = self.built.wait(entries).unwrap_or_else(PoisonError::into_inner);
                }
                None => {
                    entries.insert(id.to_string(), Slot::Building);
                    return Ok(Reservation {
                        registry: self,
                        id: id.to_string(),
                        filled: false,
                    });
                }
            }
        }
    }

    fn build(&self, reservation: Reservation<'_, T>, info: T::Info) -> RenderResult<Arc<T>> {
        let resource = T::create(&reservation.id, info, &self.devices)?;
        if let Err(e) = resource.status() {
            log::error!("{} '{}' unusable: {}", T::KIND, reservation.id, e);
            return Err(e);
        }
        let resource = Arc::new(resource);
        log::debug!("Registered {} '{}'", T::KIND, reservation.id);
        reservation.fill(Arc::clone(&resource));
        Ok(resource)
    }

    /// Create `id`, or return the existing entry with a warning
    ///
    /// Concurrent calls for one identifier build it once; the others wait and
    /// share the result. A resource whose replication failed on any device is
    /// not registered; its successful instances are destroyed and the error
    /// is returned so the caller can retry.
    pub fn create(&self, id: &str, info: T::Info) -> RenderResult<Arc<T>> {
        match self.reserve(id) {
            Ok(reservation) => self.build(reservation, info),
            Err(existing) => {
                log::warn!("{} '{}' already exists, returning existing instance", T::KIND, id);
                Ok(existing)
            }
        }
    }

    /// Create `id`, failing if it is already registered
    pub fn create_new(&self, id: &str, info: T::Info) -> RenderResult<Arc<T>> {
        match self.reserve(id) {
            Ok(reservation) => self.build(reservation, info),
            Err(_) => Err(RenderError::InvalidArgument(format!(
                "{} '{}' is already registered",
                T::KIND,
                id
            ))),
        }
    }

    /// Look up `id`
    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        match self.entries().get(id) {
            Some(Slot::Ready(resource)) => Some(Arc::clone(resource)),
            _ => None,
        }
    }

    /// Whether `id` is registered
    pub fn contains(&self, id: &str) -> bool {
        matches!(self.entries().get(id), Some(Slot::Ready(_)))
    }

    /// Erase `id`; the resource is destroyed once its last holder drops it
    ///
    /// Returns whether an entry was removed.
    pub fn remove(&self, id: &str) -> bool {
        self.remove_where(id, |_| true)
    }

    /// Erase `id` only while it still maps to `resource`
    pub fn remove_instance(&self, id: &str, resource: &Arc<T>) -> bool {
        self.remove_where(id, |stored| Arc::ptr_eq(stored, resource))
    }

    fn remove_where(&self, id: &str, should_remove: impl Fn(&Arc<T>) -> bool) -> bool {
        let removed = {
            let mut entries = self.entries();
            let remove = matches!(entries.get(id), Some(Slot::Ready(stored)) if should_remove(stored));
            if remove {
                entries.remove(id)
            } else {
                None
            }
        };
        match removed {
            Some(resource) => {
                log::debug!("Removed {} '{}'", T::KIND, id);
                drop(resource);
                true
            }
            None => false,
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries().values().filter(|slot| matches!(slot, Slot::Ready(_))).count()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered identifiers, sorted
    pub fn identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Remove every entry; builds still in progress register when they finish
    pub fn clear(&self) {
        let drained: Vec<Arc<T>> = {
            let mut entries = self.entries();
            let ready: Vec<String> = entries
                .iter()
                .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
                .map(|(id, _)| id.clone())
                .collect();
            ready
                .iter()
                .filter_map(|id| match entries.remove(id) {
                    Some(Slot::Ready(resource)) => Some(resource),
                    _ => None,
                })
                .collect()
        };
        if !drained.is_empty() {
            log::debug!("Clearing {} {} entries", drained.len(), T::KIND);
        }
    }
}

impl MaterialRegistry {
    /// Create `id` and compile it before returning
    pub fn create_compiled(&self, id: &str, info: MaterialInfo, context: &EngineContext) -> RenderResult<Arc<Material>> {
        let material = self.create(id, info)?;
        material.initialize(context.shader_compiler().as_ref(), &context.config().shaders)?;
        Ok(material)
    }

    /// Create `id` and compile it on the CPU thread pool
    ///
    /// The material is registered immediately; entities using it are skipped
    /// until the returned job finishes.
    pub fn create_deferred(
        &self,
        id: &str,
        info: MaterialInfo,
        context: &Arc<EngineContext>,
    ) -> RenderResult<(Arc<Material>, JobHandle<RenderResult<()>>)> {
        let material = self.create(id, info)?;
        let job_material = Arc::clone(&material);
        let job_context = Arc::clone(context);
        let job = context.thread_pool().spawn(move || {
            let result = job_material.initialize(
                job_context.shader_compiler().as_ref(),
                &job_context.config().shaders,
            );
            if let Err(e) = &result {
                log::error!("Deferred compilation of material '{}' failed: {}", job_material.id(), e);
            }
            result
        });
        Ok((material, job))
    }
}
