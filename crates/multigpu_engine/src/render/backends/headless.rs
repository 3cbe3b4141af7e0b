//! Host-memory backend simulating any number of GPUs
//!
//! Used by the test suite and for offscreen runs. Every create/destroy is
//! counted per device, command streams are recorded, and failures can be
//! injected per device to exercise the recoverable error paths.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use slotmap::SlotMap;

use crate::render::capabilities::{CapabilityChain, InstanceSupport, DEBUG_UTILS_EXTENSION, VALIDATION_LAYER};
use crate::render::device::{DeviceClass, PhysicalDeviceInfo};
use crate::render::error::{RenderError, RenderResult};
use crate::render::hal::{
    AcquireOutcome, Binding, BindingSetHandle, BufferDesc, BufferHandle, ClearValues, CommandRecorder,
    DeviceDriver, GpuBackend, ImageDesc, ImageFormat, ImageHandle, MemoryMode, PipelineDesc, PipelineHandle,
    PresentOutcome, SamplerDesc, SamplerHandle, SwapchainInfo, SwapchainRequest,
};

/// Swapchain image count of simulated devices
pub const SIMULATED_IMAGE_COUNT: u32 = 3;

/// Resource kinds tracked by the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Buffers
    Buffer,
    /// Images
    Image,
    /// Samplers
    Sampler,
    /// Pipelines
    Pipeline,
    /// Binding sets
    BindingSet,
    /// Swapchains
    Swapchain,
}

/// A command captured by the headless recorder
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    /// Pipeline bind
    BindPipeline(PipelineHandle),
    /// Push constant write
    PushConstants(Vec<u8>),
    /// Binding set bind
    BindBindingSet(BindingSetHandle),
    /// Vertex buffer bind
    BindVertexBuffer(BufferHandle),
    /// Index buffer bind
    BindIndexBuffer(BufferHandle),
    /// Indexed draw
    DrawIndexed {
        /// Index count
        index_count: u32,
        /// First index
        first_index: u32,
    },
}

struct SimBuffer {
    desc: BufferDesc,
    data: Vec<u8>,
}

#[derive(Default)]
struct HeadlessState {
    buffers: SlotMap<BufferHandle, SimBuffer>,
    images: SlotMap<ImageHandle, (ImageDesc, Vec<u8>)>,
    samplers: SlotMap<SamplerHandle, SamplerDesc>,
    pipelines: SlotMap<PipelineHandle, PipelineDesc>,
    binding_sets: SlotMap<BindingSetHandle, (PipelineHandle, Vec<Binding>)>,
    swapchain: Option<SwapchainInfo>,
    frame_slots: usize,
    next_image: u32,
    pending: HashMap<usize, Vec<RecordedCommand>>,
    last_frame: Vec<RecordedCommand>,
    presented: u64,
    created: HashMap<ResourceKind, usize>,
    destroyed: HashMap<ResourceKind, usize>,
    uploads: usize,
}

impl HeadlessState {
    fn count_create(&mut self, kind: ResourceKind) {
        *self.created.entry(kind).or_insert(0) += 1;
    }

    fn count_destroy(&mut self, kind: ResourceKind) {
        *self.destroyed.entry(kind).or_insert(0) += 1;
    }
}

/// One simulated GPU
pub struct HeadlessDevice {
    label: String,
    physical_index: usize,
    state: Mutex<HeadlessState>,
    mutation_threads: Mutex<HashSet<ThreadId>>,
    fail_buffers: AtomicBool,
    fail_swapchain: AtomicBool,
    fail_recording: AtomicBool,
    fail_pipelines: AtomicBool,
    out_of_date_acquires: AtomicU32,
}

impl HeadlessDevice {
    fn new(info: &PhysicalDeviceInfo) -> Self {
        Self {
            label: format!("{} (headless)", info.name),
            physical_index: info.index,
            state: Mutex::new(HeadlessState::default()),
            mutation_threads: Mutex::new(HashSet::new()),
            fail_buffers: AtomicBool::new(false),
            fail_swapchain: AtomicBool::new(false),
            fail_recording: AtomicBool::new(false),
            fail_pipelines: AtomicBool::new(false),
            out_of_date_acquires: AtomicU32::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, HeadlessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mutate(&self) -> MutexGuard<'_, HeadlessState> {
        self.mutation_threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(thread::current().id());
        self.state()
    }

    fn unknown(&self, kind: &'static str) -> RenderError {
        RenderError::UnknownHandle {
            kind,
            device: self.label.clone(),
        }
    }

    /// Index of the physical device this was opened on
    pub fn physical_index(&self) -> usize {
        self.physical_index
    }

    /// Make subsequent buffer creations fail
    pub fn set_fail_buffer_creation(&self, fail: bool) {
        self.fail_buffers.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent swapchain creations fail
    pub fn set_fail_swapchain_creation(&self, fail: bool) {
        self.fail_swapchain.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent command recordings fail to begin
    pub fn set_fail_recording(&self, fail: bool) {
        self.fail_recording.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent pipeline creations fail
    pub fn set_fail_pipeline_creation(&self, fail: bool) {
        self.fail_pipelines.store(fail, Ordering::SeqCst);
    }

    /// Report the next `count` acquires as out of date
    pub fn force_out_of_date(&self, count: u32) {
        self.out_of_date_acquires.store(count, Ordering::SeqCst);
    }

    /// Resources of `kind` created so far
    pub fn created(&self, kind: ResourceKind) -> usize {
        self.state().created.get(&kind).copied().unwrap_or(0)
    }

    /// Resources of `kind` destroyed so far
    pub fn destroyed(&self, kind: ResourceKind) -> usize {
        self.state().destroyed.get(&kind).copied().unwrap_or(0)
    }

    /// Resources of `kind` currently alive
    pub fn live(&self, kind: ResourceKind) -> usize {
        let state = self.state();
        match kind {
            ResourceKind::Buffer => state.buffers.len(),
            ResourceKind::Image => state.images.len(),
            ResourceKind::Sampler => state.samplers.len(),
            ResourceKind::Pipeline => state.pipelines.len(),
            ResourceKind::BindingSet => state.binding_sets.len(),
            ResourceKind::Swapchain => usize::from(state.swapchain.is_some()),
        }
    }

    /// Staging uploads performed for static buffers and images
    pub fn uploads(&self) -> usize {
        self.state().uploads
    }

    /// Threads that created or destroyed anything on this device
    pub fn mutation_threads(&self) -> HashSet<ThreadId> {
        self.mutation_threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Full contents of any buffer, static or dynamic
    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
        self.state().buffers.get(buffer).map(|b| b.data.clone())
    }

    /// Current swapchain
    pub fn swapchain(&self) -> Option<SwapchainInfo> {
        self.state().swapchain
    }

    /// Frames presented so far
    pub fn presented_frames(&self) -> u64 {
        self.state().presented
    }

    /// Commands of the most recently presented frame
    pub fn last_frame_commands(&self) -> Vec<RecordedCommand> {
        self.state().last_frame.clone()
    }
}

impl DeviceDriver for HeadlessDevice {
    fn label(&self) -> &str {
        &self.label
    }

    fn create_buffer(&self, desc: &BufferDesc, initial_data: Option<&[u8]>) -> RenderResult<BufferHandle> {
        if self.fail_buffers.load(Ordering::SeqCst) {
            return Err(RenderError::Api(ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        let len = usize::try_from(desc.size)
            .map_err(|_| RenderError::InvalidArgument(format!("buffer '{}' too large", desc.label)))?;
        let mut data = vec![0u8; len];
        if let Some(initial) = initial_data {
            if initial.len() > len {
                return Err(RenderError::InvalidArgument(format!(
                    "initial data for '{}' exceeds buffer size",
                    desc.label
                )));
            }
            data[..initial.len()].copy_from_slice(initial);
        }

        let mut state = self.mutate();
        if desc.mode == MemoryMode::Static && initial_data.is_some() {
            state.uploads += 1;
        }
        state.count_create(ResourceKind::Buffer);
        Ok(state.buffers.insert(SimBuffer { desc: desc.clone(), data }))
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> RenderResult<()> {
        let mut state = self.state();
        let sim = state.buffers.get_mut(buffer).ok_or_else(|| self.unknown("buffer"))?;
        if sim.desc.mode != MemoryMode::Dynamic {
            return Err(RenderError::StaticBufferUpdate { id: sim.desc.label.clone() });
        }
        let start = offset as usize;
        let end = start
            .checked_add(data.len())
            .filter(|&end| end <= sim.data.len())
            .ok_or_else(|| RenderError::OutOfBounds {
                id: sim.desc.label.clone(),
                offset,
                size: data.len() as u64,
                capacity: sim.desc.size,
            })?;
        sim.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, len: u64) -> RenderResult<Vec<u8>> {
        let state = self.state();
        let sim = state.buffers.get(buffer).ok_or_else(|| self.unknown("buffer"))?;
        if sim.desc.mode != MemoryMode::Dynamic {
            return Err(RenderError::InvalidArgument(format!(
                "buffer '{}' is not host visible",
                sim.desc.label
            )));
        }
        let start = offset as usize;
        let end = start.saturating_add(len as usize);
        sim.data
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| RenderError::OutOfBounds {
                id: sim.desc.label.clone(),
                offset,
                size: len,
                capacity: sim.desc.size,
            })
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let mut state = self.mutate();
        if state.buffers.remove(buffer).is_some() {
            state.count_destroy(ResourceKind::Buffer);
        }
    }

    fn create_image(&self, desc: &ImageDesc, pixels: Option<&[u8]>) -> RenderResult<ImageHandle> {
        let data = match pixels {
            Some(pixels) if pixels.len() as u64 != desc.byte_size() => {
                return Err(RenderError::InvalidArgument(format!(
                    "image '{}' expects {} bytes, got {}",
                    desc.label,
                    desc.byte_size(),
                    pixels.len()
                )))
            }
            Some(pixels) => pixels.to_vec(),
            None => Vec::new(),
        };
        let mut state = self.mutate();
        if pixels.is_some() {
            state.uploads += 1;
        }
        state.count_create(ResourceKind::Image);
        Ok(state.images.insert((desc.clone(), data)))
    }

    fn destroy_image(&self, image: ImageHandle) {
        let mut state = self.mutate();
        if state.images.remove(image).is_some() {
            state.count_destroy(ResourceKind::Image);
        }
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> RenderResult<SamplerHandle> {
        let mut state = self.mutate();
        state.count_create(ResourceKind::Sampler);
        Ok(state.samplers.insert(*desc))
    }

    fn destroy_sampler(&self, sampler: SamplerHandle) {
        let mut state = self.mutate();
        if state.samplers.remove(sampler).is_some() {
            state.count_destroy(ResourceKind::Sampler);
        }
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> RenderResult<PipelineHandle> {
        if desc.vertex_spirv.is_empty() || desc.fragment_spirv.is_empty() {
            return Err(RenderError::InvalidArgument(format!("pipeline '{}' has an empty stage", desc.label)));
        }
        if self.fail_pipelines.load(Ordering::SeqCst) {
            return Err(RenderError::Api(ash::vk::Result::ERROR_INITIALIZATION_FAILED));
        }
        let mut state = self.mutate();
        state.count_create(ResourceKind::Pipeline);
        Ok(state.pipelines.insert(desc.clone()))
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        let mut state = self.mutate();
        if state.pipelines.remove(pipeline).is_some() {
            state.count_destroy(ResourceKind::Pipeline);
        }
    }

    fn create_binding_set(&self, pipeline: PipelineHandle, bindings: &[Binding]) -> RenderResult<BindingSetHandle> {
        let mut state = self.mutate();
        let desc = state.pipelines.get(pipeline).ok_or_else(|| self.unknown("pipeline"))?;
        if bindings.len() != 1 + desc.texture_slots as usize {
            return Err(RenderError::InvalidArgument(format!(
                "pipeline '{}' expects {} bindings, got {}",
                desc.label,
                1 + desc.texture_slots,
                bindings.len()
            )));
        }
        for binding in bindings {
            let resolved = match *binding {
                Binding::Uniform { buffer, .. } => state.buffers.contains_key(buffer),
                Binding::Texture { image, sampler } => {
                    state.images.contains_key(image) && state.samplers.contains_key(sampler)
                }
            };
            if !resolved {
                return Err(self.unknown("binding resource"));
            }
        }
        state.count_create(ResourceKind::BindingSet);
        Ok(state.binding_sets.insert((pipeline, bindings.to_vec())))
    }

    fn destroy_binding_set(&self, set: BindingSetHandle) {
        let mut state = self.mutate();
        if state.binding_sets.remove(set).is_some() {
            state.count_destroy(ResourceKind::BindingSet);
        }
    }

    fn create_swapchain(&self, request: &SwapchainRequest) -> RenderResult<SwapchainInfo> {
        if self.fail_swapchain.load(Ordering::SeqCst) {
            return Err(RenderError::Api(ash::vk::Result::ERROR_NATIVE_WINDOW_IN_USE_KHR));
        }
        if request.extent.is_empty() {
            return Err(RenderError::InvalidArgument("swapchain extent is empty".into()));
        }
        let info = SwapchainInfo {
            extent: request.extent,
            format: request.format.unwrap_or(ImageFormat::Bgra8Srgb),
            image_count: SIMULATED_IMAGE_COUNT,
        };
        let mut state = self.mutate();
        if state.swapchain.replace(info).is_some() {
            state.count_destroy(ResourceKind::Swapchain);
        }
        state.count_create(ResourceKind::Swapchain);
        state.next_image = 0;
        Ok(info)
    }

    fn destroy_swapchain(&self) {
        let mut state = self.mutate();
        if state.swapchain.take().is_some() {
            state.count_destroy(ResourceKind::Swapchain);
        }
        state.pending.clear();
    }

    fn recreate_frame_sync(&self, frames_in_flight: usize) -> RenderResult<()> {
        if frames_in_flight == 0 {
            return Err(RenderError::InvalidArgument("frames in flight must be non-zero".into()));
        }
        let mut state = self.mutate();
        state.frame_slots = frames_in_flight;
        state.pending.clear();
        Ok(())
    }

    fn acquire_frame(&self, frame_slot: usize) -> RenderResult<AcquireOutcome> {
        let mut state = self.state();
        let swapchain = state.swapchain.ok_or(RenderError::SwapchainOutOfDate)?;
        if frame_slot >= state.frame_slots {
            return Err(RenderError::InvalidArgument(format!("frame slot {} out of range", frame_slot)));
        }
        let forced = self
            .out_of_date_acquires
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if forced {
            return Ok(AcquireOutcome::OutOfDate);
        }
        let image_index = state.next_image;
        state.next_image = (image_index + 1) % swapchain.image_count;
        Ok(AcquireOutcome::Acquired {
            image_index,
            suboptimal: false,
        })
    }

    fn begin_commands(
        &self,
        frame_slot: usize,
        image_index: u32,
        _clear: &ClearValues,
    ) -> RenderResult<Box<dyn CommandRecorder + '_>> {
        if self.fail_recording.load(Ordering::SeqCst) {
            return Err(RenderError::Device {
                device: self.physical_index,
                reason: "command recording failed".into(),
            });
        }
        let state = self.state();
        let swapchain = state.swapchain.ok_or(RenderError::SwapchainOutOfDate)?;
        if image_index >= swapchain.image_count || frame_slot >= state.frame_slots {
            return Err(RenderError::InvalidArgument(format!(
                "frame slot {} / image {} out of range",
                frame_slot, image_index
            )));
        }
        Ok(Box::new(HeadlessRecorder {
            device: self,
            frame_slot,
            commands: Vec::new(),
        }))
    }

    fn submit_and_present(&self, frame_slot: usize, _image_index: u32) -> RenderResult<PresentOutcome> {
        let mut state = self.mutate();
        if state.swapchain.is_none() {
            return Ok(PresentOutcome::OutOfDate);
        }
        let commands = state.pending.remove(&frame_slot).ok_or_else(|| {
            RenderError::InvalidArgument(format!("no recorded commands for frame slot {}", frame_slot))
        })?;
        state.last_frame = commands;
        state.presented += 1;
        Ok(PresentOutcome::Presented)
    }

    fn wait_idle(&self) -> RenderResult<()> {
        Ok(())
    }
}

struct HeadlessRecorder<'a> {
    device: &'a HeadlessDevice,
    frame_slot: usize,
    commands: Vec<RecordedCommand>,
}

impl HeadlessRecorder<'_> {
    fn check<F>(&self, kind: &'static str, exists: F) -> RenderResult<()>
    where
        F: FnOnce(&HeadlessState) -> bool,
    {
        let state = self.device.state();
        if exists(&*state) {
            Ok(())
        } else {
            Err(self.device.unknown(kind))
        }
    }
}

impl CommandRecorder for HeadlessRecorder<'_> {
    fn bind_pipeline(&mut self, pipeline: PipelineHandle) -> RenderResult<()> {
        self.check("pipeline", |s| s.pipelines.contains_key(pipeline))?;
        self.commands.push(RecordedCommand::BindPipeline(pipeline));
        Ok(())
    }

    fn push_constants(&mut self, pipeline: PipelineHandle, data: &[u8]) -> RenderResult<()> {
        self.check("pipeline", |s| s.pipelines.contains_key(pipeline))?;
        self.commands.push(RecordedCommand::PushConstants(data.to_vec()));
        Ok(())
    }

    fn bind_binding_set(&mut self, pipeline: PipelineHandle, set: BindingSetHandle) -> RenderResult<()> {
        self.check("binding set", |s| {
            s.pipelines.contains_key(pipeline) && s.binding_sets.contains_key(set)
        })?;
        self.commands.push(RecordedCommand::BindBindingSet(set));
        Ok(())
    }

    fn bind_vertex_buffer(&mut self, buffer: BufferHandle) -> RenderResult<()> {
        self.check("buffer", |s| s.buffers.contains_key(buffer))?;
        self.commands.push(RecordedCommand::BindVertexBuffer(buffer));
        Ok(())
    }

    fn bind_index_buffer(&mut self, buffer: BufferHandle) -> RenderResult<()> {
        self.check("buffer", |s| s.buffers.contains_key(buffer))?;
        self.commands.push(RecordedCommand::BindIndexBuffer(buffer));
        Ok(())
    }

    fn draw_indexed(&mut self, index_count: u32, first_index: u32) {
        self.commands.push(RecordedCommand::DrawIndexed {
            index_count,
            first_index,
        });
    }

    fn finish(self: Box<Self>) -> RenderResult<()> {
        let HeadlessRecorder {
            device,
            frame_slot,
            commands,
        } = *self;
        device.state().pending.insert(frame_slot, commands);
        Ok(())
    }
}

/// Backend over a configurable list of simulated adapters
pub struct HeadlessBackend {
    adapters: Vec<PhysicalDeviceInfo>,
    failing_opens: Mutex<HashSet<usize>>,
    opened: Mutex<Vec<Arc<HeadlessDevice>>>,
}

impl HeadlessBackend {
    /// Backend over explicit adapter descriptors (indices are reassigned in order)
    pub fn new(adapters: Vec<PhysicalDeviceInfo>) -> Self {
        let adapters = adapters
            .into_iter()
            .enumerate()
            .map(|(index, mut info)| {
                info.index = index;
                info
            })
            .collect();
        Self {
            adapters,
            failing_opens: Mutex::new(HashSet::new()),
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Backend with `count` identical, fully capable discrete adapters
    pub fn with_devices(count: usize) -> Self {
        Self::new(
            (0..count)
                .map(|i| PhysicalDeviceInfo::simulated(i, &format!("Simulated GPU {}", i), DeviceClass::Discrete))
                .collect(),
        )
    }

    /// Make opening the adapter at `physical_index` fail
    pub fn fail_open(&self, physical_index: usize) {
        self.failing_opens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(physical_index);
    }

    /// Most recently opened device on adapter `physical_index`
    pub fn device(&self, physical_index: usize) -> Option<Arc<HeadlessDevice>> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|device| device.physical_index == physical_index)
            .cloned()
    }

    /// Number of devices opened so far
    pub fn open_count(&self) -> usize {
        self.opened.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl GpuBackend for HeadlessBackend {
    fn name(&self) -> &str {
        "headless"
    }

    fn instance_support(&self) -> InstanceSupport {
        InstanceSupport {
            layers: vec![VALIDATION_LAYER.to_string()],
            extensions: vec![DEBUG_UTILS_EXTENSION.to_string()],
        }
    }

    fn enumerate_physical_devices(&self) -> RenderResult<Vec<PhysicalDeviceInfo>> {
        Ok(self.adapters.clone())
    }

    fn open_device(
        &self,
        info: &PhysicalDeviceInfo,
        features: &CapabilityChain,
        _device_extensions: &[String],
    ) -> RenderResult<Arc<dyn DeviceDriver>> {
        let failing = self
            .failing_opens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&info.index);
        if failing {
            return Err(RenderError::Api(ash::vk::Result::ERROR_INITIALIZATION_FAILED));
        }
        if !(features.dynamic_rendering && features.extended_dynamic_state) {
            return Err(RenderError::MissingCapability(format!("{}: feature chain incomplete", info.name)));
        }

        let device = Arc::new(HeadlessDevice::new(info));
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&device));
        log::debug!("Opened {}", device.label);
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::hal::{BufferUsage, Extent2D};

    fn open(backend: &HeadlessBackend) -> Arc<HeadlessDevice> {
        let info = backend.enumerate_physical_devices().unwrap().remove(0);
        let chain = CapabilityChain {
            dynamic_rendering: true,
            extended_dynamic_state: true,
            ..CapabilityChain::default()
        };
        backend.open_device(&info, &chain, &[]).unwrap();
        backend.device(0).unwrap()
    }

    #[test]
    fn test_static_buffers_reject_host_access() {
        let backend = HeadlessBackend::with_devices(1);
        let device = open(&backend);
        let desc = BufferDesc {
            label: "vb".into(),
            size: 8,
            usage: BufferUsage::VERTEX,
            mode: MemoryMode::Static,
        };
        let handle = device.create_buffer(&desc, Some(&[1, 2, 3, 4])).unwrap();

        assert!(device.write_buffer(handle, 0, &[0]).is_err());
        assert!(device.read_buffer(handle, 0, 4).is_err());
        assert_eq!(device.buffer_contents(handle).unwrap(), vec![1, 2, 3, 4, 0, 0, 0, 0]);
        assert_eq!(device.uploads(), 1);
    }

    #[test]
    fn test_acquire_cycles_images() {
        let backend = HeadlessBackend::with_devices(1);
        let device = open(&backend);
        device
            .create_swapchain(&SwapchainRequest {
                extent: Extent2D::new(64, 64),
                format: None,
                vsync: true,
            })
            .unwrap();
        device.recreate_frame_sync(2).unwrap();

        let indices: Vec<_> = (0..4)
            .map(|_| match device.acquire_frame(0).unwrap() {
                AcquireOutcome::Acquired { image_index, .. } => image_index,
                AcquireOutcome::OutOfDate => u32::MAX,
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 0]);

        device.force_out_of_date(1);
        assert_eq!(device.acquire_frame(1).unwrap(), AcquireOutcome::OutOfDate);
    }

    #[test]
    fn test_open_failure_injection() {
        let backend = HeadlessBackend::with_devices(2);
        backend.fail_open(1);
        let info = backend.enumerate_physical_devices().unwrap().remove(1);
        let chain = CapabilityChain {
            dynamic_rendering: true,
            extended_dynamic_state: true,
            ..CapabilityChain::default()
        };
        assert!(backend.open_device(&info, &chain, &[]).is_err());
        assert_eq!(backend.open_count(), 0);
    }
}
