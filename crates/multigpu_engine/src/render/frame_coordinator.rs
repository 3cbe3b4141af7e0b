//! Frame loop: swapchain upkeep, acquire, record, submit and present
//!
//! Presentation is lock-step mirrored. Every presenting device acquires an
//! image for the same frame slot, records the whole render queue, and the
//! submit+present tasks are fanned out to the device workers and joined
//! before the frame counts as finished. Resize notifications only mark the
//! swapchain stale; recreation happens at the start of the next frame.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::{EngineContext, JobHandle};
use crate::render::device::{join_all, DeviceGroup, LogicalDevice};
use crate::render::error::RenderResult;
use crate::render::hal::{AcquireOutcome, ClearValues, Extent2D, GpuBackend, ImageFormat, PresentOutcome};
use crate::render::resources::{
    BufferRegistry, Material, MaterialDesc, MaterialInfo, MaterialRegistry, TargetFormats, TextureRegistry,
};
use crate::render::surface::{PresentationSurface, SurfaceEvent};
use crate::scene::{RenderStats, SceneOrchestrator};

/// Result of one [`FrameCoordinator::render_frame`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// A frame was presented on every presenting device
    Presented,
    /// Nothing was presented (surface minimized or swapchain out of date)
    Skipped,
    /// Swapchains were rebuilt; the next call renders
    Recreated,
}

/// Returned by the per-frame tick to keep or stop the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    /// Keep rendering
    Continue,
    /// Leave the loop
    Exit,
}

/// Owns the device group, the registries and the scene
pub struct FrameCoordinator {
    scene: SceneOrchestrator,
    buffers: Arc<BufferRegistry>,
    materials: Arc<MaterialRegistry>,
    textures: Arc<TextureRegistry>,
    group: DeviceGroup,
    context: Arc<EngineContext>,
    extent: Extent2D,
    pending_extent: Option<Extent2D>,
    frames_in_flight: usize,
    frame_slot: usize,
    frame_number: u64,
    clear: ClearValues,
    last_stats: RenderStats,
    shut_down: bool,
}

impl FrameCoordinator {
    /// Select devices, create swapchains at `extent` and set up empty registries
    pub fn new(context: Arc<EngineContext>, backend: Arc<dyn GpuBackend>, extent: Extent2D) -> RenderResult<Self> {
        let mut group = DeviceGroup::new(backend, Arc::clone(&context));
        group.enumerate()?;
        group.initialize_devices()?;
        group.create_swapchain(extent)?;

        let frames_in_flight = context.config().renderer.frames_in_flight;
        let buffers = Arc::new(BufferRegistry::new(group.devices()));
        let materials = Arc::new(MaterialRegistry::new(group.devices()));
        let textures = Arc::new(TextureRegistry::new(group.devices()));
        let mut scene = SceneOrchestrator::new(
            Arc::clone(&buffers),
            Arc::clone(&materials),
            Arc::clone(&textures),
            frames_in_flight,
        );
        scene.camera_mut().set_viewport(extent.width, extent.height);

        let clear = ClearValues {
            color: context.config().renderer.clear_color,
            ..ClearValues::default()
        };
        log::info!(
            "Frame coordinator ready: {} device(s), {} frame(s) in flight",
            group.device_count(),
            frames_in_flight
        );
        Ok(Self {
            scene,
            buffers,
            materials,
            textures,
            group,
            context,
            extent,
            pending_extent: None,
            frames_in_flight,
            frame_slot: 0,
            frame_number: 0,
            clear,
            last_stats: RenderStats::default(),
            shut_down: false,
        })
    }

    /// Shared engine context
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    /// Device group
    pub fn device_group(&self) -> &DeviceGroup {
        &self.group
    }

    /// Scene
    pub fn scene(&self) -> &SceneOrchestrator {
        &self.scene
    }

    /// Scene for mutation
    pub fn scene_mut(&mut self) -> &mut SceneOrchestrator {
        &mut self.scene
    }

    /// Buffer registry
    pub fn buffers(&self) -> &Arc<BufferRegistry> {
        &self.buffers
    }

    /// Material registry
    pub fn materials(&self) -> &Arc<MaterialRegistry> {
        &self.materials
    }

    /// Texture registry
    pub fn textures(&self) -> &Arc<TextureRegistry> {
        &self.textures
    }

    /// Current target extent
    pub fn extent(&self) -> Extent2D {
        self.extent
    }

    /// Frames presented so far
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Scene counters of the last frame on the primary device
    pub fn last_stats(&self) -> RenderStats {
        self.last_stats
    }

    /// Attachment formats pipelines must target
    pub fn target_formats(&self) -> TargetFormats {
        TargetFormats {
            color: self
                .group
                .swapchain_info()
                .map_or(ImageFormat::Bgra8Srgb, |info| info.format),
            depth: Some(ImageFormat::Depth32Float),
        }
    }

    /// Register a material and compile it now
    pub fn create_material(&self, id: &str, desc: MaterialDesc) -> RenderResult<Arc<Material>> {
        let info = MaterialInfo {
            desc,
            targets: self.target_formats(),
        };
        self.materials.create_compiled(id, info, &self.context)
    }

    /// Register a material and compile it on the thread pool
    pub fn create_material_deferred(
        &self,
        id: &str,
        desc: MaterialDesc,
    ) -> RenderResult<(Arc<Material>, JobHandle<RenderResult<()>>)> {
        let info = MaterialInfo {
            desc,
            targets: self.target_formats(),
        };
        self.materials.create_deferred(id, info, &self.context)
    }

    /// Record a new framebuffer size; applied before the next frame
    pub fn notify_resized(&mut self, extent: Extent2D) {
        log::debug!("Resize to {}x{} requested", extent.width, extent.height);
        self.pending_extent = Some(extent);
        self.group.mark_swapchain_stale();
    }

    /// Tear down and rebuild the whole device set
    ///
    /// Every object, texture and material is released first because their
    /// per-device instances belong to the old devices.
    pub fn reinitialize_devices(&mut self, multi_gpu: bool) -> RenderResult<()> {
        log::info!("Reinitializing devices (multi-GPU {})", multi_gpu);
        self.release_resources();
        self.group.set_multi_gpu_enabled(multi_gpu);
        self.group.initialize_devices()?;
        self.group.create_swapchain(self.extent)?;

        self.buffers = Arc::new(BufferRegistry::new(self.group.devices()));
        self.materials = Arc::new(MaterialRegistry::new(self.group.devices()));
        self.textures = Arc::new(TextureRegistry::new(self.group.devices()));
        let camera = self.scene.camera().clone();
        self.scene = SceneOrchestrator::new(
            Arc::clone(&self.buffers),
            Arc::clone(&self.materials),
            Arc::clone(&self.textures),
            self.frames_in_flight,
        );
        *self.scene.camera_mut() = camera;
        self.frame_slot = 0;
        Ok(())
    }

    fn recreate_swapchain(&mut self) -> RenderResult<()> {
        self.group.recreate_swapchain(self.extent)?;
        self.scene.devices_idle();
        self.frame_slot = 0;
        self.scene.camera_mut().set_viewport(self.extent.width, self.extent.height);
        Ok(())
    }

    /// Render and present one frame on every presenting device
    pub fn render_frame(&mut self) -> RenderResult<FrameStatus> {
        if let Some(extent) = self.pending_extent.take() {
            self.extent = extent;
        }
        if self.group.needs_recreation() {
            if self.extent.is_empty() {
                return Ok(FrameStatus::Skipped);
            }
            self.recreate_swapchain()?;
            return Ok(FrameStatus::Recreated);
        }

        let slot = self.frame_slot;
        let targets = self.acquire(slot)?;
        if targets.is_empty() {
            self.group.mark_swapchain_stale();
            return Ok(FrameStatus::Skipped);
        }

        let mut recorded = Vec::with_capacity(targets.len());
        for (device, image_index) in targets {
            match self.record(&device, slot, image_index) {
                Ok(stats) => {
                    if device.is_primary() {
                        self.last_stats = stats;
                    }
                    recorded.push((device, image_index));
                }
                Err(e) => {
                    // The acquired image and its semaphore stay unconsumed
                    self.group.mark_swapchain_stale();
                    if device.is_primary() {
                        return Err(e);
                    }
                    log::warn!("Device {} skipped this frame: {}", device.index(), e);
                }
            }
        }

        if !recorded.is_empty() {
            self.scene.frame_submitted(slot);
        }
        self.present(slot, &recorded)?;
        self.frame_slot = (slot + 1) % self.frames_in_flight;
        self.frame_number += 1;
        Ok(FrameStatus::Presented)
    }

    /// Acquire on every presenting device; empty when any swapchain is out of date
    fn acquire(&mut self, slot: usize) -> RenderResult<Vec<(Arc<LogicalDevice>, u32)>> {
        let devices = self.group.presenting_devices();
        let handles: Vec<_> = devices
            .iter()
            .map(|device| device.execute(move |driver| driver.acquire_frame(slot)))
            .collect();

        let presenting = devices.len();
        let mut targets = Vec::with_capacity(presenting);
        let mut out_of_date = false;
        for (device, result) in devices.into_iter().zip(join_all(handles)) {
            match result.and_then(|acquired| acquired) {
                Ok(AcquireOutcome::Acquired { image_index, suboptimal }) => {
                    if suboptimal {
                        self.group.mark_swapchain_stale();
                    }
                    targets.push((device, image_index));
                }
                Ok(AcquireOutcome::OutOfDate) => out_of_date = true,
                Err(e) if e.is_out_of_date() => out_of_date = true,
                Err(e) if device.is_primary() => {
                    self.group.mark_swapchain_stale();
                    return Err(e);
                }
                Err(e) => log::warn!("Acquire on device {} failed: {}", device.index(), e),
            }
        }
        if out_of_date {
            log::debug!("Swapchain out of date at acquire");
            targets.clear();
        } else if targets.len() == presenting {
            self.scene.frame_slot_completed(slot);
        }
        Ok(targets)
    }

    fn record(&mut self, device: &LogicalDevice, slot: usize, image_index: u32) -> RenderResult<RenderStats> {
        let mut recorder = device.driver().begin_commands(slot, image_index, &self.clear)?;
        let stats = self.scene.render_all_objects(&mut *recorder, device.index(), slot);
        recorder.finish()?;
        Ok(stats)
    }

    fn present(&mut self, slot: usize, recorded: &[(Arc<LogicalDevice>, u32)]) -> RenderResult<()> {
        let handles: Vec<_> = recorded
            .iter()
            .map(|(device, image_index)| {
                let image_index = *image_index;
                device.execute(move |driver| driver.submit_and_present(slot, image_index))
            })
            .collect();

        for ((device, _), result) in recorded.iter().zip(join_all(handles)) {
            match result.and_then(|presented| presented) {
                Ok(PresentOutcome::Presented) => {}
                Ok(PresentOutcome::Suboptimal | PresentOutcome::OutOfDate) => self.group.mark_swapchain_stale(),
                Err(e) if e.is_out_of_date() => self.group.mark_swapchain_stale(),
                Err(e) if device.is_primary() => return Err(e),
                Err(e) => log::warn!("Present on device {} failed: {}", device.index(), e),
            }
        }
        Ok(())
    }

    /// Drive frames until the surface closes or `tick` returns [`LoopControl::Exit`]
    ///
    /// `tick` runs once per frame with the time since the previous one.
    /// Returns the number of frames presented by this call.
    pub fn run<S, F>(&mut self, surface: &mut S, mut tick: F) -> RenderResult<u64>
    where
        S: PresentationSurface + ?Sized,
        F: FnMut(&mut SceneOrchestrator, Duration) -> LoopControl,
    {
        let start_frame = self.frame_number;
        let initial = surface.framebuffer_extent();
        if initial != self.extent {
            self.notify_resized(initial);
        }

        let mut last = Instant::now();
        loop {
            for event in surface.pump_events() {
                match event {
                    SurfaceEvent::Resized(extent) => self.notify_resized(extent),
                    SurfaceEvent::CloseRequested => log::info!("Close requested"),
                }
            }
            if surface.should_close() {
                break;
            }

            let now = Instant::now();
            let delta = now - last;
            last = now;
            if tick(&mut self.scene, delta) == LoopControl::Exit {
                break;
            }

            match self.render_frame() {
                Ok(FrameStatus::Skipped) if self.extent.is_empty() => surface.wait_events(),
                Ok(_) => {}
                Err(e) if e.is_out_of_date() => self.group.mark_swapchain_stale(),
                Err(e) => {
                    log::error!("Frame {} failed: {}", self.frame_number, e);
                    return Err(e);
                }
            }
        }

        self.group.wait_idle()?;
        self.scene.devices_idle();
        Ok(self.frame_number - start_frame)
    }

    fn release_resources(&mut self) {
        if let Err(e) = self.group.wait_idle() {
            log::warn!("Releasing resources without idle devices: {}", e);
        }
        self.scene.clear();
        self.textures.clear();
        self.materials.clear();
        self.buffers.clear();
    }

    /// Release the scene, then registries, then devices
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        log::info!("Shutting down after {} frame(s)", self.frame_number);
        self.release_resources();
        self.group.shutdown();
        self.shut_down = true;
    }
}

impl Drop for FrameCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for FrameCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCoordinator")
            .field("devices", &self.group.device_count())
            .field("extent", &self.extent)
            .field("frame", &self.frame_number)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EngineConfig;
    use crate::render::backends::headless::{HeadlessBackend, RecordedCommand, ResourceKind};
    use crate::render::surface::HeadlessSurface;
    use crate::scene::{MeshData, Transform};
    use crate::test_support::FakeCompiler;

    fn coordinator(devices: usize) -> (FrameCoordinator, Arc<HeadlessBackend>) {
        let backend = Arc::new(HeadlessBackend::with_devices(devices));
        let context = EngineContext::new(EngineConfig::new("frames").with_multi_gpu(true))
            .unwrap()
            .with_shader_compiler(Arc::new(FakeCompiler::default()));
        let frames = FrameCoordinator::new(Arc::new(context), backend.clone(), Extent2D::new(640, 480)).unwrap();
        (frames, backend)
    }

    fn populate(frames: &mut FrameCoordinator) {
        frames
            .create_material("basic", MaterialDesc::new("object.vert", "object.frag"))
            .unwrap();
        frames
            .scene_mut()
            .create_object("cube", MeshData::cube(1.0), "basic", Transform::default())
            .unwrap();
    }

    #[test]
    fn test_frame_is_presented_on_every_device() {
        let (mut frames, backend) = coordinator(2);
        populate(&mut frames);

        assert_eq!(frames.render_frame().unwrap(), FrameStatus::Presented);
        for device in 0..2 {
            let headless = backend.device(device).unwrap();
            assert_eq!(headless.presented_frames(), 1);
            assert!(headless
                .last_frame_commands()
                .iter()
                .any(|c| matches!(c, RecordedCommand::DrawIndexed { index_count: 36, .. })));
        }
        assert_eq!(frames.last_stats().drawn, 1);
        assert_eq!(frames.frame_number(), 1);
    }

    #[test]
    fn test_resize_recreates_before_next_frame() {
        let (mut frames, backend) = coordinator(2);
        populate(&mut frames);
        frames.notify_resized(Extent2D::new(1024, 768));

        assert_eq!(frames.render_frame().unwrap(), FrameStatus::Recreated);
        assert_eq!(frames.render_frame().unwrap(), FrameStatus::Presented);
        for device in 0..2 {
            let swapchain = backend.device(device).unwrap().swapchain().unwrap();
            assert_eq!(swapchain.extent, Extent2D::new(1024, 768));
        }
    }

    #[test]
    fn test_out_of_date_acquire_skips_then_recreates() {
        let (mut frames, backend) = coordinator(1);
        populate(&mut frames);
        backend.device(0).unwrap().force_out_of_date(1);

        assert_eq!(frames.render_frame().unwrap(), FrameStatus::Skipped);
        assert_eq!(frames.device_group().state(), crate::render::DeviceGroupState::SwapchainStale);
        assert_eq!(frames.render_frame().unwrap(), FrameStatus::Recreated);
        assert_eq!(frames.render_frame().unwrap(), FrameStatus::Presented);
    }

    #[test]
    fn test_minimized_surface_skips_frames() {
        let (mut frames, _backend) = coordinator(1);
        frames.notify_resized(Extent2D::new(0, 0));

        assert_eq!(frames.render_frame().unwrap(), FrameStatus::Skipped);
        assert!(frames.device_group().needs_recreation());
        frames.notify_resized(Extent2D::new(320, 200));
        assert_eq!(frames.render_frame().unwrap(), FrameStatus::Recreated);
    }

    #[test]
    fn test_secondary_without_swapchain_stops_presenting() {
        let (mut frames, backend) = coordinator(2);
        populate(&mut frames);
        backend.device(1).unwrap().set_fail_swapchain_creation(true);
        frames.notify_resized(Extent2D::new(800, 600));

        assert_eq!(frames.render_frame().unwrap(), FrameStatus::Recreated);
        assert_eq!(frames.render_frame().unwrap(), FrameStatus::Presented);
        assert_eq!(backend.device(0).unwrap().presented_frames(), 1);
        assert_eq!(backend.device(1).unwrap().presented_frames(), 0);
        assert_eq!(frames.device_group().device_count(), 2);
    }

    #[test]
    fn test_run_until_surface_closes() {
        let (mut frames, backend) = coordinator(1);
        populate(&mut frames);
        let mut surface = HeadlessSurface::new(Extent2D::new(640, 480)).close_after(3);

        let mut ticks = 0;
        let presented = frames
            .run(&mut surface, |scene, _| {
                ticks += 1;
                if let Some(cube) = scene.object_mut("cube") {
                    cube.set_rotation(crate::foundation::math::Vec3::new(0.0, ticks as f32 * 0.1, 0.0));
                }
                LoopControl::Continue
            })
            .unwrap();

        assert_eq!(presented, 3);
        assert_eq!(ticks, 3);
        assert_eq!(backend.device(0).unwrap().presented_frames(), 3);
    }

    #[test]
    fn test_tick_can_exit() {
        let (mut frames, _backend) = coordinator(1);
        let mut surface = HeadlessSurface::new(Extent2D::new(640, 480));
        let presented = frames.run(&mut surface, |_, _| LoopControl::Exit).unwrap();
        assert_eq!(presented, 0);
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let (mut frames, backend) = coordinator(2);
        populate(&mut frames);
        frames.render_frame().unwrap();
        frames.shutdown();

        for device in 0..2 {
            let headless = backend.device(device).unwrap();
            for kind in [
                ResourceKind::Buffer,
                ResourceKind::Pipeline,
                ResourceKind::BindingSet,
                ResourceKind::Swapchain,
            ] {
                assert_eq!(headless.live(kind), 0, "{:?} leaked on device {}", kind, device);
            }
        }
        frames.shutdown();
    }

    #[test]
    fn test_reinitialize_to_single_gpu() {
        let (mut frames, backend) = coordinator(3);
        populate(&mut frames);
        assert_eq!(frames.device_group().device_count(), 3);

        frames.reinitialize_devices(false).unwrap();
        assert_eq!(frames.device_group().device_count(), 1);
        assert_eq!(frames.scene().object_count(), 0);
        assert_eq!(backend.device(1).unwrap().live(ResourceKind::Buffer), 0);

        populate(&mut frames);
        assert_eq!(frames.render_frame().unwrap(), FrameStatus::Presented);
    }

    #[test]
    fn test_removed_object_outlives_its_frame() {
        let (mut frames, backend) = coordinator(2);
        populate(&mut frames);
        assert_eq!(frames.render_frame().unwrap(), FrameStatus::Presented);

        assert!(frames.scene_mut().remove_object("cube"));
        assert_eq!(frames.scene().retired_count(), 1);
        assert!(frames.buffers().is_empty());
        assert_eq!(backend.device(0).unwrap().live(ResourceKind::Buffer), 4);

        // The next frame reuses the other slot, whose fence says nothing about the cube
        assert_eq!(frames.render_frame().unwrap(), FrameStatus::Presented);
        assert_eq!(frames.scene().retired_count(), 1);

        assert_eq!(frames.render_frame().unwrap(), FrameStatus::Presented);
        assert_eq!(frames.scene().retired_count(), 0);
        for device in 0..2 {
            let headless = backend.device(device).unwrap();
            assert_eq!(headless.live(ResourceKind::Buffer), 0);
            assert_eq!(headless.live(ResourceKind::BindingSet), 0);
        }
    }

    #[test]
    fn test_failed_recording_rebuilds_frame_sync() {
        let (mut frames, backend) = coordinator(1);
        populate(&mut frames);
        let device = backend.device(0).unwrap();
        device.set_fail_recording(true);

        assert!(frames.render_frame().is_err());
        assert!(frames.device_group().needs_recreation());

        device.set_fail_recording(false);
        assert_eq!(frames.render_frame().unwrap(), FrameStatus::Recreated);
        assert_eq!(frames.render_frame().unwrap(), FrameStatus::Presented);
    }
}
