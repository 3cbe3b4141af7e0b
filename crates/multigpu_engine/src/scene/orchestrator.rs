//! Scene orchestration: entity registry, material usage and the draw loop

use std::collections::HashMap;
use std::sync::Arc;

use crate::render::error::{RenderError, RenderResult};
use crate::render::hal::CommandRecorder;
use crate::render::resources::{BufferRegistry, MaterialRegistry, TextureRegistry};
use crate::scene::camera::Camera;
use crate::scene::entity::{DrawStatus, EntityDesc, RenderableEntity, Transform};
use crate::scene::geometry::{MeshData, Submesh};
use crate::scene::render_queue::RenderQueue;

/// Parameters of [`SceneOrchestrator::create_object_with`]
#[derive(Debug, Clone)]
pub struct ObjectDesc {
    /// Geometry
    pub mesh: MeshData,
    /// Primary material identifier
    pub material_id: String,
    /// Texture identifiers, in binding order
    pub texture_ids: Vec<String>,
    /// Index ranges drawn with their own materials
    pub submeshes: Vec<Submesh>,
    /// Initial transform
    pub transform: Transform,
}

impl ObjectDesc {
    /// Untextured single-material object
    pub fn new(mesh: MeshData, material_id: &str) -> Self {
        Self {
            mesh,
            material_id: material_id.to_string(),
            texture_ids: Vec::new(),
            submeshes: Vec::new(),
            transform: Transform::default(),
        }
    }

    /// Bind textures by identifier
    pub fn with_textures(mut self, texture_ids: &[&str]) -> Self {
        self.texture_ids = texture_ids.iter().map(|id| id.to_string()).collect();
        self
    }

    /// Split into submeshes
    pub fn with_submeshes(mut self, submeshes: Vec<Submesh>) -> Self {
        self.submeshes = submeshes;
        self
    }

    /// Initial transform
    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }
}

/// Counters of one [`SceneOrchestrator::render_all_objects`] pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RenderStats {
    /// Entities that recorded draws
    pub drawn: usize,
    /// Entities skipped for a missing or uncompiled material
    pub skipped: usize,
    /// Entities whose recording failed
    pub failed: usize,
    /// Pipeline binds issued by the loop
    pub pipeline_binds: usize,
}

/// A removed entity kept alive until the GPU is done with its last frame
struct Retired {
    entity: RenderableEntity,
    slot: usize,
}

/// Owns the scene's entities and records them each frame
pub struct SceneOrchestrator {
    buffers: Arc<BufferRegistry>,
    materials: Arc<MaterialRegistry>,
    textures: Arc<TextureRegistry>,
    entities: HashMap<String, RenderableEntity>,
    material_usage: HashMap<String, usize>,
    queue: RenderQueue,
    frames_in_flight: usize,
    camera: Camera,
    retired: Vec<Retired>,
    in_flight_slot: Option<usize>,
}

impl SceneOrchestrator {
    /// Empty scene over the given registries
    pub fn new(
        buffers: Arc<BufferRegistry>,
        materials: Arc<MaterialRegistry>,
        textures: Arc<TextureRegistry>,
        frames_in_flight: usize,
    ) -> Self {
        Self {
            buffers,
            materials,
            textures,
            entities: HashMap::new(),
            material_usage: HashMap::new(),
            queue: RenderQueue::new(),
            frames_in_flight,
            camera: Camera::default(),
            retired: Vec::new(),
            in_flight_slot: None,
        }
    }

    /// Buffer registry backing entity geometry
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

    /// Create an untextured object
    pub fn create_object(
        &mut self,
        id: &str,
        mesh: MeshData,
        material_id: &str,
        transform: Transform,
    ) -> RenderResult<&mut RenderableEntity> {
        self.create_object_with(id, ObjectDesc::new(mesh, material_id).with_transform(transform))
    }

    /// Create an object sampling the given textures
    pub fn create_textured_object(
        &mut self,
        id: &str,
        mesh: MeshData,
        material_id: &str,
        texture_ids: &[&str],
        transform: Transform,
    ) -> RenderResult<&mut RenderableEntity> {
        if texture_ids.is_empty() {
            return Err(RenderError::InvalidArgument(format!(
                "textured object '{}' needs at least one texture",
                id
            )));
        }
        let desc = ObjectDesc::new(mesh, material_id)
            .with_textures(texture_ids)
            .with_transform(transform);
        self.create_object_with(id, desc)
    }

    /// Create an object; an existing identifier returns the existing object
    ///
    /// Textures must already be registered. Materials may be registered later.
    pub fn create_object_with(&mut self, id: &str, desc: ObjectDesc) -> RenderResult<&mut RenderableEntity> {
        if self.entities.contains_key(id) {
            log::warn!("Object '{}' already exists, returning existing", id);
            return self.entities.get_mut(id).ok_or_else(|| unknown(id));
        }

        let textures = desc
            .texture_ids
            .iter()
            .map(|texture_id| {
                self.textures.get(texture_id).ok_or_else(|| {
                    RenderError::InvalidArgument(format!("object '{}': texture '{}' not found", id, texture_id))
                })
            })
            .collect::<RenderResult<Vec<_>>>()?;
        let submeshes = desc
            .submeshes
            .into_iter()
            .map(|submesh| {
                let material = self.materials.get(&submesh.material);
                (submesh, material)
            })
            .collect();

        let entity = RenderableEntity::new(
            id,
            EntityDesc {
                mesh: desc.mesh,
                material: self.materials.get(&desc.material_id),
                material_id: desc.material_id,
                textures,
                submeshes,
                transform: desc.transform,
                frames_in_flight: self.frames_in_flight,
            },
            Arc::clone(&self.buffers),
        )?;

        for material_id in entity.material_ids() {
            *self.material_usage.entry(material_id).or_insert(0) += 1;
        }
        log::debug!("Created object '{}' with material '{}'", id, entity.material_id());
        self.entities.insert(id.to_string(), entity);
        self.rebuild_render_queue();
        self.entities.get_mut(id).ok_or_else(|| unknown(id))
    }

    /// Remove an object and its buffers; materials stay registered
    ///
    /// The identifier is free again immediately. While a submitted frame may
    /// still read the object's buffers and binding sets, their destruction
    /// waits until that frame slot is reused.
    pub fn remove_object(&mut self, id: &str) -> bool {
        let Some(entity) = self.entities.remove(id) else {
            return false;
        };
        for material_id in entity.material_ids() {
            if let Some(count) = self.material_usage.get_mut(&material_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.material_usage.remove(&material_id);
                }
            }
        }
        entity.unregister_buffers();
        match self.in_flight_slot {
            Some(slot) => {
                log::debug!("Removed object '{}', teardown after frame slot {}", id, slot);
                self.retired.push(Retired { entity, slot });
            }
            None => {
                drop(entity);
                log::debug!("Removed object '{}'", id);
            }
        }
        self.rebuild_render_queue();
        true
    }

    /// Number of objects using `material_id`; `None` once no object does
    pub fn material_usage(&self, material_id: &str) -> Option<usize> {
        self.material_usage.get(material_id).copied()
    }

    /// Show or hide an object; returns false for unknown identifiers
    pub fn set_object_visible(&mut self, id: &str, visible: bool) -> bool {
        match self.entities.get_mut(id) {
            Some(entity) => {
                entity.set_visible(visible);
                self.rebuild_render_queue();
                true
            }
            None => false,
        }
    }

    /// Look up an object
    pub fn object(&self, id: &str) -> Option<&RenderableEntity> {
        self.entities.get(id)
    }

    /// Look up an object for mutation
    ///
    /// Visibility goes through [`Self::set_object_visible`] so the queue follows it.
    pub fn object_mut(&mut self, id: &str) -> Option<&mut RenderableEntity> {
        self.entities.get_mut(id)
    }

    /// Number of objects
    pub fn object_count(&self) -> usize {
        self.entities.len()
    }

    /// Object identifiers, sorted
    pub fn object_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entities.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Current draw order
    pub fn render_queue(&self) -> &RenderQueue {
        &self.queue
    }

    /// Re-resolve materials registered since their objects were created, then re-sort
    pub fn rebuild_render_queue(&mut self) {
        for entity in self.entities.values_mut() {
            for material_id in entity.material_ids() {
                if let Some(material) = self.materials.get(&material_id) {
                    entity.attach_material(&material);
                }
            }
        }
        self.queue.rebuild(self.entities.values());
    }

    /// Record every queued object for one device and frame slot
    ///
    /// A pipeline is bound, with the camera push constants, only when the
    /// material changes. Failures skip the object and keep the frame going.
    pub fn render_all_objects(
        &mut self,
        recorder: &mut dyn CommandRecorder,
        device_index: usize,
        frame_index: usize,
    ) -> RenderStats {
        let push_constants = self.camera.push_constants();
        let mut stats = RenderStats::default();
        let mut current_material = None;

        for entry in self.queue.entries() {
            let Some(entity) = self.entities.get_mut(&entry.entity) else {
                continue;
            };

            if let Some(material) = entity.material() {
                if current_material != Some(material.instance_id()) {
                    if let Some(pipeline) = material.pipeline(device_index) {
                        let bound = recorder
                            .bind_pipeline(pipeline)
                            .and_then(|()| recorder.push_constants(pipeline, bytemuck::bytes_of(&push_constants)));
                        if let Err(e) = bound {
                            log::warn!("Binding material '{}' failed: {}", material.id(), e);
                            stats.failed += 1;
                            current_material = None;
                            continue;
                        }
                        current_material = Some(material.instance_id());
                        stats.pipeline_binds += 1;
                    }
                }
            }

            match entity.draw(recorder, device_index, frame_index) {
                Ok(DrawStatus::Drawn) => stats.drawn += 1,
                Ok(DrawStatus::Hidden) => {}
                Ok(DrawStatus::MaterialMissing | DrawStatus::MaterialPending) => stats.skipped += 1,
                Err(e) => {
                    log::warn!("Drawing '{}' on device {} failed: {}", entity.id(), device_index, e);
                    stats.failed += 1;
                }
            }
            if entity.binds_other_materials() {
                current_material = None;
            }
        }
        stats
    }

    /// Scene camera
    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    /// Scene camera for mutation
    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    /// Removed objects whose teardown waits on an in-flight frame
    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// A frame recorded from this scene was submitted in `slot`
    pub(crate) fn frame_submitted(&mut self, slot: usize) {
        self.in_flight_slot = Some(slot);
    }

    /// Every presenting device waited on `slot`'s fence, so that frame and
    /// everything submitted before it has finished
    pub(crate) fn frame_slot_completed(&mut self, slot: usize) {
        let before = self.retired.len();
        self.retired.retain(|retired| retired.slot != slot);
        if self.retired.len() != before {
            log::trace!("Released {} retired object(s) after slot {}", before - self.retired.len(), slot);
        }
        if self.in_flight_slot == Some(slot) {
            self.in_flight_slot = None;
        }
    }

    /// Every device is idle; nothing recorded from this scene is in flight
    pub(crate) fn devices_idle(&mut self) {
        self.retired.clear();
        self.in_flight_slot = None;
    }

    /// Remove every object
    ///
    /// Callers wait for the devices to go idle first.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.entities.clear();
        self.material_usage.clear();
        self.devices_idle();
    }
}

impl Drop for SceneOrchestrator {
    fn drop(&mut self) {
        self.clear();
    }
}

fn unknown(id: &str) -> RenderError {
    RenderError::InvalidArgument(format!("object '{}' not found", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::LoadedImage;
    use crate::render::backends::headless::{RecordedCommand, ResourceKind};
    use crate::foundation::math::Vec3;
    use crate::render::hal::BufferUsage;
    use crate::render::resources::{BufferInfo, TextureInfo};
    use crate::test_support::TestRig;

    fn scene(rig: &TestRig) -> SceneOrchestrator {
        SceneOrchestrator::new(rig.buffers(), rig.materials(), rig.textures(), 2)
    }

    #[test]
    fn test_material_usage_counter() {
        let rig = TestRig::new(1);
        rig.material("M1", false);
        let mut scene = scene(&rig);

        scene.create_object("cube1", MeshData::cube(1.0), "M1", Transform::default()).unwrap();
        scene.create_object("cube2", MeshData::cube(1.0), "M1", Transform::default()).unwrap();
        assert_eq!(scene.material_usage("M1"), Some(2));

        assert!(scene.remove_object("cube1"));
        assert_eq!(scene.material_usage("M1"), Some(1));
        assert!(scene.remove_object("cube2"));
        assert_eq!(scene.material_usage("M1"), None);
        assert!(!scene.remove_object("cube2"));
        assert!(rig.materials().contains("M1"));
    }

    #[test]
    fn test_duplicate_object_returns_existing() {
        let rig = TestRig::new(1);
        let mut scene = scene(&rig);
        scene.create_object("cube", MeshData::cube(1.0), "M1", Transform::default()).unwrap();
        let existing = scene.create_object("cube", MeshData::cube(2.0), "M2", Transform::default()).unwrap();

        assert_eq!(existing.material_id(), "M1");
        assert_eq!(scene.material_usage("M1"), Some(1));
        assert_eq!(scene.material_usage("M2"), None);
        assert_eq!(rig.headless(0).created(ResourceKind::Buffer), 4);
    }

    #[test]
    fn test_removing_object_releases_buffers() {
        let rig = TestRig::new(2);
        let mut scene = scene(&rig);
        scene.create_object("cube", MeshData::cube(1.0), "M1", Transform::default()).unwrap();
        assert_eq!(rig.buffers().len(), 4);

        scene.remove_object("cube");
        assert!(rig.buffers().is_empty());
        for device in 0..2 {
            assert_eq!(rig.headless(device).live(ResourceKind::Buffer), 0);
        }
    }

    #[test]
    fn test_render_binds_each_material_once() {
        let rig = TestRig::new(1);
        rig.material("A", true);
        rig.material("B", true);
        let mut scene = scene(&rig);
        for (id, material) in [("e1", "A"), ("e2", "B"), ("e3", "A"), ("e4", "B"), ("e5", "A")] {
            scene.create_object(id, MeshData::cube(1.0), material, Transform::default()).unwrap();
        }

        let mut frame = rig.frame_recorder(0);
        let stats = scene.render_all_objects(frame.recorder(), 0, 0);
        let commands = frame.finish();

        assert_eq!(stats.drawn, 5);
        assert_eq!(stats.pipeline_binds, 2);
        let binds = commands
            .iter()
            .filter(|c| matches!(c, RecordedCommand::BindPipeline(_)))
            .count();
        assert_eq!(binds, 2);
        let pushes = commands
            .iter()
            .filter(|c| matches!(c, RecordedCommand::PushConstants(data) if data.len() == 64))
            .count();
        assert_eq!(pushes, 2);
    }

    #[test]
    fn test_missing_material_is_skipped_until_registered() {
        let rig = TestRig::new(1);
        let mut scene = scene(&rig);
        scene.create_object("cube", MeshData::cube(1.0), "late", Transform::default()).unwrap();
        scene.create_object("other", MeshData::cube(1.0), "A", Transform::default()).unwrap();
        rig.material("A", true);
        scene.rebuild_render_queue();

        let mut frame = rig.frame_recorder(0);
        let stats = scene.render_all_objects(frame.recorder(), 0, 0);
        frame.finish();
        assert_eq!(stats.drawn, 1);
        assert_eq!(stats.skipped, 1);

        rig.material("late", true);
        scene.rebuild_render_queue();
        let mut frame = rig.frame_recorder(0);
        let stats = scene.render_all_objects(frame.recorder(), 0, 1);
        frame.finish();
        assert_eq!(stats.drawn, 2);
    }

    #[test]
    fn test_hidden_objects_leave_the_queue() {
        let rig = TestRig::new(1);
        let mut scene = scene(&rig);
        scene.create_object("a", MeshData::cube(1.0), "M", Transform::default()).unwrap();
        scene.create_object("b", MeshData::cube(1.0), "M", Transform::default()).unwrap();
        assert_eq!(scene.render_queue().len(), 2);

        assert!(scene.set_object_visible("a", false));
        assert_eq!(scene.render_queue().len(), 1);
        assert!(!scene.set_object_visible("missing", false));
    }

    #[test]
    fn test_textured_object_requires_registered_textures() {
        let rig = TestRig::new(1);
        let mut scene = scene(&rig);
        let missing = scene.create_textured_object("t", MeshData::cube(1.0), "tex", &["wood"], Transform::default());
        assert!(missing.is_err());
        assert!(rig.buffers().is_empty());

        rig.textures()
            .create("wood", TextureInfo::from_pixels(LoadedImage::solid_color(2, 2, [200, 120, 40, 255])))
            .unwrap();
        let entity = scene
            .create_textured_object("t", MeshData::cube(1.0), "tex", &["wood"], Transform::default())
            .unwrap();
        assert_eq!(entity.material_id(), "tex");
    }

    #[test]
    fn test_clear_releases_everything() {
        let rig = TestRig::new(2);
        let mut scene = scene(&rig);
        scene.create_object("a", MeshData::cube(1.0), "M", Transform::default()).unwrap();
        scene.create_object("b", MeshData::cube(1.0), "N", Transform::default()).unwrap();
        scene.clear();

        assert_eq!(scene.object_count(), 0);
        assert_eq!(scene.material_usage("M"), None);
        assert!(scene.render_queue().is_empty());
        assert!(rig.buffers().is_empty());
    }

    #[test]
    fn test_visibility_round_trip_redraws() {
        let rig = TestRig::new(1);
        rig.material("M", true);
        let mut scene = scene(&rig);
        scene.create_object("a", MeshData::cube(1.0), "M", Transform::default()).unwrap();
        assert!(scene.set_object_visible("a", false));
        scene.object_mut("a").unwrap().set_position(Vec3::new(0.0, 1.0, 0.0));
        assert!(scene.render_queue().is_empty());

        assert!(scene.set_object_visible("a", true));
        assert_eq!(scene.render_queue().len(), 1);
        let mut frame = rig.frame_recorder(0);
        let stats = scene.render_all_objects(frame.recorder(), 0, 0);
        frame.finish();
        assert_eq!(stats.drawn, 1);
    }

    #[test]
    fn test_object_cannot_take_over_foreign_buffers() {
        let rig = TestRig::new(1);
        let mut scene = scene(&rig);
        let foreign = rig
            .buffers()
            .create("cube/vertices", BufferInfo::dynamic(8, BufferUsage::VERTEX))
            .unwrap();

        assert!(scene.create_object("cube", MeshData::cube(1.0), "M", Transform::default()).is_err());
        assert_eq!(scene.object_count(), 0);
        assert_eq!(scene.material_usage("M"), None);
        assert!(!scene.remove_object("cube"));
        assert!(Arc::ptr_eq(&rig.buffers().get("cube/vertices").unwrap(), &foreign));
    }

    #[test]
    fn test_removal_waits_for_in_flight_frame() {
        let rig = TestRig::new(2);
        let mut scene = scene(&rig);
        scene.create_object("cube", MeshData::cube(1.0), "M", Transform::default()).unwrap();
        scene.frame_submitted(0);

        assert!(scene.remove_object("cube"));
        assert!(rig.buffers().is_empty());
        assert_eq!(scene.retired_count(), 1);
        assert_eq!(rig.headless(0).live(ResourceKind::Buffer), 4);

        scene.create_object("cube", MeshData::cube(1.0), "M", Transform::default()).unwrap();
        scene.frame_slot_completed(1);
        assert_eq!(scene.retired_count(), 1);

        scene.frame_slot_completed(0);
        assert_eq!(scene.retired_count(), 0);
        for device in 0..2 {
            assert_eq!(rig.headless(device).live(ResourceKind::Buffer), 4);
        }
        assert_eq!(rig.buffers().len(), 4);
    }
}
