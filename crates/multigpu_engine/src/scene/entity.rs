//! Renderable entities
//!
//! An entity owns its geometry and per-frame uniform buffers (registered in
//! the buffer registry), shares its textures, and refers to its material
//! weakly so removing a material never dangles. Drawing an entity whose
//! material is missing or still compiling is a logged no-op.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytemuck::{Pod, Zeroable};

use crate::foundation::math::{euler_model_matrix, to_column_array, transform_normal, transform_position, Mat4, Vec3};
use crate::render::device::{join_all, LogicalDevice};
use crate::render::error::{RenderError, RenderResult};
use crate::render::hal::{Binding, BindingSetHandle, BufferUsage, CommandRecorder, PipelineHandle};
use crate::render::resources::{Buffer, BufferInfo, BufferRegistry, Material, Texture};
use crate::scene::geometry::{MeshData, Submesh, Vertex};

/// Per-object uniform block at binding 0
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ObjectUniforms {
    /// Model matrix, column-major
    pub model: [[f32; 4]; 4],
    /// Color multiplier
    pub tint: [f32; 4],
}

/// Size of [`ObjectUniforms`] in bytes
pub const OBJECT_UNIFORMS_SIZE: u64 = std::mem::size_of::<ObjectUniforms>() as u64;

/// Where vertices are transformed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformMode {
    /// Upload the model matrix; the vertex shader transforms
    Gpu,
    /// Transform every vertex on the host and re-upload the vertex buffer
    Cpu,
}

/// Position, euler rotation (radians) and scale
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    /// Translation
    pub position: Vec3,
    /// Rotation about X, Y, Z
    pub rotation: Vec3,
    /// Per-axis scale
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::zeros(),
            rotation: Vec3::zeros(),
            scale: Vec3::new(1.0, 1.0, 1.0),
        }
    }
}

impl Transform {
    /// Transform at `position`
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    /// translate * rotate_x * rotate_y * rotate_z * scale
    pub fn matrix(&self) -> Mat4 {
        euler_model_matrix(&self.position, &self.rotation, &self.scale)
    }
}

/// Lifecycle state of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Its material does not exist
    MaterialMissing,
    /// Drawable and visible
    Visible,
    /// Drawable but hidden
    Hidden,
}

/// What a draw call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawStatus {
    /// Commands were recorded
    Drawn,
    /// Entity is hidden
    Hidden,
    /// Material does not exist
    MaterialMissing,
    /// Material exists but has no pipeline on this device yet
    MaterialPending,
}

/// Everything needed to build an entity, with references already resolved
pub struct EntityDesc {
    /// Geometry
    pub mesh: MeshData,
    /// Primary material identifier
    pub material_id: String,
    /// Primary material, if registered
    pub material: Option<Arc<Material>>,
    /// Textures bound after the object uniforms
    pub textures: Vec<Arc<Texture>>,
    /// Submeshes with their resolved materials
    pub submeshes: Vec<(Submesh, Option<Arc<Material>>)>,
    /// Initial transform
    pub transform: Transform,
    /// Number of frame slots needing their own uniform buffer
    pub frames_in_flight: usize,
}

struct SubmeshBinding {
    submesh: Submesh,
    material: Weak<Material>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BindingKey {
    material: u64,
    device: usize,
    frame: usize,
}

/// A drawable object
pub struct RenderableEntity {
    id: String,
    material_id: String,
    material: Weak<Material>,
    textures: Vec<Arc<Texture>>,
    submeshes: Vec<SubmeshBinding>,
    base_vertices: Vec<Vertex>,
    index_count: u32,
    vertex_buffer: Arc<Buffer>,
    index_buffer: Arc<Buffer>,
    uniform_buffers: Vec<Arc<Buffer>>,
    buffer_ids: Vec<String>,
    buffers: Arc<BufferRegistry>,
    binding_sets: HashMap<BindingKey, BindingSetHandle>,
    transform: Transform,
    model: Mat4,
    dirty: bool,
    cpu_vertices_stale: bool,
    mode: TransformMode,
    visible: bool,
    tint: [f32; 4],
}

impl RenderableEntity {
    /// Create the entity's buffers and bind its references
    ///
    /// Buffer identifiers are derived from `id`; any of them already being
    /// registered is an error. Buffers already registered for this entity are
    /// removed again if a later one fails.
    pub fn new(id: &str, desc: EntityDesc, buffers: Arc<BufferRegistry>) -> RenderResult<Self> {
        desc.mesh.validate()?;
        let submeshes: Vec<Submesh> = desc.submeshes.iter().map(|(s, _)| s.clone()).collect();
        desc.mesh.validate_submeshes(&submeshes)?;
        if desc.frames_in_flight == 0 {
            return Err(RenderError::InvalidArgument("frames in flight must be non-zero".into()));
        }

        let mut created: Vec<String> = Vec::new();
        let result = Self::create_buffers(id, &desc, &buffers, &mut created);
        let (vertex_buffer, index_buffer, uniform_buffers) = match result {
            Ok(buffers) => buffers,
            Err(e) => {
                for buffer_id in &created {
                    buffers.remove(buffer_id);
                }
                return Err(e);
            }
        };

        if desc.material.is_none() {
            log::warn!("Entity '{}' created with unknown material '{}'", id, desc.material_id);
        }
        let model = desc.transform.matrix();
        Ok(Self {
            id: id.to_string(),
            material_id: desc.material_id,
            material: desc.material.as_ref().map_or_else(Weak::new, Arc::downgrade),
            textures: desc.textures,
            submeshes: desc
                .submeshes
                .into_iter()
                .map(|(submesh, material)| SubmeshBinding {
                    submesh,
                    material: material.as_ref().map_or_else(Weak::new, Arc::downgrade),
                })
                .collect(),
            index_count: desc.mesh.index_count(),
            base_vertices: desc.mesh.vertices,
            vertex_buffer,
            index_buffer,
            uniform_buffers,
            buffer_ids: created,
            buffers,
            binding_sets: HashMap::new(),
            transform: desc.transform,
            model,
            dirty: false,
            cpu_vertices_stale: false,
            mode: TransformMode::Gpu,
            visible: true,
            tint: [1.0; 4],
        })
    }

    #[allow(clippy::type_complexity)]
    fn create_buffers(
        id: &str,
        desc: &EntityDesc,
        buffers: &BufferRegistry,
        created: &mut Vec<String>,
    ) -> RenderResult<(Arc<Buffer>, Arc<Buffer>, Vec<Arc<Buffer>>)> {
        let mut register = |name: String, info: BufferInfo| -> RenderResult<Arc<Buffer>> {
            let buffer = buffers.create_new(&name, info)?;
            created.push(name);
            Ok(buffer)
        };

        let vertex = register(
            format!("{}/vertices", id),
            BufferInfo::dynamic_data(BufferUsage::VERTEX, desc.mesh.vertex_bytes().to_vec()),
        )?;
        let index = register(
            format!("{}/indices", id),
            BufferInfo::static_data(BufferUsage::INDEX, desc.mesh.index_bytes().to_vec()),
        )?;
        let uniforms = (0..desc.frames_in_flight)
            .map(|frame| {
                register(
                    format!("{}/uniforms/{}", id, frame),
                    BufferInfo::dynamic(OBJECT_UNIFORMS_SIZE, BufferUsage::UNIFORM),
                )
            })
            .collect::<RenderResult<Vec<_>>>()?;
        Ok((vertex, index, uniforms))
    }

    /// Identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Primary material identifier
    pub fn material_id(&self) -> &str {
        &self.material_id
    }

    /// Every material identifier this entity draws with, primary first, without duplicates
    pub fn material_ids(&self) -> Vec<String> {
        let mut ids = vec![self.material_id.clone()];
        for binding in &self.submeshes {
            if !ids.contains(&binding.submesh.material) {
                ids.push(binding.submesh.material.clone());
            }
        }
        ids
    }

    /// Whether drawing may bind a pipeline other than the primary material's
    pub fn binds_other_materials(&self) -> bool {
        self.submeshes.iter().any(|b| b.submesh.material != self.material_id)
    }

    /// Primary material, if it still exists
    pub fn material(&self) -> Option<Arc<Material>> {
        self.material.upgrade()
    }

    /// Re-resolve a missing primary material
    pub fn attach_material(&mut self, material: &Arc<Material>) {
        if material.id() == self.material_id {
            self.material = Arc::downgrade(material);
        }
        for binding in &mut self.submeshes {
            if binding.submesh.material == material.id() {
                binding.material = Arc::downgrade(material);
            }
        }
    }

    /// Current state
    pub fn state(&self) -> EntityState {
        if self.material.strong_count() == 0 {
            EntityState::MaterialMissing
        } else if self.visible {
            EntityState::Visible
        } else {
            EntityState::Hidden
        }
    }

    /// Whether the entity is drawn
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Show or hide; the scene changes visibility so its queue stays in sync
    pub(crate) fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    /// Color multiplier
    pub fn set_tint(&mut self, tint: [f32; 4]) {
        self.tint = tint;
    }

    /// Current transform
    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    /// Replace the transform
    pub fn set_transform(&mut self, transform: Transform) {
        self.transform = transform;
        self.dirty = true;
    }

    /// Move to `position`
    pub fn set_position(&mut self, position: Vec3) {
        self.transform.position = position;
        self.dirty = true;
    }

    /// Set euler rotation in radians
    pub fn set_rotation(&mut self, rotation: Vec3) {
        self.transform.rotation = rotation;
        self.dirty = true;
    }

    /// Set per-axis scale
    pub fn set_scale(&mut self, scale: Vec3) {
        self.transform.scale = scale;
        self.dirty = true;
    }

    /// Model matrix for the current transform
    pub fn model_matrix(&self) -> Mat4 {
        if self.dirty {
            self.transform.matrix()
        } else {
            self.model
        }
    }

    /// Transform strategy
    pub fn transform_mode(&self) -> TransformMode {
        self.mode
    }

    /// Switch transform strategy
    ///
    /// Switching to GPU restores the untransformed vertices; switching to CPU
    /// forces a re-transform on the next draw.
    pub fn set_transform_mode(&mut self, mode: TransformMode) -> RenderResult<()> {
        if mode == self.mode {
            return Ok(());
        }
        match mode {
            TransformMode::Gpu => {
                self.vertex_buffer
                    .update_data(bytemuck::cast_slice(&self.base_vertices), 0)?;
            }
            TransformMode::Cpu => self.cpu_vertices_stale = true,
        }
        log::debug!("Entity '{}' switched to {:?} transforms", self.id, mode);
        self.mode = mode;
        Ok(())
    }

    /// Vertex buffer
    pub fn vertex_buffer(&self) -> &Arc<Buffer> {
        &self.vertex_buffer
    }

    /// Index count
    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    /// Registry identifiers of the buffers this entity owns
    pub fn buffer_ids(&self) -> &[String] {
        &self.buffer_ids
    }

    /// Drop this entity's registry entries, leaving the buffers alive while it holds them
    ///
    /// Entries since replaced under the same identifier are left alone.
    pub(crate) fn unregister_buffers(&self) {
        let owned = std::iter::once(&self.vertex_buffer)
            .chain(std::iter::once(&self.index_buffer))
            .chain(self.uniform_buffers.iter());
        for (buffer_id, buffer) in self.buffer_ids.iter().zip(owned) {
            self.buffers.remove_instance(buffer_id, buffer);
        }
    }

    fn upload_transformed_vertices(&self) -> RenderResult<()> {
        let transformed: Vec<Vertex> = self
            .base_vertices
            .iter()
            .map(|v| Vertex {
                position: transform_position(&self.model, v.position),
                normal: transform_normal(&self.model, v.normal),
                uv: v.uv,
            })
            .collect();
        self.vertex_buffer.update_data(bytemuck::cast_slice(&transformed), 0)
    }

    fn binding_set(
        &mut self,
        material: &Material,
        pipeline: PipelineHandle,
        device_index: usize,
        frame: usize,
    ) -> RenderResult<BindingSetHandle> {
        let key = BindingKey {
            material: material.instance_id(),
            device: device_index,
            frame,
        };
        if let Some(&set) = self.binding_sets.get(&key) {
            return Ok(set);
        }

        let uniform = self.uniform_buffers[frame]
            .handle(device_index)
            .ok_or_else(|| self.missing_on(device_index, "uniform buffer"))?;
        let mut bindings = vec![Binding::Uniform {
            buffer: uniform,
            size: OBJECT_UNIFORMS_SIZE,
        }];
        for slot in 0..material.texture_slots() as usize {
            let texture = self.textures.get(slot).ok_or_else(|| {
                RenderError::InvalidArgument(format!(
                    "entity '{}' has {} texture(s), material '{}' needs {}",
                    self.id,
                    self.textures.len(),
                    material.id(),
                    material.texture_slots()
                ))
            })?;
            bindings.push(
                texture
                    .binding(device_index)
                    .ok_or_else(|| self.missing_on(device_index, "texture"))?,
            );
        }

        let device = self.device(device_index)?;
        let set = device
            .execute(move |driver| driver.create_binding_set(pipeline, &bindings))
            .wait()??;
        log::trace!("Entity '{}' binding set for device {} frame {}", self.id, device_index, frame);
        self.binding_sets.insert(key, set);
        Ok(set)
    }

    fn device(&self, device_index: usize) -> RenderResult<Arc<LogicalDevice>> {
        self.buffers
            .devices()
            .iter()
            .find(|device| device.index() == device_index)
            .cloned()
            .ok_or_else(|| self.missing_on(device_index, "device"))
    }

    fn missing_on(&self, device_index: usize, what: &str) -> RenderError {
        RenderError::Device {
            device: device_index,
            reason: format!("entity '{}' has no {}", self.id, what),
        }
    }

    /// Record this entity into `recorder` for one device and frame slot
    ///
    /// The caller has bound the primary material's pipeline and camera push
    /// constants. Missing or uninitialized materials are logged and skipped.
    pub fn draw(
        &mut self,
        recorder: &mut dyn CommandRecorder,
        device_index: usize,
        frame_index: usize,
    ) -> RenderResult<DrawStatus> {
        if !self.visible {
            return Ok(DrawStatus::Hidden);
        }
        let Some(material) = self.material.upgrade() else {
            log::debug!("Entity '{}': material '{}' not found", self.id, self.material_id);
            return Ok(DrawStatus::MaterialMissing);
        };
        let Some(pipeline) = material.pipeline(device_index) else {
            log::trace!("Entity '{}': material '{}' not initialized", self.id, self.material_id);
            return Ok(DrawStatus::MaterialPending);
        };

        if self.dirty {
            self.model = self.transform.matrix();
            self.dirty = false;
            if self.mode == TransformMode::Cpu {
                self.cpu_vertices_stale = true;
            }
        }
        if self.mode == TransformMode::Cpu && self.cpu_vertices_stale {
            self.upload_transformed_vertices()?;
            self.cpu_vertices_stale = false;
        }

        let frame = frame_index % self.uniform_buffers.len();
        let model = match self.mode {
            TransformMode::Gpu => self.model,
            TransformMode::Cpu => Mat4::identity(),
        };
        let uniforms = ObjectUniforms {
            model: to_column_array(&model),
            tint: self.tint,
        };
        self.uniform_buffers[frame].update_device_data(device_index, bytemuck::bytes_of(&uniforms), 0)?;

        let vertex = self
            .vertex_buffer
            .handle(device_index)
            .ok_or_else(|| self.missing_on(device_index, "vertex buffer"))?;
        let index = self
            .index_buffer
            .handle(device_index)
            .ok_or_else(|| self.missing_on(device_index, "index buffer"))?;

        let set = self.binding_set(&material, pipeline, device_index, frame)?;
        recorder.bind_binding_set(pipeline, set)?;
        recorder.bind_vertex_buffer(vertex)?;
        recorder.bind_index_buffer(index)?;

        if self.submeshes.is_empty() {
            recorder.draw_indexed(self.index_count, 0);
            return Ok(DrawStatus::Drawn);
        }

        let mut bound = material.instance_id();
        for position in 0..self.submeshes.len() {
            let submesh = self.submeshes[position].submesh.clone();
            let Some(sub_material) = self.submeshes[position].material.upgrade() else {
                log::debug!("Entity '{}': submesh material '{}' not found", self.id, submesh.material);
                continue;
            };
            let Some(sub_pipeline) = sub_material.pipeline(device_index) else {
                continue;
            };
            if sub_material.instance_id() != bound {
                recorder.bind_pipeline(sub_pipeline)?;
                bound = sub_material.instance_id();
            }
            let set = self.binding_set(&sub_material, sub_pipeline, device_index, frame)?;
            recorder.bind_binding_set(sub_pipeline, set)?;
            recorder.draw_indexed(submesh.index_count, submesh.first_index);
        }
        Ok(DrawStatus::Drawn)
    }

    fn release_binding_sets(&mut self) {
        let sets: Vec<(BindingKey, BindingSetHandle)> = self.binding_sets.drain().collect();
        let handles: Vec<_> = sets
            .into_iter()
            .filter_map(|(key, set)| {
                let device = self.device(key.device).ok()?;
                Some(device.execute(move |driver| driver.destroy_binding_set(set)))
            })
            .collect();
        for result in join_all(handles) {
            if let Err(e) = result {
                log::warn!("Entity '{}' binding set teardown: {}", self.id, e);
            }
        }
    }
}

impl Drop for RenderableEntity {
    fn drop(&mut self) {
        self.release_binding_sets();
        self.unregister_buffers();
    }
}

impl std::fmt::Debug for RenderableEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderableEntity")
            .field("id", &self.id)
            .field("material", &self.material_id)
            .field("state", &self.state())
            .field("mode", &self.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::headless::{RecordedCommand, ResourceKind};
    use crate::test_support::TestRig;
    use approx::assert_relative_eq;

    fn desc(material: Option<Arc<Material>>) -> EntityDesc {
        EntityDesc {
            mesh: MeshData::cube(1.0),
            material_id: "m".into(),
            material,
            textures: Vec::new(),
            submeshes: Vec::new(),
            transform: Transform::default(),
            frames_in_flight: 2,
        }
    }

    #[test]
    fn test_entity_registers_buffers() {
        let rig = TestRig::new(1);
        let buffers = rig.buffers();
        let entity = RenderableEntity::new("cube", desc(None), Arc::clone(&buffers)).unwrap();

        assert_eq!(entity.state(), EntityState::MaterialMissing);
        assert_eq!(buffers.len(), 4);
        assert!(buffers.contains("cube/vertices"));

        drop(entity);
        assert!(buffers.is_empty());
        assert_eq!(rig.headless(0).live(ResourceKind::Buffer), 0);
    }

    #[test]
    fn test_draw_skips_missing_and_pending_materials() {
        let rig = TestRig::new(1);
        let mut frame = rig.frame_recorder(0);
        let mut entity = RenderableEntity::new("cube", desc(None), rig.buffers()).unwrap();
        assert_eq!(entity.draw(frame.recorder(), 0, 0).unwrap(), DrawStatus::MaterialMissing);

        let material = rig.material("m", false);
        entity.attach_material(&material);
        assert_eq!(entity.draw(frame.recorder(), 0, 0).unwrap(), DrawStatus::MaterialPending);

        entity.set_visible(false);
        assert_eq!(entity.draw(frame.recorder(), 0, 0).unwrap(), DrawStatus::Hidden);
        assert!(frame.finish().is_empty());
    }

    #[test]
    fn test_draw_records_indexed_draw() {
        let rig = TestRig::new(1);
        let material = rig.material("m", true);
        let mut entity = RenderableEntity::new("cube", desc(Some(material)), rig.buffers()).unwrap();

        let mut frame = rig.frame_recorder(0);
        assert_eq!(entity.draw(frame.recorder(), 0, 1).unwrap(), DrawStatus::Drawn);
        let commands = frame.finish();

        assert!(matches!(commands[0], RecordedCommand::BindBindingSet(_)));
        assert_eq!(
            commands.last(),
            Some(&RecordedCommand::DrawIndexed {
                index_count: 36,
                first_index: 0
            })
        );
        assert_eq!(rig.headless(0).live(ResourceKind::BindingSet), 1);
    }

    #[test]
    fn test_gpu_mode_uploads_model_matrix() {
        let rig = TestRig::new(2);
        let material = rig.material("m", true);
        let mut entity = RenderableEntity::new("cube", desc(Some(material)), rig.buffers()).unwrap();
        entity.set_position(Vec3::new(1.0, 2.0, 3.0));

        for device in 0..2 {
            let mut frame = rig.frame_recorder(device);
            entity.draw(frame.recorder(), device, 0).unwrap();
            frame.finish();

            let bytes = rig.buffers().get("cube/uniforms/0").unwrap().read_data(device, 0, OBJECT_UNIFORMS_SIZE).unwrap();
            let uniforms: ObjectUniforms = bytemuck::pod_read_unaligned(&bytes);
            assert_relative_eq!(uniforms.model[3][0], 1.0);
            assert_relative_eq!(uniforms.model[3][1], 2.0);
            assert_relative_eq!(uniforms.model[3][2], 3.0);
        }
    }

    #[test]
    fn test_cpu_mode_transforms_vertices_and_gpu_mode_restores() {
        let rig = TestRig::new(1);
        let material = rig.material("m", true);
        let mut entity = RenderableEntity::new("cube", desc(Some(material)), rig.buffers()).unwrap();
        let original = entity.vertex_buffer().read_data(0, 0, 32).unwrap();

        entity.set_transform_mode(TransformMode::Cpu).unwrap();
        entity.set_position(Vec3::new(10.0, 0.0, 0.0));
        let mut frame = rig.frame_recorder(0);
        entity.draw(frame.recorder(), 0, 0).unwrap();
        frame.finish();

        let moved: Vertex = bytemuck::pod_read_unaligned(&entity.vertex_buffer().read_data(0, 0, 32).unwrap());
        let base: Vertex = bytemuck::pod_read_unaligned(&original);
        assert_relative_eq!(moved.position[0], base.position[0] + 10.0);

        let uniforms: ObjectUniforms = bytemuck::pod_read_unaligned(
            &rig.buffers().get("cube/uniforms/0").unwrap().read_data(0, 0, OBJECT_UNIFORMS_SIZE).unwrap(),
        );
        assert_eq!(uniforms.model, to_column_array(&Mat4::identity()));

        entity.set_transform_mode(TransformMode::Gpu).unwrap();
        assert_eq!(entity.vertex_buffer().read_data(0, 0, 32).unwrap(), original);
    }

    #[test]
    fn test_switching_back_to_cpu_retransforms() {
        let rig = TestRig::new(1);
        let material = rig.material("m", true);
        let mut entity = RenderableEntity::new("cube", desc(Some(material)), rig.buffers()).unwrap();
        let base: Vertex = bytemuck::pod_read_unaligned(&entity.vertex_buffer().read_data(0, 0, 32).unwrap());
        entity.set_position(Vec3::new(0.0, 5.0, 0.0));

        entity.set_transform_mode(TransformMode::Cpu).unwrap();
        let mut frame = rig.frame_recorder(0);
        entity.draw(frame.recorder(), 0, 0).unwrap();
        frame.finish();
        entity.set_transform_mode(TransformMode::Gpu).unwrap();
        entity.set_transform_mode(TransformMode::Cpu).unwrap();

        let mut frame = rig.frame_recorder(0);
        entity.draw(frame.recorder(), 0, 0).unwrap();
        frame.finish();
        let vertex: Vertex = bytemuck::pod_read_unaligned(&entity.vertex_buffer().read_data(0, 0, 32).unwrap());
        assert_relative_eq!(vertex.position[1], base.position[1] + 5.0);
    }

    #[test]
    fn test_submeshes_bind_their_materials() {
        let rig = TestRig::new(1);
        let primary = rig.material("m", true);
        let other = rig.material("other", true);
        let mut entity_desc = desc(Some(primary));
        entity_desc.submeshes = vec![
            (
                Submesh {
                    first_index: 0,
                    index_count: 18,
                    material: "m".into(),
                },
                rig.materials().get("m"),
            ),
            (
                Submesh {
                    first_index: 18,
                    index_count: 18,
                    material: "other".into(),
                },
                Some(Arc::clone(&other)),
            ),
        ];
        let mut entity = RenderableEntity::new("multi", entity_desc, rig.buffers()).unwrap();
        assert!(entity.binds_other_materials());
        assert_eq!(entity.material_ids(), vec!["m".to_string(), "other".to_string()]);

        let mut frame = rig.frame_recorder(0);
        entity.draw(frame.recorder(), 0, 0).unwrap();
        let commands = frame.finish();

        let other_pipeline = other.pipeline(0).unwrap();
        assert!(commands.contains(&RecordedCommand::BindPipeline(other_pipeline)));
        let draws: Vec<_> = commands
            .iter()
            .filter(|c| matches!(c, RecordedCommand::DrawIndexed { .. }))
            .collect();
        assert_eq!(draws.len(), 2);
    }

    #[test]
    fn test_model_matrix_order() {
        let rig = TestRig::new(1);
        let mut entity = RenderableEntity::new("cube", desc(None), rig.buffers()).unwrap();
        let transform = Transform {
            position: Vec3::new(1.0, 0.0, 0.0),
            rotation: Vec3::new(0.3, 0.2, 0.1),
            scale: Vec3::new(2.0, 2.0, 2.0),
        };
        entity.set_transform(transform.clone());
        let expected = euler_model_matrix(&transform.position, &transform.rotation, &transform.scale);
        assert_relative_eq!(entity.model_matrix(), expected);
    }

    #[test]
    fn test_existing_buffer_name_is_not_adopted() {
        let rig = TestRig::new(1);
        let buffers = rig.buffers();
        let foreign = buffers.create("cube/vertices", BufferInfo::dynamic(8, BufferUsage::VERTEX)).unwrap();

        let result = RenderableEntity::new("cube", desc(None), Arc::clone(&buffers));
        assert!(matches!(result, Err(RenderError::InvalidArgument(_))));
        assert_eq!(buffers.len(), 1);
        assert!(Arc::ptr_eq(&buffers.get("cube/vertices").unwrap(), &foreign));
        assert_eq!(rig.headless(0).live(ResourceKind::Buffer), 1);
    }

    #[test]
    fn test_drop_leaves_replaced_entries() {
        let rig = TestRig::new(1);
        let buffers = rig.buffers();
        let entity = RenderableEntity::new("cube", desc(None), Arc::clone(&buffers)).unwrap();
        entity.unregister_buffers();
        assert!(buffers.is_empty());

        let replacement = buffers.create("cube/indices", BufferInfo::dynamic(4, BufferUsage::INDEX)).unwrap();
        drop(entity);
        assert!(Arc::ptr_eq(&buffers.get("cube/indices").unwrap(), &replacement));
        assert_eq!(rig.headless(0).live(ResourceKind::Buffer), 1);
    }
}
