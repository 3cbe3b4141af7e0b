//! Scene layer: geometry, camera, renderable entities and the draw loop

pub mod camera;
pub mod entity;
pub mod geometry;
pub mod orchestrator;
pub mod render_queue;

pub use camera::{Camera, CameraPushConstants};
pub use entity::{DrawStatus, EntityDesc, EntityState, ObjectUniforms, RenderableEntity, Transform, TransformMode};
pub use geometry::{MeshData, Submesh, Vertex};
pub use orchestrator::{ObjectDesc, RenderStats, SceneOrchestrator};
pub use render_queue::{QueueEntry, RenderQueue};
