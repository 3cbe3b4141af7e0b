//! Per-frame draw order
//!
//! The queue is derived state: identifiers of visible entities sorted by
//! material instance so consecutive draws share a pipeline.

use crate::scene::entity::RenderableEntity;

/// Sort key for entities without a live material; they go last
const MISSING_MATERIAL: u64 = u64::MAX;

/// One queued draw
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    /// Entity identifier
    pub entity: String,
    /// Material instance the entity was sorted under
    pub material: u64,
}

/// Visible entities grouped by material
#[derive(Debug, Default, Clone)]
pub struct RenderQueue {
    entries: Vec<QueueEntry>,
}

impl RenderQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents with the visible subset of `entities`
    ///
    /// Ordered by (material instance, entity identifier), so the result does
    /// not depend on iteration order.
    pub fn rebuild<'a>(&mut self, entities: impl IntoIterator<Item = &'a RenderableEntity>) {
        self.entries = entities
            .into_iter()
            .filter(|entity| entity.is_visible())
            .map(|entity| QueueEntry {
                entity: entity.id().to_string(),
                material: entity
                    .material()
                    .map_or(MISSING_MATERIAL, |material| material.instance_id()),
            })
            .collect();
        self.entries
            .sort_by(|a, b| a.material.cmp(&b.material).then_with(|| a.entity.cmp(&b.entity)));
    }

    /// Queued draws in order
    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    /// Number of queued draws
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of material changes a pass over the queue performs
    pub fn batch_count(&self) -> usize {
        let mut batches = 0;
        let mut previous = None;
        for entry in &self.entries {
            if previous != Some(entry.material) {
                batches += 1;
                previous = Some(entry.material);
            }
        }
        batches
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::entity::{EntityDesc, Transform};
    use crate::scene::geometry::MeshData;
    use crate::test_support::TestRig;

    fn entity(rig: &TestRig, id: &str, material: &str) -> RenderableEntity {
        let desc = EntityDesc {
            mesh: MeshData::cube(1.0),
            material_id: material.to_string(),
            material: rig.materials().get(material),
            textures: Vec::new(),
            submeshes: Vec::new(),
            transform: Transform::default(),
            frames_in_flight: 1,
        };
        RenderableEntity::new(id, desc, rig.buffers()).unwrap()
    }

    #[test]
    fn test_same_material_entities_are_contiguous() {
        let rig = TestRig::new(1);
        rig.material("A", false);
        rig.material("B", false);
        let entities: Vec<_> = [("e1", "A"), ("e2", "A"), ("e3", "B"), ("e4", "A"), ("e5", "B")]
            .iter()
            .map(|(id, material)| entity(&rig, id, material))
            .collect();

        let mut queue = RenderQueue::new();
        queue.rebuild(entities.iter().rev());

        assert_eq!(queue.len(), 5);
        assert_eq!(queue.batch_count(), 2);
        let materials: Vec<u64> = queue.entries().iter().map(|e| e.material).collect();
        let mut seen = Vec::new();
        for material in materials {
            if seen.last() != Some(&material) {
                assert!(!seen.contains(&material), "material batch interleaved");
                seen.push(material);
            }
        }
    }

    #[test]
    fn test_hidden_entities_are_skipped_and_missing_materials_last() {
        let rig = TestRig::new(1);
        let material = rig.material("A", false);
        let mut hidden = entity(&rig, "hidden", "A");
        hidden.set_visible(false);
        let orphan = entity(&rig, "orphan", "nope");
        let shown = entity(&rig, "shown", "A");

        let mut queue = RenderQueue::new();
        queue.rebuild([&orphan, &hidden, &shown]);

        let ids: Vec<&str> = queue.entries().iter().map(|e| e.entity.as_str()).collect();
        assert_eq!(ids, vec!["shown", "orphan"]);
        assert_eq!(queue.entries()[0].material, material.instance_id());
    }
}
