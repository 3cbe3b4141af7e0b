//! Selection, registry, replication and batching properties

mod common;

use multigpu_engine::prelude::*;
use multigpu_engine::render::backends::headless::ResourceKind;
use multigpu_engine::render::device::{select_devices, DeviceClass, PhysicalDeviceInfo};
use multigpu_engine::render::hal::BufferUsage;
use multigpu_engine::render::resources::BufferRegistry;
use multigpu_engine::render::Capabilities;

#[test]
fn discrete_outscores_integrated() {
    for index in 0..4 {
        let discrete = PhysicalDeviceInfo::simulated(index, "discrete", DeviceClass::Discrete);
        let integrated = PhysicalDeviceInfo::simulated(index + 1, "integrated", DeviceClass::Integrated);
        assert!(discrete.calculate_score() > integrated.calculate_score());
    }
}

#[test]
fn device_without_present_queue_is_never_primary() {
    let mut strong = PhysicalDeviceInfo::simulated(0, "strong", DeviceClass::Discrete);
    for family in &mut strong.queue_families {
        family.present = false;
    }
    let weak = PhysicalDeviceInfo::simulated(1, "weak", DeviceClass::Integrated);

    let selection = select_devices(&[strong, weak], &Capabilities::new()).unwrap();
    assert_eq!(selection.primary, 1);
    assert!(!selection.secondaries.contains(&0));
}

#[test]
fn registry_create_is_idempotent() {
    let (group, backend) = common::device_group(2);
    let buffers = BufferRegistry::new(group.devices());

    let first = buffers.create("shared", BufferInfo::dynamic(16, BufferUsage::UNIFORM)).unwrap();
    let second = buffers.create("shared", BufferInfo::dynamic(32, BufferUsage::UNIFORM)).unwrap();

    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(second.get_size(), 16);
    assert_eq!(buffers.len(), 1);
    for device in 0..2 {
        assert_eq!(backend.device(device).unwrap().created(ResourceKind::Buffer), 1);
    }
}

#[test]
fn buffer_bounds_law() {
    let (group, _backend) = common::device_group(1);
    let buffers = BufferRegistry::new(group.devices());
    let buffer = buffers.create("bounded", BufferInfo::dynamic(32, BufferUsage::UNIFORM)).unwrap();
    buffer.update_data(&[1u8; 32], 0).unwrap();

    for offset in 0..=32u64 {
        let exact = vec![7u8; (32 - offset) as usize];
        assert!(buffer.update_data(&exact, offset).is_ok(), "offset {}", offset);

        let before = buffer.read_data(0, 0, 32).unwrap();
        let over = vec![9u8; (32 - offset + 1) as usize];
        assert!(matches!(
            buffer.update_data(&over, offset),
            Err(RenderError::OutOfBounds { .. })
        ));
        assert_eq!(buffer.read_data(0, 0, 32).unwrap(), before, "mutated at offset {}", offset);
    }
}

#[test]
fn replication_creates_and_destroys_once_per_device() {
    let (group, backend) = common::device_group(3);
    let buffers = BufferRegistry::new(group.devices());
    buffers.create("mirrored", BufferInfo::dynamic(64, BufferUsage::VERTEX)).unwrap();

    for device in 0..3 {
        let headless = backend.device(device).unwrap();
        assert_eq!(headless.created(ResourceKind::Buffer), 1);
        assert_eq!(headless.live(ResourceKind::Buffer), 1);
    }

    assert!(buffers.remove("mirrored"));
    for device in 0..3 {
        let headless = backend.device(device).unwrap();
        assert_eq!(headless.destroyed(ResourceKind::Buffer), 1);
        assert_eq!(headless.live(ResourceKind::Buffer), 0);
    }
}

#[test]
fn render_queue_groups_materials() {
    let (mut frames, _backend) = common::coordinator(1);
    frames.create_material("A", MaterialDesc::new("object.vert", "object.frag")).unwrap();
    frames.create_material("B", MaterialDesc::new("object.vert", "object.frag")).unwrap();

    let scene = frames.scene_mut();
    for (index, material) in ["A", "A", "B", "A", "B"].iter().enumerate() {
        scene
            .create_object(&format!("object{}", index), MeshData::cube(1.0), material, Transform::default())
            .unwrap();
    }

    let materials: Vec<u64> = scene.render_queue().entries().iter().map(|e| e.material).collect();
    assert_eq!(materials.len(), 5);
    let mut seen = Vec::new();
    for window in materials.windows(2) {
        if window[0] != window[1] {
            assert!(!seen.contains(&window[1]), "material interleaved: {:?}", materials);
            seen.push(window[0]);
        }
    }
    assert_eq!(scene.render_queue().batch_count(), 2);
}
