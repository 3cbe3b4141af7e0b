//! End-to-end scenarios over the headless backend

mod common;

use multigpu_engine::prelude::*;
use multigpu_engine::render::hal::BufferUsage;
use multigpu_engine::render::resources::BufferRegistry;

#[test]
fn static_vertex_buffer_on_one_device() {
    let (group, _backend) = common::device_group(1);
    let buffers = BufferRegistry::new(group.devices());

    let floats: Vec<f32> = (0..12).map(|i| i as f32).collect();
    let bytes = bytemuck::cast_slice(&floats).to_vec();
    let buffer = buffers
        .create("triangle", BufferInfo::static_data(BufferUsage::VERTEX, bytes))
        .unwrap();

    assert_eq!(buffer.get_size(), 48);
    let result = buffer.update_data(&[0u8; 4], 0);
    assert!(matches!(result, Err(RenderError::StaticBufferUpdate { .. })));
}

#[test]
fn dynamic_uniform_buffer_mirrors_both_devices() {
    let (group, _backend) = common::device_group(2);
    assert_eq!(group.device_count(), 2);
    let buffers = BufferRegistry::new(group.devices());

    let buffer = buffers
        .create("uniforms", BufferInfo::dynamic(64, BufferUsage::UNIFORM))
        .unwrap();
    let payload: Vec<u8> = (0..64).collect();
    buffer.update_data(&payload, 0).unwrap();

    let first = buffer.read_data(0, 0, 64).unwrap();
    let second = buffer.read_data(1, 0, 64).unwrap();
    assert_eq!(first, payload);
    assert_eq!(first, second);
}

#[test]
fn material_usage_counter_follows_objects() {
    let (mut frames, _backend) = common::coordinator(1);
    frames
        .create_material("M1", MaterialDesc::new("object.vert", "object.frag"))
        .unwrap();
    let scene = frames.scene_mut();

    scene
        .create_object("cube1", MeshData::cube(1.0), "M1", Transform::default())
        .unwrap();
    scene
        .create_object("cube2", MeshData::cube(1.0), "M1", Transform::default())
        .unwrap();
    assert_eq!(scene.material_usage("M1"), Some(2));

    assert!(scene.remove_object("cube1"));
    assert_eq!(scene.material_usage("M1"), Some(1));

    assert!(scene.remove_object("cube2"));
    assert_eq!(scene.material_usage("M1"), None);
}
