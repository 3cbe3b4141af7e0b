//! Render loop over simulated GPUs

mod common;

use multigpu_engine::prelude::*;
use multigpu_engine::render::backends::headless::ResourceKind;
use multigpu_engine::render::surface::HeadlessSurface;

#[test]
fn loop_presents_on_every_device_and_follows_resizes() {
    let (mut frames, backend) = common::coordinator(2);
    frames
        .scene_mut()
        .create_object("cube", MeshData::cube(1.0), "basic", Transform::default())
        .unwrap();

    let mut surface = HeadlessSurface::new(Extent2D::new(800, 600)).close_after(4);
    surface.resize(Extent2D::new(1024, 768));
    let presented = frames
        .run(&mut surface, |scene, _elapsed| {
            if let Some(cube) = scene.object_mut("cube") {
                let rotation = cube.transform().rotation + Vec3::new(0.0, 0.1, 0.0);
                cube.set_rotation(rotation);
            }
            LoopControl::Continue
        })
        .unwrap();

    // One iteration is spent rebuilding the swapchain
    assert_eq!(presented, 3);
    for device in 0..2 {
        let headless = backend.device(device).unwrap();
        assert_eq!(headless.presented_frames(), 3);
        assert_eq!(headless.swapchain().unwrap().extent, Extent2D::new(1024, 768));
    }
    assert_eq!(frames.extent(), Extent2D::new(1024, 768));
}

#[test]
fn shutdown_leaves_no_resources_behind() {
    let (mut frames, backend) = common::coordinator(2);
    frames
        .scene_mut()
        .create_object("cube", MeshData::cube(1.0), "basic", Transform::default())
        .unwrap();
    assert_eq!(frames.render_frame().unwrap(), FrameStatus::Presented);

    frames.shutdown();
    for device in 0..2 {
        let headless = backend.device(device).unwrap();
        for kind in [ResourceKind::Buffer, ResourceKind::Pipeline, ResourceKind::BindingSet] {
            assert_eq!(headless.live(kind), 0, "{:?} leaked on device {}", kind, device);
        }
    }
}
