//! Scene viewer
//!
//! Opens a window and renders a field of spinning cubes in lock-step on every
//! eligible GPU. Settings are read from `scene_viewer.toml`
//! when present.

mod window;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use multigpu_engine::config::Config;
use multigpu_engine::foundation::logging;
use multigpu_engine::prelude::*;
use multigpu_engine::render::backends::vulkan::VulkanBackend;
use rand::Rng;

use window::GlfwSurface;

const CONFIG_PATH: &str = "scene_viewer.toml";
const GRID: i32 = 4;

fn load_config() -> EngineConfig {
    let fallback = || EngineConfig::new("Scene Viewer").with_multi_gpu(true);
    if !Path::new(CONFIG_PATH).exists() {
        return fallback();
    }
    EngineConfig::load_from_file(CONFIG_PATH).unwrap_or_else(|e| {
        log::warn!("Ignoring {}: {}", CONFIG_PATH, e);
        fallback()
    })
}

fn checkerboard(size: u32) -> LoadedImage {
    let mut pixels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let light = (x / 8 + y / 8) % 2 == 0;
            let value = if light { 230 } else { 40 };
            pixels.extend_from_slice(&[value, value, value, 255]);
        }
    }
    LoadedImage {
        pixels,
        width: size,
        height: size,
        channels: 4,
    }
}

/// Place a grid of cubes and return their spin rates
fn populate(frames: &mut FrameCoordinator) -> RenderResult<HashMap<String, Vec3>> {
    frames.create_material("flat", MaterialDesc::new("object.vert", "object.frag"))?;
    frames.create_material("textured", MaterialDesc::new("object.vert", "textured.frag").with_textures(1))?;
    frames.textures().create("checker", TextureInfo::from_pixels(checkerboard(64)))?;

    let mut rng = rand::thread_rng();
    let mut spins = HashMap::new();
    let scene = frames.scene_mut();
    for x in -GRID / 2..GRID / 2 {
        for z in -GRID / 2..GRID / 2 {
            let id = format!("cube_{}_{}", x, z);
            let position = Vec3::new(x as f32 * 2.0 + 1.0, 0.0, z as f32 * 2.0 + 1.0);
            let scale = rng.gen_range(0.5..1.2);
            let transform = Transform {
                scale: Vec3::new(scale, scale, scale),
                ..Transform::at(position)
            };
            let cube = if (x + z).rem_euclid(2) == 0 {
                scene.create_textured_object(&id, MeshData::cube(1.0), "textured", &["checker"], transform)?
            } else {
                scene.create_object(&id, MeshData::cube(1.0), "flat", transform)?
            };
            cube.set_tint([rng.gen_range(0.3..1.0), rng.gen_range(0.3..1.0), rng.gen_range(0.3..1.0), 1.0]);
            spins.insert(id, Vec3::new(rng.gen_range(-1.0..1.0), rng.gen_range(0.2..1.5), 0.0));
        }
    }

    let camera = scene.camera_mut();
    camera.position = Point3::new(0.0, 6.0, 10.0);
    camera.target = Point3::origin();
    Ok(spins)
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config();
    let (width, height) = config.renderer.initial_extent;
    let mut surface = GlfwSurface::new(&config.application_name, width, height)?;
    let context = Arc::new(EngineContext::new(config)?);

    let extensions = surface.required_instance_extensions()?;
    let backend = VulkanBackend::new(&context, &extensions, |instance| {
        surface.create_vulkan_surface(instance).map_err(|e| e.to_string())
    })?;
    let mut frames = FrameCoordinator::new(context, Arc::new(backend), surface.framebuffer_extent())?;
    log::info!("Rendering on {} device(s)", frames.device_group().device_count());

    let spins = populate(&mut frames)?;
    let presented = frames.run(&mut surface, |scene, delta| {
        let dt = delta.as_secs_f32();
        for (id, spin) in &spins {
            if let Some(cube) = scene.object_mut(id) {
                let rotation = cube.transform().rotation + spin * dt;
                cube.set_rotation(rotation);
            }
        }
        LoopControl::Continue
    })?;

    log::info!("Presented {} frames", presented);
    frames.shutdown();
    Ok(())
}

fn main() {
    logging::init();
    if let Err(e) = run() {
        log::error!("Scene viewer failed: {}", e);
        std::process::exit(1);
    }
}
