use std::rc::Rc;

use anyhow::Context;
use strata_app::frame_ubos::{FrameUbos, LightParams};
use strata_app::scene_buffers::{SceneBuffers, SceneObject};
use strata_app::scene_records;
use strata_gfx::{GfxBackend, HostBackend};
use strata_render_interface::settings::EngineSettings;

const FRAME_COUNT: u64 = 8;
const OBJECT_COUNT: u32 = 16;

fn load_settings() -> anyhow::Result<EngineSettings> {
    match std::env::args().nth(1) {
        Some(path) => EngineSettings::from_file(&path).with_context(|| format!("failed to load settings: {path}")),
        None => {
            log::info!("no settings file given, use default settings");
            Ok(EngineSettings::default())
        }
    }
}

fn print_layouts() {
    for (name, layout) in scene_records::all_records() {
        log::info!("{name} ({}):\n{layout}", layout.rules().name());
    }
}

fn demo_objects() -> Vec<SceneObject> {
    (0..OBJECT_COUNT)
        .map(|i| {
            let center = glam::Vec3::new((i % 4) as f32 * 2.0, 0.0, (i / 4) as f32 * 2.0);
            SceneObject {
                model: glam::Mat4::from_translation(center),
                material_id: (i % 3) as i32,
                mesh_id: 0,
                index_count: 36,
                first_index: 0,
                vertex_offset: 0,
                bounds_min: center - glam::Vec3::splat(0.5),
                bounds_max: center + glam::Vec3::splat(0.5),
            }
        })
        .collect()
}

fn main() -> anyhow::Result<()> {
    strata_crate_tools::init_log::init_log();
    tracy_client::Client::start();
    let _span = tracy_client::span!("layout-demo");

    let settings = load_settings()?;
    log::info!("settings:\n{}", settings.to_toml_string()?);

    print_layouts();

    let backend: Rc<dyn GfxBackend> = Rc::new(HostBackend::default());

    let mut scene = SceneBuffers::new(backend.clone(), OBJECT_COUNT).context("failed to create scene buffers")?;
    scene.upload_objects(&demo_objects()).context("failed to upload scene objects")?;
    scene.set_material(glam::Vec4::new(0.8, 0.8, 0.8, 1.0), 0.5, [0, 1, 2]);
    let (indirect_offset, indirect_stride) = scene.indirect_args();
    log::info!(
        "scene: {} objects, indirect draw offset {indirect_offset} stride {indirect_stride}",
        scene.object_count()
    );

    let mut frame_ubos = FrameUbos::new(backend.clone(), &settings).context("failed to create frame ubos")?;
    let light = LightParams::default();
    for frame_id in 0..FRAME_COUNT {
        frame_ubos.begin_frame(frame_id);

        // 每帧新增一个 pass，迫使 arena 不断扩容
        frame_ubos.add_pass().with_context(|| format!("failed to add pass in frame {frame_id}"))?;

        let eye = glam::Vec3::new(frame_id as f32, 5.0, 10.0);
        let project_view = glam::Mat4::perspective_rh(60_f32.to_radians(), 16.0 / 9.0, 0.1, 100.0)
            * glam::Mat4::look_at_rh(eye, glam::Vec3::ZERO, glam::Vec3::Y);
        scene.set_frustum(project_view);
        for pass in frame_ubos.passes() {
            frame_ubos.update_pass(*pass, project_view, &light);
        }
    }

    let manager = frame_ubos.manager();
    log::info!(
        "dynamic ubo: {} passes, {} descriptor sets, arena {} / {} bytes, grew {} times, rebind {} times, {} retired buffers",
        frame_ubos.passes().len(),
        manager.cached_set_count(),
        manager.arena().capacity_in_use(),
        manager.arena().capacity_total(),
        manager.arena().growth_count(),
        manager.rebind_count(),
        manager.arena().retired_count()
    );
    log::info!(
        "descriptor pool: {} pools, expansion track {:?}",
        manager.pool().pool_count(),
        manager.pool().expansion_track()
    );

    log::info!("end run.");
    Ok(())
}
