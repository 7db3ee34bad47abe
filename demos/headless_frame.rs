//! Render a few headless frames of a small animated scene.
//!
//! Usage: cargo run --example headless_frame [settings.json]
//! Set RTCORE_LOG=debug for build details.

use anyhow::Context;
use rtcore::device::{Format, ImageDesc, ImageUsage, PipelineLayoutId};
use rtcore::logging::init_tracing;
use rtcore::prelude::*;

fn spirv() -> Vec<u8> {
    let words: [u32; 5] = [0x0723_0203, 0x0001_0500, 0, 8, 0];
    bytemuck::cast_slice(&words).to_vec()
}

/// Grid of quads on the XZ plane.
fn grid(size: u32) -> (Vec<Vertex>, Vec<u32>) {
    let mut vertices = Vec::new();
    let mut indices = Vec::new();
    for z in 0..=size {
        for x in 0..=size {
            let p = Vec3::new(x as f32, 0.0, z as f32);
            vertices.push(Vertex::new(p, Vec3::Y, [x as f32 / size as f32, z as f32 / size as f32]));
        }
    }
    let row = size + 1;
    for z in 0..size {
        for x in 0..size {
            let i = z * row + x;
            indices.extend_from_slice(&[i, i + row, i + 1, i + 1, i + row, i + row + 1]);
        }
    }
    (vertices, indices)
}

fn main() -> anyhow::Result<()> {
    let _guard = init_tracing();

    let settings = match std::env::args().nth(1) {
        Some(path) => Settings::load(&path).with_context(|| format!("loading {path}"))?,
        None => Settings::default(),
    };
    let device = HeadlessDevice::new().with_memory_budget(settings.memory_budget);

    let (floor_vertices, floor_indices) = grid(8);
    let tri: Vec<Vertex> = [Vec3::ZERO, Vec3::X, Vec3::Y]
        .into_iter()
        .map(|p| Vertex::new(p, Vec3::Z, [0.0, 0.0]))
        .collect();
    let mut store = GeometryStore::new();
    let floor = store.add_mesh(&floor_vertices, &[PrimitiveDesc { indices: &floor_indices, material_index: 0 }])?;
    let prop = store.add_mesh(&tri, &[PrimitiveDesc { indices: &[0, 1, 2], material_index: 1 }])?;
    store.upload(&device)?;

    let options = BlasOptions::from_settings(&settings);
    let floor_blas = Blas::build(&device, &store, floor, &options)?;
    let prop_blas = Blas::build(&device, &store, prop, &options)?;

    let mut accel = AccelStructureManager::new(&settings);
    accel.add_instance(0, &floor_blas, Mat4::IDENTITY, InstanceFlags::FORCE_OPAQUE)?;
    let props: Vec<_> = (1..=4)
        .map(|i| {
            let at = Mat4::from_translation(Vec3::new(i as f32 * 1.5, 0.5, 4.0));
            accel.add_instance(i, &prop_blas, at, InstanceFlags::empty())
        })
        .collect::<rtcore::Result<_>>()?;

    let code = spirv();
    let rgen = ShaderModule::create(&device, "rgen", ShaderStage::Raygen, &code, "main")?;
    let miss = ShaderModule::create(&device, "miss", ShaderStage::Miss, &code, "main")?;
    let chit = ShaderModule::create(&device, "chit", ShaderStage::ClosestHit, &code, "main")?;
    let mut builder = RtPipelineBuilder::from_settings(&settings).with_label("demo");
    builder.add_group(ShaderGroup::general(rgen.shader_ref()))?;
    builder.add_group(ShaderGroup::general(miss.shader_ref()))?;
    builder.add_group(ShaderGroup::triangles_hit(Some(chit.shader_ref()), None))?;
    let pipeline = builder.build(&device, PipelineLayoutId(0))?;

    let mut sbt_builder =
        ShaderBindingTableBuilder::from_pipeline(&device.caps().rt, &pipeline, settings.sbt_entry_data_size as usize)?;
    let sbt = sbt_builder.build(&device, &pipeline)?;

    let target = ManagedImage::create(
        &device,
        &ImageDesc::new_2d("output", 640, 360, Format::Rgba16Float, ImageUsage::STORAGE),
    )?;

    let mut frame = FrameContext::new(settings.frames_in_flight);
    let mut state = StateCache::new();
    for n in 0..6 {
        for (i, handle) in props.iter().enumerate() {
            let t = n as f32 * 0.1 + i as f32;
            let at = Mat4::from_translation(Vec3::new(i as f32 * 1.5 + 1.5, 0.5 + t.sin() * 0.25, 4.0));
            accel.set_transform(*handle, at)?;
        }
        let kind = accel.rebuild(&device, &mut frame)?;
        let tlas = *accel.tlas()?;
        record_trace(&mut frame.commands, &mut state, &pipeline, &sbt, &tlas, &target, 0, target.extent())?;
        frame.submit(&device, SubmitMode::Wait)?;
        frame.advance();
        println!("frame {n}: {kind:?}, {} instances", tlas.instance_count);
    }

    let stats = device.stats();
    println!(
        "traces: {}, barriers: {}, accel builds: {}, refits: {}",
        stats.traces, stats.barriers, stats.accel_builds, stats.accel_updates
    );
    println!("{:#?}", device.metrics().snapshot());

    accel.destroy(&device);
    sbt.destroy(&device);
    pipeline.destroy(&device);
    for module in [rgen, miss, chit] {
        module.destroy(&device);
    }
    prop_blas.destroy(&device);
    floor_blas.destroy(&device);
    target.destroy(&device);
    store.destroy(&device);
    Ok(())
}
