//! A complete headless frame: geometry, acceleration structures, pipeline,
//! binding table and dispatch driven through a frame schedule.

use rtcore::accel::{AccelStructureManager, Blas, BlasOptions, InstanceFlags, RebuildKind};
use rtcore::device::{Device, Format, HeadlessDevice, ImageDesc, ImageUsage, ManagedImage, PipelineLayoutId, SubmitMode};
use rtcore::dispatch::record_trace;
use rtcore::frame::FrameContext;
use rtcore::geometry::{GeometryStore, PrimitiveDesc, Vertex};
use rtcore::rtpipe::{RtPipeline, RtPipelineBuilder, SbtRegion, ShaderBindingTable, ShaderBindingTableBuilder, ShaderGroup, ShaderModule, ShaderStage};
use rtcore::schedule::FrameSchedule;
use rtcore::state::{AccessState, StateCache};
use rtcore::util::{Mat4, Vec3};
use rtcore::{Error, Result, Settings};

struct Scene {
    device: HeadlessDevice,
    frame: FrameContext,
    state: StateCache,
    accel: AccelStructureManager,
    pipeline: RtPipeline,
    sbt: ShaderBindingTable,
    target: ManagedImage,
    kinds: Vec<RebuildKind>,
    spin: f32,
}

fn spirv() -> Vec<u8> {
    let words: [u32; 5] = [0x0723_0203, 0x0001_0500, 0, 8, 0];
    bytemuck::cast_slice(&words).to_vec()
}

fn scene() -> Scene {
    let settings = Settings {
        sbt_entry_data_size: 16,
        ..Settings::default()
    };
    let device = HeadlessDevice::new();

    let vertices: Vec<Vertex> = [Vec3::ZERO, Vec3::X, Vec3::Y]
        .into_iter()
        .map(|p| Vertex::new(p, Vec3::Z, [p.x, p.y]))
        .collect();
    let mut store = GeometryStore::new();
    let mesh = store
        .add_mesh(&vertices, &[PrimitiveDesc { indices: &[0, 1, 2], material_index: 3 }])
        .unwrap();
    store.upload(&device).unwrap();
    let blas = Blas::build(&device, &store, mesh, &BlasOptions::from_settings(&settings)).unwrap();

    let mut accel = AccelStructureManager::new(&settings);
    accel.add_instance(10, &blas, Mat4::IDENTITY, InstanceFlags::empty()).unwrap();
    accel
        .add_instance(11, &blas, Mat4::from_translation(Vec3::Z * -3.0), InstanceFlags::FORCE_OPAQUE)
        .unwrap();

    let code = spirv();
    let rgen = ShaderModule::create(&device, "rgen", ShaderStage::Raygen, &code, "main").unwrap();
    let miss = ShaderModule::create(&device, "miss", ShaderStage::Miss, &code, "main").unwrap();
    let chit = ShaderModule::create(&device, "chit", ShaderStage::ClosestHit, &code, "main").unwrap();
    let mut builder = RtPipelineBuilder::from_settings(&settings).with_label("scene");
    builder.add_group(ShaderGroup::general(rgen.shader_ref())).unwrap();
    builder.add_group(ShaderGroup::general(miss.shader_ref())).unwrap();
    builder
        .add_group(ShaderGroup::triangles_hit(Some(chit.shader_ref()), None))
        .unwrap();
    let pipeline = builder.build(&device, PipelineLayoutId(0)).unwrap();

    let mut sbt_builder =
        ShaderBindingTableBuilder::from_pipeline(&device.caps().rt, &pipeline, settings.sbt_entry_data_size as usize).unwrap();
    sbt_builder
        .set_data(SbtRegion::Hit, 0, bytemuck::bytes_of(&[0.8f32, 0.2, 0.2, 1.0]))
        .unwrap();
    let sbt = sbt_builder.build(&device, &pipeline).unwrap();

    let target = ManagedImage::create(
        &device,
        &ImageDesc::new_2d("target", 320, 240, Format::Rgba8Unorm, ImageUsage::STORAGE),
    )
    .unwrap();

    Scene {
        frame: FrameContext::new(settings.frames_in_flight),
        device,
        state: StateCache::new(),
        accel,
        pipeline,
        sbt,
        target,
        kinds: Vec::new(),
        spin: 0.0,
    }
}

fn schedule() -> FrameSchedule<Scene> {
    let mut schedule = FrameSchedule::new();
    schedule.add_fn(100, "submit", |s: &mut Scene| {
        s.frame.submit(&s.device, SubmitMode::Wait)?;
        s.frame.advance();
        Ok(())
    });
    schedule.add_fn(20, "trace", |s: &mut Scene| {
        let tlas = *s.accel.tlas()?;
        let extent = s.target.extent();
        record_trace(&mut s.frame.commands, &mut s.state, &s.pipeline, &s.sbt, &tlas, &s.target, 0, extent)
    });
    schedule.add_fn(0, "animate", |s: &mut Scene| {
        s.spin += 0.25;
        if let Some(handle) = s.accel.handle_of(11) {
            s.accel
                .set_transform(handle, Mat4::from_rotation_y(s.spin) * Mat4::from_translation(Vec3::Z * -3.0))?;
        }
        Ok(())
    });
    schedule.add_fn(10, "accel", |s: &mut Scene| {
        let kind = s.accel.rebuild(&s.device, &mut s.frame)?;
        s.kinds.push(kind);
        Ok(())
    });
    schedule
}

#[test]
fn test_two_frames_trace_and_refit() {
    let mut scene = scene();
    let mut schedule = schedule();
    assert_eq!(
        schedule.names().collect::<Vec<_>>(),
        ["animate", "accel", "trace", "submit"]
    );

    let barriers_before = scene.device.stats().barriers;
    schedule.run_frame(&mut scene).unwrap();
    let first = scene.device.stats();
    assert_eq!(first.traces, 1);
    assert_eq!(first.pipeline_binds, 1);
    // The target leaves UNDEFINED; the table is already host-visible and read-only.
    assert_eq!(first.barriers - barriers_before, 1);

    schedule.run_frame(&mut scene).unwrap();
    let second = scene.device.stats();
    assert_eq!(second.traces, 2);
    // Storage writes always need a barrier against the previous frame.
    assert_eq!(second.barriers - first.barriers, 1);

    assert_eq!(scene.kinds, [RebuildKind::Full, RebuildKind::Refit]);
    assert_eq!(scene.frame.serial(), 2);
    assert_eq!(scene.state.get(scene.target.view()), AccessState::RAY_TRACING_STORAGE_WRITE);
    assert_eq!(scene.state.get(scene.sbt.buffer().unwrap()), AccessState::SBT_READ);

    let tlas = scene.accel.tlas().unwrap();
    assert_eq!(scene.state.get(tlas.accel), AccessState::AS_READ);
    let info = scene.device.accel_info(tlas.accel).unwrap();
    assert!(info.built);
    assert_eq!(info.primitive_count, 2);
    assert_eq!(info.updates, 1);
}

#[test]
fn test_failing_stage_stops_the_frame() {
    let mut scene = scene();
    let mut schedule = schedule();
    schedule.add_fn(15, "broken", |_: &mut Scene| -> Result<()> {
        Err(Error::InvalidGroup("broken stage".into()))
    });

    assert!(schedule.run_frame(&mut scene).is_err());
    assert_eq!(scene.device.stats().traces, 0);
    assert_eq!(scene.frame.serial(), 0);
    // The TLAS build was recorded but never submitted.
    assert!(!scene.frame.commands.is_empty());

    assert_eq!(schedule.remove("broken"), 1);
    schedule.run_frame(&mut scene).unwrap();
    assert_eq!(scene.device.stats().traces, 1);
}

#[test]
fn test_trace_arguments_are_checked() {
    let mut scene = scene();
    let mut frame = FrameContext::new(1);
    scene.accel.rebuild(&scene.device, &mut frame).unwrap();
    let tlas = *scene.accel.tlas().unwrap();
    frame.commands.clear();

    let err = record_trace(
        &mut frame.commands,
        &mut scene.state,
        &scene.pipeline,
        &scene.sbt,
        &tlas,
        &scene.target,
        0,
        (0, 240),
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert!(err.is_usage());

    let err = record_trace(
        &mut frame.commands,
        &mut scene.state,
        &scene.pipeline,
        &scene.sbt,
        &tlas,
        &scene.target,
        1,
        (320, 240),
    )
    .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert!(frame.commands.is_empty(), "rejected traces record nothing");
}
