//! Integration tests for resource state tracking.

use rtcore::command::{Command, CommandList};
use rtcore::device::{
    BufferDesc, BufferUsage, Device, Format, HeadlessDevice, ImageDesc, ImageUsage, ManagedBuffer, ManagedImage,
    MemoryLocation,
};
use rtcore::state::{AccessState, ImageLayout, QueueFamily, ResourceKind, StateCache, TrackedResource};

fn storage_image(device: &dyn Device) -> ManagedImage {
    let desc = ImageDesc::new_2d("target", 64, 32, Format::Rgba8Unorm, ImageUsage::STORAGE);
    ManagedImage::create(device, &desc).expect("Failed to create image")
}

fn upload_buffer(device: &dyn Device) -> ManagedBuffer {
    let desc = BufferDesc::new("upload", 256, BufferUsage::TRANSFER_SRC, MemoryLocation::CpuToGpu);
    ManagedBuffer::create(device, &desc).expect("Failed to create buffer")
}

#[test]
fn test_unset_resources_are_undefined_and_stable() {
    let device = HeadlessDevice::new();
    let image = storage_image(&device);
    let buffer = upload_buffer(&device);
    let cache = StateCache::new();

    for _ in 0..3 {
        assert_eq!(cache.get(&image), AccessState::UNDEFINED);
        assert_eq!(cache.get(&buffer), AccessState::UNDEFINED);
    }
    assert_eq!(cache.get(&image).layout, ImageLayout::Undefined);
    assert!(cache.is_empty(), "get must not insert entries");
}

#[test]
fn test_barrier_then_set_then_get() {
    let device = HeadlessDevice::new();
    let image = storage_image(&device);
    let mut cache = StateCache::new();

    let sequence = [
        AccessState::TRANSFER_DST,
        AccessState::SHADER_READ,
        AccessState::RAY_TRACING_STORAGE_WRITE,
        AccessState::TRANSFER_SRC,
    ];
    let mut previous = AccessState::UNDEFINED;
    for next in sequence {
        let barrier = cache.compute_barrier(image.view(), next);
        assert_eq!(barrier.src, previous);
        assert_eq!(barrier.dst, next);
        assert!(barrier.is_layout_transition());
        cache.set(image.view(), next);
        assert_eq!(cache.get(&image), next);
        previous = next;
    }
}

#[test]
fn test_views_and_wrappers_share_one_entry() {
    let device = HeadlessDevice::new();
    let image = storage_image(&device);
    let mut cache = StateCache::new();

    cache.set(image.view(), AccessState::SHADER_READ);
    assert_eq!(cache.get(&image), AccessState::SHADER_READ);
    assert_eq!(cache.get(image.id()), AccessState::SHADER_READ);
    assert_eq!(cache.len(), 1);

    let key = image.view().resource_key();
    assert_eq!(key.kind, ResourceKind::Image);
    assert_eq!(key.raw, image.id().0);
}

#[test]
fn test_read_after_read_is_skipped() {
    let device = HeadlessDevice::new();
    let image = storage_image(&device);
    let mut cache = StateCache::new();
    let mut cmd = CommandList::new();

    assert!(cache.transition(&mut cmd, image.view(), AccessState::SHADER_READ));
    assert!(!cache.transition(&mut cmd, image.view(), AccessState::SHADER_READ));
    assert_eq!(cmd.barriers().count(), 1);
}

#[test]
fn test_write_after_write_is_recorded() {
    let device = HeadlessDevice::new();
    let image = storage_image(&device);
    let mut cache = StateCache::new();
    let mut cmd = CommandList::new();

    for _ in 0..3 {
        assert!(cache.transition(&mut cmd, image.view(), AccessState::RAY_TRACING_STORAGE_WRITE));
    }
    assert_eq!(cmd.barriers().count(), 3);
    let last = cmd.barriers().last().unwrap();
    assert_eq!(last.src, last.dst);
    assert!(!last.is_layout_transition());
}

#[test]
fn test_layout_change_between_reads_is_recorded() {
    let device = HeadlessDevice::new();
    let image = storage_image(&device);
    let mut cache = StateCache::new();
    let mut cmd = CommandList::new();

    cache.transition(&mut cmd, image.view(), AccessState::SHADER_READ);
    assert!(cache.transition(&mut cmd, image.view(), AccessState::TRANSFER_SRC));
    let barrier = cmd.barriers().last().unwrap();
    assert_eq!(barrier.src.layout, ImageLayout::ShaderReadOnly);
    assert_eq!(barrier.dst.layout, ImageLayout::TransferSrc);
}

#[test]
fn test_queue_ownership_transfer() {
    let device = HeadlessDevice::new();
    let buffer = upload_buffer(&device);
    let mut cache = StateCache::new();
    let mut cmd = CommandList::new();

    cache.set(&buffer, AccessState::TRANSFER_SRC_BUFFER.with_queue(QueueFamily(1)));
    assert!(cache.transition(
        &mut cmd,
        &buffer,
        AccessState::TRANSFER_SRC_BUFFER.with_queue(QueueFamily(0))
    ));
    let barrier = cmd.barriers().next().unwrap();
    assert!(barrier.is_queue_transfer());
    assert!(!barrier.is_layout_transition());
}

#[test]
fn test_recorded_barriers_reach_the_device() {
    let device = HeadlessDevice::new();
    let image = storage_image(&device);
    let buffer = upload_buffer(&device);
    let mut cache = StateCache::new();
    let mut cmd = CommandList::new();

    cache.transition(&mut cmd, image.view(), AccessState::TRANSFER_DST);
    cache.transition(&mut cmd, &buffer, AccessState::TRANSFER_SRC_BUFFER);
    cache.transition(&mut cmd, &buffer, AccessState::TRANSFER_SRC_BUFFER);
    assert!(cmd.commands().iter().all(|c| matches!(c, Command::Barrier(_))));

    device.submit(&cmd, rtcore::device::SubmitMode::Wait).unwrap();
    assert_eq!(device.stats().barriers, 2);
}

#[test]
fn test_forget_destroyed_resource() {
    let device = HeadlessDevice::new();
    let image = storage_image(&device);
    let mut cache = StateCache::new();
    cache.set(&image, AccessState::SHADER_READ);

    let id = image.id();
    image.destroy(&device);
    assert_eq!(cache.forget(id), Some(AccessState::SHADER_READ));
    assert_eq!(cache.get(id), AccessState::UNDEFINED);
    assert!(cache.is_empty());
}
