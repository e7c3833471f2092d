// Round trips through real GPU memory on a headless device.
//
// These need a Vulkan driver, so they are ignored by default:
//   cargo test -- --ignored

use ash::vk;
use frame_core::backend::sync::FrameSync;
use frame_core::backend::DeviceDesc;
use frame_core::renderer::submit::{self, QueuedCommandBuffer, SubmissionQueue};
use frame_core::{
    GpuImage, ImageKind, QueueType, ResourceError, StagingBuffer, UniformBuffer, VertexBuffer,
    VulkanDevice,
};
use std::sync::Arc;

fn headless_device() -> Arc<VulkanDevice> {
    VulkanDevice::new(&DeviceDesc::default(), None).expect("no Vulkan device available")
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

#[test]
#[ignore]
fn uniform_buffer_copies_back_through_staging() {
    let device = headless_device();
    let data = pattern(256);

    let mut uniform = UniformBuffer::new(&device, data.len() as u64).unwrap();
    uniform.set_data(0, &data).unwrap();

    let mut staging = StagingBuffer::new(&device, data.len() as u64).unwrap();
    staging
        .transfer_from_buffer_immediate(
            &device,
            &uniform,
            vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: data.len() as u64,
            },
        )
        .unwrap();

    let mut out = vec![0u8; data.len()];
    staging.read_data(0, &mut out).unwrap();
    assert_eq!(out, data);
}

#[test]
#[ignore]
fn device_local_buffer_round_trips_partial_region() {
    let device = headless_device();
    let data = pattern(128);

    let vertices = VertexBuffer::new_device_local(&device, 512).unwrap();
    let upload = StagingBuffer::with_data(&device, &data).unwrap();
    upload
        .transfer_to_buffer_immediate(
            &device,
            &vertices,
            vk::BufferCopy {
                src_offset: 0,
                dst_offset: 64,
                size: data.len() as u64,
            },
        )
        .unwrap();

    let mut readback = StagingBuffer::new(&device, data.len() as u64).unwrap();
    readback
        .transfer_from_buffer_immediate(
            &device,
            &vertices,
            vk::BufferCopy {
                src_offset: 64,
                dst_offset: 0,
                size: data.len() as u64,
            },
        )
        .unwrap();

    let mut out = vec![0u8; data.len()];
    readback.read_data(0, &mut out).unwrap();
    assert_eq!(out, data);
}

#[test]
#[ignore]
fn out_of_range_writes_leave_buffer_untouched() {
    let device = headless_device();
    let mut uniform = UniformBuffer::new(&device, 64).unwrap();
    uniform.set_data(0, &[9u8; 64]).unwrap();

    let err = uniform.set_data(60, &[1u8; 8]).unwrap_err();
    assert!(matches!(err, ResourceError::OutOfBounds { .. }));

    let mut out = [0u8; 64];
    uniform.read_data(0, &mut out).unwrap();
    assert_eq!(out, [9u8; 64]);
}

#[test]
#[ignore]
fn image_upload_then_readback_preserves_texels() {
    let device = headless_device();
    let mut image = GpuImage::new_2d(&device, 16, 8, vk::Format::R8G8B8A8_UNORM).unwrap();
    assert_eq!(image.kind(), ImageKind::Texture2D);
    assert_eq!(image.byte_size(), 16 * 8 * 4);

    let texels = pattern(image.byte_size() as usize);
    let upload = StagingBuffer::with_data(&device, &texels).unwrap();
    upload.transfer_to_image_immediate(&device, &mut image).unwrap();
    assert_eq!(image.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

    let mut readback = StagingBuffer::new(&device, image.byte_size()).unwrap();
    readback
        .transfer_from_image_immediate(&device, &mut image)
        .unwrap();
    assert_eq!(image.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

    let mut out = vec![0u8; texels.len()];
    readback.read_data(0, &mut out).unwrap();
    assert_eq!(out, texels);
}

#[test]
#[ignore]
fn undersized_staging_is_rejected_for_image_upload() {
    let device = headless_device();
    let mut cube = GpuImage::new_cube(&device, 4, vk::Format::R8G8B8A8_UNORM).unwrap();

    let staging = StagingBuffer::new(&device, 4 * 4 * 4).unwrap();
    let err = staging
        .transfer_to_image_immediate(&device, &mut cube)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ResourceError>(),
        Some(ResourceError::ImageSizeMismatch { .. })
    ));
}

#[test]
#[ignore]
fn planned_copies_change_the_layout_only_when_committed() {
    let device = headless_device();
    let mut image = GpuImage::new_2d(&device, 4, 4, vk::Format::R8G8B8A8_UNORM).unwrap();

    let upload = image.plan_upload().unwrap();
    assert_eq!(image.layout(), vk::ImageLayout::UNDEFINED);

    image.commit_copy(&upload).unwrap();
    assert_eq!(image.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

    // the same plan again no longer matches the image
    let err = image.commit_copy(&upload).unwrap_err();
    assert!(matches!(err, ResourceError::StaleLayout { .. }));
    assert_eq!(image.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
}

#[test]
#[ignore]
fn queued_transfer_lands_before_the_frame_fence() {
    let device = headless_device();
    let data = pattern(192);

    let vertices = VertexBuffer::new_device_local(&device, data.len() as u64).unwrap();
    let upload = StagingBuffer::with_data(&device, &data).unwrap();
    let (src, dst) = (upload.handle(), vertices.handle());
    let region = vk::BufferCopy {
        src_offset: 0,
        dst_offset: 0,
        size: data.len() as u64,
    };

    let mut queue = SubmissionQueue::new();
    let copy = QueuedCommandBuffer::record(&device, QueueType::Transfer, |raw, cmd| {
        unsafe { raw.cmd_copy_buffer(cmd, src, dst, &[region]) };
        Ok(())
    })
    .unwrap();
    queue.enqueue(copy);

    let mut sync = FrameSync::new(&device.device).unwrap();
    let submits = queue
        .flush(0, |queue_type, batch| {
            submit::submit_batch(&device, &mut sync, queue_type, batch)
        })
        .unwrap();
    assert_eq!(submits, 1);
    assert_eq!(queue.pending_len(), 0);

    // stand-in for the frame's primary submit: wait on the queued work, signal the fence
    let waits = sync.take_pending();
    assert_eq!(waits.len(), 1);
    let stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; waits.len()];
    let primary = vk::SubmitInfo::builder()
        .wait_semaphores(&waits)
        .wait_dst_stage_mask(&stages)
        .build();
    sync.reset(&device.device).unwrap();
    unsafe {
        device
            .device
            .queue_submit(device.queue(QueueType::Graphics), &[primary], sync.in_flight_fence)
            .unwrap();
    }
    sync.wait(&device.device).unwrap();
    sync.recycle();

    let released = queue.release_completed(0, |queued| queued.free(&device.device));
    assert_eq!(released, 1);
    assert_eq!(queue.in_flight_len(), 0);

    let mut readback = StagingBuffer::new(&device, data.len() as u64).unwrap();
    readback
        .transfer_from_buffer_immediate(&device, &vertices, region)
        .unwrap();
    let mut out = vec![0u8; data.len()];
    readback.read_data(0, &mut out).unwrap();
    assert_eq!(out, data);

    sync.destroy(&device.device);
}
