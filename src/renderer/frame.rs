// Per-frame-in-flight state
//
// A FrameSlot owns everything one frame needs while the GPU may still be
// reading it: sync objects, a primary command buffer, one secondary per
// pass, the camera uniform buffer and the descriptor sets pointing at it.

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use std::sync::Arc;

use crate::backend::pipeline::{CameraUniform, DescriptorLayouts};
use crate::backend::sync::FrameSync;
use crate::backend::{GpuImage, UniformBuffer, VulkanDevice};
use crate::config::clamp_frames_in_flight;
use crate::error::FrameError;

/// Cycles the frame index through `0..max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCounter {
    index: usize,
    max: usize,
}

impl FrameCounter {
    /// `requested` is clamped to the supported range
    pub fn new(requested: usize) -> Self {
        Self {
            index: 0,
            max: clamp_frames_in_flight(requested),
        }
    }

    pub fn current(&self) -> usize {
        self.index
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Move to the next slot and return its index
    pub fn advance(&mut self) -> usize {
        self.index = (self.index + 1) % self.max;
        self.index
    }
}

/// The begin/end bracket of a frame
pub trait FrameRecorder {
    fn begin_frame(&mut self) -> Result<(), FrameError>;
    fn end_frame(&mut self) -> Result<(), FrameError>;
}

/// Begin a frame, run `record`, end the frame.
///
/// A started frame is always ended, even when `record` fails part way; the
/// frame then goes out with whatever was recorded before the error, and the
/// next `begin_frame` works as usual. The recording error wins over an
/// end-of-frame error. `Ok(false)` means the window has no area and the frame
/// was skipped.
pub fn record_frame<R, F>(recorder: &mut R, record: F) -> Result<bool, FrameError>
where
    R: FrameRecorder + ?Sized,
    F: FnOnce(&mut R) -> Result<(), FrameError>,
{
    match recorder.begin_frame() {
        Ok(()) => {}
        Err(FrameError::ZeroExtent) => return Ok(false),
        Err(err) => return Err(err),
    }

    let recorded = record(recorder);
    let ended = recorder.end_frame();

    match (recorded, ended) {
        (Err(err), Err(end_err)) => {
            log::warn!("Ending a failed frame also failed: {}", end_err);
            Err(err)
        }
        (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
        (Ok(()), Ok(())) => Ok(true),
    }
}

/// Secondary command buffers, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Skybox,
    Geometry,
}

impl Pass {
    pub const ALL: [Pass; 2] = [Pass::Skybox, Pass::Geometry];
}

pub struct FrameSlot {
    pub sync: FrameSync,
    pub primary: vk::CommandBuffer,
    secondaries: [vk::CommandBuffer; 2],
    pool: vk::CommandPool,
    pub camera: UniformBuffer,
    pub camera_set: vk::DescriptorSet,
    pub skybox_set: vk::DescriptorSet,
    /// Version of the skybox written into `skybox_set`, 0 for none
    pub skybox_version: u64,
    /// Epoch of the last frame submitted from this slot
    pub submitted_epoch: Option<u64>,
}

impl FrameSlot {
    pub fn new(
        device: &Arc<VulkanDevice>,
        pool: vk::CommandPool,
        descriptor_pool: vk::DescriptorPool,
        layouts: &DescriptorLayouts,
    ) -> Result<Self> {
        let sync = FrameSync::new(&device.device).context("Failed to create frame sync objects")?;

        let primary = device.allocate_command_buffers(pool, vk::CommandBufferLevel::PRIMARY, 1)?[0];
        let secondary = device.allocate_command_buffers(pool, vk::CommandBufferLevel::SECONDARY, 2)?;

        let camera = UniformBuffer::new(device, std::mem::size_of::<CameraUniform>() as u64)
            .context("Failed to create camera uniform buffer")?;

        let set_layouts = [layouts.camera, layouts.skybox];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(descriptor_pool)
            .set_layouts(&set_layouts);
        let sets = unsafe { device.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate frame descriptor sets")?;

        let buffer_info = [vk::DescriptorBufferInfo {
            buffer: camera.handle(),
            offset: 0,
            range: vk::WHOLE_SIZE,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(sets[0])
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&buffer_info)
            .build();
        unsafe { device.device.update_descriptor_sets(&[write], &[]) };

        Ok(Self {
            sync,
            primary,
            secondaries: [secondary[0], secondary[1]],
            pool,
            camera,
            camera_set: sets[0],
            skybox_set: sets[1],
            skybox_version: 0,
            submitted_epoch: None,
        })
    }

    pub fn secondary(&self, pass: Pass) -> vk::CommandBuffer {
        self.secondaries[pass as usize]
    }

    pub fn secondaries(&self) -> [vk::CommandBuffer; 2] {
        self.secondaries
    }

    pub fn has_skybox(&self) -> bool {
        self.skybox_version != 0
    }

    /// Point the skybox set at `cube_map`. The slot's fence must have been waited.
    pub fn write_skybox(&mut self, device: &ash::Device, cube_map: &GpuImage, version: u64) {
        let Some(sampler) = cube_map.sampler() else {
            return;
        };

        let image_info = [vk::DescriptorImageInfo {
            sampler,
            image_view: cube_map.view(),
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.skybox_set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_info)
            .build();

        unsafe { device.update_descriptor_sets(&[write], &[]) };
        self.skybox_version = version;
    }

    /// Reset every command buffer and start the secondaries inside `render_pass`.
    ///
    /// Viewport and scissor are set on each secondary since dynamic state does
    /// not carry over from the primary.
    pub fn begin(
        &self,
        device: &ash::Device,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
    ) -> VkResult<()> {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        let inheritance = vk::CommandBufferInheritanceInfo::builder()
            .render_pass(render_pass)
            .subpass(0)
            .framebuffer(framebuffer);
        let secondary_begin = vk::CommandBufferBeginInfo::builder()
            .flags(
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
                    | vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
            )
            .inheritance_info(&inheritance);

        unsafe {
            device.reset_command_buffer(self.primary, vk::CommandBufferResetFlags::empty())?;
            for cmd in self.secondaries {
                device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
                device.begin_command_buffer(cmd, &secondary_begin)?;
                device.cmd_set_viewport(cmd, 0, &[viewport]);
                device.cmd_set_scissor(cmd, 0, &[scissor]);
            }
        }
        Ok(())
    }

    pub fn destroy(self, device: &ash::Device) {
        self.sync.destroy(device);
        unsafe {
            device.free_command_buffers(self.pool, &[self.primary]);
            device.free_command_buffers(self.pool, &self.secondaries);
        }
    }
}

/// Pool sized for the camera and skybox sets of every slot
pub fn create_descriptor_pool(device: &VulkanDevice, slots: usize) -> Result<vk::DescriptorPool> {
    let slots = slots as u32;
    let pool_sizes = [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: slots,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: slots,
        },
    ];
    let pool_info = vk::DescriptorPoolCreateInfo::builder()
        .max_sets(slots * 2)
        .pool_sizes(&pool_sizes);

    let pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) };
    pool.context("Failed to create descriptor pool")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_FRAMES_IN_FLIGHT_LIMIT;

    #[test]
    fn index_cycles_modulo_max_for_every_supported_depth() {
        for max in 1..=MAX_FRAMES_IN_FLIGHT_LIMIT {
            let mut counter = FrameCounter::new(max);
            assert_eq!(counter.max(), max);

            let seen: Vec<usize> = (0..max * 3).map(|_| counter.advance()).collect();
            let expected: Vec<usize> = (1..=max * 3).map(|frame| frame % max).collect();
            assert_eq!(seen, expected);
        }
    }

    #[test]
    fn out_of_range_depths_are_clamped() {
        assert_eq!(FrameCounter::new(0).max(), 1);
        assert_eq!(FrameCounter::new(9).max(), MAX_FRAMES_IN_FLIGHT_LIMIT);
    }

    #[test]
    fn slot_comes_back_only_after_every_other_slot() {
        for max in 1..=MAX_FRAMES_IN_FLIGHT_LIMIT {
            let mut counter = FrameCounter::new(max);
            let mut last_used: Vec<Option<usize>> = vec![None; max];

            for frame in 0..40 {
                let slot = counter.current();
                if let Some(previous) = last_used[slot] {
                    assert_eq!(frame - previous, max);
                }
                last_used[slot] = Some(frame);
                counter.advance();
            }
        }
    }

    /// Mirrors the renderer's recording state and draw limit
    #[derive(Default)]
    struct Recorder {
        recording: bool,
        frames_ended: usize,
        draws: usize,
        zero_extent: bool,
    }

    impl Recorder {
        fn draw(&mut self, index_count: u32) -> Result<(), FrameError> {
            if !self.recording {
                return Err(FrameError::NotRecording);
            }
            if index_count > 36 {
                return Err(FrameError::TooManyIndices {
                    count: index_count,
                    limit: 36,
                });
            }
            self.draws += 1;
            Ok(())
        }
    }

    impl FrameRecorder for Recorder {
        fn begin_frame(&mut self) -> Result<(), FrameError> {
            if self.zero_extent {
                return Err(FrameError::ZeroExtent);
            }
            if self.recording {
                return Err(FrameError::AlreadyRecording);
            }
            self.recording = true;
            Ok(())
        }

        fn end_frame(&mut self) -> Result<(), FrameError> {
            if !self.recording {
                return Err(FrameError::NotRecording);
            }
            self.recording = false;
            self.frames_ended += 1;
            Ok(())
        }
    }

    #[test]
    fn failed_draw_still_ends_the_frame() {
        let mut recorder = Recorder::default();

        let result = record_frame(&mut recorder, |r| {
            r.draw(36)?;
            r.draw(1 << 20)?;
            r.draw(36)
        });
        assert_eq!(
            result,
            Err(FrameError::TooManyIndices {
                count: 1 << 20,
                limit: 36
            })
        );
        assert!(!recorder.recording);
        assert_eq!(recorder.frames_ended, 1);
        assert_eq!(recorder.draws, 1);

        // the next frame starts normally
        assert_eq!(record_frame(&mut recorder, |r| r.draw(36)), Ok(true));
        assert_eq!(recorder.frames_ended, 2);
        assert_eq!(recorder.draws, 2);
    }

    #[test]
    fn zero_extent_skips_without_ending() {
        let mut recorder = Recorder {
            zero_extent: true,
            ..Recorder::default()
        };

        let mut ran = false;
        let result = record_frame(&mut recorder, |_| {
            ran = true;
            Ok(())
        });
        assert_eq!(result, Ok(false));
        assert!(!ran);
        assert_eq!(recorder.frames_ended, 0);
    }

    #[test]
    fn passes_execute_skybox_first() {
        assert_eq!(Pass::ALL, [Pass::Skybox, Pass::Geometry]);
        assert_eq!(Pass::Skybox as usize, 0);
    }
}
