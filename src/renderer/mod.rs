// Frame pipeline
//
// The Renderer is the one context handle the application talks to. It owns
// the device, the swapchain and one FrameSlot per frame in flight, and it is
// the only layer that decides between recreating, dropping a frame or
// giving up.
//
// FRAME FLOW:
// 1. begin_frame: rebuild the swapchain if flagged, wait for the slot's fence,
//    release resources that fence covered, acquire an image, begin recording
// 2. clear / update_camera / draw record into the slot's secondaries
// 3. end_frame: flush queued submits, record the primary, submit, present,
//    advance the frame index and epoch

pub mod frame;
pub mod release;
pub mod submit;

use anyhow::{Context, Result};
use ash::vk;
use glam::{Mat4, Vec4};
use std::sync::Arc;

use crate::backend::buffer::BufferKind;
use crate::backend::device::RequiredFeatures;
use crate::backend::pipeline::{
    create_pipeline_cache, CameraUniform, DescriptorLayouts, PipelineSet, ShaderSources,
    SKYBOX_VERTEX_COUNT,
};
use crate::backend::swapchain::{self, PresentStatus};
use crate::backend::{
    DeviceDesc, GpuBuffer, GpuImage, ImageKind, IndexBuffer, QueueType, StagingBuffer, SurfaceTarget,
    Swapchain, UniformBuffer, VertexBuffer, VulkanDevice,
};
use crate::config::{Capabilities, RendererMode};
use crate::error::{FrameError, ResourceError};

use frame::{create_descriptor_pool, FrameCounter, FrameSlot, Pass};
pub use frame::{record_frame, FrameRecorder};
use release::{GpuResource, ReleaseQueue};
use submit::{QueuedCommandBuffer, SubmissionQueue};

/// Everything the renderer would otherwise read from disk
#[derive(Debug, Clone, Default)]
pub struct RendererAssets {
    pub shaders: ShaderSources,
    /// Blob previously returned by `Renderer::pipeline_cache_data`
    pub pipeline_cache: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy)]
struct ActiveFrame {
    image_index: u32,
    clear_color: [f32; 4],
}

pub struct Renderer {
    capabilities: Capabilities,
    frames: FrameCounter,
    slots: Vec<FrameSlot>,
    submissions: SubmissionQueue<QueuedCommandBuffer>,
    releases: ReleaseQueue<Box<dyn GpuResource>>,
    /// Frame number being recorded (or about to be)
    epoch: u64,
    active: Option<ActiveFrame>,

    skybox: Option<GpuImage>,
    skybox_version: u64,

    window_extent: vk::Extent2D,
    resize_pending: bool,

    descriptor_layouts: DescriptorLayouts,
    descriptor_pool: vk::DescriptorPool,
    pipelines: PipelineSet,
    pipeline_format: vk::Format,
    pipeline_cache: vk::PipelineCache,
    shaders: ShaderSources,

    torn_down: bool,
    swapchain: Swapchain,
    device: Arc<VulkanDevice>,
}

impl Renderer {
    /// Open the device, build the swapchain, pipelines and frame slots.
    ///
    /// Every failure here is fatal for the application.
    pub fn init(capabilities: Capabilities, target: &SurfaceTarget, assets: RendererAssets) -> Result<Self> {
        log::info!(
            "Initializing renderer: {:?}, {} frames in flight",
            capabilities.mode,
            capabilities.frames_in_flight()
        );

        let desc = DeviceDesc {
            app_name: capabilities.app_name.clone(),
            app_version: capabilities.app_version,
            enable_validation: capabilities.validation,
            required_features: RequiredFeatures::default(),
        };
        let device = VulkanDevice::new(&desc, Some(target)).context("Failed to create Vulkan device")?;

        let swapchain = Swapchain::new(&device, capabilities.width, capabilities.height, capabilities.vsync)?;

        let pipeline_cache = create_pipeline_cache(&device, assets.pipeline_cache.as_deref())?;
        let descriptor_layouts = DescriptorLayouts::new(&device)?;
        let pipelines = PipelineSet::new(
            &device,
            swapchain.render_pass(),
            &descriptor_layouts,
            &assets.shaders,
            pipeline_cache,
            capabilities.mode,
        )?;

        let frames = FrameCounter::new(capabilities.max_frames_in_flight);
        let descriptor_pool = create_descriptor_pool(&device, frames.max())?;
        let command_pool = device.command_pool_for(QueueType::Graphics)?;
        let slots = (0..frames.max())
            .map(|_| FrameSlot::new(&device, command_pool, descriptor_pool, &descriptor_layouts))
            .collect::<Result<Vec<_>>>()?;

        log::info!("Renderer ready");

        Ok(Self {
            window_extent: vk::Extent2D {
                width: capabilities.width,
                height: capabilities.height,
            },
            capabilities,
            submissions: SubmissionQueue::new(),
            frames,
            slots,
            releases: ReleaseQueue::new(),
            epoch: 0,
            active: None,
            skybox: None,
            skybox_version: 0,
            resize_pending: false,
            descriptor_layouts,
            descriptor_pool,
            pipelines,
            pipeline_format: swapchain.format(),
            pipeline_cache,
            shaders: assets.shaders,
            torn_down: false,
            swapchain,
            device,
        })
    }

    /// Wait for the GPU and free everything the renderer owns
    pub fn shutdown(mut self) -> Result<()> {
        log::info!("Shutting down renderer");
        self.device
            .wait_idle()
            .context("Failed waiting for device idle at shutdown")?;
        self.teardown();
        Ok(())
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn frame_index(&self) -> usize {
        self.frames.current()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn pending_releases(&self) -> usize {
        self.releases.len()
    }

    // -----------------------------------------------------------------------
    // Frame lifecycle
    // -----------------------------------------------------------------------

    /// Start recording a frame.
    ///
    /// `ZeroExtent` means the window is minimized and the frame should be
    /// skipped; nothing was recorded.
    pub fn begin_frame(&mut self) -> Result<(), FrameError> {
        if self.active.is_some() {
            log::error!("begin_frame called while a frame is being recorded");
            return Err(FrameError::AlreadyRecording);
        }

        if self.resize_pending || self.swapchain.needs_recreate() {
            self.rebuild_swapchain()?;
        }

        let slot_index = self.frames.current();
        {
            let slot = &mut self.slots[slot_index];
            slot.sync.wait(&self.device.device)?;
            slot.sync.recycle();

            if let Some(completed) = slot.submitted_epoch.take() {
                let released = self.releases.release_completed(completed);
                if released > 0 {
                    log::debug!("Released {} resources up to epoch {}", released, completed);
                }
                let device = &self.device.device;
                self.submissions
                    .release_completed(completed, |queued| queued.free(device));
            }

            if let Some(skybox) = &self.skybox {
                if slot.skybox_version != self.skybox_version {
                    slot.write_skybox(&self.device.device, skybox, self.skybox_version);
                }
            }
        }

        let image_available = self.slots[slot_index].sync.image_available;
        let extent = self.window_extent;
        let generation = self.swapchain.generation();

        let image_index = swapchain::acquire_with_retry(
            &mut self.swapchain,
            |chain| chain.acquire(image_available),
            |chain| chain.recreate(extent.width, extent.height),
        )?;

        let started = self.start_recording(slot_index, image_index, generation);
        if let Err(err) = started {
            log::warn!("Failed to start frame: {}", err);
            // The acquired image's semaphore is signaled and will never be waited
            self.reset_slot(slot_index);
            return Err(err);
        }

        self.active = Some(ActiveFrame {
            image_index,
            clear_color: self.capabilities.clear_color,
        });
        Ok(())
    }

    fn start_recording(&mut self, slot_index: usize, image_index: u32, generation: u64) -> Result<(), FrameError> {
        if self.swapchain.generation() != generation {
            self.refresh_pipelines()?;
        }

        let framebuffer = self
            .swapchain
            .framebuffer(image_index)
            .ok_or(FrameError::OutOfDate)?;
        let device = &self.device.device;
        let slot = &self.slots[slot_index];

        slot.begin(
            device,
            self.swapchain.render_pass(),
            framebuffer,
            self.swapchain.extent(),
        )?;

        let geometry = slot.secondary(Pass::Geometry);
        unsafe {
            device.cmd_bind_pipeline(geometry, vk::PipelineBindPoint::GRAPHICS, self.pipelines.geometry);
            device.cmd_bind_descriptor_sets(
                geometry,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipelines.geometry_layout,
                0,
                &[slot.camera_set],
                &[],
            );
        }
        Ok(())
    }

    /// Finish the frame: flush queued work, submit and present
    pub fn end_frame(&mut self) -> Result<(), FrameError> {
        let frame = self.active.take().ok_or_else(|| {
            log::error!("end_frame called without begin_frame");
            FrameError::NotRecording
        })?;
        let slot_index = self.frames.current();

        if let Err(err) = self.flush_queued_submits() {
            log::warn!("Queued submits failed: {:#}", err);
        }

        if let Err(err) = self.record_primary(slot_index, &frame) {
            log::warn!("Failed to record frame, dropping it: {}", err);
            self.drop_frame(slot_index);
            return Err(err.into());
        }

        let queue = self.device.queue(QueueType::Graphics);
        let device = &self.device.device;
        let slot = &mut self.slots[slot_index];

        let mut waits = vec![slot.sync.image_available];
        let mut stages = vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        for semaphore in slot.sync.take_pending() {
            waits.push(semaphore);
            stages.push(vk::PipelineStageFlags::ALL_COMMANDS);
        }
        let command_buffers = [slot.primary];
        let signals = [slot.sync.render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&waits)
            .wait_dst_stage_mask(&stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signals)
            .build();

        let submitted = slot.sync.reset(device).and_then(|()| unsafe {
            device.queue_submit(queue, &[submit_info], slot.sync.in_flight_fence)
        });
        if let Err(err) = submitted {
            log::warn!("Frame submit failed, dropping frame: {}", err);
            self.drop_frame(slot_index);
            return Err(err.into());
        }
        slot.submitted_epoch = Some(self.epoch);

        match self.swapchain.present(queue, frame.image_index, &signals) {
            Ok(PresentStatus::Presented) => {}
            Ok(status) => log::debug!("Present returned {:?}, swapchain flagged for rebuild", status),
            Err(err) => log::warn!("Present failed, frame dropped: {}", err),
        }

        self.advance();
        Ok(())
    }

    fn record_primary(&self, slot_index: usize, frame: &ActiveFrame) -> ash::prelude::VkResult<()> {
        let device = &self.device.device;
        let slot = &self.slots[slot_index];

        let skybox = slot.secondary(Pass::Skybox);
        if self.capabilities.mode == RendererMode::Scene3D && slot.has_skybox() {
            unsafe {
                device.cmd_bind_pipeline(skybox, vk::PipelineBindPoint::GRAPHICS, self.pipelines.skybox);
                device.cmd_bind_descriptor_sets(
                    skybox,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.pipelines.skybox_layout,
                    0,
                    &[slot.camera_set, slot.skybox_set],
                    &[],
                );
                device.cmd_draw(skybox, SKYBOX_VERTEX_COUNT, 1, 0, 0);
            }
        }

        let framebuffer = self
            .swapchain
            .framebuffer(frame.image_index)
            .ok_or(vk::Result::ERROR_OUT_OF_DATE_KHR)?;
        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: frame.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.swapchain.render_pass())
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.swapchain.extent(),
            })
            .clear_values(&clear_values);

        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            for pass in Pass::ALL {
                device.end_command_buffer(slot.secondary(pass))?;
            }

            device.begin_command_buffer(slot.primary, &begin_info)?;
            device.cmd_begin_render_pass(
                slot.primary,
                &render_pass_info,
                vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
            );
            device.cmd_execute_commands(slot.primary, &slot.secondaries());
            device.cmd_end_render_pass(slot.primary);
            device.end_command_buffer(slot.primary)
        }
    }

    fn advance(&mut self) {
        self.frames.advance();
        self.epoch += 1;
    }

    /// Abandon the frame in `slot_index` after a failure.
    ///
    /// Sync objects may hold signals nobody will wait for, so after an idle
    /// wait they are replaced and the frame index still moves on.
    fn drop_frame(&mut self, slot_index: usize) {
        self.reset_slot(slot_index);
        let released = self.releases.release_completed(self.epoch);
        if released > 0 {
            log::debug!("Released {} resources after dropped frame", released);
        }
        let device = &self.device.device;
        self.submissions
            .release_completed(self.epoch, |queued| queued.free(device));
        self.advance();
    }

    fn reset_slot(&mut self, slot_index: usize) {
        if let Err(err) = self.device.wait_idle() {
            log::error!("Device wait failed while dropping a frame: {:#}", err);
        }
        let slot = &mut self.slots[slot_index];
        if let Err(err) = slot.sync.recreate(&self.device.device) {
            log::error!("Failed to recreate frame sync objects: {}", err);
        }
        slot.submitted_epoch = None;
    }

    // -----------------------------------------------------------------------
    // Swapchain
    // -----------------------------------------------------------------------

    /// Record a new window size; the swapchain is rebuilt at the next frame
    pub fn resize(&mut self, width: u32, height: u32) {
        log::debug!("Resize requested: {}x{}", width, height);
        self.window_extent = vk::Extent2D { width, height };
        self.resize_pending = true;
        self.swapchain.invalidate();
    }

    fn rebuild_swapchain(&mut self) -> Result<(), FrameError> {
        let extent = self.window_extent;
        match self.swapchain.recreate(extent.width, extent.height) {
            Ok(()) => {
                self.resize_pending = false;
                self.refresh_pipelines()
            }
            Err(FrameError::ZeroExtent) => {
                log::debug!("Surface has zero area, skipping frame");
                Err(FrameError::ZeroExtent)
            }
            Err(err) => {
                log::warn!("Swapchain recreation failed: {}", err);
                Err(err)
            }
        }
    }

    /// Rebuild pipelines if the swapchain format moved under them
    fn refresh_pipelines(&mut self) -> Result<(), FrameError> {
        if self.swapchain.format() == self.pipeline_format {
            return Ok(());
        }

        log::info!("Swapchain format changed, rebuilding pipelines");
        let pipelines = PipelineSet::new(
            &self.device,
            self.swapchain.render_pass(),
            &self.descriptor_layouts,
            &self.shaders,
            self.pipeline_cache,
            self.capabilities.mode,
        )
        .map_err(|err| FrameError::PipelineRebuild(format!("{:#}", err)))?;

        let old = std::mem::replace(&mut self.pipelines, pipelines);
        old.destroy(&self.device.device);
        self.pipeline_format = self.swapchain.format();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Drawing
    // -----------------------------------------------------------------------

    /// Set the clear color of the frame being recorded
    pub fn clear(&mut self, color: Vec4) -> Result<(), FrameError> {
        let frame = self.active.as_mut().ok_or_else(not_recording("clear"))?;
        frame.clear_color = color.to_array();
        Ok(())
    }

    /// Upload the camera for the frame being recorded
    pub fn update_camera(&mut self, view_projection: Mat4) -> Result<(), FrameError> {
        if self.active.is_none() {
            return Err(not_recording("update_camera")());
        }

        let uniform = CameraUniform { view_projection };
        let slot = &mut self.slots[self.frames.current()];
        slot.camera.set_slice(0, &[uniform]).map_err(|err| {
            log::error!("Camera update failed: {}", err);
            FrameError::from(err)
        })
    }

    /// Draw `index_count` indices from `index_buffer` (u32 indices).
    ///
    /// Both buffers must stay alive until this frame completes; use
    /// `release_buffer` rather than dropping them while frames are in flight.
    pub fn draw(
        &mut self,
        index_buffer: &IndexBuffer,
        vertex_buffer: &VertexBuffer,
        index_count: u32,
    ) -> Result<(), FrameError> {
        if self.active.is_none() {
            return Err(not_recording("draw")());
        }

        let limit = self.capabilities.max_indices;
        if index_count > limit {
            log::error!("Draw of {} indices exceeds limit {}", index_count, limit);
            return Err(FrameError::TooManyIndices {
                count: index_count,
                limit,
            });
        }

        let index_bytes = index_count as u64 * std::mem::size_of::<u32>() as u64;
        if index_bytes > index_buffer.capacity() {
            let err = ResourceError::OutOfBounds {
                size: index_bytes,
                offset: 0,
                capacity: index_buffer.capacity(),
            };
            log::error!("{}", err);
            return Err(err.into());
        }

        let device = &self.device.device;
        let cmd = self.slots[self.frames.current()].secondary(Pass::Geometry);
        unsafe {
            device.cmd_bind_vertex_buffers(cmd, 0, &[vertex_buffer.handle()], &[0]);
            device.cmd_bind_index_buffer(cmd, index_buffer.handle(), 0, vk::IndexType::UINT32);
            device.cmd_draw_indexed(cmd, index_count, 1, 0, 0, 0);
        }
        Ok(())
    }

    /// Use `cube_map` as the skybox from the next frame on.
    ///
    /// The previous skybox goes through the release queue. A cube map that is
    /// not shader-readable is rejected (and released the same way).
    pub fn update_skybox(&mut self, cube_map: GpuImage) -> Result<(), FrameError> {
        if cube_map.kind() != ImageKind::CubeMap
            || cube_map.layout() != vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        {
            let err = ResourceError::UnsupportedOperation("skybox must be an uploaded cube map");
            log::error!("{} (got {:?})", err, cube_map);
            self.release_image(cube_map);
            return Err(err.into());
        }

        if self.capabilities.mode == RendererMode::Overlay2D {
            log::debug!("Skybox set in overlay mode; it will not be drawn");
        }

        if let Some(old) = self.skybox.replace(cube_map) {
            self.release_image(old);
        }
        self.skybox_version += 1;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Resources
    // -----------------------------------------------------------------------

    pub fn create_vertex_buffer(&self, size: vk::DeviceSize) -> Result<VertexBuffer, ResourceError> {
        VertexBuffer::new(&self.device, size)
    }

    pub fn create_index_buffer(&self, size: vk::DeviceSize) -> Result<IndexBuffer, ResourceError> {
        IndexBuffer::new(&self.device, size)
    }

    pub fn create_uniform_buffer(&self, size: vk::DeviceSize) -> Result<UniformBuffer, ResourceError> {
        UniformBuffer::new(&self.device, size)
    }

    pub fn create_staging_buffer(&self, size: vk::DeviceSize) -> Result<StagingBuffer, ResourceError> {
        StagingBuffer::new(&self.device, size)
    }

    pub fn create_image_buffer(
        &self,
        width: u32,
        height: u32,
        format: vk::Format,
    ) -> Result<GpuImage, ResourceError> {
        GpuImage::new_2d(&self.device, width, height, format)
    }

    pub fn create_cube_map(&self, size: u32, format: vk::Format) -> Result<GpuImage, ResourceError> {
        GpuImage::new_cube(&self.device, size, format)
    }

    /// Drop `buffer` once every frame that could use it has finished
    pub fn release_buffer<K: BufferKind>(&mut self, buffer: GpuBuffer<K>) {
        self.releases.push(self.epoch, Box::new(buffer));
    }

    /// Drop `image` once every frame that could use it has finished
    pub fn release_image(&mut self, image: GpuImage) {
        self.releases.push(self.epoch, Box::new(image));
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Record one-shot work for `queue`; it is submitted at the next flush
    pub fn queue_submit<F>(&mut self, queue: QueueType, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    {
        let queued = QueuedCommandBuffer::record(&self.device, queue, record)?;
        self.submissions.enqueue(queued);
        Ok(())
    }

    /// Record, submit and wait for `queue` to go idle. Setup paths only.
    pub fn immediate_submit<F>(&self, queue: QueueType, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    {
        self.device.immediate_submit(queue, record)
    }

    /// Submit queued work now, one submit per queue type.
    ///
    /// Transfer and compute submits signal a semaphore the next frame submit
    /// waits on. The command buffers are freed once the fence of the frame
    /// they belong to has been waited, so extra flushes are always safe.
    pub fn flush_queued_submits(&mut self) -> Result<()> {
        let device = &self.device;
        let sync = &mut self.slots[self.frames.current()].sync;

        let submits = self.submissions.flush(self.epoch, |queue, batch| {
            submit::submit_batch(device, sync, queue, batch)
        })?;

        if submits > 0 {
            log::trace!("Flushed {} queued submits at epoch {}", submits, self.epoch);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pipeline cache
    // -----------------------------------------------------------------------

    /// Current pipeline cache contents, for the application to persist
    pub fn pipeline_cache_data(&self) -> Result<Vec<u8>> {
        let data = unsafe { self.device.device.get_pipeline_cache_data(self.pipeline_cache) };
        data.context("Failed to read pipeline cache data")
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        let device = Arc::clone(&self.device);
        let _ = device.wait_idle();

        self.active = None;
        self.submissions.drain(|queued| queued.free(&device.device));
        let released = self.releases.drain();
        log::debug!("Released {} pending resources at shutdown", released);
        self.skybox = None;

        for slot in self.slots.drain(..) {
            slot.destroy(&device.device);
        }

        self.pipelines.destroy(&device.device);
        self.descriptor_layouts.destroy(&device.device);
        unsafe {
            device.device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.device.destroy_pipeline_cache(self.pipeline_cache, None);
        }
    }
}

impl FrameRecorder for Renderer {
    fn begin_frame(&mut self) -> Result<(), FrameError> {
        Renderer::begin_frame(self)
    }

    fn end_frame(&mut self) -> Result<(), FrameError> {
        Renderer::end_frame(self)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn not_recording(operation: &'static str) -> impl Fn() -> FrameError {
    move || {
        log::error!("{} called outside begin_frame/end_frame", operation);
        FrameError::NotRecording
    }
}
