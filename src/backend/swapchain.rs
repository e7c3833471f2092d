// Swapchain - Window presentation
//
// Owns the chain of presentable images together with everything sized to
// them: image views, the depth target, the render pass and framebuffers.
// Those are rebuilt as one unit whenever the surface changes, and the
// generation counter moves forward each time.

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use std::sync::Arc;

use super::image::GpuImage;
use super::pipeline::{create_framebuffers, create_render_pass};
use super::VulkanDevice;
use crate::error::FrameError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainState {
    Created,
    Presenting,
    /// Waiting for a usable surface size before rebuilding
    Invalidating,
    Destroyed,
}

/// Result of handing an image to the presentation engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    Suboptimal,
    OutOfDate,
}

/// Prefer 8-bit BGRA sRGB with a non-linear color space, else the first format
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
}

/// MAILBOX when vsync is off and it is available, FIFO otherwise
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if !vsync && modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        // FIFO is always supported
        vk::PresentModeKHR::FIFO
    }
}

/// Use the surface's extent unless it lets the window decide (width == u32::MAX)
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }

    vk::Extent2D {
        width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped by the maximum when there is one
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

/// Acquire through `acquire`; if the swapchain is out of date, rebuild it with
/// `recreate` and try exactly once more.
pub fn acquire_with_retry<T, A, R>(target: &mut T, mut acquire: A, mut recreate: R) -> Result<u32, FrameError>
where
    A: FnMut(&mut T) -> Result<u32, FrameError>,
    R: FnMut(&mut T) -> Result<(), FrameError>,
{
    match acquire(target) {
        Err(FrameError::OutOfDate) => {
            log::debug!("Swapchain out of date on acquire, recreating");
            recreate(target)?;
            acquire(target)
        }
        other => other,
    }
}

/// Images and views tied to one VkSwapchainKHR
struct Targets {
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    depth: GpuImage,
    framebuffers: Vec<vk::Framebuffer>,
}

impl Targets {
    fn destroy(self, device: &ash::Device, loader: &ash::extensions::khr::Swapchain) {
        unsafe {
            for framebuffer in self.framebuffers {
                device.destroy_framebuffer(framebuffer, None);
            }
            for view in self.views {
                device.destroy_image_view(view, None);
            }
            loader.destroy_swapchain(self.handle, None);
        }
    }
}

pub struct Swapchain {
    loader: ash::extensions::khr::Swapchain,
    targets: Option<Targets>,
    render_pass: vk::RenderPass,
    surface_format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    vsync: bool,
    generation: u64,
    state: SwapchainState,
    needs_recreate: bool,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    pub fn new(device: &Arc<VulkanDevice>, width: u32, height: u32, vsync: bool) -> Result<Self> {
        log::info!("Creating swapchain: {}x{}", width, height);

        let surface = device
            .surface
            .as_ref()
            .context("Swapchain needs a device created with a surface")?;
        let formats = unsafe {
            surface
                .loader
                .get_physical_device_surface_formats(device.physical_device, surface.surface)
        }
        .context("Failed to query surface formats")?;
        let surface_format = choose_surface_format(&formats).context("No suitable surface format")?;

        let render_pass = create_render_pass(&device.device, surface_format.format)
            .context("Failed to create render pass")?;

        let mut swapchain = Self {
            loader: ash::extensions::khr::Swapchain::new(&device.instance, &device.device),
            targets: None,
            render_pass,
            surface_format,
            extent: vk::Extent2D::default(),
            vsync,
            generation: 0,
            state: SwapchainState::Invalidating,
            needs_recreate: false,
            device: Arc::clone(device),
        };

        match swapchain.recreate(width, height) {
            Ok(()) | Err(FrameError::ZeroExtent) => Ok(swapchain),
            Err(err) => Err(err).context("Failed to create swapchain"),
        }
    }

    /// Rebuild for a new window size.
    ///
    /// The previous swapchain is passed as `old_swapchain` and destroyed only
    /// after its replacement exists. A zero-area surface leaves the swapchain
    /// in `Invalidating` and returns `ZeroExtent`.
    pub fn recreate(&mut self, width: u32, height: u32) -> Result<(), FrameError> {
        let surface = self
            .device
            .surface
            .as_ref()
            .ok_or(FrameError::Resource(crate::error::ResourceError::Uninitialized(
                "presentation surface",
            )))?;

        let (caps, formats, modes) = unsafe {
            let caps = surface
                .loader
                .get_physical_device_surface_capabilities(self.device.physical_device, surface.surface)?;
            let formats = surface
                .loader
                .get_physical_device_surface_formats(self.device.physical_device, surface.surface)?;
            let modes = surface
                .loader
                .get_physical_device_surface_present_modes(self.device.physical_device, surface.surface)?;
            (caps, formats, modes)
        };

        let extent = choose_extent(&caps, width, height);
        if extent.width == 0 || extent.height == 0 {
            self.state = SwapchainState::Invalidating;
            self.needs_recreate = true;
            return Err(FrameError::ZeroExtent);
        }

        unsafe { self.device.device.device_wait_idle()? };

        let surface_format = choose_surface_format(&formats).ok_or(vk::Result::ERROR_FORMAT_NOT_SUPPORTED)?;
        if surface_format.format != self.surface_format.format {
            log::info!(
                "Surface format changed {:?} -> {:?}",
                self.surface_format.format,
                surface_format.format
            );
            let render_pass = create_render_pass(&self.device.device, surface_format.format)?;
            if let Some(old) = self.targets.take() {
                old.destroy(&self.device.device, &self.loader);
            }
            unsafe { self.device.device.destroy_render_pass(self.render_pass, None) };
            self.render_pass = render_pass;
        }
        self.surface_format = surface_format;

        let present_mode = choose_present_mode(&modes, self.vsync);
        let old_handle = self
            .targets
            .as_ref()
            .map_or(vk::SwapchainKHR::null(), |targets| targets.handle);

        let targets = self.build_targets(surface.surface, &caps, extent, present_mode, old_handle)?;
        if let Some(old) = self.targets.replace(targets) {
            old.destroy(&self.device.device, &self.loader);
        }

        self.extent = extent;
        self.generation += 1;
        self.state = SwapchainState::Created;
        self.needs_recreate = false;

        log::info!(
            "Swapchain generation {}: {}x{}, {} images, {:?}",
            self.generation,
            extent.width,
            extent.height,
            self.image_count(),
            present_mode
        );
        Ok(())
    }

    fn build_targets(
        &self,
        surface: vk::SurfaceKHR,
        caps: &vk::SurfaceCapabilitiesKHR,
        extent: vk::Extent2D,
        present_mode: vk::PresentModeKHR,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Targets, FrameError> {
        let device = &self.device.device;

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(choose_image_count(caps))
            .image_format(self.surface_format.format)
            .image_color_space(self.surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let handle = unsafe { self.loader.create_swapchain(&create_info, None)? };

        let mut views = Vec::new();
        let built = (|| -> Result<(Vec<vk::Image>, GpuImage, Vec<vk::Framebuffer>), FrameError> {
            let images = unsafe { self.loader.get_swapchain_images(handle)? };
            for &image in &images {
                views.push(create_color_view(device, image, self.surface_format.format)?);
            }
            let depth = GpuImage::new_depth(&self.device, extent)?;
            let framebuffers = create_framebuffers(device, &views, depth.view(), self.render_pass, extent)?;
            Ok((images, depth, framebuffers))
        })();

        match built {
            Ok((images, depth, framebuffers)) => Ok(Targets {
                handle,
                images,
                views,
                depth,
                framebuffers,
            }),
            Err(err) => {
                unsafe {
                    for view in views {
                        device.destroy_image_view(view, None);
                    }
                    self.loader.destroy_swapchain(handle, None);
                }
                Err(err)
            }
        }
    }

    /// Acquire the next image, blocking without timeout.
    ///
    /// Suboptimal images are still returned; the swapchain is flagged for
    /// recreation before the next frame.
    pub fn acquire(&mut self, signal: vk::Semaphore) -> Result<u32, FrameError> {
        let targets = self.targets.as_ref().ok_or(FrameError::OutOfDate)?;

        let result = unsafe {
            self.loader
                .acquire_next_image(targets.handle, u64::MAX, signal, vk::Fence::null())
        };

        match result {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::debug!("Acquired suboptimal swapchain image");
                    self.needs_recreate = true;
                }
                self.state = SwapchainState::Presenting;
                Ok(index)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(FrameError::OutOfDate),
            Err(err) => Err(err.into()),
        }
    }

    /// Present `image_index` once `wait` is signaled
    pub fn present(
        &mut self,
        queue: vk::Queue,
        image_index: u32,
        wait: &[vk::Semaphore],
    ) -> Result<PresentStatus, FrameError> {
        let targets = self.targets.as_ref().ok_or(FrameError::OutOfDate)?;
        let swapchains = [targets.handle];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(PresentStatus::Presented),
            Ok(true) => {
                self.needs_recreate = true;
                Ok(PresentStatus::Suboptimal)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.needs_recreate = true;
                Ok(PresentStatus::OutOfDate)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Flag for rebuild at the start of the next frame
    pub fn invalidate(&mut self) {
        self.needs_recreate = true;
    }

    pub fn needs_recreate(&self) -> bool {
        self.needs_recreate || self.targets.is_none()
    }

    pub fn state(&self) -> SwapchainState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.surface_format.format
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn image_count(&self) -> usize {
        self.targets.as_ref().map_or(0, |targets| targets.images.len())
    }

    pub fn framebuffer(&self, image_index: u32) -> Option<vk::Framebuffer> {
        self.targets
            .as_ref()
            .and_then(|targets| targets.framebuffers.get(image_index as usize).copied())
    }

    pub fn depth_target(&self) -> Option<&GpuImage> {
        self.targets.as_ref().map(|targets| &targets.depth)
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        let _ = unsafe { self.device.device.device_wait_idle() };
        if let Some(targets) = self.targets.take() {
            targets.destroy(&self.device.device, &self.loader);
        }
        unsafe { self.device.device.destroy_render_pass(self.render_pass, None) };
        self.state = SwapchainState::Destroyed;
    }
}

fn create_color_view(device: &ash::Device, image: vk::Image, format: vk::Format) -> VkResult<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    unsafe { device.create_image_view(&create_info, None) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: (u32, u32), min: (u32, u32), max: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: min.0,
                height: min.1,
            },
            max_image_extent: vk::Extent2D {
                width: max.0,
                height: max.1,
            },
            ..Default::default()
        }
    }

    #[test]
    fn undefined_surface_extent_follows_the_window() {
        let caps = caps((0xFFFF_FFFF, 0xFFFF_FFFF), (1, 1), (4096, 4096));
        let extent = choose_extent(&caps, 800, 600);
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn window_size_is_clamped_to_surface_limits() {
        let caps = caps((u32::MAX, u32::MAX), (64, 64), (1024, 768));
        let extent = choose_extent(&caps, 4000, 10);
        assert_eq!((extent.width, extent.height), (1024, 64));
    }

    #[test]
    fn fixed_surface_extent_wins() {
        let caps = caps((1280, 720), (1, 1), (4096, 4096));
        let extent = choose_extent(&caps, 800, 600);
        assert_eq!((extent.width, extent.height), (1280, 720));
    }

    #[test]
    fn image_count_respects_maximum() {
        let mut c = caps((1, 1), (1, 1), (1, 1));
        assert_eq!(choose_image_count(&c), 3);
        c.min_image_count = 3;
        assert_eq!(choose_image_count(&c), 3);
        c.max_image_count = 0;
        assert_eq!(choose_image_count(&c), 4);
    }

    #[test]
    fn prefers_srgb_bgra() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };

        assert_eq!(choose_surface_format(&[unorm, srgb]), Some(srgb));
        assert_eq!(choose_surface_format(&[unorm]), Some(unorm));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn mailbox_only_without_vsync() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(choose_present_mode(&modes, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(choose_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[derive(Default)]
    struct FakeChain {
        out_of_date: u32,
        acquires: u32,
        recreations: u32,
    }

    fn fake_acquire(chain: &mut FakeChain) -> Result<u32, FrameError> {
        chain.acquires += 1;
        if chain.out_of_date > 0 {
            chain.out_of_date -= 1;
            Err(FrameError::OutOfDate)
        } else {
            Ok(2)
        }
    }

    fn fake_recreate(chain: &mut FakeChain) -> Result<(), FrameError> {
        chain.recreations += 1;
        Ok(())
    }

    #[test]
    fn out_of_date_acquire_is_retried_once_after_recreation() {
        let mut chain = FakeChain {
            out_of_date: 1,
            ..Default::default()
        };

        let index = acquire_with_retry(&mut chain, fake_acquire, fake_recreate);
        assert_eq!(index, Ok(2));
        assert_eq!(chain.acquires, 2);
        assert_eq!(chain.recreations, 1);
    }

    #[test]
    fn second_out_of_date_is_reported() {
        let mut chain = FakeChain {
            out_of_date: 2,
            ..Default::default()
        };

        let index = acquire_with_retry(&mut chain, fake_acquire, fake_recreate);
        assert_eq!(index, Err(FrameError::OutOfDate));
        assert_eq!(chain.acquires, 2);
        assert_eq!(chain.recreations, 1);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let mut chain = FakeChain::default();
        let index = acquire_with_retry(
            &mut chain,
            |_| Err(FrameError::Vulkan(vk::Result::ERROR_DEVICE_LOST)),
            fake_recreate,
        );
        assert_eq!(index, Err(FrameError::Vulkan(vk::Result::ERROR_DEVICE_LOST)));
        assert_eq!(chain.recreations, 0);
    }
}
