// GPU images: 2D textures, cube maps and depth targets
//
// Every image tracks its own layout. Uploads and read-backs move it through
// the layout graph in `layout.rs`; a copy is only recorded once both of its
// barriers have been validated.

use ash::vk;
use std::sync::Arc;

use super::layout::{self, LayoutTracker, Transition};
use super::memory::{DeviceAllocation, MemoryRequest};
use super::VulkanDevice;
use crate::error::ResourceError;

/// Depth format used for every depth target
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Texture2D,
    CubeMap,
    DepthTarget,
}

impl ImageKind {
    pub fn layer_count(self) -> u32 {
        match self {
            ImageKind::CubeMap => 6,
            _ => 1,
        }
    }

    fn aspect(self) -> vk::ImageAspectFlags {
        match self {
            ImageKind::DepthTarget => vk::ImageAspectFlags::DEPTH,
            _ => vk::ImageAspectFlags::COLOR,
        }
    }
}

/// Bytes per texel for the formats we know how to upload
pub fn texel_size(format: vk::Format) -> Option<u32> {
    use ash::vk::Format as F;

    match format {
        F::R8_UNORM | F::R8_SRGB => Some(1),
        F::R8G8_UNORM => Some(2),
        F::R8G8B8A8_UNORM
        | F::R8G8B8A8_SRGB
        | F::B8G8R8A8_UNORM
        | F::B8G8R8A8_SRGB
        | F::R32_SFLOAT
        | F::D32_SFLOAT => Some(4),
        F::R16G16B16A16_SFLOAT => Some(8),
        F::R32G32B32A32_SFLOAT => Some(16),
        _ => None,
    }
}

/// Copy regions for a tightly packed image, one per layer
pub fn copy_regions(
    extent: vk::Extent2D,
    texel_size: u32,
    kind: ImageKind,
) -> Vec<vk::BufferImageCopy> {
    let layer_size = extent.width as u64 * extent.height as u64 * texel_size as u64;

    (0..kind.layer_count())
        .map(|layer| vk::BufferImageCopy {
            buffer_offset: layer as u64 * layer_size,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: kind.aspect(),
                mip_level: 0,
                base_array_layer: layer,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
        })
        .collect()
}

/// Which way an image copy moves data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    /// staging buffer -> image
    Upload,
    /// image -> staging buffer
    Readback,
}

/// A validated buffer <-> image copy, ready to record.
///
/// Planning never touches the image's tracked layout; `GpuImage::commit_copy`
/// adopts the final layout once the recorded copy has been submitted.
#[derive(Debug, Clone)]
pub struct ImageCopy {
    image: vk::Image,
    direction: CopyDirection,
    range: vk::ImageSubresourceRange,
    regions: Vec<vk::BufferImageCopy>,
    to_transfer: Transition,
    to_shader: Transition,
}

impl ImageCopy {
    fn plan(
        image: vk::Image,
        layout: LayoutTracker,
        kind: ImageKind,
        extent: vk::Extent2D,
        format: vk::Format,
        direction: CopyDirection,
    ) -> Result<Self, ResourceError> {
        if kind == ImageKind::DepthTarget {
            return Err(ResourceError::UnsupportedOperation(match direction {
                CopyDirection::Upload => "upload into a depth target",
                CopyDirection::Readback => "read back a depth target",
            }));
        }

        let mut tracker = layout;
        let to_transfer = tracker.advance(direction.transfer_layout())?;
        let to_shader = tracker.advance(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)?;

        Ok(Self {
            image,
            direction,
            range: subresource_range(kind),
            regions: copy_regions(extent, texel_size(format).unwrap_or(0), kind),
            to_transfer,
            to_shader,
        })
    }

    pub fn direction(&self) -> CopyDirection {
        self.direction
    }

    /// Layout the image must be in when the copy executes
    pub fn initial_layout(&self) -> vk::ImageLayout {
        self.to_transfer.old_layout
    }

    /// Layout the image is left in
    pub fn final_layout(&self) -> vk::ImageLayout {
        self.to_shader.new_layout
    }

    /// Record barrier, copy, barrier. `buffer` is the source of an upload or
    /// the destination of a readback.
    pub fn record(&self, device: &ash::Device, cmd: vk::CommandBuffer, buffer: vk::Buffer) {
        let transfer_layout = self.direction.transfer_layout();
        layout::record_barrier(device, cmd, self.image, self.range, &self.to_transfer);
        unsafe {
            match self.direction {
                CopyDirection::Upload => device.cmd_copy_buffer_to_image(
                    cmd,
                    buffer,
                    self.image,
                    transfer_layout,
                    &self.regions,
                ),
                CopyDirection::Readback => device.cmd_copy_image_to_buffer(
                    cmd,
                    self.image,
                    transfer_layout,
                    buffer,
                    &self.regions,
                ),
            }
        }
        layout::record_barrier(device, cmd, self.image, self.range, &self.to_shader);
    }
}

impl CopyDirection {
    fn transfer_layout(self) -> vk::ImageLayout {
        match self {
            CopyDirection::Upload => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            CopyDirection::Readback => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        }
    }
}

/// An image with its memory, view and (for sampled kinds) sampler
pub struct GpuImage {
    image: vk::Image,
    view: vk::ImageView,
    sampler: Option<vk::Sampler>,
    allocation: DeviceAllocation,
    extent: vk::Extent2D,
    format: vk::Format,
    kind: ImageKind,
    layout: LayoutTracker,
    device: Arc<VulkanDevice>,
}

impl std::fmt::Debug for GpuImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuImage")
            .field("kind", &self.kind)
            .field("extent", &self.extent)
            .field("format", &self.format)
            .field("layout", &self.layout.current())
            .finish()
    }
}

impl GpuImage {
    /// Sampled 2D texture
    pub fn new_2d(
        device: &Arc<VulkanDevice>,
        width: u32,
        height: u32,
        format: vk::Format,
    ) -> Result<Self, ResourceError> {
        Self::new(device, vk::Extent2D { width, height }, format, ImageKind::Texture2D)
    }

    /// Sampled cube map with six square faces
    pub fn new_cube(
        device: &Arc<VulkanDevice>,
        size: u32,
        format: vk::Format,
    ) -> Result<Self, ResourceError> {
        Self::new(
            device,
            vk::Extent2D {
                width: size,
                height: size,
            },
            format,
            ImageKind::CubeMap,
        )
    }

    /// Depth attachment for the swapchain render pass
    pub fn new_depth(device: &Arc<VulkanDevice>, extent: vk::Extent2D) -> Result<Self, ResourceError> {
        let mut depth = Self::new(device, extent, DEPTH_FORMAT, ImageKind::DepthTarget)?;
        // The render pass moves it out of UNDEFINED on first use
        depth
            .layout
            .advance(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)?;
        Ok(depth)
    }

    pub fn new(
        device: &Arc<VulkanDevice>,
        extent: vk::Extent2D,
        format: vk::Format,
        kind: ImageKind,
    ) -> Result<Self, ResourceError> {
        if extent.width == 0 || extent.height == 0 {
            return Err(ResourceError::Uninitialized("zero-sized image"));
        }
        if kind != ImageKind::DepthTarget && texel_size(format).is_none() {
            return Err(ResourceError::UnsupportedFormat(format));
        }

        let (usage, flags) = match kind {
            ImageKind::Texture2D => (
                vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::TRANSFER_SRC,
                vk::ImageCreateFlags::empty(),
            ),
            ImageKind::CubeMap => (
                vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::TRANSFER_SRC,
                vk::ImageCreateFlags::CUBE_COMPATIBLE,
            ),
            ImageKind::DepthTarget => (
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                vk::ImageCreateFlags::empty(),
            ),
        };

        let image_info = vk::ImageCreateInfo::builder()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(kind.layer_count())
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None)? };
        let requirements = unsafe { device.device.get_image_memory_requirements(image) };

        let allocation =
            match DeviceAllocation::allocate(device, requirements, MemoryRequest::device_local()) {
                Ok(allocation) => allocation,
                Err(err) => {
                    unsafe { device.device.destroy_image(image, None) };
                    return Err(err);
                }
            };

        // Partially built pieces are torn down on every error path below
        let cleanup = |view: Option<vk::ImageView>| unsafe {
            if let Some(view) = view {
                device.device.destroy_image_view(view, None);
            }
            device.device.destroy_image(image, None);
            allocation.free(&device.device);
        };

        if let Err(err) = unsafe { device.device.bind_image_memory(image, allocation.memory, 0) } {
            cleanup(None);
            return Err(err.into());
        }

        let range = subresource_range(kind);
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(match kind {
                ImageKind::CubeMap => vk::ImageViewType::CUBE,
                _ => vk::ImageViewType::TYPE_2D,
            })
            .format(format)
            .subresource_range(range);

        let view = match unsafe { device.device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(err) => {
                cleanup(None);
                return Err(err.into());
            }
        };

        let sampler = match kind {
            ImageKind::DepthTarget => None,
            _ => match create_sampler(device, kind) {
                Ok(sampler) => Some(sampler),
                Err(err) => {
                    cleanup(Some(view));
                    return Err(err);
                }
            },
        };

        log::debug!(
            "Created {:?} image {}x{} {:?}",
            kind,
            extent.width,
            extent.height,
            format
        );

        Ok(Self {
            image,
            view,
            sampler,
            allocation,
            extent,
            format,
            kind,
            layout: LayoutTracker::new(),
            device: Arc::clone(device),
        })
    }

    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn sampler(&self) -> Option<vk::Sampler> {
        self.sampler
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn kind(&self) -> ImageKind {
        self.kind
    }

    pub fn layout(&self) -> vk::ImageLayout {
        self.layout.current()
    }

    /// Size of the tightly packed pixel data for all layers
    pub fn byte_size(&self) -> u64 {
        let texel = texel_size(self.format).unwrap_or(0) as u64;
        self.extent.width as u64 * self.extent.height as u64 * texel * self.kind.layer_count() as u64
    }

    /// Transition to `new` with a barrier recorded into `cmd`.
    ///
    /// Unlisted transitions record nothing and keep the current layout.
    pub fn transition(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        new: vk::ImageLayout,
    ) -> Result<(), ResourceError> {
        let transition = self.layout.advance(new).map_err(|err| {
            log::error!("{}", err);
            err
        })?;
        layout::record_barrier(device, cmd, self.image, subresource_range(self.kind), &transition);
        Ok(())
    }

    /// Plan a full upload (all layers) ending shader-readable
    pub fn plan_upload(&self) -> Result<ImageCopy, ResourceError> {
        self.plan_copy(CopyDirection::Upload)
    }

    /// Plan a copy of every layer into a buffer, returning to shader-read layout
    pub fn plan_readback(&self) -> Result<ImageCopy, ResourceError> {
        self.plan_copy(CopyDirection::Readback)
    }

    fn plan_copy(&self, direction: CopyDirection) -> Result<ImageCopy, ResourceError> {
        ImageCopy::plan(self.image, self.layout, self.kind, self.extent, self.format, direction)
    }

    /// Adopt the final layout of a submitted copy.
    ///
    /// Rejects a plan made for another image or against an outdated layout.
    pub fn commit_copy(&mut self, copy: &ImageCopy) -> Result<(), ResourceError> {
        if copy.image != self.image {
            return Err(ResourceError::UnsupportedOperation("commit a copy planned for another image"));
        }
        self.layout.commit(copy.initial_layout(), copy.final_layout())
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        unsafe {
            if let Some(sampler) = self.sampler.take() {
                self.device.device.destroy_sampler(sampler, None);
            }
            self.device.device.destroy_image_view(self.view, None);
            self.device.device.destroy_image(self.image, None);
        }
        self.allocation.free(&self.device.device);
    }
}

fn subresource_range(kind: ImageKind) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: kind.aspect(),
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: kind.layer_count(),
    }
}

fn create_sampler(device: &VulkanDevice, kind: ImageKind) -> Result<vk::Sampler, ResourceError> {
    let address_mode = match kind {
        ImageKind::CubeMap => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        _ => vk::SamplerAddressMode::REPEAT,
    };
    let anisotropy = device.enabled_features.sampler_anisotropy == vk::TRUE;

    let sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(address_mode)
        .address_mode_v(address_mode)
        .address_mode_w(address_mode)
        .anisotropy_enable(anisotropy)
        .max_anisotropy(if anisotropy {
            device.properties.limits.max_sampler_anisotropy.min(16.0)
        } else {
            1.0
        })
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .compare_op(vk::CompareOp::ALWAYS)
        .max_lod(0.0);

    Ok(unsafe { device.device.create_sampler(&sampler_info, None)? })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_maps_get_one_region_per_face() {
        let extent = vk::Extent2D {
            width: 8,
            height: 8,
        };
        let regions = copy_regions(extent, 4, ImageKind::CubeMap);

        assert_eq!(regions.len(), 6);
        for (face, region) in regions.iter().enumerate() {
            assert_eq!(region.buffer_offset, face as u64 * 8 * 8 * 4);
            assert_eq!(region.image_subresource.base_array_layer, face as u32);
            assert_eq!(region.image_subresource.layer_count, 1);
        }
    }

    #[test]
    fn flat_textures_get_a_single_region() {
        let extent = vk::Extent2D {
            width: 4,
            height: 2,
        };
        let regions = copy_regions(extent, 4, ImageKind::Texture2D);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].image_extent.width, 4);
        assert_eq!(regions[0].image_extent.height, 2);
    }

    fn plan(layout: vk::ImageLayout, kind: ImageKind, direction: CopyDirection) -> Result<ImageCopy, ResourceError> {
        let mut tracker = LayoutTracker::new();
        tracker.assume(layout);
        let extent = vk::Extent2D {
            width: 4,
            height: 4,
        };
        ImageCopy::plan(vk::Image::null(), tracker, kind, extent, vk::Format::R8G8B8A8_SRGB, direction)
    }

    #[test]
    fn first_upload_starts_undefined_and_ends_shader_readable() {
        let copy = plan(vk::ImageLayout::UNDEFINED, ImageKind::CubeMap, CopyDirection::Upload).unwrap();
        assert_eq!(copy.initial_layout(), vk::ImageLayout::UNDEFINED);
        assert_eq!(copy.to_transfer.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(copy.final_layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(copy.regions.len(), 6);
    }

    #[test]
    fn readback_goes_through_transfer_source() {
        let copy = plan(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ImageKind::Texture2D,
            CopyDirection::Readback,
        )
        .unwrap();
        assert_eq!(copy.to_transfer.new_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(copy.final_layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn readback_of_undefined_contents_is_rejected() {
        let err = plan(vk::ImageLayout::UNDEFINED, ImageKind::Texture2D, CopyDirection::Readback).unwrap_err();
        assert_eq!(
            err,
            ResourceError::UnsupportedTransition {
                from: vk::ImageLayout::UNDEFINED,
                to: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            }
        );
    }

    #[test]
    fn depth_targets_cannot_be_copied() {
        for direction in [CopyDirection::Upload, CopyDirection::Readback] {
            let result = plan(vk::ImageLayout::UNDEFINED, ImageKind::DepthTarget, direction);
            assert!(matches!(result, Err(ResourceError::UnsupportedOperation(_))));
        }
    }

    #[test]
    fn texel_sizes() {
        assert_eq!(texel_size(vk::Format::R8G8B8A8_SRGB), Some(4));
        assert_eq!(texel_size(vk::Format::R16G16B16A16_SFLOAT), Some(8));
        assert_eq!(texel_size(vk::Format::BC7_UNORM_BLOCK), None);
    }
}
