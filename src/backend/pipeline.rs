// Render pass, graphics pipelines and the pipeline cache
//
// One render pass (color + depth, single subpass) drawn with secondary
// command buffers. Two pipelines share it: the skybox (cube map, no depth
// writes) and the geometry pass. Viewport and scissor are dynamic so a
// resize only rebuilds framebuffers, not pipelines.

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use std::ffi::CStr;

use super::image::DEPTH_FORMAT;
use super::shader::create_shader_module;
use super::VulkanDevice;
use crate::config::RendererMode;

/// Number of vertices the skybox shader expands into a cube
pub const SKYBOX_VERTEX_COUNT: u32 = 36;

const SHADER_ENTRY: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

/// Interleaved vertex layout used by the geometry pipeline
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub color: [f32; 3],
}

impl Vertex {
    pub fn binding_descriptions() -> [vk::VertexInputBindingDescription; 1] {
        [vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }]
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        let attribute = |location, offset| vk::VertexInputAttributeDescription {
            location,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset,
        };
        [attribute(0, 0), attribute(1, 12), attribute(2, 24)]
    }
}

/// Camera data shared by both pipelines (set 0, binding 0)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CameraUniform {
    pub view_projection: glam::Mat4,
}

/// Render pass with a presentable color attachment and a depth attachment.
///
/// Both attachments are cleared; the pass contents come from secondaries.
pub fn create_render_pass(device: &ash::Device, color_format: vk::Format) -> VkResult<vk::RenderPass> {
    let color_attachment = vk::AttachmentDescription::builder()
        .format(color_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build();

    let depth_attachment = vk::AttachmentDescription::builder()
        .format(DEPTH_FORMAT)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    let color_refs = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };

    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs)
        .depth_stencil_attachment(&depth_ref)
        .build();

    let stages =
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(stages)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(stages)
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .build();

    let attachments = [color_attachment, depth_attachment];
    let subpasses = [subpass];
    let dependencies = [dependency];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe { device.create_render_pass(&render_pass_info, None) }
}

/// One framebuffer per swapchain view, all sharing the depth view
pub fn create_framebuffers(
    device: &ash::Device,
    image_views: &[vk::ImageView],
    depth_view: vk::ImageView,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> VkResult<Vec<vk::Framebuffer>> {
    let mut framebuffers = Vec::with_capacity(image_views.len());

    for &view in image_views {
        let attachments = [view, depth_view];
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        match unsafe { device.create_framebuffer(&framebuffer_info, None) } {
            Ok(framebuffer) => framebuffers.push(framebuffer),
            Err(err) => {
                for framebuffer in framebuffers {
                    unsafe { device.destroy_framebuffer(framebuffer, None) };
                }
                return Err(err);
            }
        }
    }

    Ok(framebuffers)
}

/// Descriptor set layouts: camera uniform (set 0) and skybox cube sampler (set 1)
pub struct DescriptorLayouts {
    pub camera: vk::DescriptorSetLayout,
    pub skybox: vk::DescriptorSetLayout,
}

impl DescriptorLayouts {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let camera_bindings = [vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .build()];
        let skybox_bindings = [vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build()];

        unsafe {
            let camera = device
                .device
                .create_descriptor_set_layout(
                    &vk::DescriptorSetLayoutCreateInfo::builder().bindings(&camera_bindings),
                    None,
                )
                .context("Failed to create camera descriptor set layout")?;
            let skybox = device
                .device
                .create_descriptor_set_layout(
                    &vk::DescriptorSetLayoutCreateInfo::builder().bindings(&skybox_bindings),
                    None,
                )
                .map_err(|err| {
                    device.device.destroy_descriptor_set_layout(camera, None);
                    err
                })
                .context("Failed to create skybox descriptor set layout")?;

            Ok(Self { camera, skybox })
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_descriptor_set_layout(self.camera, None);
            device.destroy_descriptor_set_layout(self.skybox, None);
        }
    }
}

/// SPIR-V for both pipelines
#[derive(Debug, Clone, Default)]
pub struct ShaderSources {
    pub geometry_vert: Vec<u8>,
    pub geometry_frag: Vec<u8>,
    pub skybox_vert: Vec<u8>,
    pub skybox_frag: Vec<u8>,
}

/// Fixed-function choices that differ between our pipelines
#[derive(Debug, Clone, Copy)]
struct PipelineDesc {
    vertex_input: bool,
    depth_test: bool,
    depth_write: bool,
    depth_compare: vk::CompareOp,
    cull_mode: vk::CullModeFlags,
}

impl PipelineDesc {
    fn geometry(mode: RendererMode) -> Self {
        let depth = mode == RendererMode::Scene3D;
        Self {
            vertex_input: true,
            depth_test: depth,
            depth_write: depth,
            depth_compare: vk::CompareOp::LESS,
            cull_mode: match mode {
                RendererMode::Scene3D => vk::CullModeFlags::BACK,
                RendererMode::Overlay2D => vk::CullModeFlags::NONE,
            },
        }
    }

    // The skybox shader writes depth 1.0, so it has to pass LESS_OR_EQUAL
    fn skybox() -> Self {
        Self {
            vertex_input: false,
            depth_test: true,
            depth_write: false,
            depth_compare: vk::CompareOp::LESS_OR_EQUAL,
            cull_mode: vk::CullModeFlags::NONE,
        }
    }
}

/// Both graphics pipelines and their layouts, built against one render pass
pub struct PipelineSet {
    pub geometry: vk::Pipeline,
    pub geometry_layout: vk::PipelineLayout,
    pub skybox: vk::Pipeline,
    pub skybox_layout: vk::PipelineLayout,
}

impl PipelineSet {
    pub fn new(
        device: &VulkanDevice,
        render_pass: vk::RenderPass,
        layouts: &DescriptorLayouts,
        shaders: &ShaderSources,
        cache: vk::PipelineCache,
        mode: RendererMode,
    ) -> Result<Self> {
        let geometry_layout = create_pipeline_layout(device, &[layouts.camera])
            .context("Failed to create geometry pipeline layout")?;
        let skybox_layout = create_pipeline_layout(device, &[layouts.camera, layouts.skybox])
            .context("Failed to create skybox pipeline layout")?;

        let pipelines = (|| -> Result<(vk::Pipeline, vk::Pipeline)> {
            let geometry = create_graphics_pipeline(
                device,
                render_pass,
                geometry_layout,
                cache,
                (shaders.geometry_vert.as_slice(), shaders.geometry_frag.as_slice()),
                PipelineDesc::geometry(mode),
            )
            .context("Failed to create geometry pipeline")?;

            let skybox = create_graphics_pipeline(
                device,
                render_pass,
                skybox_layout,
                cache,
                (shaders.skybox_vert.as_slice(), shaders.skybox_frag.as_slice()),
                PipelineDesc::skybox(),
            )
            .map_err(|err| {
                unsafe { device.device.destroy_pipeline(geometry, None) };
                err
            })
            .context("Failed to create skybox pipeline")?;

            Ok((geometry, skybox))
        })();

        match pipelines {
            Ok((geometry, skybox)) => {
                log::info!("Graphics pipelines created ({:?})", mode);
                Ok(Self {
                    geometry,
                    geometry_layout,
                    skybox,
                    skybox_layout,
                })
            }
            Err(err) => {
                unsafe {
                    device.device.destroy_pipeline_layout(geometry_layout, None);
                    device.device.destroy_pipeline_layout(skybox_layout, None);
                }
                Err(err)
            }
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.geometry, None);
            device.destroy_pipeline(self.skybox, None);
            device.destroy_pipeline_layout(self.geometry_layout, None);
            device.destroy_pipeline_layout(self.skybox_layout, None);
        }
    }
}

fn create_pipeline_layout(
    device: &VulkanDevice,
    set_layouts: &[vk::DescriptorSetLayout],
) -> VkResult<vk::PipelineLayout> {
    let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(set_layouts);
    unsafe { device.device.create_pipeline_layout(&layout_info, None) }
}

fn create_graphics_pipeline(
    device: &VulkanDevice,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
    cache: vk::PipelineCache,
    (vert_code, frag_code): (&[u8], &[u8]),
    desc: PipelineDesc,
) -> Result<vk::Pipeline> {
    let vert = create_shader_module(device, vert_code)?;
    let frag = match create_shader_module(device, frag_code) {
        Ok(frag) => frag,
        Err(err) => {
            unsafe { device.device.destroy_shader_module(vert, None) };
            return Err(err);
        }
    };

    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert)
            .name(SHADER_ENTRY)
            .build(),
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag)
            .name(SHADER_ENTRY)
            .build(),
    ];

    let bindings = Vertex::binding_descriptions();
    let attributes = Vertex::attribute_descriptions();
    let vertex_input = if desc.vertex_input {
        vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes)
    } else {
        vk::PipelineVertexInputStateCreateInfo::builder()
    };

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(desc.cull_mode)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(desc.depth_test)
        .depth_write_enable(desc.depth_write)
        .depth_compare_op(desc.depth_compare)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)
        .build()];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0)
        .build();

    let pipelines = unsafe {
        device
            .device
            .create_graphics_pipelines(cache, &[pipeline_info], None)
    };

    unsafe {
        device.device.destroy_shader_module(vert, None);
        device.device.destroy_shader_module(frag, None);
    }

    let pipelines = pipelines.map_err(|(_, err)| err)?;
    Ok(pipelines[0])
}

// ---------------------------------------------------------------------------
// Pipeline cache
// ---------------------------------------------------------------------------

const CACHE_HEADER_LEN: usize = 32;
const CACHE_HEADER_VERSION_ONE: u32 = 1;

/// Why a stored cache blob was not used
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheRejection {
    TooShort(usize),
    HeaderLength(u32),
    Version(u32),
    Vendor { found: u32, expected: u32 },
    Device { found: u32, expected: u32 },
    Uuid,
}

/// Check a cache blob header against the running device.
///
/// Layout: header length, header version, vendor id, device id (all u32 in
/// host byte order), then the 16-byte pipeline cache UUID.
pub fn validate_cache_header(
    blob: &[u8],
    properties: &vk::PhysicalDeviceProperties,
) -> Result<(), CacheRejection> {
    if blob.len() < CACHE_HEADER_LEN {
        return Err(CacheRejection::TooShort(blob.len()));
    }

    let word = |index: usize| {
        let start = index * 4;
        u32::from_ne_bytes([blob[start], blob[start + 1], blob[start + 2], blob[start + 3]])
    };

    let header_len = word(0);
    if header_len as usize != CACHE_HEADER_LEN {
        return Err(CacheRejection::HeaderLength(header_len));
    }
    let version = word(1);
    if version != CACHE_HEADER_VERSION_ONE {
        return Err(CacheRejection::Version(version));
    }
    let vendor = word(2);
    if vendor != properties.vendor_id {
        return Err(CacheRejection::Vendor {
            found: vendor,
            expected: properties.vendor_id,
        });
    }
    let device = word(3);
    if device != properties.device_id {
        return Err(CacheRejection::Device {
            found: device,
            expected: properties.device_id,
        });
    }
    if blob[16..32] != properties.pipeline_cache_uuid[..] {
        return Err(CacheRejection::Uuid);
    }

    Ok(())
}

/// Create a pipeline cache, seeded from `blob` when it belongs to this device
pub fn create_pipeline_cache(device: &VulkanDevice, blob: Option<&[u8]>) -> Result<vk::PipelineCache> {
    let initial = match blob {
        Some(blob) => match validate_cache_header(blob, &device.properties) {
            Ok(()) => {
                log::info!("Loaded pipeline cache ({} bytes)", blob.len());
                blob
            }
            Err(reason) => {
                log::warn!("Ignoring pipeline cache: {:?}", reason);
                &[][..]
            }
        },
        None => &[][..],
    };

    let cache_info = vk::PipelineCacheCreateInfo::builder().initial_data(initial);
    match unsafe { device.device.create_pipeline_cache(&cache_info, None) } {
        Ok(cache) => Ok(cache),
        Err(err) if !initial.is_empty() => {
            log::warn!("Pipeline cache rejected by driver ({}), starting cold", err);
            let cold = vk::PipelineCacheCreateInfo::builder();
            let cache = unsafe { device.device.create_pipeline_cache(&cold, None) };
            cache.context("Failed to create pipeline cache")
        }
        Err(err) => Err(err).context("Failed to create pipeline cache"),
    }
}
