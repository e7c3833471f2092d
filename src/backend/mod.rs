// Backend module - Vulkan abstraction layer
//
// Thin wrappers around ash: device and queues, memory-backed resources,
// presentation and the objects the frame pipeline records with.

pub mod buffer;
pub mod command;
pub mod device;
pub mod image;
pub mod layout;
pub mod memory;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use buffer::{GpuBuffer, IndexBuffer, StagingBuffer, UniformBuffer, VertexBuffer};
pub use device::{DeviceDesc, QueueType, VulkanDevice};
pub use image::{CopyDirection, GpuImage, ImageCopy, ImageKind};
pub use surface::SurfaceTarget;
pub use swapchain::Swapchain;
