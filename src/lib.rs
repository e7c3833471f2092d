// =============================================================================
// FRAME CORE - Vulkan rendering core
// =============================================================================
//
// ┌─────────────────────────────────────────────────────────────────┐
// │  Application (window, input, assets on disk)                    │
// │    └── Renderer (frame pipeline & submission)                   │
// │          └── Swapchain + Resources (buffers, images)            │
// │                └── VulkanDevice (queues, command pools)         │
// └─────────────────────────────────────────────────────────────────┘
//
// Control flows down, completion (fences, semaphores) flows back up.
// =============================================================================

pub mod backend;
pub mod config;
pub mod error;
pub mod renderer;

pub use backend::{
    GpuBuffer, GpuImage, ImageKind, IndexBuffer, QueueType, StagingBuffer, SurfaceTarget,
    UniformBuffer, VertexBuffer, VulkanDevice,
};
pub use config::{Capabilities, Config, RendererMode};
pub use error::{FrameError, ResourceError};
pub use renderer::{Renderer, RendererAssets};
