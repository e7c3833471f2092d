// Typed errors for recoverable and usage failures
//
// Setup paths return anyhow errors with context (those are fatal).
// Everything the frame pipeline is expected to survive gets a variant here
// so callers can match on it instead of parsing strings.

use ash::vk;
use thiserror::Error;

/// Usage and allocation errors reported by the resource layer.
///
/// The offending call is always a no-op when one of these is returned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("write of {size} bytes at offset {offset} exceeds capacity of {capacity} bytes")]
    OutOfBounds {
        size: u64,
        offset: u64,
        capacity: u64,
    },

    #[error("buffer memory is not host visible; upload through a staging buffer instead")]
    NotHostVisible,

    #[error("unsupported image layout transition {from:?} -> {to:?}")]
    UnsupportedTransition {
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    },

    #[error("image layout changed since the copy was planned: expected {expected:?}, found {found:?}")]
    StaleLayout {
        expected: vk::ImageLayout,
        found: vk::ImageLayout,
    },

    #[error("no memory type satisfies required properties {required:?}")]
    NoMemoryType { required: vk::MemoryPropertyFlags },

    #[error("resource is not initialized: {0}")]
    Uninitialized(&'static str),

    #[error("unsupported image format {0:?}")]
    UnsupportedFormat(vk::Format),

    #[error("operation not supported on this resource: {0}")]
    UnsupportedOperation(&'static str),

    #[error("staging data of {given} bytes does not match image size of {expected} bytes")]
    ImageSizeMismatch { given: u64, expected: u64 },

    #[error("vulkan call failed: {0}")]
    Vulkan(#[from] vk::Result),
}

/// Errors surfaced by the swapchain and the per-frame pipeline.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("swapchain is out of date")]
    OutOfDate,

    #[error("surface has zero area (window minimized)")]
    ZeroExtent,

    #[error("no frame is being recorded")]
    NotRecording,

    #[error("a frame is already being recorded")]
    AlreadyRecording,

    #[error("index count {count} exceeds limit of {limit}")]
    TooManyIndices { count: u32, limit: u32 },

    #[error("failed to rebuild pipelines: {0}")]
    PipelineRebuild(String),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("vulkan call failed: {0}")]
    Vulkan(#[from] vk::Result),
}
