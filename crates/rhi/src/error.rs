//! RHI-specific error types.

use thiserror::Error;

/// RHI-specific error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    VulkanError(#[from] ash::vk::Result),

    /// Failed to load Vulkan library
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// No suitable GPU found
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// Shader module or reflection error
    #[error("Shader error: {0}")]
    ShaderError(String),

    /// Surface creation error
    #[error("Surface error: {0}")]
    SurfaceError(String),

    /// Swapchain error
    #[error("Swapchain error: {0}")]
    SwapchainError(String),

    /// The window reports a zero-sized drawable area.
    #[error("Window extent is zero, swapchain creation deferred")]
    ZeroExtent,

    /// Invalid handle error
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// A write would run past the end of a buffer.
    #[error("Buffer write out of bounds: offset {offset} + size {size} > capacity {capacity}")]
    BufferOutOfBounds {
        offset: u64,
        size: u64,
        capacity: u64,
    },

    /// Host access to memory that is not mapped.
    #[error("Buffer memory is not mapped")]
    NotMapped,

    /// Descriptor layout, pool or set error
    #[error("Descriptor error: {0}")]
    DescriptorError(String),

    /// Pipeline creation error
    #[error("Pipeline error: {0}")]
    PipelineError(String),

    /// A fence or queue wait exceeded its timeout.
    #[error("Wait timed out")]
    Timeout,

    /// Synchronization contract violation (e.g. fence reset before wait)
    #[error("Synchronization error: {0}")]
    SyncError(String),
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;
