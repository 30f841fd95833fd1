//! Vulkan abstraction layer (Render Hardware Interface).
//!
//! This crate provides a safe abstraction over Vulkan using the `ash` crate.
//! It handles:
//! - Instance, physical device and logical device creation with mutex-guarded queues
//! - Surface and swapchain management
//! - Command recording, single-time transfer commands and the recording lock
//! - Buffers, per-frame mapped uniform buffers and textures
//! - Shader modules, SPIR-V reflection, descriptors and pipelines
//! - Frame synchronization primitives

mod error;

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod instance;
pub mod physical_device;
pub mod pipeline;
pub mod reflection;
pub mod rendering;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod texture;
pub mod uniform;
pub mod vertex;

pub use error::{RhiError, RhiResult};

// Re-export ash types that users might need
pub use ash::vk;
