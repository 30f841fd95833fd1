//! Error types for resource loading and upload.

use std::path::PathBuf;

use ember_renderer::RenderError;
use ember_rhi::RhiError;
use thiserror::Error;

use crate::resource::ResourceKind;

/// Error type for resource loading operations.
#[derive(Error, Debug)]
pub enum ResourceError {
    /// A resource file could not be parsed.
    #[error("Failed to load '{path}': {message}")]
    Load {
        /// Path to the file that failed to load.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// A resource description (TOML) is malformed or incomplete.
    #[error("Invalid description in '{path}': {message}")]
    Description {
        /// Path of the description file.
        path: PathBuf,
        /// What is wrong with it.
        message: String,
    },

    /// The path is registered with a different resource type.
    #[error("'{path}' is registered as a {registered} resource, not a {requested}")]
    KindMismatch {
        path: PathBuf,
        registered: ResourceKind,
        requested: ResourceKind,
    },

    /// A handle outlived the registry entry it pointed to.
    #[error("Resource '{0}' has been unloaded")]
    Expired(PathBuf),

    /// GLSL source was found but no compiler is installed.
    #[error("No shader compiler available to build '{0}'")]
    NoCompiler(PathBuf),

    /// Renderer-level failure during upload.
    #[error(transparent)]
    Render(#[from] RenderError),

    /// Vulkan-level failure during upload.
    #[error(transparent)]
    Rhi(#[from] RhiError),

    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decoding error.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Result type alias for resource operations.
pub type ResourceResult<T> = Result<T, ResourceError>;
