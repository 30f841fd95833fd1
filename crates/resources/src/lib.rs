//! Asynchronous resource loading and GPU upload scheduling.
//!
//! This crate tracks loadable assets and drives them from disk to the GPU:
//! - A path-deduplicated registry with weak [`ResourceHandle`]s
//! - A worker pool for CPU-side loading
//! - A per-frame upload queue that retries resources whose dependencies are
//!   not ready yet
//! - UUID and compiled-shader caches
//! - Mesh, texture, shader, material and model resources
//!
//! # Example
//!
//! ```no_run
//! use ember_core::ResourceConfig;
//! use ember_renderer::Backend;
//! use ember_resources::{ModelResource, ResourceManager};
//!
//! # fn main() -> ember_resources::ResourceResult<()> {
//! let manager = ResourceManager::new(&ResourceConfig::default(), Backend::Headless)?;
//! let ship = manager.load::<ModelResource>("models/ship.model.toml")?;
//!
//! while !ship.is_ready() {
//!     manager.update_resource_to_send();
//! }
//! manager.save_cache()?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
mod error;
pub mod manager;
pub mod material;
pub mod mesh;
pub mod model;
pub mod resource;
pub mod shader;
pub mod state;
pub mod texture;
pub mod worker;

pub use cache::{ResourceCache, ShaderCache};
pub use error::{ResourceError, ResourceResult};
pub use manager::ResourceManager;
pub use material::MaterialResource;
pub use mesh::MeshResource;
pub use model::ModelResource;
pub use resource::{Loadable, Resource, ResourceHandle, ResourceHeader, ResourceKind, UploadStatus};
pub use shader::ShaderResource;
pub use state::{OneShot, ResourceState};
pub use texture::{Rgba8Image, TextureResource};
pub use worker::WorkerPool;

#[cfg(feature = "shaderc")]
pub use shader::ShadercCompiler;
