//! Frame lifecycle, material binding and draw submission.
//!
//! This crate sits on top of `ember-rhi` and provides:
//! - The explicit GPU context and the backend capability view
//! - The renderer frontend with its frame state machine
//! - Shader programs, materials and GPU meshes
//! - Compute barriers and the depth buffer

pub mod compute;
pub mod context;
pub mod depth_buffer;
mod error;
pub mod frame;
pub mod material;
pub mod mesh;
pub mod program;
pub mod renderer;

use std::sync::atomic::{AtomicU64, Ordering};

pub use compute::ComputeBarrier;
pub use context::{Backend, GpuContext};
pub use error::{RenderError, RenderResult};
pub use frame::{FrameState, FrameStats};
pub use material::{AttributeValue, MaterialBinding};
pub use mesh::{GpuMesh, MeshData, SubMesh};
pub use program::{ProgramOptions, ShaderCode, ShaderProgram};
pub use renderer::Renderer;

pub use ember_rhi::sync::MAX_FRAMES_IN_FLIGHT;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Hands out process-unique ids for programs, materials and meshes.
pub(crate) fn next_object_id() -> u64 {
    NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_ids_are_unique() {
        let a = next_object_id();
        let b = next_object_id();
        assert_ne!(a, b);
        assert!(a > 0 && b > 0);
    }
}
