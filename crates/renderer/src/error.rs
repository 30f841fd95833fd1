//! Renderer error types.

use thiserror::Error;

use ember_rhi::RhiError;

use crate::frame::FrameState;

/// Error type for the renderer frontend.
#[derive(Error, Debug)]
pub enum RenderError {
    /// Error bubbled up from the RHI layer
    #[error(transparent)]
    Rhi(#[from] RhiError),

    /// A frame operation was called in the wrong state
    #[error("Illegal frame transition: {from:?} -> {to:?}")]
    IllegalTransition { from: FrameState, to: FrameState },

    /// A frame operation was called in a state that does not allow it
    #[error("'{operation}' is not allowed in frame state {state:?}")]
    WrongFrameState {
        operation: &'static str,
        state: FrameState,
    },

    /// The shader program has not been bound before a material/draw call
    #[error("No shader program bound")]
    NoProgramBound,

    /// A material was bound with a program that differs from the bound one
    #[error("Material '{0}' was built for a different shader program")]
    ProgramMismatch(String),

    /// An attribute value does not fit the reflected member it targets
    #[error("Attribute '{name}' is {given} bytes, member expects {expected}")]
    AttributeSize {
        name: String,
        given: usize,
        expected: u32,
    },

    /// An attribute value of the wrong kind for its target
    #[error("Attribute '{name}' expects {expected}, got {given}")]
    AttributeKind {
        name: String,
        expected: &'static str,
        given: &'static str,
    },

    /// A descriptor binding that must be set before drawing is empty
    #[error("Binding '{0}' has no resource bound")]
    MissingBinding(String),

    /// A sub-mesh index outside the mesh's range
    #[error("Sub-mesh {index} out of range ({count} sub-meshes)")]
    SubMeshOutOfRange { index: usize, count: usize },

    /// The operation needs a GPU backend but the renderer is headless
    #[error("Operation requires a GPU backend")]
    Headless,

    /// Invalid input data for a GPU resource
    #[error("Invalid resource data: {0}")]
    InvalidData(String),
}

/// Result type alias for renderer operations.
pub type RenderResult<T> = std::result::Result<T, RenderError>;
