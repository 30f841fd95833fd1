//! Error types shared by the engine front-end.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for engine-level operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Window creation or management errors
    #[error("Window error: {0}")]
    Window(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Config error in '{path}': {message}")]
    Config {
        /// Path of the offending file (empty for in-memory sources).
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using the engine's Error type.
pub type Result<T> = std::result::Result<T, Error>;
