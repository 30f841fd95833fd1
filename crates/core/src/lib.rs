//! Core utilities shared by every ember crate.
//!
//! This crate provides foundational types used across the engine:
//! - Error types and result aliases
//! - Logging initialization
//! - Frame timing
//! - Engine configuration loaded from TOML

mod config;
mod error;
mod logging;
mod timer;

pub use config::{
    EngineConfig, PresentModePreference, RendererConfig, ResourceConfig, WindowConfig,
};
pub use error::{Error, Result};
pub use logging::{init_logging, init_logging_with};
pub use timer::FrameTimer;
