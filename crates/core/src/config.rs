//! Engine configuration.
//!
//! Configuration is read from a TOML file. Every field has a default, so an
//! empty or partial file is valid:
//!
//! ```toml
//! log_filter = "info,ember_resources=debug"
//!
//! [window]
//! width = 1280
//! height = 720
//!
//! [renderer]
//! validation = true
//! present_mode = "fifo"
//!
//! [resources]
//! worker_threads = 4
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Optional `EnvFilter` directive used when `RUST_LOG` is unset.
    pub log_filter: Option<String>,
    pub window: WindowConfig,
    pub renderer: RendererConfig,
    pub resources: ResourceConfig,
}

impl EngineConfig {
    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the document is not valid TOML or a field
    /// has the wrong type.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| Error::Config {
            path: PathBuf::new(),
            message: e.to_string(),
        })
    }

    /// Loads configuration from a file.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file cannot be read, or [`Error::Config`]
    /// if it cannot be parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        toml::from_str(&source).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Loads `path` if it exists, otherwise returns the defaults.
    ///
    /// # Errors
    ///
    /// A file that exists but fails to parse is still an error.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Window creation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    pub title: String,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            title: "ember".to_string(),
        }
    }
}

/// Preferred swapchain present mode.
///
/// The preference is only a hint: FIFO is always available and is used when
/// the preferred mode is not supported by the surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentModePreference {
    /// Low-latency triple buffering.
    #[default]
    Mailbox,
    /// Strict vsync.
    Fifo,
    /// No vsync, may tear.
    Immediate,
}

/// Renderer settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Enable the Khronos validation layer when it is installed.
    pub validation: bool,
    pub present_mode: PresentModePreference,
    pub clear_color: [f32; 4],
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            validation: cfg!(debug_assertions),
            present_mode: PresentModePreference::default(),
            clear_color: [0.02, 0.02, 0.03, 1.0],
        }
    }
}

/// Resource manager settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Number of loader threads in the worker pool.
    pub worker_threads: usize,
    /// Directory relative paths are resolved against.
    pub asset_root: PathBuf,
    /// UUID to path cache file.
    pub cache_file: PathBuf,
    /// Directory holding `<uuid>.compiled` shader bytecode.
    pub shader_cache_dir: PathBuf,
    /// Log a warning every this many failed upload attempts of one resource.
    pub retry_warn_interval: u32,
    /// Upload on worker threads instead of the per-frame queue when the
    /// backend allows it.
    pub multithreaded_upload: bool,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            asset_root: PathBuf::from("assets"),
            cache_file: PathBuf::from("resources.cache"),
            shader_cache_dir: PathBuf::from("shader_cache"),
            retry_warn_interval: 120,
            multithreaded_upload: false,
        }
    }
}
