//! Shader module management.
//!
//! This module handles SPIR-V loading and VkShaderModule creation.
//!
//! # Overview
//!
//! - [`ShaderStage`] defines the type of shader (vertex, fragment, compute)
//! - [`Shader`] wraps VkShaderModule with its stage
//! - [`spirv_words`] validates and converts raw SPIR-V bytes
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::path::Path;
//! use ember_rhi::device::Device;
//! use ember_rhi::shader::{Shader, ShaderStage};
//!
//! # fn example(device: Arc<Device>) -> ember_rhi::RhiResult<()> {
//! let vertex_shader = Shader::from_spirv_file(
//!     device.clone(),
//!     Path::new("shaders/triangle.vert.spv"),
//!     ShaderStage::Vertex,
//! )?;
//!
//! let _vertex_stage_info = vertex_shader.stage_create_info();
//! # Ok(())
//! # }
//! ```

use std::ffi::CStr;
use std::path::Path;
use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Entry point used by every shader module.
pub const ENTRY_POINT: &CStr = c"main";

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Shader stage type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    /// Vertex shader stage - processes each vertex
    Vertex,
    /// Fragment (pixel) shader stage - processes each fragment
    Fragment,
    /// Compute shader stage - general-purpose GPU computation
    Compute,
}

impl ShaderStage {
    /// Converts the shader stage to Vulkan shader stage flags.
    pub fn to_vk_stage(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }

    /// Returns a human-readable name for the shader stage.
    pub fn name(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::Fragment => "fragment",
            ShaderStage::Compute => "compute",
        }
    }

    /// Conventional GLSL source extension (`vert`, `frag`, `comp`).
    pub fn extension(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vert",
            ShaderStage::Fragment => "frag",
            ShaderStage::Compute => "comp",
        }
    }

    /// Parses a conventional GLSL source extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "vert" => Some(ShaderStage::Vertex),
            "frag" => Some(ShaderStage::Fragment),
            "comp" => Some(ShaderStage::Compute),
            _ => None,
        }
    }
}

impl std::fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Converts little-endian SPIR-V bytes into code words.
///
/// # Errors
///
/// Returns [`RhiError::ShaderError`] if the length is not a multiple of 4 or
/// the magic number is missing.
pub fn spirv_words(bytes: &[u8]) -> RhiResult<Vec<u32>> {
    if !bytes.len().is_multiple_of(4) {
        return Err(RhiError::ShaderError(format!(
            "SPIR-V code must be 4-byte aligned, got {} bytes",
            bytes.len()
        )));
    }

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    if words.first() != Some(&SPIRV_MAGIC) {
        return Err(RhiError::ShaderError(
            "missing SPIR-V magic number".to_string(),
        ));
    }

    Ok(words)
}

/// Vulkan shader module wrapper.
///
/// The module is only needed until the pipeline using it has been created,
/// but keeping it alive lets a program rebuild its pipeline without reloading.
pub struct Shader {
    device: Arc<Device>,
    module: vk::ShaderModule,
    stage: ShaderStage,
}

impl Shader {
    /// Creates a shader module from a SPIR-V file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, the SPIR-V is malformed,
    /// or module creation fails.
    pub fn from_spirv_file(device: Arc<Device>, path: &Path, stage: ShaderStage) -> RhiResult<Self> {
        debug!("Loading {} shader from {:?}", stage, path);

        let bytes = std::fs::read(path).map_err(|e| {
            RhiError::ShaderError(format!("Failed to read shader file {:?}: {}", path, e))
        })?;

        Self::from_words(device, &spirv_words(&bytes)?, stage)
    }

    /// Creates a shader module from SPIR-V code words.
    ///
    /// # Errors
    ///
    /// Returns an error if the code does not start with the SPIR-V magic
    /// number or module creation fails.
    pub fn from_words(device: Arc<Device>, code: &[u32], stage: ShaderStage) -> RhiResult<Self> {
        if code.first() != Some(&SPIRV_MAGIC) {
            return Err(RhiError::ShaderError(format!(
                "{stage} shader is not SPIR-V"
            )));
        }

        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        let module = unsafe { device.handle().create_shader_module(&create_info, None)? };

        debug!("Created {} shader module ({} words)", stage, code.len());

        Ok(Self {
            device,
            module,
            stage,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    #[inline]
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    /// Creates a pipeline shader stage create info structure.
    pub fn stage_create_info(&self) -> vk::PipelineShaderStageCreateInfo<'static> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage.to_vk_stage())
            .module(self.module)
            .name(ENTRY_POINT)
    }
}

impl Drop for Shader {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_shader_module(self.module, None);
        }
        debug!("Destroyed {} shader module", self.stage);
    }
}
