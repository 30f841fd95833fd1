//! Shader programs: reflected pipelines ready for binding.
//!
//! A [`ShaderProgram`] groups a vertex + fragment pair (or a single compute
//! shader) with the pipeline built from it, the descriptor set layouts derived
//! from its merged reflection, and the pipeline layout.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ash::vk;
//! use ember_rhi::device::Device;
//! use ember_rhi::reflection::SpirvReflector;
//! use ember_renderer::program::{ProgramOptions, RenderTargets, ShaderCode, ShaderProgram};
//!
//! # fn example(device: Arc<Device>, vert: Vec<u32>, frag: Vec<u32>) -> ember_renderer::RenderResult<()> {
//! let code = ShaderCode::Graphics { vertex: vert, fragment: frag };
//! let targets = RenderTargets::new(vk::Format::B8G8R8A8_SRGB, Some(vk::Format::D32_SFLOAT));
//! let program = ShaderProgram::new(
//!     device,
//!     "lit",
//!     &code,
//!     targets,
//!     &ProgramOptions::default(),
//!     &SpirvReflector,
//! )?;
//! assert!(!program.is_compute());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::info;

use ember_rhi::descriptor::{DescriptorSetLayout, create_set_layouts};
use ember_rhi::device::Device;
use ember_rhi::pipeline::{CullMode, GraphicsPipelineBuilder, Pipeline, PipelineLayout};
use ember_rhi::reflection::{ShaderReflection, ShaderReflector};
use ember_rhi::shader::{Shader, ShaderStage};
use ember_rhi::vertex::Vertex;

use crate::error::{RenderError, RenderResult};
use crate::next_object_id;

/// SPIR-V for every stage of a program.
#[derive(Clone, Debug)]
pub enum ShaderCode {
    Graphics { vertex: Vec<u32>, fragment: Vec<u32> },
    Compute(Vec<u32>),
}

impl ShaderCode {
    /// Stages and their code, in pipeline order.
    pub fn stages(&self) -> Vec<(ShaderStage, &[u32])> {
        match self {
            ShaderCode::Graphics { vertex, fragment } => vec![
                (ShaderStage::Vertex, vertex.as_slice()),
                (ShaderStage::Fragment, fragment.as_slice()),
            ],
            ShaderCode::Compute(code) => vec![(ShaderStage::Compute, code.as_slice())],
        }
    }
}

/// Attachment formats a graphics pipeline renders into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderTargets {
    pub color: vk::Format,
    pub depth: Option<vk::Format>,
}

impl RenderTargets {
    pub fn new(color: vk::Format, depth: Option<vk::Format>) -> Self {
        Self { color, depth }
    }
}

/// Fixed-function options for graphics programs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgramOptions {
    pub cull_mode: CullMode,
    pub depth_test: bool,
    pub depth_write: bool,
    pub alpha_blend: bool,
}

impl Default for ProgramOptions {
    fn default() -> Self {
        Self {
            cull_mode: CullMode::Back,
            depth_test: true,
            depth_write: true,
            alpha_blend: false,
        }
    }
}

/// Reflects every stage and merges the results.
///
/// # Errors
///
/// Returns an error if reflection fails or the stages disagree about a
/// binding.
pub fn reflect_program(
    code: &ShaderCode,
    reflector: &dyn ShaderReflector,
) -> RenderResult<ShaderReflection> {
    let mut merged = ShaderReflection::default();
    for (stage, words) in code.stages() {
        merged.merge(reflector.reflect(stage, words)?)?;
    }
    Ok(merged)
}

/// Collapses every push-constant block into one range at offset 0.
///
/// Blocks from different stages overlap at offset 0, so a single range with
/// the union of their stages lets the whole block be pushed in one call.
pub fn combined_push_range(reflection: &ShaderReflection) -> Option<vk::PushConstantRange> {
    let ranges = reflection.push_constant_ranges();
    if ranges.is_empty() {
        return None;
    }
    let stages = ranges
        .iter()
        .fold(vk::ShaderStageFlags::empty(), |acc, r| acc | r.stage_flags);
    let size = ranges.iter().map(|r| r.size).max().unwrap_or(0);
    Some(
        vk::PushConstantRange::default()
            .stage_flags(stages)
            .offset(0)
            .size(size),
    )
}

/// A linked, reflected pipeline.
pub struct ShaderProgram {
    id: u64,
    name: String,
    pipeline: Pipeline,
    layout: PipelineLayout,
    set_layouts: Vec<DescriptorSetLayout>,
    reflection: ShaderReflection,
    push_range: Option<vk::PushConstantRange>,
}

impl ShaderProgram {
    /// Creates shader modules, reflects them and builds the pipeline.
    ///
    /// Shader modules are released once the pipeline exists.
    ///
    /// # Errors
    ///
    /// Returns an error if reflection, module creation, layout creation or
    /// pipeline creation fails.
    pub fn new(
        device: Arc<Device>,
        name: &str,
        code: &ShaderCode,
        targets: RenderTargets,
        options: &ProgramOptions,
        reflector: &dyn ShaderReflector,
    ) -> RenderResult<Self> {
        let reflection = reflect_program(code, reflector)?;
        let set_layouts = create_set_layouts(device.clone(), &reflection)?;
        let set_layout_handles: Vec<vk::DescriptorSetLayout> =
            set_layouts.iter().map(DescriptorSetLayout::handle).collect();

        let push_range = combined_push_range(&reflection);
        let layout = PipelineLayout::new(
            device.clone(),
            &set_layout_handles,
            push_range.as_slice(),
        )?;

        let modules = code
            .stages()
            .into_iter()
            .map(|(stage, words)| Shader::from_words(device.clone(), words, stage))
            .collect::<Result<Vec<_>, _>>()?;

        let pipeline = match modules.as_slice() {
            [compute] => Pipeline::create_compute(device.clone(), compute, &layout)?,
            [vertex, fragment] => {
                let mut builder = GraphicsPipelineBuilder::new()
                    .vertex_shader(vertex)
                    .fragment_shader(fragment)
                    .vertex_binding(Vertex::binding_description())
                    .vertex_attributes(&Vertex::attribute_descriptions())
                    .color_attachment_format(targets.color)
                    .cull_mode(options.cull_mode)
                    .depth_test_enable(options.depth_test)
                    .depth_write_enable(options.depth_write)
                    .alpha_blend(options.alpha_blend);
                if let Some(depth) = targets.depth {
                    builder = builder.depth_attachment_format(depth);
                }
                builder.build(device.clone(), &layout)?
            }
            other => {
                return Err(RenderError::InvalidData(format!(
                    "program '{name}' has {} stage(s)",
                    other.len()
                )));
            }
        };

        info!(
            "Shader program '{}' created: {} uniform(s), {} set layout(s), push constants {} bytes",
            name,
            reflection.uniforms.len(),
            set_layouts.len(),
            push_range.map_or(0, |r| r.size)
        );

        Ok(Self {
            id: next_object_id(),
            name: name.to_string(),
            pipeline,
            layout,
            set_layouts,
            reflection,
            push_range,
        })
    }

    /// Identity used by bind tracking.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    #[inline]
    pub fn layout(&self) -> &PipelineLayout {
        &self.layout
    }

    #[inline]
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.pipeline.bind_point()
    }

    #[inline]
    pub fn is_compute(&self) -> bool {
        self.bind_point() == vk::PipelineBindPoint::COMPUTE
    }

    /// Merged reflection of all stages.
    #[inline]
    pub fn reflection(&self) -> &ShaderReflection {
        &self.reflection
    }

    /// Set layout handles indexed by set number.
    pub fn set_layout_handles(&self) -> Vec<vk::DescriptorSetLayout> {
        self.set_layouts.iter().map(DescriptorSetLayout::handle).collect()
    }

    #[inline]
    pub fn set_count(&self) -> usize {
        self.set_layouts.len()
    }

    /// The single push-constant range, if the program has push constants.
    #[inline]
    pub fn push_range(&self) -> Option<vk::PushConstantRange> {
        self.push_range
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_rhi::reflection::{PushConstantDescriptor, UniformMember};

    fn push_block(name: &str, size: u32, stages: vk::ShaderStageFlags) -> PushConstantDescriptor {
        PushConstantDescriptor {
            name: name.to_string(),
            size,
            stages,
            members: vec![UniformMember {
                name: "model".to_string(),
                offset: 0,
                size,
            }],
        }
    }

    #[test]
    fn test_no_push_constants_no_range() {
        assert!(combined_push_range(&ShaderReflection::default()).is_none());
    }

    #[test]
    fn test_push_ranges_are_combined() {
        let mut reflection = ShaderReflection::default();
        reflection.push_constants.insert(
            "VertPush".to_string(),
            push_block("VertPush", 64, vk::ShaderStageFlags::VERTEX),
        );
        reflection.push_constants.insert(
            "FragPush".to_string(),
            push_block("FragPush", 16, vk::ShaderStageFlags::FRAGMENT),
        );

        let range = combined_push_range(&reflection).unwrap();
        assert_eq!(range.offset, 0);
        assert_eq!(range.size, 64);
        assert_eq!(
            range.stage_flags,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn test_shader_code_stage_order() {
        let code = ShaderCode::Graphics {
            vertex: vec![1],
            fragment: vec![2],
        };
        let stages: Vec<ShaderStage> = code.stages().iter().map(|(s, _)| *s).collect();
        assert_eq!(stages, vec![ShaderStage::Vertex, ShaderStage::Fragment]);

        let compute = ShaderCode::Compute(vec![3]);
        assert_eq!(compute.stages()[0].0, ShaderStage::Compute);
    }

    #[test]
    fn test_default_options() {
        let options = ProgramOptions::default();
        assert_eq!(options.cull_mode, CullMode::Back);
        assert!(options.depth_test);
        assert!(!options.alpha_blend);
    }
}
