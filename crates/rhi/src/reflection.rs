//! Shader interface reflection.
//!
//! Reflection turns compiled SPIR-V into the maps the binding layer works
//! from: named descriptors (set, binding, kind, size, block members) and
//! push-constant blocks.
//!
//! # Overview
//!
//! - [`ShaderReflection`] is the reflected interface of one or more stages
//! - [`ShaderCompiler`] and [`ShaderReflector`] are the seams for external
//!   compilers and reflection libraries
//! - [`SpirvReflector`] is the built-in reflector, backed by `spirq`
//!
//! Only top-level block members are reported. Sizes follow the explicit
//! `Offset`, `ArrayStride` and `MatrixStride` decorations the compiler emits
//! for std140/std430 layouts. Bindings the material layer cannot fill
//! (separate samplers, sampled or storage images, texel buffers, input
//! attachments) are rejected rather than skipped.

use std::collections::BTreeMap;

use ash::vk;
use spirq::ReflectConfig;
use spirq::ty::{DescriptorType, StructType, Type};
use spirq::var::Variable;
use tracing::debug;

use crate::error::{RhiError, RhiResult};
use crate::shader::{SPIRV_MAGIC, ShaderStage};

/// Descriptor types the binding layer supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorKind {
    UniformBuffer,
    CombinedImageSampler,
    StorageBuffer,
}

impl DescriptorKind {
    pub fn to_vk(self) -> vk::DescriptorType {
        match self {
            DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            DescriptorKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        }
    }
}

/// A member of a uniform or push-constant block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UniformMember {
    pub name: String,
    /// Byte offset inside the block.
    pub offset: u32,
    /// Byte size; 0 for a trailing runtime array.
    pub size: u32,
}

/// A reflected descriptor binding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UniformDescriptor {
    pub name: String,
    pub set: u32,
    pub binding: u32,
    pub kind: DescriptorKind,
    /// Block size in bytes (0 for samplers).
    pub size: u32,
    /// Array length; 1 for a single descriptor.
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
    pub members: Vec<UniformMember>,
}

impl UniformDescriptor {
    /// Looks up a block member by name.
    pub fn member(&self, name: &str) -> Option<&UniformMember> {
        self.members.iter().find(|m| m.name == name)
    }
}

/// A reflected push-constant block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushConstantDescriptor {
    pub name: String,
    pub size: u32,
    pub stages: vk::ShaderStageFlags,
    pub members: Vec<UniformMember>,
}

/// Reflected resource interface of a shader program.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShaderReflection {
    pub uniforms: BTreeMap<String, UniformDescriptor>,
    pub push_constants: BTreeMap<String, PushConstantDescriptor>,
}

impl ShaderReflection {
    /// Merges another stage's reflection into this one.
    ///
    /// Entries with the same name are combined by OR-ing their stage flags.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::ShaderError`] if the same name is bound to a
    /// different set, binding or kind in the two stages.
    pub fn merge(&mut self, other: ShaderReflection) -> RhiResult<()> {
        for (name, uniform) in other.uniforms {
            match self.uniforms.get_mut(&name) {
                Some(existing) => {
                    if (existing.set, existing.binding, existing.kind)
                        != (uniform.set, uniform.binding, uniform.kind)
                    {
                        return Err(RhiError::ShaderError(format!(
                            "uniform '{name}' declared as set {} binding {} ({:?}) and set {} binding {} ({:?})",
                            existing.set,
                            existing.binding,
                            existing.kind,
                            uniform.set,
                            uniform.binding,
                            uniform.kind
                        )));
                    }
                    existing.stages |= uniform.stages;
                    existing.size = existing.size.max(uniform.size);
                    if existing.members.len() < uniform.members.len() {
                        existing.members = uniform.members;
                    }
                }
                None => {
                    self.uniforms.insert(name, uniform);
                }
            }
        }

        for (name, block) in other.push_constants {
            match self.push_constants.get_mut(&name) {
                Some(existing) => {
                    existing.stages |= block.stages;
                    existing.size = existing.size.max(block.size);
                    if existing.members.len() < block.members.len() {
                        existing.members = block.members;
                    }
                }
                None => {
                    self.push_constants.insert(name, block);
                }
            }
        }

        Ok(())
    }

    /// Finds the uniform-buffer member called `name`.
    pub fn find_member(&self, name: &str) -> Option<(&UniformDescriptor, &UniformMember)> {
        self.uniforms
            .values()
            .filter(|u| u.kind == DescriptorKind::UniformBuffer)
            .find_map(|u| u.member(name).map(|m| (u, m)))
    }

    /// Finds the push-constant member called `name`.
    pub fn find_push_constant_member(
        &self,
        name: &str,
    ) -> Option<(&PushConstantDescriptor, &UniformMember)> {
        self.push_constants
            .values()
            .find_map(|p| p.members.iter().find(|m| m.name == name).map(|m| (p, m)))
    }

    /// Push-constant ranges for the pipeline layout.
    pub fn push_constant_ranges(&self) -> Vec<vk::PushConstantRange> {
        self.push_constants
            .values()
            .filter(|p| p.size > 0)
            .map(|p| {
                vk::PushConstantRange::default()
                    .stage_flags(p.stages)
                    .offset(0)
                    .size(p.size)
            })
            .collect()
    }

    /// Size of the largest push-constant block.
    pub fn push_constant_size(&self) -> u32 {
        self.push_constants.values().map(|p| p.size).max().unwrap_or(0)
    }
}

/// Compiles shader source text to SPIR-V.
pub trait ShaderCompiler: Send + Sync {
    /// Compiles `source` for `stage`; `name` is used in diagnostics.
    fn compile(&self, stage: ShaderStage, source: &str, name: &str) -> RhiResult<Vec<u32>>;
}

/// Produces a [`ShaderReflection`] from SPIR-V code.
pub trait ShaderReflector: Send + Sync {
    fn reflect(&self, stage: ShaderStage, code: &[u32]) -> RhiResult<ShaderReflection>;
}

/// Largest descriptor array accepted for a single binding.
pub const MAX_BINDING_COUNT: u32 = 4096;

fn to_u32(value: usize, what: &str) -> RhiResult<u32> {
    u32::try_from(value)
        .map_err(|_| RhiError::ShaderError(format!("{what} of {value} does not fit in 32 bits")))
}

/// Members of a block with their byte offsets and sizes.
fn block_members(block: &StructType) -> RhiResult<Vec<UniformMember>> {
    block
        .members
        .iter()
        .enumerate()
        .map(|(index, member)| {
            Ok(UniformMember {
                name: member
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("_m{index}")),
                offset: to_u32(member.offset.unwrap_or(0), "member offset")?,
                size: to_u32(member.ty.nbyte().unwrap_or(0), "member size")?,
            })
        })
        .collect()
}

/// End of the last member, the size the binding has to provide.
fn block_size(members: &[UniformMember]) -> RhiResult<u32> {
    members.iter().try_fold(0u32, |size, m| {
        let end = m.offset.checked_add(m.size).ok_or_else(|| {
            RhiError::ShaderError(format!("member '{}' extends past 4 GiB", m.name))
        })?;
        Ok(size.max(end))
    })
}

/// Total descriptor count of a binding after flattening nested arrays.
fn binding_count<'a>(name: &str, nbind: u32, ty: &'a Type) -> RhiResult<(u32, &'a Type)> {
    let overflow =
        || RhiError::ShaderError(format!("binding '{name}' has more than {MAX_BINDING_COUNT} descriptors"));

    let mut count = nbind;
    let mut ty = ty;
    while let Type::Array(array) = ty {
        let length = array.nelement.unwrap_or(0);
        count = count.checked_mul(length).ok_or_else(overflow)?;
        ty = array.element_ty.as_ref();
    }

    if count == 0 {
        return Err(RhiError::ShaderError(format!(
            "binding '{name}' is a runtime-sized descriptor array"
        )));
    }
    if count > MAX_BINDING_COUNT {
        return Err(overflow());
    }
    Ok((count, ty))
}

fn descriptor_kind(name: &str, desc_ty: &DescriptorType) -> RhiResult<DescriptorKind> {
    match desc_ty {
        DescriptorType::UniformBuffer() => Ok(DescriptorKind::UniformBuffer),
        DescriptorType::StorageBuffer(..) => Ok(DescriptorKind::StorageBuffer),
        DescriptorType::CombinedImageSampler() => Ok(DescriptorKind::CombinedImageSampler),
        other => Err(RhiError::ShaderError(format!(
            "binding '{name}' uses unsupported descriptor type {other:?}"
        ))),
    }
}

/// Built-in reflector on top of `spirq`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpirvReflector;

impl ShaderReflector for SpirvReflector {
    fn reflect(&self, stage: ShaderStage, code: &[u32]) -> RhiResult<ShaderReflection> {
        if code.first() != Some(&SPIRV_MAGIC) {
            return Err(RhiError::ShaderError("not a SPIR-V module".to_string()));
        }

        let entry_points = ReflectConfig::new()
            .spv(code)
            .ref_all_rscs(true)
            .reflect()
            .map_err(|e| RhiError::ShaderError(format!("{stage} shader reflection failed: {e:?}")))?;

        let stages = stage.to_vk_stage();
        let mut reflection = ShaderReflection::default();

        for var in entry_points.iter().flat_map(|entry| entry.vars.iter()) {
            match var {
                Variable::Descriptor {
                    name,
                    desc_bind,
                    desc_ty,
                    ty,
                    nbind,
                    ..
                } => {
                    let (set, binding) = (desc_bind.set(), desc_bind.bind());
                    let block_name = match ty {
                        Type::Struct(block) => block.name.as_deref(),
                        _ => None,
                    };
                    // Blocks are named after their type, samplers after the variable.
                    let name = block_name
                        .or(name.as_deref())
                        .filter(|n| !n.is_empty())
                        .map_or_else(|| format!("_set{set}_binding{binding}"), str::to_string);

                    let kind = descriptor_kind(&name, desc_ty)?;
                    let (count, element) = binding_count(&name, *nbind, ty)?;
                    let members = match element {
                        Type::Struct(block) => block_members(block)?,
                        _ => Vec::new(),
                    };
                    let size = block_size(&members)?;

                    reflection.uniforms.insert(
                        name.clone(),
                        UniformDescriptor {
                            name,
                            set,
                            binding,
                            kind,
                            size,
                            count,
                            stages,
                            members,
                        },
                    );
                }
                Variable::PushConstant { name, ty } => {
                    let Type::Struct(block) = ty else {
                        debug!("Skipping push constant {:?} that is not a block", name);
                        continue;
                    };
                    let members = block_members(block)?;
                    let name = block
                        .name
                        .as_deref()
                        .or(name.as_deref())
                        .filter(|n| !n.is_empty())
                        .map_or_else(|| "_push".to_string(), str::to_string);
                    reflection.push_constants.insert(
                        name.clone(),
                        PushConstantDescriptor {
                            name,
                            size: block_size(&members)?,
                            stages,
                            members,
                        },
                    );
                }
                _ => {}
            }
        }

        debug!(
            "Reflected {} shader: {} descriptors, {} push-constant blocks",
            stage,
            reflection.uniforms.len(),
            reflection.push_constants.len()
        );
        Ok(reflection)
    }
}
