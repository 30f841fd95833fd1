//! Descriptor set management for shader resource binding.
//!
//! This module provides abstractions for Vulkan descriptor management:
//! - [`DescriptorSetLayout`] defines the layout of shader bindings
//! - [`DescriptorPool`] manages allocation of descriptor sets
//! - [`group_bindings_by_set`] and [`compute_pool_sizes`] derive both from a
//!   [`ShaderReflection`]
//!
//! # Overview
//!
//! Bindings are grouped by `set`, and one layout is created per set index.
//! Set indices are made contiguous from 0 (gaps get an empty layout) because a
//! pipeline layout addresses its set layouts by position.
//!
//! Every descriptor set is replicated once per frame in flight, so pool sizes
//! are the per-type descriptor tallies multiplied by the frame count, and the
//! pool holds `frames * set_count` sets.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ember_rhi::descriptor::{DescriptorPool, compute_pool_sizes, create_set_layouts};
//! use ember_rhi::device::Device;
//! use ember_rhi::reflection::ShaderReflection;
//! use ember_rhi::sync::MAX_FRAMES_IN_FLIGHT;
//!
//! # fn example(device: Arc<Device>, reflection: &ShaderReflection) -> ember_rhi::RhiResult<()> {
//! let layouts = create_set_layouts(device.clone(), reflection)?;
//! let sizing = compute_pool_sizes(reflection, MAX_FRAMES_IN_FLIGHT);
//! let pool = DescriptorPool::new(device, sizing.max_sets, &sizing.pool_sizes())?;
//!
//! let handles: Vec<_> = layouts.iter().map(|l| l.handle()).collect();
//! let sets = pool.allocate(&handles)?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::reflection::{DescriptorKind, ShaderReflection, UniformDescriptor};

/// Descriptor set layout wrapper.
///
/// # Thread Safety
///
/// The layout itself is immutable after creation. It can be shared between
/// threads when wrapped in `Arc`.
pub struct DescriptorSetLayout {
    device: Arc<Device>,
    layout: vk::DescriptorSetLayout,
    binding_count: usize,
}

impl DescriptorSetLayout {
    /// Creates a new descriptor set layout.
    ///
    /// # Errors
    ///
    /// Returns an error if layout creation fails.
    pub fn new(
        device: Arc<Device>,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> RhiResult<Self> {
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);

        let layout = unsafe {
            device
                .handle()
                .create_descriptor_set_layout(&create_info, None)?
        };

        Ok(Self {
            device,
            layout,
            binding_count: bindings.len(),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Number of bindings; 0 for a placeholder layout filling a set gap.
    #[inline]
    pub fn binding_count(&self) -> usize {
        self.binding_count
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// Descriptor pool for allocating descriptor sets.
///
/// # Thread Safety
///
/// Descriptor pool operations are not thread-safe. Each material owns its own
/// pool, so no two threads allocate from the same one.
pub struct DescriptorPool {
    device: Arc<Device>,
    pool: vk::DescriptorPool,
    max_sets: u32,
}

impl DescriptorPool {
    /// Creates a new descriptor pool.
    ///
    /// # Errors
    ///
    /// Returns an error if pool creation fails.
    pub fn new(
        device: Arc<Device>,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> RhiResult<Self> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);

        let pool = unsafe { device.handle().create_descriptor_pool(&create_info, None)? };

        debug!(
            "Created descriptor pool: max_sets={}, pool_sizes={}",
            max_sets,
            pool_sizes.len()
        );

        Ok(Self {
            device,
            pool,
            max_sets,
        })
    }

    /// Allocates one descriptor set per layout.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::DescriptorError`] if the pool is exhausted, or the
    /// Vulkan error otherwise.
    pub fn allocate(
        &self,
        layouts: &[vk::DescriptorSetLayout],
    ) -> RhiResult<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(layouts);

        match unsafe { self.device.handle().allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => Ok(sets),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
                Err(RhiError::DescriptorError(format!(
                    "descriptor pool exhausted allocating {} set(s) (max_sets={})",
                    layouts.len(),
                    self.max_sets
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    #[inline]
    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_descriptor_pool(self.pool, None);
        }
    }
}

/// Groups reflected descriptors by set index, each group sorted by binding.
pub fn group_bindings_by_set(
    reflection: &ShaderReflection,
) -> BTreeMap<u32, Vec<&UniformDescriptor>> {
    let mut sets: BTreeMap<u32, Vec<&UniformDescriptor>> = BTreeMap::new();
    for uniform in reflection.uniforms.values() {
        sets.entry(uniform.set).or_default().push(uniform);
    }
    for bindings in sets.values_mut() {
        bindings.sort_by_key(|u| u.binding);
    }
    sets
}

/// Number of set layouts a pipeline needs: highest set index + 1.
pub fn set_count(reflection: &ShaderReflection) -> u32 {
    reflection
        .uniforms
        .values()
        .map(|u| u.set + 1)
        .max()
        .unwrap_or(0)
}

/// Converts one set's descriptors into layout bindings.
pub fn layout_bindings(
    descriptors: &[&UniformDescriptor],
) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
    descriptors
        .iter()
        .map(|d| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(d.binding)
                .descriptor_type(d.kind.to_vk())
                .descriptor_count(d.count)
                .stage_flags(d.stages)
        })
        .collect()
}

/// Creates one layout per set index in `0..set_count(reflection)`.
///
/// # Errors
///
/// Returns an error if any layout creation fails; layouts already created are
/// destroyed.
pub fn create_set_layouts(
    device: Arc<Device>,
    reflection: &ShaderReflection,
) -> RhiResult<Vec<DescriptorSetLayout>> {
    let groups = group_bindings_by_set(reflection);
    (0..set_count(reflection))
        .map(|set| {
            let bindings = groups
                .get(&set)
                .map(|descriptors| layout_bindings(descriptors))
                .unwrap_or_default();
            DescriptorSetLayout::new(device.clone(), &bindings)
        })
        .collect()
}

/// Descriptor pool requirements for a reflected interface.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolSizing {
    /// Descriptor count per kind, already multiplied by the frame count.
    pub counts: BTreeMap<DescriptorKind, u32>,
    pub max_sets: u32,
}

impl PoolSizing {
    pub fn pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        self.counts
            .iter()
            .map(|(kind, &count)| {
                vk::DescriptorPoolSize::default()
                    .ty(kind.to_vk())
                    .descriptor_count(count)
            })
            .collect()
    }

    /// True if no descriptor sets are needed at all.
    pub fn is_empty(&self) -> bool {
        self.max_sets == 0
    }
}

/// Tallies descriptor counts per kind across all bindings, times `frames`.
pub fn compute_pool_sizes(reflection: &ShaderReflection, frames: usize) -> PoolSizing {
    let frames = frames as u32;
    let mut counts: BTreeMap<DescriptorKind, u32> = BTreeMap::new();
    for uniform in reflection.uniforms.values() {
        *counts.entry(uniform.kind).or_default() += uniform.count * frames;
    }

    PoolSizing {
        counts,
        max_sets: set_count(reflection) * frames,
    }
}

/// Applies descriptor writes.
pub fn update_descriptor_sets(device: &Device, writes: &[vk::WriteDescriptorSet]) {
    if writes.is_empty() {
        return;
    }

    unsafe {
        device.handle().update_descriptor_sets(writes, &[]);
    }
}

#[inline]
pub fn buffer_info(
    buffer: vk::Buffer,
    offset: vk::DeviceSize,
    range: vk::DeviceSize,
) -> vk::DescriptorBufferInfo {
    vk::DescriptorBufferInfo::default()
        .buffer(buffer)
        .offset(offset)
        .range(range)
}

#[inline]
pub fn image_info(
    sampler: vk::Sampler,
    image_view: vk::ImageView,
    image_layout: vk::ImageLayout,
) -> vk::DescriptorImageInfo {
    vk::DescriptorImageInfo::default()
        .sampler(sampler)
        .image_view(image_view)
        .image_layout(image_layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::MAX_FRAMES_IN_FLIGHT;

    fn descriptor(name: &str, set: u32, binding: u32, kind: DescriptorKind) -> UniformDescriptor {
        UniformDescriptor {
            name: name.to_string(),
            set,
            binding,
            kind,
            size: if kind == DescriptorKind::CombinedImageSampler { 0 } else { 64 },
            count: 1,
            stages: vk::ShaderStageFlags::FRAGMENT,
            members: Vec::new(),
        }
    }

    fn reflection(descriptors: Vec<UniformDescriptor>) -> ShaderReflection {
        ShaderReflection {
            uniforms: descriptors
                .into_iter()
                .map(|d| (d.name.clone(), d))
                .collect(),
            push_constants: BTreeMap::new(),
        }
    }

    #[test]
    fn test_pool_sizes_one_ubo_two_samplers() {
        let reflection = reflection(vec![
            descriptor("Globals", 0, 0, DescriptorKind::UniformBuffer),
            descriptor("albedo", 1, 0, DescriptorKind::CombinedImageSampler),
            descriptor("normals", 1, 1, DescriptorKind::CombinedImageSampler),
        ]);

        let sizing = compute_pool_sizes(&reflection, MAX_FRAMES_IN_FLIGHT);

        let expected: BTreeMap<_, _> = [
            (DescriptorKind::UniformBuffer, 2),
            (DescriptorKind::CombinedImageSampler, 4),
        ]
        .into_iter()
        .collect();
        assert_eq!(sizing.counts, expected);
        assert_eq!(sizing.max_sets, 4);
        assert_eq!(sizing.pool_sizes().len(), 2);
    }

    #[test]
    fn test_group_bindings_sorted_per_set() {
        let reflection = reflection(vec![
            descriptor("b", 1, 2, DescriptorKind::CombinedImageSampler),
            descriptor("a", 1, 0, DescriptorKind::UniformBuffer),
            descriptor("c", 0, 0, DescriptorKind::StorageBuffer),
        ]);

        let groups = group_bindings_by_set(&reflection);
        assert_eq!(groups.len(), 2);
        let bindings: Vec<u32> = groups[&1].iter().map(|d| d.binding).collect();
        assert_eq!(bindings, vec![0, 2]);
        assert_eq!(groups[&0][0].kind, DescriptorKind::StorageBuffer);
    }

    #[test]
    fn test_sparse_sets_are_made_contiguous() {
        let reflection = reflection(vec![descriptor("g", 2, 0, DescriptorKind::UniformBuffer)]);
        assert_eq!(set_count(&reflection), 3);
        assert_eq!(compute_pool_sizes(&reflection, 2).max_sets, 6);
    }

    #[test]
    fn test_array_counts_multiply() {
        let mut textures = descriptor("textures", 0, 0, DescriptorKind::CombinedImageSampler);
        textures.count = 4;
        let sizing = compute_pool_sizes(&reflection(vec![textures]), 2);
        assert_eq!(sizing.counts[&DescriptorKind::CombinedImageSampler], 8);
    }

    #[test]
    fn test_empty_reflection_needs_no_pool() {
        let sizing = compute_pool_sizes(&ShaderReflection::default(), MAX_FRAMES_IN_FLIGHT);
        assert!(sizing.is_empty());
        assert!(sizing.pool_sizes().is_empty());
    }

    #[test]
    fn test_layout_bindings_carry_kind_and_stage() {
        let d = descriptor("ssbo", 0, 3, DescriptorKind::StorageBuffer);
        let bindings = layout_bindings(&[&d]);
        assert_eq!(bindings[0].binding, 3);
        assert_eq!(bindings[0].descriptor_type, vk::DescriptorType::STORAGE_BUFFER);
        assert_eq!(bindings[0].stage_flags, vk::ShaderStageFlags::FRAGMENT);
    }
}
