//! Materials: named attribute values bound to a shader program.
//!
//! # Overview
//!
//! A [`MaterialBinding`] pairs a [`ShaderProgram`] with values addressed by
//! name. A name resolves, through the program's reflection, to one of:
//!
//! - a member of a uniform block, written into that frame slot's mapped
//!   uniform buffer
//! - a member of the push-constant block, pushed with every bind
//! - a combined image sampler, bound to a texture (the placeholder when unset)
//! - a storage buffer, which must be set before the material is bound
//!
//! Values set through [`MaterialBinding::set_attribute`] go into a pending
//! table and are applied on the next bind. Uniform and descriptor writes for
//! a slot happen on the first bind of that slot in a frame, after the slot's
//! fence has been waited on, so memory the GPU may still read is never
//! touched.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use glam::Vec4;
//! use ember_renderer::context::GpuContext;
//! use ember_renderer::material::{AttributeValue, MaterialBinding};
//! use ember_renderer::program::ShaderProgram;
//!
//! # fn example(context: &GpuContext, program: Arc<ShaderProgram>) -> ember_renderer::RenderResult<()> {
//! let material = MaterialBinding::new(context, "red", program)?;
//! material.set_attribute("base_color", AttributeValue::Vec4(Vec4::new(1.0, 0.0, 0.0, 1.0)));
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::sync::Arc;

use ash::vk;
use glam::{Mat4, Vec2, Vec3, Vec4};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use ember_rhi::buffer::{Buffer, check_write_range};
use ember_rhi::command::CommandBuffer;
use ember_rhi::descriptor::{
    DescriptorPool, buffer_info, compute_pool_sizes, update_descriptor_sets,
};
use ember_rhi::device::Device;
use ember_rhi::reflection::{DescriptorKind, ShaderReflection, UniformDescriptor};
use ember_rhi::sync::MAX_FRAMES_IN_FLIGHT;
use ember_rhi::texture::Texture;
use ember_rhi::uniform::UniformBufferSet;

use crate::context::GpuContext;
use crate::error::{RenderError, RenderResult};
use crate::next_object_id;
use crate::program::ShaderProgram;

/// Smallest uniform buffer allocated for a block, in bytes.
const MIN_UNIFORM_SIZE: u32 = 16;

/// A value assignable to a material attribute.
#[derive(Clone)]
pub enum AttributeValue {
    Float(f32),
    Int(i32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Mat4(Mat4),
    Texture(Arc<Texture>),
    StorageBuffer(Arc<Buffer>),
}

impl AttributeValue {
    /// Short type name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            AttributeValue::Float(_) => "float",
            AttributeValue::Int(_) => "int",
            AttributeValue::Vec2(_) => "vec2",
            AttributeValue::Vec3(_) => "vec3",
            AttributeValue::Vec4(_) => "vec4",
            AttributeValue::Mat4(_) => "mat4",
            AttributeValue::Texture(_) => "texture",
            AttributeValue::StorageBuffer(_) => "storage buffer",
        }
    }

    /// Raw bytes of a plain-data value; `None` for resource handles.
    pub fn bytes(&self) -> Option<Vec<u8>> {
        let bytes = match self {
            AttributeValue::Float(v) => bytemuck::bytes_of(v).to_vec(),
            AttributeValue::Int(v) => bytemuck::bytes_of(v).to_vec(),
            AttributeValue::Vec2(v) => bytemuck::bytes_of(v).to_vec(),
            AttributeValue::Vec3(v) => bytemuck::bytes_of(v).to_vec(),
            AttributeValue::Vec4(v) => bytemuck::bytes_of(v).to_vec(),
            AttributeValue::Mat4(v) => bytemuck::bytes_of(v).to_vec(),
            AttributeValue::Texture(_) | AttributeValue::StorageBuffer(_) => return None,
        };
        Some(bytes)
    }
}

impl fmt::Debug for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Float(v) => write!(f, "Float({v})"),
            AttributeValue::Int(v) => write!(f, "Int({v})"),
            AttributeValue::Vec2(v) => write!(f, "Vec2({v})"),
            AttributeValue::Vec3(v) => write!(f, "Vec3({v})"),
            AttributeValue::Vec4(v) => write!(f, "Vec4({v})"),
            AttributeValue::Mat4(v) => write!(f, "Mat4({v})"),
            AttributeValue::Texture(t) => {
                let extent = t.extent();
                write!(f, "Texture({}x{})", extent.width, extent.height)
            }
            AttributeValue::StorageBuffer(b) => write!(f, "StorageBuffer({} bytes)", b.size()),
        }
    }
}

/// Plain values compare by value, GPU resources by identity.
impl PartialEq for AttributeValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (AttributeValue::Float(a), AttributeValue::Float(b)) => a == b,
            (AttributeValue::Int(a), AttributeValue::Int(b)) => a == b,
            (AttributeValue::Vec2(a), AttributeValue::Vec2(b)) => a == b,
            (AttributeValue::Vec3(a), AttributeValue::Vec3(b)) => a == b,
            (AttributeValue::Vec4(a), AttributeValue::Vec4(b)) => a == b,
            (AttributeValue::Mat4(a), AttributeValue::Mat4(b)) => a == b,
            (AttributeValue::Texture(a), AttributeValue::Texture(b)) => Arc::ptr_eq(a, b),
            (AttributeValue::StorageBuffer(a), AttributeValue::StorageBuffer(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Where an attribute name lands in a program's interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttributeTarget {
    Uniform {
        set: u32,
        binding: u32,
        offset: u32,
        size: u32,
    },
    PushConstant {
        offset: u32,
        size: u32,
    },
    Sampler {
        set: u32,
        binding: u32,
    },
    Storage {
        set: u32,
        binding: u32,
    },
}

impl AttributeTarget {
    fn expected(&self) -> &'static str {
        match self {
            AttributeTarget::Uniform { .. } | AttributeTarget::PushConstant { .. } => "plain data",
            AttributeTarget::Sampler { .. } => "texture",
            AttributeTarget::Storage { .. } => "storage buffer",
        }
    }
}

/// Resolves `name` against `reflection`.
///
/// Uniform block members win over push-constant members, which win over
/// sampler and storage bindings of the same name.
pub fn resolve_attribute(reflection: &ShaderReflection, name: &str) -> Option<AttributeTarget> {
    if let Some((block, member)) = reflection.find_member(name) {
        return Some(AttributeTarget::Uniform {
            set: block.set,
            binding: block.binding,
            offset: member.offset,
            size: member.size,
        });
    }

    if let Some((_, member)) = reflection.find_push_constant_member(name) {
        return Some(AttributeTarget::PushConstant {
            offset: member.offset,
            size: member.size,
        });
    }

    let descriptor = reflection.uniforms.values().find(|u| u.name == name)?;
    match descriptor.kind {
        DescriptorKind::CombinedImageSampler => Some(AttributeTarget::Sampler {
            set: descriptor.set,
            binding: descriptor.binding,
        }),
        DescriptorKind::StorageBuffer => Some(AttributeTarget::Storage {
            set: descriptor.set,
            binding: descriptor.binding,
        }),
        DescriptorKind::UniformBuffer => None,
    }
}

/// Checks that `value` fits `target`.
///
/// # Errors
///
/// Returns [`RenderError::AttributeKind`] for a resource/data mismatch and
/// [`RenderError::AttributeSize`] when the byte size differs from the member.
pub fn check_attribute(
    name: &str,
    target: &AttributeTarget,
    value: &AttributeValue,
) -> RenderResult<()> {
    let kind_error = || RenderError::AttributeKind {
        name: name.to_string(),
        expected: target.expected(),
        given: value.type_name(),
    };

    match target {
        AttributeTarget::Uniform { size, .. } | AttributeTarget::PushConstant { size, .. } => {
            let bytes = value.bytes().ok_or_else(kind_error)?;
            if bytes.len() != *size as usize {
                return Err(RenderError::AttributeSize {
                    name: name.to_string(),
                    given: bytes.len(),
                    expected: *size,
                });
            }
            Ok(())
        }
        AttributeTarget::Sampler { .. } => match value {
            AttributeValue::Texture(_) => Ok(()),
            _ => Err(kind_error()),
        },
        AttributeTarget::Storage { .. } => match value {
            AttributeValue::StorageBuffer(_) => Ok(()),
            _ => Err(kind_error()),
        },
    }
}

/// Splits `values` into those that still resolve in `reflection` and the
/// names that no longer do.
pub fn retain_matching(
    values: BTreeMap<String, AttributeValue>,
    reflection: &ShaderReflection,
) -> (BTreeMap<String, AttributeValue>, Vec<String>) {
    let mut kept = BTreeMap::new();
    let mut dropped = Vec::new();
    for (name, value) in values {
        let fits = resolve_attribute(reflection, &name)
            .is_some_and(|target| check_attribute(&name, &target, &value).is_ok());
        if fits {
            kept.insert(name, value);
        } else {
            dropped.push(name);
        }
    }
    (kept, dropped)
}

/// Outcome of applying pending attribute values.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    /// Names that were discarded, with the reason.
    pub rejected: Vec<(String, String)>,
}

/// CPU-side attribute state of a material.
///
/// Holds live and pending values, the push-constant bytes, and per-slot
/// dirty flags telling the GPU layer which slots need their uniform buffers
/// or descriptor sets rewritten.
#[derive(Debug)]
pub struct AttributeTable {
    values: BTreeMap<String, AttributeValue>,
    pending: BTreeMap<String, AttributeValue>,
    push_data: Vec<u8>,
    uniforms_dirty: Vec<bool>,
    descriptors_dirty: Vec<bool>,
}

impl AttributeTable {
    /// Creates an empty table; every slot starts dirty.
    pub fn new(frames: usize, push_size: u32) -> Self {
        Self {
            values: BTreeMap::new(),
            pending: BTreeMap::new(),
            push_data: vec![0; push_size as usize],
            uniforms_dirty: vec![true; frames],
            descriptors_dirty: vec![true; frames],
        }
    }

    /// Queues `value` for `name`, replacing any earlier pending value.
    pub fn set(&mut self, name: impl Into<String>, value: AttributeValue) {
        self.pending.insert(name.into(), value);
    }

    /// Most recent value for `name`, pending or applied.
    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.pending.get(name).or_else(|| self.values.get(name))
    }

    /// Applied value for `name`.
    pub fn applied(&self, name: &str) -> Option<&AttributeValue> {
        self.values.get(name)
    }

    /// Moves pending values into the live table.
    ///
    /// Values that resolve to nothing or do not fit their target are
    /// discarded and reported; the rest mark the slots they affect dirty.
    pub fn flush(&mut self, reflection: &ShaderReflection) -> FlushReport {
        let mut report = FlushReport::default();
        for (name, value) in mem::take(&mut self.pending) {
            let Some(target) = resolve_attribute(reflection, &name) else {
                report
                    .rejected
                    .push((name, "no matching uniform, push constant or binding".to_string()));
                continue;
            };
            if let Err(e) = check_attribute(&name, &target, &value) {
                report.rejected.push((name, e.to_string()));
                continue;
            }

            match target {
                AttributeTarget::Uniform { .. } => self.uniforms_dirty.fill(true),
                AttributeTarget::Sampler { .. } | AttributeTarget::Storage { .. } => {
                    self.descriptors_dirty.fill(true)
                }
                AttributeTarget::PushConstant { offset, .. } => {
                    let bytes = value.bytes().unwrap_or_default();
                    let capacity = self.push_data.len() as u64;
                    if let Err(e) = check_write_range(u64::from(offset), bytes.len() as u64, capacity)
                    {
                        report.rejected.push((name, e.to_string()));
                        continue;
                    }
                    let start = offset as usize;
                    self.push_data[start..start + bytes.len()].copy_from_slice(&bytes);
                }
            }

            self.values.insert(name, value);
            report.applied += 1;
        }
        report
    }

    /// Uniform member writes for every live plain-data value:
    /// `((set, binding), offset, bytes)`.
    pub fn uniform_writes(&self, reflection: &ShaderReflection) -> Vec<((u32, u32), u32, Vec<u8>)> {
        self.values
            .iter()
            .filter_map(|(name, value)| match resolve_attribute(reflection, name)? {
                AttributeTarget::Uniform {
                    set,
                    binding,
                    offset,
                    ..
                } => Some(((set, binding), offset, value.bytes()?)),
                _ => None,
            })
            .collect()
    }

    /// Clears and returns the uniform dirty flag of `slot`.
    pub fn take_uniforms_dirty(&mut self, slot: usize) -> bool {
        self.uniforms_dirty
            .get_mut(slot)
            .map(mem::take)
            .unwrap_or(false)
    }

    /// Clears and returns the descriptor dirty flag of `slot`.
    pub fn take_descriptors_dirty(&mut self, slot: usize) -> bool {
        self.descriptors_dirty
            .get_mut(slot)
            .map(mem::take)
            .unwrap_or(false)
    }

    /// Marks the descriptors of `slot` as needing a rewrite.
    pub fn mark_descriptors_dirty(&mut self, slot: usize) {
        if let Some(flag) = self.descriptors_dirty.get_mut(slot) {
            *flag = true;
        }
    }

    #[inline]
    pub fn push_data(&self) -> &[u8] {
        &self.push_data
    }

    #[inline]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Every value, pending entries taking precedence over applied ones.
    pub fn into_values(self) -> BTreeMap<String, AttributeValue> {
        let mut values = self.values;
        values.extend(self.pending);
        values
    }
}

/// Checks that every buffer binding of `reflection` holds one descriptor.
///
/// A uniform block or storage buffer is fed by a single buffer per slot, so
/// arrays of them have nothing to fill their other elements with. Sampler
/// arrays are allowed; every element gets the same texture.
///
/// # Errors
///
/// Returns [`RenderError::InvalidData`] naming the first arrayed buffer
/// binding.
pub fn check_binding_layout(reflection: &ShaderReflection) -> RenderResult<()> {
    let arrayed = reflection.uniforms.values().find(|u| {
        u.count != 1
            && matches!(
                u.kind,
                DescriptorKind::UniformBuffer | DescriptorKind::StorageBuffer
            )
    });
    match arrayed {
        Some(u) => Err(RenderError::InvalidData(format!(
            "binding '{}' (set {} binding {}) is an array of {} buffers; materials bind one buffer per name",
            u.name, u.set, u.binding, u.count
        ))),
        None => Ok(()),
    }
}

/// Descriptor sets and uniform buffers for one program, one copy per slot.
struct GpuBindings {
    /// Indexed `[slot][set]`.
    sets: Vec<Vec<vk::DescriptorSet>>,
    uniforms: BTreeMap<(u32, u32), UniformBufferSet>,
    /// Resources referenced by each slot's descriptor sets.
    retained: Vec<Vec<AttributeValue>>,
    _pool: Option<DescriptorPool>,
}

impl GpuBindings {
    fn new(device: &Arc<Device>, program: &ShaderProgram, frames: usize) -> RenderResult<Self> {
        let reflection = program.reflection();
        check_binding_layout(reflection)?;

        let mut uniforms = BTreeMap::new();
        for block in reflection
            .uniforms
            .values()
            .filter(|u| u.kind == DescriptorKind::UniformBuffer)
        {
            let size = u64::from(block.size.max(MIN_UNIFORM_SIZE));
            let mut set = UniformBufferSet::new(device.clone(), size, frames)?;
            set.map_all()?;
            uniforms.insert((block.set, block.binding), set);
        }

        let sizing = compute_pool_sizes(reflection, frames);
        let (sets, pool) = if sizing.is_empty() {
            (vec![Vec::new(); frames], None)
        } else {
            let pool = DescriptorPool::new(device.clone(), sizing.max_sets, &sizing.pool_sizes())?;
            let layouts = program.set_layout_handles();
            let sets = (0..frames)
                .map(|_| pool.allocate(&layouts))
                .collect::<Result<Vec<_>, _>>()?;
            (sets, Some(pool))
        };

        Ok(Self {
            sets,
            uniforms,
            retained: vec![Vec::new(); frames],
            _pool: pool,
        })
    }
}

struct MaterialState {
    program: Arc<ShaderProgram>,
    attributes: AttributeTable,
    last_applied: Vec<Option<u64>>,
    // Declared last so the sets and buffers outlive nothing that points at them.
    gpu: GpuBindings,
}

impl MaterialState {
    fn new(program: Arc<ShaderProgram>, gpu: GpuBindings, frames: usize) -> Self {
        let push_size = program.push_range().map_or(0, |r| r.size);
        Self {
            program,
            attributes: AttributeTable::new(frames, push_size),
            last_applied: vec![None; frames],
            gpu,
        }
    }
}

/// A shader program plus the values and descriptor sets that feed it.
///
/// Shared by `Arc` between the resource layer and draw code; all mutation
/// goes through an internal lock.
pub struct MaterialBinding {
    id: u64,
    name: String,
    device: Arc<Device>,
    placeholder: Arc<Texture>,
    frames: usize,
    state: Mutex<MaterialState>,
}

impl MaterialBinding {
    /// Creates descriptor sets and uniform buffers for `program`.
    ///
    /// # Errors
    ///
    /// Returns an error if buffer, pool or set allocation fails.
    pub fn new(
        context: &GpuContext,
        name: impl Into<String>,
        program: Arc<ShaderProgram>,
    ) -> RenderResult<Self> {
        let name = name.into();
        let frames = MAX_FRAMES_IN_FLIGHT;
        let device = context.device().clone();
        let gpu = GpuBindings::new(&device, &program, frames)?;

        debug!(
            "Material '{}' created for program '{}': {} uniform buffer(s)",
            name,
            program.name(),
            gpu.uniforms.len()
        );

        Ok(Self {
            id: next_object_id(),
            name,
            device,
            placeholder: context.placeholder_texture().clone(),
            frames,
            state: Mutex::new(MaterialState::new(program, gpu, frames)),
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

    /// Program the material is currently built for.
    pub fn program(&self) -> Arc<ShaderProgram> {
        self.state.lock().program.clone()
    }

    /// Queues `value` for `name`; applied on the next bind.
    pub fn set_attribute(&self, name: impl Into<String>, value: AttributeValue) {
        self.state.lock().attributes.set(name, value);
    }

    /// Most recent value set for `name`.
    pub fn attribute(&self, name: &str) -> Option<AttributeValue> {
        self.state.lock().attributes.get(name).cloned()
    }

    /// Number of values waiting for the next bind.
    pub fn pending_count(&self) -> usize {
        self.state.lock().attributes.pending_len()
    }

    /// Rebuilds GPU state against `program`, keeping values whose names
    /// still resolve.
    ///
    /// Waits for the device to go idle first, since the old descriptor sets
    /// may be referenced by frames in flight.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting or allocation fails; the material keeps
    /// its previous program in that case.
    pub fn rebuild(&self, program: Arc<ShaderProgram>) -> RenderResult<()> {
        self.device.wait_idle()?;
        let gpu = GpuBindings::new(&self.device, &program, self.frames)?;

        let mut state = self.state.lock();
        let fresh = MaterialState::new(program, gpu, self.frames);
        let old = mem::replace(&mut *state, fresh);

        let (kept, dropped) = retain_matching(old.attributes.into_values(), state.program.reflection());
        if !dropped.is_empty() {
            info!(
                "Material '{}' dropped attribute(s) not in program '{}': {:?}",
                self.name,
                state.program.name(),
                dropped
            );
        }
        for (name, value) in kept {
            state.attributes.set(name, value);
        }
        Ok(())
    }

    /// Records the binds for this material into `cmd`.
    ///
    /// Pending values are applied first. On the first bind of `slot` in
    /// frame `frame_number`, dirty uniform buffers and descriptor sets of
    /// that slot are rewritten. Descriptor sets are bound only when
    /// `bind_sets` is true; push constants are always pushed.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::MissingBinding`] if a storage buffer binding
    /// has never been set, or an error from the uniform writes.
    pub fn bind(
        &self,
        cmd: &CommandBuffer,
        slot: usize,
        frame_number: u64,
        bind_sets: bool,
    ) -> RenderResult<()> {
        if slot >= self.frames {
            return Err(RenderError::InvalidData(format!(
                "frame slot {slot} out of range ({} slots)",
                self.frames
            )));
        }

        let mut state = self.state.lock();
        let state = &mut *state;

        let report = state.attributes.flush(state.program.reflection());
        for (name, reason) in &report.rejected {
            warn!("Material '{}': attribute '{}' ignored: {}", self.name, name, reason);
        }

        if state.last_applied[slot] != Some(frame_number) {
            self.apply_slot(state, slot)?;
            state.last_applied[slot] = Some(frame_number);
        }

        let program = &state.program;
        let layout = program.layout().handle();
        let sets = &state.gpu.sets[slot];
        if bind_sets && !sets.is_empty() {
            cmd.bind_descriptor_sets(program.bind_point(), layout, 0, sets);
        }
        if let Some(range) = program.push_range() {
            cmd.push_constants(layout, range.stage_flags, 0, state.attributes.push_data());
        }
        Ok(())
    }

    fn apply_slot(&self, state: &mut MaterialState, slot: usize) -> RenderResult<()> {
        if state.attributes.take_uniforms_dirty(slot) {
            for (key, offset, bytes) in state.attributes.uniform_writes(state.program.reflection()) {
                if let Some(buffers) = state.gpu.uniforms.get(&key) {
                    buffers.write_to_mapped(slot, u64::from(offset), &bytes)?;
                }
            }
        }

        if state.attributes.take_descriptors_dirty(slot)
            && let Err(e) = self.write_descriptors(state, slot)
        {
            state.attributes.mark_descriptors_dirty(slot);
            return Err(e);
        }
        Ok(())
    }

    fn write_descriptors(&self, state: &mut MaterialState, slot: usize) -> RenderResult<()> {
        enum Payload {
            Buffers(Vec<vk::DescriptorBufferInfo>),
            Images(Vec<vk::DescriptorImageInfo>),
        }

        let reflection = state.program.reflection();
        let mut retained = Vec::new();
        let mut payloads: Vec<(&UniformDescriptor, Payload)> = Vec::new();

        for descriptor in reflection.uniforms.values() {
            let payload = match descriptor.kind {
                DescriptorKind::UniformBuffer => {
                    let key = (descriptor.set, descriptor.binding);
                    let buffer = state
                        .gpu
                        .uniforms
                        .get(&key)
                        .ok_or_else(|| RenderError::MissingBinding(descriptor.name.clone()))?
                        .buffer(slot)?;
                    Payload::Buffers(vec![buffer_info(buffer.handle(), 0, buffer.size())])
                }
                DescriptorKind::CombinedImageSampler => {
                    let texture = match state.attributes.applied(&descriptor.name) {
                        Some(AttributeValue::Texture(texture)) => texture.clone(),
                        _ => self.placeholder.clone(),
                    };
                    let info = texture.descriptor_info();
                    retained.push(AttributeValue::Texture(texture));
                    Payload::Images(vec![info; descriptor.count.max(1) as usize])
                }
                DescriptorKind::StorageBuffer => {
                    let Some(AttributeValue::StorageBuffer(buffer)) =
                        state.attributes.applied(&descriptor.name)
                    else {
                        return Err(RenderError::MissingBinding(descriptor.name.clone()));
                    };
                    let info = buffer_info(buffer.handle(), 0, vk::WHOLE_SIZE);
                    retained.push(AttributeValue::StorageBuffer(buffer.clone()));
                    Payload::Buffers(vec![info])
                }
            };
            payloads.push((descriptor, payload));
        }

        let sets = &state.gpu.sets[slot];
        let mut writes = Vec::with_capacity(payloads.len());
        for (descriptor, payload) in &payloads {
            let set = sets.get(descriptor.set as usize).copied().ok_or_else(|| {
                RenderError::InvalidData(format!(
                    "binding '{}' refers to set {} but the program has {}",
                    descriptor.name,
                    descriptor.set,
                    sets.len()
                ))
            })?;
            let write = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(descriptor.binding)
                .descriptor_type(descriptor.kind.to_vk());
            writes.push(match payload {
                Payload::Buffers(infos) => write.buffer_info(infos),
                Payload::Images(infos) => write.image_info(infos),
            });
        }
        update_descriptor_sets(&self.device, &writes);

        // The slot's previous frame has completed, so its old resources can go.
        state.gpu.retained[slot] = retained;
        Ok(())
    }
}

impl fmt::Debug for MaterialBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaterialBinding")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
