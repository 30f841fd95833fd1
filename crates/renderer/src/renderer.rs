//! Renderer frontend: the frame loop and its draw-call contract.
//!
//! # Overview
//!
//! [`Renderer`] owns the swapchain, depth buffer, frame synchronization and
//! per-slot command buffers, and sequences one frame as:
//!
//! 1. [`Renderer::begin_frame`] waits for the slot's fence, acquires an image,
//!    resets the fence, begins the command buffer and takes the recording lock
//! 2. [`Renderer::dispatch_compute`] (optional, before the clear)
//! 3. [`Renderer::clear_color`] opens the dynamic-rendering scope
//! 4. [`Renderer::bind_shader`] / [`Renderer::bind_material`] /
//!    [`Renderer::bind_vertex_buffers`] / [`Renderer::draw_instanced`]
//! 5. [`Renderer::end_frame`] closes the scope, releases the lock, submits,
//!    presents and advances the frame slot
//!
//! A frame that fails before submission, or is dropped with
//! [`Renderer::cancel_frame`], returns to idle without advancing the slot.
//!
//! Out-of-date or suboptimal swapchains and window resizes are recovered by
//! recreating the swapchain; `begin_frame` returns `Ok(false)` when the frame
//! must be skipped.
//!
//! # Example
//!
//! ```no_run
//! use ember_core::RendererConfig;
//! use ember_renderer::{MeshData, ProgramOptions, Renderer, ShaderCode};
//! use ember_rhi::surface::WindowSurface;
//!
//! # fn example(window: &dyn WindowSurface, code: ShaderCode) -> ember_renderer::RenderResult<()> {
//! let mut renderer = Renderer::new(window, &RendererConfig::default())?;
//! let mesh = renderer.create_mesh(&MeshData::triangle())?;
//! let program = renderer.create_shader_program("flat", &code, &ProgramOptions::default())?;
//!
//! if renderer.begin_frame()? {
//!     renderer.clear_color()?;
//!     renderer.bind_shader(&program)?;
//!     renderer.draw_vertex_sub_mesh(&mesh, 0)?;
//!     renderer.end_frame()?;
//! }
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, error, info, warn};

use ember_core::{PresentModePreference, RendererConfig};
use ember_rhi::RhiError;
use ember_rhi::buffer::{Buffer, BufferUsage};
use ember_rhi::command::{CommandBuffer, CommandPool, RecordingGuard, RecordingLock};
use ember_rhi::rendering::{
    ColorAttachment, DepthAttachment, RenderingInfoBundle, full_scissor, full_viewport,
};
use ember_rhi::surface::{WindowSurface, wait_for_nonzero_size};
use ember_rhi::swapchain::Swapchain;
use ember_rhi::sync::{FrameSyncSet, MAX_FRAMES_IN_FLIGHT};
use ember_rhi::texture::{Texture, layout_barrier};

use crate::compute::ComputeBarrier;
use crate::context::{Backend, GpuContext};
use crate::depth_buffer::DepthBuffer;
use crate::error::{RenderError, RenderResult};
use crate::frame::{BindTracker, FrameState, FrameStateMachine, FrameStats};
use crate::material::MaterialBinding;
use crate::mesh::{GpuMesh, MeshData};
use crate::program::{ProgramOptions, ShaderCode, ShaderProgram};

/// Maps the configured preference onto a Vulkan present mode.
pub fn present_mode_for(preference: PresentModePreference) -> vk::PresentModeKHR {
    match preference {
        PresentModePreference::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentModePreference::Fifo => vk::PresentModeKHR::FIFO,
        PresentModePreference::Immediate => vk::PresentModeKHR::IMMEDIATE,
    }
}

/// An object referenced by a slot's recorded commands.
///
/// Held until the slot's fence is next waited on, so dropping the last
/// outside handle mid-frame cannot free memory the GPU still reads.
type InFlight = Arc<dyn Any + Send + Sync>;

/// Frame loop driver and resource factory.
///
/// Fields are dropped in declaration order after [`Drop::drop`] has drained
/// the device; the context goes last.
pub struct Renderer {
    frame: FrameStateMachine,
    tracker: BindTracker,
    stats: FrameStats,
    last_stats: FrameStats,
    /// Held from `begin_frame` until `end_frame`.
    recording_guard: Option<RecordingGuard>,
    recording_lock: RecordingLock,
    bound_program: Option<Arc<ShaderProgram>>,
    in_flight: Vec<Vec<InFlight>>,
    image_index: Option<u32>,

    command_buffers: Vec<CommandBuffer>,
    /// Frees `command_buffers` when dropped.
    _command_pool: CommandPool,
    sync: FrameSyncSet,
    depth_buffer: DepthBuffer,
    swapchain: Swapchain,

    resize_requested: bool,
    window_size: (u32, u32),
    clear_color: [f32; 4],

    backend: Backend,
    context: Arc<GpuContext>,
}

impl Renderer {
    /// Creates the GPU context, swapchain and per-frame objects for `window`.
    ///
    /// # Arguments
    ///
    /// * `window` - Window supplying extensions, surface and size
    /// * `config` - Validation, present mode and clear color
    ///
    /// # Errors
    ///
    /// Returns an error if any initialization step fails. A minimized window
    /// is waited out rather than reported.
    pub fn new(window: &dyn WindowSurface, config: &RendererConfig) -> RenderResult<Self> {
        let context = GpuContext::new(window, config)?;
        let device = context.device().clone();

        let window_size = wait_for_nonzero_size(window, None)?;
        info!(
            "Initializing renderer ({}x{})",
            window_size.0, window_size.1
        );

        let swapchain = Swapchain::new(
            context.instance(),
            device.clone(),
            context.surface(),
            window_size,
            present_mode_for(config.present_mode),
        )?;
        if swapchain.format() != context.render_targets().color {
            warn!(
                "Swapchain format {:?} differs from program target {:?}",
                swapchain.format(),
                context.render_targets().color
            );
        }

        let depth_buffer = DepthBuffer::new(device.clone(), swapchain.extent())?;
        let sync = FrameSyncSet::new(device.clone(), swapchain.image_count())?;

        let graphics_family = device.graphics_queue().family();
        let command_pool = CommandPool::new(device.clone(), graphics_family)?;
        let command_buffers = command_pool.allocate_command_buffers(MAX_FRAMES_IN_FLIGHT as u32)?;

        info!(
            "Renderer initialized: {} swapchain images, {} frames in flight",
            swapchain.image_count(),
            MAX_FRAMES_IN_FLIGHT
        );

        Ok(Self {
            frame: FrameStateMachine::new(MAX_FRAMES_IN_FLIGHT),
            tracker: BindTracker::new(),
            stats: FrameStats::default(),
            last_stats: FrameStats::default(),
            recording_guard: None,
            recording_lock: RecordingLock::new(),
            bound_program: None,
            in_flight: (0..MAX_FRAMES_IN_FLIGHT).map(|_| Vec::new()).collect(),
            image_index: None,
            command_buffers,
            _command_pool: command_pool,
            sync,
            depth_buffer,
            swapchain,
            resize_requested: false,
            window_size,
            clear_color: config.clear_color,
            backend: Backend::Vulkan(context.clone()),
            context,
        })
    }

    // =========================================================================
    // Frame lifecycle
    // =========================================================================

    /// Blocks until the current slot's previous submission has completed.
    ///
    /// Releases the objects that submission kept alive.
    pub fn wait_until_frame_finished(&mut self) -> RenderResult<()> {
        let slot = self.frame.slot();
        self.sync.wait_for_fence(slot, u64::MAX)?;
        self.in_flight[slot].clear();
        Ok(())
    }

    /// Starts a frame.
    ///
    /// Returns `Ok(false)` when the frame must be skipped: the swapchain was
    /// out of date and has been recreated, or the window is minimized.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::IllegalTransition`] if a frame is already in
    /// progress, or an error from the fence, acquire or command buffer.
    pub fn begin_frame(&mut self) -> RenderResult<bool> {
        let state = self.frame.state();
        if state != FrameState::Idle {
            return Err(RenderError::IllegalTransition {
                from: state,
                to: FrameState::FrameBegun,
            });
        }

        if self.resize_requested && !self.recreate_swapchain()? {
            return Ok(false);
        }

        self.wait_until_frame_finished()?;
        let slot = self.frame.slot();

        let image_available = self.sync.image_available(slot)?;
        let image_index = match self.swapchain.acquire_next_image(image_available) {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    debug!("Acquire reported a suboptimal swapchain");
                    self.resize_requested = true;
                }
                index
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                debug!("Swapchain out of date on acquire, recreating");
                self.recreate_swapchain()?;
                return Ok(false);
            }
            Err(e) => return Err(RhiError::from(e).into()),
        };

        if let Err(e) = self.start_recording(slot) {
            // The fence was never reset, so the slot stays waitable.
            if let Err(release) = self.release_acquired_image(slot, false) {
                warn!("Failed to release the acquired image: {}", release);
            }
            return Err(e);
        }

        self.recording_guard = Some(self.recording_lock.begin());
        self.frame.transition(FrameState::FrameBegun)?;
        self.image_index = Some(image_index);
        self.tracker.reset();
        self.bound_program = None;
        self.stats = FrameStats::default();
        Ok(true)
    }

    /// Begins the slot's command buffer, then resets its fence.
    fn start_recording(&mut self, slot: usize) -> RenderResult<()> {
        let cmd = &self.command_buffers[slot];
        cmd.reset()?;
        cmd.begin()?;
        // Reset only once work is certain to be submitted for this slot.
        self.sync.reset_fence(slot)?;
        Ok(())
    }

    /// Opens the dynamic-rendering scope, clearing color and depth.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::IllegalTransition`] unless called right after
    /// [`Renderer::begin_frame`].
    pub fn clear_color(&mut self) -> RenderResult<()> {
        self.frame.transition(FrameState::Recording)?;
        let image_index = self.current_image()? as usize;
        let cmd = self.current_command_buffer();

        let (color_barrier, color_masks) = layout_barrier(
            self.swapchain.image(image_index),
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        )?;
        cmd.image_barrier(color_masks.src_stage, color_masks.dst_stage, &[color_barrier]);

        let (depth_barrier, depth_masks) = self.depth_buffer.begin_frame_barrier()?;
        cmd.image_barrier(depth_masks.src_stage, depth_masks.dst_stage, &[depth_barrier]);

        let extent = self.swapchain.extent();
        let rendering = RenderingInfoBundle::new(
            extent,
            ColorAttachment::new(self.swapchain.image_view(image_index))
                .with_clear_color(self.clear_color),
            Some(DepthAttachment::new(self.depth_buffer.image_view())),
        );
        cmd.begin_rendering(&rendering.info());
        cmd.set_viewport(&full_viewport(extent));
        cmd.set_scissor(&full_scissor(extent));
        Ok(())
    }

    /// Finishes, submits and presents the frame, then advances the slot.
    ///
    /// Returns `Ok(false)` if presentation reported an out-of-date or
    /// suboptimal swapchain; it has been recreated (or is deferred while the
    /// window is minimized) before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::IllegalTransition`] outside a frame, or an
    /// error from command buffer end, submission or presentation.
    pub fn end_frame(&mut self) -> RenderResult<bool> {
        let state = self.frame.state();
        if !state.accepts_commands() {
            return Err(RenderError::IllegalTransition {
                from: state,
                to: FrameState::Submitted,
            });
        }

        let (image_index, render_finished) = match self.submit_frame(state) {
            Ok(submitted) => submitted,
            Err(e) => {
                if let Err(abandon) = self.abandon_frame() {
                    warn!("Failed to abandon frame {}: {}", self.frame.frame_number(), abandon);
                }
                return Err(e);
            }
        };
        self.frame.transition(FrameState::Submitted)?;

        let present_result = self.swapchain.present(
            self.context.device().present_queue(),
            image_index,
            render_finished,
        );
        self.frame.transition(FrameState::Presented)?;

        self.last_stats = self.stats;
        self.image_index = None;
        self.bound_program = None;
        self.frame.transition(FrameState::Idle)?;

        let stale = match present_result {
            Ok(suboptimal) => suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR) => true,
            Err(e) => return Err(RhiError::from(e).into()),
        };

        if stale || self.resize_requested {
            debug!(
                "Recreating swapchain after present (stale={}, resize={})",
                stale, self.resize_requested
            );
            self.resize_requested = true;
            self.recreate_swapchain()?;
        }
        Ok(!stale)
    }

    /// Closes the scope, ends the command buffer and submits it.
    ///
    /// Returns the image index and the semaphore presentation waits on.
    fn submit_frame(&mut self, state: FrameState) -> RenderResult<(u32, vk::Semaphore)> {
        let slot = self.frame.slot();
        let image_index = self.current_image()?;
        let cmd = self.current_command_buffer().clone();

        let old_layout = if state == FrameState::Recording {
            cmd.end_rendering();
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::UNDEFINED
        };
        let (barrier, masks) = layout_barrier(
            self.swapchain.image(image_index as usize),
            vk::ImageAspectFlags::COLOR,
            old_layout,
            vk::ImageLayout::PRESENT_SRC_KHR,
        )?;
        cmd.image_barrier(masks.src_stage, masks.dst_stage, &[barrier]);

        self.recording_guard = None;
        cmd.end()?;

        let wait_semaphores = [self.sync.image_available(slot)?];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let render_finished = self.sync.render_finished(image_index)?;
        let signal_semaphores = [render_finished];
        let command_buffers = [cmd.handle()];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.context
                .device()
                .submit_graphics(&[submit_info], self.sync.fence_handle(slot)?)?;
        }
        Ok((image_index, render_finished))
    }

    /// Drops the frame in progress without submitting its commands.
    ///
    /// The slot does not advance and nothing recorded reaches the GPU. The
    /// swapchain is rebuilt before the next frame, since the acquired image
    /// is never presented. Does nothing when no frame is in progress.
    ///
    /// # Errors
    ///
    /// Returns an error if the empty submission that releases the acquired
    /// image fails.
    pub fn cancel_frame(&mut self) -> RenderResult<()> {
        if !self.frame.state().accepts_commands() {
            return Ok(());
        }
        warn!("Cancelling frame {}", self.frame.frame_number());
        self.abandon_frame()
    }

    fn abandon_frame(&mut self) -> RenderResult<()> {
        let slot = self.frame.slot();
        self.recording_guard = None;
        self.image_index = None;
        self.bound_program = None;
        self.frame.abort()?;
        self.release_acquired_image(slot, true)
    }

    /// Consumes the slot's image-available semaphore with an empty
    /// submission, optionally signalling the slot fence.
    fn release_acquired_image(&mut self, slot: usize, signal_fence: bool) -> RenderResult<()> {
        self.resize_requested = true;

        let wait_semaphores = [self.sync.image_available(slot)?];
        let wait_stages = [vk::PipelineStageFlags::TOP_OF_PIPE];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages);
        let fence = if signal_fence {
            self.sync.fence_handle(slot)?
        } else {
            vk::Fence::null()
        };

        unsafe {
            self.context.device().submit_graphics(&[submit_info], fence)?;
        }
        Ok(())
    }

    /// Records the new window size; the swapchain is rebuilt before the
    /// next frame.
    pub fn resize(&mut self, width: u32, height: u32) {
        if (width, height) == self.window_size {
            return;
        }
        debug!(
            "Resize requested: {}x{} -> {}x{}",
            self.window_size.0, self.window_size.1, width, height
        );
        self.window_size = (width, height);
        self.resize_requested = true;
    }

    /// Blocks on window events until `window` has a non-zero size.
    ///
    /// # Errors
    ///
    /// Propagates [`RhiError::ZeroExtent`] from the poll loop.
    pub fn wait_while_minimized(&mut self, window: &dyn WindowSurface) -> RenderResult<()> {
        let size = wait_for_nonzero_size(window, None)?;
        self.resize(size.0, size.1);
        Ok(())
    }

    /// Waits for all GPU work, including presentation, to complete.
    pub fn wait_for_gpu(&self) -> RenderResult<()> {
        self.context.device().wait_idle()?;
        Ok(())
    }

    /// Rebuilds the swapchain and everything sized by it.
    ///
    /// Returns `Ok(false)` and keeps the request pending while the window
    /// has no area.
    fn recreate_swapchain(&mut self) -> RenderResult<bool> {
        let (width, height) = self.window_size;
        if width == 0 || height == 0 {
            debug!("Window minimized, deferring swapchain recreation");
            self.resize_requested = true;
            return Ok(false);
        }

        self.wait_for_gpu()?;
        match self.swapchain.recreate(
            self.context.instance(),
            self.context.surface(),
            self.window_size,
        ) {
            Ok(()) => {}
            Err(RhiError::ZeroExtent) => {
                debug!("Surface reports a zero extent, deferring swapchain recreation");
                self.resize_requested = true;
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        self.depth_buffer = DepthBuffer::new(self.context.device().clone(), self.swapchain.extent())?;
        self.sync.resize_for_images(self.swapchain.image_count())?;
        self.resize_requested = false;

        let extent = self.swapchain.extent();
        info!(
            "Swapchain recreated: {}x{}, {} images",
            extent.width,
            extent.height,
            self.swapchain.image_count()
        );
        Ok(true)
    }

    // =========================================================================
    // Draw-call contract
    // =========================================================================

    /// Binds `program`'s pipeline unless it is already bound.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::WrongFrameState`] outside a frame.
    pub fn bind_shader(&mut self, program: &Arc<ShaderProgram>) -> RenderResult<()> {
        self.require_commands("bind_shader")?;

        if self.tracker.bind_program(program.id()) {
            self.current_command_buffer()
                .bind_pipeline(program.bind_point(), program.pipeline().handle());
            self.stats.pipeline_binds += 1;
            self.retain(program.clone());
        } else {
            self.stats.redundant_binds += 1;
        }
        self.bound_program = Some(program.clone());
        Ok(())
    }

    /// Binds `material`'s descriptor sets and pushes its constants.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::NoProgramBound`] before any
    /// [`Renderer::bind_shader`], [`RenderError::ProgramMismatch`] if the
    /// material targets another program, or an error from the material.
    pub fn bind_material(&mut self, material: &Arc<MaterialBinding>) -> RenderResult<()> {
        self.require_commands("bind_material")?;
        let bound = self.bound_program.as_ref().ok_or(RenderError::NoProgramBound)?;
        if material.program().id() != bound.id() {
            return Err(RenderError::ProgramMismatch(material.name().to_string()));
        }

        let issue = self.tracker.bind_material(material.id());
        material.bind(
            self.current_command_buffer(),
            self.frame.slot(),
            self.frame.frame_number(),
            issue,
        )?;

        if issue {
            self.stats.material_binds += 1;
            self.retain(material.clone());
        } else {
            self.stats.redundant_binds += 1;
        }
        Ok(())
    }

    /// Binds `mesh`'s vertex and index buffers unless already bound.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::WrongFrameState`] outside a frame.
    pub fn bind_vertex_buffers(&mut self, mesh: &Arc<GpuMesh>) -> RenderResult<()> {
        self.require_commands("bind_vertex_buffers")?;

        if self.tracker.bind_mesh(mesh.id()) {
            let cmd = self.current_command_buffer();
            cmd.bind_vertex_buffers(0, &[mesh.vertex_buffer().handle()], &[0]);
            cmd.bind_index_buffer(mesh.index_buffer().handle(), 0, vk::IndexType::UINT32);
            self.stats.mesh_binds += 1;
            self.retain(mesh.clone());
        } else {
            self.stats.redundant_binds += 1;
        }
        Ok(())
    }

    /// Draws one instance of sub-mesh `submesh`.
    ///
    /// # Errors
    ///
    /// See [`Renderer::draw_instanced`].
    pub fn draw_vertex_sub_mesh(&mut self, mesh: &Arc<GpuMesh>, submesh: usize) -> RenderResult<()> {
        self.draw_instanced(mesh, submesh, 1)
    }

    /// Draws `instances` instances of sub-mesh `submesh`.
    ///
    /// Binds the mesh's buffers first if another mesh is bound.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::WrongFrameState`] outside the rendering scope,
    /// [`RenderError::NoProgramBound`] without a graphics program, or
    /// [`RenderError::SubMeshOutOfRange`] for a bad index.
    pub fn draw_instanced(
        &mut self,
        mesh: &Arc<GpuMesh>,
        submesh: usize,
        instances: u32,
    ) -> RenderResult<()> {
        let state = self.frame.state();
        if state != FrameState::Recording {
            return Err(RenderError::WrongFrameState {
                operation: "draw",
                state,
            });
        }
        match &self.bound_program {
            Some(program) if !program.is_compute() => {}
            _ => return Err(RenderError::NoProgramBound),
        }

        let range = mesh.submesh(submesh)?.clone();
        self.bind_vertex_buffers(mesh)?;

        self.current_command_buffer().draw_indexed(
            range.index_count,
            instances,
            range.first_index,
            range.vertex_offset,
            0,
        );
        self.stats.draw_calls += 1;
        self.stats.instances += instances;
        Ok(())
    }

    /// Records a compute dispatch followed by `barriers`.
    ///
    /// Must be called after [`Renderer::begin_frame`] and before
    /// [`Renderer::clear_color`], because pipeline barriers are not allowed
    /// inside the rendering scope.
    ///
    /// # Arguments
    ///
    /// * `program` - A compute program
    /// * `material` - Bindings for the program, if it has any
    /// * `groups` - Workgroup counts in x, y and z
    /// * `barriers` - Hazards to resolve after the dispatch, one per written buffer
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::WrongFrameState`] outside that window or
    /// [`RenderError::InvalidData`] for a graphics program.
    pub fn dispatch_compute(
        &mut self,
        program: &Arc<ShaderProgram>,
        material: Option<&Arc<MaterialBinding>>,
        groups: [u32; 3],
        barriers: &[(ComputeBarrier, &Buffer)],
    ) -> RenderResult<()> {
        let state = self.frame.state();
        if state != FrameState::FrameBegun {
            return Err(RenderError::WrongFrameState {
                operation: "dispatch_compute",
                state,
            });
        }
        if !program.is_compute() {
            return Err(RenderError::InvalidData(format!(
                "'{}' is not a compute program",
                program.name()
            )));
        }

        self.bind_shader(program)?;
        if let Some(material) = material {
            self.bind_material(material)?;
        }

        let cmd = self.current_command_buffer();
        cmd.dispatch(groups[0], groups[1], groups[2]);
        for (barrier, buffer) in barriers {
            let masks = barrier.masks();
            cmd.buffer_barrier(
                masks.src_stage,
                masks.dst_stage,
                &[barrier.buffer_barrier(buffer)],
            );
        }
        self.stats.dispatches += 1;
        Ok(())
    }

    // =========================================================================
    // Resource factories
    // =========================================================================

    /// Uploads mesh data into device-local buffers.
    pub fn create_mesh(&self, data: &MeshData) -> RenderResult<Arc<GpuMesh>> {
        GpuMesh::upload(self.context.transfer(), data).map(Arc::new)
    }

    /// Uploads RGBA8 pixels into a sampled texture.
    pub fn create_texture(&self, width: u32, height: u32, pixels: &[u8]) -> RenderResult<Arc<Texture>> {
        let texture = Texture::from_rgba8(self.context.transfer(), width, height, pixels)?;
        Ok(Arc::new(texture))
    }

    /// Builds a shader program for the swapchain's attachment formats.
    pub fn create_shader_program(
        &self,
        name: &str,
        code: &ShaderCode,
        options: &ProgramOptions,
    ) -> RenderResult<Arc<ShaderProgram>> {
        self.context.create_program(name, code, options)
    }

    /// Creates a material for `program`.
    pub fn create_material(
        &self,
        name: &str,
        program: Arc<ShaderProgram>,
    ) -> RenderResult<Arc<MaterialBinding>> {
        MaterialBinding::new(&self.context, name, program).map(Arc::new)
    }

    /// Uploads `data` into a device-local buffer usable as a storage buffer
    /// and as vertex input.
    pub fn create_storage_buffer(&self, data: &[u8]) -> RenderResult<Arc<Buffer>> {
        let buffer =
            Buffer::new_device_local(self.context.transfer(), BufferUsage::StorageVertex, data)?;
        Ok(Arc::new(buffer))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Current frame-in-flight slot.
    #[inline]
    pub fn frame_slot(&self) -> usize {
        self.frame.slot()
    }

    /// Frames presented so far.
    #[inline]
    pub fn frame_number(&self) -> u64 {
        self.frame.frame_number()
    }

    #[inline]
    pub fn state(&self) -> FrameState {
        self.frame.state()
    }

    /// Counters of the frame being recorded.
    #[inline]
    pub fn frame_stats(&self) -> FrameStats {
        self.stats
    }

    /// Counters of the last presented frame.
    #[inline]
    pub fn last_frame_stats(&self) -> FrameStats {
        self.last_stats
    }

    /// Lock held across each frame's record/submit window.
    #[inline]
    pub fn recording_lock(&self) -> &RecordingLock {
        &self.recording_lock
    }

    /// Capability view handed to resource uploads.
    #[inline]
    pub fn backend(&self) -> Backend {
        self.backend.clone()
    }

    #[inline]
    pub fn context(&self) -> &Arc<GpuContext> {
        &self.context
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.swapchain.format()
    }

    #[inline]
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.swapchain.present_mode()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn require_commands(&self, operation: &'static str) -> RenderResult<()> {
        let state = self.frame.state();
        if state.accepts_commands() {
            Ok(())
        } else {
            Err(RenderError::WrongFrameState { operation, state })
        }
    }

    fn current_image(&self) -> RenderResult<u32> {
        self.image_index.ok_or(RenderError::WrongFrameState {
            operation: "image access",
            state: self.frame.state(),
        })
    }

    #[inline]
    fn current_command_buffer(&self) -> &CommandBuffer {
        &self.command_buffers[self.frame.slot()]
    }

    fn retain(&mut self, object: InFlight) {
        let slot = self.frame.slot();
        self.in_flight[slot].push(object);
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.context.device().wait_idle() {
            error!(
                "Failed to wait for device idle during renderer drop: {:?}",
                e
            );
        }
        self.recording_guard = None;
        self.in_flight.clear();
        info!("Renderer destroyed after {} frame(s)", self.frame.frame_number());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_present_mode_mapping() {
        assert_eq!(
            present_mode_for(PresentModePreference::Mailbox),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            present_mode_for(PresentModePreference::Fifo),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            present_mode_for(PresentModePreference::Immediate),
            vk::PresentModeKHR::IMMEDIATE
        );
    }

    #[test]
    fn test_default_config_prefers_mailbox() {
        let config = RendererConfig::default();
        assert_eq!(present_mode_for(config.present_mode), vk::PresentModeKHR::MAILBOX);
    }
}
