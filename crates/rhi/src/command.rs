//! Command pool and command buffer management.
//!
//! This module provides wrappers for VkCommandPool and VkCommandBuffer, plus
//! the two pieces of command infrastructure shared across threads.
//!
//! # Overview
//!
//! - [`CommandPool`] manages VkCommandPool creation and command buffer allocation
//! - [`CommandBuffer`] wraps VkCommandBuffer with methods for recording commands
//! - [`TransferContext`] records and synchronously submits one-shot upload
//!   commands on a transient pool
//! - [`RecordingLock`] serializes access to the active frame's command buffer
//!   between the render thread and upload workers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ember_rhi::command::TransferContext;
//! use ember_rhi::device::Device;
//!
//! # fn example(device: Arc<Device>, src: ember_rhi::vk::Buffer, dst: ember_rhi::vk::Buffer) -> ember_rhi::RhiResult<()> {
//! let transfer = TransferContext::new(device)?;
//!
//! transfer.immediate(|cmd| {
//!     cmd.copy_buffer(src, dst, &[ember_rhi::vk::BufferCopy::default().size(256)]);
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use parking_lot::{ArcMutexGuard, Mutex, MutexGuard, RawMutex};
use tracing::{debug, info};

use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::sync::{Fence, FrameFence};

/// Vulkan command pool wrapper.
///
/// A command pool is used to allocate command buffers. Each pool is associated
/// with a specific queue family and can only allocate command buffers that
/// will be submitted to queues of that family.
///
/// # Thread Safety
///
/// Command pools are externally synchronized. Pools shared between threads
/// live behind a mutex (see [`TransferContext`]).
pub struct CommandPool {
    device: Arc<Device>,
    pool: vk::CommandPool,
    queue_family_index: u32,
}

impl CommandPool {
    /// Creates a new command pool for the specified queue family.
    ///
    /// The pool is created with the `RESET_COMMAND_BUFFER` flag, allowing
    /// individual command buffers to be reset without resetting the entire pool.
    ///
    /// # Errors
    ///
    /// Returns an error if command pool creation fails.
    pub fn new(device: Arc<Device>, queue_family_index: u32) -> RhiResult<Self> {
        Self::with_flags(
            device,
            queue_family_index,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )
    }

    /// Creates a transient command pool for short-lived command buffers.
    ///
    /// # Errors
    ///
    /// Returns an error if command pool creation fails.
    pub fn new_transient(device: Arc<Device>, queue_family_index: u32) -> RhiResult<Self> {
        Self::with_flags(
            device,
            queue_family_index,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
                | vk::CommandPoolCreateFlags::TRANSIENT,
        )
    }

    fn with_flags(
        device: Arc<Device>,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> RhiResult<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(flags);

        let pool = unsafe { device.handle().create_command_pool(&create_info, None)? };

        debug!(
            "Command pool created for queue family {} ({:?})",
            queue_family_index, flags
        );

        Ok(Self {
            device,
            pool,
            queue_family_index,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// Allocates `count` primary command buffers from this pool.
    ///
    /// # Errors
    ///
    /// Returns an error if allocation fails.
    pub fn allocate_command_buffers(&self, count: u32) -> RhiResult<Vec<CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        let buffers = unsafe { self.device.handle().allocate_command_buffers(&alloc_info)? };
        Ok(buffers
            .into_iter()
            .map(|buffer| CommandBuffer::from_handle(self.device.clone(), buffer))
            .collect())
    }

    /// Allocates a single primary command buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if allocation fails.
    pub fn allocate_command_buffer(&self) -> RhiResult<CommandBuffer> {
        self.allocate_command_buffers(1)?
            .pop()
            .ok_or_else(|| RhiError::InvalidHandle("empty command buffer allocation".to_string()))
    }

    /// Returns a command buffer to the pool.
    pub fn free(&self, cmd: &CommandBuffer) {
        unsafe {
            self.device
                .handle()
                .free_command_buffers(self.pool, &[cmd.handle()]);
        }
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_command_pool(self.pool, None);
        }
        debug!(
            "Command pool destroyed for queue family {}",
            self.queue_family_index
        );
    }
}

/// Vulkan command buffer wrapper.
///
/// Commands are recorded between `begin()` and `end()` calls.
///
/// # Note
///
/// The command buffer does NOT own the underlying VkCommandBuffer handle.
/// The handle is freed when the owning CommandPool is destroyed.
#[derive(Clone)]
pub struct CommandBuffer {
    device: Arc<Device>,
    buffer: vk::CommandBuffer,
}

impl CommandBuffer {
    /// Wraps an existing command buffer handle.
    #[inline]
    pub fn from_handle(device: Arc<Device>, buffer: vk::CommandBuffer) -> Self {
        Self { device, buffer }
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    // =========================================================================
    // Recording Control
    // =========================================================================

    /// Begins recording for a single submission.
    ///
    /// # Errors
    ///
    /// Returns an error if beginning fails (e.g., if already recording).
    pub fn begin(&self) -> RhiResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device
                .handle()
                .begin_command_buffer(self.buffer, &begin_info)?;
        }

        Ok(())
    }

    /// Ends recording; the buffer is then ready for submission.
    ///
    /// # Errors
    ///
    /// Returns an error if ending fails (e.g., if not recording).
    pub fn end(&self) -> RhiResult<()> {
        unsafe {
            self.device.handle().end_command_buffer(self.buffer)?;
        }

        Ok(())
    }

    /// Resets the command buffer to its initial state.
    ///
    /// The caller must know the GPU is done with it, i.e. the owning frame
    /// slot's fence has been waited on.
    ///
    /// # Errors
    ///
    /// Returns an error if the reset fails.
    pub fn reset(&self) -> RhiResult<()> {
        unsafe {
            self.device
                .handle()
                .reset_command_buffer(self.buffer, vk::CommandBufferResetFlags::empty())?;
        }

        Ok(())
    }

    // =========================================================================
    // Dynamic Rendering (Vulkan 1.3)
    // =========================================================================

    /// Begins dynamic rendering.
    pub fn begin_rendering(&self, rendering_info: &vk::RenderingInfo) {
        unsafe {
            self.device
                .handle()
                .cmd_begin_rendering(self.buffer, rendering_info);
        }
    }

    /// Ends dynamic rendering.
    pub fn end_rendering(&self) {
        unsafe {
            self.device.handle().cmd_end_rendering(self.buffer);
        }
    }

    // =========================================================================
    // Binding
    // =========================================================================

    pub fn bind_pipeline(&self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .handle()
                .cmd_bind_pipeline(self.buffer, bind_point, pipeline);
        }
    }

    pub fn bind_vertex_buffers(&self, first_binding: u32, buffers: &[vk::Buffer], offsets: &[u64]) {
        unsafe {
            self.device
                .handle()
                .cmd_bind_vertex_buffers(self.buffer, first_binding, buffers, offsets);
        }
    }

    pub fn bind_index_buffer(&self, buffer: vk::Buffer, offset: u64, index_type: vk::IndexType) {
        unsafe {
            self.device
                .handle()
                .cmd_bind_index_buffer(self.buffer, buffer, offset, index_type);
        }
    }

    /// Binds descriptor sets starting at `first_set`.
    pub fn bind_descriptor_sets(
        &self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.device.handle().cmd_bind_descriptor_sets(
                self.buffer,
                bind_point,
                layout,
                first_set,
                sets,
                &[],
            );
        }
    }

    /// Updates push constant data from a byte slice.
    pub fn push_constants(
        &self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe {
            self.device
                .handle()
                .cmd_push_constants(self.buffer, layout, stages, offset, data);
        }
    }

    // =========================================================================
    // Dynamic State
    // =========================================================================

    pub fn set_viewport(&self, viewport: &vk::Viewport) {
        unsafe {
            self.device
                .handle()
                .cmd_set_viewport(self.buffer, 0, std::slice::from_ref(viewport));
        }
    }

    pub fn set_scissor(&self, scissor: &vk::Rect2D) {
        unsafe {
            self.device
                .handle()
                .cmd_set_scissor(self.buffer, 0, std::slice::from_ref(scissor));
        }
    }

    // =========================================================================
    // Draw and Dispatch
    // =========================================================================

    pub fn draw(&self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        unsafe {
            self.device.handle().cmd_draw(
                self.buffer,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }
    }

    pub fn draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.handle().cmd_draw_indexed(
                self.buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    pub fn dispatch(&self, group_count_x: u32, group_count_y: u32, group_count_z: u32) {
        unsafe {
            self.device
                .handle()
                .cmd_dispatch(self.buffer, group_count_x, group_count_y, group_count_z);
        }
    }

    // =========================================================================
    // Synchronization
    // =========================================================================

    /// Inserts a pipeline barrier with image memory barriers.
    pub fn image_barrier(
        &self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier],
    ) {
        unsafe {
            self.device.handle().cmd_pipeline_barrier(
                self.buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                image_barriers,
            );
        }
    }

    /// Inserts a pipeline barrier with buffer memory barriers.
    pub fn buffer_barrier(
        &self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier],
    ) {
        unsafe {
            self.device.handle().cmd_pipeline_barrier(
                self.buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                buffer_barriers,
                &[],
            );
        }
    }

    // =========================================================================
    // Copy Commands
    // =========================================================================

    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        unsafe {
            self.device
                .handle()
                .cmd_copy_buffer(self.buffer, src, dst, regions);
        }
    }

    pub fn copy_buffer_to_image(
        &self,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .handle()
                .cmd_copy_buffer_to_image(self.buffer, src, dst, dst_layout, regions);
        }
    }
}

/// One-shot command recording on a transient pool.
///
/// Every submission is synchronous: the calling thread blocks on a fence until
/// the GPU has finished, so staging resources can be released as soon as the
/// call returns. The pool sits behind a mutex because uploads may be driven
/// from worker threads.
pub struct TransferContext {
    device: Arc<Device>,
    pool: Mutex<CommandPool>,
}

impl TransferContext {
    /// Creates a transient pool on the graphics queue family.
    ///
    /// # Errors
    ///
    /// Returns an error if pool creation fails.
    pub fn new(device: Arc<Device>) -> RhiResult<Self> {
        let family = device.graphics_queue().family();
        let pool = CommandPool::new_transient(device.clone(), family)?;
        info!("Transfer context created on queue family {}", family);

        Ok(Self {
            device,
            pool: Mutex::new(pool),
        })
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Allocates a command buffer and begins recording.
    ///
    /// The transient pool stays locked until the returned value is submitted
    /// with [`Self::end_single_time_commands`] or dropped, which frees the
    /// buffer without submitting.
    ///
    /// # Errors
    ///
    /// Returns an error if allocation or `vkBeginCommandBuffer` fails.
    pub fn begin_single_time_commands(&self) -> RhiResult<SingleTimeCommands<'_>> {
        let pool = self.pool.lock();
        let cmd = pool.allocate_command_buffer()?;
        let commands = SingleTimeCommands { pool, cmd };
        commands.cmd.begin()?;
        Ok(commands)
    }

    /// Ends recording, submits to the graphics queue and waits for completion.
    ///
    /// The command buffer is freed whether or not submission succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if ending, submission or the fence wait fails.
    pub fn end_single_time_commands(&self, commands: SingleTimeCommands<'_>) -> RhiResult<()> {
        commands.cmd.end()?;

        let fence = Fence::new(self.device.clone(), false)?;
        let buffers = [commands.cmd.handle()];
        let submit_info = vk::SubmitInfo::default().command_buffers(&buffers);

        unsafe {
            self.device
                .submit_graphics(std::slice::from_ref(&submit_info), fence.handle())?;
        }
        fence.wait(u64::MAX)?;
        Ok(())
    }

    /// Records `record` into a one-shot command buffer and submits it.
    ///
    /// # Errors
    ///
    /// Returns the recording closure's error (nothing is submitted then) or any
    /// submission error.
    pub fn immediate<F>(&self, record: F) -> RhiResult<()>
    where
        F: FnOnce(&CommandBuffer) -> RhiResult<()>,
    {
        let commands = self.begin_single_time_commands()?;
        record(commands.command_buffer())?;
        self.end_single_time_commands(commands)
    }
}

/// A command buffer in the recording state from [`TransferContext`].
pub struct SingleTimeCommands<'a> {
    pool: MutexGuard<'a, CommandPool>,
    cmd: CommandBuffer,
}

impl SingleTimeCommands<'_> {
    #[inline]
    pub fn command_buffer(&self) -> &CommandBuffer {
        &self.cmd
    }
}

impl Drop for SingleTimeCommands<'_> {
    fn drop(&mut self) {
        self.pool.free(&self.cmd);
    }
}

/// Owned guard returned by [`RecordingLock::begin`].
pub type RecordingGuard = ArcMutexGuard<RawMutex, ()>;

/// Mutex guarding the command buffer of the frame being recorded.
///
/// The render thread takes the owned guard in `begin_frame` and releases it in
/// `end_frame`; worker threads that append commands call
/// [`RecordingLock::with_lock`] and therefore never interleave with a frame's
/// record/submit window.
#[derive(Clone, Default)]
pub struct RecordingLock {
    inner: Arc<Mutex<()>>,
}

impl RecordingLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for the duration of a frame.
    pub fn begin(&self) -> RecordingGuard {
        self.inner.lock_arc()
    }

    /// Acquires the lock without blocking.
    pub fn try_begin(&self) -> Option<RecordingGuard> {
        self.inner.try_lock_arc()
    }

    /// Runs `f` while holding the lock.
    pub fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.inner.lock();
        f()
    }

    /// Returns true if some thread currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl std::fmt::Debug for RecordingLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_command_types_are_send() {
        fn assert_send<T: Send>() {}
        assert_send::<CommandBuffer>();
        assert_send::<CommandPool>();
        assert_send::<TransferContext>();
    }

    #[test]
    fn test_recording_lock_blocks_try_begin() {
        let lock = RecordingLock::new();
        let guard = lock.begin();
        assert!(lock.is_locked());
        assert!(lock.try_begin().is_none());
        drop(guard);
        assert!(lock.try_begin().is_some());
    }

    #[test]
    fn test_worker_waits_for_frame_to_end() {
        let lock = RecordingLock::new();
        let guard = lock.begin();

        let (tx, rx) = mpsc::channel();
        let worker_lock = lock.clone();
        let worker = thread::spawn(move || {
            worker_lock.with_lock(|| tx.send("recorded").unwrap());
        });

        // The worker cannot record while the frame holds the lock.
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        drop(guard);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "recorded");
        worker.join().unwrap();
        assert!(!lock.is_locked());
    }
}
