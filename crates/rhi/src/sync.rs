//! Synchronization primitives for Vulkan.
//!
//! This module provides wrappers for Vulkan synchronization objects:
//! - [`Semaphore`] - GPU-to-GPU synchronization (between queue operations)
//! - [`Fence`] - GPU-to-CPU synchronization (for host waiting)
//! - [`FrameSlots`] - per-slot fence bookkeeping enforcing wait-before-reset
//! - [`FrameSyncSet`] - every synchronization object the frame loop needs
//!
//! # Overview
//!
//! Each of the [`MAX_FRAMES_IN_FLIGHT`] slots owns one "image available"
//! semaphore and one "in flight" fence. "Render finished" semaphores are
//! indexed by swapchain image instead, because present waits on the semaphore
//! tied to the image that was actually submitted, and the image index cycles
//! independently of the frame slot whenever `image_count != MAX_FRAMES_IN_FLIGHT`.
//!
//! A slot's fence moves between two states:
//!
//! ```text
//! Signaled --reset--> Unsignaled (work in flight) --GPU completes--> Signaled
//! ```
//!
//! [`FrameSlots`] refuses to reset a fence that has not been waited on since
//! its last reset, so a slot's command buffer can never be re-recorded while
//! the GPU may still be reading it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ember_rhi::device::Device;
//! use ember_rhi::sync::FrameSyncSet;
//!
//! # fn example(device: Arc<Device>) -> ember_rhi::RhiResult<()> {
//! let mut sync = FrameSyncSet::new(device, 3)?;
//!
//! sync.wait_for_fence(0, u64::MAX)?;
//! sync.reset_fence(0)?;
//! // ... submit with sync.image_available(0), sync.render_finished(image_index)?,
//! //     and sync.fence_handle(0) ...
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Maximum number of frames that can be processed concurrently.
///
/// Using 2 allows the CPU to prepare the next frame while the GPU
/// renders the current one.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Vulkan semaphore wrapper.
///
/// # Thread Safety
///
/// The semaphore is immutable after creation and can be safely shared between
/// threads.
pub struct Semaphore {
    device: Arc<Device>,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Creates a new semaphore in the unsignaled state.
    ///
    /// # Errors
    ///
    /// Returns an error if semaphore creation fails.
    pub fn new(device: Arc<Device>) -> RhiResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::default();
        let semaphore = unsafe { device.handle().create_semaphore(&create_info, None)? };

        Ok(Self { device, semaphore })
    }

    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_semaphore(self.semaphore, None);
        }
    }
}

/// Host-side view of a fence, as needed by the frame loop.
///
/// Implemented by [`Fence`]; tests substitute a fake to check the slot
/// discipline without a device.
pub trait FrameFence {
    /// Blocks until the fence is signaled or `timeout` nanoseconds elapse.
    fn wait(&self, timeout: u64) -> RhiResult<()>;

    /// Returns the fence to the unsignaled state.
    fn reset(&self) -> RhiResult<()>;
}

/// Vulkan fence wrapper.
///
/// # Thread Safety
///
/// Wait and reset can be called from any thread; ordering between them is the
/// caller's responsibility (see [`FrameSlots`]).
pub struct Fence {
    device: Arc<Device>,
    fence: vk::Fence,
}

impl Fence {
    /// Creates a new fence.
    ///
    /// # Arguments
    ///
    /// * `device` - The logical device
    /// * `signaled` - If true, creates the fence in the signaled state, so the
    ///   first wait on it returns immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if fence creation fails.
    pub fn new(device: Arc<Device>, signaled: bool) -> RhiResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::default().flags(flags);
        let fence = unsafe { device.handle().create_fence(&create_info, None)? };

        Ok(Self { device, fence })
    }

    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Checks if the fence is currently signaled without blocking.
    pub fn is_signaled(&self) -> bool {
        let result = unsafe { self.device.handle().get_fence_status(self.fence) };
        matches!(result, Ok(true))
    }
}

impl FrameFence for Fence {
    fn wait(&self, timeout: u64) -> RhiResult<()> {
        let fences = [self.fence];
        match unsafe { self.device.handle().wait_for_fences(&fences, true, timeout) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(RhiError::Timeout),
            Err(e) => Err(e.into()),
        }
    }

    fn reset(&self) -> RhiResult<()> {
        let fences = [self.fence];
        unsafe { self.device.handle().reset_fences(&fences)? };
        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_fence(self.fence, None);
        }
    }
}

struct SlotFence<F> {
    fence: F,
    /// True once a wait has succeeded since the last reset.
    waited: bool,
}

/// Per-slot fences with enforced wait-before-reset ordering.
///
/// Fences must start signaled; a fresh slot still has to be waited on once
/// before its first reset.
pub struct FrameSlots<F: FrameFence> {
    slots: Vec<SlotFence<F>>,
}

impl<F: FrameFence> FrameSlots<F> {
    /// Wraps one fence per frame slot.
    pub fn new(fences: Vec<F>) -> Self {
        Self {
            slots: fences
                .into_iter()
                .map(|fence| SlotFence {
                    fence,
                    waited: false,
                })
                .collect(),
        }
    }

    /// Number of slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Blocks until `slot`'s fence is signaled.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::SyncError`] for an invalid slot, or the fence's wait
    /// error. A failed wait does not permit a reset.
    pub fn wait(&mut self, slot: usize, timeout: u64) -> RhiResult<()> {
        let entry = self.slot_mut(slot)?;
        entry.fence.wait(timeout)?;
        entry.waited = true;
        Ok(())
    }

    /// Resets `slot`'s fence ahead of re-recording that slot.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::SyncError`] if no wait has succeeded since the last
    /// reset; the fence is left untouched in that case.
    pub fn reset(&mut self, slot: usize) -> RhiResult<()> {
        let entry = self.slot_mut(slot)?;
        if !entry.waited {
            return Err(RhiError::SyncError(format!(
                "fence for frame slot {slot} reset before a successful wait"
            )));
        }
        entry.fence.reset()?;
        entry.waited = false;
        Ok(())
    }

    /// Returns true if `slot` has been waited on since its last reset.
    pub fn is_waited(&self, slot: usize) -> bool {
        self.slots.get(slot).is_some_and(|s| s.waited)
    }

    /// Returns the fence for `slot`.
    pub fn fence(&self, slot: usize) -> RhiResult<&F> {
        self.slots
            .get(slot)
            .map(|s| &s.fence)
            .ok_or_else(|| invalid_slot(slot, self.slots.len()))
    }

    fn slot_mut(&mut self, slot: usize) -> RhiResult<&mut SlotFence<F>> {
        let len = self.slots.len();
        self.slots
            .get_mut(slot)
            .ok_or_else(|| invalid_slot(slot, len))
    }
}

fn invalid_slot(slot: usize, len: usize) -> RhiError {
    RhiError::SyncError(format!("frame slot {slot} out of range (0..{len})"))
}

/// All synchronization objects used by the frame loop.
///
/// Per frame slot: an image-available semaphore and an in-flight fence. Per
/// swapchain image: a render-finished semaphore.
pub struct FrameSyncSet {
    device: Arc<Device>,
    image_available: Vec<Semaphore>,
    in_flight: FrameSlots<Fence>,
    render_finished: Vec<Semaphore>,
}

impl FrameSyncSet {
    /// Creates synchronization objects for [`MAX_FRAMES_IN_FLIGHT`] slots and
    /// `image_count` swapchain images.
    ///
    /// In-flight fences start signaled so the first frame does not block.
    ///
    /// # Errors
    ///
    /// Returns an error if any semaphore or fence creation fails; objects
    /// created before the failure are destroyed.
    pub fn new(device: Arc<Device>, image_count: u32) -> RhiResult<Self> {
        let image_available = (0..MAX_FRAMES_IN_FLIGHT)
            .map(|_| Semaphore::new(device.clone()))
            .collect::<RhiResult<Vec<_>>>()?;
        let fences = (0..MAX_FRAMES_IN_FLIGHT)
            .map(|_| Fence::new(device.clone(), true))
            .collect::<RhiResult<Vec<_>>>()?;
        let render_finished = create_semaphores(&device, image_count)?;

        info!(
            "Created frame synchronization: {} frame slots, {} render-finished semaphores",
            MAX_FRAMES_IN_FLIGHT, image_count
        );

        Ok(Self {
            device,
            image_available,
            in_flight: FrameSlots::new(fences),
            render_finished,
        })
    }

    /// Rebuilds the per-image semaphores after swapchain recreation.
    ///
    /// The caller must have drained the device, since the old semaphores may
    /// still be waited on by a pending present otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if semaphore creation fails; the old set is kept.
    pub fn resize_for_images(&mut self, image_count: u32) -> RhiResult<()> {
        if self.render_finished.len() == image_count as usize {
            return Ok(());
        }
        self.render_finished = create_semaphores(&self.device, image_count)?;
        debug!("Render-finished semaphores resized to {}", image_count);
        Ok(())
    }

    /// Blocks until `slot`'s previous submission has completed.
    pub fn wait_for_fence(&mut self, slot: usize, timeout: u64) -> RhiResult<()> {
        self.in_flight.wait(slot, timeout)
    }

    /// Resets `slot`'s fence; only valid after [`Self::wait_for_fence`].
    pub fn reset_fence(&mut self, slot: usize) -> RhiResult<()> {
        self.in_flight.reset(slot)
    }

    /// Raw fence handle to signal from `slot`'s submission.
    pub fn fence_handle(&self, slot: usize) -> RhiResult<vk::Fence> {
        Ok(self.in_flight.fence(slot)?.handle())
    }

    /// Semaphore signaled by image acquisition for `slot`.
    pub fn image_available(&self, slot: usize) -> RhiResult<vk::Semaphore> {
        self.image_available
            .get(slot)
            .map(Semaphore::handle)
            .ok_or_else(|| invalid_slot(slot, self.image_available.len()))
    }

    /// Semaphore signaled by rendering into swapchain image `image_index`.
    pub fn render_finished(&self, image_index: u32) -> RhiResult<vk::Semaphore> {
        self.render_finished
            .get(image_index as usize)
            .map(Semaphore::handle)
            .ok_or_else(|| {
                RhiError::SyncError(format!(
                    "swapchain image {image_index} has no render-finished semaphore ({} images)",
                    self.render_finished.len()
                ))
            })
    }

    #[inline]
    pub fn image_count(&self) -> usize {
        self.render_finished.len()
    }

    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

fn create_semaphores(device: &Arc<Device>, count: u32) -> RhiResult<Vec<Semaphore>> {
    (0..count).map(|_| Semaphore::new(device.clone())).collect()
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    /// Fence double that records calls and can be told to fail waits.
    #[derive(Default)]
    struct FakeFence {
        waits: Cell<u32>,
        resets: Cell<u32>,
        fail_wait: Cell<bool>,
    }

    impl FrameFence for FakeFence {
        fn wait(&self, _timeout: u64) -> RhiResult<()> {
            self.waits.set(self.waits.get() + 1);
            if self.fail_wait.get() {
                Err(RhiError::Timeout)
            } else {
                Ok(())
            }
        }

        fn reset(&self) -> RhiResult<()> {
            self.resets.set(self.resets.get() + 1);
            Ok(())
        }
    }

    fn slots() -> FrameSlots<FakeFence> {
        FrameSlots::new((0..MAX_FRAMES_IN_FLIGHT).map(|_| FakeFence::default()).collect())
    }

    #[test]
    fn test_max_frames_in_flight_constant() {
        assert_eq!(MAX_FRAMES_IN_FLIGHT, 2);
    }

    #[test]
    fn test_reset_before_wait_is_rejected() {
        let mut slots = slots();
        let result = slots.reset(0);
        assert!(matches!(result, Err(RhiError::SyncError(_))));
        assert_eq!(slots.fence(0).unwrap().resets.get(), 0);
    }

    #[test]
    fn test_wait_then_reset_succeeds_once() {
        let mut slots = slots();
        slots.wait(1, u64::MAX).unwrap();
        assert!(slots.is_waited(1));
        slots.reset(1).unwrap();
        assert!(!slots.is_waited(1));

        // A second reset needs a fresh wait.
        assert!(slots.reset(1).is_err());
        assert_eq!(slots.fence(1).unwrap().resets.get(), 1);
    }

    #[test]
    fn test_slots_are_independent() {
        let mut slots = slots();
        slots.wait(0, u64::MAX).unwrap();
        assert!(slots.reset(1).is_err());
        slots.reset(0).unwrap();
    }

    #[test]
    fn test_failed_wait_does_not_permit_reset() {
        let mut slots = slots();
        slots.fence(0).unwrap().fail_wait.set(true);
        assert!(matches!(slots.wait(0, 10), Err(RhiError::Timeout)));
        assert!(slots.reset(0).is_err());
    }

    #[test]
    fn test_fence_discipline_over_many_frames() {
        let mut slots = slots();
        for frame in 0..10 {
            let slot = frame % MAX_FRAMES_IN_FLIGHT;
            slots.wait(slot, u64::MAX).unwrap();
            slots.reset(slot).unwrap();
        }
        for slot in 0..MAX_FRAMES_IN_FLIGHT {
            let fence = slots.fence(slot).unwrap();
            assert_eq!(fence.waits.get(), 5);
            assert_eq!(fence.resets.get(), 5);
        }
    }

    #[test]
    fn test_out_of_range_slot() {
        let mut slots = slots();
        assert!(slots.wait(MAX_FRAMES_IN_FLIGHT, 0).is_err());
        assert!(slots.fence(7).is_err());
        assert!(!slots.is_waited(7));
    }

    #[test]
    fn test_sync_types_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Semaphore>();
        assert_send_sync::<Fence>();
        assert_send_sync::<FrameSyncSet>();
    }
}
