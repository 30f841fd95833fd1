//! Vulkan logical device and queue management.
//!
//! This module handles VkDevice creation, queue retrieval, and gpu-allocator
//! initialization.
//!
//! # Overview
//!
//! The [`Device`] owns:
//! - The logical device, created with one queue per distinct family
//! - A graphics and a present [`SharedQueue`]; when both roles live on the same
//!   family they share one queue handle *and* one lock, so submissions and
//!   presents from any thread serialize correctly
//! - The gpu-allocator instance used by every buffer and image
//!
//! No object created from the device may outlive it. Every wrapper in this
//! crate holds an `Arc<Device>` for that reason.

use std::mem::ManuallyDrop;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::error::{RhiError, RhiResult};
use crate::instance::Instance;
use crate::physical_device::{PhysicalDeviceInfo, QueueFamilyIndices};

/// Required device extensions.
pub(crate) const DEVICE_EXTENSIONS: &[&std::ffi::CStr] =
    &[ash::khr::swapchain::NAME, ash::khr::dynamic_rendering::NAME];

/// A queue handle guarded by a mutex.
///
/// Vulkan requires external synchronization for `vkQueueSubmit`,
/// `vkQueuePresentKHR` and `vkQueueWaitIdle` on the same queue. Clones share
/// the same lock.
#[derive(Clone)]
pub struct SharedQueue {
    queue: vk::Queue,
    family: u32,
    lock: Arc<Mutex<()>>,
}

impl SharedQueue {
    fn new(queue: vk::Queue, family: u32) -> Self {
        Self {
            queue,
            family,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Returns the raw queue handle.
    ///
    /// Calls that use it directly must hold [`SharedQueue::lock`].
    #[inline]
    pub fn handle(&self) -> vk::Queue {
        self.queue
    }

    /// Returns the queue family index.
    #[inline]
    pub fn family(&self) -> u32 {
        self.family
    }

    /// Acquires the queue lock.
    #[inline]
    pub fn lock(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Returns `true` if both wrappers serialize on the same lock.
    #[inline]
    pub fn shares_lock_with(&self, other: &SharedQueue) -> bool {
        Arc::ptr_eq(&self.lock, &other.lock)
    }

    /// Submits work under the queue lock.
    ///
    /// # Safety
    ///
    /// The command buffers referenced by `submits` must be fully recorded and
    /// `fence`, if not null, must be unsignaled and not in use.
    pub unsafe fn submit(
        &self,
        device: &ash::Device,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> RhiResult<()> {
        let _guard = self.lock.lock();
        unsafe { device.queue_submit(self.queue, submits, fence)? };
        Ok(())
    }

    /// Presents under the queue lock.
    ///
    /// Returns `Ok(true)` when the swapchain is suboptimal, and passes
    /// `ERROR_OUT_OF_DATE_KHR` through as an error for the caller to handle.
    pub fn present(
        &self,
        loader: &ash::khr::swapchain::Device,
        present_info: &vk::PresentInfoKHR<'_>,
    ) -> Result<bool, vk::Result> {
        let _guard = self.lock.lock();
        unsafe { loader.queue_present(self.queue, present_info) }
    }

    /// Blocks until the queue is idle.
    pub fn wait_idle(&self, device: &ash::Device) -> RhiResult<()> {
        let _guard = self.lock.lock();
        unsafe { device.queue_wait_idle(self.queue)? };
        Ok(())
    }
}

impl std::fmt::Debug for SharedQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedQueue")
            .field("queue", &self.queue)
            .field("family", &self.family)
            .finish()
    }
}

/// Builds the graphics and present queue wrappers.
///
/// `fetch` retrieves queue 0 of a family. A family serving both roles is
/// fetched once and the resulting wrapper is cloned, so both share the lock.
fn build_queues(
    families: &QueueFamilyIndices,
    mut fetch: impl FnMut(u32) -> vk::Queue,
) -> RhiResult<(SharedQueue, SharedQueue)> {
    let (Some(graphics_family), Some(present_family)) =
        (families.graphics_family, families.present_family)
    else {
        return Err(RhiError::InvalidHandle(
            "Queue families are incomplete".to_string(),
        ));
    };

    let graphics = SharedQueue::new(fetch(graphics_family), graphics_family);
    let present = if present_family == graphics_family {
        graphics.clone()
    } else {
        SharedQueue::new(fetch(present_family), present_family)
    };
    Ok((graphics, present))
}

/// Vulkan logical device wrapper.
///
/// # Thread Safety
///
/// The [`Device`] is shared across threads through `Arc`. The allocator and
/// both queues are guarded by their own mutexes.
pub struct Device {
    /// Vulkan logical device handle.
    device: ash::Device,
    /// Physical device handle.
    physical_device: vk::PhysicalDevice,
    /// Device limits, used for alignment queries.
    limits: vk::PhysicalDeviceLimits,
    /// GPU memory allocator, dropped explicitly before the device.
    allocator: ManuallyDrop<Mutex<Allocator>>,
    graphics_queue: SharedQueue,
    present_queue: SharedQueue,
    queue_families: QueueFamilyIndices,
    device_name: String,
    anisotropy: bool,
}

impl Device {
    /// Creates a new logical device.
    ///
    /// This function creates a Vulkan logical device with:
    /// - Required extensions (swapchain, dynamic rendering)
    /// - Vulkan 1.3 features (dynamic rendering, synchronization2)
    /// - Sampler anisotropy when the GPU supports it
    ///
    /// It also initializes the gpu-allocator for memory management.
    ///
    /// # Errors
    ///
    /// Returns an error if device creation or allocator initialization fails.
    pub fn new(
        instance: &Instance,
        physical_device_info: &PhysicalDeviceInfo,
    ) -> Result<Arc<Self>, RhiError> {
        let queue_families = physical_device_info.queue_families;
        let unique_families = queue_families.unique_families();
        let queue_priorities = [1.0f32];

        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        debug!(
            "Creating {} queue(s) for families: {:?}",
            queue_create_infos.len(),
            unique_families
        );

        let supported = unsafe {
            instance
                .handle()
                .get_physical_device_features(physical_device_info.device)
        };

        let mut features_1_3 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);

        let anisotropy = supported.sampler_anisotropy == vk::TRUE;
        let features = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(anisotropy);

        let extension_names: Vec<*const std::ffi::c_char> =
            DEVICE_EXTENSIONS.iter().map(|ext| ext.as_ptr()).collect();

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .enabled_features(&features)
            .push_next(&mut features_1_3);

        let device = unsafe {
            instance
                .handle()
                .create_device(physical_device_info.device, &create_info, None)?
        };

        let (graphics_queue, present_queue) = build_queues(&queue_families, |family| unsafe {
            device.get_device_queue(family, 0)
        })?;

        info!(
            "Logical device created on '{}' (graphics family {}, present family {}, {})",
            physical_device_info.device_name(),
            graphics_queue.family(),
            present_queue.family(),
            if queue_families.is_shared() {
                "shared queue"
            } else {
                "separate queues"
            }
        );

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.handle().clone(),
            device: device.clone(),
            physical_device: physical_device_info.device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        });
        let allocator = match allocator {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e.into());
            }
        };

        info!("GPU memory allocator initialized");

        Ok(Arc::new(Self {
            device,
            physical_device: physical_device_info.device,
            limits: physical_device_info.properties.limits,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            graphics_queue,
            present_queue,
            queue_families,
            device_name: physical_device_info.device_name().to_string(),
            anisotropy,
        }))
    }

    /// Returns the Vulkan logical device handle.
    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    /// Returns the physical device handle.
    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// True if sampler anisotropy was enabled at creation.
    #[inline]
    pub fn supports_anisotropy(&self) -> bool {
        self.anisotropy
    }

    /// Returns the device limits.
    #[inline]
    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.limits
    }

    /// Returns the name of the selected GPU.
    #[inline]
    pub fn name(&self) -> &str {
        &self.device_name
    }

    /// Returns the graphics queue (also used for compute and transfers).
    #[inline]
    pub fn graphics_queue(&self) -> &SharedQueue {
        &self.graphics_queue
    }

    /// Returns the presentation queue.
    #[inline]
    pub fn present_queue(&self) -> &SharedQueue {
        &self.present_queue
    }

    /// Returns the queue family indices.
    #[inline]
    pub fn queue_families(&self) -> &QueueFamilyIndices {
        &self.queue_families
    }

    /// Returns the GPU memory allocator.
    #[inline]
    pub fn allocator(&self) -> &Mutex<Allocator> {
        &self.allocator
    }

    /// Waits for the device to become idle.
    ///
    /// Both queue locks are held so no thread can submit during the drain.
    ///
    /// # Errors
    ///
    /// Returns an error if the wait fails (typically device loss).
    pub fn wait_idle(&self) -> Result<(), RhiError> {
        let _graphics = self.graphics_queue.lock();
        let _present = (!self.present_queue.shares_lock_with(&self.graphics_queue))
            .then(|| self.present_queue.lock());
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    /// Submits command buffers to the graphics queue.
    ///
    /// # Safety
    ///
    /// See [`SharedQueue::submit`].
    pub unsafe fn submit_graphics(
        &self,
        submit_infos: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), RhiError> {
        unsafe { self.graphics_queue.submit(&self.device, submit_infos, fence) }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                error!("Failed to wait for device idle during drop: {:?}", e);
            }
        }
        // The allocator owns device memory blocks and must release them before
        // the device is destroyed.
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
        }
        unsafe {
            self.device.destroy_device(None);
        }
        info!("Logical device destroyed");
    }
}

unsafe impl Send for Device {}
unsafe impl Sync for Device {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_extensions_defined() {
        assert!(DEVICE_EXTENSIONS.contains(&ash::khr::swapchain::NAME));
        assert!(DEVICE_EXTENSIONS.contains(&ash::khr::dynamic_rendering::NAME));
    }

    #[test]
    fn test_device_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Device>();
        assert_send_sync::<SharedQueue>();
    }

    fn fake_queue(family: u32) -> vk::Queue {
        use ash::vk::Handle;
        vk::Queue::from_raw(0x1000 + family as u64)
    }

    #[test]
    fn test_same_family_shares_queue_and_lock() {
        let families = QueueFamilyIndices {
            graphics_family: Some(0),
            present_family: Some(0),
        };
        let mut fetched = Vec::new();
        let (graphics, present) = build_queues(&families, |family| {
            fetched.push(family);
            fake_queue(family)
        })
        .unwrap();

        assert_eq!(fetched, vec![0]);
        assert_eq!(graphics.handle(), present.handle());
        assert!(graphics.shares_lock_with(&present));
    }

    #[test]
    fn test_distinct_families_get_distinct_locks() {
        let families = QueueFamilyIndices {
            graphics_family: Some(0),
            present_family: Some(1),
        };
        let (graphics, present) = build_queues(&families, fake_queue).unwrap();

        assert_ne!(graphics.handle(), present.handle());
        assert!(!graphics.shares_lock_with(&present));
        assert_eq!(present.family(), 1);
    }

    #[test]
    fn test_shared_lock_serializes() {
        let families = QueueFamilyIndices {
            graphics_family: Some(3),
            present_family: Some(3),
        };
        let (graphics, present) = build_queues(&families, fake_queue).unwrap();
        let _held = graphics.lock();
        assert!(present.lock.try_lock().is_none());
    }

    #[test]
    fn test_incomplete_families_rejected() {
        let families = QueueFamilyIndices {
            graphics_family: Some(0),
            present_family: None,
        };
        assert!(build_queues(&families, fake_queue).is_err());
    }
}
