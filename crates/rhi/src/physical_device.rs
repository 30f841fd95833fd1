//! Physical device (GPU) selection.
//!
//! # Overview
//!
//! The physical device selection process involves:
//! 1. Enumerating all available GPUs
//! 2. Rejecting GPUs without a graphics queue family, a present-capable queue
//!    family, the required device extensions, an adequate swapchain (at least
//!    one surface format and one present mode) or dynamic rendering support
//! 3. Ranking the survivors by [`DeviceScore`]: device type first (discrete
//!    over integrated), then the maximum 2D image dimension
//!
//! # Example
//!
//! ```no_run
//! use ember_rhi::instance::Instance;
//! use ember_rhi::physical_device::select_physical_device;
//!
//! # fn example(instance: &Instance, surface: &ember_rhi::surface::Surface) -> ember_rhi::RhiResult<()> {
//! let device_info = select_physical_device(instance.handle(), surface)?;
//! tracing::info!("Selected GPU: {}", device_info.device_name());
//! # Ok(())
//! # }
//! ```

use std::ffi::CStr;

use ash::vk;
use tracing::{debug, info, warn};

use crate::device::DEVICE_EXTENSIONS;
use crate::error::RhiError;
use crate::surface::Surface;
use crate::swapchain::SwapchainSupportDetails;

/// Queue family indices for the roles the renderer needs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    /// Index of the queue family that supports graphics (and compute) work.
    pub graphics_family: Option<u32>,
    /// Index of the queue family that supports presentation to the surface.
    pub present_family: Option<u32>,
}

impl QueueFamilyIndices {
    /// Checks if both graphics and present families were found.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.graphics_family.is_some() && self.present_family.is_some()
    }

    /// Returns `true` when one family serves both graphics and present.
    #[inline]
    pub fn is_shared(&self) -> bool {
        self.is_complete() && self.graphics_family == self.present_family
    }

    /// Returns the distinct families, graphics first.
    ///
    /// One queue is created per entry, so a family serving both roles only
    /// yields a single queue.
    pub fn unique_families(&self) -> Vec<u32> {
        let mut families = Vec::with_capacity(2);
        if let Some(graphics) = self.graphics_family {
            families.push(graphics);
        }
        if let Some(present) = self.present_family
            && !families.contains(&present)
        {
            families.push(present);
        }
        families
    }
}

/// Ranking key for candidate GPUs.
///
/// Ordering is lexicographic: the device type rank always dominates, and the
/// maximum 2D image dimension only breaks ties between devices of one type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeviceScore {
    pub type_rank: u32,
    pub max_image_dimension: u32,
}

impl DeviceScore {
    /// Computes the score for a device type and its 2D image dimension limit.
    pub fn new(device_type: vk::PhysicalDeviceType, max_image_dimension: u32) -> Self {
        let type_rank = match device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 4,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 3,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
            vk::PhysicalDeviceType::CPU => 1,
            _ => 0,
        };
        Self {
            type_rank,
            max_image_dimension,
        }
    }
}

/// Information about a physical device (GPU).
#[derive(Clone)]
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle.
    pub device: vk::PhysicalDevice,
    /// Device properties (name, limits, API version, etc.).
    pub properties: vk::PhysicalDeviceProperties,
    /// Memory properties (heap sizes, memory types).
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Queue family indices for different operations.
    pub queue_families: QueueFamilyIndices,
}

impl PhysicalDeviceInfo {
    /// Returns the device name as a string.
    pub fn device_name(&self) -> &str {
        self.properties
            .device_name_as_c_str()
            .ok()
            .and_then(|name| name.to_str().ok())
            .unwrap_or("Unknown Device")
    }

    /// Returns a human-readable string for the device type.
    pub fn device_type_name(&self) -> &'static str {
        match self.properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => "Discrete GPU",
            vk::PhysicalDeviceType::INTEGRATED_GPU => "Integrated GPU",
            vk::PhysicalDeviceType::VIRTUAL_GPU => "Virtual GPU",
            vk::PhysicalDeviceType::CPU => "CPU",
            _ => "Other",
        }
    }

    /// Returns the ranking key used during selection.
    pub fn score(&self) -> DeviceScore {
        DeviceScore::new(
            self.properties.device_type,
            self.properties.limits.max_image_dimension2_d,
        )
    }

    /// Returns the total device local memory in bytes.
    pub fn device_local_memory(&self) -> u64 {
        self.memory_properties
            .memory_heaps
            .iter()
            .take(self.memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum()
    }
}

impl std::fmt::Debug for PhysicalDeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalDeviceInfo")
            .field("name", &self.device_name())
            .field("type", &self.device_type_name())
            .field("queue_families", &self.queue_families)
            .finish()
    }
}

/// Selects the highest-scoring suitable physical device.
///
/// # Errors
///
/// Returns [`RhiError::NoSuitableGpu`] if no GPU qualifies.
pub fn select_physical_device(
    instance: &ash::Instance,
    surface: &Surface,
) -> Result<PhysicalDeviceInfo, RhiError> {
    let devices = unsafe { instance.enumerate_physical_devices()? };
    info!("Found {} GPU(s)", devices.len());

    let best = devices
        .into_iter()
        .filter_map(|device| check_device_suitability(instance, device, surface))
        .inspect(|info| {
            debug!(
                "GPU '{}' ({}) - {:?}",
                info.device_name(),
                info.device_type_name(),
                info.score()
            );
        })
        .max_by_key(PhysicalDeviceInfo::score);

    match best {
        Some(info) => {
            info!(
                "Selected GPU: '{}' ({}, {} MiB device-local)",
                info.device_name(),
                info.device_type_name(),
                info.device_local_memory() / (1024 * 1024)
            );
            Ok(info)
        }
        None => {
            warn!("No suitable GPU found with required capabilities");
            Err(RhiError::NoSuitableGpu)
        }
    }
}

fn check_device_suitability(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    surface: &Surface,
) -> Option<PhysicalDeviceInfo> {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
    let name = properties
        .device_name_as_c_str()
        .map(CStr::to_string_lossy)
        .unwrap_or_default()
        .into_owned();

    let queue_families = find_queue_families(instance, device, surface);
    if !queue_families.is_complete() {
        debug!("GPU '{}' skipped: missing graphics or present queue", name);
        return None;
    }

    let available = unsafe {
        instance
            .enumerate_device_extension_properties(device)
            .unwrap_or_default()
    };
    let available: Vec<&CStr> = available
        .iter()
        .filter_map(|ext| ext.extension_name_as_c_str().ok())
        .collect();
    if let Some(missing) = missing_extension(&available, DEVICE_EXTENSIONS) {
        debug!("GPU '{}' skipped: missing extension {:?}", name, missing);
        return None;
    }

    match SwapchainSupportDetails::query(device, surface) {
        Ok(support) if support.is_adequate() => {}
        _ => {
            debug!("GPU '{}' skipped: inadequate swapchain support", name);
            return None;
        }
    }

    let mut features_1_3 = vk::PhysicalDeviceVulkan13Features::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut features_1_3);
    unsafe { instance.get_physical_device_features2(device, &mut features2) };
    if features_1_3.dynamic_rendering == vk::FALSE {
        debug!("GPU '{}' skipped: dynamic rendering not supported", name);
        return None;
    }

    Some(PhysicalDeviceInfo {
        device,
        properties,
        memory_properties,
        queue_families,
    })
}

/// Returns the first required extension absent from `available`.
fn missing_extension<'a>(available: &[&CStr], required: &[&'a CStr]) -> Option<&'a CStr> {
    required
        .iter()
        .copied()
        .find(|required| !available.contains(required))
}

fn find_queue_families(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    surface: &Surface,
) -> QueueFamilyIndices {
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };

    let present_support: Vec<bool> = (0..families.len() as u32)
        .map(|i| unsafe {
            surface
                .loader()
                .get_physical_device_surface_support(device, i, surface.handle())
                .unwrap_or(false)
        })
        .collect();

    pick_queue_families(&families, &present_support)
}

/// Chooses graphics and present families.
///
/// A family that can do both is preferred so the two roles share one queue.
fn pick_queue_families(
    families: &[vk::QueueFamilyProperties],
    present_support: &[bool],
) -> QueueFamilyIndices {
    let usable = |i: usize| families[i].queue_count > 0;
    let graphics = |i: usize| usable(i) && families[i].queue_flags.contains(vk::QueueFlags::GRAPHICS);
    let present = |i: usize| usable(i) && present_support.get(i).copied().unwrap_or(false);

    if let Some(both) = (0..families.len()).find(|&i| graphics(i) && present(i)) {
        return QueueFamilyIndices {
            graphics_family: Some(both as u32),
            present_family: Some(both as u32),
        };
    }

    QueueFamilyIndices {
        graphics_family: (0..families.len()).find(|&i| graphics(i)).map(|i| i as u32),
        present_family: (0..families.len()).find(|&i| present(i)).map(|i| i as u32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_queue_family_indices_default() {
        let indices = QueueFamilyIndices::default();
        assert!(!indices.is_complete());
        assert!(!indices.is_shared());
        assert!(indices.unique_families().is_empty());
    }

    #[test]
    fn test_unique_families_dedups_shared_family() {
        let indices = QueueFamilyIndices {
            graphics_family: Some(0),
            present_family: Some(0),
        };
        assert!(indices.is_shared());
        assert_eq!(indices.unique_families(), vec![0]);
    }

    #[test]
    fn test_unique_families_distinct() {
        let indices = QueueFamilyIndices {
            graphics_family: Some(0),
            present_family: Some(2),
        };
        assert!(!indices.is_shared());
        assert_eq!(indices.unique_families(), vec![0, 2]);
    }

    #[test]
    fn test_discrete_beats_integrated_regardless_of_dimension() {
        let discrete = DeviceScore::new(vk::PhysicalDeviceType::DISCRETE_GPU, 8192);
        let integrated = DeviceScore::new(vk::PhysicalDeviceType::INTEGRATED_GPU, 32768);
        assert!(discrete > integrated);
    }

    #[test]
    fn test_dimension_breaks_ties() {
        let small = DeviceScore::new(vk::PhysicalDeviceType::DISCRETE_GPU, 8192);
        let large = DeviceScore::new(vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        assert!(large > small);
    }

    #[test]
    fn test_prefers_family_with_graphics_and_present() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS),
        ];
        let indices = pick_queue_families(&families, &[false, true, true]);
        assert_eq!(indices.graphics_family, Some(2));
        assert_eq!(indices.present_family, Some(2));
    }

    #[test]
    fn test_split_families_when_no_single_family_fits() {
        let families = [family(vk::QueueFlags::GRAPHICS), family(vk::QueueFlags::TRANSFER)];
        let indices = pick_queue_families(&families, &[false, true]);
        assert_eq!(indices.graphics_family, Some(0));
        assert_eq!(indices.present_family, Some(1));
        assert!(!indices.is_shared());
    }

    #[test]
    fn test_missing_present_is_incomplete() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let indices = pick_queue_families(&families, &[false]);
        assert!(!indices.is_complete());
    }

    #[test]
    fn test_missing_extension() {
        let available = [ash::khr::swapchain::NAME];
        assert_eq!(
            missing_extension(&available, DEVICE_EXTENSIONS),
            Some(ash::khr::dynamic_rendering::NAME)
        );
        let all = [ash::khr::swapchain::NAME, ash::khr::dynamic_rendering::NAME];
        assert_eq!(missing_extension(&all, DEVICE_EXTENSIONS), None);
    }
}
