//! GPU buffer management.
//!
//! This module handles vertex, index, uniform, storage, staging and readback
//! buffers. Memory comes from gpu-allocator, which handles suballocation and
//! memory type selection.
//!
//! # Overview
//!
//! - [`BufferUsage`] defines how a buffer will be used and where it lives
//! - [`Buffer`] wraps VkBuffer with gpu-allocator managed memory
//! - [`check_write_range`] is the one bounds check every host write goes through
//!
//! Static data reaches device-local memory through [`Buffer::new_device_local`]:
//!
//! 1. create a host-visible staging buffer sized to the data
//! 2. copy the data into the mapped staging memory
//! 3. record a buffer-to-buffer copy
//! 4. record a barrier from transfer-write to the consumer's access
//! 5. submit and wait
//! 6. release the staging buffer
//!
//! Every intermediate object is an owning value, so an error at any step
//! releases whatever was already created.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ember_rhi::buffer::{Buffer, BufferUsage};
//! use ember_rhi::command::TransferContext;
//!
//! # fn example(transfer: &TransferContext) -> ember_rhi::RhiResult<()> {
//! let vertices: [f32; 6] = [0.0, 0.5, -0.5, -0.5, 0.5, -0.5];
//! let vertex_buffer = Buffer::new_device_local(
//!     transfer,
//!     BufferUsage::Vertex,
//!     bytemuck::cast_slice(&vertices),
//! )?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use tracing::{debug, error};

use crate::command::TransferContext;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Buffer usage type.
///
/// Defines the intended use of the buffer, which affects Vulkan usage flags,
/// memory location and the barrier issued after an upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// Vertex buffer - stores vertex data
    Vertex,
    /// Index buffer - stores index data
    Index,
    /// Uniform buffer - host-written every frame
    Uniform,
    /// Storage buffer - read and written by shaders
    Storage,
    /// Storage buffer a compute pass writes and a draw then reads as vertices
    StorageVertex,
    /// Staging buffer - CPU-writable transfer source
    Staging,
    /// Readback buffer - CPU-readable transfer destination
    Readback,
}

impl BufferUsage {
    /// Converts to Vulkan buffer usage flags.
    ///
    /// Device-local usages are also transfer sources so their contents can be
    /// copied back for inspection.
    pub fn to_vk_usage(self) -> vk::BufferUsageFlags {
        let device_local = vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC;
        match self {
            BufferUsage::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER | device_local,
            BufferUsage::Index => vk::BufferUsageFlags::INDEX_BUFFER | device_local,
            BufferUsage::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            BufferUsage::Storage => vk::BufferUsageFlags::STORAGE_BUFFER | device_local,
            BufferUsage::StorageVertex => {
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::VERTEX_BUFFER
                    | device_local
            }
            BufferUsage::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
            BufferUsage::Readback => vk::BufferUsageFlags::TRANSFER_DST,
        }
    }

    /// Returns the memory location for this buffer type.
    pub fn memory_location(self) -> MemoryLocation {
        match self {
            BufferUsage::Vertex
            | BufferUsage::Index
            | BufferUsage::Storage
            | BufferUsage::StorageVertex => MemoryLocation::GpuOnly,
            // Written by the host every frame
            BufferUsage::Uniform | BufferUsage::Staging => MemoryLocation::CpuToGpu,
            BufferUsage::Readback => MemoryLocation::GpuToCpu,
        }
    }

    /// Pipeline stages and access that consume the buffer after an upload.
    pub fn consumer_masks(self) -> (vk::PipelineStageFlags, vk::AccessFlags) {
        match self {
            BufferUsage::Vertex => (
                vk::PipelineStageFlags::VERTEX_INPUT,
                vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
            ),
            BufferUsage::Index => (
                vk::PipelineStageFlags::VERTEX_INPUT,
                vk::AccessFlags::INDEX_READ,
            ),
            BufferUsage::Uniform => (
                vk::PipelineStageFlags::VERTEX_SHADER
                    | vk::PipelineStageFlags::FRAGMENT_SHADER
                    | vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::AccessFlags::UNIFORM_READ,
            ),
            BufferUsage::Storage => (
                vk::PipelineStageFlags::COMPUTE_SHADER
                    | vk::PipelineStageFlags::VERTEX_SHADER
                    | vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            ),
            BufferUsage::StorageVertex => (
                vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::VERTEX_INPUT,
                vk::AccessFlags::SHADER_READ
                    | vk::AccessFlags::SHADER_WRITE
                    | vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
            ),
            BufferUsage::Staging | BufferUsage::Readback => {
                (vk::PipelineStageFlags::HOST, vk::AccessFlags::HOST_READ)
            }
        }
    }

    /// Returns a human-readable name for the buffer type.
    pub fn name(self) -> &'static str {
        match self {
            BufferUsage::Vertex => "vertex",
            BufferUsage::Index => "index",
            BufferUsage::Uniform => "uniform",
            BufferUsage::Storage => "storage",
            BufferUsage::StorageVertex => "storage-vertex",
            BufferUsage::Staging => "staging",
            BufferUsage::Readback => "readback",
        }
    }
}

/// Validates that `len` bytes at `offset` fit in a buffer of `capacity` bytes.
///
/// # Errors
///
/// Returns [`RhiError::BufferOutOfBounds`] when `offset + len > capacity`,
/// including when the sum overflows.
pub fn check_write_range(offset: u64, len: u64, capacity: u64) -> RhiResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(RhiError::BufferOutOfBounds {
            offset,
            size: len,
            capacity,
        }),
    }
}

/// GPU buffer wrapper with managed memory.
///
/// Dropping the buffer frees its allocation and destroys the handle. Callers
/// drain the GPU first; the renderer does this in `wait_for_gpu` before
/// releasing resources.
pub struct Buffer {
    device: Arc<Device>,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
    usage: BufferUsage,
}

impl Buffer {
    /// Creates a new buffer with the specified size.
    ///
    /// # Arguments
    ///
    /// * `device` - The logical device
    /// * `usage` - The intended buffer usage
    /// * `size` - Buffer size in bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the size is zero or buffer/memory allocation fails.
    pub fn new(device: Arc<Device>, usage: BufferUsage, size: vk::DeviceSize) -> RhiResult<Self> {
        if size == 0 {
            return Err(RhiError::InvalidHandle(
                "Buffer size must be greater than 0".to_string(),
            ));
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage.to_vk_usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.handle().create_buffer(&buffer_info, None)? };
        let requirements = unsafe { device.handle().get_buffer_memory_requirements(buffer) };

        let allocation = device.allocator().lock().allocate(&AllocationCreateDesc {
            name: usage.name(),
            requirements,
            location: usage.memory_location(),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.handle().destroy_buffer(buffer, None) };
                return Err(e.into());
            }
        };

        // From here on Drop releases both the handle and the allocation.
        let buffer = Self {
            device,
            buffer,
            allocation: Some(allocation),
            size,
            usage,
        };

        if let Some(allocation) = buffer.allocation.as_ref() {
            unsafe {
                buffer.device.handle().bind_buffer_memory(
                    buffer.buffer,
                    allocation.memory(),
                    allocation.offset(),
                )?;
            }
        }

        debug!("Created {} buffer: {} bytes", usage.name(), size);
        Ok(buffer)
    }

    /// Creates a host-visible buffer and fills it with `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if creation fails or `usage` is not host-visible.
    pub fn new_with_data(device: Arc<Device>, usage: BufferUsage, data: &[u8]) -> RhiResult<Self> {
        let buffer = Self::new(device, usage, data.len() as vk::DeviceSize)?;
        buffer.write_data(0, data)?;
        Ok(buffer)
    }

    /// Creates a device-local buffer holding `data` through a staging upload.
    ///
    /// Blocks until the copy has completed. The staging buffer is destroyed
    /// before this returns, on success and on every error path.
    ///
    /// # Errors
    ///
    /// Returns an error if any buffer creation, the copy submission or the
    /// wait fails.
    pub fn new_device_local(
        transfer: &TransferContext,
        usage: BufferUsage,
        data: &[u8],
    ) -> RhiResult<Self> {
        let device = transfer.device().clone();
        let size = data.len() as vk::DeviceSize;

        let staging = Self::new(device.clone(), BufferUsage::Staging, size)?;
        staging.write_data(0, data)?;

        let buffer = Self::new(device, usage, size)?;
        let (dst_stage, dst_access) = usage.consumer_masks();

        transfer.immediate(|cmd| {
            cmd.copy_buffer(
                staging.handle(),
                buffer.handle(),
                &[vk::BufferCopy::default().size(size)],
            );
            let barrier = vk::BufferMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(dst_access)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(buffer.handle())
                .size(vk::WHOLE_SIZE);
            cmd.buffer_barrier(vk::PipelineStageFlags::TRANSFER, dst_stage, &[barrier]);
            Ok(())
        })?;

        drop(staging);
        debug!("Uploaded {} bytes into device-local {} buffer", size, usage.name());
        Ok(buffer)
    }

    /// Copies the buffer's contents back to host memory.
    ///
    /// Used to verify uploads; blocks until the copy completes.
    ///
    /// # Errors
    ///
    /// Returns an error if the readback buffer cannot be created or the copy
    /// fails.
    pub fn read_back(&self, transfer: &TransferContext) -> RhiResult<Vec<u8>> {
        let readback = Self::new(self.device.clone(), BufferUsage::Readback, self.size)?;

        transfer.immediate(|cmd| {
            cmd.copy_buffer(
                self.buffer,
                readback.handle(),
                &[vk::BufferCopy::default().size(self.size)],
            );
            let barrier = vk::BufferMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::HOST_READ)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(readback.handle())
                .size(vk::WHOLE_SIZE);
            cmd.buffer_barrier(
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::HOST,
                &[barrier],
            );
            Ok(())
        })?;

        readback.read_data()
    }

    /// Writes data to the buffer at the specified offset.
    ///
    /// The range is checked before any byte is written.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::BufferOutOfBounds`] if the write would exceed the
    /// buffer, or [`RhiError::NotMapped`] for device-local memory.
    pub fn write_data(&self, offset: vk::DeviceSize, data: &[u8]) -> RhiResult<()> {
        check_write_range(offset, data.len() as u64, self.size)?;
        if data.is_empty() {
            return Ok(());
        }

        let mapped_ptr = self
            .allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .ok_or(RhiError::NotMapped)?;

        unsafe {
            let dst = mapped_ptr.as_ptr().cast::<u8>().add(offset as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }

        Ok(())
    }

    /// Reads the whole buffer from host-visible memory.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::NotMapped`] for device-local memory.
    pub fn read_data(&self) -> RhiResult<Vec<u8>> {
        let slice = self
            .allocation
            .as_ref()
            .and_then(Allocation::mapped_slice)
            .ok_or(RhiError::NotMapped)?;
        Ok(slice[..self.size as usize].to_vec())
    }

    /// Returns true if the memory is host-visible and mapped.
    pub fn is_mapped(&self) -> bool {
        self.allocation
            .as_ref()
            .is_some_and(|a| a.mapped_ptr().is_some())
    }

    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // Free allocation first, then destroy buffer
        if let Some(allocation) = self.allocation.take()
            && let Err(e) = self.device.allocator().lock().free(allocation)
        {
            error!("Failed to free buffer allocation: {:?}", e);
        }

        unsafe {
            self.device.handle().destroy_buffer(self.buffer, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_usage_to_vk_usage() {
        assert!(
            BufferUsage::Vertex
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST)
        );
        assert!(
            BufferUsage::Index
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::INDEX_BUFFER)
        );
        assert!(
            BufferUsage::Uniform
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::UNIFORM_BUFFER)
        );
        assert!(
            BufferUsage::StorageVertex
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::VERTEX_BUFFER)
        );
        assert_eq!(
            BufferUsage::Staging.to_vk_usage(),
            vk::BufferUsageFlags::TRANSFER_SRC
        );
        assert_eq!(
            BufferUsage::Readback.to_vk_usage(),
            vk::BufferUsageFlags::TRANSFER_DST
        );
    }

    #[test]
    fn test_buffer_usage_memory_location() {
        assert_eq!(BufferUsage::Vertex.memory_location(), MemoryLocation::GpuOnly);
        assert_eq!(BufferUsage::Index.memory_location(), MemoryLocation::GpuOnly);
        assert_eq!(BufferUsage::Storage.memory_location(), MemoryLocation::GpuOnly);
        assert_eq!(BufferUsage::Uniform.memory_location(), MemoryLocation::CpuToGpu);
        assert_eq!(BufferUsage::Staging.memory_location(), MemoryLocation::CpuToGpu);
        assert_eq!(BufferUsage::Readback.memory_location(), MemoryLocation::GpuToCpu);
    }

    #[test]
    fn test_consumer_masks_follow_usage() {
        let (stage, access) = BufferUsage::Vertex.consumer_masks();
        assert_eq!(stage, vk::PipelineStageFlags::VERTEX_INPUT);
        assert_eq!(access, vk::AccessFlags::VERTEX_ATTRIBUTE_READ);

        let (stage, access) = BufferUsage::Storage.consumer_masks();
        assert!(stage.contains(vk::PipelineStageFlags::COMPUTE_SHADER));
        assert!(access.contains(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE));
    }

    #[test]
    fn test_write_range_accepts_exact_fit() {
        assert!(check_write_range(0, 64, 64).is_ok());
        assert!(check_write_range(60, 4, 64).is_ok());
        assert!(check_write_range(64, 0, 64).is_ok());
    }

    #[test]
    fn test_write_range_rejects_one_past_end() {
        let size = 64;
        match check_write_range(size - 1, 2, size) {
            Err(RhiError::BufferOutOfBounds {
                offset,
                size: len,
                capacity,
            }) => {
                assert_eq!((offset, len, capacity), (63, 2, 64));
            }
            other => panic!("expected BufferOutOfBounds, got {other:?}"),
        }
    }

    #[test]
    fn test_write_range_rejects_overflow() {
        assert!(check_write_range(u64::MAX, 1, u64::MAX).is_err());
    }

    #[test]
    fn test_buffer_usage_name() {
        assert_eq!(BufferUsage::Vertex.name(), "vertex");
        assert_eq!(BufferUsage::StorageVertex.name(), "storage-vertex");
        assert_eq!(BufferUsage::Readback.name(), "readback");
    }
}
