//! Per-frame uniform buffers.
//!
//! A [`UniformBufferSet`] holds one host-visible uniform buffer per frame in
//! flight. The host only ever writes the slot whose fence has just been
//! waited on, so the GPU never reads a uniform block while it is being
//! updated.
//!
//! gpu-allocator keeps host-visible blocks persistently mapped;
//! [`UniformBufferSet::map_all`] verifies that every buffer has a host
//! pointer and enables [`UniformBufferSet::write_to_mapped`]. There is no
//! per-update map/unmap.

use std::sync::Arc;

use ash::vk;

use crate::buffer::{Buffer, BufferUsage, check_write_range};
use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// One uniform buffer per frame in flight, all of the same size.
pub struct UniformBufferSet {
    buffers: Vec<Buffer>,
    size: vk::DeviceSize,
    mapped: bool,
}

impl UniformBufferSet {
    /// Creates `frames` uniform buffers of `size` bytes each.
    ///
    /// # Errors
    ///
    /// Returns an error if any buffer creation fails; buffers created before
    /// the failure are released.
    pub fn new(device: Arc<Device>, size: vk::DeviceSize, frames: usize) -> RhiResult<Self> {
        let buffers = (0..frames)
            .map(|_| Buffer::new(device.clone(), BufferUsage::Uniform, size))
            .collect::<RhiResult<Vec<_>>>()?;

        Ok(Self {
            buffers,
            size,
            mapped: false,
        })
    }

    /// Enables host writes to every frame's buffer.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::NotMapped`] if any buffer has no host pointer.
    pub fn map_all(&mut self) -> RhiResult<()> {
        if self.buffers.iter().all(Buffer::is_mapped) {
            self.mapped = true;
            Ok(())
        } else {
            Err(RhiError::NotMapped)
        }
    }

    /// Writes `bytes` at `offset` into `frame`'s buffer.
    ///
    /// # Errors
    ///
    /// Fails without writing if the set is not mapped, `frame` is out of
    /// range, or `offset + bytes.len()` exceeds the buffer size.
    pub fn write_to_mapped(&self, frame: usize, offset: u64, bytes: &[u8]) -> RhiResult<()> {
        validate_write(self.mapped, frame, self.buffers.len(), offset, bytes.len(), self.size)?;
        self.buffers[frame].write_data(offset, bytes)
    }

    /// Returns `frame`'s buffer.
    pub fn buffer(&self, frame: usize) -> RhiResult<&Buffer> {
        self.buffers
            .get(frame)
            .ok_or_else(|| frame_out_of_range(frame, self.buffers.len()))
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        self.buffers.len()
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.mapped
    }
}

fn validate_write(
    mapped: bool,
    frame: usize,
    frames: usize,
    offset: u64,
    len: usize,
    size: u64,
) -> RhiResult<()> {
    if !mapped {
        return Err(RhiError::NotMapped);
    }
    if frame >= frames {
        return Err(frame_out_of_range(frame, frames));
    }
    check_write_range(offset, len as u64, size)
}

fn frame_out_of_range(frame: usize, frames: usize) -> RhiError {
    RhiError::InvalidHandle(format!(
        "uniform buffer frame {frame} out of range (0..{frames})"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmapped_set_rejects_writes() {
        assert!(matches!(
            validate_write(false, 0, 2, 0, 4, 64),
            Err(RhiError::NotMapped)
        ));
    }

    #[test]
    fn test_frame_index_checked() {
        assert!(validate_write(true, 1, 2, 0, 4, 64).is_ok());
        assert!(matches!(
            validate_write(true, 2, 2, 0, 4, 64),
            Err(RhiError::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_write_past_end_rejected() {
        assert!(validate_write(true, 0, 2, 48, 16, 64).is_ok());
        assert!(matches!(
            validate_write(true, 0, 2, 63, 2, 64),
            Err(RhiError::BufferOutOfBounds { .. })
        ));
    }
}
