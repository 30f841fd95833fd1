//! Buffer barriers between compute passes and their consumers.
//!
//! A compute pass that writes a storage buffer must be followed by a barrier
//! whose destination stage and access match the next reader, or the reader
//! may observe stale data.

use ash::vk;

use ember_rhi::buffer::Buffer;

/// Stage and access masks for one buffer hazard.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BarrierMasks {
    pub src_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub dst_access: vk::AccessFlags,
}

/// Hazard following a compute write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComputeBarrier {
    /// The next compute pass reads or rewrites the buffer.
    WriteToWrite,
    /// The buffer is consumed as vertex input by a later draw.
    WriteToVertexRead,
}

impl ComputeBarrier {
    pub fn masks(self) -> BarrierMasks {
        match self {
            ComputeBarrier::WriteToWrite => BarrierMasks {
                src_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
                src_access: vk::AccessFlags::SHADER_WRITE,
                dst_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
                dst_access: vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            },
            ComputeBarrier::WriteToVertexRead => BarrierMasks {
                src_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
                src_access: vk::AccessFlags::SHADER_WRITE,
                dst_stage: vk::PipelineStageFlags::VERTEX_INPUT,
                dst_access: vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
            },
        }
    }

    /// Whole-buffer memory barrier for `buffer`.
    pub fn buffer_barrier(self, buffer: &Buffer) -> vk::BufferMemoryBarrier<'static> {
        let masks = self.masks();
        vk::BufferMemoryBarrier::default()
            .src_access_mask(masks.src_access)
            .dst_access_mask(masks.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(buffer.handle())
            .offset(0)
            .size(vk::WHOLE_SIZE)
    }
}

/// Number of workgroups needed to cover `items` with `local_size` threads each.
#[inline]
pub fn group_count(items: u32, local_size: u32) -> u32 {
    items.div_ceil(local_size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_to_write_masks() {
        let masks = ComputeBarrier::WriteToWrite.masks();
        assert_eq!(masks.src_stage, vk::PipelineStageFlags::COMPUTE_SHADER);
        assert_eq!(masks.dst_stage, vk::PipelineStageFlags::COMPUTE_SHADER);
        assert_eq!(masks.src_access, vk::AccessFlags::SHADER_WRITE);
        assert!(masks.dst_access.contains(vk::AccessFlags::SHADER_READ));
        assert!(masks.dst_access.contains(vk::AccessFlags::SHADER_WRITE));
    }

    #[test]
    fn test_write_to_vertex_read_masks() {
        let masks = ComputeBarrier::WriteToVertexRead.masks();
        assert_eq!(masks.dst_stage, vk::PipelineStageFlags::VERTEX_INPUT);
        assert_eq!(masks.dst_access, vk::AccessFlags::VERTEX_ATTRIBUTE_READ);
        assert!(!masks.dst_stage.contains(vk::PipelineStageFlags::COMPUTE_SHADER));
    }

    #[test]
    fn test_group_count_rounds_up() {
        assert_eq!(group_count(0, 64), 0);
        assert_eq!(group_count(64, 64), 1);
        assert_eq!(group_count(65, 64), 2);
        assert_eq!(group_count(10, 0), 10);
    }
}
