//! CPU mesh data and its device-local GPU counterpart.

use std::ops::Range;

use glam::{Vec2, Vec3, Vec4};
use tracing::debug;

use ember_rhi::buffer::{Buffer, BufferUsage};
use ember_rhi::command::TransferContext;
use ember_rhi::vertex::Vertex;

use crate::error::{RenderError, RenderResult};
use crate::next_object_id;

/// A drawable index range inside a mesh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubMesh {
    pub name: String,
    pub first_index: u32,
    pub index_count: u32,
    /// Added to every index before fetching the vertex.
    pub vertex_offset: i32,
}

impl SubMesh {
    pub fn new(name: impl Into<String>, first_index: u32, index_count: u32) -> Self {
        Self {
            name: name.into(),
            first_index,
            index_count,
            vertex_offset: 0,
        }
    }

    fn index_range(&self) -> Range<usize> {
        let start = self.first_index as usize;
        start..start + self.index_count as usize
    }
}

/// Plain vertex and index arrays produced by the asset loaders.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub submeshes: Vec<SubMesh>,
}

impl MeshData {
    /// Creates mesh data with a single sub-mesh covering every index.
    pub fn new(vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
        let submeshes = vec![SubMesh::new("default", 0, indices.len() as u32)];
        Self {
            vertices,
            indices,
            submeshes,
        }
    }

    /// A single colored triangle in clip space.
    pub fn triangle() -> Self {
        let vertex = |x: f32, y: f32, color: Vec4| {
            Vertex::new(Vec3::new(x, y, 0.0), Vec3::Z, Vec2::new(x, y), color)
        };
        Self::new(
            vec![
                vertex(0.0, -0.5, Vec4::new(1.0, 0.0, 0.0, 1.0)),
                vertex(0.5, 0.5, Vec4::new(0.0, 1.0, 0.0, 1.0)),
                vertex(-0.5, 0.5, Vec4::new(0.0, 0.0, 1.0, 1.0)),
            ],
            vec![0, 1, 2],
        )
    }

    /// Checks that the data can be uploaded and drawn.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::InvalidData`] for empty arrays, a sub-mesh
    /// outside the index array, or an index that does not address a vertex
    /// once its sub-mesh's `vertex_offset` is added.
    pub fn validate(&self) -> RenderResult<()> {
        if self.vertices.is_empty() || self.indices.is_empty() {
            return Err(RenderError::InvalidData(
                "mesh has no vertices or no indices".to_string(),
            ));
        }

        let vertex_count = self.vertices.len();
        if self.submeshes.is_empty()
            && let Some(bad) = self.indices.iter().find(|&&i| i as usize >= vertex_count)
        {
            return Err(RenderError::InvalidData(format!(
                "index {bad} out of range for {vertex_count} vertices"
            )));
        }

        for submesh in &self.submeshes {
            let Some(indices) = self.indices.get(submesh.index_range()) else {
                return Err(RenderError::InvalidData(format!(
                    "sub-mesh '{}' covers indices {:?} but the mesh has {}",
                    submesh.name,
                    submesh.index_range(),
                    self.indices.len()
                )));
            };

            // The GPU fetches vertex `index + vertex_offset`.
            let addressable = 0..vertex_count as i64;
            if let Some(bad) = indices
                .iter()
                .find(|&&i| !addressable.contains(&(i64::from(i) + i64::from(submesh.vertex_offset))))
            {
                return Err(RenderError::InvalidData(format!(
                    "sub-mesh '{}': index {bad} with vertex offset {} out of range for {vertex_count} vertices",
                    submesh.name, submesh.vertex_offset
                )));
            }
        }
        Ok(())
    }

    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

/// Device-local vertex and index buffers plus sub-mesh ranges.
pub struct GpuMesh {
    id: u64,
    vertex_buffer: Buffer,
    index_buffer: Buffer,
    submeshes: Vec<SubMesh>,
    vertex_count: u32,
    index_count: u32,
}

impl GpuMesh {
    /// Uploads `data` through staging buffers.
    ///
    /// Blocks until both copies have completed.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is invalid or an upload fails; nothing
    /// is leaked on failure.
    pub fn upload(transfer: &TransferContext, data: &MeshData) -> RenderResult<Self> {
        data.validate()?;

        let vertex_buffer = Buffer::new_device_local(
            transfer,
            BufferUsage::Vertex,
            bytemuck::cast_slice(&data.vertices),
        )?;
        let index_buffer = Buffer::new_device_local(
            transfer,
            BufferUsage::Index,
            bytemuck::cast_slice(&data.indices),
        )?;

        debug!(
            "Mesh uploaded: {} vertices, {} indices, {} sub-mesh(es)",
            data.vertices.len(),
            data.indices.len(),
            data.submeshes.len()
        );

        Ok(Self {
            id: next_object_id(),
            vertex_buffer,
            index_buffer,
            submeshes: data.submeshes.clone(),
            vertex_count: data.vertices.len() as u32,
            index_count: data.indices.len() as u32,
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn vertex_buffer(&self) -> &Buffer {
        &self.vertex_buffer
    }

    #[inline]
    pub fn index_buffer(&self) -> &Buffer {
        &self.index_buffer
    }

    #[inline]
    pub fn submeshes(&self) -> &[SubMesh] {
        &self.submeshes
    }

    /// Returns sub-mesh `index`.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::SubMeshOutOfRange`] for an invalid index.
    pub fn submesh(&self, index: usize) -> RenderResult<&SubMesh> {
        self.submeshes
            .get(index)
            .ok_or(RenderError::SubMeshOutOfRange {
                index,
                count: self.submeshes.len(),
            })
    }

    #[inline]
    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    #[inline]
    pub fn index_count(&self) -> u32 {
        self.index_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triangle_is_valid() {
        let mesh = MeshData::triangle();
        mesh.validate().unwrap();
        assert_eq!(mesh.vertices.len(), 3);
        assert_eq!(mesh.indices, vec![0, 1, 2]);
        assert_eq!(mesh.submeshes.len(), 1);
        assert_eq!(mesh.submeshes[0].index_count, 3);
        assert_eq!(mesh.triangle_count(), 1);
    }

    #[test]
    fn test_empty_mesh_rejected() {
        let mesh = MeshData::new(Vec::new(), Vec::new());
        assert!(matches!(mesh.validate(), Err(RenderError::InvalidData(_))));
    }

    #[test]
    fn test_out_of_range_index_rejected() {
        let mut mesh = MeshData::triangle();
        mesh.indices[2] = 3;
        assert!(mesh.validate().is_err());
    }

    #[test]
    fn test_vertex_offset_counts_toward_range() {
        let mut mesh = MeshData::triangle();
        mesh.indices = vec![0, 1, 2, 0, 1, 1];
        mesh.submeshes = vec![SubMesh::new("base", 0, 3), SubMesh::new("shifted", 3, 3)];
        mesh.submeshes[1].vertex_offset = 1;
        mesh.validate().unwrap();

        // Index 1 plus offset 2 reaches vertex 3 of 3.
        mesh.submeshes[1].vertex_offset = 2;
        let err = mesh.validate().unwrap_err().to_string();
        assert!(err.contains("shifted"));

        mesh.submeshes[1].vertex_offset = -1;
        assert!(mesh.validate().is_err());
    }

    #[test]
    fn test_submesh_past_end_rejected() {
        let mut mesh = MeshData::triangle();
        mesh.submeshes.push(SubMesh::new("tail", 2, 3));
        let err = mesh.validate().unwrap_err().to_string();
        assert!(err.contains("tail"));
    }
}
