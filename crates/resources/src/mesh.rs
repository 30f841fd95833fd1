//! Mesh resources loaded from Wavefront OBJ files or built in memory.

use std::path::Path;
use std::sync::Arc;

use ember_renderer::{Backend, GpuMesh, MeshData, SubMesh};
use ember_rhi::vertex::Vertex;
use glam::{Vec2, Vec3, Vec4};
use parking_lot::{Mutex, RwLock};

use crate::error::{ResourceError, ResourceResult};
use crate::manager::ResourceManager;
use crate::resource::{Loadable, Resource, ResourceHeader, ResourceKind, UploadStatus};

/// Vertex and index data, one sub-mesh per OBJ object.
pub struct MeshResource {
    header: ResourceHeader,
    data: Mutex<Option<MeshData>>,
    gpu: RwLock<Option<Arc<GpuMesh>>>,
}

impl MeshResource {
    /// Wraps already built mesh data; loading only validates it.
    pub fn from_data(header: ResourceHeader, data: MeshData) -> Self {
        Self {
            header,
            data: Mutex::new(Some(data)),
            gpu: RwLock::new(None),
        }
    }

    /// GPU buffers, once uploaded.
    pub fn gpu(&self) -> Option<Arc<GpuMesh>> {
        self.gpu.read().clone()
    }

    /// CPU-side copy. Released after a GPU upload.
    pub fn data(&self) -> Option<MeshData> {
        self.data.lock().clone()
    }

    /// Number of drawable sub-meshes known so far.
    pub fn submesh_count(&self) -> usize {
        if let Some(gpu) = self.gpu.read().as_ref() {
            return gpu.submeshes().len();
        }
        self.data
            .lock()
            .as_ref()
            .map_or(0, |data| data.submeshes.len())
    }
}

impl Resource for MeshResource {
    fn header(&self) -> &ResourceHeader {
        &self.header
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Mesh
    }

    fn load(&self, _manager: &ResourceManager) -> ResourceResult<()> {
        let mut data = self.data.lock();
        let mesh = match data.take() {
            Some(mesh) => mesh,
            None => load_obj(self.header.path())?,
        };
        mesh.validate()?;
        *data = Some(mesh);
        Ok(())
    }

    fn send_to_gpu(&self, backend: &Backend) -> ResourceResult<UploadStatus> {
        let Backend::Vulkan(context) = backend else {
            return Ok(UploadStatus::Uploaded);
        };

        let mut data = self.data.lock();
        if self.gpu.read().is_some() {
            return Ok(UploadStatus::Uploaded);
        }
        let Some(mesh) = data.as_ref() else {
            return Err(ResourceError::Load {
                path: self.header.path().to_path_buf(),
                message: "mesh data missing at upload".to_string(),
            });
        };
        let gpu = GpuMesh::upload(context.transfer(), mesh)?;
        *self.gpu.write() = Some(Arc::new(gpu));
        *data = None;
        Ok(UploadStatus::Uploaded)
    }

    fn is_resident(&self) -> bool {
        self.gpu.read().is_some()
    }
}

impl Loadable for MeshResource {
    const KIND: ResourceKind = ResourceKind::Mesh;

    fn from_header(header: ResourceHeader) -> Self {
        Self {
            header,
            data: Mutex::new(None),
            gpu: RwLock::new(None),
        }
    }
}

fn load_obj(path: &Path) -> ResourceResult<MeshData> {
    let options = tobj::LoadOptions {
        triangulate: true,
        single_index: true,
        ..Default::default()
    };
    let (models, _materials) = tobj::load_obj(path, &options).map_err(|e| ResourceError::Load {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(mesh_from_models(&models))
}

/// Flattens OBJ objects into one vertex/index array with a sub-mesh each.
///
/// Missing normals default to +Z, missing texture coordinates to zero and
/// missing vertex colors to white. Texture V is flipped to Vulkan's
/// top-left origin.
pub fn mesh_from_models(models: &[tobj::Model]) -> MeshData {
    let mut vertices = Vec::new();
    let mut indices = Vec::new();
    let mut submeshes = Vec::with_capacity(models.len());

    for model in models {
        let mesh = &model.mesh;
        let base = vertices.len() as u32;
        let first_index = indices.len() as u32;
        let count = mesh.positions.len() / 3;

        for i in 0..count {
            let position = Vec3::new(
                mesh.positions[3 * i],
                mesh.positions[3 * i + 1],
                mesh.positions[3 * i + 2],
            );
            let normal = if mesh.normals.len() >= 3 * (i + 1) {
                Vec3::new(
                    mesh.normals[3 * i],
                    mesh.normals[3 * i + 1],
                    mesh.normals[3 * i + 2],
                )
            } else {
                Vec3::Z
            };
            let tex_coord = if mesh.texcoords.len() >= 2 * (i + 1) {
                Vec2::new(mesh.texcoords[2 * i], 1.0 - mesh.texcoords[2 * i + 1])
            } else {
                Vec2::ZERO
            };
            let color = if mesh.vertex_color.len() >= 3 * (i + 1) {
                Vec4::new(
                    mesh.vertex_color[3 * i],
                    mesh.vertex_color[3 * i + 1],
                    mesh.vertex_color[3 * i + 2],
                    1.0,
                )
            } else {
                Vec4::ONE
            };
            vertices.push(Vertex::new(position, normal, tex_coord, color));
        }

        indices.extend(mesh.indices.iter().map(|&i| base + i));
        submeshes.push(SubMesh::new(
            model.name.clone(),
            first_index,
            mesh.indices.len() as u32,
        ));
    }

    MeshData {
        vertices,
        indices,
        submeshes,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    const TWO_OBJECTS: &str = "\
o tri
v 0 0 0
v 1 0 0
v 0 1 0
vt 0 0
vt 1 0
vt 0 1
f 1/1 2/2 3/3
o quad
v 0 0 1
v 1 0 1
v 1 1 1
v 0 1 1
f 4 5 6 7
";

    fn parse(text: &str) -> Vec<tobj::Model> {
        let options = tobj::LoadOptions {
            triangulate: true,
            single_index: true,
            ..Default::default()
        };
        let (models, _) =
            tobj::load_obj_buf(&mut Cursor::new(text), &options, |_| Ok(Default::default()))
                .unwrap();
        models
    }

    #[test]
    fn test_one_submesh_per_object() {
        let mesh = mesh_from_models(&parse(TWO_OBJECTS));
        assert_eq!(mesh.submeshes.len(), 2);
        assert_eq!(mesh.submeshes[0].name, "tri");
        assert_eq!(mesh.submeshes[0].first_index, 0);
        assert_eq!(mesh.submeshes[0].index_count, 3);
        assert_eq!(mesh.submeshes[1].first_index, 3);
        assert_eq!(mesh.submeshes[1].index_count, 6);
        assert!(mesh.validate().is_ok());
    }

    #[test]
    fn test_indices_are_offset_into_shared_vertex_array() {
        let mesh = mesh_from_models(&parse(TWO_OBJECTS));
        let quad = &mesh.indices[3..];
        assert!(quad.iter().all(|&i| i >= 3));
        assert_eq!(mesh.vertices[quad[0] as usize].position.z, 1.0);
    }

    #[test]
    fn test_defaults_and_v_flip() {
        let mesh = mesh_from_models(&parse(TWO_OBJECTS));
        let top = mesh
            .vertices
            .iter()
            .find(|v| v.position == Vec3::new(0.0, 1.0, 0.0))
            .unwrap();
        assert_eq!(top.tex_coord, Vec2::new(0.0, 0.0));
        assert_eq!(top.normal, Vec3::Z);
        assert_eq!(top.color, Vec4::ONE);
    }

    #[test]
    fn test_in_memory_mesh_uploads_headless() {
        let header = ResourceHeader::new(uuid::Uuid::nil(), "/mem/triangle".into());
        let mesh = MeshResource::from_data(header, MeshData::triangle());
        assert_eq!(mesh.submesh_count(), 1);
        assert_eq!(
            mesh.send_to_gpu(&Backend::Headless).unwrap(),
            UploadStatus::Uploaded
        );
        assert!(mesh.gpu().is_none());
        assert!(mesh.data().is_some());

        // A second upload changes nothing.
        assert_eq!(
            mesh.send_to_gpu(&Backend::Headless).unwrap(),
            UploadStatus::Uploaded
        );
        assert_eq!(mesh.submesh_count(), 1);
    }
}
