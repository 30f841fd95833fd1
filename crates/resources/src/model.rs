//! Model resources: a mesh with one material per sub-mesh.
//!
//! ```toml
//! # ship.model.toml
//! mesh = "meshes/ship.obj"
//! materials = ["materials/hull.material.toml", "materials/glass.material.toml"]
//! ```
//!
//! Sub-mesh `i` uses `materials[i]`; sub-meshes past the end of the list
//! reuse the last material.

use std::fs;
use std::path::{Path, PathBuf};

use ember_renderer::{Backend, Renderer};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::error::{ResourceError, ResourceResult};
use crate::manager::ResourceManager;
use crate::material::MaterialResource;
use crate::mesh::MeshResource;
use crate::resource::{
    Loadable, Resource, ResourceHandle, ResourceHeader, ResourceKind, UploadStatus,
};
use crate::state::ResourceState;

/// Parsed `*.model.toml` with paths resolved against its directory.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelDescription {
    pub mesh: PathBuf,
    pub materials: Vec<PathBuf>,
}

impl ModelDescription {
    /// # Errors
    ///
    /// Returns [`ResourceError::Description`] for invalid TOML or an empty
    /// material list.
    pub fn parse(text: &str, path: &Path) -> ResourceResult<Self> {
        let invalid = |message: String| ResourceError::Description {
            path: path.to_path_buf(),
            message,
        };
        let mut description: Self = toml::from_str(text).map_err(|e| invalid(e.to_string()))?;
        if description.materials.is_empty() {
            return Err(invalid("a model needs at least one material".to_string()));
        }

        let dir = path.parent().unwrap_or(Path::new(""));
        description.mesh = dir.join(&description.mesh);
        for material in &mut description.materials {
            *material = dir.join(&*material);
        }
        Ok(description)
    }
}

/// Material slot used by sub-mesh `submesh` given `count` materials.
#[inline]
pub fn material_index(submesh: usize, count: usize) -> Option<usize> {
    count.checked_sub(1).map(|last| submesh.min(last))
}

struct LoadedModel {
    mesh: ResourceHandle<MeshResource>,
    materials: Vec<ResourceHandle<MaterialResource>>,
}

/// A drawable mesh with its materials.
pub struct ModelResource {
    header: ResourceHeader,
    loaded: Mutex<Option<LoadedModel>>,
}

impl ModelResource {
    pub fn mesh(&self) -> Option<ResourceHandle<MeshResource>> {
        self.loaded.lock().as_ref().map(|loaded| loaded.mesh.clone())
    }

    pub fn materials(&self) -> Vec<ResourceHandle<MaterialResource>> {
        self.loaded
            .lock()
            .as_ref()
            .map(|loaded| loaded.materials.clone())
            .unwrap_or_default()
    }

    /// Records every sub-mesh with its material.
    ///
    /// Returns `Ok(false)` without recording anything if the model or one of
    /// its parts is not on the GPU yet.
    ///
    /// # Errors
    ///
    /// Returns an error if a part was unloaded or the renderer rejects a bind
    /// or draw (for example outside the rendering scope).
    pub fn draw(&self, renderer: &mut Renderer) -> ResourceResult<bool> {
        if !self.header.is_on_gpu() {
            return Ok(false);
        }
        let Some(mesh) = self.mesh() else {
            return Ok(false);
        };
        let Some(gpu_mesh) = mesh.resolve()?.gpu() else {
            return Ok(false);
        };

        let materials = self
            .materials()
            .iter()
            .map(|handle| handle.resolve().map(|m| m.binding()))
            .collect::<ResourceResult<Vec<_>>>()?;
        let Some(bindings) = materials.into_iter().collect::<Option<Vec<_>>>() else {
            return Ok(false);
        };

        for submesh in 0..gpu_mesh.submeshes().len() {
            let Some(index) = material_index(submesh, bindings.len()) else {
                return Ok(false);
            };
            let binding = &bindings[index];
            renderer.bind_shader(&binding.program())?;
            renderer.bind_material(binding)?;
            renderer.draw_vertex_sub_mesh(&gpu_mesh, submesh)?;
        }
        Ok(true)
    }
}

fn part_ready(header: &ResourceHeader) -> ResourceResult<bool> {
    match header.state() {
        ResourceState::OnGpu => Ok(true),
        ResourceState::Failed => Err(ResourceError::Load {
            path: header.path().to_path_buf(),
            message: "model part failed to load".to_string(),
        }),
        _ => Ok(false),
    }
}

impl Resource for ModelResource {
    fn header(&self) -> &ResourceHeader {
        &self.header
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Model
    }

    fn load(&self, manager: &ResourceManager) -> ResourceResult<()> {
        let path = self.header.path();
        let description = ModelDescription::parse(&fs::read_to_string(path)?, path)?;

        let mesh = manager.load::<MeshResource>(&description.mesh)?;
        let materials = description
            .materials
            .iter()
            .map(|material| manager.load::<MaterialResource>(material))
            .collect::<ResourceResult<Vec<_>>>()?;

        *self.loaded.lock() = Some(LoadedModel { mesh, materials });
        Ok(())
    }

    /// A model owns no GPU objects itself; it is ready when its parts are.
    fn send_to_gpu(&self, _backend: &Backend) -> ResourceResult<UploadStatus> {
        let loaded = self.loaded.lock();
        let Some(loaded) = loaded.as_ref() else {
            return Err(ResourceError::Load {
                path: self.header.path().to_path_buf(),
                message: "model description missing at upload".to_string(),
            });
        };

        if !part_ready(loaded.mesh.resolve()?.header())? {
            return Ok(UploadStatus::NotReady);
        }
        for material in &loaded.materials {
            if !part_ready(material.resolve()?.header())? {
                return Ok(UploadStatus::NotReady);
            }
        }
        Ok(UploadStatus::Uploaded)
    }
}

impl Loadable for ModelResource {
    const KIND: ResourceKind = ResourceKind::Model;

    fn from_header(header: ResourceHeader) -> Self {
        Self {
            header,
            loaded: Mutex::new(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_material_index_reuses_last() {
        assert_eq!(material_index(0, 2), Some(0));
        assert_eq!(material_index(1, 2), Some(1));
        assert_eq!(material_index(5, 2), Some(1));
        assert_eq!(material_index(0, 0), None);
    }

    #[test]
    fn test_description_paths_are_relative() {
        let text = "mesh = \"ship.obj\"\nmaterials = [\"a.material.toml\", \"../b.material.toml\"]\n";
        let description = ModelDescription::parse(text, Path::new("/game/models/ship.model.toml")).unwrap();
        assert_eq!(description.mesh, PathBuf::from("/game/models/ship.obj"));
        assert_eq!(
            description.materials[1],
            PathBuf::from("/game/models/../b.material.toml")
        );
    }

    #[test]
    fn test_description_requires_materials() {
        assert!(ModelDescription::parse("mesh = \"a.obj\"\nmaterials = []\n", Path::new("m")).is_err());
        assert!(ModelDescription::parse("materials = [\"m\"]\n", Path::new("m")).is_err());
    }
}
