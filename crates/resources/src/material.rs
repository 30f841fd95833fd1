//! Material resources: a shader plus named attribute values.
//!
//! ```toml
//! # hull.material.toml
//! shader = "../shaders/lit.shader.toml"
//!
//! [attributes]
//! tint = [1.0, 0.8, 0.8, 1.0]     # vec2 / vec3 / vec4 by length, 16 = mat4
//! roughness = 0.5                 # float
//! layer = 2                       # int
//! albedo = "../textures/hull.png" # texture
//! ```
//!
//! Paths are relative to the material file. Loading requests the shader and
//! textures from the manager; the upload answers
//! [`UploadStatus::NotReady`] until all of them are on the GPU, then builds a
//! [`MaterialBinding`] for the shader's program and applies the values.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ember_renderer::{AttributeValue, Backend, MaterialBinding};
use glam::{Mat4, Vec2, Vec3, Vec4};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;

use crate::error::{ResourceError, ResourceResult};
use crate::manager::ResourceManager;
use crate::resource::{
    Loadable, Resource, ResourceHandle, ResourceHeader, ResourceKind, UploadStatus,
};
use crate::shader::ShaderResource;
use crate::state::ResourceState;
use crate::texture::TextureResource;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MaterialFile {
    shader: PathBuf,
    #[serde(default)]
    attributes: BTreeMap<String, toml::Value>,
}

/// An attribute as written in a material file.
#[derive(Clone, Debug, PartialEq)]
pub enum MaterialValue {
    Value(AttributeValue),
    /// Texture file, already resolved against the material's directory.
    Texture(PathBuf),
}

/// Parsed `*.material.toml` with paths resolved.
#[derive(Clone, Debug, PartialEq)]
pub struct MaterialDescription {
    pub shader: PathBuf,
    pub attributes: Vec<(String, MaterialValue)>,
}

impl MaterialDescription {
    /// Parses description text. Relative paths are joined to the directory
    /// of `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::Description`] for invalid TOML or an
    /// attribute value that maps to no attribute type.
    pub fn parse(text: &str, path: &Path) -> ResourceResult<Self> {
        let invalid = |message: String| ResourceError::Description {
            path: path.to_path_buf(),
            message,
        };
        let file: MaterialFile = toml::from_str(text).map_err(|e| invalid(e.to_string()))?;
        let dir = path.parent().unwrap_or(Path::new(""));

        let mut attributes = Vec::with_capacity(file.attributes.len());
        for (name, value) in file.attributes {
            let value = parse_value(&value, dir)
                .map_err(|message| invalid(format!("attribute '{name}': {message}")))?;
            attributes.push((name, value));
        }

        Ok(Self {
            shader: dir.join(file.shader),
            attributes,
        })
    }
}

fn parse_value(value: &toml::Value, dir: &Path) -> Result<MaterialValue, String> {
    let value = match value {
        toml::Value::Float(f) => AttributeValue::Float(*f as f32),
        toml::Value::Integer(i) => {
            let i = i32::try_from(*i).map_err(|_| format!("{i} does not fit an int"))?;
            AttributeValue::Int(i)
        }
        toml::Value::String(path) => return Ok(MaterialValue::Texture(dir.join(path))),
        toml::Value::Array(items) => {
            let mut floats = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    toml::Value::Float(f) => floats.push(*f as f32),
                    toml::Value::Integer(i) => floats.push(*i as f32),
                    other => return Err(format!("expected numbers, found {}", other.type_str())),
                }
            }
            match floats.len() {
                2 => AttributeValue::Vec2(Vec2::from_slice(&floats)),
                3 => AttributeValue::Vec3(Vec3::from_slice(&floats)),
                4 => AttributeValue::Vec4(Vec4::from_slice(&floats)),
                16 => AttributeValue::Mat4(Mat4::from_cols_slice(&floats)),
                n => return Err(format!("{n} components; expected 2, 3, 4 or 16")),
            }
        }
        other => return Err(format!("unsupported {} value", other.type_str())),
    };
    Ok(MaterialValue::Value(value))
}

enum Dependency {
    Value(AttributeValue),
    Texture(ResourceHandle<TextureResource>),
}

struct LoadedMaterial {
    shader: ResourceHandle<ShaderResource>,
    attributes: Vec<(String, Dependency)>,
}

/// A shader with attribute values, drawable once its binding exists.
pub struct MaterialResource {
    header: ResourceHeader,
    loaded: Mutex<Option<LoadedMaterial>>,
    overrides: Mutex<Vec<(String, AttributeValue)>>,
    binding: RwLock<Option<Arc<MaterialBinding>>>,
}

impl MaterialResource {
    /// The GPU binding, once uploaded.
    pub fn binding(&self) -> Option<Arc<MaterialBinding>> {
        self.binding.read().clone()
    }

    /// Handle to the material's shader, once loaded.
    pub fn shader(&self) -> Option<ResourceHandle<ShaderResource>> {
        self.loaded.lock().as_ref().map(|loaded| loaded.shader.clone())
    }

    /// Sets an attribute now if the binding exists, otherwise when it is
    /// created. Later calls for the same name win.
    pub fn set_attribute(&self, name: impl Into<String>, value: AttributeValue) {
        let name = name.into();
        let mut overrides = self.overrides.lock();
        if let Some(binding) = self.binding.read().as_ref() {
            binding.set_attribute(name, value);
            return;
        }
        overrides.push((name, value));
    }

    fn name(&self) -> String {
        self.header
            .path()
            .file_stem()
            .map_or_else(|| "material".to_string(), |s| s.to_string_lossy().into_owned())
    }
}

/// `Ok(true)` once a dependency is on the GPU. A failed dependency is an
/// error so the retry warning says why.
fn dependency_ready(header: &ResourceHeader) -> ResourceResult<bool> {
    match header.state() {
        ResourceState::OnGpu => Ok(true),
        ResourceState::Failed => Err(ResourceError::Load {
            path: header.path().to_path_buf(),
            message: "dependency failed to load".to_string(),
        }),
        _ => Ok(false),
    }
}

impl Resource for MaterialResource {
    fn header(&self) -> &ResourceHeader {
        &self.header
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Material
    }

    fn load(&self, manager: &ResourceManager) -> ResourceResult<()> {
        let path = self.header.path();
        let description = MaterialDescription::parse(&fs::read_to_string(path)?, path)?;

        let shader = manager.load::<ShaderResource>(&description.shader)?;
        let mut attributes = Vec::with_capacity(description.attributes.len());
        for (name, value) in description.attributes {
            let dependency = match value {
                MaterialValue::Value(value) => Dependency::Value(value),
                MaterialValue::Texture(texture) => {
                    Dependency::Texture(manager.load::<TextureResource>(&texture)?)
                }
            };
            attributes.push((name, dependency));
        }

        *self.loaded.lock() = Some(LoadedMaterial { shader, attributes });
        Ok(())
    }

    fn send_to_gpu(&self, backend: &Backend) -> ResourceResult<UploadStatus> {
        let loaded = self.loaded.lock();
        let Some(loaded) = loaded.as_ref() else {
            return Err(ResourceError::Load {
                path: self.header.path().to_path_buf(),
                message: "material description missing at upload".to_string(),
            });
        };

        if self.binding.read().is_some() {
            return Ok(UploadStatus::Uploaded);
        }
        let shader = loaded.shader.resolve()?;
        if !dependency_ready(shader.header())? {
            return Ok(UploadStatus::NotReady);
        }
        let mut values = Vec::with_capacity(loaded.attributes.len());
        for (name, dependency) in &loaded.attributes {
            match dependency {
                Dependency::Value(value) => values.push((name.clone(), Some(value.clone()))),
                Dependency::Texture(handle) => {
                    let texture = handle.resolve()?;
                    if !dependency_ready(texture.header())? {
                        return Ok(UploadStatus::NotReady);
                    }
                    values.push((name.clone(), texture.gpu().map(AttributeValue::Texture)));
                }
            }
        }

        let Backend::Vulkan(context) = backend else {
            return Ok(UploadStatus::Uploaded);
        };
        let Some(program) = shader.program() else {
            return Ok(UploadStatus::NotReady);
        };

        let binding = MaterialBinding::new(context, self.name(), program)?;
        for (name, value) in values {
            if let Some(value) = value {
                binding.set_attribute(name, value);
            }
        }
        // Publish under the overrides lock so no late value is left behind.
        let mut overrides = self.overrides.lock();
        for (name, value) in overrides.drain(..) {
            binding.set_attribute(name, value);
        }
        *self.binding.write() = Some(Arc::new(binding));
        Ok(UploadStatus::Uploaded)
    }

    fn is_resident(&self) -> bool {
        self.binding.read().is_some()
    }
}

impl Loadable for MaterialResource {
    const KIND: ResourceKind = ResourceKind::Material;

    fn from_header(header: ResourceHeader) -> Self {
        Self {
            header,
            loaded: Mutex::new(None),
            overrides: Mutex::new(Vec::new()),
            binding: RwLock::new(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(text: &str) -> Result<MaterialValue, String> {
        let table: toml::Table = toml::from_str(&format!("v = {text}")).unwrap();
        parse_value(table.get("v").unwrap(), Path::new("/mats"))
    }

    #[test]
    fn test_parse_scalar_and_vector_values() {
        assert_eq!(
            value("0.5").unwrap(),
            MaterialValue::Value(AttributeValue::Float(0.5))
        );
        assert_eq!(value("3").unwrap(), MaterialValue::Value(AttributeValue::Int(3)));
        assert_eq!(
            value("[1, 2.5]").unwrap(),
            MaterialValue::Value(AttributeValue::Vec2(Vec2::new(1.0, 2.5)))
        );
        assert_eq!(
            value("[0.0, 0.0, 1.0, 1.0]").unwrap(),
            MaterialValue::Value(AttributeValue::Vec4(Vec4::new(0.0, 0.0, 1.0, 1.0)))
        );
    }

    #[test]
    fn test_parse_matrix_is_column_major() {
        let text = "[1,0,0,0, 0,1,0,0, 0,0,1,0, 5,6,7,1]";
        let MaterialValue::Value(AttributeValue::Mat4(m)) = value(text).unwrap() else {
            panic!("expected a matrix");
        };
        assert_eq!(m.w_axis, Vec4::new(5.0, 6.0, 7.0, 1.0));
    }

    #[test]
    fn test_texture_paths_are_relative_to_material() {
        assert_eq!(
            value("\"../tex/a.png\"").unwrap(),
            MaterialValue::Texture(PathBuf::from("/mats/../tex/a.png"))
        );
    }

    #[test]
    fn test_rejects_unmappable_values() {
        assert!(value("[1, 2, 3, 4, 5]").is_err());
        assert!(value("true").is_err());
        assert!(value("[\"a\", \"b\"]").is_err());
        assert!(value("4294967296").is_err());
    }

    #[test]
    fn test_description_resolves_shader_path() {
        let text = "shader = \"flat.shader.toml\"\n[attributes]\ntint = [1.0, 0.0, 0.0, 1.0]\n";
        let description = MaterialDescription::parse(text, Path::new("/assets/m/red.material.toml")).unwrap();
        assert_eq!(description.shader, PathBuf::from("/assets/m/flat.shader.toml"));
        assert_eq!(description.attributes.len(), 1);
        assert_eq!(description.attributes[0].0, "tint");

        assert!(MaterialDescription::parse("[attributes]\n", Path::new("x")).is_err());
        assert!(MaterialDescription::parse("shader = \"s\"\ncolour = 1\n", Path::new("x")).is_err());
    }
}
