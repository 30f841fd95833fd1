//! Shader resources described by a small TOML file.
//!
//! ```toml
//! # flat.shader.toml
//! vertex = "flat.vert"          # GLSL source, compiled and cached
//! fragment = "flat.frag.spv"    # or precompiled SPIR-V
//! cull = "back"                 # none | front | back
//! depth_test = true
//! depth_write = true
//! alpha_blend = false
//! ```
//!
//! A compute shader names only `compute = "blur.comp"`. Stage paths are
//! relative to the description file. GLSL stages are compiled through the
//! manager's [`ShaderCompiler`] and stored in its [`ShaderCache`] under a UUID
//! derived from the resource UUID and the stage, so unchanged sources are not
//! recompiled on the next run.
//!
//! [`ShaderCache`]: crate::ShaderCache

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ember_renderer::{Backend, ProgramOptions, ShaderCode, ShaderProgram};
use ember_rhi::pipeline::CullMode;
use ember_rhi::reflection::ShaderCompiler;
use ember_rhi::shader::{ShaderStage, spirv_words};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ResourceError, ResourceResult};
use crate::manager::ResourceManager;
use crate::resource::{Loadable, Resource, ResourceHeader, ResourceKind, UploadStatus};

/// Face culling as written in a description file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CullSetting {
    None,
    Front,
    #[default]
    Back,
}

impl From<CullSetting> for CullMode {
    fn from(value: CullSetting) -> Self {
        match value {
            CullSetting::None => CullMode::None,
            CullSetting::Front => CullMode::Front,
            CullSetting::Back => CullMode::Back,
        }
    }
}

/// Parsed `*.shader.toml`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShaderDescription {
    pub vertex: Option<PathBuf>,
    pub fragment: Option<PathBuf>,
    pub compute: Option<PathBuf>,
    pub cull: CullSetting,
    pub depth_test: bool,
    pub depth_write: bool,
    pub alpha_blend: bool,
}

impl Default for ShaderDescription {
    fn default() -> Self {
        let options = ProgramOptions::default();
        Self {
            vertex: None,
            fragment: None,
            compute: None,
            cull: CullSetting::Back,
            depth_test: options.depth_test,
            depth_write: options.depth_write,
            alpha_blend: options.alpha_blend,
        }
    }
}

impl ShaderDescription {
    /// Parses description text; `path` is only used in errors.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::Description`] for invalid TOML or a stage set
    /// that is neither vertex+fragment nor compute alone.
    pub fn parse(text: &str, path: &Path) -> ResourceResult<Self> {
        let description: Self = toml::from_str(text).map_err(|e| ResourceError::Description {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        description.stages(path)?;
        Ok(description)
    }

    /// Stage sources in pipeline order.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::Description`] for an incomplete or mixed
    /// stage set.
    pub fn stages(&self, path: &Path) -> ResourceResult<Vec<(ShaderStage, &Path)>> {
        match (&self.vertex, &self.fragment, &self.compute) {
            (Some(vertex), Some(fragment), None) => Ok(vec![
                (ShaderStage::Vertex, vertex.as_path()),
                (ShaderStage::Fragment, fragment.as_path()),
            ]),
            (None, None, Some(compute)) => Ok(vec![(ShaderStage::Compute, compute.as_path())]),
            _ => Err(ResourceError::Description {
                path: path.to_path_buf(),
                message: "expected `vertex` + `fragment`, or `compute` alone".to_string(),
            }),
        }
    }

    pub fn options(&self) -> ProgramOptions {
        ProgramOptions {
            cull_mode: self.cull.into(),
            depth_test: self.depth_test,
            depth_write: self.depth_write,
            alpha_blend: self.alpha_blend,
        }
    }
}

/// Assembles per-stage code into a [`ShaderCode`] in the order of
/// [`ShaderDescription::stages`].
fn assemble(mut words: Vec<(ShaderStage, Vec<u32>)>, path: &Path) -> ResourceResult<ShaderCode> {
    match words.len() {
        1 => {
            let (_, compute) = words.remove(0);
            Ok(ShaderCode::Compute(compute))
        }
        2 => {
            let (_, fragment) = words.remove(1);
            let (_, vertex) = words.remove(0);
            Ok(ShaderCode::Graphics { vertex, fragment })
        }
        n => Err(ResourceError::Description {
            path: path.to_path_buf(),
            message: format!("{n} shader stages"),
        }),
    }
}

/// A graphics or compute shader program.
pub struct ShaderResource {
    header: ResourceHeader,
    code: Mutex<Option<ShaderCode>>,
    options: Mutex<ProgramOptions>,
    program: RwLock<Option<Arc<ShaderProgram>>>,
}

impl ShaderResource {
    /// Wraps SPIR-V that is already in memory.
    pub fn from_code(header: ResourceHeader, code: ShaderCode, options: ProgramOptions) -> Self {
        Self {
            header,
            code: Mutex::new(Some(code)),
            options: Mutex::new(options),
            program: RwLock::new(None),
        }
    }

    /// The pipeline and its reflection, once uploaded.
    pub fn program(&self) -> Option<Arc<ShaderProgram>> {
        self.program.read().clone()
    }

    fn name(&self) -> String {
        let path = self.header.path();
        path.file_name()
            .map(|name| name.to_string_lossy())
            .map(|name| name.trim_end_matches(".toml").trim_end_matches(".shader").to_string())
            .unwrap_or_else(|| path.display().to_string())
    }

    fn stage_code(
        &self,
        manager: &ResourceManager,
        stage: ShaderStage,
        source: &Path,
    ) -> ResourceResult<Vec<u32>> {
        if source.extension().is_some_and(|ext| ext == "spv") {
            return Ok(spirv_words(&fs::read(source)?)?);
        }

        let cache = manager.shader_cache();
        let cache_id = Uuid::new_v5(&self.header.uuid(), stage.name().as_bytes());
        if cache.is_fresh(cache_id, source) {
            match cache.load(cache_id) {
                Ok(words) => {
                    debug!("Using cached {} stage for {:?}", stage.name(), source);
                    return Ok(words);
                }
                Err(e) => warn!("Ignoring unreadable shader cache entry {}: {}", cache_id, e),
            }
        }

        let compiler = manager
            .compiler()
            .ok_or_else(|| ResourceError::NoCompiler(source.to_path_buf()))?;
        let glsl = fs::read_to_string(source)?;
        let words = compiler.compile(stage, &glsl, &source.to_string_lossy())?;
        if let Err(e) = cache.store(cache_id, &words) {
            warn!("Failed to cache compiled shader {:?}: {}", source, e);
        }
        Ok(words)
    }
}

impl Resource for ShaderResource {
    fn header(&self) -> &ResourceHeader {
        &self.header
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Shader
    }

    fn load(&self, manager: &ResourceManager) -> ResourceResult<()> {
        if self.code.lock().is_some() {
            return Ok(());
        }

        let path = self.header.path();
        let description = ShaderDescription::parse(&fs::read_to_string(path)?, path)?;
        let dir = path.parent().unwrap_or(Path::new(""));

        let mut words = Vec::new();
        for (stage, source) in description.stages(path)? {
            words.push((stage, self.stage_code(manager, stage, &dir.join(source))?));
        }

        *self.code.lock() = Some(assemble(words, path)?);
        *self.options.lock() = description.options();
        Ok(())
    }

    fn send_to_gpu(&self, backend: &Backend) -> ResourceResult<UploadStatus> {
        let Backend::Vulkan(context) = backend else {
            return Ok(UploadStatus::Uploaded);
        };

        let code = self.code.lock();
        if self.program.read().is_some() {
            return Ok(UploadStatus::Uploaded);
        }
        let Some(code) = code.as_ref() else {
            return Err(ResourceError::Load {
                path: self.header.path().to_path_buf(),
                message: "shader code missing at upload".to_string(),
            });
        };
        let options = *self.options.lock();
        let program = context.create_program(&self.name(), code, &options)?;
        *self.program.write() = Some(program);
        Ok(UploadStatus::Uploaded)
    }

    fn is_resident(&self) -> bool {
        self.program.read().is_some()
    }
}

impl Loadable for ShaderResource {
    const KIND: ResourceKind = ResourceKind::Shader;

    fn from_header(header: ResourceHeader) -> Self {
        Self {
            header,
            code: Mutex::new(None),
            options: Mutex::new(ProgramOptions::default()),
            program: RwLock::new(None),
        }
    }
}

/// GLSL compiler backed by `shaderc`.
#[cfg(feature = "shaderc")]
#[derive(Debug)]
pub struct ShadercCompiler;

#[cfg(feature = "shaderc")]
impl ShadercCompiler {
    /// Checks that the shaderc library can be initialized.
    ///
    /// # Errors
    ///
    /// Returns an error if shaderc fails to start.
    pub fn new() -> ResourceResult<Self> {
        shaderc::Compiler::new()
            .map_err(|e| ember_rhi::RhiError::ShaderError(format!("shaderc: {e}")))?;
        Ok(Self)
    }
}

#[cfg(feature = "shaderc")]
impl ShaderCompiler for ShadercCompiler {
    fn compile(
        &self,
        stage: ShaderStage,
        source: &str,
        name: &str,
    ) -> ember_rhi::RhiResult<Vec<u32>> {
        use ember_rhi::RhiError;

        let kind = match stage {
            ShaderStage::Vertex => shaderc::ShaderKind::Vertex,
            ShaderStage::Fragment => shaderc::ShaderKind::Fragment,
            ShaderStage::Compute => shaderc::ShaderKind::Compute,
        };
        let compiler =
            shaderc::Compiler::new().map_err(|e| RhiError::ShaderError(format!("shaderc: {e}")))?;
        let mut options = shaderc::CompileOptions::new()
            .map_err(|e| RhiError::ShaderError(format!("shaderc options: {e}")))?;
        options.set_target_env(
            shaderc::TargetEnv::Vulkan,
            shaderc::EnvVersion::Vulkan1_3 as u32,
        );

        let artifact = compiler
            .compile_into_spirv(source, kind, name, "main", Some(&options))
            .map_err(|e| RhiError::ShaderError(format!("{name}: {e}")))?;
        if artifact.get_num_warnings() > 0 {
            warn!("{}: {}", name, artifact.get_warning_messages());
        }
        Ok(artifact.as_binary().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use ember_core::ResourceConfig;
    use ember_rhi::RhiResult;

    use super::*;

    const MAGIC: u32 = 0x0723_0203;

    /// Emits a fixed module and counts invocations.
    struct FakeCompiler {
        calls: std::sync::atomic::AtomicUsize,
    }

    impl ShaderCompiler for FakeCompiler {
        fn compile(&self, stage: ShaderStage, _source: &str, _name: &str) -> RhiResult<Vec<u32>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(vec![MAGIC, 0x0001_0000, 0, stage as u32 + 1, 0])
        }
    }

    fn temp_root() -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let root = std::env::temp_dir().join(format!("ember-shader-{}-{nanos}", std::process::id()));
        fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn test_description_defaults_and_options() {
        let text = "vertex = \"a.vert\"\nfragment = \"a.frag\"\ncull = \"none\"\nalpha_blend = true\n";
        let description = ShaderDescription::parse(text, Path::new("a.shader.toml")).unwrap();
        let options = description.options();
        assert_eq!(options.cull_mode, CullMode::None);
        assert!(options.alpha_blend);
        assert!(options.depth_test);
        assert_eq!(description.stages(Path::new("")).unwrap().len(), 2);
    }

    #[test]
    fn test_description_rejects_mixed_or_missing_stages() {
        let mixed = "vertex = \"a.vert\"\nfragment = \"a.frag\"\ncompute = \"a.comp\"\n";
        assert!(ShaderDescription::parse(mixed, Path::new("x")).is_err());
        assert!(ShaderDescription::parse("vertex = \"a.vert\"\n", Path::new("x")).is_err());
        assert!(ShaderDescription::parse("cull = \"sideways\"\ncompute = \"c\"\n", Path::new("x")).is_err());
        assert!(ShaderDescription::parse("compute = \"c.comp\"\n", Path::new("x")).is_ok());
    }

    #[test]
    fn test_assemble_orders_graphics_stages() {
        let code = assemble(
            vec![(ShaderStage::Vertex, vec![1]), (ShaderStage::Fragment, vec![2])],
            Path::new("x"),
        )
        .unwrap();
        assert!(matches!(
            code,
            ShaderCode::Graphics { ref vertex, ref fragment } if vertex == &[1] && fragment == &[2]
        ));
    }

    #[test]
    fn test_glsl_stages_compile_once_then_hit_cache() {
        let root = temp_root();
        fs::write(root.join("flat.vert"), "void main() {}").unwrap();
        fs::write(root.join("flat.frag"), "void main() {}").unwrap();
        fs::write(
            root.join("flat.shader.toml"),
            "vertex = \"flat.vert\"\nfragment = \"flat.frag\"\n",
        )
        .unwrap();

        let config = ResourceConfig {
            worker_threads: 0,
            asset_root: root.clone(),
            cache_file: root.join("resources.cache"),
            shader_cache_dir: root.join("shader_cache"),
            ..ResourceConfig::default()
        };
        let compiler = Arc::new(FakeCompiler {
            calls: Default::default(),
        });

        let manager = ResourceManager::new(&config, Backend::Headless).unwrap();
        manager.set_compiler(compiler.clone());
        let shader = manager.load::<ShaderResource>("flat.shader.toml").unwrap();
        assert!(shader.resolve().unwrap().header().wait_loaded());
        assert_eq!(compiler.calls.load(std::sync::atomic::Ordering::SeqCst), 2);

        // A fresh manager with the same UUIDs reuses the compiled stages.
        manager.save_cache().unwrap();
        let again = ResourceManager::new(&config, Backend::Headless).unwrap();
        again.set_compiler(compiler.clone());
        let shader = again.load::<ShaderResource>("flat.shader.toml").unwrap();
        assert!(shader.resolve().unwrap().header().wait_loaded());
        assert_eq!(compiler.calls.load(std::sync::atomic::Ordering::SeqCst), 2);

        assert_eq!(again.flush_uploads(1), 1);
        assert!(shader.is_ready());
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_glsl_without_compiler_fails_load() {
        let root = temp_root();
        fs::write(root.join("c.comp"), "void main() {}").unwrap();
        fs::write(root.join("c.shader.toml"), "compute = \"c.comp\"\n").unwrap();
        let config = ResourceConfig {
            worker_threads: 0,
            asset_root: root.clone(),
            cache_file: root.join("resources.cache"),
            shader_cache_dir: root.join("shader_cache"),
            ..ResourceConfig::default()
        };

        let manager = ResourceManager::new(&config, Backend::Headless).unwrap();
        if manager.compiler().is_some() {
            fs::remove_dir_all(root).unwrap();
            return;
        }
        let shader = manager.load::<ShaderResource>("c.shader.toml").unwrap();
        assert!(!shader.resolve().unwrap().header().wait_loaded());
        assert_eq!(manager.pending_uploads(), 0);
        fs::remove_dir_all(root).unwrap();
    }
}
