//! On-disk caches: resource UUIDs and compiled shader bytecode.
//!
//! # Overview
//!
//! - [`ResourceCache`] keeps resource UUIDs stable across runs. The file
//!   holds one `uuid "path"` pair per line
//! - [`ShaderCache`] stores SPIR-V compiled from GLSL as
//!   `<dir>/<uuid>.compiled` and reuses it while it is newer than the source
//!
//! ```text
//! 6f1c3a9e-0a4b-5c1d-9e2f-1234567890ab "/game/assets/meshes/ship.obj"
//! ```

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use ember_rhi::shader::spirv_words;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ResourceResult;

/// Path to UUID assignments persisted between runs.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ResourceCache {
    entries: HashMap<PathBuf, Uuid>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses cache text. Lines that do not match the format are skipped
    /// with a warning.
    pub fn parse(text: &str) -> Self {
        let mut entries = HashMap::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_line(line) {
                Some((uuid, path)) => {
                    entries.insert(path, uuid);
                }
                None => warn!("Skipping malformed resource cache line {}: {}", number + 1, line),
            }
        }
        Self { entries }
    }

    /// Reads `path`; a missing file yields an empty cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn load(path: &Path) -> ResourceResult<Self> {
        match fs::read_to_string(path) {
            Ok(text) => {
                let cache = Self::parse(&text);
                debug!("Loaded {} resource UUID(s) from {:?}", cache.len(), path);
                Ok(cache)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Serializes the cache, sorted by path for stable diffs.
    pub fn to_text(&self) -> String {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let mut text = String::new();
        for (path, uuid) in entries {
            text.push_str(&format!("{} \"{}\"\n", uuid, path.display()));
        }
        text
    }

    /// Writes the cache to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> ResourceResult<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_text())?;
        Ok(())
    }

    pub fn get(&self, path: &Path) -> Option<Uuid> {
        self.entries.get(path).copied()
    }

    pub fn insert(&mut self, path: PathBuf, uuid: Uuid) {
        self.entries.insert(path, uuid);
    }

    /// Returns the cached UUID for `path`, assigning a path-derived one on
    /// first sight.
    pub fn get_or_assign(&mut self, path: &Path) -> Uuid {
        *self
            .entries
            .entry(path.to_path_buf())
            .or_insert_with(|| uuid_for_path(path))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_line(line: &str) -> Option<(Uuid, PathBuf)> {
    let (uuid, rest) = line.split_once(char::is_whitespace)?;
    let uuid = Uuid::parse_str(uuid).ok()?;
    let path = rest.trim().strip_prefix('"')?.strip_suffix('"')?;
    if path.is_empty() {
        return None;
    }
    Some((uuid, PathBuf::from(path)))
}

/// Deterministic UUID (v5) for a canonical path.
pub fn uuid_for_path(path: &Path) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, path.to_string_lossy().as_bytes())
}

/// Directory of compiled shader stages keyed by UUID.
#[derive(Debug, Clone)]
pub struct ShaderCache {
    dir: PathBuf,
}

impl ShaderCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, uuid: Uuid) -> PathBuf {
        self.dir.join(format!("{uuid}.compiled"))
    }

    /// True if a compiled file exists and is not older than `source`.
    pub fn is_fresh(&self, uuid: Uuid, source: &Path) -> bool {
        let modified = |path: &Path| fs::metadata(path).and_then(|m| m.modified()).ok();
        match (modified(&self.path_for(uuid)), modified(source)) {
            (Some(compiled), Some(source)) => compiled >= source,
            _ => false,
        }
    }

    /// Reads compiled SPIR-V words.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or not valid SPIR-V.
    pub fn load(&self, uuid: Uuid) -> ResourceResult<Vec<u32>> {
        let bytes = fs::read(self.path_for(uuid))?;
        Ok(spirv_words(&bytes)?)
    }

    /// Writes compiled SPIR-V words, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn store(&self, uuid: Uuid, words: &[u32]) -> ResourceResult<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(uuid);
        fs::write(&path, bytemuck::cast_slice::<u32, u8>(words))?;
        debug!("Cached compiled shader {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "ember-cache-{tag}-{}-{nanos}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_parse_skips_malformed_lines() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let text = format!(
            "{a} \"/assets/a.obj\"\nnot-a-uuid \"/x\"\n{b} missing-quotes\n\n{b} \"/assets/with space.png\"\n"
        );
        let cache = ResourceCache::parse(&text);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(Path::new("/assets/a.obj")), Some(a));
        assert_eq!(cache.get(Path::new("/assets/with space.png")), Some(b));
    }

    #[test]
    fn test_save_and_load_preserve_entries() {
        let dir = temp_dir("resources");
        let file = dir.join("nested").join("resources.cache");

        let mut cache = ResourceCache::new();
        cache.insert(PathBuf::from("/b/mesh.obj"), Uuid::new_v4());
        cache.insert(PathBuf::from("/a/tex.png"), Uuid::new_v4());
        cache.save(&file).unwrap();

        let text = fs::read_to_string(&file).unwrap();
        assert!(text.lines().next().unwrap().ends_with("\"/a/tex.png\""));
        assert_eq!(ResourceCache::load(&file).unwrap(), cache);

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_missing_cache_file_is_empty() {
        let cache = ResourceCache::load(Path::new("/nonexistent/ember/resources.cache")).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_get_or_assign_is_stable() {
        let mut cache = ResourceCache::new();
        let path = Path::new("/assets/ship.obj");
        let first = cache.get_or_assign(path);
        assert_eq!(first, uuid_for_path(path));
        assert_eq!(cache.get_or_assign(path), first);

        let pinned = Uuid::new_v4();
        cache.insert(PathBuf::from("/assets/other.obj"), pinned);
        assert_eq!(cache.get_or_assign(Path::new("/assets/other.obj")), pinned);
    }

    #[test]
    fn test_shader_cache_store_load_and_freshness() {
        let dir = temp_dir("shaders");
        let cache = ShaderCache::new(dir.join("compiled"));
        let uuid = Uuid::new_v4();
        let source = dir.join("flat.vert");
        fs::write(&source, "void main() {}").unwrap();

        assert!(!cache.is_fresh(uuid, &source));

        let words = vec![0x0723_0203, 0x0001_0000, 0, 1, 0];
        cache.store(uuid, &words).unwrap();
        assert!(cache.is_fresh(uuid, &source));
        assert_eq!(cache.load(uuid).unwrap(), words);
        assert!(cache.path_for(uuid).ends_with(format!("{uuid}.compiled")));

        fs::remove_dir_all(dir).unwrap();
    }
}
