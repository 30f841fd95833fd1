//! Resource registry, load dispatch and the GPU upload queue.
//!
//! # Overview
//!
//! [`ResourceManager`] is a cheaply clonable handle to shared state:
//!
//! - A registry keyed by the hash of each resource's canonical path, so one
//!   file maps to at most one resource
//! - A [`WorkerPool`] running [`Resource::load`] off the render thread
//! - An [`UploadQueue`] drained by [`ResourceManager::update_resource_to_send`],
//!   one entry per call, from the frame loop
//!
//! When the backend supports it and `multithreaded_upload` is enabled, loaded
//! resources are uploaded on a worker instead, serialized against frame
//! recording through the renderer's [`RecordingLock`].
//!
//! Uploads that are not ready (or fail) go to the back of the queue with an
//! attempt counter and are retried on a later call. They are never dropped;
//! a warning is logged every `retry_warn_interval` attempts.
//!
//! # Example
//!
//! ```no_run
//! use ember_core::ResourceConfig;
//! use ember_renderer::Backend;
//! use ember_resources::{MeshResource, ResourceManager};
//!
//! # fn main() -> ember_resources::ResourceResult<()> {
//! let manager = ResourceManager::new(&ResourceConfig::default(), Backend::Headless)?;
//! let ship = manager.load::<MeshResource>("meshes/ship.obj")?;
//!
//! // Once per frame:
//! manager.update_resource_to_send();
//! println!("ship ready: {}", ship.is_ready());
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use ember_core::ResourceConfig;
use ember_renderer::Backend;
use ember_rhi::command::RecordingLock;
use ember_rhi::reflection::ShaderCompiler;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::cache::{ResourceCache, ShaderCache};
use crate::error::{ResourceError, ResourceResult};
use crate::resource::{Loadable, Resource, ResourceHandle, ResourceHeader, ResourceKind, UploadStatus};
use crate::worker::WorkerPool;

/// Queued upload with the number of attempts that did not finish it.
#[derive(Debug)]
pub struct PendingUpload<T> {
    pub item: T,
    pub attempts: u32,
}

/// FIFO of pending uploads. Retried entries go to the back.
#[derive(Debug)]
pub struct UploadQueue<T> {
    entries: VecDeque<PendingUpload<T>>,
}

impl<T> UploadQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, item: T) {
        self.entries.push_back(PendingUpload { item, attempts: 0 });
    }

    pub fn pop(&mut self) -> Option<PendingUpload<T>> {
        self.entries.pop_front()
    }

    /// Re-enqueues `entry` at the back after one more failed attempt.
    /// Returns the updated attempt count.
    pub fn requeue(&mut self, mut entry: PendingUpload<T>) -> u32 {
        entry.attempts = entry.attempts.saturating_add(1);
        let attempts = entry.attempts;
        self.entries.push_back(entry);
        attempts
    }

    /// Keeps only entries for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        self.entries.retain(|entry| keep(&entry.item));
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

impl<T> Default for UploadQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// True on every `interval`-th attempt. An interval of zero disables warnings.
#[inline]
pub fn should_warn(attempts: u32, interval: u32) -> bool {
    interval > 0 && attempts > 0 && attempts.is_multiple_of(interval)
}

// ============================================================================
// Path identity
// ============================================================================

/// Removes `.` and resolves `..` without touching the filesystem.
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Absolute, normalized form of `path`.
///
/// The longest existing ancestor is resolved through the filesystem (so
/// symlinks collapse) and the remaining components are appended lexically.
/// Paths to files that do not exist yet therefore still get a stable
/// identity.
pub fn canonical_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(dir) => dir.join(path),
            Err(_) => path.to_path_buf(),
        }
    };
    let normalized = lexical_normalize(&absolute);

    let mut existing = normalized.as_path();
    let mut missing = Vec::new();
    loop {
        if let Ok(resolved) = fs::canonicalize(existing) {
            return missing
                .iter()
                .rev()
                .fold(resolved, |acc: PathBuf, name| acc.join(name));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return normalized,
        }
    }
}

/// Registry key for a canonical path.
pub fn path_hash(path: &Path) -> u64 {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    hasher.finish()
}

// ============================================================================
// Manager
// ============================================================================

struct Entry {
    resource: Arc<dyn Resource>,
    typed: Arc<dyn Any + Send + Sync>,
    kind: ResourceKind,
}

impl Entry {
    fn new<T: Resource>(resource: Arc<T>) -> Self {
        Self {
            kind: resource.kind(),
            resource: resource.clone(),
            typed: resource,
        }
    }

    fn handle<T: Loadable>(&self) -> ResourceResult<ResourceHandle<T>> {
        match self.typed.clone().downcast::<T>() {
            Ok(resource) => Ok(ResourceHandle::new(&resource)),
            Err(_) => Err(ResourceError::KindMismatch {
                path: self.resource.header().path().to_path_buf(),
                registered: self.kind,
                requested: T::KIND,
            }),
        }
    }
}

type UploadEntry = PendingUpload<Arc<dyn Resource>>;

struct Shared {
    registry: RwLock<HashMap<u64, Entry>>,
    uploads: Mutex<UploadQueue<Arc<dyn Resource>>>,
    backend: RwLock<Backend>,
    recording_lock: RwLock<Option<RecordingLock>>,
    compiler: RwLock<Option<Arc<dyn ShaderCompiler>>>,
    workers: Option<WorkerPool>,
    cache: Mutex<ResourceCache>,
    cache_file: PathBuf,
    shader_cache: ShaderCache,
    asset_root: PathBuf,
    retry_warn_interval: u32,
    multithreaded_upload: bool,
}

/// Tracks loadable assets and drives them from disk to the GPU.
#[derive(Clone)]
pub struct ResourceManager {
    shared: Arc<Shared>,
}

impl ResourceManager {
    /// Creates a manager, starting its worker pool and reading the UUID cache.
    ///
    /// With `worker_threads == 0` loads run synchronously on the calling
    /// thread.
    ///
    /// # Errors
    ///
    /// Returns an error if worker threads cannot be spawned or the cache file
    /// exists but cannot be read.
    pub fn new(config: &ResourceConfig, backend: Backend) -> ResourceResult<Self> {
        let workers = match config.worker_threads {
            0 => None,
            n => Some(WorkerPool::new(n)?),
        };
        let cache = ResourceCache::load(&config.cache_file)?;
        let asset_root = canonical_path(&config.asset_root);

        info!(
            "Resource manager ready: {} worker(s), backend {}, root {:?}",
            workers.as_ref().map_or(0, WorkerPool::thread_count),
            backend.name(),
            asset_root
        );

        Ok(Self {
            shared: Arc::new(Shared {
                registry: RwLock::new(HashMap::new()),
                uploads: Mutex::new(UploadQueue::new()),
                backend: RwLock::new(backend),
                recording_lock: RwLock::new(None),
                compiler: RwLock::new(default_compiler()),
                workers,
                cache: Mutex::new(cache),
                cache_file: config.cache_file.clone(),
                shader_cache: ShaderCache::new(config.shader_cache_dir.clone()),
                asset_root,
                retry_warn_interval: config.retry_warn_interval,
                multithreaded_upload: config.multithreaded_upload,
            }),
        })
    }

    // ========================================================================
    // Collaborators
    // ========================================================================

    /// Backend used for subsequent uploads.
    pub fn backend(&self) -> Backend {
        self.shared.backend.read().clone()
    }

    /// Switches the backend used for subsequent uploads.
    ///
    /// Resources that reached the GPU state without creating their GPU
    /// objects, as every upload on the headless backend does, are queued
    /// again so the new backend builds them. Returns how many were queued.
    pub fn set_backend(&self, backend: Backend) -> usize {
        info!("Resource uploads now target the {} backend", backend.name());
        *self.shared.backend.write() = backend;
        self.requeue_non_resident()
    }

    /// Lock that worker-thread uploads take to stay out of frame recording.
    pub fn set_recording_lock(&self, lock: RecordingLock) {
        *self.shared.recording_lock.write() = Some(lock);
    }

    /// Installs the compiler used for GLSL shader sources.
    pub fn set_compiler(&self, compiler: Arc<dyn ShaderCompiler>) {
        *self.shared.compiler.write() = Some(compiler);
    }

    pub fn compiler(&self) -> Option<Arc<dyn ShaderCompiler>> {
        self.shared.compiler.read().clone()
    }

    #[inline]
    pub fn shader_cache(&self) -> &ShaderCache {
        &self.shared.shader_cache
    }

    #[inline]
    pub fn asset_root(&self) -> &Path {
        &self.shared.asset_root
    }

    /// Canonical registry path for `path`; relative paths start at the asset
    /// root.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            canonical_path(path)
        } else {
            canonical_path(&self.shared.asset_root.join(path))
        }
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Returns the resource registered for `path`, creating and loading it on
    /// first request.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::KindMismatch`] if the path is registered as a
    /// different resource type.
    pub fn load<T: Loadable>(&self, path: impl AsRef<Path>) -> ResourceResult<ResourceHandle<T>> {
        self.register(path, T::from_header)
    }

    /// Like [`ResourceManager::load`], but builds the resource with `build`
    /// (for example around in-memory data). `build` is not called if the path
    /// is already registered.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::KindMismatch`] if the path is registered as a
    /// different resource type.
    pub fn register<T: Loadable>(
        &self,
        path: impl AsRef<Path>,
        build: impl FnOnce(ResourceHeader) -> T,
    ) -> ResourceResult<ResourceHandle<T>> {
        let path = self.resolve_path(path.as_ref());
        let key = path_hash(&path);

        if let Some(entry) = self.shared.registry.read().get(&key) {
            return entry.handle::<T>();
        }

        let resource = {
            let mut registry = self.shared.registry.write();
            if let Some(entry) = registry.get(&key) {
                return entry.handle::<T>();
            }
            let uuid = self.shared.cache.lock().get_or_assign(&path);
            let resource = Arc::new(build(ResourceHeader::new(uuid, path)));
            registry.insert(key, Entry::new(resource.clone()));
            resource
        };

        debug!(
            "Registered {} {:?} ({})",
            T::KIND,
            resource.header().path(),
            resource.header().uuid()
        );
        let handle = ResourceHandle::new(&resource);
        self.dispatch_load(resource);
        Ok(handle)
    }

    /// Looks up an already registered resource.
    pub fn get<T: Loadable>(&self, path: impl AsRef<Path>) -> Option<ResourceHandle<T>> {
        let key = path_hash(&self.resolve_path(path.as_ref()));
        self.shared
            .registry
            .read()
            .get(&key)
            .and_then(|entry| entry.handle::<T>().ok())
    }

    /// Removes the resource for `path` from the registry and the upload queue.
    ///
    /// Handles fail to resolve once in-flight users release it. Returns
    /// whether a resource was removed.
    pub fn unload(&self, path: impl AsRef<Path>) -> bool {
        let key = path_hash(&self.resolve_path(path.as_ref()));
        let Some(entry) = self.shared.registry.write().remove(&key) else {
            return false;
        };

        let uuid = entry.resource.header().uuid();
        self.shared
            .uploads
            .lock()
            .retain(|resource| resource.header().uuid() != uuid);
        debug!("Unloaded {} {:?}", entry.kind, entry.resource.header().path());
        true
    }

    /// Number of registered resources.
    pub fn resource_count(&self) -> usize {
        self.shared.registry.read().len()
    }

    /// Number of resources waiting in the upload queue.
    pub fn pending_uploads(&self) -> usize {
        self.shared.uploads.lock().len()
    }

    /// Persists the UUID cache to the configured file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_cache(&self) -> ResourceResult<()> {
        let cache = self.shared.cache.lock().clone();
        cache.save(&self.shared.cache_file)?;
        debug!("Saved {} resource UUID(s) to {:?}", cache.len(), self.shared.cache_file);
        Ok(())
    }

    fn requeue_non_resident(&self) -> usize {
        let stale: Vec<Arc<dyn Resource>> = self
            .shared
            .registry
            .read()
            .values()
            .filter(|entry| entry.resource.header().is_on_gpu() && !entry.resource.is_resident())
            .map(|entry| entry.resource.clone())
            .collect();

        let mut uploads = self.shared.uploads.lock();
        let mut requeued = 0;
        for resource in stale {
            if resource.header().mark_requeued() {
                debug!("Requeued {} {:?}", resource.kind(), resource.header().path());
                uploads.push(resource);
                requeued += 1;
            }
        }
        if requeued > 0 {
            info!("{} resource(s) queued for upload on the new backend", requeued);
        }
        requeued
    }

    fn is_registered(&self, resource: &dyn Resource) -> bool {
        let header = resource.header();
        self.shared
            .registry
            .read()
            .get(&path_hash(header.path()))
            .is_some_and(|entry| entry.resource.header().uuid() == header.uuid())
    }

    // ========================================================================
    // Loading
    // ========================================================================

    fn dispatch_load(&self, resource: Arc<dyn Resource>) {
        if !resource.header().begin_loading() {
            return;
        }
        match &self.shared.workers {
            Some(pool) => {
                let manager = self.clone();
                pool.execute(move || manager.run_load(resource));
            }
            None => self.run_load(resource),
        }
    }

    fn run_load(&self, resource: Arc<dyn Resource>) {
        let header = resource.header();
        if let Err(e) = resource.load(self) {
            error!("Failed to load {} {:?}: {}", resource.kind(), header.path(), e);
            header.mark_failed();
            return;
        }
        header.mark_loaded();
        debug!("Loaded {} {:?}", resource.kind(), header.path());
        self.enqueue_upload(resource);
    }

    fn enqueue_upload(&self, resource: Arc<dyn Resource>) {
        if !resource.header().mark_queued() {
            return;
        }

        let backend = self.backend();
        if self.shared.multithreaded_upload
            && backend.supports_multithreaded_upload()
            && let Some(pool) = &self.shared.workers
        {
            let manager = self.clone();
            pool.execute(move || manager.upload_on_worker(resource, &backend));
            return;
        }
        self.shared.uploads.lock().push(resource);
    }

    // ========================================================================
    // Uploading
    // ========================================================================

    fn upload_on_worker(&self, resource: Arc<dyn Resource>, backend: &Backend) {
        let lock = self.shared.recording_lock.read().clone();
        let outcome = match lock {
            Some(lock) => lock.with_lock(|| resource.send_to_gpu(backend)),
            None => resource.send_to_gpu(backend),
        };

        match outcome {
            Ok(UploadStatus::Uploaded) => self.finish_upload(resource.as_ref()),
            Ok(UploadStatus::NotReady) => {
                // Dependencies finish later; let the per-frame queue retry.
                self.shared.uploads.lock().push(resource);
            }
            Err(e) => {
                warn!(
                    "Upload of {} {:?} failed on worker: {}",
                    resource.kind(),
                    resource.header().path(),
                    e
                );
                self.shared.uploads.lock().push(resource);
            }
        }
    }

    /// Uploads at most one queued resource.
    ///
    /// Call once per frame from the render thread. Returns `None` when the
    /// queue is empty, otherwise the outcome for the resource that was tried.
    pub fn update_resource_to_send(&self) -> Option<UploadStatus> {
        let entry = self.shared.uploads.lock().pop()?;
        let backend = self.backend();

        match entry.item.send_to_gpu(&backend) {
            Ok(UploadStatus::Uploaded) => {
                self.finish_upload(entry.item.as_ref());
                Some(UploadStatus::Uploaded)
            }
            Ok(UploadStatus::NotReady) => {
                self.retry(entry, None);
                Some(UploadStatus::NotReady)
            }
            Err(e) => {
                self.retry(entry, Some(e));
                Some(UploadStatus::NotReady)
            }
        }
    }

    /// Calls [`ResourceManager::update_resource_to_send`] up to `limit` times.
    /// Returns how many resources reached the GPU.
    pub fn flush_uploads(&self, limit: usize) -> usize {
        let mut uploaded = 0;
        for _ in 0..limit {
            match self.update_resource_to_send() {
                None => break,
                Some(UploadStatus::Uploaded) => uploaded += 1,
                Some(UploadStatus::NotReady) => {}
            }
        }
        uploaded
    }

    fn finish_upload(&self, resource: &dyn Resource) {
        resource.header().mark_on_gpu();
        debug!("Uploaded {} {:?}", resource.kind(), resource.header().path());
    }

    fn retry(&self, entry: UploadEntry, error: Option<ResourceError>) {
        if !self.is_registered(entry.item.as_ref()) {
            debug!(
                "Dropping upload of unloaded {:?}",
                entry.item.header().path()
            );
            return;
        }

        let kind = entry.item.kind();
        let path = entry.item.header().path().to_path_buf();
        let attempts = self.shared.uploads.lock().requeue(entry);

        if let Some(e) = &error {
            debug!("Upload of {} {:?} failed (attempt {}): {}", kind, path, attempts, e);
        }
        if should_warn(attempts, self.shared.retry_warn_interval) {
            match error {
                Some(e) => warn!(
                    "Upload of {} {:?} still failing after {} attempts: {}",
                    kind, path, attempts, e
                ),
                None => warn!(
                    "Upload of {} {:?} still waiting on dependencies after {} attempts",
                    kind, path, attempts
                ),
            }
        }
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("resources", &self.resource_count())
            .field("pending_uploads", &self.pending_uploads())
            .field("backend", &*self.shared.backend.read())
            .finish()
    }
}

#[cfg(feature = "shaderc")]
fn default_compiler() -> Option<Arc<dyn ShaderCompiler>> {
    match crate::shader::ShadercCompiler::new() {
        Ok(compiler) => Some(Arc::new(compiler)),
        Err(e) => {
            warn!("GLSL compilation unavailable: {}", e);
            None
        }
    }
}

#[cfg(not(feature = "shaderc"))]
fn default_compiler() -> Option<Arc<dyn ShaderCompiler>> {
    None
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;
    use crate::mesh::MeshResource;
    use crate::state::ResourceState;

    /// Loads instantly (or fails while `fail_load` is set) and uploads once
    /// `ready` is set. `resident` answers [`Resource::is_resident`].
    struct Stub {
        header: ResourceHeader,
        loads: AtomicUsize,
        uploads: AtomicUsize,
        ready: AtomicBool,
        fail_load: AtomicBool,
        resident: AtomicBool,
    }

    impl Resource for Stub {
        fn header(&self) -> &ResourceHeader {
            &self.header
        }

        fn kind(&self) -> ResourceKind {
            ResourceKind::Texture
        }

        fn load(&self, _manager: &ResourceManager) -> ResourceResult<()> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail_load.load(Ordering::SeqCst) {
                return Err(ResourceError::Load {
                    path: self.header.path().to_path_buf(),
                    message: "stub failure".to_string(),
                });
            }
            Ok(())
        }

        fn send_to_gpu(&self, _backend: &Backend) -> ResourceResult<UploadStatus> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            if self.ready.load(Ordering::SeqCst) {
                Ok(UploadStatus::Uploaded)
            } else {
                Ok(UploadStatus::NotReady)
            }
        }

        fn is_resident(&self) -> bool {
            self.resident.load(Ordering::SeqCst)
        }
    }

    impl Loadable for Stub {
        const KIND: ResourceKind = ResourceKind::Texture;

        fn from_header(header: ResourceHeader) -> Self {
            Self {
                header,
                loads: AtomicUsize::new(0),
                uploads: AtomicUsize::new(0),
                ready: AtomicBool::new(true),
                fail_load: AtomicBool::new(false),
                resident: AtomicBool::new(true),
            }
        }
    }

    fn test_root() -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let root = std::env::temp_dir().join(format!(
            "ember-manager-{}-{nanos}",
            std::process::id()
        ));
        fs::create_dir_all(&root).unwrap();
        root
    }

    fn manager_with(worker_threads: usize) -> (ResourceManager, PathBuf) {
        let root = test_root();
        let config = ResourceConfig {
            worker_threads,
            asset_root: root.clone(),
            cache_file: root.join("resources.cache"),
            shader_cache_dir: root.join("shader_cache"),
            retry_warn_interval: 3,
            multithreaded_upload: false,
        };
        (ResourceManager::new(&config, Backend::Headless).unwrap(), root)
    }

    #[test]
    fn test_upload_queue_requeues_at_back() {
        let mut queue = UploadQueue::new();
        queue.push("a");
        queue.push("b");

        let a = queue.pop().unwrap();
        assert_eq!(queue.requeue(a), 1);
        let b = queue.pop().unwrap();
        assert_eq!((b.item, b.attempts), ("b", 0));
        let a = queue.pop().unwrap();
        assert_eq!((a.item, a.attempts), ("a", 1));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_should_warn_interval() {
        assert!(!should_warn(0, 120));
        assert!(!should_warn(119, 120));
        assert!(should_warn(120, 120));
        assert!(should_warn(240, 120));
        assert!(!should_warn(5, 0));
    }

    #[test]
    fn test_lexical_normalize() {
        assert_eq!(
            lexical_normalize(Path::new("/a/./b/../c.obj")),
            PathBuf::from("/a/c.obj")
        );
        assert_eq!(lexical_normalize(Path::new("/../x")), PathBuf::from("/x"));
        assert_eq!(lexical_normalize(Path::new("../x/./y")), PathBuf::from("../x/y"));
    }

    #[test]
    fn test_canonical_path_matches_for_missing_and_existing_files() {
        let root = test_root();
        let file = root.join("mesh.obj");
        let before = canonical_path(&root.join("sub/../mesh.obj"));
        fs::write(&file, "").unwrap();
        let after = canonical_path(&file);
        assert_eq!(before, after);
        assert_eq!(after, fs::canonicalize(&file).unwrap());
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_load_deduplicates_by_canonical_path() {
        let (manager, root) = manager_with(0);
        let a = manager.load::<Stub>("textures/a.png").unwrap();
        let b = manager.load::<Stub>("./textures/x/../a.png").unwrap();
        let c = manager.load::<Stub>(root.join("textures/a.png")).unwrap();

        assert_eq!(a.uuid(), b.uuid());
        assert_eq!(a.uuid(), c.uuid());
        assert_eq!(manager.resource_count(), 1);
        assert_eq!(a.resolve().unwrap().loads.load(Ordering::SeqCst), 1);
        assert!(manager.get::<Stub>("textures/a.png").is_some());
        assert!(manager.get::<Stub>("textures/b.png").is_none());
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_kind_mismatch() {
        let (manager, root) = manager_with(0);
        manager.load::<Stub>("shared.bin").unwrap();
        let result = manager.load::<MeshResource>("shared.bin");
        assert!(matches!(
            result,
            Err(ResourceError::KindMismatch {
                registered: ResourceKind::Texture,
                requested: ResourceKind::Mesh,
                ..
            })
        ));
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_upload_reaches_gpu_state() {
        let (manager, root) = manager_with(0);
        let handle = manager.load::<Stub>("a.png").unwrap();
        assert_eq!(handle.state(), Some(ResourceState::QueuedForUpload));
        assert_eq!(manager.pending_uploads(), 1);

        assert_eq!(manager.update_resource_to_send(), Some(UploadStatus::Uploaded));
        assert_eq!(manager.update_resource_to_send(), None);
        assert!(handle.is_ready());
        assert!(handle.resolve().unwrap().header().on_sent_to_gpu().is_fired());
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_not_ready_upload_is_retried_not_dropped() {
        let (manager, root) = manager_with(0);
        let blocked = manager
            .register("blocked.png", |header| {
                let stub = Stub::from_header(header);
                stub.ready.store(false, Ordering::SeqCst);
                stub
            })
            .unwrap();
        let other = manager.load::<Stub>("other.png").unwrap();

        // Blocked goes to the back; the other resource is not starved.
        assert_eq!(manager.update_resource_to_send(), Some(UploadStatus::NotReady));
        assert_eq!(manager.update_resource_to_send(), Some(UploadStatus::Uploaded));
        assert!(other.is_ready());

        assert_eq!(manager.flush_uploads(10), 0);
        assert_eq!(manager.pending_uploads(), 1);
        let stub = blocked.resolve().unwrap();
        assert_eq!(stub.uploads.load(Ordering::SeqCst), 11);

        stub.ready.store(true, Ordering::SeqCst);
        assert_eq!(manager.flush_uploads(10), 1);
        assert!(blocked.is_ready());
        assert_eq!(manager.pending_uploads(), 0);
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_backend_switch_requeues_non_resident_uploads() {
        let (manager, root) = manager_with(0);
        let headless = manager
            .register("headless.png", |header| {
                let stub = Stub::from_header(header);
                stub.resident.store(false, Ordering::SeqCst);
                stub
            })
            .unwrap();
        let resident = manager.load::<Stub>("resident.png").unwrap();
        assert_eq!(manager.flush_uploads(8), 2);
        assert!(headless.is_ready() && resident.is_ready());

        assert_eq!(manager.set_backend(Backend::Headless), 1);
        assert_eq!(headless.state(), Some(ResourceState::QueuedForUpload));
        assert!(resident.is_ready());
        assert_eq!(manager.pending_uploads(), 1);

        assert_eq!(manager.flush_uploads(8), 1);
        assert!(headless.is_ready());
        assert_eq!(headless.resolve().unwrap().uploads.load(Ordering::SeqCst), 2);
        assert_eq!(resident.resolve().unwrap().uploads.load(Ordering::SeqCst), 1);

        // Queued resources are left alone.
        let queued = manager
            .register("queued.png", |header| {
                let stub = Stub::from_header(header);
                stub.resident.store(false, Ordering::SeqCst);
                stub
            })
            .unwrap();
        assert_eq!(manager.set_backend(Backend::Headless), 1);
        assert_eq!(queued.state(), Some(ResourceState::QueuedForUpload));
        assert_eq!(manager.pending_uploads(), 2);
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_failed_load_is_never_queued() {
        let (manager, root) = manager_with(0);
        let handle = manager
            .register("broken.png", |header| {
                let stub = Stub::from_header(header);
                stub.fail_load.store(true, Ordering::SeqCst);
                stub
            })
            .unwrap();
        assert_eq!(handle.state(), Some(ResourceState::Failed));
        assert!(!handle.resolve().unwrap().header().wait_loaded());
        assert_eq!(manager.pending_uploads(), 0);
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_unload_expires_handles_and_clears_queue() {
        let (manager, root) = manager_with(0);
        let handle = manager.load::<Stub>("gone.png").unwrap();
        assert_eq!(manager.pending_uploads(), 1);

        assert!(manager.unload("gone.png"));
        assert!(!manager.unload("gone.png"));
        assert_eq!(manager.pending_uploads(), 0);
        assert_eq!(manager.resource_count(), 0);
        assert!(matches!(handle.resolve(), Err(ResourceError::Expired(_))));
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_worker_pool_loads_concurrently() {
        let (manager, root) = manager_with(3);
        let handles: Vec<_> = (0..16)
            .map(|i| manager.load::<Stub>(format!("t{i}.png")).unwrap())
            .collect();

        for handle in &handles {
            assert!(handle.resolve().unwrap().header().wait_loaded());
        }
        // Loaded fires just before the resource is queued.
        while manager.pending_uploads() < handles.len() {
            std::thread::yield_now();
        }
        assert_eq!(manager.flush_uploads(usize::MAX), handles.len());
        assert!(handles.iter().all(ResourceHandle::is_ready));
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_uuid_cache_survives_restart() {
        let (manager, root) = manager_with(0);
        let first = manager.load::<Stub>("persist.png").unwrap().uuid();
        manager.save_cache().unwrap();

        let config = ResourceConfig {
            worker_threads: 0,
            asset_root: root.clone(),
            cache_file: root.join("resources.cache"),
            ..ResourceConfig::default()
        };
        let restarted = ResourceManager::new(&config, Backend::Headless).unwrap();
        assert_eq!(
            restarted.load::<Stub>("persist.png").unwrap().uuid(),
            first
        );
        fs::remove_dir_all(root).unwrap();
    }
}
