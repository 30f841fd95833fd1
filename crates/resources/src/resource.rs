//! The resource trait, its shared header and weak handles.
//!
//! # Overview
//!
//! Every loadable asset embeds a [`ResourceHeader`] (identity, lifecycle
//! state, completion events) and implements [`Resource`]:
//!
//! - [`Resource::load`] runs on a worker thread and parses CPU-side data
//! - [`Resource::send_to_gpu`] runs where uploads are allowed and creates the
//!   GPU objects; it may answer [`UploadStatus::NotReady`] while a
//!   dependency is still on its way, and the manager retries later
//!
//! The registry owns the only strong reference. Everything else holds a
//! [`ResourceHandle`], which must be resolved before use and fails once the
//! resource is unloaded.

use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use ember_renderer::Backend;
use uuid::Uuid;

use crate::error::{ResourceError, ResourceResult};
use crate::manager::ResourceManager;
use crate::state::{AtomicResourceState, OneShot, ResourceState};

/// Concrete resource types known to the manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Mesh,
    Texture,
    Shader,
    Material,
    Model,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Mesh => "mesh",
            ResourceKind::Texture => "texture",
            ResourceKind::Shader => "shader",
            ResourceKind::Material => "material",
            ResourceKind::Model => "model",
        };
        f.write_str(name)
    }
}

/// Outcome of one upload attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadStatus {
    /// GPU objects exist; the resource is drawable.
    Uploaded,
    /// A dependency is not on the GPU yet. Retry later.
    NotReady,
}

/// Identity and lifecycle shared by every resource.
pub struct ResourceHeader {
    uuid: Uuid,
    path: PathBuf,
    state: AtomicResourceState,
    on_loaded: OneShot<bool>,
    on_sent_to_gpu: OneShot<()>,
}

impl ResourceHeader {
    pub fn new(uuid: Uuid, path: PathBuf) -> Self {
        Self {
            uuid,
            path,
            state: AtomicResourceState::new(ResourceState::Registered),
            on_loaded: OneShot::new(),
            on_sent_to_gpu: OneShot::new(),
        }
    }

    #[inline]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Canonical path the resource is registered under.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn state(&self) -> ResourceState {
        self.state.get()
    }

    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.state().is_loaded()
    }

    #[inline]
    pub fn is_on_gpu(&self) -> bool {
        self.state() == ResourceState::OnGpu
    }

    /// Fires with `true` once CPU data is ready, or `false` if loading failed.
    pub fn on_loaded(&self) -> &OneShot<bool> {
        &self.on_loaded
    }

    /// Fires once the resource reaches [`ResourceState::OnGpu`].
    pub fn on_sent_to_gpu(&self) -> &OneShot<()> {
        &self.on_sent_to_gpu
    }

    /// Blocks until loading finished. Returns whether it succeeded.
    pub fn wait_loaded(&self) -> bool {
        self.on_loaded.wait()
    }

    /// Blocks until the resource is on the GPU.
    pub fn wait_on_gpu(&self) {
        self.on_sent_to_gpu.wait();
    }

    // ========================================================================
    // Transitions driven by the manager
    // ========================================================================

    pub(crate) fn begin_loading(&self) -> bool {
        self.state
            .transition(ResourceState::Registered, ResourceState::Loading)
    }

    pub(crate) fn mark_loaded(&self) {
        if self
            .state
            .transition(ResourceState::Loading, ResourceState::Loaded)
            || self
                .state
                .transition(ResourceState::Registered, ResourceState::Loaded)
        {
            self.on_loaded.fire(true);
        }
    }

    pub(crate) fn mark_failed(&self) {
        if self
            .state
            .transition(ResourceState::Loading, ResourceState::Failed)
        {
            self.on_loaded.fire(false);
        }
    }

    pub(crate) fn mark_queued(&self) -> bool {
        self.state
            .transition(ResourceState::Loaded, ResourceState::QueuedForUpload)
    }

    /// Puts an uploaded resource back in the upload queue.
    pub(crate) fn mark_requeued(&self) -> bool {
        self.state
            .transition(ResourceState::OnGpu, ResourceState::QueuedForUpload)
    }

    pub(crate) fn mark_on_gpu(&self) {
        if self
            .state
            .transition(ResourceState::QueuedForUpload, ResourceState::OnGpu)
        {
            self.on_sent_to_gpu.fire(());
        }
    }
}

impl fmt::Debug for ResourceHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHeader")
            .field("uuid", &self.uuid)
            .field("path", &self.path)
            .field("state", &self.state())
            .finish()
    }
}

/// A loadable, uploadable asset.
pub trait Resource: Send + Sync + 'static {
    fn header(&self) -> &ResourceHeader;

    fn kind(&self) -> ResourceKind;

    /// Parses CPU-side data. Runs on a worker thread.
    ///
    /// `manager` is available for requesting dependencies; those load
    /// independently and are checked again in [`Resource::send_to_gpu`].
    fn load(&self, manager: &ResourceManager) -> ResourceResult<()>;

    /// Creates GPU objects from the loaded data.
    ///
    /// The headless backend has no device; implementations accept the upload
    /// without creating anything so the pipeline still completes.
    fn send_to_gpu(&self, backend: &Backend) -> ResourceResult<UploadStatus>;

    /// True once the GPU objects this resource owns exist.
    ///
    /// Resources uploaded on the headless backend answer `false`, and
    /// [`ResourceManager::set_backend`] queues them again. Resources that own
    /// nothing on the GPU keep the default.
    fn is_resident(&self) -> bool {
        true
    }
}

/// A resource the manager can construct from a path.
pub trait Loadable: Resource + Sized {
    const KIND: ResourceKind;

    /// Builds an unloaded resource around `header`.
    fn from_header(header: ResourceHeader) -> Self;
}

/// Weak reference to a registered resource.
///
/// Resolving fails with [`ResourceError::Expired`] once the resource has
/// been unloaded and every in-flight user has released it.
pub struct ResourceHandle<T> {
    resource: Weak<T>,
    uuid: Uuid,
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Resource> ResourceHandle<T> {
    pub(crate) fn new(resource: &Arc<T>) -> Self {
        let header = resource.header();
        Self {
            resource: Arc::downgrade(resource),
            uuid: header.uuid(),
            path: header.path().to_path_buf(),
            _marker: PhantomData,
        }
    }

    /// Upgrades to a strong reference.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::Expired`] if the resource is gone.
    pub fn resolve(&self) -> ResourceResult<Arc<T>> {
        self.resource
            .upgrade()
            .ok_or_else(|| ResourceError::Expired(self.path.clone()))
    }

    /// Current state, or `None` if the resource is gone.
    pub fn state(&self) -> Option<ResourceState> {
        self.resource.upgrade().map(|r| r.header().state())
    }

    /// True if the resource is alive and on the GPU.
    pub fn is_ready(&self) -> bool {
        self.state() == Some(ResourceState::OnGpu)
    }

    #[inline]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T> Clone for ResourceHandle<T> {
    fn clone(&self) -> Self {
        Self {
            resource: self.resource.clone(),
            uuid: self.uuid,
            path: self.path.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for ResourceHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("uuid", &self.uuid)
            .field("path", &self.path)
            .field("alive", &(self.resource.strong_count() > 0))
            .finish()
    }
}
