//! Explicit GPU context shared by the renderer and resource uploads.
//!
//! [`GpuContext`] bundles the objects that live for the whole process: the
//! Vulkan instance, the window surface, the logical device, the transfer
//! context used for synchronous uploads, the placeholder texture bound to
//! unset sampler slots, and what shader programs need to be built (attachment
//! formats and the reflector). It is created once and passed by `Arc` to
//! whoever needs it.
//!
//! [`Backend`] is the capability view resource uploads receive. It is resolved
//! once when the renderer is constructed.

use std::mem::ManuallyDrop;
use std::sync::Arc;

use tracing::{error, info};

use ember_core::RendererConfig;
use ember_rhi::RhiError;
use ember_rhi::command::TransferContext;
use ember_rhi::device::Device;
use ember_rhi::instance::Instance;
use ember_rhi::physical_device::select_physical_device;
use ember_rhi::reflection::{ShaderReflector, SpirvReflector};
use ember_rhi::surface::{Surface, WindowSurface};
use ember_rhi::swapchain::{SwapchainSupportDetails, choose_surface_format};
use ember_rhi::texture::Texture;

use crate::depth_buffer::DEFAULT_DEPTH_FORMAT;
use crate::error::{RenderError, RenderResult};
use crate::program::{ProgramOptions, RenderTargets, ShaderCode, ShaderProgram};

/// Process-wide GPU objects.
///
/// Dropped in dependency order: placeholder texture, transfer context, device,
/// surface, instance.
pub struct GpuContext {
    targets: RenderTargets,
    reflector: Arc<dyn ShaderReflector>,
    placeholder: ManuallyDrop<Arc<Texture>>,
    transfer: ManuallyDrop<TransferContext>,
    device: ManuallyDrop<Arc<Device>>,
    surface: ManuallyDrop<Surface>,
    instance: ManuallyDrop<Instance>,
}

impl GpuContext {
    /// Creates the instance, surface and device for `window`.
    ///
    /// # Errors
    ///
    /// Returns an error if no instance can be created, surface creation
    /// fails, or no physical device qualifies. Objects created before the
    /// failure are released.
    pub fn new(window: &dyn WindowSurface, config: &RendererConfig) -> RenderResult<Arc<Self>> {
        let extensions = window.required_extensions()?;
        let instance = Instance::new(config.validation, &extensions)?;
        let surface = window.create_surface(instance.entry(), instance.handle())?;

        let physical_device = select_physical_device(instance.handle(), &surface)?;
        let support = SwapchainSupportDetails::query(physical_device.device, &surface)?;
        if !support.is_adequate() {
            return Err(RhiError::SwapchainError(
                "surface reports no formats or present modes".to_string(),
            )
            .into());
        }
        let targets = RenderTargets::new(
            choose_surface_format(&support.formats).format,
            Some(DEFAULT_DEPTH_FORMAT),
        );

        let device = Device::new(&instance, &physical_device)?;
        let transfer = TransferContext::new(device.clone())?;
        let placeholder = Arc::new(Texture::placeholder(&transfer)?);

        info!("GPU context ready on '{}'", device.name());

        Ok(Arc::new(Self {
            targets,
            reflector: Arc::new(SpirvReflector),
            placeholder: ManuallyDrop::new(placeholder),
            transfer: ManuallyDrop::new(transfer),
            device: ManuallyDrop::new(device),
            surface: ManuallyDrop::new(surface),
            instance: ManuallyDrop::new(instance),
        }))
    }

    #[inline]
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    #[inline]
    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Transfer context for synchronous staging uploads.
    #[inline]
    pub fn transfer(&self) -> &TransferContext {
        &self.transfer
    }

    /// 1x1 white texture bound to sampler slots that have no texture.
    #[inline]
    pub fn placeholder_texture(&self) -> &Arc<Texture> {
        &self.placeholder
    }

    /// Attachment formats of the frame's rendering scope.
    #[inline]
    pub fn render_targets(&self) -> RenderTargets {
        self.targets
    }

    #[inline]
    pub fn reflector(&self) -> &dyn ShaderReflector {
        self.reflector.as_ref()
    }

    /// Builds a shader program against the frame's attachment formats.
    ///
    /// Safe to call from worker threads.
    ///
    /// # Errors
    ///
    /// See [`ShaderProgram::new`].
    pub fn create_program(
        &self,
        name: &str,
        code: &ShaderCode,
        options: &ProgramOptions,
    ) -> RenderResult<Arc<ShaderProgram>> {
        ShaderProgram::new(
            self.device().clone(),
            name,
            code,
            self.targets,
            options,
            self.reflector(),
        )
        .map(Arc::new)
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            error!("Failed to wait for device idle during context drop: {:?}", e);
        }

        unsafe {
            ManuallyDrop::drop(&mut self.placeholder);
            ManuallyDrop::drop(&mut self.transfer);
        }

        let device = unsafe { ManuallyDrop::take(&mut self.device) };
        let outstanding = Arc::strong_count(&device) - 1;
        drop(device);

        unsafe {
            ManuallyDrop::drop(&mut self.surface);
        }

        if outstanding > 0 {
            // Destroying the instance under a live device is undefined
            // behavior; leaking it is the lesser failure at shutdown.
            error!(
                "{} GPU object(s) still reference the device; leaking the Vulkan instance",
                outstanding
            );
            return;
        }

        unsafe {
            ManuallyDrop::drop(&mut self.instance);
        }
        info!("GPU context destroyed");
    }
}

/// Backend selected at renderer construction.
///
/// Only one backend is live per process. `Headless` runs every CPU-side path
/// (loading, registry, upload queue) without a device, which is what tools
/// and tests use.
#[derive(Clone)]
pub enum Backend {
    Vulkan(Arc<GpuContext>),
    Headless,
}

impl Backend {
    /// Whether uploads may be issued from worker threads.
    ///
    /// Vulkan uploads go through the mutex-guarded transfer pool and graphics
    /// queue, so they can run off the render thread.
    pub fn supports_multithreaded_upload(&self) -> bool {
        matches!(self, Backend::Vulkan(_))
    }

    /// Returns the GPU context.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::Headless`] for the headless backend.
    pub fn gpu(&self) -> RenderResult<&Arc<GpuContext>> {
        match self {
            Backend::Vulkan(context) => Ok(context),
            Backend::Headless => Err(RenderError::Headless),
        }
    }

    #[inline]
    pub fn is_headless(&self) -> bool {
        matches!(self, Backend::Headless)
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Vulkan(_) => "vulkan",
            Backend::Headless => "headless",
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_backend_capabilities() {
        let backend = Backend::Headless;
        assert!(backend.is_headless());
        assert!(!backend.supports_multithreaded_upload());
        assert!(matches!(backend.gpu(), Err(RenderError::Headless)));
        assert_eq!(format!("{backend:?}"), "headless");
    }

    #[test]
    fn test_context_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<GpuContext>();
        assert_send_sync::<Backend>();
    }
}
