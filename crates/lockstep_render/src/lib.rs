//! Lockstep Render System
//!
//! Surfaces, their graphics contexts and the process-wide backend they share.
//! The backend sits behind `GraphicsBackend`; the `native` feature provides a
//! winit + wgpu implementation and `HeadlessBackend` is always available.

pub mod backend;
pub mod error;
pub mod headless;
pub mod input;
#[cfg(feature = "native")]
pub mod native;
pub mod overlay;
pub mod registry;
pub mod surface;

pub use backend::{
    ContextHandle, ContextId, Graphics, GraphicsBackend, NativeSurface, ShareGroup,
    SurfaceDescriptor,
};
pub use error::{BackendError, InputError, OverlayError, SurfaceError};
pub use headless::HeadlessBackend;
pub use input::{InputRouter, InputState, MouseButton, SurfaceEvent};
pub use overlay::{OverlayContext, OverlayItem};
pub use registry::SurfaceRegistry;
pub use surface::{Frame, RenderSurface};

#[cfg(feature = "native")]
pub use wgpu;
#[cfg(feature = "native")]
pub use winit;

use std::sync::{Arc, Mutex};

/// Surfaces are shared between the registry and an in-flight render pass.
pub type SurfaceHandle = Arc<Mutex<RenderSurface>>;

/// Rendering backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// Metal (macOS, iOS)
    Metal,
    /// DirectX 12 (Windows)
    DirectX12,
    /// Vulkan (cross-platform)
    Vulkan,
    /// OpenGL (cross-platform, fallback)
    OpenGL,
    /// WebGPU (browser)
    WebGpu,
    /// In-process, no OS surfaces
    Headless,
}

/// Capability recorder result
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    pub backend: BackendType,
    pub max_texture_size: u32,
    pub supports_compute: bool,
    pub supports_instancing: bool,
}

/// Pick the backend for this build: native windows when the `native`
/// feature is on and `headless` is not requested, the headless backend
/// otherwise.
pub fn default_backend(headless: bool) -> Arc<dyn GraphicsBackend> {
    #[cfg(feature = "native")]
    if !headless {
        return Arc::new(native::NativeBackend::new());
    }
    #[cfg(not(feature = "native"))]
    if !headless {
        tracing::warn!("built without the `native` feature, falling back to headless rendering");
    }
    HeadlessBackend::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_default_backend() {
        let backend = default_backend(true);
        assert_eq!(backend.backend_type(), BackendType::Headless);
    }
}
