//! Graphics backend seam
//!
//! `GraphicsBackend` is the one dispatch table every surface in the process
//! talks to. It is wrapped in a `Graphics` handle that is injected (as an
//! `Arc`) into surfaces, registries and engines instead of living in an
//! ambient global, so each test can run against its own fake backend.
//!
//! `Graphics` also owns the two pieces of process-wide state the core must
//! police:
//! - lazy, idempotent backend initialization, triggered by the first surface
//!   constructed anywhere in the process;
//! - the context binding table: a thread has at most one current context, and
//!   a context is current on at most one thread.

use crate::error::{BackendError, SurfaceError};
use crate::input::{Dispatch, InputRouter, SurfaceEvent};
use crate::{BackendType, DeviceCapabilities};
use lockstep_core::sync::MutexExt;
use lockstep_core::SurfaceId;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

/// Identifier of one native graphics context.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Resource namespace shared by a root context and everything created
/// against it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShareGroup(pub u64);

/// Backend-neutral handle to a surface's graphics context.
///
/// `resources` carries whatever the backend needs to let another context
/// share this one's buffers, textures and programs (for wgpu: the device).
#[derive(Clone)]
pub struct ContextHandle {
    id: ContextId,
    group: ShareGroup,
    resources: Option<Arc<dyn Any + Send + Sync>>,
}

impl ContextHandle {
    /// A context that starts its own share group.
    pub fn root(id: ContextId) -> Self {
        Self {
            id,
            group: ShareGroup(id.0),
            resources: None,
        }
    }

    /// A context joining `root`'s share group.
    pub fn shared_with(id: ContextId, root: &ContextHandle) -> Self {
        Self {
            id,
            group: root.group,
            resources: root.resources.clone(),
        }
    }

    pub fn with_resources(mut self, resources: Arc<dyn Any + Send + Sync>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn group(&self) -> ShareGroup {
        self.group
    }

    pub fn resources<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.resources.clone()?.downcast::<T>().ok()
    }
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("id", &self.id)
            .field("group", &self.group)
            .field("has_resources", &self.resources.is_some())
            .finish()
    }
}

/// What the backend needs to create one native surface.
#[derive(Debug, Clone)]
pub struct SurfaceDescriptor {
    pub id: SurfaceId,
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
}

/// The process-wide graphics + windowing backend.
pub trait GraphicsBackend: Send + Sync {
    fn backend_type(&self) -> BackendType;

    /// Bring the backend up. Called at most once per `Graphics` lifetime
    /// (again only after `shutdown`).
    fn init(&self) -> Result<DeviceCapabilities, BackendError>;

    fn shutdown(&self);

    /// Create an OS surface and its context. With `share_with`, the new
    /// context joins that context's resource namespace.
    fn create_surface(
        &self,
        desc: &SurfaceDescriptor,
        share_with: Option<&ContextHandle>,
    ) -> Result<Box<dyn NativeSurface>, SurfaceError>;

    /// Drain the OS event queue once, forwarding every surface event.
    fn pump_events(&self, sink: &mut dyn FnMut(SurfaceId, SurfaceEvent));
}

/// One OS surface plus its graphics context.
///
/// Every method except `context` and `close_requested` is only ever called
/// from the thread that currently holds the context.
pub trait NativeSurface: Send {
    fn context(&self) -> &ContextHandle;

    /// Bind the context to the calling thread at the API level.
    fn make_current(&mut self) -> Result<(), SurfaceError> {
        Ok(())
    }

    /// OS-level close request not delivered through the event pump.
    fn close_requested(&self) -> bool {
        false
    }

    fn resize(&mut self, width: u32, height: u32);
    fn set_title(&mut self, title: &str);
    fn set_vsync(&mut self, enabled: bool);
    fn set_fullscreen(&mut self, fullscreen: bool);

    fn begin_frame(&mut self) -> Result<(), SurfaceError>;
    fn set_viewport(&mut self, x: u32, y: u32, width: u32, height: u32);
    fn clear(&mut self, color: [f32; 4]);
    fn end_frame(&mut self);
    fn swap_buffers(&mut self) -> Result<(), SurfaceError>;
}

enum BackendState {
    Uninitialized,
    Ready(DeviceCapabilities),
}

#[derive(Default)]
struct Bindings {
    by_thread: HashMap<ThreadId, ContextId>,
    by_context: HashMap<ContextId, ThreadId>,
}

/// Shared handle to the process-wide backend.
pub struct Graphics {
    backend: Arc<dyn GraphicsBackend>,
    state: Mutex<BackendState>,
    bindings: Mutex<Bindings>,
    input: InputRouter,
}

impl Graphics {
    pub fn new(backend: Arc<dyn GraphicsBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            state: Mutex::new(BackendState::Uninitialized),
            bindings: Mutex::new(Bindings::default()),
            input: InputRouter::new(),
        })
    }

    pub fn backend_type(&self) -> BackendType {
        self.backend.backend_type()
    }

    /// Initialize the backend if nobody has yet. Concurrent callers block
    /// until the first one finishes; a failed init is retried next time.
    pub fn ensure_initialized(&self) -> Result<DeviceCapabilities, BackendError> {
        let mut state = self.state.lock_or_recover();
        if let BackendState::Ready(caps) = &*state {
            return Ok(caps.clone());
        }
        let caps = self.backend.init()?;
        tracing::info!(
            backend = ?caps.backend,
            max_texture_size = caps.max_texture_size,
            "graphics backend initialized"
        );
        *state = BackendState::Ready(caps.clone());
        Ok(caps)
    }

    pub fn is_initialized(&self) -> bool {
        matches!(*self.state.lock_or_recover(), BackendState::Ready(_))
    }

    pub fn capabilities(&self) -> Option<DeviceCapabilities> {
        match &*self.state.lock_or_recover() {
            BackendState::Ready(caps) => Some(caps.clone()),
            BackendState::Uninitialized => None,
        }
    }

    /// Release the backend. The next surface created re-initializes it.
    pub fn shutdown(&self) {
        let mut state = self.state.lock_or_recover();
        if matches!(*state, BackendState::Ready(_)) {
            self.backend.shutdown();
            *state = BackendState::Uninitialized;
            *self.bindings.lock_or_recover() = Bindings::default();
            tracing::info!("graphics backend shut down");
        }
    }

    pub(crate) fn create_native(
        &self,
        desc: &SurfaceDescriptor,
        share_with: Option<&ContextHandle>,
    ) -> Result<Box<dyn NativeSurface>, SurfaceError> {
        self.ensure_initialized()?;
        self.backend.create_surface(desc, share_with)
    }

    /// Make `context` current on the calling thread, replacing whatever was
    /// current there. Returns `false` if it already was.
    pub fn make_current(&self, context: ContextId) -> Result<bool, SurfaceError> {
        let me = thread::current().id();
        let mut bindings = self.bindings.lock_or_recover();

        if bindings.by_thread.get(&me) == Some(&context) {
            return Ok(false);
        }
        if let Some(owner) = bindings.by_context.get(&context) {
            if *owner != me {
                return Err(SurfaceError::ContextBusy { context });
            }
        }
        if let Some(previous) = bindings.by_thread.insert(me, context) {
            bindings.by_context.remove(&previous);
        }
        bindings.by_context.insert(context, me);
        Ok(true)
    }

    pub fn is_current(&self, context: ContextId) -> bool {
        let me = thread::current().id();
        self.bindings.lock_or_recover().by_thread.get(&me) == Some(&context)
    }

    /// Context current on the calling thread, if any.
    pub fn current_context(&self) -> Option<ContextId> {
        let me = thread::current().id();
        self.bindings.lock_or_recover().by_thread.get(&me).copied()
    }

    /// Drop `context` from the binding table, whichever thread holds it.
    pub fn release_context(&self, context: ContextId) {
        let mut bindings = self.bindings.lock_or_recover();
        if let Some(owner) = bindings.by_context.remove(&context) {
            bindings.by_thread.remove(&owner);
        }
    }

    pub fn input(&self) -> &InputRouter {
        &self.input
    }

    /// Pump the OS event queue once and route every event to its surface.
    /// Returns the number of events delivered.
    pub fn pump_events(&self) -> usize {
        let mut delivered = 0;
        let input = &self.input;
        self.backend.pump_events(&mut |surface, event| {
            match input.dispatch(surface, &event) {
                Dispatch::Delivered => delivered += 1,
                Dispatch::Unrouted => {
                    tracing::trace!(%surface, ?event, "event for unknown surface dropped")
                }
                Dispatch::Reentrant => {
                    tracing::warn!(%surface, ?event, "reentrant input dispatch dropped")
                }
            }
        });
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessBackend;

    #[test]
    fn test_lazy_init_is_idempotent() {
        let backend = HeadlessBackend::new();
        let graphics = Graphics::new(backend.clone());
        assert!(!graphics.is_initialized());

        graphics.ensure_initialized().unwrap();
        graphics.ensure_initialized().unwrap();
        assert_eq!(backend.init_count(), 1);
        assert_eq!(graphics.capabilities().unwrap().backend, BackendType::Headless);

        graphics.shutdown();
        graphics.shutdown();
        assert_eq!(backend.shutdown_count(), 1);
        assert!(!graphics.is_initialized());
    }

    #[test]
    fn test_failed_init_is_retried() {
        let backend = HeadlessBackend::new();
        backend.fail_next_init();
        let graphics = Graphics::new(backend.clone());
        assert!(graphics.ensure_initialized().is_err());
        assert!(!graphics.is_initialized());
        graphics.ensure_initialized().unwrap();
        assert_eq!(backend.init_count(), 1);
    }

    #[test]
    fn test_one_current_context_per_thread() {
        let graphics = Graphics::new(HeadlessBackend::new());
        let a = ContextId(1);
        let b = ContextId(2);

        assert!(graphics.make_current(a).unwrap());
        assert!(!graphics.make_current(a).unwrap());
        assert!(graphics.make_current(b).unwrap());
        assert!(!graphics.is_current(a));
        assert_eq!(graphics.current_context(), Some(b));
    }

    #[test]
    fn test_context_cannot_be_current_on_two_threads() {
        let graphics = Graphics::new(HeadlessBackend::new());
        let ctx = ContextId(7);
        graphics.make_current(ctx).unwrap();

        let other = Arc::clone(&graphics);
        let result = thread::spawn(move || other.make_current(ctx)).join().unwrap();
        assert!(matches!(result, Err(SurfaceError::ContextBusy { context }) if context == ctx));

        graphics.release_context(ctx);
        let other = Arc::clone(&graphics);
        let result = thread::spawn(move || other.make_current(ctx)).join().unwrap();
        assert!(result.unwrap());
    }

    #[test]
    fn test_share_group_follows_root() {
        let root = ContextHandle::root(ContextId(10)).with_resources(Arc::new(5u32));
        let child = ContextHandle::shared_with(ContextId(11), &root);
        assert_eq!(child.group(), root.group());
        assert_eq!(child.resources::<u32>().as_deref(), Some(&5));
        assert!(child.resources::<String>().is_none());
    }
}
