//! Native backend: winit windows, wgpu surfaces
//!
//! winit only allows one event loop per process and it must stay on the
//! thread that created it. `init` creates it in a thread-local on the calling
//! thread (the render/event thread) and it is kept for the rest of the
//! process, across `shutdown`. Surfaces must be created and events pumped on
//! that same thread.
//!
//! The first surface of a share group requests a wgpu device; it is handed to
//! later surfaces through the root `ContextHandle`'s resources, so every
//! surface in a group allocates from one device.

mod events;
mod surface;

use crate::backend::{ContextHandle, ContextId, GraphicsBackend, NativeSurface, SurfaceDescriptor};
use crate::error::{BackendError, SurfaceError};
use crate::input::SurfaceEvent;
use crate::{BackendType, DeviceCapabilities};
use lockstep_core::sync::MutexExt;
use lockstep_core::SurfaceId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use surface::WgpuSurface;
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};
use winit::window::{Window, WindowAttributes, WindowId};

thread_local! {
    static EVENT_LOOP: RefCell<Option<EventLoop<()>>> = const { RefCell::new(None) };
}

/// GPU objects shared by every surface of one share group.
pub struct SharedDevice {
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

struct NativeState {
    instance: Arc<wgpu::Instance>,
    backend: BackendType,
}

pub struct NativeBackend {
    state: Mutex<Option<NativeState>>,
    windows: Arc<Mutex<HashMap<WindowId, SurfaceId>>>,
    next_context: AtomicU64,
}

impl NativeBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
            windows: Arc::default(),
            next_context: AtomicU64::new(1),
        }
    }

    fn instance(&self) -> Result<Arc<wgpu::Instance>, BackendError> {
        self.state
            .lock_or_recover()
            .as_ref()
            .map(|state| Arc::clone(&state.instance))
            .ok_or_else(|| BackendError::Unavailable("native backend is not initialized".into()))
    }
}

impl Default for NativeBackend {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn present_mode(vsync: bool) -> wgpu::PresentMode {
    if vsync {
        wgpu::PresentMode::AutoVsync
    } else {
        wgpu::PresentMode::AutoNoVsync
    }
}

fn backend_type(backend: wgpu::Backend) -> BackendType {
    match backend {
        wgpu::Backend::Metal => BackendType::Metal,
        wgpu::Backend::Dx12 => BackendType::DirectX12,
        wgpu::Backend::Vulkan => BackendType::Vulkan,
        wgpu::Backend::BrowserWebGpu => BackendType::WebGpu,
        _ => BackendType::OpenGL,
    }
}

// The loop is pumped, never run, so windows come from the deprecated path.
#[allow(deprecated)]
fn create_window(
    event_loop: &EventLoop<()>,
    attributes: WindowAttributes,
) -> Result<Window, String> {
    event_loop.create_window(attributes).map_err(|err| err.to_string())
}

fn request_device(
    instance: &wgpu::Instance,
    surface: &wgpu::Surface<'static>,
    title: &str,
) -> Result<SharedDevice, SurfaceError> {
    let creation = |reason: String| SurfaceError::Creation {
        title: title.to_string(),
        reason,
    };

    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::default(),
        compatible_surface: Some(surface),
        force_fallback_adapter: false,
    }))
    .ok_or_else(|| creation("no compatible GPU adapter".into()))?;

    let (device, queue) = pollster::block_on(adapter.request_device(
        &wgpu::DeviceDescriptor {
            label: Some("Lockstep Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::default(),
        },
        None,
    ))
    .map_err(|err| creation(err.to_string()))?;

    tracing::info!(adapter = ?adapter.get_info().name, "GPU device created");
    Ok(SharedDevice {
        adapter,
        device,
        queue,
    })
}

impl GraphicsBackend for NativeBackend {
    fn backend_type(&self) -> BackendType {
        // Reported as Vulkan until `init` has picked an adapter.
        self.state
            .lock_or_recover()
            .as_ref()
            .map(|state| state.backend)
            .unwrap_or(BackendType::Vulkan)
    }

    fn init(&self) -> Result<DeviceCapabilities, BackendError> {
        EVENT_LOOP.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_none() {
                let event_loop =
                    EventLoop::new().map_err(|err| BackendError::Init(err.to_string()))?;
                *slot = Some(event_loop);
            }
            Ok::<_, BackendError>(())
        })?;

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
                .ok_or_else(|| BackendError::Init("no GPU adapter available".into()))?;
        let info = adapter.get_info();
        let caps = DeviceCapabilities {
            backend: backend_type(info.backend),
            max_texture_size: adapter.limits().max_texture_dimension_2d,
            supports_compute: adapter
                .get_downlevel_capabilities()
                .flags
                .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS),
            supports_instancing: true,
        };
        tracing::debug!(adapter = %info.name, driver = %info.driver, "selected GPU adapter");

        *self.state.lock_or_recover() = Some(NativeState {
            instance: Arc::new(instance),
            backend: caps.backend,
        });
        Ok(caps)
    }

    fn shutdown(&self) {
        self.state.lock_or_recover().take();
        self.windows.lock_or_recover().clear();
    }

    fn create_surface(
        &self,
        desc: &SurfaceDescriptor,
        share_with: Option<&ContextHandle>,
    ) -> Result<Box<dyn NativeSurface>, SurfaceError> {
        let creation = |reason: String| SurfaceError::Creation {
            title: desc.title.clone(),
            reason,
        };
        let instance = self.instance()?;

        let attributes = Window::default_attributes()
            .with_title(desc.title.clone())
            .with_inner_size(winit::dpi::LogicalSize::new(desc.width, desc.height));
        let window = EVENT_LOOP.with(|slot| match slot.borrow().as_ref() {
            Some(event_loop) => create_window(event_loop, attributes).map_err(creation),
            None => Err(creation("event loop lives on another thread".into())),
        })?;
        let window = Arc::new(window);

        let surface = instance
            .create_surface(Arc::clone(&window))
            .map_err(|err| creation(err.to_string()))?;

        let id = ContextId(self.next_context.fetch_add(1, Ordering::Relaxed));
        let (shared, context) = match share_with {
            Some(root) => {
                let shared = root
                    .resources::<SharedDevice>()
                    .ok_or_else(|| creation("share root carries no GPU device".into()))?;
                (shared, ContextHandle::shared_with(id, root))
            }
            None => {
                let shared = Arc::new(request_device(&instance, &surface, &desc.title)?);
                let context = ContextHandle::root(id).with_resources(shared.clone());
                (shared, context)
            }
        };

        let caps = surface.get_capabilities(&shared.adapter);
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|f| f.is_srgb())
            .or_else(|| caps.formats.first().copied())
            .ok_or_else(|| creation("surface is not supported by the adapter".into()))?;
        let size = window.inner_size();
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: present_mode(desc.vsync),
            alpha_mode: caps.alpha_modes.first().copied().unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };

        self.windows.lock_or_recover().insert(window.id(), desc.id);
        Ok(Box::new(WgpuSurface::new(
            desc.id,
            window,
            surface,
            shared,
            config,
            context,
            Arc::clone(&self.windows),
        )))
    }

    fn pump_events(&self, sink: &mut dyn FnMut(SurfaceId, SurfaceEvent)) {
        let windows = self.windows.lock_or_recover().clone();
        let mut collector = EventCollector {
            windows: &windows,
            events: Vec::new(),
        };

        let pumped = EVENT_LOOP.with(|slot| {
            let mut slot = slot.borrow_mut();
            let event_loop = slot.as_mut()?;
            Some(event_loop.pump_app_events(Some(Duration::ZERO), &mut collector))
        });
        match pumped {
            None => {
                tracing::warn!("event pump called off the event-loop thread");
                return;
            }
            Some(PumpStatus::Exit(code)) => tracing::info!(code, "event loop exited"),
            Some(PumpStatus::Continue) => {}
        }

        for (surface, event) in collector.events {
            sink(surface, event);
        }
    }
}

struct EventCollector<'a> {
    windows: &'a HashMap<WindowId, SurfaceId>,
    events: Vec<(SurfaceId, SurfaceEvent)>,
}

impl ApplicationHandler for EventCollector<'_> {
    fn resumed(&mut self, _event_loop: &ActiveEventLoop) {}

    fn window_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        let Some(&surface) = self.windows.get(&window_id) else {
            return;
        };
        self.events
            .extend(events::translate(&event).into_iter().map(|e| (surface, e)));
    }
}
