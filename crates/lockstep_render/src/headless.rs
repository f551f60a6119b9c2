//! In-process headless backend
//!
//! Surfaces are plain records; nothing reaches the OS or a GPU. Used for CI,
//! for `LOCKSTEP_HEADLESS=1` runs, and by every test in the workspace. It can
//! script OS events (close requests, resizes), fail surface creation on
//! demand, slow down creation and presentation, and report what each surface presented and
//! from which thread.

use crate::backend::{
    ContextHandle, ContextId, GraphicsBackend, NativeSurface, ShareGroup, SurfaceDescriptor,
};
use crate::error::{BackendError, SurfaceError};
use crate::input::SurfaceEvent;
use crate::{BackendType, DeviceCapabilities};
use lockstep_core::sync::MutexExt;
use lockstep_core::SurfaceId;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

/// What the headless backend remembers about one surface.
#[derive(Debug, Clone)]
pub struct SurfaceRecord {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    pub fullscreen: bool,
    pub group: ShareGroup,
    pub presented: u64,
    pub last_clear: Option<[f32; 4]>,
    pub alive: bool,
}

#[derive(Default)]
struct HeadlessState {
    events: VecDeque<(SurfaceId, SurfaceEvent)>,
    surfaces: HashMap<SurfaceId, SurfaceRecord>,
    /// Every surface id presented, in order.
    present_log: Vec<SurfaceId>,
    render_threads: HashSet<ThreadId>,
    release_threads: HashSet<ThreadId>,
    fail_surfaces: usize,
    fail_presents: HashSet<SurfaceId>,
    fail_init: bool,
    swap_delay: Duration,
    create_delay: Duration,
    init_count: usize,
    shutdown_count: usize,
}

pub struct HeadlessBackend {
    state: Arc<Mutex<HeadlessState>>,
    next_context: AtomicU64,
}

impl HeadlessBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(HeadlessState::default())),
            next_context: AtomicU64::new(1),
        })
    }

    /// Queue an event for the next `pump_events`.
    pub fn inject(&self, surface: SurfaceId, event: SurfaceEvent) {
        self.state.lock_or_recover().events.push_back((surface, event));
    }

    /// Simulate the user clicking a surface's close button.
    pub fn request_close(&self, surface: SurfaceId) {
        self.inject(surface, SurfaceEvent::CloseRequested);
    }

    /// Make the next `count` surface creations fail.
    pub fn fail_next_surfaces(&self, count: usize) {
        self.state.lock_or_recover().fail_surfaces = count;
    }

    pub fn fail_next_init(&self) {
        self.state.lock_or_recover().fail_init = true;
    }

    /// Make every present of `surface` fail from now on.
    pub fn fail_presents(&self, surface: SurfaceId) {
        self.state.lock_or_recover().fail_presents.insert(surface);
    }

    /// Sleep this long inside every `swap_buffers`.
    pub fn set_swap_delay(&self, delay: Duration) {
        self.state.lock_or_recover().swap_delay = delay;
    }

    /// Sleep this long inside every `create_surface`.
    pub fn set_create_delay(&self, delay: Duration) {
        self.state.lock_or_recover().create_delay = delay;
    }

    pub fn init_count(&self) -> usize {
        self.state.lock_or_recover().init_count
    }

    pub fn shutdown_count(&self) -> usize {
        self.state.lock_or_recover().shutdown_count
    }

    pub fn surface(&self, surface: SurfaceId) -> Option<SurfaceRecord> {
        self.state.lock_or_recover().surfaces.get(&surface).cloned()
    }

    pub fn presented(&self, surface: SurfaceId) -> u64 {
        self.surface(surface).map(|s| s.presented).unwrap_or(0)
    }

    pub fn present_log(&self) -> Vec<SurfaceId> {
        self.state.lock_or_recover().present_log.clone()
    }

    pub fn clear_present_log(&self) {
        self.state.lock_or_recover().present_log.clear();
    }

    pub fn live_surfaces(&self) -> usize {
        self.state
            .lock_or_recover()
            .surfaces
            .values()
            .filter(|s| s.alive)
            .count()
    }

    /// Threads that have presented a frame.
    pub fn render_threads(&self) -> HashSet<ThreadId> {
        self.state.lock_or_recover().render_threads.clone()
    }

    /// Threads that have dropped a surface.
    pub fn release_threads(&self) -> HashSet<ThreadId> {
        self.state.lock_or_recover().release_threads.clone()
    }
}

impl GraphicsBackend for HeadlessBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Headless
    }

    fn init(&self) -> Result<DeviceCapabilities, BackendError> {
        let mut state = self.state.lock_or_recover();
        if std::mem::take(&mut state.fail_init) {
            return Err(BackendError::Init("injected init failure".into()));
        }
        state.init_count += 1;
        Ok(DeviceCapabilities {
            backend: BackendType::Headless,
            max_texture_size: 8192,
            supports_compute: false,
            supports_instancing: true,
        })
    }

    fn shutdown(&self) {
        self.state.lock_or_recover().shutdown_count += 1;
    }

    fn create_surface(
        &self,
        desc: &SurfaceDescriptor,
        share_with: Option<&ContextHandle>,
    ) -> Result<Box<dyn NativeSurface>, SurfaceError> {
        let delay = self.state.lock_or_recover().create_delay;
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let mut state = self.state.lock_or_recover();
        if state.fail_surfaces > 0 {
            state.fail_surfaces -= 1;
            return Err(SurfaceError::Creation {
                title: desc.title.clone(),
                reason: "injected creation failure".into(),
            });
        }

        let id = ContextId(self.next_context.fetch_add(1, Ordering::Relaxed));
        let context = match share_with {
            Some(root) => ContextHandle::shared_with(id, root),
            None => ContextHandle::root(id),
        };

        state.surfaces.insert(
            desc.id,
            SurfaceRecord {
                title: desc.title.clone(),
                width: desc.width,
                height: desc.height,
                vsync: desc.vsync,
                fullscreen: false,
                group: context.group(),
                presented: 0,
                last_clear: None,
                alive: true,
            },
        );

        Ok(Box::new(HeadlessSurface {
            id: desc.id,
            context,
            state: Arc::clone(&self.state),
            in_frame: false,
        }))
    }

    fn pump_events(&self, sink: &mut dyn FnMut(SurfaceId, SurfaceEvent)) {
        // Take the queue first so sinks may inject without deadlocking.
        let events = std::mem::take(&mut self.state.lock_or_recover().events);
        for (surface, event) in events {
            sink(surface, event);
        }
    }
}

struct HeadlessSurface {
    id: SurfaceId,
    context: ContextHandle,
    state: Arc<Mutex<HeadlessState>>,
    in_frame: bool,
}

impl HeadlessSurface {
    fn with_record(&self, f: impl FnOnce(&mut SurfaceRecord)) {
        if let Some(record) = self.state.lock_or_recover().surfaces.get_mut(&self.id) {
            f(record);
        }
    }
}

impl NativeSurface for HeadlessSurface {
    fn context(&self) -> &ContextHandle {
        &self.context
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.with_record(|r| {
            r.width = width;
            r.height = height;
        });
    }

    fn set_title(&mut self, title: &str) {
        self.with_record(|r| r.title = title.to_string());
    }

    fn set_vsync(&mut self, enabled: bool) {
        self.with_record(|r| r.vsync = enabled);
    }

    fn set_fullscreen(&mut self, fullscreen: bool) {
        self.with_record(|r| r.fullscreen = fullscreen);
    }

    fn begin_frame(&mut self) -> Result<(), SurfaceError> {
        self.in_frame = true;
        Ok(())
    }

    fn set_viewport(&mut self, _x: u32, _y: u32, _width: u32, _height: u32) {}

    fn clear(&mut self, color: [f32; 4]) {
        self.with_record(|r| r.last_clear = Some(color));
    }

    fn end_frame(&mut self) {
        self.in_frame = false;
    }

    fn swap_buffers(&mut self) -> Result<(), SurfaceError> {
        if self.in_frame {
            return Err(SurfaceError::Present {
                surface: self.id,
                reason: "swap requested inside an open frame".into(),
            });
        }
        let delay = {
            let mut state = self.state.lock_or_recover();
            if state.fail_presents.contains(&self.id) {
                return Err(SurfaceError::Present {
                    surface: self.id,
                    reason: "injected present failure".into(),
                });
            }
            state.render_threads.insert(thread::current().id());
            state.present_log.push(self.id);
            if let Some(record) = state.surfaces.get_mut(&self.id) {
                record.presented += 1;
            }
            state.swap_delay
        };
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        Ok(())
    }
}

impl Drop for HeadlessSurface {
    fn drop(&mut self) {
        let mut state = self.state.lock_or_recover();
        state.release_threads.insert(thread::current().id());
        if let Some(record) = state.surfaces.get_mut(&self.id) {
            record.alive = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(title: &str) -> SurfaceDescriptor {
        SurfaceDescriptor {
            id: SurfaceId::next(),
            title: title.into(),
            width: 320,
            height: 240,
            vsync: true,
        }
    }

    #[test]
    fn test_creation_failure_injection() {
        let backend = HeadlessBackend::new();
        backend.fail_next_surfaces(1);
        assert!(matches!(
            backend.create_surface(&desc("a"), None),
            Err(SurfaceError::Creation { .. })
        ));
        assert!(backend.create_surface(&desc("b"), None).is_ok());
    }

    #[test]
    fn test_pump_delivers_in_order() {
        let backend = HeadlessBackend::new();
        let id = SurfaceId::next();
        backend.request_close(id);
        backend.inject(id, SurfaceEvent::Focused(true));

        let mut seen = Vec::new();
        backend.pump_events(&mut |surface, event| seen.push((surface, event)));
        assert_eq!(
            seen,
            vec![(id, SurfaceEvent::CloseRequested), (id, SurfaceEvent::Focused(true))]
        );

        let mut again = 0;
        backend.pump_events(&mut |_, _| again += 1);
        assert_eq!(again, 0);
    }

    #[test]
    fn test_drop_marks_surface_dead() {
        let backend = HeadlessBackend::new();
        let d = desc("a");
        let surface = backend.create_surface(&d, None).unwrap();
        assert_eq!(backend.live_surfaces(), 1);
        drop(surface);
        assert_eq!(backend.live_surfaces(), 0);
        assert!(!backend.surface(d.id).unwrap().alive);
        assert!(backend.release_threads().contains(&thread::current().id()));
    }
}
