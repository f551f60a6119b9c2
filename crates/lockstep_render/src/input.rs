//! Input routing and per-surface input state
//!
//! The backend's event pump produces `(SurfaceId, SurfaceEvent)` pairs. The
//! `InputRouter` hands each one to the callback registered for that surface.
//! Routes are keyed by the logical surface id (never a native handle) and are
//! owned by an `InputRegistration` guard that unregisters on drop.
//!
//! Reentrancy is tracked per route: while a route's callback is running, a
//! nested dispatch to the same surface is refused instead of re-entering it.

use crate::error::InputError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lockstep_core::SurfaceId;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
    Other(u16),
}

/// Events routed to a single surface.
#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceEvent {
    CloseRequested,
    Resized { width: u32, height: u32 },
    Focused(bool),
    CursorMoved { x: f32, y: f32 },
    CursorLeft,
    MouseInput { button: MouseButton, pressed: bool },
    /// Physical key code as reported by the platform.
    Key { code: u32, pressed: bool },
    Text(String),
}

/// Input state owned by one surface, updated on the render thread.
#[derive(Debug, Clone, Default)]
pub struct InputState {
    pub focused: bool,
    pub pointer: Option<(f32, f32)>,
    pub pressed_keys: HashSet<u32>,
    pub pressed_buttons: HashSet<MouseButton>,
    /// Text committed since the last `begin_frame`.
    pub text: String,
    /// Number of events applied since the last `begin_frame`.
    pub events_this_frame: usize,
}

impl InputState {
    pub fn apply(&mut self, event: &SurfaceEvent) {
        self.events_this_frame += 1;
        match event {
            SurfaceEvent::Focused(focused) => {
                self.focused = *focused;
                if !focused {
                    self.pressed_keys.clear();
                    self.pressed_buttons.clear();
                }
            }
            SurfaceEvent::CursorMoved { x, y } => self.pointer = Some((*x, *y)),
            SurfaceEvent::CursorLeft => self.pointer = None,
            SurfaceEvent::MouseInput { button, pressed } => {
                if *pressed {
                    self.pressed_buttons.insert(*button);
                } else {
                    self.pressed_buttons.remove(button);
                }
            }
            SurfaceEvent::Key { code, pressed } => {
                if *pressed {
                    self.pressed_keys.insert(*code);
                } else {
                    self.pressed_keys.remove(code);
                }
            }
            SurfaceEvent::Text(text) => self.text.push_str(text),
            SurfaceEvent::CloseRequested | SurfaceEvent::Resized { .. } => {}
        }
    }

    /// Reset per-frame deltas.
    pub fn begin_frame(&mut self) {
        self.text.clear();
        self.events_this_frame = 0;
    }

    pub fn is_key_down(&self, code: u32) -> bool {
        self.pressed_keys.contains(&code)
    }

    pub fn is_button_down(&self, button: MouseButton) -> bool {
        self.pressed_buttons.contains(&button)
    }
}

pub type InputCallback = Box<dyn Fn(&SurfaceEvent) + Send + Sync>;

/// Outcome of routing one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Delivered,
    /// No route registered for the surface (already destroyed, or not ours).
    Unrouted,
    /// The surface's callback was already running; the event was dropped.
    Reentrant,
}

struct Route {
    callback: InputCallback,
    in_callback: AtomicBool,
}

/// Clears a route's in-callback flag when the callback returns or unwinds.
struct CallbackScope<'a>(&'a AtomicBool);

impl Drop for CallbackScope<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone, Default)]
pub struct InputRouter {
    routes: Arc<DashMap<SurfaceId, Arc<Route>>>,
}

impl InputRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        surface: SurfaceId,
        callback: InputCallback,
    ) -> Result<InputRegistration, InputError> {
        match self.routes.entry(surface) {
            Entry::Occupied(_) => Err(InputError::AlreadyRegistered(surface)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Route {
                    callback,
                    in_callback: AtomicBool::new(false),
                }));
                Ok(InputRegistration {
                    surface,
                    routes: Arc::downgrade(&self.routes),
                })
            }
        }
    }

    pub fn is_registered(&self, surface: SurfaceId) -> bool {
        self.routes.contains_key(&surface)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn dispatch(&self, surface: SurfaceId, event: &SurfaceEvent) -> Dispatch {
        // Clone the route out so no map shard is locked while the callback runs.
        let route = match self.routes.get(&surface) {
            Some(route) => Arc::clone(route.value()),
            None => return Dispatch::Unrouted,
        };

        if route.in_callback.swap(true, Ordering::AcqRel) {
            return Dispatch::Reentrant;
        }
        let _scope = CallbackScope(&route.in_callback);
        (route.callback)(event);
        Dispatch::Delivered
    }
}

/// Owns one input route; dropping it unregisters the surface.
pub struct InputRegistration {
    surface: SurfaceId,
    routes: Weak<DashMap<SurfaceId, Arc<Route>>>,
}

impl InputRegistration {
    pub fn surface(&self) -> SurfaceId {
        self.surface
    }
}

impl Drop for InputRegistration {
    fn drop(&mut self) {
        if let Some(routes) = self.routes.upgrade() {
            routes.remove(&self.surface);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn test_register_dispatch_unregister() {
        let router = InputRouter::new();
        let id = SurfaceId::next();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let registration = router
            .register(id, Box::new(move |_: &SurfaceEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        assert_eq!(router.dispatch(id, &SurfaceEvent::Focused(true)), Dispatch::Delivered);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        drop(registration);
        assert!(!router.is_registered(id));
        assert_eq!(router.dispatch(id, &SurfaceEvent::Focused(true)), Dispatch::Unrouted);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let router = InputRouter::new();
        let id = SurfaceId::next();
        let _first = router.register(id, Box::new(|_: &SurfaceEvent| {})).unwrap();
        assert!(matches!(
            router.register(id, Box::new(|_: &SurfaceEvent| {})),
            Err(InputError::AlreadyRegistered(dup)) if dup == id
        ));
    }

    #[test]
    fn test_nested_dispatch_is_refused() {
        let router = InputRouter::new();
        let id = SurfaceId::next();
        let other = SurfaceId::next();
        let nested = Arc::new(Mutex::new(Vec::new()));

        let inner_router = router.clone();
        let results = Arc::clone(&nested);
        let _a = router
            .register(id, Box::new(move |event: &SurfaceEvent| {
                if *event == SurfaceEvent::CloseRequested {
                    let same = inner_router.dispatch(id, &SurfaceEvent::CursorLeft);
                    let different = inner_router.dispatch(other, &SurfaceEvent::CursorLeft);
                    results.lock().unwrap().push((same, different));
                }
            }))
            .unwrap();
        let _b = router.register(other, Box::new(|_: &SurfaceEvent| {})).unwrap();

        assert_eq!(router.dispatch(id, &SurfaceEvent::CloseRequested), Dispatch::Delivered);
        assert_eq!(
            *nested.lock().unwrap(),
            vec![(Dispatch::Reentrant, Dispatch::Delivered)]
        );

        // Flag is cleared once the outer callback returns.
        assert_eq!(router.dispatch(id, &SurfaceEvent::CursorLeft), Dispatch::Delivered);
    }

    #[test]
    fn test_input_state_tracks_keys_and_focus() {
        let mut input = InputState::default();
        input.apply(&SurfaceEvent::Focused(true));
        input.apply(&SurfaceEvent::Key { code: 30, pressed: true });
        input.apply(&SurfaceEvent::MouseInput { button: MouseButton::Left, pressed: true });
        input.apply(&SurfaceEvent::Text("hi".into()));
        assert!(input.is_key_down(30));
        assert!(input.is_button_down(MouseButton::Left));
        assert_eq!(input.text, "hi");
        assert_eq!(input.events_this_frame, 4);

        input.apply(&SurfaceEvent::Focused(false));
        assert!(!input.is_key_down(30));
        assert!(!input.is_button_down(MouseButton::Left));

        input.begin_frame();
        assert!(input.text.is_empty());
        assert_eq!(input.events_this_frame, 0);
    }
}
