//! Render surfaces
//!
//! A `RenderSurface` is one OS drawable plus its graphics context, the input
//! state fed by the event pump, and an overlay context. All three live and
//! die together.

use crate::backend::{ContextHandle, Graphics, NativeSurface, SurfaceDescriptor};
use crate::error::SurfaceError;
use crate::input::{InputRegistration, InputState, SurfaceEvent};
use crate::overlay::OverlayContext;
use lockstep_core::sync::MutexExt;
use lockstep_core::{SurfaceConfig, SurfaceId};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Windowed size saved while a surface is fullscreen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowedGeometry {
    pub width: u32,
    pub height: u32,
}

pub struct RenderSurface {
    id: SurfaceId,
    title: String,
    width: u32,
    height: u32,
    vsync: bool,
    /// `Some` while fullscreen.
    saved_geometry: Option<WindowedGeometry>,
    close_requested: bool,
    input: InputState,
    overlay: OverlayContext,
    inbox: Arc<Mutex<VecDeque<SurfaceEvent>>>,
    context: ContextHandle,
    // Drop order: unregister input before the native surface goes away.
    _registration: InputRegistration,
    native: Box<dyn NativeSurface>,
    graphics: Arc<Graphics>,
}

impl RenderSurface {
    /// Create a surface. With `share_with`, its context joins that context's
    /// resource namespace. The first surface built against `graphics`
    /// initializes the backend.
    pub fn new(
        graphics: Arc<Graphics>,
        config: &SurfaceConfig,
        share_with: Option<&ContextHandle>,
    ) -> Result<Self, SurfaceError> {
        let id = SurfaceId::next();
        let desc = SurfaceDescriptor {
            id,
            title: config.title.clone(),
            width: config.width,
            height: config.height,
            vsync: config.vsync,
        };

        let native = graphics.create_native(&desc, share_with)?;
        let context = native.context().clone();

        let inbox: Arc<Mutex<VecDeque<SurfaceEvent>>> = Arc::default();
        let sink = Arc::clone(&inbox);
        let registration = graphics.input().register(
            id,
            Box::new(move |event: &SurfaceEvent| sink.lock_or_recover().push_back(event.clone())),
        )?;

        let mut surface = Self {
            id,
            title: config.title.clone(),
            width: config.width,
            height: config.height,
            vsync: config.vsync,
            saved_geometry: None,
            close_requested: false,
            input: InputState::default(),
            overlay: OverlayContext::new(),
            inbox,
            context,
            _registration: registration,
            native,
            graphics,
        };

        if config.fullscreen {
            surface.toggle_fullscreen();
        }

        tracing::debug!(
            surface = %id,
            title = %surface.title,
            width = surface.width,
            height = surface.height,
            context = %surface.context.id(),
            shared = share_with.is_some(),
            "surface created"
        );
        Ok(surface)
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn vsync(&self) -> bool {
        self.vsync
    }

    pub fn is_fullscreen(&self) -> bool {
        self.saved_geometry.is_some()
    }

    pub fn context(&self) -> &ContextHandle {
        &self.context
    }

    pub fn input(&self) -> &InputState {
        &self.input
    }

    pub fn overlay(&self) -> &OverlayContext {
        &self.overlay
    }

    /// `false` once the OS (or the user) asked for this surface to close.
    pub fn is_open(&self) -> bool {
        !self.close_requested && !self.native.close_requested()
    }

    /// Mark the surface for closing; the owning registry removes it on its
    /// next render pass.
    pub fn request_close(&mut self) {
        self.close_requested = true;
    }

    /// Bind this surface's context to the calling thread. Idempotent.
    pub fn make_current(&mut self) -> Result<(), SurfaceError> {
        if self.graphics.make_current(self.context.id())? {
            self.native.make_current()?;
        }
        Ok(())
    }

    /// Apply events routed to this surface since the last call.
    pub fn poll_events(&mut self) {
        let events: Vec<SurfaceEvent> = self.inbox.lock_or_recover().drain(..).collect();
        for event in events {
            match event {
                SurfaceEvent::CloseRequested => self.close_requested = true,
                SurfaceEvent::Resized { width, height } => {
                    if width > 0 && height > 0 && (width, height) != (self.width, self.height) {
                        self.width = width;
                        self.height = height;
                        self.native.resize(width, height);
                    }
                }
                _ => {}
            }
            self.input.apply(&event);
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            tracing::warn!(surface = %self.id, width, height, "ignoring zero-sized resize");
            return;
        }
        self.width = width;
        self.height = height;
        self.native.resize(width, height);
    }

    pub fn set_title(&mut self, title: &str) {
        self.title = title.to_string();
        self.native.set_title(title);
    }

    pub fn set_vsync(&mut self, enabled: bool) {
        self.vsync = enabled;
        self.native.set_vsync(enabled);
    }

    /// Enter fullscreen, saving the windowed size, or leave it and restore
    /// that size.
    pub fn toggle_fullscreen(&mut self) {
        match self.saved_geometry.take() {
            Some(saved) => {
                self.native.set_fullscreen(false);
                self.resize(saved.width, saved.height);
            }
            None => {
                self.saved_geometry = Some(WindowedGeometry {
                    width: self.width,
                    height: self.height,
                });
                self.native.set_fullscreen(true);
            }
        }
    }

    pub fn begin_overlay(&mut self) -> Result<(), SurfaceError> {
        Ok(self.overlay.begin_frame()?)
    }

    pub fn end_overlay(&mut self) -> Result<(), SurfaceError> {
        Ok(self.overlay.end_frame()?)
    }

    /// Present the back buffer. The context must be current on this thread.
    pub fn swap_buffers(&mut self) -> Result<(), SurfaceError> {
        if !self.graphics.is_current(self.context.id()) {
            return Err(SurfaceError::NotCurrent {
                context: self.context.id(),
            });
        }
        self.native.swap_buffers()
    }

    /// Draw one complete frame: bind the context, clear, run `scene`, run
    /// `overlay` inside the overlay bracket, then present.
    pub fn render_pass(
        &mut self,
        clear_color: [f32; 4],
        scene: impl FnOnce(&mut Frame<'_>),
        overlay: impl FnOnce(&mut OverlayContext),
    ) -> Result<(), SurfaceError> {
        if !self.is_open() {
            return Err(SurfaceError::Closed { surface: self.id });
        }
        self.make_current()?;
        self.input.begin_frame();

        self.native.begin_frame()?;
        self.native.set_viewport(0, 0, self.width, self.height);
        self.native.clear(clear_color);
        {
            let mut frame = Frame {
                surface: self.id,
                width: self.width,
                height: self.height,
                input: &self.input,
                native: self.native.as_mut(),
            };
            scene(&mut frame);
        }

        self.begin_overlay()?;
        overlay(&mut self.overlay);
        self.end_overlay()?;

        self.native.end_frame();
        self.swap_buffers()
    }

    /// Release the native surface now rather than at drop.
    pub fn close(self) {
        tracing::debug!(surface = %self.id, "surface closed");
        drop(self);
    }
}

impl Drop for RenderSurface {
    fn drop(&mut self) {
        self.graphics.release_context(self.context.id());
    }
}

/// Drawing access to one surface for the duration of a render pass.
pub struct Frame<'a> {
    surface: SurfaceId,
    width: u32,
    height: u32,
    input: &'a InputState,
    native: &'a mut dyn NativeSurface,
}

impl Frame<'_> {
    pub fn surface(&self) -> SurfaceId {
        self.surface
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn input(&self) -> &InputState {
        self.input
    }

    pub fn clear(&mut self, color: [f32; 4]) {
        self.native.clear(color);
    }

    pub fn set_viewport(&mut self, x: u32, y: u32, width: u32, height: u32) {
        self.native.set_viewport(x, y, width, height);
    }
}
