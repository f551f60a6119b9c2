use super::SharedDevice;
use crate::backend::{ContextHandle, NativeSurface};
use crate::error::SurfaceError;
use lockstep_core::sync::MutexExt;
use lockstep_core::SurfaceId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use winit::window::{Fullscreen, Window, WindowId};

struct FrameTarget {
    output: wgpu::SurfaceTexture,
    view: wgpu::TextureView,
    encoder: Option<wgpu::CommandEncoder>,
}

/// Whether `[start, start + len)` is a non-empty range inside `0..=max`.
fn span_fits(start: u32, len: u32, max: u32) -> bool {
    len > 0 && start.checked_add(len).is_some_and(|end| end <= max)
}

/// One winit window with its wgpu surface.
pub(super) struct WgpuSurface {
    id: SurfaceId,
    window: Arc<Window>,
    surface: wgpu::Surface<'static>,
    shared: Arc<SharedDevice>,
    config: wgpu::SurfaceConfiguration,
    context: ContextHandle,
    windows: Arc<Mutex<HashMap<WindowId, SurfaceId>>>,
    viewport: (u32, u32, u32, u32),
    frame: Option<FrameTarget>,
}

impl WgpuSurface {
    pub(super) fn new(
        id: SurfaceId,
        window: Arc<Window>,
        surface: wgpu::Surface<'static>,
        shared: Arc<SharedDevice>,
        config: wgpu::SurfaceConfiguration,
        context: ContextHandle,
        windows: Arc<Mutex<HashMap<WindowId, SurfaceId>>>,
    ) -> Self {
        surface.configure(&shared.device, &config);
        let viewport = (0, 0, config.width, config.height);
        Self {
            id,
            window,
            surface,
            shared,
            config,
            context,
            windows,
            viewport,
            frame: None,
        }
    }

    fn reconfigure(&mut self) {
        self.surface.configure(&self.shared.device, &self.config);
    }

    fn acquire(&mut self) -> Result<wgpu::SurfaceTexture, SurfaceError> {
        match self.surface.get_current_texture() {
            Ok(texture) => Ok(texture),
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                tracing::debug!(surface = %self.id, "surface lost or outdated, reconfiguring");
                self.reconfigure();
                self.surface.get_current_texture().map_err(|err| self.present_error(err))
            }
            Err(err) => Err(self.present_error(err)),
        }
    }

    fn present_error(&self, err: impl std::fmt::Display) -> SurfaceError {
        SurfaceError::Present {
            surface: self.id,
            reason: err.to_string(),
        }
    }
}

impl NativeSurface for WgpuSurface {
    fn context(&self) -> &ContextHandle {
        &self.context
    }

    fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.config.width = width;
            self.config.height = height;
            self.reconfigure();
        }
    }

    fn set_title(&mut self, title: &str) {
        self.window.set_title(title);
    }

    fn set_vsync(&mut self, enabled: bool) {
        self.config.present_mode = super::present_mode(enabled);
        self.reconfigure();
    }

    fn set_fullscreen(&mut self, fullscreen: bool) {
        self.window
            .set_fullscreen(fullscreen.then_some(Fullscreen::Borderless(None)));
    }

    fn begin_frame(&mut self) -> Result<(), SurfaceError> {
        // A frame that was begun but never presented is dropped here.
        self.frame = None;
        let output = self.acquire()?;
        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let encoder = self
            .shared
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Surface Encoder"),
            });
        self.frame = Some(FrameTarget {
            output,
            view,
            encoder: Some(encoder),
        });
        Ok(())
    }

    fn set_viewport(&mut self, x: u32, y: u32, width: u32, height: u32) {
        self.viewport = (x, y, width, height);
    }

    fn clear(&mut self, color: [f32; 4]) {
        let Some(frame) = self.frame.as_mut() else {
            return;
        };
        let Some(encoder) = frame.encoder.as_mut() else {
            return;
        };
        let (x, y, w, h) = self.viewport;
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Clear Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &frame.view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color {
                        r: color[0] as f64,
                        g: color[1] as f64,
                        b: color[2] as f64,
                        a: color[3] as f64,
                    }),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        if span_fits(x, w, self.config.width) && span_fits(y, h, self.config.height) {
            pass.set_viewport(x as f32, y as f32, w as f32, h as f32, 0.0, 1.0);
        }
    }

    fn end_frame(&mut self) {
        if let Some(encoder) = self.frame.as_mut().and_then(|f| f.encoder.take()) {
            self.shared.queue.submit(std::iter::once(encoder.finish()));
        }
    }

    fn swap_buffers(&mut self) -> Result<(), SurfaceError> {
        let Some(mut frame) = self.frame.take() else {
            return Err(self.present_error("no frame in flight"));
        };
        if let Some(encoder) = frame.encoder.take() {
            self.shared.queue.submit(std::iter::once(encoder.finish()));
        }
        self.window.pre_present_notify();
        frame.output.present();
        Ok(())
    }
}

impl Drop for WgpuSurface {
    fn drop(&mut self) {
        self.frame = None;
        self.windows.lock_or_recover().remove(&self.window.id());
    }
}

#[cfg(test)]
mod tests {
    use super::span_fits;

    #[test]
    fn test_viewport_span_bounds() {
        assert!(span_fits(0, 640, 640));
        assert!(span_fits(100, 540, 640));
        assert!(!span_fits(101, 540, 640));
        assert!(!span_fits(0, 0, 640));
        assert!(!span_fits(u32::MAX, 2, 640));
        assert!(!span_fits(1, u32::MAX, u32::MAX));
    }
}
