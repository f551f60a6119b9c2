use crate::input::{MouseButton, SurfaceEvent};
use winit::event::{ElementState, Ime, MouseButton as WinitMouseButton, WindowEvent};
use winit::platform::scancode::PhysicalKeyExtScancode;

/// Translate one winit window event. Keyboard input may yield a key event
/// and the text it committed.
pub(super) fn translate(event: &WindowEvent) -> Vec<SurfaceEvent> {
    match event {
        WindowEvent::CloseRequested | WindowEvent::Destroyed => vec![SurfaceEvent::CloseRequested],

        WindowEvent::Resized(size) => vec![SurfaceEvent::Resized {
            width: size.width,
            height: size.height,
        }],

        WindowEvent::Focused(focused) => vec![SurfaceEvent::Focused(*focused)],

        WindowEvent::CursorMoved { position, .. } => vec![SurfaceEvent::CursorMoved {
            x: position.x as f32,
            y: position.y as f32,
        }],

        WindowEvent::CursorLeft { .. } => vec![SurfaceEvent::CursorLeft],

        WindowEvent::MouseInput { state, button, .. } => vec![SurfaceEvent::MouseInput {
            button: map_mouse_button(*button),
            pressed: *state == ElementState::Pressed,
        }],

        WindowEvent::KeyboardInput { event, .. } => {
            let pressed = event.state == ElementState::Pressed;
            let mut out = Vec::with_capacity(2);
            if let Some(code) = event.physical_key.to_scancode() {
                out.push(SurfaceEvent::Key { code, pressed });
            }
            if pressed {
                if let Some(text) = event.text.as_ref().filter(|t| !t.is_empty()) {
                    out.push(SurfaceEvent::Text(text.to_string()));
                }
            }
            out
        }

        WindowEvent::Ime(Ime::Commit(text)) if !text.is_empty() => {
            vec![SurfaceEvent::Text(text.clone())]
        }

        _ => Vec::new(),
    }
}

fn map_mouse_button(button: WinitMouseButton) -> MouseButton {
    match button {
        WinitMouseButton::Left => MouseButton::Left,
        WinitMouseButton::Right => MouseButton::Right,
        WinitMouseButton::Middle => MouseButton::Middle,
        WinitMouseButton::Back => MouseButton::Other(3),
        WinitMouseButton::Forward => MouseButton::Other(4),
        WinitMouseButton::Other(id) => MouseButton::Other(id),
    }
}
