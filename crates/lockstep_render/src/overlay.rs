//! Per-surface overlay (debug UI) context
//!
//! Overlay drawing for a surface must be bracketed by `begin_frame` /
//! `end_frame`, on the render thread, after the surface's context is current.
//! Widgets pushed inside the bracket are collected into the finished frame.

use crate::error::OverlayError;

#[derive(Debug, Clone, PartialEq)]
pub enum OverlayItem {
    Label(String),
    Value { name: String, value: f64 },
    Separator,
}

#[derive(Debug, Default)]
pub struct OverlayContext {
    in_frame: bool,
    frames: u64,
    building: Vec<OverlayItem>,
    finished: Vec<OverlayItem>,
}

impl OverlayContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_frame(&mut self) -> Result<(), OverlayError> {
        if self.in_frame {
            return Err(OverlayError::AlreadyInFrame);
        }
        self.in_frame = true;
        self.building.clear();
        Ok(())
    }

    pub fn end_frame(&mut self) -> Result<(), OverlayError> {
        if !self.in_frame {
            return Err(OverlayError::NotInFrame);
        }
        self.in_frame = false;
        self.frames += 1;
        std::mem::swap(&mut self.building, &mut self.finished);
        Ok(())
    }

    pub fn is_in_frame(&self) -> bool {
        self.in_frame
    }

    /// Completed overlay frames.
    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    /// Items of the last completed frame.
    pub fn last_frame(&self) -> &[OverlayItem] {
        &self.finished
    }

    pub fn label(&mut self, text: impl Into<String>) -> Result<(), OverlayError> {
        self.push(OverlayItem::Label(text.into()))
    }

    pub fn value(&mut self, name: impl Into<String>, value: f64) -> Result<(), OverlayError> {
        self.push(OverlayItem::Value {
            name: name.into(),
            value,
        })
    }

    pub fn separator(&mut self) -> Result<(), OverlayError> {
        self.push(OverlayItem::Separator)
    }

    fn push(&mut self, item: OverlayItem) -> Result<(), OverlayError> {
        if !self.in_frame {
            return Err(OverlayError::NotInFrame);
        }
        self.building.push(item);
        Ok(())
    }
}
