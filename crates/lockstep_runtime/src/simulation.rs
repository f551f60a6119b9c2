//! The simulation subsystem an engine instance drives.
//!
//! `init`, `update`, `fixed_update` and `shutdown` run on the instance's
//! simulation thread (`init`/`shutdown` on whichever thread owns the
//! instance's lifecycle). `render` and `overlay` are read-only views called
//! from the render thread between handshakes.

use lockstep_render::{Frame, OverlayContext, OverlayError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("simulation failed to initialize: {0}")]
    Init(String),

    #[error("simulation step failed: {0}")]
    Step(String),
}

pub trait Simulation: Send {
    fn init(&mut self) -> Result<(), SimulationError> {
        Ok(())
    }

    /// Variable-rate step; `dt` is the wall time since the previous step, in
    /// seconds.
    fn update(&mut self, dt: f32) -> Result<(), SimulationError>;

    /// Fixed-rate step at `lockstep_core::time::TICK_RATE_HZ`.
    fn fixed_update(&mut self, _dt: f32) -> Result<(), SimulationError> {
        Ok(())
    }

    fn shutdown(&mut self) {}

    fn render(&self, _frame: &mut Frame<'_>) {}

    fn overlay(&self, _ui: &mut OverlayContext) -> Result<(), OverlayError> {
        Ok(())
    }
}

/// A simulation that does nothing; useful for surfaces that only present.
#[derive(Debug, Default)]
pub struct Idle;

impl Simulation for Idle {
    fn update(&mut self, _dt: f32) -> Result<(), SimulationError> {
        Ok(())
    }
}
