//! Lockstep Runtime
//!
//! Engine instances, each stepping its simulation on a dedicated thread in
//! lockstep with one shared render/event thread, and the manager that
//! multiplexes them on that thread.

pub mod engine;
pub mod handshake;
pub mod manager;
pub mod simulation;

pub use engine::{EngineError, EngineInstance, EngineStats};
pub use handshake::{FrameWait, Handshake};
pub use manager::{InstanceManager, RunError, RunSummary};
pub use simulation::{Idle, Simulation, SimulationError};
