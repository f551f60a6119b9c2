//! Lockstep Core
//!
//! Leaf building blocks shared by the render and runtime crates:
//! - Process-unique engine and surface identifiers
//! - Wall-clock deltas and the fixed simulation step
//! - Runtime / engine / surface configuration
//! - The instance-scoped worker pool

pub mod config;
pub mod id;
pub mod sync;
pub mod time;
pub mod worker_pool;

pub use config::{ConfigError, EngineConfig, RuntimeConfig, SurfaceConfig};
pub use id::{EngineId, SurfaceId};
pub use worker_pool::{WorkerPool, WorkerPoolError};

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
