//! Lockstep Runtime
//!
//! Boots every engine in the runtime config and runs them until all their
//! surfaces are closed.
//!
//! Config is read from the path in `LOCKSTEP_CONFIG` (or the first argument);
//! without one, two demo engines are created. Headless runs stop after a
//! fixed number of iterations.

use anyhow::{Context, Result};
use lockstep_core::{EngineConfig, RuntimeConfig, SurfaceConfig};
use lockstep_render::{default_backend, Frame, Graphics, OverlayContext, OverlayError};
use lockstep_runtime::{InstanceManager, Simulation, SimulationError};
use std::path::PathBuf;

const ENV_CONFIG: &str = "LOCKSTEP_CONFIG";

/// Headless surfaces never close on their own.
const HEADLESS_ITERATIONS: u64 = 600;

/// Cycles the clear color so each surface visibly presents new frames.
struct Pulse {
    elapsed: f32,
    ticks: u64,
}

impl Simulation for Pulse {
    fn update(&mut self, dt: f32) -> Result<(), SimulationError> {
        self.elapsed += dt;
        Ok(())
    }

    fn fixed_update(&mut self, _dt: f32) -> Result<(), SimulationError> {
        self.ticks += 1;
        Ok(())
    }

    fn render(&self, frame: &mut Frame<'_>) {
        let phase = self.elapsed * 0.5;
        frame.clear([
            0.5 + 0.5 * phase.sin(),
            0.5 + 0.5 * (phase + 2.1).sin(),
            0.5 + 0.5 * (phase + 4.2).sin(),
            1.0,
        ]);
    }

    fn overlay(&self, ui: &mut OverlayContext) -> Result<(), OverlayError> {
        ui.value("time", self.elapsed as f64)?;
        ui.value("ticks", self.ticks as f64)
    }
}

fn demo_config() -> RuntimeConfig {
    RuntimeConfig {
        headless: false,
        engines: vec![
            EngineConfig::new("Lockstep A")
                .with_surface(SurfaceConfig::new("Lockstep A - main", 960, 540))
                .with_surface(SurfaceConfig::new("Lockstep A - aux", 480, 270)),
            EngineConfig::new("Lockstep B")
                .with_surface(SurfaceConfig::new("Lockstep B", 640, 360)),
        ],
    }
}

fn load_config() -> Result<RuntimeConfig> {
    let path = std::env::var_os(ENV_CONFIG)
        .map(PathBuf::from)
        .or_else(|| std::env::args_os().nth(1).map(PathBuf::from));

    let mut config = match path {
        Some(path) => RuntimeConfig::load(&path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => demo_config(),
    };
    config.apply_env().context("invalid environment override")?;
    Ok(config)
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    tracing::info!("Lockstep Runtime v{}", lockstep_core::VERSION);
    let config = load_config()?;

    let graphics = Graphics::new(default_backend(config.headless));
    let manager = InstanceManager::install(graphics);

    let headless = config.headless;
    for engine in config.engines {
        let title = engine.title.clone();
        let simulation = Box::new(Pulse {
            elapsed: 0.0,
            ticks: 0,
        });
        manager
            .create_engine(engine, simulation)
            .with_context(|| format!("failed to create engine '{title}'"))?;
    }

    let summary = if headless {
        manager.run_iterations(HEADLESS_ITERATIONS)
    } else {
        manager.run_all_engines()
    }
    .context("engine loop did not start")?;
    tracing::info!(
        iterations = summary.iterations,
        frames = summary.frames_rendered,
        "all engines finished"
    );

    InstanceManager::destroy_instance();
    Ok(())
}
