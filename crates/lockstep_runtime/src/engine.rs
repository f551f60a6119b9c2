//! Engine instance
//!
//! One engine owns a surface registry, a worker pool, a simulation and the
//! thread that steps it. The simulation thread and the shared render thread
//! alternate through a [`Handshake`]:
//!
//! ```text
//! sim:    [update]--publish--wait........[update]--publish--wait...
//! render: ....wait--[render surfaces]--complete....wait--[render]--complete
//! ```
//!
//! The simulation side waits for the render side without a deadline. The
//! render side waits at most `render_timeout` and otherwise re-renders the
//! previous state, counting a stale frame.

use crate::handshake::{FrameWait, Handshake};
use crate::simulation::{Simulation, SimulationError};
use lockstep_core::sync::MutexExt;
use lockstep_core::time::{DeltaClock, FixedStep, TICK_DURATION_SECS};
use lockstep_core::{
    ConfigError, EngineConfig, EngineId, SurfaceConfig, SurfaceId, WorkerPool, WorkerPoolError,
};
use lockstep_metrics::{FrameTimer, SystemProfiler};
use lockstep_render::{Graphics, RenderSurface, SurfaceError, SurfaceRegistry};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("worker pool: {0}")]
    Workers(#[from] WorkerPoolError),

    #[error(transparent)]
    Simulation(#[from] SimulationError),

    #[error("failed to create surface '{title}': {source}")]
    Surface {
        title: String,
        #[source]
        source: SurfaceError,
    },

    #[error("failed to spawn simulation thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("{0} is not running")]
    NotRunning(EngineId),

    #[error("{0} has been shut down")]
    ShutDown(EngineId),
}

/// Point-in-time counters of one engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStats {
    /// Completed simulation iterations (paused ones included).
    pub frames: u64,
    pub updates: u64,
    pub fixed_updates: u64,
    /// Completed render passes.
    pub renders: u64,
    /// Render passes that timed out waiting for a fresh frame.
    pub stale_frames: u64,
    pub surfaces: usize,
    pub fps: f64,
    pub frame_time_ms: f64,
    /// Total time spent in `update`.
    pub update_time_ms: f64,
}

/// State shared with the simulation thread.
struct EngineShared {
    id: EngineId,
    running: AtomicBool,
    paused: AtomicBool,
    /// `f32` bits of the last measured delta, in seconds.
    delta_time: AtomicU32,
    frame_count: AtomicU64,
    updates: AtomicU64,
    fixed_updates: AtomicU64,
    renders: AtomicU64,
    stale_frames: AtomicU64,
    handshake: Handshake,
    simulation: Mutex<Box<dyn Simulation>>,
    profiler: Mutex<SystemProfiler>,
}

impl EngineShared {
    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.handshake.wake_all();
    }

    fn step(&self, delta: Duration, fixed: &mut FixedStep) {
        let mut simulation = self.simulation.lock_or_recover();
        let mut profiler = self.profiler.lock_or_recover();

        let dt = delta.as_secs_f32();
        if let Err(err) = profiler.time_system("update", || simulation.update(dt)) {
            tracing::warn!(engine = %self.id, error = %err, "update failed");
        }
        self.updates.fetch_add(1, Ordering::Relaxed);

        for _ in 0..fixed.advance(delta) {
            let result = profiler.time_system("fixed_update", || {
                simulation.fixed_update(TICK_DURATION_SECS)
            });
            if let Err(err) = result {
                tracing::warn!(engine = %self.id, error = %err, "fixed update failed");
            }
            self.fixed_updates.fetch_add(1, Ordering::Relaxed);
        }
    }
}

struct LoopSettings {
    max_delta: Duration,
    max_fixed_steps: u32,
}

fn simulation_loop(shared: &EngineShared, settings: LoopSettings) {
    let mut clock = DeltaClock::new(settings.max_delta);
    let mut fixed = FixedStep::new(settings.max_fixed_steps);

    while shared.running.load(Ordering::Acquire) {
        let delta = clock.tick();
        shared.delta_time.store(delta.as_secs_f32().to_bits(), Ordering::Relaxed);

        if !shared.handshake.wait_render_complete(&shared.running) {
            break;
        }

        if !shared.paused.load(Ordering::Acquire) {
            shared.step(delta, &mut fixed);
        }

        shared.handshake.publish_frame();
        shared.frame_count.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct EngineInstance {
    id: EngineId,
    config: EngineConfig,
    registry: SurfaceRegistry,
    shared: Arc<EngineShared>,
    workers: Mutex<Option<Arc<WorkerPool>>>,
    sim_thread: Mutex<Option<JoinHandle<()>>>,
    main_surface: Mutex<Option<SurfaceId>>,
    timer: Mutex<FrameTimer>,
    sim_initialized: AtomicBool,
    shut_down: AtomicBool,
}

impl EngineInstance {
    /// A stopped engine. Nothing is created until `init`.
    pub fn new(
        graphics: Arc<Graphics>,
        config: EngineConfig,
        simulation: Box<dyn Simulation>,
    ) -> Self {
        let id = EngineId::next();
        Self {
            id,
            registry: SurfaceRegistry::new(graphics),
            shared: Arc::new(EngineShared {
                id,
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                delta_time: AtomicU32::new(0),
                frame_count: AtomicU64::new(0),
                updates: AtomicU64::new(0),
                fixed_updates: AtomicU64::new(0),
                renders: AtomicU64::new(0),
                stale_frames: AtomicU64::new(0),
                handshake: Handshake::new(),
                simulation: Mutex::new(simulation),
                profiler: Mutex::new(SystemProfiler::new()),
            }),
            config,
            workers: Mutex::new(None),
            sim_thread: Mutex::new(None),
            main_surface: Mutex::new(None),
            timer: Mutex::new(FrameTimer::default()),
            sim_initialized: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> EngineId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.config.title
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &SurfaceRegistry {
        &self.registry
    }

    /// Bring the engine up: worker pool, simulation, then the configured
    /// surfaces. On any failure the engine is shut down and the error
    /// returned.
    pub fn init(&self) -> Result<(), EngineError> {
        if self.is_shut_down() {
            return Err(EngineError::ShutDown(self.id));
        }
        if self.is_running() {
            return Ok(());
        }

        match self.try_init() {
            Ok(()) => {
                tracing::info!(
                    engine = %self.id,
                    title = %self.config.title,
                    surfaces = self.registry.count(),
                    "engine initialized"
                );
                Ok(())
            }
            Err(err) => {
                tracing::error!(engine = %self.id, error = %err, "engine init failed");
                self.shutdown();
                Err(err)
            }
        }
    }

    fn try_init(&self) -> Result<(), EngineError> {
        self.config.validate()?;

        let pool = WorkerPool::new(&self.id.to_string(), self.config.worker_threads)?;
        *self.workers.lock_or_recover() = Some(Arc::new(pool));

        self.shared.simulation.lock_or_recover().init()?;
        self.sim_initialized.store(true, Ordering::Release);

        for surface in &self.config.surfaces {
            let id = self
                .registry
                .try_add(surface)
                .map_err(|source| EngineError::Surface {
                    title: surface.title.clone(),
                    source,
                })?;
            self.main_surface.lock_or_recover().get_or_insert(id);
        }

        self.shared.handshake.reset();
        self.shared.running.store(true, Ordering::Release);
        Ok(())
    }

    /// Spawn the simulation thread. No-op if it was already started.
    pub fn start_update_thread(&self) -> Result<(), EngineError> {
        let mut slot = self.sim_thread.lock_or_recover();
        if slot.is_some() {
            return Ok(());
        }
        if !self.is_running() {
            return Err(EngineError::NotRunning(self.id));
        }

        let shared = Arc::clone(&self.shared);
        let settings = LoopSettings {
            max_delta: self.config.max_frame_delta(),
            max_fixed_steps: self.config.max_fixed_steps,
        };
        let handle = thread::Builder::new()
            .name(format!("{}-sim", self.id))
            .spawn(move || {
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| simulation_loop(&shared, settings)));
                if outcome.is_err() {
                    tracing::error!(
                        engine = %shared.id,
                        "simulation thread panicked, stopping engine"
                    );
                    shared.stop();
                }
            })
            .map_err(EngineError::Spawn)?;

        *slot = Some(handle);
        tracing::debug!(engine = %self.id, "simulation thread started");
        Ok(())
    }

    /// Clear `running`, wake the simulation thread and join it.
    pub fn stop_update_thread(&self) {
        self.shared.stop();
        let handle = self.sim_thread.lock_or_recover().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!(engine = %self.id, "simulation thread could not be joined");
            }
            tracing::debug!(engine = %self.id, "simulation thread joined");
        }
    }

    /// Clear `running` without joining. The render thread and the manager
    /// observe it on their next check.
    pub fn stop(&self) {
        if self.shared.running.load(Ordering::Acquire) {
            tracing::info!(engine = %self.id, "engine stopping");
        }
        self.shared.stop();
    }

    /// Tear everything down in dependency order: simulation thread, worker
    /// pool, simulation, surfaces. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        self.stop_update_thread();

        let pool = self.workers.lock_or_recover().take();
        if let Some(pool) = pool {
            pool.shutdown();
        }

        if self.sim_initialized.swap(false, Ordering::AcqRel) {
            self.shared.simulation.lock_or_recover().shutdown();
        }

        self.registry.remove_all();
        *self.main_surface.lock_or_recover() = None;

        tracing::info!(
            engine = %self.id,
            frames = self.frame_count(),
            stale_frames = self.shared.stale_frames.load(Ordering::Relaxed),
            "engine shut down"
        );
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    /// Pausing skips simulation steps; the handshake keeps alternating.
    pub fn set_paused(&self, paused: bool) {
        self.shared.paused.store(paused, Ordering::Release);
    }

    /// Last simulation delta, in seconds.
    pub fn delta_time(&self) -> f32 {
        f32::from_bits(self.shared.delta_time.load(Ordering::Relaxed))
    }

    pub fn frame_count(&self) -> u64 {
        self.shared.frame_count.load(Ordering::Relaxed)
    }

    pub fn main_surface(&self) -> Option<SurfaceId> {
        *self.main_surface.lock_or_recover()
    }

    pub fn add_surface(&self, config: &SurfaceConfig) -> Option<SurfaceId> {
        let id = self.registry.add(config)?;
        self.main_surface.lock_or_recover().get_or_insert(id);
        Some(id)
    }

    pub fn remove_surface(&self, id: SurfaceId) -> bool {
        let removed = self.registry.remove(id);
        if removed {
            self.forget_main_surface(&[id]);
        }
        removed
    }

    fn forget_main_surface(&self, removed: &[SurfaceId]) {
        let mut main = self.main_surface.lock_or_recover();
        if main.is_some_and(|id| removed.contains(&id)) {
            *main = None;
        }
    }

    /// Run `task` on this engine's worker pool.
    pub fn enqueue<F>(&self, task: F) -> Result<(), EngineError>
    where
        F: FnOnce() + Send + 'static,
    {
        let pool = self.worker_pool().ok_or(EngineError::NotRunning(self.id))?;
        Ok(pool.enqueue(task)?)
    }

    /// Block until every queued worker task has finished. Tasks may keep
    /// enqueueing follow-up work while this waits.
    pub fn wait_for_workers(&self) {
        if let Some(pool) = self.worker_pool() {
            pool.wait();
        }
    }

    fn worker_pool(&self) -> Option<Arc<WorkerPool>> {
        self.workers.lock_or_recover().clone()
    }

    pub fn stats(&self) -> EngineStats {
        let update_time = self.shared.profiler.lock_or_recover().get_timing("update");
        let timer = self.timer.lock_or_recover();
        EngineStats {
            frames: self.frame_count(),
            updates: self.shared.updates.load(Ordering::Relaxed),
            fixed_updates: self.shared.fixed_updates.load(Ordering::Relaxed),
            renders: self.shared.renders.load(Ordering::Relaxed),
            stale_frames: self.shared.stale_frames.load(Ordering::Relaxed),
            surfaces: self.registry.count(),
            fps: timer.fps(),
            frame_time_ms: timer.frame_time_ms(),
            update_time_ms: update_time.as_secs_f64() * 1000.0,
        }
    }

    /// Render every surface once. Must be called from the render thread.
    /// Returns the number of surfaces presented.
    pub fn render_frame(&self) -> usize {
        if !self.is_running() {
            return 0;
        }

        match self
            .shared
            .handshake
            .wait_frame_ready(&self.shared.running, self.config.render_timeout())
        {
            FrameWait::Stopped => return 0,
            FrameWait::Stale => {
                self.shared.stale_frames.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(engine = %self.id, "render wait timed out, presenting stale frame");
            }
            FrameWait::Fresh => {}
        }

        let pass = self.timer.lock_or_recover().begin();
        let Some(presented) = self.render_surfaces() else {
            return 0;
        };
        self.timer.lock_or_recover().end(pass);

        self.shared.renders.fetch_add(1, Ordering::Relaxed);
        self.shared.handshake.complete_render();
        presented
    }

    /// `None` if there was nothing to render and the engine stopped.
    fn render_surfaces(&self) -> Option<usize> {
        let snapshot = self.registry.snapshot();
        if snapshot.is_empty() {
            tracing::info!(engine = %self.id, "no surfaces left");
            self.stop();
            return None;
        }

        // The simulation is only busy here when the wait above timed out;
        // then the scene hooks are skipped for this pass.
        let simulation = match self.shared.simulation.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        };

        let mut closed = Vec::new();
        let mut presented = 0;
        // Reverse index order.
        for (id, handle) in snapshot.iter().rev() {
            let mut surface = handle.lock_or_recover();
            surface.poll_events();

            if !surface.is_open() {
                tracing::debug!(engine = %self.id, surface = %id, "surface closed");
                closed.push(*id);
                if closed.len() == snapshot.len() {
                    break;
                }
                continue;
            }

            match self.render_surface(&mut surface, simulation.as_deref().map(|sim| &**sim)) {
                Ok(()) => presented += 1,
                Err(err) => {
                    tracing::warn!(
                        engine = %self.id,
                        surface = %id,
                        error = %err,
                        "render pass failed, removing surface"
                    );
                    closed.push(*id);
                }
            }
        }
        drop(simulation);

        if !closed.is_empty() {
            self.registry.remove_many(&closed);
            self.forget_main_surface(&closed);
        }
        if self.registry.is_empty() {
            tracing::info!(engine = %self.id, "last surface closed");
            self.stop();
        }
        Some(presented)
    }

    fn render_surface(
        &self,
        surface: &mut RenderSurface,
        simulation: Option<&dyn Simulation>,
    ) -> Result<(), SurfaceError> {
        surface.render_pass(
            self.config.clear_color,
            |frame| {
                if let Some(simulation) = simulation {
                    simulation.render(frame);
                }
            },
            |ui| {
                if let Some(simulation) = simulation {
                    if let Err(err) = simulation.overlay(ui) {
                        tracing::warn!(engine = %self.id, error = %err, "overlay failed");
                    }
                }
            },
        )
    }
}

impl Drop for EngineInstance {
    fn drop(&mut self) {
        self.shutdown();
    }
}
