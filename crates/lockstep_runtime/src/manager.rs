//! Instance manager
//!
//! Owns every engine in the process and drives the one render/event thread
//! they share. Each loop iteration pumps OS events once, then asks every
//! running engine to render a frame. Engines simulate concurrently on their
//! own threads; only this loop ever touches the graphics backend.
//!
//! Engines destroyed from another thread while the loop runs are stopped
//! there, but their surfaces are released by the loop on its own thread.

use crate::engine::{EngineError, EngineInstance};
use crate::simulation::Simulation;
use lockstep_core::sync::MutexExt;
use lockstep_core::{EngineConfig, EngineId, RuntimeConfig};
use lockstep_render::{default_backend, Graphics};
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use thiserror::Error;

static INSTANCE: Lazy<Mutex<Option<Arc<InstanceManager>>>> = Lazy::new(|| Mutex::new(None));

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunError {
    #[error("no engines to run")]
    NoEngines,

    #[error("no engine owns a surface")]
    NoSurfaces,

    #[error("the engine loop is already running")]
    AlreadyRunning,
}

/// What one call to the loop did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub iterations: u64,
    /// Engine render passes issued, summed over every iteration.
    pub frames_rendered: u64,
}

#[derive(Default)]
struct ManagerInner {
    engines: Vec<Arc<EngineInstance>>,
    current: Option<EngineId>,
}

#[derive(Default)]
struct LoopState {
    /// Thread running the loop, while it runs.
    thread: Option<ThreadId>,
    /// Engines destroyed off the loop thread, awaiting teardown on it.
    retired: Vec<Arc<EngineInstance>>,
}

pub struct InstanceManager {
    graphics: Arc<Graphics>,
    inner: Mutex<ManagerInner>,
    running: AtomicBool,
    loop_state: Mutex<LoopState>,
}

impl InstanceManager {
    pub fn new(graphics: Arc<Graphics>) -> Self {
        Self {
            graphics,
            inner: Mutex::new(ManagerInner::default()),
            running: AtomicBool::new(false),
            loop_state: Mutex::new(LoopState::default()),
        }
    }

    /// The process-wide manager, created on first use against the default
    /// backend (`LOCKSTEP_HEADLESS` selects the headless one).
    pub fn instance() -> Arc<Self> {
        let mut slot = INSTANCE.lock_or_recover();
        let manager = slot.get_or_insert_with(|| {
            let mut config = RuntimeConfig::default();
            if let Err(err) = config.apply_env() {
                tracing::warn!(error = %err, "ignoring invalid environment override");
            }
            Arc::new(Self::new(Graphics::new(default_backend(config.headless))))
        });
        Arc::clone(manager)
    }

    /// Install the process-wide manager with an explicit backend. A manager
    /// already installed is destroyed first.
    pub fn install(graphics: Arc<Graphics>) -> Arc<Self> {
        let manager = Arc::new(Self::new(graphics));
        let previous = INSTANCE.lock_or_recover().replace(Arc::clone(&manager));
        if let Some(previous) = previous {
            tracing::warn!("replacing the installed instance manager");
            previous.teardown();
        }
        manager
    }

    /// The installed manager, without creating one.
    pub fn try_instance() -> Option<Arc<Self>> {
        INSTANCE.lock_or_recover().clone()
    }

    /// Destroy every engine, release the backend and drop the singleton.
    pub fn destroy_instance() {
        let manager = INSTANCE.lock_or_recover().take();
        if let Some(manager) = manager {
            manager.teardown();
        }
    }

    fn teardown(&self) {
        self.request_exit();
        self.destroy_all_engines();
        self.graphics.shutdown();
    }

    pub fn graphics(&self) -> &Arc<Graphics> {
        &self.graphics
    }

    /// Create and initialize an engine. The first engine becomes current.
    pub fn create_engine(
        &self,
        config: EngineConfig,
        simulation: Box<dyn Simulation>,
    ) -> Result<EngineId, EngineError> {
        let engine = Arc::new(EngineInstance::new(Arc::clone(&self.graphics), config, simulation));
        engine.init()?;

        let id = engine.id();
        let mut inner = self.inner.lock_or_recover();
        inner.engines.push(engine);
        if inner.current.is_none() {
            inner.current = Some(id);
        }
        tracing::info!(engine = %id, engines = inner.engines.len(), "engine created");
        Ok(id)
    }

    /// Stop and remove one engine. If it was current, the first remaining
    /// engine becomes current.
    pub fn destroy_engine(&self, id: EngineId) -> bool {
        let engine = {
            let mut inner = self.inner.lock_or_recover();
            let Some(index) = inner.engines.iter().position(|e| e.id() == id) else {
                return false;
            };
            let engine = inner.engines.remove(index);
            if inner.current == Some(id) {
                inner.current = inner.engines.first().map(|e| e.id());
            }
            engine
        };
        self.retire(engine);
        tracing::info!(engine = %id, "engine destroyed");
        true
    }

    pub fn destroy_all_engines(&self) {
        let engines = {
            let mut inner = self.inner.lock_or_recover();
            inner.current = None;
            std::mem::take(&mut inner.engines)
        };
        for engine in engines {
            self.retire(engine);
        }
    }

    /// Shut an engine down, or, when the loop is running on another thread,
    /// join its simulation thread and leave the rest to the loop.
    fn retire(&self, engine: Arc<EngineInstance>) {
        let me = thread::current().id();
        let mut state = self.loop_state.lock_or_recover();
        match state.thread {
            Some(owner) if owner != me => {
                engine.stop_update_thread();
                state.retired.push(engine);
            }
            _ => {
                drop(state);
                engine.shutdown();
            }
        }
    }

    fn shutdown_retired(&self) {
        let retired = std::mem::take(&mut self.loop_state.lock_or_recover().retired);
        for engine in retired {
            engine.shutdown();
        }
    }

    pub fn set_current_engine(&self, id: EngineId) -> bool {
        let mut inner = self.inner.lock_or_recover();
        if inner.engines.iter().any(|e| e.id() == id) {
            inner.current = Some(id);
            true
        } else {
            false
        }
    }

    pub fn current_engine(&self) -> Option<Arc<EngineInstance>> {
        let inner = self.inner.lock_or_recover();
        let current = inner.current?;
        inner.engines.iter().find(|e| e.id() == current).cloned()
    }

    pub fn engine(&self, id: EngineId) -> Option<Arc<EngineInstance>> {
        self.inner
            .lock_or_recover()
            .engines
            .iter()
            .find(|e| e.id() == id)
            .cloned()
    }

    pub fn engine_count(&self) -> usize {
        self.inner.lock_or_recover().engines.len()
    }

    pub fn engines(&self) -> Vec<Arc<EngineInstance>> {
        self.inner.lock_or_recover().engines.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Make the loop exit after its current iteration. Callable from any
    /// thread.
    pub fn request_exit(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Run every engine until none is left running, then shut them all down
    /// and release the graphics backend. Must be called on the thread that
    /// created the surfaces.
    pub fn run_all_engines(&self) -> Result<RunSummary, RunError> {
        let summary = self.run_loop(None)?;

        for engine in self.engines() {
            if engine.is_running() {
                tracing::debug!(
                    engine = %engine.id(),
                    "shutting down engine still running at exit"
                );
            }
            engine.shutdown();
        }
        self.graphics.shutdown();

        tracing::info!(iterations = summary.iterations, "engine loop finished");
        Ok(summary)
    }

    /// Drive the loop for at most `iterations` iterations. Engines are left
    /// as they are afterwards.
    pub fn run_iterations(&self, iterations: u64) -> Result<RunSummary, RunError> {
        self.run_loop(Some(iterations))
    }

    fn run_loop(&self, limit: Option<u64>) -> Result<RunSummary, RunError> {
        let engines = self.engines();
        if engines.is_empty() {
            tracing::error!("no engines to run");
            return Err(RunError::NoEngines);
        }
        if engines.iter().all(|e| e.registry().is_empty()) {
            tracing::error!("no engine owns a surface");
            return Err(RunError::NoSurfaces);
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(RunError::AlreadyRunning);
        }
        self.loop_state.lock_or_recover().thread = Some(thread::current().id());

        let mut summary = RunSummary::default();
        while self.running.load(Ordering::Acquire)
            && limit.map_or(true, |n| summary.iterations < n)
        {
            let rendered = self.iterate();
            summary.iterations += 1;
            summary.frames_rendered += rendered;
            if rendered == 0 {
                tracing::info!("no engine running");
                break;
            }
        }
        self.running.store(false, Ordering::Release);

        self.loop_state.lock_or_recover().thread = None;
        self.shutdown_retired();
        Ok(summary)
    }

    /// Start the engine's simulation thread if it has none yet. An engine
    /// whose thread cannot be spawned is stopped.
    fn start_simulation(engine: &EngineInstance) -> bool {
        match engine.start_update_thread() {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(
                    engine = %engine.id(),
                    error = %err,
                    "failed to start simulation thread"
                );
                engine.stop();
                false
            }
        }
    }

    /// One loop iteration. Returns how many engines rendered.
    fn iterate(&self) -> u64 {
        self.shutdown_retired();
        self.graphics.pump_events();

        let mut rendered = 0;
        for engine in self.engines() {
            // Engines created while the loop runs get their thread here.
            if engine.is_running() && Self::start_simulation(&engine) {
                engine.render_frame();
                rendered += 1;
            }
            if !engine.is_running() && !engine.is_shut_down() {
                tracing::info!(engine = %engine.id(), "engine stopped itself");
                engine.shutdown();
            }
        }
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::Idle;
    use lockstep_core::SurfaceConfig;
    use lockstep_render::HeadlessBackend;
    use std::collections::HashSet;
    use std::time::{Duration, Instant};

    fn manager() -> (Arc<HeadlessBackend>, InstanceManager) {
        let backend = HeadlessBackend::new();
        let manager = InstanceManager::new(Graphics::new(backend.clone()));
        (backend, manager)
    }

    fn config(title: &str, surfaces: usize) -> EngineConfig {
        (0..surfaces).fold(EngineConfig::new(title), |config, i| {
            config.with_surface(SurfaceConfig::new(format!("{title}-{i}"), 64, 64))
        })
    }

    #[test]
    fn test_first_engine_is_current() {
        let (_backend, manager) = manager();
        let a = manager.create_engine(config("a", 1), Box::new(Idle)).unwrap();
        let b = manager.create_engine(config("b", 1), Box::new(Idle)).unwrap();

        assert_eq!(manager.current_engine().unwrap().id(), a);
        assert!(manager.set_current_engine(b));
        assert_eq!(manager.current_engine().unwrap().id(), b);
        assert!(!manager.set_current_engine(EngineId::next()));
        manager.destroy_all_engines();
    }

    #[test]
    fn test_destroying_current_promotes_first_remaining() {
        let (backend, manager) = manager();
        let a = manager.create_engine(config("a", 1), Box::new(Idle)).unwrap();
        let b = manager.create_engine(config("b", 1), Box::new(Idle)).unwrap();
        let c = manager.create_engine(config("c", 1), Box::new(Idle)).unwrap();
        manager.set_current_engine(c);

        assert!(manager.destroy_engine(c));
        assert_eq!(manager.current_engine().unwrap().id(), a);
        assert!(!manager.destroy_engine(c));
        assert!(manager.engine(b).is_some());
        assert_eq!(backend.live_surfaces(), 2);

        manager.destroy_all_engines();
        assert!(manager.current_engine().is_none());
        assert_eq!(backend.live_surfaces(), 0);
    }

    #[test]
    fn test_ids_never_reused() {
        let (_backend, manager) = manager();
        let mut engines = Vec::new();
        let mut surfaces = Vec::new();
        for round in 0..5 {
            let id = manager
                .create_engine(config(&format!("e{round}"), 2), Box::new(Idle))
                .unwrap();
            surfaces.extend(manager.engine(id).unwrap().registry().ids());
            engines.push(id);
            if round % 2 == 0 {
                manager.destroy_engine(id);
            }
        }
        engines.sort();
        engines.dedup();
        surfaces.sort();
        surfaces.dedup();
        assert_eq!(engines.len(), 5);
        assert_eq!(surfaces.len(), 10);
        manager.destroy_all_engines();
    }

    #[test]
    fn test_failed_create_returns_error() {
        let (backend, manager) = manager();
        backend.fail_next_surfaces(1);
        assert!(manager.create_engine(config("bad", 1), Box::new(Idle)).is_err());
        assert_eq!(manager.engine_count(), 0);
        assert!(manager.current_engine().is_none());
    }

    #[test]
    fn test_run_without_engines_or_surfaces() {
        let (backend, manager) = manager();
        assert_eq!(manager.run_all_engines(), Err(RunError::NoEngines));

        let id = manager.create_engine(config("empty", 0), Box::new(Idle)).unwrap();
        assert_eq!(manager.run_all_engines(), Err(RunError::NoSurfaces));
        assert_eq!(manager.engine(id).unwrap().frame_count(), 0);
        assert!(manager.engine(id).unwrap().is_running());
        assert!(backend.render_threads().is_empty());
        manager.destroy_all_engines();
    }

    #[test]
    fn test_all_rendering_on_calling_thread() {
        let (backend, manager) = manager();
        manager.create_engine(config("a", 2), Box::new(Idle)).unwrap();
        manager.create_engine(config("b", 1), Box::new(Idle)).unwrap();

        let summary = manager.run_iterations(10).unwrap();
        assert_eq!(summary.iterations, 10);
        assert_eq!(summary.frames_rendered, 20);
        assert_eq!(backend.render_threads().len(), 1);
        assert!(backend.render_threads().contains(&thread::current().id()));
        manager.destroy_all_engines();
    }

    #[test]
    fn test_close_sequence_across_engines() {
        let (backend, manager) = manager();
        let a = manager.create_engine(config("a", 2), Box::new(Idle)).unwrap();
        let b = manager.create_engine(config("b", 1), Box::new(Idle)).unwrap();
        let engine_a = manager.engine(a).unwrap();
        let engine_b = manager.engine(b).unwrap();

        manager.run_iterations(5).unwrap();

        backend.request_close(engine_a.registry().ids()[1]);
        manager.run_iterations(2).unwrap();
        assert_eq!(engine_a.registry().count(), 1);
        assert_eq!(engine_b.registry().count(), 1);
        assert!(engine_a.is_running());
        assert!(engine_b.is_running());

        backend.request_close(engine_b.registry().ids()[0]);
        let presented_before = backend.presented(engine_a.registry().ids()[0]);
        let summary = manager.run_iterations(5).unwrap();
        assert_eq!(summary.iterations, 5);
        assert!(!engine_b.is_running());
        assert!(engine_b.is_shut_down());
        assert!(engine_a.is_running());
        assert!(backend.presented(engine_a.registry().ids()[0]) > presented_before);

        manager.destroy_all_engines();
    }

    #[test]
    fn test_loop_exits_when_last_engine_destroyed() {
        let backend = HeadlessBackend::new();
        let manager = Arc::new(InstanceManager::new(Graphics::new(backend.clone())));
        let id = manager.create_engine(config("only", 1), Box::new(Idle)).unwrap();

        let remote = Arc::clone(&manager);
        let destroyer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.destroy_engine(id)
        });

        let start = Instant::now();
        let summary = manager.run_all_engines().unwrap();
        assert!(destroyer.join().unwrap());
        assert!(summary.iterations > 0);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(manager.engine_count(), 0);
        assert!(!manager.graphics().is_initialized());
        assert_eq!(backend.release_threads(), HashSet::from([thread::current().id()]));
    }

    #[test]
    fn test_destroyed_engine_released_on_loop_thread() {
        let backend = HeadlessBackend::new();
        let manager = Arc::new(InstanceManager::new(Graphics::new(backend.clone())));
        let a = manager.create_engine(config("a", 1), Box::new(Idle)).unwrap();
        let b = manager.create_engine(config("b", 2), Box::new(Idle)).unwrap();
        let b_surfaces = manager.engine(b).unwrap().registry().ids();

        let remote = Arc::clone(&manager);
        let destroyer = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !remote.is_running() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            thread::sleep(Duration::from_millis(20));
            let destroyed = remote.destroy_engine(b);
            thread::sleep(Duration::from_millis(20));
            remote.request_exit();
            destroyed
        });

        manager.run_all_engines().unwrap();
        assert!(destroyer.join().unwrap());
        assert!(manager.engine(a).unwrap().is_shut_down());
        for surface in b_surfaces {
            assert!(!backend.surface(surface).unwrap().alive);
        }
        assert_eq!(backend.release_threads(), HashSet::from([thread::current().id()]));
    }

    #[test]
    fn test_engine_created_mid_run_simulates() {
        let backend = HeadlessBackend::new();
        let manager = Arc::new(InstanceManager::new(Graphics::new(backend.clone())));
        manager.create_engine(config("a", 1), Box::new(Idle)).unwrap();

        let remote = Arc::clone(&manager);
        let creator = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !remote.is_running() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            let late = remote.create_engine(config("late", 1), Box::new(Idle)).unwrap();
            let engine = remote.engine(late).unwrap();
            while engine.frame_count() < 3 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            remote.request_exit();
            engine.frame_count()
        });

        manager.run_all_engines().unwrap();
        assert!(creator.join().unwrap() >= 3);
    }

    #[test]
    fn test_loop_exits_when_surfaces_close() {
        let (backend, manager) = manager();
        let id = manager.create_engine(config("a", 2), Box::new(Idle)).unwrap();
        for surface in manager.engine(id).unwrap().registry().ids() {
            backend.request_close(surface);
        }

        let summary = manager.run_all_engines().unwrap();
        assert!(summary.iterations <= 2);
        let engine = manager.engine(id).unwrap();
        assert!(engine.is_shut_down());
        assert_eq!(backend.live_surfaces(), 0);
        assert_eq!(backend.shutdown_count(), 1);
    }

    #[test]
    fn test_request_exit_from_another_thread() {
        let backend = HeadlessBackend::new();
        let manager = Arc::new(InstanceManager::new(Graphics::new(backend.clone())));
        manager.create_engine(config("a", 1), Box::new(Idle)).unwrap();

        let remote = Arc::clone(&manager);
        let stopper = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !remote.is_running() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            thread::sleep(Duration::from_millis(30));
            remote.request_exit();
        });

        let summary = manager.run_all_engines().unwrap();
        stopper.join().unwrap();
        assert!(summary.iterations > 0);
        assert!(manager.engines().iter().all(|e| e.is_shut_down()));
        assert_eq!(backend.live_surfaces(), 0);
    }

    #[test]
    fn test_singleton_lifecycle() {
        let backend = HeadlessBackend::new();
        let installed = InstanceManager::install(Graphics::new(backend.clone()));
        assert!(Arc::ptr_eq(&installed, &InstanceManager::instance()));

        let id = installed.create_engine(config("global", 1), Box::new(Idle)).unwrap();
        assert_eq!(InstanceManager::instance().engine_count(), 1);

        InstanceManager::destroy_instance();
        assert!(InstanceManager::try_instance().is_none());
        assert!(installed.engine(id).is_none());
        assert_eq!(backend.live_surfaces(), 0);
        assert_eq!(backend.shutdown_count(), 1);
    }
}
