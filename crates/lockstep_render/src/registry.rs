//! Per-engine surface registry
//!
//! The first surface added becomes the resource-sharing root; every later
//! surface shares its context's resources. The root handle outlives the
//! surface it came from, so removing the first surface does not split the
//! share group. Only `remove_all` resets it.

use crate::backend::{ContextHandle, Graphics};
use crate::error::SurfaceError;
use crate::surface::RenderSurface;
use crate::SurfaceHandle;
use lockstep_core::sync::MutexExt;
use lockstep_core::{SurfaceConfig, SurfaceId};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RegistryInner {
    surfaces: Vec<SurfaceHandle>,
    ids: Vec<SurfaceId>,
    current: Option<SurfaceId>,
    root: Option<ContextHandle>,
}

impl RegistryInner {
    fn position(&self, id: SurfaceId) -> Option<usize> {
        self.ids.iter().position(|s| *s == id)
    }
}

pub struct SurfaceRegistry {
    graphics: Arc<Graphics>,
    inner: Mutex<RegistryInner>,
    creating: Mutex<()>,
}

impl SurfaceRegistry {
    pub fn new(graphics: Arc<Graphics>) -> Self {
        Self {
            graphics,
            inner: Mutex::new(RegistryInner::default()),
            creating: Mutex::new(()),
        }
    }

    /// Create a surface. Returns `None` if it could not be created; the
    /// error is logged.
    pub fn add(&self, config: &SurfaceConfig) -> Option<SurfaceId> {
        match self.try_add(config) {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::error!(title = %config.title, error = %err, "failed to add surface");
                None
            }
        }
    }

    /// The native surface is created outside the registry lock; concurrent
    /// adds are serialized so they all see the same share root.
    pub fn try_add(&self, config: &SurfaceConfig) -> Result<SurfaceId, SurfaceError> {
        let _creating = self.creating.lock_or_recover();
        let root = self.root_context();
        let surface = RenderSurface::new(Arc::clone(&self.graphics), config, root.as_ref())?;
        let id = surface.id();

        let mut inner = self.inner.lock_or_recover();
        if inner.root.is_none() {
            inner.root = Some(surface.context().clone());
            inner.current = Some(id);
        }
        inner.surfaces.push(Arc::new(Mutex::new(surface)));
        inner.ids.push(id);
        Ok(id)
    }

    /// Close and release one surface. Clears `current` if it was current.
    pub fn remove(&self, id: SurfaceId) -> bool {
        let removed = {
            let mut inner = self.inner.lock_or_recover();
            let Some(index) = inner.position(id) else {
                return false;
            };
            inner.ids.remove(index);
            if inner.current == Some(id) {
                inner.current = None;
            }
            inner.surfaces.remove(index)
        };
        // Released outside the registry lock.
        drop(removed);
        tracing::debug!(surface = %id, "surface removed");
        true
    }

    /// Remove every id in `ids` under one lock. Returns how many were found.
    pub fn remove_many(&self, ids: &[SurfaceId]) -> usize {
        let mut removed = Vec::with_capacity(ids.len());
        {
            let mut inner = self.inner.lock_or_recover();
            for id in ids {
                if let Some(index) = inner.position(*id) {
                    inner.ids.remove(index);
                    if inner.current == Some(*id) {
                        inner.current = None;
                    }
                    removed.push(inner.surfaces.remove(index));
                }
            }
        }
        let count = removed.len();
        drop(removed);
        if count > 0 {
            tracing::debug!(count, "surfaces removed");
        }
        count
    }

    pub fn remove_all(&self) {
        let removed = {
            let mut inner = self.inner.lock_or_recover();
            inner.ids.clear();
            inner.current = None;
            inner.root = None;
            std::mem::take(&mut inner.surfaces)
        };
        drop(removed);
    }

    pub fn get_at(&self, index: usize) -> Option<SurfaceHandle> {
        self.inner.lock_or_recover().surfaces.get(index).cloned()
    }

    pub fn get_by_id(&self, id: SurfaceId) -> Option<SurfaceHandle> {
        let inner = self.inner.lock_or_recover();
        inner.position(id).map(|index| Arc::clone(&inner.surfaces[index]))
    }

    pub fn count(&self) -> usize {
        self.inner.lock_or_recover().surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn ids(&self) -> Vec<SurfaceId> {
        self.inner.lock_or_recover().ids.clone()
    }

    /// Surfaces in insertion order, copied out under one lock.
    pub fn snapshot(&self) -> Vec<(SurfaceId, SurfaceHandle)> {
        let inner = self.inner.lock_or_recover();
        inner.ids.iter().copied().zip(inner.surfaces.iter().cloned()).collect()
    }

    pub fn current(&self) -> Option<SurfaceId> {
        self.inner.lock_or_recover().current
    }

    /// Returns `false` (and leaves `current` untouched) if `id` is not here.
    pub fn set_current(&self, id: SurfaceId) -> bool {
        let mut inner = self.inner.lock_or_recover();
        if inner.position(id).is_some() {
            inner.current = Some(id);
            true
        } else {
            false
        }
    }

    /// Share root of this registry, if a surface was ever added.
    pub fn root_context(&self) -> Option<ContextHandle> {
        self.inner.lock_or_recover().root.clone()
    }
}

impl Drop for SurfaceRegistry {
    fn drop(&mut self) {
        self.remove_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessBackend;
    use std::thread;
    use std::time::{Duration, Instant};

    fn registry() -> (Arc<HeadlessBackend>, SurfaceRegistry) {
        let backend = HeadlessBackend::new();
        let registry = SurfaceRegistry::new(Graphics::new(backend.clone()));
        (backend, registry)
    }

    fn config(title: &str) -> SurfaceConfig {
        SurfaceConfig::new(title, 320, 240)
    }

    #[test]
    fn test_first_surface_is_root_and_current() {
        let (backend, registry) = registry();
        let a = registry.add(&config("a")).unwrap();
        let b = registry.add(&config("b")).unwrap();
        let c = registry.add(&config("c")).unwrap();

        assert_eq!(registry.current(), Some(a));
        assert_eq!(registry.count(), 3);
        let group = backend.surface(a).unwrap().group;
        assert_eq!(backend.surface(b).unwrap().group, group);
        assert_eq!(backend.surface(c).unwrap().group, group);
        assert_eq!(registry.ids(), vec![a, b, c]);
    }

    #[test]
    fn test_separate_registries_do_not_share() {
        let backend = HeadlessBackend::new();
        let graphics = Graphics::new(backend.clone());
        let first = SurfaceRegistry::new(graphics.clone());
        let second = SurfaceRegistry::new(graphics);

        let a = first.add(&config("a")).unwrap();
        let b = second.add(&config("b")).unwrap();
        assert_ne!(backend.surface(a).unwrap().group, backend.surface(b).unwrap().group);
        assert!(first.get_by_id(b).is_none());
        assert!(second.get_by_id(a).is_none());
    }

    #[test]
    fn test_failed_add_returns_none() {
        let (backend, registry) = registry();
        backend.fail_next_surfaces(1);
        assert_eq!(registry.add(&config("bad")), None);
        assert!(registry.is_empty());
        assert_eq!(registry.current(), None);

        let good = registry.add(&config("good")).unwrap();
        assert_eq!(registry.current(), Some(good));
    }

    #[test]
    fn test_remove_current_clears_current() {
        let (backend, registry) = registry();
        let a = registry.add(&config("a")).unwrap();
        let b = registry.add(&config("b")).unwrap();

        assert!(registry.remove(a));
        assert!(!registry.remove(a));
        assert_eq!(registry.current(), None);
        assert_eq!(registry.count(), 1);
        assert!(!backend.surface(a).unwrap().alive);

        // Root survives its surface.
        let c = registry.add(&config("c")).unwrap();
        assert_eq!(backend.surface(c).unwrap().group, backend.surface(b).unwrap().group);
        assert_eq!(registry.current(), None);
        assert!(registry.set_current(c));
        assert!(!registry.set_current(a));
        assert_eq!(registry.current(), Some(c));
    }

    #[test]
    fn test_remove_many_and_remove_all() {
        let (backend, registry) = registry();
        let ids: Vec<_> = (0..4)
            .map(|i| registry.add(&config(&format!("s{i}"))).unwrap())
            .collect();

        assert_eq!(registry.remove_many(&[ids[1], ids[3], SurfaceId::next()]), 2);
        assert_eq!(registry.ids(), vec![ids[0], ids[2]]);
        assert_eq!(backend.live_surfaces(), 2);

        registry.remove_all();
        assert!(registry.is_empty());
        assert!(registry.root_context().is_none());
        assert_eq!(backend.live_surfaces(), 0);
    }

    #[test]
    fn test_slow_creation_does_not_block_readers() {
        let backend = HeadlessBackend::new();
        let registry = Arc::new(SurfaceRegistry::new(Graphics::new(backend.clone())));
        let first = registry.add(&config("first")).unwrap();
        backend.set_create_delay(Duration::from_millis(300));

        let adder = Arc::clone(&registry);
        let slow = thread::spawn(move || adder.add(&config("slow")));
        thread::sleep(Duration::from_millis(30));

        let start = Instant::now();
        assert_eq!(registry.count(), 1);
        assert!(registry.get_by_id(first).is_some());
        assert!(start.elapsed() < Duration::from_millis(150));

        let second = slow.join().unwrap().unwrap();
        assert_eq!(registry.ids(), vec![first, second]);
    }

    #[test]
    fn test_concurrent_adds_share_one_root() {
        let backend = HeadlessBackend::new();
        let registry = Arc::new(SurfaceRegistry::new(Graphics::new(backend.clone())));
        backend.set_create_delay(Duration::from_millis(5));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.add(&config(&format!("s{i}"))).unwrap())
            })
            .collect();
        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let group = backend.surface(ids[0]).unwrap().group;
        assert!(ids.iter().all(|id| backend.surface(*id).unwrap().group == group));
        assert_eq!(registry.count(), 4);
        assert!(registry.current().is_some());
    }

    #[test]
    fn test_snapshot_survives_removal() {
        let (_backend, registry) = registry();
        let a = registry.add(&config("a")).unwrap();
        let b = registry.add(&config("b")).unwrap();

        let snapshot = registry.snapshot();
        registry.remove(a);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].0, a);
        assert_eq!(snapshot[0].1.lock().unwrap().id(), a);
        assert_eq!(registry.get_at(0).unwrap().lock().unwrap().id(), b);
    }
}
