//! Bounded LRU cache of loaded models shared by concurrent transcriptions.
//!
//! One `parking_lot::Mutex` guards the whole map and the recency clock. It
//! is never held while a loader runs: the first caller for a missing key
//! parks an in-flight marker in the map, releases the lock, loads, and then
//! publishes the outcome to every caller that arrived for the same key in
//! the meantime. Errors are published too, and are not cached.
//!
//! Evicted handles are dropped after the lock is released; the backend goes
//! away when the last outstanding clone does.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{LoadError, Result, ScribeError};
use crate::inference::ModelHandle;

pub const DEFAULT_CAPACITY: usize = 1;

type LoadOutcome = std::result::Result<ModelHandle, LoadError>;

#[derive(Default)]
struct InFlight {
    outcome: Mutex<Option<LoadOutcome>>,
    done: Condvar,
}

impl InFlight {
    fn publish(&self, outcome: LoadOutcome) {
        *self.outcome.lock() = Some(outcome);
        self.done.notify_all();
    }

    fn wait(&self) -> LoadOutcome {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            self.done.wait(&mut outcome);
        }
    }
}

struct Entry {
    handle: ModelHandle,
    last_used: u64,
    inserted: u64,
}

enum Slot {
    Loading(Arc<InFlight>),
    Ready(Entry),
}

struct CacheState {
    capacity: usize,
    /// Logical clock advanced on every touch.
    clock: u64,
    next_insert: u64,
    slots: HashMap<String, Slot>,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn occupancy(&self) -> usize {
        self.slots
            .values()
            .filter(|s| matches!(s, Slot::Ready(_)))
            .count()
    }

    fn ready_entries(&self) -> impl Iterator<Item = (&String, &Entry)> {
        self.slots.iter().filter_map(|(k, s)| match s {
            Slot::Ready(e) => Some((k, e)),
            Slot::Loading(_) => None,
        })
    }

    /// Remove least-recently-used ready entries until occupancy fits.
    fn evict_overflow(&mut self) -> Vec<(String, ModelHandle)> {
        let mut evicted = Vec::new();
        while self.occupancy() > self.capacity {
            let Some(victim) = self
                .ready_entries()
                .min_by_key(|(_, e)| (e.last_used, e.inserted))
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            if let Some(Slot::Ready(entry)) = self.slots.remove(&victim) {
                evicted.push((victim, entry.handle));
            }
        }
        evicted
    }
}

/// Per-entry recency, as reported by [`ModelCache::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedModel {
    pub model_id: String,
    pub last_used: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub capacity: usize,
    pub occupancy: usize,
    /// Least- to most-recently used.
    pub entries: Vec<CachedModel>,
}

impl CacheStats {
    pub fn keys(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.model_id.as_str()).collect()
    }
}

pub struct ModelCache {
    state: Mutex<CacheState>,
}

impl Default for ModelCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for ModelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCache")
            .field("stats", &self.stats())
            .finish()
    }
}

impl ModelCache {
    /// A zero `capacity` is raised to 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                capacity: capacity.max(1),
                clock: 0,
                next_insert: 0,
                slots: HashMap::new(),
            }),
        }
    }

    /// Return the cached handle for `model_id`, or load it with `loader`.
    ///
    /// Concurrent calls for a key that is already loading wait for that
    /// load instead of starting another, and receive its outcome.
    ///
    /// # Errors
    /// The loader's error, or `LoaderAborted` if it panicked.
    pub fn acquire<F>(&self, model_id: &str, loader: F) -> std::result::Result<ModelHandle, LoadError>
    where
        F: FnOnce(&str) -> std::result::Result<ModelHandle, LoadError>,
    {
        let flight = {
            let mut state = self.state.lock();
            let now = state.tick();
            match state.slots.get_mut(model_id) {
                Some(Slot::Ready(entry)) => {
                    entry.last_used = now;
                    debug!(model_id, "model cache hit");
                    return Ok(entry.handle.clone());
                }
                Some(Slot::Loading(flight)) => {
                    let flight = Arc::clone(flight);
                    drop(state);
                    debug!(model_id, "waiting for in-flight model load");
                    let outcome = flight.wait();
                    if outcome.is_ok() {
                        self.touch(model_id);
                    }
                    return outcome;
                }
                None => {
                    let flight = Arc::new(InFlight::default());
                    state
                        .slots
                        .insert(model_id.to_string(), Slot::Loading(Arc::clone(&flight)));
                    flight
                }
            }
        };

        info!(model_id, "loading model");
        let mut guard = LoadGuard {
            cache: self,
            model_id,
            flight,
            finished: false,
        };
        let outcome = loader(model_id);
        guard.finish(outcome.clone());
        outcome
    }

    /// Change the bound, evicting least-recently-used entries if needed.
    ///
    /// # Errors
    /// `InvalidOptions` for a zero capacity.
    pub fn set_capacity(&self, capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Err(ScribeError::InvalidOptions(
                "cache capacity must be at least 1".into(),
            ));
        }
        let evicted = {
            let mut state = self.state.lock();
            state.capacity = capacity;
            state.evict_overflow()
        };
        release(evicted);
        Ok(())
    }

    /// Drop `model_id` if it is resident. An id without an `@quant` suffix
    /// also drops every quantized variant (`small` takes `small@q8` with it).
    /// In-flight loads are unaffected. Returns the number of models dropped.
    pub fn unload(&self, model_id: &str) -> usize {
        let variants = (!model_id.contains('@')).then(|| format!("{model_id}@"));
        let selected = |key: &str| {
            key == model_id || variants.as_deref().is_some_and(|p| key.starts_with(p))
        };
        let evicted = {
            let mut state = self.state.lock();
            let keys: Vec<String> = state
                .ready_entries()
                .map(|(k, _)| k.clone())
                .filter(|k| selected(k))
                .collect();
            keys.into_iter()
                .filter_map(|k| match state.slots.remove(&k) {
                    Some(Slot::Ready(entry)) => Some((k, entry.handle)),
                    _ => None,
                })
                .collect::<Vec<_>>()
        };
        let count = evicted.len();
        release(evicted);
        count
    }

    /// Drop every resident model. In-flight loads are unaffected.
    pub fn clear(&self) {
        let evicted = {
            let mut state = self.state.lock();
            let keys: Vec<String> = state.ready_entries().map(|(k, _)| k.clone()).collect();
            keys.into_iter()
                .filter_map(|k| match state.slots.remove(&k) {
                    Some(Slot::Ready(entry)) => Some((k, entry.handle)),
                    _ => None,
                })
                .collect::<Vec<_>>()
        };
        release(evicted);
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let mut entries: Vec<(&String, &Entry)> = state.ready_entries().collect();
        entries.sort_by_key(|(_, e)| (e.last_used, e.inserted));
        CacheStats {
            capacity: state.capacity,
            occupancy: entries.len(),
            entries: entries
                .into_iter()
                .map(|(k, e)| CachedModel {
                    model_id: k.clone(),
                    last_used: e.last_used,
                })
                .collect(),
        }
    }

    fn touch(&self, model_id: &str) {
        let mut state = self.state.lock();
        let now = state.tick();
        if let Some(Slot::Ready(entry)) = state.slots.get_mut(model_id) {
            entry.last_used = now;
        }
    }
}

/// Publishes the outcome of a load exactly once, even if the loader unwinds.
struct LoadGuard<'c> {
    cache: &'c ModelCache,
    model_id: &'c str,
    flight: Arc<InFlight>,
    finished: bool,
}

impl LoadGuard<'_> {
    fn finish(&mut self, outcome: LoadOutcome) {
        self.finished = true;
        let evicted = {
            let mut state = self.cache.state.lock();
            if matches!(state.slots.get(self.model_id), Some(Slot::Loading(f)) if Arc::ptr_eq(f, &self.flight))
            {
                state.slots.remove(self.model_id);
            }
            match &outcome {
                Ok(handle) => {
                    let now = state.tick();
                    let inserted = state.next_insert;
                    state.next_insert += 1;
                    state.slots.insert(
                        self.model_id.to_string(),
                        Slot::Ready(Entry {
                            handle: handle.clone(),
                            last_used: now,
                            inserted,
                        }),
                    );
                    info!(model_id = self.model_id, occupancy = state.occupancy(), "model loaded");
                    state.evict_overflow()
                }
                Err(e) => {
                    warn!(model_id = self.model_id, error = %e, "model load failed");
                    Vec::new()
                }
            }
        };
        self.flight.publish(outcome);
        release(evicted);
    }
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(Err(LoadError::LoaderAborted {
                model_id: self.model_id.to_string(),
            }));
        }
    }
}

fn release(evicted: Vec<(String, ModelHandle)>) {
    for (model_id, handle) in evicted {
        info!(model_id, "evicting model");
        drop(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::stub::stub_handle;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn counting(calls: &AtomicUsize) -> impl Fn(&str) -> LoadOutcome + '_ {
        move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(stub_handle())
        }
    }

    #[test]
    fn hit_returns_the_same_backend() {
        let cache = ModelCache::new(2);
        let calls = AtomicUsize::new(0);
        let a = cache.acquire("a", counting(&calls)).unwrap();
        let b = cache.acquire("a", counting(&calls)).unwrap();
        assert!(a.same_model(&b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn capacity_one_reloads_after_eviction() {
        let cache = ModelCache::default();
        let a_calls = AtomicUsize::new(0);
        let b_calls = AtomicUsize::new(0);
        cache.acquire("A", counting(&a_calls)).unwrap();
        cache.acquire("B", counting(&b_calls)).unwrap();
        assert_eq!(cache.stats().keys(), vec!["B"]);
        cache.acquire("A", counting(&a_calls)).unwrap();
        assert_eq!(a_calls.load(Ordering::SeqCst), 2);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = ModelCache::new(2);
        let calls = AtomicUsize::new(0);
        cache.acquire("a", counting(&calls)).unwrap();
        cache.acquire("b", counting(&calls)).unwrap();
        cache.acquire("a", counting(&calls)).unwrap();
        cache.acquire("c", counting(&calls)).unwrap();
        let stats = cache.stats();
        assert_eq!(stats.keys(), vec!["a", "c"]);
        assert_eq!(stats.occupancy, 2);
        assert!(stats.entries[0].last_used < stats.entries[1].last_used);
    }

    #[test]
    fn shrinking_capacity_evicts_immediately() {
        let cache = ModelCache::new(3);
        let calls = AtomicUsize::new(0);
        for id in ["a", "b", "c"] {
            cache.acquire(id, counting(&calls)).unwrap();
        }
        cache.set_capacity(1).unwrap();
        let stats = cache.stats();
        assert_eq!((stats.capacity, stats.occupancy), (1, 1));
        assert_eq!(stats.keys(), vec!["c"]);
        assert!(matches!(cache.set_capacity(0), Err(ScribeError::InvalidOptions(_))));
    }

    #[test]
    fn unload_and_clear() {
        let cache = ModelCache::new(3);
        let calls = AtomicUsize::new(0);
        cache.acquire("a", counting(&calls)).unwrap();
        cache.acquire("b", counting(&calls)).unwrap();
        assert_eq!(cache.unload("a"), 1);
        assert_eq!(cache.unload("a"), 0);
        assert_eq!(cache.unload("never"), 0);
        assert_eq!(cache.stats().keys(), vec!["b"]);
        cache.clear();
        assert_eq!(cache.stats().occupancy, 0);
    }

    #[test]
    fn bare_id_unloads_every_quantized_variant() {
        let cache = ModelCache::new(4);
        let calls = AtomicUsize::new(0);
        for id in ["small", "small@q8", "small.en@q8", "tiny"] {
            cache.acquire(id, counting(&calls)).unwrap();
        }
        assert_eq!(cache.unload("small"), 2);
        assert_eq!(cache.stats().keys().len(), 2);
        assert!(!cache.stats().keys().contains(&"small@q8"));

        assert_eq!(cache.unload("small.en@fp16"), 0);
        assert_eq!(cache.unload("small.en@q8"), 1);
        assert_eq!(cache.stats().keys(), vec!["tiny"]);
    }

    #[test]
    fn concurrent_acquire_loads_once() {
        let cache = Arc::new(ModelCache::new(2));
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (cache, calls, barrier) = (cache.clone(), calls.clone(), barrier.clone());
                thread::spawn(move || {
                    barrier.wait();
                    cache
                        .acquire("shared", |_| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(50));
                            Ok(stub_handle())
                        })
                        .unwrap()
                })
            })
            .collect();
        let models: Vec<ModelHandle> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(models.windows(2).all(|w| w[0].same_model(&w[1])));
        assert_eq!(cache.stats().occupancy, 1);
    }

    #[test]
    fn load_errors_reach_every_waiter_and_are_not_cached() {
        let cache = Arc::new(ModelCache::new(1));
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let (cache, barrier) = (cache.clone(), barrier.clone());
                thread::spawn(move || {
                    barrier.wait();
                    cache.acquire("missing", |id| {
                        thread::sleep(Duration::from_millis(30));
                        Err(LoadError::ModelNotFound { model_id: id.into() })
                    })
                })
            })
            .collect();
        for h in handles {
            assert!(matches!(h.join().unwrap(), Err(LoadError::ModelNotFound { .. })));
        }
        assert_eq!(cache.stats().occupancy, 0);

        let calls = AtomicUsize::new(0);
        cache.acquire("missing", counting(&calls)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_loader_releases_waiters() {
        let cache = Arc::new(ModelCache::new(1));
        let started = Arc::new(Barrier::new(2));

        let loader_thread = {
            let (cache, started) = (cache.clone(), started.clone());
            thread::spawn(move || {
                cache.acquire("boom", |_| {
                    started.wait();
                    thread::sleep(Duration::from_millis(50));
                    panic!("loader crashed");
                })
            })
        };
        started.wait();
        let waiter = cache.acquire("boom", |_| Ok(stub_handle()));

        assert!(loader_thread.join().is_err());
        assert!(matches!(waiter, Err(LoadError::LoaderAborted { .. })));
        assert!(cache.acquire("boom", |_| Ok(stub_handle())).is_ok());
    }

    #[test]
    fn eviction_leaves_outstanding_handles_usable() {
        let cache = ModelCache::new(1);
        let a = cache.acquire("a", |_| Ok(stub_handle())).unwrap();
        cache.acquire("b", |_| Ok(stub_handle())).unwrap();
        assert_eq!(cache.stats().keys(), vec!["b"]);
        // the evicted backend is still alive through `a`
        assert_eq!(a.metadata().n_mels, 80);
        let _guard = a.lock();
    }
}
