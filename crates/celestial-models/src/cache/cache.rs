//! ModelCache implementation with single-flight construction and LRU eviction.

use crate::factory::ResourceFactory;
use celestial_abstraction::Device;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, watch};
use tracing::{debug, error, info, warn};

use super::config::{CacheConfig, CacheConfigError, ReleasePolicy};
use super::types::{
    CacheStats, CachedModel, ConstructionError, ReleaseError, Resource, ResourceKey,
};

/// Result published by a construction task; `None` until it settles.
type Outcome<H> = Option<Result<Arc<H>, ConstructionError>>;

/// Per-key state: `absent → Constructing → Live → Evicting → absent`.
enum Slot<H> {
    Live(CachedModel<H>),
    Constructing {
        receiver: watch::Receiver<Outcome<H>>,
        generation: u64,
        /// Callers holding a [`ClaimTicket`] for this construction.
        waiters: usize,
    },
    Evicting,
}

struct CacheState<K, H> {
    entries: HashMap<K, Slot<H>>,
    /// Logical recency clock, bumped on every acquisition.
    clock: u64,
    closed: bool,
    stats: CacheStats,
}

impl<K: ResourceKey, H> CacheState<K, H> {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn live_count(&self) -> usize {
        self.entries.values().filter(|slot| matches!(slot, Slot::Live(_))).count()
    }

    fn has_pending(&self) -> bool {
        self.entries.values().any(|slot| !matches!(slot, Slot::Live(_)))
    }

    fn lru_key(&self) -> Option<K> {
        self.entries
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Live(entry) if entry.pending_claims == 0 => Some((key, entry.last_accessed)),
                _ => None,
            })
            .min_by_key(|(_, last_accessed)| *last_accessed)
            .map(|(key, _)| key.clone())
    }

    /// Moves a live entry to `Evicting` and hands it to the caller for release.
    fn begin_eviction(&mut self, key: &K) -> Option<CachedModel<H>> {
        if !matches!(self.entries.get(key), Some(Slot::Live(_))) {
            return None;
        }
        match self.entries.insert(key.clone(), Slot::Evicting) {
            Some(Slot::Live(entry)) => {
                self.stats.total_evictions += 1;
                self.stats.cache_size = self.live_count();
                Some(entry)
            }
            _ => None,
        }
    }
}

/// Outcome of a lookup performed under the state lock.
enum Lookup<'a, K: ResourceKey, F: ResourceFactory<K>> {
    Hit(Arc<F::Handle>),
    Await(watch::Receiver<Outcome<F::Handle>>, ClaimTicket<'a, K, F>),
    Wait(Notified<'a>),
}

/// A joined caller's hold on the handle its construction will publish.
///
/// A freshly registered entry is not evicted until every ticket for it has been
/// claimed or dropped, so callers that waited for a construction are handed its
/// result before another construction can take the slot.
struct ClaimTicket<'a, K: ResourceKey, F: ResourceFactory<K>> {
    shared: &'a Shared<K, F>,
    key: K,
    generation: u64,
    claimed: bool,
}

impl<K: ResourceKey, F: ResourceFactory<K>> Drop for ClaimTicket<'_, K, F> {
    fn drop(&mut self) {
        if self.claimed {
            return;
        }
        let evictable = {
            let mut state = self.shared.lock_state();
            match state.entries.get_mut(&self.key) {
                Some(Slot::Constructing { generation, waiters, .. }) if *generation == self.generation => {
                    *waiters = waiters.saturating_sub(1);
                    false
                }
                Some(Slot::Live(entry)) if entry.generation == self.generation => {
                    entry.pending_claims = entry.pending_claims.saturating_sub(1);
                    entry.pending_claims == 0
                }
                _ => false,
            }
        };
        if evictable {
            self.shared.changed.notify_waiters();
        }
    }
}

/// How a construction task obtains its capacity slot.
enum Admission<'a, K, H> {
    Evict(K, CachedModel<H>),
    Wait(Notified<'a>),
}

struct Shared<K: ResourceKey, F: ResourceFactory<K>> {
    factory: F,
    device: Device,
    capacity: usize,
    release_policy: ReleasePolicy,
    /// One permit per handle that may physically exist (constructing, live or releasing).
    slots: Arc<Semaphore>,
    state: Mutex<CacheState<K, F::Handle>>,
    /// Signalled whenever an entry settles or leaves the map.
    changed: Notify,
}

impl<K: ResourceKey, F: ResourceFactory<K>> Shared<K, F> {
    fn lock_state(&self) -> MutexGuard<'_, CacheState<K, F::Handle>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drives one key from `Constructing` to `Live` (or back to absent) and publishes
    /// the outcome to every caller that joined it.
    ///
    /// Runs as its own task so that callers abandoning their wait never cancel it.
    async fn construct(
        self: Arc<Self>,
        key: K,
        generation: u64,
        sender: watch::Sender<Outcome<F::Handle>>,
    ) {
        let started = Instant::now();
        let result = self.build(&key).await;

        let outcome = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            match result {
                Ok((handle, permit)) => {
                    let pending_claims = match state.entries.get(&key) {
                        Some(Slot::Constructing { waiters, .. }) => *waiters,
                        _ => 0,
                    };
                    let tick = state.tick();
                    state.entries.insert(
                        key.clone(),
                        Slot::Live(CachedModel::new(
                            Arc::clone(&handle),
                            tick,
                            generation,
                            pending_claims,
                            permit,
                        )),
                    );
                    state.stats.cache_size = state.live_count();
                    info!(
                        model = ?key,
                        device = %self.device,
                        duration_ms = started.elapsed().as_millis(),
                        cache_size = state.stats.cache_size,
                        "Model cached"
                    );
                    Ok(handle)
                }
                Err(err) => {
                    state.entries.remove(&key);
                    state.stats.construction_failures += 1;
                    warn!(model = ?key, error = %err, "Model construction failed");
                    Err(err)
                }
            }
        };

        sender.send_replace(Some(outcome));
        self.changed.notify_waiters();
    }

    async fn build(
        self: &Arc<Self>,
        key: &K,
    ) -> Result<(Arc<F::Handle>, OwnedSemaphorePermit), ConstructionError> {
        let permit = self.acquire_slot(key).await?;

        // The slot is held before the factory runs, so a failed build hands it straight back.
        let shared = Arc::clone(self);
        let task_key = key.clone();
        let handle =
            tokio::task::spawn_blocking(move || shared.factory.construct(&task_key, &shared.device))
                .await
                .map_err(|e| ConstructionError::Aborted(e.to_string()))??;

        Ok((Arc::new(handle), permit))
    }

    /// Obtains a capacity slot, evicting the least-recently-used live entry if needed.
    ///
    /// The victim's release completes before its slot is handed over: a single device
    /// never holds more than `capacity` models, even transiently.
    async fn acquire_slot(self: &Arc<Self>, key: &K) -> Result<OwnedSemaphorePermit, ConstructionError> {
        loop {
            let admission = {
                let mut guard = self.lock_state();
                let state = &mut *guard;

                if state.closed {
                    return Err(ConstructionError::ShuttingDown);
                }
                if let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() {
                    return Ok(permit);
                }
                if state.stats.quarantined_slots >= self.capacity {
                    error!(capacity = self.capacity, "Every cache slot is quarantined");
                    return Err(ConstructionError::CapacityExhausted { capacity: self.capacity });
                }

                let victim = state
                    .lru_key()
                    .and_then(|victim| state.begin_eviction(&victim).map(|entry| (victim, entry)));
                match victim {
                    Some((victim, entry)) => Admission::Evict(victim, entry),
                    None => Admission::Wait(self.changed.notified()),
                }
            };

            match admission {
                Admission::Evict(victim, entry) => {
                    info!(evicted = ?victim, admitting = ?key, "Evicting least-recently-used model");
                    let permit = self.release_entry(&victim, entry).await;
                    self.finish_eviction(&victim);
                    if let Some(permit) = permit {
                        return Ok(permit);
                    }
                }
                Admission::Wait(notified) => {
                    debug!(model = ?key, "Every slot is busy, waiting for one to settle");
                    notified.await;
                }
            }
        }
    }

    /// Releases an evicted entry on the blocking pool.
    ///
    /// Returns the entry's permit if the slot may be reused.
    async fn release_entry(&self, key: &K, entry: CachedModel<F::Handle>) -> Option<OwnedSemaphorePermit> {
        let CachedModel { handle, permit, access_count, created_at, .. } = entry;
        let started = Instant::now();

        let result = tokio::task::spawn_blocking(move || handle.release())
            .await
            .unwrap_or_else(|e| Err(ReleaseError::Panicked(e.to_string())));

        match result {
            Ok(()) => {
                info!(
                    model = ?key,
                    access_count,
                    age_ms = created_at.elapsed().as_millis(),
                    duration_ms = started.elapsed().as_millis(),
                    "Released model"
                );
                Some(permit)
            }
            Err(err) => {
                let mut state = self.lock_state();
                state.stats.release_failures += 1;
                match self.release_policy {
                    ReleasePolicy::Reclaim => {
                        warn!(model = ?key, error = %err, "Model release failed, reclaiming its slot");
                        Some(permit)
                    }
                    ReleasePolicy::Quarantine => {
                        state.stats.quarantined_slots += 1;
                        warn!(
                            model = ?key,
                            error = %err,
                            quarantined = state.stats.quarantined_slots,
                            "Model release failed, quarantining its slot"
                        );
                        permit.forget();
                        None
                    }
                }
            }
        }
    }

    fn finish_eviction(&self, key: &K) {
        {
            let mut state = self.lock_state();
            if matches!(state.entries.get(key), Some(Slot::Evicting)) {
                state.entries.remove(key);
            }
        }
        self.changed.notify_waiters();
    }
}

impl<K: ResourceKey, F: ResourceFactory<K>> Drop for Shared<K, F> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (key, slot) in state.entries.drain() {
            if let Slot::Live(entry) = slot {
                if let Err(err) = entry.handle.release() {
                    warn!(model = ?key, error = %err, "Failed to release model on cache drop");
                }
            }
        }
    }
}

/// Model cache bounding how many expensive handles are alive at once.
///
/// Handles are constructed lazily through a [`ResourceFactory`], shared between
/// concurrent callers, and released least-recently-used first when the capacity
/// is reached. Cloning the cache yields another reference to the same state.
pub struct ModelCache<K: ResourceKey, F: ResourceFactory<K>> {
    shared: Arc<Shared<K, F>>,
}

impl<K: ResourceKey, F: ResourceFactory<K>> ModelCache<K, F> {
    /// Create a new model cache with the given configuration.
    ///
    /// # Arguments
    /// * `config` - Cache configuration
    /// * `factory` - Factory used to construct missing handles
    ///
    /// # Errors
    /// Returns `CacheConfigError` if the configuration is invalid.
    pub fn new(config: CacheConfig, factory: F) -> Result<Self, CacheConfigError> {
        config.validate()?;
        let device = config.parsed_device()?;

        Ok(Self {
            shared: Arc::new(Shared {
                factory,
                device,
                capacity: config.max_loaded_models,
                release_policy: config.release_policy,
                slots: Arc::new(Semaphore::new(config.max_loaded_models)),
                state: Mutex::new(CacheState {
                    entries: HashMap::new(),
                    clock: 0,
                    closed: false,
                    stats: CacheStats::default(),
                }),
                changed: Notify::new(),
            }),
        })
    }

    /// Get a handle from cache or construct it if not present.
    ///
    /// A hit promotes the entry to most-recently-used. On a miss exactly one
    /// construction runs per key; concurrent callers for the same key wait for it
    /// and receive the same handle or the same error. A failed construction leaves
    /// nothing behind, so the next call retries from scratch.
    ///
    /// Dropping the returned future does not cancel the construction.
    ///
    /// # Errors
    /// Returns `ConstructionError` if construction fails or the cache is shutting down.
    pub async fn get_or_create(&self, key: &K) -> Result<Arc<F::Handle>, ConstructionError> {
        loop {
            match self.lookup(key)? {
                Lookup::Hit(handle) => return Ok(handle),
                Lookup::Wait(notified) => notified.await,
                Lookup::Await(receiver, mut ticket) => {
                    let handle = Self::await_outcome(receiver).await?;
                    if let Some(handle) = self.claim(&mut ticket, &handle) {
                        return Ok(handle);
                    }
                    debug!(model = ?key, "Model was evicted before hand-off, retrying");
                }
            }
        }
    }

    fn lookup(&self, key: &K) -> Result<Lookup<'_, K, F>, ConstructionError> {
        let mut guard = self.shared.lock_state();
        let state = &mut *guard;

        if state.closed {
            return Err(ConstructionError::ShuttingDown);
        }

        match state.entries.get_mut(key) {
            Some(Slot::Live(entry)) => {
                state.clock += 1;
                entry.touch(state.clock);
                state.stats.total_hits += 1;
                debug!(model = ?key, access_count = entry.access_count, "Cache hit");
                Ok(Lookup::Hit(Arc::clone(&entry.handle)))
            }
            Some(Slot::Constructing { receiver, generation, waiters }) => {
                debug!(model = ?key, "Joining in-flight construction");
                *waiters += 1;
                let ticket = self.ticket(key, *generation);
                Ok(Lookup::Await(receiver.clone(), ticket))
            }
            Some(Slot::Evicting) => {
                debug!(model = ?key, "Model is being evicted, waiting");
                Ok(Lookup::Wait(self.shared.changed.notified()))
            }
            None => {
                state.stats.total_misses += 1;
                debug!(model = ?key, "Cache miss, constructing model");
                let (sender, receiver) = watch::channel(None);
                let generation = state.tick();
                state.entries.insert(
                    key.clone(),
                    Slot::Constructing { receiver: receiver.clone(), generation, waiters: 1 },
                );
                tokio::spawn(Arc::clone(&self.shared).construct(key.clone(), generation, sender));
                Ok(Lookup::Await(receiver, self.ticket(key, generation)))
            }
        }
    }

    async fn await_outcome(
        mut receiver: watch::Receiver<Outcome<F::Handle>>,
    ) -> Result<Arc<F::Handle>, ConstructionError> {
        let outcome = receiver.wait_for(Option::is_some).await.map_err(|_| {
            ConstructionError::Aborted("construction task ended without a result".to_string())
        })?;
        let result = (*outcome).clone();
        result.unwrap_or_else(|| {
            Err(ConstructionError::Aborted("construction task ended without a result".to_string()))
        })
    }

    fn ticket(&self, key: &K, generation: u64) -> ClaimTicket<'_, K, F> {
        ClaimTicket { shared: &self.shared, key: key.clone(), generation, claimed: false }
    }

    /// Records the acquisition of a freshly constructed handle, unless it has
    /// already been evicted.
    fn claim(
        &self,
        ticket: &mut ClaimTicket<'_, K, F>,
        handle: &Arc<F::Handle>,
    ) -> Option<Arc<F::Handle>> {
        let (handle, evictable) = {
            let mut guard = self.shared.lock_state();
            let state = &mut *guard;
            match state.entries.get_mut(&ticket.key) {
                Some(Slot::Live(entry))
                    if entry.generation == ticket.generation && Arc::ptr_eq(&entry.handle, handle) =>
                {
                    state.clock += 1;
                    entry.touch(state.clock);
                    entry.pending_claims = entry.pending_claims.saturating_sub(1);
                    ticket.claimed = true;
                    (Arc::clone(&entry.handle), entry.pending_claims == 0)
                }
                _ => return None,
            }
        };
        if evictable {
            self.shared.changed.notify_waiters();
        }
        Some(handle)
    }

    /// Release every live handle and clear the cache.
    ///
    /// Constructions still in flight are not interrupted; they register normally
    /// once they finish.
    ///
    /// # Returns
    /// The number of handles released.
    pub async fn evict_all(&self) -> usize {
        let victims: Vec<(K, CachedModel<F::Handle>)> = {
            let mut guard = self.shared.lock_state();
            let state = &mut *guard;
            let live: Vec<K> = state
                .entries
                .iter()
                .filter(|(_, slot)| matches!(slot, Slot::Live(_)))
                .map(|(key, _)| key.clone())
                .collect();
            live.into_iter()
                .filter_map(|key| state.begin_eviction(&key).map(|entry| (key, entry)))
                .collect()
        };

        let evicted = victims.len();
        for (key, entry) in victims {
            let permit = self.shared.release_entry(&key, entry).await;
            drop(permit);
            self.shared.finish_eviction(&key);
        }

        info!(evicted, "Evicted all models from cache");
        evicted
    }

    /// Stop admitting new handles, wait for in-flight work to settle, then release
    /// everything.
    ///
    /// Subsequent calls to [`ModelCache::get_or_create`] fail with
    /// [`ConstructionError::ShuttingDown`].
    ///
    /// # Returns
    /// The number of handles released.
    pub async fn shutdown(&self) -> usize {
        self.shared.lock_state().closed = true;
        self.shared.changed.notify_waiters();

        loop {
            let notified = {
                let state = self.shared.lock_state();
                if !state.has_pending() {
                    break;
                }
                self.shared.changed.notified()
            };
            debug!("Waiting for in-flight constructions before shutdown");
            notified.await;
        }

        self.evict_all().await
    }

    /// Get current cache statistics.
    ///
    /// # Returns
    /// A snapshot of current cache statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.shared.lock_state();
        let mut stats = state.stats.clone();
        stats.cache_size = state.live_count();
        stats
    }

    /// Number of live handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.lock_state().live_count()
    }

    /// Whether no handle is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a live handle exists for `key`. Does not affect recency.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        matches!(self.shared.lock_state().entries.get(key), Some(Slot::Live(_)))
    }

    /// Keys of live handles, least-recently-used first.
    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        let state = self.shared.lock_state();
        let mut live: Vec<(u64, K)> = state
            .entries
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Live(entry) => Some((entry.last_accessed, key.clone())),
                _ => None,
            })
            .collect();
        live.sort_by_key(|(last_accessed, _)| *last_accessed);
        live.into_iter().map(|(_, key)| key).collect()
    }

    /// Maximum number of simultaneously live handles.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Device handles are constructed on.
    #[must_use]
    pub fn device(&self) -> Device {
        self.shared.device
    }

    /// The factory used to construct handles.
    #[must_use]
    pub fn factory(&self) -> &F {
        &self.shared.factory
    }
}

impl<K: ResourceKey, F: ResourceFactory<K>> Clone for ModelCache<K, F> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<K: ResourceKey, F: ResourceFactory<K>> std::fmt::Debug for ModelCache<K, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCache")
            .field("capacity", &self.shared.capacity)
            .field("device", &self.shared.device)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use celestial_abstraction::ModelError;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Counted {
        key: String,
        releases: Arc<Mutex<Vec<String>>>,
        fail_release: bool,
    }

    impl Resource for Counted {
        fn release(&self) -> Result<(), ReleaseError> {
            self.releases.lock().unwrap().push(self.key.clone());
            if self.fail_release {
                return Err(ReleaseError::Backend(ModelError::Inference("device busy".into())));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        constructed: AtomicUsize,
        releases: Arc<Mutex<Vec<String>>>,
        failing: Mutex<HashSet<String>>,
        sticky: HashSet<String>,
    }

    impl ResourceFactory<String> for CountingFactory {
        type Handle = Counted;

        fn construct(&self, key: &String, _device: &Device) -> Result<Counted, ConstructionError> {
            if self.failing.lock().unwrap().contains(key) {
                return Err(ConstructionError::Load(ModelError::LoadFailed(format!("no weights for {key}"))));
            }
            self.constructed.fetch_add(1, Ordering::SeqCst);
            Ok(Counted {
                key: key.clone(),
                releases: Arc::clone(&self.releases),
                fail_release: self.sticky.contains(key),
            })
        }
    }

    fn cache(capacity: usize) -> ModelCache<String, CountingFactory> {
        ModelCache::new(CacheConfig::with_capacity(capacity), CountingFactory::default()).unwrap()
    }

    fn released(cache: &ModelCache<String, CountingFactory>) -> Vec<String> {
        cache.factory().releases.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_cache_hit_returns_same_instance() {
        let cache = cache(2);

        let first = cache.get_or_create(&"preset".to_string()).await.unwrap();
        let second = cache.get_or_create(&"preset".to_string()).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.factory().constructed.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.total_hits, 1);
        assert_eq!(stats.total_misses, 1);
        assert_eq!(stats.cache_size, 1);
    }

    #[tokio::test]
    async fn test_lru_eviction_when_cache_full() {
        let cache = cache(2);

        let _a = cache.get_or_create(&"A".to_string()).await.unwrap();
        let b = cache.get_or_create(&"B".to_string()).await.unwrap();
        // Refresh A so that B becomes least recently used.
        let _ = cache.get_or_create(&"A".to_string()).await.unwrap();
        let _c = cache.get_or_create(&"C".to_string()).await.unwrap();

        assert_eq!(released(&cache), vec!["B".to_string()]);
        assert_eq!(cache.keys(), vec!["A".to_string(), "C".to_string()]);

        let stats = cache.stats();
        assert_eq!(stats.total_evictions, 1);
        assert_eq!(stats.cache_size, 2);

        let b_again = cache.get_or_create(&"B".to_string()).await.unwrap();
        assert!(!Arc::ptr_eq(&b, &b_again));
        assert_eq!(released(&cache), vec!["B".to_string(), "A".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_construction_leaves_no_entry() {
        let cache = cache(1);
        cache.factory().failing.lock().unwrap().insert("Z".to_string());

        let err = cache.get_or_create(&"Z".to_string()).await.unwrap_err();
        assert!(matches!(err, ConstructionError::Load(ModelError::LoadFailed(_))));
        assert!(cache.is_empty());
        assert_eq!(cache.stats().construction_failures, 1);

        cache.factory().failing.lock().unwrap().clear();
        let handle = cache.get_or_create(&"Z".to_string()).await.unwrap();
        assert_eq!(handle.key, "Z");
        assert_eq!(cache.len(), 1);
        assert!(released(&cache).is_empty());
    }

    #[tokio::test]
    async fn test_failure_does_not_consume_capacity() {
        let cache = cache(1);
        let _x = cache.get_or_create(&"X".to_string()).await.unwrap();
        cache.factory().failing.lock().unwrap().insert("Y".to_string());

        // The victim is still evicted before the factory runs.
        assert!(cache.get_or_create(&"Y".to_string()).await.is_err());
        assert!(cache.is_empty());

        let _z = cache.get_or_create(&"Z".to_string()).await.unwrap();
        assert_eq!(cache.keys(), vec!["Z".to_string()]);
    }

    #[tokio::test]
    async fn test_evict_all_releases_everything_once() {
        let cache = cache(3);
        for key in ["A", "B", "C"] {
            let _ = cache.get_or_create(&key.to_string()).await.unwrap();
        }

        assert_eq!(cache.evict_all().await, 3);
        assert!(cache.is_empty());

        let mut released = released(&cache);
        released.sort();
        assert_eq!(released, vec!["A".to_string(), "B".to_string(), "C".to_string()]);

        assert_eq!(cache.evict_all().await, 0);
        assert_eq!(cache.factory().releases.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_contains_does_not_refresh_recency() {
        let cache = cache(2);
        let _ = cache.get_or_create(&"A".to_string()).await.unwrap();
        let _ = cache.get_or_create(&"B".to_string()).await.unwrap();

        assert!(cache.contains(&"A".to_string()));
        let _ = cache.get_or_create(&"C".to_string()).await.unwrap();

        assert!(!cache.contains(&"A".to_string()));
        assert!(cache.contains(&"B".to_string()));
    }

    #[tokio::test]
    async fn test_quarantine_withholds_slot_after_failed_release() {
        let factory = CountingFactory { sticky: HashSet::from(["stuck".to_string()]), ..Default::default() };
        let cache = ModelCache::new(CacheConfig::with_capacity(1), factory).unwrap();

        let _ = cache.get_or_create(&"stuck".to_string()).await.unwrap();
        let err = cache.get_or_create(&"next".to_string()).await.unwrap_err();

        assert_eq!(err, ConstructionError::CapacityExhausted { capacity: 1 });
        let stats = cache.stats();
        assert_eq!(stats.release_failures, 1);
        assert_eq!(stats.quarantined_slots, 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_reclaim_policy_reuses_slot() {
        let factory = CountingFactory { sticky: HashSet::from(["stuck".to_string()]), ..Default::default() };
        let config = CacheConfig { release_policy: ReleasePolicy::Reclaim, ..CacheConfig::with_capacity(1) };
        let cache = ModelCache::new(config, factory).unwrap();

        let _ = cache.get_or_create(&"stuck".to_string()).await.unwrap();
        let next = cache.get_or_create(&"next".to_string()).await.unwrap();

        assert_eq!(next.key, "next");
        assert_eq!(cache.stats().release_failures, 1);
        assert_eq!(cache.stats().quarantined_slots, 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_requests() {
        let cache = cache(2);
        let _ = cache.get_or_create(&"A".to_string()).await.unwrap();

        assert_eq!(cache.shutdown().await, 1);

        let err = cache.get_or_create(&"A".to_string()).await.unwrap_err();
        assert_eq!(err, ConstructionError::ShuttingDown);
        assert_eq!(released(&cache), vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn test_drop_releases_live_handles() {
        let cache = cache(2);
        let releases = Arc::clone(&cache.factory().releases);
        let _ = cache.get_or_create(&"A".to_string()).await.unwrap();

        drop(cache);

        assert_eq!(*releases.lock().unwrap(), vec!["A".to_string()]);
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let result = ModelCache::new(CacheConfig::with_capacity(0), CountingFactory::default());
        assert!(matches!(result, Err(CacheConfigError::InvalidMaxLoadedModels)));
    }
}
