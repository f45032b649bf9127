//! Core data types for model caching.

use celestial_abstraction::ModelError;
use serde::Serialize;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::OwnedSemaphorePermit;

/// Identifier of a cacheable resource.
///
/// Blanket-implemented for every type with the required bounds.
pub trait ResourceKey: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

impl<T> ResourceKey for T where T: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

/// An expensive, device-bound resource owned by the cache.
///
/// `release` must free device and host memory before it returns. The cache calls it
/// at most once per handle; implementations should still treat a second call as a no-op.
pub trait Resource: Send + Sync + 'static {
    /// Frees the memory held by this resource.
    ///
    /// # Errors
    /// Returns `ReleaseError` if the backend could not confirm the memory was freed.
    fn release(&self) -> Result<(), ReleaseError>;
}

/// Errors raised while building a resource for the cache.
///
/// `Clone` so that a single failure can be handed to every caller that joined
/// the same in-flight construction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConstructionError {
    /// The target device is invalid or unavailable.
    #[error("Invalid device: {0}")]
    InvalidDevice(String),

    /// The underlying build step failed.
    #[error("Failed to construct model: {0}")]
    Load(#[source] ModelError),

    /// The construction task panicked or was cancelled before publishing a result.
    #[error("Model construction aborted: {0}")]
    Aborted(String),

    /// Every capacity slot has been quarantined after failed releases.
    #[error("No capacity left: all {capacity} slots are quarantined after failed releases")]
    CapacityExhausted {
        /// Configured capacity of the cache.
        capacity: usize,
    },

    /// The cache is shutting down and admits no new models.
    #[error("Model cache is shutting down")]
    ShuttingDown,
}

impl From<ConstructionError> for ModelError {
    fn from(err: ConstructionError) -> Self {
        match err {
            ConstructionError::InvalidDevice(device) => Self::InvalidDevice(device),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// Errors raised while releasing an evicted resource.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReleaseError {
    /// The backend reported a failure while unloading.
    #[error("Backend failed to unload: {0}")]
    Backend(#[source] ModelError),

    /// The release task panicked.
    #[error("Release task panicked: {0}")]
    Panicked(String),
}

/// A live cache entry.
///
/// Holds one capacity permit for as long as the handle exists.
pub struct CachedModel<H> {
    /// The cached handle.
    pub handle: Arc<H>,
    /// Logical clock value of the last acquisition.
    pub last_accessed: u64,
    /// Number of times this handle has been acquired.
    pub access_count: u64,
    /// Timestamp when the handle was cached.
    pub created_at: Instant,
    /// Construction that produced this handle.
    pub(crate) generation: u64,
    /// Callers that joined the construction and have not yet taken the handle.
    /// The entry is not an eviction candidate while this is non-zero.
    pub(crate) pending_claims: usize,
    pub(crate) permit: OwnedSemaphorePermit,
}

impl<H> CachedModel<H> {
    pub(crate) fn new(
        handle: Arc<H>,
        tick: u64,
        generation: u64,
        pending_claims: usize,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            handle,
            last_accessed: tick,
            access_count: 0,
            created_at: Instant::now(),
            generation,
            pending_claims,
            permit,
        }
    }

    /// Record an acquisition at logical time `tick`.
    pub fn touch(&mut self, tick: u64) {
        self.last_accessed = tick;
        self.access_count += 1;
    }
}

impl<H> Debug for CachedModel<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedModel")
            .field("last_accessed", &self.last_accessed)
            .field("access_count", &self.access_count)
            .field("pending_claims", &self.pending_claims)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Cache statistics for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Acquisitions served by an already-live handle.
    pub total_hits: u64,
    /// Acquisitions that started a new construction.
    pub total_misses: u64,
    /// Handles evicted, by capacity pressure or teardown.
    pub total_evictions: u64,
    /// Constructions that failed and left no entry behind.
    pub construction_failures: u64,
    /// Releases that reported an error.
    pub release_failures: u64,
    /// Capacity slots withheld after failed releases.
    pub quarantined_slots: usize,
    /// Current number of live handles.
    pub cache_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Semaphore;

    #[test]
    fn test_cached_model_touch() {
        let slots = Arc::new(Semaphore::new(1));
        let permit = slots.try_acquire_owned().unwrap();
        let mut cached = CachedModel::new(Arc::new("handle"), 3, 1, 0, permit);

        cached.touch(7);

        assert_eq!(cached.access_count, 1);
        assert_eq!(cached.last_accessed, 7);
    }

    #[test]
    fn test_construction_error_into_model_error() {
        let device: ModelError = ConstructionError::InvalidDevice("cuda:7".into()).into();
        assert_eq!(device, ModelError::InvalidDevice("cuda:7".into()));

        let failed: ModelError = ConstructionError::Load(ModelError::LoadFailed("oom".into())).into();
        assert!(matches!(failed, ModelError::Unavailable(ref msg) if msg.contains("oom")));
        assert_eq!(failed.status_code(), 503);
    }

    #[test]
    fn test_cache_stats_default() {
        let stats = CacheStats::default();
        assert_eq!(stats.total_hits, 0);
        assert_eq!(stats.total_misses, 0);
        assert_eq!(stats.total_evictions, 0);
        assert_eq!(stats.cache_size, 0);
    }
}
