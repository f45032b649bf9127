//! Model caching system bounding how many models are loaded at once.
//!
//! This module provides a capacity-bounded cache for speech models. Models are
//! constructed lazily on first use, shared between concurrent callers, and the
//! least-recently-used model is released before a new one is admitted once the
//! capacity is reached.

pub mod cache;
pub mod config;
pub mod types;

pub use cache::ModelCache;
pub use config::{CacheConfig, CacheConfigError, ReleasePolicy};
pub use types::{CacheStats, CachedModel, ConstructionError, ReleaseError, Resource, ResourceKey};
