//! In-memory caches used by the queue coordinator.

pub mod lru;

pub use lru::LruCache;
