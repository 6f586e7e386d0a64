//! Response caching for read requests.
//!
//! This module provides the `ResponseCache`, a keyed store of successful
//! read payloads with a per-entry TTL. Expired entries read as misses.
//! When backed by a `KeyValueStore`, entries are written through under the
//! `cache:` prefix and reloaded on startup with `hydrate()`.

pub mod manager;

pub use manager::{CacheEntry, ResponseCache, CACHE_KEY_PREFIX};
