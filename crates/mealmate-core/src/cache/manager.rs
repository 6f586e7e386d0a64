use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::storage::{KeyValueStore, StorageError};

/// Storage key prefix for persisted cache entries.
pub const CACHE_KEY_PREFIX: &str = "cache:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub payload: Value,
    pub stored_at: DateTime<Utc>,
    pub ttl_ms: u64,
}

impl CacheEntry {
    pub fn expires_at(&self) -> DateTime<Utc> {
        i64::try_from(self.ttl_ms)
            .ok()
            .and_then(Duration::try_milliseconds)
            .and_then(|ttl| self.stored_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Valid up to and including `stored_at + ttl_ms`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() < now
    }
}

pub struct ResponseCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn KeyValueStore>>,
}

impl ResponseCache {
    /// In-memory cache.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            store: None,
        }
    }

    /// Write entries through to `store` as well.
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn storage_key(key: &str) -> String {
        format!("{}{}", CACHE_KEY_PREFIX, key)
    }

    /// Load persisted, still-valid entries into memory. Unreadable, corrupt
    /// and expired records are deleted from the store and skipped; only a
    /// failure to list the store is an error.
    pub async fn hydrate(&self) -> Result<usize, StorageError> {
        let Some(store) = self.store.as_ref() else {
            return Ok(0);
        };

        let now = self.clock.now();
        let mut loaded = 0;
        for storage_key in store.list_keys(CACHE_KEY_PREFIX).await? {
            let raw = match store.get(&storage_key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %storage_key, error = %e, "Dropping unreadable cache record");
                    self.discard_record(store.as_ref(), &storage_key).await;
                    continue;
                }
            };
            let entry: CacheEntry = match serde_json::from_str(&raw) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(key = %storage_key, error = %e, "Dropping corrupt cache record");
                    self.discard_record(store.as_ref(), &storage_key).await;
                    continue;
                }
            };
            if entry.is_expired_at(now) {
                self.discard_record(store.as_ref(), &storage_key).await;
                continue;
            }
            self.entries().insert(entry.key.clone(), entry);
            loaded += 1;
        }
        debug!(loaded = loaded, "Hydrated response cache");
        Ok(loaded)
    }

    async fn discard_record(&self, store: &dyn KeyValueStore, storage_key: &str) {
        if let Err(e) = store.delete(storage_key).await {
            debug!(key = storage_key, error = %e, "Failed to delete cache record");
        }
    }

    /// Look up a valid entry. Expired entries are left in place but reported
    /// as a miss.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now();
        let entries = self.entries();
        match entries.get(key) {
            Some(entry) if !entry.is_expired_at(now) => {
                debug!(key = key, "Cache hit");
                Some(entry.clone())
            }
            Some(_) => {
                debug!(key = key, "Cache entry expired");
                None
            }
            None => {
                debug!(key = key, "Cache miss");
                None
            }
        }
    }

    pub async fn set(&self, key: &str, payload: Value, ttl_ms: u64) {
        let entry = CacheEntry {
            key: key.to_string(),
            payload,
            stored_at: self.clock.now(),
            ttl_ms,
        };

        if let Some(store) = self.store.as_ref() {
            match serde_json::to_string(&entry) {
                Ok(raw) => {
                    if let Err(e) = store.set(&Self::storage_key(key), &raw).await {
                        warn!(key = key, error = %e, "Failed to persist cache entry");
                    }
                }
                Err(e) => warn!(key = key, error = %e, "Failed to serialize cache entry"),
            }
        }

        self.entries().insert(key.to_string(), entry);
    }

    pub async fn invalidate(&self, key: &str) {
        self.entries().remove(key);
        if let Some(store) = self.store.as_ref() {
            if let Err(e) = store.delete(&Self::storage_key(key)).await {
                warn!(key = key, error = %e, "Failed to delete cache entry");
            }
        }
    }

    /// Remove every entry whose key starts with `prefix`.
    pub async fn invalidate_prefix(&self, prefix: &str) {
        let removed: Vec<String> = {
            let mut entries = self.entries();
            let keys: Vec<String> = entries
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect();
            for key in &keys {
                entries.remove(key);
            }
            keys
        };
        debug!(prefix = prefix, removed = removed.len(), "Invalidated cache prefix");

        if let Some(store) = self.store.as_ref() {
            self.delete_persisted(store.as_ref(), &Self::storage_key(prefix)).await;
        }
    }

    pub async fn invalidate_all(&self) {
        self.entries().clear();
        debug!("Invalidated entire response cache");

        if let Some(store) = self.store.as_ref() {
            self.delete_persisted(store.as_ref(), CACHE_KEY_PREFIX).await;
        }
    }

    async fn delete_persisted(&self, store: &dyn KeyValueStore, storage_prefix: &str) {
        let keys = match store.list_keys(storage_prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(prefix = storage_prefix, error = %e, "Failed to list cache records");
                return;
            }
        };
        for key in keys {
            if let Err(e) = store.delete(&key).await {
                warn!(key = %key, error = %e, "Failed to delete cache record");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
