use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{NewQueueEntry, QueueEntry};
use crate::clock::Clock;
use crate::storage::{KeyValueStore, StorageError};

/// Well-known storage key holding the ordered queue.
pub const QUEUE_STORAGE_KEY: &str = "offline_queue";

/// Result of recording a failed replay.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Still queued with the new attempt count.
    Retained { attempts: u32 },
    /// Reached `max_attempts` and was removed. Must be surfaced to the user.
    Dropped(QueueEntry),
    /// No entry with that id.
    NotFound,
}

/// Durable FIFO of mutations awaiting replay.
///
/// Every operation is a read-modify-write of the whole list, serialized by
/// an async mutex so two tasks never interleave their updates.
pub struct OfflineQueue {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    lock: Mutex<()>,
}

impl OfflineQueue {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Vec<QueueEntry>, StorageError> {
        match self.store.get(QUEUE_STORAGE_KEY).await? {
            Some(raw) => {
                serde_json::from_str(&raw).map_err(|e| StorageError::corrupt(QUEUE_STORAGE_KEY, e))
            }
            None => Ok(Vec::new()),
        }
    }

    async fn persist(&self, entries: &[QueueEntry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return self.store.delete(QUEUE_STORAGE_KEY).await;
        }
        let raw = serde_json::to_string(entries)
            .map_err(|e| StorageError::serialize(QUEUE_STORAGE_KEY, e))?;
        self.store.set(QUEUE_STORAGE_KEY, &raw).await
    }

    /// Append to the end of the queue and return the new entry's id.
    pub async fn enqueue(&self, new: NewQueueEntry) -> Result<String, StorageError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;

        let entry = QueueEntry {
            id: uuid::Uuid::new_v4().to_string(),
            method: new.method,
            url: new.url,
            body: new.body,
            headers: new.headers,
            created_at: self.clock.now(),
            attempts: 0,
            max_attempts: new.max_attempts,
        };
        let id = entry.id.clone();
        info!(id = %id, method = %entry.method, url = %entry.url, "Queued request for offline replay");

        entries.push(entry);
        self.persist(&entries).await?;
        Ok(id)
    }

    /// Snapshot of all entries in insertion order. Nothing is removed.
    pub async fn drain_ordered(&self) -> Result<Vec<QueueEntry>, StorageError> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    /// Remove an entry after a confirmed replay. Returns whether it existed.
    pub async fn remove(&self, id: &str) -> Result<bool, StorageError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        let before = entries.len();
        entries.retain(|e| e.id != id);
        if entries.len() == before {
            return Ok(false);
        }
        self.persist(&entries).await?;
        debug!(id = id, "Removed queued request");
        Ok(true)
    }

    /// Count a failed replay; drops the entry once it reaches `max_attempts`.
    pub async fn increment_attempt(&self, id: &str) -> Result<AttemptOutcome, StorageError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        let Some(index) = entries.iter().position(|e| e.id == id) else {
            return Ok(AttemptOutcome::NotFound);
        };

        entries[index].attempts += 1;
        let outcome = if entries[index].is_exhausted() {
            let dropped = entries.remove(index);
            error!(
                id = %dropped.id,
                method = %dropped.method,
                url = %dropped.url,
                attempts = dropped.attempts,
                "Dropping queued request after max attempts"
            );
            AttemptOutcome::Dropped(dropped)
        } else {
            AttemptOutcome::Retained {
                attempts: entries[index].attempts,
            }
        };

        self.persist(&entries).await?;
        Ok(outcome)
    }

    pub async fn size(&self) -> Result<usize, StorageError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.len())
    }

    /// Bytes used by the persisted record.
    pub async fn estimated_storage_bytes(&self) -> Result<usize, StorageError> {
        let _guard = self.lock.lock().await;
        Ok(self
            .store
            .get(QUEUE_STORAGE_KEY)
            .await?
            .map(|raw| raw.len())
            .unwrap_or(0))
    }

    /// Discard every pending request. Returns how many were discarded, or
    /// `None` when the record could not be read and the count is unknown.
    pub async fn clear_all(&self) -> Result<Option<usize>, StorageError> {
        let _guard = self.lock.lock().await;
        let count = match self.load().await {
            Ok(entries) => Some(entries.len()),
            Err(e) => {
                warn!(error = %e, "Discarding unreadable offline queue");
                None
            }
        };
        self.store.delete(QUEUE_STORAGE_KEY).await?;
        info!(count = ?count, "Cleared offline queue");
        Ok(count)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Method;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;
    use crate::testing::FailingStore;
    use serde_json::json;

    fn queue() -> (OfflineQueue, Arc<dyn KeyValueStore>) {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let queue = OfflineQueue::new(store.clone(), Arc::new(ManualClock::default()));
        (queue, store)
    }

    fn post(url: &str) -> NewQueueEntry {
        NewQueueEntry::new(Method::Post, url, Some(json!({"url": url})))
    }

    #[tokio::test]
    async fn test_enqueue_preserves_insertion_order() {
        let (queue, _) = queue();
        let a = queue.enqueue(post("/a")).await.unwrap();
        let b = queue.enqueue(post("/b")).await.unwrap();
        let c = queue.enqueue(post("/c")).await.unwrap();

        let entries = queue.drain_ordered().await.unwrap();
        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec![a.as_str(), b.as_str(), c.as_str()]);
        assert!(entries.iter().all(|e| e.attempts == 0));

        // draining is non-destructive
        assert_eq!(queue.size().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_remove() {
        let (queue, _) = queue();
        let a = queue.enqueue(post("/a")).await.unwrap();
        queue.enqueue(post("/b")).await.unwrap();

        assert!(queue.remove(&a).await.unwrap());
        assert!(!queue.remove(&a).await.unwrap());

        let entries = queue.drain_ordered().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].url, "/b");
    }

    #[tokio::test]
    async fn test_increment_attempt_drops_at_max() {
        let (queue, _) = queue();
        let id = queue.enqueue(post("/a").with_max_attempts(3)).await.unwrap();

        assert_eq!(
            queue.increment_attempt(&id).await.unwrap(),
            AttemptOutcome::Retained { attempts: 1 }
        );
        assert_eq!(
            queue.increment_attempt(&id).await.unwrap(),
            AttemptOutcome::Retained { attempts: 2 }
        );
        match queue.increment_attempt(&id).await.unwrap() {
            AttemptOutcome::Dropped(entry) => {
                assert_eq!(entry.id, id);
                assert_eq!(entry.attempts, 3);
            }
            other => panic!("expected drop, got {other:?}"),
        }
        assert_eq!(queue.size().await.unwrap(), 0);
        assert_eq!(
            queue.increment_attempt(&id).await.unwrap(),
            AttemptOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_storage_accounting_and_clear() {
        let (queue, store) = queue();
        assert_eq!(queue.estimated_storage_bytes().await.unwrap(), 0);

        queue.enqueue(post("/a")).await.unwrap();
        queue.enqueue(post("/b")).await.unwrap();
        let raw = store.get(QUEUE_STORAGE_KEY).await.unwrap().unwrap();
        assert_eq!(queue.estimated_storage_bytes().await.unwrap(), raw.len());

        assert_eq!(queue.clear_all().await.unwrap(), Some(2));
        assert_eq!(queue.size().await.unwrap(), 0);
        assert!(store.get(QUEUE_STORAGE_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        {
            let store: Arc<dyn KeyValueStore> =
                Arc::new(crate::storage::FileStore::new(dir.path().to_path_buf()).unwrap());
            let queue = OfflineQueue::new(store, clock.clone());
            queue.enqueue(post("/a")).await.unwrap();
            queue.enqueue(post("/b")).await.unwrap();
        }

        let store: Arc<dyn KeyValueStore> =
            Arc::new(crate::storage::FileStore::new(dir.path().to_path_buf()).unwrap());
        let queue = OfflineQueue::new(store, clock);
        let urls: Vec<String> = queue
            .drain_ordered()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.url)
            .collect();
        assert_eq!(urls, vec!["/a".to_string(), "/b".to_string()]);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_storage_error() {
        let (queue, store) = queue();
        store.set(QUEUE_STORAGE_KEY, "{not a list").await.unwrap();
        assert!(matches!(
            queue.drain_ordered().await,
            Err(StorageError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_clearing_corrupt_record_reports_unknown_count() {
        let (queue, store) = queue();
        store.set(QUEUE_STORAGE_KEY, "{not a list").await.unwrap();

        assert_eq!(queue.clear_all().await.unwrap(), None);
        assert!(store.get(QUEUE_STORAGE_KEY).await.unwrap().is_none());
        assert_eq!(queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_surfaces_write_failure() {
        let queue = OfflineQueue::new(Arc::new(FailingStore), Arc::new(ManualClock::default()));
        let err = queue.enqueue(post("/a")).await.unwrap_err();
        assert!(matches!(err, StorageError::Io { .. }));
    }
}
