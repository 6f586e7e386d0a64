//! Ordered replay of the offline queue.
//!
//! A flush walks the queue front to back, one request at a time, and stops
//! at the first failure: later entries may depend on earlier ones (an update
//! after a create), so nothing is skipped over. Only one flush runs at a
//! time; a second caller gets a report with `skipped: true`.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, Dispatcher};
use crate::connectivity::ConnectivityMonitor;
use crate::queue::{AttemptOutcome, OfflineQueue, QueueEntry};
use crate::storage::StorageError;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
    /// Entries replayed and removed.
    pub succeeded: usize,
    /// Entries still queued after this pass.
    pub remaining: usize,
    /// Entries removed after exhausting their attempts. These need the
    /// user's attention.
    pub dropped: Vec<QueueEntry>,
    /// The error that stopped the pass, if any.
    pub stopped_on: Option<String>,
    /// Another flush was already running; nothing was done.
    pub skipped: bool,
}

impl FlushReport {
    pub fn is_complete(&self) -> bool {
        !self.skipped && self.remaining == 0
    }
}

pub struct QueueFlusher {
    queue: Arc<OfflineQueue>,
    dispatcher: Arc<Dispatcher>,
    lock: Mutex<()>,
}

impl QueueFlusher {
    pub fn new(queue: Arc<OfflineQueue>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            queue,
            dispatcher,
            lock: Mutex::new(()),
        }
    }

    pub async fn flush(&self) -> Result<FlushReport, StorageError> {
        // The guard is released on every exit path, including `?` and
        // cancellation of this future.
        let Ok(_guard) = self.lock.try_lock() else {
            debug!("Flush already in progress");
            return Ok(FlushReport {
                skipped: true,
                ..FlushReport::default()
            });
        };

        let entries = self.queue.drain_ordered().await?;
        let mut report = FlushReport::default();
        if entries.is_empty() {
            return Ok(report);
        }
        info!(pending = entries.len(), "Flushing offline queue");

        for entry in &entries {
            match self.dispatcher.replay(entry).await {
                Ok(_) => {
                    self.queue.remove(&entry.id).await?;
                    report.succeeded += 1;
                }
                Err(e) => {
                    let mut stopped_on = e.to_string();
                    match self.queue.increment_attempt(&entry.id).await? {
                        AttemptOutcome::Dropped(dropped) => {
                            let exhausted = ApiError::QueueCapacityExceeded {
                                id: dropped.id.clone(),
                                method: dropped.method.to_string(),
                                url: dropped.url.clone(),
                                attempts: dropped.attempts,
                            };
                            error!(error = %exhausted, cause = %e, "Queued request permanently failed");
                            stopped_on = exhausted.to_string();
                            report.dropped.push(dropped);
                        }
                        AttemptOutcome::Retained { attempts } => {
                            warn!(
                                id = %entry.id,
                                url = %entry.url,
                                attempts = attempts,
                                max_attempts = entry.max_attempts,
                                error = %e,
                                "Replay failed, stopping flush"
                            );
                        }
                        AttemptOutcome::NotFound => {
                            debug!(id = %entry.id, "Entry vanished during flush");
                        }
                    }
                    report.stopped_on = Some(stopped_on);
                    break;
                }
            }
        }

        report.remaining = self.queue.size().await?;
        info!(
            succeeded = report.succeeded,
            remaining = report.remaining,
            dropped = report.dropped.len(),
            "Flush finished"
        );
        Ok(report)
    }

    /// Flush whenever `monitor` goes from offline to online, and once right
    /// away if it is already online. Runs until the handle is aborted or the
    /// monitor is dropped.
    pub fn spawn_on_reconnect(self: &Arc<Self>, monitor: &ConnectivityMonitor) -> JoinHandle<()> {
        let flusher = Arc::clone(self);
        let mut rx = monitor.subscribe();
        // Baseline taken before spawning so a report that lands before the
        // task first runs is still seen as a transition.
        let mut was_online = rx.borrow_and_update().is_online;
        tokio::spawn(async move {
            if was_online {
                flusher.flush_in_background().await;
            }
            while rx.changed().await.is_ok() {
                let online = rx.borrow_and_update().is_online;
                if online && !was_online {
                    flusher.flush_in_background().await;
                }
                was_online = online;
            }
        })
    }

    async fn flush_in_background(&self) {
        match self.flush().await {
            Ok(report) if !report.dropped.is_empty() => {
                warn!(dropped = report.dropped.len(), "Some queued requests were dropped");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Flush after reconnect failed"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
