//! Durable offline queue for mutating requests.
//!
//! Writes that could not reach the server are stored here, in insertion
//! order, as a single JSON list under `offline_queue`. The `QueueFlusher`
//! replays them front to back once connectivity returns.

pub mod entry;
pub mod offline;

pub use entry::{NewQueueEntry, QueueEntry};
pub use offline::{AttemptOutcome, OfflineQueue, QUEUE_STORAGE_KEY};
