//! Core library for mealmate.
//!
//! This crate is the resilient API access layer used by the mealmate
//! clients. It decides, per request, whether to answer from cache, go to the
//! network, or durably queue a mutation while the device is offline:
//!
//! - `ResponseCache`: TTL-based store of successful reads
//! - `OfflineQueue`: durable, ordered store of mutations awaiting replay
//! - `ConnectivityMonitor`: periodic reachability probing
//! - `Dispatcher`: the request orchestrator
//! - `RetryController`: debounced, single-flight, backoff-retrying reads
//! - `QueueFlusher`: ordered replay of the offline queue on reconnect
//!
//! `ApiContext` owns one instance of each and wires them together.

pub mod api;
pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod flusher;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod utils;

#[cfg(test)]
mod testing;

pub use api::{ApiError, ApiResult, Dispatched, Dispatcher, ErrorKind, Method, RequestOptions};
pub use auth::{StaticToken, TokenProvider};
pub use cache::{CacheEntry, ResponseCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, RetrySettings};
pub use connectivity::{ConnectivityMonitor, ConnectivityState, HttpProbe, Probe};
pub use context::{ApiContext, ApiContextBuilder, BackgroundTasks, OfflineStatus};
pub use flusher::{FlushReport, QueueFlusher};
pub use queue::{AttemptOutcome, NewQueueEntry, OfflineQueue, QueueEntry};
pub use retry::{QueryState, RetryController, RetryPolicy};
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageError};
