//! Application-lifetime wiring.
//!
//! `ApiContext` owns the one cache, queue, connectivity monitor, dispatcher
//! and flusher of a running client, and exposes the status interface the UI
//! polls. Build it once at startup and hand out references.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::{
    ApiResult, Dispatcher, DispatcherSettings, Method, ReqwestTransport, RequestOptions, Transport,
};
use crate::auth::{StaticToken, TokenProvider};
use crate::cache::ResponseCache;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::connectivity::{ConnectivityMonitor, HttpProbe, Probe};
use crate::flusher::{FlushReport, QueueFlusher};
use crate::queue::{OfflineQueue, QueueEntry};
use crate::retry::RetryController;
use crate::storage::{FileStore, KeyValueStore, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(rename_all = "camelCase")]
pub struct OfflineStatus {
    pub is_online: bool,
    pub pending_count: usize,
    /// Bytes used by the persisted queue.
    pub storage_size: usize,
}

/// Aborts the context's background tasks when dropped.
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Builder for `ApiContext`. Collaborators not supplied are created from
/// the config: a `FileStore` in the data directory, a `ReqwestTransport`, an
/// `HttpProbe` against the health URL, no token, and the system clock.
pub struct ApiContextBuilder {
    config: Config,
    store: Option<Arc<dyn KeyValueStore>>,
    transport: Option<Arc<dyn Transport>>,
    probe: Option<Arc<dyn Probe>>,
    tokens: Option<Arc<dyn TokenProvider>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ApiContextBuilder {
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn tokens(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<ApiContext> {
        let config = self.config;

        let store = match self.store {
            Some(store) => store,
            None => {
                let dir = config.data_dir()?;
                Arc::new(FileStore::new(dir).context("Failed to open data directory")?)
            }
        };
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                ReqwestTransport::new(&config.api_base_url, config.request_timeout())
                    .context("Failed to build HTTP client")?,
            ),
        };
        let probe = match self.probe {
            Some(probe) => probe,
            None => Arc::new(
                HttpProbe::new(config.health_url(), config.probe_timeout())
                    .context("Failed to build connectivity probe")?,
            ),
        };
        let tokens = self
            .tokens
            .unwrap_or_else(|| Arc::new(StaticToken::anonymous()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let cache = Arc::new(ResponseCache::new(clock.clone()).with_store(store.clone()));
        let queue = Arc::new(OfflineQueue::new(store, clock.clone()));
        let connectivity = Arc::new(ConnectivityMonitor::new(probe, clock));
        let dispatcher = Arc::new(Dispatcher::new(
            transport,
            cache.clone(),
            queue.clone(),
            connectivity.clone(),
            tokens,
            DispatcherSettings::from(&config),
        ));
        let flusher = Arc::new(QueueFlusher::new(queue.clone(), dispatcher.clone()));

        Ok(ApiContext {
            config,
            cache,
            queue,
            connectivity,
            dispatcher,
            flusher,
        })
    }
}

pub struct ApiContext {
    config: Config,
    cache: Arc<ResponseCache>,
    queue: Arc<OfflineQueue>,
    connectivity: Arc<ConnectivityMonitor>,
    dispatcher: Arc<Dispatcher>,
    flusher: Arc<QueueFlusher>,
}

impl ApiContext {
    pub fn builder(config: Config) -> ApiContextBuilder {
        ApiContextBuilder {
            config,
            store: None,
            transport: None,
            probe: None,
            tokens: None,
            clock: None,
        }
    }

    /// Reload the persisted cache, then start connectivity polling and the
    /// flush-on-reconnect listener. The first probe runs immediately, and a
    /// successful one flushes whatever was queued before the last shutdown.
    pub async fn start(&self) -> BackgroundTasks {
        match self.cache.hydrate().await {
            Ok(loaded) => info!(entries = loaded, "Response cache loaded"),
            Err(e) => warn!(error = %e, "Failed to load response cache, starting empty"),
        }

        // Subscribe before polling starts so the first probe is observed.
        let flush = self.flusher.spawn_on_reconnect(&self.connectivity);
        let poll = self
            .connectivity
            .spawn_polling(self.config.probe_interval());
        BackgroundTasks {
            handles: vec![flush, poll],
        }
    }

    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> ApiResult {
        self.dispatcher.request(method, url, body, options).await
    }

    /// A retrying, debounced read subscription for `url`.
    pub fn query(&self, url: impl Into<String>, options: RequestOptions) -> RetryController<Value> {
        RetryController::for_request(
            self.dispatcher.clone(),
            url,
            options,
            self.config.retry_policy(),
        )
    }

    pub async fn offline_status(&self) -> Result<OfflineStatus, StorageError> {
        Ok(OfflineStatus {
            is_online: self.connectivity.is_online(),
            pending_count: self.queue.size().await?,
            storage_size: self.queue.estimated_storage_bytes().await?,
        })
    }

    /// "Retry now": flush immediately, without waiting for a reconnect.
    pub async fn retry_offline_requests(&self) -> Result<FlushReport, StorageError> {
        self.flusher.flush().await
    }

    /// `None` when the queue record was unreadable and the count is unknown.
    pub async fn clear_all_offline_requests(&self) -> Result<Option<usize>, StorageError> {
        self.queue.clear_all().await
    }

    pub async fn pending_requests(&self) -> Result<Vec<QueueEntry>, StorageError> {
        self.queue.drain_ordered().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn flusher(&self) -> &Arc<QueueFlusher> {
        &self.flusher
    }
}
