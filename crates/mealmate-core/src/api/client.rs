//! The request dispatcher.
//!
//! `Dispatcher::dispatch` is the single entry point for API calls:
//! 1. reject malformed calls before touching the network
//! 2. answer cacheable reads from the `ResponseCache`
//! 3. send over the `Transport` with a hard timeout
//! 4. cache fresh reads, invalidate the cache after writes
//! 5. queue writes that failed for lack of connectivity, when asked to
//!
//! The dispatcher never retries on its own. Reads are retried by the
//! `RetryController`, writes by the `QueueFlusher`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::{ApiError, ApiResult, Dispatched, HttpRequest, Method, RequestOptions, Transport};
use crate::auth::TokenProvider;
use crate::cache::ResponseCache;
use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::queue::{NewQueueEntry, OfflineQueue, QueueEntry};

const CONTENT_TYPE: &str = "Content-Type";
const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherSettings {
    /// TTL applied to cached reads.
    pub cache_ttl_ms: u64,
    /// Upper bound on a single network call.
    pub request_timeout: Duration,
    /// `max_attempts` given to queued entries.
    pub max_attempts: u32,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for DispatcherSettings {
    fn from(config: &Config) -> Self {
        Self {
            cache_ttl_ms: config.cache_ttl_ms,
            request_timeout: config.request_timeout(),
            max_attempts: config.max_attempts,
        }
    }
}

pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    cache: Arc<ResponseCache>,
    queue: Arc<OfflineQueue>,
    connectivity: Arc<ConnectivityMonitor>,
    tokens: Arc<dyn TokenProvider>,
    settings: DispatcherSettings,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Arc<ResponseCache>,
        queue: Arc<OfflineQueue>,
        connectivity: Arc<ConnectivityMonitor>,
        tokens: Arc<dyn TokenProvider>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            transport,
            cache,
            queue,
            connectivity,
            tokens,
            settings,
        }
    }

    /// Dispatch and flatten the outcome into the `{success, data, error}`
    /// shape UI callers consume. Never panics or throws: a queued write comes
    /// back as `error: "queued-offline"`.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> ApiResult {
        self.dispatch(method, url, body, &options).await.into()
    }

    pub async fn dispatch(
        &self,
        method: Method,
        url: &str,
        body: Option<Value>,
        options: &RequestOptions,
    ) -> Result<Dispatched, ApiError> {
        Self::validate(url, body.as_ref(), options)?;

        let cacheable = !method.is_mutating() && options.cache;
        let cache_key = options.effective_cache_key(url);

        if cacheable {
            if let Some(entry) = self.cache.get(cache_key) {
                return Ok(Dispatched::Cached(entry.payload));
            }
        }

        if method.is_mutating()
            && options.offline_fallback
            && self.connectivity.state().is_known_offline()
        {
            debug!(method = %method, url = url, "Offline, queueing without network attempt");
            return self.enqueue(method, url, body, options).await;
        }

        let request = HttpRequest::new(method, url)
            .with_body(body.clone())
            .with_headers(Self::request_headers(body.as_ref(), options));

        match self.execute(request).await {
            Ok(data) => {
                if cacheable {
                    self.cache
                        .set(cache_key, data.clone(), self.settings.cache_ttl_ms)
                        .await;
                } else if method.is_mutating() {
                    self.cache.invalidate_all().await;
                }
                Ok(Dispatched::Fresh(data))
            }
            Err(e) if e.is_connectivity() && method.is_mutating() && options.offline_fallback => {
                warn!(method = %method, url = url, error = %e, "Write failed offline, queueing");
                self.enqueue(method, url, body, options).await
            }
            Err(e) => Err(e),
        }
    }

    /// GET convenience for read callers.
    pub async fn get(&self, url: &str, options: &RequestOptions) -> Result<Value, ApiError> {
        self.dispatch(Method::Get, url, None, options)
            .await?
            .into_data()
            .ok_or_else(|| ApiError::Validation("GET requests cannot be queued".to_string()))
    }

    /// Replay a queued entry with its original method, url, body and headers.
    /// Never re-queues; the caller decides what a failure means.
    pub async fn replay(&self, entry: &QueueEntry) -> Result<Value, ApiError> {
        debug!(id = %entry.id, method = %entry.method, url = %entry.url, "Replaying queued request");
        let request = HttpRequest::new(entry.method, entry.url.clone())
            .with_body(entry.body.clone())
            .with_headers(entry.headers.clone());

        let data = self.execute(request).await?;
        self.cache.invalidate_all().await;
        Ok(data)
    }

    /// Send one request: attach the bearer token, bound it by the timeout,
    /// and feed the outcome back to the connectivity monitor.
    async fn execute(&self, mut request: HttpRequest) -> Result<Value, ApiError> {
        if let Some(token) = self.tokens.bearer_token().await {
            request
                .headers
                .insert("Authorization".to_string(), format!("Bearer {}", token));
        }

        let timeout = self.settings.request_timeout;
        let result = match tokio::time::timeout(timeout, self.transport.send(&request)).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout(timeout.as_secs())),
        };

        match &result {
            Ok(_) => self.connectivity.report(true),
            Err(e) if e.is_connectivity() => self.connectivity.report(false),
            // The server answered, so it is reachable.
            Err(ApiError::Http { .. }) => self.connectivity.report(true),
            Err(_) => {}
        }
        result
    }

    async fn enqueue(
        &self,
        method: Method,
        url: &str,
        body: Option<Value>,
        options: &RequestOptions,
    ) -> Result<Dispatched, ApiError> {
        let headers = Self::request_headers(body.as_ref(), options);
        let entry = NewQueueEntry::new(method, url, body)
            .with_headers(headers)
            .with_max_attempts(self.settings.max_attempts);

        let id = self.queue.enqueue(entry).await?;
        info!(id = %id, method = %method, url = url, "Request saved for later sync");
        Ok(Dispatched::Queued { id })
    }

    /// Caller headers plus a JSON content type when there is a body. The
    /// bearer token is added at send time and never stored.
    fn request_headers(body: Option<&Value>, options: &RequestOptions) -> BTreeMap<String, String> {
        let mut headers = options.headers.clone();
        headers.retain(|name, _| !name.eq_ignore_ascii_case("authorization"));
        if body.is_some() && !headers.keys().any(|k| k.eq_ignore_ascii_case(CONTENT_TYPE)) {
            headers.insert(CONTENT_TYPE.to_string(), JSON_CONTENT_TYPE.to_string());
        }
        headers
    }

    fn validate(url: &str, body: Option<&Value>, options: &RequestOptions) -> Result<(), ApiError> {
        if url.trim().is_empty() {
            return Err(ApiError::Validation("URL must not be empty".to_string()));
        }
        if options.required_fields.is_empty() {
            return Ok(());
        }

        let Some(object) = body.and_then(Value::as_object) else {
            return Err(ApiError::Validation(format!(
                "Request body must be an object containing: {}",
                options.required_fields.join(", ")
            )));
        };
        let missing: Vec<&str> = options
            .required_fields
            .iter()
            .filter(|field| object.get(field.as_str()).map_or(true, Value::is_null))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ApiError::Validation(format!(
                "Missing required field(s): {}",
                missing.join(", ")
            )))
        }
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
}

// ============================================================================
// Tests
// ============================================================================
