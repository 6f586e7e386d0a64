//! Debounced, single-flight, backoff-retrying reads.
//!
//! A `RetryController` wraps one logical read (one screen's subscription to
//! one endpoint). It keeps its own short-lived cache, collapses overlapping
//! calls into a single in-flight request, and retries connectivity failures
//! with exponential backoff. Progress is published as a `QueryState` on a
//! watch channel.
//!
//! Every timer the controller starts (debounce window, backoff sleep) lives
//! in a spawned task whose abort handle the controller owns. Dropping the
//! controller aborts them, so nothing fires after teardown.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::{ApiError, Dispatcher, ErrorKind, RequestOptions};
use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Quiet period before a triggered fetch starts.
    pub debounce: Duration,
    /// How long a successful result is served without fetching.
    pub cache_ttl: Duration,
    pub base_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Config::default().retry_policy()
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows `retry_count` earlier retries:
    /// `base_delay * 2^retry_count`.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// What a subscriber sees.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<T> {
    pub data: Option<T>,
    pub error: Option<ApiError>,
    pub loading: bool,
    /// Set when the last failure was a connectivity failure. Informational.
    pub is_offline: bool,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error_kind: Option<ErrorKind>,
}

impl<T> QueryState<T> {
    fn new(max_retries: u32) -> Self {
        Self {
            data: None,
            error: None,
            loading: false,
            is_offline: false,
            retry_count: 0,
            max_retries,
            last_error_kind: None,
        }
    }
}

type FetchResult<T> = Result<T, ApiError>;
type Fetcher<T> = Box<dyn Fn() -> BoxFuture<'static, FetchResult<T>> + Send + Sync>;
type SharedFetch<T> = Shared<BoxFuture<'static, FetchResult<T>>>;

struct InFlight<T> {
    generation: u64,
    shared: SharedFetch<T>,
    abort: AbortHandle,
}

struct Inner<T> {
    fetcher: Fetcher<T>,
    policy: RetryPolicy,
    cached: Mutex<Option<(T, Instant)>>,
    in_flight: Mutex<Option<InFlight<T>>>,
    debounce: Mutex<Option<AbortHandle>>,
    generation: AtomicU64,
    state: watch::Sender<QueryState<T>>,
}

fn lock<X>(mutex: &Mutex<X>) -> MutexGuard<'_, X> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl<T> Inner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn cached_value(&self) -> Option<T> {
        match lock(&self.cached).as_ref() {
            Some((value, stored_at)) if stored_at.elapsed() <= self.policy.cache_ttl => {
                Some(value.clone())
            }
            _ => None,
        }
    }

    async fn fetch(self: &Arc<Self>) -> FetchResult<T> {
        if let Some(value) = self.cached_value() {
            debug!("Serving query from controller cache");
            return Ok(value);
        }
        self.join_or_start().await
    }

    /// Join the request already in flight, or start one.
    fn join_or_start(self: &Arc<Self>) -> SharedFetch<T> {
        let mut slot = lock(&self.in_flight);
        if let Some(ref flight) = *slot {
            debug!("Joining in-flight query");
            return flight.shared.clone();
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move { inner.run(generation).await });
        let abort = handle.abort_handle();
        let shared = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    if e.is_panic() {
                        warn!("Query task panicked");
                    }
                    Err(ApiError::Cancelled)
                }
            }
        }
        .boxed()
        .shared();

        *slot = Some(InFlight {
            generation,
            shared: shared.clone(),
            abort,
        });
        shared
    }

    async fn run(self: Arc<Self>, generation: u64) -> FetchResult<T> {
        self.state.send_modify(|s| s.loading = true);

        let mut retry_count = 0;
        let result = loop {
            match (self.fetcher)().await {
                Ok(value) => break Ok(value),
                Err(e) if e.is_retryable() && retry_count < self.policy.max_retries => {
                    let delay = self.policy.backoff_delay(retry_count);
                    retry_count += 1;
                    warn!(
                        retry = retry_count,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Query failed, retrying after backoff"
                    );
                    let kind = e.kind();
                    self.state.send_modify(|s| {
                        s.retry_count = retry_count;
                        s.is_offline = true;
                        s.last_error_kind = Some(kind);
                    });
                    tokio::time::sleep(delay).await;
                }
                Err(e) => break Err(e),
            }
        };

        self.finish(generation, &result);
        result
    }

    fn finish(&self, generation: u64, result: &FetchResult<T>) {
        match result {
            Ok(value) => {
                *lock(&self.cached) = Some((value.clone(), Instant::now()));
                self.state.send_modify(|s| {
                    s.data = Some(value.clone());
                    s.error = None;
                    s.is_offline = false;
                    s.last_error_kind = None;
                });
            }
            Err(e) => {
                debug!(error = %e, "Query failed");
                self.state.send_modify(|s| {
                    s.error = Some(e.clone());
                    s.is_offline = e.is_connectivity();
                    s.last_error_kind = Some(e.kind());
                });
            }
        }
        self.state.send_modify(|s| {
            s.loading = false;
            s.retry_count = 0;
        });

        let mut slot = lock(&self.in_flight);
        if slot.as_ref().is_some_and(|f| f.generation == generation) {
            *slot = None;
        }
    }

    fn cancel_debounce(&self) {
        if let Some(timer) = lock(&self.debounce).take() {
            timer.abort();
        }
    }

    fn abort_in_flight(&self) {
        if let Some(flight) = lock(&self.in_flight).take() {
            flight.abort.abort();
        }
    }
}

pub struct RetryController<T> {
    inner: Arc<Inner<T>>,
}

impl<T> RetryController<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(policy: RetryPolicy, fetcher: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FetchResult<T>> + Send + 'static,
    {
        let (state, _) = watch::channel(QueryState::new(policy.max_retries));
        Self {
            inner: Arc::new(Inner {
                fetcher: Box::new(move || fetcher().boxed()),
                policy,
                cached: Mutex::new(None),
                in_flight: Mutex::new(None),
                debounce: Mutex::new(None),
                generation: AtomicU64::new(0),
                state,
            }),
        }
    }

    /// Fetch now: controller cache first, then the in-flight request, then a
    /// new request with backoff retries.
    pub async fn fetch(&self) -> FetchResult<T> {
        self.inner.fetch().await
    }

    /// Signal that the query's inputs changed. The fetch starts once the
    /// debounce window passes without another trigger; the outcome is
    /// published on the state channel.
    pub fn trigger(&self) {
        let inner = Arc::clone(&self.inner);
        let window = self.inner.policy.debounce;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = inner.fetch().await;
        });
        if let Some(previous) = lock(&self.inner.debounce).replace(timer.abort_handle()) {
            previous.abort();
        }
    }

    /// Fetch immediately, ignoring the controller cache and abandoning any
    /// pending debounce or backoff. Callers waiting on the abandoned request
    /// receive `ApiError::Cancelled`.
    pub async fn refetch(&self) -> FetchResult<T> {
        self.inner.cancel_debounce();
        self.inner.abort_in_flight();
        self.invalidate();
        self.inner.state.send_modify(|s| s.retry_count = 0);
        self.inner.join_or_start().await
    }

    /// Forget the cached result.
    pub fn invalidate(&self) {
        *lock(&self.inner.cached) = None;
    }

    pub fn state(&self) -> QueryState<T> {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<QueryState<T>> {
        self.inner.state.subscribe()
    }
}

impl RetryController<Value> {
    /// A controller over `Dispatcher::get` for one URL.
    pub fn for_request(
        dispatcher: Arc<Dispatcher>,
        url: impl Into<String>,
        options: RequestOptions,
        policy: RetryPolicy,
    ) -> Self {
        let url: Arc<str> = Arc::from(url.into());
        let options = Arc::new(options);
        Self::new(policy, move || {
            let dispatcher = Arc::clone(&dispatcher);
            let url = Arc::clone(&url);
            let options = Arc::clone(&options);
            async move { dispatcher.get(&url, &options).await }
        })
    }
}

impl<T> Drop for RetryController<T> {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.inner.debounce).take() {
            timer.abort();
        }
        if let Some(flight) = lock(&self.inner.in_flight).take() {
            flight.abort.abort();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            debounce: Duration::from_millis(1000),
            cache_ttl: Duration::from_millis(30_000),
            base_delay: Duration::from_millis(2000),
            max_retries: 3,
        }
    }

    /// Fetcher that fails with a network error for the first `failures`
    /// calls, then returns the call number.
    fn flaky(
        failures: u32,
    ) -> (
        Arc<AtomicU32>,
        Arc<Mutex<Vec<Instant>>>,
        impl Fn() -> BoxFuture<'static, FetchResult<u32>> + Send + Sync + 'static,
    ) {
        let calls = Arc::new(AtomicU32::new(0));
        let times = Arc::new(Mutex::new(Vec::new()));
        let (c, t) = (calls.clone(), times.clone());
        let fetcher = move || {
            let n = c.fetch_add(1, Ordering::SeqCst) + 1;
            t.lock().unwrap().push(Instant::now());
            async move {
                if n <= failures {
                    Err(ApiError::Network("offline".into()))
                } else {
                    Ok(n)
                }
            }
            .boxed()
        };
        (calls, times, fetcher)
    }

    #[test]
    fn test_backoff_delay_doubles() {
        let p = policy();
        assert_eq!(p.backoff_delay(0), Duration::from_millis(2000));
        assert_eq!(p.backoff_delay(1), Duration::from_millis(4000));
        assert_eq!(p.backoff_delay(2), Duration::from_millis(8000));
        assert_eq!(p.backoff_delay(40), Duration::from_millis(2000).saturating_mul(u32::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_exponential_backoff_then_surfaces_error() {
        let (calls, times, fetcher) = flaky(u32::MAX);
        let controller = RetryController::new(policy(), fetcher);

        let err = controller.fetch().await.unwrap_err();
        assert!(err.is_connectivity());
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let times = times.lock().unwrap().clone();
        let gaps: Vec<u128> = times.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect();
        assert_eq!(gaps, vec![2000, 4000, 8000]);

        let state = controller.state();
        assert_eq!(state.retry_count, 0);
        assert!(state.is_offline);
        assert!(!state.loading);
        assert_eq!(state.last_error_kind, Some(ErrorKind::Network));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let (calls, _times, fetcher) = flaky(2);
        let controller = RetryController::new(policy(), fetcher);

        assert_eq!(controller.fetch().await.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let state = controller.state();
        assert_eq!(state.data, Some(3));
        assert!(state.error.is_none());
        assert!(!state.is_offline);
        assert_eq!(state.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_http_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let controller = RetryController::new(policy(), move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err::<u32, _>(ApiError::from_status(404, "gone")) }
        });

        assert!(matches!(controller.fetch().await, Err(ApiError::Http { status: 404, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!controller.state().is_offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_share_one_request() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let controller = RetryController::new(policy(), move || {
            let n = c.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, ApiError>(n)
            }
        });

        let (a, b) = tokio::join!(controller.fetch(), controller.fetch());
        assert_eq!(a.unwrap(), 1);
        assert_eq!(b.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_controller_cache_expires() {
        let (calls, _times, fetcher) = flaky(0);
        let controller = RetryController::new(policy(), fetcher);

        assert_eq!(controller.fetch().await.unwrap(), 1);
        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(controller.fetch().await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(controller.fetch().await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggers_are_debounced() {
        let (calls, _times, fetcher) = flaky(0);
        let controller = RetryController::new(policy(), fetcher);
        let mut rx = controller.subscribe();

        controller.trigger();
        tokio::time::sleep(Duration::from_millis(300)).await;
        controller.trigger();
        tokio::time::sleep(Duration::from_millis(300)).await;
        controller.trigger();

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        rx.wait_for(|s| s.data.is_some()).await.unwrap();
        assert_eq!(controller.state().data, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetch_bypasses_cache_and_pending_backoff() {
        let (calls, _times, fetcher) = flaky(1);
        let controller = Arc::new(RetryController::new(policy(), fetcher));

        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.fetch().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(controller.state().retry_count, 1);

        let started = Instant::now();
        assert_eq!(controller.refetch().await.unwrap(), 2);
        assert!(started.elapsed() < Duration::from_millis(2000));
        assert_eq!(waiter.await.unwrap(), Err(ApiError::Cancelled));

        // cached, but refetch ignores the cache
        assert_eq!(controller.fetch().await.unwrap(), 2);
        assert_eq!(controller.refetch().await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_pending_debounce() {
        let (calls, _times, fetcher) = flaky(0);
        let controller = RetryController::new(policy(), fetcher);

        controller.trigger();
        drop(controller);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_pending_retry() {
        let (calls, _times, fetcher) = flaky(u32::MAX);
        let controller = RetryController::new(policy(), fetcher);

        controller.trigger();
        tokio::time::sleep(Duration::from_millis(1010)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(controller);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
