//! Fakes shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::api::{ApiError, Dispatcher, DispatcherSettings, HttpRequest, Transport};
use crate::auth::{StaticToken, TokenProvider};
use crate::cache::ResponseCache;
use crate::clock::{Clock, ManualClock};
use crate::connectivity::{ConnectivityMonitor, Probe};
use crate::queue::OfflineQueue;
use crate::storage::{KeyValueStore, MemoryStore, StorageError};

/// Probe whose answer tests can flip.
pub struct SwitchProbe {
    pub online: AtomicBool,
    pub calls: AtomicUsize,
}

impl SwitchProbe {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Probe for SwitchProbe {
    async fn probe(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.online.load(Ordering::SeqCst)
    }
}

enum Step {
    Respond(Result<Value, ApiError>),
    Hang,
}

/// Transport that answers from a script and records what it was sent.
/// An exhausted script answers with a network error.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    sent: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn push_ok(&self, value: Value) {
        self.script.lock().unwrap().push_back(Step::Respond(Ok(value)));
    }

    pub fn push_err(&self, err: ApiError) {
        self.script.lock().unwrap().push_back(Step::Respond(Err(err)));
    }

    pub fn push_hang(&self) {
        self.script.lock().unwrap().push_back(Step::Hang);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.url).collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &HttpRequest) -> Result<Value, ApiError> {
        self.sent.lock().unwrap().push(request.clone());
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Respond(result)) => result,
            Some(Step::Hang) => futures::future::pending().await,
            None => Err(ApiError::Network("no scripted response".to_string())),
        }
    }
}

/// Store that reads fine but refuses every write.
pub struct FailingStore;

#[async_trait]
impl KeyValueStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
        Ok(None)
    }

    async fn set(&self, key: &str, _value: &str) -> Result<(), StorageError> {
        Err(StorageError::io(key, "disk full"))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        Err(StorageError::io(key, "disk full"))
    }

    async fn list_keys(&self, _prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(Vec::new())
    }
}

/// A dispatcher wired to in-memory collaborators.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub cache: Arc<ResponseCache>,
    pub queue: Arc<OfflineQueue>,
    pub probe: Arc<SwitchProbe>,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub transport: Arc<ScriptedTransport>,
    pub dispatcher: Arc<Dispatcher>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(Arc::new(StaticToken::anonymous()), Arc::new(MemoryStore::new()))
    }

    pub fn with_tokens(tokens: Arc<dyn TokenProvider>) -> Self {
        Self::build(tokens, Arc::new(MemoryStore::new()))
    }

    pub fn with_failing_store() -> Self {
        Self::build(Arc::new(StaticToken::anonymous()), Arc::new(FailingStore))
    }

    fn build(tokens: Arc<dyn TokenProvider>, store: Arc<dyn KeyValueStore>) -> Self {
        let clock = Arc::new(ManualClock::default());
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let cache = Arc::new(ResponseCache::new(dyn_clock.clone()).with_store(store.clone()));
        let queue = Arc::new(OfflineQueue::new(store, dyn_clock.clone()));
        let probe = Arc::new(SwitchProbe::new(true));
        let connectivity = Arc::new(ConnectivityMonitor::new(probe.clone(), dyn_clock));
        let transport = Arc::new(ScriptedTransport::default());
        let dispatcher = Arc::new(Dispatcher::new(
            transport.clone(),
            cache.clone(),
            queue.clone(),
            connectivity.clone(),
            tokens,
            DispatcherSettings::default(),
        ));
        Self {
            clock,
            cache,
            queue,
            probe,
            connectivity,
            transport,
            dispatcher,
        }
    }
}
