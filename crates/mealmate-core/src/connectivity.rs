//! Connectivity monitoring.
//!
//! Reachability is polled, not pushed: a background task probes the API's
//! health endpoint at a fixed interval and publishes the result on a watch
//! channel. Changes are noticed within one poll interval at worst.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::clock::Clock;

#[async_trait]
pub trait Probe: Send + Sync {
    /// Best-effort reachability check.
    async fn probe(&self) -> bool;
}

/// Probes by requesting a URL; any HTTP response counts as reachable.
#[derive(Clone)]
pub struct HttpProbe {
    client: Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self) -> bool {
        match self.client.head(&self.url).send().await {
            Ok(response) => {
                debug!(url = %self.url, status = %response.status(), "Probe reached server");
                true
            }
            Err(e) => {
                debug!(url = %self.url, error = %e, "Probe failed");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityState {
    pub is_online: bool,
    /// `None` until the first probe or report.
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl ConnectivityState {
    /// Offline according to an actual observation, as opposed to the
    /// unprobed startup state.
    pub fn is_known_offline(&self) -> bool {
        !self.is_online && self.last_checked_at.is_some()
    }
}

pub struct ConnectivityMonitor {
    probe: Arc<dyn Probe>,
    clock: Arc<dyn Clock>,
    state: watch::Sender<ConnectivityState>,
}

impl ConnectivityMonitor {
    /// Starts unprobed and offline, so the first successful probe counts as
    /// a transition to online.
    pub fn new(probe: Arc<dyn Probe>, clock: Arc<dyn Clock>) -> Self {
        let (state, _) = watch::channel(ConnectivityState {
            is_online: false,
            last_checked_at: None,
        });
        Self { probe, clock, state }
    }

    /// Probe now and publish the result.
    pub async fn probe(&self) -> bool {
        let online = self.probe.probe().await;
        self.report(online);
        online
    }

    /// Record an observation made elsewhere, e.g. a request that failed to
    /// connect or one that just succeeded.
    pub fn report(&self, online: bool) {
        let now = self.clock.now();
        let previous = self.state.send_replace(ConnectivityState {
            is_online: online,
            last_checked_at: Some(now),
        });
        if previous.is_online != online {
            if online {
                info!("Connectivity restored");
            } else {
                info!("Connectivity lost");
            }
        }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state.borrow().is_online
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    /// Probe immediately, then every `interval`, until the handle is aborted.
    pub fn spawn_polling(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.probe().await;
            }
        })
    }
}
