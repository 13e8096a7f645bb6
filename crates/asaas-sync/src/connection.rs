//! Connectivity lifecycle: online / offline / wake.
//!
//! Inputs come from the environment (`report_network`, `report_visibility`)
//! and from an optional heartbeat loop. `offline` is published immediately;
//! `online` only after the link has stayed up for the debounce window, so a
//! flapping link does not trigger a sync storm.

use async_trait::async_trait;
use asaas_core::bus::{EventBus, Subscription};
use asaas_core::config::ConnectionConfig;
use asaas_core::error::{AsaasError, AsaasResult};
use asaas_core::types::ConnectionEvent;
use asaas_core::unix_now;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reachability check used by the heartbeat loop
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self) -> bool;
}

/// HTTP HEAD against a health URL; any non-5xx answer counts as reachable.
pub struct HttpProbe {
    url: String,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> AsaasResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AsaasError::Config(format!("building probe client: {e}")))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self) -> bool {
        match self.client.head(&self.url).send().await {
            Ok(resp) => !resp.status().is_server_error(),
            Err(e) => {
                debug!(url = %self.url, "heartbeat failed: {e}");
                false
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub heartbeat_interval: Duration,
    pub wake_threshold: Duration,
    pub online_debounce: Duration,
    pub failures_before_offline: u32,
}

impl ConnectionSettings {
    pub fn from_config(cfg: &ConnectionConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(cfg.heartbeat_interval_secs.max(1)),
            wake_threshold: Duration::from_secs(cfg.wake_threshold_secs),
            online_debounce: Duration::from_millis(cfg.online_debounce_ms),
            failures_before_offline: cfg.failures_before_offline.max(1),
        }
    }
}

#[derive(Debug)]
struct LinkState {
    /// Last state published to subscribers
    published_online: bool,
    /// Latest raw observation
    observed_online: bool,
    /// Bumped on every observation change; a debounce only fires if unchanged
    generation: u64,
    consecutive_failures: u32,
    hidden_since: Option<u64>,
}

pub struct ConnectionManager {
    settings: ConnectionSettings,
    events: EventBus<ConnectionEvent>,
    state: Mutex<LinkState>,
}

impl ConnectionManager {
    /// Starts out online; the first failed observation publishes `offline`.
    pub fn new(settings: ConnectionSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            events: EventBus::new("connection"),
            state: Mutex::new(LinkState {
                published_online: true,
                observed_online: true,
                generation: 0,
                consecutive_failures: 0,
                hidden_since: None,
            }),
        })
    }

    pub fn subscribe(&self) -> Subscription<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.state
            .lock()
            .map(|s| s.published_online)
            .unwrap_or(false)
    }

    /// Raw network observation from the platform or the heartbeat.
    pub fn report_network(self: &Arc<Self>, up: bool) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.observed_online == up {
            return;
        }
        state.observed_online = up;
        state.generation += 1;

        if !up {
            if state.published_online {
                state.published_online = false;
                drop(state);
                info!("connection lost");
                self.events.emit(ConnectionEvent::Offline);
            }
            return;
        }

        let generation = state.generation;
        drop(state);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.settings.online_debounce).await;
            this.publish_online(generation);
        });
    }

    fn publish_online(&self, generation: u64) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.generation != generation || state.published_online || !state.observed_online {
            return;
        }
        state.published_online = true;
        drop(state);
        info!("connection restored");
        self.events.emit(ConnectionEvent::Online);
    }

    /// Application visibility. Returning after at least the wake threshold
    /// of hidden time publishes `wake`.
    pub fn report_visibility(&self, visible: bool, now: u64) {
        let idle = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if !visible {
                state.hidden_since.get_or_insert(now);
                return;
            }
            match state.hidden_since.take() {
                Some(since) => now.saturating_sub(since),
                None => return,
            }
        };
        self.maybe_wake(idle);
    }

    fn maybe_wake(&self, idle_secs: u64) {
        if idle_secs >= self.settings.wake_threshold.as_secs() {
            info!(idle_secs, "wake");
            self.events.emit(ConnectionEvent::Wake { idle_secs });
        }
    }

    fn record_heartbeat(self: &Arc<Self>, ok: bool) {
        self.events.emit(ConnectionEvent::Heartbeat { ok });
        let failures = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if ok {
                state.consecutive_failures = 0;
            } else {
                state.consecutive_failures += 1;
            }
            state.consecutive_failures
        };

        if ok {
            self.report_network(true);
        } else if failures >= self.settings.failures_before_offline {
            warn!(failures, "heartbeat failing, marking offline");
            self.report_network(false);
        }
    }

    /// Probe every heartbeat interval until cancelled. A wall-clock jump
    /// larger than interval plus wake threshold means the process was
    /// suspended and publishes `wake`.
    pub async fn run_heartbeat(self: Arc<Self>, probe: Arc<dyn Probe>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let gap_limit = self.settings.heartbeat_interval + self.settings.wake_threshold;
        let mut last_tick = unix_now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let now = unix_now();
                    let gap = now.saturating_sub(last_tick);
                    last_tick = now;
                    if gap > gap_limit.as_secs() {
                        self.maybe_wake(gap);
                    }
                    let ok = probe.probe().await;
                    self.record_heartbeat(ok);
                }
            }
        }
        debug!("heartbeat stopped");
    }
}
