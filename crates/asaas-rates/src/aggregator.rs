//! Multi-provider exchange rates with manual overrides and drift alerts.
//!
//! Each refresh queries every provider for every pair concurrently. The
//! active rate is the manual override when one is set, otherwise the first
//! provider in priority order that answered. The mean of all answers is kept
//! only to compare against a manual rate.
//!
//! Manual rates and their source flag live in the device settings:
//!   rates.manual.{pair_key}   f64
//!   rates.source.{pair_key}   "manual"
//! Discrepancy snoozes use the shared `SnoozeBook` under `rates.{pair_key}`.

use asaas_core::bus::{EventBus, Subscription};
use asaas_core::config::{DiscrepancyThreshold, RatesConfig};
use asaas_core::error::{AsaasError, AsaasResult};
use asaas_core::snooze::{until_for_minutes, SnoozeState};
use asaas_core::types::{
    ConnectionEvent, CurrencyPair, CurrencyStatus, DiscrepancyAlert, ExchangeRateSnapshot,
    RateAlertState, RateSource,
};
use asaas_core::unix_now;
use asaas_state::{SharedSettings, SnoozeBook};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::provider::RateProvider;

const MANUAL_SOURCE: &str = "manual";

fn manual_key(pair: &CurrencyPair) -> String {
    format!("rates.manual.{}", pair.key())
}

fn source_key(pair: &CurrencyPair) -> String {
    format!("rates.source.{}", pair.key())
}

pub fn snooze_key(pair: &CurrencyPair) -> String {
    format!("rates.{}", pair.key())
}

/// Outcome of one provider for one pair during a refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderQuote {
    pub provider: String,
    pub result: Result<f64, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairRefresh {
    pub pair: CurrencyPair,
    pub quotes: Vec<ProviderQuote>,
    pub average: Option<f64>,
    pub status: CurrencyStatus,
}

impl PairRefresh {
    pub fn responded(&self) -> usize {
        self.quotes.iter().filter(|q| q.result.is_ok()).count()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RefreshReport {
    pub pairs: Vec<PairRefresh>,
}

/// Cached per-pair state between refreshes.
#[derive(Debug, Clone, Default)]
struct PairState {
    /// First responding provider of the latest refresh that had one
    live: Option<(String, f64, u64)>,
    average: Option<f64>,
    discrepancy: Option<DiscrepancyAlert>,
}

#[derive(Default)]
struct AlertControl {
    /// Headline hidden until the next refresh
    dismissed: bool,
    /// Operator-forced headline, cleared by the next refresh
    forced: Option<CurrencyPair>,
}

pub struct ExchangeRateAggregator {
    pairs: Vec<CurrencyPair>,
    providers: Vec<Arc<dyn RateProvider>>,
    threshold: DiscrepancyThreshold,
    settings: SharedSettings,
    snoozes: SnoozeBook,
    state: Mutex<BTreeMap<CurrencyPair, PairState>>,
    control: Mutex<AlertControl>,
    refresh_lock: TokioMutex<()>,
    snapshots: watch::Sender<BTreeMap<CurrencyPair, ExchangeRateSnapshot>>,
    statuses: watch::Sender<BTreeMap<CurrencyPair, CurrencyStatus>>,
    alerts: watch::Sender<RateAlertState>,
    reports: EventBus<RefreshReport>,
}

impl ExchangeRateAggregator {
    pub fn new(
        pairs: Vec<CurrencyPair>,
        providers: Vec<Arc<dyn RateProvider>>,
        threshold: DiscrepancyThreshold,
        settings: SharedSettings,
    ) -> Arc<Self> {
        let statuses = pairs
            .iter()
            .map(|p| (p.clone(), CurrencyStatus::Loading))
            .collect();
        Arc::new(Self {
            providers,
            threshold,
            snoozes: SnoozeBook::new(settings.clone()),
            settings,
            state: Mutex::new(pairs.iter().map(|p| (p.clone(), PairState::default())).collect()),
            pairs,
            control: Mutex::new(AlertControl::default()),
            refresh_lock: TokioMutex::new(()),
            snapshots: watch::channel(BTreeMap::new()).0,
            statuses: watch::channel(statuses).0,
            alerts: watch::channel(RateAlertState::default()).0,
            reports: EventBus::new("rate-refresh"),
        })
    }

    /// Build from the `[rates]` section; unparseable pairs are a config error.
    pub fn from_config(
        cfg: &RatesConfig,
        providers: Vec<Arc<dyn RateProvider>>,
        settings: SharedSettings,
    ) -> AsaasResult<Arc<Self>> {
        let pairs = cfg
            .pairs
            .iter()
            .map(|p| p.parse::<CurrencyPair>().map_err(AsaasError::Config))
            .collect::<AsaasResult<Vec<_>>>()?;
        Ok(Self::new(pairs, providers, cfg.threshold, settings))
    }

    pub fn pairs(&self) -> &[CurrencyPair] {
        &self.pairs
    }

    pub fn alerts(&self) -> RateAlertState {
        self.alerts.borrow().clone()
    }

    pub fn watch_alerts(&self) -> watch::Receiver<RateAlertState> {
        self.alerts.subscribe()
    }

    pub fn status(&self, pair: &CurrencyPair) -> Option<CurrencyStatus> {
        self.statuses.borrow().get(pair).copied()
    }

    pub fn watch_statuses(&self) -> watch::Receiver<BTreeMap<CurrencyPair, CurrencyStatus>> {
        self.statuses.subscribe()
    }

    pub fn snapshot(&self, pair: &CurrencyPair) -> Option<ExchangeRateSnapshot> {
        self.snapshots.borrow().get(pair).cloned()
    }

    pub fn watch_snapshots(&self) -> watch::Receiver<BTreeMap<CurrencyPair, ExchangeRateSnapshot>> {
        self.snapshots.subscribe()
    }

    pub fn subscribe_reports(&self) -> Subscription<RefreshReport> {
        self.reports.subscribe()
    }

    fn check_pair(&self, pair: &CurrencyPair) -> AsaasResult<()> {
        if self.pairs.contains(pair) {
            Ok(())
        } else {
            Err(AsaasError::Validation(format!("unknown currency pair {pair}")))
        }
    }

    // ── Refresh ──────────────────────────────────────────────────────────

    /// Query the providers for one pair, or for every configured pair.
    pub async fn refresh(&self, pair: Option<&CurrencyPair>) -> AsaasResult<RefreshReport> {
        let targets: Vec<CurrencyPair> = match pair {
            Some(p) => {
                self.check_pair(p)?;
                vec![p.clone()]
            }
            None => self.pairs.clone(),
        };

        let _guard = self.refresh_lock.lock().await;
        self.statuses.send_modify(|s| {
            for p in &targets {
                s.insert(p.clone(), CurrencyStatus::Loading);
            }
        });

        let mut pending = Vec::new();
        for p in &targets {
            for provider in self.providers.iter().filter(|prov| prov.supports(p)) {
                let provider = Arc::clone(provider);
                let p = p.clone();
                pending.push(async move {
                    let result = provider.fetch(&p).await;
                    (p, provider.id().to_string(), result)
                });
            }
        }
        let results = join_all(pending).await;

        let now = unix_now();
        let mut report = RefreshReport::default();
        for p in &targets {
            let quotes: Vec<ProviderQuote> = results
                .iter()
                .filter(|(qp, _, _)| qp == p)
                .map(|(_, provider, result)| {
                    if let Err(e) = result {
                        warn!(pair = %p, provider = %provider, "rate provider failed: {e}");
                    }
                    ProviderQuote {
                        provider: provider.clone(),
                        result: result.as_ref().copied().map_err(|e| e.to_string()),
                    }
                })
                .collect();

            let rates: Vec<f64> = quotes
                .iter()
                .filter_map(|q| q.result.as_ref().ok().copied())
                .collect();
            let average = (!rates.is_empty()).then(|| rates.iter().sum::<f64>() / rates.len() as f64);
            let live = quotes
                .iter()
                .find_map(|q| q.result.as_ref().ok().map(|r| (q.provider.clone(), *r, now)));
            let status = if live.is_some() {
                CurrencyStatus::Ok
            } else {
                CurrencyStatus::Error
            };

            if let Ok(mut state) = self.state.lock() {
                let entry = state.entry(p.clone()).or_default();
                // zero responders keeps the last good values for display
                if live.is_some() {
                    entry.live = live;
                    entry.average = average;
                }
            }
            self.statuses.send_modify(|s| {
                s.insert(p.clone(), status);
            });

            debug!(pair = %p, responded = rates.len(), ?average, "pair refreshed");
            report.pairs.push(PairRefresh {
                pair: p.clone(),
                quotes,
                average,
                status,
            });
        }

        for p in &targets {
            self.resolve_active_rate(p).await?;
            self.detect_discrepancy(p).await?;
        }

        if let Ok(mut control) = self.control.lock() {
            *control = AlertControl::default();
        }
        self.publish_alerts().await;

        info!(
            pairs = report.pairs.len(),
            failed = report.pairs.iter().filter(|p| p.status == CurrencyStatus::Error).count(),
            "exchange rates refreshed"
        );
        self.reports.emit(report.clone());
        Ok(report)
    }

    /// Recompute and publish the active rate for `pair`: the manual override
    /// if set, else the first live provider of the latest refresh.
    pub async fn resolve_active_rate(&self, pair: &CurrencyPair) -> AsaasResult<Option<ExchangeRateSnapshot>> {
        self.check_pair(pair)?;
        let manual = self.manual_rate(pair).await;
        let cached = self.pair_state(pair);

        let snapshot = match (manual, &cached.live) {
            (Some(rate), _) => Some(ExchangeRateSnapshot {
                pair: pair.clone(),
                rate,
                source: RateSource::Manual,
                timestamp: unix_now(),
                average: cached.average,
                is_manual: true,
            }),
            (None, Some((provider, rate, at))) => Some(ExchangeRateSnapshot {
                pair: pair.clone(),
                rate: *rate,
                source: RateSource::Provider(provider.clone()),
                timestamp: *at,
                average: cached.average,
                is_manual: false,
            }),
            (None, None) => None,
        };

        self.snapshots.send_modify(|s| match &snapshot {
            Some(snap) => {
                s.insert(pair.clone(), snap.clone());
            }
            None => {
                s.remove(pair);
            }
        });
        Ok(snapshot)
    }

    /// Compare the manual override against the latest average. Returns the
    /// comparison whenever both exist; only exceeded ones become alerts.
    pub async fn detect_discrepancy(&self, pair: &CurrencyPair) -> AsaasResult<Option<DiscrepancyAlert>> {
        self.check_pair(pair)?;
        let manual = self.manual_rate(pair).await;
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("rate state lock poisoned"))?;
        let entry = state.entry(pair.clone()).or_default();

        let alert = match (manual, entry.average) {
            (Some(manual_value), Some(average_value)) => {
                let diff = manual_value - average_value;
                Some(DiscrepancyAlert {
                    pair: pair.clone(),
                    manual_value,
                    average_value,
                    diff,
                    threshold_exceeded: self.threshold.exceeded(diff, average_value),
                })
            }
            _ => None,
        };
        entry.discrepancy = alert.clone().filter(|a| a.threshold_exceeded);
        Ok(alert)
    }

    // ── Manual override ──────────────────────────────────────────────────

    pub async fn manual_rate(&self, pair: &CurrencyPair) -> Option<f64> {
        let settings = self.settings.lock().await;
        let source: Option<String> = settings.get(&source_key(pair));
        if source.as_deref() != Some(MANUAL_SOURCE) {
            return None;
        }
        settings
            .get::<f64>(&manual_key(pair))
            .filter(|v| v.is_finite() && *v > 0.0)
    }

    /// `value <= 0` clears the override and reverts to the live providers.
    pub async fn set_manual_rate(&self, pair: &CurrencyPair, value: f64) -> AsaasResult<()> {
        self.check_pair(pair)?;
        if value.is_nan() {
            return Err(AsaasError::Validation("manual rate is not a number".into()));
        }

        {
            let mut settings = self.settings.lock().await;
            if value > 0.0 && value.is_finite() {
                settings.set(&manual_key(pair), &value)?;
                settings.set(&source_key(pair), &MANUAL_SOURCE)?;
                info!(pair = %pair, value, "manual rate set");
            } else {
                settings.remove(&manual_key(pair))?;
                settings.remove(&source_key(pair))?;
                info!(pair = %pair, "manual rate cleared");
            }
        }

        self.resolve_active_rate(pair).await?;
        self.detect_discrepancy(pair).await?;
        self.publish_alerts().await;
        Ok(())
    }

    // ── Alerts ───────────────────────────────────────────────────────────

    /// Snooze the pair's alert. -1 is indefinite, 0 only dismisses.
    pub async fn snooze(&self, pair: &CurrencyPair, minutes: i64) -> AsaasResult<SnoozeState> {
        self.check_pair(pair)?;
        if minutes < -1 {
            return Err(AsaasError::Validation(format!("invalid snooze duration {minutes}")));
        }

        let state = match until_for_minutes(minutes, unix_now()) {
            Some(until) => self.snoozes.snooze(&snooze_key(pair), Some(until)).await?,
            None => {
                self.dismiss().await;
                return Ok(self.snoozes.get(&snooze_key(pair)).await);
            }
        };
        debug!(pair = %pair, ?state, "rate alert snoozed");
        self.publish_alerts().await;
        Ok(state)
    }

    pub async fn unsnooze(&self, pair: &CurrencyPair) -> AsaasResult<()> {
        self.check_pair(pair)?;
        self.snoozes.unsnooze(&snooze_key(pair)).await?;
        self.publish_alerts().await;
        Ok(())
    }

    /// Hide the headline alert until the next refresh, without snoozing.
    pub async fn dismiss(&self) {
        if let Ok(mut control) = self.control.lock() {
            control.dismissed = true;
            control.forced = None;
        }
        self.publish_alerts().await;
    }

    /// Show the alert for `pair` even if snoozed; `None` clears the headline.
    /// A pair without a current discrepancy changes nothing.
    pub async fn force_alert(&self, pair: Option<&CurrencyPair>) {
        let Some(pair) = pair else {
            self.dismiss().await;
            return;
        };
        if self.pair_state(pair).discrepancy.is_none() {
            return;
        }
        if let Ok(mut control) = self.control.lock() {
            control.dismissed = false;
            control.forced = Some(pair.clone());
        }
        self.publish_alerts().await;
    }

    async fn publish_alerts(&self) {
        let now = unix_now();
        let all: Vec<DiscrepancyAlert> = {
            let Ok(state) = self.state.lock() else { return };
            self.pairs
                .iter()
                .filter_map(|p| state.get(p).and_then(|s| s.discrepancy.clone()))
                .collect()
        };

        let mut snoozed_pairs = Vec::new();
        for alert in &all {
            if self.snoozes.is_active(&snooze_key(&alert.pair), now).await {
                snoozed_pairs.push(alert.pair.clone());
            }
        }

        let (dismissed, forced) = match self.control.lock() {
            Ok(c) => (c.dismissed, c.forced.clone()),
            Err(_) => (false, None),
        };
        let headline = match forced {
            Some(pair) => all.iter().find(|a| a.pair == pair).cloned(),
            None if dismissed => None,
            None => all
                .iter()
                .find(|a| !snoozed_pairs.contains(&a.pair))
                .cloned(),
        };

        let next = RateAlertState {
            has_discrepancy: headline.is_some(),
            discrepancy: headline,
            snoozed_pairs,
            all_discrepancies: all,
        };
        self.alerts.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn pair_state(&self, pair: &CurrencyPair) -> PairState {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.get(pair).cloned())
            .unwrap_or_default()
    }

    /// Statuses read as error while the device is offline.
    fn mark_offline(&self) {
        self.statuses.send_modify(|s| {
            for status in s.values_mut() {
                *status = CurrencyStatus::Error;
            }
        });
    }

    // ── Trigger loop ─────────────────────────────────────────────────────

    /// Refresh on every tick and when connectivity returns.
    pub async fn run(
        self: Arc<Self>,
        mut events: Subscription<ConnectionEvent>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut online = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if online {
                        self.refresh_logged().await;
                    }
                }
                event = events.recv() => match event {
                    Some(ConnectionEvent::Online) | Some(ConnectionEvent::Wake { .. }) => {
                        online = true;
                        self.refresh_logged().await;
                    }
                    Some(ConnectionEvent::Offline) => {
                        online = false;
                        self.mark_offline();
                    }
                    Some(ConnectionEvent::Heartbeat { .. }) => {}
                    None => break,
                },
            }
        }
        debug!("exchange rate loop stopped");
    }

    async fn refresh_logged(&self) {
        if let Err(e) = self.refresh(None).await {
            warn!("exchange rate refresh failed: {e}");
        }
    }
}
