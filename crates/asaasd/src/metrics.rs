//! Prometheus /metrics + health check HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics  - Prometheus text format
//!   GET /healthz  - Liveness probe (always 200 if process is running)
//!   GET /readyz   - Readiness probe (200 if the object store is reachable)

use anyhow::Result;
use asaas_core::bus::Subscription;
use asaas_core::types::{CurrencyStatus, SyncStatusSnapshot};
use asaas_assets::ScanReport;
use asaas_rates::RefreshReport;
use asaas_sync::conflict::ConflictNotice;
use asaas_sync::{PushReport, SyncReport};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransferLabels {
    pub direction: Direction,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Ok,
    Error,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PairLabels {
    pub pair: String,
    pub outcome: Outcome,
}

/// Counters fed from the services' event channels
#[derive(Clone, Default)]
pub struct DaemonMetrics {
    pub sync_rounds: Counter,
    pub records_pushed: Counter,
    pub conflicts: Counter,
    pub pending_records: Gauge,
    pub rate_refreshes: Family<PairLabels, Counter>,
    pub asset_transfers: Family<TransferLabels, Counter>,
    pub asset_failures: Counter,
}

impl DaemonMetrics {
    pub fn register(&self, registry: &mut Registry) {
        registry.register("asaas_sync_rounds", "Completed sync rounds", self.sync_rounds.clone());
        registry.register(
            "asaas_records_pushed",
            "Records accepted by the backend",
            self.records_pushed.clone(),
        );
        registry.register(
            "asaas_conflicts",
            "Version conflicts resolved last-write-wins",
            self.conflicts.clone(),
        );
        registry.register(
            "asaas_pending_records",
            "Local records waiting to be pushed",
            self.pending_records.clone(),
        );
        registry.register(
            "asaas_rate_refreshes",
            "Exchange rate refreshes per pair",
            self.rate_refreshes.clone(),
        );
        registry.register(
            "asaas_asset_transfers",
            "Assets uploaded or downloaded",
            self.asset_transfers.clone(),
        );
        registry.register(
            "asaas_asset_failures",
            "Asset transfers that failed",
            self.asset_failures.clone(),
        );
    }

    pub fn record_sync(&self, report: &SyncReport) {
        if !report.skipped_offline {
            self.sync_rounds.inc();
        }
    }

    pub fn record_push(&self, report: &PushReport) {
        self.records_pushed
            .inc_by((report.pushed + report.superseded) as u64);
    }

    pub fn record_rates(&self, report: &RefreshReport) {
        for pair in &report.pairs {
            let outcome = match pair.status {
                CurrencyStatus::Error => Outcome::Error,
                _ => Outcome::Ok,
            };
            self.rate_refreshes
                .get_or_create(&PairLabels {
                    pair: pair.pair.to_string(),
                    outcome,
                })
                .inc();
        }
    }

    pub fn record_scan(&self, report: &ScanReport) {
        self.asset_transfers
            .get_or_create(&TransferLabels {
                direction: Direction::Upload,
            })
            .inc_by(report.uploaded.len() as u64);
        self.asset_transfers
            .get_or_create(&TransferLabels {
                direction: Direction::Download,
            })
            .inc_by(report.downloaded.len() as u64);
        self.asset_failures.inc_by(report.failed.len() as u64);
    }
}

/// Event sources the metrics task listens to
pub struct MetricSources {
    pub syncs: Subscription<SyncReport>,
    pub pushes: Subscription<PushReport>,
    pub conflicts: Subscription<ConflictNotice>,
    pub rates: Subscription<RefreshReport>,
    pub scans: Subscription<ScanReport>,
    pub status: watch::Receiver<SyncStatusSnapshot>,
}

/// Fold service events into the counters until cancelled.
pub async fn record(metrics: DaemonMetrics, mut src: MetricSources, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(r) = src.syncs.recv() => metrics.record_sync(&r),
            Some(r) = src.pushes.recv() => metrics.record_push(&r),
            Some(_) = src.conflicts.recv() => { metrics.conflicts.inc(); }
            Some(r) = src.rates.recv() => metrics.record_rates(&r),
            Some(r) = src.scans.recv() => metrics.record_scan(&r),
            Ok(()) = src.status.changed() => {
                let pending = src.status.borrow_and_update().pending_count;
                metrics.pending_records.set(pending as i64);
            }
            else => break,
        }
    }
}

/// Shared health state updated by the daemon
#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<Registry>,
    /// `None` when the daemon runs without object store credentials
    pub operator: Option<opendal::Operator>,
}

/// Serve Prometheus metrics and health endpoints on `addr` (e.g. "127.0.0.1:9310")
pub async fn serve(addr: String, state: HealthState, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("metrics bind {addr}: {e}"))?;

    tracing::info!(addr = %addr, "metrics: listening on /metrics, /healthz, /readyz");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| anyhow::anyhow!("metrics server: {e}"))
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let mut body = String::new();
    match encode(&mut body, &state.registry) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// 200 if the object store answers, 503 otherwise.
async fn readyz_handler(State(state): State<HealthState>) -> impl IntoResponse {
    match state.operator.as_ref() {
        Some(op) => match asaas_storage::check_health(op).await {
            Ok(()) => (StatusCode::OK, "ready"),
            Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "object store unreachable"),
        },
        None => (StatusCode::SERVICE_UNAVAILABLE, "no object store configured"),
    }
}
