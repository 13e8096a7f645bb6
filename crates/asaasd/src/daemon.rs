//! Daemon lifecycle: startup, trigger loops, metrics server, graceful shutdown

use anyhow::Result;
use asaas_core::config::AsaasConfig;
use asaas_sync::{HttpProbe, Probe, TriggerConfig};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::context::AppContext;
use crate::metrics::{self, HealthState, MetricSources};

pub async fn run(config: AsaasConfig) -> Result<()> {
    info!("daemon starting");

    let ctx = AppContext::build(config).await?;
    start(&ctx).await?;

    notify_ready();
    info!(
        workspace = %ctx.workspace_id(),
        device = %ctx.device_id,
        data_dir = %ctx.data_dir.display(),
        "daemon ready"
    );

    tokio::signal::ctrl_c().await?;
    info!("interrupt received");
    ctx.shutdown().await
}

/// Join the workspace and start every background loop.
pub async fn start(ctx: &AppContext) -> Result<()> {
    let config = Arc::clone(&ctx.config);
    let cancel = ctx.cancel_token();

    if let Err(e) = ctx
        .assets
        .initialize(&config.workspace.user_id, ctx.workspace_id(), &ctx.session_id)
        .await
    {
        warn!("asset manager init failed: {e}");
    }

    // Metrics are subscribed before any loop can emit
    let sources = MetricSources {
        syncs: ctx.engine.subscribe_reports(),
        pushes: ctx.engine.subscribe_pushes(),
        conflicts: ctx.engine.subscribe_conflicts(),
        rates: ctx.rates.subscribe_reports(),
        scans: ctx.assets.subscribe_reports(),
        status: ctx.engine.status(),
    };
    ctx.spawn(metrics::record(ctx.metrics.clone(), sources, cancel.clone()))
        .await;

    if let Some(addr) = config.daemon.metrics_addr.clone() {
        let mut registry = Registry::default();
        ctx.metrics.register(&mut registry);
        let state = HealthState {
            registry: Arc::new(registry),
            operator: ctx.object_store.clone(),
        };
        let server_cancel = cancel.clone();
        ctx.spawn(async move {
            if let Err(e) = metrics::serve(addr, state, server_cancel).await {
                error!("metrics server failed: {e}");
            }
        })
        .await;
    }

    // Connectivity: heartbeat drives online/offline/wake when configured
    if config.connection.heartbeat_url.is_empty() {
        info!("no heartbeat url configured; assuming always online");
    } else {
        let probe: Arc<dyn Probe> = Arc::new(HttpProbe::new(
            config.connection.heartbeat_url.clone(),
            Duration::from_secs(config.connection.heartbeat_interval_secs.max(1)),
        )?);
        ctx.spawn(Arc::clone(&ctx.connection).run_heartbeat(probe, cancel.clone()))
            .await;
    }

    ctx.spawn(Arc::clone(&ctx.engine).run(
        ctx.connection.subscribe(),
        TriggerConfig::from_config(&config.sync),
        cancel.clone(),
    ))
    .await;

    let watch_interval =
        (config.assets.watch_interval_secs > 0).then(|| Duration::from_secs(config.assets.watch_interval_secs));
    ctx.spawn(Arc::clone(&ctx.assets).run(ctx.connection.subscribe(), watch_interval, cancel.clone()))
        .await;

    ctx.spawn(Arc::clone(&ctx.rates).run(
        ctx.connection.subscribe(),
        Duration::from_secs(config.rates.refresh_interval_secs),
        cancel.clone(),
    ))
    .await;

    // Startup sync and scan; the rate loop refreshes on its first tick
    let engine = Arc::clone(&ctx.engine);
    let assets = Arc::clone(&ctx.assets);
    ctx.spawn(async move {
        if let Err(e) = engine.sync().await {
            warn!("startup sync failed: {e}");
        }
        if let Err(e) = assets.scan().await {
            warn!("startup asset scan failed: {e}");
        }
    })
    .await;

    info!(
        tables = config.sync.tables.len(),
        pairs = ctx.rates.pairs().len(),
        reminder_days = ctx.reminders.days_before(),
        "background loops started"
    );
    Ok(())
}

fn notify_ready() {
    // sd_notify(READY=1) when running under systemd; no-op otherwise
    #[cfg(unix)]
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        use std::os::unix::net::UnixDatagram;
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(b"READY=1\n", &socket);
            tracing::debug!(notify_socket = %socket, "sent systemd READY=1");
        }
    }
}
