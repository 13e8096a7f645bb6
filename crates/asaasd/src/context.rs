//! Process-scoped service container.
//!
//! Every service is built exactly once here and handed its collaborators
//! explicitly. Background loops are spawned through `spawn` so `shutdown`
//! can cancel and await all of them before the stores are flushed.

use anyhow::{Context, Result};
use asaas_assets::{AssetSyncManager, NoPeers, PeerTransport};
use asaas_core::config::AsaasConfig;
use asaas_rates::{build_providers, ExchangeRateAggregator, RateProvider, ReminderScheduler};
use asaas_state::{LocalStore, SettingsStore, SharedSettings, SharedStore};
use asaas_sync::{
    ConnectionManager, ConnectionSettings, RemoteBackendClient, RestBackendClient, SyncEngine,
};
use opendal::Operator;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metrics::DaemonMetrics;

const DEVICE_ID_KEY: &str = "device.id";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// External collaborators, swappable for tests
pub struct Collaborators {
    pub remote: Arc<dyn RemoteBackendClient>,
    pub providers: Vec<Arc<dyn RateProvider>>,
    /// `None` runs asset replication against an in-process store
    pub operator: Option<Operator>,
    pub peers: Option<Arc<dyn PeerTransport>>,
}

pub struct AppContext {
    pub config: Arc<AsaasConfig>,
    pub data_dir: PathBuf,
    pub device_id: String,
    pub session_id: String,
    pub settings: SharedSettings,
    pub store: SharedStore,
    /// Operator backing the asset manager; `None` if it is the in-process fallback
    pub object_store: Option<Operator>,
    pub engine: Arc<SyncEngine>,
    pub connection: Arc<ConnectionManager>,
    pub assets: Arc<AssetSyncManager>,
    pub rates: Arc<ExchangeRateAggregator>,
    pub reminders: ReminderScheduler,
    pub metrics: DaemonMetrics,
    cancel: CancellationToken,
    tasks: TokioMutex<JoinSet<()>>,
}

impl AppContext {
    /// Build with the real backend, rate providers and object store.
    pub async fn build(config: AsaasConfig) -> Result<Self> {
        let remote: Arc<dyn RemoteBackendClient> =
            Arc::new(RestBackendClient::from_config(&config.backend)?);
        let providers = build_providers(&config.rates)?;

        let operator = match asaas_storage::ObjectStoreConfig::from_assets_config(&config.assets)
            .and_then(|cfg| asaas_storage::build_operator(&cfg))
        {
            Ok(op) => {
                match asaas_storage::check_health(&op).await {
                    Ok(()) => info!(endpoint = %config.assets.endpoint, "object store: connected"),
                    // keep the operator; scans retry on the next trigger
                    Err(e) => warn!(endpoint = %config.assets.endpoint, "object store: {e}"),
                }
                Some(op)
            }
            Err(e) => {
                warn!("object store unavailable: {e}  (assets stay on this device)");
                None
            }
        };

        Self::build_with(
            config,
            Collaborators {
                remote,
                providers,
                operator,
                peers: None,
            },
        )
        .await
    }

    pub async fn build_with(config: AsaasConfig, collab: Collaborators) -> Result<Self> {
        let workspace_id = config.workspace.workspace_id.trim().to_string();
        if workspace_id.is_empty() {
            anyhow::bail!("workspace.workspace_id must be set");
        }

        let data_dir = expand_home(&config.daemon.data_dir);
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;

        let settings = SettingsStore::open(&data_dir.join("settings.json"))?.into_shared();
        let device_id = resolve_device_id(&config, &settings).await?;
        let session_id = config
            .workspace
            .session_id
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let store = LocalStore::open(&LocalStore::default_path(&data_dir, &workspace_id), &workspace_id)?
            .into_shared();
        let engine = SyncEngine::from_config(workspace_id.clone(), &config.sync, store.clone(), collab.remote);
        let connection = ConnectionManager::new(ConnectionSettings::from_config(&config.connection));

        let object_store = collab.operator.clone();
        let operator = match collab.operator {
            Some(op) => op,
            None => asaas_storage::memory_operator()?,
        };
        let local_root = expand_home(&config.assets.local_dir);
        let peers = match collab.peers {
            Some(peers) => peers,
            None => default_peers(&config, &local_root, &workspace_id, &device_id).await,
        };
        let assets = AssetSyncManager::new(
            operator,
            local_root,
            device_id.clone(),
            peers,
            Duration::from_millis(config.assets.display_window_ms),
        );

        let rates = ExchangeRateAggregator::from_config(&config.rates, collab.providers, settings.clone())?;
        let reminders = ReminderScheduler::new(settings.clone(), config.reminders.days_before);

        info!(
            workspace = %workspace_id,
            device = %device_id,
            tables = config.sync.tables.len(),
            pairs = rates.pairs().len(),
            "services ready"
        );

        Ok(Self {
            config: Arc::new(config),
            data_dir,
            device_id,
            session_id,
            settings,
            store,
            object_store,
            engine,
            connection,
            assets,
            rates,
            reminders,
            metrics: DaemonMetrics::default(),
            cancel: CancellationToken::new(),
            tasks: TokioMutex::new(JoinSet::new()),
        })
    }

    pub fn workspace_id(&self) -> &str {
        self.engine.workspace_id()
    }

    /// Token cancelled when the process shuts down
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run a background loop owned by the context.
    pub async fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().await.spawn(task);
    }

    /// Cancel every loop, wait for them, then flush local state.
    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down");
        self.cancel.cancel();

        let mut tasks = self.tasks.lock().await;
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(res) = tasks.join_next().await {
                if let Err(e) = res {
                    warn!("background task ended abnormally: {e}");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("background tasks still running after {SHUTDOWN_GRACE:?}; aborting");
            tasks.abort_all();
        }

        self.store
            .lock()
            .await
            .flush()
            .context("flushing record store on shutdown")?;
        Ok(())
    }
}

/// Configured id, else the one persisted in settings, else a new one.
async fn resolve_device_id(config: &AsaasConfig, settings: &SharedSettings) -> Result<String> {
    if let Some(id) = config.workspace.device_id.as_ref().filter(|s| !s.is_empty()) {
        return Ok(id.clone());
    }
    let mut settings = settings.lock().await;
    if let Some(id) = settings.get::<String>(DEVICE_ID_KEY) {
        return Ok(id);
    }
    let id = uuid::Uuid::new_v4().to_string();
    settings.set(DEVICE_ID_KEY, &id)?;
    info!(device = %id, "generated device id");
    Ok(id)
}

#[cfg(feature = "nats")]
async fn default_peers(
    config: &AsaasConfig,
    local_root: &Path,
    workspace_id: &str,
    device_id: &str,
) -> Arc<dyn PeerTransport> {
    let Some(url) = config.assets.nats_url.as_deref() else {
        return Arc::new(NoPeers);
    };
    let dir = asaas_assets::LocalAssetDir::new(local_root.join(workspace_id), device_id);
    match asaas_assets::NatsPeers::connect(url, dir, Duration::from_secs(5)).await {
        Ok(peers) => Arc::new(peers),
        Err(e) => {
            warn!("peer network unavailable: {e}  (cloud-only transfers)");
            Arc::new(NoPeers)
        }
    }
}

#[cfg(not(feature = "nats"))]
async fn default_peers(
    config: &AsaasConfig,
    _local_root: &Path,
    _workspace_id: &str,
    _device_id: &str,
) -> Arc<dyn PeerTransport> {
    if config.assets.nats_url.is_some() {
        warn!("assets.nats_url is set but asaasd was built without the nats feature");
    }
    Arc::new(NoPeers)
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}
