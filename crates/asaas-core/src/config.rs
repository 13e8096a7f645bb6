use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Top-level configuration (loaded from asaas.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AsaasConfig {
    pub daemon: DaemonConfig,
    pub workspace: WorkspaceConfig,
    pub backend: BackendConfig,
    pub sync: SyncConfig,
    pub connection: ConnectionConfig,
    pub assets: AssetsConfig,
    pub rates: RatesConfig,
    pub reminders: ReminderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Prometheus metrics endpoint (default: 127.0.0.1:9310)
    pub metrics_addr: Option<String>,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
    /// Root directory for local stores and settings
    pub data_dir: PathBuf,
}

/// The workspace this process serves. Login itself happens elsewhere.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub workspace_id: String,
    pub user_id: String,
    /// Stable device id (generated and persisted in settings when empty)
    pub device_id: Option<String>,
    /// Session id used for peer discovery (generated per process when empty)
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the remote record API
    pub endpoint: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Tables drained and pulled on every sync, in order
    pub tables: Vec<String>,
    /// Push attempts before a row is marked `error`
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_factor: f64,
    /// Periodic pull cadence (0 = only on triggers)
    pub pull_interval_secs: u64,
    /// Delay before syncing after coming online
    pub online_settle_ms: u64,
    /// Per-table fields merged from a local edit when a push loses a conflict
    pub mergeable: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Probed with HEAD; empty disables the heartbeat
    pub heartbeat_url: String,
    pub heartbeat_interval_secs: u64,
    pub wake_threshold_secs: u64,
    pub online_debounce_ms: u64,
    pub failures_before_offline: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    /// Local asset directory
    pub local_dir: PathBuf,
    /// S3-compatible endpoint of the cloud object store
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    /// Enforce HTTPS for the object store endpoint
    pub enforce_tls: bool,
    pub access_key_env: String,
    pub secret_key_env: String,
    /// How long success/error stays visible before returning to idle
    pub display_window_ms: u64,
    pub watch_interval_secs: u64,
    /// NATS server for peer transfer (peer path disabled when unset)
    pub nats_url: Option<String>,
}

/// Discrepancy threshold between a manual rate and the live average
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyThreshold {
    /// Percent of the average
    Percent(f64),
    /// Absolute rate units
    Absolute(f64),
}

impl DiscrepancyThreshold {
    pub fn exceeded(&self, diff: f64, average: f64) -> bool {
        match self {
            DiscrepancyThreshold::Percent(p) => diff.abs() > average.abs() * p / 100.0,
            DiscrepancyThreshold::Absolute(v) => diff.abs() > *v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// JSON body, value located by a JSON pointer
    #[default]
    Json,
    /// Any text body, value is the first capture group of a regex
    Pattern,
}

/// One live rate provider. Order in `RatesConfig::providers` is priority order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    pub url: String,
    /// Pair ("USD/IQD") → JSON pointer or regex
    pub pairs: BTreeMap<String, String>,
    /// Multiplier applied to the extracted value
    pub scale: f64,
    /// Values below this are treated as a bad response
    pub min_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RatesConfig {
    pub pairs: Vec<String>,
    pub refresh_interval_secs: u64,
    pub threshold: DiscrepancyThreshold,
    pub timeout_secs: u64,
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReminderConfig {
    /// Remind this many days ahead of the due date
    pub days_before: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            metrics_addr: Some("127.0.0.1:9310".into()),
            log_level: "info".into(),
            log_format: "json".into(),
            data_dir: PathBuf::from("~/.local/share/asaas"),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8787".into(),
            api_key_env: "ASAAS_API_KEY".into(),
            timeout_secs: 20,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tables: vec![
                "products".into(),
                "customers".into(),
                "invoices".into(),
                "expenses".into(),
                "employees".into(),
                "budget_allocations".into(),
            ],
            max_attempts: 3,
            initial_backoff_ms: 5_000,
            max_backoff_ms: 30_000,
            backoff_factor: 3.0,
            pull_interval_secs: 600,
            online_settle_ms: 3_000,
            mergeable: BTreeMap::new(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_url: String::new(),
            heartbeat_interval_secs: 30,
            wake_threshold_secs: 60,
            online_debounce_ms: 500,
            failures_before_offline: 2,
        }
    }
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            local_dir: PathBuf::from("~/.local/share/asaas/assets"),
            endpoint: "http://localhost:9000".into(),
            region: "auto".into(),
            bucket: "asaas-assets".into(),
            enforce_tls: false,
            access_key_env: "ASAAS_S3_ACCESS_KEY_ID".into(),
            secret_key_env: "ASAAS_S3_SECRET_ACCESS_KEY".into(),
            display_window_ms: 2_000,
            watch_interval_secs: 60,
            nats_url: None,
        }
    }
}

impl Default for RatesConfig {
    fn default() -> Self {
        Self {
            pairs: vec!["USD/IQD".into(), "EUR/IQD".into(), "TRY/IQD".into()],
            refresh_interval_secs: 60,
            threshold: DiscrepancyThreshold::Percent(10.0),
            timeout_secs: 10,
            providers: Vec::new(),
        }
    }
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self { days_before: 3 }
    }
}
