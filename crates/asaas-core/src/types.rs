use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ── Records ──────────────────────────────────────────────────────────────────

/// Sync state of a single row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Pending,
    Synced,
    Conflict,
    Error,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Conflict => "conflict",
            SyncStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Envelope for every table row, local or remote.
///
/// `version` is assigned by the backend on an accepted write. While a row is
/// pending it carries the last server version it was based on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncableRecord {
    pub id: String,
    pub workspace_id: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub sync_status: SyncStatus,
    /// Unix timestamp of the last accepted push or applied pull
    #[serde(default)]
    pub last_synced_at: Option<u64>,
    /// Tombstone flag
    #[serde(default)]
    pub is_deleted: bool,
    /// Unix timestamp of the last modification (server clock for remote rows)
    #[serde(default)]
    pub updated_at: u64,
    /// Table-specific fields, always a JSON object
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// What a feature module hands to `write()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordDraft {
    /// Left empty to let the engine generate one
    pub id: Option<String>,
    pub payload: serde_json::Value,
}

impl RecordDraft {
    pub fn new(payload: serde_json::Value) -> Self {
        Self { id: None, payload }
    }

    pub fn with_id(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Some(id.into()),
            payload,
        }
    }
}

/// Overall health, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncHealth {
    #[default]
    Synced,
    Syncing,
    Pending,
    Conflict,
    Error,
}

/// Sync-status snapshot published to consumers
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncStatusSnapshot {
    pub pending_count: usize,
    pub conflict_count: usize,
    pub error_count: usize,
    pub is_online: bool,
    pub is_syncing: bool,
    pub last_sync_time: Option<u64>,
    /// Last fatal error (authorization, local I/O), cleared by the next clean round
    pub last_error: Option<String>,
}

impl SyncStatusSnapshot {
    /// Worst unresolved condition. Never an average.
    pub fn health(&self) -> SyncHealth {
        if self.error_count > 0 || self.last_error.is_some() {
            SyncHealth::Error
        } else if self.conflict_count > 0 {
            SyncHealth::Conflict
        } else if self.pending_count > 0 {
            SyncHealth::Pending
        } else if self.is_syncing {
            SyncHealth::Syncing
        } else {
            SyncHealth::Synced
        }
    }
}

// ── Connectivity ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionEvent {
    Online,
    Offline,
    /// Resumed after a suspension long enough to have missed notifications
    Wake { idle_secs: u64 },
    Heartbeat { ok: bool },
}

// ── Assets ───────────────────────────────────────────────────────────────────

/// A replicated binary asset (logo, avatar, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    /// Relative key, e.g. "logos/company.png"
    pub key: String,
    /// BLAKE3 hash of the content (hex)
    pub hash: String,
    pub size: u64,
    /// Device that last wrote the asset
    pub device_id: String,
    /// Unix timestamp of the last modification
    pub modified_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    #[default]
    Idle,
    Scanning,
    Uploading,
    Downloading,
    Error,
    Success,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AssetProgress {
    pub status: AssetStatus,
    pub current_file: Option<String>,
    pub error: Option<String>,
    pub is_initial_sync: bool,
}

// ── Exchange rates ───────────────────────────────────────────────────────────

/// A currency pair such as USD/IQD. Codes are stored upper-case.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyPair {
    pub base: String,
    pub quote: String,
}

impl CurrencyPair {
    pub fn new(base: &str, quote: &str) -> Self {
        Self {
            base: base.to_ascii_uppercase(),
            quote: quote.to_ascii_uppercase(),
        }
    }

    /// Stable lower-case key used in settings, e.g. "usd_iqd"
    pub fn key(&self) -> String {
        format!(
            "{}_{}",
            self.base.to_ascii_lowercase(),
            self.quote.to_ascii_lowercase()
        )
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl FromStr for CurrencyPair {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, quote) = s
            .split_once(['/', '_', '-'])
            .ok_or_else(|| format!("invalid currency pair: {s:?}"))?;
        let valid = |c: &str| c.len() == 3 && c.chars().all(|ch| ch.is_ascii_alphabetic());
        if !valid(base) || !valid(quote) {
            return Err(format!("invalid currency pair: {s:?}"));
        }
        Ok(CurrencyPair::new(base, quote))
    }
}

impl TryFrom<String> for CurrencyPair {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CurrencyPair> for String {
    fn from(pair: CurrencyPair) -> Self {
        pair.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum RateSource {
    Provider(String),
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrencyStatus {
    #[default]
    Loading,
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRateSnapshot {
    pub pair: CurrencyPair,
    /// Active rate
    pub rate: f64,
    pub source: RateSource,
    pub timestamp: u64,
    /// Mean of the providers that responded; diagnostic only
    pub average: Option<f64>,
    pub is_manual: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscrepancyAlert {
    pub pair: CurrencyPair,
    pub manual_value: f64,
    pub average_value: f64,
    /// manual minus average
    pub diff: f64,
    pub threshold_exceeded: bool,
}

/// Rate-alert state published to consumers
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RateAlertState {
    pub has_discrepancy: bool,
    pub discrepancy: Option<DiscrepancyAlert>,
    pub snoozed_pairs: Vec<CurrencyPair>,
    pub all_discrepancies: Vec<DiscrepancyAlert>,
}
