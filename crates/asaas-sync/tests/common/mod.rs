//! In-memory backend shared by the engine integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use asaas_core::error::{AsaasError, AsaasResult};
use asaas_core::types::{SyncStatus, SyncableRecord};
use asaas_state::{LocalStore, SharedStore};
use asaas_sync::conflict::MergePolicy;
use asaas_sync::retry::RetryPolicy;
use asaas_sync::{RemoteBackendClient, SyncEngine, UpsertOutcome};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const WS: &str = "ws-test";

/// Versioned table store with call counters, injectable failures and latency
#[derive(Default)]
pub struct FakeBackend {
    rows: Mutex<BTreeMap<(String, String), SyncableRecord>>,
    clock: AtomicU64,
    pub upserts: AtomicUsize,
    pub fetches: AtomicUsize,
    upsert_failures: Mutex<VecDeque<AsaasError>>,
    fail_forever: Mutex<Option<fn() -> AsaasError>>,
    latency_ms: AtomicU64,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_next_upsert(&self, err: AsaasError) {
        self.upsert_failures.lock().unwrap().push_back(err);
    }

    pub fn fail_every_upsert(&self, make: fn() -> AsaasError) {
        *self.fail_forever.lock().unwrap() = Some(make);
    }

    pub fn row(&self, table: &str, id: &str) -> Option<SyncableRecord> {
        self.rows
            .lock()
            .unwrap()
            .get(&(table.to_string(), id.to_string()))
            .cloned()
    }

    /// Simulate another device's accepted write.
    pub fn remote_write(&self, table: &str, id: &str, payload: serde_json::Value) -> SyncableRecord {
        let mut rows = self.rows.lock().unwrap();
        let key = (table.to_string(), id.to_string());
        let version = rows.get(&key).map(|r| r.version).unwrap_or(0) + 1;
        let record = SyncableRecord {
            id: id.to_string(),
            workspace_id: WS.to_string(),
            version,
            sync_status: SyncStatus::Synced,
            last_synced_at: None,
            is_deleted: false,
            updated_at: self.tick(),
            payload,
        };
        rows.insert(key, record.clone());
        record
    }

    /// Insert a row verbatim, e.g. an older version than the server holds.
    pub fn insert_raw(&self, table: &str, record: SyncableRecord) {
        self.rows
            .lock()
            .unwrap()
            .insert((table.to_string(), record.id.clone()), record);
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn delay(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait]
impl RemoteBackendClient for FakeBackend {
    async fn upsert(
        &self,
        table: &str,
        record: &SyncableRecord,
        base_version: u64,
    ) -> AsaasResult<UpsertOutcome> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        if let Some(err) = self.upsert_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        if let Some(make) = *self.fail_forever.lock().unwrap() {
            return Err(make());
        }

        let mut rows = self.rows.lock().unwrap();
        let key = (table.to_string(), record.id.clone());
        let current_version = rows.get(&key).map(|r| r.version).unwrap_or(0);
        if current_version != base_version {
            if let Some(current) = rows.get(&key) {
                return Ok(UpsertOutcome::Stale {
                    current: current.clone(),
                });
            }
        }

        let version = current_version + 1;
        let updated_at = self.tick();
        let mut stored = record.clone();
        stored.version = version;
        stored.updated_at = updated_at;
        stored.sync_status = SyncStatus::Synced;
        rows.insert(key, stored);
        Ok(UpsertOutcome::Accepted {
            version,
            updated_at,
        })
    }

    async fn fetch_since(
        &self,
        table: &str,
        workspace_id: &str,
        since: Option<u64>,
    ) -> AsaasResult<Vec<SyncableRecord>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        let since = since.unwrap_or(0);
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|((t, _), r)| t == table && r.workspace_id == workspace_id && r.updated_at > since)
            .map(|(_, r)| r.clone())
            .collect())
    }
}

pub struct Harness {
    pub engine: Arc<SyncEngine>,
    pub store: SharedStore,
    pub backend: Arc<FakeBackend>,
    _tmp: TempDir,
}

pub fn harness(tables: &[&str]) -> Harness {
    harness_with_merge(tables, MergePolicy::default())
}

pub fn harness_with_merge(tables: &[&str], merge: MergePolicy) -> Harness {
    harness_with(tables, merge, RetryPolicy::testing())
}

pub fn harness_with(tables: &[&str], merge: MergePolicy, retry: RetryPolicy) -> Harness {
    let tmp = TempDir::new().unwrap();
    let store = LocalStore::open(&tmp.path().join("records.json"), WS)
        .unwrap()
        .into_shared();
    let backend = FakeBackend::new();
    let engine = SyncEngine::new(
        WS,
        tables.iter().map(|t| t.to_string()).collect(),
        store.clone(),
        backend.clone(),
        retry,
        merge,
    );
    Harness {
        engine,
        store,
        backend,
        _tmp: tmp,
    }
}
