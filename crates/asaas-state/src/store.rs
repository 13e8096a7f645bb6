//! Per-workspace record store.
//!
//! All tables of one workspace live in a single JSON document, loaded into
//! memory on open and flushed atomically via temp+rename. Every row carries
//! the `SyncableRecord` envelope plus retry bookkeeping that only the sync
//! engine touches.
//!
//! Mutators come in two groups. `write_payload` / `write_tombstone` are the
//! feature side: they change payload or the tombstone flag and always leave the
//! row pending. The `mark_*`, `record_failure` and `apply_remote` methods are
//! the engine side and own version, status and `last_synced_at`.

use anyhow::Result;
use asaas_core::types::{SyncStatus, SyncableRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;

use crate::fsio;

pub type SharedStore = Arc<TokioMutex<LocalStore>>;

/// A record plus the engine's local bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub record: SyncableRecord,
    /// Bumped on every local write; a push only settles the revision it sent
    #[serde(default)]
    pub local_rev: u64,
    /// Failed push attempts since the last local write
    #[serde(default)]
    pub attempts: u32,
    /// Unix millis before which push skips this row
    #[serde(default)]
    pub next_attempt_at: Option<u64>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Payload fields discarded by the last conflict resolution
    #[serde(default)]
    pub discarded_fields: Vec<String>,
}

impl StoredRow {
    /// Never accepted by the backend
    pub fn is_unsent(&self) -> bool {
        self.record.version == 0
    }

    /// Holds local edits the backend has not accepted yet
    pub fn has_unpushed_edits(&self) -> bool {
        matches!(
            self.record.sync_status,
            SyncStatus::Pending | SyncStatus::Error
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusCounts {
    pub pending: usize,
    pub conflict: usize,
    pub error: usize,
}

/// Result of settling a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Synced,
    /// A newer local write arrived mid-flight; row stays pending on the new base version
    Superseded,
    /// Accepted tombstone, row removed
    Purged,
    /// Row vanished while the push was in flight
    Missing,
}

/// Result of applying one pulled row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Purged,
    /// Local row holds unpushed edits
    SkippedPending,
    /// Remote version is not newer than what we hold
    SkippedStale,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    tables: BTreeMap<String, BTreeMap<String, StoredRow>>,
    /// Per-table pull cursor (max remote `updated_at` applied)
    #[serde(default)]
    cursors: BTreeMap<String, u64>,
}

pub struct LocalStore {
    path: PathBuf,
    workspace_id: String,
    data: StoreFile,
    dirty: bool,
}

impl LocalStore {
    /// Load or create the store for `workspace_id` at `path`.
    pub fn open(path: &Path, workspace_id: &str) -> Result<Self> {
        if workspace_id.trim().is_empty() {
            anyhow::bail!("workspace id must not be empty");
        }
        let data: StoreFile = fsio::read_json_or_default(path)?;
        Ok(LocalStore {
            path: path.to_path_buf(),
            workspace_id: workspace_id.to_string(),
            data,
            dirty: false,
        })
    }

    /// Conventional location: `{data_dir}/{workspace}/records.json`
    pub fn default_path(data_dir: &Path, workspace_id: &str) -> PathBuf {
        data_dir.join(workspace_id).join("records.json")
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(TokioMutex::new(self))
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn get(&self, table: &str, id: &str) -> Option<&SyncableRecord> {
        self.row(table, id).map(|r| &r.record)
    }

    pub fn row(&self, table: &str, id: &str) -> Option<&StoredRow> {
        self.data.tables.get(table).and_then(|t| t.get(id))
    }

    /// Live rows of a table (tombstones excluded)
    pub fn list(&self, table: &str) -> Vec<&SyncableRecord> {
        self.data
            .tables
            .get(table)
            .map(|t| {
                t.values()
                    .map(|r| &r.record)
                    .filter(|r| !r.is_deleted)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Rows with pending edits, in id order
    pub fn pending(&self, table: &str) -> Vec<StoredRow> {
        self.data
            .tables
            .get(table)
            .map(|t| {
                t.values()
                    .filter(|r| r.record.sync_status == SyncStatus::Pending)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for row in self.data.tables.values().flat_map(|t| t.values()) {
            match row.record.sync_status {
                SyncStatus::Pending => counts.pending += 1,
                SyncStatus::Conflict => counts.conflict += 1,
                SyncStatus::Error => counts.error += 1,
                SyncStatus::Synced => {}
            }
        }
        counts
    }

    // ── Feature side ─────────────────────────────────────────────────────────

    /// Create or replace a row's payload. The row becomes pending and any
    /// backoff is reset so the newest payload goes out on the next push.
    pub fn write_payload(
        &mut self,
        table: &str,
        id: &str,
        payload: serde_json::Value,
        now: u64,
    ) -> SyncableRecord {
        let workspace_id = self.workspace_id.clone();
        let rows = self.data.tables.entry(table.to_string()).or_default();
        let row = rows.entry(id.to_string()).or_insert_with(|| StoredRow {
            record: SyncableRecord {
                id: id.to_string(),
                workspace_id,
                version: 0,
                sync_status: SyncStatus::Pending,
                last_synced_at: None,
                is_deleted: false,
                updated_at: now,
                payload: serde_json::Value::Null,
            },
            local_rev: 0,
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
            discarded_fields: Vec::new(),
        });

        row.record.payload = payload;
        row.record.is_deleted = false;
        row.record.updated_at = now;
        row.record.sync_status = SyncStatus::Pending;
        row.local_rev += 1;
        row.attempts = 0;
        row.next_attempt_at = None;
        row.last_error = None;
        row.discarded_fields.clear();
        self.dirty = true;
        row.record.clone()
    }

    /// Mark a row deleted. A row the backend never saw is dropped outright
    /// and `None` is returned, unless `in_flight` says a push may be sending
    /// its create right now; then it stays as a pending tombstone.
    pub fn write_tombstone(
        &mut self,
        table: &str,
        id: &str,
        now: u64,
        in_flight: bool,
    ) -> Option<SyncableRecord> {
        let rows = self.data.tables.get_mut(table)?;
        let unsent = rows.get(id)?.is_unsent();
        if unsent && !in_flight {
            rows.remove(id);
            self.dirty = true;
            return None;
        }

        let row = rows.get_mut(id)?;
        row.record.is_deleted = true;
        row.record.updated_at = now;
        row.record.sync_status = SyncStatus::Pending;
        row.local_rev += 1;
        row.attempts = 0;
        row.next_attempt_at = None;
        row.last_error = None;
        self.dirty = true;
        Some(row.record.clone())
    }

    // ── Engine side ──────────────────────────────────────────────────────────

    /// Settle an accepted push of revision `sent_rev`.
    pub fn mark_synced(
        &mut self,
        table: &str,
        id: &str,
        sent_rev: u64,
        server_version: u64,
        now: u64,
    ) -> MarkOutcome {
        let Some(rows) = self.data.tables.get_mut(table) else {
            return MarkOutcome::Missing;
        };
        let Some(row) = rows.get_mut(id) else {
            return MarkOutcome::Missing;
        };

        self.dirty = true;
        row.record.version = row.record.version.max(server_version);
        row.attempts = 0;
        row.next_attempt_at = None;
        row.last_error = None;

        if row.local_rev != sent_rev {
            return MarkOutcome::Superseded;
        }

        if row.record.is_deleted {
            rows.remove(id);
            return MarkOutcome::Purged;
        }

        row.record.sync_status = SyncStatus::Synced;
        row.record.last_synced_at = Some(now);
        MarkOutcome::Synced
    }

    /// The backend accepted `record` at `server_version` but the row is gone
    /// locally. Queue a tombstone on top of the accepted version so the
    /// remote copy gets deleted too.
    pub fn queue_remote_delete(
        &mut self,
        table: &str,
        record: &SyncableRecord,
        server_version: u64,
        now: u64,
    ) -> SyncableRecord {
        let mut tomb = record.clone();
        tomb.version = server_version;
        tomb.is_deleted = true;
        tomb.updated_at = now;
        tomb.sync_status = SyncStatus::Pending;
        tomb.last_synced_at = None;

        let rows = self.data.tables.entry(table.to_string()).or_default();
        rows.insert(
            tomb.id.clone(),
            StoredRow {
                record: tomb.clone(),
                local_rev: 1,
                attempts: 0,
                next_attempt_at: None,
                last_error: None,
                discarded_fields: Vec::new(),
            },
        );
        self.dirty = true;
        tomb
    }

    /// Replace a row with the resolved remote state after a stale-version
    /// rejection. The row is left in `conflict` and is not re-queued.
    pub fn mark_conflict(
        &mut self,
        table: &str,
        resolved: SyncableRecord,
        discarded_fields: Vec<String>,
        now: u64,
    ) {
        let rows = self.data.tables.entry(table.to_string()).or_default();
        let local_rev = rows.get(&resolved.id).map(|r| r.local_rev).unwrap_or(0);
        let version = rows
            .get(&resolved.id)
            .map(|r| r.record.version)
            .unwrap_or(0)
            .max(resolved.version);

        let mut record = resolved;
        record.version = version;
        record.sync_status = SyncStatus::Conflict;
        record.last_synced_at = Some(now);

        rows.insert(
            record.id.clone(),
            StoredRow {
                record,
                local_rev,
                attempts: 0,
                next_attempt_at: None,
                last_error: None,
                discarded_fields,
            },
        );
        self.dirty = true;
    }

    /// Record a failed push. With `give_up` the row moves to `error`.
    pub fn record_failure(
        &mut self,
        table: &str,
        id: &str,
        attempts: u32,
        next_attempt_at: Option<u64>,
        error: &str,
        give_up: bool,
    ) {
        if let Some(row) = self
            .data
            .tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(id))
        {
            row.attempts = attempts;
            row.next_attempt_at = next_attempt_at;
            row.last_error = Some(error.to_string());
            if give_up {
                row.record.sync_status = SyncStatus::Error;
            }
            self.dirty = true;
        }
    }

    /// Apply one pulled row.
    ///
    /// Rows holding unpushed edits are never overwritten; they reconcile
    /// through the version check on their next push. Versions never go backwards.
    pub fn apply_remote(&mut self, table: &str, remote: SyncableRecord, now: u64) -> ApplyOutcome {
        let rows = self.data.tables.entry(table.to_string()).or_default();

        if let Some(local) = rows.get(&remote.id) {
            if local.has_unpushed_edits() {
                return ApplyOutcome::SkippedPending;
            }
            if remote.version <= local.record.version {
                return ApplyOutcome::SkippedStale;
            }
        }

        if remote.is_deleted {
            let existed = rows.remove(&remote.id).is_some();
            if existed {
                self.dirty = true;
            }
            return ApplyOutcome::Purged;
        }

        let local_rev = rows.get(&remote.id).map(|r| r.local_rev).unwrap_or(0);
        let mut record = remote;
        record.workspace_id = self.workspace_id.clone();
        record.sync_status = SyncStatus::Synced;
        record.last_synced_at = Some(now);
        rows.insert(
            record.id.clone(),
            StoredRow {
                record,
                local_rev,
                attempts: 0,
                next_attempt_at: None,
                last_error: None,
                discarded_fields: Vec::new(),
            },
        );
        self.dirty = true;
        ApplyOutcome::Applied
    }

    /// Put every `error` row back in the push queue. Returns how many.
    pub fn requeue_errored(&mut self) -> usize {
        let mut n = 0;
        for row in self.data.tables.values_mut().flat_map(|t| t.values_mut()) {
            if row.record.sync_status == SyncStatus::Error {
                row.record.sync_status = SyncStatus::Pending;
                row.attempts = 0;
                row.next_attempt_at = None;
                n += 1;
            }
        }
        if n > 0 {
            self.dirty = true;
        }
        n
    }

    /// Re-queue a resolved conflict so its merged payload gets pushed.
    pub fn requeue_conflict(&mut self, table: &str, id: &str) -> bool {
        let Some(row) = self
            .data
            .tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(id))
        else {
            return false;
        };
        if row.record.sync_status != SyncStatus::Conflict {
            return false;
        }
        row.record.sync_status = SyncStatus::Pending;
        row.local_rev += 1;
        row.discarded_fields.clear();
        self.dirty = true;
        true
    }

    pub fn cursor(&self, table: &str) -> Option<u64> {
        self.data.cursors.get(table).copied()
    }

    /// Advance a pull cursor; it never moves backwards.
    pub fn advance_cursor(&mut self, table: &str, updated_at: u64) {
        let cursor = self.data.cursors.entry(table.to_string()).or_insert(0);
        if updated_at > *cursor {
            *cursor = updated_at;
            self.dirty = true;
        }
    }

    /// Earliest pending backoff deadline across all tables (unix millis)
    pub fn next_retry_at(&self) -> Option<u64> {
        self.data
            .tables
            .values()
            .flat_map(|t| t.values())
            .filter(|r| r.record.sync_status == SyncStatus::Pending)
            .filter_map(|r| r.next_attempt_at)
            .min()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Flush dirty changes to disk using an atomic write (write then rename).
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        fsio::write_json_atomic(&self.path, &self.data)?;
        self.dirty = false;
        Ok(())
    }
}

impl Drop for LocalStore {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.flush() {
                tracing::warn!("failed to flush local store on drop: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn remote(id: &str, version: u64, payload: serde_json::Value) -> SyncableRecord {
        SyncableRecord {
            id: id.into(),
            workspace_id: "ws".into(),
            version,
            sync_status: SyncStatus::Synced,
            last_synced_at: None,
            is_deleted: false,
            updated_at: 100 + version,
            payload,
        }
    }

    #[test]
    fn test_write_marks_pending_and_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.json");

        {
            let mut store = LocalStore::open(&path, "ws").unwrap();
            let rec = store.write_payload("products", "p1", json!({"name": "pen"}), 10);
            assert_eq!(rec.sync_status, SyncStatus::Pending);
            assert_eq!(rec.version, 0);
            assert_eq!(rec.workspace_id, "ws");
            store.flush().unwrap();
        }

        let store = LocalStore::open(&path, "ws").unwrap();
        assert_eq!(store.pending("products").len(), 1);
        assert_eq!(store.get("products", "p1").unwrap().payload["name"], "pen");
    }

    #[test]
    fn test_rewrite_coalesces_into_one_row() {
        let dir = tempdir().unwrap();
        let mut store = LocalStore::open(&dir.path().join("s.json"), "ws").unwrap();
        store.write_payload("products", "p1", json!({"n": 1}), 1);
        store.write_payload("products", "p1", json!({"n": 2}), 2);

        let pending = store.pending("products");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].record.payload["n"], 2);
        assert_eq!(pending[0].local_rev, 2);
    }

    #[test]
    fn test_delete_of_unsent_row_drops_it() {
        let dir = tempdir().unwrap();
        let mut store = LocalStore::open(&dir.path().join("s.json"), "ws").unwrap();
        store.write_payload("products", "p1", json!({}), 1);
        assert!(store.write_tombstone("products", "p1", 2, false).is_none());
        assert!(store.row("products", "p1").is_none());
    }

    #[test]
    fn test_delete_of_unsent_row_in_flight_keeps_tombstone() {
        let dir = tempdir().unwrap();
        let mut store = LocalStore::open(&dir.path().join("s.json"), "ws").unwrap();
        store.write_payload("products", "p1", json!({}), 1);
        let sent_rev = store.row("products", "p1").unwrap().local_rev;

        let tomb = store.write_tombstone("products", "p1", 2, true).unwrap();
        assert!(tomb.is_deleted);
        assert!(store.list("products").is_empty());

        // The create lands; the tombstone goes out next on the new base version
        assert_eq!(store.mark_synced("products", "p1", sent_rev, 1, 3), MarkOutcome::Superseded);
        let row = store.row("products", "p1").unwrap();
        assert_eq!(row.record.version, 1);
        assert_eq!(row.record.sync_status, SyncStatus::Pending);
        assert_eq!(store.pending("products").len(), 1);
    }

    #[test]
    fn test_queue_remote_delete_for_vanished_row() {
        let dir = tempdir().unwrap();
        let mut store = LocalStore::open(&dir.path().join("s.json"), "ws").unwrap();
        let rec = store.write_payload("products", "p1", json!({"n": 1}), 1);
        store.write_tombstone("products", "p1", 2, false);

        let tomb = store.queue_remote_delete("products", &rec, 4, 3);
        assert!(tomb.is_deleted);
        assert_eq!(tomb.version, 4);
        let pending = store.pending("products");
        assert_eq!(pending.len(), 1);
        assert!(pending[0].record.is_deleted);
    }

    #[test]
    fn test_tombstone_purged_after_confirmed_push() {
        let dir = tempdir().unwrap();
        let mut store = LocalStore::open(&dir.path().join("s.json"), "ws").unwrap();
        store.apply_remote("products", remote("p1", 3, json!({})), 5);

        let tomb = store.write_tombstone("products", "p1", 6, false).unwrap();
        assert!(tomb.is_deleted);
        assert_eq!(tomb.sync_status, SyncStatus::Pending);
        assert!(store.list("products").is_empty());
        assert!(store.row("products", "p1").is_some(), "kept until confirmed");

        let rev = store.row("products", "p1").unwrap().local_rev;
        assert_eq!(store.mark_synced("products", "p1", rev, 4, 7), MarkOutcome::Purged);
        assert!(store.row("products", "p1").is_none());
    }

    #[test]
    fn test_superseded_push_stays_pending() {
        let dir = tempdir().unwrap();
        let mut store = LocalStore::open(&dir.path().join("s.json"), "ws").unwrap();
        store.write_payload("products", "p1", json!({"n": 1}), 1);
        let sent_rev = store.row("products", "p1").unwrap().local_rev;
        store.write_payload("products", "p1", json!({"n": 2}), 2);

        let out = store.mark_synced("products", "p1", sent_rev, 1, 3);
        assert_eq!(out, MarkOutcome::Superseded);
        let row = store.row("products", "p1").unwrap();
        assert_eq!(row.record.sync_status, SyncStatus::Pending);
        assert_eq!(row.record.version, 1, "adopts the accepted server version");
        assert_eq!(row.record.payload["n"], 2);
    }

    #[test]
    fn test_apply_remote_skips_pending_and_stale() {
        let dir = tempdir().unwrap();
        let mut store = LocalStore::open(&dir.path().join("s.json"), "ws").unwrap();

        store.write_payload("products", "p1", json!({"n": "local"}), 1);
        let out = store.apply_remote("products", remote("p1", 9, json!({"n": "remote"})), 2);
        assert_eq!(out, ApplyOutcome::SkippedPending);
        assert_eq!(store.get("products", "p1").unwrap().payload["n"], "local");

        store.apply_remote("products", remote("p2", 5, json!({"n": 5})), 2);
        let out = store.apply_remote("products", remote("p2", 4, json!({"n": 4})), 3);
        assert_eq!(out, ApplyOutcome::SkippedStale);
        assert_eq!(store.get("products", "p2").unwrap().version, 5);
    }

    #[test]
    fn test_apply_remote_tombstone_purges() {
        let dir = tempdir().unwrap();
        let mut store = LocalStore::open(&dir.path().join("s.json"), "ws").unwrap();
        store.apply_remote("products", remote("p1", 1, json!({})), 1);

        let mut gone = remote("p1", 2, json!({}));
        gone.is_deleted = true;
        assert_eq!(store.apply_remote("products", gone, 2), ApplyOutcome::Purged);
        assert!(store.row("products", "p1").is_none());
    }

    #[test]
    fn test_failure_then_give_up_then_requeue() {
        let dir = tempdir().unwrap();
        let mut store = LocalStore::open(&dir.path().join("s.json"), "ws").unwrap();
        store.write_payload("invoices", "i1", json!({}), 1);

        store.record_failure("invoices", "i1", 1, Some(5_000), "timeout", false);
        assert_eq!(store.next_retry_at(), Some(5_000));
        assert_eq!(store.status_counts().pending, 1);

        store.record_failure("invoices", "i1", 3, None, "timeout", true);
        assert_eq!(store.status_counts().error, 1);
        assert!(store.pending("invoices").is_empty());

        assert_eq!(store.requeue_errored(), 1);
        assert_eq!(store.pending("invoices").len(), 1);
        assert_eq!(store.pending("invoices")[0].attempts, 0);
    }

    #[test]
    fn test_cursor_is_monotonic() {
        let dir = tempdir().unwrap();
        let mut store = LocalStore::open(&dir.path().join("s.json"), "ws").unwrap();
        assert_eq!(store.cursor("products"), None);
        store.advance_cursor("products", 50);
        store.advance_cursor("products", 20);
        assert_eq!(store.cursor("products"), Some(50));
    }

    #[test]
    fn test_empty_workspace_rejected() {
        let dir = tempdir().unwrap();
        assert!(LocalStore::open(&dir.path().join("s.json"), " ").is_err());
    }

    #[test]
    fn test_flush_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/records.json");
        {
            let mut store = LocalStore::open(&path, "ws").unwrap();
            store.write_payload("products", "p1", json!({}), 1);
        }
        assert!(path.exists());
    }
}
