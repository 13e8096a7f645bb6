//! Sync engine: drains local mutations to the backend and pulls remote deltas.
//!
//! `write()` only touches the local store and nudges the driver; network work
//! happens in `push()` / `pull()` / `sync()`. `sync()` is single-flight: a
//! call made while a round is running attaches to that round. `push()` is
//! serialized on its own lock so a write-triggered push never overlaps the
//! push phase of a sync round.

use asaas_core::bus::{EventBus, Subscription};
use asaas_core::config::SyncConfig;
use asaas_core::error::{AsaasError, AsaasResult};
use asaas_core::flight::SingleFlight;
use asaas_core::types::{ConnectionEvent, RecordDraft, SyncStatusSnapshot, SyncableRecord};
use asaas_core::{unix_now, unix_now_millis};
use asaas_state::{ApplyOutcome, MarkOutcome, SharedStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as TokioMutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conflict::{resolve_last_write_wins, ConflictNotice, MergePolicy};
use crate::remote::{RemoteBackendClient, UpsertOutcome};
use crate::retry::RetryPolicy;

const RETRY_POLL_FLOOR: Duration = Duration::from_millis(100);

/// Counters for one push pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub pushed: usize,
    /// Accepted, but a newer local write is already queued behind it
    pub superseded: usize,
    pub conflicts: usize,
    /// Transient failure, will retry after backoff
    pub retrying: usize,
    /// Out of attempts or rejected; row is in `error`
    pub failed: usize,
    /// Still inside its backoff window, not attempted
    pub deferred: usize,
}

/// Counters for one pull of one table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    pub applied: usize,
    pub purged: usize,
    pub skipped_pending: usize,
    pub skipped_stale: usize,
}

/// Outcome of a full `sync()` round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub push: PushReport,
    pub pulled: usize,
    pub purged: usize,
    pub skipped_pending: usize,
    /// Tables whose pull failed this round (retried on the next trigger)
    pub pull_errors: Vec<String>,
    /// Engine was offline; nothing was attempted
    pub skipped_offline: bool,
}

/// How the driver loop reacts to triggers
#[derive(Debug, Clone)]
pub struct TriggerConfig {
    /// Wait after `online` before syncing, to let the link settle
    pub online_settle: Duration,
    /// Periodic full sync; `None` disables it
    pub pull_interval: Option<Duration>,
}

impl TriggerConfig {
    pub fn from_config(cfg: &SyncConfig) -> Self {
        Self {
            online_settle: Duration::from_millis(cfg.online_settle_ms),
            pull_interval: (cfg.pull_interval_secs > 0)
                .then(|| Duration::from_secs(cfg.pull_interval_secs)),
        }
    }
}

pub struct SyncEngine {
    workspace_id: String,
    tables: Vec<String>,
    store: SharedStore,
    remote: Arc<dyn RemoteBackendClient>,
    retry: RetryPolicy,
    merge: MergePolicy,
    flight: SingleFlight<SyncReport>,
    push_lock: TokioMutex<()>,
    push_wanted: Notify,
    online: AtomicBool,
    status: watch::Sender<SyncStatusSnapshot>,
    notices: EventBus<ConflictNotice>,
    reports: EventBus<SyncReport>,
    pushes: EventBus<PushReport>,
}

impl SyncEngine {
    pub fn new(
        workspace_id: impl Into<String>,
        tables: Vec<String>,
        store: SharedStore,
        remote: Arc<dyn RemoteBackendClient>,
        retry: RetryPolicy,
        merge: MergePolicy,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(SyncStatusSnapshot {
            is_online: true,
            ..Default::default()
        });
        Arc::new(Self {
            workspace_id: workspace_id.into(),
            tables,
            store,
            remote,
            retry,
            merge,
            flight: SingleFlight::new(),
            push_lock: TokioMutex::new(()),
            push_wanted: Notify::new(),
            online: AtomicBool::new(true),
            status,
            notices: EventBus::new("sync-conflicts"),
            reports: EventBus::new("sync-reports"),
            pushes: EventBus::new("sync-pushes"),
        })
    }

    pub fn from_config(
        workspace_id: impl Into<String>,
        cfg: &SyncConfig,
        store: SharedStore,
        remote: Arc<dyn RemoteBackendClient>,
    ) -> Arc<Self> {
        Self::new(
            workspace_id,
            cfg.tables.clone(),
            store,
            remote,
            RetryPolicy::from_config(cfg),
            MergePolicy::new(&cfg.mergeable),
        )
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    /// Sync-status snapshots; the receiver sees every change.
    pub fn status(&self) -> watch::Receiver<SyncStatusSnapshot> {
        self.status.subscribe()
    }

    pub fn subscribe_conflicts(&self) -> Subscription<ConflictNotice> {
        self.notices.subscribe()
    }

    pub fn subscribe_reports(&self) -> Subscription<SyncReport> {
        self.reports.subscribe()
    }

    /// Every push pass that did something, whether part of a round or not
    pub fn subscribe_pushes(&self) -> Subscription<PushReport> {
        self.pushes.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        self.status.send_if_modified(|s| {
            let changed = s.is_online != online;
            s.is_online = online;
            changed
        });
    }

    // ── Local API ────────────────────────────────────────────────────────────

    pub async fn get(&self, table: &str, id: &str) -> Option<SyncableRecord> {
        self.store.lock().await.get(table, id).cloned()
    }

    pub async fn list(&self, table: &str) -> Vec<SyncableRecord> {
        self.store
            .lock()
            .await
            .list(table)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Validate, persist locally as pending and queue for push. Never waits
    /// on the network.
    pub async fn write(&self, table: &str, draft: RecordDraft) -> AsaasResult<SyncableRecord> {
        self.check_table(table)?;
        if !draft.payload.is_object() {
            return Err(AsaasError::Validation(format!(
                "{table}: payload must be a JSON object"
            )));
        }
        let id = match draft.id {
            Some(id) => {
                validate_id(&id)?;
                id
            }
            None => uuid::Uuid::new_v4().to_string(),
        };

        let record = {
            let mut store = self.store.lock().await;
            let record = store.write_payload(table, &id, draft.payload, unix_now());
            store.flush()?;
            record
        };

        debug!(table, id = %record.id, "local write queued");
        self.publish_status().await;
        self.push_wanted.notify_one();
        Ok(record)
    }

    /// Tombstone a row. Returns false if the row does not exist.
    pub async fn delete(&self, table: &str, id: &str) -> AsaasResult<bool> {
        self.check_table(table)?;
        let existed = {
            let mut store = self.store.lock().await;
            if store.row(table, id).is_none() {
                return Ok(false);
            }
            // A held push lock means this row's create may already be on the wire
            let in_flight = self.push_lock.try_lock().is_err();
            store.write_tombstone(table, id, unix_now(), in_flight);
            store.flush()?;
            true
        };

        debug!(table, id, "local delete queued");
        self.publish_status().await;
        self.push_wanted.notify_one();
        Ok(existed)
    }

    /// Re-queue every row in `error` (explicit user retry).
    pub async fn retry_errored(&self) -> AsaasResult<usize> {
        let n = {
            let mut store = self.store.lock().await;
            let n = store.requeue_errored();
            store.flush()?;
            n
        };
        if n > 0 {
            info!(rows = n, "re-queued errored rows");
            self.publish_status().await;
            self.push_wanted.notify_one();
        }
        Ok(n)
    }

    /// Accept a resolved conflict and push its merged payload.
    pub async fn accept_conflict(&self, table: &str, id: &str) -> AsaasResult<bool> {
        let requeued = {
            let mut store = self.store.lock().await;
            let requeued = store.requeue_conflict(table, id);
            store.flush()?;
            requeued
        };
        if requeued {
            self.publish_status().await;
            self.push_wanted.notify_one();
        }
        Ok(requeued)
    }

    // ── Network API ──────────────────────────────────────────────────────────

    /// Upsert every pending row whose backoff window has passed.
    pub async fn push(&self) -> AsaasResult<PushReport> {
        let _guard = self.push_lock.lock().await;
        let mut report = PushReport::default();

        for table in &self.tables {
            let rows = self.store.lock().await.pending(table);
            for row in rows {
                let now_ms = unix_now_millis();
                if row.next_attempt_at.is_some_and(|t| t > now_ms) {
                    report.deferred += 1;
                    continue;
                }

                let id = row.record.id.clone();
                let base_version = row.record.version;
                match self.remote.upsert(table, &row.record, base_version).await {
                    Ok(UpsertOutcome::Accepted { version, .. }) => {
                        let outcome = self.store.lock().await.mark_synced(
                            table,
                            &id,
                            row.local_rev,
                            version,
                            unix_now(),
                        );
                        match outcome {
                            MarkOutcome::Superseded => report.superseded += 1,
                            MarkOutcome::Missing if !row.record.is_deleted => {
                                // Deleted locally while the create was in flight
                                self.store.lock().await.queue_remote_delete(
                                    table,
                                    &row.record,
                                    version,
                                    unix_now(),
                                );
                                report.superseded += 1;
                            }
                            MarkOutcome::Missing => {}
                            MarkOutcome::Synced | MarkOutcome::Purged => report.pushed += 1,
                        }
                        debug!(table, id = %id, version, ?outcome, "pushed");
                    }
                    Ok(UpsertOutcome::Stale { current }) => {
                        self.settle_conflict(table, &row.record, row.local_rev, current).await;
                        report.conflicts += 1;
                    }
                    Err(e) if e.is_authorization() => {
                        warn!(table, id = %id, "push rejected: {e}");
                        self.store.lock().await.flush()?;
                        self.publish_status().await;
                        return Err(e);
                    }
                    Err(e) if e.is_transient() => {
                        let attempts = row.attempts + 1;
                        let mut store = self.store.lock().await;
                        if self.retry.exhausted(attempts) {
                            warn!(table, id = %id, attempts, "push failed, giving up: {e}");
                            store.record_failure(table, &id, attempts, None, &e.to_string(), true);
                            report.failed += 1;
                        } else {
                            let delay = self.retry.delay_for_attempt(attempts);
                            let next = now_ms + delay.as_millis() as u64;
                            debug!(table, id = %id, attempts, ?delay, "push failed, will retry: {e}");
                            store.record_failure(table, &id, attempts, Some(next), &e.to_string(), false);
                            report.retrying += 1;
                        }
                    }
                    Err(e) => {
                        warn!(table, id = %id, "push rejected: {e}");
                        self.store.lock().await.record_failure(
                            table,
                            &id,
                            row.attempts + 1,
                            None,
                            &e.to_string(),
                            true,
                        );
                        report.failed += 1;
                    }
                }
            }
        }

        self.store.lock().await.flush()?;
        self.publish_status().await;

        if report != PushReport::default() {
            info!(
                pushed = report.pushed,
                conflicts = report.conflicts,
                retrying = report.retrying,
                failed = report.failed,
                "push complete"
            );
            self.pushes.emit(report.clone());
        }
        Ok(report)
    }

    async fn settle_conflict(
        &self,
        table: &str,
        sent: &SyncableRecord,
        sent_rev: u64,
        current: SyncableRecord,
    ) {
        let mut store = self.store.lock().await;
        let superseded_local_edit = store
            .row(table, &sent.id)
            .is_some_and(|r| r.local_rev != sent_rev);
        // Resolve against the newest local edit, which may have replaced `sent`
        let local = store
            .get(table, &sent.id)
            .cloned()
            .unwrap_or_else(|| sent.clone());
        let resolution = resolve_last_write_wins(&local, &current, &self.merge.mergeable(table));
        let now = unix_now();

        let notice = ConflictNotice {
            table: table.to_string(),
            id: sent.id.clone(),
            local_version: local.version,
            remote_version: current.version,
            merged_fields: resolution.merged_fields.clone(),
            discarded_fields: resolution.discarded_fields.clone(),
            superseded_local_edit,
            detected_at: now,
        };
        store.mark_conflict(table, resolution.record, resolution.discarded_fields, now);
        drop(store);

        warn!(
            table,
            id = %notice.id,
            local_version = notice.local_version,
            remote_version = notice.remote_version,
            discarded = ?notice.discarded_fields,
            superseded = notice.superseded_local_edit,
            "version conflict resolved last-write-wins"
        );
        self.notices.emit(notice);
    }

    /// Fetch rows of `table` updated after `since` and apply them. Rows with
    /// unpushed local edits are left alone.
    pub async fn pull(&self, table: &str, since: Option<u64>) -> AsaasResult<PullReport> {
        self.check_table(table)?;
        let rows = self
            .remote
            .fetch_since(table, &self.workspace_id, since)
            .await?;

        let mut report = PullReport::default();
        let mut store = self.store.lock().await;
        let now = unix_now();
        let mut max_seen = None;

        for row in rows {
            if row.workspace_id != self.workspace_id {
                warn!(table, id = %row.id, workspace = %row.workspace_id, "ignoring row from another workspace");
                continue;
            }
            max_seen = max_seen.max(Some(row.updated_at));
            match store.apply_remote(table, row, now) {
                ApplyOutcome::Applied => report.applied += 1,
                ApplyOutcome::Purged => report.purged += 1,
                ApplyOutcome::SkippedPending => report.skipped_pending += 1,
                ApplyOutcome::SkippedStale => report.skipped_stale += 1,
            }
        }

        if let Some(cursor) = max_seen {
            store.advance_cursor(table, cursor);
        }
        store.flush()?;
        drop(store);

        debug!(table, applied = report.applied, skipped_pending = report.skipped_pending, "pulled");
        self.publish_status().await;
        Ok(report)
    }

    /// Push then pull every table. Concurrent callers share one round.
    pub async fn sync(self: &Arc<Self>) -> AsaasResult<SyncReport> {
        if !self.is_online() {
            debug!("offline, sync skipped");
            return Ok(SyncReport {
                skipped_offline: true,
                ..Default::default()
            });
        }

        let this = Arc::clone(self);
        self.flight
            .run(move || async move {
                this.set_syncing(true);
                let result = this.round().await;
                this.finish_round(&result).await;
                result
            })
            .await
    }

    async fn round(&self) -> AsaasResult<SyncReport> {
        let push = self.push().await?;
        let mut report = SyncReport {
            push,
            ..Default::default()
        };

        for table in &self.tables {
            let since = self.store.lock().await.cursor(table);
            match self.pull(table, since).await {
                Ok(pulled) => {
                    report.pulled += pulled.applied;
                    report.purged += pulled.purged;
                    report.skipped_pending += pulled.skipped_pending;
                }
                Err(e) if e.is_authorization() => return Err(e),
                Err(e) => {
                    warn!(table = %table, "pull failed, retrying on next trigger: {e}");
                    report.pull_errors.push(table.clone());
                }
            }
        }
        Ok(report)
    }

    async fn finish_round(&self, result: &AsaasResult<SyncReport>) {
        let now = unix_now();
        self.status.send_modify(|s| {
            s.is_syncing = false;
            match result {
                Ok(_) => {
                    s.last_sync_time = Some(now);
                    s.last_error = None;
                }
                Err(e) => s.last_error = Some(e.to_string()),
            }
        });
        self.publish_status().await;

        match result {
            Ok(report) => {
                info!(
                    pushed = report.push.pushed,
                    pulled = report.pulled,
                    conflicts = report.push.conflicts,
                    pull_errors = report.pull_errors.len(),
                    "sync round complete"
                );
                self.reports.emit(report.clone());
            }
            Err(e) => warn!("sync round failed: {e}"),
        }
    }

    fn set_syncing(&self, syncing: bool) {
        self.status.send_if_modified(|s| {
            let changed = s.is_syncing != syncing;
            s.is_syncing = syncing;
            changed
        });
    }

    async fn publish_status(&self) {
        let counts = self.store.lock().await.status_counts();
        self.status.send_if_modified(|s| {
            let changed = s.pending_count != counts.pending
                || s.conflict_count != counts.conflict
                || s.error_count != counts.error;
            s.pending_count = counts.pending;
            s.conflict_count = counts.conflict;
            s.error_count = counts.error;
            changed
        });
    }

    fn check_table(&self, table: &str) -> AsaasResult<()> {
        if self.tables.iter().any(|t| t == table) {
            Ok(())
        } else {
            Err(AsaasError::Validation(format!("unknown table: {table}")))
        }
    }

    // ── Driver ───────────────────────────────────────────────────────────────

    /// React to connectivity events, local writes, backoff deadlines and the
    /// periodic pull until `cancel` fires. Every trigger is fire-and-forget.
    pub async fn run(
        self: Arc<Self>,
        mut events: Subscription<ConnectionEvent>,
        triggers: TriggerConfig,
        cancel: CancellationToken,
    ) {
        let mut settle_at: Option<tokio::time::Instant> = None;
        let mut periodic = triggers.pull_interval.map(|d| {
            let mut iv = tokio::time::interval_at(tokio::time::Instant::now() + d, d);
            iv.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            iv
        });

        loop {
            let retry_at = if self.is_online() {
                self.next_retry_instant().await
            } else {
                None
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    None => break,
                    Some(ConnectionEvent::Online) => {
                        self.set_online(true);
                        settle_at = Some(tokio::time::Instant::now() + triggers.online_settle);
                    }
                    Some(ConnectionEvent::Offline) => {
                        self.set_online(false);
                        settle_at = None;
                    }
                    Some(ConnectionEvent::Wake { idle_secs }) => {
                        // Notifications missed while suspended can't be assumed delivered
                        info!(idle_secs, "wake detected, forcing full sync");
                        self.spawn_sync("wake");
                    }
                    Some(ConnectionEvent::Heartbeat { .. }) => {}
                },
                _ = self.push_wanted.notified() => self.spawn_push(),
                _ = sleep_until_opt(settle_at) => {
                    settle_at = None;
                    self.spawn_sync("online");
                }
                _ = sleep_until_opt(retry_at) => self.spawn_push(),
                _ = tick_opt(periodic.as_mut()) => self.spawn_sync("interval"),
            }
        }
        debug!("sync driver stopped");
    }

    fn spawn_sync(self: &Arc<Self>, reason: &'static str) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            debug!(reason, "sync triggered");
            if let Err(e) = this.sync().await {
                warn!(reason, "triggered sync failed: {e}");
            }
        });
    }

    fn spawn_push(self: &Arc<Self>) {
        if !self.is_online() {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.push().await {
                warn!("triggered push failed: {e}");
            }
        });
    }

    /// Next backoff deadline, never sooner than `RETRY_POLL_FLOOR` so an
    /// overdue row can't spin the loop while its push is in flight.
    async fn next_retry_instant(&self) -> Option<tokio::time::Instant> {
        let at_ms = self.store.lock().await.next_retry_at()?;
        let wait = Duration::from_millis(at_ms.saturating_sub(unix_now_millis()));
        Some(tokio::time::Instant::now() + wait.max(RETRY_POLL_FLOOR))
    }
}

fn validate_id(id: &str) -> AsaasResult<()> {
    if id.trim().is_empty() {
        return Err(AsaasError::Validation("record id must not be empty".into()));
    }
    if id.contains(['/', '?', '#']) {
        return Err(AsaasError::Validation(format!("record id has reserved characters: {id:?}")));
    }
    Ok(())
}

async fn sleep_until_opt(at: Option<tokio::time::Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(iv: Option<&mut tokio::time::Interval>) {
    match iv {
        Some(iv) => {
            iv.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_id() {
        assert!(validate_id("abc-123").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("a/b").is_err());
    }

    #[test]
    fn test_trigger_config_disables_zero_interval() {
        let cfg = SyncConfig {
            pull_interval_secs: 0,
            ..Default::default()
        };
        assert!(TriggerConfig::from_config(&cfg).pull_interval.is_none());
    }
}
