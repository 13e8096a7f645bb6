//! AssetSyncManager: converges this device's asset directory with the
//! workspace manifest.
//!
//! One cycle: idle → scanning → {uploading | downloading}* → {success | error}
//! → idle (after the display window). Cycles are single-flight; a `scan()`
//! made while one runs attaches to it. Every transfer tries the peer path
//! first and falls back to the cloud store.

use asaas_core::bus::{EventBus, Subscription};
use asaas_core::error::{AsaasError, AsaasResult};
use asaas_core::flight::SingleFlight;
use asaas_core::types::{AssetDescriptor, AssetProgress, AssetStatus, ConnectionEvent};
use asaas_core::unix_now;
use opendal::Operator;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cloud::CloudAssetStore;
use crate::local::{hash_bytes, validate_key, LocalAssetDir};
use crate::manifest::{diff, AssetAction, AssetManifest};
use crate::peer::{PeerSession, PeerTransport};

/// What one scan cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub uploaded: Vec<String>,
    pub downloaded: Vec<String>,
    /// Transfers that went over the peer network
    pub via_peer: usize,
    /// (key, reason) for every transfer that failed
    pub failed: Vec<(String, String)>,
}

impl ScanReport {
    pub fn transfers(&self) -> usize {
        self.uploaded.len() + self.downloaded.len()
    }
}

pub struct AssetSyncManager {
    op: Operator,
    local_root: PathBuf,
    device_id: String,
    peers: Arc<dyn PeerTransport>,
    display_window: Duration,
    session: Mutex<Option<PeerSession>>,
    initial_sync: AtomicBool,
    progress: watch::Sender<AssetProgress>,
    events: EventBus<AssetProgress>,
    reports: EventBus<ScanReport>,
    flight: SingleFlight<ScanReport>,
    /// Held for the duration of any transfer; at most one at a time
    transfer_lock: TokioMutex<()>,
    /// Bumped on every status change; a pending return-to-idle only fires if unchanged
    status_gen: AtomicU64,
}

impl AssetSyncManager {
    pub fn new(
        op: Operator,
        local_root: impl Into<PathBuf>,
        device_id: impl Into<String>,
        peers: Arc<dyn PeerTransport>,
        display_window: Duration,
    ) -> Arc<Self> {
        let (progress, _) = watch::channel(AssetProgress {
            is_initial_sync: true,
            ..Default::default()
        });
        Arc::new(Self {
            op,
            local_root: local_root.into(),
            device_id: device_id.into(),
            peers,
            display_window,
            session: Mutex::new(None),
            initial_sync: AtomicBool::new(true),
            progress,
            events: EventBus::new("asset-progress"),
            reports: EventBus::new("asset-scans"),
            flight: SingleFlight::new(),
            transfer_lock: TokioMutex::new(()),
            status_gen: AtomicU64::new(0),
        })
    }

    /// Join the workspace's peer network. Repeating the call with the same
    /// parameters does nothing; switching workspace starts a new initial sync.
    pub async fn initialize(
        &self,
        user_id: &str,
        workspace_id: &str,
        session_id: &str,
    ) -> AsaasResult<()> {
        if workspace_id.trim().is_empty() {
            return Err(AsaasError::Validation("workspace id must not be empty".into()));
        }
        let session = PeerSession {
            user_id: user_id.to_string(),
            workspace_id: workspace_id.to_string(),
            session_id: session_id.to_string(),
            device_id: self.device_id.clone(),
        };

        {
            let mut current = self
                .session
                .lock()
                .map_err(|_| anyhow::anyhow!("asset session lock poisoned"))?;
            if current.as_ref() == Some(&session) {
                return Ok(());
            }
            let switched = current
                .as_ref()
                .is_some_and(|c| c.workspace_id != session.workspace_id);
            if switched {
                self.initial_sync.store(true, Ordering::SeqCst);
                self.progress.send_modify(|p| p.is_initial_sync = true);
            }
            *current = Some(session.clone());
        }

        if let Err(e) = self.peers.join(&session).await {
            warn!(workspace = workspace_id, "peer network unavailable, cloud only: {e}");
        }
        info!(workspace = workspace_id, device = %self.device_id, "asset sync initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.session.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    /// True until the first cycle that reaches manifest parity for the workspace.
    pub fn is_initial_sync(&self) -> bool {
        self.initial_sync.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> AssetProgress {
        self.progress.borrow().clone()
    }

    pub fn watch_progress(&self) -> watch::Receiver<AssetProgress> {
        self.progress.subscribe()
    }

    /// One report per completed scan cycle
    pub fn subscribe_reports(&self) -> Subscription<ScanReport> {
        self.reports.subscribe()
    }

    /// Every progress transition, in order.
    pub fn subscribe_progress(&self) -> Subscription<AssetProgress> {
        self.events.subscribe()
    }

    fn context(&self) -> AsaasResult<(LocalAssetDir, CloudAssetStore)> {
        let ws = self
            .session
            .lock()
            .ok()
            .and_then(|s| s.as_ref().map(|s| s.workspace_id.clone()))
            .ok_or_else(|| AsaasError::Validation("asset sync not initialized".into()))?;
        Ok((
            LocalAssetDir::new(self.local_root.join(&ws), self.device_id.clone()),
            CloudAssetStore::new(self.op.clone(), &ws),
        ))
    }

    /// Path of the local asset directory for the current workspace.
    pub fn local_dir(&self) -> AsaasResult<PathBuf> {
        Ok(self.context()?.0.root().to_path_buf())
    }

    // ── Cycles ───────────────────────────────────────────────────────────────

    /// Diff local against the workspace manifest and run the transfers.
    /// Individual transfer failures are reported, not returned as `Err`.
    pub async fn scan(self: &Arc<Self>) -> AsaasResult<ScanReport> {
        self.context()?;
        let this = Arc::clone(self);
        self.flight
            .run(move || async move { this.run_scan().await })
            .await
    }

    async fn run_scan(self: &Arc<Self>) -> AsaasResult<ScanReport> {
        let _transfer = self.transfer_lock.lock().await;
        let (local, cloud) = self.context()?;
        self.set_status(AssetStatus::Scanning, None, None);

        let local_manifest = match local.scan().await {
            Ok(found) => AssetManifest::from_descriptors(found),
            Err(e) => return Err(self.fail(None, e)),
        };
        let mut remote = match cloud.read_manifest().await {
            Ok(m) => m,
            Err(e) => return Err(self.fail(None, e)),
        };

        let actions = diff(&local_manifest, &remote);
        debug!(
            local = local_manifest.len(),
            remote = remote.len(),
            actions = actions.len(),
            "asset scan"
        );

        let mut report = ScanReport::default();
        let mut manifest_dirty = false;
        for action in actions {
            let key = action.key().to_string();
            match action {
                AssetAction::Upload(asset) => {
                    self.set_status(AssetStatus::Uploading, Some(&key), None);
                    match self.upload(&local, &cloud, &asset).await {
                        Ok(via_peer) => {
                            remote.upsert(asset);
                            manifest_dirty = true;
                            report.via_peer += usize::from(via_peer);
                            report.uploaded.push(key);
                        }
                        Err(e) => {
                            warn!(key = %key, "asset upload failed: {e}");
                            report.failed.push((key, e.to_string()));
                        }
                    }
                }
                AssetAction::Download(asset) => {
                    self.set_status(AssetStatus::Downloading, Some(&key), None);
                    match self.download(&local, &cloud, &asset).await {
                        Ok(via_peer) => {
                            report.via_peer += usize::from(via_peer);
                            report.downloaded.push(key);
                        }
                        Err(e) => {
                            warn!(key = %key, "asset download failed: {e}");
                            report.failed.push((key, e.to_string()));
                        }
                    }
                }
            }
        }

        if manifest_dirty {
            remote.written_by = self.device_id.clone();
            remote.written_at = unix_now();
            if let Err(e) = cloud.write_manifest(&remote).await {
                warn!("asset manifest update failed: {e}");
                report.failed.push(("manifest.json".to_string(), e.to_string()));
            }
        }

        self.reports.emit(report.clone());
        if let Some((file, reason)) = report.failed.first() {
            self.set_status(AssetStatus::Error, Some(file), Some(reason));
            self.schedule_idle();
            return Ok(report);
        }

        if self.initial_sync.swap(false, Ordering::SeqCst) {
            info!("initial asset sync complete");
        }
        if report.transfers() > 0 {
            info!(
                uploaded = report.uploaded.len(),
                downloaded = report.downloaded.len(),
                via_peer = report.via_peer,
                "asset sync complete"
            );
            self.set_status(AssetStatus::Success, None, None);
            self.schedule_idle();
        } else {
            self.set_status(AssetStatus::Idle, None, None);
        }
        Ok(report)
    }

    /// Write an asset locally, then sync it out.
    pub async fn store_asset(self: &Arc<Self>, key: &str, data: &[u8]) -> AsaasResult<ScanReport> {
        let (local, _) = self.context()?;
        local.write(key, data, None).await?;
        if self.flight.is_running() {
            // The running cycle may have listed the directory before this write
            if let Err(e) = self.scan().await {
                debug!("in-flight asset scan failed: {e}");
            }
        }
        self.scan().await
    }

    /// Make sure a known asset is present locally, downloading just that one.
    pub async fn ensure_local(self: &Arc<Self>, key: &str) -> AsaasResult<PathBuf> {
        validate_key(key)?;
        let (local, cloud) = self.context()?;
        let path = local.path_for(key)?;
        if local.exists(key).await {
            return Ok(path);
        }

        let _transfer = self.transfer_lock.lock().await;
        if local.exists(key).await {
            return Ok(path);
        }
        let manifest = cloud.read_manifest().await?;
        let asset = manifest
            .get(key)
            .cloned()
            .ok_or_else(|| AsaasError::Validation(format!("unknown asset: {key}")))?;

        self.set_status(AssetStatus::Downloading, Some(key), None);
        match self.download(&local, &cloud, &asset).await {
            Ok(_) => {
                self.set_status(AssetStatus::Success, None, None);
                self.schedule_idle();
                Ok(path)
            }
            Err(e) => Err(self.fail(Some(key), e)),
        }
    }

    // ── Transfers ────────────────────────────────────────────────────────────

    /// Offer the asset to peers, then always store it in the cloud. Returns
    /// true when a peer took a copy.
    async fn upload(
        &self,
        local: &LocalAssetDir,
        cloud: &CloudAssetStore,
        asset: &AssetDescriptor,
    ) -> AsaasResult<bool> {
        let data = local.read(&asset.key).await.map_err(|e| transfer_error(&asset.key, e))?;
        if hash_bytes(&data) != asset.hash {
            return Err(transfer_error(&asset.key, "file changed during scan"));
        }

        let via_peer = match self.peers.offer(asset, &data).await {
            Ok(taken) => taken,
            Err(e) => {
                debug!(key = %asset.key, "peer offer failed: {e}");
                false
            }
        };
        // The manifest points every device at the cloud copy
        cloud.put(&asset.key, data).await?;
        debug!(key = %asset.key, via_peer, "asset uploaded");
        Ok(via_peer)
    }

    /// Returns true when a peer supplied the asset.
    async fn download(
        &self,
        local: &LocalAssetDir,
        cloud: &CloudAssetStore,
        asset: &AssetDescriptor,
    ) -> AsaasResult<bool> {
        let from_peer = match self.peers.fetch(asset).await {
            Ok(found) => found,
            Err(e) => {
                debug!(key = %asset.key, "peer fetch failed, using cloud: {e}");
                None
            }
        };
        let via_peer = from_peer.is_some();
        let data = match from_peer {
            Some(data) => data,
            None => cloud.get(&asset.key).await?,
        };

        if hash_bytes(&data) != asset.hash {
            return Err(transfer_error(&asset.key, "content hash does not match manifest"));
        }
        local
            .write(&asset.key, &data, Some(asset.modified_at))
            .await
            .map_err(|e| transfer_error(&asset.key, e))?;
        Ok(via_peer)
    }

    // ── Progress ─────────────────────────────────────────────────────────────

    fn set_status(&self, status: AssetStatus, file: Option<&str>, error: Option<&str>) {
        self.status_gen.fetch_add(1, Ordering::SeqCst);
        let progress = AssetProgress {
            status,
            current_file: file.map(str::to_string),
            error: error.map(str::to_string),
            is_initial_sync: self.initial_sync.load(Ordering::SeqCst),
        };
        self.progress.send_replace(progress.clone());
        self.events.emit(progress);
    }

    fn fail(self: &Arc<Self>, file: Option<&str>, err: AsaasError) -> AsaasError {
        warn!(file = file.unwrap_or("-"), "asset sync failed: {err}");
        self.set_status(AssetStatus::Error, file, Some(&err.to_string()));
        self.schedule_idle();
        err
    }

    /// Return to idle once the display window passes, unless something else
    /// changed the status first.
    fn schedule_idle(self: &Arc<Self>) {
        if self.display_window.is_zero() {
            self.set_status(AssetStatus::Idle, None, None);
            return;
        }
        let generation = self.status_gen.load(Ordering::SeqCst);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.display_window).await;
            if this.status_gen.load(Ordering::SeqCst) == generation {
                this.set_status(AssetStatus::Idle, None, None);
            }
        });
    }

    // ── Driver ───────────────────────────────────────────────────────────────

    /// Scan on reconnect, on wake and every `watch_interval` until cancelled.
    pub async fn run(
        self: Arc<Self>,
        mut events: Subscription<ConnectionEvent>,
        watch_interval: Option<Duration>,
        cancel: CancellationToken,
    ) {
        let mut ticker = watch_interval.map(|d| {
            let mut iv = tokio::time::interval_at(tokio::time::Instant::now() + d, d);
            iv.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            iv
        });

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    None => break,
                    Some(ConnectionEvent::Online) => self.spawn_scan("online"),
                    Some(ConnectionEvent::Wake { .. }) => self.spawn_scan("wake"),
                    Some(_) => {}
                },
                _ = async {
                    match ticker.as_mut() {
                        Some(iv) => { iv.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => self.spawn_scan("interval"),
            }
        }
        debug!("asset watcher stopped");
    }

    fn spawn_scan(self: &Arc<Self>, reason: &'static str) {
        if !self.is_initialized() {
            debug!(reason, "asset scan skipped, not initialized");
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.scan().await {
                warn!(reason, "asset scan failed: {e}");
            }
        });
    }
}

fn transfer_error(key: &str, reason: impl std::fmt::Display) -> AsaasError {
    AsaasError::AssetTransfer {
        file: key.to_string(),
        reason: reason.to_string(),
    }
}
