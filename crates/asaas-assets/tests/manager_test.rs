//! Two devices converging through a shared in-memory object store.

use async_trait::async_trait;
use asaas_assets::{AssetManifest, AssetSyncManager, CloudAssetStore, NoPeers, PeerSession, PeerTransport};
use asaas_core::error::{AsaasError, AsaasResult};
use asaas_core::types::{AssetDescriptor, AssetProgress, AssetStatus};
use opendal::Operator;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const WS: &str = "ws-assets";

fn device(op: &Operator, root: &TempDir, name: &str, peers: Arc<dyn PeerTransport>) -> Arc<AssetSyncManager> {
    AssetSyncManager::new(op.clone(), root.path().join(name), name, peers, Duration::ZERO)
}

fn drain(sub: &mut asaas_core::bus::Subscription<AssetProgress>) -> Vec<AssetProgress> {
    let mut out = Vec::new();
    while let Some(p) = sub.try_recv() {
        out.push(p);
    }
    out
}

fn statuses(events: &[AssetProgress]) -> Vec<AssetStatus> {
    events.iter().map(|p| p.status).collect()
}

/// Peer stand-in that counts joins and can fail every fetch
#[derive(Default)]
struct CountingPeers {
    joins: AtomicUsize,
    fail_fetch: bool,
}

#[async_trait]
impl PeerTransport for CountingPeers {
    async fn join(&self, _session: &PeerSession) -> AsaasResult<()> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch(&self, asset: &AssetDescriptor) -> AsaasResult<Option<Vec<u8>>> {
        if self.fail_fetch {
            return Err(AsaasError::TransientNetwork(format!("peer dropped while sending {}", asset.key)));
        }
        Ok(None)
    }

    async fn offer(&self, _asset: &AssetDescriptor, _data: &[u8]) -> AsaasResult<bool> {
        Ok(false)
    }
}

/// Every offer is accepted and kept in memory, and fetches are served from it
#[derive(Default)]
struct MemoryPeers {
    held: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl PeerTransport for MemoryPeers {
    async fn join(&self, _session: &PeerSession) -> AsaasResult<()> {
        Ok(())
    }

    async fn fetch(&self, asset: &AssetDescriptor) -> AsaasResult<Option<Vec<u8>>> {
        Ok(self.held.lock().unwrap().get(&asset.hash).cloned())
    }

    async fn offer(&self, asset: &AssetDescriptor, data: &[u8]) -> AsaasResult<bool> {
        self.held
            .lock()
            .unwrap()
            .insert(asset.hash.clone(), data.to_vec());
        Ok(true)
    }
}

#[tokio::test]
async fn second_device_downloads_and_leaves_initial_sync() {
    let op = asaas_storage::memory_operator().unwrap();
    let tmp = TempDir::new().unwrap();

    let laptop = device(&op, &tmp, "laptop", Arc::new(NoPeers));
    laptop.initialize("u1", WS, "s1").await.unwrap();
    let report = laptop
        .store_asset("logos/company.png", b"company-logo")
        .await
        .unwrap();
    assert_eq!(report.uploaded, vec!["logos/company.png"]);

    let desktop = device(&op, &tmp, "desktop", Arc::new(NoPeers));
    desktop.initialize("u1", WS, "s2").await.unwrap();
    assert!(desktop.is_initial_sync());
    let mut events = desktop.subscribe_progress();

    let report = desktop.scan().await.unwrap();
    assert_eq!(report.downloaded, vec!["logos/company.png"]);
    assert!(report.failed.is_empty());

    let seen = drain(&mut events);
    assert_eq!(
        statuses(&seen),
        vec![
            AssetStatus::Scanning,
            AssetStatus::Downloading,
            AssetStatus::Success,
            AssetStatus::Idle,
        ]
    );
    assert_eq!(seen[1].current_file.as_deref(), Some("logos/company.png"));
    assert!(!seen[2].is_initial_sync);
    assert!(!desktop.is_initial_sync());

    let local = desktop.local_dir().unwrap().join("logos/company.png");
    assert_eq!(std::fs::read(local).unwrap(), b"company-logo");

    // Parity: the next scan transfers nothing
    let report = desktop.scan().await.unwrap();
    assert_eq!(report.transfers(), 0);
    assert_eq!(
        statuses(&drain(&mut events)),
        vec![AssetStatus::Scanning, AssetStatus::Idle]
    );
}

#[tokio::test]
async fn empty_workspace_reaches_parity_without_transfers() {
    let op = asaas_storage::memory_operator().unwrap();
    let tmp = TempDir::new().unwrap();
    let mgr = device(&op, &tmp, "phone", Arc::new(NoPeers));
    mgr.initialize("u1", WS, "s1").await.unwrap();

    let report = mgr.scan().await.unwrap();
    assert_eq!(report, Default::default());
    assert!(!mgr.is_initial_sync());
    assert_eq!(mgr.progress().status, AssetStatus::Idle);
}

#[tokio::test]
async fn initialize_is_idempotent() {
    let op = asaas_storage::memory_operator().unwrap();
    let tmp = TempDir::new().unwrap();
    let peers = Arc::new(CountingPeers::default());
    let mgr = device(&op, &tmp, "laptop", peers.clone());

    mgr.initialize("u1", WS, "s1").await.unwrap();
    mgr.initialize("u1", WS, "s1").await.unwrap();
    assert_eq!(peers.joins.load(Ordering::SeqCst), 1);

    mgr.scan().await.unwrap();
    assert!(!mgr.is_initial_sync());

    // Same workspace, new session: rejoin but keep the flag
    mgr.initialize("u1", WS, "s2").await.unwrap();
    assert_eq!(peers.joins.load(Ordering::SeqCst), 2);
    assert!(!mgr.is_initial_sync());

    // Different workspace: a fresh initial sync
    mgr.initialize("u1", "ws-other", "s2").await.unwrap();
    assert!(mgr.is_initial_sync());
}

#[tokio::test]
async fn scan_requires_initialize() {
    let op = asaas_storage::memory_operator().unwrap();
    let tmp = TempDir::new().unwrap();
    let mgr = device(&op, &tmp, "laptop", Arc::new(NoPeers));
    let err = mgr.scan().await.unwrap_err();
    assert!(matches!(err, AsaasError::Validation(_)));
}

#[tokio::test]
async fn concurrent_scans_share_one_cycle() {
    let op = asaas_storage::memory_operator().unwrap();
    let tmp = TempDir::new().unwrap();

    let laptop = device(&op, &tmp, "laptop", Arc::new(NoPeers));
    laptop.initialize("u1", WS, "s1").await.unwrap();
    laptop.store_asset("a.png", b"aaa").await.unwrap();
    laptop.store_asset("b.png", b"bbb").await.unwrap();

    let desktop = device(&op, &tmp, "desktop", Arc::new(NoPeers));
    desktop.initialize("u1", WS, "s2").await.unwrap();
    let mut events = desktop.subscribe_progress();

    let (r1, r2) = tokio::join!(desktop.scan(), desktop.scan());
    let (r1, r2) = (r1.unwrap(), r2.unwrap());
    assert_eq!(r1, r2);
    assert_eq!(r1.downloaded.len(), 2);

    let scanning = drain(&mut events)
        .iter()
        .filter(|p| p.status == AssetStatus::Scanning)
        .count();
    assert_eq!(scanning, 1);
}

#[tokio::test]
async fn failed_transfer_reports_error_then_idle() {
    let op = asaas_storage::memory_operator().unwrap();
    let tmp = TempDir::new().unwrap();

    // Manifest names an object that never reached the store
    let cloud = CloudAssetStore::new(op.clone(), WS);
    let mut manifest = AssetManifest::default();
    manifest.upsert(AssetDescriptor {
        key: "avatars/ghost.png".into(),
        hash: "0000".into(),
        size: 4,
        device_id: "elsewhere".into(),
        modified_at: 10,
    });
    cloud.write_manifest(&manifest).await.unwrap();

    let mgr = device(&op, &tmp, "laptop", Arc::new(NoPeers));
    mgr.initialize("u1", WS, "s1").await.unwrap();
    let mut events = mgr.subscribe_progress();

    let report = mgr.scan().await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "avatars/ghost.png");

    let seen = drain(&mut events);
    assert_eq!(
        statuses(&seen),
        vec![
            AssetStatus::Scanning,
            AssetStatus::Downloading,
            AssetStatus::Error,
            AssetStatus::Idle,
        ]
    );
    assert_eq!(seen[2].current_file.as_deref(), Some("avatars/ghost.png"));
    assert!(seen[2].error.is_some());
    assert!(mgr.is_initial_sync());
}

#[tokio::test]
async fn peer_failure_falls_back_to_cloud() {
    let op = asaas_storage::memory_operator().unwrap();
    let tmp = TempDir::new().unwrap();

    let laptop = device(&op, &tmp, "laptop", Arc::new(NoPeers));
    laptop.initialize("u1", WS, "s1").await.unwrap();
    laptop.store_asset("logo.png", b"logo").await.unwrap();

    let flaky = Arc::new(CountingPeers {
        fail_fetch: true,
        ..Default::default()
    });
    let desktop = device(&op, &tmp, "desktop", flaky);
    desktop.initialize("u1", WS, "s2").await.unwrap();

    let report = desktop.scan().await.unwrap();
    assert_eq!(report.downloaded, vec!["logo.png"]);
    assert_eq!(report.via_peer, 0);
    assert!(report.failed.is_empty());
}

#[tokio::test]
async fn peer_path_is_preferred() {
    let op = asaas_storage::memory_operator().unwrap();
    let tmp = TempDir::new().unwrap();
    let peers = Arc::new(MemoryPeers::default());

    let laptop = device(&op, &tmp, "laptop", peers.clone());
    laptop.initialize("u1", WS, "s1").await.unwrap();
    let report = laptop.store_asset("logo.png", b"logo").await.unwrap();
    assert_eq!(report.via_peer, 1);

    // The peer got a copy and the cloud still holds one
    let cloud = CloudAssetStore::new(op.clone(), WS);
    assert!(cloud.read_manifest().await.unwrap().get("logo.png").is_some());
    assert_eq!(cloud.get("logo.png").await.unwrap(), b"logo");

    let desktop = device(&op, &tmp, "desktop", peers);
    desktop.initialize("u1", WS, "s2").await.unwrap();
    let report = desktop.scan().await.unwrap();
    assert_eq!(report.downloaded, vec!["logo.png"]);
    assert_eq!(report.via_peer, 1);
}

#[tokio::test]
async fn device_without_peers_converges_on_peer_shared_asset() {
    let op = asaas_storage::memory_operator().unwrap();
    let tmp = TempDir::new().unwrap();

    let laptop = device(&op, &tmp, "laptop", Arc::new(MemoryPeers::default()));
    laptop.initialize("u1", WS, "s1").await.unwrap();
    let report = laptop.store_asset("logo.png", b"logo").await.unwrap();
    assert_eq!(report.via_peer, 1);

    let phone = device(&op, &tmp, "phone", Arc::new(NoPeers));
    phone.initialize("u1", WS, "s2").await.unwrap();
    let report = phone.scan().await.unwrap();
    assert_eq!(report.downloaded, vec!["logo.png"]);
    assert_eq!(report.via_peer, 0);
    assert!(report.failed.is_empty());
    assert!(!phone.is_initial_sync());
}

#[tokio::test]
async fn ensure_local_fetches_single_asset() {
    let op = asaas_storage::memory_operator().unwrap();
    let tmp = TempDir::new().unwrap();

    let laptop = device(&op, &tmp, "laptop", Arc::new(NoPeers));
    laptop.initialize("u1", WS, "s1").await.unwrap();
    laptop.store_asset("a.png", b"aaa").await.unwrap();
    laptop.store_asset("b.png", b"bbb").await.unwrap();

    let desktop = device(&op, &tmp, "desktop", Arc::new(NoPeers));
    desktop.initialize("u1", WS, "s2").await.unwrap();
    let path = desktop.ensure_local("b.png").await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"bbb");
    assert!(!desktop.local_dir().unwrap().join("a.png").exists());

    let err = desktop.ensure_local("missing.png").await.unwrap_err();
    assert!(matches!(err, AsaasError::Validation(_)));
}

#[tokio::test]
async fn newer_local_edit_is_uploaded() {
    let op = asaas_storage::memory_operator().unwrap();
    let tmp = TempDir::new().unwrap();

    let laptop = device(&op, &tmp, "laptop", Arc::new(NoPeers));
    laptop.initialize("u1", WS, "s1").await.unwrap();
    laptop.store_asset("logo.png", b"v1").await.unwrap();

    let desktop = device(&op, &tmp, "desktop", Arc::new(NoPeers));
    desktop.initialize("u1", WS, "s2").await.unwrap();
    desktop.scan().await.unwrap();

    // Backdate the cloud copy so the desktop's edit is strictly newer
    let cloud = CloudAssetStore::new(op.clone(), WS);
    let mut manifest = cloud.read_manifest().await.unwrap();
    let mut entry = manifest.get("logo.png").cloned().unwrap();
    entry.modified_at = 1;
    manifest.upsert(entry);
    cloud.write_manifest(&manifest).await.unwrap();

    let report = desktop.store_asset("logo.png", b"v2").await.unwrap();
    assert_eq!(report.uploaded, vec!["logo.png"]);

    laptop.scan().await.unwrap();
    let on_laptop = laptop.local_dir().unwrap().join("logo.png");
    assert_eq!(std::fs::read(on_laptop).unwrap(), b"v2");
}

#[tokio::test]
async fn every_scan_cycle_is_reported() {
    let op = asaas_storage::memory_operator().unwrap();
    let tmp = TempDir::new().unwrap();
    let mgr = device(&op, &tmp, "laptop", Arc::new(NoPeers));
    mgr.initialize("u1", WS, "s1").await.unwrap();
    let mut reports = mgr.subscribe_reports();

    mgr.store_asset("avatar.jpg", b"jpg").await.unwrap();
    mgr.scan().await.unwrap();

    assert_eq!(reports.try_recv().unwrap().uploaded, vec!["avatar.jpg"]);
    assert_eq!(reports.try_recv().unwrap().transfers(), 0);
    assert!(reports.try_recv().is_none());
}
