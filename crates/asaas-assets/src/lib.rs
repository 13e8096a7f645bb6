//! asaas-assets: replicates binary assets (logos, avatars) across the devices
//! of a workspace
//!
//! - `manifest`: the shared asset manifest and the local/remote diff
//! - `local`: the device's asset directory (BLAKE3-hashed scan, atomic writes)
//! - `cloud`: manifest and objects in the cloud object store (OpenDAL)
//! - `peer`: device-to-device transfer (`nats` feature) with a cloud-only fallback
//! - `manager`: single-flight scan cycles with progress events

pub mod cloud;
pub mod local;
pub mod manager;
pub mod manifest;
pub mod peer;

pub use cloud::CloudAssetStore;
pub use local::LocalAssetDir;
pub use manager::{AssetSyncManager, ScanReport};
pub use manifest::{AssetAction, AssetManifest};
pub use peer::{NoPeers, PeerSession, PeerTransport};
#[cfg(feature = "nats")]
pub use peer::NatsPeers;
