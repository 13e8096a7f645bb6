//! AssetManifest: the workspace's shared list of asset descriptors.
//!
//! Stored as JSON at `{workspace}/assets/manifest.json`. The local side of a
//! diff is built from a directory scan with the same type.

use asaas_core::types::AssetDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetManifest {
    pub version: u32,
    /// Device that last wrote this manifest
    #[serde(default)]
    pub written_by: String,
    #[serde(default)]
    pub written_at: u64,
    /// Keyed by relative asset key
    #[serde(default)]
    pub assets: BTreeMap<String, AssetDescriptor>,
}

impl Default for AssetManifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            written_by: String::new(),
            written_at: 0,
            assets: BTreeMap::new(),
        }
    }
}

impl AssetManifest {
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = AssetDescriptor>) -> Self {
        Self {
            assets: descriptors
                .into_iter()
                .map(|d| (d.key.clone(), d))
                .collect(),
            ..Default::default()
        }
    }

    pub fn from_bytes(data: &[u8]) -> anyhow::Result<Self> {
        let manifest: AssetManifest = serde_json::from_slice(data)
            .map_err(|e| anyhow::anyhow!("parsing asset manifest: {e}"))?;
        if manifest.version > MANIFEST_VERSION {
            anyhow::bail!(
                "asset manifest version {} is newer than supported ({MANIFEST_VERSION})",
                manifest.version
            );
        }
        Ok(manifest)
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| anyhow::anyhow!("serializing asset manifest: {e}"))
    }

    pub fn get(&self, key: &str) -> Option<&AssetDescriptor> {
        self.assets.get(key)
    }

    pub fn upsert(&mut self, descriptor: AssetDescriptor) {
        self.assets.insert(descriptor.key.clone(), descriptor);
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

/// One transfer the diff asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetAction {
    Upload(AssetDescriptor),
    Download(AssetDescriptor),
}

impl AssetAction {
    pub fn key(&self) -> &str {
        match self {
            AssetAction::Upload(d) | AssetAction::Download(d) => &d.key,
        }
    }
}

/// Compare a local scan against the remote manifest.
///
/// Equal hashes need nothing. Otherwise the newer `modified_at` wins, and a
/// tie goes to the remote copy so every device converges on one version.
pub fn diff(local: &AssetManifest, remote: &AssetManifest) -> Vec<AssetAction> {
    let mut actions = Vec::new();

    for (key, mine) in &local.assets {
        match remote.assets.get(key) {
            None => actions.push(AssetAction::Upload(mine.clone())),
            Some(theirs) if theirs.hash == mine.hash => {}
            Some(theirs) if mine.modified_at > theirs.modified_at => {
                actions.push(AssetAction::Upload(mine.clone()))
            }
            Some(theirs) => actions.push(AssetAction::Download(theirs.clone())),
        }
    }

    for (key, theirs) in &remote.assets {
        if !local.assets.contains_key(key) {
            actions.push(AssetAction::Download(theirs.clone()));
        }
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(key: &str, hash: &str, modified_at: u64) -> AssetDescriptor {
        AssetDescriptor {
            key: key.into(),
            hash: hash.into(),
            size: 3,
            device_id: "dev".into(),
            modified_at,
        }
    }

    #[test]
    fn test_diff_rules() {
        let local = AssetManifest::from_descriptors([
            desc("only-local.png", "a", 10),
            desc("same.png", "s", 10),
            desc("local-newer.png", "l2", 20),
            desc("remote-newer.png", "r1", 10),
            desc("tie.png", "t-local", 15),
        ]);
        let remote = AssetManifest::from_descriptors([
            desc("only-remote.png", "b", 10),
            desc("same.png", "s", 99),
            desc("local-newer.png", "l1", 10),
            desc("remote-newer.png", "r2", 20),
            desc("tie.png", "t-remote", 15),
        ]);

        let actions = diff(&local, &remote);
        let find = |key: &str| actions.iter().find(|a| a.key() == key).cloned();

        assert!(matches!(find("only-local.png"), Some(AssetAction::Upload(_))));
        assert!(matches!(find("only-remote.png"), Some(AssetAction::Download(_))));
        assert_eq!(find("same.png"), None);
        assert!(matches!(find("local-newer.png"), Some(AssetAction::Upload(d)) if d.hash == "l2"));
        assert!(matches!(find("remote-newer.png"), Some(AssetAction::Download(d)) if d.hash == "r2"));
        assert!(matches!(find("tie.png"), Some(AssetAction::Download(d)) if d.hash == "t-remote"));
        assert_eq!(actions.len(), 5);
    }

    #[test]
    fn test_parity_means_no_actions() {
        let m = AssetManifest::from_descriptors([desc("a.png", "h", 1)]);
        assert!(diff(&m, &m).is_empty());
        assert!(diff(&AssetManifest::default(), &AssetManifest::default()).is_empty());
    }

    #[test]
    fn test_parse_rejects_future_version() {
        let bytes = br#"{"version": 9, "assets": {}}"#;
        assert!(AssetManifest::from_bytes(bytes).is_err());
    }

    #[test]
    fn test_bytes_roundtrip_keeps_descriptors() {
        let mut m = AssetManifest::default();
        m.upsert(desc("logos/company.png", "abc", 42));
        m.written_by = "laptop".into();
        let parsed = AssetManifest::from_bytes(&m.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, m);
    }
}
