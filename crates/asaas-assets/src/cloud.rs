//! Cloud object store side of asset replication (OpenDAL).
//!
//! Layout per workspace:
//!   {workspace}/assets/manifest.json
//!   {workspace}/assets/objects/{key}

use asaas_core::error::{AsaasError, AsaasResult};
use opendal::Operator;
use tracing::debug;

use crate::manifest::AssetManifest;

#[derive(Clone)]
pub struct CloudAssetStore {
    op: Operator,
    prefix: String,
}

impl CloudAssetStore {
    pub fn new(op: Operator, workspace_id: &str) -> Self {
        Self {
            op,
            prefix: format!("{}/assets", workspace_id.trim_matches('/')),
        }
    }

    pub fn manifest_path(&self) -> String {
        format!("{}/manifest.json", self.prefix)
    }

    pub fn object_path(&self, key: &str) -> String {
        format!("{}/objects/{}", self.prefix, key)
    }

    /// The shared manifest, or an empty one if nothing was ever uploaded.
    pub async fn read_manifest(&self) -> AsaasResult<AssetManifest> {
        let path = self.manifest_path();
        let exists = self
            .op
            .exists(&path)
            .await
            .map_err(|e| AsaasError::Storage(format!("checking {path}: {e}")))?;
        if !exists {
            return Ok(AssetManifest::default());
        }

        let data = self
            .op
            .read(&path)
            .await
            .map_err(|e| AsaasError::Storage(format!("reading {path}: {e}")))?;
        Ok(AssetManifest::from_bytes(&data.to_bytes())?)
    }

    pub async fn write_manifest(&self, manifest: &AssetManifest) -> AsaasResult<()> {
        let path = self.manifest_path();
        let bytes = manifest.to_bytes()?;
        self.op
            .write(&path, bytes)
            .await
            .map_err(|e| AsaasError::Storage(format!("writing {path}: {e}")))?;
        debug!(path = %path, assets = manifest.len(), "asset manifest written");
        Ok(())
    }

    pub async fn put(&self, key: &str, data: Vec<u8>) -> AsaasResult<()> {
        let path = self.object_path(key);
        self.op
            .write(&path, data)
            .await
            .map_err(|e| AsaasError::AssetTransfer {
                file: key.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> AsaasResult<Vec<u8>> {
        let path = self.object_path(key);
        let data = self
            .op
            .read(&path)
            .await
            .map_err(|e| AsaasError::AssetTransfer {
                file: key.to_string(),
                reason: e.to_string(),
            })?;
        Ok(data.to_vec())
    }
}
