//! The device's local asset directory.
//!
//! Keys are relative, `/`-separated paths under the root. Writes go through a
//! temp file and rename so a scan never hashes a half-written asset.

use asaas_core::error::{AsaasError, AsaasResult};
use asaas_core::types::AssetDescriptor;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use tracing::debug;

const TMP_SUFFIX: &str = ".asaas-tmp";

#[derive(Debug, Clone)]
pub struct LocalAssetDir {
    root: PathBuf,
    device_id: String,
}

impl LocalAssetDir {
    pub fn new(root: impl Into<PathBuf>, device_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            device_id: device_id.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Resolve a key to a path under the root, rejecting anything that escapes it.
    pub fn path_for(&self, key: &str) -> AsaasResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    pub async fn exists(&self, key: &str) -> bool {
        match self.path_for(key) {
            Ok(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    pub async fn read(&self, key: &str) -> AsaasResult<Vec<u8>> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::read(&path).await?)
    }

    /// Describe every asset under the root. A missing root is an empty set.
    pub async fn scan(&self) -> AsaasResult<Vec<AssetDescriptor>> {
        let root = self.root.clone();
        let device_id = self.device_id.clone();
        tokio::task::spawn_blocking(move || scan_blocking(&root, &device_id))
            .await
            .map_err(|e| AsaasError::Other(anyhow::anyhow!("asset scan task failed: {e}")))?
    }

    /// Atomically write an asset. `modified_at` pins the file's mtime so a
    /// downloaded copy compares equal to its source on the next scan.
    pub async fn write(&self, key: &str, data: &[u8], modified_at: Option<u64>) -> AsaasResult<()> {
        let path = self.path_for(key)?;
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || write_blocking(&path, &data, modified_at))
            .await
            .map_err(|e| AsaasError::Other(anyhow::anyhow!("asset write task failed: {e}")))??;
        debug!(key, "asset written locally");
        Ok(())
    }
}

pub fn validate_key(key: &str) -> AsaasResult<()> {
    let bad = key.is_empty()
        || key.contains('\\')
        || key.ends_with(TMP_SUFFIX)
        || Path::new(key)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
    if bad {
        return Err(AsaasError::Validation(format!("invalid asset key: {key:?}")));
    }
    Ok(())
}

pub fn hash_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

fn scan_blocking(root: &Path, device_id: &str) -> AsaasResult<Vec<AssetDescriptor>> {
    let mut out = Vec::new();
    if !root.exists() {
        return Ok(out);
    }

    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(path);
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            let Some(key) = relative_key(root, &path) else {
                continue;
            };
            if key.ends_with(TMP_SUFFIX) {
                continue;
            }

            let data = std::fs::read(&path)?;
            let modified_at = entry
                .metadata()?
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);

            out.push(AssetDescriptor {
                key,
                hash: hash_bytes(&data),
                size: data.len() as u64,
                device_id: device_id.to_string(),
                modified_at,
            });
        }
    }

    out.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(out)
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = rel
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    Some(parts.join("/"))
}

fn write_blocking(path: &Path, data: &[u8], modified_at: Option<u64>) -> AsaasResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(TMP_SUFFIX);
    let tmp = PathBuf::from(tmp_name);

    std::fs::write(&tmp, data)?;
    if let Some(secs) = modified_at {
        let file = std::fs::File::options().write(true).open(&tmp)?;
        file.set_modified(UNIX_EPOCH + Duration::from_secs(secs))?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}
