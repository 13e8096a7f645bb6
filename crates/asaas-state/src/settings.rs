//! Device-scoped key/value settings (manual rates, active sources, snoozes,
//! reminder marks). Never synced to the backend.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;

use crate::fsio;

pub type SharedSettings = Arc<TokioMutex<SettingsStore>>;

pub struct SettingsStore {
    path: PathBuf,
    values: BTreeMap<String, serde_json::Value>,
}

impl SettingsStore {
    pub fn open(path: &Path) -> Result<Self> {
        let values = fsio::read_json_or_default(path)?;
        Ok(SettingsStore {
            path: path.to_path_buf(),
            values,
        })
    }

    pub fn into_shared(self) -> SharedSettings {
        Arc::new(TokioMutex::new(self))
    }

    /// Typed read. A value that no longer parses as `T` reads as absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.values.get(key)?;
        match serde_json::from_value(value.clone()) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(key, "ignoring unreadable setting: {e}");
                None
            }
        }
    }

    /// Store and persist immediately.
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let value =
            serde_json::to_value(value).with_context(|| format!("serializing setting {key}"))?;
        self.values.insert(key.to_string(), value);
        fsio::write_json_atomic(&self.path, &self.values)
    }

    /// Remove and persist. Returns whether the key existed.
    pub fn remove(&mut self, key: &str) -> Result<bool> {
        if self.values.remove(key).is_none() {
            return Ok(false);
        }
        fsio::write_json_atomic(&self.path, &self.values)?;
        Ok(true)
    }

    pub fn keys_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.values
            .range(prefix.to_string()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.as_str())
    }
}
