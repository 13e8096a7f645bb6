//! Conflict resolution for stale-version push rejections.
//!
//! Last write wins: the backend's current row is authoritative. Payload
//! fields a table declares mergeable are carried over from the local edit;
//! every other differing field is discarded and reported in a notice.

use asaas_core::types::SyncableRecord;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Reported on the engine's notice channel for every resolved conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictNotice {
    pub table: String,
    pub id: String,
    pub local_version: u64,
    pub remote_version: u64,
    pub merged_fields: Vec<String>,
    pub discarded_fields: Vec<String>,
    /// A newer local edit landed while the rejected push was in flight and
    /// is folded into the held conflict row
    #[serde(default)]
    pub superseded_local_edit: bool,
    pub detected_at: u64,
}

/// Outcome of resolving one conflict
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub record: SyncableRecord,
    pub merged_fields: Vec<String>,
    pub discarded_fields: Vec<String>,
}

/// Which payload fields each table may merge from a losing local edit
#[derive(Debug, Clone, Default)]
pub struct MergePolicy {
    tables: BTreeMap<String, BTreeSet<String>>,
}

impl MergePolicy {
    pub fn new(config: &BTreeMap<String, Vec<String>>) -> Self {
        Self {
            tables: config
                .iter()
                .map(|(t, fields)| (t.clone(), fields.iter().cloned().collect()))
                .collect(),
        }
    }

    pub fn mergeable(&self, table: &str) -> BTreeSet<String> {
        self.tables.get(table).cloned().unwrap_or_default()
    }
}

/// Marker used in `discarded_fields` when a local delete lost to a remote update.
pub const DISCARDED_DELETE: &str = "<delete>";

pub fn resolve_last_write_wins(
    local: &SyncableRecord,
    remote: &SyncableRecord,
    mergeable: &BTreeSet<String>,
) -> Resolution {
    let mut record = remote.clone();
    let mut merged_fields = Vec::new();
    let mut discarded_fields = Vec::new();

    if remote.is_deleted {
        // A remote delete wins outright
        if let Some(local_obj) = local.payload.as_object() {
            discarded_fields.extend(local_obj.keys().cloned());
        }
        return Resolution {
            record,
            merged_fields,
            discarded_fields,
        };
    }

    if local.is_deleted {
        discarded_fields.push(DISCARDED_DELETE.to_string());
    }

    match (local.payload.as_object(), record.payload.as_object_mut()) {
        (Some(local_obj), Some(remote_obj)) => {
            for (key, local_value) in local_obj {
                if remote_obj.get(key) == Some(local_value) {
                    continue;
                }
                if mergeable.contains(key) {
                    remote_obj.insert(key.clone(), local_value.clone());
                    merged_fields.push(key.clone());
                } else {
                    discarded_fields.push(key.clone());
                }
            }
        }
        _ => {
            if local.payload != remote.payload && !local.is_deleted {
                discarded_fields.push("payload".to_string());
            }
        }
    }

    Resolution {
        record,
        merged_fields,
        discarded_fields,
    }
}
