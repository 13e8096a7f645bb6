//! Persisted snooze states, keyed by entity and period.

use anyhow::Result;
use asaas_core::snooze::{SnoozeChoice, SnoozeState, SnoozeUntil};

use crate::settings::SharedSettings;

const PREFIX: &str = "snooze.";

/// Snooze bookkeeping over the shared settings store.
#[derive(Clone)]
pub struct SnoozeBook {
    settings: SharedSettings,
}

impl SnoozeBook {
    pub fn new(settings: SharedSettings) -> Self {
        Self { settings }
    }

    fn setting_key(key: &str) -> String {
        format!("{PREFIX}{key}")
    }

    pub async fn get(&self, key: &str) -> SnoozeState {
        self.settings
            .lock()
            .await
            .get(&Self::setting_key(key))
            .unwrap_or_default()
    }

    pub async fn is_active(&self, key: &str, now: u64) -> bool {
        self.get(key).await.is_active(now)
    }

    /// Apply a menu choice; `Immediate` changes nothing.
    pub async fn apply(&self, key: &str, choice: SnoozeChoice, now: u64) -> Result<SnoozeState> {
        self.update(key, |state| state.apply(choice, now)).await
    }

    /// Snooze until an explicit deadline, or do nothing for `None`.
    pub async fn snooze(&self, key: &str, until: Option<SnoozeUntil>) -> Result<SnoozeState> {
        self.update(key, |state| {
            if let Some(until) = until {
                state.snooze(until);
            }
        })
        .await
    }

    pub async fn unsnooze(&self, key: &str) -> Result<SnoozeState> {
        self.update(key, SnoozeState::clear).await
    }

    /// Keys under `prefix` with an active snooze
    pub async fn active_keys(&self, prefix: &str, now: u64) -> Vec<String> {
        let settings = self.settings.lock().await;
        let full_prefix = Self::setting_key(prefix);
        settings
            .keys_with_prefix(&full_prefix)
            .filter(|k| {
                settings
                    .get::<SnoozeState>(k)
                    .is_some_and(|s| s.is_active(now))
            })
            .map(|k| k[PREFIX.len()..].to_string())
            .collect()
    }

    async fn update<F>(&self, key: &str, f: F) -> Result<SnoozeState>
    where
        F: FnOnce(&mut SnoozeState),
    {
        let setting_key = Self::setting_key(key);
        let mut settings = self.settings.lock().await;
        let mut state: SnoozeState = settings.get(&setting_key).unwrap_or_default();
        let before = state;
        f(&mut state);
        if state != before {
            settings.set(&setting_key, &state)?;
        }
        Ok(state)
    }
}
