//! asaas-state: embedded local persistence
//!
//! - `LocalStore`: per-workspace tables of `SyncableRecord`s plus the engine's
//!   retry bookkeeping and pull cursors
//! - `SettingsStore`: device-scoped key/value settings, never synced
//! - `SnoozeBook`: snooze states kept in the settings store

mod fsio;
pub mod settings;
pub mod snooze;
pub mod store;

pub use settings::{SettingsStore, SharedSettings};
pub use snooze::SnoozeBook;
pub use store::{ApplyOutcome, LocalStore, MarkOutcome, SharedStore, StatusCounts, StoredRow};
