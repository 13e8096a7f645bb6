//! asaas-rates: exchange rates and the reminders that share their snooze model
//!
//! - `RateProvider` / `HttpRateProvider`: live sources (JSON pointer or regex)
//! - `ExchangeRateAggregator`: consensus average, manual overrides, discrepancy alerts
//! - `ReminderScheduler`: budget reminders due within a configurable window

pub mod aggregator;
pub mod provider;
pub mod reminders;

pub use aggregator::{ExchangeRateAggregator, PairRefresh, ProviderQuote, RefreshReport};
pub use provider::{build_providers, HttpRateProvider, RateProvider};
pub use reminders::{DueReminder, DueRule, Month, ReminderCandidate, ReminderCategory, ReminderScheduler};
