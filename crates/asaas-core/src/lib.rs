//! asaas-core: shared types, config schema, error taxonomy, and event plumbing

pub mod bus;
pub mod config;
pub mod error;
pub mod flight;
pub mod snooze;
pub mod types;

pub use error::{AsaasError, AsaasResult};

/// Current unix timestamp in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current unix timestamp in milliseconds.
pub fn unix_now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
