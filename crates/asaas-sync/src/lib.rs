//! asaas-sync: keeps a workspace's local store and the remote backend
//! eventually consistent
//!
//! - `engine`: write / push / pull / single-flight sync
//! - `conflict`: last-write-wins resolution with mergeable fields
//! - `retry`: exponential backoff policy for transient push failures
//! - `remote`: the backend contract plus a REST client
//! - `connection`: online / offline / wake detection

pub mod conflict;
pub mod connection;
pub mod engine;
pub mod remote;
pub mod retry;

pub use connection::{ConnectionManager, ConnectionSettings, HttpProbe, Probe};
pub use engine::{PullReport, PushReport, SyncEngine, SyncReport, TriggerConfig};
pub use remote::{RemoteBackendClient, RestBackendClient, UpsertOutcome};
