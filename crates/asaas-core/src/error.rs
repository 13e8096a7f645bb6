use std::sync::Arc;

use thiserror::Error;

pub type AsaasResult<T> = Result<T, AsaasError>;

#[derive(Debug, Error)]
pub enum AsaasError {
    /// Network hiccup or 5xx from a collaborator; retried with backoff.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("version conflict on {table}/{id}: local v{local_version}, remote v{remote_version}")]
    VersionConflict {
        table: String,
        id: String,
        local_version: u64,
        remote_version: u64,
    },

    /// Rejected locally, never queued.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("provider {provider} unavailable for {pair}: {reason}")]
    ProviderUnavailable {
        provider: String,
        pair: String,
        reason: String,
    },

    #[error("asset transfer failed for {file}: {reason}")]
    AssetTransfer { file: String, reason: String },

    /// Fatal for the current operation and never retried.
    #[error("authorization error: {0}")]
    Authorization(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An error observed by every caller attached to one single-flight operation.
    #[error(transparent)]
    Shared(Arc<AsaasError>),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AsaasError {
    /// Whether the retry policy may try the same operation again.
    pub fn is_transient(&self) -> bool {
        match self {
            AsaasError::TransientNetwork(_) => true,
            AsaasError::Shared(inner) => inner.is_transient(),
            _ => false,
        }
    }

    pub fn is_authorization(&self) -> bool {
        match self {
            AsaasError::Authorization(_) => true,
            AsaasError::Shared(inner) => inner.is_authorization(),
            _ => false,
        }
    }
}
