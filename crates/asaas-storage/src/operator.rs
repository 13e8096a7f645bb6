//! OpenDAL Operator factory for the asset object store

use anyhow::{Context, Result};
use opendal::Operator;
use secrecy::{ExposeSecret, SecretString};

/// Resolved object store settings, credentials included
#[derive(Debug)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: SecretString,
}

impl ObjectStoreConfig {
    /// Combine the `[assets]` config section with credentials read from the
    /// environment variables it names.
    pub fn from_assets_config(assets: &asaas_core::config::AssetsConfig) -> Result<Self> {
        let access_key_id = std::env::var(&assets.access_key_env)
            .with_context(|| format!("object store key not set: export {}", assets.access_key_env))?;
        let secret_access_key = std::env::var(&assets.secret_key_env)
            .with_context(|| format!("object store secret not set: export {}", assets.secret_key_env))?;

        check_endpoint(&assets.endpoint, assets.enforce_tls)?;

        Ok(Self {
            endpoint: assets.endpoint.clone(),
            region: assets.region.clone(),
            bucket: assets.bucket.clone(),
            access_key_id,
            secret_access_key: SecretString::from(secret_access_key),
        })
    }
}

/// Reject plaintext endpoints when TLS is enforced, warn otherwise.
pub fn check_endpoint(endpoint: &str, enforce_tls: bool) -> Result<()> {
    if endpoint.starts_with("http://") {
        if enforce_tls {
            anyhow::bail!(
                "object store endpoint uses plaintext HTTP ({endpoint}), but enforce_tls is enabled. \
                 Use an HTTPS endpoint or set assets.enforce_tls = false for local development."
            );
        }
        tracing::warn!(
            endpoint = %endpoint,
            "object store endpoint uses plaintext HTTP; credentials are transmitted unencrypted"
        );
    }
    Ok(())
}

/// Build an OpenDAL Operator for any S3-compatible endpoint (R2, MinIO, S3)
pub fn build_operator(cfg: &ObjectStoreConfig) -> Result<Operator> {
    let builder = opendal::services::S3::default()
        .endpoint(&cfg.endpoint)
        .region(&cfg.region)
        .bucket(&cfg.bucket)
        .access_key_id(&cfg.access_key_id)
        .secret_access_key(cfg.secret_access_key.expose_secret());

    let op = Operator::new(builder)
        .context("creating OpenDAL S3 operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(3)
                .with_jitter(),
        )
        .finish();

    Ok(op)
}

/// In-process operator for offline development and tests
pub fn memory_operator() -> Result<Operator> {
    Ok(Operator::new(opendal::services::Memory::default())
        .context("creating in-memory operator")?
        .finish())
}
