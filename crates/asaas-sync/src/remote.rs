//! Remote backend contract and its REST implementation.
//!
//! The engine depends only on `RemoteBackendClient`. `RestBackendClient`
//! speaks a small JSON protocol:
//!
//!   POST {endpoint}/tables/{table}/upsert   body {record, base_version}
//!        200 {version, updated_at}          accepted
//!        409 {current}                      stale base version
//!   GET  {endpoint}/tables/{table}?workspace_id=..&since=..
//!        200 [record, ...]

use async_trait::async_trait;
use asaas_core::error::{AsaasError, AsaasResult};
use asaas_core::types::SyncableRecord;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backend's answer to an upsert
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Accepted { version: u64, updated_at: u64 },
    /// The backend holds a newer version than the one the edit was based on
    Stale { current: SyncableRecord },
}

#[async_trait]
pub trait RemoteBackendClient: Send + Sync {
    /// Upsert one row. `base_version` is the server version the local edit
    /// started from (0 for a row the backend has never seen).
    async fn upsert(
        &self,
        table: &str,
        record: &SyncableRecord,
        base_version: u64,
    ) -> AsaasResult<UpsertOutcome>;

    /// Rows of `table` in `workspace_id` updated strictly after `since`.
    async fn fetch_since(
        &self,
        table: &str,
        workspace_id: &str,
        since: Option<u64>,
    ) -> AsaasResult<Vec<SyncableRecord>>;
}

// ── REST client ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct UpsertBody<'a> {
    record: &'a SyncableRecord,
    base_version: u64,
}

#[derive(Deserialize)]
struct AcceptedBody {
    version: u64,
    #[serde(default)]
    updated_at: u64,
}

#[derive(Deserialize)]
struct StaleBody {
    current: SyncableRecord,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

pub struct RestBackendClient {
    endpoint: String,
    api_key: Option<SecretString>,
    client: reqwest::Client,
}

impl RestBackendClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> AsaasResult<Self> {
        let endpoint = normalize_endpoint(endpoint.into())?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AsaasError::Config(format!("building HTTP client: {e}")))?;
        Ok(Self {
            endpoint,
            api_key,
            client,
        })
    }

    /// Build from the `[backend]` section, reading the key from the named env var.
    pub fn from_config(cfg: &asaas_core::config::BackendConfig) -> AsaasResult<Self> {
        let api_key = std::env::var(&cfg.api_key_env).ok().map(SecretString::from);
        if api_key.is_none() {
            tracing::warn!(env = %cfg.api_key_env, "backend API key not set; requests go unauthenticated");
        }
        Self::new(
            cfg.endpoint.clone(),
            api_key,
            Duration::from_secs(cfg.timeout_secs.max(1)),
        )
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key.expose_secret()),
            None => req,
        }
    }
}

#[async_trait]
impl RemoteBackendClient for RestBackendClient {
    async fn upsert(
        &self,
        table: &str,
        record: &SyncableRecord,
        base_version: u64,
    ) -> AsaasResult<UpsertOutcome> {
        let url = format!("{}/tables/{}/upsert", self.endpoint, table);
        let response = self
            .authorize(self.client.post(&url))
            .header("Accept", "application/json")
            .json(&UpsertBody {
                record,
                base_version,
            })
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            s if s.is_success() => {
                let body: AcceptedBody = response.json().await.map_err(transport_error)?;
                Ok(UpsertOutcome::Accepted {
                    version: body.version,
                    updated_at: body.updated_at,
                })
            }
            StatusCode::CONFLICT => {
                let body: StaleBody = response.json().await.map_err(transport_error)?;
                Ok(UpsertOutcome::Stale {
                    current: body.current,
                })
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(classify_status(status, &body))
            }
        }
    }

    async fn fetch_since(
        &self,
        table: &str,
        workspace_id: &str,
        since: Option<u64>,
    ) -> AsaasResult<Vec<SyncableRecord>> {
        let url = format!("{}/tables/{}", self.endpoint, table);
        let mut query = vec![("workspace_id", workspace_id.to_string())];
        if let Some(since) = since {
            query.push(("since", since.to_string()));
        }

        let response = self
            .authorize(self.client.get(&url))
            .header("Accept", "application/json")
            .query(&query)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        response.json().await.map_err(transport_error)
    }
}

fn transport_error(e: reqwest::Error) -> AsaasError {
    if e.is_decode() {
        AsaasError::Validation(format!("malformed backend response: {e}"))
    } else {
        AsaasError::TransientNetwork(e.to_string())
    }
}

/// Map a non-success status onto the error taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> AsaasError {
    let message = api_error_message(status, body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AsaasError::Authorization(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            AsaasError::TransientNetwork(message)
        }
        s if s.is_server_error() => AsaasError::TransientNetwork(message),
        _ => AsaasError::Validation(message),
    }
}

fn api_error_message(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn normalize_endpoint(raw: String) -> AsaasResult<String> {
    let endpoint = raw.trim();
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Ok(endpoint.trim_end_matches('/').to_string())
    } else {
        Err(AsaasError::Config(
            "backend endpoint must include http:// or https://".to_string(),
        ))
    }
}
