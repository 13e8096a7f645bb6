//! Peer transfer between devices of the same workspace.
//!
//! The manager only depends on `PeerTransport`. `NoPeers` is the cloud-only
//! fallback; `NatsPeers` (feature `nats`) uses NATS request/reply:
//!
//!   asaas.{workspace}.assets.fetch   request: descriptor JSON, reply: bytes (holders only)
//!   asaas.{workspace}.assets.offer   request: bytes + `Asaas-Asset` header, reply: "ok"

use async_trait::async_trait;
use asaas_core::error::AsaasResult;
use asaas_core::types::AssetDescriptor;

/// Who this device is within a workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSession {
    pub user_id: String,
    pub workspace_id: String,
    pub session_id: String,
    pub device_id: String,
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Start answering peer requests for `session`. Called again with the
    /// same session it must be a no-op.
    async fn join(&self, session: &PeerSession) -> AsaasResult<()>;

    /// Fetch an asset's bytes from any peer. `Ok(None)` means no peer has it.
    async fn fetch(&self, asset: &AssetDescriptor) -> AsaasResult<Option<Vec<u8>>>;

    /// Hand an asset to the peers. `Ok(false)` means nobody took it.
    async fn offer(&self, asset: &AssetDescriptor, data: &[u8]) -> AsaasResult<bool>;
}

/// No peer network: every transfer goes to the cloud.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPeers;

#[async_trait]
impl PeerTransport for NoPeers {
    async fn join(&self, _session: &PeerSession) -> AsaasResult<()> {
        Ok(())
    }

    async fn fetch(&self, _asset: &AssetDescriptor) -> AsaasResult<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn offer(&self, _asset: &AssetDescriptor, _data: &[u8]) -> AsaasResult<bool> {
        Ok(false)
    }
}

#[cfg(feature = "nats")]
pub use nats::NatsPeers;

#[cfg(feature = "nats")]
mod nats {
    use super::{PeerSession, PeerTransport};
    use crate::local::{hash_bytes, LocalAssetDir};
    use async_nats::{HeaderMap, Message, RequestErrorKind};
    use async_trait::async_trait;
    use asaas_core::error::{AsaasError, AsaasResult};
    use asaas_core::types::AssetDescriptor;
    use futures::StreamExt;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, info, warn};

    const ASSET_HEADER: &str = "Asaas-Asset";

    fn subject(workspace_id: &str, verb: &str) -> String {
        format!("asaas.{workspace_id}.assets.{verb}")
    }

    pub struct NatsPeers {
        client: async_nats::Client,
        dir: LocalAssetDir,
        timeout: Duration,
        joined: Mutex<Option<(PeerSession, CancellationToken)>>,
    }

    impl NatsPeers {
        pub async fn connect(url: &str, dir: LocalAssetDir, timeout: Duration) -> AsaasResult<Self> {
            let client = async_nats::connect(url)
                .await
                .map_err(|e| AsaasError::TransientNetwork(format!("connecting to NATS at {url}: {e}")))?;
            info!("NATS: connected to {url}");
            Ok(Self {
                client,
                dir,
                timeout,
                joined: Mutex::new(None),
            })
        }

        fn workspace(&self) -> AsaasResult<String> {
            self.joined
                .lock()
                .ok()
                .and_then(|j| j.as_ref().map(|(s, _)| s.workspace_id.clone()))
                .ok_or_else(|| AsaasError::Validation("peer transport has not joined a workspace".into()))
        }

        async fn request(&self, subject: String, headers: Option<HeaderMap>, payload: Vec<u8>) -> AsaasResult<Option<Message>> {
            let send = async move {
                match headers {
                    Some(h) => self.client.request_with_headers(subject, h, payload.into()).await,
                    None => self.client.request(subject, payload.into()).await,
                }
            };
            match tokio::time::timeout(self.timeout, send).await {
                Err(_) => Ok(None),
                Ok(Ok(msg)) => Ok(Some(msg)),
                Ok(Err(e)) if matches!(e.kind(), RequestErrorKind::NoResponders | RequestErrorKind::TimedOut) => Ok(None),
                Ok(Err(e)) => Err(AsaasError::TransientNetwork(format!("peer request failed: {e}"))),
            }
        }
    }

    impl Drop for NatsPeers {
        fn drop(&mut self) {
            if let Ok(mut joined) = self.joined.lock() {
                if let Some((_, cancel)) = joined.take() {
                    cancel.cancel();
                }
            }
        }
    }

    #[async_trait]
    impl PeerTransport for NatsPeers {
        async fn join(&self, session: &PeerSession) -> AsaasResult<()> {
            let cancel = {
                let mut joined = self
                    .joined
                    .lock()
                    .map_err(|_| anyhow::anyhow!("peer session lock poisoned"))?;
                if matches!(joined.as_ref(), Some((current, _)) if current == session) {
                    return Ok(());
                }
                if let Some((_, old)) = joined.take() {
                    old.cancel();
                }
                let cancel = CancellationToken::new();
                *joined = Some((session.clone(), cancel.clone()));
                cancel
            };

            let fetches = self
                .client
                .subscribe(subject(&session.workspace_id, "fetch"))
                .await
                .map_err(|e| AsaasError::TransientNetwork(format!("subscribing to peer fetches: {e}")))?;
            let offers = self
                .client
                .subscribe(subject(&session.workspace_id, "offer"))
                .await
                .map_err(|e| AsaasError::TransientNetwork(format!("subscribing to peer offers: {e}")))?;

            tokio::spawn(serve(
                self.client.clone(),
                self.dir.clone(),
                fetches,
                offers,
                cancel,
            ));
            info!(workspace = %session.workspace_id, device = %session.device_id, "joined peer network");
            Ok(())
        }

        async fn fetch(&self, asset: &AssetDescriptor) -> AsaasResult<Option<Vec<u8>>> {
            let ws = self.workspace()?;
            let body = serde_json::to_vec(asset).map_err(|e| anyhow::anyhow!("encoding fetch request: {e}"))?;
            let Some(reply) = self.request(subject(&ws, "fetch"), None, body).await? else {
                return Ok(None);
            };
            if reply.payload.is_empty() {
                return Ok(None);
            }
            if hash_bytes(&reply.payload) != asset.hash {
                return Err(AsaasError::AssetTransfer {
                    file: asset.key.clone(),
                    reason: "peer sent content with the wrong hash".into(),
                });
            }
            Ok(Some(reply.payload.to_vec()))
        }

        async fn offer(&self, asset: &AssetDescriptor, data: &[u8]) -> AsaasResult<bool> {
            let ws = self.workspace()?;
            let header = serde_json::to_string(asset).map_err(|e| anyhow::anyhow!("encoding offer: {e}"))?;
            let mut headers = HeaderMap::new();
            headers.insert(ASSET_HEADER, header.as_str());
            let reply = self.request(subject(&ws, "offer"), Some(headers), data.to_vec()).await?;
            Ok(reply.is_some_and(|r| r.payload.as_ref() == b"ok"))
        }
    }

    async fn serve(
        client: async_nats::Client,
        dir: LocalAssetDir,
        mut fetches: async_nats::Subscriber,
        mut offers: async_nats::Subscriber,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(msg) = fetches.next() => answer_fetch(&client, &dir, msg).await,
                Some(msg) = offers.next() => answer_offer(&client, &dir, msg).await,
                else => break,
            }
        }
        debug!("peer responder stopped");
    }

    /// Only a holder of the exact content replies, so the first answer wins.
    async fn answer_fetch(client: &async_nats::Client, dir: &LocalAssetDir, msg: Message) {
        let Some(reply) = msg.reply else { return };
        let asset = match serde_json::from_slice::<AssetDescriptor>(&msg.payload) {
            Ok(asset) => asset,
            Err(e) => {
                warn!("malformed peer fetch request: {e}");
                return;
            }
        };
        let data = match dir.read(&asset.key).await {
            Ok(data) if hash_bytes(&data) == asset.hash => data,
            _ => return,
        };
        if let Err(e) = client.publish(reply, data.into()).await {
            warn!("answering peer fetch: {e}");
        }
    }

    async fn answer_offer(client: &async_nats::Client, dir: &LocalAssetDir, msg: Message) {
        let Some(reply) = msg.reply.clone() else { return };
        let asset = msg
            .headers
            .as_ref()
            .and_then(|h| h.get(ASSET_HEADER))
            .and_then(|v| serde_json::from_str::<AssetDescriptor>(v.as_str()).ok());
        let Some(asset) = asset else {
            warn!("peer offer without asset header");
            return;
        };
        if asset.device_id == dir.device_id() || hash_bytes(&msg.payload) != asset.hash {
            return;
        }
        match dir.write(&asset.key, &msg.payload, Some(asset.modified_at)).await {
            Ok(()) => {
                debug!(key = %asset.key, "accepted asset from peer");
                if let Err(e) = client.publish(reply, "ok".into()).await {
                    warn!("answering peer offer: {e}");
                }
            }
            Err(e) => warn!(key = %asset.key, "storing offered asset: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_peers_never_has_anything() {
        let peers = NoPeers;
        let asset = AssetDescriptor {
            key: "a.png".into(),
            hash: "h".into(),
            size: 1,
            device_id: "d".into(),
            modified_at: 0,
        };
        let session = PeerSession {
            user_id: "u".into(),
            workspace_id: "w".into(),
            session_id: "s".into(),
            device_id: "d".into(),
        };
        peers.join(&session).await.unwrap();
        assert_eq!(peers.fetch(&asset).await.unwrap(), None);
        assert!(!peers.offer(&asset, b"x").await.unwrap());
    }
}
