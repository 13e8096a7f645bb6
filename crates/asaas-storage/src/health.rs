//! Object store health check

use anyhow::Result;
use opendal::Operator;

/// Verify the object store is reachable by listing the root
pub async fn check_health(op: &Operator) -> Result<()> {
    op.list("/")
        .await
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!("object store health check failed: {e}"))
}

/// Returns true if the object store is reachable, false otherwise
pub async fn is_healthy(op: &Operator) -> bool {
    check_health(op).await.is_ok()
}
