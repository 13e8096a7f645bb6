//! Single-flight execution: concurrent callers share one in-flight operation.
//!
//! The operation runs on its own tokio task, so it completes even if every
//! caller stops waiting. A call made after it finishes starts a new one.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{AsaasError, AsaasResult};

type SharedOutput<T> = Result<T, Arc<AsaasError>>;
type InFlight<T> = Shared<BoxFuture<'static, SharedOutput<T>>>;

pub struct SingleFlight<T: Clone + Send + Sync + 'static> {
    slot: Arc<Mutex<Option<(u64, InFlight<T>)>>>,
    next_id: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while an operation is running.
    pub fn is_running(&self) -> bool {
        self.slot.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Attach to the running operation, or start `make()` if none is running.
    pub async fn run<F, Fut>(&self, make: F) -> AsaasResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AsaasResult<T>> + Send + 'static,
    {
        let shared = {
            let mut slot = self
                .slot
                .lock()
                .map_err(|_| anyhow::anyhow!("single-flight slot poisoned"))?;
            match slot.as_ref() {
                Some((_, running)) => running.clone(),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let fut = make();
                    let slot_ref = Arc::clone(&self.slot);
                    let handle = tokio::spawn(async move {
                        let out = fut.await.map_err(Arc::new);
                        if let Ok(mut slot) = slot_ref.lock() {
                            if matches!(slot.as_ref(), Some((running, _)) if *running == id) {
                                *slot = None;
                            }
                        }
                        out
                    });
                    let shared = async move {
                        match handle.await {
                            Ok(out) => out,
                            Err(e) => Err(Arc::new(AsaasError::Other(anyhow::anyhow!(
                                "single-flight task failed: {e}"
                            )))),
                        }
                    }
                    .boxed()
                    .shared();
                    *slot = Some((id, shared.clone()));
                    shared
                }
            }
        };

        shared.await.map_err(AsaasError::Shared)
    }
}
