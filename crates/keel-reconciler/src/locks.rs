use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per endpoint id. Lifecycle operations hold it for their
/// whole duration; waiters are served in FIFO order by tokio's mutex.
#[derive(Debug, Clone, Default)]
pub struct EndpointLocks {
    inner: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

pub struct EndpointGuard {
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl EndpointLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: &str) -> Arc<Mutex<()>> {
        self.inner
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn acquire(&self, id: &str) -> EndpointGuard {
        let guard = self.slot(id).lock_owned().await;
        EndpointGuard {
            id: id.to_string(),
            guard: Some(guard),
            locks: self.inner.clone(),
        }
    }

    /// Non-blocking variant for background work that should skip busy endpoints.
    pub fn try_acquire(&self, id: &str) -> Option<EndpointGuard> {
        let guard = self.slot(id).try_lock_owned().ok()?;
        Some(EndpointGuard {
            id: id.to_string(),
            guard: Some(guard),
            locks: self.inner.clone(),
        })
    }

    /// Number of endpoints with a live lock entry.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Drop for EndpointGuard {
    fn drop(&mut self) {
        // Release first so the strong count reflects only the map and waiters.
        drop(self.guard.take());
        self.locks
            .remove_if(&self.id, |_, m| Arc::strong_count(m) == 1);
    }
}
