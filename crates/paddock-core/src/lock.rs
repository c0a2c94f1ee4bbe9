//! Named per-endpoint mutexes.
//!
//! The control plane misbehaves under concurrent zone and subnet mutation,
//! so provisioning and teardown take the lock for their endpoint first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Lazily created async mutexes keyed by `host:port`.
#[derive(Clone, Default)]
pub struct EndpointLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl EndpointLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `endpoint`.
    pub async fn lock(&self, endpoint: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(endpoint.to_string()).or_default())
        };
        tracing::trace!(endpoint, "Waiting for endpoint lock");
        lock.lock_owned().await
    }

    /// Number of endpoints a lock has been created for.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_same_endpoint_is_exclusive() {
        let locks = EndpointLocks::new();
        let guard = locks.lock("10.0.0.1:8006").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.lock("10.0.0.1:8006").await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_endpoints_do_not_block() {
        let locks = EndpointLocks::new();
        let _a = locks.lock("10.0.0.1:8006").await;
        let _b = locks.lock("10.0.0.2:8006").await;
        assert_eq!(locks.len(), 2);
    }
}
