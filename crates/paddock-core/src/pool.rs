//! Shared pools of hypervisor endpoint credentials.
//!
//! Each pool is a FIFO of [`ResourceRecord`]s. Consumers check a record
//! out with [`InstancePool::acquire`], which suspends while the pool is
//! empty, and hand it back with [`InstancePool::release`].
//!
//! # Example
//!
//! ```ignore
//! use paddock_core::{InstancePool, ResourceRecord};
//!
//! let pool = InstancePool::new();
//! pool.initialize(vec![ResourceRecord::new("pve-1", "default", "10.0.0.5")]).await;
//!
//! let record = pool.acquire("default").await?;
//! // ... provision against record.endpoint() ...
//! pool.release("default", record);
//! ```

use crate::error::{CoreError, Result};
use crate::record::ResourceRecord;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};

// ============================================================================
// Statistics
// ============================================================================

/// Pool statistics for observability.
///
/// All counters are atomic and can be read without locking.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Records handed out.
    pub acquired: AtomicU64,
    /// Records returned.
    pub released: AtomicU64,
    /// Records kept out of circulation because their endpoint may be dirty.
    pub withheld: AtomicU64,
}

impl PoolStats {
    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    pub fn withheld(&self) -> u64 {
        self.withheld.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Pool Implementation
// ============================================================================

/// One pool: queued records plus a permit per queued record.
///
/// A permit is taken before popping and added after pushing, so a waiter
/// woken by a release always finds a record.
struct Queue {
    records: Mutex<VecDeque<ResourceRecord>>,
    ready: Semaphore,
}

impl Queue {
    fn new(records: Vec<ResourceRecord>) -> Self {
        let ready = Semaphore::new(records.len());
        Self {
            records: Mutex::new(records.into()),
            ready,
        }
    }

    fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Pools of resource records keyed by pool id.
#[derive(Default)]
pub struct InstancePool {
    pools: RwLock<HashMap<String, Arc<Queue>>>,
    init_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    stats: PoolStats,
}

impl InstancePool {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, pool_id: &str) -> Option<Arc<Queue>> {
        self.pools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(pool_id)
            .cloned()
    }

    fn init_lock(&self, pool_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.init_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(pool_id.to_string()).or_default())
    }

    /// Group `records` by pool id and create every pool not yet present.
    ///
    /// Safe to call repeatedly and concurrently: pools that already exist
    /// are left alone, so records are never duplicated.
    pub async fn initialize(&self, records: Vec<ResourceRecord>) {
        let mut grouped: HashMap<String, Vec<ResourceRecord>> = HashMap::new();
        for record in records {
            grouped
                .entry(record.pool_id().to_string())
                .or_default()
                .push(record);
        }

        for (pool_id, records) in grouped {
            let lock = self.init_lock(&pool_id);
            let _guard = lock.lock().await;
            if self.queue(&pool_id).is_some() {
                continue;
            }
            let count = records.len();
            self.pools
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(pool_id.clone(), Arc::new(Queue::new(records)));
            tracing::info!(pool_id = %pool_id, records = count, "Pool initialized");
        }
    }

    /// Take the head record of `pool_id`, waiting while the pool is empty.
    ///
    /// Fails immediately if the pool was never initialized.
    pub async fn acquire(&self, pool_id: &str) -> Result<ResourceRecord> {
        let queue = self.queue(pool_id).ok_or_else(|| CoreError::PoolNotFound {
            pool_id: pool_id.to_string(),
            available: self.pool_ids(),
        })?;

        let start = tokio::time::Instant::now();
        if queue.ready.available_permits() == 0 {
            tracing::debug!(pool_id, "Pool empty, waiting for a release");
        }
        let permit = queue
            .ready
            .acquire()
            .await
            .map_err(|_| CoreError::PoolClosed(pool_id.to_string()))?;
        permit.forget();

        let record = queue
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| CoreError::PoolClosed(pool_id.to_string()))?;

        self.stats.acquired.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            pool_id,
            instance_id = %record.instance_id(),
            waited_ms = start.elapsed().as_millis() as u64,
            "Acquired instance"
        );
        Ok(record)
    }

    /// Like [`acquire`](Self::acquire) but gives up after `deadline`.
    pub async fn acquire_timeout(&self, pool_id: &str, deadline: Duration) -> Result<ResourceRecord> {
        match tokio::time::timeout(deadline, self.acquire(pool_id)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(pool_id, deadline_ms = deadline.as_millis() as u64, "Acquire timed out");
                Err(CoreError::Timeout {
                    operation: format!("an instance from pool '{pool_id}'"),
                    after: deadline,
                })
            }
        }
    }

    /// Return `record` to the tail of `pool_id`.
    ///
    /// An unknown pool id means a bug elsewhere; the record is dropped and
    /// the error logged rather than failing the caller.
    pub fn release(&self, pool_id: &str, record: ResourceRecord) {
        let Some(queue) = self.queue(pool_id) else {
            tracing::error!(
                pool_id,
                instance_id = %record.instance_id(),
                "Release into unknown pool, dropping record"
            );
            return;
        };

        let instance_id = record.instance_id().to_string();
        queue
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(record);
        queue.ready.add_permits(1);
        self.stats.released.fetch_add(1, Ordering::Relaxed);
        tracing::info!(pool_id, instance_id = %instance_id, "Released instance");
    }

    /// Record that `record` is being kept out of circulation.
    pub fn withhold(&self, record: &ResourceRecord) {
        self.stats.withheld.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            pool_id = %record.pool_id(),
            instance_id = %record.instance_id(),
            "NOT releasing instance, it may be dirty"
        );
    }

    /// Drop every pool. Waiting acquirers fail with `PoolClosed`.
    pub fn clear(&self) {
        let drained: Vec<(String, Arc<Queue>)> = self
            .pools
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (pool_id, queue) in drained {
            queue.ready.close();
            queue.records.lock().unwrap_or_else(|e| e.into_inner()).clear();
            tracing::debug!(pool_id = %pool_id, "Pool cleared");
        }
        self.init_locks.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Records currently queued in `pool_id`.
    pub fn available(&self, pool_id: &str) -> Option<usize> {
        self.queue(pool_id).map(|q| q.len())
    }

    /// Known pool ids, sorted.
    pub fn pool_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .pools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }
}

// ============================================================================
// Tests
// ============================================================================
