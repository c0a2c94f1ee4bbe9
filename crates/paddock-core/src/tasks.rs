//! Waiting on control-plane background tasks.
//!
//! Many mutations return before their effect lands and queue a cluster
//! task instead. [`TaskTracker::run_and_wait`] snapshots the incomplete
//! tasks, runs the mutation, then waits until no task outside the snapshot
//! is still incomplete.

use crate::error::{CoreError, Result};
use crate::retry::{wait_until, Probe, RetryPolicy};
use paddock_pve::{Api, ClusterTask};
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

/// Time the server gets to register a task before the first poll.
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct TaskTracker {
    api: Api,
    settle: Duration,
    policy: RetryPolicy,
}

impl TaskTracker {
    pub fn new(api: Api) -> Self {
        Self {
            api,
            settle: DEFAULT_SETTLE,
            policy: RetryPolicy::remote_task(),
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn incomplete(&self) -> Result<Vec<ClusterTask>> {
        let tasks: Vec<ClusterTask> = self.api.get("/cluster/tasks").await?;
        Ok(tasks.into_iter().filter(ClusterTask::is_incomplete).collect())
    }

    /// Run `action` and wait for the background tasks it started.
    ///
    /// A new task that finished with a status other than `OK` fails the
    /// wait with [`CoreError::TaskFailed`].
    pub async fn run_and_wait<T, F, Fut>(&self, what: &str, action: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let before: HashSet<String> = self
            .incomplete()
            .await?
            .into_iter()
            .map(|t| t.upid)
            .collect();

        let value = action().await?;
        tokio::time::sleep(self.settle).await;

        let before = &before;
        wait_until(what, &self.policy, move || async move {
            let fresh: Vec<ClusterTask> = self
                .incomplete()
                .await?
                .into_iter()
                .filter(|t| !before.contains(&t.upid))
                .collect();

            if let Some(failed) = fresh.iter().find(|t| t.status.is_some()) {
                return Ok(Probe::Failed(CoreError::TaskFailed {
                    upid: failed.upid.clone(),
                    status: failed.status.clone().unwrap_or_default(),
                }));
            }
            if fresh.is_empty() {
                Ok(Probe::Ready(()))
            } else {
                tracing::trace!(what, pending = fresh.len(), "Tasks still running");
                Ok(Probe::Pending)
            }
        })
        .await?;

        Ok(value)
    }
}
