//! Polling with exponential backoff.
//!
//! [`wait_until`] polls a probe until it reports readiness, a terminal
//! failure, or the policy deadline passes. [`retry`] re-issues an
//! idempotent mutation until it succeeds.

use crate::error::{CoreError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Backoff schedule and deadline.
///
/// The n-th wait is `multiplier * base^(n-1)`, clamped to
/// `[floor, ceiling]` and never longer than the time left.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub floor: Duration,
    pub multiplier: Duration,
    pub base: f64,
    pub ceiling: Duration,
    pub deadline: Duration,
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// One-second steps growing by 1.3, capped at 30s.
    pub fn new(deadline: Duration) -> Self {
        Self {
            floor: Duration::from_secs(1),
            multiplier: Duration::from_secs(1),
            base: 1.3,
            ceiling: Duration::from_secs(30),
            deadline,
            max_attempts: None,
        }
    }

    /// Background tasks on the control plane.
    pub fn remote_task() -> Self {
        Self::new(Duration::from_secs(300))
            .floor(Duration::from_millis(100))
            .multiplier(Duration::from_millis(100))
            .ceiling(Duration::from_secs(10))
    }

    /// Boot, shutdown and first-boot initialization.
    pub fn vm_lifecycle() -> Self {
        Self::new(Duration::from_secs(1200))
    }

    /// Short config writes the control plane may transiently reject.
    pub fn config_write() -> Self {
        Self::new(Duration::from_secs(30)).ceiling(Duration::from_secs(10))
    }

    pub fn floor(mut self, floor: Duration) -> Self {
        self.floor = floor;
        self
    }

    pub fn multiplier(mut self, multiplier: Duration) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn base(mut self, base: f64) -> Self {
        self.base = base;
        self
    }

    pub fn ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Wait after the `attempt`-th (1-based) unsuccessful try.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.multiplier.as_secs_f64() * self.base.powi(exp);
        let raw = if secs.is_finite() && secs < self.ceiling.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.ceiling
        };
        raw.max(self.floor).min(self.ceiling.max(self.floor))
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

/// Outcome of one poll.
#[derive(Debug)]
pub enum Probe<T> {
    /// Not done yet; poll again.
    Pending,
    /// Done.
    Ready(T),
    /// Will never complete; stop polling.
    Failed(CoreError),
}

/// Poll `probe` until it is ready.
///
/// A probe returning `Err` is treated as transient; its message is kept
/// for the timeout error. `Probe::Failed` ends the wait immediately.
pub async fn wait_until<T, F, Fut>(operation: &str, policy: &RetryPolicy, mut probe: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Probe<T>>>,
{
    let start = Instant::now();
    let deadline = start + policy.deadline;
    let mut attempt = 0u32;
    let mut last_error: Option<String> = None;

    loop {
        attempt += 1;
        match probe().await {
            Ok(Probe::Ready(value)) => {
                tracing::debug!(
                    operation,
                    attempts = attempt,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Wait complete"
                );
                return Ok(value);
            }
            Ok(Probe::Failed(e)) => {
                tracing::debug!(operation, error = %e, "Wait failed");
                return Err(e);
            }
            Ok(Probe::Pending) => {
                tracing::trace!(operation, attempt, "Still pending");
            }
            Err(e) => {
                tracing::debug!(operation, attempt, error = %e, "Probe error, retrying");
                last_error = Some(e.to_string());
            }
        }

        let now = Instant::now();
        if now >= deadline || policy.exhausted(attempt) {
            tracing::warn!(
                operation,
                attempts = attempt,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Wait timed out"
            );
            let operation = match last_error {
                Some(e) => format!("{operation} (last error: {e})"),
                None => operation.to_string(),
            };
            return Err(CoreError::Timeout {
                operation,
                after: policy.deadline,
            });
        }
        tokio::time::sleep(policy.delay(attempt).min(deadline - now)).await;
    }
}

/// Re-issue an idempotent `action` until it succeeds.
///
/// Gives up when attempts run out or the deadline passes, returning the
/// last error from `action` unchanged.
pub async fn retry<T, F, Fut>(operation: &str, policy: &RetryPolicy, mut action: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let deadline = start + policy.deadline;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match action().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let now = Instant::now();
                if now >= deadline || policy.exhausted(attempt) {
                    tracing::warn!(operation, attempts = attempt, error = %e, "Giving up");
                    return Err(e);
                }
                tracing::debug!(operation, attempt, error = %e, "Retrying");
                tokio::time::sleep(policy.delay(attempt).min(deadline - now)).await;
            }
        }
    }
}
