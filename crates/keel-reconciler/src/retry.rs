use std::future::Future;
use std::time::Duration;

use tracing::warn;

use keel_common::config::LifecycleSettings;

use crate::adapter::AdapterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub call_timeout: Duration,
    pub delete_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_settings(s: &LifecycleSettings) -> Self {
        Self {
            max_attempts: s.max_attempts.max(1),
            initial_backoff: Duration::from_millis(s.initial_backoff_ms),
            max_backoff: Duration::from_millis(s.max_backoff_ms),
            call_timeout: Duration::from_millis(s.call_timeout_ms),
            delete_timeout: Duration::from_millis(s.delete_timeout_ms),
        }
    }

    /// Backoff before attempt `attempt + 1` (attempt is 1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&LifecycleSettings::default())
    }
}

/// Bound one adapter call; an elapsed timeout is transient.
pub async fn with_timeout<T, Fut>(limit: Duration, what: &str, fut: Fut) -> Result<T, AdapterError>
where
    Fut: Future<Output = Result<T, AdapterError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(AdapterError::Transient(format!(
            "{what} timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

/// Run `op` with a timeout per attempt, retrying transient failures with
/// exponential backoff. `on_retry` is called before each retry.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    limit: Duration,
    what: &str,
    mut on_retry: impl FnMut(),
    mut op: F,
) -> Result<T, AdapterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let mut attempt = 1;
    loop {
        match with_timeout(limit, what, op()).await {
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    op = what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient adapter error, retrying"
                );
                on_retry();
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            call_timeout: Duration::from_millis(50),
            delete_timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let p = RetryPolicy {
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_millis(1000),
            ..fast()
        };
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(2), Duration::from_millis(400));
        assert_eq!(p.backoff(3), Duration::from_millis(800));
        assert_eq!(p.backoff(4), Duration::from_millis(1000));
        assert_eq!(p.backoff(40), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let retries = AtomicU32::new(0);
        let out = retry_transient(
            &fast(),
            Duration::from_millis(50),
            "create",
            || {
                retries.fetch_add(1, Ordering::SeqCst);
            },
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AdapterError::Transient("flaky".into()))
                } else {
                    Ok(7)
                }
            },
        )
        .await;
        assert_eq!(out, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = retry_transient(
            &fast(),
            Duration::from_millis(50),
            "update",
            || {},
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AdapterError::Permanent("quota".into()))
            },
        )
        .await;
        assert!(matches!(out, Err(AdapterError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeouts_become_transient() {
        let out: Result<(), _> = with_timeout(Duration::from_millis(5), "fetch", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(out, Err(AdapterError::Transient(m)) if m.contains("timed out")));
    }
}
