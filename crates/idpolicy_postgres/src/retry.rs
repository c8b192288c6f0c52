//! Bounded retry for transient database failures.
//!
//! Only pool exhaustion and I/O errors are retried; anything else (bad SQL,
//! constraint violations, decode failures) fails fast as `Internal` so the
//! caller's own error mapping can take over.

use std::future::Future;
use std::time::Duration;

use anyhow::anyhow;

use idpolicy_core::ports::Result;
use idpolicy_core::PolicyError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Must be at least 1.
    pub attempts: u32,
    /// Base backoff; attempt n sleeps n times this.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

pub(crate) fn is_transient(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_))
}

/// Run `op` until it succeeds, fails non-transiently, or the attempt
/// budget is spent.
pub(crate) async fn with_retry<T, F, Fut>(policy: RetryPolicy, op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) => {
                if attempt >= attempts {
                    return Err(PolicyError::StorageUnavailable {
                        attempts: attempt,
                        source: anyhow!(e),
                    });
                }
                tracing::warn!(attempt, error = %e, "transient database failure, retrying");
                tokio::time::sleep(policy.backoff * attempt).await;
            }
            Err(e) => return Err(PolicyError::Internal(anyhow!(e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(0),
        }
    }

    #[test]
    fn transient_classification() {
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
        assert!(is_transient(&sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset"
        ))));
        assert!(!is_transient(&sqlx::Error::RowNotFound));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let out = with_retry(policy(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(sqlx::Error::PoolTimedOut)
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_budget_is_storage_unavailable() {
        let err = with_retry::<i32, _, _>(policy(), || async {
            Err(sqlx::Error::PoolTimedOut)
        })
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            PolicyError::StorageUnavailable { attempts: 3, .. }
        ));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn non_transient_fails_fast() {
        let calls = AtomicU32::new(0);
        let err = with_retry::<i32, _, _>(policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, PolicyError::Internal(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
