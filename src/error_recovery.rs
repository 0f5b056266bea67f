//! Retry policy for device connections.
//
// Backends retry device connections with a fixed backoff before reporting a
// connection error.

use crate::error::{AppResult, EchemError};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// A policy that tries once.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff_delay: Duration::ZERO,
        }
    }
}

/// Runs `operation` until it succeeds or the policy is exhausted.
///
/// The last error is wrapped in a `Connection` error naming the attempt count.
pub async fn retry_with_policy<T, F, Fut>(
    what: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(what, attempt, attempts, error = %err, "Attempt failed");
                last_error = Some(err);
            }
        }
        if attempt < attempts {
            sleep(policy.backoff_delay).await;
        }
    }
    Err(EchemError::Connection(format!(
        "{what} failed after {attempts} attempts: {}",
        last_error.map_or_else(|| "no attempt made".to_string(), |e| e.to_string())
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_logic_succeeds() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(10),
        };
        let result = retry_with_policy("connect", &policy, || async {
            if attempts.fetch_add(1, Ordering::SeqCst) + 1 >= 2 {
                Ok(())
            } else {
                Err(EchemError::Device("link down".to_string()))
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_logic_fails() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(10),
        };
        let result: AppResult<()> = retry_with_policy("connect", &policy, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(EchemError::Device("link down".to_string()))
        })
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err, EchemError::Connection(_)));
        assert!(err.to_string().contains("3 attempts"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
