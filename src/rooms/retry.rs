use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::errors::{PersistentStorageFailure, StorageError};

/// Attempt budget and backoff for storage calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

/// Runs a fallible storage operation with linear backoff between attempts.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Invoke `operation` until it succeeds or `max_attempts` calls have failed.
    ///
    /// Attempt `n` that fails is followed by a pause of `base_delay * n`.
    /// The error of the last attempt is returned inside a
    /// [`PersistentStorageFailure`].
    pub async fn execute<T, F, Fut>(
        &self,
        operation_name: &str,
        mut operation: F,
    ) -> Result<T, PersistentStorageFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            info!("[DbRetry] Attempt {}/{} for {}", attempt, max_attempts, operation_name);
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(
                        "[DbRetry] Error during {} (attempt {}/{}): {}",
                        operation_name, attempt, max_attempts, e
                    );
                    if attempt >= max_attempts {
                        error!("[DbRetry] {} failed after {} attempts", operation_name, max_attempts);
                        return Err(PersistentStorageFailure {
                            operation: operation_name.to_string(),
                            attempts: attempt,
                            last_error: e,
                        });
                    }
                    let backoff = self.policy.base_delay * attempt;
                    info!("[DbRetry] Retrying {} in {:?}", operation_name, backoff);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}
