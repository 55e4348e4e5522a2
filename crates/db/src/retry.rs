//! Backoff for transient SQLite errors on cache writes.
//!
//! Concurrent job analyses write to the same database file. Under WAL a
//! writer can still hit SQLITE_BUSY (5) or SQLITE_LOCKED (6) while another
//! transaction commits, so cache writes go through [`with_retry`].

use std::{future::Future, time::Duration};

use sqlx::Error as SqlxError;

use crate::CacheError;

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    /// First delay; doubles per attempt.
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay added as jitter (0.0 to 1.0).
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 50,
            max_delay_ms: 2000,
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    /// Cleanup batches compete with analysis writes for the write lock.
    pub fn for_cleanup() -> Self {
        Self {
            max_retries: 10,
            base_delay_ms: 100,
            max_delay_ms: 5000,
            jitter_factor: 0.3,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        let capped = exponential.min(self.max_delay_ms);

        let jitter_range = (capped as f64 * self.jitter_factor.clamp(0.0, 1.0)) as u64;
        let jitter = if jitter_range > 0 {
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos() as u64;
            nanos % jitter_range
        } else {
            0
        };

        Duration::from_millis(capped + jitter)
    }
}

/// SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_IOERR (10) and its extended
/// codes (`code & 0xFF == 10`).
pub fn is_retryable_error(e: &SqlxError) -> bool {
    let SqlxError::Database(db_err) = e else {
        return false;
    };
    let Some(code) = db_err.code() else {
        return false;
    };
    match code.as_ref() {
        "5" | "6" | "10" => true,
        other => other
            .parse::<u32>()
            .is_ok_and(|n| n > 10 && (n & 0xFF) == 10),
    }
}

/// Run `f` until it succeeds, fails with a non-transient error, or the retry
/// budget is spent.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation: &str,
    mut f: F,
) -> Result<T, CacheError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CacheError>>,
{
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(operation, attempts = attempt + 1, "Cache write succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                let delay = config.delay_for(attempt);
                tracing::warn!(
                    operation,
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient SQLite error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if attempt > 0 {
                    tracing::error!(operation, attempts = attempt + 1, error = %e, "Cache write failed after retries");
                }
                return Err(e);
            }
        }
    }
}
