//! Shared retry utilities.
//!
//! [`RetryConfig`] turns the configured base delay, cap and attempt count
//! into a backon [`ExponentialBuilder`]. The stage error handler walks the
//! resulting delays itself (it must honor reset times and shutdown); store
//! writes use [`with_db_retry`] directly.

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder, Retryable};
use sea_orm::DbErr;

/// Configuration for retry operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Delay before the first retry. Each following delay doubles.
    pub base_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
    /// Maximum number of retries after the first attempt.
    pub max_retries: usize,
    /// Whether to add random jitter on top of each delay.
    pub with_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            max_retries: 3,
            with_jitter: false,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration, max_retries: usize) -> Self {
        Self {
            base_delay,
            max_delay,
            max_retries,
            with_jitter: false,
        }
    }

    /// Set whether to use jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.with_jitter = jitter;
        self
    }

    /// Same policy with a different retry count.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Build an exponential backoff strategy from this configuration.
    #[must_use]
    pub fn into_backoff(self) -> ExponentialBuilder {
        let mut builder = ExponentialBuilder::default()
            .with_factor(2.0)
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries);

        if self.with_jitter {
            builder = builder.with_jitter();
        }

        builder
    }

    /// The delays between attempts, in order. Yields `max_retries` items.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + Send + use<> {
        self.clone().into_backoff().build()
    }
}

/// Whether a database error is transient (locked, busy, connection trouble).
pub fn is_retryable_db_error(err: &DbErr) -> bool {
    match err {
        DbErr::ConnectionAcquire(_) | DbErr::Conn(_) => true,
        DbErr::Exec(_) | DbErr::Query(_) => {
            let err_str = err.to_string().to_lowercase();
            err_str.contains("locked")
                || err_str.contains("busy")
                || err_str.contains("timeout")
                || err_str.contains("temporarily unavailable")
        }
        _ => false,
    }
}

/// Run a database operation, retrying transient failures with backoff.
pub async fn with_db_retry<T, F, Fut>(operation: F, config: &RetryConfig) -> Result<T, DbErr>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DbErr>>,
{
    operation
        .retry(config.clone().into_backoff())
        .when(is_retryable_db_error)
        .notify(|err, dur| {
            tracing::warn!(
                backoff_ms = dur.as_millis() as u64,
                error = %err,
                "Store write failed, retrying"
            );
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.base_delay, Duration::from_secs(1));
        assert_eq!(config.max_retries, 3);
        assert!(!config.with_jitter);
        assert!(config.with_jitter(true).with_jitter);
    }

    #[test]
    fn test_delays_double_and_cap() {
        let config = RetryConfig::new(Duration::from_millis(100), Duration::from_millis(250), 4);
        // backon's float math can add a few nanoseconds
        let delays: Vec<u128> = config.delays().map(|d| d.as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 250, 250]);
    }

    #[test]
    fn test_with_max_retries_limits_delays() {
        let config = RetryConfig::default().with_max_retries(1);
        assert_eq!(config.delays().count(), 1);
        assert_eq!(RetryConfig::default().with_max_retries(0).delays().count(), 0);
    }

    #[test]
    fn test_is_retryable_db_error() {
        assert!(!is_retryable_db_error(&DbErr::Custom("x".into())));
        assert!(is_retryable_db_error(&DbErr::Conn(sea_orm::RuntimeErr::Internal(
            "refused".into()
        ))));
        assert!(is_retryable_db_error(&DbErr::Exec(sea_orm::RuntimeErr::Internal(
            "database is locked".into()
        ))));
        assert!(!is_retryable_db_error(&DbErr::Exec(sea_orm::RuntimeErr::Internal(
            "UNIQUE constraint failed".into()
        ))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_db_retry_retries_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_capture = Arc::clone(&calls);

        let result = with_db_retry(
            move || {
                let calls = Arc::clone(&calls_capture);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(DbErr::Exec(sea_orm::RuntimeErr::Internal(
                            "database is locked".into(),
                        )))
                    } else {
                        Ok(7)
                    }
                }
            },
            &RetryConfig::new(Duration::from_millis(10), Duration::from_millis(100), 3),
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_db_retry_does_not_retry_permanent_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_capture = Arc::clone(&calls);

        let err = with_db_retry(
            move || {
                let calls = Arc::clone(&calls_capture);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(DbErr::Custom("boom".into()))
                }
            },
            &RetryConfig::default(),
        )
        .await
        .expect_err("expected error");

        assert_eq!(err.to_string(), "Custom Error: boom");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
