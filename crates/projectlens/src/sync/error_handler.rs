//! Classification, retry and recovery for stage requests.
//!
//! | Kind       | Recoverable | Strategy                          |
//! |------------|-------------|-----------------------------------|
//! | network    | yes         | retry with backoff                |
//! | rate limit | yes         | retry, waiting for the reset time |
//! | validation | no          | abort                             |
//! | server     | bounded     | retry with one fewer attempt      |
//! | unknown    | no          | escalate                          |
//!
//! Once retries run out a recoverable error falls back to cached data when
//! the context allows it, otherwise it escalates.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use super::progress::{ProgressCallback, SyncProgress, emit};
use super::shutdown::ShutdownSignal;
use super::types::{Stage, SyncConfig};
use crate::queue::RequestPriority;
use crate::remote::{ApiRequest, RemoteError};
use crate::retry::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    RateLimit,
    Validation,
    Server,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 5] = [
        ErrorKind::Network,
        ErrorKind::RateLimit,
        ErrorKind::Validation,
        ErrorKind::Server,
        ErrorKind::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Validation => "validation",
            ErrorKind::Server => "server",
            ErrorKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ErrorClassification {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub recoverable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryStrategy {
    Retry,
    Fallback,
    Escalation,
    Abort,
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::Fallback => "fallback",
            RecoveryStrategy::Escalation => "escalation",
            RecoveryStrategy::Abort => "abort",
        };
        f.write_str(s)
    }
}

/// Describes one logical request for correlation across retries.
#[derive(Debug, Clone)]
pub struct StageExecutionContext {
    pub execution_id: Uuid,
    pub workspace_id: String,
    pub stage: Stage,
    pub endpoint: String,
    pub params: Vec<(String, String)>,
    pub priority: RequestPriority,
    pub started_at: DateTime<Utc>,
    /// A stale cached response may stand in if retries run out.
    pub fallback_available: bool,
}

impl StageExecutionContext {
    pub fn new(workspace_id: &str, stage: Stage, request: &ApiRequest) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            workspace_id: workspace_id.to_string(),
            stage,
            endpoint: request.endpoint.clone(),
            params: request.params.clone(),
            priority: stage.priority(),
            started_at: Utc::now(),
            fallback_available: false,
        }
    }

    pub fn with_fallback(mut self, available: bool) -> Self {
        self.fallback_available = available;
        self
    }
}

/// Structured record of one recovery attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecoveryResult {
    pub strategy: RecoveryStrategy,
    /// For `Retry`: the backoff completed and the operation may run again.
    /// For `Fallback`: the caller may serve cached data.
    pub recovered: bool,
    /// Failures seen so far for this execution id.
    pub attempt: usize,
    /// Time spent recovering, including any backoff wait.
    pub duration: Duration,
    pub steps: Vec<String>,
    pub metadata: HashMap<String, String>,
}

/// Terminal failure of a stage request, with its full context.
#[derive(Debug, Error)]
#[error("{stage} request to {endpoint} for {workspace_id} failed after {attempts} attempt(s) ({strategy}): {source}")]
pub struct StageError {
    pub execution_id: Uuid,
    pub workspace_id: String,
    pub stage: Stage,
    pub endpoint: String,
    pub attempts: usize,
    pub classification: ErrorClassification,
    pub strategy: RecoveryStrategy,
    #[source]
    pub source: RemoteError,
}

impl StageError {
    /// Whether the stage as a whole must fail.
    pub fn is_escalated(&self) -> bool {
        self.strategy == RecoveryStrategy::Escalation
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorHandlerStats {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    /// Successes that needed at least one retry.
    pub recovered: u64,
    pub aborted: u64,
    pub escalated: u64,
    pub fallbacks: u64,
    pub by_kind: HashMap<String, u64>,
}

/// Wraps stage requests with classification, retry and recovery.
pub struct StageErrorHandler {
    config: SyncConfig,
    retry: RetryConfig,
    attempts: Mutex<HashMap<Uuid, usize>>,
    stats: Mutex<ErrorHandlerStats>,
    shutdown: ShutdownSignal,
    progress: Option<Arc<ProgressCallback>>,
}

impl StageErrorHandler {
    pub fn new(config: SyncConfig) -> Self {
        let retry = config.retry_config();
        Self {
            config,
            retry,
            attempts: Mutex::new(HashMap::new()),
            stats: Mutex::new(ErrorHandlerStats::default()),
            shutdown: ShutdownSignal::new(),
            progress: None,
        }
    }

    /// Report scheduled retries as [`SyncProgress::RetryScheduled`].
    pub fn with_progress(mut self, progress: Arc<ProgressCallback>) -> Self {
        self.progress = Some(progress);
        self
    }

    fn stats_mut(&self) -> MutexGuard<'_, ErrorHandlerStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn attempts_mut(&self) -> MutexGuard<'_, HashMap<Uuid, usize>> {
        self.attempts.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn classify(&self, error: &RemoteError) -> ErrorClassification {
        let (kind, severity, recoverable) = match error {
            RemoteError::Network { .. } | RemoteError::Timeout { .. } => {
                (ErrorKind::Network, Severity::Medium, true)
            }
            RemoteError::RateLimited { .. } => (ErrorKind::RateLimit, Severity::Medium, true),
            RemoteError::Validation { .. }
            | RemoteError::Constraint { .. }
            | RemoteError::NotFound { .. } => (ErrorKind::Validation, Severity::Low, false),
            RemoteError::Server { .. } => (ErrorKind::Server, Severity::High, true),
            RemoteError::Api { .. } | RemoteError::Decode { .. } => {
                (ErrorKind::Unknown, Severity::High, false)
            }
            RemoteError::AuthRequired | RemoteError::Internal { .. } => {
                (ErrorKind::Unknown, Severity::Critical, false)
            }
        };
        ErrorClassification {
            kind,
            severity,
            recoverable,
        }
    }

    /// Retries allowed for an error kind.
    pub fn max_retries_for(&self, kind: ErrorKind) -> usize {
        match kind {
            ErrorKind::Network | ErrorKind::RateLimit => self.retry.max_retries,
            ErrorKind::Server if self.retry.max_retries > 1 => self.retry.max_retries - 1,
            ErrorKind::Server => self.retry.max_retries,
            ErrorKind::Validation | ErrorKind::Unknown => 0,
        }
    }

    /// Backoff before retry number `attempt` (1-based).
    ///
    /// Rate limit errors wait at least until the reported reset, capped by
    /// `rate_limit_max_wait_ms`.
    pub fn retry_delay(&self, kind: ErrorKind, attempt: usize, error: &RemoteError) -> Duration {
        let backoff = self
            .retry
            .delays()
            .nth(attempt.saturating_sub(1))
            .unwrap_or(self.retry.max_delay);
        if kind != ErrorKind::RateLimit {
            return backoff;
        }
        let until_reset = error
            .reset_at()
            .and_then(|reset| (reset - Utc::now()).to_std().ok())
            .unwrap_or_default()
            .min(Duration::from_millis(self.config.rate_limit_max_wait_ms));
        backoff.max(until_reset)
    }

    /// Run `operation`, retrying recoverable failures.
    ///
    /// The execution id of `ctx` is kept for every attempt. A terminal
    /// failure carries the most recent error as its source.
    pub async fn execute_with_error_handling<T, F, Fut>(
        &self,
        ctx: &StageExecutionContext,
        mut operation: F,
    ) -> Result<T, StageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        self.stats_mut().executions += 1;
        let result = loop {
            match operation().await {
                Ok(value) => break Ok(value),
                Err(err) => {
                    let recovery = self.attempt_recovery(ctx, &err).await;
                    if recovery.strategy == RecoveryStrategy::Retry && recovery.recovered {
                        continue;
                    }
                    break Err(StageError {
                        execution_id: ctx.execution_id,
                        workspace_id: ctx.workspace_id.clone(),
                        stage: ctx.stage,
                        endpoint: ctx.endpoint.clone(),
                        attempts: recovery.attempt,
                        classification: self.classify(&err),
                        strategy: recovery.strategy,
                        source: err,
                    });
                }
            }
        };

        let failures = self.attempts_mut().remove(&ctx.execution_id).unwrap_or(0);
        let mut stats = self.stats_mut();
        match &result {
            Ok(_) => {
                stats.successes += 1;
                if failures > 0 {
                    stats.recovered += 1;
                }
            }
            Err(_) => stats.failures += 1,
        }
        result
    }

    /// Pick and carry out a recovery strategy for one failure.
    ///
    /// For `Retry` this waits out the backoff, so `duration` covers the wait.
    pub async fn attempt_recovery(
        &self,
        ctx: &StageExecutionContext,
        error: &RemoteError,
    ) -> ErrorRecoveryResult {
        let started = Instant::now();
        let classification = self.classify(error);
        let attempt = {
            let mut attempts = self.attempts_mut();
            let count = attempts.entry(ctx.execution_id).or_insert(0);
            *count += 1;
            *count
        };

        let mut steps = vec![format!(
            "classified as {} ({:?})",
            classification.kind.as_str(),
            classification.severity
        )];
        let mut metadata = HashMap::from([
            ("execution_id".to_string(), ctx.execution_id.to_string()),
            ("kind".to_string(), classification.kind.as_str().to_string()),
            ("endpoint".to_string(), ctx.endpoint.clone()),
        ]);

        let strategy = match classification.kind {
            ErrorKind::Validation => RecoveryStrategy::Abort,
            ErrorKind::Unknown => RecoveryStrategy::Escalation,
            kind if attempt <= self.max_retries_for(kind) => RecoveryStrategy::Retry,
            _ if ctx.fallback_available => RecoveryStrategy::Fallback,
            _ => RecoveryStrategy::Escalation,
        };

        let recovered = match strategy {
            RecoveryStrategy::Retry => {
                let delay = self.retry_delay(classification.kind, attempt, error);
                metadata.insert("delay_ms".to_string(), delay.as_millis().to_string());
                steps.push(format!(
                    "waiting {}ms before attempt {}",
                    delay.as_millis(),
                    attempt + 1
                ));
                tracing::warn!(
                    execution_id = %ctx.execution_id,
                    workspace_id = %ctx.workspace_id,
                    stage = %ctx.stage,
                    endpoint = %ctx.endpoint,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Request failed, retrying"
                );
                emit(
                    self.progress.as_deref(),
                    SyncProgress::RetryScheduled {
                        workspace_id: ctx.workspace_id.clone(),
                        stage: ctx.stage,
                        endpoint: ctx.endpoint.clone(),
                        attempt,
                        delay,
                    },
                );
                let completed = self.shutdown.sleep(delay).await;
                if !completed {
                    steps.push("interrupted by shutdown".to_string());
                }
                completed
            }
            RecoveryStrategy::Fallback => {
                steps.push(format!("retries exhausted after {attempt} attempt(s), using cached data"));
                true
            }
            RecoveryStrategy::Abort => {
                steps.push("not retryable, aborting".to_string());
                false
            }
            RecoveryStrategy::Escalation => {
                steps.push("escalating".to_string());
                tracing::error!(
                    execution_id = %ctx.execution_id,
                    workspace_id = %ctx.workspace_id,
                    stage = %ctx.stage,
                    endpoint = %ctx.endpoint,
                    attempt,
                    error = %error,
                    "Request failed, escalating"
                );
                false
            }
        };

        {
            let mut stats = self.stats_mut();
            *stats
                .by_kind
                .entry(classification.kind.as_str().to_string())
                .or_default() += 1;
            match strategy {
                RecoveryStrategy::Retry => stats.retries += 1,
                RecoveryStrategy::Fallback => stats.fallbacks += 1,
                RecoveryStrategy::Abort => stats.aborted += 1,
                RecoveryStrategy::Escalation => stats.escalated += 1,
            }
        }

        ErrorRecoveryResult {
            strategy,
            recovered,
            attempt,
            duration: started.elapsed(),
            steps,
            metadata,
        }
    }

    pub fn stats(&self) -> ErrorHandlerStats {
        self.stats_mut().clone()
    }

    /// Interrupt pending backoff waits; later failures are not retried.
    /// Safe to call repeatedly.
    pub fn dispose(&self) {
        if self.shutdown.trigger() {
            tracing::debug!("Stage error handler disposed");
        }
        self.attempts_mut().clear();
    }

    pub fn is_disposed(&self) -> bool {
        self.shutdown.is_triggered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(base_ms: u64, max_retries: usize) -> SyncConfig {
        SyncConfig {
            backoff_base_ms: base_ms,
            backoff_max_ms: base_ms * 100,
            max_retries,
            ..SyncConfig::default()
        }
    }

    fn ctx() -> StageExecutionContext {
        StageExecutionContext::new("acme", Stage::Stage2, &ApiRequest::get("/issues"))
    }

    #[test]
    fn test_classification_table() {
        let handler = StageErrorHandler::new(SyncConfig::default());
        let cases = [
            (RemoteError::network("reset"), ErrorKind::Network, true),
            (RemoteError::Timeout { elapsed_ms: 10 }, ErrorKind::Network, true),
            (RemoteError::RateLimited { reset_at: None }, ErrorKind::RateLimit, true),
            (RemoteError::validation("bad"), ErrorKind::Validation, false),
            (
                RemoteError::Constraint {
                    message: "dup".into(),
                },
                ErrorKind::Validation,
                false,
            ),
            (RemoteError::server(503, "down"), ErrorKind::Server, true),
            (RemoteError::internal("boom"), ErrorKind::Unknown, false),
            (RemoteError::AuthRequired, ErrorKind::Unknown, false),
        ];
        for (err, kind, recoverable) in cases {
            let c = handler.classify(&err);
            assert_eq!(c.kind, kind, "{err}");
            assert_eq!(c.recoverable, recoverable, "{err}");
        }
        assert_eq!(
            handler.classify(&RemoteError::AuthRequired).severity,
            Severity::Critical
        );
    }

    #[test]
    fn test_server_errors_get_fewer_retries() {
        let handler = StageErrorHandler::new(config(100, 3));
        assert_eq!(handler.max_retries_for(ErrorKind::Network), 3);
        assert_eq!(handler.max_retries_for(ErrorKind::Server), 2);
        assert_eq!(handler.max_retries_for(ErrorKind::Validation), 0);
    }

    #[test]
    fn test_rate_limit_delay_honors_reset_with_cap() {
        let handler = StageErrorHandler::new(SyncConfig {
            rate_limit_max_wait_ms: 5_000,
            ..config(100, 3)
        });
        let soon = RemoteError::RateLimited {
            reset_at: Some(Utc::now() + chrono::Duration::seconds(2)),
        };
        let delay = handler.retry_delay(ErrorKind::RateLimit, 1, &soon);
        assert!(delay > Duration::from_millis(1_500) && delay <= Duration::from_secs(2));

        let far = RemoteError::RateLimited {
            reset_at: Some(Utc::now() + chrono::Duration::hours(1)),
        };
        assert_eq!(
            handler.retry_delay(ErrorKind::RateLimit, 1, &far).as_millis(),
            5_000
        );
        assert_eq!(
            handler.retry_delay(ErrorKind::Network, 2, &far).as_millis(),
            200
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_twice_then_succeeds() {
        let handler = StageErrorHandler::new(config(100, 3));
        let calls = &AtomicUsize::new(0);
        let ctx = ctx();

        let started = Instant::now();
        let value = handler
            .execute_with_error_handling(&ctx, move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RemoteError::network("connection reset"))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(100 + 200));

        let stats = handler.stats();
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.recovered, 1);
        assert_eq!(stats.retries, 2);
    }

    #[tokio::test]
    async fn test_validation_aborts_without_retry() {
        let handler = StageErrorHandler::new(config(100, 3));
        let calls = &AtomicUsize::new(0);
        let ctx = ctx();

        let err = handler
            .execute_with_error_handling(&ctx, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RemoteError::validation("bad count"))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.strategy, RecoveryStrategy::Abort);
        assert_eq!(err.attempts, 1);
        assert_eq!(err.execution_id, ctx.execution_id);
        assert_eq!(err.endpoint, "/issues");
        assert!(matches!(err.source, RemoteError::Validation { .. }));
        assert_eq!(handler.stats().aborted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_escalate_with_last_error() {
        let handler = StageErrorHandler::new(config(10, 2));
        let calls = &AtomicUsize::new(0);

        let err = handler
            .execute_with_error_handling(&ctx(), move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RemoteError::network(format!("failure {n}")))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.attempts, 3);
        assert!(err.is_escalated());
        assert!(err.to_string().contains("failure 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fall_back_when_available() {
        let handler = StageErrorHandler::new(config(10, 1));
        let ctx = ctx().with_fallback(true);

        let err = handler
            .execute_with_error_handling(&ctx, || async {
                Err::<(), _>(RemoteError::server(502, "bad gateway"))
            })
            .await
            .unwrap_err();

        assert_eq!(err.strategy, RecoveryStrategy::Fallback);
        assert_eq!(handler.stats().fallbacks, 1);
    }

    #[tokio::test]
    async fn test_attempt_recovery_reports_steps() {
        let handler = StageErrorHandler::new(config(1, 3));
        let ctx = ctx();

        let first = handler
            .attempt_recovery(&ctx, &RemoteError::network("reset"))
            .await;
        assert_eq!(first.strategy, RecoveryStrategy::Retry);
        assert!(first.recovered);
        assert_eq!(first.attempt, 1);
        assert_eq!(first.metadata["execution_id"], ctx.execution_id.to_string());
        assert!(first.steps.len() >= 2);

        let second = handler
            .attempt_recovery(&ctx, &RemoteError::network("reset"))
            .await;
        assert_eq!(second.attempt, 2);

        let unknown = handler
            .attempt_recovery(&ctx, &RemoteError::internal("boom"))
            .await;
        assert_eq!(unknown.strategy, RecoveryStrategy::Escalation);
        assert!(!unknown.recovered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_interrupts_backoff() {
        let handler = Arc::new(StageErrorHandler::new(config(60_000, 3)));
        let task = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                handler
                    .execute_with_error_handling(&ctx(), || async {
                        Err::<(), _>(RemoteError::network("down"))
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        handler.dispose();
        handler.dispose();
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.attempts, 1);
        assert!(handler.is_disposed());
    }
}
