//! Progress reporting for stage runs.
//!
//! Events from the sync core are rendered as structured `tracing` output,
//! which suits both terminals and CI logs.

use std::sync::Arc;

use projectlens::sync::{ProgressCallback, SyncProgress};

/// Logging reporter using tracing for structured output.
pub struct LoggingReporter;

impl LoggingReporter {
    pub fn new() -> Self {
        Self
    }

    /// Convert to a ProgressCallback for the library.
    pub fn as_callback(self: &Arc<Self>) -> Arc<ProgressCallback> {
        let reporter = Arc::clone(self);
        Arc::new(Box::new(move |event| {
            reporter.handle(event);
        }))
    }

    pub fn handle(&self, event: SyncProgress) {
        match event {
            SyncProgress::StageStarted {
                workspace_id,
                stage,
                planned,
                concurrency,
            } => {
                tracing::info!(workspace = %workspace_id, %stage, planned, concurrency, "Stage started");
            }

            SyncProgress::StageSkipped {
                workspace_id,
                stage,
                reason,
            } => {
                tracing::info!(workspace = %workspace_id, %stage, reason = %reason, "Stage skipped");
            }

            SyncProgress::RequestCompleted {
                workspace_id,
                stage,
                endpoint,
                cached,
                elapsed,
            } => {
                tracing::debug!(
                    workspace = %workspace_id,
                    %stage,
                    endpoint = %endpoint,
                    cached,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Request completed"
                );
            }

            SyncProgress::RequestFailed {
                workspace_id,
                stage,
                endpoint,
                error,
            } => {
                tracing::warn!(workspace = %workspace_id, %stage, endpoint = %endpoint, error = %error, "Request failed");
            }

            SyncProgress::RetryScheduled {
                workspace_id,
                stage,
                endpoint,
                attempt,
                delay,
            } => {
                tracing::warn!(
                    workspace = %workspace_id,
                    %stage,
                    endpoint = %endpoint,
                    attempt,
                    retry_after_ms = delay.as_millis() as u64,
                    "Retrying request"
                );
            }

            SyncProgress::DeltaApplied {
                workspace_id,
                collection,
                created,
                updated,
                deleted,
            } => {
                tracing::info!(workspace = %workspace_id, collection = %collection, created, updated, deleted, "Saved changes");
            }

            SyncProgress::HighRelevanceIssue {
                workspace_id,
                issue_key,
                summary,
                score,
            } => {
                tracing::info!(workspace = %workspace_id, issue = %issue_key, score, "Needs attention: {}", summary);
            }

            SyncProgress::Yielded {
                workspace_id,
                stage,
                remaining,
            } => {
                tracing::info!(workspace = %workspace_id, %stage, remaining, "Yielded to higher priority stage");
            }

            SyncProgress::StageCompleted {
                workspace_id,
                stage,
                state,
                processed,
                successful,
                duration,
            } => {
                tracing::debug!(
                    workspace = %workspace_id,
                    %stage,
                    %state,
                    processed,
                    successful,
                    duration_ms = duration.as_millis() as u64,
                    "Stage completed"
                );
            }

            _ => {}
        }
    }
}

impl Default for LoggingReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use projectlens::sync::{Stage, StageState};

    use super::*;

    #[test]
    fn test_callback_handles_every_event() {
        let reporter = Arc::new(LoggingReporter::new());
        let callback = reporter.as_callback();

        callback(SyncProgress::StageStarted {
            workspace_id: "acme".into(),
            stage: Stage::Stage1,
            planned: 3,
            concurrency: 5,
        });
        callback(SyncProgress::RetryScheduled {
            workspace_id: "acme".into(),
            stage: Stage::Stage2,
            endpoint: "/issues".into(),
            attempt: 1,
            delay: Duration::from_millis(1000),
        });
        callback(SyncProgress::StageCompleted {
            workspace_id: "acme".into(),
            stage: Stage::Stage1,
            state: StageState::Completed,
            processed: 3,
            successful: 3,
            duration: Duration::from_millis(120),
        });
    }
}
