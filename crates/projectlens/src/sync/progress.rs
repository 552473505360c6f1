//! Progress reporting types for stage execution.
//!
//! Events are delivered synchronously on whichever task produced them, so
//! callbacks should be cheap (log a line, bump a counter).

use std::time::Duration;

use super::types::{Stage, StageState};

/// Progress events emitted while stages run.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum SyncProgress {
    /// A stage pass started.
    StageStarted {
        workspace_id: String,
        stage: Stage,
        /// Number of planned requests.
        planned: usize,
        /// Worker count chosen by the rate limiter.
        concurrency: usize,
    },

    /// A stage pass did no work.
    StageSkipped {
        workspace_id: String,
        stage: Stage,
        reason: String,
    },

    /// One request finished successfully.
    RequestCompleted {
        workspace_id: String,
        stage: Stage,
        endpoint: String,
        /// Served from the response cache.
        cached: bool,
        elapsed: Duration,
    },

    /// One request failed after error handling.
    RequestFailed {
        workspace_id: String,
        stage: Stage,
        endpoint: String,
        error: String,
    },

    /// A failed attempt will be retried after `delay`.
    RetryScheduled {
        workspace_id: String,
        stage: Stage,
        endpoint: String,
        attempt: usize,
        delay: Duration,
    },

    /// A delta was persisted for one collection.
    DeltaApplied {
        workspace_id: String,
        collection: String,
        created: usize,
        updated: usize,
        deleted: usize,
    },

    /// An issue scored at or above the high relevance threshold.
    HighRelevanceIssue {
        workspace_id: String,
        issue_key: String,
        summary: String,
        score: i32,
    },

    /// Stage 3 stopped issuing requests because a higher stage started.
    Yielded {
        workspace_id: String,
        stage: Stage,
        remaining: usize,
    },

    /// A stage pass finished.
    StageCompleted {
        workspace_id: String,
        stage: Stage,
        state: StageState,
        processed: usize,
        successful: usize,
        duration: Duration,
    },
}

/// Callback type for progress reporting.
pub type ProgressCallback = Box<dyn Fn(SyncProgress) + Send + Sync>;

/// Emit a progress event if a callback is provided.
#[inline]
pub fn emit(on_progress: Option<&ProgressCallback>, event: SyncProgress) {
    if let Some(cb) = on_progress {
        cb(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_with_callback() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let callback: ProgressCallback = Box::new(move |_event| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        emit(
            Some(&callback),
            SyncProgress::StageSkipped {
                workspace_id: "acme".to_string(),
                stage: Stage::Stage3,
                reason: "stage 1 running".to_string(),
            },
        );
        emit(
            Some(&callback),
            SyncProgress::DeltaApplied {
                workspace_id: "acme".to_string(),
                collection: "issues".to_string(),
                created: 1,
                updated: 0,
                deleted: 0,
            },
        );

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_emit_without_callback() {
        emit(
            None,
            SyncProgress::StageStarted {
                workspace_id: "acme".to_string(),
                stage: Stage::Stage1,
                planned: 3,
                concurrency: 3,
            },
        );
    }

    #[test]
    fn test_sync_progress_debug() {
        let event = SyncProgress::HighRelevanceIssue {
            workspace_id: "acme".to_string(),
            issue_key: "PROJ-7".to_string(),
            summary: "Outage".to_string(),
            score: 150,
        };

        let debug_str = format!("{:?}", event);
        assert!(debug_str.contains("HighRelevanceIssue"));
        assert!(debug_str.contains("PROJ-7"));
    }
}
