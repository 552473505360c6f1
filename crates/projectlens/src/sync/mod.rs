//! Staged, rate-limit-aware synchronization of remote workspaces.
//!
//! Data is fetched in three stages of decreasing priority:
//!
//! - Stage 1: a small interactive battery (projects, the API key's user,
//!   the latest issues), fast and cache-friendly
//! - Stage 2: periodic background pages of issues and projects
//! - Stage 3: throttled historical backfill that yields to the others
//!
//! # Module Structure
//!
//! - [`types`] - Stages, options, results and [`SyncConfig`]
//! - [`progress`] - Progress reporting: `SyncProgress`, `ProgressCallback`, `emit()`
//! - [`limiter`] - [`AdaptiveRateLimiter`]: utilization analysis and concurrency decisions
//! - [`error_handler`] - [`StageErrorHandler`]: classification, retry and recovery
//! - [`incremental`] - [`IncrementalSyncManager`]: deltas and watermarks
//! - [`scheduler`] - [`StageScheduler`]: runs stage passes per workspace
//!
//! # Example
//!
//! ```ignore
//! use projectlens::sync::{Stage2Options, StageScheduler, SyncConfig};
//!
//! let scheduler = StageScheduler::builder()
//!     .database(Arc::new(db))
//!     .clients(pool)
//!     .config(SyncConfig::default())
//!     .build()?;
//!
//! let result = scheduler.execute_stage2("acme", Stage2Options { incremental_only: true }).await?;
//! println!("{} created, {} updated", result.delta.created, result.delta.updated);
//! ```

mod error_handler;
mod incremental;
mod limiter;
mod plan;
mod progress;
mod scheduler;
mod shutdown;
mod types;

// Re-export types
pub use types::{
    SchedulerStats, Stage, Stage1Options, Stage2Options, Stage3Options, StagePerformance,
    StageResult, StageState, StageStatus, SyncConfig, WorkspaceId, WorkspaceStageStats,
};

// Re-export constants
pub use incremental::HISTORY_SCOPE;
pub use limiter::{HISTORY_CAPACITY, TREND_EPSILON};
pub use types::{DEFAULT_MAX_HISTORY_DAYS, PAGE_SIZE, STAGE1_RECENT_ISSUES};

// Re-export progress types
pub use progress::{ProgressCallback, SyncProgress, emit};

pub use error_handler::{
    ErrorClassification, ErrorHandlerStats, ErrorKind, ErrorRecoveryResult, RecoveryStrategy,
    Severity, StageError, StageErrorHandler, StageExecutionContext,
};
pub use incremental::{
    DeltaStats, IncrementalSyncManager, PersistSummary, SyncDelta, SyncItem, SyncStoreError,
    SyncType, WatermarkQuery,
};
pub use limiter::{
    AdaptiveRateLimiter, InFlightGuard, RecommendedAction, RiskLevel, Trend, UtilizationSnapshot,
};
pub use plan::{ACTIVE_STATUS_IDS, IssueFilter, PlannedRequest, SortOrder};
pub use scheduler::{SchedulerError, StageScheduler, StageSchedulerBuilder};
pub use shutdown::ShutdownSignal;
