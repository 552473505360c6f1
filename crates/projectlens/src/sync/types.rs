//! Shared sync types, options and configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::incremental::DeltaStats;
use crate::queue::RequestPriority;
use crate::remote::RateLimitInfo;
use crate::retry::RetryConfig;

/// Workspace (space) identifier. Scopes every piece of mutable sync state.
pub type WorkspaceId = String;

/// Backlog's maximum `count` for list endpoints.
pub const PAGE_SIZE: usize = 100;

/// Number of recent issues fetched by Stage 1.
pub const STAGE1_RECENT_ISSUES: usize = 20;

/// Default look-back window for Stage 3.
pub const DEFAULT_MAX_HISTORY_DAYS: u32 = 90;

/// One of the three fetch tiers, ordered by priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// High priority: the small battery needed for a responsive view.
    Stage1,
    /// Background incremental sync.
    Stage2,
    /// Idle-time historical backfill.
    Stage3,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Stage1, Stage::Stage2, Stage::Stage3];

    pub fn number(self) -> u8 {
        match self {
            Stage::Stage1 => 1,
            Stage::Stage2 => 2,
            Stage::Stage3 => 3,
        }
    }

    /// Queue priority for this stage's requests.
    pub fn priority(self) -> RequestPriority {
        match self {
            Stage::Stage1 => RequestPriority::High,
            Stage::Stage2 => RequestPriority::Normal,
            Stage::Stage3 => RequestPriority::Low,
        }
    }

    pub(crate) fn index(self) -> usize {
        self.number() as usize - 1
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stage{}", self.number())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "1" | "stage1" => Ok(Stage::Stage1),
            "2" | "stage2" => Ok(Stage::Stage2),
            "3" | "stage3" => Ok(Stage::Stage3),
            _ => Err(format!("Unknown stage: {}", s)),
        }
    }
}

/// Lifecycle of one stage invocation.
///
/// The live per-workspace state is only ever `Idle` or `Running`; the
/// terminal states are reported in [`StageResult::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageState {
    Idle,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageState::Idle => "idle",
            StageState::Running => "running",
            StageState::Completed => "completed",
            StageState::Failed => "failed",
            StageState::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StagePerformance {
    /// Mean wall time of successful network requests.
    pub average_response_time_ms: f64,
    /// Sum of response body sizes.
    pub total_data_size: usize,
    pub duration_ms: u64,
}

/// Outcome of one stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageResult {
    pub stage: Stage,
    pub workspace_id: WorkspaceId,
    pub state: StageState,
    pub processed_requests: usize,
    pub successful_requests: usize,
    pub failed_requests: usize,
    /// Requests answered from the cache, counted in `successful_requests`.
    pub cached_requests: usize,
    pub skipped_reason: Option<String>,
    pub delta: DeltaStats,
    pub performance: StagePerformance,
    pub errors: Vec<String>,
    /// Latest rate limit seen during the stage.
    pub rate_limit: Option<RateLimitInfo>,
}

impl StageResult {
    pub fn new(stage: Stage, workspace_id: &str) -> Self {
        Self {
            stage,
            workspace_id: workspace_id.to_string(),
            state: StageState::Running,
            processed_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            cached_requests: 0,
            skipped_reason: None,
            delta: DeltaStats::default(),
            performance: StagePerformance::default(),
            errors: Vec::new(),
            rate_limit: None,
        }
    }

    /// An empty result for a pass that did no work.
    pub fn skipped(stage: Stage, workspace_id: &str, reason: impl Into<String>) -> Self {
        Self {
            state: StageState::Skipped,
            skipped_reason: Some(reason.into()),
            ..Self::new(stage, workspace_id)
        }
    }

    /// Stage 1 succeeds only if every request succeeded; later stages
    /// accept partial success unless the stage failed outright.
    pub fn is_successful(&self) -> bool {
        match self.stage {
            Stage::Stage1 => {
                self.state == StageState::Completed
                    && self.successful_requests == self.processed_requests
            }
            Stage::Stage2 | Stage::Stage3 => self.state != StageState::Failed,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Stage1Options {
    /// Ignore cached responses.
    pub force_refresh: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Stage2Options {
    /// Only fetch items changed since the stored watermark.
    pub incremental_only: bool,
}

#[derive(Debug, Clone)]
pub struct Stage3Options {
    pub max_history_days: u32,
}

impl Default for Stage3Options {
    fn default() -> Self {
        Self {
            max_history_days: DEFAULT_MAX_HISTORY_DAYS,
        }
    }
}

/// Whether each stage is running for a workspace, read at call time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageStatus {
    pub stage1_running: bool,
    pub stage2_running: bool,
    pub stage3_running: bool,
}

impl StageStatus {
    pub fn any_running(&self) -> bool {
        self.stage1_running || self.stage2_running || self.stage3_running
    }
}

/// Per-workspace entry of [`SchedulerStats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkspaceStageStats {
    pub workspace_id: WorkspaceId,
    pub status: StageStatus,
    pub runs: [u64; 3],
    pub last_state: [Option<StageState>; 3],
}

/// Scheduler introspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStats {
    /// Aggregated over all workspaces: a stage counts as running if it is
    /// running anywhere.
    pub current_status: StageStatus,
    pub workspaces: Vec<WorkspaceStageStats>,
    /// Completed invocations per stage.
    pub total_runs: [u64; 3],
    pub total_requests: u64,
    pub total_failures: u64,
}

/// Tunables for the sync core. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub stage1_max_concurrent: usize,
    pub stage2_max_concurrent: usize,
    /// Background Stage 2/3 cycle period.
    pub stage2_interval_ms: u64,
    /// Minimum spacing between Stage 3 requests.
    pub stage3_throttle_ms: u64,
    pub enable_rate_monitoring: bool,
    pub monitor_interval_ms: u64,
    pub max_retries: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Longest wait honored for a rate limit reset before retrying.
    pub rate_limit_max_wait_ms: u64,
    pub global_max_concurrency: usize,
    pub load_balancing_enabled: bool,
    pub predictive_scaling: bool,
    /// Remaining quota fraction at or below which only Stage 1 runs.
    pub emergency_throttle: f64,
    /// Utilization classified as medium risk.
    pub medium_risk_threshold: f64,
    /// Utilization classified as high risk.
    pub high_risk_threshold: f64,
    /// Share of `global_max_concurrency` in flight at which load balancing
    /// starts capping by remaining headroom.
    pub global_headroom_threshold: f64,
    /// Utilization at or above which Stage 2 narrows its scope.
    pub stage2_warning_threshold: f64,
    pub stage2_max_pages: usize,
    pub stage3_max_pages: usize,
    pub stage1_timeout_ms: u64,
    pub stage2_timeout_ms: u64,
    pub stage3_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub cache_ttl_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stage1_max_concurrent: 5,
            stage2_max_concurrent: 3,
            stage2_interval_ms: 300_000,
            stage3_throttle_ms: 2_000,
            enable_rate_monitoring: true,
            monitor_interval_ms: 60_000,
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            rate_limit_max_wait_ms: 60_000,
            global_max_concurrency: 10,
            load_balancing_enabled: true,
            predictive_scaling: true,
            emergency_throttle: 0.05,
            medium_risk_threshold: 0.7,
            high_risk_threshold: 0.9,
            global_headroom_threshold: 0.8,
            stage2_warning_threshold: 0.7,
            stage2_max_pages: 5,
            stage3_max_pages: 5,
            stage1_timeout_ms: 5_000,
            stage2_timeout_ms: 10_000,
            stage3_timeout_ms: 15_000,
            request_timeout_ms: 4_000,
            cache_ttl_ms: 300_000,
        }
    }
}

impl SyncConfig {
    pub fn stage_timeout(&self, stage: Stage) -> Duration {
        Duration::from_millis(match stage {
            Stage::Stage1 => self.stage1_timeout_ms,
            Stage::Stage2 => self.stage2_timeout_ms,
            Stage::Stage3 => self.stage3_timeout_ms,
        })
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms)),
            self.max_retries,
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}
