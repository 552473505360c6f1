//! Per-workspace execution of the three fetch stages.
//!
//! Each stage pass plans its requests, asks the [`AdaptiveRateLimiter`] for
//! a concurrency level, drains a [`PriorityRequestQueue`] with that many
//! workers, runs every request through the [`StageErrorHandler`], and hands
//! the fetched pages to the [`IncrementalSyncManager`].
//!
//! Stage 1 and Stage 2 never wait for each other. Stage 3 only starts when
//! neither is running for the same workspace, checked synchronously right
//! before its first request, and stops issuing requests if one starts later.
//!
//! # Example
//!
//! ```ignore
//! use projectlens::sync::{StageScheduler, Stage1Options};
//!
//! let scheduler = StageScheduler::builder()
//!     .database(Arc::new(db))
//!     .clients(pool)
//!     .build()?;
//!
//! let result = scheduler.execute_stage1("acme", Stage1Options::default()).await?;
//! println!("{} of {} requests succeeded", result.successful_requests, result.processed_requests);
//! scheduler.dispose();
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use serde_json::Value;
use thiserror::Error;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use super::error_handler::{RecoveryStrategy, StageError, StageErrorHandler, StageExecutionContext};
use super::incremental::{
    DeltaStats, HISTORY_SCOPE, IncrementalSyncManager, SyncItem, SyncStoreError, SyncType,
    WatermarkQuery,
};
use super::limiter::{AdaptiveRateLimiter, RecommendedAction, RiskLevel, UtilizationSnapshot};
use super::plan::{self, IssueFilter, PlannedRequest, SortOrder};
use super::progress::{ProgressCallback, SyncProgress, emit};
use super::shutdown::ShutdownSignal;
use super::types::{
    SchedulerStats, Stage, Stage1Options, Stage2Options, Stage3Options, StagePerformance,
    StageResult, StageState, StageStatus, SyncConfig, WorkspaceStageStats,
};
use crate::backlog::{Project, User, convert, project_key_of};
use crate::cache::{CacheService, MemoryCache};
use crate::entity::entity_collection::EntityCollection;
use crate::entity::workspace::Model as WorkspaceModel;
use crate::queue::{PriorityRequestQueue, RequestQueue};
use crate::remote::{ApiRateLimiter, ClientPool, RateLimitInfo, RemoteApi, RemoteError, short_error_message};
use crate::scoring::{HIGH_RELEVANCE_SCORE, score_payload};
use crate::workspace::{self as workspaces, WorkspaceError};

/// Order in which fetched collections are persisted. The user comes first
/// so issues fetched in the same pass can be scored.
const PERSIST_ORDER: [EntityCollection; 3] = [
    EntityCollection::Users,
    EntityCollection::Projects,
    EntityCollection::Issues,
];

/// Errors that prevent a stage from running at all.
///
/// Failures inside a pass are reported in [`StageResult`] instead.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("Unknown workspace: {0}")]
    UnknownWorkspace(String),

    #[error("Scheduler has been disposed")]
    Disposed,

    #[error(transparent)]
    Store(#[from] SyncStoreError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Default)]
struct WorkspaceState {
    running: [usize; 3],
    runs: [u64; 3],
    last_state: [Option<StageState>; 3],
}

#[derive(Default)]
struct Totals {
    requests: u64,
    failures: u64,
}

struct SchedulerInner {
    db: Arc<DatabaseConnection>,
    clients: Arc<ClientPool>,
    config: SyncConfig,
    limiter: AdaptiveRateLimiter,
    errors: StageErrorHandler,
    incremental: IncrementalSyncManager,
    cache: Arc<dyn CacheService>,
    progress: Option<Arc<ProgressCallback>>,
    state: Mutex<HashMap<String, WorkspaceState>>,
    totals: Mutex<Totals>,
    shutdown: ShutdownSignal,
    background: Mutex<Option<JoinHandle<()>>>,
}

/// Marks a stage as running for a workspace until dropped.
struct StageGuard {
    inner: Arc<SchedulerInner>,
    workspace_id: String,
    stage: Stage,
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        if let Some(ws) = self.inner.state().get_mut(&self.workspace_id) {
            let running = &mut ws.running[self.stage.index()];
            *running = running.saturating_sub(1);
        }
    }
}

/// How one pass dispatches its requests.
struct DispatchSpec {
    workspace_id: String,
    stage: Stage,
    client: Arc<dyn RemoteApi>,
    concurrency: usize,
    use_cache: bool,
    throttle: Option<ApiRateLimiter>,
    yield_to_higher: bool,
}

struct Fetched {
    body: Value,
    cached: bool,
    size_bytes: usize,
    rate_limit: Option<RateLimitInfo>,
    /// Set when a stale cache entry stood in for a failed request.
    stale_after: Option<String>,
}

struct RequestOutcome {
    planned: PlannedRequest,
    result: std::result::Result<Fetched, StageError>,
    elapsed: Duration,
}

#[derive(Default)]
struct BatchOutcome {
    pages: Vec<(PlannedRequest, Value)>,
    processed: usize,
    successful: usize,
    failed: usize,
    cached: usize,
    issued: HashMap<EntityCollection, usize>,
    network_requests: usize,
    network_time: Duration,
    total_bytes: usize,
    errors: Vec<String>,
    escalated: bool,
    rate_limit: Option<RateLimitInfo>,
    yielded: usize,
}

/// How much of a collection a pass covered.
#[derive(Debug, Clone, Copy, Default)]
struct Coverage {
    planned: usize,
    issued: usize,
    fetched: usize,
    /// A page came back with fewer items than requested.
    short_page: bool,
}

impl Coverage {
    fn complete(&self) -> bool {
        self.planned > 0 && self.fetched == self.planned
    }

    /// Every page up to the last one has been seen.
    fn exhaustive(&self) -> bool {
        self.complete() && self.short_page
    }
}

/// Per-stage rules for diffing and watermark advancement.
enum PersistPolicy {
    Stage1,
    Stage2 { incremental: bool },
    Stage3,
}

impl PersistPolicy {
    fn decide(&self, collection: EntityCollection, coverage: &Coverage) -> (SyncType, Option<&'static str>) {
        match (self, collection) {
            (_, EntityCollection::Projects) if coverage.complete() => (SyncType::Full, None),
            (_, EntityCollection::Projects | EntityCollection::Users) => (SyncType::Incremental, None),
            (PersistPolicy::Stage1, EntityCollection::Issues) => (SyncType::Incremental, None),
            // Oldest-first pages from the watermark: any contiguous prefix is safe
            (PersistPolicy::Stage2 { incremental: true }, EntityCollection::Issues) => {
                let contiguous = coverage.fetched > 0 && coverage.fetched == coverage.issued;
                (SyncType::Incremental, contiguous.then_some(""))
            }
            (PersistPolicy::Stage2 { incremental: false }, EntityCollection::Issues) => {
                if coverage.exhaustive() {
                    (SyncType::Full, Some(""))
                } else {
                    (SyncType::Incremental, None)
                }
            }
            (PersistPolicy::Stage3, EntityCollection::Issues) => {
                let contiguous = coverage.fetched > 0 && coverage.fetched == coverage.issued;
                (SyncType::Incremental, contiguous.then_some(HISTORY_SCOPE))
            }
        }
    }
}

impl SchedulerInner {
    fn state(&self) -> MutexGuard<'_, HashMap<String, WorkspaceState>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: SyncProgress) {
        emit(self.progress.as_deref(), event);
    }

    fn client_for(&self, workspace_id: &str) -> Result<Arc<dyn RemoteApi>> {
        if self.shutdown.is_triggered() {
            return Err(SchedulerError::Disposed);
        }
        self.clients
            .get(workspace_id)
            .ok_or_else(|| SchedulerError::UnknownWorkspace(workspace_id.to_string()))
    }

    async fn load_workspace(&self, workspace_id: &str) -> Result<WorkspaceModel> {
        workspaces::find(&self.db, workspace_id)
            .await?
            .ok_or_else(|| SchedulerError::UnknownWorkspace(workspace_id.to_string()))
    }

    fn enter(self: &Arc<Self>, workspace_id: &str, stage: Stage) -> StageGuard {
        self.state()
            .entry(workspace_id.to_string())
            .or_default()
            .running[stage.index()] += 1;
        StageGuard {
            inner: Arc::clone(self),
            workspace_id: workspace_id.to_string(),
            stage,
        }
    }

    /// Claim the Stage 3 slot only if no stage runs for the workspace.
    ///
    /// On refusal returns the stage that is running.
    fn try_enter_stage3(self: &Arc<Self>, workspace_id: &str) -> std::result::Result<StageGuard, Stage> {
        {
            let mut state = self.state();
            let ws = state.entry(workspace_id.to_string()).or_default();
            if let Some(busy) = Stage::ALL.into_iter().find(|s| ws.running[s.index()] > 0) {
                return Err(busy);
            }
            ws.running[Stage::Stage3.index()] += 1;
        }
        Ok(StageGuard {
            inner: Arc::clone(self),
            workspace_id: workspace_id.to_string(),
            stage: Stage::Stage3,
        })
    }

    fn running_higher_stage(&self, workspace_id: &str) -> Option<Stage> {
        let state = self.state();
        let ws = state.get(workspace_id)?;
        [Stage::Stage1, Stage::Stage2]
            .into_iter()
            .find(|s| ws.running[s.index()] > 0)
    }

    fn status(&self, workspace_id: &str) -> StageStatus {
        self.state()
            .get(workspace_id)
            .map(status_of)
            .unwrap_or_default()
    }

    fn finish(&self, result: &StageResult) {
        {
            let mut state = self.state();
            let ws = state.entry(result.workspace_id.clone()).or_default();
            ws.runs[result.stage.index()] += 1;
            ws.last_state[result.stage.index()] = Some(result.state);
        }
        let mut totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        totals.requests += result.processed_requests as u64;
        totals.failures += result.failed_requests as u64;
    }

    fn skip(&self, stage: Stage, workspace_id: &str, reason: String, snapshot: Option<&UtilizationSnapshot>, started: Instant) -> StageResult {
        tracing::info!(workspace_id, %stage, reason = %reason, "Stage skipped");
        self.emit(SyncProgress::StageSkipped {
            workspace_id: workspace_id.to_string(),
            stage,
            reason: reason.clone(),
        });
        let mut result = StageResult::skipped(stage, workspace_id, reason);
        result.rate_limit = snapshot.and_then(UtilizationSnapshot::rate_limit);
        result.performance.duration_ms = started.elapsed().as_millis() as u64;
        result
    }

    async fn throttle_wait(&self, throttle: &ApiRateLimiter) -> bool {
        tokio::select! {
            _ = throttle.wait() => true,
            _ = self.shutdown.wait() => false,
        }
    }

    /// Drain `plan` through a priority queue with `spec.concurrency` workers.
    ///
    /// Writes into `outcome` as results arrive, so a caller that times the
    /// dispatch out still sees what completed.
    async fn dispatch(self: &Arc<Self>, spec: &DispatchSpec, plan: Vec<PlannedRequest>, outcome: &mut BatchOutcome) {
        let queue = PriorityRequestQueue::new();
        let mut planned_by_id = HashMap::with_capacity(plan.len());
        for planned in plan {
            let id = queue.enqueue(planned.request.clone(), spec.stage.priority());
            planned_by_id.insert(id, planned);
        }

        let concurrency = spec.concurrency.max(1);
        let mut join_set: JoinSet<RequestOutcome> = JoinSet::new();
        let mut stopped = false;

        loop {
            while !stopped && join_set.len() < concurrency && !queue.is_empty() {
                if outcome.escalated || self.shutdown.is_triggered() {
                    stopped = true;
                    break;
                }
                if let Some(throttle) = &spec.throttle
                    && !self.throttle_wait(throttle).await
                {
                    stopped = true;
                    break;
                }
                if spec.yield_to_higher
                    && let Some(higher) = self.running_higher_stage(&spec.workspace_id)
                {
                    let remaining = queue.clear();
                    outcome.yielded = remaining;
                    tracing::info!(
                        workspace_id = %spec.workspace_id,
                        stage = %spec.stage,
                        higher = %higher,
                        remaining,
                        "Yielding to higher priority stage"
                    );
                    self.emit(SyncProgress::Yielded {
                        workspace_id: spec.workspace_id.clone(),
                        stage: spec.stage,
                        remaining,
                    });
                    stopped = true;
                    break;
                }

                let Some(queued) = queue.dequeue() else {
                    break;
                };
                let Some(planned) = planned_by_id.remove(&queued.id) else {
                    continue;
                };
                outcome.processed += 1;
                *outcome.issued.entry(planned.collection).or_default() += 1;
                join_set.spawn(Self::execute_request(
                    Arc::clone(self),
                    spec.workspace_id.clone(),
                    spec.stage,
                    Arc::clone(&spec.client),
                    planned,
                    spec.use_cache,
                ));
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            match joined {
                Ok(request) => self.record(spec, request, outcome),
                Err(e) => {
                    outcome.failed += 1;
                    outcome.errors.push(format!("request task failed: {e}"));
                }
            }
        }
    }

    async fn execute_request(
        inner: Arc<Self>,
        workspace_id: String,
        stage: Stage,
        client: Arc<dyn RemoteApi>,
        planned: PlannedRequest,
        use_cache: bool,
    ) -> RequestOutcome {
        let started = Instant::now();
        let key = format!("{workspace_id}:{}", planned.request.cache_key());

        if use_cache && let Some(body) = inner.cache.get(&key) {
            let size_bytes = body.to_string().len();
            return RequestOutcome {
                planned,
                result: Ok(Fetched {
                    body,
                    cached: true,
                    size_bytes,
                    rate_limit: None,
                    stale_after: None,
                }),
                elapsed: started.elapsed(),
            };
        }

        let ctx = StageExecutionContext::new(&workspace_id, stage, &planned.request)
            .with_fallback(inner.cache.get_stale(&key).is_some());
        let timeout = inner.config.request_timeout();
        let _in_flight = inner.limiter.track_in_flight(&workspace_id);

        let result = inner
            .errors
            .execute_with_error_handling(&ctx, || {
                let client = Arc::clone(&client);
                let request = planned.request.clone();
                async move {
                    tokio::time::timeout(timeout, client.request(request))
                        .await
                        .unwrap_or(Err(RemoteError::Timeout {
                            elapsed_ms: timeout.as_millis() as u64,
                        }))
                }
            })
            .await;

        let result = match result {
            Ok(response) => {
                inner
                    .cache
                    .set(&key, response.body.clone(), inner.config.cache_ttl());
                Ok(Fetched {
                    body: response.body,
                    cached: false,
                    size_bytes: response.size_bytes,
                    rate_limit: response.rate_limit,
                    stale_after: None,
                })
            }
            Err(err) if err.strategy == RecoveryStrategy::Fallback => {
                match inner.cache.get_stale(&key) {
                    Some(body) => Ok(Fetched {
                        size_bytes: body.to_string().len(),
                        body,
                        cached: true,
                        rate_limit: None,
                        stale_after: Some(short_error_message(&err)),
                    }),
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        };

        RequestOutcome {
            planned,
            result,
            elapsed: started.elapsed(),
        }
    }

    fn record(&self, spec: &DispatchSpec, request: RequestOutcome, outcome: &mut BatchOutcome) {
        let endpoint = request.planned.request.endpoint.clone();
        match request.result {
            Ok(fetched) => {
                outcome.successful += 1;
                if fetched.cached {
                    outcome.cached += 1;
                } else {
                    outcome.network_requests += 1;
                    outcome.network_time += request.elapsed;
                }
                outcome.total_bytes += fetched.size_bytes;
                if fetched.rate_limit.is_some() {
                    outcome.rate_limit = fetched.rate_limit;
                }
                if let Some(reason) = fetched.stale_after {
                    outcome
                        .errors
                        .push(format!("{endpoint}: served stale cache ({reason})"));
                }
                self.emit(SyncProgress::RequestCompleted {
                    workspace_id: spec.workspace_id.clone(),
                    stage: spec.stage,
                    endpoint,
                    cached: fetched.cached,
                    elapsed: request.elapsed,
                });
                outcome.pages.push((request.planned, fetched.body));
            }
            Err(err) => {
                outcome.failed += 1;
                if err.is_escalated() {
                    outcome.escalated = true;
                }
                let message = short_error_message(&err);
                self.emit(SyncProgress::RequestFailed {
                    workspace_id: spec.workspace_id.clone(),
                    stage: spec.stage,
                    endpoint,
                    error: message.clone(),
                });
                outcome.errors.push(message);
            }
        }
    }

    /// Dispatch, persist and summarize one pass.
    async fn run_pass(
        self: &Arc<Self>,
        workspace: &WorkspaceModel,
        spec: DispatchSpec,
        plan: Vec<PlannedRequest>,
        policy: PersistPolicy,
        snapshot: &UtilizationSnapshot,
        started: Instant,
    ) -> StageResult {
        let stage = spec.stage;
        let workspace_id = workspace.id.as_str();
        let mut planned_counts: HashMap<EntityCollection, usize> = HashMap::new();
        for planned in &plan {
            *planned_counts.entry(planned.collection).or_default() += 1;
        }

        tracing::info!(
            workspace_id,
            %stage,
            planned = plan.len(),
            concurrency = spec.concurrency,
            "Stage started"
        );
        self.emit(SyncProgress::StageStarted {
            workspace_id: workspace_id.to_string(),
            stage,
            planned: plan.len(),
            concurrency: spec.concurrency,
        });

        let stage_timeout = self.config.stage_timeout(stage);
        let mut outcome = BatchOutcome::default();
        let timed_out = tokio::time::timeout(stage_timeout, self.dispatch(&spec, plan, &mut outcome))
            .await
            .is_err();

        let mut result = StageResult::new(stage, workspace_id);
        result.processed_requests = outcome.processed;
        result.successful_requests = outcome.successful;
        result.failed_requests = outcome.failed;
        result.cached_requests = outcome.cached;
        result.state = StageState::Completed;

        if timed_out {
            let err = RemoteError::Timeout {
                elapsed_ms: stage_timeout.as_millis() as u64,
            };
            let classification = self.errors.classify(&err);
            tracing::warn!(
                workspace_id,
                %stage,
                timeout_ms = stage_timeout.as_millis() as u64,
                kind = classification.kind.as_str(),
                "Stage timed out"
            );
            result.state = StageState::Failed;
            outcome.errors.push(format!(
                "stage timed out after {}ms",
                stage_timeout.as_millis()
            ));
        }
        if outcome.escalated {
            result.state = StageState::Failed;
        }

        match self
            .persist(workspace, &policy, &planned_counts, &outcome)
            .await
        {
            Ok(delta) => result.delta = delta,
            Err(e) => {
                tracing::error!(workspace_id, %stage, error = %e, "Failed to persist stage data");
                result.state = StageState::Failed;
                outcome.errors.push(format!("persist failed: {e}"));
            }
        }

        result.rate_limit = outcome.rate_limit.take().or_else(|| snapshot.rate_limit());
        if let Some(info) = &result.rate_limit
            && let Err(e) = workspaces::save_usage(&self.db, workspace_id, info).await
        {
            tracing::warn!(workspace_id, error = %e, "Failed to save API usage");
        }

        result.performance = StagePerformance {
            average_response_time_ms: if outcome.network_requests == 0 {
                0.0
            } else {
                outcome.network_time.as_secs_f64() * 1000.0 / outcome.network_requests as f64
            },
            total_data_size: outcome.total_bytes,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        result.errors = outcome.errors;

        tracing::info!(
            workspace_id,
            %stage,
            state = %result.state,
            processed = result.processed_requests,
            successful = result.successful_requests,
            failed = result.failed_requests,
            cached = result.cached_requests,
            created = result.delta.created,
            updated = result.delta.updated,
            deleted = result.delta.deleted,
            duration_ms = result.performance.duration_ms,
            "Stage finished"
        );
        self.emit(SyncProgress::StageCompleted {
            workspace_id: workspace_id.to_string(),
            stage,
            state: result.state,
            processed: result.processed_requests,
            successful: result.successful_requests,
            duration: started.elapsed(),
        });
        result
    }

    /// Server-side issue filter for the workspace's tracked projects.
    ///
    /// Project ids come from the stored project list. Until every tracked
    /// key resolves, issue requests are not narrowed by project and the key
    /// check in `persist_collection` does the filtering.
    async fn issue_filter(&self, workspace: &WorkspaceModel) -> Result<IssueFilter> {
        let keys = workspace.project_key_list();
        if keys.is_empty() {
            return Ok(IssueFilter::default());
        }
        let known: HashMap<String, i64> = self
            .incremental
            .load_existing(&workspace.id, EntityCollection::Projects)
            .await?
            .into_iter()
            .filter_map(|item| serde_json::from_value::<Project>(item.payload).ok())
            .map(|project| (project.project_key.to_ascii_uppercase(), project.id))
            .collect();
        let ids: Option<Vec<i64>> = keys
            .iter()
            .map(|key| known.get(&key.to_ascii_uppercase()).copied())
            .collect();
        match ids {
            Some(ids) => Ok(IssueFilter::projects(ids)),
            None => {
                tracing::debug!(
                    workspace_id = %workspace.id,
                    "Tracked projects not stored yet, issue requests cover all projects"
                );
                Ok(IssueFilter::default())
            }
        }
    }

    async fn persist(
        &self,
        workspace: &WorkspaceModel,
        policy: &PersistPolicy,
        planned_counts: &HashMap<EntityCollection, usize>,
        outcome: &BatchOutcome,
    ) -> Result<DeltaStats> {
        let mut me = stored_user(workspace);
        let mut total = DeltaStats::default();

        for collection in PERSIST_ORDER {
            let mut coverage = Coverage {
                planned: planned_counts.get(&collection).copied().unwrap_or(0),
                issued: outcome.issued.get(&collection).copied().unwrap_or(0),
                ..Coverage::default()
            };
            let mut items = Vec::new();
            for (planned, body) in outcome.pages.iter().filter(|(p, _)| p.collection == collection) {
                let page_items = convert::body_to_items(body);
                if planned.page_size.is_some_and(|size| page_items.len() < size) {
                    coverage.short_page = true;
                }
                coverage.fetched += 1;
                items.extend(page_items);
            }
            if coverage.fetched == 0 {
                continue;
            }

            if collection == EntityCollection::Users
                && let Some(user) = items
                    .first()
                    .and_then(|item| serde_json::from_value::<User>(item.payload.clone()).ok())
            {
                if me.as_ref().is_none_or(|m| m.id != user.id || m.name != user.name) {
                    workspaces::set_user(&self.db, &workspace.id, user.id, &user.name).await?;
                }
                me = Some(user);
            }

            let (sync_type, scope) = policy.decide(collection, &coverage);
            let stats = self
                .persist_collection(workspace, collection, dedupe(items), me.as_ref(), sync_type, scope)
                .await?;
            total.merge(&stats);
        }
        Ok(total)
    }

    async fn persist_collection(
        &self,
        workspace: &WorkspaceModel,
        collection: EntityCollection,
        mut items: Vec<SyncItem>,
        me: Option<&User>,
        sync_type: SyncType,
        scope: Option<&str>,
    ) -> Result<DeltaStats> {
        if collection == EntityCollection::Issues {
            items.retain(|item| {
                convert::issue_key(&item.payload)
                    .is_none_or(|key| workspace.tracks_project(project_key_of(key)))
            });
            if let Some(me) = me {
                for item in &mut items {
                    item.relevance_score = score_payload(&item.payload, me);
                }
            }
        }

        let existing = self.incremental.load_existing(&workspace.id, collection).await?;
        let stored_scores: HashMap<i64, Option<i32>> = existing
            .iter()
            .map(|item| (item.id, item.relevance_score))
            .collect();
        if collection == EntityCollection::Issues && me.is_none() {
            // Without a known user nothing can be scored; keep what is stored
            for item in &mut items {
                if let Some(score) = stored_scores.get(&item.id) {
                    item.relevance_score = *score;
                }
            }
        }
        let delta = IncrementalSyncManager::calculate_delta_changes(&items, &existing, sync_type);

        let mut rescored = Vec::new();
        if collection == EntityCollection::Issues {
            for item in delta.created.iter().chain(&delta.updated).chain(&delta.unchanged) {
                let previous = stored_scores.get(&item.id).copied().flatten();
                if let Some(score) = item.relevance_score
                    && crossed_high_relevance(previous, score)
                {
                    self.emit(SyncProgress::HighRelevanceIssue {
                        workspace_id: workspace.id.clone(),
                        issue_key: convert::issue_key(&item.payload).unwrap_or_default().to_string(),
                        summary: item.payload["summary"].as_str().unwrap_or_default().to_string(),
                        score,
                    });
                }
            }
            rescored = delta
                .unchanged
                .iter()
                .filter(|item| {
                    stored_scores
                        .get(&item.id)
                        .is_some_and(|stored| *stored != item.relevance_score)
                })
                .map(|item| (item.id, item.relevance_score))
                .collect();
        }

        self.incremental
            .apply_delta(&workspace.id, collection, scope, &delta)
            .await?;
        self.incremental
            .update_scores(&workspace.id, collection, &rescored)
            .await?;
        if delta.stats.has_changes() {
            self.emit(SyncProgress::DeltaApplied {
                workspace_id: workspace.id.clone(),
                collection: collection.to_string(),
                created: delta.stats.created,
                updated: delta.stats.updated,
                deleted: delta.stats.deleted,
            });
        }
        Ok(delta.stats)
    }
}

fn status_of(ws: &WorkspaceState) -> StageStatus {
    StageStatus {
        stage1_running: ws.running[Stage::Stage1.index()] > 0,
        stage2_running: ws.running[Stage::Stage2.index()] > 0,
        stage3_running: ws.running[Stage::Stage3.index()] > 0,
    }
}

/// An issue is worth a notification the first time its score reaches the
/// threshold. Unscored issues count as below it.
fn crossed_high_relevance(previous: Option<i32>, score: i32) -> bool {
    score >= HIGH_RELEVANCE_SCORE && previous.is_none_or(|old| old < HIGH_RELEVANCE_SCORE)
}

fn stored_user(workspace: &WorkspaceModel) -> Option<User> {
    Some(User {
        id: workspace.user_id?,
        name: workspace.user_name.clone()?,
        user_id: None,
    })
}

/// Merge pages of one collection, keeping the newest copy of each id.
fn dedupe(items: Vec<SyncItem>) -> Vec<SyncItem> {
    let mut by_id: HashMap<i64, SyncItem> = HashMap::with_capacity(items.len());
    for item in items {
        match by_id.get(&item.id) {
            Some(existing) if existing.updated >= item.updated => {}
            _ => {
                by_id.insert(item.id, item);
            }
        }
    }
    let mut merged: Vec<SyncItem> = by_id.into_values().collect();
    merged.sort_by_key(|item| item.id);
    merged
}

/// Builder for [`StageScheduler`].
#[derive(Default)]
pub struct StageSchedulerBuilder {
    database: Option<Arc<DatabaseConnection>>,
    clients: Option<Arc<ClientPool>>,
    config: Option<SyncConfig>,
    cache: Option<Arc<dyn CacheService>>,
    progress: Option<Arc<ProgressCallback>>,
}

impl StageSchedulerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared connection to the local mirror.
    pub fn database(mut self, db: Arc<DatabaseConnection>) -> Self {
        self.database = Some(db);
        self
    }

    /// Remote clients, one per workspace.
    pub fn clients(mut self, clients: Arc<ClientPool>) -> Self {
        self.clients = Some(clients);
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Response cache. Defaults to a fresh [`MemoryCache`].
    pub fn cache(mut self, cache: Arc<dyn CacheService>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn progress(mut self, callback: Arc<ProgressCallback>) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Build the scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::MissingField`] if the database or the
    /// client pool was not set.
    pub fn build(self) -> Result<StageScheduler> {
        let db = self
            .database
            .ok_or(SchedulerError::MissingField { field: "database" })?;
        let clients = self
            .clients
            .ok_or(SchedulerError::MissingField { field: "clients" })?;
        let config = self.config.unwrap_or_default();

        let mut errors = StageErrorHandler::new(config.clone());
        if let Some(progress) = &self.progress {
            errors = errors.with_progress(Arc::clone(progress));
        }

        Ok(StageScheduler {
            inner: Arc::new(SchedulerInner {
                limiter: AdaptiveRateLimiter::new(Arc::clone(&clients), config.clone()),
                incremental: IncrementalSyncManager::new(Arc::clone(&db)),
                cache: self.cache.unwrap_or_else(|| Arc::new(MemoryCache::new())),
                progress: self.progress,
                errors,
                db,
                clients,
                config,
                state: Mutex::new(HashMap::new()),
                totals: Mutex::new(Totals::default()),
                shutdown: ShutdownSignal::new(),
                background: Mutex::new(None),
            }),
        })
    }
}

/// Runs stage passes for registered workspaces.
#[derive(Clone)]
pub struct StageScheduler {
    inner: Arc<SchedulerInner>,
}

impl StageScheduler {
    pub fn builder() -> StageSchedulerBuilder {
        StageSchedulerBuilder::new()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn limiter(&self) -> &AdaptiveRateLimiter {
        &self.inner.limiter
    }

    pub fn error_handler(&self) -> &StageErrorHandler {
        &self.inner.errors
    }

    pub fn incremental(&self) -> &IncrementalSyncManager {
        &self.inner.incremental
    }

    pub fn cache(&self) -> &Arc<dyn CacheService> {
        &self.inner.cache
    }

    /// Which stages are running for `workspace_id` right now.
    pub fn status(&self, workspace_id: &str) -> StageStatus {
        self.inner.status(workspace_id)
    }

    /// Stage 1: projects, the API key's user and the most recent issues.
    #[tracing::instrument(skip(self, options))]
    pub async fn execute_stage1(
        &self,
        workspace_id: &str,
        options: Stage1Options,
    ) -> Result<StageResult> {
        let inner = &self.inner;
        let client = inner.client_for(workspace_id)?;
        let _guard = inner.enter(workspace_id, Stage::Stage1);
        let started = Instant::now();
        let workspace = inner.load_workspace(workspace_id).await?;

        let snapshot = inner.limiter.analyze_utilization(workspace_id).await;
        let concurrency = inner.limiter.decide(Stage::Stage1, workspace_id, &snapshot);

        let spec = DispatchSpec {
            workspace_id: workspace_id.to_string(),
            stage: Stage::Stage1,
            client,
            concurrency,
            use_cache: !options.force_refresh,
            throttle: None,
            yield_to_higher: false,
        };
        let filter = inner.issue_filter(&workspace).await?;
        let result = inner
            .run_pass(&workspace, spec, plan::stage1(&filter), PersistPolicy::Stage1, &snapshot, started)
            .await;
        inner.finish(&result);
        Ok(result)
    }

    /// Stage 2: background sync of projects and issue pages.
    ///
    /// Skipped at high risk, narrowed to the first issue page once
    /// utilization reaches `stage2_warning_threshold`.
    #[tracing::instrument(skip(self, options))]
    pub async fn execute_stage2(
        &self,
        workspace_id: &str,
        options: Stage2Options,
    ) -> Result<StageResult> {
        let inner = &self.inner;
        let client = inner.client_for(workspace_id)?;
        let _guard = inner.enter(workspace_id, Stage::Stage2);
        let started = Instant::now();
        let workspace = inner.load_workspace(workspace_id).await?;

        let snapshot = inner.limiter.analyze_utilization(workspace_id).await;
        if snapshot.recommended_action == RecommendedAction::EmergencyStop
            || snapshot.risk == RiskLevel::High
        {
            let reason = format!(
                "rate limit utilization {:.0}% ({:?})",
                snapshot.utilization * 100.0,
                snapshot.recommended_action
            );
            let result = inner.skip(Stage::Stage2, workspace_id, reason, Some(&snapshot), started);
            inner.finish(&result);
            return Ok(result);
        }

        let narrowed = snapshot.utilization >= inner.config.stage2_warning_threshold;
        if narrowed {
            tracing::info!(
                workspace_id,
                utilization = snapshot.utilization,
                "Utilization above warning threshold, narrowing stage 2"
            );
        }

        let since = if options.incremental_only {
            inner
                .incremental
                .get_updated_since_param(&WatermarkQuery::incremental(
                    workspace_id,
                    EntityCollection::Issues,
                ))
                .await?
        } else {
            None
        };
        let pages = if narrowed { 1 } else { inner.config.stage2_max_pages };
        let order = if options.incremental_only {
            SortOrder::Asc
        } else {
            SortOrder::Desc
        };
        let filter = inner.issue_filter(&workspace).await?;
        let plan = plan::stage2(&filter, since, order, pages, !narrowed);

        let spec = DispatchSpec {
            workspace_id: workspace_id.to_string(),
            stage: Stage::Stage2,
            client,
            concurrency: inner.limiter.decide(Stage::Stage2, workspace_id, &snapshot),
            use_cache: false,
            throttle: None,
            yield_to_higher: false,
        };
        let policy = PersistPolicy::Stage2 {
            incremental: options.incremental_only,
        };
        let result = inner
            .run_pass(&workspace, spec, plan, policy, &snapshot, started)
            .await;
        inner.finish(&result);
        Ok(result)
    }

    /// Stage 3: throttled historical backfill that yields to Stage 1 and 2.
    ///
    /// Returns an empty skipped result when a higher stage is running or
    /// utilization is at medium risk or above.
    #[tracing::instrument(skip(self, options))]
    pub async fn execute_stage3(
        &self,
        workspace_id: &str,
        options: Stage3Options,
    ) -> Result<StageResult> {
        let inner = &self.inner;
        let client = inner.client_for(workspace_id)?;
        let started = Instant::now();

        if let Some(higher) = inner.running_higher_stage(workspace_id) {
            let result = inner.skip(
                Stage::Stage3,
                workspace_id,
                format!("{higher} running"),
                None,
                started,
            );
            inner.finish(&result);
            return Ok(result);
        }

        let workspace = inner.load_workspace(workspace_id).await?;
        let snapshot = inner.limiter.analyze_utilization(workspace_id).await;
        if snapshot.risk >= RiskLevel::Medium
            || snapshot.recommended_action == RecommendedAction::EmergencyStop
        {
            let reason = format!(
                "rate limit utilization {:.0}% ({:?} risk)",
                snapshot.utilization * 100.0,
                snapshot.risk
            );
            let result = inner.skip(Stage::Stage3, workspace_id, reason, Some(&snapshot), started);
            inner.finish(&result);
            return Ok(result);
        }

        let cutoff = Utc::now() - chrono::Duration::days(i64::from(options.max_history_days));
        let resume = inner
            .incremental
            .watermark(workspace_id, EntityCollection::Issues, HISTORY_SCOPE)
            .await?;
        let since: DateTime<Utc> = resume.map_or(cutoff, |r| r.max(cutoff));
        let filter = inner.issue_filter(&workspace).await?;
        let plan = plan::stage3(&filter, since.date_naive(), inner.config.stage3_max_pages);

        // Last check before the first request
        let _guard = match inner.try_enter_stage3(workspace_id) {
            Ok(guard) => guard,
            Err(busy) => {
                let result = inner.skip(
                    Stage::Stage3,
                    workspace_id,
                    format!("{busy} running"),
                    Some(&snapshot),
                    started,
                );
                inner.finish(&result);
                return Ok(result);
            }
        };

        let spec = DispatchSpec {
            workspace_id: workspace_id.to_string(),
            stage: Stage::Stage3,
            client,
            concurrency: 1,
            use_cache: false,
            throttle: Some(ApiRateLimiter::with_min_interval(Duration::from_millis(
                inner.config.stage3_throttle_ms,
            ))),
            yield_to_higher: true,
        };
        let result = inner
            .run_pass(&workspace, spec, plan, PersistPolicy::Stage3, &snapshot, started)
            .await;
        inner.finish(&result);
        Ok(result)
    }

    /// Scheduler state computed at call time.
    pub fn get_stats(&self) -> SchedulerStats {
        let state = self.inner.state();
        let mut workspaces: Vec<WorkspaceStageStats> = state
            .iter()
            .map(|(id, ws)| WorkspaceStageStats {
                workspace_id: id.clone(),
                status: status_of(ws),
                runs: ws.runs,
                last_state: ws.last_state,
            })
            .collect();
        drop(state);
        workspaces.sort_by(|a, b| a.workspace_id.cmp(&b.workspace_id));

        let mut current_status = StageStatus::default();
        let mut total_runs = [0u64; 3];
        for ws in &workspaces {
            current_status.stage1_running |= ws.status.stage1_running;
            current_status.stage2_running |= ws.status.stage2_running;
            current_status.stage3_running |= ws.status.stage3_running;
            for (total, runs) in total_runs.iter_mut().zip(ws.runs) {
                *total += runs;
            }
        }

        let totals = self.inner.totals.lock().unwrap_or_else(|e| e.into_inner());
        SchedulerStats {
            current_status,
            workspaces,
            total_runs,
            total_requests: totals.requests,
            total_failures: totals.failures,
        }
    }

    /// Start rate limit monitoring for all registered workspaces.
    pub fn start_monitoring(&self) -> bool {
        self.inner.limiter.start_monitoring()
    }

    /// Run Stage 2 then Stage 3 for each workspace, every `stage2_interval_ms`.
    ///
    /// Returns false if a background task is already running or the
    /// scheduler has been disposed.
    pub fn spawn_background_sync(&self, workspace_ids: Vec<String>) -> bool {
        let mut background = self
            .inner
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if self.inner.shutdown.is_triggered()
            || background.as_ref().is_some_and(|h| !h.is_finished())
        {
            return false;
        }

        let scheduler = self.clone();
        let interval = Duration::from_millis(self.inner.config.stage2_interval_ms.max(1));
        *background = Some(tokio::spawn(async move {
            loop {
                for workspace_id in &workspace_ids {
                    if scheduler.inner.shutdown.is_triggered() {
                        return;
                    }
                    if let Err(e) = scheduler
                        .execute_stage2(
                            workspace_id,
                            Stage2Options {
                                incremental_only: true,
                            },
                        )
                        .await
                    {
                        tracing::warn!(workspace_id, error = %e, "Background stage 2 failed");
                    }
                    if let Err(e) = scheduler
                        .execute_stage3(workspace_id, Stage3Options::default())
                        .await
                    {
                        tracing::warn!(workspace_id, error = %e, "Background stage 3 failed");
                    }
                }
                if !scheduler.inner.shutdown.sleep(interval).await {
                    break;
                }
            }
            tracing::debug!("Background sync stopped");
        }));
        true
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.shutdown.is_triggered()
    }

    /// Resolve once [`dispose`](Self::dispose) has been called.
    pub async fn wait_disposed(&self) {
        self.inner.shutdown.wait().await;
    }

    /// Stop background work, interrupt pending sleeps and dispose the
    /// limiter and error handler. Safe to call repeatedly.
    pub fn dispose(&self) {
        let first = self.inner.shutdown.trigger();
        let handle = self
            .inner
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.inner.limiter.dispose();
        self.inner.errors.dispose();
        if first {
            tracing::info!("Stage scheduler disposed");
        }
    }
}
