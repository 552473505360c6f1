//! Adaptive concurrency control driven by remote rate limit utilization.
//!
//! The limiter never fails its callers. When the remote status cannot be
//! read it answers with an estimated high-risk snapshot, which keeps
//! concurrency at the conservative end until real data comes back.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use super::shutdown::ShutdownSignal;
use super::types::{Stage, SyncConfig};
use crate::remote::{ClientPool, RateLimitInfo, short_error_message};

/// Samples kept per workspace for trend estimation.
pub const HISTORY_CAPACITY: usize = 10;

/// Per-sample slope below which utilization counts as stable.
pub const TREND_EPSILON: f64 = 0.02;

/// Samples ahead used for predictive scaling.
const PREDICTION_HORIZON: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Stable,
    Increasing,
    Decreasing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Proceed,
    Throttle,
    Reduce,
    EmergencyStop,
}

/// Point-in-time read of a workspace's rate limit state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UtilizationSnapshot {
    pub workspace_id: String,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: Option<DateTime<Utc>>,
    /// Fraction of the quota consumed, in `[0, 1]`.
    pub utilization: f64,
    pub trend: Trend,
    pub risk: RiskLevel,
    pub recommended_action: RecommendedAction,
    /// True when the snapshot is a fallback rather than a remote reading.
    pub estimated: bool,
    pub sampled_at: DateTime<Utc>,
}

impl UtilizationSnapshot {
    fn estimated(workspace_id: &str, risk: RiskLevel, action: RecommendedAction) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            limit: 0,
            remaining: 0,
            reset_at: None,
            utilization: if risk == RiskLevel::High { 1.0 } else { 0.0 },
            trend: Trend::Stable,
            risk,
            recommended_action: action,
            estimated: true,
            sampled_at: Utc::now(),
        }
    }

    pub fn rate_limit(&self) -> Option<RateLimitInfo> {
        (!self.estimated).then(|| RateLimitInfo {
            limit: self.limit,
            remaining: self.remaining,
            reset_at: self.reset_at,
        })
    }
}

#[derive(Default)]
struct LimiterState {
    histories: HashMap<String, VecDeque<f64>>,
    in_flight: HashMap<String, usize>,
}

struct LimiterInner {
    clients: Arc<ClientPool>,
    config: SyncConfig,
    state: Mutex<LimiterState>,
    shutdown: ShutdownSignal,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Translates remote rate limit headroom into per-stage concurrency.
#[derive(Clone)]
pub struct AdaptiveRateLimiter {
    inner: Arc<LimiterInner>,
}

impl AdaptiveRateLimiter {
    pub fn new(clients: Arc<ClientPool>, config: SyncConfig) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                clients,
                config,
                state: Mutex::new(LimiterState::default()),
                shutdown: ShutdownSignal::new(),
                monitor: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    fn state(&self) -> MutexGuard<'_, LimiterState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read the remote rate limit and classify it.
    pub async fn analyze_utilization(&self, workspace_id: &str) -> UtilizationSnapshot {
        let config = &self.inner.config;
        if !config.enable_rate_monitoring {
            return UtilizationSnapshot::estimated(
                workspace_id,
                RiskLevel::Low,
                RecommendedAction::Proceed,
            );
        }

        let Some(client) = self.inner.clients.get(workspace_id) else {
            tracing::warn!(workspace_id, "No client registered, assuming high risk");
            return UtilizationSnapshot::estimated(
                workspace_id,
                RiskLevel::High,
                RecommendedAction::Reduce,
            );
        };

        let info = match client.rate_limit_status().await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(
                    workspace_id,
                    error = %short_error_message(&e),
                    "Rate limit status unavailable, assuming high risk"
                );
                return UtilizationSnapshot::estimated(
                    workspace_id,
                    RiskLevel::High,
                    RecommendedAction::Reduce,
                );
            }
        };

        let utilization = info.utilization();
        let slope = self.record_sample(workspace_id, utilization);
        let snapshot = self.classify(workspace_id, &info, slope);

        tracing::debug!(
            workspace_id,
            utilization = snapshot.utilization,
            trend = ?snapshot.trend,
            risk = ?snapshot.risk,
            action = ?snapshot.recommended_action,
            "Analyzed rate limit utilization"
        );
        snapshot
    }

    /// Push a sample and return the slope of the current window.
    fn record_sample(&self, workspace_id: &str, utilization: f64) -> f64 {
        let mut state = self.state();
        let history = state.histories.entry(workspace_id.to_string()).or_default();
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(utilization);
        slope(history.make_contiguous())
    }

    fn classify(&self, workspace_id: &str, info: &RateLimitInfo, slope: f64) -> UtilizationSnapshot {
        let config = &self.inner.config;
        let utilization = info.utilization();

        let trend = if slope > TREND_EPSILON {
            Trend::Increasing
        } else if slope < -TREND_EPSILON {
            Trend::Decreasing
        } else {
            Trend::Stable
        };

        let effective = if config.predictive_scaling {
            utilization.max(utilization + slope * PREDICTION_HORIZON)
        } else {
            utilization
        };

        let risk = if effective >= config.high_risk_threshold {
            RiskLevel::High
        } else if effective >= config.medium_risk_threshold {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        let recommended_action = if info.limit > 0
            && info.remaining_fraction() <= config.emergency_throttle
        {
            RecommendedAction::EmergencyStop
        } else {
            match risk {
                RiskLevel::Low => RecommendedAction::Proceed,
                RiskLevel::Medium => RecommendedAction::Throttle,
                RiskLevel::High => RecommendedAction::Reduce,
            }
        };

        UtilizationSnapshot {
            workspace_id: workspace_id.to_string(),
            limit: info.limit,
            remaining: info.remaining,
            reset_at: info.reset_at,
            utilization,
            trend,
            risk,
            recommended_action,
            estimated: false,
            sampled_at: Utc::now(),
        }
    }

    /// Analyze, then decide the concurrency for `stage`.
    pub async fn concurrency_for_stage(&self, stage: Stage, workspace_id: &str) -> usize {
        let snapshot = self.analyze_utilization(workspace_id).await;
        self.decide(stage, workspace_id, &snapshot)
    }

    /// Stage base reduced by risk, then by load balancing.
    pub fn decide(&self, stage: Stage, workspace_id: &str, snapshot: &UtilizationSnapshot) -> usize {
        let base = self.concurrency_for_snapshot(stage, snapshot);
        self.apply_load_balancing(stage, workspace_id, base, snapshot)
    }

    /// Stage base times the risk multiplier, within `[1, global_max_concurrency]`.
    pub fn concurrency_for_snapshot(&self, stage: Stage, snapshot: &UtilizationSnapshot) -> usize {
        let config = &self.inner.config;
        let ceiling = config.global_max_concurrency.max(1);
        if snapshot.recommended_action == RecommendedAction::EmergencyStop {
            return 1;
        }

        let base = match stage {
            Stage::Stage1 => config.stage1_max_concurrent,
            Stage::Stage2 => config.stage2_max_concurrent,
            Stage::Stage3 => 1,
        };
        let multiplier = match snapshot.risk {
            RiskLevel::Low => 1.0,
            RiskLevel::Medium => 0.6,
            RiskLevel::High => 0.3,
        };
        ((base as f64 * multiplier).floor() as usize).clamp(1, ceiling)
    }

    /// Further reduce `base` under global pressure. Output is in `[1, base]`.
    pub fn apply_load_balancing(
        &self,
        stage: Stage,
        workspace_id: &str,
        base: usize,
        snapshot: &UtilizationSnapshot,
    ) -> usize {
        let base = base.max(1);
        let config = &self.inner.config;
        if !config.load_balancing_enabled {
            return base;
        }

        let ceiling = config.global_max_concurrency.max(1);
        let (total, active) = {
            let state = self.state();
            let total: usize = state.in_flight.values().sum();
            let mut active = state.in_flight.len();
            if !state.in_flight.contains_key(workspace_id) {
                active += 1;
            }
            (total, active)
        };

        let mut allowed = base;
        if total as f64 >= ceiling as f64 * config.global_headroom_threshold {
            allowed = allowed.min(ceiling.saturating_sub(total).max(1));
        }
        if active > 1 {
            allowed = allowed.min((ceiling / active).max(1));
        }
        if snapshot.risk == RiskLevel::High {
            allowed = (allowed / 2).max(1);
        }

        let allowed = allowed.clamp(1, base);
        if allowed < base {
            tracing::debug!(
                workspace_id,
                %stage,
                base,
                allowed,
                in_flight = total,
                active_workspaces = active,
                "Load balancing reduced concurrency"
            );
        }
        allowed
    }

    /// Count one in-flight request for `workspace_id` until the guard drops.
    pub fn track_in_flight(&self, workspace_id: &str) -> InFlightGuard {
        *self
            .state()
            .in_flight
            .entry(workspace_id.to_string())
            .or_default() += 1;
        InFlightGuard {
            limiter: self.clone(),
            workspace_id: workspace_id.to_string(),
        }
    }

    pub fn in_flight(&self, workspace_id: &str) -> usize {
        self.state().in_flight.get(workspace_id).copied().unwrap_or(0)
    }

    /// Utilization samples currently held for `workspace_id`, oldest first.
    pub fn history(&self, workspace_id: &str) -> Vec<f64> {
        self.state()
            .histories
            .get(workspace_id)
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Start sampling every registered workspace in the background.
    ///
    /// Returns false if monitoring is disabled, already running, or the
    /// limiter has been disposed.
    pub fn start_monitoring(&self) -> bool {
        let config = &self.inner.config;
        if !config.enable_rate_monitoring || self.inner.shutdown.is_triggered() {
            return false;
        }
        let mut monitor = self.inner.monitor.lock().unwrap_or_else(|e| e.into_inner());
        if monitor.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }

        let limiter = self.clone();
        let interval = Duration::from_millis(config.monitor_interval_ms.max(1));
        *monitor = Some(tokio::spawn(async move {
            while limiter.inner.shutdown.sleep(interval).await {
                for workspace_id in limiter.inner.clients.workspace_ids() {
                    if limiter.inner.shutdown.is_triggered() {
                        return;
                    }
                    limiter.analyze_utilization(&workspace_id).await;
                }
            }
            tracing::debug!("Rate limit monitor stopped");
        }));
        true
    }

    pub fn is_monitoring(&self) -> bool {
        self.inner
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop monitoring and drop histories. Safe to call repeatedly.
    pub fn dispose(&self) {
        self.inner.shutdown.trigger();
        let handle = self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.state().histories.clear();
    }
}

/// Decrements the in-flight count on drop.
pub struct InFlightGuard {
    limiter: AdaptiveRateLimiter,
    workspace_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut state = self.limiter.state();
        if let Some(count) = state.in_flight.get_mut(&self.workspace_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.in_flight.remove(&self.workspace_id);
            }
        }
    }
}

/// Least-squares slope of `samples` against their index.
fn slope(samples: &[f64]) -> f64 {
    let n = samples.len();
    if n < 2 {
        return 0.0;
    }
    let mean_x = (n - 1) as f64 / 2.0;
    let mean_y = samples.iter().sum::<f64>() / n as f64;
    let (num, den) = samples
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(num, den), (i, y)| {
            let dx = i as f64 - mean_x;
            (num + dx * (y - mean_y), den + dx * dx)
        });
    if den == 0.0 { 0.0 } else { num / den }
}
