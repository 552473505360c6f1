use std::sync::Arc;

use projectlens::sync::{AdaptiveRateLimiter, UtilizationSnapshot};
use projectlens::workspace;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tabled::Tabled;

use crate::commands::shared::{OutputFormat, print_rows, resolve_workspaces};
use crate::config::Config;

/// Handle the limits command.
pub(crate) async fn handle_limits(
    workspaces: Vec<String>,
    output: OutputFormat,
    config: &Config,
    db: &DatabaseConnection,
) -> Result<(), Box<dyn std::error::Error>> {
    let pool = workspace::build_client_pool(db, config.request_timeout())
        .await
        .map_err(|e| e as Box<dyn std::error::Error>)?;
    let limiter = AdaptiveRateLimiter::new(Arc::new(pool), config.sync.clone());

    let mut items = Vec::new();
    for workspace_id in resolve_workspaces(db, workspaces).await? {
        let snapshot = limiter.analyze_utilization(&workspace_id).await;
        if let Some(info) = snapshot.rate_limit()
            && let Err(e) = workspace::save_usage(db, &workspace_id, &info).await
        {
            tracing::warn!(workspace = %workspace_id, error = %e, "Failed to save API usage");
        }
        items.push(RateLimitDisplay::from_snapshot(&snapshot));
    }
    limiter.dispose();

    print_rows(items, output);
    Ok(())
}

/// Rate limit information for display.
#[derive(Debug, Clone, Serialize, Tabled)]
pub(crate) struct RateLimitDisplay {
    #[tabled(rename = "Workspace")]
    pub workspace: String,
    #[tabled(rename = "Limit")]
    pub limit: String,
    #[tabled(rename = "Remaining")]
    pub remaining: String,
    #[tabled(rename = "Usage %")]
    pub usage_percent: String,
    #[tabled(rename = "Trend")]
    pub trend: String,
    #[tabled(rename = "Risk")]
    pub risk: String,
    #[tabled(rename = "Action")]
    pub action: String,
    #[tabled(rename = "Resets In")]
    pub reset_in: String,
}

impl RateLimitDisplay {
    pub(crate) fn from_snapshot(snapshot: &UtilizationSnapshot) -> Self {
        let (limit, remaining) = if snapshot.estimated {
            ("?".to_string(), "?".to_string())
        } else {
            (snapshot.limit.to_string(), snapshot.remaining.to_string())
        };
        let reset_in = snapshot
            .reset_at
            .map(|reset| reset.signed_duration_since(chrono::Utc::now()))
            .map(|left| {
                if left.num_seconds() > 0 {
                    format_duration(left)
                } else {
                    "now".to_string()
                }
            })
            .unwrap_or_else(|| "-".to_string());
        Self {
            workspace: snapshot.workspace_id.clone(),
            limit,
            remaining,
            usage_percent: format!("{:.1}%", snapshot.utilization * 100.0),
            trend: format!("{:?}", snapshot.trend),
            risk: format!("{:?}", snapshot.risk),
            action: format!("{:?}", snapshot.recommended_action),
            reset_in,
        }
    }
}

/// Format a duration in a human-readable way.
fn format_duration(duration: chrono::Duration) -> String {
    let total_secs = duration.num_seconds();
    if total_secs < 60 {
        format!("{}s", total_secs)
    } else if total_secs < 3600 {
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        if secs > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}m", mins)
        }
    } else {
        let hours = total_secs / 3600;
        let mins = (total_secs % 3600) / 60;
        if mins > 0 {
            format!("{}h {}m", hours, mins)
        } else {
            format!("{}h", hours)
        }
    }
}
