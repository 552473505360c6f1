//! Stage execution commands.

use std::sync::Arc;

use projectlens::EntityCollection;
use projectlens::sync::{
    HISTORY_SCOPE, IncrementalSyncManager, SchedulerError, Stage1Options, Stage2Options,
    Stage3Options, StageResult, StageScheduler,
};
use projectlens::workspace;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tabled::Tabled;

use crate::SyncAction;
use crate::commands::shared::{
    OutputFormat, StageResultRow, build_scheduler, print_rows, resolve_workspaces,
};
use crate::config::Config;
use crate::shutdown::setup_shutdown_handler;

/// Handle `sync stage1|stage2|stage3|all`.
pub(crate) async fn handle_sync(
    action: SyncAction,
    config: &Config,
    db: &Arc<DatabaseConnection>,
) -> Result<(), Box<dyn std::error::Error>> {
    let scheduler = build_scheduler(config, db).await?;
    setup_shutdown_handler(scheduler.clone());

    let (workspaces, output) = match &action {
        SyncAction::Stage1 {
            workspaces, output, ..
        }
        | SyncAction::Stage2 {
            workspaces, output, ..
        }
        | SyncAction::Stage3 {
            workspaces, output, ..
        }
        | SyncAction::All { workspaces, output } => (workspaces.clone(), *output),
    };
    let workspaces = resolve_workspaces(db, workspaces).await?;

    let mut results = Vec::new();
    let mut failed_workspaces = Vec::new();
    for workspace_id in &workspaces {
        if scheduler.is_disposed() {
            break;
        }
        let outcome = match &action {
            SyncAction::Stage1 { force, .. } => scheduler
                .execute_stage1(
                    workspace_id,
                    Stage1Options {
                        force_refresh: *force,
                    },
                )
                .await
                .map(|r| vec![r]),
            SyncAction::Stage2 { full, .. } => scheduler
                .execute_stage2(
                    workspace_id,
                    Stage2Options {
                        incremental_only: !*full,
                    },
                )
                .await
                .map(|r| vec![r]),
            SyncAction::Stage3 { days, .. } => {
                let mut options = Stage3Options::default();
                if let Some(days) = days {
                    options.max_history_days = *days;
                }
                scheduler
                    .execute_stage3(workspace_id, options)
                    .await
                    .map(|r| vec![r])
            }
            SyncAction::All { .. } => run_all(&scheduler, workspace_id).await,
        };
        match outcome {
            Ok(mut stage_results) => results.append(&mut stage_results),
            Err(e) => {
                tracing::error!(workspace = %workspace_id, error = %e, "Sync failed");
                failed_workspaces.push(workspace_id.clone());
            }
        }
    }

    let rows: Vec<StageResultRow> = results.iter().map(StageResultRow::from).collect();
    print_rows(rows, output);

    let stats = scheduler.get_stats();
    tracing::info!(
        requests = stats.total_requests,
        failures = stats.total_failures,
        "Sync finished"
    );
    scheduler.dispose();

    check_outcome(&results, &failed_workspaces)
}

/// Fail when any stage was unsuccessful or any workspace errored out.
fn check_outcome(
    results: &[StageResult],
    failed_workspaces: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    if !failed_workspaces.is_empty() {
        return Err(format!("Sync failed for: {}", failed_workspaces.join(", ")).into());
    }
    if results.iter().any(|r| !r.is_successful()) {
        return Err("One or more stages did not complete successfully.".into());
    }
    Ok(())
}

/// Stage 1, then Stage 2, then Stage 3 for one workspace.
async fn run_all(
    scheduler: &StageScheduler,
    workspace_id: &str,
) -> Result<Vec<StageResult>, SchedulerError> {
    let stage1 = scheduler
        .execute_stage1(workspace_id, Stage1Options::default())
        .await?;
    let stage2 = scheduler
        .execute_stage2(
            workspace_id,
            Stage2Options {
                incremental_only: true,
            },
        )
        .await?;
    let stage3 = scheduler
        .execute_stage3(workspace_id, Stage3Options::default())
        .await?;
    Ok(vec![stage1, stage2, stage3])
}

/// Handle `run`: Stage 1 once, then background Stage 2/3 until Ctrl+C.
pub(crate) async fn handle_run(
    workspaces: Vec<String>,
    config: &Config,
    db: &Arc<DatabaseConnection>,
) -> Result<(), Box<dyn std::error::Error>> {
    let scheduler = build_scheduler(config, db).await?;
    setup_shutdown_handler(scheduler.clone());
    let workspaces = resolve_workspaces(db, workspaces).await?;

    scheduler.start_monitoring();
    for workspace_id in &workspaces {
        match scheduler
            .execute_stage1(workspace_id, Stage1Options::default())
            .await
        {
            Ok(result) if !result.is_successful() => {
                tracing::warn!(workspace = %workspace_id, state = %result.state, "Initial stage 1 incomplete");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(workspace = %workspace_id, error = %e, "Initial stage 1 failed"),
        }
    }

    if scheduler.spawn_background_sync(workspaces.clone()) {
        tracing::info!(
            workspaces = workspaces.len(),
            interval_ms = config.sync.stage2_interval_ms,
            "Background sync running, press Ctrl+C to stop"
        );
        scheduler.wait_disposed().await;
    }

    let stats = scheduler.get_stats();
    tracing::info!(
        stage1_runs = stats.total_runs[0],
        stage2_runs = stats.total_runs[1],
        stage3_runs = stats.total_runs[2],
        requests = stats.total_requests,
        failures = stats.total_failures,
        "Stopped"
    );
    Ok(())
}

#[derive(Debug, Clone, Serialize, Tabled)]
struct SyncStatsRow {
    #[tabled(rename = "Workspace")]
    workspace: String,
    #[tabled(rename = "Projects")]
    projects: usize,
    #[tabled(rename = "Issues")]
    issues: usize,
    #[tabled(rename = "Synced Up To")]
    synced_up_to: String,
    #[tabled(rename = "Backfilled To")]
    backfilled_to: String,
    #[tabled(rename = "API Usage")]
    api_usage: String,
}

fn format_mark(mark: Option<chrono::DateTime<chrono::Utc>>) -> String {
    mark.map(|m| m.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Handle `stats`: stored counts and watermarks per workspace.
pub(crate) async fn handle_stats(
    db: &Arc<DatabaseConnection>,
    output: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let incremental = IncrementalSyncManager::new(Arc::clone(db));

    let mut rows = Vec::new();
    for ws in workspace::list(db).await? {
        let projects = incremental
            .load_existing(&ws.id, EntityCollection::Projects)
            .await?
            .len();
        let issues = incremental
            .load_existing(&ws.id, EntityCollection::Issues)
            .await?
            .len();
        let synced = incremental
            .watermark(&ws.id, EntityCollection::Issues, "")
            .await?;
        let history = incremental
            .watermark(&ws.id, EntityCollection::Issues, HISTORY_SCOPE)
            .await?;
        rows.push(SyncStatsRow {
            workspace: ws.id.clone(),
            projects,
            issues,
            synced_up_to: format_mark(synced),
            backfilled_to: format_mark(history),
            api_usage: match (ws.api_remaining, ws.api_limit) {
                (Some(remaining), Some(limit)) => format!("{remaining}/{limit} left"),
                _ => "-".to_string(),
            },
        });
    }
    print_rows(rows, output);
    Ok(())
}

#[cfg(test)]
mod tests {
    use projectlens::sync::{Stage, StageState};

    use super::*;

    #[test]
    fn format_mark_renders_minutes_or_dash() {
        let mark = chrono::DateTime::parse_from_rfc3339("2024-05-01T10:30:59Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        assert_eq!(format_mark(Some(mark)), "2024-05-01 10:30");
        assert_eq!(format_mark(None), "-");
    }

    fn completed(stage: Stage) -> StageResult {
        let mut result = StageResult::new(stage, "acme");
        result.state = StageState::Completed;
        result
    }

    #[test]
    fn check_outcome_counts_workspace_errors() {
        assert!(check_outcome(&[completed(Stage::Stage1)], &[]).is_ok());

        let err = check_outcome(&[completed(Stage::Stage1)], &["other".to_string()]).unwrap_err();
        assert!(err.to_string().contains("other"));

        // No results at all still fails when a workspace errored
        assert!(check_outcome(&[], &["acme".to_string()]).is_err());
    }

    #[test]
    fn check_outcome_flags_failed_stage() {
        let mut failed = completed(Stage::Stage2);
        failed.state = StageState::Failed;
        assert!(check_outcome(&[completed(Stage::Stage1), failed], &[]).is_err());
    }
}
