use std::sync::Arc;

use clap::ValueEnum;
use projectlens::sync::{StageResult, StageScheduler};
use projectlens::workspace;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tabled::Tabled;

use crate::config::Config;
use crate::progress::LoggingReporter;

/// Output format for tabular commands.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub(crate) enum OutputFormat {
    /// Display as a formatted table (default)
    #[default]
    Table,
    /// Display as JSON
    Json,
}

/// Print rows as a rounded table or pretty JSON.
pub(crate) fn print_rows<T: Tabled + Serialize>(items: Vec<T>, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            let mut table = tabled::Table::new(&items);
            table.with(tabled::settings::Style::rounded());
            println!("{}", table);
        }
        OutputFormat::Json => match serde_json::to_string_pretty(&items) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to serialize output: {}", e),
        },
    }
}

/// Build a scheduler over every enabled workspace, reporting progress via tracing.
pub(crate) async fn build_scheduler(
    config: &Config,
    db: &Arc<DatabaseConnection>,
) -> Result<StageScheduler, Box<dyn std::error::Error>> {
    let pool = workspace::build_client_pool(db, config.request_timeout())
        .await
        .map_err(|e| e as Box<dyn std::error::Error>)?;
    if pool.is_empty() {
        return Err("No enabled workspaces. Add one with: projectlens workspace add <id> --domain <space>.backlog.com --api-key <key>".into());
    }

    let reporter = Arc::new(LoggingReporter::new());
    let scheduler = StageScheduler::builder()
        .database(Arc::clone(db))
        .clients(Arc::new(pool))
        .config(config.sync.clone())
        .progress(reporter.as_callback())
        .build()?;
    Ok(scheduler)
}

/// Resolve explicit workspace ids, or every enabled workspace when none given.
pub(crate) async fn resolve_workspaces(
    db: &DatabaseConnection,
    requested: Vec<String>,
) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    if !requested.is_empty() {
        return Ok(requested);
    }
    Ok(workspace::list_enabled(db)
        .await?
        .into_iter()
        .map(|ws| ws.id)
        .collect())
}

/// One stage result for display.
#[derive(Debug, Clone, Serialize, Tabled)]
pub(crate) struct StageResultRow {
    #[tabled(rename = "Workspace")]
    pub workspace: String,
    #[tabled(rename = "Stage")]
    pub stage: String,
    #[tabled(rename = "State")]
    pub state: String,
    #[tabled(rename = "Requests")]
    pub requests: String,
    #[tabled(rename = "Cached")]
    pub cached: usize,
    #[tabled(rename = "Created")]
    pub created: usize,
    #[tabled(rename = "Updated")]
    pub updated: usize,
    #[tabled(rename = "Deleted")]
    pub deleted: usize,
    #[tabled(rename = "Duration")]
    pub duration: String,
    #[tabled(rename = "Note")]
    pub note: String,
}

impl From<&StageResult> for StageResultRow {
    fn from(result: &StageResult) -> Self {
        let note = result
            .skipped_reason
            .clone()
            .or_else(|| result.errors.first().cloned())
            .unwrap_or_default();
        Self {
            workspace: result.workspace_id.clone(),
            stage: result.stage.to_string(),
            state: result.state.to_string(),
            requests: format!(
                "{}/{}",
                result.successful_requests, result.processed_requests
            ),
            cached: result.cached_requests,
            created: result.delta.created,
            updated: result.delta.updated,
            deleted: result.delta.deleted,
            duration: format!("{}ms", result.performance.duration_ms),
            note,
        }
    }
}

#[cfg(test)]
mod tests {
    use projectlens::sync::{Stage, StageState};

    use super::*;

    #[test]
    fn output_format_default_is_table() {
        assert!(matches!(OutputFormat::default(), OutputFormat::Table));
    }

    #[test]
    fn stage_result_row_prefers_skip_reason() {
        let skipped = StageResult::skipped(Stage::Stage3, "acme", "stage1 running");
        let row = StageResultRow::from(&skipped);
        assert_eq!(row.stage, "stage3");
        assert_eq!(row.state, StageState::Skipped.to_string());
        assert_eq!(row.requests, "0/0");
        assert_eq!(row.note, "stage1 running");
    }

    #[test]
    fn stage_result_row_shows_first_error() {
        let mut result = StageResult::new(Stage::Stage2, "acme");
        result.state = StageState::Failed;
        result.processed_requests = 4;
        result.successful_requests = 3;
        result.failed_requests = 1;
        result.errors = vec!["/issues: server error".into(), "later".into()];

        let row = StageResultRow::from(&result);
        assert_eq!(row.requests, "3/4");
        assert_eq!(row.note, "/issues: server error");
        print_rows(vec![row.clone()], OutputFormat::Json);
        print_rows(vec![row], OutputFormat::Table);
    }
}
