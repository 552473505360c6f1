use std::sync::Arc;

use projectlens::EntityCollection;
use projectlens::backlog::Issue;
use projectlens::sync::{IncrementalSyncManager, SyncItem};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tabled::Tabled;

use crate::commands::shared::{OutputFormat, print_rows};

#[derive(Debug, Clone, Serialize, Tabled)]
struct IssueRow {
    #[tabled(rename = "Score")]
    score: i32,
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "Summary")]
    summary: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Due")]
    due: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl IssueRow {
    fn from_item(item: &SyncItem) -> Option<Self> {
        let issue: Issue = serde_json::from_value(item.payload.clone()).ok()?;
        Some(Self {
            score: item.relevance_score.unwrap_or(0),
            key: issue.issue_key,
            summary: issue.summary,
            status: issue.status.map(|s| s.name).unwrap_or_else(|| "-".to_string()),
            due: issue
                .due_date
                .map(|d| d.chars().take(10).collect())
                .unwrap_or_else(|| "-".to_string()),
            updated: item
                .updated
                .map(|u| u.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "-".to_string()),
        })
    }
}

/// Handle `issues`: the highest scored stored issues of one workspace.
pub(crate) async fn handle_issues(
    workspace_id: &str,
    limit: u64,
    output: OutputFormat,
    db: &Arc<DatabaseConnection>,
) -> Result<(), Box<dyn std::error::Error>> {
    let incremental = IncrementalSyncManager::new(Arc::clone(db));
    let rows: Vec<IssueRow> = incremental
        .top_scored(workspace_id, EntityCollection::Issues, limit)
        .await?
        .iter()
        .filter_map(IssueRow::from_item)
        .collect();

    if rows.is_empty() && matches!(output, OutputFormat::Table) {
        println!("No scored issues for '{}'. Run: projectlens sync stage1 {}", workspace_id, workspace_id);
        return Ok(());
    }
    print_rows(rows, output);
    Ok(())
}
