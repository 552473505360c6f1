use projectlens::WorkspaceModel;
use projectlens::workspace::{self, NewWorkspace};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tabled::Tabled;

use crate::WorkspaceAction;
use crate::commands::shared::{OutputFormat, print_rows};

#[derive(Debug, Clone, Serialize, Tabled)]
struct WorkspaceRow {
    #[tabled(rename = "Id")]
    id: String,
    #[tabled(rename = "Domain")]
    domain: String,
    #[tabled(rename = "Projects")]
    projects: String,
    #[tabled(rename = "Enabled")]
    enabled: bool,
    #[tabled(rename = "User")]
    user: String,
    #[tabled(rename = "API Usage")]
    api_usage: String,
}

impl From<&WorkspaceModel> for WorkspaceRow {
    fn from(ws: &WorkspaceModel) -> Self {
        let projects = ws.project_key_list();
        Self {
            id: ws.id.clone(),
            domain: ws.domain.clone(),
            projects: if projects.is_empty() {
                "(all)".to_string()
            } else {
                projects.join(", ")
            },
            enabled: ws.enabled,
            user: ws.user_name.clone().unwrap_or_else(|| "-".to_string()),
            api_usage: match (ws.api_remaining, ws.api_limit) {
                (Some(remaining), Some(limit)) => format!("{remaining}/{limit} left"),
                _ => "-".to_string(),
            },
        }
    }
}

pub(crate) async fn handle_workspace(
    action: WorkspaceAction,
    db: &DatabaseConnection,
) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        WorkspaceAction::Add {
            id,
            domain,
            api_key,
            projects,
        } => {
            let ws = workspace::add(
                db,
                NewWorkspace {
                    id,
                    domain,
                    api_key,
                    project_keys: projects,
                },
            )
            .await?;
            println!("Added workspace '{}' ({}).", ws.id, ws.domain);
        }
        WorkspaceAction::List { output } => {
            let rows: Vec<WorkspaceRow> = workspace::list(db)
                .await?
                .iter()
                .map(WorkspaceRow::from)
                .collect();
            if rows.is_empty() && matches!(output, OutputFormat::Table) {
                println!("No workspaces configured.");
            } else {
                print_rows(rows, output);
            }
        }
        WorkspaceAction::Remove { id } => {
            if workspace::remove(db, &id).await? {
                println!("Removed workspace '{}' and its synced data.", id);
            } else {
                return Err(format!("Workspace '{}' not found.", id).into());
            }
        }
        WorkspaceAction::Enable { id } => {
            workspace::set_enabled(db, &id, true).await?;
            println!("Enabled workspace '{}'.", id);
        }
        WorkspaceAction::Disable { id } => {
            workspace::set_enabled(db, &id, false).await?;
            println!("Disabled workspace '{}'.", id);
        }
    }
    Ok(())
}
