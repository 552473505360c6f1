//! Workspace entity - one tracked Backlog space.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Workspace model - connection settings and last known API usage for a space.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "workspaces")]
pub struct Model {
    /// User-chosen identifier (e.g. "acme"). Scopes all sync state.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Space domain, e.g. `acme.backlog.com`.
    pub domain: String,

    #[serde(skip_serializing)]
    pub api_key: String,

    /// Project keys to keep issues for (JSON array). Empty keeps everything.
    #[sea_orm(column_type = "Json")]
    pub project_keys: serde_json::Value,

    #[sea_orm(default_value = true)]
    pub enabled: bool,

    // ─── Identity ────────────────────────────────────────────────────────────
    /// Remote numeric id of the API key's owner, filled by Stage 1.
    pub user_id: Option<i64>,
    pub user_name: Option<String>,

    // ─── API usage ───────────────────────────────────────────────────────────
    pub api_limit: Option<i64>,
    pub api_remaining: Option<i64>,
    pub api_reset: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::synced_entity::Entity")]
    SyncedEntities,
    #[sea_orm(has_many = "super::sync_watermark::Entity")]
    SyncWatermarks,
}

impl Related<super::synced_entity::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SyncedEntities.def()
    }
}

impl Related<super::sync_watermark::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SyncWatermarks.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Configured project keys.
    pub fn project_key_list(&self) -> Vec<String> {
        serde_json::from_value(self.project_keys.clone()).unwrap_or_default()
    }

    /// Whether an issue in project `key` belongs to this workspace's selection.
    pub fn tracks_project(&self, key: &str) -> bool {
        let keys = self.project_key_list();
        keys.is_empty() || keys.iter().any(|k| k.eq_ignore_ascii_case(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(project_keys: serde_json::Value) -> Model {
        let now = chrono::Utc::now().fixed_offset();
        Model {
            id: "acme".to_string(),
            domain: "acme.backlog.com".to_string(),
            api_key: "secret".to_string(),
            project_keys,
            enabled: true,
            user_id: None,
            user_name: None,
            api_limit: None,
            api_remaining: None,
            api_reset: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_tracks_project_with_selection() {
        let ws = model(serde_json::json!(["PROJ", "OPS"]));
        assert!(ws.tracks_project("PROJ"));
        assert!(ws.tracks_project("ops"));
        assert!(!ws.tracks_project("OTHER"));
    }

    #[test]
    fn test_tracks_every_project_when_unset() {
        let ws = model(serde_json::json!([]));
        assert!(ws.tracks_project("ANYTHING"));

        let malformed = model(serde_json::json!({"not": "a list"}));
        assert!(malformed.tracks_project("ANYTHING"));
    }

    #[test]
    fn test_api_key_not_serialized() {
        let ws = model(serde_json::json!([]));
        let json = serde_json::to_value(&ws).unwrap();
        assert!(json.get("api_key").is_none());
    }
}
