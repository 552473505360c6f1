//! SyncedEntity entity - local mirror of one remote item.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::entity::entity_collection::EntityCollection;

/// SyncedEntity model, unique on `(workspace_id, collection, external_id)`.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "synced_entities")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub workspace_id: String,
    pub collection: EntityCollection,
    /// Remote numeric id.
    pub external_id: i64,

    /// Remote last-modified marker used for diffing.
    pub remote_updated_at: Option<DateTimeWithTimeZone>,

    /// Relevance score, issues only.
    pub relevance_score: Option<i32>,

    /// Raw remote payload.
    #[sea_orm(column_type = "Json")]
    pub payload: serde_json::Value,

    pub synced_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::workspace::Entity",
        from = "Column::WorkspaceId",
        to = "super::workspace::Column::Id"
    )]
    Workspace,
}

impl Related<super::workspace::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Workspace.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
