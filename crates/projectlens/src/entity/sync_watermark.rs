//! SyncWatermark entity - last synced modification time per collection.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::entity::entity_collection::EntityCollection;

/// Watermark row, unique on `(workspace_id, collection, scope)`.
///
/// `scope` narrows a collection (e.g. one project); the empty string means
/// the whole collection.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sync_watermarks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub workspace_id: String,
    pub collection: EntityCollection,
    #[sea_orm(default_value = "")]
    pub scope: String,

    /// Largest remote `updated` value durably stored.
    pub watermark: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
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
