//! Common re-exports for convenient entity usage.

pub use super::entity_collection::EntityCollection;
pub use super::sync_watermark::{
    ActiveModel as SyncWatermarkActiveModel, Column as SyncWatermarkColumn,
    Entity as SyncWatermark, Model as SyncWatermarkModel,
};
pub use super::synced_entity::{
    ActiveModel as SyncedEntityActiveModel, Column as SyncedEntityColumn,
    Entity as SyncedEntity, Model as SyncedEntityModel,
};
pub use super::workspace::{
    ActiveModel as WorkspaceActiveModel, Column as WorkspaceColumn, Entity as Workspace,
    Model as WorkspaceModel,
};
