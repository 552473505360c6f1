//! SeaORM entity definitions for the ProjectLens database schema.

pub mod entity_collection;
pub mod prelude;
pub mod sync_watermark;
pub mod synced_entity;
pub mod workspace;
