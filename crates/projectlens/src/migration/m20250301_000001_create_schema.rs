//! Initial migration: workspaces, mirrored entities and sync watermarks.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        self.create_workspaces(manager).await?;
        self.create_synced_entities(manager).await?;
        self.create_sync_watermarks(manager).await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SyncWatermarks::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(SyncedEntities::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Workspaces::Table).to_owned())
            .await?;
        Ok(())
    }
}

impl Migration {
    async fn create_workspaces(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Workspaces::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Workspaces::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Workspaces::Domain).string().not_null())
                    .col(ColumnDef::new(Workspaces::ApiKey).text().not_null())
                    .col(
                        ColumnDef::new(Workspaces::ProjectKeys)
                            .json()
                            .not_null()
                            .default(Expr::cust("'[]'")),
                    )
                    .col(
                        ColumnDef::new(Workspaces::Enabled)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    // Identity
                    .col(ColumnDef::new(Workspaces::UserId).big_integer().null())
                    .col(ColumnDef::new(Workspaces::UserName).string().null())
                    // API usage
                    .col(ColumnDef::new(Workspaces::ApiLimit).big_integer().null())
                    .col(ColumnDef::new(Workspaces::ApiRemaining).big_integer().null())
                    .col(
                        ColumnDef::new(Workspaces::ApiReset)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Workspaces::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Workspaces::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn create_synced_entities(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncedEntities::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncedEntities::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(SyncedEntities::WorkspaceId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncedEntities::Collection)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncedEntities::ExternalId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncedEntities::RemoteUpdatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncedEntities::RelevanceScore)
                            .integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncedEntities::Payload)
                            .json()
                            .not_null()
                            .default(Expr::cust("'{}'")),
                    )
                    .col(
                        ColumnDef::new(SyncedEntities::SyncedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_synced_entities_workspace")
                            .from(SyncedEntities::Table, SyncedEntities::WorkspaceId)
                            .to(Workspaces::Table, Workspaces::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_synced_entities_identity")
                    .table(SyncedEntities::Table)
                    .col(SyncedEntities::WorkspaceId)
                    .col(SyncedEntities::Collection)
                    .col(SyncedEntities::ExternalId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Issue listing sorts by score
        manager
            .create_index(
                Index::create()
                    .name("idx_synced_entities_score")
                    .table(SyncedEntities::Table)
                    .col(SyncedEntities::WorkspaceId)
                    .col((SyncedEntities::RelevanceScore, IndexOrder::Desc))
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn create_sync_watermarks(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncWatermarks::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncWatermarks::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(SyncWatermarks::WorkspaceId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncWatermarks::Collection)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncWatermarks::Scope)
                            .string()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(SyncWatermarks::Watermark)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncWatermarks::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sync_watermarks_workspace")
                            .from(SyncWatermarks::Table, SyncWatermarks::WorkspaceId)
                            .to(Workspaces::Table, Workspaces::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_watermarks_lookup")
                    .table(SyncWatermarks::Table)
                    .col(SyncWatermarks::WorkspaceId)
                    .col(SyncWatermarks::Collection)
                    .col(SyncWatermarks::Scope)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum Workspaces {
    Table,
    Id,
    Domain,
    ApiKey,
    ProjectKeys,
    Enabled,
    UserId,
    UserName,
    ApiLimit,
    ApiRemaining,
    ApiReset,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum SyncedEntities {
    Table,
    Id,
    WorkspaceId,
    Collection,
    ExternalId,
    RemoteUpdatedAt,
    RelevanceScore,
    Payload,
    SyncedAt,
}

#[derive(DeriveIden)]
enum SyncWatermarks {
    Table,
    Id,
    WorkspaceId,
    Collection,
    Scope,
    Watermark,
    UpdatedAt,
}
