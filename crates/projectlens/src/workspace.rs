//! Workspace CRUD operations.
//!
//! A workspace is one Backlog space: its domain, API key, the project keys
//! whose issues are kept, and the last API usage reported by the remote.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    Set, TransactionTrait,
};
use thiserror::Error;

use crate::entity::sync_watermark::{Column as WatermarkColumn, Entity as SyncWatermark};
use crate::entity::synced_entity::{Column as SyncedColumn, Entity as SyncedEntity};
use crate::entity::workspace::{ActiveModel, Column, Entity as Workspace, Model};
use crate::remote::RateLimitInfo;

/// Errors that can occur during workspace operations.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error("Workspace not found: {0}")]
    NotFound(String),

    #[error("Workspace already exists: {0}")]
    Duplicate(String),

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

/// Input for [`add`].
#[derive(Debug, Clone)]
pub struct NewWorkspace {
    pub id: String,
    pub domain: String,
    pub api_key: String,
    pub project_keys: Vec<String>,
}

impl NewWorkspace {
    fn validate(&self) -> Result<()> {
        let invalid = |message: &str| {
            Err(WorkspaceError::InvalidInput {
                message: message.to_string(),
            })
        };
        if self.id.trim().is_empty() {
            return invalid("workspace id must not be empty");
        }
        if self.id.chars().any(char::is_whitespace) {
            return invalid("workspace id must not contain whitespace");
        }
        if self.domain.trim().is_empty() {
            return invalid("domain must not be empty");
        }
        if self.api_key.trim().is_empty() {
            return invalid("api key must not be empty");
        }
        Ok(())
    }
}

/// Register a new workspace.
pub async fn add(db: &DatabaseConnection, input: NewWorkspace) -> Result<Model> {
    input.validate()?;
    if find(db, &input.id).await?.is_some() {
        return Err(WorkspaceError::Duplicate(input.id));
    }

    let now = Utc::now().fixed_offset();
    let keys: Vec<String> = input
        .project_keys
        .iter()
        .map(|k| k.trim().to_uppercase())
        .filter(|k| !k.is_empty())
        .collect();

    let model = ActiveModel {
        id: Set(input.id),
        domain: Set(input.domain.trim().to_string()),
        api_key: Set(input.api_key),
        project_keys: Set(serde_json::json!(keys)),
        enabled: Set(true),
        user_id: Set(None),
        user_name: Set(None),
        api_limit: Set(None),
        api_remaining: Set(None),
        api_reset: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    };
    Ok(model.insert(db).await?)
}

pub async fn find(db: &DatabaseConnection, id: &str) -> Result<Option<Model>> {
    Ok(Workspace::find_by_id(id.to_string()).one(db).await?)
}

/// Find a workspace or fail with [`WorkspaceError::NotFound`].
pub async fn get(db: &DatabaseConnection, id: &str) -> Result<Model> {
    find(db, id)
        .await?
        .ok_or_else(|| WorkspaceError::NotFound(id.to_string()))
}

/// All workspaces ordered by id.
pub async fn list(db: &DatabaseConnection) -> Result<Vec<Model>> {
    Ok(Workspace::find().order_by_asc(Column::Id).all(db).await?)
}

pub async fn list_enabled(db: &DatabaseConnection) -> Result<Vec<Model>> {
    Ok(Workspace::find()
        .filter(Column::Enabled.eq(true))
        .order_by_asc(Column::Id)
        .all(db)
        .await?)
}

pub async fn set_enabled(db: &DatabaseConnection, id: &str, enabled: bool) -> Result<Model> {
    let mut model: ActiveModel = get(db, id).await?.into();
    model.enabled = Set(enabled);
    model.updated_at = Set(Utc::now().fixed_offset());
    Ok(model.update(db).await?)
}

/// Remove a workspace together with its mirrored entities and watermarks.
///
/// Returns true if the workspace existed.
pub async fn remove(db: &DatabaseConnection, id: &str) -> Result<bool> {
    let txn = db.begin().await?;
    SyncedEntity::delete_many()
        .filter(SyncedColumn::WorkspaceId.eq(id))
        .exec(&txn)
        .await?;
    SyncWatermark::delete_many()
        .filter(WatermarkColumn::WorkspaceId.eq(id))
        .exec(&txn)
        .await?;
    let result = Workspace::delete_by_id(id.to_string()).exec(&txn).await?;
    txn.commit().await?;
    Ok(result.rows_affected > 0)
}

/// Store the identity of the API key's owner (from `/users/myself`).
pub async fn set_user(db: &DatabaseConnection, id: &str, user_id: i64, name: &str) -> Result<()> {
    let mut model: ActiveModel = get(db, id).await?.into();
    model.user_id = Set(Some(user_id));
    model.user_name = Set(Some(name.to_string()));
    model.updated_at = Set(Utc::now().fixed_offset());
    model.update(db).await?;
    Ok(())
}

/// Record the latest rate limit usage reported by the remote.
pub async fn save_usage(db: &DatabaseConnection, id: &str, info: &RateLimitInfo) -> Result<()> {
    let mut model: ActiveModel = get(db, id).await?.into();
    model.api_limit = Set(Some(info.limit as i64));
    model.api_remaining = Set(Some(info.remaining as i64));
    model.api_reset = Set(info.reset_at.map(|t| t.fixed_offset()));
    model.updated_at = Set(Utc::now().fixed_offset());
    model.update(db).await?;
    Ok(())
}

/// Build a client pool with a rate-limited Backlog client per enabled workspace.
#[cfg(feature = "backlog")]
pub async fn build_client_pool(
    db: &DatabaseConnection,
    request_timeout: std::time::Duration,
) -> std::result::Result<crate::remote::ClientPool, Box<dyn std::error::Error + Send + Sync>> {
    use std::sync::Arc;

    use crate::backlog::BacklogClient;
    use crate::remote::{ClientPool, RateLimitedClient, rate_limits};

    let pool = ClientPool::new();
    for ws in list_enabled(db).await? {
        let client = BacklogClient::new(&ws.domain, &ws.api_key, request_timeout)?;
        pool.insert(
            ws.id.clone(),
            Arc::new(RateLimitedClient::new(
                client,
                rate_limits::BACKLOG_DEFAULT_RPS,
            )),
        );
    }
    Ok(pool)
}

#[cfg(all(test, feature = "sqlite", feature = "migrate"))]
mod tests {
    use super::*;
    use crate::connect_and_migrate;

    async fn setup_test_db() -> DatabaseConnection {
        connect_and_migrate("sqlite::memory:")
            .await
            .expect("Failed to create test database")
    }

    fn new_workspace(id: &str) -> NewWorkspace {
        NewWorkspace {
            id: id.to_string(),
            domain: "acme.backlog.com".to_string(),
            api_key: "secret".to_string(),
            project_keys: vec!["proj".to_string(), " ".to_string()],
        }
    }

    #[tokio::test]
    async fn test_add_and_get() {
        let db = setup_test_db().await;
        let ws = add(&db, new_workspace("acme")).await.unwrap();

        assert_eq!(ws.id, "acme");
        assert!(ws.enabled);
        assert_eq!(ws.project_key_list(), vec!["PROJ"]);

        let found = get(&db, "acme").await.unwrap();
        assert_eq!(found.domain, "acme.backlog.com");
    }

    #[tokio::test]
    async fn test_add_rejects_duplicates_and_invalid_input() {
        let db = setup_test_db().await;
        add(&db, new_workspace("acme")).await.unwrap();

        assert!(matches!(
            add(&db, new_workspace("acme")).await,
            Err(WorkspaceError::Duplicate(_))
        ));

        let mut bad = new_workspace("has space");
        assert!(matches!(
            add(&db, bad.clone()).await,
            Err(WorkspaceError::InvalidInput { .. })
        ));
        bad.id = "ok".to_string();
        bad.api_key = String::new();
        assert!(matches!(
            add(&db, bad).await,
            Err(WorkspaceError::InvalidInput { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_enabled_filters_disabled() {
        let db = setup_test_db().await;
        add(&db, new_workspace("beta")).await.unwrap();
        add(&db, new_workspace("alpha")).await.unwrap();
        set_enabled(&db, "beta", false).await.unwrap();

        let all: Vec<String> = list(&db).await.unwrap().into_iter().map(|w| w.id).collect();
        assert_eq!(all, vec!["alpha", "beta"]);

        let enabled: Vec<String> = list_enabled(&db)
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.id)
            .collect();
        assert_eq!(enabled, vec!["alpha"]);
    }

    #[tokio::test]
    async fn test_set_user_and_save_usage() {
        let db = setup_test_db().await;
        add(&db, new_workspace("acme")).await.unwrap();

        set_user(&db, "acme", 42, "Taro").await.unwrap();
        save_usage(
            &db,
            "acme",
            &RateLimitInfo {
                limit: 600,
                remaining: 540,
                reset_at: None,
            },
        )
        .await
        .unwrap();

        let ws = get(&db, "acme").await.unwrap();
        assert_eq!(ws.user_id, Some(42));
        assert_eq!(ws.user_name.as_deref(), Some("Taro"));
        assert_eq!(ws.api_limit, Some(600));
        assert_eq!(ws.api_remaining, Some(540));
    }

    #[tokio::test]
    async fn test_remove() {
        let db = setup_test_db().await;
        add(&db, new_workspace("acme")).await.unwrap();

        assert!(remove(&db, "acme").await.unwrap());
        assert!(!remove(&db, "acme").await.unwrap());
        assert!(matches!(
            get(&db, "acme").await,
            Err(WorkspaceError::NotFound(_))
        ));
    }
}
