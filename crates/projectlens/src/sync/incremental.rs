//! Delta computation and watermark tracking over the local mirror.
//!
//! [`IncrementalSyncManager::calculate_delta_changes`] is pure. Everything
//! else reads or writes the `synced_entities` and `sync_watermarks` tables.
//! A watermark only moves inside the transaction that stores the delta it
//! covers, so it never runs ahead of durably stored data.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::{
    ColumnTrait, DatabaseConnection, DatabaseTransaction, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
    sea_query::{Expr, OnConflict},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::entity::entity_collection::EntityCollection;
use crate::entity::sync_watermark::{
    ActiveModel as WatermarkActiveModel, Column as WatermarkColumn, Entity as SyncWatermark,
};
use crate::entity::synced_entity::{
    ActiveModel as SyncedActiveModel, Column as SyncedColumn, Entity as SyncedEntity,
    Model as SyncedModel,
};
use crate::retry::{RetryConfig, with_db_retry};

/// Watermark scope used by the historical backfill.
pub const HISTORY_SCOPE: &str = "history";

/// One remote item, reduced to what diffing and storage need.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncItem {
    /// Stable remote id.
    pub id: i64,
    /// Remote last-modified marker.
    pub updated: Option<DateTime<Utc>>,
    pub relevance_score: Option<i32>,
    pub payload: serde_json::Value,
}

impl From<SyncedModel> for SyncItem {
    fn from(model: SyncedModel) -> Self {
        Self {
            id: model.external_id,
            updated: model.remote_updated_at.map(|t| t.with_timezone(&Utc)),
            relevance_score: model.relevance_score,
            payload: model.payload,
        }
    }
}

/// Whether a fetch is authoritative for its collection.
///
/// Only a `Full` sync can infer deletions from absence; an empty
/// incremental fetch means nothing changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeltaStats {
    /// Number of fetched items considered.
    pub total_processed: usize,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

impl DeltaStats {
    pub fn merge(&mut self, other: &DeltaStats) {
        self.total_processed += other.total_processed;
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.unchanged += other.unchanged;
    }

    pub fn has_changes(&self) -> bool {
        self.created + self.updated + self.deleted > 0
    }
}

/// Partition of a fetch against the stored collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncDelta {
    pub created: Vec<SyncItem>,
    pub updated: Vec<SyncItem>,
    pub deleted: Vec<SyncItem>,
    pub unchanged: Vec<SyncItem>,
    pub stats: DeltaStats,
}

impl SyncDelta {
    /// Largest `updated` marker among created and updated items.
    pub fn max_updated(&self) -> Option<DateTime<Utc>> {
        self.created
            .iter()
            .chain(&self.updated)
            .filter_map(|item| item.updated)
            .max()
    }

    /// Largest `updated` marker among every fetched item, unchanged included.
    pub fn max_seen(&self) -> Option<DateTime<Utc>> {
        self.created
            .iter()
            .chain(&self.updated)
            .chain(&self.unchanged)
            .filter_map(|item| item.updated)
            .max()
    }
}

/// Input for [`IncrementalSyncManager::get_updated_since_param`].
#[derive(Debug, Clone)]
pub struct WatermarkQuery {
    pub workspace_id: String,
    pub collection: EntityCollection,
    /// Narrower scope inside the collection; `None` is the whole collection.
    pub entity_id: Option<String>,
    pub sync_type: SyncType,
}

impl WatermarkQuery {
    pub fn incremental(workspace_id: &str, collection: EntityCollection) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            collection,
            entity_id: None,
            sync_type: SyncType::Incremental,
        }
    }

    fn scope(&self) -> &str {
        self.entity_id.as_deref().unwrap_or("")
    }
}

/// Errors from the local mirror.
#[derive(Debug, Error)]
pub enum SyncStoreError {
    #[error("Database error: {0}")]
    Database(#[from] DbErr),
}

pub type Result<T> = std::result::Result<T, SyncStoreError>;

/// Outcome of [`IncrementalSyncManager::apply_delta`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistSummary {
    pub upserted: usize,
    pub deleted: usize,
    /// Watermark after the write, if the scope has one.
    pub watermark: Option<DateTime<Utc>>,
}

/// Diffs fetched items against the mirror and advances watermarks.
#[derive(Clone)]
pub struct IncrementalSyncManager {
    db: Arc<DatabaseConnection>,
    retry: RetryConfig,
}

impl IncrementalSyncManager {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            db,
            retry: RetryConfig::new(
                std::time::Duration::from_millis(50),
                std::time::Duration::from_millis(1_000),
                3,
            ),
        }
    }

    /// Override the retry policy for store writes.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn db(&self) -> &DatabaseConnection {
        self.db.as_ref()
    }

    /// The `updatedSince` value for the next fetch.
    ///
    /// `None` before the first successful sync of the scope, and always
    /// `None` for a full sync.
    pub async fn get_updated_since_param(
        &self,
        query: &WatermarkQuery,
    ) -> Result<Option<DateTime<Utc>>> {
        if query.sync_type == SyncType::Full {
            return Ok(None);
        }
        self.watermark(&query.workspace_id, query.collection, query.scope())
            .await
    }

    /// Stored watermark for one scope.
    pub async fn watermark(
        &self,
        workspace_id: &str,
        collection: EntityCollection,
        scope: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let row = SyncWatermark::find()
            .filter(WatermarkColumn::WorkspaceId.eq(workspace_id))
            .filter(WatermarkColumn::Collection.eq(collection))
            .filter(WatermarkColumn::Scope.eq(scope))
            .one(self.db.as_ref())
            .await?;
        Ok(row.map(|w| w.watermark.with_timezone(&Utc)))
    }

    /// Partition `fetched` against `existing`, matching by `id`.
    ///
    /// An item is updated only when its `updated` marker is newer than the
    /// stored one. Deletions are reported for [`SyncType::Full`] only.
    pub fn calculate_delta_changes(
        fetched: &[SyncItem],
        existing: &[SyncItem],
        sync_type: SyncType,
    ) -> SyncDelta {
        let stored: HashMap<i64, &SyncItem> = existing.iter().map(|item| (item.id, item)).collect();
        let mut delta = SyncDelta::default();

        for item in fetched {
            match stored.get(&item.id) {
                None => delta.created.push(item.clone()),
                Some(old) if is_newer(item.updated, old.updated) => {
                    delta.updated.push(item.clone())
                }
                Some(_) => delta.unchanged.push(item.clone()),
            }
        }

        if sync_type == SyncType::Full {
            let seen: HashSet<i64> = fetched.iter().map(|item| item.id).collect();
            delta.deleted = existing
                .iter()
                .filter(|item| !seen.contains(&item.id))
                .cloned()
                .collect();
        }

        delta.stats = DeltaStats {
            total_processed: fetched.len(),
            created: delta.created.len(),
            updated: delta.updated.len(),
            deleted: delta.deleted.len(),
            unchanged: delta.unchanged.len(),
        };
        delta
    }

    /// Every stored item of one collection.
    pub async fn load_existing(
        &self,
        workspace_id: &str,
        collection: EntityCollection,
    ) -> Result<Vec<SyncItem>> {
        let rows = SyncedEntity::find()
            .filter(SyncedColumn::WorkspaceId.eq(workspace_id))
            .filter(SyncedColumn::Collection.eq(collection))
            .order_by_asc(SyncedColumn::ExternalId)
            .all(self.db.as_ref())
            .await?;
        Ok(rows.into_iter().map(SyncItem::from).collect())
    }

    /// Highest scored stored items, best first.
    pub async fn top_scored(
        &self,
        workspace_id: &str,
        collection: EntityCollection,
        limit: u64,
    ) -> Result<Vec<SyncItem>> {
        let rows = SyncedEntity::find()
            .filter(SyncedColumn::WorkspaceId.eq(workspace_id))
            .filter(SyncedColumn::Collection.eq(collection))
            .filter(SyncedColumn::RelevanceScore.is_not_null())
            .order_by_desc(SyncedColumn::RelevanceScore)
            .order_by_desc(SyncedColumn::RemoteUpdatedAt)
            .limit(limit)
            .all(self.db.as_ref())
            .await?;
        Ok(rows.into_iter().map(SyncItem::from).collect())
    }

    /// Overwrite stored relevance scores without touching payloads.
    ///
    /// Used for items whose remote copy is unchanged but whose score moved.
    pub async fn update_scores(
        &self,
        workspace_id: &str,
        collection: EntityCollection,
        scores: &[(i64, Option<i32>)],
    ) -> Result<usize> {
        if scores.is_empty() {
            return Ok(0);
        }
        let updated = with_db_retry(
            move || self.update_scores_once(workspace_id, collection, scores),
            &self.retry,
        )
        .await?;
        tracing::debug!(updated, %collection, "Relevance scores refreshed");
        Ok(updated)
    }

    async fn update_scores_once(
        &self,
        workspace_id: &str,
        collection: EntityCollection,
        scores: &[(i64, Option<i32>)],
    ) -> std::result::Result<usize, DbErr> {
        let txn = self.db.begin().await?;
        let mut updated = 0;
        for (external_id, score) in scores {
            updated += SyncedEntity::update_many()
                .col_expr(SyncedColumn::RelevanceScore, Expr::value(*score))
                .filter(SyncedColumn::WorkspaceId.eq(workspace_id))
                .filter(SyncedColumn::Collection.eq(collection))
                .filter(SyncedColumn::ExternalId.eq(*external_id))
                .exec(&txn)
                .await?
                .rows_affected as usize;
        }
        txn.commit().await?;
        Ok(updated)
    }

    /// Persist `delta` and advance the watermark of `scope` in one transaction.
    ///
    /// With `scope == None` items are stored but no watermark moves, which is
    /// what partial fetches need. The watermark never moves backwards.
    #[tracing::instrument(skip(self, delta), fields(created = delta.stats.created, updated = delta.stats.updated, deleted = delta.stats.deleted))]
    pub async fn apply_delta(
        &self,
        workspace_id: &str,
        collection: EntityCollection,
        scope: Option<&str>,
        delta: &SyncDelta,
    ) -> Result<PersistSummary> {
        let summary = with_db_retry(
            move || self.apply_delta_once(workspace_id, collection, scope, delta),
            &self.retry,
        )
        .await?;

        tracing::debug!(
            upserted = summary.upserted,
            deleted = summary.deleted,
            watermark = ?summary.watermark,
            "Delta applied"
        );
        Ok(summary)
    }

    async fn apply_delta_once(
        &self,
        workspace_id: &str,
        collection: EntityCollection,
        scope: Option<&str>,
        delta: &SyncDelta,
    ) -> std::result::Result<PersistSummary, DbErr> {
        let txn = self.db.begin().await?;
        let now = Utc::now().fixed_offset();

        let models: Vec<SyncedActiveModel> = delta
            .created
            .iter()
            .chain(&delta.updated)
            .map(|item| SyncedActiveModel {
                id: Set(Uuid::new_v4()),
                workspace_id: Set(workspace_id.to_string()),
                collection: Set(collection),
                external_id: Set(item.id),
                remote_updated_at: Set(item.updated.map(|t| t.fixed_offset())),
                relevance_score: Set(item.relevance_score),
                payload: Set(item.payload.clone()),
                synced_at: Set(now),
            })
            .collect();
        let upserted = models.len();
        if !models.is_empty() {
            SyncedEntity::insert_many(models)
                .on_conflict(
                    OnConflict::columns([
                        SyncedColumn::WorkspaceId,
                        SyncedColumn::Collection,
                        SyncedColumn::ExternalId,
                    ])
                    .update_columns([
                        SyncedColumn::RemoteUpdatedAt,
                        SyncedColumn::RelevanceScore,
                        SyncedColumn::Payload,
                        SyncedColumn::SyncedAt,
                    ])
                    .to_owned(),
                )
                .exec_without_returning(&txn)
                .await?;
        }

        let mut deleted = 0;
        if !delta.deleted.is_empty() {
            let ids: Vec<i64> = delta.deleted.iter().map(|item| item.id).collect();
            deleted = SyncedEntity::delete_many()
                .filter(SyncedColumn::WorkspaceId.eq(workspace_id))
                .filter(SyncedColumn::Collection.eq(collection))
                .filter(SyncedColumn::ExternalId.is_in(ids))
                .exec(&txn)
                .await?
                .rows_affected as usize;
        }

        let watermark = match scope {
            Some(scope) => {
                advance_watermark(&txn, workspace_id, collection, scope, delta.max_seen())
                    .await?
            }
            None => None,
        };

        txn.commit().await?;
        Ok(PersistSummary {
            upserted,
            deleted,
            watermark,
        })
    }
}

fn is_newer(fetched: Option<DateTime<Utc>>, stored: Option<DateTime<Utc>>) -> bool {
    match (fetched, stored) {
        (Some(new), Some(old)) => new > old,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

async fn advance_watermark(
    txn: &DatabaseTransaction,
    workspace_id: &str,
    collection: EntityCollection,
    scope: &str,
    candidate: Option<DateTime<Utc>>,
) -> std::result::Result<Option<DateTime<Utc>>, DbErr> {
    let current = SyncWatermark::find()
        .filter(WatermarkColumn::WorkspaceId.eq(workspace_id))
        .filter(WatermarkColumn::Collection.eq(collection))
        .filter(WatermarkColumn::Scope.eq(scope))
        .one(txn)
        .await?;
    let current_value = current.as_ref().map(|w| w.watermark.with_timezone(&Utc));

    let Some(candidate) = candidate else {
        return Ok(current_value);
    };
    if current_value.is_some_and(|value| value >= candidate) {
        return Ok(current_value);
    }

    let now = Utc::now().fixed_offset();
    match current {
        Some(row) => {
            let mut model: WatermarkActiveModel = row.into();
            model.watermark = Set(candidate.fixed_offset());
            model.updated_at = Set(now);
            SyncWatermark::update(model).exec(txn).await?;
        }
        None => {
            let model = WatermarkActiveModel {
                id: Set(Uuid::new_v4()),
                workspace_id: Set(workspace_id.to_string()),
                collection: Set(collection),
                scope: Set(scope.to_string()),
                watermark: Set(candidate.fixed_offset()),
                updated_at: Set(now),
            };
            SyncWatermark::insert(model).exec_without_returning(txn).await?;
        }
    }
    Ok(Some(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn item(id: i64, updated: &str) -> SyncItem {
        SyncItem {
            id,
            updated: Some(ts(updated)),
            relevance_score: None,
            payload: json!({"id": id, "updated": updated}),
        }
    }

    #[test]
    fn test_delta_created_and_updated() {
        let fetched = vec![
            item(1, "2024-01-01T10:00:00Z"),
            item(2, "2024-01-01T11:00:00Z"),
        ];
        let existing = vec![item(1, "2024-01-01T09:00:00Z")];

        let delta = IncrementalSyncManager::calculate_delta_changes(
            &fetched,
            &existing,
            SyncType::Incremental,
        );

        assert_eq!(delta.created.iter().map(|i| i.id).collect::<Vec<_>>(), vec![2]);
        assert_eq!(delta.updated.iter().map(|i| i.id).collect::<Vec<_>>(), vec![1]);
        assert!(delta.deleted.is_empty());
        assert_eq!(delta.stats.total_processed, 2);
        assert_eq!(delta.max_updated(), Some(ts("2024-01-01T11:00:00Z")));
    }

    #[test]
    fn test_delta_same_or_older_marker_is_unchanged() {
        let fetched = vec![item(1, "2024-01-01T09:00:00Z"), item(2, "2023-12-31T00:00:00Z")];
        let existing = vec![item(1, "2024-01-01T09:00:00Z"), item(2, "2024-01-01T00:00:00Z")];

        let delta =
            IncrementalSyncManager::calculate_delta_changes(&fetched, &existing, SyncType::Full);

        assert_eq!(delta.stats.unchanged, 2);
        assert!(!delta.stats.has_changes());
        assert_eq!(delta.max_updated(), None);
        assert_eq!(delta.max_seen(), Some(ts("2024-01-01T09:00:00Z")));
    }

    #[test]
    fn test_empty_fetch_depends_on_sync_type() {
        let existing = vec![item(1, "2024-01-01T09:00:00Z"), item(2, "2024-01-01T09:00:00Z")];

        let full = IncrementalSyncManager::calculate_delta_changes(&[], &existing, SyncType::Full);
        assert_eq!(full.stats.deleted, 2);
        assert_eq!(full.stats.total_processed, 0);

        let incremental =
            IncrementalSyncManager::calculate_delta_changes(&[], &existing, SyncType::Incremental);
        assert!(incremental.deleted.is_empty());
    }

    #[test]
    fn test_missing_stored_marker_counts_as_update() {
        let mut stored = item(5, "2024-01-01T09:00:00Z");
        stored.updated = None;
        let delta = IncrementalSyncManager::calculate_delta_changes(
            &[item(5, "2024-01-01T09:00:00Z")],
            &[stored],
            SyncType::Incremental,
        );
        assert_eq!(delta.stats.updated, 1);
    }

    #[test]
    fn test_delta_stats_merge() {
        let mut total = DeltaStats::default();
        total.merge(&DeltaStats {
            total_processed: 3,
            created: 1,
            updated: 1,
            deleted: 0,
            unchanged: 1,
        });
        total.merge(&DeltaStats {
            total_processed: 1,
            deleted: 2,
            ..DeltaStats::default()
        });
        assert_eq!(total.total_processed, 4);
        assert_eq!(total.deleted, 2);
        assert!(total.has_changes());
    }

    #[cfg(all(feature = "sqlite", feature = "migrate"))]
    mod store {
        use super::*;
        use crate::connect_and_migrate;
        use crate::workspace::{self, NewWorkspace};

        async fn setup() -> IncrementalSyncManager {
            let db = connect_and_migrate("sqlite::memory:")
                .await
                .expect("Failed to create test database");
            workspace::add(
                &db,
                NewWorkspace {
                    id: "acme".to_string(),
                    domain: "acme.backlog.com".to_string(),
                    api_key: "secret".to_string(),
                    project_keys: vec![],
                },
            )
            .await
            .unwrap();
            IncrementalSyncManager::new(Arc::new(db))
        }

        #[tokio::test]
        async fn test_updated_since_is_none_before_any_sync() {
            let manager = setup().await;
            let query = WatermarkQuery::incremental("acme", EntityCollection::Issues);
            for _ in 0..3 {
                assert_eq!(manager.get_updated_since_param(&query).await.unwrap(), None);
            }
        }

        #[tokio::test]
        async fn test_apply_delta_round_trip_and_monotonic_watermark() {
            let manager = setup().await;
            let fetched = vec![
                item(1, "2024-01-01T10:00:00Z"),
                item(2, "2024-01-01T11:00:00Z"),
            ];
            let delta =
                IncrementalSyncManager::calculate_delta_changes(&fetched, &[], SyncType::Full);
            let summary = manager
                .apply_delta("acme", EntityCollection::Issues, Some(""), &delta)
                .await
                .unwrap();
            assert_eq!(summary.upserted, 2);

            let query = WatermarkQuery::incremental("acme", EntityCollection::Issues);
            let watermark = manager.get_updated_since_param(&query).await.unwrap().unwrap();
            assert!(watermark >= ts("2024-01-01T11:00:00Z"));

            // Older data never pulls the watermark back
            let existing = manager
                .load_existing("acme", EntityCollection::Issues)
                .await
                .unwrap();
            assert_eq!(existing.len(), 2);
            let older = vec![item(3, "2023-06-01T00:00:00Z")];
            let delta = IncrementalSyncManager::calculate_delta_changes(
                &older,
                &existing,
                SyncType::Incremental,
            );
            let summary = manager
                .apply_delta("acme", EntityCollection::Issues, Some(""), &delta)
                .await
                .unwrap();
            assert_eq!(summary.watermark, Some(ts("2024-01-01T11:00:00Z")));

            let full = WatermarkQuery {
                sync_type: SyncType::Full,
                ..query
            };
            assert_eq!(manager.get_updated_since_param(&full).await.unwrap(), None);
        }

        #[tokio::test]
        async fn test_apply_delta_updates_and_deletes_rows() {
            let manager = setup().await;
            let first = IncrementalSyncManager::calculate_delta_changes(
                &[item(1, "2024-01-01T10:00:00Z"), item(2, "2024-01-01T10:00:00Z")],
                &[],
                SyncType::Full,
            );
            manager
                .apply_delta("acme", EntityCollection::Projects, None, &first)
                .await
                .unwrap();

            let existing = manager
                .load_existing("acme", EntityCollection::Projects)
                .await
                .unwrap();
            let second = IncrementalSyncManager::calculate_delta_changes(
                &[item(1, "2024-02-01T10:00:00Z")],
                &existing,
                SyncType::Full,
            );
            let summary = manager
                .apply_delta("acme", EntityCollection::Projects, None, &second)
                .await
                .unwrap();
            assert_eq!(summary.upserted, 1);
            assert_eq!(summary.deleted, 1);
            assert_eq!(summary.watermark, None);

            let stored = manager
                .load_existing("acme", EntityCollection::Projects)
                .await
                .unwrap();
            assert_eq!(stored.len(), 1);
            assert_eq!(stored[0].updated, Some(ts("2024-02-01T10:00:00Z")));
            assert_eq!(
                manager
                    .watermark("acme", EntityCollection::Projects, "")
                    .await
                    .unwrap(),
                None
            );
        }

        #[tokio::test]
        async fn test_top_scored_orders_by_score() {
            let manager = setup().await;
            let mut low = item(1, "2024-01-01T10:00:00Z");
            low.relevance_score = Some(10);
            let mut high = item(2, "2024-01-01T10:00:00Z");
            high.relevance_score = Some(150);
            let unscored = item(3, "2024-01-01T10:00:00Z");
            let delta = IncrementalSyncManager::calculate_delta_changes(
                &[low, high, unscored],
                &[],
                SyncType::Incremental,
            );
            manager
                .apply_delta("acme", EntityCollection::Issues, None, &delta)
                .await
                .unwrap();

            let top = manager
                .top_scored("acme", EntityCollection::Issues, 10)
                .await
                .unwrap();
            assert_eq!(top.iter().map(|i| i.id).collect::<Vec<_>>(), vec![2, 1]);
        }

        #[tokio::test]
        async fn test_unchanged_fetch_still_advances_watermark() {
            let manager = setup().await;
            let stored = IncrementalSyncManager::calculate_delta_changes(
                &[item(1, "2024-03-01T10:00:00Z")],
                &[],
                SyncType::Incremental,
            );
            manager
                .apply_delta("acme", EntityCollection::Issues, None, &stored)
                .await
                .unwrap();

            let existing = manager
                .load_existing("acme", EntityCollection::Issues)
                .await
                .unwrap();
            let refetch = IncrementalSyncManager::calculate_delta_changes(
                &[item(1, "2024-03-01T10:00:00Z")],
                &existing,
                SyncType::Incremental,
            );
            assert_eq!(refetch.stats.unchanged, 1);
            let summary = manager
                .apply_delta("acme", EntityCollection::Issues, Some(""), &refetch)
                .await
                .unwrap();
            assert_eq!(summary.upserted, 0);
            assert_eq!(summary.watermark, Some(ts("2024-03-01T10:00:00Z")));
        }

        #[tokio::test]
        async fn test_update_scores_rewrites_only_scores() {
            let manager = setup().await;
            let delta = IncrementalSyncManager::calculate_delta_changes(
                &[item(1, "2024-01-01T10:00:00Z"), item(2, "2024-01-01T10:00:00Z")],
                &[],
                SyncType::Incremental,
            );
            manager
                .apply_delta("acme", EntityCollection::Issues, None, &delta)
                .await
                .unwrap();

            let updated = manager
                .update_scores("acme", EntityCollection::Issues, &[(1, Some(120)), (9, Some(5))])
                .await
                .unwrap();
            assert_eq!(updated, 1);
            assert_eq!(
                manager
                    .update_scores("acme", EntityCollection::Issues, &[])
                    .await
                    .unwrap(),
                0
            );

            let stored = manager
                .load_existing("acme", EntityCollection::Issues)
                .await
                .unwrap();
            assert_eq!(stored[0].relevance_score, Some(120));
            assert_eq!(stored[0].updated, Some(ts("2024-01-01T10:00:00Z")));
            assert_eq!(stored[0].payload["id"], 1);
            assert_eq!(stored[1].relevance_score, None);
        }
    }
}
