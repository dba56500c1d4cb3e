//! Summary record persistence.
//!
//! `PgSummaryStore` is the production backend; `InMemorySummaryStore` backs
//! tests and local runs. Both enforce the same rule: `status` never moves
//! backward, every other present patch field overwrites.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    DateRange, NewSummary, RecordPatch, SummaryKind, SummaryRecord, SummaryStatus,
};

#[async_trait]
pub trait SummaryStore: Send + Sync {
    /// Insert a fresh `draft` record.
    async fn create(&self, new: NewSummary) -> Result<SummaryRecord, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<SummaryRecord>, StoreError>;

    /// Partial update; returns the record as stored afterwards.
    async fn update_fields(
        &self,
        id: Uuid,
        patch: &RecordPatch,
    ) -> Result<SummaryRecord, StoreError>;
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug, Default)]
pub struct InMemorySummaryStore {
    records: RwLock<HashMap<Uuid, SummaryRecord>>,
}

impl InMemorySummaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl SummaryStore for InMemorySummaryStore {
    async fn create(&self, new: NewSummary) -> Result<SummaryRecord, StoreError> {
        let record = SummaryRecord::draft(new);
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }
        records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<SummaryRecord>, StoreError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn update_fields(
        &self,
        id: Uuid,
        patch: &RecordPatch,
    ) -> Result<SummaryRecord, StoreError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.apply(patch);
        Ok(record.clone())
    }
}

// ============================================================================
// PostgreSQL
// ============================================================================

/// Rank of a status column value; must agree with `SummaryStatus::rank`.
const STATUS_RANK_SQL: &str =
    "CASE status WHEN 'draft' THEN 0 WHEN 'processing' THEN 1 ELSE 2 END";
const NEW_STATUS_RANK_SQL: &str =
    "CASE $11::text WHEN 'draft' THEN 0 WHEN 'processing' THEN 1 ELSE 2 END";

const SELECT_COLUMNS: &str = "id, owner_id, kind, range_start, range_end, input_snapshot, \
     raw_response, summary_text, plus_points, minus_points, ai_suggestions, weekly_stats, \
     model, error_message, status, generated_at, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct SummaryRow {
    id: Uuid,
    owner_id: String,
    kind: String,
    range_start: Option<NaiveDate>,
    range_end: Option<NaiveDate>,
    input_snapshot: serde_json::Value,
    raw_response: Option<String>,
    summary_text: Option<String>,
    plus_points: Json<Vec<String>>,
    minus_points: Json<Vec<String>>,
    ai_suggestions: Json<Vec<String>>,
    weekly_stats: Option<serde_json::Value>,
    model: Option<String>,
    error_message: Option<String>,
    status: String,
    generated_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SummaryRow> for SummaryRecord {
    type Error = StoreError;

    fn try_from(row: SummaryRow) -> Result<Self, Self::Error> {
        let kind: SummaryKind = row.kind.parse().map_err(StoreError::Corrupt)?;
        let status: SummaryStatus = row.status.parse().map_err(StoreError::Corrupt)?;
        let date_range = match (row.range_start, row.range_end) {
            (Some(start), Some(end)) => Some(DateRange { start, end }),
            _ => None,
        };

        Ok(SummaryRecord {
            id: row.id,
            owner_id: row.owner_id,
            kind,
            date_range,
            input_snapshot: row.input_snapshot,
            raw_response: row.raw_response,
            summary_text: row.summary_text,
            plus_points: row.plus_points.0,
            minus_points: row.minus_points.0,
            ai_suggestions: row.ai_suggestions.0,
            weekly_stats: row.weekly_stats,
            model: row.model,
            error_message: row.error_message,
            status,
            generated_at: row.generated_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Store over the `summaries` table. Schema is managed outside this crate.
#[derive(Debug, Clone)]
pub struct PgSummaryStore {
    pool: PgPool,
}

impl PgSummaryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SummaryStore for PgSummaryStore {
    async fn create(&self, new: NewSummary) -> Result<SummaryRecord, StoreError> {
        let draft = SummaryRecord::draft(new);
        let sql = format!(
            "INSERT INTO summaries \
               (id, owner_id, kind, range_start, range_end, input_snapshot, \
                plus_points, minus_points, ai_suggestions, status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, '[]'::jsonb, '[]'::jsonb, '[]'::jsonb, $7, $8, $8) \
             RETURNING {SELECT_COLUMNS}"
        );

        let row: SummaryRow = sqlx::query_as(&sql)
            .bind(draft.id)
            .bind(&draft.owner_id)
            .bind(draft.kind.as_str())
            .bind(draft.date_range.map(|r| r.start))
            .bind(draft.date_range.map(|r| r.end))
            .bind(&draft.input_snapshot)
            .bind(draft.status.as_str())
            .bind(draft.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if e.as_database_error()
                    .is_some_and(|db| db.is_unique_violation())
                {
                    StoreError::AlreadyExists(draft.id)
                } else {
                    StoreError::Database(e)
                }
            })?;

        tracing::debug!(summary_id = %row.id, kind = %row.kind, "Created draft summary");
        row.try_into()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<SummaryRecord>, StoreError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM summaries WHERE id = $1");
        let row: Option<SummaryRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(SummaryRecord::try_from).transpose()
    }

    async fn update_fields(
        &self,
        id: Uuid,
        patch: &RecordPatch,
    ) -> Result<SummaryRecord, StoreError> {
        // $3 gates the five result columns so they are written together.
        let sql = format!(
            "UPDATE summaries SET \
               raw_response   = COALESCE($2, raw_response), \
               summary_text   = CASE WHEN $3 THEN $4 ELSE summary_text END, \
               plus_points    = CASE WHEN $3 THEN $5 ELSE plus_points END, \
               minus_points   = CASE WHEN $3 THEN $6 ELSE minus_points END, \
               ai_suggestions = CASE WHEN $3 THEN $7 ELSE ai_suggestions END, \
               weekly_stats   = CASE WHEN $3 THEN $8 ELSE weekly_stats END, \
               model          = COALESCE($9, model), \
               error_message  = CASE WHEN $13 THEN NULL \
                                     ELSE COALESCE($10, error_message) END, \
               status         = CASE WHEN $11::text IS NOT NULL \
                                      AND {NEW_STATUS_RANK_SQL} >= {STATUS_RANK_SQL} \
                                     THEN $11 ELSE status END, \
               generated_at   = COALESCE($12, generated_at), \
               updated_at     = NOW() \
             WHERE id = $1 \
             RETURNING {SELECT_COLUMNS}"
        );

        let fields = patch.fields.as_ref();
        let row: Option<SummaryRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(patch.raw_response.as_deref())
            .bind(fields.is_some())
            .bind(fields.map(|f| f.summary_text.clone()))
            .bind(Json(fields.map(|f| f.plus_points.clone()).unwrap_or_default()))
            .bind(Json(fields.map(|f| f.minus_points.clone()).unwrap_or_default()))
            .bind(Json(fields.map(|f| f.ai_suggestions.clone()).unwrap_or_default()))
            .bind(fields.and_then(|f| f.weekly_stats.clone()))
            .bind(patch.model.as_deref())
            .bind(patch.error_message.as_deref())
            .bind(patch.status.map(|s| s.as_str()))
            .bind(patch.generated_at)
            .bind(patch.clear_error)
            .fetch_optional(&self.pool)
            .await?;

        let record: SummaryRecord = row.ok_or(StoreError::NotFound(id))?.try_into()?;
        if let Some(requested) = patch.status {
            if record.status != requested {
                tracing::debug!(
                    summary_id = %id,
                    current = %record.status,
                    requested = %requested,
                    "Ignored backward status transition"
                );
            }
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SummaryFields;
    use serde_json::json;

    fn new_weekly() -> NewSummary {
        NewSummary {
            owner_id: "owner-1".to_string(),
            kind: SummaryKind::Weekly,
            date_range: Some(DateRange {
                start: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
                end: NaiveDate::from_ymd_opt(2024, 3, 10).unwrap(),
            }),
            input_snapshot: json!({ "totalTrades": 2 }),
        }
    }

    #[tokio::test]
    async fn test_create_returns_draft() {
        let store = InMemorySummaryStore::new();
        let record = store.create(new_weekly()).await.unwrap();

        assert_eq!(record.status, SummaryStatus::Draft);
        assert!(record.raw_response.is_none());
        assert_eq!(
            store.find_by_id(record.id).await.unwrap(),
            Some(record.clone())
        );
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_find_missing_is_none() {
        let store = InMemorySummaryStore::new();
        assert!(store.find_by_id(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let store = InMemorySummaryStore::new();
        let id = Uuid::new_v4();
        let err = store
            .update_fields(id, &RecordPatch::failed("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(missing) if missing == id));
    }

    #[tokio::test]
    async fn test_checkpoint_then_ready() {
        let store = InMemorySummaryStore::new();
        let record = store.create(new_weekly()).await.unwrap();

        let after_checkpoint = store
            .update_fields(record.id, &RecordPatch::checkpoint("{raw}", "model-a"))
            .await
            .unwrap();
        assert_eq!(after_checkpoint.status, SummaryStatus::Processing);
        assert_eq!(after_checkpoint.raw_response.as_deref(), Some("{raw}"));
        assert_eq!(after_checkpoint.model.as_deref(), Some("model-a"));

        let fields = SummaryFields {
            summary_text: "Good week".to_string(),
            plus_points: vec!["discipline".to_string()],
            ..Default::default()
        };
        let ready = store
            .update_fields(record.id, &RecordPatch::ready(fields.clone()))
            .await
            .unwrap();
        assert_eq!(ready.status, SummaryStatus::Ready);
        assert_eq!(ready.fields(), fields);
        assert!(ready.generated_at.is_some());
        // checkpoint columns survive a patch that does not mention them
        assert_eq!(ready.raw_response.as_deref(), Some("{raw}"));
    }

    #[tokio::test]
    async fn test_retry_after_failure_clears_error_message() {
        let store = InMemorySummaryStore::new();
        let record = store.create(new_weekly()).await.unwrap();

        store
            .update_fields(record.id, &RecordPatch::checkpoint("{raw}", "model-a"))
            .await
            .unwrap();
        let failed = store
            .update_fields(record.id, &RecordPatch::failed("Store error: down"))
            .await
            .unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("Store error: down"));

        store
            .update_fields(record.id, &RecordPatch::checkpoint("{raw}", "model-a"))
            .await
            .unwrap();
        let ready = store
            .update_fields(record.id, &RecordPatch::ready(SummaryFields::default()))
            .await
            .unwrap();
        assert_eq!(ready.status, SummaryStatus::Ready);
        assert!(ready.error_message.is_none());
    }

    #[tokio::test]
    async fn test_ready_record_is_not_reopened() {
        let store = InMemorySummaryStore::new();
        let record = store.create(new_weekly()).await.unwrap();
        store
            .update_fields(record.id, &RecordPatch::ready(SummaryFields::default()))
            .await
            .unwrap();

        let after = store
            .update_fields(record.id, &RecordPatch::checkpoint("second", "model-a"))
            .await
            .unwrap();
        assert_eq!(after.status, SummaryStatus::Ready);
    }
}
