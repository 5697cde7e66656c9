//! PostgreSQL-backed store.
//!
//! Expects the `model_version` and `feedback` tables to exist, with
//! `UNIQUE (org_id, version)` and a partial unique index on `org_id`
//! `WHERE status = 'COLLECTING_FEEDBACK'`. Those two indexes are what make
//! concurrent `open_version` calls and successor inserts safe.

use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{stale, FeedbackStore, StoreError, StoreResult, VersionStore};
use crate::domain::{AdapterConfig, Feedback, FeedbackTag, ModelVersion, VersionStatus};

const VERSION_COLUMNS: &str = "id, org_id, version, parent_model_version_id, status, feedback_ids, \
     adapter_config, json_url, row_count, adapter_url, sha256, training_job_id, dispatched_at, revision, created_at";

const FEEDBACK_COLUMNS: &str =
    "id, org_id, model_version_id, prompt, model_response, corrected_response, rating, tags, created_at";

#[derive(Debug, sqlx::FromRow)]
struct VersionRow {
    id: Uuid,
    org_id: Uuid,
    version: i32,
    parent_model_version_id: Option<Uuid>,
    status: String,
    feedback_ids: Vec<Uuid>,
    adapter_config: Option<serde_json::Value>,
    json_url: Option<String>,
    row_count: Option<i32>,
    adapter_url: Option<String>,
    sha256: Option<String>,
    training_job_id: Option<String>,
    dispatched_at: Option<DateTime<Utc>>,
    revision: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<VersionRow> for ModelVersion {
    type Error = StoreError;

    fn try_from(row: VersionRow) -> Result<Self, Self::Error> {
        let status: VersionStatus = row
            .status
            .parse()
            .map_err(|e: crate::domain::InvalidInput| StoreError::Corrupt(e.0))?;
        let adapter_config = row
            .adapter_config
            .map(serde_json::from_value::<AdapterConfig>)
            .transpose()
            .map_err(|e| StoreError::Corrupt(format!("adapter_config of {}: {}", row.id, e)))?;

        Ok(ModelVersion {
            id: row.id,
            org_id: row.org_id,
            version: row.version,
            parent_model_version_id: row.parent_model_version_id,
            status,
            feedback_ids: row.feedback_ids,
            adapter_config,
            json_url: row.json_url,
            row_count: row.row_count,
            adapter_url: row.adapter_url,
            sha256: row.sha256,
            training_job_id: row.training_job_id,
            dispatched_at: row.dispatched_at,
            revision: row.revision,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct FeedbackRow {
    id: Uuid,
    org_id: Uuid,
    model_version_id: Uuid,
    prompt: String,
    model_response: String,
    corrected_response: Option<String>,
    rating: i16,
    tags: Option<Vec<String>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<FeedbackRow> for Feedback {
    type Error = StoreError;

    fn try_from(row: FeedbackRow) -> Result<Self, Self::Error> {
        let tags = row
            .tags
            .unwrap_or_default()
            .iter()
            .map(|t| t.parse::<FeedbackTag>())
            .collect::<Result<BTreeSet<_>, _>>()
            .map_err(|e| StoreError::Corrupt(format!("tags of feedback {}: {}", row.id, e)))?;

        Ok(Feedback {
            id: row.id,
            org_id: row.org_id,
            model_version_id: row.model_version_id,
            prompt: row.prompt,
            model_response: row.model_response,
            corrected_response: row.corrected_response,
            rating: row.rating,
            tags,
            created_at: row.created_at,
        })
    }
}

fn db_error(context: &str, err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::Conflict(format!("{}: {}", context, db.message()));
        }
    }
    error!("{}: {}", context, err);
    StoreError::Database(format!("{}: {}", context, err))
}

fn adapter_config_json(version: &ModelVersion) -> StoreResult<Option<serde_json::Value>> {
    version
        .adapter_config
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| StoreError::Corrupt(format!("adapter_config of {}: {}", version.id, e)))
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        info!("Connecting to lifecycle database");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to connect to database: {}", e)))?;

        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Health check failed", e))?;
        Ok(())
    }

    async fn fetch_versions(&self, sql: &str, org_id: Uuid) -> StoreResult<Vec<ModelVersion>> {
        let rows = sqlx::query_as::<_, VersionRow>(sql)
            .bind(org_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to load model versions", e))?;
        rows.into_iter().map(ModelVersion::try_from).collect()
    }

    async fn insert_version_in(tx: &mut Transaction<'_, Postgres>, version: &ModelVersion) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO model_version (
                id, org_id, version, parent_model_version_id, status, feedback_ids,
                adapter_config, json_url, row_count, adapter_url, sha256,
                training_job_id, dispatched_at, revision, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(version.id)
        .bind(version.org_id)
        .bind(version.version)
        .bind(version.parent_model_version_id)
        .bind(version.status.as_str())
        .bind(&version.feedback_ids)
        .bind(adapter_config_json(version)?)
        .bind(&version.json_url)
        .bind(version.row_count)
        .bind(&version.adapter_url)
        .bind(&version.sha256)
        .bind(&version.training_job_id)
        .bind(version.dispatched_at)
        .bind(version.revision)
        .bind(version.created_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| db_error("Failed to insert model version", e))?;
        Ok(())
    }

    async fn swap_in(
        tx: &mut Transaction<'_, Postgres>,
        current: &ModelVersion,
        next: &ModelVersion,
    ) -> StoreResult<ModelVersion> {
        if current.id != next.id {
            return Err(StoreError::Conflict("cannot swap different model versions".to_string()));
        }

        let sql = format!(
            r#"
            UPDATE model_version
            SET status = $1, feedback_ids = $2, adapter_config = $3, json_url = $4,
                row_count = $5, adapter_url = $6, sha256 = $7, training_job_id = $8,
                dispatched_at = $9, revision = revision + 1
            WHERE id = $10 AND status = $11 AND revision = $12
            RETURNING {}
            "#,
            VERSION_COLUMNS
        );

        let row = sqlx::query_as::<_, VersionRow>(&sql)
            .bind(next.status.as_str())
            .bind(&next.feedback_ids)
            .bind(adapter_config_json(next)?)
            .bind(&next.json_url)
            .bind(next.row_count)
            .bind(&next.adapter_url)
            .bind(&next.sha256)
            .bind(&next.training_job_id)
            .bind(next.dispatched_at)
            .bind(current.id)
            .bind(current.status.as_str())
            .bind(current.revision)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| db_error("Failed to update model version", e))?;

        match row {
            Some(row) => ModelVersion::try_from(row),
            None => Err(stale(current)),
        }
    }

    async fn begin(&self) -> StoreResult<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to open transaction", e))
    }
}

#[async_trait]
impl FeedbackStore for PgStore {
    async fn insert_feedback(&self, feedback: &Feedback) -> StoreResult<()> {
        debug!("Storing feedback {} for version {}", feedback.id, feedback.model_version_id);

        let tags: Vec<String> = feedback.tags.iter().map(|t| t.as_str().to_string()).collect();
        sqlx::query(
            r#"
            INSERT INTO feedback (
                id, org_id, model_version_id, prompt, model_response,
                corrected_response, rating, tags, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(feedback.id)
        .bind(feedback.org_id)
        .bind(feedback.model_version_id)
        .bind(&feedback.prompt)
        .bind(&feedback.model_response)
        .bind(&feedback.corrected_response)
        .bind(feedback.rating)
        .bind(tags)
        .bind(feedback.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to store feedback", e))?;
        Ok(())
    }

    async fn get_feedback(&self, id: Uuid) -> StoreResult<Option<Feedback>> {
        let sql = format!("SELECT {} FROM feedback WHERE id = $1", FEEDBACK_COLUMNS);
        let row = sqlx::query_as::<_, FeedbackRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to load feedback", e))?;
        row.map(Feedback::try_from).transpose()
    }

    async fn feedback_by_ids(&self, org_id: Uuid, ids: &[Uuid]) -> StoreResult<Vec<Feedback>> {
        // WITH ORDINALITY keeps the caller's ordering of `ids`
        let sql = format!(
            r#"
            SELECT {}
            FROM feedback f
            JOIN UNNEST($2::uuid[]) WITH ORDINALITY AS wanted(id, ord) ON wanted.id = f.id
            WHERE f.org_id = $1
            ORDER BY wanted.ord
            "#,
            FEEDBACK_COLUMNS
                .split(", ")
                .map(|c| format!("f.{}", c))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let rows = sqlx::query_as::<_, FeedbackRow>(&sql)
            .bind(org_id)
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to load feedback rows", e))?;
        rows.into_iter().map(Feedback::try_from).collect()
    }

    async fn feedback_for_version(&self, org_id: Uuid, version_id: Uuid) -> StoreResult<Vec<Feedback>> {
        let sql = format!(
            "SELECT {} FROM feedback WHERE org_id = $1 AND model_version_id = $2 ORDER BY created_at DESC",
            FEEDBACK_COLUMNS
        );
        let rows = sqlx::query_as::<_, FeedbackRow>(&sql)
            .bind(org_id)
            .bind(version_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to list feedback", e))?;
        rows.into_iter().map(Feedback::try_from).collect()
    }
}

#[async_trait]
impl VersionStore for PgStore {
    async fn insert_version(&self, version: &ModelVersion) -> StoreResult<()> {
        debug!("Inserting model version {} (v{}) for org {}", version.id, version.version, version.org_id);
        let mut tx = self.begin().await?;
        Self::insert_version_in(&mut tx, version).await?;
        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit model version", e))
    }

    async fn get_version(&self, id: Uuid) -> StoreResult<Option<ModelVersion>> {
        let sql = format!("SELECT {} FROM model_version WHERE id = $1", VERSION_COLUMNS);
        let row = sqlx::query_as::<_, VersionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to load model version", e))?;
        row.map(ModelVersion::try_from).transpose()
    }

    async fn open_version(&self, org_id: Uuid) -> StoreResult<Option<ModelVersion>> {
        let sql = format!(
            "SELECT {} FROM model_version WHERE org_id = $1 AND status = 'COLLECTING_FEEDBACK'",
            VERSION_COLUMNS
        );
        Ok(self.fetch_versions(&sql, org_id).await?.into_iter().next())
    }

    async fn version_by_number(&self, org_id: Uuid, version: i32) -> StoreResult<Option<ModelVersion>> {
        let sql = format!(
            "SELECT {} FROM model_version WHERE org_id = $1 AND version = $2",
            VERSION_COLUMNS
        );
        let row = sqlx::query_as::<_, VersionRow>(&sql)
            .bind(org_id)
            .bind(version)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to load model version", e))?;
        row.map(ModelVersion::try_from).transpose()
    }

    async fn latest_version(&self, org_id: Uuid) -> StoreResult<Option<ModelVersion>> {
        let sql = format!(
            "SELECT {} FROM model_version WHERE org_id = $1 ORDER BY version DESC LIMIT 1",
            VERSION_COLUMNS
        );
        Ok(self.fetch_versions(&sql, org_id).await?.into_iter().next())
    }

    async fn list_versions(&self, org_id: Uuid) -> StoreResult<Vec<ModelVersion>> {
        let sql = format!(
            "SELECT {} FROM model_version WHERE org_id = $1 ORDER BY version DESC",
            VERSION_COLUMNS
        );
        self.fetch_versions(&sql, org_id).await
    }

    async fn claimed_feedback_ids(&self, org_id: Uuid) -> StoreResult<HashSet<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT DISTINCT UNNEST(feedback_ids) FROM model_version WHERE org_id = $1",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to collect claimed feedback", e))?;
        Ok(ids.into_iter().collect())
    }

    async fn swap_version(&self, current: &ModelVersion, next: &ModelVersion) -> StoreResult<ModelVersion> {
        let mut tx = self.begin().await?;
        let stored = Self::swap_in(&mut tx, current, next).await?;
        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit model version update", e))?;
        Ok(stored)
    }

    async fn swap_version_and_open(
        &self,
        current: &ModelVersion,
        next: &ModelVersion,
        successor: &ModelVersion,
    ) -> StoreResult<ModelVersion> {
        let mut tx = self.begin().await?;
        let stored = Self::swap_in(&mut tx, current, next).await?;
        Self::insert_version_in(&mut tx, successor).await?;
        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit model version transition", e))?;
        info!(
            "Model version {} is {}, opened v{} ({})",
            stored.id, stored.status, successor.version, successor.id
        );
        Ok(stored)
    }
}
