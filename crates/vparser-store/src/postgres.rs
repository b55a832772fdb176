//! Postgres-backed job store.
//!
//! The `requests` table holds the canonical job record; `request_outbox`
//! holds the intent to publish, written in the same transaction as the
//! request row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::{debug, info};

use vparser_models::{FieldUpdate, JobPayload, NewVideoRequest, VideoRequest};

use crate::config::StoreConfig;
use crate::error::{map_insert_error, StoreError, StoreResult};
use crate::repo::{CreatedRequest, JobStore, OutboxEntry};

/// Ordered schema migrations, applied before serving traffic.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const REQUEST_COLUMNS: &str =
    "id, name, description, video_url, text_url, archived, processed, created_at, updated_at";

const OUTBOX_COLUMNS: &str =
    "id, request_id, payload, attempts, last_error, created_at, last_attempt_at, published_at";

// `now()` is frozen per transaction; this guarantees every write moves the
// timestamp forward even when two writes land in the same microsecond.
const NEXT_UPDATED_AT: &str = "GREATEST(clock_timestamp(), updated_at + interval '1 microsecond')";

#[derive(Debug, FromRow)]
struct RequestRow {
    id: i64,
    name: String,
    description: String,
    video_url: String,
    text_url: String,
    archived: bool,
    processed: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RequestRow> for VideoRequest {
    fn from(row: RequestRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            description: row.description,
            video_url: row.video_url,
            text_url: row.text_url,
            archived: row.archived,
            processed: row.processed,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct OutboxRow {
    id: i64,
    request_id: i64,
    payload: Json<JobPayload>,
    attempts: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    last_attempt_at: Option<DateTime<Utc>>,
    published_at: Option<DateTime<Utc>>,
}

impl From<OutboxRow> for OutboxEntry {
    fn from(row: OutboxRow) -> Self {
        Self {
            id: row.id,
            request_id: row.request_id,
            payload: row.payload.0,
            attempts: row.attempts,
            last_error: row.last_error,
            created_at: row.created_at,
            last_attempt_at: row.last_attempt_at,
            published_at: row.published_at,
        }
    }
}

/// Job store over a shared `PgPool`.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect using the given configuration.
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(|e| StoreError::connection_failed(e.to_string()))?;

        info!(max_connections = config.max_connections, "Connected to Postgres");
        Ok(Self { pool })
    }

    /// Create from environment variables.
    pub async fn from_env() -> StoreResult<Self> {
        Self::connect(&StoreConfig::from_env()).await
    }

    /// Apply pending migrations. Must complete before serving traffic.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        MIGRATOR.run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }

    /// Close the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn exists(&self, name: &str) -> StoreResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM requests WHERE name = $1 AND NOT archived)",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn load(&self, name: &str) -> StoreResult<Option<VideoRequest>> {
        let sql = format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE name = $1 AND NOT archived");
        let row = sqlx::query_as::<_, RequestRow>(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(VideoRequest::from))
    }

    async fn list_active(&self) -> StoreResult<Vec<VideoRequest>> {
        let sql = format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE NOT archived ORDER BY id");
        let rows = sqlx::query_as::<_, RequestRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(VideoRequest::from).collect())
    }

    async fn create_with_outbox(&self, request: &NewVideoRequest) -> StoreResult<CreatedRequest> {
        let mut tx = self.pool.begin().await?;

        let insert_request = format!(
            "INSERT INTO requests (name, description, processed, video_url, text_url) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {REQUEST_COLUMNS}"
        );
        let row = sqlx::query_as::<_, RequestRow>(&insert_request)
            .bind(&request.name)
            .bind(&request.description)
            .bind(request.processed)
            .bind(&request.video_url)
            .bind(&request.text_url)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_insert_error(e, &request.name))?;
        let row = VideoRequest::from(row);
        let payload = JobPayload::from(&row);

        let outbox_id: i64 = sqlx::query_scalar(
            "INSERT INTO request_outbox (request_id, payload) VALUES ($1, $2) RETURNING id",
        )
        .bind(row.id)
        .bind(Json(&payload))
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        counter!("vparser_store_requests_created_total").increment(1);
        debug!(request_id = row.id, outbox_id, name = %row.name, "Inserted request with outbox entry");

        Ok(CreatedRequest {
            request: row,
            outbox_id,
            payload,
        })
    }

    async fn apply_update(&self, id: i64, update: &FieldUpdate) -> StoreResult<()> {
        let sql = format!(
            "UPDATE requests SET {} = $1, updated_at = {NEXT_UPDATED_AT} WHERE id = $2",
            update.column()
        );
        let query = sqlx::query(&sql);
        let query = match update {
            FieldUpdate::Description(v) => query.bind(v.as_str()),
            FieldUpdate::Processed(v) => query.bind(*v),
            FieldUpdate::TextUrl(v) => query.bind(v.as_str()),
        };

        let result = query.bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("request id {id}")));
        }
        Ok(())
    }

    async fn archive(&self, name: &str) -> StoreResult<bool> {
        let sql = format!(
            "UPDATE requests SET archived = TRUE, updated_at = {NEXT_UPDATED_AT} \
             WHERE name = $1 AND NOT archived"
        );
        let result = sqlx::query(&sql).bind(name).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn claim_pending_outbox(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<OutboxEntry>> {
        // SKIP LOCKED lets several API replicas relay concurrently without
        // claiming the same entry in the same round.
        let sql = format!(
            "UPDATE request_outbox SET last_attempt_at = now() \
             WHERE id IN ( \
                 SELECT id FROM request_outbox \
                 WHERE published_at IS NULL \
                   AND created_at < $1 \
                   AND (last_attempt_at IS NULL OR last_attempt_at < $1) \
                 ORDER BY id \
                 LIMIT $2 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {OUTBOX_COLUMNS}"
        );
        let mut rows = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(older_than)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.sort_by_key(|r| r.id);
        Ok(rows.into_iter().map(OutboxEntry::from).collect())
    }

    async fn mark_published(&self, outbox_id: i64) -> StoreResult<()> {
        sqlx::query(
            "UPDATE request_outbox SET published_at = now(), last_error = NULL \
             WHERE id = $1 AND published_at IS NULL",
        )
        .bind(outbox_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_publish_failure(&self, outbox_id: i64, error: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE request_outbox \
             SET attempts = attempts + 1, last_error = $2, last_attempt_at = now() \
             WHERE id = $1",
        )
        .bind(outbox_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unpublished_count(&self) -> StoreResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT count(*) FROM request_outbox WHERE published_at IS NULL")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
