use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, warn};

use crate::config::PersistenceConfig;
use crate::job::{BundleId, JobId, JobRecord, JobStatus, PROGRESS_ACTIVE_CEILING};
use crate::queue::{BackendKind, QueueBackend, QueueSnapshot, STALE_JOB_ERROR};

const SCHEMA: &str = include_str!("../../migrations/001_jobs.sql");

const RECORD_COLUMNS: &str = "id, job_type, payload, status, progress, attempts, max_attempts, \
     backoff_base_ms, result, error, bundle_id, created_at, started_at, completed_at, available_at";

/// PostgreSQL-backed implementation of the queue backend.
///
/// Claims use `FOR UPDATE SKIP LOCKED`, so any number of worker processes can
/// share one table without handing the same job out twice.
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    /// Wrap an existing pool. The schema is assumed to exist.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool from config, verify the server answers, and apply the schema.
    pub async fn connect(config: &PersistenceConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.connection_string)
            .await?;

        sqlx::query("SELECT 1").execute(&pool).await?;

        let backend = Self::new(pool);
        backend.ensure_schema().await?;
        Ok(backend)
    }

    /// Create the jobs table and indexes if they are missing.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_record(row: &PgRow) -> anyhow::Result<JobRecord> {
        let status: String = row.try_get("status")?;
        let progress: i16 = row.try_get("progress")?;
        let attempts: i32 = row.try_get("attempts")?;
        let max_attempts: i32 = row.try_get("max_attempts")?;
        let backoff_base_ms: Option<i64> = row.try_get("backoff_base_ms")?;
        let bundle_id: Option<String> = row.try_get("bundle_id")?;

        Ok(JobRecord {
            id: JobId(row.try_get("id")?),
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            status: status.parse()?,
            progress: progress.clamp(0, 100) as u8,
            attempts: attempts.max(0) as u32,
            max_attempts: max_attempts.max(1) as u32,
            backoff_base_ms: backoff_base_ms.map(|ms| ms.max(0) as u64),
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            available_at: row.try_get("available_at")?,
            bundle_id: bundle_id.map(BundleId::from),
        })
    }

    fn rows_to_records(rows: &[PgRow]) -> anyhow::Result<Vec<JobRecord>> {
        rows.iter().map(Self::row_to_record).collect()
    }

    fn log_ignored(op: &str, id: JobId) {
        warn!(job_id = %id, "ignoring {op} for job that is not active");
    }
}

#[async_trait]
impl QueueBackend for PostgresBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Durable
    }

    async fn insert(&self, record: JobRecord) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO penstock_jobs (
                id, job_type, payload, status, progress, attempts, max_attempts,
                backoff_base_ms, result, error, bundle_id,
                created_at, started_at, completed_at, available_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL, NULL, $9, $10, NULL, NULL, $11, NOW())
            "#,
        )
        .bind(record.id.0)
        .bind(&record.job_type)
        .bind(&record.payload)
        .bind(record.status.as_str())
        .bind(record.progress as i16)
        .bind(record.attempts as i32)
        .bind(record.max_attempts.min(i32::MAX as u32) as i32)
        .bind(record.backoff_base_ms.map(|ms| ms.min(i64::MAX as u64) as i64))
        .bind(record.bundle_id.as_ref().map(BundleId::as_str))
        .bind(record.created_at)
        .bind(record.available_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: JobId) -> anyhow::Result<Option<JobRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM penstock_jobs WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn list_by_status(&self, statuses: &[JobStatus]) -> anyhow::Result<Vec<JobRecord>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let names: Vec<&str> = statuses.iter().map(JobStatus::as_str).collect();

        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM penstock_jobs
            WHERE status = ANY($1)
            ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(&names)
        .fetch_all(&self.pool)
        .await?;

        Self::rows_to_records(&rows)
    }

    async fn list_by_bundle(&self, bundle_id: &BundleId) -> anyhow::Result<Vec<JobRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM penstock_jobs
            WHERE bundle_id = $1
            ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(bundle_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Self::rows_to_records(&rows)
    }

    async fn claim(&self, limit: usize, now: DateTime<Utc>) -> anyhow::Result<Vec<JobRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(&format!(
            r#"
            WITH next AS (
                SELECT id
                FROM penstock_jobs
                WHERE status = 'waiting'
                  AND available_at <= $2
                ORDER BY created_at ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $1
            )
            UPDATE penstock_jobs j
            SET status = 'active',
                attempts = j.attempts + 1,
                started_at = $2,
                progress = 0,
                updated_at = NOW()
            FROM next
            WHERE j.id = next.id
            RETURNING {}
            "#,
            qualified_columns("j")
        ))
        .bind(limit.min(i64::MAX as usize) as i64)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        // RETURNING does not preserve the CTE's order.
        let mut claimed = Self::rows_to_records(&rows)?;
        claimed.sort_by_key(|r| (r.created_at, r.id));

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed jobs from durable backend");
        }
        Ok(claimed)
    }

    async fn update_progress(&self, id: JobId, progress: u8) -> anyhow::Result<Option<JobRecord>> {
        let clamped = progress.min(PROGRESS_ACTIVE_CEILING) as i16;

        let row = sqlx::query(&format!(
            r#"
            UPDATE penstock_jobs
            SET progress = $2,
                updated_at = NOW()
            WHERE id = $1
              AND status = 'active'
              AND progress < $2
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(id.0)
        .bind(clamped)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn complete(&self, id: JobId, result: Value) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE penstock_jobs
            SET status = 'completed',
                progress = 100,
                result = $2,
                error = NULL,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND status = 'active'
            "#,
        )
        .bind(id.0)
        .bind(&result)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() > 0 {
            debug!("completed job {}", id);
            Ok(true)
        } else {
            Self::log_ignored("complete", id);
            Ok(false)
        }
    }

    async fn retry(
        &self,
        id: JobId,
        error: String,
        available_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE penstock_jobs
            SET status = 'waiting',
                progress = 0,
                error = $2,
                available_at = $3,
                updated_at = NOW()
            WHERE id = $1
              AND status = 'active'
            "#,
        )
        .bind(id.0)
        .bind(&error)
        .bind(available_at)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() > 0 {
            Ok(true)
        } else {
            Self::log_ignored("retry", id);
            Ok(false)
        }
    }

    async fn fail(&self, id: JobId, error: String) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE penstock_jobs
            SET status = 'failed',
                error = $2,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND status = 'active'
            "#,
        )
        .bind(id.0)
        .bind(&error)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() > 0 {
            Ok(true)
        } else {
            Self::log_ignored("fail", id);
            Ok(false)
        }
    }

    async fn reap(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            DELETE FROM penstock_jobs
            WHERE status IN ('completed', 'failed')
              AND completed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn requeue_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<JobRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            WITH stale AS (
                SELECT id
                FROM penstock_jobs
                WHERE status = 'active'
                  AND started_at < $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE penstock_jobs j
            SET status = CASE WHEN j.attempts >= j.max_attempts THEN 'failed' ELSE 'waiting' END,
                progress = CASE WHEN j.attempts >= j.max_attempts THEN j.progress ELSE 0 END,
                available_at = CASE WHEN j.attempts >= j.max_attempts THEN j.available_at ELSE $2 END,
                completed_at = CASE WHEN j.attempts >= j.max_attempts THEN $2 ELSE NULL END,
                error = $3,
                updated_at = NOW()
            FROM stale
            WHERE j.id = stale.id
            RETURNING {}
            "#,
            qualified_columns("j")
        ))
        .bind(cutoff)
        .bind(now)
        .bind(STALE_JOB_ERROR)
        .fetch_all(&self.pool)
        .await?;

        let recovered = Self::rows_to_records(&rows)?;
        for record in &recovered {
            warn!(job_id = %record.id, status = %record.status, "recovered stale job");
        }
        Ok(recovered)
    }

    async fn snapshot(&self) -> anyhow::Result<QueueSnapshot> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*)::bigint AS count
            FROM penstock_jobs
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut snapshot = QueueSnapshot::new(Utc::now(), BackendKind::Durable);
        for status in JobStatus::ALL {
            snapshot.record(status, 0);
        }
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            snapshot.record(status.parse()?, count.max(0) as usize);
        }
        Ok(snapshot)
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

fn qualified_columns(alias: &str) -> String {
    RECORD_COLUMNS
        .split(',')
        .map(|col| format!("{alias}.{}", col.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}
