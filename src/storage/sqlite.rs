use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::{Row, SqlitePool};

use crate::cache::like_pattern;
use crate::job::{JobId, JobRecord, JobStats, JobStatus, NewJob};

use super::{CacheStore, JobStore, Result};

pub struct SqliteStorage {
    pub pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn new(database_url: &str) -> std::result::Result<Self, sqlx::Error> {
        let pool = SqlitePool::connect(database_url).await?;
        let storage = Self { pool };
        storage.configure().await?;
        storage.migrate().await?;
        Ok(storage)
    }

    async fn configure(&self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await?;

        sqlx::query("PRAGMA busy_timeout=5000;")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Run database migrations
    async fn migrate(&self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 5,
                status TEXT NOT NULL DEFAULT 'pending',
                scheduled_at TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                error_message TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_claim
            ON jobs(status, priority DESC, created_at ASC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_type_status ON jobs(job_type, status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_cache_expires_at ON cache_entries(expires_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_job(&self, row: sqlx::sqlite::SqliteRow) -> Result<JobRecord> {
        let id: i64 = row.get("id");
        let job_type: String = row.get("job_type");
        let payload_str: String = row.get("payload");
        let priority: i64 = row.get("priority");
        let status_str: String = row.get("status");
        let scheduled_at_str: Option<String> = row.get("scheduled_at");
        let attempts: i64 = row.get("attempts");
        let max_attempts: i64 = row.get("max_attempts");
        let created_at_str: String = row.get("created_at");
        let started_at_str: Option<String> = row.get("started_at");
        let completed_at_str: Option<String> = row.get("completed_at");
        let error_message: Option<String> = row.get("error_message");

        let payload: Value = serde_json::from_str(&payload_str)?;

        let created_at = DateTime::parse_from_rfc3339(&created_at_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(JobRecord {
            id: JobId(id),
            job_type,
            payload,
            priority,
            status: JobStatus::from_db(&status_str),
            scheduled_at: parse_opt_ts(scheduled_at_str),
            attempts: attempts as u32,
            max_attempts: max_attempts as u32,
            created_at,
            started_at: parse_opt_ts(started_at_str),
            completed_at: parse_opt_ts(completed_at_str),
            error_message,
        })
    }
}

fn parse_opt_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[async_trait]
impl JobStore for SqliteStorage {
    async fn enqueue(&self, job: NewJob) -> Result<JobId> {
        let payload = serde_json::to_string(&job.payload)?;

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (job_type, payload, priority, status, scheduled_at, attempts, max_attempts, created_at)
            VALUES (?, ?, ?, 'pending', ?, 0, ?, ?)
            "#,
        )
        .bind(&job.job_type)
        .bind(payload)
        .bind(job.priority)
        .bind(job.scheduled_at.map(|dt| dt.to_rfc3339()))
        .bind(job.max_attempts as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(JobId(result.last_insert_rowid()))
    }

    async fn claim_next(&self) -> Result<Option<JobRecord>> {
        // Selection and the status flip happen in one statement so two
        // workers can never both claim the same row.
        let now = Utc::now().to_rfc3339();

        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'processing', started_at = ?1, attempts = attempts + 1
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'pending'
                  AND (scheduled_at IS NULL OR scheduled_at <= ?1)
                  AND attempts < max_attempts
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.row_to_job(row)?)),
            None => Ok(None),
        }
    }

    async fn complete(&self, id: JobId) -> Result<()> {
        // Guarded on status so completing an already-terminal job is a
        // no-op rather than an error.
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', completed_at = ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fail(&self, id: JobId, error_message: &str) -> Result<Option<JobStatus>> {
        // The attempts check and the state flip are one statement, so a
        // concurrent update cannot slip between the read and the write.
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'pending' END,
                completed_at = CASE WHEN attempts >= max_attempts THEN ?2 ELSE completed_at END,
                error_message = ?3
            WHERE id = ?1 AND status = 'processing'
            RETURNING status
            "#,
        )
        .bind(id.0)
        .bind(Utc::now().to_rfc3339())
        .bind(error_message)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| JobStatus::from_db(r.get("status"))))
    }

    async fn retry(&self, id: JobId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', attempts = 0, error_message = NULL
            WHERE id = ? AND status = 'failed'
            "#,
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.row_to_job(row)?)),
            None => Ok(None),
        }
    }

    async fn stats(&self) -> Result<JobStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            match JobStatus::from_db(&status) {
                JobStatus::Pending => stats.pending = n as u64,
                JobStatus::Processing => stats.processing = n as u64,
                JobStatus::Completed => stats.completed = n as u64,
                JobStatus::Failed => stats.failed = n as u64,
            }
        }

        Ok(stats)
    }

    async fn sweep(&self, older_than_days: u32) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(older_than_days as i64);

        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('completed', 'failed')
              AND completed_at IS NOT NULL
              AND completed_at < ?
            "#,
        )
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn has_active(&self, job_type: &str) -> Result<bool> {
        let exists: i64 = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM jobs
                WHERE job_type = ? AND status IN ('pending', 'processing')
            )
            "#,
        )
        .bind(job_type)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists != 0)
    }
}

#[async_trait]
impl CacheStore for SqliteStorage {
    async fn get_entry(&self, key: &str) -> Result<Option<Value>> {
        // Expired rows are logically absent; physical deletion is the
        // sweep's job.
        let row = sqlx::query(
            r#"
            SELECT value FROM cache_entries
            WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(key)
        .bind(Utc::now().to_rfc3339())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let value_str: String = row.get("value");
                Ok(Some(serde_json::from_str(&value_str)?))
            }
            None => Ok(None),
        }
    }

    async fn put_entry(
        &self,
        key: &str,
        value: &Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let value_str = serde_json::to_string(value)?;

        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value_str)
        .bind(expires_at.map(|dt| dt.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_entry(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn clear_entries(&self, pattern: &str) -> Result<u64> {
        let result = match like_pattern(pattern) {
            None => {
                sqlx::query("DELETE FROM cache_entries")
                    .execute(&self.pool)
                    .await?
            }
            Some(like) => {
                sqlx::query(r#"DELETE FROM cache_entries WHERE key LIKE ? ESCAPE '\'"#)
                    .bind(like)
                    .execute(&self.pool)
                    .await?
            }
        };

        Ok(result.rows_affected())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM cache_entries
            WHERE expires_at IS NOT NULL AND expires_at <= ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
