pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::job::{JobId, JobRecord, JobStats, JobStatus, NewJob};

pub use sqlite::SqliteStorage;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// CRUD and atomic-claim operations over job records.
///
/// The store is the sole arbiter of concurrent mutation: `claim_next`
/// and `fail` are single atomic statements so two workers can never
/// both win the same row, and an attempts check can never race a
/// concurrent update.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a `pending` job and return its store-assigned id.
    async fn enqueue(&self, job: NewJob) -> Result<JobId>;

    /// Atomically claim the next eligible job: `pending`, due, with
    /// attempts remaining, ordered by priority descending then
    /// creation time ascending. The claimed job comes back as
    /// `processing` with `started_at` stamped and `attempts`
    /// incremented. `None` means nothing is eligible, which is not an
    /// error.
    async fn claim_next(&self) -> Result<Option<JobRecord>>;

    /// `processing` -> `completed`, stamping `completed_at`. A no-op on
    /// jobs that are no longer `processing`.
    async fn complete(&self, id: JobId) -> Result<()>;

    /// Record a failure. Re-queues the job as `pending` while attempts
    /// remain, otherwise marks it terminally `failed`. Returns the
    /// resulting status, or `None` if the job was not `processing`.
    async fn fail(&self, id: JobId, error_message: &str) -> Result<Option<JobStatus>>;

    /// Manually reset a `failed` job: attempts back to zero, error
    /// cleared, status `pending`. Returns false if the job was not
    /// `failed`.
    async fn retry(&self, id: JobId) -> Result<bool>;

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>>;

    /// Count of jobs per status, absent statuses defaulting to zero.
    async fn stats(&self) -> Result<JobStats>;

    /// Delete `completed`/`failed` jobs whose `completed_at` precedes
    /// the cutoff. `pending`/`processing` rows are never touched.
    /// Returns the number of rows removed.
    async fn sweep(&self, older_than_days: u32) -> Result<u64>;

    /// Whether any `pending` or `processing` job of the given type
    /// exists. Used by maintenance to avoid enqueueing duplicate sweep
    /// jobs.
    async fn has_active(&self, job_type: &str) -> Result<bool>;
}

/// The durable (authoritative) tier of the cache.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch a live entry. Rows past their `expires_at` are treated as
    /// absent even though physical deletion is deferred to
    /// `purge_expired`.
    async fn get_entry(&self, key: &str) -> Result<Option<Value>>;

    /// Insert or overwrite an entry.
    async fn put_entry(
        &self,
        key: &str,
        value: &Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn delete_entry(&self, key: &str) -> Result<()>;

    /// Remove entries whose key matches the pattern (see
    /// [`key_matches`](crate::key_matches)). Returns the deletion count.
    async fn clear_entries(&self, pattern: &str) -> Result<u64>;

    /// Physically delete expired entries. Returns the deletion count.
    async fn purge_expired(&self) -> Result<u64>;
}
