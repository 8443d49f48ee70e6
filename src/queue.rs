use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::{CacheClient, VolatileConfig};
use crate::jobdef::JobDefinition;
use crate::job::{JobId, JobRecord, JobStats, JobStatus, NewJob};
use crate::maintenance::{Maintenance, MaintenanceConfig, CACHE_SWEEP_JOB_TYPE};
use crate::registry::HandlerRegistry;
use crate::storage::{JobStore, SqliteStorage, StorageError};
use crate::worker::Worker;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job type must not be empty")]
    EmptyJobType,

    #[error("invalid payload for job type {job_type}: {reason}")]
    InvalidPayload { job_type: String, reason: String },

    #[error("invalid delay: {0}")]
    InvalidDelay(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coordinates the job store, handler registry, workers, and the
/// maintenance loop behind one handle.
pub struct JobQueue {
    storage: Arc<SqliteStorage>,
    handlers: Arc<HandlerRegistry>,
    shutdown: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
    maintenance_handle: Option<JoinHandle<()>>,
    poll_interval: Duration,
}

impl JobQueue {
    /// Open (and migrate) the backing database. Workers are not started
    /// until [`start`](Self::start); register handlers first.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        let storage = SqliteStorage::new(connection_string)
            .await
            .map_err(StorageError::Database)?;

        Ok(Self {
            storage: Arc::new(storage),
            handlers: Arc::new(HandlerRegistry::new()),
            shutdown: CancellationToken::new(),
            worker_handles: Vec::new(),
            maintenance_handle: None,
            poll_interval: Duration::from_millis(500),
        })
    }

    /// Idle interval workers sleep for when the queue is empty.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Build a cache client backed by the same durable store. Pass
    /// `None` to run durable-only.
    pub fn cache(&self, volatile: Option<VolatileConfig>) -> CacheClient {
        CacheClient::new(
            Arc::clone(&self.storage) as Arc<dyn crate::storage::CacheStore>,
            volatile,
        )
    }

    /// Register a typed handler and get back a typed enqueue handle.
    pub fn register<T, F, Fut>(
        &self,
        name: &'static str,
        handler: F,
        max_attempts: u32,
    ) -> JobDefinition<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.handlers.register(name, handler);

        JobDefinition {
            name,
            max_attempts,
            priority: crate::job::DEFAULT_PRIORITY,
            storage: Arc::clone(&self.storage) as Arc<dyn JobStore>,
            _phantom: PhantomData,
        }
    }

    /// Register the cache-sweep handler under the dedicated job type,
    /// linking the queue to the cache. The maintenance loop enqueues
    /// sweep jobs once this is registered.
    pub fn register_cache_sweep(&self, cache: CacheClient) {
        self.handlers
            .register(CACHE_SWEEP_JOB_TYPE, move |_: SweepArgs| {
                let cache = cache.clone();
                async move {
                    let removed = cache.expire_sweep().await.map_err(|e| e.to_string())?;
                    info!(removed, "cache sweep finished");
                    Ok(())
                }
            });
    }

    /// Enqueue a raw job request.
    ///
    /// The job type must be non-empty, and if a payload schema is
    /// registered for it locally the payload is validated now rather
    /// than failing later inside the handler.
    pub async fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError> {
        if job.job_type.is_empty() {
            return Err(QueueError::EmptyJobType);
        }

        self.handlers
            .validate(&job.job_type, &job.payload)
            .map_err(|reason| QueueError::InvalidPayload {
                job_type: job.job_type.clone(),
                reason,
            })?;

        Ok(self.storage.enqueue(job).await?)
    }

    /// Start `worker_count` workers against the store.
    pub fn start(&mut self, worker_count: usize) {
        for _ in 0..worker_count {
            self.spawn_worker();
        }
    }

    fn spawn_worker(&mut self) {
        let worker = Worker::new(
            Arc::clone(&self.storage) as Arc<dyn JobStore>,
            Arc::clone(&self.handlers),
        )
        .with_poll_interval(self.poll_interval);

        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            worker.run(shutdown).await;
        });

        self.worker_handles.push(handle);
    }

    /// Start the periodic maintenance loop (old-job sweep + cache-sweep
    /// job enqueueing).
    pub fn start_maintenance(&mut self, config: MaintenanceConfig) {
        if self.maintenance_handle.is_some() {
            return;
        }

        let maintenance = Maintenance::new(
            Arc::clone(&self.storage) as Arc<dyn JobStore>,
            Arc::clone(&self.handlers),
            config,
        );
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            maintenance.run(shutdown).await;
        });

        self.maintenance_handle = Some(handle);
        info!("maintenance started");
    }

    pub async fn claim_next(&self) -> Result<Option<JobRecord>, StorageError> {
        self.storage.claim_next().await
    }

    pub async fn complete(&self, id: JobId) -> Result<(), StorageError> {
        self.storage.complete(id).await
    }

    pub async fn fail(&self, id: JobId, error_message: &str) -> Result<Option<JobStatus>, StorageError> {
        self.storage.fail(id, error_message).await
    }

    pub async fn retry(&self, id: JobId) -> Result<bool, StorageError> {
        self.storage.retry(id).await
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, StorageError> {
        self.storage.get_job(id).await
    }

    pub async fn stats(&self) -> Result<JobStats, StorageError> {
        self.storage.stats().await
    }

    pub async fn sweep(&self, older_than_days: u32) -> Result<u64, StorageError> {
        self.storage.sweep(older_than_days).await
    }

    /// Signal shutdown and wait for workers and maintenance to drain.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();

        for handle in self.worker_handles.drain(..) {
            let _ = handle.await;
        }

        if let Some(handle) = self.maintenance_handle.take() {
            let _ = handle.await;
        }

        info!("shutdown complete");
    }

    /// Block until Ctrl+C, then shut down.
    pub async fn wait_for_shutdown(&mut self) {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");

        info!("shutting down...");
        self.shutdown().await;
    }
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
struct SweepArgs {}
