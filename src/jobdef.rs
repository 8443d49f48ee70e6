use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};

use crate::job::{JobId, NewJob};
use crate::queue::QueueError;
use crate::storage::JobStore;

/// A typed handle for enqueueing jobs of one registered type.
///
/// Created by [`JobQueue::register`](crate::JobQueue::register); the
/// payload is serialized from `T`, so jobs enqueued through the handle
/// are valid by construction.
pub struct JobDefinition<T> {
    pub(crate) name: &'static str,
    pub(crate) max_attempts: u32,
    pub(crate) priority: i64,
    pub(crate) storage: Arc<dyn JobStore>,
    pub(crate) _phantom: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned + Send + 'static> JobDefinition<T> {
    /// Priority applied to jobs enqueued through this handle.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn enqueue(&self, args: T) -> Result<JobId, QueueError> {
        let payload = serde_json::to_value(&args)?;

        let job = NewJob::new(self.name, payload)
            .with_priority(self.priority)
            .with_max_attempts(self.max_attempts);

        Ok(self.storage.enqueue(job).await?)
    }

    /// Enqueue a job that becomes eligible for claiming only after
    /// `delay` has elapsed.
    pub async fn schedule(&self, args: T, delay: Duration) -> Result<JobId, QueueError> {
        let payload = serde_json::to_value(&args)?;
        let run_at = Utc::now()
            + chrono::Duration::from_std(delay)
                .map_err(|e| QueueError::InvalidDelay(e.to_string()))?;

        let job = NewJob::new(self.name, payload)
            .with_priority(self.priority)
            .with_max_attempts(self.max_attempts)
            .scheduled_at(run_at);

        Ok(self.storage.enqueue(job).await?)
    }
}
