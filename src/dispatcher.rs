use std::sync::Arc;

use tracing::{info, warn};

use crate::job::{JobRecord, JobStatus};
use crate::registry::HandlerRegistry;
use crate::storage::{JobStore, Result};

/// How a dispatched job was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler succeeded; job is `completed`.
    Completed,
    /// Handler failed with attempts remaining; job is `pending` again.
    Requeued,
    /// Handler failed and attempts are exhausted; job is terminally `failed`.
    Failed,
}

/// Maps a claimed job's type to its registered handler and converts the
/// handler outcome into a completion or failure on the store.
///
/// An unknown job type fails the job through the same path as any other
/// failure, consuming an attempt.
pub struct Dispatcher {
    storage: Arc<dyn JobStore>,
    handlers: Arc<HandlerRegistry>,
}

impl Dispatcher {
    pub fn new(storage: Arc<dyn JobStore>, handlers: Arc<HandlerRegistry>) -> Self {
        Self { storage, handlers }
    }

    /// Execute `job` and resolve it on the store.
    pub async fn dispatch(&self, job: &JobRecord) -> Result<DispatchOutcome> {
        match self.handlers.execute(job).await {
            Ok(()) => {
                info!(job_id = %job.id, job_type = %job.job_type, "job succeeded");
                self.storage.complete(job.id).await?;
                Ok(DispatchOutcome::Completed)
            }
            Err(e) => {
                warn!(job_id = %job.id, job_type = %job.job_type, error = %e, "job failed");

                match self.storage.fail(job.id, &e.to_string()).await? {
                    Some(JobStatus::Pending) => {
                        info!(
                            job_id = %job.id,
                            attempts = job.attempts,
                            max_attempts = job.max_attempts,
                            "job re-queued for retry"
                        );
                        Ok(DispatchOutcome::Requeued)
                    }
                    Some(_) => {
                        warn!(job_id = %job.id, "job failed permanently");
                        Ok(DispatchOutcome::Failed)
                    }
                    None => {
                        // Someone else already moved the job out of
                        // `processing`; nothing left to record.
                        warn!(job_id = %job.id, "job no longer processing, failure not recorded");
                        Ok(DispatchOutcome::Failed)
                    }
                }
            }
        }
    }
}
