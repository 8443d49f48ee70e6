use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::dispatcher::Dispatcher;
use crate::registry::HandlerRegistry;
use crate::storage::JobStore;

/// A runner that repeatedly claims and processes jobs.
///
/// Any number of workers may run against the same store; the atomic
/// claim in [`JobStore::claim_next`] is the only cross-worker
/// synchronization. On a miss the worker idles for `poll_interval`
/// instead of busy-spinning.
pub struct Worker {
    storage: Arc<dyn JobStore>,
    dispatcher: Dispatcher,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(storage: Arc<dyn JobStore>, handlers: Arc<HandlerRegistry>) -> Self {
        let dispatcher = Dispatcher::new(Arc::clone(&storage), handlers);
        Self {
            storage,
            dispatcher,
            poll_interval: Duration::from_millis(500),
        }
    }

    /// Set the idle interval between polls when the queue is empty.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run the worker until shutdown is signaled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("worker started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("worker shutting down");
                    break;
                }
                _ = self.poll_and_process() => {}
            }
        }
    }

    /// Claim the next job and process it, or idle if none is eligible.
    async fn poll_and_process(&self) {
        match self.storage.claim_next().await {
            Ok(Some(job)) => {
                debug!(job_id = %job.id, job_type = %job.job_type, attempts = job.attempts, "processing job");

                if let Err(e) = self.dispatcher.dispatch(&job).await {
                    error!(job_id = %job.id, error = %e, "failed to resolve job outcome");
                }
            }
            Ok(None) => {
                tokio::time::sleep(self.poll_interval).await;
            }
            Err(e) => {
                // A store hiccup must not kill the loop; idle and retry.
                error!(error = %e, "failed to claim next job");
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }
}
