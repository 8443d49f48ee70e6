use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::job::NewJob;
use crate::registry::HandlerRegistry;
use crate::storage::JobStore;

/// The dedicated job type whose handler sweeps expired cache entries.
pub const CACHE_SWEEP_JOB_TYPE: &str = "cleanup_cache";

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// How often the loop wakes up.
    pub tick_interval: Duration,
    /// Terminal jobs older than this many days are deleted.
    pub job_retention_days: u32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            job_retention_days: 30,
        }
    }
}

/// Periodic housekeeping: prunes old terminal jobs and keeps a
/// cache-sweep job in flight when a sweep handler is registered.
pub struct Maintenance {
    storage: Arc<dyn JobStore>,
    handlers: Arc<HandlerRegistry>,
    config: MaintenanceConfig,
}

impl Maintenance {
    pub fn new(
        storage: Arc<dyn JobStore>,
        handlers: Arc<HandlerRegistry>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            storage,
            handlers,
            config,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!("maintenance loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("maintenance loop shutting down");
                    break;
                }
                _ = self.tick() => {
                    tokio::time::sleep(self.config.tick_interval).await;
                }
            }
        }
    }

    async fn tick(&self) {
        if let Err(e) = self.sweep_old_jobs().await {
            error!(error = %e, "job sweep failed");
        }

        if let Err(e) = self.enqueue_cache_sweep().await {
            error!(error = %e, "failed to enqueue cache sweep job");
        }
    }

    async fn sweep_old_jobs(&self) -> Result<(), String> {
        let removed = self
            .storage
            .sweep(self.config.job_retention_days)
            .await
            .map_err(|e| e.to_string())?;

        if removed > 0 {
            debug!(removed, "old terminal jobs swept");
        }

        Ok(())
    }

    /// Enqueue a cache-sweep job unless one is already pending or
    /// running. A no-op until a sweep handler is registered.
    async fn enqueue_cache_sweep(&self) -> Result<(), String> {
        if !self.handlers.is_registered(CACHE_SWEEP_JOB_TYPE) {
            return Ok(());
        }

        let active = self
            .storage
            .has_active(CACHE_SWEEP_JOB_TYPE)
            .await
            .map_err(|e| e.to_string())?;

        if active {
            debug!("cache sweep job already in flight");
            return Ok(());
        }

        let id = self
            .storage
            .enqueue(NewJob::new(CACHE_SWEEP_JOB_TYPE, json!({})))
            .await
            .map_err(|e| e.to_string())?;

        debug!(job_id = %id, "cache sweep job enqueued");
        Ok(())
    }
}
