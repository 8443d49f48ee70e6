mod cache;
mod dispatcher;
mod job;
mod jobdef;
mod maintenance;
mod queue;
mod registry;
mod storage;
mod worker;

pub use cache::{key_matches, CacheClient, CacheError, CacheResult, VolatileConfig};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use job::{
    JobId, JobRecord, JobStats, JobStatus, NewJob, DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY,
};
pub use jobdef::JobDefinition;
pub use maintenance::{Maintenance, MaintenanceConfig, CACHE_SWEEP_JOB_TYPE};
pub use queue::{JobQueue, QueueError};
pub use registry::{HandlerRegistry, JobError};
pub use storage::{CacheStore, JobStore, SqliteStorage, StorageError};
pub use worker::Worker;
