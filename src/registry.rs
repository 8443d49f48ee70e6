use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinError;

use crate::job::JobRecord;

/// Error type for job execution
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("no handler registered for job type: {0}")]
    UnsupportedJobType(String),

    #[error("payload deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("execution error: {0}")]
    Execution(String),
}

pub type JobResult = Result<(), JobError>;

type BoxedHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = JobResult> + Send>> + Send + Sync>;

type BoxedValidator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

struct Registration {
    handler: BoxedHandler,
    validator: BoxedValidator,
}

/// Maps job-type strings to handlers.
///
/// Registering a typed handler also registers that type's payload
/// schema: raw enqueues for a registered type are checked against it
/// up front instead of failing inside the handler. Types with no local
/// registration stay enqueueable — the handler may live in another
/// process sharing the same store.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Registration>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a typed handler for `name`.
    ///
    /// The handler receives the decoded payload; returning `Err`
    /// signals failure and drives the retry/terminal decision.
    pub fn register<T, F, Fut>(&self, name: &str, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let boxed: BoxedHandler = Arc::new(move |payload: Value| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let args: T = serde_json::from_value(payload)?;
                handler(args).await.map_err(JobError::Execution)
            })
        });

        let validator: BoxedValidator = Arc::new(|payload: &Value| {
            serde_json::from_value::<T>(payload.clone())
                .map(|_| ())
                .map_err(|e| e.to_string())
        });

        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(name.to_string(), Registration { handler: boxed, validator });
    }

    /// Check a raw payload against the schema registered for
    /// `job_type`, if any. Unregistered types pass.
    pub fn validate(&self, job_type: &str, payload: &Value) -> Result<(), String> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        match handlers.get(job_type) {
            Some(reg) => (reg.validator)(payload),
            None => Ok(()),
        }
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.contains_key(job_type)
    }

    /// Run the handler for `job.job_type` against the job's payload.
    pub async fn execute(&self, job: &JobRecord) -> JobResult {
        let handler = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            let reg = handlers
                .get(&job.job_type)
                .ok_or_else(|| JobError::UnsupportedJobType(job.job_type.clone()))?;
            Arc::clone(&reg.handler)
        };

        // Run on a separate task so a panicking handler fails the job
        // instead of the worker.
        let future = handler(job.payload.clone());
        let handle = tokio::spawn(async move { future.await });

        let join_to_error = |e: JoinError| {
            if e.is_panic() {
                JobError::Execution("handler panicked".to_string())
            } else {
                JobError::Execution("handler cancelled".to_string())
            }
        };

        handle.await.map_err(join_to_error)?
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
