//! Dispatcher core error types
//!
//! The propagation policy is fixed: `DuplicateWorker` / `WorkerRejected`
//! reject the connection, `WorkerGone` re-queues the job (bounded),
//! `Remote` / `Timeout` fail the whole group, and huge-task is a synchronous
//! rejection returned as an `error` key on the group env.

use thiserror::Error;

/// Errors reported by the worker manager.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// A worker with this name is already registered. The connection is
    /// closed and the registry is left untouched.
    #[error("duplicate worker: {0}")]
    DuplicateWorker(String),

    /// Invalid hello, or the worker reconnected with jobs still running.
    #[error("worker rejected: {0}")]
    WorkerRejected(String),

    #[error("no such worker: {0}")]
    NoSuchWorker(String),

    /// The connection to the worker was lost while a job was in flight.
    #[error("worker gone: {0}")]
    WorkerGone(String),

    /// The job did not finish within TASK_TIMEOUT. The connection has been
    /// torn down.
    #[error("job timed out on worker {0}")]
    Timeout(String),

    /// The worker reported the job as failed.
    #[error("remote error [{kind}]: {message}")]
    Remote { kind: String, message: String },

    /// A second exclusive-class job was dispatched to a worker already
    /// running one. Only a scheduler bug can cause this.
    #[error("exclusive job already running on worker {0}")]
    ExclusivityViolation(String),

    /// The job env cannot be dispatched, e.g. missing task_id / job_type.
    #[error("invalid job env: {0}")]
    InvalidJob(String),
}

/// Errors reported by the task manager.
#[derive(Debug, Error)]
pub enum TaskError {
    /// A group with this group_id is already in progress.
    #[error("duplicate task group: {0}")]
    DuplicateGroup(String),

    #[error("malformed task group: {0}")]
    MalformedGroup(String),

    /// A worker reported failure for one of the jobs. Terminal for the
    /// whole group.
    #[error("remote error [{kind}]: {message}")]
    Remote { kind: String, message: String },

    /// One of the jobs timed out.
    #[error("job {task_id} timed out on worker {worker}")]
    Timeout { task_id: String, worker: String },

    /// The WorkerGone retry budget is exhausted.
    #[error("retry limit exceeded for group {0}")]
    RetriesExhausted(String),

    /// The dispatcher is shutting down; nothing will be accepted or
    /// completed anymore.
    #[error("dispatcher shutting down")]
    Shutdown,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Persistent store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt record {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialize failed: {0}")]
    Serialize(#[from] serde_json::Error),
}
