//! Worker hello validation and the connection abstraction
//!
//! During handshake a worker announces `{name, concurrency,
//! available_ram_mb, can_run_cpu_exec}`. All four fields are mandatory and
//! type-checked; anything missing or mistyped rejects the connection. The
//! core never touches sockets, so a connection is handed in as an
//! implementation of [`WorkerLink`] (the real one lives in
//! judgehub-server-tcp; tests use mocks).

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::env::JobEnv;

/// A worker's validated handshake announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHello {
    pub name: String,
    pub concurrency: u32,
    pub available_ram_mb: u64,
    pub can_run_cpu_exec: bool,
}

impl WorkerHello {
    /// Validate a hello payload. Rejection reasons double as log and error
    /// messages.
    pub fn from_value(v: &Value) -> Result<Self, String> {
        let obj = v
            .as_object()
            .ok_or_else(|| "hello is not an object".to_string())?;

        let name = match obj.get("name") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::String(_)) => return Err("empty worker name".to_string()),
            Some(_) => return Err("worker name is not a string".to_string()),
            None => return Err("missing worker name".to_string()),
        };

        let concurrency = match obj.get("concurrency") {
            Some(Value::Number(n)) => match n.as_u64() {
                Some(c) if c >= 1 => u32::try_from(c)
                    .map_err(|_| format!("concurrency out of range: {c}"))?,
                _ => return Err(format!("concurrency is not a positive integer: {n}")),
            },
            Some(_) => return Err("concurrency is not a number".to_string()),
            None => return Err("missing concurrency".to_string()),
        };

        let available_ram_mb = match obj.get("available_ram_mb") {
            Some(Value::Number(n)) => n
                .as_u64()
                .ok_or_else(|| format!("available_ram_mb is not a non-negative integer: {n}"))?,
            Some(_) => return Err("available_ram_mb is not a number".to_string()),
            None => return Err("missing available_ram_mb".to_string()),
        };

        let can_run_cpu_exec = match obj.get("can_run_cpu_exec") {
            Some(Value::Bool(b)) => *b,
            Some(_) => return Err("can_run_cpu_exec is not a boolean".to_string()),
            None => return Err("missing can_run_cpu_exec".to_string()),
        };

        Ok(WorkerHello {
            name,
            concurrency,
            available_ram_mb,
            can_run_cpu_exec,
        })
    }

    /// Stable id used for duplicate detection.
    pub fn unique_id(&self, host: &str, port: u16) -> String {
        format!("{}@{}:{}", self.name, host, port)
    }
}

/// Failures on a single worker connection.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The transport closed. Treated as worker loss.
    #[error("link closed")]
    Closed,

    /// The worker reported the job as failed.
    #[error("remote error [{kind}]: {message}")]
    Remote { kind: String, message: String },

    /// A reply that does not match the expected shape. The connection is
    /// discarded.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Abstraction over one worker connection. The manager only ever talks to a
/// worker through this.
#[async_trait]
pub trait WorkerLink: Send + Sync + 'static {
    /// The raw hello payload received during handshake.
    fn hello(&self) -> &Value;

    /// Execute `run(env)` on the worker and return the env it enriched.
    async fn run(&self, env: JobEnv) -> Result<JobEnv, LinkError>;

    /// The task_ids the worker is currently executing.
    async fn get_running(&self) -> Result<Vec<String>, LinkError>;

    /// Tear down the transport. Idempotent.
    fn close(&self);
}
