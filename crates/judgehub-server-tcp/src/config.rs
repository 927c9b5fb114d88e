//! Startup configuration
//!
//! Merges the clap CLI with an optional TOML config file. CLI values always
//! win; anything set in neither falls back to a default.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

#[derive(clap::Parser, Debug)]
#[command(about = "central dispatcher for the judgehub judging infrastructure")]
pub struct Cli {
    /// TOML config file (CLI flags take precedence)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Listen address for worker connections
    #[arg(long)]
    pub worker_listen: Option<SocketAddr>,

    /// Listen address for client (submitter) connections
    #[arg(long)]
    pub client_listen: Option<SocketAddr>,

    /// Database directory for persisted task groups
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Process-wide per-job RAM ceiling (MiB)
    #[arg(long)]
    pub max_task_ram_mb: Option<u64>,

    /// Per-job execution timeout (seconds)
    #[arg(long)]
    pub task_timeout: Option<u64>,

    /// Retry ceiling for jobs interrupted by worker loss
    #[arg(long)]
    pub retry_limit: Option<u32>,

    /// Interval between periodic store syncs (seconds)
    #[arg(long)]
    pub sync_interval: Option<u64>,

    /// Prometheus exporter bind address (disabled when omitted)
    #[arg(long)]
    pub metrics_bind: Option<SocketAddr>,
}

/// The TOML side of the schema. Key names match the CLI flags.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    worker_listen: Option<SocketAddr>,
    client_listen: Option<SocketAddr>,
    db: Option<PathBuf>,
    max_task_ram_mb: Option<u64>,
    task_timeout: Option<u64>,
    retry_limit: Option<u32>,
    sync_interval: Option<u64>,
    metrics_bind: Option<SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub worker_listen: SocketAddr,
    pub client_listen: SocketAddr,
    pub db: PathBuf,
    pub max_task_ram_mb: u64,
    pub task_timeout: Duration,
    pub retry_limit: u32,
    pub sync_interval: Duration,
    pub metrics_bind: Option<SocketAddr>,
}

impl ServerConfig {
    pub fn resolve(cli: Cli) -> anyhow::Result<Self> {
        let file = match &cli.config {
            Some(path) => {
                let body = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                toml::from_str::<FileConfig>(&body)
                    .with_context(|| format!("invalid config file {}", path.display()))?
            }
            None => FileConfig::default(),
        };

        Ok(ServerConfig {
            worker_listen: cli
                .worker_listen
                .or(file.worker_listen)
                .unwrap_or_else(|| "0.0.0.0:7888".parse().unwrap()),
            client_listen: cli
                .client_listen
                .or(file.client_listen)
                .unwrap_or_else(|| "127.0.0.1:7889".parse().unwrap()),
            db: cli
                .db
                .or(file.db)
                .unwrap_or_else(|| PathBuf::from("judgehub-db")),
            max_task_ram_mb: cli.max_task_ram_mb.or(file.max_task_ram_mb).unwrap_or(8192),
            task_timeout: cli
                .task_timeout
                .or(file.task_timeout)
                .map(Duration::from_secs)
                .unwrap_or(judgehub_server::DEFAULT_TASK_TIMEOUT),
            retry_limit: cli.retry_limit.or(file.retry_limit).unwrap_or(3),
            sync_interval: Duration::from_secs(
                cli.sync_interval.or(file.sync_interval).unwrap_or(10),
            ),
            metrics_bind: cli.metrics_bind.or(file.metrics_bind),
        })
    }
}
