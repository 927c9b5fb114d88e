use std::sync::Arc;

use anyhow::Context;
use clap::Parser as _;
use tokio::net::TcpListener;

use judgehub_server::{TaskManager, TaskManagerConfig, TaskStore, WorkerManager};
use judgehub_server_tcp::{Cli, ServerConfig, run_client_listener, run_worker_listener, sampler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = ServerConfig::resolve(Cli::parse())?;

    // tracing-subscriber's `tracing-log` feature also installs the log
    // facade bridge, so log output from dependencies ends up here too.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(addr) = cfg.metrics_bind {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install prometheus exporter")?;
        tracing::info!(%addr, "metrics exporter listening");
    }

    let wm = Arc::new(WorkerManager::new(cfg.task_timeout));
    let store = TaskStore::open(&cfg.db)
        .await
        .with_context(|| format!("failed to open store at {}", cfg.db.display()))?;
    let tm = Arc::new(TaskManager::new(
        Arc::clone(&wm),
        store,
        TaskManagerConfig {
            max_task_ram_mb: cfg.max_task_ram_mb,
            retry_limit: cfg.retry_limit,
            sync_interval: cfg.sync_interval,
        },
    ));
    tm.start().await.context("task manager failed to start")?;

    let worker_listener = TcpListener::bind(cfg.worker_listen)
        .await
        .with_context(|| format!("failed to bind worker listener on {}", cfg.worker_listen))?;
    let client_listener = TcpListener::bind(cfg.client_listen)
        .await
        .with_context(|| format!("failed to bind client listener on {}", cfg.client_listen))?;
    tracing::info!(
        worker = %cfg.worker_listen,
        client = %cfg.client_listen,
        db = %cfg.db.display(),
        "judgehub dispatcher up"
    );

    {
        let wm = Arc::clone(&wm);
        tokio::spawn(async move {
            if let Err(e) = run_worker_listener(worker_listener, wm).await {
                tracing::error!(error = %e, "worker listener failed");
            }
        });
    }
    {
        let tm = Arc::clone(&tm);
        tokio::spawn(async move {
            if let Err(e) = run_client_listener(client_listener, tm).await {
                tracing::error!(error = %e, "client listener failed");
            }
        });
    }
    sampler::spawn(Arc::clone(&wm), Arc::clone(&tm));

    shutdown_signal().await?;
    tracing::info!("shutting down, flushing store");
    // in-progress groups stay in the store and are recovered and re-queued
    // on the next start
    tm.flush().await;
    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}
