//! Connection acceptance
//!
//! The worker listener does handshake -> registration -> transport watch;
//! the client listener serves a single-method RPC surface,
//! `add_task_group`. Per-connection tasks are wrapped in `catch_unwind` so
//! one connection's panic does not spread to the process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use futures_util::FutureExt as _;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};

use judgehub_rpc::{CallHandler, Endpoint, FrameReader, FrameWriter, Message, RemoteFailure};
use judgehub_server::{GroupEnv, TaskError, TaskManager, WorkerManager};

use crate::link::RpcWorkerLink;

/// Grace period for the peer to announce itself.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// The dispatcher's own hello payload.
fn server_hello() -> Message {
    Message::Hello {
        data: json!({
            "name": "judgehub",
            "role": "dispatcher",
            "version": env!("CARGO_PKG_VERSION"),
        }),
    }
}

async fn exchange_hello(
    socket: TcpStream,
) -> anyhow::Result<(
    FrameReader<tokio::net::tcp::OwnedReadHalf>,
    FrameWriter<tokio::net::tcp::OwnedWriteHalf>,
    Value,
)> {
    socket.set_nodelay(true)?;
    let (read_half, write_half) = socket.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);
    writer.write_msg(&server_hello()).await?;
    let hello = match tokio::time::timeout(HELLO_TIMEOUT, reader.read_msg())
        .await
        .context("hello timed out")??
    {
        Some(Message::Hello { data }) => data,
        Some(_) => bail!("first frame is not hello"),
        None => bail!("connection closed before hello"),
    };
    Ok((reader, writer, hello))
}

/// The only call coming from a worker is `ping`, answered by the endpoint.
struct NoCalls;

#[async_trait]
impl CallHandler for NoCalls {
    async fn handle_call(&self, method: &str, _params: Value) -> Result<Value, RemoteFailure> {
        Err(RemoteFailure::new("UnknownMethod", method))
    }
}

pub async fn run_worker_listener(
    listener: TcpListener,
    wm: Arc<WorkerManager>,
) -> anyhow::Result<()> {
    loop {
        let (socket, addr) = listener.accept().await?;
        let wm = Arc::clone(&wm);
        tokio::spawn(async move {
            let conn = std::panic::AssertUnwindSafe(worker_conn(socket, addr, wm));
            match conn.catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(%addr, error = %e, "worker connection error"),
                Err(_) => tracing::error!(%addr, "worker connection task panicked"),
            }
        });
    }
}

async fn worker_conn(
    socket: TcpStream,
    addr: SocketAddr,
    wm: Arc<WorkerManager>,
) -> anyhow::Result<()> {
    let (reader, writer, hello) = exchange_hello(socket).await?;
    let name = hello
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("<unnamed>")
        .to_string();
    let uid = format!("{}@{}:{}", name, addr.ip(), addr.port());
    tracing::info!(%addr, name, "worker connected");
    metrics::counter!("judgehub_worker_connections_total").increment(1);

    let endpoint = Endpoint::start(reader, writer, Arc::new(NoCalls));
    let link = Arc::new(RpcWorkerLink::new(hello, Arc::clone(&endpoint)));
    if let Err(e) = wm.new_worker(&uid, link).await {
        // duplicates and rejections fold up this connection only; the
        // registered worker is never touched
        metrics::counter!("judgehub_worker_rejections_total").increment(1);
        tracing::warn!(uid, error = %e, "worker connection rejected");
        endpoint.close();
        return Ok(());
    }

    endpoint.closed().await;
    wm.worker_lost(&name);
    tracing::info!(%addr, name, "worker disconnected");
    Ok(())
}

struct ClientHandler {
    tm: Arc<TaskManager>,
}

fn task_error_kind(e: &TaskError) -> &'static str {
    match e {
        TaskError::DuplicateGroup(_) => "DuplicateGroup",
        TaskError::MalformedGroup(_) => "MalformedGroup",
        TaskError::Remote { .. } => "RemoteError",
        TaskError::Timeout { .. } => "TimeoutError",
        TaskError::RetriesExhausted(_) => "RetriesExhausted",
        TaskError::Shutdown => "Shutdown",
        TaskError::Store(_) => "StoreError",
    }
}

#[async_trait]
impl CallHandler for ClientHandler {
    async fn handle_call(&self, method: &str, params: Value) -> Result<Value, RemoteFailure> {
        match method {
            "add_task_group" => {
                let Value::Object(map) = params else {
                    return Err(RemoteFailure::new(
                        "MalformedGroup",
                        "group env is not an object",
                    ));
                };
                metrics::counter!("judgehub_groups_submitted_total").increment(1);
                match self.tm.add_task_group(GroupEnv::from_map(map)).await {
                    Ok(env) => {
                        let counter = if env.has_error() {
                            metrics::counter!("judgehub_groups_rejected_total")
                        } else {
                            metrics::counter!("judgehub_groups_completed_total")
                        };
                        counter.increment(1);
                        Ok(Value::Object(env.as_map().clone()))
                    }
                    Err(e) => {
                        metrics::counter!("judgehub_groups_failed_total").increment(1);
                        Err(RemoteFailure::new(task_error_kind(&e), e.to_string()))
                    }
                }
            }
            other => Err(RemoteFailure::new("UnknownMethod", other)),
        }
    }
}

pub async fn run_client_listener(
    listener: TcpListener,
    tm: Arc<TaskManager>,
) -> anyhow::Result<()> {
    loop {
        let (socket, addr) = listener.accept().await?;
        let tm = Arc::clone(&tm);
        tokio::spawn(async move {
            let conn = std::panic::AssertUnwindSafe(client_conn(socket, addr, tm));
            match conn.catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(%addr, error = %e, "client connection error"),
                Err(_) => tracing::error!(%addr, "client connection task panicked"),
            }
        });
    }
}

async fn client_conn(
    socket: TcpStream,
    addr: SocketAddr,
    tm: Arc<TaskManager>,
) -> anyhow::Result<()> {
    let (reader, writer, _hello) = exchange_hello(socket).await?;
    tracing::debug!(%addr, "client connected");
    let endpoint = Endpoint::start(reader, writer, Arc::new(ClientHandler { tm }));
    endpoint.closed().await;
    tracing::debug!(%addr, "client disconnected");
    Ok(())
}
