//! End-to-end tests for the TCP frontend
//!
//! Drives handshake -> registration -> submission -> result collection over
//! real sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};

use judgehub_rpc::{
    CallHandler, Endpoint, FrameReader, FrameWriter, Message, RemoteFailure, RpcError,
};
use judgehub_server::{TaskManager, TaskManagerConfig, TaskStore, WorkerManager};
use judgehub_server_tcp::{run_client_listener, run_worker_listener};

/// Scripted worker: `ok*` returns the env with `foo=bar` added, `fail`
/// reports a RemoteError, anything else never answers.
struct ScriptedWorker;

#[async_trait]
impl CallHandler for ScriptedWorker {
    async fn handle_call(&self, method: &str, params: Value) -> Result<Value, RemoteFailure> {
        match method {
            "get_running" => Ok(json!([])),
            "run" => {
                let task_id = params
                    .get("task_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if task_id.starts_with("ok") {
                    let mut out = params;
                    out["foo"] = json!("bar");
                    Ok(out)
                } else if task_id == "fail" {
                    Err(RemoteFailure::new("RemoteError", "test"))
                } else {
                    std::future::pending().await
                }
            }
            other => Err(RemoteFailure::new("UnknownMethod", other)),
        }
    }
}

struct NullHandler;

#[async_trait]
impl CallHandler for NullHandler {
    async fn handle_call(&self, method: &str, _params: Value) -> Result<Value, RemoteFailure> {
        Err(RemoteFailure::new("UnknownMethod", method))
    }
}

fn worker_hello() -> Value {
    json!({
        "name": "test",
        "concurrency": 1,
        "available_ram_mb": 4096,
        "can_run_cpu_exec": true
    })
}

async fn connect(addr: SocketAddr, hello: Value, handler: Arc<dyn CallHandler>) -> Arc<Endpoint> {
    let socket = TcpStream::connect(addr).await.unwrap();
    let (read_half, write_half) = socket.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);
    // the server announces itself first
    match reader.read_msg().await.unwrap() {
        Some(Message::Hello { .. }) => {}
        other => panic!("expected server hello, got {other:?}"),
    }
    writer
        .write_msg(&Message::Hello { data: hello })
        .await
        .unwrap();
    Endpoint::start(reader, writer, handler)
}

struct Harness {
    wm: Arc<WorkerManager>,
    worker_addr: SocketAddr,
    client_addr: SocketAddr,
    _db_dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let db_dir = tempfile::tempdir().unwrap();
    let wm = Arc::new(WorkerManager::new(Duration::from_secs(3600)));
    let store = TaskStore::open(db_dir.path()).await.unwrap();
    let tm = Arc::new(TaskManager::new(
        Arc::clone(&wm),
        store,
        TaskManagerConfig {
            max_task_ram_mb: 2048,
            retry_limit: 3,
            sync_interval: Duration::from_secs(10),
        },
    ));
    tm.start().await.unwrap();

    let worker_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let worker_addr = worker_listener.local_addr().unwrap();
    let client_addr = client_listener.local_addr().unwrap();
    tokio::spawn(run_worker_listener(worker_listener, Arc::clone(&wm)));
    tokio::spawn(run_client_listener(client_listener, Arc::clone(&tm)));

    Harness {
        wm,
        worker_addr,
        client_addr,
        _db_dir: db_dir,
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_submit_and_collect_over_tcp() {
    let h = harness().await;
    let _worker = connect(h.worker_addr, worker_hello(), Arc::new(ScriptedWorker)).await;
    wait_until(|| h.wm.has_worker("test")).await;

    let client = connect(h.client_addr, json!({"role": "client"}), Arc::new(NullHandler)).await;
    let result = client
        .call(
            "add_task_group",
            json!({
                "group_id": "asdf_group",
                "workers_jobs": {
                    "ok": {"task_id": "ok", "group_id": "asdf_group", "job_type": "cpu-exec"}
                }
            }),
        )
        .await
        .unwrap();
    assert_eq!(result["workers_jobs"]["ok"]["foo"], json!("bar"));
    assert_eq!(result["workers_jobs"]["ok"]["task_id"], json!("ok"));
}

#[tokio::test]
async fn test_remote_error_surfaces_to_client() {
    let h = harness().await;
    let _worker = connect(h.worker_addr, worker_hello(), Arc::new(ScriptedWorker)).await;
    wait_until(|| h.wm.has_worker("test")).await;

    let client = connect(h.client_addr, json!({"role": "client"}), Arc::new(NullHandler)).await;
    let err = client
        .call(
            "add_task_group",
            json!({
                "group_id": "asdf_group",
                "workers_jobs": {
                    "fail": {"task_id": "fail", "group_id": "asdf_group", "job_type": "cpu-exec"}
                }
            }),
        )
        .await
        .unwrap_err();
    match err {
        RpcError::Remote { kind, message } => {
            assert_eq!(kind, "RemoteError");
            assert!(message.contains("test"));
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn test_huge_task_reply_carries_error() {
    let h = harness().await;
    let _worker = connect(h.worker_addr, worker_hello(), Arc::new(ScriptedWorker)).await;
    wait_until(|| h.wm.has_worker("test")).await;

    let client = connect(h.client_addr, json!({"role": "client"}), Arc::new(NullHandler)).await;
    let result = client
        .call(
            "add_task_group",
            json!({
                "group_id": "asdf_group",
                "workers_jobs": {
                    "asdf": {
                        "task_id": "asdf",
                        "group_id": "asdf_group",
                        "job_type": "cpu-exec",
                        "exec_mem_limit": 64u64 * 1024 * 1024
                    }
                }
            }),
        )
        .await
        .unwrap();
    assert!(result.get("error").is_some());
}

#[tokio::test]
async fn test_worker_disconnect_updates_registry() {
    let h = harness().await;
    let worker = connect(h.worker_addr, worker_hello(), Arc::new(ScriptedWorker)).await;
    wait_until(|| h.wm.has_worker("test")).await;

    worker.close();
    wait_until(|| h.wm.worker_count() == 0).await;
}

#[tokio::test]
async fn test_duplicate_connection_closed_first_kept() {
    let h = harness().await;
    let _first = connect(h.worker_addr, worker_hello(), Arc::new(ScriptedWorker)).await;
    wait_until(|| h.wm.has_worker("test")).await;

    let second = connect(h.worker_addr, worker_hello(), Arc::new(ScriptedWorker)).await;
    // the server detects the duplicate and closes its connection
    tokio::time::timeout(Duration::from_secs(5), second.closed())
        .await
        .expect("duplicate connection must be closed");
    assert!(h.wm.has_worker("test"));
    assert_eq!(h.wm.worker_count(), 1);
}

#[tokio::test]
async fn test_malformed_hello_rejected() {
    let h = harness().await;
    let bad = connect(
        h.worker_addr,
        json!({"name": "bad", "concurrency": "two"}),
        Arc::new(ScriptedWorker),
    )
    .await;
    tokio::time::timeout(Duration::from_secs(5), bad.closed())
        .await
        .expect("malformed hello must be rejected");
    assert_eq!(h.wm.worker_count(), 0);
}
