//! Bidirectional RPC endpoint
//!
//! Reading and writing are split into two tasks; outgoing messages are
//! serialized through an mpsc channel. A `call` is matched to its response
//! through an id -> oneshot pending map. Incoming calls are dispatched to
//! the registered [`CallHandler`] and answered with a `result` / `error`
//! frame. When the connection dies, every pending call fails with
//! [`RpcError::ConnectionClosed`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};

use crate::codec::{FrameReader, FrameWriter};
use crate::error::RpcError;
use crate::message::Message;

/// A failed call. Becomes the kind / message of an `error` frame.
#[derive(Debug, Clone)]
pub struct RemoteFailure {
    pub kind: String,
    pub message: String,
}

impl RemoteFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Implemented by whoever serves incoming calls.
///
/// `ping` is answered by the endpoint itself and never reaches the handler.
#[async_trait]
pub trait CallHandler: Send + Sync + 'static {
    async fn handle_call(&self, method: &str, params: Value) -> Result<Value, RemoteFailure>;
}

struct Shared {
    out_tx: mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>,
    next_id: AtomicU64,
    closed_tx: watch::Sender<bool>,
}

impl Shared {
    fn fail_pending(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(RpcError::ConnectionClosed));
        }
    }
}

pub struct Endpoint {
    shared: Arc<Shared>,
}

impl Endpoint {
    /// Start the endpoint on a frame stream that has already exchanged hello.
    pub fn start<R, W>(
        reader: FrameReader<R>,
        writer: FrameWriter<W>,
        handler: Arc<dyn CallHandler>,
    ) -> Arc<Endpoint>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            out_tx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed_tx,
        });

        tokio::spawn(write_loop(writer, out_rx, Arc::clone(&shared)));
        tokio::spawn(read_loop(reader, Arc::clone(&shared), handler));

        Arc::new(Endpoint { shared })
    }

    /// Call a method on the peer and wait for its response. Timeouts are the
    /// caller's responsibility.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        if *self.shared.closed_tx.borrow() {
            return Err(RpcError::ConnectionClosed);
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self
                .shared
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            pending.insert(id, tx);
        }
        let sent = self.shared.out_tx.send(Message::Call {
            id,
            method: method.to_string(),
            params,
        });
        if sent.is_err() {
            self.shared
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            return Err(RpcError::ConnectionClosed);
        }
        rx.await.map_err(|_| RpcError::ConnectionClosed)?
    }

    /// Send a notification; no response is expected.
    pub fn notify(&self, method: &str, params: Value) {
        let _ = self.shared.out_tx.send(Message::Notify {
            method: method.to_string(),
            params,
        });
    }

    /// Close the connection. Pending calls fail with ConnectionClosed.
    pub fn close(&self) {
        let _ = self.shared.closed_tx.send(true);
        self.shared.fail_pending();
    }

    /// Wait until the connection is closed.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: FrameWriter<W>,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
    shared: Arc<Shared>,
) {
    let mut closed_rx = shared.closed_tx.subscribe();
    loop {
        tokio::select! {
            msg = out_rx.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = writer.write_msg(&msg).await {
                        tracing::debug!(error = %e, "rpc write failed");
                        break;
                    }
                }
                None => break,
            },
            changed = closed_rx.changed() => {
                if changed.is_err() || *closed_rx.borrow() {
                    break;
                }
            }
        }
    }
    let _ = shared.closed_tx.send(true);
    // Close the queue before failing pending calls. In this order any call
    // whose send succeeded is guaranteed to be drained by some fail_pending,
    // so nothing waits forever.
    drop(out_rx);
    shared.fail_pending();
    let _ = writer.shutdown().await;
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: FrameReader<R>,
    shared: Arc<Shared>,
    handler: Arc<dyn CallHandler>,
) {
    let mut closed_rx = shared.closed_tx.subscribe();
    loop {
        let msg = tokio::select! {
            msg = reader.read_msg() => msg,
            _ = closed_rx.changed() => {
                if *closed_rx.borrow() {
                    break;
                }
                continue;
            }
        };
        match msg {
            Ok(Some(Message::Call { id, method, params })) => {
                if method == "ping" {
                    let _ = shared.out_tx.send(Message::Reply {
                        id,
                        value: json!({}),
                    });
                    continue;
                }
                let handler = Arc::clone(&handler);
                let out_tx = shared.out_tx.clone();
                tokio::spawn(async move {
                    let reply = match handler.handle_call(&method, params).await {
                        Ok(value) => Message::Reply { id, value },
                        Err(f) => Message::Error {
                            id,
                            kind: f.kind,
                            message: f.message,
                        },
                    };
                    let _ = out_tx.send(reply);
                });
            }
            Ok(Some(Message::Reply { id, value })) => {
                complete(&shared, id, Ok(value));
            }
            Ok(Some(Message::Error { id, kind, message })) => {
                complete(&shared, id, Err(RpcError::Remote { kind, message }));
            }
            Ok(Some(Message::Notify { method, .. })) => {
                // No notify other than ping exists today; swallow future ones.
                tracing::trace!(method = %method, "rpc notify ignored");
            }
            Ok(Some(Message::Hello { .. })) => {
                tracing::debug!("unexpected hello after handshake, closing");
                break;
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "rpc read failed");
                break;
            }
        }
    }
    let _ = shared.closed_tx.send(true);
    shared.fail_pending();
}

fn complete(shared: &Shared, id: u64, result: Result<Value, RpcError>) {
    let tx = shared
        .pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&id);
    match tx {
        Some(tx) => {
            let _ = tx.send(result);
        }
        None => tracing::trace!(id, "reply for unknown call id"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl CallHandler for EchoHandler {
        async fn handle_call(&self, method: &str, params: Value) -> Result<Value, RemoteFailure> {
            match method {
                "echo" => Ok(params),
                "fail" => Err(RemoteFailure::new("RemoteError", "test")),
                _ => Err(RemoteFailure::new("UnknownMethod", method)),
            }
        }
    }

    struct NullHandler;

    #[async_trait]
    impl CallHandler for NullHandler {
        async fn handle_call(&self, method: &str, _: Value) -> Result<Value, RemoteFailure> {
            Err(RemoteFailure::new("UnknownMethod", method))
        }
    }

    fn endpoint_pair() -> (Arc<Endpoint>, Arc<Endpoint>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let left = Endpoint::start(FrameReader::new(ar), FrameWriter::new(aw), Arc::new(NullHandler));
        let right = Endpoint::start(FrameReader::new(br), FrameWriter::new(bw), Arc::new(EchoHandler));
        (left, right)
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let (left, _right) = endpoint_pair();
        let out = left.call("echo", json!({"x": 1})).await.unwrap();
        assert_eq!(out["x"], 1);
    }

    #[tokio::test]
    async fn test_remote_failure_propagates_kind_and_message() {
        let (left, _right) = endpoint_pair();
        match left.call("fail", json!({})).await {
            Err(RpcError::Remote { kind, message }) => {
                assert_eq!(kind, "RemoteError");
                assert_eq!(message, "test");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_builtin_ping() {
        let (left, right) = endpoint_pair();
        // either side can ping
        assert!(left.call("ping", json!({})).await.is_ok());
        assert!(right.call("ping", json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_fails_pending_call() {
        let (left, right) = endpoint_pair();
        // tear down the peer first
        right.close();
        match left.call("echo", json!({})).await {
            Err(RpcError::ConnectionClosed) | Err(RpcError::Remote { .. }) => {}
            Ok(_) => {
                // The call can still succeed when it is observed before the
                // close. Calls after that must fail.
                left.closed().await;
                assert!(matches!(
                    left.call("echo", json!({})).await,
                    Err(RpcError::ConnectionClosed)
                ));
            }
            Err(e) => panic!("unexpected: {e:?}"),
        }
    }
}
