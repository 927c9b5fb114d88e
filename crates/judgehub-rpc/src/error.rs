//! RPC layer error types

use thiserror::Error;

/// Failures at the RPC layer.
///
/// Everything except `Remote` is a transport failure; the caller is expected
/// to drop the connection.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The length prefix exceeded the cap. Treated as a broken or hostile
    /// peer and disconnected.
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A message arrived that is not allowed at this point, e.g. out of
    /// handshake order.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(&'static str),

    /// The connection went away while a response was pending.
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer reported a call failure. kind / message carry the peer's own
    /// words verbatim.
    #[error("remote error [{kind}]: {message}")]
    Remote { kind: String, message: String },
}

impl RpcError {
    /// Whether this error means the connection itself is dead.
    pub fn is_transport(&self) -> bool {
        !matches!(self, RpcError::Remote { .. })
    }
}
