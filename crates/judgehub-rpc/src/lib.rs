//! Length-framed bidirectional JSON RPC between the judgehub dispatcher and
//! its workers.
//!
//! Transport-agnostic: anything that is `AsyncRead + AsyncWrite` works, so
//! TCP sockets and in-memory duplex pairs (tests) share the same code path.
//! Every framing failure is treated as loss of the connection.

pub mod codec;
pub mod endpoint;
pub mod error;
pub mod message;

pub use codec::{FrameReader, FrameWriter, MAX_FRAME_LEN};
pub use endpoint::{CallHandler, Endpoint, RemoteFailure};
pub use error::RpcError;
pub use message::Message;
