//! Framing layer
//!
//! A frame is a 4-byte big-endian length followed by the JSON body. The
//! transport is assumed ordered and reliable; any framing anomaly (length
//! over the cap, broken JSON, EOF mid-frame) is an error equivalent to
//! losing the connection.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

use crate::error::RpcError;
use crate::message::Message;

/// Cap on a single frame. Job envs are at most tens of KiB, so this leaves
/// plenty of headroom.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

pub struct FrameReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    /// Read the next message. EOF on a frame boundary is `Ok(None)`; EOF in
    /// the middle of a frame is an error.
    pub async fn read_msg(&mut self) -> Result<Option<Message>, RpcError> {
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(RpcError::FrameTooLarge(len));
        }
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf).await?;
        Ok(Some(serde_json::from_slice(&buf)?))
    }
}

pub struct FrameWriter<W> {
    inner: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: BufWriter::new(inner),
        }
    }

    pub async fn write_msg(&mut self, msg: &Message) -> Result<(), RpcError> {
        let body = serde_json::to_vec(msg)?;
        if body.len() > MAX_FRAME_LEN {
            return Err(RpcError::FrameTooLarge(body.len()));
        }
        self.inner.write_all(&(body.len() as u32).to_be_bytes()).await?;
        self.inner.write_all(&body).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Flush and close the write side.
    pub async fn shutdown(&mut self) -> Result<(), RpcError> {
        self.inner.flush().await?;
        self.inner.get_mut().shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_write_then_read() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut writer = FrameWriter::new(a);
        let mut reader = FrameReader::new(b);

        writer
            .write_msg(&Message::Notify {
                method: "ping".to_string(),
                params: json!({}),
            })
            .await
            .unwrap();

        match reader.read_msg().await.unwrap() {
            Some(Message::Notify { method, .. }) => assert_eq!(method, "ping"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_eof_on_frame_boundary_is_none() {
        let (a, b) = tokio::io::duplex(1024);
        drop(a);
        let mut reader = FrameReader::new(b);
        assert!(reader.read_msg().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let (mut a, b) = tokio::io::duplex(1024);
        // declare a 100-byte frame but deliver only 3 bytes
        a.write_all(&100u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        let mut reader = FrameReader::new(b);
        assert!(matches!(reader.read_msg().await, Err(RpcError::Io(_))));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut a, b) = tokio::io::duplex(1024);
        a.write_all(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes())
            .await
            .unwrap();
        let mut reader = FrameReader::new(b);
        assert!(matches!(
            reader.read_msg().await,
            Err(RpcError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_garbage_json_is_malformed() {
        let (mut a, b) = tokio::io::duplex(1024);
        a.write_all(&3u32.to_be_bytes()).await.unwrap();
        a.write_all(b"{{{").await.unwrap();
        let mut reader = FrameReader::new(b);
        assert!(matches!(reader.read_msg().await, Err(RpcError::Malformed(_))));
    }
}
