//! Framed message connection
//!
//! Wraps any `AsyncRead + AsyncWrite` stream and exchanges one
//! [`Envelope`] per frame.

use crate::error::{Result, SegError};
use crate::protocol::frame::{encode_frame, FrameHeader};
use crate::protocol::message::{Envelope, Reply, TransferMessage};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

/// One side of a framed connection
#[derive(Debug)]
pub struct FramedConnection<S> {
    stream: S,
    max_frame_size: usize,
}

impl<S> FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a stream
    pub fn new(stream: S, max_frame_size: usize) -> Self {
        FramedConnection {
            stream,
            max_frame_size,
        }
    }

    /// Underlying stream
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Send one message
    pub async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        let body = envelope.encode()?;
        let frame = encode_frame(&body, self.max_frame_size)?;

        debug!(kind = envelope.kind(), size = body.len(), "Sending message");

        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;

        trace!(kind = envelope.kind(), bytes_sent = frame.len(), "Message sent");
        Ok(())
    }

    /// Send a reply
    pub async fn send_reply(&mut self, reply: Reply) -> Result<()> {
        self.send(&Envelope::Reply(reply)).await
    }

    /// Send a transfer message
    pub async fn send_message(&mut self, message: TransferMessage) -> Result<()> {
        self.send(&Envelope::Transfer(message)).await
    }

    /// Receive one message
    ///
    /// Returns `Ok(None)` when the peer closed the connection between frames.
    pub async fn recv(&mut self) -> Result<Option<Envelope>> {
        trace!("Waiting for frame header");

        let mut header_buf = [0u8; FrameHeader::SIZE];
        match self.stream.read_exact(&mut header_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                debug!("Peer closed connection");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let header = FrameHeader::decode(&header_buf)?;
        let body_size = header.check_size(self.max_frame_size)?;

        let mut body = vec![0u8; body_size];
        self.stream.read_exact(&mut body).await?;

        let result = Envelope::decode(&body);
        match &result {
            Ok(envelope) => debug!(kind = envelope.kind(), size = body_size, "Message received"),
            Err(e) => warn!(error = %e, size = body_size, "Failed to decode message"),
        }
        result.map(Some)
    }

    /// Receive one message, failing with [`SegError::Timeout`] after `timeout`
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Envelope>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(SegError::Timeout {
                secs: timeout.as_secs(),
            }),
        }
    }

    /// Receive a message that must be present
    pub async fn expect(&mut self, timeout: Duration) -> Result<Envelope> {
        self.recv_timeout(timeout).await?.ok_or_else(|| {
            SegError::Io(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "connection closed by peer",
            ))
        })
    }

    /// Receive a reply; `error` replies become [`SegError::Protocol`]
    pub async fn expect_reply(&mut self, timeout: Duration) -> Result<Reply> {
        match self.expect(timeout).await? {
            Envelope::Reply(Reply::Error { message, .. }) => {
                Err(SegError::Protocol(format!("peer reported error: {}", message)))
            }
            Envelope::Reply(reply) => Ok(reply),
            Envelope::Transfer(message) => Err(SegError::Protocol(format!(
                "expected a reply, got '{}'",
                Envelope::Transfer(message).kind()
            ))),
        }
    }
}
