//! Transfer server
//!
//! Accepts connections and runs one independent transfer session per
//! connection:
//!
//! ```text
//! client                                server
//!   transfer_request ------------------->
//!                    <------------------- received
//!                    <------------------- ready (artifact 0)
//!   file_chunk 0     ------------------->
//!                    <------------------- receiving (progress)
//!   ...                                   (repeated per chunk and artifact)
//!                    <------------------- processing
//!                    <------------------- completed (result artifacts)
//!   ready            ------------------->
//!                    <------------------- file_chunk 0
//!   receiving        ------------------->
//!   ...
//!                    <------------------- finished | warning
//! ```
//!
//! Any violation ends the session with an `error` message. Processing runs
//! on the blocking thread pool while the connection is watched for a
//! disconnect.

use crate::config::TransferConfig;
use crate::error::{Result, SegError};
use crate::io::connection::FramedConnection;
use crate::pipeline::{ArtifactProcessor, ProcessOutput};
use crate::protocol::message::{ArtifactDecl, Envelope, Reply, TransferMessage};
use crate::transfer::session::{Role, SessionState, TransferSession};
use crate::transfer::splitter::ChunkSplitter;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, trace, warn};

/// Transfer server
///
/// # Examples
///
/// ```no_run
/// use seglink::config::TransferConfig;
/// use seglink::io::TransferServer;
/// # use seglink::pipeline::ArtifactProcessor;
/// # use std::sync::Arc;
/// # fn processor() -> Arc<dyn ArtifactProcessor> { unimplemented!() }
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = TransferServer::bind("127.0.0.1:8765", TransferConfig::default(), processor()).await?;
///     server.serve().await?;
///     Ok(())
/// }
/// ```
pub struct TransferServer {
    listener: TcpListener,
    config: TransferConfig,
    processor: Arc<dyn ArtifactProcessor>,
}

impl TransferServer {
    /// Bind to a local address
    ///
    /// # Errors
    ///
    /// - [`SegError::Io`] - Failed to bind
    /// - [`SegError::BodyTooLarge`] - A chunk would not fit in one frame
    pub async fn bind(
        addr: &str,
        config: TransferConfig,
        processor: Arc<dyn ArtifactProcessor>,
    ) -> Result<Self> {
        config.validate()?;
        info!(addr = %addr, "Binding transfer server");
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(
            local_addr = %local_addr,
            chunk_size = config.chunk_size,
            timeout_secs = config.timeout_secs,
            "Transfer server listening"
        );
        Ok(TransferServer {
            listener,
            config,
            processor,
        })
    }

    /// Get the local address this server is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever, one task per session
    pub async fn serve(&self) -> Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let config = self.config.clone();
            let processor = self.processor.clone();
            tokio::spawn(async move {
                let _ = handle_connection(stream, addr, config, processor).await;
            });
        }
    }

    /// Accept one connection and run its session to completion
    pub async fn serve_one(&self) -> Result<Reply> {
        let (stream, addr) = self.listener.accept().await?;
        handle_connection(stream, addr, self.config.clone(), self.processor.clone()).await
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    config: TransferConfig,
    processor: Arc<dyn ArtifactProcessor>,
) -> Result<Reply> {
    info!(peer_addr = %addr, "Client connected");
    stream.set_nodelay(true)?;
    let mut conn = FramedConnection::new(stream, config.max_frame_size);
    let result = run_session(&mut conn, &config, processor).await;
    match &result {
        Ok(reply) => info!(peer_addr = %addr, status = reply.status(), "Session closed"),
        Err(e) => warn!(peer_addr = %addr, error = %e, "Session aborted"),
    }
    result
}

/// Run one service-side session over `conn`
///
/// Returns the terminal reply sent to the client. On failure an `error`
/// reply is sent (if the connection is still usable) and every session
/// buffer is released.
pub async fn run_session<S>(
    conn: &mut FramedConnection<S>,
    config: &TransferConfig,
    processor: Arc<dyn ArtifactProcessor>,
) -> Result<Reply>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = match TransferSession::new(Role::Service, config.clone()) {
        Ok(session) => session,
        Err(err) => {
            warn!(error = %err, "Refusing session with invalid transfer config");
            let _ = conn.send_reply(Reply::error(None, &err)).await;
            return Err(err);
        }
    };
    let result = drive(conn, &mut session, config, processor).await;

    if let Err(err) = &result {
        session.fail(err);
        let reply = Reply::error(session.id(), err);
        if let Err(send_err) = conn.send_reply(reply).await {
            debug!(error = %send_err, "Could not deliver error reply");
        }
    }
    result
}

async fn drive<S>(
    conn: &mut FramedConnection<S>,
    session: &mut TransferSession,
    config: &TransferConfig,
    processor: Arc<dyn ArtifactProcessor>,
) -> Result<Reply>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let timeout = config.timeout();
    let started = Instant::now();

    let handshake = conn.expect(timeout).await?;
    let received = session.handle(handshake)?;
    for name in processor.expected_artifacts() {
        if !session.artifacts().iter().any(|a| a.name == name) {
            return Err(SegError::Protocol(format!(
                "request must declare a '{}' artifact",
                name
            )));
        }
    }
    conn.send_reply(received).await?;

    while let SessionState::AwaitArtifact(_) = session.state() {
        let ready = session.announce_next()?;
        conn.send_reply(ready).await?;
        while let SessionState::Receiving(_) = session.state() {
            let message = conn.expect(timeout).await?;
            let ack = session.handle(message)?;
            conn.send_reply(ack).await?;
        }
    }

    let session_id = session.id().unwrap_or_default().to_string();
    let artifacts = session.take_artifacts()?;
    let total_bytes: usize = artifacts.iter().map(|a| a.data.len()).sum();
    info!(
        session_id = %session_id,
        artifacts = artifacts.len(),
        total_bytes = total_bytes,
        elapsed_secs = format!("{:.2}", started.elapsed().as_secs_f64()),
        "All artifacts received"
    );
    conn.send_reply(Reply::Processing {
        session_id: session_id.clone(),
        message: format!("Processing {} artifact(s)", artifacts.len()),
    })
    .await?;

    let output = process(conn, processor, &session_id, artifacts).await?;

    session.begin_reply()?;
    let splitters = output
        .artifacts
        .iter()
        .map(|a| {
            let splitter = ChunkSplitter::new(&a.name, a.data.clone(), config.chunk_size)?;
            if splitter.total_chunks() > config.max_chunks_per_artifact {
                return Err(SegError::BodyTooLarge {
                    size: a.data.len(),
                    max: config.max_artifact_size(),
                });
            }
            Ok(splitter)
        })
        .collect::<Result<Vec<_>>>()?;

    conn.send_reply(Reply::Completed {
        session_id: session_id.clone(),
        message: output.message.clone(),
        artifacts: splitters.iter().map(|s| ArtifactDecl::from(&s.info())).collect(),
        features_count: output.features_count,
    })
    .await?;

    for splitter in &splitters {
        send_artifact(conn, splitter, config).await?;
    }

    let terminal = match &output.warning {
        Some(warning) => Reply::Warning {
            session_id: session_id.clone(),
            message: format!("{}, but the result was not archived: {}", output.message, warning),
        },
        None => Reply::Finished {
            session_id: session_id.clone(),
            message: output.message.clone(),
            features_count: output.features_count,
        },
    };
    conn.send_reply(terminal.clone()).await?;
    session.complete()?;

    info!(
        session_id = %session_id,
        status = terminal.status(),
        elapsed_secs = format!("{:.2}", started.elapsed().as_secs_f64()),
        "Session finished"
    );
    Ok(terminal)
}

/// Run the processor on the blocking pool, aborting if the peer goes away
async fn process<S>(
    conn: &mut FramedConnection<S>,
    processor: Arc<dyn ArtifactProcessor>,
    session_id: &str,
    artifacts: Vec<crate::transfer::session::ReceivedArtifact>,
) -> Result<ProcessOutput>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id = session_id.to_string();
    let mut task = tokio::task::spawn_blocking(move || processor.process(&id, artifacts));

    tokio::select! {
        joined = &mut task => {
            joined.map_err(|e| SegError::EngineFailure(format!("processing task failed: {}", e)))?
        }
        incoming = conn.recv() => {
            // The blocking task cannot be interrupted; its buffers are
            // dropped as soon as it returns.
            task.abort();
            warn!(session_id = session_id, "Peer activity during processing, abandoning result");
            Err(match incoming {
                Ok(None) => SegError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    "peer disconnected during processing",
                )),
                Ok(Some(envelope)) => SegError::Protocol(format!(
                    "unexpected '{}' message during processing",
                    envelope.kind()
                )),
                Err(e) => e,
            })
        }
    }
}

async fn send_artifact<S>(
    conn: &mut FramedConnection<S>,
    splitter: &ChunkSplitter,
    config: &TransferConfig,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let timeout = config.timeout();
    match conn.expect_reply(timeout).await? {
        Reply::Ready { artifact, .. } if artifact == splitter.name() => {}
        other => {
            return Err(SegError::Protocol(format!(
                "expected 'ready' for '{}', got '{}'",
                splitter.name(),
                other.status()
            )))
        }
    }

    let started = Instant::now();
    for chunk in splitter.chunks() {
        let index = chunk.chunk_index;
        conn.send(&Envelope::Transfer(TransferMessage::FileChunk(chunk)))
            .await?;
        let ack = conn.expect_reply(timeout).await?;
        let progress = splitter.check_ack(index, &ack)?;
        trace!(artifact = splitter.name(), chunk_index = index, progress = progress, "Chunk acknowledged");
    }

    info!(
        artifact = splitter.name(),
        total_bytes = splitter.info().size,
        total_chunks = splitter.total_chunks(),
        elapsed_secs = format!("{:.2}", started.elapsed().as_secs_f64()),
        "Result artifact sent"
    );
    Ok(())
}
