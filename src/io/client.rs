//! Transfer client
//!
//! Drives the client side of a session: handshake, chunked upload with one
//! outstanding chunk at a time, then reception of the result artifacts
//! declared by the server's `completed` status.

use crate::config::TransferConfig;
use crate::error::{Result, SegError};
use crate::io::connection::FramedConnection;
use crate::pipeline::{FeaturePipeline, SegmentationPipeline};
use crate::protocol::message::{ArtifactDecl, Envelope, Reply, TransferMessage, TransferRequest};
use crate::protocol::payload::{MaskReply, VolumePayload};
use crate::transfer::session::{ReceivedArtifact, Role, SessionState, TransferSession};
use crate::transfer::splitter::ChunkSplitter;
use bytes::Bytes;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, trace};

/// Result of a completed session
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub session_id: String,
    /// `finished` or `warning`
    pub status: &'static str,
    pub message: String,
    pub features_count: Option<usize>,
    /// Result artifacts returned by the server
    pub artifacts: Vec<ReceivedArtifact>,
}

impl TransferOutcome {
    /// Whether the result is valid but was not archived
    pub fn is_warning(&self) -> bool {
        self.status == "warning"
    }

    /// Result artifact by name
    pub fn artifact(&self, name: &str) -> Option<&ReceivedArtifact> {
        self.artifacts.iter().find(|a| a.name == name)
    }
}

/// Transfer client
///
/// # Examples
///
/// ```no_run
/// use seglink::config::TransferConfig;
/// use seglink::io::TransferClient;
/// use seglink::protocol::VolumePayload;
/// use seglink::volume::ElementType;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut client = TransferClient::connect("127.0.0.1:8765", TransferConfig::default()).await?;
///     let payload = VolumePayload::new([4, 64, 64], ElementType::Uint8, &vec![0u8; 4 * 64 * 64]);
///     let (mask, outcome) = client.segment_volume(&payload).await?;
///     println!("{} {:?}", outcome.status, mask.dimensions);
///     Ok(())
/// }
/// ```
pub struct TransferClient<S = TcpStream> {
    conn: FramedConnection<S>,
    config: TransferConfig,
}

impl TransferClient<TcpStream> {
    /// Connect to a transfer server
    pub async fn connect(addr: &str, config: TransferConfig) -> Result<Self> {
        config.validate()?;
        info!(addr = %addr, "Connecting to transfer server");
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        info!(
            local_addr = %stream.local_addr()?,
            peer_addr = %stream.peer_addr()?,
            "Connected to transfer server"
        );
        Self::from_stream(stream, config)
    }
}

impl<S> TransferClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Use an already connected stream
    ///
    /// Fails when `config` does not pass [`TransferConfig::validate`].
    pub fn from_stream(stream: S, config: TransferConfig) -> Result<Self> {
        config.validate()?;
        let conn = FramedConnection::new(stream, config.max_frame_size);
        Ok(TransferClient { conn, config })
    }

    /// Send a segmentation request and decode the returned mask
    pub async fn segment_volume(&mut self, payload: &VolumePayload) -> Result<(MaskReply, TransferOutcome)> {
        let body = Bytes::from(payload.to_json()?);
        let outcome = self
            .transfer(None, vec![(SegmentationPipeline::VOLUME_ARTIFACT.to_string(), body)])
            .await?;
        let mask = outcome
            .artifact(SegmentationPipeline::MASK_ARTIFACT)
            .ok_or_else(|| SegError::ArtifactMissing("server returned no mask".to_string()))?;
        let mask = MaskReply::from_json(&mask.data)?;
        Ok((mask, outcome))
    }

    /// Send an image and its mask for feature extraction
    pub async fn extract_features(&mut self, image: &VolumePayload, mask: &VolumePayload) -> Result<TransferOutcome> {
        let artifacts = vec![
            (FeaturePipeline::IMAGE_ARTIFACT.to_string(), Bytes::from(image.to_json()?)),
            (FeaturePipeline::MASK_ARTIFACT.to_string(), Bytes::from(mask.to_json()?)),
        ];
        self.transfer(None, artifacts).await
    }

    /// Run a complete session
    pub async fn transfer(
        &mut self,
        session_id: Option<String>,
        artifacts: Vec<(String, Bytes)>,
    ) -> Result<TransferOutcome> {
        let timeout = self.config.timeout();
        let started = Instant::now();

        let splitters = artifacts
            .into_iter()
            .map(|(name, data)| {
                let size = data.len();
                let splitter = ChunkSplitter::new(&name, data, self.config.chunk_size)?;
                if splitter.total_chunks() > self.config.max_chunks_per_artifact {
                    return Err(SegError::BodyTooLarge {
                        size,
                        max: self.config.max_artifact_size(),
                    });
                }
                Ok(splitter)
            })
            .collect::<Result<Vec<_>>>()?;

        let request = TransferRequest {
            session_id,
            artifacts: splitters.iter().map(|s| ArtifactDecl::from(&s.info())).collect(),
        };
        self.conn
            .send_message(TransferMessage::TransferRequest(request))
            .await?;

        let session_id = match self.conn.expect_reply(timeout).await? {
            Reply::Received { session_id, message } => {
                debug!(session_id = %session_id, message = %message, "Handshake accepted");
                session_id
            }
            other => return Err(unexpected("received", &other)),
        };

        for splitter in &splitters {
            self.upload(splitter).await?;
        }

        match self.conn.expect_reply(timeout).await? {
            Reply::Processing { message, .. } => debug!(session_id = %session_id, message = %message, "Server processing"),
            other => return Err(unexpected("processing", &other)),
        }

        let (declared, features_count) = match self.conn.expect_reply(timeout).await? {
            Reply::Completed {
                message,
                artifacts,
                features_count,
                ..
            } => {
                info!(session_id = %session_id, message = %message, results = artifacts.len(), "Server completed");
                (artifacts, features_count)
            }
            other => return Err(unexpected("completed", &other)),
        };

        let results = if declared.is_empty() {
            Vec::new()
        } else {
            self.download(&session_id, declared).await?
        };

        let outcome = match self.conn.expect_reply(timeout).await? {
            Reply::Finished {
                message,
                features_count: count,
                ..
            } => TransferOutcome {
                session_id,
                status: "finished",
                message,
                features_count: count.or(features_count),
                artifacts: results,
            },
            Reply::Warning { message, .. } => TransferOutcome {
                session_id,
                status: "warning",
                message,
                features_count,
                artifacts: results,
            },
            other => return Err(unexpected("finished", &other)),
        };

        info!(
            session_id = %outcome.session_id,
            status = outcome.status,
            elapsed_secs = format!("{:.2}", started.elapsed().as_secs_f64()),
            "Session complete"
        );
        Ok(outcome)
    }

    async fn upload(&mut self, splitter: &ChunkSplitter) -> Result<()> {
        let timeout = self.config.timeout();
        match self.conn.expect_reply(timeout).await? {
            Reply::Ready { artifact, .. } if artifact == splitter.name() => {}
            other => return Err(unexpected("ready", &other)),
        }

        let started = Instant::now();
        for chunk in splitter.chunks() {
            let index = chunk.chunk_index;
            self.conn
                .send_message(TransferMessage::FileChunk(chunk))
                .await?;
            let ack = self.conn.expect_reply(timeout).await?;
            let progress = splitter.check_ack(index, &ack)?;
            trace!(artifact = splitter.name(), chunk_index = index, progress = progress, "Upload progress");
        }

        let elapsed = started.elapsed().as_secs_f64();
        info!(
            artifact = splitter.name(),
            total_bytes = splitter.info().size,
            elapsed_secs = format!("{:.2}", elapsed),
            "Artifact uploaded"
        );
        Ok(())
    }

    async fn download(&mut self, session_id: &str, declared: Vec<ArtifactDecl>) -> Result<Vec<ReceivedArtifact>> {
        let timeout = self.config.timeout();
        let mut session = TransferSession::new(Role::Client, self.config.clone())?;

        let result = async {
            session.begin(TransferRequest {
                session_id: Some(session_id.to_string()),
                artifacts: declared,
            })?;
            while let SessionState::AwaitArtifact(_) = session.state() {
                let ready = session.announce_next()?;
                self.conn.send_reply(ready).await?;
                while let SessionState::Receiving(_) = session.state() {
                    let message = self.conn.expect(timeout).await?;
                    if let Envelope::Reply(Reply::Error { message, .. }) = &message {
                        return Err(SegError::Protocol(format!("peer reported error: {}", message)));
                    }
                    let ack = session.handle(message)?;
                    self.conn.send_reply(ack).await?;
                }
            }
            session.take_artifacts()
        }
        .await;

        if let Err(err) = &result {
            session.fail(err);
            let _ = self.conn.send_reply(Reply::error(Some(session_id), err)).await;
        }
        result
    }
}

fn unexpected(expected: &str, got: &Reply) -> SegError {
    SegError::Protocol(format!("expected '{}', got '{}'", expected, got.status()))
}
