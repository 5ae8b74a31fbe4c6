//! Per-request transfer state machine
//!
//! A [`TransferSession`] is the receiving side of one transfer. It validates
//! the handshake, accepts exactly one outstanding chunk at a time, and owns
//! one [`ChunkReassembler`] per declared artifact.
//!
//! ```text
//! IDLE -> HANDSHAKE_RECEIVED -> AWAIT_ARTIFACT(0) -> RECEIVING(0)
//!      -> AWAIT_ARTIFACT(1) -> RECEIVING(1) -> ... -> PROCESSING -> REPLYING -> DONE
//! any non-terminal state -> ERROR
//! ```
//!
//! A session in the client role ends at `DONE` straight after its last
//! artifact; it never processes. Every transition goes through
//! [`SessionState::can_transition_to`]; `DONE` and `ERROR` accept nothing.
//!
//! # Example
//!
//! ```
//! use seglink::config::TransferConfig;
//! use seglink::protocol::{ArtifactDecl, FileChunk, TransferRequest};
//! use seglink::transfer::{Role, SessionState, TransferSession};
//!
//! # fn main() -> Result<(), seglink::SegError> {
//! let config = TransferConfig::default().with_chunk_size(4);
//! let mut session = TransferSession::new(Role::Service, config)?;
//!
//! session.begin(TransferRequest {
//!     session_id: Some("demo".into()),
//!     artifacts: vec![ArtifactDecl {
//!         name: Some("volume".into()),
//!         size: Some(6),
//!         total_chunks: Some(2),
//!     }],
//! })?;
//! session.announce_next()?;
//! session.accept_chunk(&FileChunk::new("volume", 0, 2, b"abcd"))?;
//! session.accept_chunk(&FileChunk::new("volume", 1, 2, b"ef"))?;
//! assert_eq!(session.state(), SessionState::Processing);
//!
//! let artifacts = session.take_artifacts()?;
//! assert_eq!(&artifacts[0].data[..], b"abcdef");
//! # Ok(())
//! # }
//! ```

use crate::config::TransferConfig;
use crate::error::{Result, SegError};
use crate::protocol::message::{ArtifactInfo, Envelope, FileChunk, Reply, TransferMessage, TransferRequest};
use crate::transfer::reassembler::ChunkReassembler;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Which side of the exchange this session receives for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Receives input artifacts, processes them, replies with results
    Service,
    /// Receives result artifacts returned by the service
    Client,
}

/// Transfer session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    HandshakeReceived,
    /// Waiting to announce readiness for artifact `i`
    AwaitArtifact(usize),
    /// Accepting chunks of artifact `i`
    Receiving(usize),
    Processing,
    Replying,
    Done,
    Error,
}

impl SessionState {
    /// `DONE` and `ERROR` accept no further messages
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Transition table
    pub fn can_transition_to(&self, next: SessionState, role: Role) -> bool {
        use SessionState::*;
        match (*self, next) {
            (Idle, HandshakeReceived) => true,
            (HandshakeReceived, AwaitArtifact(0)) => true,
            (AwaitArtifact(i), Receiving(j)) => i == j,
            (Receiving(i), AwaitArtifact(j)) => j == i + 1,
            (Receiving(_), Processing) => role == Role::Service,
            (Receiving(_), Done) => role == Role::Client,
            (Processing, Replying) => true,
            (Replying, Done) => true,
            (from, Error) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Name for logs
    pub fn name(&self) -> String {
        match self {
            Self::Idle => "IDLE".to_string(),
            Self::HandshakeReceived => "HANDSHAKE_RECEIVED".to_string(),
            Self::AwaitArtifact(i) => format!("AWAIT_ARTIFACT({})", i),
            Self::Receiving(i) => format!("RECEIVING({})", i),
            Self::Processing => "PROCESSING".to_string(),
            Self::Replying => "REPLYING".to_string(),
            Self::Done => "DONE".to_string(),
            Self::Error => "ERROR".to_string(),
        }
    }
}

/// Progress acknowledged for chunk `index` of `total`, rounded to one decimal
pub fn progress_percent(index: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    ((index + 1) as f64 / total as f64 * 1000.0).round() / 10.0
}

/// Generate a session identifier when the peer did not supply one
pub fn generate_session_id() -> String {
    let seq = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}_{}", chrono::Local::now().format("%Y%m%d_%H%M%S"), seq)
}

/// A fully received artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedArtifact {
    pub name: String,
    pub data: Bytes,
}

/// Receiving side of one transfer
#[derive(Debug)]
pub struct TransferSession {
    id: Option<String>,
    role: Role,
    config: TransferConfig,
    artifacts: Vec<ArtifactInfo>,
    reassemblers: Vec<Option<ChunkReassembler>>,
    received_chunks: Vec<usize>,
    received: Vec<ReceivedArtifact>,
    state: SessionState,
    last_activity: Instant,
}

impl TransferSession {
    /// Create an idle session
    ///
    /// Fails when `config` does not pass [`TransferConfig::validate`].
    pub fn new(role: Role, config: TransferConfig) -> Result<Self> {
        config.validate()?;
        Ok(TransferSession {
            id: None,
            role,
            config,
            artifacts: Vec::new(),
            reassemblers: Vec::new(),
            received_chunks: Vec::new(),
            received: Vec::new(),
            state: SessionState::Idle,
            last_activity: Instant::now(),
        })
    }

    /// Session identifier, known once the handshake is accepted
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Session role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Declared artifacts in transfer order
    pub fn artifacts(&self) -> &[ArtifactInfo] {
        &self.artifacts
    }

    /// Chunks received so far for `artifact`
    pub fn received_chunks(&self, artifact: &str) -> Option<usize> {
        self.artifacts
            .iter()
            .position(|a| a.name == artifact)
            .map(|i| self.received_chunks[i])
    }

    /// Time since the last accepted message
    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Abort with [`SegError::Timeout`] if the peer has been silent too long
    pub fn check_timeout(&mut self) -> Result<()> {
        if self.state.is_terminal() || self.idle_time() < self.config.timeout() {
            return Ok(());
        }
        let err = SegError::Timeout {
            secs: self.config.timeout_secs,
        };
        self.fail(&err);
        Err(err)
    }

    /// Dispatch an incoming message
    ///
    /// Only transfer messages are accepted by the receiving side; replies
    /// are rejected as protocol errors.
    pub fn handle(&mut self, envelope: Envelope) -> Result<Reply> {
        match envelope {
            Envelope::Transfer(TransferMessage::TransferRequest(request)) => self.begin(request),
            Envelope::Transfer(TransferMessage::FileChunk(chunk)) => self.accept_chunk(&chunk),
            Envelope::Reply(reply) => self.guarded(|s| {
                Err(SegError::Protocol(format!(
                    "unexpected '{}' message in state {}",
                    reply.status(),
                    s.state.name()
                )))
            }),
        }
    }

    /// Validate the handshake and prepare one reassembler per artifact
    pub fn begin(&mut self, request: TransferRequest) -> Result<Reply> {
        self.guarded(|s| {
            s.expect_state(SessionState::Idle, "transfer_request")?;
            if request.artifacts.is_empty() {
                return Err(SegError::Protocol(
                    "transfer request declares no artifacts".to_string(),
                ));
            }

            let mut names = HashSet::new();
            let mut artifacts = Vec::with_capacity(request.artifacts.len());
            for decl in &request.artifacts {
                let info = decl.validate()?;
                if info.size == 0 {
                    return Err(SegError::Protocol(format!(
                        "artifact '{}' has zero size",
                        info.name
                    )));
                }
                let expected = s.config.expected_chunks(info.size);
                if info.total_chunks != expected {
                    return Err(SegError::Protocol(format!(
                        "artifact '{}': total_chunks {} does not match ceil({} / {}) = {}",
                        info.name, info.total_chunks, info.size, s.config.chunk_size, expected
                    )));
                }
                if info.total_chunks > s.config.max_chunks_per_artifact {
                    return Err(SegError::Protocol(format!(
                        "artifact '{}' needs {} chunks (limit {})",
                        info.name, info.total_chunks, s.config.max_chunks_per_artifact
                    )));
                }
                if !names.insert(info.name.clone()) {
                    return Err(SegError::Protocol(format!(
                        "artifact '{}' declared twice",
                        info.name
                    )));
                }
                artifacts.push(info);
            }

            let id = request.session_id.unwrap_or_else(generate_session_id);
            s.reassemblers = artifacts
                .iter()
                .map(|info| Some(ChunkReassembler::new(info.clone(), s.config.chunk_size)))
                .collect();
            s.received_chunks = vec![0; artifacts.len()];
            s.artifacts = artifacts;
            s.id = Some(id.clone());

            for artifact in &s.artifacts {
                info!(
                    session_id = %id,
                    artifact = %artifact.name,
                    size = artifact.size,
                    total_chunks = artifact.total_chunks,
                    "Artifact declared"
                );
            }

            s.transition(SessionState::HandshakeReceived)?;
            s.transition(SessionState::AwaitArtifact(0))?;
            Ok(Reply::Received {
                session_id: id,
                message: format!(
                    "Request received, expecting {} artifact(s)",
                    s.artifacts.len()
                ),
            })
        })
    }

    /// Announce readiness for the next artifact
    pub fn announce_next(&mut self) -> Result<Reply> {
        self.guarded(|s| {
            let index = match s.state {
                SessionState::AwaitArtifact(i) => i,
                other => {
                    return Err(SegError::Protocol(format!(
                        "cannot announce next artifact in state {}",
                        other.name()
                    )))
                }
            };
            s.transition(SessionState::Receiving(index))?;
            let name = s.artifacts[index].name.clone();
            Ok(Reply::Ready {
                message: format!("Ready to receive '{}'", name),
                artifact: name,
            })
        })
    }

    /// Accept the next chunk of the artifact being received
    pub fn accept_chunk(&mut self, chunk: &FileChunk) -> Result<Reply> {
        self.guarded(|s| {
            let index = match s.state {
                SessionState::Receiving(i) => i,
                other => {
                    return Err(SegError::Protocol(format!(
                        "unexpected file_chunk for '{}' in state {}",
                        chunk.artifact,
                        other.name()
                    )))
                }
            };
            let declared = &s.artifacts[index];
            if chunk.artifact != declared.name {
                return Err(SegError::Protocol(format!(
                    "chunk for '{}' while receiving '{}'",
                    chunk.artifact, declared.name
                )));
            }
            if chunk.total_chunks != declared.total_chunks {
                return Err(SegError::Protocol(format!(
                    "chunk declares {} total chunks, handshake declared {}",
                    chunk.total_chunks, declared.total_chunks
                )));
            }
            let total = declared.total_chunks;

            let payload = chunk.payload()?;
            let reassembler = s.reassemblers[index].as_mut().ok_or_else(|| {
                SegError::Protocol(format!("artifact '{}' already complete", chunk.artifact))
            })?;
            let count = reassembler.append(chunk.chunk_index, &payload)?;
            s.received_chunks[index] = count;
            s.last_activity = Instant::now();

            let progress = progress_percent(chunk.chunk_index, total);
            trace!(
                session_id = s.id.as_deref().unwrap_or(""),
                artifact = %chunk.artifact,
                chunk_index = chunk.chunk_index,
                progress = progress,
                "Chunk accepted"
            );

            if count == total {
                let reassembler = s.reassemblers[index].take().ok_or_else(|| {
                    SegError::Protocol(format!("artifact '{}' already complete", chunk.artifact))
                })?;
                let data = reassembler.finish()?;
                s.received.push(ReceivedArtifact {
                    name: chunk.artifact.clone(),
                    data,
                });

                let next = if index + 1 < s.artifacts.len() {
                    SessionState::AwaitArtifact(index + 1)
                } else if s.role == Role::Service {
                    SessionState::Processing
                } else {
                    SessionState::Done
                };
                s.transition(next)?;
            }

            Ok(Reply::Receiving {
                artifact: chunk.artifact.clone(),
                progress,
            })
        })
    }

    /// Hand the received artifacts to processing
    pub fn take_artifacts(&mut self) -> Result<Vec<ReceivedArtifact>> {
        let ready = match self.role {
            Role::Service => self.state == SessionState::Processing,
            Role::Client => self.state == SessionState::Done,
        };
        if !ready {
            return Err(SegError::Protocol(format!(
                "artifacts not available in state {}",
                self.state.name()
            )));
        }
        Ok(std::mem::take(&mut self.received))
    }

    /// Processing finished; results are being returned
    pub fn begin_reply(&mut self) -> Result<()> {
        self.guarded(|s| s.transition(SessionState::Replying))
    }

    /// Reply delivered
    pub fn complete(&mut self) -> Result<()> {
        self.guarded(|s| s.transition(SessionState::Done))
    }

    /// Move to `ERROR` and release every buffer
    pub fn fail(&mut self, err: &SegError) {
        if self.state.is_terminal() {
            return;
        }
        warn!(
            session_id = self.id.as_deref().unwrap_or(""),
            state = %self.state.name(),
            error = %err,
            "Transfer session failed"
        );
        self.state = SessionState::Error;
        self.release();
    }

    fn release(&mut self) {
        self.reassemblers.clear();
        self.received.clear();
    }

    fn expect_state(&self, expected: SessionState, message: &str) -> Result<()> {
        if self.state != expected {
            return Err(SegError::Protocol(format!(
                "unexpected {} in state {}",
                message,
                self.state.name()
            )));
        }
        Ok(())
    }

    fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next, self.role) {
            return Err(SegError::Protocol(format!(
                "invalid transition {} -> {}",
                self.state.name(),
                next.name()
            )));
        }
        debug!(
            session_id = self.id.as_deref().unwrap_or(""),
            from = %self.state.name(),
            to = %next.name(),
            "Session state changed"
        );
        self.state = next;
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Run `f`, moving the session to `ERROR` if it fails
    fn guarded<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.state.is_terminal() {
            return Err(SegError::Protocol(format!(
                "session is in terminal state {}",
                self.state.name()
            )));
        }
        let result = f(self);
        if let Err(err) = &result {
            self.fail(err);
        }
        result
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        debug!(
            session_id = self.id.as_deref().unwrap_or(""),
            state = %self.state.name(),
            "Transfer session released"
        );
    }
}
