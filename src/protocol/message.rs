//! Transfer protocol messages
//!
//! Two closed families of JSON messages travel over the channel:
//!
//! - **Transfer messages**, tagged by `type`: `transfer_request` (handshake)
//!   and `file_chunk`.
//! - **Replies**, tagged by `status`: `received`, `ready`, `receiving`,
//!   `processing`, `completed`, `finished`, `warning`, `error`.
//!
//! The protocol is symmetric: whichever side receives an artifact answers
//! with `ready`/`receiving`, whichever side sends it emits `file_chunk`.
//! Anything outside these two families is rejected as a protocol error.

use crate::error::{Result, SegError};
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One artifact as declared on the wire
///
/// Fields are optional so a handshake missing one of them is reported as a
/// protocol error naming the field instead of a generic parse failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ArtifactDecl {
    /// Artifact name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Total size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    /// Number of chunks the artifact is split into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<usize>,
}

impl ArtifactDecl {
    /// Check that every field is present
    pub fn validate(&self) -> Result<ArtifactInfo> {
        let name = match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => return Err(SegError::Protocol("artifact declared without a name".to_string())),
        };
        let size = self.size.ok_or_else(|| {
            SegError::Protocol(format!("artifact '{}' declared without a size", name))
        })?;
        let total_chunks = self.total_chunks.ok_or_else(|| {
            SegError::Protocol(format!("artifact '{}' declared without total_chunks", name))
        })?;
        Ok(ArtifactInfo {
            name,
            size,
            total_chunks,
        })
    }
}

impl From<&ArtifactInfo> for ArtifactDecl {
    fn from(info: &ArtifactInfo) -> Self {
        ArtifactDecl {
            name: Some(info.name.clone()),
            size: Some(info.size),
            total_chunks: Some(info.total_chunks),
        }
    }
}

/// Validated artifact declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactInfo {
    pub name: String,
    pub size: usize,
    pub total_chunks: usize,
}

/// Handshake opening a transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Session identifier chosen by the client (generated when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Declared artifacts, in transfer order
    #[serde(default)]
    pub artifacts: Vec<ArtifactDecl>,
}

/// One numbered slice of an artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChunk {
    /// Artifact this chunk belongs to
    pub artifact: String,
    /// Zero-based chunk index
    pub chunk_index: usize,
    /// Total chunks of the artifact
    pub total_chunks: usize,
    /// Base64-encoded payload
    pub data: String,
}

impl FileChunk {
    /// Build a chunk, base64-encoding the payload
    pub fn new(artifact: &str, chunk_index: usize, total_chunks: usize, payload: &[u8]) -> Self {
        FileChunk {
            artifact: artifact.to_string(),
            chunk_index,
            total_chunks,
            data: STANDARD.encode(payload),
        }
    }

    /// Decode the payload bytes
    pub fn payload(&self) -> Result<Bytes> {
        Ok(Bytes::from(STANDARD.decode(self.data.as_bytes())?))
    }
}

/// Messages tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferMessage {
    /// Handshake
    TransferRequest(TransferRequest),
    /// Artifact chunk
    FileChunk(FileChunk),
}

/// Messages tagged by `status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Reply {
    /// Handshake accepted
    Received { session_id: String, message: String },
    /// Ready for the next artifact
    Ready { artifact: String, message: String },
    /// Chunk acknowledged
    Receiving { artifact: String, progress: f64 },
    /// All artifacts received, work started
    Processing { session_id: String, message: String },
    /// Work finished; declares the result artifacts that follow
    Completed {
        session_id: String,
        message: String,
        #[serde(default)]
        artifacts: Vec<ArtifactDecl>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        features_count: Option<usize>,
    },
    /// Terminal success
    Finished {
        session_id: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        features_count: Option<usize>,
    },
    /// Terminal success with a degraded side effect
    Warning { session_id: String, message: String },
    /// Terminal failure
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        message: String,
    },
}

impl Reply {
    /// Status string as it appears on the wire
    pub fn status(&self) -> &'static str {
        match self {
            Self::Received { .. } => "received",
            Self::Ready { .. } => "ready",
            Self::Receiving { .. } => "receiving",
            Self::Processing { .. } => "processing",
            Self::Completed { .. } => "completed",
            Self::Finished { .. } => "finished",
            Self::Warning { .. } => "warning",
            Self::Error { .. } => "error",
        }
    }

    /// Whether no further message follows this one
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished { .. } | Self::Warning { .. } | Self::Error { .. }
        )
    }

    /// Build an error reply from a failure
    pub fn error(session_id: Option<&str>, err: &SegError) -> Self {
        Self::Error {
            session_id: session_id.map(str::to_string),
            message: err.to_string(),
        }
    }
}

/// Any message that can arrive on the channel
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Transfer(TransferMessage),
    Reply(Reply),
}

const TRANSFER_TYPES: [&str; 2] = ["transfer_request", "file_chunk"];
const REPLY_STATUSES: [&str; 8] = [
    "received",
    "ready",
    "receiving",
    "processing",
    "completed",
    "finished",
    "warning",
    "error",
];

impl Envelope {
    /// Decode a frame body
    ///
    /// Unrecognized `type`/`status` values are rejected as
    /// [`SegError::Protocol`].
    pub fn decode(body: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| SegError::Protocol(format!("invalid JSON message: {}", e)))?;

        if let Some(kind) = value.get("type").and_then(Value::as_str).map(str::to_string) {
            if !TRANSFER_TYPES.contains(&kind.as_str()) {
                return Err(SegError::Protocol(format!(
                    "unrecognized message type '{}'",
                    kind
                )));
            }
            let msg = serde_json::from_value(value)
                .map_err(|e| SegError::Protocol(format!("malformed {} message: {}", kind, e)))?;
            return Ok(Envelope::Transfer(msg));
        }

        if let Some(status) = value.get("status").and_then(Value::as_str).map(str::to_string) {
            if !REPLY_STATUSES.contains(&status.as_str()) {
                return Err(SegError::Protocol(format!(
                    "unrecognized status '{}'",
                    status
                )));
            }
            let reply = serde_json::from_value(value)
                .map_err(|e| SegError::Protocol(format!("malformed {} reply: {}", status, e)))?;
            return Ok(Envelope::Reply(reply));
        }

        Err(SegError::Protocol(
            "message has neither 'type' nor 'status'".to_string(),
        ))
    }

    /// Encode to a frame body
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(match self {
            Envelope::Transfer(msg) => serde_json::to_vec(msg)?,
            Envelope::Reply(reply) => serde_json::to_vec(reply)?,
        })
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Transfer(TransferMessage::TransferRequest(_)) => "transfer_request",
            Envelope::Transfer(TransferMessage::FileChunk(_)) => "file_chunk",
            Envelope::Reply(reply) => reply.status(),
        }
    }
}

impl From<TransferMessage> for Envelope {
    fn from(msg: TransferMessage) -> Self {
        Envelope::Transfer(msg)
    }
}

impl From<Reply> for Envelope {
    fn from(reply: Reply) -> Self {
        Envelope::Reply(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_handshake() {
        let body = br#"{"type":"transfer_request","session_id":"s1",
            "artifacts":[{"name":"volume","size":10,"total_chunks":1}]}"#;
        let env = Envelope::decode(body).unwrap();
        match env {
            Envelope::Transfer(TransferMessage::TransferRequest(req)) => {
                assert_eq!(req.session_id.as_deref(), Some("s1"));
                let info = req.artifacts[0].validate().unwrap();
                assert_eq!(info.name, "volume");
                assert_eq!(info.total_chunks, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_protocol_error() {
        let result = Envelope::decode(br#"{"type":"radiomics_request"}"#);
        assert!(matches!(result, Err(SegError::Protocol(_))));

        let result = Envelope::decode(br#"{"status":"uploading"}"#);
        assert!(matches!(result, Err(SegError::Protocol(_))));

        let result = Envelope::decode(br#"{"hello":1}"#);
        assert!(matches!(result, Err(SegError::Protocol(_))));

        let result = Envelope::decode(b"not json");
        assert!(matches!(result, Err(SegError::Protocol(_))));
    }

    #[test]
    fn test_malformed_known_message_names_kind() {
        let err = Envelope::decode(br#"{"type":"file_chunk","artifact":"volume"}"#).unwrap_err();
        assert!(matches!(&err, SegError::Protocol(_)));
        assert!(err.to_string().contains("malformed file_chunk message"));

        let err = Envelope::decode(br#"{"status":"receiving","artifact":"volume"}"#).unwrap_err();
        assert!(err.to_string().contains("malformed receiving reply"));
    }

    #[test]
    fn test_missing_field_named() {
        let decl = ArtifactDecl {
            name: Some("mask".into()),
            size: Some(4),
            total_chunks: None,
        };
        let err = decl.validate().unwrap_err();
        assert!(err.to_string().contains("total_chunks"));
    }

    #[test]
    fn test_chunk_payload() {
        let chunk = FileChunk::new("volume", 0, 1, &[0, 1, 2, 250]);
        assert_eq!(chunk.data, "AAEC+g==");
        assert_eq!(&chunk.payload().unwrap()[..], &[0, 1, 2, 250]);

        let bad = FileChunk {
            data: "@@@".into(),
            ..chunk
        };
        assert!(matches!(bad.payload(), Err(SegError::Base64(_))));
    }

    #[test]
    fn test_reply_wire_shape() {
        let reply = Reply::Receiving {
            artifact: "volume".into(),
            progress: 33.3,
        };
        let json: Value = serde_json::from_slice(&Envelope::from(reply).encode().unwrap()).unwrap();
        assert_eq!(json["status"], "receiving");
        assert_eq!(json["artifact"], "volume");
        assert_eq!(json["progress"], 33.3);

        let err = Reply::error(Some("s1"), &SegError::Timeout { secs: 300 });
        assert!(err.is_terminal());
        assert_eq!(err.status(), "error");
    }
}
