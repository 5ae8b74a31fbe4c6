//! Transfer protocol implementation module
//!
//! This module contains the frame format, the message families exchanged
//! during a transfer, and the volume/mask payloads.

pub mod frame;
pub mod message;
pub mod payload;

// Re-export commonly used types
pub use frame::FrameHeader;
pub use message::{ArtifactDecl, ArtifactInfo, Envelope, FileChunk, Reply, TransferMessage, TransferRequest};
pub use payload::{ErrorReply, MaskReply, VolumePayload};
