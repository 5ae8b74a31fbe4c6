//! Chunked artifact transfer
//!
//! The receiving side is driven by [`TransferSession`]; the sending side
//! splits each artifact with a [`ChunkSplitter`].

pub mod reassembler;
pub mod session;
pub mod splitter;

pub use reassembler::ChunkReassembler;
pub use session::{progress_percent, ReceivedArtifact, Role, SessionState, TransferSession};
pub use splitter::ChunkSplitter;
