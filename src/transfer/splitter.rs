//! Outbound side of an artifact transfer
//!
//! Splits an artifact into the chunk sequence the receiving
//! [`TransferSession`](super::session::TransferSession) expects, and checks
//! each acknowledgment before the next chunk may be sent.

use crate::error::{Result, SegError};
use crate::protocol::message::{ArtifactInfo, FileChunk, Reply};
use crate::transfer::session::progress_percent;
use bytes::Bytes;

/// Splits one artifact into chunks
#[derive(Debug, Clone)]
pub struct ChunkSplitter {
    name: String,
    data: Bytes,
    chunk_size: usize,
}

impl ChunkSplitter {
    /// Create a splitter; zero-size artifacts are rejected
    pub fn new(name: &str, data: Bytes, chunk_size: usize) -> Result<Self> {
        if data.is_empty() {
            return Err(SegError::Protocol(format!(
                "artifact '{}' is empty",
                name
            )));
        }
        if chunk_size == 0 {
            return Err(SegError::InvalidRequest(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        Ok(ChunkSplitter {
            name: name.to_string(),
            data,
            chunk_size,
        })
    }

    /// Artifact name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declaration for the handshake
    pub fn info(&self) -> ArtifactInfo {
        ArtifactInfo {
            name: self.name.clone(),
            size: self.data.len(),
            total_chunks: self.total_chunks(),
        }
    }

    /// Number of chunks
    pub fn total_chunks(&self) -> usize {
        self.data.len().div_ceil(self.chunk_size)
    }

    /// Build chunk `index`
    pub fn chunk(&self, index: usize) -> Option<FileChunk> {
        let start = index.checked_mul(self.chunk_size)?;
        if start >= self.data.len() {
            return None;
        }
        let end = (start + self.chunk_size).min(self.data.len());
        Some(FileChunk::new(
            &self.name,
            index,
            self.total_chunks(),
            &self.data[start..end],
        ))
    }

    /// All chunks in order
    pub fn chunks(&self) -> impl Iterator<Item = FileChunk> + '_ {
        (0..self.total_chunks()).filter_map(move |index| self.chunk(index))
    }

    /// Check the receiver's acknowledgment of chunk `index`
    ///
    /// Returns the acknowledged progress.
    pub fn check_ack(&self, index: usize, reply: &Reply) -> Result<f64> {
        match reply {
            Reply::Receiving { artifact, progress } if *artifact == self.name => {
                let expected = progress_percent(index, self.total_chunks());
                if (*progress - expected).abs() > f64::EPSILON * 100.0 {
                    return Err(SegError::Protocol(format!(
                        "artifact '{}': acknowledged progress {} for chunk {}, expected {}",
                        self.name, progress, index, expected
                    )));
                }
                Ok(*progress)
            }
            Reply::Error { message, .. } => Err(SegError::Protocol(format!(
                "peer aborted transfer of '{}': {}",
                self.name, message
            ))),
            other => Err(SegError::Protocol(format!(
                "expected 'receiving' for '{}', got '{}'",
                self.name,
                other.status()
            ))),
        }
    }
}
