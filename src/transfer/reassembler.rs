//! Chunk reassembly for one artifact
//!
//! Appends chunk payloads in strict index order into one contiguous buffer.
//! Chunks are accounted by ceiling division: an artifact of `size` bytes is
//! sent as `ceil(size / chunk_size)` chunks, every chunk is non-empty and the
//! last one may be shorter than `chunk_size`.

use crate::error::{Result, SegError};
use crate::protocol::message::ArtifactInfo;
use bytes::{Bytes, BytesMut};
use std::time::Instant;
use tracing::{info, trace, warn};

/// Reassembles the chunks of one declared artifact
#[derive(Debug)]
pub struct ChunkReassembler {
    info: ArtifactInfo,
    chunk_size: usize,
    buffer: BytesMut,
    next_index: usize,
    started_at: Instant,
}

impl ChunkReassembler {
    /// Create a reassembler for a validated artifact declaration
    pub fn new(info: ArtifactInfo, chunk_size: usize) -> Self {
        let buffer = BytesMut::with_capacity(info.size);
        ChunkReassembler {
            info,
            chunk_size,
            buffer,
            next_index: 0,
            started_at: Instant::now(),
        }
    }

    /// Whether every declared chunk has been accepted
    pub fn is_complete(&self) -> bool {
        self.next_index == self.info.total_chunks
    }

    /// Append the payload of chunk `index`
    ///
    /// Returns the number of chunks received so far. The counter never
    /// exceeds the declared total and the buffer never exceeds the declared
    /// size; on the final chunk the length must match exactly.
    pub fn append(&mut self, index: usize, payload: &[u8]) -> Result<usize> {
        if self.is_complete() {
            return Err(SegError::Protocol(format!(
                "artifact '{}' already complete, got chunk {}",
                self.info.name, index
            )));
        }
        if index != self.next_index {
            warn!(
                artifact = %self.info.name,
                expected = self.next_index,
                got = index,
                "Out-of-order chunk"
            );
            return Err(SegError::Protocol(format!(
                "artifact '{}': expected chunk {}, got {}",
                self.info.name, self.next_index, index
            )));
        }
        if payload.is_empty() {
            return Err(SegError::Protocol(format!(
                "artifact '{}': chunk {} is empty",
                self.info.name, index
            )));
        }
        if payload.len() > self.chunk_size {
            return Err(SegError::Protocol(format!(
                "artifact '{}': chunk {} carries {} bytes (chunk size {})",
                self.info.name,
                index,
                payload.len(),
                self.chunk_size
            )));
        }

        let received = self.buffer.len() + payload.len();
        let is_last = index + 1 == self.info.total_chunks;
        if received > self.info.size || (is_last && received != self.info.size) {
            return Err(SegError::ArtifactSizeMismatch {
                artifact: self.info.name.clone(),
                expected: self.info.size,
                actual: received,
            });
        }

        self.buffer.extend_from_slice(payload);
        self.next_index += 1;

        trace!(
            artifact = %self.info.name,
            chunk_index = index,
            bytes_received = self.buffer.len(),
            total_bytes = self.info.size,
            "Chunk appended"
        );

        Ok(self.next_index)
    }

    /// Take the reassembled bytes
    pub fn finish(self) -> Result<Bytes> {
        if !self.is_complete() {
            return Err(SegError::Protocol(format!(
                "artifact '{}' incomplete: {} of {} chunks",
                self.info.name, self.next_index, self.info.total_chunks
            )));
        }
        if self.buffer.len() != self.info.size {
            return Err(SegError::ArtifactSizeMismatch {
                artifact: self.info.name,
                expected: self.info.size,
                actual: self.buffer.len(),
            });
        }

        let elapsed = self.started_at.elapsed().as_secs_f64();
        let speed_mbps = if elapsed > 0.0 {
            (self.info.size as f64) / elapsed / 1_000_000.0
        } else {
            0.0
        };
        info!(
            artifact = %self.info.name,
            total_bytes = self.info.size,
            elapsed_secs = format!("{:.2}", elapsed),
            speed_mbps = format!("{:.2}", speed_mbps),
            "Artifact reassembled"
        );

        Ok(self.buffer.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn info(size: usize, chunk_size: usize) -> ArtifactInfo {
        ArtifactInfo {
            name: "volume".into(),
            size,
            total_chunks: size.div_ceil(chunk_size),
        }
    }

    #[test]
    fn test_exact_concatenation() {
        let data: Vec<u8> = (0..25u8).collect();
        let mut r = ChunkReassembler::new(info(25, 10), 10);
        for (i, chunk) in data.chunks(10).enumerate() {
            r.append(i, chunk).unwrap();
        }
        assert!(r.is_complete());
        assert_eq!(&r.finish().unwrap()[..], &data[..]);
    }

    #[test]
    fn test_exact_multiple_has_no_trailing_chunk() {
        let mut r = ChunkReassembler::new(info(20, 10), 10);
        assert_eq!(r.append(0, &[1; 10]).unwrap(), 1);
        assert_eq!(r.append(1, &[2; 10]).unwrap(), 2);
        assert!(r.is_complete());
        assert!(matches!(r.append(2, &[]), Err(SegError::Protocol(_))));
    }

    #[test]
    fn test_rejects_out_of_order_and_duplicates() {
        let mut r = ChunkReassembler::new(info(30, 10), 10);
        assert!(matches!(r.append(1, &[0; 10]), Err(SegError::Protocol(_))));
        r.append(0, &[0; 10]).unwrap();
        assert!(matches!(r.append(0, &[0; 10]), Err(SegError::Protocol(_))));
        assert_eq!(r.append(1, &[0; 10]).unwrap(), 2);
    }

    #[test]
    fn test_empty_chunk_rejected() {
        let mut r = ChunkReassembler::new(info(10, 10), 10);
        assert!(matches!(r.append(0, &[]), Err(SegError::Protocol(_))));
    }

    #[test]
    fn test_final_length_must_match() {
        let mut r = ChunkReassembler::new(info(15, 10), 10);
        r.append(0, &[0; 10]).unwrap();
        let err = r.append(1, &[0; 4]).unwrap_err();
        assert!(matches!(
            err,
            SegError::ArtifactSizeMismatch {
                expected: 15,
                actual: 14,
                ..
            }
        ));
    }

    #[test]
    fn test_overflow_rejected_early() {
        let mut r = ChunkReassembler::new(
            ArtifactInfo {
                name: "volume".into(),
                size: 12,
                total_chunks: 3,
            },
            10,
        );
        r.append(0, &[0; 10]).unwrap();
        assert!(matches!(
            r.append(1, &[0; 5]),
            Err(SegError::ArtifactSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_finish_incomplete() {
        let mut r = ChunkReassembler::new(info(15, 10), 10);
        r.append(0, &[0; 10]).unwrap();
        assert!(matches!(r.finish(), Err(SegError::Protocol(_))));
    }

    proptest! {
        #[test]
        fn prop_reassembles_any_size(size in 1usize..5000, chunk_size in 1usize..700) {
            let data: Vec<u8> = (0..size).map(|i| (i * 31 % 251) as u8).collect();
            let total = size.div_ceil(chunk_size);
            let mut r = ChunkReassembler::new(info(size, chunk_size), chunk_size);
            let mut received = 0;
            for (i, chunk) in data.chunks(chunk_size).enumerate() {
                if i + 1 == total {
                    prop_assert_eq!(chunk.len(), size - chunk_size * (total - 1));
                }
                received = r.append(i, chunk).unwrap();
            }
            prop_assert_eq!(received, total);
            let out = r.finish().unwrap();
            prop_assert_eq!(out.len(), size);
            prop_assert_eq!(&out[..], &data[..]);
        }
    }
}
