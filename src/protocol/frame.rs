//! Binary frame header
//!
//! Every protocol message travels as one frame: a fixed 16-byte header
//! followed by a UTF-8 JSON body. The header carries the body size so the
//! receiver can enforce the channel's message-size ceiling before reading.

use crate::error::{Result, SegError};
use bytes::{Buf, BufMut, BytesMut};

/// Frame magic bytes
pub const MAGIC: [u8; 4] = *b"SGLK";

/// Current frame format version
pub const VERSION: u16 = 1;

/// Frame header
///
/// # Wire format (big-endian)
/// - MAGIC: 4 bytes (`"SGLK"`)
/// - VERSION: u16
/// - FLAGS: u16 (reserved, zero)
/// - BODY_SIZE: u64
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame format version
    pub version: u16,
    /// Reserved flags
    pub flags: u16,
    /// Size of the JSON body in bytes
    pub body_size: u64,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 16;

    /// Create a header for a body of `body_size` bytes
    pub fn new(body_size: usize) -> Self {
        FrameHeader {
            version: VERSION,
            flags: 0,
            body_size: body_size as u64,
        }
    }

    /// Encode header to bytes
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_slice(&MAGIC);
        buf.put_u16(self.version);
        buf.put_u16(self.flags);
        buf.put_u64(self.body_size);

        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Decode header from bytes
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(SegError::Protocol(format!(
                "Frame header too short: {} bytes (need {})",
                data.len(),
                Self::SIZE
            )));
        }

        let mut magic = [0u8; 4];
        data.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(SegError::Protocol(format!(
                "Invalid frame magic: {:02x?}",
                magic
            )));
        }

        let version = data.get_u16();
        if version != VERSION {
            return Err(SegError::Protocol(format!(
                "Unsupported frame version: {}",
                version
            )));
        }
        let flags = data.get_u16();
        let body_size = data.get_u64();

        Ok(FrameHeader {
            version,
            flags,
            body_size,
        })
    }

    /// Check the declared body size against the channel ceiling
    pub fn check_size(&self, max_frame_size: usize) -> Result<usize> {
        let size = usize::try_from(self.body_size).unwrap_or(usize::MAX);
        if size > max_frame_size {
            return Err(SegError::BodyTooLarge {
                size,
                max: max_frame_size,
            });
        }
        Ok(size)
    }
}

/// Encode a complete frame (header + body)
pub fn encode_frame(body: &[u8], max_frame_size: usize) -> Result<Vec<u8>> {
    if body.len() > max_frame_size {
        return Err(SegError::BodyTooLarge {
            size: body.len(),
            max: max_frame_size,
        });
    }
    let mut buf = Vec::with_capacity(FrameHeader::SIZE + body.len());
    buf.extend_from_slice(&FrameHeader::new(body.len()).encode());
    buf.extend_from_slice(body);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = FrameHeader::new(0x0102);
        let bytes = header.encode();
        assert_eq!(&bytes[..4], b"SGLK");
        assert_eq!(&bytes[4..6], &[0, 1]);
        assert_eq!(&bytes[6..8], &[0, 0]);
        assert_eq!(&bytes[8..16], &[0, 0, 0, 0, 0, 0, 0x01, 0x02]);
        assert_eq!(FrameHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = FrameHeader::new(4).encode();
        bytes[0] = b'X';
        assert!(matches!(
            FrameHeader::decode(&bytes),
            Err(SegError::Protocol(_))
        ));
    }

    #[test]
    fn test_short_header() {
        assert!(FrameHeader::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_size_ceiling() {
        let header = FrameHeader::new(2048);
        assert_eq!(header.check_size(4096).unwrap(), 2048);
        assert!(matches!(
            header.check_size(1024),
            Err(SegError::BodyTooLarge {
                size: 2048,
                max: 1024
            })
        ));
        assert!(encode_frame(&[0u8; 100], 50).is_err());
    }
}
