//! Gzip support for artifacts and archived results
//!
//! Incoming artifacts may arrive gzip-wrapped (detected by the `1f 8b` magic
//! bytes); archived volumes and masks are written gzip-compressed.
//!
//! # Examples
//!
//! ```
//! use seglink::compression::{gzip, unwrap_gzip, CompressionLevel};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mask = vec![0u8; 10000];
//! let packed = gzip(&mask, CompressionLevel::Default)?;
//! assert!(packed.len() < mask.len());
//!
//! let restored = unwrap_gzip(packed.into())?;
//! assert_eq!(&restored[..], &mask[..]);
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, SegError};
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use tracing::{debug, trace};

/// Leading bytes of every gzip stream
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Compression level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionLevel {
    /// Fast compression, lower ratio (level 1)
    Fast,
    /// Default compression (level 6)
    #[default]
    Default,
    /// Best compression, slower (level 9)
    Best,
}

impl CompressionLevel {
    fn to_flate2(self) -> Compression {
        match self {
            Self::Fast => Compression::fast(),
            Self::Default => Compression::default(),
            Self::Best => Compression::best(),
        }
    }

    /// Get numeric level value
    pub fn level(&self) -> u32 {
        match self {
            Self::Fast => 1,
            Self::Default => 6,
            Self::Best => 9,
        }
    }
}

/// Check whether `data` starts with the gzip magic bytes
pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[..2] == GZIP_MAGIC
}

/// Gzip-compress `data`
pub fn gzip(data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), level.to_flate2());
    encoder
        .write_all(data)
        .map_err(|e| SegError::Io(std::io::Error::new(e.kind(), format!("Gzip compression failed: {}", e))))?;
    let compressed = encoder.finish()?;

    debug!(
        level = level.level(),
        original_size = data.len(),
        compressed_size = compressed.len(),
        "Gzip compression completed"
    );
    Ok(compressed)
}

/// Decompress a gzip stream
pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed).map_err(|e| {
        SegError::InvalidRequest(format!("Gzip decompression failed: {}", e))
    })?;

    debug!(
        compressed_size = data.len(),
        decompressed_size = decompressed.len(),
        "Gzip decompression completed"
    );
    Ok(decompressed)
}

/// Decompress `data` if it is gzip-wrapped, otherwise return it unchanged
pub fn unwrap_gzip(data: Bytes) -> Result<Bytes> {
    if is_gzip(&data) {
        Ok(Bytes::from(gunzip(&data)?))
    } else {
        trace!(size = data.len(), "Artifact is not gzip-wrapped");
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_magic() {
        let packed = gzip(b"volume", CompressionLevel::Fast).unwrap();
        assert!(is_gzip(&packed));
        assert!(!is_gzip(b"{\"dimensions\":[]}"));
        assert!(!is_gzip(&[0x1f]));
    }

    #[test]
    fn test_plain_data_passes_through() {
        let data = Bytes::from_static(b"{\"data\":\"AAAA\"}");
        let out = unwrap_gzip(data.clone()).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_levels_all_restore() {
        let data: Vec<u8> = (0..4096).map(|i| (i % 7) as u8).collect();
        for level in [CompressionLevel::Fast, CompressionLevel::Default, CompressionLevel::Best] {
            let packed = gzip(&data, level).unwrap();
            assert_eq!(gunzip(&packed).unwrap(), data);
        }
    }

    #[test]
    fn test_truncated_stream_is_rejected() {
        let packed = gzip(&[7u8; 1000], CompressionLevel::Default).unwrap();
        let result = gunzip(&packed[..packed.len() / 2]);
        assert!(matches!(result, Err(SegError::InvalidRequest(_))));
    }
}
