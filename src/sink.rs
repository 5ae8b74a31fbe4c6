//! Best-effort persistence of final artifacts
//!
//! A [`Sink`] failure never invalidates a computed result; callers downgrade
//! the terminal status to `warning` instead.
//!
//! [`ArchiveSink`] is the shared, append-only result archive. Every file is
//! created with create-new semantics under a name derived from the session
//! identifier, so concurrent sessions can never overwrite each other.

use crate::compression::{gzip, CompressionLevel};
use crate::error::{Result, SegError};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Destination for final artifacts
pub trait Sink: Send + Sync {
    /// Store `data` under `name`
    ///
    /// Errors are reported as [`SegError::SinkFailure`].
    fn store(&self, name: &str, data: &[u8]) -> Result<()>;
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl Sink for NullSink {
    fn store(&self, name: &str, data: &[u8]) -> Result<()> {
        debug!(name = name, size = data.len(), "Artifact discarded");
        Ok(())
    }
}

/// Append-only directory archive
#[derive(Debug, Clone)]
pub struct ArchiveSink {
    dir: PathBuf,
    compression: Option<CompressionLevel>,
}

impl ArchiveSink {
    /// Open (and create if needed) an archive directory
    ///
    /// Files are gzip-compressed with the default level.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        info!(dir = %dir.display(), "Result archive ready");
        Ok(ArchiveSink {
            dir,
            compression: Some(CompressionLevel::Default),
        })
    }

    /// Store files uncompressed
    pub fn uncompressed(mut self) -> Self {
        self.compression = None;
        self
    }

    /// Set the compression level
    pub fn with_compression(mut self, level: CompressionLevel) -> Self {
        self.compression = Some(level);
        self
    }

    /// File name used for `name`
    pub fn file_name(&self, name: &str) -> String {
        let base = sanitize(name);
        match self.compression {
            Some(_) => format!("{}.gz", base),
            None => base,
        }
    }

    /// Full path for `name`
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(self.file_name(name))
    }
}

impl Sink for ArchiveSink {
    fn store(&self, name: &str, data: &[u8]) -> Result<()> {
        let file_name = self.file_name(name);
        let contents = match self.compression {
            Some(level) => gzip(data, level).map_err(|e| SegError::SinkFailure(e.to_string()))?,
            None => data.to_vec(),
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.dir.join(&file_name))
            .map_err(|e| {
                warn!(file = %file_name, error = %e, "Archive write refused");
                match e.kind() {
                    ErrorKind::AlreadyExists => {
                        SegError::SinkFailure(format!("'{}' is already archived", file_name))
                    }
                    kind => SegError::SinkFailure(format!("cannot archive '{}': {:?}", file_name, kind)),
                }
            })?;
        file.write_all(&contents)
            .and_then(|_| file.sync_all())
            .map_err(|e| SegError::SinkFailure(format!("cannot archive '{}': {:?}", file_name, e.kind())))?;

        info!(
            file = %file_name,
            original_size = data.len(),
            stored_size = contents.len(),
            "Artifact archived"
        );
        Ok(())
    }
}

/// Archive name for an artifact of a session
pub fn archive_name(session_id: &str, artifact: &str) -> String {
    format!("{}_{}", session_id, artifact)
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}
