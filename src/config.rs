//! Transfer and engine configuration
//!
//! Both structs have sensible defaults and can be deserialized from JSON
//! (missing fields fall back to the defaults).

use crate::error::{Result, SegError};
use crate::volume::repack::{LabelTable, MergeMode};
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

/// Bytes reserved in a frame for the JSON envelope around a chunk payload
const ENVELOPE_OVERHEAD: usize = 1024;

/// Configuration for the chunked transfer protocol
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Size of each chunk in bytes (before base64 encoding)
    pub chunk_size: usize,
    /// Upper bound on `total_chunks` for a single artifact
    pub max_chunks_per_artifact: usize,
    /// Message-size ceiling of the channel, in bytes per frame body
    pub max_frame_size: usize,
    /// Inactivity timeout while waiting for the peer
    pub timeout_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,           // 1 MiB chunks
            max_chunks_per_artifact: 1000,
            max_frame_size: 100 * 1024 * 1024, // 100 MiB
            timeout_secs: 300,                 // 5 minutes
        }
    }
}

impl TransferConfig {
    /// Set the chunk size
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the inactivity timeout in seconds
    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Set the per-frame size ceiling
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Set the per-artifact chunk limit
    pub fn with_max_chunks(mut self, max_chunks: usize) -> Self {
        self.max_chunks_per_artifact = max_chunks;
        self
    }

    /// Inactivity timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Number of chunks needed for an artifact of `size` bytes
    pub fn expected_chunks(&self, size: usize) -> usize {
        size.div_ceil(self.chunk_size)
    }

    /// Largest artifact the protocol accepts under this configuration
    pub fn max_artifact_size(&self) -> usize {
        self.chunk_size.saturating_mul(self.max_chunks_per_artifact)
    }

    /// Check that a full base64-encoded chunk fits in one frame
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(SegError::InvalidRequest(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.max_chunks_per_artifact == 0 || self.max_chunks_per_artifact > 1000 {
            return Err(SegError::InvalidRequest(format!(
                "max_chunks_per_artifact must be within 1..=1000, got {}",
                self.max_chunks_per_artifact
            )));
        }
        let encoded = self
            .chunk_size
            .div_ceil(3)
            .saturating_mul(4)
            .saturating_add(ENVELOPE_OVERHEAD);
        if encoded > self.max_frame_size {
            return Err(SegError::BodyTooLarge {
                size: encoded,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }
}

/// Compute device handed to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// CPU inference
    #[default]
    Cpu,
    /// CUDA GPU
    Gpu,
    /// Apple Silicon GPU
    Mps,
}

impl Device {
    /// Device name as passed to engines
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
            Self::Mps => "mps",
        }
    }
}

/// Which engine task to run and how to merge its outputs
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SegmentationTask {
    /// Engine task name
    pub task: String,
    /// Optional subset of structures the engine should produce
    pub roi_subset: Option<Vec<String>>,
    /// Declared sub-volumes, in priority order
    pub labels: LabelTable,
    /// How sub-volumes are merged into the final mask
    pub merge: MergeMode,
}

impl Default for SegmentationTask {
    fn default() -> Self {
        Self::four_chambers()
    }
}

impl SegmentationTask {
    /// Four heart chambers as one multi-label mask
    pub fn four_chambers() -> Self {
        Self {
            task: "heartchambers_highres".to_string(),
            roi_subset: None,
            labels: LabelTable::heart_chambers(),
            merge: MergeMode::MultiLabel,
        }
    }

    /// Left atrium and left ventricle merged into one binary mask
    pub fn left_heart() -> Self {
        Self {
            task: "heartchambers_highres".to_string(),
            roi_subset: None,
            labels: LabelTable::left_heart(),
            merge: MergeMode::Union,
        }
    }

    /// Whole heart as a single binary mask
    pub fn whole_heart() -> Self {
        Self {
            task: "total_mr".to_string(),
            roi_subset: Some(vec!["heart".to_string()]),
            labels: LabelTable::single("heart", "Heart"),
            merge: MergeMode::Single,
        }
    }
}

/// Configuration passed into the engine boundary at session start
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Compute device
    pub device: Device,
    /// Task selector
    pub task: SegmentationTask,
}

impl EngineConfig {
    /// Create an engine configuration
    pub fn new(device: Device, task: SegmentationTask) -> Self {
        info!(
            device = device.name(),
            task = %task.task,
            labels = task.labels.len(),
            "Engine configured"
        );
        Self { device, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TransferConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_expected_chunks() {
        let config = TransferConfig::default().with_chunk_size(10);
        assert_eq!(config.expected_chunks(1), 1);
        assert_eq!(config.expected_chunks(10), 1);
        assert_eq!(config.expected_chunks(11), 2);
        assert_eq!(config.expected_chunks(100), 10);
    }

    #[test]
    fn test_chunk_must_fit_frame() {
        let config = TransferConfig::default()
            .with_chunk_size(4096)
            .with_max_frame_size(4096);
        assert!(matches!(
            config.validate(),
            Err(SegError::BodyTooLarge { .. })
        ));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: TransferConfig = serde_json::from_str(r#"{"chunk_size": 512}"#).unwrap();
        assert_eq!(config.chunk_size, 512);
        assert_eq!(config.timeout_secs, 300);

        let engine: EngineConfig = serde_json::from_str(r#"{"device": "mps"}"#).unwrap();
        assert_eq!(engine.device, Device::Mps);
        assert_eq!(engine.task.merge, MergeMode::MultiLabel);
    }

    #[test]
    fn test_task_labels_checked_on_load() {
        let bad = r#"{"task": {"labels": [{"name": "heart", "display": "Heart", "id": 0}]}}"#;
        assert!(serde_json::from_str::<EngineConfig>(bad).is_err());

        let ok = r#"{"task": {"labels": [{"name": "heart", "display": "Heart", "id": 1}], "merge": "single"}}"#;
        let engine: EngineConfig = serde_json::from_str(ok).unwrap();
        assert_eq!(engine.task.labels.len(), 1);
        assert_eq!(engine.task.merge, MergeMode::Single);
    }
}
