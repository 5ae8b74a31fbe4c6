//! Engine collaborator traits
//!
//! The labeling and feature-computation algorithms live outside this crate.
//! Implementations are called from the blocking thread pool, never from an
//! I/O task, so they may take as long as they need.

use crate::config::{Device, SegmentationTask};
use crate::error::Result;
use crate::volume::array::Volume;
use crate::volume::decoder::DecodedVolume;
use crate::volume::orientation::CanonicalVolume;
use crate::volume::repack::LabelVolume;
use serde_json::Value;
use std::collections::BTreeMap;

/// Labels a volume in the reference orientation
///
/// Returns one binary sub-volume per structure, in the same orientation and
/// shape as the input. Failures should be reported as
/// [`SegError::EngineFailure`](crate::error::SegError::EngineFailure).
pub trait SegmentationEngine: Send + Sync {
    fn run(
        &self,
        volume: &CanonicalVolume,
        task: &SegmentationTask,
        device: Device,
    ) -> Result<Vec<LabelVolume>>;

    /// Name used in logs
    fn name(&self) -> &str {
        "segmentation"
    }
}

/// Named feature values; keys starting with `diagnostics_` are metadata
pub type FeatureMap = BTreeMap<String, Value>;

/// Computes features of the region `label` of `mask` over `image`
pub trait FeatureEngine: Send + Sync {
    fn extract(&self, image: &DecodedVolume, mask: &Volume<u8>, label: u8) -> Result<FeatureMap>;

    /// Name used in logs
    fn name(&self) -> &str {
        "features"
    }
}
