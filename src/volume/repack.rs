//! Engine output merging and layout restoration
//!
//! The engine returns one binary sub-volume per declared structure. The
//! [`MaskRepacker`] merges them according to a [`LabelTable`] and a
//! [`MergeMode`], maps the result back into the caller's declared axis order
//! using the hint frozen at decode time, and flattens it first axis fastest.

use crate::error::{Result, SegError};
use crate::protocol::payload::MaskReply;
use crate::volume::array::Volume;
use crate::volume::decoder::AxisOrder;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// One declared structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEntry {
    /// Name the engine uses for the sub-volume
    pub name: String,
    /// Name shown to the caller
    pub display: String,
    /// Voxel value in a multi-label mask
    pub id: u8,
}

impl LabelEntry {
    pub fn new(name: &str, display: &str, id: u8) -> Self {
        LabelEntry {
            name: name.to_string(),
            display: display.to_string(),
            id,
        }
    }
}

/// Declared structures in priority order (last listed wins)
///
/// Deserializes from a plain list of entries, checked like [`LabelTable::new`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<LabelEntry>", into = "Vec<LabelEntry>")]
pub struct LabelTable {
    entries: Vec<LabelEntry>,
}

impl TryFrom<Vec<LabelEntry>> for LabelTable {
    type Error = SegError;

    fn try_from(entries: Vec<LabelEntry>) -> Result<Self> {
        Self::new(entries)
    }
}

impl From<LabelTable> for Vec<LabelEntry> {
    fn from(table: LabelTable) -> Self {
        table.entries
    }
}

impl Default for LabelTable {
    fn default() -> Self {
        Self::heart_chambers()
    }
}

impl LabelTable {
    /// Build a table; ids must be non-zero and unique
    pub fn new(entries: Vec<LabelEntry>) -> Result<Self> {
        if entries.is_empty() {
            return Err(SegError::InvalidRequest("label table is empty".to_string()));
        }
        for (i, entry) in entries.iter().enumerate() {
            if entry.id == 0 {
                return Err(SegError::InvalidRequest(format!(
                    "label '{}' uses reserved id 0",
                    entry.name
                )));
            }
            if entries[..i].iter().any(|e| e.id == entry.id || e.name == entry.name) {
                return Err(SegError::InvalidRequest(format!(
                    "label '{}' declared twice",
                    entry.name
                )));
            }
        }
        Ok(LabelTable { entries })
    }

    /// Four heart chambers
    pub fn heart_chambers() -> Self {
        LabelTable {
            entries: vec![
                LabelEntry::new("heart_atrium_left", "Left atrium", 1),
                LabelEntry::new("heart_ventricle_left", "Left ventricle", 2),
                LabelEntry::new("heart_atrium_right", "Right atrium", 3),
                LabelEntry::new("heart_ventricle_right", "Right ventricle", 4),
            ],
        }
    }

    /// Left atrium and left ventricle
    pub fn left_heart() -> Self {
        LabelTable {
            entries: vec![
                LabelEntry::new("heart_atrium_left", "Left atrium", 1),
                LabelEntry::new("heart_ventricle_left", "Left ventricle", 2),
            ],
        }
    }

    /// One structure
    pub fn single(name: &str, display: &str) -> Self {
        LabelTable {
            entries: vec![LabelEntry::new(name, display, 1)],
        }
    }

    pub fn entries(&self) -> &[LabelEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Engine names, in declaration order
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    /// Display names, in declaration order
    pub fn display_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.display.clone()).collect()
    }
}

/// How sub-volumes combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Each structure keeps its table id
    #[default]
    MultiLabel,
    /// All structures become label 1
    Union,
    /// The single declared structure becomes label 1
    Single,
}

/// One engine output
#[derive(Debug, Clone, PartialEq)]
pub struct LabelVolume {
    /// Structure name, matched against the label table
    pub name: String,
    /// Non-zero voxels belong to the structure
    pub mask: Volume<u8>,
}

impl LabelVolume {
    pub fn new(name: &str, mask: Volume<u8>) -> Self {
        LabelVolume {
            name: name.to_string(),
            mask,
        }
    }
}

/// Merged mask with its label table
#[derive(Debug, Clone, PartialEq)]
pub struct MultiLabelMask {
    pub mask: Volume<u8>,
    pub labels: LabelTable,
    pub mode: MergeMode,
}

impl MultiLabelMask {
    /// Display names for the reply, only set for multi-label masks
    pub fn segment_labels(&self) -> Option<Vec<String>> {
        match self.mode {
            MergeMode::MultiLabel => Some(self.labels.display_names()),
            MergeMode::Union | MergeMode::Single => None,
        }
    }
}

/// Merges engine output and restores the caller's layout
#[derive(Debug, Clone, Copy, Default)]
pub struct MaskRepacker;

impl MaskRepacker {
    /// Merge sub-volumes in table order
    ///
    /// Every declared structure must be present; outputs not in the table
    /// are ignored. Where structures overlap, the one listed last wins.
    pub fn merge(outputs: &[LabelVolume], table: &LabelTable, mode: MergeMode) -> Result<MultiLabelMask> {
        if mode == MergeMode::Single && table.len() != 1 {
            return Err(SegError::InvalidRequest(format!(
                "single merge needs exactly one label, table has {}",
                table.len()
            )));
        }

        let mut merged: Option<Volume<u8>> = None;
        for entry in table.entries() {
            let output = outputs
                .iter()
                .find(|o| o.name == entry.name)
                .ok_or_else(|| SegError::ArtifactMissing(format!("engine produced no '{}'", entry.name)))?;

            let target = merged.get_or_insert_with(|| Volume::filled(output.mask.dims(), 0u8));
            if target.dims() != output.mask.dims() {
                return Err(SegError::EngineFailure(format!(
                    "'{}' has shape {:?}, expected {:?}",
                    entry.name,
                    output.mask.dims(),
                    target.dims()
                )));
            }

            let value = match mode {
                MergeMode::MultiLabel => entry.id,
                MergeMode::Union | MergeMode::Single => 1,
            };
            let mut covered = 0usize;
            for (dst, src) in target.as_mut_slice().iter_mut().zip(output.mask.as_slice()) {
                if *src != 0 {
                    *dst = value;
                    covered += 1;
                }
            }
            debug!(label = %entry.name, id = value, voxels = covered, "Sub-volume merged");
        }

        let mask = merged.ok_or_else(|| SegError::InvalidRequest("label table is empty".to_string()))?;
        Ok(MultiLabelMask {
            mask,
            labels: table.clone(),
            mode,
        })
    }

    /// Undo the decode-time axis reordering
    ///
    /// Uses only `hint`; the result must come out as `source_dims`.
    pub fn restore<T: Copy>(volume: &Volume<T>, hint: AxisOrder, source_dims: [usize; 3]) -> Result<Volume<T>> {
        let restored = hint.restore(volume);
        if restored.dims() != source_dims {
            return Err(SegError::EngineFailure(format!(
                "result shape {:?} does not restore to {:?}",
                volume.dims(),
                source_dims
            )));
        }
        Ok(restored)
    }

    /// Restore layout and build the reply payload
    pub fn repack(mask: &MultiLabelMask, hint: AxisOrder, source_dims: [usize; 3]) -> Result<MaskReply> {
        let restored = Self::restore(&mask.mask, hint, source_dims)?;
        let bytes = restored.into_vec();

        info!(
            dims = ?source_dims,
            axis_order = ?hint,
            mode = ?mask.mode,
            bytes = bytes.len(),
            "Mask repacked"
        );

        let multi_label = mask.mode == MergeMode::MultiLabel;
        Ok(MaskReply {
            dimensions: source_dims.to_vec(),
            data: STANDARD.encode(&bytes),
            multi_label: multi_label.then_some(true),
            segment_labels: mask.segment_labels(),
        })
    }
}
