//! Volume decoding, canonicalization and mask repacking

pub mod array;
pub mod decoder;
pub mod orientation;
pub mod repack;

pub use array::Volume;
pub use decoder::{AxisOrder, DecodedVolume, ElementType, VolumeBuffer, VolumeDecoder};
pub use orientation::{CanonicalVolume, Orientation, OrientationCanonicalizer, OrientationToken, OrientationTransform};
pub use repack::{LabelEntry, LabelTable, LabelVolume, MaskRepacker, MergeMode, MultiLabelMask};
