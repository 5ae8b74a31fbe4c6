//! Raw voxel buffer decoding
//!
//! A [`VolumeBuffer`] is what arrives from the caller: three leading
//! dimensions, spacing, origin, an element type tag and the raw bytes,
//! first declared axis fastest. [`VolumeDecoder::decode`] validates the
//! element count, normalizes spacing units and applies the axis-order
//! heuristic recorded in the buffer. The orientation code describes the
//! axes as decoded, so the reordering decides which caller axis ends up
//! along each anatomical direction.
//!
//! # Axis-order heuristic
//!
//! When `d0 <= d1` and `d0 <= d2` the caller's first axis is taken to be the
//! slice (depth) axis and the volume is reordered `(2, 1, 0)`: caller axis 0
//! becomes axis 2, axis 1 stays, axis 2 becomes axis 0. A cube is passed
//! through unchanged. The choice is made once, when the buffer is created,
//! and is the only input used to undo the reordering.

use crate::compression::{is_gzip, unwrap_gzip};
use crate::error::{Result, SegError};
use crate::volume::array::{voxel_count, Volume};
use crate::volume::orientation::Orientation;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tracing::{debug, info};

/// Spacing above this magnitude is taken to be in micrometers
const UNIT_THRESHOLD: f64 = 100.0;

/// Voxel element type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ElementType {
    #[default]
    Float32,
    Uint16,
    Int16,
    Uint8,
}

impl ElementType {
    /// Map a wire tag; unknown or missing tags fall back to the widest type
    pub fn from_tag(tag: Option<&str>) -> Self {
        match tag.map(str::to_ascii_lowercase).as_deref() {
            Some("float32") => Self::Float32,
            Some("uint16") => Self::Uint16,
            Some("int16") => Self::Int16,
            Some("uint8") => Self::Uint8,
            _ => Self::Float32,
        }
    }

    /// Bytes per element
    pub fn size(&self) -> usize {
        match self {
            Self::Float32 => 4,
            Self::Uint16 | Self::Int16 => 2,
            Self::Uint8 => 1,
        }
    }

    /// Wire tag
    pub fn name(&self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Uint16 => "uint16",
            Self::Int16 => "int16",
            Self::Uint8 => "uint8",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Axis-order hint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisOrder {
    /// Axes used as declared
    AsDeclared,
    /// First declared axis is the depth axis; reordered `(2, 1, 0)`
    DepthFirst,
}

impl AxisOrder {
    /// Infer the hint from the declared dimensions
    pub fn infer(dims: [usize; 3]) -> Self {
        let [d0, d1, d2] = dims;
        if d0 == d1 && d1 == d2 {
            AxisOrder::AsDeclared
        } else if d0 <= d1 && d0 <= d2 {
            AxisOrder::DepthFirst
        } else {
            AxisOrder::AsDeclared
        }
    }

    /// Reordering applied at decode time
    pub fn permutation(&self) -> [usize; 3] {
        match self {
            AxisOrder::AsDeclared => [0, 1, 2],
            AxisOrder::DepthFirst => [2, 1, 0],
        }
    }

    /// Undo the decode-time reordering
    ///
    /// Both reorderings are their own inverse.
    pub fn restore<T: Copy>(&self, volume: &Volume<T>) -> Volume<T> {
        volume.permute(self.permutation())
    }
}

/// Raw volume as received, before decoding
#[derive(Debug, Clone)]
pub struct VolumeBuffer {
    dims: [usize; 3],
    spacing: [f64; 3],
    origin: [f64; 3],
    element_type: ElementType,
    orientation: Orientation,
    axis_order: AxisOrder,
    raw: Bytes,
}

impl VolumeBuffer {
    /// Create a buffer; the axis-order hint is fixed here
    pub fn new(
        dims: [usize; 3],
        spacing: [f64; 3],
        origin: [f64; 3],
        element_type: ElementType,
        raw: Bytes,
    ) -> Self {
        VolumeBuffer {
            dims,
            spacing,
            origin,
            element_type,
            orientation: Orientation::default(),
            axis_order: AxisOrder::infer(dims),
            raw,
        }
    }

    /// Set the orientation of the decoded axes (after the axis-order
    /// reordering)
    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    pub fn origin(&self) -> [f64; 3] {
        self.origin
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn axis_order(&self) -> AxisOrder {
        self.axis_order
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Declared voxel count; fails when the dimensions overflow
    pub fn voxel_count(&self) -> Result<usize> {
        voxel_count(self.dims)
    }
}

/// Decoded volume, in decoder axis order
#[derive(Debug, Clone)]
pub struct DecodedVolume {
    pub volume: Volume<f32>,
    pub spacing: [f64; 3],
    pub origin: [f64; 3],
    /// Orientation of the decoded axes, as declared
    pub orientation: Orientation,
    /// Hint copied from the source buffer
    pub axis_order: AxisOrder,
    /// Dimensions as the caller declared them
    pub source_dims: [usize; 3],
    pub element_type: ElementType,
}

/// Decodes [`VolumeBuffer`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct VolumeDecoder;

impl VolumeDecoder {
    /// Decode a buffer into a typed array
    pub fn decode(buffer: &VolumeBuffer) -> Result<DecodedVolume> {
        let element_size = buffer.element_type.size();
        let expected = buffer.voxel_count()?;
        let expected_bytes = expected.checked_mul(element_size).ok_or_else(|| {
            SegError::InvalidRequest(format!("dimensions {:?} are too large", buffer.dims))
        })?;

        let raw = if buffer.raw.len() != expected_bytes && is_gzip(&buffer.raw) {
            unwrap_gzip(buffer.raw.clone())?
        } else {
            buffer.raw.clone()
        };

        let actual = raw.len() / element_size;
        if actual != expected || raw.len() % element_size != 0 {
            return Err(SegError::ElementCountMismatch { expected, actual });
        }

        let values = decode_elements(&raw, buffer.element_type);
        let volume = Volume::new(buffer.dims, values)?;
        let spacing = normalize_spacing(buffer.spacing);

        let perm = buffer.axis_order.permutation();
        let decoded = DecodedVolume {
            volume: volume.permute(perm),
            spacing: [spacing[perm[0]], spacing[perm[1]], spacing[perm[2]]],
            origin: [
                buffer.origin[perm[0]],
                buffer.origin[perm[1]],
                buffer.origin[perm[2]],
            ],
            orientation: buffer.orientation,
            axis_order: buffer.axis_order,
            source_dims: buffer.dims,
            element_type: buffer.element_type,
        };

        info!(
            dims = ?buffer.dims,
            decoded_dims = ?decoded.volume.dims(),
            dtype = %buffer.element_type,
            axis_order = ?buffer.axis_order,
            spacing = ?decoded.spacing,
            "Volume decoded"
        );
        Ok(decoded)
    }

    /// Encode voxel values back to little-endian bytes of `element_type`
    pub fn encode(volume: &Volume<f32>, element_type: ElementType) -> Bytes {
        let mut buf = BytesMut::with_capacity(volume.len() * element_type.size());
        for &value in volume.as_slice() {
            match element_type {
                ElementType::Float32 => buf.put_f32_le(value),
                ElementType::Uint16 => buf.put_u16_le(value as u16),
                ElementType::Int16 => buf.put_i16_le(value as i16),
                ElementType::Uint8 => buf.put_u8(value as u8),
            }
        }
        buf.freeze()
    }
}

fn decode_elements(raw: &[u8], element_type: ElementType) -> Vec<f32> {
    let mut buf = raw;
    let mut values = Vec::with_capacity(raw.len() / element_type.size());
    while buf.remaining() >= element_type.size() {
        values.push(match element_type {
            ElementType::Float32 => buf.get_f32_le(),
            ElementType::Uint16 => buf.get_u16_le() as f32,
            ElementType::Int16 => buf.get_i16_le() as f32,
            ElementType::Uint8 => buf.get_u8() as f32,
        });
    }
    values
}

/// Convert micrometer-scale spacing to millimeters
///
/// Zero entries become 1.0.
pub fn normalize_spacing(spacing: [f64; 3]) -> [f64; 3] {
    let max = spacing.iter().fold(0.0f64, |m, s| m.max(s.abs()));
    let mut out = spacing;
    if max > UNIT_THRESHOLD {
        debug!(spacing = ?spacing, "Spacing scaled from micrometers to millimeters");
        for s in out.iter_mut() {
            *s /= 1000.0;
        }
    }
    for s in out.iter_mut() {
        if *s == 0.0 {
            *s = 1.0;
        }
    }
    out
}
