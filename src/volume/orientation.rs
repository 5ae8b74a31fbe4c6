//! Anatomical orientation and canonicalization
//!
//! An [`Orientation`] names, for each array axis, the anatomical direction in
//! which its index increases (`"RAS"`: axis 0 towards the patient's right,
//! axis 1 anterior, axis 2 superior). Moving between two orientations is an
//! [`OrientationTransform`]: an axis permutation plus a per-axis flip, which
//! composes and inverts exactly.
//!
//! [`OrientationCanonicalizer::forward`] maps a decoded volume into the
//! engine's reference orientation and returns an [`OrientationToken`] that
//! alone determines the way back.

use crate::error::{Result, SegError};
use crate::volume::array::{is_permutation, Volume};
use crate::volume::decoder::DecodedVolume;
use std::fmt;
use tracing::debug;

/// Direction in which an axis index increases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Left,
    Right,
    Posterior,
    Anterior,
    Inferior,
    Superior,
}

impl Direction {
    fn from_letter(letter: char) -> Option<Self> {
        match letter.to_ascii_uppercase() {
            'L' => Some(Self::Left),
            'R' => Some(Self::Right),
            'P' => Some(Self::Posterior),
            'A' => Some(Self::Anterior),
            'I' => Some(Self::Inferior),
            'S' => Some(Self::Superior),
            _ => None,
        }
    }

    /// Single-letter code
    pub fn letter(&self) -> char {
        match self {
            Self::Left => 'L',
            Self::Right => 'R',
            Self::Posterior => 'P',
            Self::Anterior => 'A',
            Self::Inferior => 'I',
            Self::Superior => 'S',
        }
    }

    /// Anatomical axis: 0 left-right, 1 posterior-anterior, 2 inferior-superior
    fn family(&self) -> usize {
        match self {
            Self::Left | Self::Right => 0,
            Self::Posterior | Self::Anterior => 1,
            Self::Inferior | Self::Superior => 2,
        }
    }
}

/// Orientation of the three array axes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Orientation([Direction; 3]);

impl Orientation {
    /// DICOM patient convention
    pub const LPS: Orientation = Orientation([
        Direction::Left,
        Direction::Posterior,
        Direction::Superior,
    ]);

    /// Engine reference orientation
    pub const RAS: Orientation = Orientation([
        Direction::Right,
        Direction::Anterior,
        Direction::Superior,
    ]);

    /// Parse a three-letter code such as `"LPS"`
    ///
    /// Each anatomical axis must appear exactly once.
    pub fn parse(code: &str) -> Result<Self> {
        let invalid = || SegError::InvalidRequest(format!("invalid orientation code '{}'", code));
        let letters: Vec<char> = code.chars().collect();
        if letters.len() != 3 {
            return Err(invalid());
        }

        let mut axes = [Direction::Right; 3];
        let mut seen = [false; 3];
        for (slot, letter) in axes.iter_mut().zip(letters) {
            let direction = Direction::from_letter(letter).ok_or_else(invalid)?;
            if seen[direction.family()] {
                return Err(invalid());
            }
            seen[direction.family()] = true;
            *slot = direction;
        }
        Ok(Orientation(axes))
    }

    /// Directions per array axis
    pub fn axes(&self) -> [Direction; 3] {
        self.0
    }

    /// Three-letter code
    pub fn code(&self) -> String {
        self.0.iter().map(Direction::letter).collect()
    }

    /// Transform taking an array in this orientation to `target`
    pub fn transform_to(&self, target: &Orientation) -> OrientationTransform {
        let mut perm = [0; 3];
        let mut flip = [false; 3];
        for (a, wanted) in target.0.iter().enumerate() {
            // Each family occurs once in a parsed orientation
            let source = self
                .0
                .iter()
                .position(|d| d.family() == wanted.family())
                .unwrap_or(a);
            perm[a] = source;
            flip[a] = self.0[source] != *wanted;
        }
        OrientationTransform { perm, flip }
    }
}

impl Default for Orientation {
    fn default() -> Self {
        Self::LPS
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Axis permutation plus per-axis flip
///
/// Output axis `a` is input axis `perm[a]`, reversed when `flip[a]` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrientationTransform {
    perm: [usize; 3],
    flip: [bool; 3],
}

impl OrientationTransform {
    /// Build a transform; `perm` must be a permutation of `[0, 1, 2]`
    pub fn new(perm: [usize; 3], flip: [bool; 3]) -> Result<Self> {
        if !is_permutation(perm) {
            return Err(SegError::InvalidRequest(format!(
                "{:?} is not an axis permutation",
                perm
            )));
        }
        Ok(OrientationTransform { perm, flip })
    }

    pub fn identity() -> Self {
        OrientationTransform {
            perm: [0, 1, 2],
            flip: [false; 3],
        }
    }

    pub fn perm(&self) -> [usize; 3] {
        self.perm
    }

    pub fn flip(&self) -> [bool; 3] {
        self.flip
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::identity()
    }

    /// The transform undoing this one
    pub fn inverse(&self) -> Self {
        let mut perm = [0; 3];
        let mut flip = [false; 3];
        for a in 0..3 {
            perm[self.perm[a]] = a;
            flip[self.perm[a]] = self.flip[a];
        }
        OrientationTransform { perm, flip }
    }

    /// `self` followed by `next`
    pub fn then(&self, next: &OrientationTransform) -> Self {
        let mut perm = [0; 3];
        let mut flip = [false; 3];
        for a in 0..3 {
            let mid = next.perm[a];
            perm[a] = self.perm[mid];
            flip[a] = next.flip[a] ^ self.flip[mid];
        }
        OrientationTransform { perm, flip }
    }

    /// Dimensions after the transform
    pub fn apply_dims(&self, dims: [usize; 3]) -> [usize; 3] {
        [dims[self.perm[0]], dims[self.perm[1]], dims[self.perm[2]]]
    }

    /// Per-axis metadata (spacing) after the transform
    pub fn apply_axes(&self, values: [f64; 3]) -> [f64; 3] {
        [values[self.perm[0]], values[self.perm[1]], values[self.perm[2]]]
    }

    /// Transform an array
    pub fn apply<T: Copy>(&self, volume: &Volume<T>) -> Volume<T> {
        volume.transform(self.perm, self.flip)
    }
}

/// Everything needed to map a canonical result back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrientationToken {
    /// Orientation of the volume before canonicalization
    pub source: Orientation,
    /// Transform applied by `forward`
    pub transform: OrientationTransform,
}

/// Volume in the engine's reference orientation
#[derive(Debug, Clone)]
pub struct CanonicalVolume {
    pub volume: Volume<f32>,
    pub spacing: [f64; 3],
    pub origin: [f64; 3],
    pub orientation: Orientation,
    pub token: OrientationToken,
}

impl CanonicalVolume {
    pub fn dims(&self) -> [usize; 3] {
        self.volume.dims()
    }
}

/// Maps volumes into one reference orientation and back
#[derive(Debug, Clone, Copy)]
pub struct OrientationCanonicalizer {
    target: Orientation,
}

impl Default for OrientationCanonicalizer {
    fn default() -> Self {
        Self::new(Orientation::RAS)
    }
}

impl OrientationCanonicalizer {
    pub fn new(target: Orientation) -> Self {
        OrientationCanonicalizer { target }
    }

    pub fn target(&self) -> Orientation {
        self.target
    }

    /// Map a decoded volume into the reference orientation
    ///
    /// Spacing and origin follow the axis permutation.
    pub fn forward(&self, decoded: &DecodedVolume) -> (CanonicalVolume, OrientationToken) {
        let transform = decoded.orientation.transform_to(&self.target);
        let token = OrientationToken {
            source: decoded.orientation,
            transform,
        };
        debug!(
            source = %decoded.orientation,
            target = %self.target,
            perm = ?transform.perm(),
            flip = ?transform.flip(),
            "Canonicalizing volume"
        );

        let canonical = CanonicalVolume {
            volume: transform.apply(&decoded.volume),
            spacing: transform.apply_axes(decoded.spacing),
            origin: transform.apply_axes(decoded.origin),
            orientation: self.target,
            token,
        };
        (canonical, token)
    }

    /// Map a result from the reference orientation back
    ///
    /// Pure in its inputs. The output shape must equal `reference_dims`.
    pub fn inverse<T: Copy>(
        result: &Volume<T>,
        token: &OrientationToken,
        reference_dims: [usize; 3],
    ) -> Result<Volume<T>> {
        let restored = token.transform.inverse().apply(result);
        if restored.dims() != reference_dims {
            return Err(SegError::EngineFailure(format!(
                "result shape {:?} does not map back onto {:?}",
                result.dims(),
                reference_dims
            )));
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::array::voxel_count;
    use crate::volume::decoder::{AxisOrder, ElementType, VolumeBuffer, VolumeDecoder};
    use bytes::Bytes;
    use proptest::prelude::*;

    fn decoded(dims: [usize; 3], orientation: Orientation) -> DecodedVolume {
        let data = (0..voxel_count(dims).unwrap()).map(|v| v as f32).collect();
        DecodedVolume {
            volume: Volume::new(dims, data).unwrap(),
            spacing: [0.5, 0.7, 2.0],
            origin: [1.0, 2.0, 3.0],
            orientation,
            axis_order: AxisOrder::AsDeclared,
            source_dims: dims,
            element_type: ElementType::Float32,
        }
    }

    #[test]
    fn test_parse() {
        assert_eq!(Orientation::parse("lps").unwrap(), Orientation::LPS);
        assert_eq!(Orientation::parse("RAS").unwrap().code(), "RAS");
        assert!(Orientation::parse("LRS").is_err());
        assert!(Orientation::parse("LP").is_err());
        assert!(Orientation::parse("XYZ").is_err());
    }

    #[test]
    fn test_lps_to_ras_flips_two_axes() {
        let t = Orientation::LPS.transform_to(&Orientation::RAS);
        assert_eq!(t.perm(), [0, 1, 2]);
        assert_eq!(t.flip(), [true, true, false]);
        assert!(Orientation::RAS.transform_to(&Orientation::RAS).is_identity());
    }

    #[test]
    fn test_permuted_orientation() {
        let source = Orientation::parse("SAL").unwrap();
        let t = source.transform_to(&Orientation::RAS);
        assert_eq!(t.perm(), [2, 1, 0]);
        assert_eq!(t.flip(), [true, false, false]);
        assert_eq!(t.apply_dims([5, 6, 7]), [7, 6, 5]);
    }

    #[test]
    fn test_forward_inverse_exact() {
        let v = decoded([3, 4, 5], Orientation::parse("PIL").unwrap());
        let canonicalizer = OrientationCanonicalizer::default();
        let (canonical, token) = canonicalizer.forward(&v);
        assert_eq!(canonical.dims(), [5, 3, 4]);
        assert_eq!(canonical.spacing, [2.0, 0.5, 0.7]);
        let back = OrientationCanonicalizer::inverse(&canonical.volume, &token, v.volume.dims()).unwrap();
        assert_eq!(back, v.volume);
    }

    #[test]
    fn test_depth_first_volume_stays_depth_last() {
        let raw: Vec<u8> = (0..4 * 256 * 256).map(|i| (i % 251) as u8).collect();
        let buffer = VolumeBuffer::new(
            [4, 256, 256],
            [3.0, 1.25, 1.25],
            [0.0; 3],
            ElementType::Uint8,
            Bytes::from(raw),
        );
        let decoded = VolumeDecoder::decode(&buffer).unwrap();
        let (canonical, token) = OrientationCanonicalizer::default().forward(&decoded);
        assert_eq!(canonical.dims(), [256, 256, 4]);
        assert_eq!(canonical.spacing, [1.25, 1.25, 3.0]);
        assert_eq!(token.transform.perm(), [0, 1, 2]);

        let back = OrientationCanonicalizer::inverse(&canonical.volume, &token, decoded.volume.dims()).unwrap();
        assert_eq!(back, decoded.volume);
    }

    #[test]
    fn test_inverse_rejects_wrong_shape() {
        let v = decoded([2, 3, 4], Orientation::RAS);
        let (_, token) = OrientationCanonicalizer::default().forward(&v);
        let wrong = Volume::filled([4, 3, 2], 0u8);
        assert!(OrientationCanonicalizer::inverse(&wrong, &token, [2, 3, 4]).is_err());
    }

    fn arb_transform() -> impl Strategy<Value = OrientationTransform> {
        let perms = prop::sample::select(vec![
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ]);
        (perms, any::<[bool; 3]>())
            .prop_map(|(perm, flip)| OrientationTransform::new(perm, flip).unwrap())
    }

    proptest! {
        #[test]
        fn prop_inverse_undoes_transform(
            t in arb_transform(),
            d0 in 1usize..5,
            d1 in 1usize..5,
            d2 in 1usize..5,
        ) {
            let dims = [d0, d1, d2];
            let v = Volume::new(dims, (0..voxel_count(dims).unwrap() as u32).collect()).unwrap();
            prop_assert_eq!(t.inverse().apply(&t.apply(&v)), v.clone());
            prop_assert!(t.then(&t.inverse()).is_identity());
            prop_assert!(t.inverse().then(&t).is_identity());
        }

        #[test]
        fn prop_compose_matches_sequential(
            a in arb_transform(),
            b in arb_transform(),
        ) {
            let dims = [2, 3, 4];
            let v = Volume::new(dims, (0..24u32).collect()).unwrap();
            prop_assert_eq!(a.then(&b).apply(&v), b.apply(&a.apply(&v)));
        }
    }
}
