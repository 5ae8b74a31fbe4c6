//! Dense 3-D arrays
//!
//! Storage is always first-axis-fastest: voxel `(i, j, k)` of a volume with
//! dimensions `[d0, d1, d2]` lives at `i + j*d0 + k*d0*d1`.

use crate::error::{Result, SegError};

/// Dense three-dimensional array
#[derive(Debug, Clone, PartialEq)]
pub struct Volume<T> {
    dims: [usize; 3],
    data: Vec<T>,
}

impl<T: Copy> Volume<T> {
    /// Wrap a flat first-axis-fastest buffer
    pub fn new(dims: [usize; 3], data: Vec<T>) -> Result<Self> {
        let expected = voxel_count(dims)?;
        if data.len() != expected {
            return Err(SegError::ElementCountMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Volume { dims, data })
    }

    /// Volume with every voxel set to `value`
    ///
    /// # Panics
    ///
    /// Panics if the voxel count of `dims` overflows `usize`.
    pub fn filled(dims: [usize; 3], value: T) -> Self {
        Volume {
            dims,
            data: vec![value; dims[0] * dims[1] * dims[2]],
        }
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Flat storage, first axis fastest
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Linear offset of voxel `(i, j, k)`
    #[inline]
    pub fn offset(&self, i: usize, j: usize, k: usize) -> usize {
        i + j * self.dims[0] + k * self.dims[0] * self.dims[1]
    }

    /// Voxel at `(i, j, k)`, `None` when out of bounds
    pub fn get(&self, i: usize, j: usize, k: usize) -> Option<T> {
        if i < self.dims[0] && j < self.dims[1] && k < self.dims[2] {
            Some(self.data[self.offset(i, j, k)])
        } else {
            None
        }
    }

    /// Reorder and optionally reverse axes
    ///
    /// Output axis `a` is input axis `perm[a]`, read back to front when
    /// `flip[a]` is set. `perm` must be a permutation of `[0, 1, 2]`.
    pub fn transform(&self, perm: [usize; 3], flip: [bool; 3]) -> Volume<T> {
        let src = self.dims;
        let dims = [src[perm[0]], src[perm[1]], src[perm[2]]];
        if perm == [0, 1, 2] && flip == [false; 3] {
            return self.clone();
        }

        // Input strides, seen from the output axes
        let strides = [1, src[0], src[0] * src[1]];
        let mut step = [0isize; 3];
        let mut base = 0isize;
        for a in 0..3 {
            let stride = strides[perm[a]] as isize;
            if flip[a] {
                base += (dims[a] as isize - 1).max(0) * stride;
                step[a] = -stride;
            } else {
                step[a] = stride;
            }
        }

        let mut data = Vec::with_capacity(self.data.len());
        for k in 0..dims[2] {
            let pk = base + k as isize * step[2];
            for j in 0..dims[1] {
                let pj = pk + j as isize * step[1];
                for i in 0..dims[0] {
                    data.push(self.data[(pj + i as isize * step[0]) as usize]);
                }
            }
        }
        Volume { dims, data }
    }

    /// Reorder axes without reversing any
    pub fn permute(&self, perm: [usize; 3]) -> Volume<T> {
        self.transform(perm, [false; 3])
    }

    /// Apply `f` to every voxel
    pub fn map<U: Copy>(&self, f: impl Fn(T) -> U) -> Volume<U> {
        Volume {
            dims: self.dims,
            data: self.data.iter().map(|v| f(*v)).collect(),
        }
    }
}

/// Number of voxels for `dims`
///
/// Dimensions come from the wire, so the product is checked.
pub fn voxel_count(dims: [usize; 3]) -> Result<usize> {
    dims[0]
        .checked_mul(dims[1])
        .and_then(|n| n.checked_mul(dims[2]))
        .ok_or_else(|| SegError::InvalidRequest(format!("dimensions {:?} are too large", dims)))
}

/// Check that `perm` is a permutation of `[0, 1, 2]`
pub fn is_permutation(perm: [usize; 3]) -> bool {
    let mut seen = [false; 3];
    for axis in perm {
        if axis > 2 || seen[axis] {
            return false;
        }
        seen[axis] = true;
    }
    true
}
