// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Discretized 3D coordinate system shared by every study in an analysis.
//!
//! A [`GridSpace`] couples an [`Affine`] (voxel indices ↔ millimetres) with a
//! grid shape and a boolean brain mask. It is created once per analysis and
//! shared read-only (usually behind an `Arc`) by every pipeline stage.

use crate::error::{CbmaError, CbmaResult};
use ndarray::Array3;
use serde::{Deserialize, Serialize};

/// Voxel index (i, j, k) inside the grid
pub type Ijk = [usize; 3];

/// Grid shape (nx, ny, nz)
pub type GridShape = (usize, usize, usize);

/// 4×4 homogeneous transform from voxel indices to physical (mm) coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[[f64; 4]; 4]", into = "[[f64; 4]; 4]")]
pub struct Affine {
    matrix: [[f64; 4]; 4],
    inverse: [[f64; 4]; 4],
}

impl TryFrom<[[f64; 4]; 4]> for Affine {
    type Error = CbmaError;

    fn try_from(matrix: [[f64; 4]; 4]) -> Result<Self, Self::Error> {
        Affine::new(matrix)
    }
}

impl From<Affine> for [[f64; 4]; 4] {
    fn from(affine: Affine) -> Self {
        affine.matrix
    }
}

impl Affine {
    /// Build an affine from a row-major 4×4 matrix.
    ///
    /// The bottom row must be `[0, 0, 0, 1]` and the linear part invertible.
    pub fn new(matrix: [[f64; 4]; 4]) -> CbmaResult<Self> {
        if matrix.iter().flatten().any(|v| !v.is_finite()) {
            return Err(CbmaError::input("affine", "matrix contains non-finite values"));
        }
        if matrix[3] != [0.0, 0.0, 0.0, 1.0] {
            return Err(CbmaError::input(
                "affine",
                format!("bottom row must be [0, 0, 0, 1], got {:?}", matrix[3]),
            ));
        }
        let inverse = invert_homogeneous(&matrix).ok_or_else(|| {
            CbmaError::input("affine", "linear part is singular and cannot be inverted")
        })?;
        Ok(Self { matrix, inverse })
    }

    pub fn identity() -> Self {
        let mut matrix = [[0.0; 4]; 4];
        for (i, row) in matrix.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        Self {
            matrix,
            inverse: matrix,
        }
    }

    /// Axis-aligned affine with the given voxel sizes and the mm position of voxel (0, 0, 0)
    pub fn from_voxel_size(voxel_size: [f64; 3], origin: [f64; 3]) -> CbmaResult<Self> {
        let mut matrix = [[0.0; 4]; 4];
        for axis in 0..3 {
            matrix[axis][axis] = voxel_size[axis];
            matrix[axis][3] = origin[axis];
        }
        matrix[3][3] = 1.0;
        Self::new(matrix)
    }

    pub fn matrix(&self) -> &[[f64; 4]; 4] {
        &self.matrix
    }

    /// Apply the transform to a (possibly fractional) voxel position
    pub fn apply(&self, ijk: [f64; 3]) -> [f64; 3] {
        apply_homogeneous(&self.matrix, ijk)
    }

    /// Apply the inverse transform to a physical position
    pub fn apply_inverse(&self, xyz: [f64; 3]) -> [f64; 3] {
        apply_homogeneous(&self.inverse, xyz)
    }

    /// Voxel sizes in mm (column norms of the linear part)
    pub fn voxel_sizes(&self) -> [f64; 3] {
        let mut sizes = [0.0; 3];
        for (col, size) in sizes.iter_mut().enumerate() {
            *size = (0..3)
                .map(|row| self.matrix[row][col] * self.matrix[row][col])
                .sum::<f64>()
                .sqrt();
        }
        sizes
    }
}

fn apply_homogeneous(m: &[[f64; 4]; 4], p: [f64; 3]) -> [f64; 3] {
    let mut out = [0.0; 3];
    for (row, value) in out.iter_mut().enumerate() {
        *value = m[row][0] * p[0] + m[row][1] * p[1] + m[row][2] * p[2] + m[row][3];
    }
    out
}

fn invert_homogeneous(m: &[[f64; 4]; 4]) -> Option<[[f64; 4]; 4]> {
    let a = [
        [m[0][0], m[0][1], m[0][2]],
        [m[1][0], m[1][1], m[1][2]],
        [m[2][0], m[2][1], m[2][2]],
    ];
    let det = a[0][0] * (a[1][1] * a[2][2] - a[1][2] * a[2][1])
        - a[0][1] * (a[1][0] * a[2][2] - a[1][2] * a[2][0])
        + a[0][2] * (a[1][0] * a[2][1] - a[1][1] * a[2][0]);
    if det.abs() < f64::EPSILON {
        return None;
    }
    let inv_det = 1.0 / det;
    let mut inv = [[0.0; 4]; 4];
    inv[0][0] = (a[1][1] * a[2][2] - a[1][2] * a[2][1]) * inv_det;
    inv[0][1] = (a[0][2] * a[2][1] - a[0][1] * a[2][2]) * inv_det;
    inv[0][2] = (a[0][1] * a[1][2] - a[0][2] * a[1][1]) * inv_det;
    inv[1][0] = (a[1][2] * a[2][0] - a[1][0] * a[2][2]) * inv_det;
    inv[1][1] = (a[0][0] * a[2][2] - a[0][2] * a[2][0]) * inv_det;
    inv[1][2] = (a[0][2] * a[1][0] - a[0][0] * a[1][2]) * inv_det;
    inv[2][0] = (a[1][0] * a[2][1] - a[1][1] * a[2][0]) * inv_det;
    inv[2][1] = (a[0][1] * a[2][0] - a[0][0] * a[2][1]) * inv_det;
    inv[2][2] = (a[0][0] * a[1][1] - a[0][1] * a[1][0]) * inv_det;
    // Translation: -A^-1 * t
    for row in 0..3 {
        inv[row][3] = -(inv[row][0] * m[0][3] + inv[row][1] * m[1][3] + inv[row][2] * m[2][3]);
    }
    inv[3][3] = 1.0;
    Some(inv)
}

/// Immutable grid definition: affine, shape and brain mask
#[derive(Debug, Clone, PartialEq)]
pub struct GridSpace {
    affine: Affine,
    shape: GridShape,
    mask: Array3<bool>,
    /// Flat (C-order) indices of in-mask voxels, ascending
    mask_flat: Vec<usize>,
}

impl GridSpace {
    /// Create a grid space from an affine and a boolean mask.
    ///
    /// The mask defines the grid shape; it must have three positive
    /// dimensions and at least one `true` cell.
    pub fn new(affine: Affine, mask: Array3<bool>) -> CbmaResult<Self> {
        let shape = mask.dim();
        if shape.0 == 0 || shape.1 == 0 || shape.2 == 0 {
            return Err(CbmaError::input(
                "grid",
                format!("shape must have three positive dimensions, got {:?}", shape),
            ));
        }
        let mask = mask.as_standard_layout().to_owned();
        let mask_flat: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter_map(|(flat, &inside)| inside.then_some(flat))
            .collect();
        if mask_flat.is_empty() {
            return Err(CbmaError::input("grid", "mask contains no in-brain voxels"));
        }
        Ok(Self {
            affine,
            shape,
            mask,
            mask_flat,
        })
    }

    /// Grid where every cell is inside the mask
    pub fn full(shape: GridShape, affine: Affine) -> CbmaResult<Self> {
        Self::new(affine, Array3::from_elem(shape, true))
    }

    pub fn affine(&self) -> &Affine {
        &self.affine
    }

    pub fn shape(&self) -> GridShape {
        self.shape
    }

    /// Total number of grid cells (inside and outside the mask)
    pub fn len(&self) -> usize {
        self.shape.0 * self.shape.1 * self.shape.2
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mask(&self) -> &Array3<bool> {
        &self.mask
    }

    /// Flat indices of in-mask voxels in ascending (iteration) order
    pub fn mask_flat_indices(&self) -> &[usize] {
        &self.mask_flat
    }

    pub fn n_mask_voxels(&self) -> usize {
        self.mask_flat.len()
    }

    pub fn voxel_sizes(&self) -> [f64; 3] {
        self.affine.voxel_sizes()
    }

    pub fn flat_index(&self, ijk: Ijk) -> usize {
        (ijk[0] * self.shape.1 + ijk[1]) * self.shape.2 + ijk[2]
    }

    pub fn unflatten(&self, flat: usize) -> Ijk {
        let k = flat % self.shape.2;
        let j = (flat / self.shape.2) % self.shape.1;
        let i = flat / (self.shape.1 * self.shape.2);
        [i, j, k]
    }

    /// Convert a signed voxel position to an index if it lies inside the grid bounds
    pub fn bounded(&self, ijk: [i64; 3]) -> Option<Ijk> {
        let dims = [self.shape.0 as i64, self.shape.1 as i64, self.shape.2 as i64];
        if (0..3).all(|axis| ijk[axis] >= 0 && ijk[axis] < dims[axis]) {
            Some([ijk[0] as usize, ijk[1] as usize, ijk[2] as usize])
        } else {
            None
        }
    }

    /// Clamp a signed voxel position onto the grid bounds
    pub fn clamp(&self, ijk: [i64; 3]) -> Ijk {
        let dims = [self.shape.0 as i64, self.shape.1 as i64, self.shape.2 as i64];
        let mut out = [0usize; 3];
        for axis in 0..3 {
            out[axis] = ijk[axis].clamp(0, dims[axis] - 1) as usize;
        }
        out
    }

    pub fn in_mask(&self, ijk: Ijk) -> bool {
        self.mask[(ijk[0], ijk[1], ijk[2])]
    }

    pub fn in_mask_flat(&self, flat: usize) -> bool {
        self.mask_flat.binary_search(&flat).is_ok()
    }

    /// Voxel index → mm coordinate
    pub fn vox_to_mm(&self, ijk: Ijk) -> [f64; 3] {
        self.affine
            .apply([ijk[0] as f64, ijk[1] as f64, ijk[2] as f64])
    }

    /// mm coordinate → nearest voxel index (may lie outside the grid).
    ///
    /// Halves round away from zero. `None` for non-finite positions or ones
    /// beyond the `i64` range.
    pub fn mm_to_vox(&self, xyz: [f64; 3]) -> Option<[i64; 3]> {
        let ijk = self.affine.apply_inverse(xyz);
        if ijk.iter().any(|v| !v.is_finite() || v.abs() >= i64::MAX as f64) {
            return None;
        }
        Some(ijk.map(|v| v.round() as i64))
    }

    /// Fail with `ShapeMismatch` unless `dim` equals this grid's shape
    pub fn check_shape(&self, what: &str, dim: GridShape) -> CbmaResult<()> {
        if dim != self.shape {
            return Err(CbmaError::ShapeMismatch {
                what: what.to_string(),
                expected: self.shape,
                actual: dim,
            });
        }
        Ok(())
    }

    /// Dense array holding `inside` on in-mask cells and `outside` elsewhere
    pub fn masked_fill(&self, inside: f64, outside: f64) -> Array3<f64> {
        self.mask.mapv(|m| if m { inside } else { outside })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affine_round_trip() {
        let affine = Affine::from_voxel_size([2.0, 2.0, 2.0], [-90.0, -126.0, -72.0]).unwrap();
        let xyz = affine.apply([45.0, 63.0, 36.0]);
        assert_eq!(xyz, [0.0, 0.0, 0.0]);
        let ijk = affine.apply_inverse(xyz);
        assert!((ijk[0] - 45.0).abs() < 1e-9);
        assert!((ijk[1] - 63.0).abs() < 1e-9);
        assert!((ijk[2] - 36.0).abs() < 1e-9);
        assert_eq!(affine.voxel_sizes(), [2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_singular_affine_rejected() {
        let mut m = [[0.0; 4]; 4];
        m[3][3] = 1.0;
        assert!(Affine::new(m).is_err());
    }

    #[test]
    fn test_mm_to_vox_rounds_half_away_from_zero() {
        let grid = GridSpace::full((10, 10, 10), Affine::identity()).unwrap();
        assert_eq!(grid.mm_to_vox([2.5, 3.49, -0.5]), Some([3, 3, -1]));
    }

    #[test]
    fn test_mm_to_vox_rejects_non_finite() {
        let grid = GridSpace::full((10, 10, 10), Affine::identity()).unwrap();
        assert_eq!(grid.mm_to_vox([f64::NAN, 0.0, 0.0]), None);
        assert_eq!(grid.mm_to_vox([0.0, f64::INFINITY, 0.0]), None);
        assert_eq!(grid.mm_to_vox([0.0, 0.0, 1e300]), None);
    }

    #[test]
    fn test_flat_index_round_trip() {
        let grid = GridSpace::full((4, 5, 6), Affine::identity()).unwrap();
        for flat in 0..grid.len() {
            assert_eq!(grid.flat_index(grid.unflatten(flat)), flat);
        }
        assert_eq!(grid.flat_index([1, 2, 3]), (5 + 2) * 6 + 3);
    }

    #[test]
    fn test_mask_indices_ordered() {
        let mut mask = Array3::from_elem((3, 3, 3), false);
        mask[(2, 0, 0)] = true;
        mask[(0, 1, 2)] = true;
        let grid = GridSpace::new(Affine::identity(), mask).unwrap();
        assert_eq!(grid.n_mask_voxels(), 2);
        let flats = grid.mask_flat_indices();
        assert!(flats[0] < flats[1]);
        assert!(grid.in_mask([0, 1, 2]));
        assert!(!grid.in_mask([1, 1, 1]));
    }

    #[test]
    fn test_empty_mask_rejected() {
        let mask = Array3::from_elem((3, 3, 3), false);
        assert!(GridSpace::new(Affine::identity(), mask).is_err());
    }

    #[test]
    fn test_bounds_and_clamp() {
        let grid = GridSpace::full((10, 10, 10), Affine::identity()).unwrap();
        assert_eq!(grid.bounded([9, 0, 5]), Some([9, 0, 5]));
        assert_eq!(grid.bounded([10, 0, 5]), None);
        assert_eq!(grid.clamp([-3, 12, 4]), [0, 9, 4]);
    }
}
