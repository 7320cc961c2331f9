// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*!
Connected-component labelling of supra-threshold voxels.

A voxel belongs to a cluster when it lies inside the mask and its value is
strictly greater than the primary threshold. Components are grown by
region-growing from seeds taken in flat (C) order, so labels are numbered
by the first voxel of each cluster in iteration order.
*/

use cbma_structures::{CbmaError, CbmaResult, GridSpace, Ijk};
use ndarray::Array3;
use serde::{Deserialize, Serialize};

/// Neighbourhood used to join voxels into clusters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Connectivity {
    /// Shared faces (6 neighbours)
    Faces,
    /// Shared faces or edges (18 neighbours)
    Edges,
    /// Shared faces, edges or corners (26 neighbours)
    Vertices,
}

impl Connectivity {
    pub fn n_neighbours(self) -> u8 {
        match self {
            Connectivity::Faces => 6,
            Connectivity::Edges => 18,
            Connectivity::Vertices => 26,
        }
    }

    /// Offsets of all neighbours under this connectivity
    pub fn neighbour_offsets(self) -> Vec<[i64; 3]> {
        let max_nonzero = match self {
            Connectivity::Faces => 1,
            Connectivity::Edges => 2,
            Connectivity::Vertices => 3,
        };
        let mut offsets = Vec::with_capacity(self.n_neighbours() as usize);
        for di in -1..=1i64 {
            for dj in -1..=1i64 {
                for dk in -1..=1i64 {
                    let nonzero = [di, dj, dk].iter().filter(|&&d| d != 0).count();
                    if nonzero > 0 && nonzero <= max_nonzero {
                        offsets.push([di, dj, dk]);
                    }
                }
            }
        }
        offsets
    }
}

impl TryFrom<u8> for Connectivity {
    type Error = CbmaError;

    fn try_from(value: u8) -> CbmaResult<Self> {
        match value {
            6 => Ok(Connectivity::Faces),
            18 => Ok(Connectivity::Edges),
            26 => Ok(Connectivity::Vertices),
            other => Err(CbmaError::config(
                "correction.connectivity",
                format!("must be 6, 18 or 26, got {}", other),
            )),
        }
    }
}

impl From<Connectivity> for u8 {
    fn from(connectivity: Connectivity) -> Self {
        connectivity.n_neighbours()
    }
}

/// One connected component above the primary threshold
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    /// 1-based label, in order of the cluster's first voxel
    pub label: u32,
    pub size: usize,
    /// Sum of `value - threshold` over member voxels
    pub mass: f64,
    pub peak: Ijk,
    pub peak_value: f64,
    /// Flat indices of member voxels, ascending
    pub voxels: Vec<usize>,
}

/// Label volume (0 = background) plus the clusters it contains
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterLabels {
    pub labels: Array3<u32>,
    pub clusters: Vec<Cluster>,
}

/// Find all clusters of `values` (flat, C order, grid-sized) above `threshold`
pub fn find_clusters(values: &[f64], grid: &GridSpace, threshold: f64, connectivity: Connectivity) -> Vec<Cluster> {
    let offsets = connectivity.neighbour_offsets();
    let mask = grid.mask();
    let supra = |flat: usize| {
        let v = values[flat];
        v > threshold
    };

    let mut visited = vec![false; grid.len()];
    let mut clusters = Vec::new();
    let mut stack: Vec<usize> = Vec::new();

    for &seed in grid.mask_flat_indices() {
        if visited[seed] || !supra(seed) {
            continue;
        }

        visited[seed] = true;
        stack.push(seed);
        let mut voxels = Vec::new();

        while let Some(current) = stack.pop() {
            voxels.push(current);
            let ijk = grid.unflatten(current);
            for offset in &offsets {
                let target = [
                    ijk[0] as i64 + offset[0],
                    ijk[1] as i64 + offset[1],
                    ijk[2] as i64 + offset[2],
                ];
                let Some(neighbour) = grid.bounded(target) else {
                    continue;
                };
                if !mask[(neighbour[0], neighbour[1], neighbour[2])] {
                    continue;
                }
                let flat = grid.flat_index(neighbour);
                if !visited[flat] && supra(flat) {
                    visited[flat] = true;
                    stack.push(flat);
                }
            }
        }

        voxels.sort_unstable();
        let mut mass = 0.0;
        let mut peak = (voxels[0], f64::NEG_INFINITY);
        for &flat in &voxels {
            let v = values[flat];
            mass += v - threshold;
            if v > peak.1 {
                peak = (flat, v);
            }
        }
        clusters.push(Cluster {
            label: clusters.len() as u32 + 1,
            size: voxels.len(),
            mass,
            peak: grid.unflatten(peak.0),
            peak_value: peak.1,
            voxels,
        });
    }

    clusters
}

/// Clusters together with a label volume
pub fn label_clusters(values: &[f64], grid: &GridSpace, threshold: f64, connectivity: Connectivity) -> ClusterLabels {
    let clusters = find_clusters(values, grid, threshold, connectivity);
    let mut labels = Array3::<u32>::zeros(grid.shape());
    if let Some(slice) = labels.as_slice_mut() {
        for cluster in &clusters {
            for &flat in &cluster.voxels {
                slice[flat] = cluster.label;
            }
        }
    }
    ClusterLabels { labels, clusters }
}

/// Largest cluster size and largest cluster mass (0 when nothing exceeds the threshold)
pub fn max_cluster_metrics(values: &[f64], grid: &GridSpace, threshold: f64, connectivity: Connectivity) -> (usize, f64) {
    find_clusters(values, grid, threshold, connectivity)
        .iter()
        .fold((0, 0.0), |(size, mass), c| (size.max(c.size), f64::max(mass, c.mass)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbma_structures::Affine;

    fn grid() -> GridSpace {
        GridSpace::full((5, 5, 5), Affine::identity()).unwrap()
    }

    fn values(grid: &GridSpace, cells: &[([usize; 3], f64)]) -> Vec<f64> {
        let mut v = vec![0.0; grid.len()];
        for &(ijk, x) in cells {
            v[grid.flat_index(ijk)] = x;
        }
        v
    }

    #[test]
    fn test_neighbour_counts() {
        assert_eq!(Connectivity::Faces.neighbour_offsets().len(), 6);
        assert_eq!(Connectivity::Edges.neighbour_offsets().len(), 18);
        assert_eq!(Connectivity::Vertices.neighbour_offsets().len(), 26);
        assert!(Connectivity::try_from(8).is_err());
    }

    #[test]
    fn test_diagonal_voxels_depend_on_connectivity() {
        let grid = grid();
        // Corner-touching pair and an edge-touching voxel
        let v = values(&grid, &[([1, 1, 1], 2.0), ([2, 2, 2], 3.0), ([1, 2, 1], 0.5)]);

        let faces = find_clusters(&v, &grid, 1.0, Connectivity::Faces);
        assert_eq!(faces.len(), 2);

        let vertices = find_clusters(&v, &grid, 1.0, Connectivity::Vertices);
        assert_eq!(vertices.len(), 1);
        assert_eq!(vertices[0].size, 2);
        assert_eq!(vertices[0].peak, [2, 2, 2]);
        assert!((vertices[0].mass - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_threshold_is_strict() {
        let grid = grid();
        let v = values(&grid, &[([0, 0, 0], 1.0), ([0, 0, 1], 1.5)]);
        let clusters = find_clusters(&v, &grid, 1.0, Connectivity::Faces);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].voxels, vec![grid.flat_index([0, 0, 1])]);
    }

    #[test]
    fn test_label_volume_and_metrics() {
        let grid = grid();
        let v = values(
            &grid,
            &[([0, 0, 0], 2.0), ([0, 0, 1], 2.0), ([0, 0, 2], 2.0), ([4, 4, 4], 5.0)],
        );
        let labelled = label_clusters(&v, &grid, 1.0, Connectivity::Faces);
        assert_eq!(labelled.clusters.len(), 2);
        assert_eq!(labelled.labels[(0, 0, 1)], 1);
        assert_eq!(labelled.labels[(4, 4, 4)], 2);
        assert_eq!(labelled.labels[(2, 2, 2)], 0);

        let (size, mass) = max_cluster_metrics(&v, &grid, 1.0, Connectivity::Faces);
        assert_eq!(size, 3);
        assert!((mass - 4.0).abs() < 1e-12);

        assert_eq!(max_cluster_metrics(&v, &grid, 10.0, Connectivity::Faces), (0, 0.0));
    }

    #[test]
    fn test_masked_voxels_break_clusters() {
        let mut mask = Array3::from_elem((1, 1, 3), true);
        mask[(0, 0, 1)] = false;
        let grid = GridSpace::new(Affine::identity(), mask).unwrap();
        let v = vec![2.0, 2.0, 2.0];
        assert_eq!(find_clusters(&v, &grid, 1.0, Connectivity::Vertices).len(), 2);
    }
}
