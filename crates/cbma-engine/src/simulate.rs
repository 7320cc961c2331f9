// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*!
Synthetic coordinate datasets with known ground truth.

A dataset is built from a set of ground-truth foci. A fraction of the studies
(`foci_percentage`, rounded) reports a jittered instance of every focus, drawn
from a Gaussian probability map of the given FWHM centred on it and restricted
to the mask. Every study may also report uniformly placed noise foci; a study
with no signal always gets at least one. The whole draw is a pure function of
the grid and the configuration, including its seed.
*/

use std::sync::Arc;

use cbma_structures::{CbmaError, CbmaResult, Coordinate, GridSpace, Ijk, Study, StudyCollection};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::kernel::KernelFootprint;

/// Where the true effects are
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroundTruthFoci {
    /// Draw this many mask voxels (with replacement, duplicates merged)
    Count(usize),
    /// Explicit positions in millimetres
    Coordinates(Vec<[f64; 3]>),
}

/// How study sample sizes are assigned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SampleSizes {
    Fixed(u32),
    PerStudy(Vec<u32>),
    /// Uniform integer in `low..high`
    Range { low: u32, high: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub ground_truth: GroundTruthFoci,
    /// Fraction of studies in [0, 1] that report each ground-truth focus
    pub foci_percentage: f64,
    /// Spread of reported signal foci around the true focus
    pub fwhm_mm: f64,
    pub n_studies: usize,
    /// Uniform noise foci added to every study
    pub n_noise_foci: usize,
    pub sample_sizes: SampleSizes,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            ground_truth: GroundTruthFoci::Count(1),
            foci_percentage: 1.0,
            fwhm_mm: 10.0,
            n_studies: 30,
            n_noise_foci: 0,
            sample_sizes: SampleSizes::Fixed(30),
            seed: 0,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> CbmaResult<()> {
        if self.n_studies == 0 {
            return Err(CbmaError::config("simulation.n_studies", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.foci_percentage) {
            return Err(CbmaError::config(
                "simulation.foci_percentage",
                format!("must lie in [0, 1], got {}", self.foci_percentage),
            ));
        }
        if !(self.fwhm_mm.is_finite() && self.fwhm_mm > 0.0) {
            return Err(CbmaError::config("simulation.fwhm_mm", "must be a positive finite number"));
        }
        match &self.sample_sizes {
            SampleSizes::Fixed(0) => Err(CbmaError::config("simulation.sample_sizes", "must be positive")),
            SampleSizes::PerStudy(sizes) if sizes.len() != self.n_studies => Err(CbmaError::config(
                "simulation.sample_sizes",
                format!("{} sizes given for {} studies", sizes.len(), self.n_studies),
            )),
            SampleSizes::PerStudy(sizes) if sizes.contains(&0) => {
                Err(CbmaError::config("simulation.sample_sizes", "must be positive"))
            }
            SampleSizes::Range { low, high } if *low == 0 || high <= low => Err(CbmaError::config(
                "simulation.sample_sizes",
                format!("range {}..{} must be non-empty and positive", low, high),
            )),
            _ => Ok(()),
        }
    }
}

/// Simulated studies plus the foci they were generated from
#[derive(Debug, Clone)]
pub struct SimulatedDataset {
    pub studies: StudyCollection,
    pub ground_truth_ijk: Vec<Ijk>,
    pub ground_truth_mm: Vec<[f64; 3]>,
}

fn ground_truth_voxels(grid: &GridSpace, truth: &GroundTruthFoci, rng: &mut StdRng) -> CbmaResult<Vec<Ijk>> {
    match truth {
        GroundTruthFoci::Count(count) => {
            let mask = grid.mask_flat_indices();
            let mut flats: Vec<usize> = (0..*count).map(|_| mask[rng.gen_range(0..mask.len())]).collect();
            flats.sort_unstable();
            flats.dedup();
            Ok(flats.into_iter().map(|flat| grid.unflatten(flat)).collect())
        }
        GroundTruthFoci::Coordinates(coords) => coords
            .iter()
            .enumerate()
            .map(|(idx, &xyz)| {
                grid.mm_to_vox(xyz)
                    .and_then(|vox| grid.bounded(vox))
                    .filter(|&ijk| grid.in_mask(ijk))
                    .ok_or_else(|| {
                        CbmaError::input(
                            format!("ground-truth focus {}", idx),
                            format!("{:?} mm lies outside the mask", xyz),
                        )
                    })
            })
            .collect(),
    }
}

/// In-mask voxels around `centre` weighted by a Gaussian of the given FWHM
fn focus_sampler(grid: &GridSpace, centre: Ijk, kernel: &KernelFootprint) -> CbmaResult<(Vec<usize>, WeightedIndex<f64>)> {
    let mut voxels = Vec::new();
    let mut weights = Vec::new();
    for &(offset, value) in kernel.offsets() {
        let target = [
            centre[0] as i64 + offset[0],
            centre[1] as i64 + offset[1],
            centre[2] as i64 + offset[2],
        ];
        if let Some(ijk) = grid.bounded(target).filter(|&ijk| grid.in_mask(ijk)) {
            voxels.push(grid.flat_index(ijk));
            weights.push(value);
        }
    }
    let dist = WeightedIndex::new(weights).map_err(|e| {
        CbmaError::input(
            format!("ground-truth focus {:?}", centre),
            format!("no probability mass inside the mask: {}", e),
        )
    })?;
    Ok((voxels, dist))
}

/// Generate a coordinate dataset on `grid`.
///
/// # Errors
/// `Config` for invalid settings, `Input` for explicit foci outside the mask.
pub fn simulate_coordinate_dataset(grid: &Arc<GridSpace>, config: &SimulationConfig) -> CbmaResult<SimulatedDataset> {
    config.validate()?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let n_studies = config.n_studies;

    let sample_sizes: Vec<u32> = match &config.sample_sizes {
        SampleSizes::Fixed(n) => vec![*n; n_studies],
        SampleSizes::PerStudy(sizes) => sizes.clone(),
        SampleSizes::Range { low, high } => (0..n_studies).map(|_| rng.gen_range(*low..*high)).collect(),
    };

    let truth = ground_truth_voxels(grid, &config.ground_truth, &mut rng)?;
    let kernel = KernelFootprint::gaussian(config.fwhm_mm, grid.voxel_sizes());

    let signal_studies = ((config.foci_percentage * n_studies as f64).round() as usize).min(n_studies);
    // signal[focus][study]
    let mut signal: Vec<Vec<usize>> = Vec::with_capacity(truth.len());
    for &centre in &truth {
        let (voxels, dist) = focus_sampler(grid, centre, &kernel)?;
        signal.push((0..signal_studies).map(|_| voxels[dist.sample(&mut rng)]).collect());
    }

    let mask = grid.mask_flat_indices();
    let mut studies = Vec::with_capacity(n_studies);
    for (study_idx, &sample_size) in sample_sizes.iter().enumerate() {
        let mut foci: Vec<usize> = if study_idx < signal_studies {
            signal.iter().map(|per_study| per_study[study_idx]).collect()
        } else {
            Vec::new()
        };
        let n_noise = if foci.is_empty() {
            config.n_noise_foci.max(1)
        } else {
            config.n_noise_foci
        };
        if n_noise > 0 {
            foci.extend((0..n_noise).map(|_| mask[rng.gen_range(0..mask.len())]));
            foci.sort_unstable();
            foci.dedup();
        }

        let coordinates = foci
            .iter()
            .map(|&flat| {
                let [x, y, z] = grid.vox_to_mm(grid.unflatten(flat));
                Coordinate::new(x, y, z)
            })
            .collect();
        studies.push(Study::new(format!("study-{:04}", study_idx), coordinates).with_sample_size(sample_size));
    }

    debug!(
        "Simulated {} studies around {} ground-truth foci ({} with signal)",
        n_studies,
        truth.len(),
        signal_studies
    );

    Ok(SimulatedDataset {
        studies: StudyCollection::new(studies)?,
        ground_truth_mm: truth.iter().map(|&ijk| grid.vox_to_mm(ijk)).collect(),
        ground_truth_ijk: truth,
    })
}
