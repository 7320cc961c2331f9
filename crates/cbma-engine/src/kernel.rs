// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*!
Kernel transformation - peak coordinates to per-study kernel maps.

Each reported peak deposits a kernel-shaped contribution centred on its
nearest grid cell. Contributions from the peaks of one study are merged with
an explicit [`PeakCombination`] rule. Kernel shapes are precomputed once as
[`KernelFootprint`]s (a list of voxel offsets and values), so transforming a
study only walks the footprint around each peak.

Maps are built sparsely (flat index → value, sorted by index) and only
densified on request; the estimator and the null generator fold the sparse
form directly.
*/

use std::borrow::Cow;
use std::f64::consts::{LN_2, PI};
use std::sync::Arc;

use ahash::AHashMap;
use cbma_config::KernelConfigSection;
use cbma_structures::{CbmaError, CbmaResult, GridSpace, Ijk, KernelMap, Study, StudyCollection};
use ndarray::Array3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Default between-template uncertainty (FWHM, mm) of the ALE kernel
pub const DEFAULT_TEMPLATE_UNCERTAINTY_MM: f64 = 5.7;
/// Default between-subject uncertainty (FWHM, mm) of the ALE kernel at n = 1
pub const DEFAULT_SUBJECT_UNCERTAINTY_MM: f64 = 11.6;

/// Closed set of kernel shapes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "kebab-case")]
pub enum KernelFamily {
    /// Binary sphere (MKDA/KDA)
    Sphere { radius_mm: f64, value: f64 },
    /// Fixed-bandwidth Gaussian, unit sum over a 3σ box
    Gaussian { fwhm_mm: f64 },
    /// ALE Gaussian whose width shrinks with the study's sample size
    SampleSizeGaussian {
        template_uncertainty_mm: f64,
        subject_uncertainty_mm: f64,
    },
}

impl KernelFamily {
    pub fn name(&self) -> &'static str {
        match self {
            KernelFamily::Sphere { .. } => "sphere",
            KernelFamily::Gaussian { .. } => "gaussian",
            KernelFamily::SampleSizeGaussian { .. } => "sample-size-gaussian",
        }
    }

    pub fn requires_sample_size(&self) -> bool {
        matches!(self, KernelFamily::SampleSizeGaussian { .. })
    }

    fn validate(&self) -> CbmaResult<()> {
        let positive = |option: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(CbmaError::config(option, format!("must be a positive finite number, got {}", v)))
            }
        };
        match *self {
            KernelFamily::Sphere { radius_mm, value } => {
                positive("kernel.radius_mm", radius_mm)?;
                positive("kernel.value", value)
            }
            KernelFamily::Gaussian { fwhm_mm } => positive("kernel.fwhm_mm", fwhm_mm),
            KernelFamily::SampleSizeGaussian {
                template_uncertainty_mm,
                subject_uncertainty_mm,
            } => {
                positive("kernel.template_uncertainty_mm", template_uncertainty_mm)?;
                positive("kernel.subject_uncertainty_mm", subject_uncertainty_mm)
            }
        }
    }
}

/// ALE kernel width for a study of `n` subjects.
///
/// `sqrt(u_t² + (u_s/√n)²)` where both uncertainties are first converted
/// from reported spread to FWHM by `sqrt(8 ln 2) / (2 sqrt(2/π))`.
pub fn ale_fwhm_mm(template_uncertainty_mm: f64, subject_uncertainty_mm: f64, n: u32) -> f64 {
    let scale = (8.0 * LN_2).sqrt() / (2.0 * (2.0 / PI).sqrt());
    let template = template_uncertainty_mm * scale;
    let subject = subject_uncertainty_mm * scale / (n.max(1) as f64).sqrt();
    (template * template + subject * subject).sqrt()
}

/// How contributions of several peaks of one study meet at a voxel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeakCombination {
    Max,
    /// `1 - (1 - a)(1 - b)`
    ProbabilisticUnion,
    Sum,
}

impl PeakCombination {
    #[inline]
    pub fn combine(self, current: f64, contribution: f64) -> f64 {
        match self {
            PeakCombination::Max => current.max(contribution),
            PeakCombination::ProbabilisticUnion => 1.0 - (1.0 - current) * (1.0 - contribution),
            PeakCombination::Sum => current + contribution,
        }
    }
}

/// What to do with a peak whose nearest voxel is outside the mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutOfMaskPolicy {
    /// Fail with an input error naming the study and coordinate
    #[default]
    Reject,
    /// Skip the peak with a warning
    Drop,
    /// Clamp to the grid bounds; skip with a warning if still outside the mask
    Clip,
}

/// Complete kernel configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    pub family: KernelFamily,
    pub peak_combination: PeakCombination,
    #[serde(default)]
    pub out_of_mask: OutOfMaskPolicy,
}

impl KernelConfig {
    pub fn new(family: KernelFamily, peak_combination: PeakCombination) -> Self {
        Self {
            family,
            peak_combination,
            out_of_mask: OutOfMaskPolicy::Reject,
        }
    }

    /// Multilevel kernel density analysis: binary sphere of value 1, max over peaks
    pub fn mkda(radius_mm: f64) -> Self {
        Self::new(
            KernelFamily::Sphere {
                radius_mm,
                value: 1.0,
            },
            PeakCombination::Max,
        )
    }

    /// Kernel density analysis: binary sphere, peaks summed
    pub fn kda(radius_mm: f64) -> Self {
        Self::new(
            KernelFamily::Sphere {
                radius_mm,
                value: 1.0,
            },
            PeakCombination::Sum,
        )
    }

    /// Activation likelihood estimation with default uncertainties.
    ///
    /// The modelled-activation map keeps the voxel-wise maximum over a
    /// study's peaks.
    pub fn ale() -> Self {
        Self::new(
            KernelFamily::SampleSizeGaussian {
                template_uncertainty_mm: DEFAULT_TEMPLATE_UNCERTAINTY_MM,
                subject_uncertainty_mm: DEFAULT_SUBJECT_UNCERTAINTY_MM,
            },
            PeakCombination::Max,
        )
    }

    pub fn with_out_of_mask(mut self, policy: OutOfMaskPolicy) -> Self {
        self.out_of_mask = policy;
        self
    }

    pub fn validate(&self) -> CbmaResult<()> {
        self.family.validate()
    }
}

impl TryFrom<&KernelConfigSection> for KernelConfig {
    type Error = CbmaError;

    fn try_from(section: &KernelConfigSection) -> CbmaResult<Self> {
        let family = match section.family.as_str() {
            "sphere" => KernelFamily::Sphere {
                radius_mm: section.radius_mm,
                value: section.value,
            },
            "gaussian" => KernelFamily::Gaussian {
                fwhm_mm: section.fwhm_mm,
            },
            "sample-size-gaussian" => KernelFamily::SampleSizeGaussian {
                template_uncertainty_mm: section.template_uncertainty_mm,
                subject_uncertainty_mm: section.subject_uncertainty_mm,
            },
            other => {
                return Err(CbmaError::config("kernel.family", format!("unknown kernel family '{}'", other)))
            }
        };
        let peak_combination = match section.peak_combination.as_str() {
            "max" => PeakCombination::Max,
            "probabilistic-union" => PeakCombination::ProbabilisticUnion,
            "sum" => PeakCombination::Sum,
            other => {
                return Err(CbmaError::config(
                    "kernel.peak_combination",
                    format!("unknown peak combination '{}'", other),
                ))
            }
        };
        let out_of_mask = match section.out_of_mask.as_str() {
            "reject" => OutOfMaskPolicy::Reject,
            "drop" => OutOfMaskPolicy::Drop,
            "clip" => OutOfMaskPolicy::Clip,
            other => {
                return Err(CbmaError::config(
                    "kernel.out_of_mask",
                    format!("unknown out-of-mask policy '{}'", other),
                ))
            }
        };
        let config = KernelConfig {
            family,
            peak_combination,
            out_of_mask,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Precomputed kernel shape: voxel offsets from the centre and their values
#[derive(Debug, Clone, PartialEq)]
pub struct KernelFootprint {
    offsets: Vec<([i64; 3], f64)>,
}

impl KernelFootprint {
    /// All voxels whose centre lies within `radius_mm` of the peak
    pub fn sphere(radius_mm: f64, value: f64, voxel_sizes: [f64; 3]) -> Self {
        let extent = voxel_sizes.map(|vs| (radius_mm / vs).floor() as i64);
        let r2 = radius_mm * radius_mm + 1e-9;
        let mut offsets = Vec::new();
        for di in -extent[0]..=extent[0] {
            for dj in -extent[1]..=extent[1] {
                for dk in -extent[2]..=extent[2] {
                    let d2 = squared_distance_mm([di, dj, dk], voxel_sizes);
                    if d2 <= r2 {
                        offsets.push(([di, dj, dk], value));
                    }
                }
            }
        }
        Self { offsets }
    }

    /// Gaussian with the given FWHM over a 3σ box, normalized to unit sum
    pub fn gaussian(fwhm_mm: f64, voxel_sizes: [f64; 3]) -> Self {
        let sigma = fwhm_mm / (8.0 * LN_2).sqrt();
        let extent = voxel_sizes.map(|vs| (3.0 * sigma / vs).ceil() as i64);
        let mut offsets = Vec::new();
        let mut total = 0.0;
        for di in -extent[0]..=extent[0] {
            for dj in -extent[1]..=extent[1] {
                for dk in -extent[2]..=extent[2] {
                    let d2 = squared_distance_mm([di, dj, dk], voxel_sizes);
                    let value = (-0.5 * d2 / (sigma * sigma)).exp();
                    total += value;
                    offsets.push(([di, dj, dk], value));
                }
            }
        }
        for (_, value) in offsets.iter_mut() {
            *value /= total;
        }
        Self { offsets }
    }

    /// Footprint for a kernel family; sample-size kernels need `sample_size`
    pub fn for_family(family: &KernelFamily, voxel_sizes: [f64; 3], sample_size: Option<u32>) -> Option<Self> {
        match *family {
            KernelFamily::Sphere { radius_mm, value } => Some(Self::sphere(radius_mm, value, voxel_sizes)),
            KernelFamily::Gaussian { fwhm_mm } => Some(Self::gaussian(fwhm_mm, voxel_sizes)),
            KernelFamily::SampleSizeGaussian {
                template_uncertainty_mm,
                subject_uncertainty_mm,
            } => sample_size.map(|n| {
                Self::gaussian(
                    ale_fwhm_mm(template_uncertainty_mm, subject_uncertainty_mm, n),
                    voxel_sizes,
                )
            }),
        }
    }

    pub fn offsets(&self) -> &[([i64; 3], f64)] {
        &self.offsets
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Largest value anywhere in the footprint
    pub fn max_value(&self) -> f64 {
        self.offsets.iter().map(|(_, v)| *v).fold(0.0, f64::max)
    }

    /// Value at the centre voxel
    pub fn peak_value(&self) -> f64 {
        self.offsets
            .iter()
            .find(|(offset, _)| *offset == [0, 0, 0])
            .map(|(_, v)| *v)
            .unwrap_or(0.0)
    }
}

fn squared_distance_mm(offset: [i64; 3], voxel_sizes: [f64; 3]) -> f64 {
    (0..3)
        .map(|axis| {
            let d = offset[axis] as f64 * voxel_sizes[axis];
            d * d
        })
        .sum()
}

/// A peak resolved onto the grid
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedPeak {
    pub ijk: Ijk,
    pub weight: f64,
}

/// Kernel map stored as `(flat index, value)` pairs sorted by index.
///
/// Only in-mask voxels with a contribution are present.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseKernelMap {
    study_id: String,
    sample_size: Option<u32>,
    entries: Vec<(usize, f64)>,
}

impl SparseKernelMap {
    pub fn study_id(&self) -> &str {
        &self.study_id
    }

    pub fn sample_size(&self) -> Option<u32> {
        self.sample_size
    }

    pub fn entries(&self) -> &[(usize, f64)] {
        &self.entries
    }

    pub fn nnz(&self) -> usize {
        self.entries.len()
    }

    pub fn max_value(&self) -> f64 {
        self.entries.iter().map(|&(_, v)| v).fold(0.0, f64::max)
    }

    pub fn to_dense(&self, grid: &GridSpace) -> KernelMap {
        let mut data = Array3::zeros(grid.shape());
        if let Some(slice) = data.as_slice_mut() {
            for &(flat, value) in &self.entries {
                slice[flat] = value;
            }
        }
        KernelMap::new(self.study_id.clone(), self.sample_size, data)
    }
}

/// Converts studies into kernel maps over a fixed grid
#[derive(Debug, Clone)]
pub struct KernelTransformer {
    config: KernelConfig,
    grid: Arc<GridSpace>,
    fixed: Option<Arc<KernelFootprint>>,
    by_sample_size: AHashMap<u32, Arc<KernelFootprint>>,
}

impl KernelTransformer {
    /// # Errors
    /// `Config` if the kernel parameters are invalid.
    pub fn new(config: KernelConfig, grid: Arc<GridSpace>) -> CbmaResult<Self> {
        config.validate()?;
        let fixed = KernelFootprint::for_family(&config.family, grid.voxel_sizes(), None).map(Arc::new);
        if let Some(footprint) = &fixed {
            debug!(
                "Kernel '{}' footprint: {} voxels",
                config.family.name(),
                footprint.len()
            );
        }
        Ok(Self {
            config,
            grid,
            fixed,
            by_sample_size: AHashMap::new(),
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn grid(&self) -> &Arc<GridSpace> {
        &self.grid
    }

    /// Precompute footprints for every sample size in the collection.
    ///
    /// # Errors
    /// `Input` naming the first study without a sample size when the kernel needs one.
    pub fn prepare(&mut self, studies: &StudyCollection) -> CbmaResult<()> {
        if !self.config.family.requires_sample_size() {
            return Ok(());
        }
        for study in studies {
            let n = study.require_sample_size()?;
            if !self.by_sample_size.contains_key(&n) {
                if let Some(footprint) =
                    KernelFootprint::for_family(&self.config.family, self.grid.voxel_sizes(), Some(n))
                {
                    self.by_sample_size.insert(n, Arc::new(footprint));
                }
            }
        }
        Ok(())
    }

    fn footprint(&self, study_id: &str, sample_size: Option<u32>) -> CbmaResult<Cow<'_, KernelFootprint>> {
        if let Some(fixed) = &self.fixed {
            return Ok(Cow::Borrowed(fixed.as_ref()));
        }
        let n = sample_size.ok_or_else(|| {
            CbmaError::input(
                format!("study '{}'", study_id),
                "sample size is required by the configured kernel or weighting",
            )
        })?;
        if let Some(cached) = self.by_sample_size.get(&n) {
            return Ok(Cow::Borrowed(cached.as_ref()));
        }
        KernelFootprint::for_family(&self.config.family, self.grid.voxel_sizes(), Some(n))
            .map(Cow::Owned)
            .ok_or_else(|| CbmaError::input(format!("study '{}'", study_id), "no kernel for sample size"))
    }

    /// Map a study's coordinates onto in-mask voxels, applying the out-of-mask policy.
    ///
    /// # Errors
    /// `Input` naming the study for a non-finite position or invalid weight,
    /// a rejected peak, or when no peak survives.
    pub fn resolve_peaks(&self, study: &Study) -> CbmaResult<Vec<WeightedPeak>> {
        study.validate()?;
        let grid = &self.grid;
        let mut peaks = Vec::with_capacity(study.coordinates().len());
        for (idx, coord) in study.coordinates().iter().enumerate() {
            let vox = grid.mm_to_vox(coord.xyz);
            let inside = vox
                .and_then(|v| grid.bounded(v))
                .filter(|&ijk| grid.in_mask(ijk));
            let resolved = match (inside, self.config.out_of_mask) {
                (Some(ijk), _) => Some(ijk),
                (None, OutOfMaskPolicy::Reject) => {
                    return Err(CbmaError::input(
                        format!("study '{}'", study.id()),
                        format!("coordinate {} at {:?} mm lies outside the mask", idx, coord.xyz),
                    ))
                }
                (None, OutOfMaskPolicy::Drop) => {
                    warn!(
                        "Dropping coordinate {} of study '{}' at {:?} mm: outside the mask",
                        idx,
                        study.id(),
                        coord.xyz
                    );
                    None
                }
                (None, OutOfMaskPolicy::Clip) => {
                    match vox.map(|v| grid.clamp(v)).filter(|&c| grid.in_mask(c)) {
                        Some(clipped) => {
                            debug!(
                                "Clipped coordinate {} of study '{}' from {:?} mm to voxel {:?}",
                                idx,
                                study.id(),
                                coord.xyz,
                                clipped
                            );
                            Some(clipped)
                        }
                        None => {
                            warn!(
                                "Dropping coordinate {} of study '{}' at {:?} mm: outside the mask after clipping",
                                idx,
                                study.id(),
                                coord.xyz
                            );
                            None
                        }
                    }
                }
            };
            if let Some(ijk) = resolved {
                peaks.push(WeightedPeak {
                    ijk,
                    weight: coord.weight_or_one(),
                });
            }
        }
        if peaks.is_empty() {
            return Err(CbmaError::input(
                format!("study '{}'", study.id()),
                "no coordinates inside the mask",
            ));
        }
        Ok(peaks)
    }

    /// Largest value a study's map can take wherever peaks of these weights land.
    ///
    /// `None` when contributions above 1 meet under probabilistic union.
    pub fn value_bound(&self, study_id: &str, sample_size: Option<u32>, weights: &[f64]) -> CbmaResult<Option<f64>> {
        let kernel_max = self.footprint(study_id, sample_size)?.max_value();
        let largest = weights.iter().fold(0.0, |acc: f64, &w| acc.max(kernel_max * w));
        Ok(match self.config.peak_combination {
            PeakCombination::Max => Some(largest),
            PeakCombination::Sum => Some(kernel_max * weights.iter().sum::<f64>()),
            PeakCombination::ProbabilisticUnion => (largest <= 1.0).then_some(1.0),
        })
    }

    /// Deposit kernels at already-resolved peaks
    pub fn transform_peaks(
        &self,
        study_id: &str,
        sample_size: Option<u32>,
        peaks: &[WeightedPeak],
    ) -> CbmaResult<SparseKernelMap> {
        let footprint = self.footprint(study_id, sample_size)?;
        let grid = &self.grid;
        let mask = grid.mask();
        let combination = self.config.peak_combination;

        let mut values: AHashMap<usize, f64> = AHashMap::with_capacity(footprint.len() * peaks.len());
        for peak in peaks {
            let centre = peak.ijk.map(|c| c as i64);
            for &(offset, kernel_value) in footprint.offsets() {
                let target = [
                    centre[0] + offset[0],
                    centre[1] + offset[1],
                    centre[2] + offset[2],
                ];
                let Some(ijk) = grid.bounded(target) else {
                    continue;
                };
                if !mask[(ijk[0], ijk[1], ijk[2])] {
                    continue;
                }
                let slot = values.entry(grid.flat_index(ijk)).or_insert(0.0);
                *slot = combination.combine(*slot, kernel_value * peak.weight);
            }
        }

        let mut entries: Vec<(usize, f64)> = values.into_iter().collect();
        entries.sort_unstable_by_key(|&(flat, _)| flat);
        Ok(SparseKernelMap {
            study_id: study_id.to_string(),
            sample_size,
            entries,
        })
    }

    pub fn transform_sparse(&self, study: &Study) -> CbmaResult<SparseKernelMap> {
        let peaks = self.resolve_peaks(study)?;
        self.transform_peaks(study.id(), study.sample_size(), &peaks)
    }

    /// Dense kernel map of one study
    pub fn transform(&self, study: &Study) -> CbmaResult<KernelMap> {
        Ok(self.transform_sparse(study)?.to_dense(&self.grid))
    }

    /// Sparse kernel maps of every study, in collection order
    pub fn transform_all(&self, studies: &StudyCollection) -> CbmaResult<Vec<SparseKernelMap>> {
        studies
            .studies()
            .par_iter()
            .map(|study| self.transform_sparse(study))
            .collect()
    }
}

/// Kernel map of one study. Pure function of its inputs.
///
/// # Errors
/// `Config` for invalid kernel parameters; `Input` naming the study for a
/// missing sample size, a rejected peak or no surviving peaks.
pub fn transform(study: &Study, grid: &Arc<GridSpace>, config: &KernelConfig) -> CbmaResult<KernelMap> {
    KernelTransformer::new(*config, Arc::clone(grid))?.transform(study)
}
