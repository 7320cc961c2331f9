// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios on a 10×10×10 grid with three identical studies.

use std::sync::Arc;

use cbma_engine::*;

fn grid() -> Arc<GridSpace> {
    Arc::new(GridSpace::full((10, 10, 10), Affine::identity()).unwrap())
}

fn three_studies_at_centre() -> StudyCollection {
    StudyCollection::new(
        ["study-a", "study-b", "study-c"]
            .iter()
            .map(|id| Study::new(*id, vec![Coordinate::new(5.0, 5.0, 5.0)]).with_sample_size(20))
            .collect(),
    )
    .unwrap()
}

#[test]
fn test_summary_peaks_at_shared_focus() {
    let grid = grid();
    let transformer = KernelTransformer::new(KernelConfig::mkda(1.0), Arc::clone(&grid)).unwrap();
    let maps: Vec<KernelMap> = three_studies_at_centre()
        .iter()
        .map(|s| transformer.transform(s).unwrap())
        .collect();

    let summary = estimate(&maps, &grid, CombinationRule::Max).unwrap();
    assert_eq!(summary.max_value(), 1.0);
    assert_eq!(summary.value_at([5, 5, 5]), Some(summary.max_value()));

    for ((i, j, k), &v) in summary.data().indexed_iter() {
        let d2 = [i, j, k]
            .iter()
            .map(|&c| (c as f64 - 5.0).powi(2))
            .sum::<f64>();
        if d2 > 1.0 {
            assert_eq!(v, 0.0, "voxel {:?} beyond radius 1", (i, j, k));
        } else {
            assert_eq!(v, 1.0);
        }
    }
}

#[test]
fn test_null_has_requested_length_sorted_and_non_negative() {
    let null = generate(
        &three_studies_at_centre(),
        &grid(),
        &KernelConfig::mkda(1.0),
        CombinationRule::Max,
        100,
        42,
    )
    .unwrap();
    let empirical = null.as_empirical().unwrap();
    let maxima = empirical.max_statistic();
    assert_eq!(maxima.len(), 100);
    assert!(maxima.windows(2).all(|w| w[0] <= w[1]));
    assert!(maxima.iter().all(|&v| v >= 0.0));
    assert_eq!(empirical.seed(), 42);
}

#[test]
fn test_fixed_seed_is_bit_identical_and_seeds_differ() {
    let studies = three_studies_at_centre();
    let grid = grid();
    let kernel = KernelConfig::mkda(2.0);
    let rule = CombinationRule::WeightedSum(StudyWeighting::Uniform);

    let a = generate(&studies, &grid, &kernel, rule, 50, 7).unwrap();
    let b = generate(&studies, &grid, &kernel, rule, 50, 7).unwrap();
    assert_eq!(a, b);

    let c = generate(&studies, &grid, &kernel, rule, 50, 8).unwrap();
    let records_a = a.as_empirical().unwrap().records();
    let records_c = c.as_empirical().unwrap().records();
    assert_ne!(records_a, records_c);
}

#[test]
fn test_voxel_fwe_significance_follows_null_percentile() {
    let studies = three_studies_at_centre();
    let grid = grid();
    let kernel = KernelConfig::mkda(1.0);

    // Max of binary spheres: every null maximum equals the observed 1.0
    let null = generate(&studies, &grid, &kernel, CombinationRule::Max, 100, 42).unwrap();
    let maps: Vec<KernelMap> = studies
        .iter()
        .map(|s| transform(s, &grid, &kernel).unwrap())
        .collect();
    let summary = estimate(&maps, &grid, CombinationRule::Max).unwrap();
    let corrected = correct(&summary, &null, CorrectionMethod::VoxelFwe, 0.05).unwrap();
    assert_eq!(corrected.p_value_at([5, 5, 5]), Some(1.0));
    assert!(!corrected.is_significant([5, 5, 5]));

    // Summed spheres: three random spheres almost never share a voxel
    let rule = CombinationRule::WeightedSum(StudyWeighting::Uniform);
    let null = generate(&studies, &grid, &kernel, rule, 100, 42).unwrap();
    let summary = estimate(&maps, &grid, rule).unwrap();
    let maxima = null.as_empirical().unwrap().max_statistic();
    assert!(maxima[94] < 3.0);
    let corrected = correct(&summary, &null, CorrectionMethod::VoxelFwe, 0.05).unwrap();
    assert!(corrected.is_significant([5, 5, 5]));
    assert!(corrected.p_value_at([5, 5, 5]).unwrap() > 0.0);
}

#[test]
fn test_cluster_fwe_end_to_end() {
    let studies = three_studies_at_centre();
    let grid = grid();
    let analysis = MetaAnalysis::new(
        KernelConfig::mkda(1.0),
        CombinationRule::WeightedSum(StudyWeighting::Uniform),
        NullMethod::monte_carlo(50, 3),
        CorrectionMethod::ClusterFwe {
            metric: ClusterMetric::Size,
        },
        0.05,
    )
    .unwrap()
    .with_cluster_threshold(ClusterThreshold {
        primary_threshold: 2.0,
        connectivity: Connectivity::Vertices,
    });

    let result = analysis.run(&studies, &grid, &CancellationToken::new()).unwrap();
    let table = result.corrected.clusters();
    assert_eq!(table.len(), 1);
    assert_eq!(table[0].size, 7);
    assert_eq!(table[0].peak_value, 3.0);
    assert!((table[0].mass - 7.0).abs() < 1e-12);

    // Every voxel of the cluster shares its p-value; nothing else is below 1
    let p = result.corrected.p_values();
    let cluster_p = table[0].p_value;
    for ((i, j, k), &value) in result.summary.data().indexed_iter() {
        if value > 2.0 {
            assert_eq!(p[(i, j, k)], cluster_p);
        } else {
            assert_eq!(p[(i, j, k)], 1.0);
        }
    }
}

#[test]
fn test_ale_with_analytic_null_and_fdr() {
    let grid = Arc::new(
        GridSpace::full(
            (20, 20, 20),
            Affine::from_voxel_size([2.0, 2.0, 2.0], [0.0, 0.0, 0.0]).unwrap(),
        )
        .unwrap(),
    );
    let studies = StudyCollection::new(
        (0..5)
            .map(|i| {
                Study::new(
                    format!("s{}", i),
                    vec![Coordinate::new(20.0 + i as f64, 20.0, 20.0)],
                )
                .with_sample_size(25)
            })
            .collect(),
    )
    .unwrap();

    let analysis = MetaAnalysis::new(
        KernelConfig::ale(),
        CombinationRule::ProbabilisticUnion,
        NullMethod::Analytic { bin_width: 1e-4 },
        CorrectionMethod::Fdr {
            procedure: FdrProcedure::Indep,
        },
        0.05,
    )
    .unwrap();
    let result = analysis.run(&studies, &grid, &CancellationToken::new()).unwrap();
    assert_eq!(result.null.kind(), "analytic");

    let (peak, _) = result.summary.peak();
    assert!(result.corrected.is_significant(peak));
    assert!(!result.corrected.is_significant([0, 0, 0]));
}

#[test]
fn test_insufficient_studies() {
    let one = StudyCollection::new(vec![Study::new("only", vec![Coordinate::new(1.0, 1.0, 1.0)])]).unwrap();
    let err = generate(&one, &grid(), &KernelConfig::mkda(1.0), CombinationRule::Max, 10, 0).unwrap_err();
    assert_eq!(
        err,
        CbmaError::InsufficientData {
            n_studies: 1,
            minimum: MIN_STUDIES_FOR_NULL
        }
    );
}

#[test]
fn test_simulated_dataset_recovers_focus() {
    let grid = Arc::new(
        GridSpace::full(
            (20, 20, 20),
            Affine::from_voxel_size([2.0, 2.0, 2.0], [0.0, 0.0, 0.0]).unwrap(),
        )
        .unwrap(),
    );
    let sim = simulate_coordinate_dataset(
        &grid,
        &SimulationConfig {
            ground_truth: GroundTruthFoci::Coordinates(vec![[20.0, 20.0, 20.0]]),
            fwhm_mm: 4.0,
            n_studies: 12,
            seed: 5,
            ..Default::default()
        },
    )
    .unwrap();

    let transformer = KernelTransformer::new(KernelConfig::mkda(12.0), Arc::clone(&grid)).unwrap();
    let maps = transformer.transform_all(&sim.studies).unwrap();
    let summary = Estimator::new(CombinationRule::WeightedSum(StudyWeighting::Uniform))
        .estimate_sparse(&maps, &grid)
        .unwrap();
    let truth = sim.ground_truth_ijk[0];
    // Signal foci stay within the 3σ kernel box, inside every 12 mm sphere
    assert_eq!(summary.value_at(truth), Some(12.0));
}
