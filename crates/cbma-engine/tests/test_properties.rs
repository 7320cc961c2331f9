// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Property tests: order independence, FDR rank preservation and alpha nesting.

use std::sync::Arc;

use cbma_engine::*;
use proptest::prelude::*;

fn grid() -> Arc<GridSpace> {
    Arc::new(GridSpace::full((8, 8, 8), Affine::identity()).unwrap())
}

fn study_strategy() -> impl Strategy<Value = Vec<(Vec<[f64; 3]>, u32)>> {
    let coord = (0u8..8, 0u8..8, 0u8..8).prop_map(|(x, y, z)| [x as f64, y as f64, z as f64]);
    prop::collection::vec((prop::collection::vec(coord, 1..4), 5u32..60), 2..6)
}

fn build_studies(raw: &[(Vec<[f64; 3]>, u32)]) -> Vec<Study> {
    raw.iter()
        .enumerate()
        .map(|(i, (coords, n))| {
            Study::new(
                format!("study-{:02}", i),
                coords.iter().map(|&[x, y, z]| Coordinate::new(x, y, z)).collect(),
            )
            .with_sample_size(*n)
        })
        .collect()
}

fn rules() -> Vec<CombinationRule> {
    vec![
        CombinationRule::Max,
        CombinationRule::ProbabilisticUnion,
        CombinationRule::WeightedSum(StudyWeighting::SqrtSampleSize),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn summary_is_bit_identical_under_permutation(raw in study_strategy(), rotate in 0usize..6) {
        let grid = grid();
        let transformer = KernelTransformer::new(KernelConfig::ale(), Arc::clone(&grid)).unwrap();
        let studies = build_studies(&raw);
        let mut permuted = studies.clone();
        permuted.reverse();
        let len = permuted.len();
        permuted.rotate_left(rotate % len);

        let maps: Vec<KernelMap> = studies.iter().map(|s| transformer.transform(s).unwrap()).collect();
        let permuted_maps: Vec<KernelMap> = permuted.iter().map(|s| transformer.transform(s).unwrap()).collect();

        for rule in rules() {
            let a = estimate(&maps, &grid, rule).unwrap();
            let b = estimate(&permuted_maps, &grid, rule).unwrap();
            let bits_a: Vec<u64> = a.data().iter().map(|v| v.to_bits()).collect();
            let bits_b: Vec<u64> = b.data().iter().map(|v| v.to_bits()).collect();
            prop_assert_eq!(bits_a, bits_b);
        }
    }

    #[test]
    fn null_is_independent_of_study_order(raw in study_strategy(), seed in any::<u64>()) {
        let grid = grid();
        let studies = build_studies(&raw);
        let mut reversed = studies.clone();
        reversed.reverse();
        let kernel = KernelConfig::kda(1.5);
        let rule = CombinationRule::WeightedSum(StudyWeighting::Uniform);

        let a = generate(&StudyCollection::new(studies).unwrap(), &grid, &kernel, rule, 8, seed).unwrap();
        let b = generate(&StudyCollection::new(reversed).unwrap(), &grid, &kernel, rule, 8, seed).unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn fdr_preserves_rank_order(p in prop::collection::vec(0.0f64..=1.0, 1..200)) {
        for procedure in [FdrProcedure::Indep, FdrProcedure::Negcorr] {
            let q = fdr_correct_p_values(&p, procedure).unwrap();
            prop_assert_eq!(q.len(), p.len());
            let mut order: Vec<usize> = (0..p.len()).collect();
            order.sort_by(|&a, &b| p[a].total_cmp(&p[b]));
            for pair in order.windows(2) {
                prop_assert!(q[pair[0]] <= q[pair[1]]);
            }
            for (&adjusted, &raw) in q.iter().zip(&p) {
                prop_assert!(adjusted >= raw && adjusted <= 1.0);
            }
        }
    }

    #[test]
    fn stricter_alpha_is_nested_in_looser(
        p in prop::collection::vec(0.0f64..=1.0, 8),
        strict in 0.001f64..0.5,
        extra in 0.0f64..0.49,
    ) {
        let grid = Arc::new(GridSpace::full((2, 2, 2), Affine::identity()).unwrap());
        let p_map = ndarray::Array3::from_shape_vec((2, 2, 2), p).unwrap();
        let map = correct_p_map(&grid, &p_map, FdrProcedure::Indep, 0.05).unwrap();
        let loose = strict + extra;
        let strict_sig = map.significant_at(strict);
        let loose_sig = map.significant_at(loose);
        for (&s, &l) in strict_sig.iter().zip(loose_sig.iter()) {
            prop_assert!(!s || l);
        }
    }
}
