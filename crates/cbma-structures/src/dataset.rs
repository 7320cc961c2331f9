// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Studies and their reported peak coordinates.
//!
//! A [`StudyCollection`] is the materialized dataset handed to the engine by
//! the external loading layer. It is validated once on construction and never
//! mutated afterwards.

use crate::error::{CbmaError, CbmaResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A reported peak in physical (mm) space with an optional weight
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub xyz: [f64; 3],
    #[serde(default)]
    pub weight: Option<f64>,
}

impl Coordinate {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            xyz: [x, y, z],
            weight: None,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Effective weight (1.0 when unweighted)
    pub fn weight_or_one(&self) -> f64 {
        self.weight.unwrap_or(1.0)
    }
}

/// One study: identifier, ordered peaks and optional sample size
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Study {
    id: String,
    coordinates: Vec<Coordinate>,
    #[serde(default)]
    sample_size: Option<u32>,
}

impl Study {
    pub fn new(id: impl Into<String>, coordinates: Vec<Coordinate>) -> Self {
        Self {
            id: id.into(),
            coordinates,
            sample_size: None,
        }
    }

    pub fn with_sample_size(mut self, sample_size: u32) -> Self {
        self.sample_size = Some(sample_size);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn coordinates(&self) -> &[Coordinate] {
        &self.coordinates
    }

    pub fn sample_size(&self) -> Option<u32> {
        self.sample_size
    }

    /// Sample size or an `Input` error naming this study
    pub fn require_sample_size(&self) -> CbmaResult<u32> {
        self.sample_size.ok_or_else(|| {
            CbmaError::input(
                format!("study '{}'", self.id),
                "sample size is required by the configured kernel or weighting",
            )
        })
    }

    /// Check the study on its own.
    ///
    /// # Errors
    /// `Input` naming the study for an empty identifier, no coordinates, a
    /// zero sample size, a non-finite position or a negative/non-finite weight.
    pub fn validate(&self) -> CbmaResult<()> {
        let entity = || format!("study '{}'", self.id);
        if self.id.trim().is_empty() {
            return Err(CbmaError::input("study", "identifier must not be empty"));
        }
        if self.coordinates.is_empty() {
            return Err(CbmaError::input(entity(), "study reports no coordinates"));
        }
        if self.sample_size == Some(0) {
            return Err(CbmaError::input(entity(), "sample size must be positive"));
        }
        for (idx, coord) in self.coordinates.iter().enumerate() {
            if coord.xyz.iter().any(|v| !v.is_finite()) {
                return Err(CbmaError::input(
                    entity(),
                    format!("coordinate {} has non-finite position {:?}", idx, coord.xyz),
                ));
            }
            if let Some(w) = coord.weight {
                if !w.is_finite() || w < 0.0 {
                    return Err(CbmaError::input(
                        entity(),
                        format!("coordinate {} has invalid weight {}", idx, w),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Ordered collection of studies with unique identifiers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Study>", into = "Vec<Study>")]
pub struct StudyCollection {
    studies: Vec<Study>,
}

impl StudyCollection {
    /// Validate and wrap a list of studies.
    ///
    /// # Errors
    /// `Input` if the list is empty, an identifier repeats, or a study has no
    /// coordinates, a zero sample size, non-finite positions or negative weights.
    pub fn new(studies: Vec<Study>) -> CbmaResult<Self> {
        if studies.is_empty() {
            return Err(CbmaError::input("study collection", "at least one study is required"));
        }
        let mut seen = HashSet::with_capacity(studies.len());
        for study in &studies {
            study.validate()?;
            if !seen.insert(study.id.as_str()) {
                return Err(CbmaError::input(
                    format!("study '{}'", study.id),
                    "identifier is not unique within the collection",
                ));
            }
        }
        Ok(Self { studies })
    }

    pub fn len(&self) -> usize {
        self.studies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.studies.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Study> {
        self.studies.iter()
    }

    pub fn studies(&self) -> &[Study] {
        &self.studies
    }

    pub fn get(&self, id: &str) -> Option<&Study> {
        self.studies.iter().find(|s| s.id == id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.studies.iter().map(|s| s.id()).collect()
    }

    pub fn n_coordinates(&self) -> usize {
        self.studies.iter().map(|s| s.coordinates.len()).sum()
    }

    /// Studies sorted by identifier.
    ///
    /// Estimation folds studies in this order so that results do not depend
    /// on the order the caller supplied them in.
    pub fn canonical_order(&self) -> Vec<&Study> {
        let mut ordered: Vec<&Study> = self.studies.iter().collect();
        ordered.sort_by(|a, b| a.id.cmp(&b.id));
        ordered
    }
}

impl TryFrom<Vec<Study>> for StudyCollection {
    type Error = CbmaError;

    fn try_from(studies: Vec<Study>) -> Result<Self, Self::Error> {
        StudyCollection::new(studies)
    }
}

impl From<StudyCollection> for Vec<Study> {
    fn from(collection: StudyCollection) -> Self {
        collection.studies
    }
}

impl<'a> IntoIterator for &'a StudyCollection {
    type Item = &'a Study;
    type IntoIter = std::slice::Iter<'a, Study>;

    fn into_iter(self) -> Self::IntoIter {
        self.studies.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn study(id: &str) -> Study {
        Study::new(id, vec![Coordinate::new(0.0, 0.0, 0.0)])
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = StudyCollection::new(vec![study("a"), study("a")]).unwrap_err();
        assert!(err.to_string().contains("'a'"));
    }

    #[test]
    fn test_empty_collection_rejected() {
        assert!(StudyCollection::new(Vec::new()).is_err());
    }

    #[test]
    fn test_empty_study_rejected() {
        let err = StudyCollection::new(vec![Study::new("empty", Vec::new())]).unwrap_err();
        assert!(matches!(err, CbmaError::Input { .. }));
    }

    #[test]
    fn test_negative_weight_rejected() {
        let s = Study::new("w", vec![Coordinate::new(1.0, 2.0, 3.0).with_weight(-0.5)]);
        assert!(StudyCollection::new(vec![s]).is_err());
    }

    #[test]
    fn test_canonical_order_sorted_by_id() {
        let collection = StudyCollection::new(vec![study("c"), study("a"), study("b")]).unwrap();
        let ids: Vec<&str> = collection.canonical_order().iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        // Original order is preserved for iteration
        assert_eq!(collection.ids(), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_missing_sample_size_names_study() {
        let err = study("no-n").require_sample_size().unwrap_err();
        assert!(err.to_string().contains("no-n"));
    }

    #[test]
    fn test_json_deserialization_validates() {
        let json = r#"[{"id": "s1", "coordinates": [{"xyz": [1.0, 2.0, 3.0]}], "sample_size": 20}]"#;
        let collection: StudyCollection = serde_json::from_str(json).unwrap();
        assert_eq!(collection.len(), 1);
        assert_eq!(collection.studies()[0].sample_size(), Some(20));

        let bad = r#"[{"id": "s1", "coordinates": []}]"#;
        assert!(serde_json::from_str::<StudyCollection>(bad).is_err());
    }
}
