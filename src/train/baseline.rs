//! Built-in classifiers.
//!
//! Small, dependency-free models so the pipeline can run end to end from the
//! command line. Anything implementing [`Classifier`] can be trained the same
//! way.

use super::{Classifier, ModelError};
use crate::tracking::ModelArtifact;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn check_training_set(x: &Array2<f64>, y: &Array1<i64>) -> Result<(), ModelError> {
    if x.nrows() == 0 {
        return Err(ModelError::EmptyTrainingSet);
    }
    if x.nrows() != y.len() {
        return Err(ModelError::LengthMismatch {
            rows: x.nrows(),
            labels: y.len(),
        });
    }
    Ok(())
}

// ============================================================================
// Majority class
// ============================================================================

/// Always predicts the most frequent training label (ties: smallest label)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MajorityClass {
    label: Option<i64>,
}

impl MajorityClass {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Classifier for MajorityClass {
    fn kind(&self) -> &'static str {
        "majority_class"
    }

    fn fit(&mut self, x: &Array2<f64>, y: &Array1<i64>) -> Result<(), ModelError> {
        check_training_set(x, y)?;
        let mut counts: BTreeMap<i64, usize> = BTreeMap::new();
        for label in y {
            *counts.entry(*label).or_default() += 1;
        }
        // max_by_key keeps the last maximum; iterate descending so ties go to the smallest label
        self.label = counts
            .iter()
            .rev()
            .max_by_key(|(_, n)| **n)
            .map(|(label, _)| *label);
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<i64>, ModelError> {
        let label = self.label.ok_or(ModelError::NotFitted)?;
        Ok(Array1::from_elem(x.nrows(), label))
    }

    fn params(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn to_artifact(&self) -> Result<ModelArtifact, ModelError> {
        let payload = serde_json::to_value(self).map_err(|e| ModelError::Serialize(e.to_string()))?;
        Ok(ModelArtifact::new(self.kind(), payload))
    }
}

// ============================================================================
// Nearest centroid
// ============================================================================

/// Assigns each row to the class whose training mean is closest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NearestCentroid {
    /// `(label, centroid)` in ascending label order
    centroids: Vec<(i64, Vec<f64>)>,
    /// Squared euclidean when false, manhattan when true
    manhattan: bool,
}

impl NearestCentroid {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_manhattan(mut self, manhattan: bool) -> Self {
        self.manhattan = manhattan;
        self
    }

    pub fn centroids(&self) -> &[(i64, Vec<f64>)] {
        &self.centroids
    }

    fn distance(&self, row: ArrayView1<'_, f64>, centroid: &[f64]) -> f64 {
        row.iter()
            .zip(centroid)
            .map(|(a, b)| {
                let d = a - b;
                if self.manhattan {
                    d.abs()
                } else {
                    d * d
                }
            })
            .sum()
    }
}

impl Classifier for NearestCentroid {
    fn kind(&self) -> &'static str {
        "nearest_centroid"
    }

    fn fit(&mut self, x: &Array2<f64>, y: &Array1<i64>) -> Result<(), ModelError> {
        check_training_set(x, y)?;
        let mut rows_by_label: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        for (i, label) in y.iter().enumerate() {
            rows_by_label.entry(*label).or_default().push(i);
        }
        self.centroids = rows_by_label
            .into_iter()
            .map(|(label, rows)| {
                let mean = x
                    .select(Axis(0), &rows)
                    .mean_axis(Axis(0))
                    .map(|m| m.to_vec())
                    .unwrap_or_default();
                (label, mean)
            })
            .collect();
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<i64>, ModelError> {
        let expected = self
            .centroids
            .first()
            .map(|(_, c)| c.len())
            .ok_or(ModelError::NotFitted)?;
        if x.ncols() != expected {
            return Err(ModelError::FeatureMismatch {
                expected,
                actual: x.ncols(),
            });
        }

        let predictions = x
            .rows()
            .into_iter()
            .map(|row| {
                self.centroids
                    .iter()
                    .map(|(label, c)| (*label, self.distance(row, c)))
                    .min_by(|a, b| a.1.total_cmp(&b.1))
                    .map(|(label, _)| label)
                    .unwrap_or_default()
            })
            .collect::<Vec<_>>();
        Ok(Array1::from_vec(predictions))
    }

    fn params(&self) -> BTreeMap<String, String> {
        let metric = if self.manhattan { "manhattan" } else { "euclidean" };
        BTreeMap::from([("metric".to_string(), metric.to_string())])
    }

    fn to_artifact(&self) -> Result<ModelArtifact, ModelError> {
        let payload = serde_json::to_value(self).map_err(|e| ModelError::Serialize(e.to_string()))?;
        Ok(ModelArtifact::new(self.kind(), payload))
    }
}

/// Classifier names accepted on the command line
pub const BUILTIN_CLASSIFIERS: &[&str] = &["majority_class", "nearest_centroid", "nearest_centroid_l1"];

/// Build a built-in classifier by name
pub fn builtin(name: &str) -> Option<Box<dyn Classifier>> {
    match name {
        "majority_class" => Some(Box::new(MajorityClass::new())),
        "nearest_centroid" => Some(Box::new(NearestCentroid::new())),
        "nearest_centroid_l1" => Some(Box::new(NearestCentroid::new().with_manhattan(true))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_majority_class() {
        let mut m = MajorityClass::new();
        assert!(matches!(m.predict(&arr2(&[[0.0]])), Err(ModelError::NotFitted)));

        m.fit(&arr2(&[[0.0], [1.0], [2.0]]), &arr1(&[1, 0, 1])).unwrap();
        assert_eq!(m.predict(&arr2(&[[5.0], [6.0]])).unwrap(), arr1(&[1, 1]));
    }

    #[test]
    fn test_majority_class_tie_goes_to_smallest_label() {
        let mut m = MajorityClass::new();
        m.fit(&arr2(&[[0.0], [1.0]]), &arr1(&[3, 2])).unwrap();
        assert_eq!(m.predict(&arr2(&[[0.0]])).unwrap(), arr1(&[2]));
    }

    #[test]
    fn test_nearest_centroid_separable() {
        let x = arr2(&[[0.0, 0.0], [0.2, 0.0], [5.0, 5.0], [5.2, 4.8]]);
        let y = arr1(&[0, 0, 1, 1]);
        let mut m = NearestCentroid::new();
        m.fit(&x, &y).unwrap();

        assert_eq!(m.centroids()[0], (0, vec![0.1, 0.0]));
        let pred = m.predict(&arr2(&[[0.1, 0.3], [4.0, 4.0]])).unwrap();
        assert_eq!(pred, arr1(&[0, 1]));
    }

    #[test]
    fn test_nearest_centroid_rejects_wrong_width() {
        let mut m = NearestCentroid::new();
        m.fit(&arr2(&[[0.0, 1.0]]), &arr1(&[0])).unwrap();
        let err = m.predict(&arr2(&[[0.0]])).unwrap_err();
        assert!(matches!(err, ModelError::FeatureMismatch { expected: 2, actual: 1 }));
    }

    #[test]
    fn test_fit_rejects_mismatch_and_empty() {
        let mut m = NearestCentroid::new();
        assert!(matches!(
            m.fit(&arr2(&[[0.0], [1.0]]), &arr1(&[0])),
            Err(ModelError::LengthMismatch { rows: 2, labels: 1 })
        ));
        let empty = Array2::<f64>::zeros((0, 2));
        assert!(matches!(
            m.fit(&empty, &Array1::zeros(0)),
            Err(ModelError::EmptyTrainingSet)
        ));
    }

    #[test]
    fn test_artifact_payload() {
        let mut m = NearestCentroid::new().with_manhattan(true);
        m.fit(&arr2(&[[1.0], [3.0]]), &arr1(&[0, 0])).unwrap();
        let artifact = m.to_artifact().unwrap();
        assert_eq!(artifact.classifier, "nearest_centroid");
        assert_eq!(artifact.flavor, "python_function");
        assert_eq!(artifact.payload["manhattan"], serde_json::json!(true));
        assert_eq!(m.params()["metric"], "manhattan");
    }

    #[test]
    fn test_builtin_lookup() {
        for name in BUILTIN_CLASSIFIERS {
            assert!(builtin(name).is_some(), "{name}");
        }
        assert!(builtin("random_forest").is_none());
    }
}
