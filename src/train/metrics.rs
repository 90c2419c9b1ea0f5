//! Classification metrics.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Write as _;

/// Fraction of positions where `predicted` equals `truth`.
///
/// Zero for empty input. Extra entries in the longer array are ignored.
pub fn accuracy(truth: &Array1<i64>, predicted: &Array1<i64>) -> f64 {
    let n = truth.len().min(predicted.len());
    if n == 0 {
        return 0.0;
    }
    let correct = truth
        .iter()
        .zip(predicted.iter())
        .filter(|(t, p)| t == p)
        .count();
    correct as f64 / n as f64
}

/// Counts indexed `[true label][predicted label]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    /// Every label seen in truth or predictions, ascending
    pub labels: Vec<i64>,
    pub counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    pub fn from_predictions(truth: &Array1<i64>, predicted: &Array1<i64>) -> Self {
        let labels: Vec<i64> = truth
            .iter()
            .chain(predicted.iter())
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let index = |label: i64| labels.binary_search(&label).unwrap_or(0);

        let mut counts = vec![vec![0usize; labels.len()]; labels.len()];
        for (t, p) in truth.iter().zip(predicted.iter()) {
            counts[index(*t)][index(*p)] += 1;
        }
        Self { labels, counts }
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    /// Diagonal sum
    pub fn correct(&self) -> usize {
        (0..self.labels.len()).map(|i| self.counts[i][i]).sum()
    }

    /// CSV with a header row of predicted labels and one row per true label
    pub fn to_csv(&self) -> String {
        let mut out = String::from("true\\predicted");
        for label in &self.labels {
            let _ = write!(out, ",{label}");
        }
        out.push('\n');
        for (label, row) in self.labels.iter().zip(&self.counts) {
            let _ = write!(out, "{label}");
            for count in row {
                let _ = write!(out, ",{count}");
            }
            out.push('\n');
        }
        out
    }
}
