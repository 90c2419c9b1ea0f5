//! Train/val/test preparation.
//!
//! Stratified, seeded shuffle split followed by per-feature standardization
//! fitted on the training rows only.

use super::{split_key, DatasetError, DatasetSplits, SplitAxis, SplitRole};
use crate::codec;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Fractions used by [`split_dataset`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitRatios {
    /// Fraction of all rows held out for test
    pub test: f64,
    /// Fraction of the remaining rows held out for validation
    pub val: f64,
}

impl Default for SplitRatios {
    fn default() -> Self {
        Self {
            test: 0.15,
            val: 0.2,
        }
    }
}

impl SplitRatios {
    fn validate(&self) -> Result<(), DatasetError> {
        for (name, value) in [("test", self.test), ("val", self.val)] {
            if !(0.0..1.0).contains(&value) {
                return Err(DatasetError::UnexpectedShape {
                    key: format!("{name} ratio"),
                    message: format!("{value} is outside [0, 1)"),
                });
            }
        }
        Ok(())
    }
}

/// Default seed for splitting and model initialisation
pub const DEFAULT_SEED: u64 = 42;

/// Split `x`/`y` into train, val and test.
///
/// Each class is shuffled and partitioned separately so every split keeps
/// roughly the class balance of the input. The same seed always yields the
/// same partition.
pub fn split_dataset(
    x: ArrayView2<'_, f64>,
    y: &Array1<i64>,
    ratios: SplitRatios,
    seed: u64,
) -> Result<DatasetSplits, DatasetError> {
    if x.nrows() != y.len() {
        return Err(DatasetError::InconsistentSplit {
            role: SplitRole::Train,
            x_rows: x.nrows(),
            y_rows: y.len(),
        });
    }
    ratios.validate()?;

    let mut by_class: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (row, label) in y.iter().enumerate() {
        by_class.entry(*label).or_default().push(row);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let (mut train, mut val, mut test) = (Vec::new(), Vec::new(), Vec::new());
    for rows in by_class.values_mut() {
        rows.shuffle(&mut rng);
        let n_test = share(rows.len(), ratios.test);
        let n_val = share(rows.len() - n_test, ratios.val);
        test.extend_from_slice(&rows[..n_test]);
        val.extend_from_slice(&rows[n_test..n_test + n_val]);
        train.extend_from_slice(&rows[n_test + n_val..]);
    }
    for rows in [&mut train, &mut val, &mut test] {
        rows.shuffle(&mut rng);
    }

    let splits = DatasetSplits {
        x_train: x.select(Axis(0), &train),
        x_val: x.select(Axis(0), &val),
        x_test: x.select(Axis(0), &test),
        y_train: y.select(Axis(0), &train),
        y_val: y.select(Axis(0), &val),
        y_test: y.select(Axis(0), &test),
    };
    splits.validate()?;
    Ok(splits)
}

fn share(n: usize, fraction: f64) -> usize {
    ((n as f64 * fraction).round() as usize).min(n)
}

// ============================================================================
// Standardization
// ============================================================================

/// Per-column mean/std scaler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl Standardizer {
    /// Fit on the rows of `x`. Constant columns get a unit scale.
    pub fn fit(x: &Array2<f64>) -> Self {
        let n = x.nrows().max(1) as f64;
        let mean: Vec<f64> = x
            .axis_iter(Axis(1))
            .map(|col| col.sum() / n)
            .collect();
        let std = x
            .axis_iter(Axis(1))
            .zip(&mean)
            .map(|(col, m)| {
                let var = col.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n;
                let s = var.sqrt();
                if s > f64::EPSILON {
                    s
                } else {
                    1.0
                }
            })
            .collect();
        Self { mean, std }
    }

    pub fn transform(&self, x: &Array2<f64>) -> Array2<f64> {
        let mut out = x.clone();
        for (j, mut col) in out.axis_iter_mut(Axis(1)).enumerate() {
            let (m, s) = (self.mean[j], self.std[j]);
            col.mapv_inplace(|v| (v - m) / s);
        }
        out
    }

    /// Fit on train, then transform all three feature matrices
    pub fn fit_splits(splits: &mut DatasetSplits) -> Self {
        let scaler = Self::fit(&splits.x_train);
        splits.x_train = scaler.transform(&splits.x_train);
        splits.x_val = scaler.transform(&splits.x_val);
        splits.x_test = scaler.transform(&splits.x_test);
        scaler
    }
}

// ============================================================================
// Local output
// ============================================================================

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> DatasetError {
    let path = path.to_path_buf();
    move |source| DatasetError::Io { path, source }
}

/// Write the six splits as `.npy` files into `dir`, creating it if needed
pub fn write_splits(splits: &DatasetSplits, dir: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    std::fs::create_dir_all(dir).map_err(io_error(dir))?;

    let mut written = Vec::with_capacity(6);
    for role in SplitRole::ALL {
        for axis in SplitAxis::ALL {
            let key = split_key(role, axis);
            let bytes = codec::encode(&splits.encoded(role, axis))
                .map_err(|source| DatasetError::Codec { key: key.clone(), source })?;
            let path = dir.join(&key);
            std::fs::write(&path, bytes).map_err(io_error(&path))?;
            written.push(path);
        }
    }
    Ok(written)
}
