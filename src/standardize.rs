// src/standardize.rs

use log::debug;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::dataset::Dataset;
use crate::error::{FactorError, Result};

/// A column whose standard deviation is at most this fraction of its largest
/// magnitude is treated as constant.
const MIN_RELATIVE_STD_DEV: f64 = 1e-12;

/// A dataset whose columns have zero mean and unit sample standard deviation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StandardizedDataset {
    names: Vec<String>,
    /// Shape: (n_subjects, n_variables)
    data: Array2<f64>,
    /// Column means of the raw data.
    means: Array1<f64>,
    /// Column sample standard deviations (n-1) of the raw data.
    scales: Array1<f64>,
}

impl StandardizedDataset {
    /// Centers each column and divides it by its sample standard deviation.
    ///
    /// # Errors
    /// Returns `ZeroVariance` naming the first constant column.
    pub fn new(dataset: &Dataset) -> Result<Self> {
        let (names, data) = dataset.clone().into_parts();
        standardize(names, data)
    }

    /// Variable names, in column order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The z-scores, shape (n_subjects, n_variables).
    pub fn data(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    /// Means subtracted from the raw columns.
    pub fn means(&self) -> ArrayView1<'_, f64> {
        self.means.view()
    }

    /// Standard deviations the centered columns were divided by.
    pub fn scales(&self) -> ArrayView1<'_, f64> {
        self.scales.view()
    }

    /// Number of rows.
    pub fn n_subjects(&self) -> usize {
        self.data.nrows()
    }

    /// Number of columns.
    pub fn n_variables(&self) -> usize {
        self.data.ncols()
    }
}

impl TryFrom<Dataset> for StandardizedDataset {
    type Error = FactorError;

    fn try_from(dataset: Dataset) -> Result<Self> {
        let (names, data) = dataset.into_parts();
        standardize(names, data)
    }
}

fn standardize(names: Vec<String>, mut data_matrix: Array2<f64>) -> Result<StandardizedDataset> {
    let n_samples = data_matrix.nrows();
    let n_features = data_matrix.ncols();

    let magnitudes = data_matrix.map_axis(Axis(0), |column| {
        column.iter().fold(0.0_f64, |m, v| m.max(v.abs()))
    });
    let mean_vector = data_matrix
        .mean_axis(Axis(0))
        .ok_or_else(|| FactorError::InvalidData("cannot standardize an empty dataset".into()))?;
    data_matrix -= &mean_vector;

    let std_dev_vector = data_matrix.map_axis(Axis(0), |column| column.std(1.0));
    if let Some(col) = std_dev_vector
        .iter()
        .zip(magnitudes.iter())
        .position(|(&s, &m)| !s.is_finite() || s <= MIN_RELATIVE_STD_DEV * m)
    {
        return Err(FactorError::ZeroVariance {
            column: names[col].clone(),
        });
    }
    data_matrix /= &std_dev_vector;

    debug!(
        "Standardized {} subjects x {} variables.",
        n_samples, n_features
    );

    Ok(StandardizedDataset {
        names,
        data: data_matrix,
        means: mean_vector,
        scales: std_dev_vector,
    })
}
