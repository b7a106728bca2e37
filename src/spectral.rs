// src/spectral.rs

use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::correlation::CorrelationMatrix;
use crate::error::Result;
use crate::linalg_backends::sorted_eigh;

/// Negative eigenvalues of at most this magnitude are rounding noise and reported as 0.
const NEGATIVE_EIGENVALUE_NOISE: f64 = 1e-10;

/// Eigenvalues (descending) and eigenvectors of a correlation matrix, for scree diagnostics.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EigenDecomposition {
    eigenvalues: Array1<f64>,
    /// Column i belongs to eigenvalues[i].
    eigenvectors: Array2<f64>,
}

impl EigenDecomposition {
    /// Decomposes a correlation matrix with the symmetric eigensolver.
    pub fn new(correlation: &CorrelationMatrix) -> Result<Self> {
        let (mut eigenvalues, eigenvectors) = sorted_eigh(&correlation.matrix().to_owned())?;
        for value in eigenvalues.iter_mut() {
            if *value < 0.0 {
                if *value > -NEGATIVE_EIGENVALUE_NOISE {
                    *value = 0.0;
                } else {
                    warn!(
                        "Correlation matrix has a negative eigenvalue {:.3e}; it is not positive semi-definite.",
                        value
                    );
                }
            }
        }
        debug!("Eigenvalues of correlation matrix: {:?}", eigenvalues);
        Ok(Self {
            eigenvalues,
            eigenvectors,
        })
    }

    /// Eigenvalues, largest first.
    pub fn eigenvalues(&self) -> ArrayView1<'_, f64> {
        self.eigenvalues.view()
    }

    /// Unit eigenvectors as columns, in eigenvalue order.
    pub fn eigenvectors(&self) -> ArrayView2<'_, f64> {
        self.eigenvectors.view()
    }

    /// Sum of the eigenvalues; equals p for a correlation matrix.
    pub fn trace(&self) -> f64 {
        self.eigenvalues.sum()
    }

    /// Share of the total variance carried by each eigenvalue.
    pub fn proportion_of_variance(&self) -> Array1<f64> {
        let total = self.trace();
        if total <= 0.0 {
            return Array1::zeros(self.eigenvalues.len());
        }
        self.eigenvalues.mapv(|v| v / total)
    }

    /// Running sum of `proportion_of_variance`.
    pub fn cumulative_proportion(&self) -> Array1<f64> {
        let mut running = 0.0;
        self.proportion_of_variance().mapv(|v| {
            running += v;
            running
        })
    }

    /// Number of eigenvalues greater than 1 (Kaiser's rule).
    pub fn kaiser_count(&self) -> usize {
        self.eigenvalues.iter().filter(|&&v| v > 1.0).count()
    }

    /// (1-based index, eigenvalue) pairs for a scree plot.
    pub fn scree_points(&self) -> Vec<(usize, f64)> {
        self.eigenvalues
            .iter()
            .enumerate()
            .map(|(i, &v)| (i + 1, v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn corr() -> CorrelationMatrix {
        let m = array![
            [1.0, 0.6, 0.5, 0.1],
            [0.6, 1.0, 0.4, 0.0],
            [0.5, 0.4, 1.0, 0.2],
            [0.1, 0.0, 0.2, 1.0]
        ];
        let names = vec!["a".into(), "b".into(), "c".into(), "d".into()];
        CorrelationMatrix::from_matrix(names, m, Some(200)).unwrap()
    }

    #[test]
    fn eigenvalues_sum_to_number_of_variables() {
        let eig = EigenDecomposition::new(&corr()).unwrap();
        assert_abs_diff_eq!(eig.trace(), 4.0, epsilon = 1e-10);
        let values = eig.eigenvalues();
        for w in values.windows(2) {
            assert!(w[0] >= w[1]);
        }
        assert!(values.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn proportions_accumulate_to_one() {
        let eig = EigenDecomposition::new(&corr()).unwrap();
        let cumulative = eig.cumulative_proportion();
        assert_abs_diff_eq!(cumulative[cumulative.len() - 1], 1.0, epsilon = 1e-12);
        assert_eq!(eig.kaiser_count(), 2);
        let points = eig.scree_points();
        assert_eq!(points[0].0, 1);
        assert_abs_diff_eq!(points[0].1, eig.eigenvalues()[0]);
    }

    #[test]
    fn eigenvectors_are_orthonormal() {
        let eig = EigenDecomposition::new(&corr()).unwrap();
        let v = eig.eigenvectors();
        let gram = v.t().dot(&v);
        for i in 0..4 {
            for j in 0..4 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(gram[[i, j]], expected, epsilon = 1e-10);
            }
        }
    }
}
