// src/correlation.rs

use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::dataset::Dataset;
use crate::error::{FactorError, Result};
use crate::linalg_backends::{sorted_eigh, BackendInverse, LinAlgBackendProvider};
use crate::standardize::StandardizedDataset;

/// Smallest eigenvalue a correlation matrix may have before it is treated as singular.
pub const SINGULARITY_THRESHOLD: f64 = 1e-8;

/// Tolerance used when validating symmetry and the unit diagonal of a supplied matrix.
const SYMMETRY_TOLERANCE: f64 = 1e-8;

/// A p x p Pearson correlation matrix with the names of its variables.
///
/// Symmetric, unit diagonal, entries in [-1, 1].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CorrelationMatrix {
    names: Vec<String>,
    matrix: Array2<f64>,
    /// Number of subjects behind the correlations, when known.
    n_obs: Option<usize>,
}

/// Kaiser-Meyer-Olkin measure of sampling adequacy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KmoResult {
    /// MSA over all variables; values below 0.5 are usually considered unacceptable.
    pub overall: f64,
    /// Per-variable MSA, in variable order.
    pub per_variable: Array1<f64>,
}

/// Bartlett's test that the correlation matrix is an identity matrix.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BartlettSphericity {
    /// Test statistic, chi-square distributed under sphericity.
    pub chi_square: f64,
    pub dof: usize,
}

impl CorrelationMatrix {
    /// Pearson correlations of a standardized dataset, `Z^T Z / (n - 1)`.
    pub fn from_standardized(standardized: &StandardizedDataset) -> Self {
        let z = standardized.data();
        let n = z.nrows();
        let mut matrix = z.t().dot(&z);
        matrix /= (n - 1) as f64;
        tidy_correlation(&mut matrix);
        info!(
            "Computed {}x{} correlation matrix from {} subjects.",
            matrix.nrows(),
            matrix.ncols(),
            n
        );
        Self {
            names: standardized.names().to_vec(),
            matrix,
            n_obs: Some(n),
        }
    }

    /// Pearson correlations of a raw dataset (standardized internally).
    pub fn from_dataset(dataset: &Dataset) -> Result<Self> {
        let standardized = StandardizedDataset::new(dataset)?;
        Ok(Self::from_standardized(&standardized))
    }

    /// Wraps an externally computed correlation matrix after validating it.
    pub fn from_matrix(names: Vec<String>, matrix: Array2<f64>, n_obs: Option<usize>) -> Result<Self> {
        let p = matrix.nrows();
        if matrix.ncols() != p {
            return Err(FactorError::InvalidData(format!(
                "correlation matrix must be square, got {}x{}",
                p,
                matrix.ncols()
            )));
        }
        if names.len() != p {
            return Err(FactorError::InvalidData(format!(
                "{} names given for a {}x{} correlation matrix",
                names.len(),
                p,
                p
            )));
        }
        if p == 0 {
            return Err(FactorError::InvalidData("correlation matrix is empty".into()));
        }
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err(FactorError::InvalidData(
                "correlation matrix contains non-finite values".into(),
            ));
        }
        for i in 0..p {
            if (matrix[[i, i]] - 1.0).abs() > SYMMETRY_TOLERANCE {
                return Err(FactorError::InvalidData(format!(
                    "diagonal entry {} is {}, expected 1",
                    i,
                    matrix[[i, i]]
                )));
            }
            for j in (i + 1)..p {
                if (matrix[[i, j]] - matrix[[j, i]]).abs() > SYMMETRY_TOLERANCE {
                    return Err(FactorError::InvalidData(format!(
                        "matrix is not symmetric at ({}, {})",
                        i, j
                    )));
                }
                if matrix[[i, j]].abs() > 1.0 + SYMMETRY_TOLERANCE {
                    return Err(FactorError::InvalidData(format!(
                        "entry ({}, {}) = {} is outside [-1, 1]",
                        i,
                        j,
                        matrix[[i, j]]
                    )));
                }
            }
        }
        if let Some(n) = n_obs {
            if n < 2 {
                return Err(FactorError::InvalidData(format!(
                    "n_obs must be at least 2, got {}",
                    n
                )));
            }
        }
        let mut matrix = matrix;
        tidy_correlation(&mut matrix);
        Ok(Self { names, matrix, n_obs })
    }

    /// The p x p correlations.
    pub fn matrix(&self) -> ArrayView2<'_, f64> {
        self.matrix.view()
    }

    /// Variable names, in row and column order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of subjects the correlations were computed from, when known.
    pub fn n_obs(&self) -> Option<usize> {
        self.n_obs
    }

    /// Number of variables, p.
    pub fn dim(&self) -> usize {
        self.matrix.nrows()
    }

    /// Returns the same correlations with variables permuted into `order`
    /// (e.g. the dominant-factor order of a fitted model, for a heatmap).
    pub fn reordered(&self, order: &[usize]) -> Result<Self> {
        let p = self.dim();
        let mut seen = vec![false; p];
        if order.len() != p {
            return Err(FactorError::InvalidData(format!(
                "order has {} entries for {} variables",
                order.len(),
                p
            )));
        }
        for &i in order {
            if i >= p || seen[i] {
                return Err(FactorError::InvalidData(format!(
                    "order is not a permutation of 0..{}",
                    p
                )));
            }
            seen[i] = true;
        }
        let matrix = Array2::from_shape_fn((p, p), |(i, j)| self.matrix[[order[i], order[j]]]);
        let names = order.iter().map(|&i| self.names[i].clone()).collect();
        Ok(Self {
            names,
            matrix,
            n_obs: self.n_obs,
        })
    }

    /// Smallest eigenvalue of the matrix.
    pub fn min_eigenvalue(&self) -> Result<f64> {
        let (values, _) = sorted_eigh(&self.matrix)?;
        Ok(values.iter().copied().fold(f64::INFINITY, f64::min))
    }

    /// Fails with `SingularCorrelation` when the matrix is (near-)singular,
    /// e.g. because two variables are perfectly collinear.
    pub fn ensure_nonsingular(&self) -> Result<()> {
        let min_eigenvalue = self.min_eigenvalue()?;
        if min_eigenvalue < SINGULARITY_THRESHOLD {
            warn!(
                "Correlation matrix is singular: smallest eigenvalue {:.3e}",
                min_eigenvalue
            );
            return Err(FactorError::SingularCorrelation { min_eigenvalue });
        }
        Ok(())
    }

    /// Inverse of a non-singular correlation matrix.
    pub fn inverse(&self) -> Result<Array2<f64>> {
        self.ensure_nonsingular()?;
        LinAlgBackendProvider.inverse(&self.matrix)
    }

    /// Squared multiple correlation of each variable with all the others,
    /// `1 - 1 / diag(R^-1)`. The usual starting communalities.
    pub fn smc(&self) -> Result<Array1<f64>> {
        if self.dim() == 1 {
            return Ok(Array1::ones(1));
        }
        let inv = self.inverse()?;
        let smc = inv
            .diag()
            .mapv(|d| if d > 0.0 { (1.0 - 1.0 / d).clamp(0.0, 1.0) } else { 1.0 });
        debug!("Squared multiple correlations: {:?}", smc);
        Ok(smc)
    }

    /// Determinant, computed as the product of the eigenvalues.
    pub fn determinant(&self) -> Result<f64> {
        let (values, _) = sorted_eigh(&self.matrix)?;
        Ok(values.iter().product())
    }

    /// Kaiser-Meyer-Olkin sampling adequacy, overall and per variable.
    pub fn kmo(&self) -> Result<KmoResult> {
        let partial = partial_correlations(&self.inverse()?);
        let p = self.dim();
        let mut per_variable = Array1::<f64>::zeros(p);
        let mut total_r2 = 0.0;
        let mut total_q2 = 0.0;
        for j in 0..p {
            let mut r2 = 0.0;
            let mut q2 = 0.0;
            for i in 0..p {
                if i != j {
                    r2 += self.matrix[[i, j]].powi(2);
                    q2 += partial[[i, j]].powi(2);
                }
            }
            per_variable[j] = if r2 + q2 > 0.0 { r2 / (r2 + q2) } else { 0.0 };
            total_r2 += r2;
            total_q2 += q2;
        }
        let overall = if total_r2 + total_q2 > 0.0 {
            total_r2 / (total_r2 + total_q2)
        } else {
            0.0
        };
        Ok(KmoResult {
            overall,
            per_variable,
        })
    }

    /// Bartlett's sphericity test, `-(n - 1 - (2p + 5) / 6) ln|R|` on `p(p-1)/2` dof.
    ///
    /// # Errors
    /// `Config` if the number of observations is unknown; `SingularCorrelation`
    /// if the determinant is not positive.
    pub fn bartlett_sphericity(&self) -> Result<BartlettSphericity> {
        let n = self.n_obs.ok_or_else(|| {
            FactorError::Config("Bartlett's test needs the number of observations".into())
        })?;
        self.ensure_nonsingular()?;
        let p = self.dim() as f64;
        let det = self.determinant()?;
        let chi_square = -((n as f64) - 1.0 - (2.0 * p + 5.0) / 6.0) * det.ln();
        Ok(BartlettSphericity {
            chi_square,
            dof: self.dim() * (self.dim() - 1) / 2,
        })
    }
}

/// Forces exact symmetry and a unit diagonal, and clamps rounding overshoot.
fn tidy_correlation(matrix: &mut Array2<f64>) {
    let p = matrix.nrows();
    for i in 0..p {
        matrix[[i, i]] = 1.0;
        for j in (i + 1)..p {
            let v = (0.5 * (matrix[[i, j]] + matrix[[j, i]])).clamp(-1.0, 1.0);
            matrix[[i, j]] = v;
            matrix[[j, i]] = v;
        }
    }
}

/// Partial correlations of every pair given all other variables, from the
/// inverse of a covariance or correlation matrix. The diagonal is set to 1.
pub(crate) fn partial_correlations(inverse: &Array2<f64>) -> Array2<f64> {
    let p = inverse.nrows();
    Array2::from_shape_fn((p, p), |(i, j)| {
        if i == j {
            1.0
        } else {
            let denom = (inverse[[i, i]] * inverse[[j, j]]).sqrt();
            if denom > 0.0 {
                -inverse[[i, j]] / denom
            } else {
                0.0
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn sample_dataset() -> Dataset {
        let raw = array![
            [1.0, 2.0, 9.0, 4.0],
            [2.0, 1.0, 7.0, 3.0],
            [3.0, 4.0, 6.0, 6.0],
            [4.0, 3.0, 4.0, 5.0],
            [5.0, 6.0, 5.0, 9.0],
            [6.0, 5.0, 1.0, 8.0],
            [7.0, 8.0, 2.0, 8.0]
        ];
        Dataset::new(
            vec!["a".into(), "b".into(), "c".into(), "d".into()],
            raw,
        )
        .unwrap()
    }

    #[test]
    fn matrix_is_symmetric_with_unit_diagonal() {
        let r = CorrelationMatrix::from_dataset(&sample_dataset()).unwrap();
        let m = r.matrix();
        for i in 0..r.dim() {
            assert_eq!(m[[i, i]], 1.0);
            for j in 0..r.dim() {
                assert_eq!(m[[i, j]], m[[j, i]]);
                assert!(m[[i, j]].abs() <= 1.0);
            }
        }
        assert_eq!(r.n_obs(), Some(7));
    }

    #[test]
    fn matches_pearson_definition() {
        let ds = sample_dataset();
        let r = CorrelationMatrix::from_dataset(&ds).unwrap();
        let x = ds.column("a").unwrap();
        let y = ds.column("c").unwrap();
        let (mx, my) = (x.mean().unwrap(), y.mean().unwrap());
        let cov: f64 = x.iter().zip(y.iter()).map(|(a, b)| (a - mx) * (b - my)).sum();
        let sx: f64 = x.iter().map(|a| (a - mx).powi(2)).sum::<f64>().sqrt();
        let sy: f64 = y.iter().map(|b| (b - my).powi(2)).sum::<f64>().sqrt();
        assert_abs_diff_eq!(r.matrix()[[0, 2]], cov / (sx * sy), epsilon = 1e-12);
    }

    #[test]
    fn duplicated_column_is_singular() {
        let raw = array![
            [1.0, 1.0, 3.0],
            [2.0, 2.0, 1.0],
            [3.0, 3.0, 4.0],
            [5.0, 5.0, 2.0]
        ];
        let ds = Dataset::new(vec!["x".into(), "x_copy".into(), "y".into()], raw).unwrap();
        let r = CorrelationMatrix::from_dataset(&ds).unwrap();
        assert!(matches!(
            r.ensure_nonsingular(),
            Err(FactorError::SingularCorrelation { .. })
        ));
        assert!(r.smc().is_err());
    }

    #[test]
    fn smc_of_two_variables_is_squared_correlation() {
        let m = array![[1.0, 0.6], [0.6, 1.0]];
        let r = CorrelationMatrix::from_matrix(vec!["a".into(), "b".into()], m, Some(50)).unwrap();
        let smc = r.smc().unwrap();
        assert_abs_diff_eq!(smc[0], 0.36, epsilon = 1e-12);
        assert_abs_diff_eq!(smc[1], 0.36, epsilon = 1e-12);
    }

    #[test]
    fn from_matrix_rejects_asymmetry() {
        let m = array![[1.0, 0.5], [0.4, 1.0]];
        assert!(CorrelationMatrix::from_matrix(vec!["a".into(), "b".into()], m, None).is_err());
    }

    #[test]
    fn kmo_and_bartlett_on_identity_like_matrix() {
        let m = array![[1.0, 0.5, 0.4], [0.5, 1.0, 0.3], [0.4, 0.3, 1.0]];
        let r = CorrelationMatrix::from_matrix(
            vec!["a".into(), "b".into(), "c".into()],
            m,
            Some(100),
        )
        .unwrap();
        let kmo = r.kmo().unwrap();
        assert!(kmo.overall > 0.0 && kmo.overall < 1.0);
        assert_eq!(kmo.per_variable.len(), 3);
        let bartlett = r.bartlett_sphericity().unwrap();
        assert_eq!(bartlett.dof, 3);
        assert!(bartlett.chi_square > 0.0);
    }

    #[test]
    fn reordered_permutes_rows_and_columns() {
        let m = array![[1.0, 0.2, 0.7], [0.2, 1.0, 0.1], [0.7, 0.1, 1.0]];
        let r = CorrelationMatrix::from_matrix(vec!["a".into(), "b".into(), "c".into()], m, None)
            .unwrap();
        let o = r.reordered(&[2, 0, 1]).unwrap();
        assert_eq!(o.names(), &["c", "a", "b"]);
        assert_abs_diff_eq!(o.matrix()[[0, 1]], 0.7);
        assert_abs_diff_eq!(o.matrix()[[1, 2]], 0.2);
        assert!(r.reordered(&[0, 0, 1]).is_err());
    }
}
