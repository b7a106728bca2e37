// src/linalg_backends.rs

use ndarray::{Array1, Array2};
use ndarray_linalg::{Eigh as NdLinalgEigh, Inverse as NdLinalgInverse, SVD as NdLinalgSVD, UPLO};

use crate::error::{FactorError, Result};

/// Output of a symmetric eigendecomposition.
#[derive(Debug)]
pub struct EighOutput {
    /// Eigenvalues in ascending order, as LAPACK returns them.
    pub eigenvalues: Array1<f64>,
    /// Eigenvectors as columns of the matrix.
    /// eigenvectors.column(i) corresponds to eigenvalues[i].
    pub eigenvectors: Array2<f64>,
}

/// Output of a full singular value decomposition.
#[derive(Debug)]
pub struct SVDOutput {
    pub u: Array2<f64>,
    pub s: Array1<f64>,
    pub vt: Array2<f64>,
}

/// Trait for symmetric eigendecomposition (LAPACK's DSYEVD).
/// Only the upper triangle of `matrix` is read.
pub trait BackendEigh {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput>;
}

/// Trait for singular value decomposition with both singular vector sets.
pub trait BackendSVD {
    fn svd(&self, matrix: &Array2<f64>) -> Result<SVDOutput>;
}

/// Trait for the inverse of a square, non-singular matrix.
pub trait BackendInverse {
    fn inverse(&self, matrix: &Array2<f64>) -> Result<Array2<f64>>;
}

/// ndarray-linalg (LAPACK) implementation of the backend traits.
#[derive(Debug, Default, Copy, Clone)]
pub struct NdarrayLinAlgBackend;

fn to_linalg_error(e: ndarray_linalg::error::LinalgError) -> FactorError {
    FactorError::Linalg(e.to_string())
}

impl BackendEigh for NdarrayLinAlgBackend {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput> {
        if matrix.nrows() != matrix.ncols() {
            return Err(FactorError::Linalg(format!(
                "Matrix must be square for eigendecomposition, got {}x{}.",
                matrix.nrows(),
                matrix.ncols()
            )));
        }
        if matrix.is_empty() {
            return Ok(EighOutput {
                eigenvalues: Array1::zeros(0),
                eigenvectors: Array2::zeros((0, 0)),
            });
        }
        let (eigenvalues, eigenvectors) = matrix.eigh(UPLO::Upper).map_err(to_linalg_error)?;
        Ok(EighOutput { eigenvalues, eigenvectors })
    }
}

impl BackendSVD for NdarrayLinAlgBackend {
    fn svd(&self, matrix: &Array2<f64>) -> Result<SVDOutput> {
        let (u, s, vt) = matrix.svd(true, true).map_err(to_linalg_error)?;
        match (u, vt) {
            (Some(u), Some(vt)) => Ok(SVDOutput { u, s, vt }),
            _ => Err(FactorError::Linalg(
                "SVD did not return singular vectors.".to_string(),
            )),
        }
    }
}

impl BackendInverse for NdarrayLinAlgBackend {
    fn inverse(&self, matrix: &Array2<f64>) -> Result<Array2<f64>> {
        let inv = matrix.inv().map_err(to_linalg_error)?;
        if inv.iter().any(|v| !v.is_finite()) {
            return Err(FactorError::Numerical(
                "Matrix inverse contains non-finite values.".to_string(),
            ));
        }
        Ok(inv)
    }
}

/// A provider struct that dispatches to the selected linear algebra backend.
///
/// Every LAPACK provider feature (`backend_openblas`, `backend_mkl`, ...)
/// links through ndarray-linalg, so the provider currently forwards to
/// [`NdarrayLinAlgBackend`]; the rest of the crate only talks to the traits.
#[derive(Debug, Default, Copy, Clone)]
pub struct LinAlgBackendProvider;

impl LinAlgBackendProvider {
    /// Creates the provider for the backend selected by the Cargo features.
    pub fn new() -> Self {
        Self
    }
}

impl BackendEigh for LinAlgBackendProvider {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput> {
        NdarrayLinAlgBackend.eigh_upper(matrix)
    }
}

impl BackendSVD for LinAlgBackendProvider {
    fn svd(&self, matrix: &Array2<f64>) -> Result<SVDOutput> {
        NdarrayLinAlgBackend.svd(matrix)
    }
}

impl BackendInverse for LinAlgBackendProvider {
    fn inverse(&self, matrix: &Array2<f64>) -> Result<Array2<f64>> {
        NdarrayLinAlgBackend.inverse(matrix)
    }
}

/// Eigendecomposition sorted by descending eigenvalue.
pub(crate) fn sorted_eigh(matrix: &Array2<f64>) -> Result<(Array1<f64>, Array2<f64>)> {
    let EighOutput {
        eigenvalues,
        eigenvectors,
    } = LinAlgBackendProvider.eigh_upper(matrix)?;
    let n = eigenvalues.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        eigenvalues[b]
            .partial_cmp(&eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let sorted_values = Array1::from_iter(order.iter().map(|&i| eigenvalues[i]));
    let mut sorted_vectors = Array2::<f64>::zeros((eigenvectors.nrows(), n));
    for (dst, &src) in order.iter().enumerate() {
        sorted_vectors.column_mut(dst).assign(&eigenvectors.column(src));
    }
    Ok((sorted_values, sorted_vectors))
}
