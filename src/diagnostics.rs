// src/diagnostics.rs

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::extraction::degrees_of_freedom;
use crate::linalg_backends::{sorted_eigh, BackendInverse, LinAlgBackendProvider};

/// Goodness-of-fit summary of a fitted factor model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitStatistics {
    /// ML discrepancy `tr(Σ⁻¹R) - ln|Σ⁻¹R| - p` of the implied matrix
    /// `Σ = LLᵀ + diag(u)`. `None` when Σ is not positive definite (Heywood case).
    pub objective: Option<f64>,
    /// Iterations spent estimating the unrotated solution.
    pub estimation_iterations: usize,
    pub rotation_iterations: usize,
    /// Some communality exceeds 1.
    pub heywood: bool,
    /// `((p-k)^2 - (p+k)) / 2`
    pub dof: i64,
    pub n_obs: Option<usize>,
    /// Bartlett-corrected likelihood ratio statistic, needs `n_obs`.
    pub chi_square: Option<f64>,
    /// `chi_square - dof * ln(n)`
    pub bic: Option<f64>,
    /// Root mean square error of approximation; needs `n_obs` and positive dof.
    pub rmsea: Option<f64>,
    /// Tucker-Lewis index against the independence model.
    pub tli: Option<f64>,
    /// Root mean square of the off-diagonal residuals.
    pub rmsr: f64,
    /// `1 - Σ resid² / Σ r²` over the off-diagonal entries.
    pub fit_off_diagonal: f64,
}

impl FitStatistics {
    pub(crate) fn compute(
        r: &Array2<f64>,
        loadings: &Array2<f64>,
        communalities: &Array1<f64>,
        n_obs: Option<usize>,
        estimation_iterations: usize,
        rotation_iterations: usize,
    ) -> Result<Self> {
        let (p, k) = loadings.dim();
        let dof = degrees_of_freedom(p, k);
        let common = loadings.dot(&loadings.t());
        let heywood = communalities.iter().any(|&h| h > 1.0);

        let mut sigma = common.clone();
        sigma
            .diag_mut()
            .zip_mut_with(communalities, |s, &h| *s += 1.0 - h);
        let objective = ml_discrepancy(r, &sigma)?;

        let mut chi_square = None;
        let mut bic = None;
        let mut rmsea = None;
        let mut tli = None;
        if let (Some(n), Some(f)) = (n_obs, objective) {
            let n = n as f64;
            let (pf, kf) = (p as f64, k as f64);
            let chi = (n - 1.0 - (2.0 * pf + 5.0) / 6.0 - 2.0 * kf / 3.0) * f;
            chi_square = Some(chi);
            bic = Some(chi - dof as f64 * n.ln());
            if dof > 0 {
                let df = dof as f64;
                rmsea = Some((chi / (df * (n - 1.0)) - 1.0 / (n - 1.0)).max(0.0).sqrt());
                if let Some(null_f) = ml_discrepancy(r, &Array2::eye(p))? {
                    let null_chi = (n - 1.0 - (2.0 * pf + 5.0) / 6.0) * null_f;
                    let null_df = pf * (pf - 1.0) / 2.0;
                    let null_ratio = null_chi / null_df;
                    if (null_ratio - 1.0).abs() > f64::EPSILON {
                        tli = Some((null_ratio - chi / df) / (null_ratio - 1.0));
                    }
                }
            }
        }

        let (rmsr, fit_off_diagonal) = off_diagonal_residuals(r, &common);

        Ok(Self {
            objective,
            estimation_iterations,
            rotation_iterations,
            heywood,
            dof,
            n_obs,
            chi_square,
            bic,
            rmsea,
            tli,
            rmsr,
            fit_off_diagonal,
        })
    }
}

/// ML discrepancy between the sample matrix `r` and an implied matrix `sigma`,
/// or `None` if `sigma` is not positive definite.
pub(crate) fn ml_discrepancy(r: &Array2<f64>, sigma: &Array2<f64>) -> Result<Option<f64>> {
    let p = r.nrows() as f64;
    let (sigma_values, _) = sorted_eigh(sigma)?;
    if sigma_values.iter().any(|&v| !(v > 0.0)) {
        return Ok(None);
    }
    let (r_values, _) = sorted_eigh(r)?;
    if r_values.iter().any(|&v| !(v > 0.0)) {
        return Ok(None);
    }
    let sigma_inv = LinAlgBackendProvider.inverse(sigma)?;
    let trace = (&sigma_inv * r).sum();
    let ln_det_sigma: f64 = sigma_values.iter().map(|v| v.ln()).sum();
    let ln_det_r: f64 = r_values.iter().map(|v| v.ln()).sum();
    Ok(Some(trace - ln_det_r + ln_det_sigma - p))
}

/// Root mean square and proportion-of-fit of the off-diagonal residuals `r - model`.
pub(crate) fn off_diagonal_residuals(r: &Array2<f64>, model: &Array2<f64>) -> (f64, f64) {
    let p = r.nrows();
    let mut residual_ss = 0.0;
    let mut total_ss = 0.0;
    for i in 0..p {
        for j in 0..p {
            if i != j {
                residual_ss += (r[[i, j]] - model[[i, j]]).powi(2);
                total_ss += r[[i, j]].powi(2);
            }
        }
    }
    let pairs = (p * p.saturating_sub(1)) as f64;
    let rmsr = if pairs > 0.0 { (residual_ss / pairs).sqrt() } else { 0.0 };
    let fit = if total_ss > 0.0 { 1.0 - residual_ss / total_ss } else { 1.0 };
    (rmsr, fit)
}

/// Variance accounted for by each rotated factor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarianceAccounted {
    /// `diag(Φ LᵀL)`, the sum of squared loadings of each factor.
    pub ss_loadings: Array1<f64>,
    /// `ss_loadings / p`
    pub proportion: Array1<f64>,
    pub cumulative: Array1<f64>,
}

impl VarianceAccounted {
    pub(crate) fn compute(loadings: &Array2<f64>, phi: &Array2<f64>) -> Self {
        let p = loadings.nrows() as f64;
        let ss_loadings = phi.dot(&loadings.t().dot(loadings)).diag().to_owned();
        let proportion = ss_loadings.mapv(|v| v / p);
        let mut running = 0.0;
        let cumulative = proportion.mapv(|v| {
            running += v;
            running
        });
        Self {
            ss_loadings,
            proportion,
            cumulative,
        }
    }

    /// Share of the total variance explained by all factors together.
    pub fn total_proportion(&self) -> f64 {
        self.proportion.sum()
    }
}
