// src/extraction.rs

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use log::{debug, info, warn};
use ndarray::{s, Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::correlation::CorrelationMatrix;
use crate::diagnostics::FitStatistics;
use crate::error::{FactorError, Result};
use crate::linalg_backends::{sorted_eigh, BackendInverse, LinAlgBackendProvider};
use crate::model::FactorModel;
use crate::rotation::{align_factors, rotate, Rotation, RotationOptions};
use crate::standardize::StandardizedDataset;

/// Uniquenesses are kept inside [MIN_UNIQUENESS, 1] while iterating.
pub const MIN_UNIQUENESS: f64 = 0.005;

/// Step halvings tried before the line search gives up on a direction.
const MAX_LINE_SEARCH_HALVINGS: usize = 30;
const ARMIJO_SLOPE: f64 = 1e-4;
const CURVATURE_EPSILON: f64 = 1e-12;

/// How the unrotated loadings are estimated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EstimationMethod {
    /// Iterated principal axis: eigendecompose the reduced correlation matrix
    /// and refresh the communalities on its diagonal until they settle.
    PrincipalAxis,
    /// Minimum residual / unweighted least squares over the uniquenesses.
    #[default]
    MinimumResidual,
    /// Maximum likelihood (Jöreskog's concentrated likelihood over the uniquenesses).
    MaximumLikelihood,
}

impl EstimationMethod {
    /// Short name, as accepted by `FromStr`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PrincipalAxis => "pa",
            Self::MinimumResidual => "minres",
            Self::MaximumLikelihood => "ml",
        }
    }
}

impl fmt::Display for EstimationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EstimationMethod {
    type Err = FactorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "pa" | "principal-axis" => Ok(Self::PrincipalAxis),
            "minres" | "uls" | "minimum-residual" => Ok(Self::MinimumResidual),
            "ml" | "mle" | "maximum-likelihood" => Ok(Self::MaximumLikelihood),
            other => Err(FactorError::Config(format!(
                "unknown estimation method '{}'",
                other
            ))),
        }
    }
}

/// Options for a single exploratory factor analysis.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FactorAnalysisConfig {
    /// Number of factors to extract, 1 <= k < p.
    pub n_factors: usize,
    pub method: EstimationMethod,
    pub rotation: Rotation,
    /// Iteration cap for the estimation loop.
    pub max_iterations: usize,
    /// Convergence threshold on the largest change of a uniqueness (or communality) between iterations.
    pub tolerance: f64,
    pub rotation_max_iterations: usize,
    pub rotation_tolerance: f64,
    /// Number of subjects, used for chi-square based fit statistics.
    /// Falls back to the correlation matrix's own count when `None`.
    pub n_obs: Option<usize>,
}

impl Default for FactorAnalysisConfig {
    fn default() -> Self {
        FactorAnalysisConfig {
            n_factors: 1,
            method: EstimationMethod::MinimumResidual,
            rotation: Rotation::Varimax,
            max_iterations: 1000,
            tolerance: 1e-6,
            rotation_max_iterations: 1000,
            rotation_tolerance: 1e-5,
            n_obs: None,
        }
    }
}

impl FactorAnalysisConfig {
    /// Shorthand for the default configuration with `n_factors` factors.
    pub fn with_factors(n_factors: usize) -> Self {
        Self {
            n_factors,
            ..Self::default()
        }
    }

    fn rotation_options(&self) -> RotationOptions {
        RotationOptions {
            max_iterations: self.rotation_max_iterations,
            tolerance: self.rotation_tolerance,
        }
    }

    /// Checks the configuration against a problem with `n_variables` variables.
    pub fn validate(&self, n_variables: usize) -> Result<()> {
        let k = self.n_factors;
        let p = n_variables;
        if k == 0 {
            return Err(FactorError::Config("n_factors must be at least 1".into()));
        }
        if k >= p {
            return Err(FactorError::Config(format!(
                "n_factors ({}) must be smaller than the number of variables ({})",
                k, p
            )));
        }
        if degrees_of_freedom(p, k) < 0 {
            return Err(FactorError::Config(format!(
                "{} factors are under-identified with {} variables (negative degrees of freedom)",
                k, p
            )));
        }
        if self.max_iterations == 0 || self.rotation_max_iterations == 0 {
            return Err(FactorError::Config("iteration limits must be positive".into()));
        }
        if !(self.tolerance > 0.0) || !(self.rotation_tolerance > 0.0) {
            return Err(FactorError::Config("tolerances must be positive".into()));
        }
        Ok(())
    }
}

/// Degrees of freedom of a k-factor model for p variables, `((p-k)^2 - (p+k)) / 2`.
///
/// Negative values mean the model has more free parameters than distinct
/// correlations and cannot be identified.
///
/// # Examples
///
/// ```
/// use efficient_fa::degrees_of_freedom;
///
/// assert_eq!(degrees_of_freedom(8, 2), 13);
/// assert!(degrees_of_freedom(5, 3) < 0);
/// ```
pub fn degrees_of_freedom(p: usize, k: usize) -> i64 {
    let (p, k) = (p as i64, k as i64);
    ((p - k).pow(2) - (p + k)) / 2
}

/// Unrotated solution produced by one of the estimation methods.
#[derive(Clone, Debug)]
pub(crate) struct Extraction {
    /// Shape: (p, k)
    pub loadings: Array2<f64>,
    pub iterations: usize,
}

/// Runs exploratory factor analyses with a fixed configuration.
#[derive(Clone, Debug)]
pub struct FactorAnalysis {
    config: FactorAnalysisConfig,
}

impl FactorAnalysis {
    /// Creates an analysis; the configuration is validated when fitting.
    pub fn new(config: FactorAnalysisConfig) -> Self {
        Self { config }
    }

    /// The configuration every fit uses.
    pub fn config(&self) -> &FactorAnalysisConfig {
        &self.config
    }

    /// Fits the model to a standardized dataset.
    pub fn fit_dataset(&self, standardized: &StandardizedDataset) -> Result<FactorModel> {
        self.fit(&CorrelationMatrix::from_standardized(standardized))
    }

    /// Fits the model to a correlation matrix.
    ///
    /// # Errors
    /// - `Config` when the factor count is not identified for this many variables.
    /// - `SingularCorrelation` when the matrix is (near-)singular.
    /// - `NonConvergence` when estimation or rotation runs out of iterations.
    pub fn fit(&self, correlation: &CorrelationMatrix) -> Result<FactorModel> {
        let config = &self.config;
        let p = correlation.dim();
        let k = config.n_factors;
        config.validate(p)?;
        correlation.ensure_nonsingular()?;

        let start_time = Instant::now();
        info!(
            "Fitting {} factor(s) to {} variables (method {}, rotation {}).",
            k, p, config.method, config.rotation
        );

        let r = correlation.matrix().to_owned();
        let smc = correlation.smc()?;
        let extraction = match config.method {
            EstimationMethod::PrincipalAxis => principal_axis(&r, k, &smc, config)?,
            EstimationMethod::MinimumResidual | EstimationMethod::MaximumLikelihood => {
                let psi0 = smc.mapv(|h| (1.0 - h).clamp(MIN_UNIQUENESS, 1.0));
                descend_uniquenesses(&r, k, psi0, config)?
            }
        };
        let unrotated = reflect_columns(extraction.loadings);
        if unrotated.iter().any(|v| !v.is_finite()) {
            return Err(FactorError::Numerical(
                "extraction produced non-finite loadings".into(),
            ));
        }

        let rotation = align_factors(rotate(&unrotated, config.rotation, &config.rotation_options())?);

        let communalities = unrotated.mapv(|v| v * v).sum_axis(Axis(1));
        if let Some(i) = communalities.iter().position(|&h| h > 1.0) {
            warn!(
                "Heywood case: communality of '{}' is {:.4} (> 1).",
                correlation.names()[i],
                communalities[i]
            );
        }

        let n_obs = config.n_obs.or(correlation.n_obs());
        let fit = FitStatistics::compute(
            &r,
            &unrotated,
            &communalities,
            n_obs,
            extraction.iterations,
            rotation.iterations,
        )?;

        let structure = rotation.loadings.dot(&rotation.phi);
        let r_inv = LinAlgBackendProvider.inverse(&r)?;
        let score_weights = r_inv.dot(&structure);

        info!(
            "Fitted {} factor(s) in {:?} ({} estimation iterations, {} rotation iterations).",
            k,
            start_time.elapsed(),
            extraction.iterations,
            rotation.iterations
        );

        Ok(FactorModel::new(
            correlation.names().to_vec(),
            config.method,
            config.rotation,
            unrotated,
            rotation,
            communalities,
            score_weights,
            fit,
        ))
    }
}

/// Top-k principal axis loadings of `r` with `h2` on the diagonal.
pub(crate) fn principal_axis_loadings(r: &Array2<f64>, h2: &Array1<f64>, k: usize) -> Result<Array2<f64>> {
    let mut reduced = r.clone();
    reduced.diag_mut().assign(h2);
    let (values, vectors) = sorted_eigh(&reduced)?;
    let mut loadings = vectors.slice(s![.., ..k]).to_owned();
    for (j, mut column) in loadings.axis_iter_mut(Axis(1)).enumerate() {
        column *= values[j].max(0.0).sqrt();
    }
    Ok(loadings)
}

/// Iterated principal axis factoring.
fn principal_axis(
    r: &Array2<f64>,
    k: usize,
    smc: &Array1<f64>,
    config: &FactorAnalysisConfig,
) -> Result<Extraction> {
    let mut h2 = smc.mapv(|h| h.clamp(0.0, 1.0));
    let mut change = f64::INFINITY;
    for iteration in 1..=config.max_iterations {
        let loadings = principal_axis_loadings(r, &h2, k)?;
        let next = loadings.mapv(|v| v * v).sum_axis(Axis(1)).mapv(|h| h.min(1.0));
        change = next
            .iter()
            .zip(h2.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        if !change.is_finite() {
            return Err(FactorError::Numerical(
                "principal axis communalities became non-finite".into(),
            ));
        }
        h2 = next;
        if change < config.tolerance {
            debug!("Principal axis converged after {} iterations.", iteration);
            return Ok(Extraction {
                loadings: principal_axis_loadings(r, &h2, k)?,
                iterations: iteration,
            });
        }
    }
    Err(FactorError::NonConvergence {
        stage: "principal axis".into(),
        iterations: config.max_iterations,
        residual: change,
    })
}

/// Loadings, discrepancy and its gradient for a candidate set of uniquenesses.
struct Evaluation {
    loadings: Array2<f64>,
    objective: f64,
    /// d objective / d psi
    gradient: Array1<f64>,
}

/// `h² + ψ - 1`, the negated diagonal of the residual matrix.
fn diagonal_misfit(loadings: &Array2<f64>, psi: &Array1<f64>) -> Array1<f64> {
    let h2 = loadings.mapv(|v| v * v).sum_axis(Axis(1));
    h2 + psi - 1.0
}

/// ULS: loadings from the reduced matrix, squared residual over every entry.
fn evaluate_uls(r: &Array2<f64>, psi: &Array1<f64>, k: usize) -> Result<Evaluation> {
    let h2 = psi.mapv(|u| 1.0 - u);
    let loadings = principal_axis_loadings(r, &h2, k)?;
    let mut residual = r - &loadings.dot(&loadings.t());
    residual.diag_mut().zip_mut_with(psi, |d, u| *d -= u);
    let objective = residual.mapv(|v| v * v).sum() / 2.0;
    let gradient = diagonal_misfit(&loadings, psi);
    Ok(Evaluation {
        loadings,
        objective,
        gradient,
    })
}

/// ML: eigendecomposition of Ψ^{-1/2} R Ψ^{-1/2} gives both the loadings and
/// the concentrated discrepancy `Σ_{j>k} (θ_j - ln θ_j) - (p - k)`.
fn evaluate_ml(r: &Array2<f64>, psi: &Array1<f64>, k: usize) -> Result<Evaluation> {
    let p = r.nrows();
    let inv_sqrt = psi.mapv(|u| 1.0 / u.sqrt());
    let scaled = r * &inv_sqrt.view().insert_axis(Axis(1)) * &inv_sqrt.view().insert_axis(Axis(0));
    let (values, vectors) = sorted_eigh(&scaled)?;
    if values.iter().any(|&v| !(v > 0.0)) {
        return Err(FactorError::Numerical(
            "scaled correlation matrix is not positive definite".into(),
        ));
    }
    let objective = values
        .slice(s![k..])
        .iter()
        .map(|&theta| theta - theta.ln())
        .sum::<f64>()
        - (p - k) as f64;
    let mut loadings = vectors.slice(s![.., ..k]).to_owned();
    for (j, mut column) in loadings.axis_iter_mut(Axis(1)).enumerate() {
        column *= (values[j] - 1.0).max(0.0).sqrt();
    }
    let sqrt_psi = psi.mapv(f64::sqrt);
    loadings *= &sqrt_psi.view().insert_axis(Axis(1));
    let gradient = diagonal_misfit(&loadings, psi) / &psi.mapv(|u| u * u);
    Ok(Evaluation {
        loadings,
        objective,
        gradient,
    })
}

/// Starting inverse Hessian. Its first step moves every uniqueness to `1 - h²`.
fn initial_inverse_hessian(method: EstimationMethod, psi: &Array1<f64>) -> Array2<f64> {
    match method {
        EstimationMethod::MaximumLikelihood => Array2::from_diag(&psi.mapv(|u| u * u)),
        _ => Array2::eye(psi.len()),
    }
}

/// `-H g` restricted to the uniquenesses not held at a bound.
fn search_direction(inverse_hessian: &Array2<f64>, gradient: &Array1<f64>, free: &[bool]) -> Array1<f64> {
    let masked = Array1::from_shape_fn(gradient.len(), |i| if free[i] { gradient[i] } else { 0.0 });
    let mut direction = -inverse_hessian.dot(&masked);
    for (d, &is_free) in direction.iter_mut().zip(free) {
        if !is_free {
            *d = 0.0;
        }
    }
    direction
}

/// BFGS update of the inverse Hessian; skipped when the curvature condition fails.
fn bfgs_update(inverse_hessian: &mut Array2<f64>, s: &Array1<f64>, y: &Array1<f64>) {
    let sy = s.dot(y);
    if !(sy > CURVATURE_EPSILON * (s.dot(s) * y.dot(y)).sqrt()) {
        return;
    }
    let rho = 1.0 / sy;
    let hy = inverse_hessian.dot(y);
    let yhy = y.dot(&hy);
    let column = |v: &Array1<f64>| v.view().insert_axis(Axis(1)).to_owned();
    let row = |v: &Array1<f64>| v.view().insert_axis(Axis(0)).to_owned();
    let cross = column(&hy).dot(&row(s)) + column(s).dot(&row(&hy));
    let ss = column(s).dot(&row(s));
    *inverse_hessian = &*inverse_hessian - &(cross * rho) + &(ss * (rho * rho * yhy + rho));
}

/// Armijo backtracking along `direction`, projecting each trial onto the box.
/// `None` when no step up to `MAX_LINE_SEARCH_HALVINGS` halvings decreases the discrepancy enough.
fn backtrack<F>(
    evaluate: &F,
    psi: &Array1<f64>,
    direction: &Array1<f64>,
    objective: f64,
    slope: f64,
) -> Result<Option<(Array1<f64>, Evaluation)>>
where
    F: Fn(&Array1<f64>) -> Result<Evaluation>,
{
    let mut step = 1.0;
    for _ in 0..MAX_LINE_SEARCH_HALVINGS {
        let candidate = Array1::from_shape_fn(psi.len(), |i| {
            (psi[i] + step * direction[i]).clamp(MIN_UNIQUENESS, 1.0)
        });
        let trial = evaluate(&candidate)?;
        if trial.objective <= objective + ARMIJO_SLOPE * step * slope {
            return Ok(Some((candidate, trial)));
        }
        step *= 0.5;
    }
    Ok(None)
}

/// Largest gradient component among the uniquenesses not held at a bound.
fn free_gradient_norm(gradient: &Array1<f64>, free: &[bool]) -> f64 {
    gradient
        .iter()
        .zip(free)
        .filter(|(_, is_free)| **is_free)
        .fold(0.0_f64, |m, (g, _)| m.max(g.abs()))
}

/// Ends the descent at a point where even a fresh steepest-descent search
/// finds no decrease. Only a stationary point counts as converged.
fn accept_stalled_point(
    stage: &str,
    iteration: usize,
    current: Evaluation,
    free: &[bool],
    tolerance: f64,
) -> Result<Extraction> {
    let residual = free_gradient_norm(&current.gradient, free);
    if residual > tolerance {
        warn!(
            "{} line search stalled at iteration {} with free gradient {:.3e}.",
            stage, iteration, residual
        );
        return Err(FactorError::NonConvergence {
            stage: stage.into(),
            iterations: iteration,
            residual,
        });
    }
    debug!(
        "{} line search found no decrease at iteration {}; gradient {:.3e} is stationary.",
        stage, iteration, residual
    );
    Ok(Extraction {
        loadings: current.loadings,
        iterations: iteration,
    })
}

/// Minimises the method's discrepancy over the uniquenesses with projected
/// BFGS on the box `[MIN_UNIQUENESS, 1]`.
///
/// Both gradients are the residual diagonal `h² + ψ - 1` scaled by positive
/// weights, so the first step is the classic update `ψ ← 1 - h²`.
fn descend_uniquenesses(
    r: &Array2<f64>,
    k: usize,
    psi0: Array1<f64>,
    config: &FactorAnalysisConfig,
) -> Result<Extraction> {
    let evaluate = |psi: &Array1<f64>| match config.method {
        EstimationMethod::MaximumLikelihood => evaluate_ml(r, psi, k),
        _ => evaluate_uls(r, psi, k),
    };
    let stage = match config.method {
        EstimationMethod::MaximumLikelihood => "maximum likelihood",
        _ => "minimum residual",
    };

    let mut psi = psi0;
    let mut current = evaluate(&psi)?;
    let mut inverse_hessian = initial_inverse_hessian(config.method, &psi);
    let mut change = f64::INFINITY;

    for iteration in 1..=config.max_iterations {
        let free: Vec<bool> = psi
            .iter()
            .zip(current.gradient.iter())
            .map(|(&u, &g)| !((u <= MIN_UNIQUENESS && g > 0.0) || (u >= 1.0 && g < 0.0)))
            .collect();
        let mut direction = search_direction(&inverse_hessian, &current.gradient, &free);
        let mut slope = direction.dot(&current.gradient);
        if !(slope < 0.0) {
            inverse_hessian = initial_inverse_hessian(config.method, &psi);
            direction = search_direction(&inverse_hessian, &current.gradient, &free);
            slope = direction.dot(&current.gradient);
        }
        if !(slope < 0.0) {
            debug!(
                "{} projected gradient vanished at iteration {}.",
                stage, iteration
            );
            return Ok(Extraction {
                loadings: current.loadings,
                iterations: iteration,
            });
        }

        let mut accepted = backtrack(&evaluate, &psi, &direction, current.objective, slope)?;
        if accepted.is_none() {
            inverse_hessian = initial_inverse_hessian(config.method, &psi);
            direction = search_direction(&inverse_hessian, &current.gradient, &free);
            slope = direction.dot(&current.gradient);
            if slope < 0.0 {
                accepted = backtrack(&evaluate, &psi, &direction, current.objective, slope)?;
            }
        }
        let Some((candidate, trial)) = accepted else {
            return accept_stalled_point(stage, iteration, current, &free, config.tolerance);
        };

        if !trial.objective.is_finite() || trial.gradient.iter().any(|g| !g.is_finite()) {
            return Err(FactorError::Numerical(format!(
                "{} discrepancy became non-finite",
                stage
            )));
        }
        let s_step = &candidate - &psi;
        let y_step = &trial.gradient - &current.gradient;
        change = s_step.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        bfgs_update(&mut inverse_hessian, &s_step, &y_step);
        psi = candidate;
        current = trial;
        if change < config.tolerance {
            debug!(
                "{} converged after {} iterations (discrepancy {:.6e}).",
                stage, iteration, current.objective
            );
            return Ok(Extraction {
                loadings: current.loadings,
                iterations: iteration,
            });
        }
    }
    Err(FactorError::NonConvergence {
        stage: stage.into(),
        iterations: config.max_iterations,
        residual: change,
    })
}

/// Flips each column so its loadings sum to a non-negative value.
fn reflect_columns(mut loadings: Array2<f64>) -> Array2<f64> {
    for mut column in loadings.axis_iter_mut(Axis(1)) {
        if column.sum() < 0.0 {
            column.mapv_inplace(|v| -v);
        }
    }
    loadings
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// Correlations implied exactly by a one-factor model.
    fn one_factor_correlation() -> CorrelationMatrix {
        let lambda = array![0.9, 0.8, 0.7, 0.6, 0.5];
        let p = lambda.len();
        let m = Array2::from_shape_fn((p, p), |(i, j)| {
            if i == j {
                1.0
            } else {
                lambda[i] * lambda[j]
            }
        });
        let names = (1..=p).map(|i| format!("x{}", i)).collect();
        CorrelationMatrix::from_matrix(names, m, Some(500)).unwrap()
    }

    #[test]
    fn every_method_recovers_an_exact_one_factor_model() {
        let r = one_factor_correlation();
        let expected = [0.9, 0.8, 0.7, 0.6, 0.5];
        for method in [
            EstimationMethod::PrincipalAxis,
            EstimationMethod::MinimumResidual,
            EstimationMethod::MaximumLikelihood,
        ] {
            let config = FactorAnalysisConfig {
                n_factors: 1,
                method,
                ..FactorAnalysisConfig::default()
            };
            let model = FactorAnalysis::new(config).fit(&r).unwrap();
            for (i, &l) in expected.iter().enumerate() {
                assert_abs_diff_eq!(model.loadings()[[i, 0]], l, epsilon = 1e-3);
                assert_abs_diff_eq!(model.uniquenesses()[i], 1.0 - l * l, epsilon = 2e-3);
            }
        }
    }

    #[test]
    fn factor_count_must_be_below_variable_count() {
        let r = one_factor_correlation();
        for k in [5, 6] {
            let err = FactorAnalysis::new(FactorAnalysisConfig::with_factors(k))
                .fit(&r)
                .unwrap_err();
            assert!(matches!(err, FactorError::Config(_)), "k = {}: {:?}", k, err);
        }
        // Three factors on five variables leave negative degrees of freedom.
        assert!(matches!(
            FactorAnalysisConfig::with_factors(3).validate(5),
            Err(FactorError::Config(_))
        ));
        assert!(matches!(
            FactorAnalysisConfig::with_factors(0).validate(5),
            Err(FactorError::Config(_))
        ));
    }

    #[test]
    fn overfactored_models_still_converge() {
        let l = array![
            [0.8, 0.0],
            [0.8, 0.0],
            [0.7, 0.0],
            [0.7, 0.0],
            [0.0, 0.8],
            [0.0, 0.7],
            [0.0, 0.7],
            [0.0, 0.6]
        ];
        let p = l.nrows();
        let common = l.dot(&l.t());
        let wobble = |i: usize, j: usize| 0.02 * (((i * 7 + j * 3) % 5) as f64 - 2.0);
        let m = Array2::from_shape_fn((p, p), |(i, j)| {
            if i == j {
                1.0
            } else {
                common[[i, j]] + 0.5 * (wobble(i, j) + wobble(j, i))
            }
        });
        let names = (1..=p).map(|i| format!("x{}", i)).collect();
        let r = CorrelationMatrix::from_matrix(names, m, Some(300)).unwrap();
        for method in [EstimationMethod::MinimumResidual, EstimationMethod::MaximumLikelihood] {
            let config = FactorAnalysisConfig {
                n_factors: 3,
                method,
                ..FactorAnalysisConfig::default()
            };
            let model = FactorAnalysis::new(config).fit(&r).unwrap();
            assert!(model.fit().estimation_iterations < 100, "{}", method);
        }
    }

    #[test]
    fn stalled_search_away_from_a_stationary_point_is_not_converged() {
        // |ψ₀ - 0.5| has a kink at 0.5: the one-sided gradient promises a
        // decrease that no step delivers.
        let kinked = |psi: &Array1<f64>| -> Result<Evaluation> {
            let x = psi[0] - 0.5;
            Ok(Evaluation {
                loadings: Array2::zeros((1, 1)),
                objective: x.abs(),
                gradient: array![if x < 0.0 { -1.0 } else { 1.0 }],
            })
        };
        let psi = array![0.5];
        let current = kinked(&psi).unwrap();
        let direction = -&current.gradient;
        let slope = direction.dot(&current.gradient);
        assert!(backtrack(&kinked, &psi, &direction, current.objective, slope)
            .unwrap()
            .is_none());

        match accept_stalled_point("minimum residual", 7, current, &[true], 1e-6) {
            Err(FactorError::NonConvergence {
                iterations,
                residual,
                ..
            }) => {
                assert_eq!(iterations, 7);
                assert_abs_diff_eq!(residual, 1.0);
            }
            other => panic!("expected non-convergence, got {:?}", other.map(|e| e.iterations)),
        }

        // The same stall at a bound, or with a vanishing gradient, is a solution.
        let at_bound = kinked(&psi).unwrap();
        assert!(accept_stalled_point("minimum residual", 7, at_bound, &[false], 1e-6).is_ok());
        let flat = Evaluation {
            loadings: Array2::zeros((1, 1)),
            objective: 0.0,
            gradient: array![1e-9],
        };
        let extraction = accept_stalled_point("maximum likelihood", 3, flat, &[true], 1e-6).unwrap();
        assert_eq!(extraction.iterations, 3);
    }

    #[test]
    fn degrees_of_freedom_formula() {
        assert_eq!(degrees_of_freedom(6, 2), 4);
        assert_eq!(degrees_of_freedom(5, 1), 5);
        assert_eq!(degrees_of_freedom(5, 3), -2);
    }

    #[test]
    fn non_convergence_is_reported() {
        let config = FactorAnalysisConfig {
            n_factors: 1,
            method: EstimationMethod::PrincipalAxis,
            max_iterations: 1,
            tolerance: 1e-15,
            ..FactorAnalysisConfig::default()
        };
        match FactorAnalysis::new(config).fit(&one_factor_correlation()) {
            Err(FactorError::NonConvergence { iterations, .. }) => assert_eq!(iterations, 1),
            other => panic!("expected non-convergence, got {:?}", other),
        }
    }

    #[test]
    fn method_names_parse() {
        assert_eq!(
            "principal_axis".parse::<EstimationMethod>().unwrap(),
            EstimationMethod::PrincipalAxis
        );
        assert_eq!(
            "ULS".parse::<EstimationMethod>().unwrap(),
            EstimationMethod::MinimumResidual
        );
        assert_eq!(
            "ml".parse::<EstimationMethod>().unwrap(),
            EstimationMethod::MaximumLikelihood
        );
        assert!("wls".parse::<EstimationMethod>().is_err());
        assert_eq!(EstimationMethod::MaximumLikelihood.to_string(), "ml");
    }
}
