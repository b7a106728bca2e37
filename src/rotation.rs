// src/rotation.rs

//! Factor rotations.
//!
//! Orthogonal and oblique criteria are optimised with the gradient projection
//! algorithm (GPA): a gradient step on the transformation matrix followed by
//! a projection back onto orthonormal matrices (orthogonal case, via SVD) or
//! onto matrices with unit-length columns (oblique case), with step halving
//! until the criterion decreases. Promax is the usual two-stage procedure on
//! top of varimax.
//!
//! Every rotation is reported as a transform `M` with `rotated = unrotated · M`
//! together with the factor correlation matrix `Φ = (MᵀM)⁻¹`.

use std::fmt;
use std::str::FromStr;

use log::debug;
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{FactorError, Result};
use crate::linalg_backends::{BackendInverse, BackendSVD, LinAlgBackendProvider, SVDOutput};

/// Exponent used to build the promax target.
pub const PROMAX_POWER: i32 = 4;

/// Default geomin smoothing constant.
pub const GEOMIN_DELTA: f64 = 0.01;

/// Maximum number of step halvings per GPA iteration.
const MAX_STEP_HALVINGS: usize = 10;

/// Rotation applied to the extracted loadings.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Default)]
pub enum Rotation {
    /// Keep the unrotated solution.
    None,
    /// Orthogonal, maximises the variance of squared loadings within columns (Kaiser normalised).
    #[default]
    Varimax,
    /// Orthogonal, maximises the variance of squared loadings within rows.
    Quartimax,
    /// Oblique, varimax followed by a least-squares fit to the powered target.
    Promax,
    /// Oblique direct oblimin; `gamma = 0` is quartimin.
    Oblimin { gamma: f64 },
    /// Oblique geomin.
    Geomin { delta: f64 },
}

impl Rotation {
    /// Whether the rotation keeps the factors uncorrelated.
    pub fn is_orthogonal(&self) -> bool {
        matches!(self, Self::None | Self::Varimax | Self::Quartimax)
    }

    /// True for rotations that let the factors correlate.
    pub fn is_oblique(&self) -> bool {
        !self.is_orthogonal()
    }

    /// Short name, as accepted by `FromStr`.
    ///
    /// # Examples
    ///
    /// ```
    /// use efficient_fa::Rotation;
    ///
    /// let rotation: Rotation = "quartimin".parse().unwrap();
    /// assert_eq!(rotation, Rotation::Oblimin { gamma: 0.0 });
    /// assert_eq!(rotation.name(), "oblimin");
    /// assert!(rotation.is_oblique());
    /// ```
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Varimax => "varimax",
            Self::Quartimax => "quartimax",
            Self::Promax => "promax",
            Self::Oblimin { .. } => "oblimin",
            Self::Geomin { .. } => "geomin",
        }
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Rotation {
    type Err = FactorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "varimax" => Ok(Self::Varimax),
            "quartimax" => Ok(Self::Quartimax),
            "promax" => Ok(Self::Promax),
            "oblimin" | "quartimin" => Ok(Self::Oblimin { gamma: 0.0 }),
            "geomin" | "geominq" => Ok(Self::Geomin {
                delta: GEOMIN_DELTA,
            }),
            other => Err(FactorError::Config(format!("unknown rotation '{}'", other))),
        }
    }
}

/// Iteration limits for the GPA loop.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RotationOptions {
    pub max_iterations: usize,
    /// Convergence threshold on the Frobenius norm of the projected gradient.
    pub tolerance: f64,
}

impl Default for RotationOptions {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            tolerance: 1e-5,
        }
    }
}

/// Result of rotating a loading matrix.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RotationResult {
    /// Rotated (pattern) loadings, shape (p, k).
    pub loadings: Array2<f64>,
    /// Transform with `loadings = unrotated · transform`, shape (k, k).
    pub transform: Array2<f64>,
    /// Factor correlations, identity for orthogonal rotations.
    pub phi: Array2<f64>,
    /// GPA iterations used (0 when no optimisation ran).
    pub iterations: usize,
    /// Criterion value at the solution.
    pub criterion: f64,
}

/// Rotates `loadings` (p x k).
///
/// With a single factor there is nothing to rotate and the identity transform
/// is returned.
pub fn rotate(loadings: &Array2<f64>, rotation: Rotation, options: &RotationOptions) -> Result<RotationResult> {
    let k = loadings.ncols();
    if k <= 1 || rotation == Rotation::None {
        return Ok(identity_result(loadings));
    }
    let result = match rotation {
        Rotation::None => identity_result(loadings),
        Rotation::Varimax => with_kaiser_normalization(loadings, |a| {
            gpa_orthogonal(a, Criterion::Varimax, options)
        })?,
        Rotation::Quartimax => gpa_orthogonal(loadings, Criterion::Quartimax, options)?,
        Rotation::Promax => promax(loadings, PROMAX_POWER, options)?,
        Rotation::Oblimin { gamma } => gpa_oblique(loadings, Criterion::Oblimin { gamma }, options)?,
        Rotation::Geomin { delta } => gpa_oblique(loadings, Criterion::Geomin { delta }, options)?,
    };
    debug!(
        "{} rotation finished after {} iterations (criterion {:.6}).",
        rotation, result.iterations, result.criterion
    );
    Ok(result)
}

fn identity_result(loadings: &Array2<f64>) -> RotationResult {
    let k = loadings.ncols();
    RotationResult {
        loadings: loadings.clone(),
        transform: Array2::eye(k),
        phi: Array2::eye(k),
        iterations: 0,
        criterion: 0.0,
    }
}

/// Rotation criteria, each returning its value and gradient with respect to the loadings.
#[derive(Clone, Copy, Debug)]
enum Criterion {
    Varimax,
    Quartimax,
    Oblimin { gamma: f64 },
    Geomin { delta: f64 },
}

impl Criterion {
    fn name(&self) -> &'static str {
        match self {
            Self::Varimax => "varimax",
            Self::Quartimax => "quartimax",
            Self::Oblimin { .. } => "oblimin",
            Self::Geomin { .. } => "geomin",
        }
    }

    fn value_and_gradient(&self, l: &Array2<f64>) -> (f64, Array2<f64>) {
        let (p, k) = l.dim();
        let l2 = l.mapv(|v| v * v);
        match *self {
            Self::Varimax => {
                let col_means = l2.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(k));
                let ql = &l2 - &col_means;
                let gradient = -(l * &ql);
                let value = -ql.mapv(|v| v * v).sum() / 4.0;
                (value, gradient)
            }
            Self::Quartimax => {
                let gradient = -l.mapv(|v| v * v * v);
                let value = -l2.mapv(|v| v * v).sum() / 4.0;
                (value, gradient)
            }
            Self::Oblimin { gamma } => {
                let off_diagonal = Array2::from_shape_fn((k, k), |(i, j)| if i == j { 0.0 } else { 1.0 });
                let mut x = l2.dot(&off_diagonal);
                if gamma != 0.0 {
                    let col_means = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(k));
                    x = &x - &(col_means * gamma);
                }
                let gradient = l * &x;
                let value = (&l2 * &x).sum() / 4.0;
                (value, gradient)
            }
            Self::Geomin { delta } => {
                let shifted = l2.mapv(|v| v + delta);
                let row_products = shifted.map_axis(Axis(1), |row| {
                    (row.mapv(f64::ln).sum() / k as f64).exp()
                });
                let mut gradient = Array2::<f64>::zeros((p, k));
                for i in 0..p {
                    for j in 0..k {
                        gradient[[i, j]] =
                            (2.0 / k as f64) * l[[i, j]] / shifted[[i, j]] * row_products[i];
                    }
                }
                (row_products.sum(), gradient)
            }
        }
    }
}

fn frobenius(m: &Array2<f64>) -> f64 {
    m.iter().map(|v| v * v).sum::<f64>().sqrt()
}

fn non_convergence(criterion: Criterion, iterations: usize, residual: f64) -> FactorError {
    FactorError::NonConvergence {
        stage: format!("{} rotation", criterion.name()),
        iterations,
        residual,
    }
}

/// Divides each row by its length, rotates, and scales the rows back.
fn with_kaiser_normalization<F>(loadings: &Array2<f64>, rotate_fn: F) -> Result<RotationResult>
where
    F: FnOnce(&Array2<f64>) -> Result<RotationResult>,
{
    let row_norms = loadings.map_axis(Axis(1), |row| {
        let norm = row.dot(&row).sqrt();
        if norm > 1e-12 {
            norm
        } else {
            1.0
        }
    });
    let normalized = loadings / &row_norms.view().insert_axis(Axis(1));
    let mut result = rotate_fn(&normalized)?;
    result.loadings *= &row_norms.view().insert_axis(Axis(1));
    Ok(result)
}

/// Orthogonal GPA: T stays orthonormal, `rotated = A T`.
fn gpa_orthogonal(a: &Array2<f64>, criterion: Criterion, options: &RotationOptions) -> Result<RotationResult> {
    let k = a.ncols();
    let mut t = Array2::<f64>::eye(k);
    let mut l = a.dot(&t);
    let (mut f, mut gq) = criterion.value_and_gradient(&l);
    let mut alpha = 1.0;
    let mut residual = f64::INFINITY;

    for iteration in 0..=options.max_iterations {
        let g = a.t().dot(&gq);
        let m = t.t().dot(&g);
        let s = (&m + &m.t()) * 0.5;
        let gp = &g - &t.dot(&s);
        residual = frobenius(&gp);
        if residual < options.tolerance {
            return Ok(RotationResult {
                loadings: l,
                transform: t,
                phi: Array2::eye(k),
                iterations: iteration,
                criterion: f,
            });
        }
        if iteration == options.max_iterations {
            break;
        }

        alpha *= 2.0;
        let mut trial = None;
        for _ in 0..=MAX_STEP_HALVINGS {
            let x = &t - &(&gp * alpha);
            let SVDOutput { u, vt, .. } = LinAlgBackendProvider.svd(&x)?;
            let t_trial = u.dot(&vt);
            let l_trial = a.dot(&t_trial);
            let (f_trial, gq_trial) = criterion.value_and_gradient(&l_trial);
            let accepted = f_trial < f - 0.5 * residual * residual * alpha;
            trial = Some((t_trial, l_trial, f_trial, gq_trial));
            if accepted {
                break;
            }
            alpha /= 2.0;
        }
        let Some(next) = trial else {
            return Err(FactorError::Numerical(format!(
                "{} rotation made no step",
                criterion.name()
            )));
        };
        (t, l, f, gq) = next;
        if !f.is_finite() {
            return Err(FactorError::Numerical(format!(
                "{} criterion became non-finite",
                criterion.name()
            )));
        }
    }
    Err(non_convergence(criterion, options.max_iterations, residual))
}

/// Oblique GPA: columns of T have unit length, `rotated = A (Tᵀ)⁻¹`, `Φ = TᵀT`.
fn gpa_oblique(a: &Array2<f64>, criterion: Criterion, options: &RotationOptions) -> Result<RotationResult> {
    let backend = LinAlgBackendProvider;
    let k = a.ncols();
    let mut t = Array2::<f64>::eye(k);
    let mut t_inv = Array2::<f64>::eye(k);
    let mut l = a.dot(&t_inv.t());
    let (mut f, mut gq) = criterion.value_and_gradient(&l);
    let mut alpha = 1.0;
    let mut residual = f64::INFINITY;

    for iteration in 0..=options.max_iterations {
        let g = -l.t().dot(&gq).dot(&t_inv).reversed_axes();
        let col_sums = (&t * &g).sum_axis(Axis(0));
        let gp = &g - &(&t * &col_sums);
        residual = frobenius(&gp);
        if residual < options.tolerance {
            let phi = t.t().dot(&t);
            return Ok(RotationResult {
                loadings: l,
                transform: t_inv.reversed_axes(),
                phi,
                iterations: iteration,
                criterion: f,
            });
        }
        if iteration == options.max_iterations {
            break;
        }

        alpha *= 2.0;
        let mut trial = None;
        for _ in 0..=MAX_STEP_HALVINGS {
            let x = &t - &(&gp * alpha);
            let norms = x.map_axis(Axis(0), |col| col.dot(&col).sqrt());
            if norms.iter().any(|&n| !n.is_finite() || n <= 0.0) {
                alpha /= 2.0;
                continue;
            }
            let t_trial = &x / &norms;
            let t_inv_trial = backend.inverse(&t_trial)?;
            let l_trial = a.dot(&t_inv_trial.t());
            let (f_trial, gq_trial) = criterion.value_and_gradient(&l_trial);
            let accepted = f_trial < f - 0.5 * residual * residual * alpha;
            trial = Some((t_trial, t_inv_trial, l_trial, f_trial, gq_trial));
            if accepted {
                break;
            }
            alpha /= 2.0;
        }
        let Some(next) = trial else {
            return Err(FactorError::Numerical(format!(
                "{} rotation produced a degenerate transformation",
                criterion.name()
            )));
        };
        (t, t_inv, l, f, gq) = next;
        if !f.is_finite() {
            return Err(FactorError::Numerical(format!(
                "{} criterion became non-finite",
                criterion.name()
            )));
        }
    }
    Err(non_convergence(criterion, options.max_iterations, residual))
}

/// Promax: varimax, then a least-squares fit towards `x · |x|^(power-1)`.
fn promax(loadings: &Array2<f64>, power: i32, options: &RotationOptions) -> Result<RotationResult> {
    let backend = LinAlgBackendProvider;
    let varimax = with_kaiser_normalization(loadings, |a| {
        gpa_orthogonal(a, Criterion::Varimax, options)
    })?;
    let x = &varimax.loadings;
    let target = x.mapv(|v| v * v.abs().powi(power - 1));

    // U = (xᵀx)⁻¹ xᵀ Q, then rescale its columns so the factors have unit variance.
    let xtx_inv = backend.inverse(&x.t().dot(x))?;
    let mut u = xtx_inv.dot(&x.t()).dot(&target);
    let utu_inv = backend.inverse(&u.t().dot(&u))?;
    let scale = utu_inv.diag().mapv(|d| d.max(0.0).sqrt());
    u *= &scale;

    let rotated = x.dot(&u);
    let transform = varimax.transform.dot(&u);
    let u_inv = backend.inverse(&u)?;
    let phi = u_inv.dot(&u_inv.t());
    Ok(RotationResult {
        loadings: rotated,
        transform,
        phi,
        iterations: varimax.iterations,
        criterion: varimax.criterion,
    })
}

/// Reflects factors so every column of loadings sums to a non-negative value
/// and orders them by decreasing sum of squared loadings. `Φ` and the
/// transform follow the same permutation and reflection.
pub(crate) fn align_factors(result: RotationResult) -> RotationResult {
    let RotationResult {
        loadings,
        transform,
        phi,
        iterations,
        criterion,
    } = result;
    let k = loadings.ncols();
    let signs: Vec<f64> = loadings
        .sum_axis(Axis(0))
        .iter()
        .map(|&s| if s < 0.0 { -1.0 } else { 1.0 })
        .collect();
    let ss = loadings.mapv(|v| v * v).sum_axis(Axis(0));
    let mut order: Vec<usize> = (0..k).collect();
    order.sort_by(|&a, &b| ss[b].partial_cmp(&ss[a]).unwrap_or(std::cmp::Ordering::Equal));

    let mut new_loadings = Array2::<f64>::zeros(loadings.raw_dim());
    let mut new_transform = Array2::<f64>::zeros(transform.raw_dim());
    let mut new_phi = Array2::<f64>::zeros(phi.raw_dim());
    for (dst, &src) in order.iter().enumerate() {
        new_loadings
            .column_mut(dst)
            .assign(&loadings.column(src).mapv(|v| v * signs[src]));
        new_transform
            .column_mut(dst)
            .assign(&transform.column(src).mapv(|v| v * signs[src]));
        for (dst2, &src2) in order.iter().enumerate() {
            new_phi[[dst, dst2]] = phi[[src, src2]] * signs[src] * signs[src2];
        }
    }
    RotationResult {
        loadings: new_loadings,
        transform: new_transform,
        phi: new_phi,
        iterations,
        criterion,
    }
}
