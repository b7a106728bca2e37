// src/model.rs

use std::fmt;
use std::fmt::Write as _;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::diagnostics::{FitStatistics, VarianceAccounted};
use crate::error::{FactorError, Result};
use crate::extraction::EstimationMethod;
use crate::rotation::{Rotation, RotationResult};
use crate::standardize::StandardizedDataset;

/// A fitted exploratory factor model.
///
/// Communalities are the row sums of squared *unrotated* loadings and the
/// uniquenesses are derived from them (`u = 1 - h²`), so the two always add
/// up to one. For orthogonal rotations the rotated loadings have the same row
/// sums of squares; for oblique rotations the communality equals
/// `diag(L Φ Lᵀ)` of the rotated pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorModel {
    names: Vec<String>,
    method: EstimationMethod,
    rotation: Rotation,
    /// Shape: (p, k)
    unrotated_loadings: Array2<f64>,
    /// Rotated pattern loadings, shape (p, k).
    loadings: Array2<f64>,
    /// `loadings = unrotated_loadings · rotation_matrix`
    rotation_matrix: Array2<f64>,
    /// Factor correlations, shape (k, k).
    phi: Array2<f64>,
    communalities: Array1<f64>,
    uniquenesses: Array1<f64>,
    /// Regression (Thurstone) scoring weights `R⁻¹ L Φ`, shape (p, k).
    score_weights: Array2<f64>,
    fit: FitStatistics,
}

impl FactorModel {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        names: Vec<String>,
        method: EstimationMethod,
        rotation: Rotation,
        unrotated_loadings: Array2<f64>,
        rotated: RotationResult,
        communalities: Array1<f64>,
        score_weights: Array2<f64>,
        fit: FitStatistics,
    ) -> Self {
        let uniquenesses = communalities.mapv(|h| 1.0 - h);
        Self {
            names,
            method,
            rotation,
            unrotated_loadings,
            loadings: rotated.loadings,
            rotation_matrix: rotated.transform,
            phi: rotated.phi,
            communalities,
            uniquenesses,
            score_weights,
            fit,
        }
    }

    /// Variable names, in loading-row order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Estimation method the model was fitted with.
    pub fn method(&self) -> EstimationMethod {
        self.method
    }

    /// Rotation applied to the unrotated loadings.
    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    /// Number of factors, k.
    pub fn n_factors(&self) -> usize {
        self.loadings.ncols()
    }

    /// Number of variables, p.
    pub fn n_variables(&self) -> usize {
        self.loadings.nrows()
    }

    /// Rotated (pattern) loadings, variables by factors.
    pub fn loadings(&self) -> ArrayView2<'_, f64> {
        self.loadings.view()
    }

    /// Loadings straight from estimation, before rotation and reordering.
    pub fn unrotated_loadings(&self) -> ArrayView2<'_, f64> {
        self.unrotated_loadings.view()
    }

    /// The k x k matrix T with `loadings = unrotated_loadings · T`.
    pub fn rotation_matrix(&self) -> ArrayView2<'_, f64> {
        self.rotation_matrix.view()
    }

    /// Factor correlation matrix; the identity for orthogonal rotations.
    pub fn phi(&self) -> ArrayView2<'_, f64> {
        self.phi.view()
    }

    /// Variance of each variable explained by the common factors, h².
    ///
    /// Computed from the unrotated loadings, so it does not depend on the rotation.
    pub fn communalities(&self) -> ArrayView1<'_, f64> {
        self.communalities.view()
    }

    /// `1 - h²` for each variable.
    pub fn uniquenesses(&self) -> ArrayView1<'_, f64> {
        self.uniquenesses.view()
    }

    /// Structure matrix `L Φ`: correlations between variables and factors.
    pub fn structure(&self) -> Array2<f64> {
        self.loadings.dot(&self.phi)
    }

    /// Sum of squared loadings per factor and the variance proportions.
    pub fn variance_accounted(&self) -> VarianceAccounted {
        VarianceAccounted::compute(&self.loadings, &self.phi)
    }

    /// Goodness-of-fit statistics and iteration counts.
    pub fn fit(&self) -> &FitStatistics {
        &self.fit
    }

    /// Correlations implied by the common factors, `L Φ Lᵀ` (diagonal = communalities).
    pub fn implied_common(&self) -> Array2<f64> {
        self.loadings.dot(&self.phi).dot(&self.loadings.t())
    }

    /// Regression factor scores for each subject, shape (n_subjects, k).
    ///
    /// # Errors
    /// `InvalidData` if the dataset's variables differ from the model's.
    pub fn scores(&self, standardized: &StandardizedDataset) -> Result<Array2<f64>> {
        if standardized.names() != self.names.as_slice() {
            return Err(FactorError::InvalidData(
                "dataset variables do not match the fitted model".into(),
            ));
        }
        Ok(standardized.data().dot(&self.score_weights))
    }

    /// Variable indices grouped by the factor with the largest absolute
    /// loading, factors in order, and by decreasing loading within a group.
    pub fn sorted_variable_order(&self) -> Vec<usize> {
        let k = self.n_factors();
        let dominant: Vec<(usize, f64)> = self
            .loadings
            .rows()
            .into_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .map(|(j, v)| (j, v.abs()))
                    .fold((0, f64::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best })
            })
            .collect();
        let mut order: Vec<usize> = (0..self.n_variables()).collect();
        order.sort_by(|&a, &b| {
            dominant[a].0.cmp(&dominant[b].0).then(
                dominant[b]
                    .1
                    .partial_cmp(&dominant[a].1)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
        });
        debug_assert!(order.iter().all(|&i| dominant[i].0 < k.max(1)));
        order
    }

    /// Plain text loading table; loadings smaller than `cutoff` in absolute
    /// value are left blank. Rows follow [`Self::sorted_variable_order`] when
    /// `sort` is set.
    pub fn loading_table(&self, cutoff: f64, sort: bool) -> String {
        let k = self.n_factors();
        let order: Vec<usize> = if sort {
            self.sorted_variable_order()
        } else {
            (0..self.n_variables()).collect()
        };
        let width = self
            .names
            .iter()
            .map(String::len)
            .max()
            .unwrap_or(0)
            .max("variable".len());

        let mut out = String::new();
        let _ = write!(out, "{:<width$}", "variable", width = width);
        for j in 0..k {
            let _ = write!(out, " {:>7}", format!("F{}", j + 1));
        }
        let _ = writeln!(out, " {:>7} {:>7}", "h2", "u2");
        for &i in &order {
            let _ = write!(out, "{:<width$}", self.names[i], width = width);
            for j in 0..k {
                let v = self.loadings[[i, j]];
                if v.abs() < cutoff {
                    let _ = write!(out, " {:>7}", "");
                } else {
                    let _ = write!(out, " {:>7.3}", v);
                }
            }
            let _ = writeln!(
                out,
                " {:>7.3} {:>7.3}",
                self.communalities[i], self.uniquenesses[i]
            );
        }
        let va = self.variance_accounted();
        let _ = write!(out, "{:<width$}", "SS loadings", width = width);
        for v in va.ss_loadings.iter() {
            let _ = write!(out, " {:>7.3}", v);
        }
        let _ = writeln!(out);
        let _ = write!(out, "{:<width$}", "Proportion", width = width);
        for v in va.proportion.iter() {
            let _ = write!(out, " {:>7.3}", v);
        }
        let _ = writeln!(out);
        out
    }
}

impl fmt::Display for FactorModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Factor analysis: {} factor(s), method {}, rotation {}",
            self.n_factors(),
            self.method,
            self.rotation
        )?;
        f.write_str(&self.loading_table(0.0, false))?;
        if self.rotation.is_oblique() && self.n_factors() > 1 {
            writeln!(f, "Factor correlations:")?;
            for row in self.phi.rows() {
                for v in row.iter() {
                    write!(f, " {:>7.3}", v)?;
                }
                writeln!(f)?;
            }
        }
        write!(f, "RMSR {:.4}, off-diagonal fit {:.4}", self.fit.rmsr, self.fit.fit_off_diagonal)?;
        if let (Some(chi), Some(bic)) = (self.fit.chi_square, self.fit.bic) {
            write!(f, ", chi-square {:.2} on {} dof, BIC {:.2}", chi, self.fit.dof, bic)?;
        }
        Ok(())
    }
}
