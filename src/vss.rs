// src/vss.rs

//! Factor count diagnostics: Very Simple Structure (VSS) fits for
//! complexity 1 and 2, and Velicer's minimum average partial (MAP).

use std::fmt;
use std::time::Instant;

use log::{debug, info};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::correlation::CorrelationMatrix;
use crate::error::{FactorError, Result};
use crate::extraction::{degrees_of_freedom, EstimationMethod, FactorAnalysis, FactorAnalysisConfig};
use crate::linalg_backends::sorted_eigh;
use crate::rotation::Rotation;
use crate::standardize::StandardizedDataset;

/// Settings for [`very_simple_structure`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VssConfig {
    /// Largest factor count tried; every k in `1..=max_factors` is fitted.
    pub max_factors: usize,
    pub rotation: Rotation,
    pub method: EstimationMethod,
    /// Score the diagonal of the correlation matrix too. Off by default, so
    /// only the off-diagonal correlations count.
    pub include_diagonal: bool,
    pub n_obs: Option<usize>,
}

impl Default for VssConfig {
    fn default() -> Self {
        VssConfig {
            max_factors: 8,
            rotation: Rotation::Varimax,
            method: EstimationMethod::MinimumResidual,
            include_diagonal: false,
            n_obs: None,
        }
    }
}

impl VssConfig {
    /// Checks that every factor count up to `max_factors` can be fitted to
    /// `n_variables` variables.
    ///
    /// # Errors
    /// `Config` if `max_factors` is 0, not below `n_variables`, or leaves
    /// negative degrees of freedom.
    pub fn validate(&self, n_variables: usize) -> Result<()> {
        let k = self.max_factors;
        let p = n_variables;
        if k == 0 {
            return Err(FactorError::Config("max_factors must be at least 1".into()));
        }
        if k >= p {
            return Err(FactorError::Config(format!(
                "max_factors ({}) must be smaller than the number of variables ({})",
                k, p
            )));
        }
        let dof = degrees_of_freedom(p, k);
        if dof < 0 {
            return Err(FactorError::Config(format!(
                "max_factors ({}) is under-identified with {} variables ({} degrees of freedom)",
                k, p, dof
            )));
        }
        Ok(())
    }
}

/// Diagnostics for one candidate factor count.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VssRow {
    pub k: usize,
    /// Fit when each variable keeps only its largest loading.
    pub vss_complexity1: f64,
    /// Fit when each variable keeps its two largest loadings.
    pub vss_complexity2: f64,
    /// Average squared partial correlation after removing `k` principal components.
    pub map: f64,
    pub dof: i64,
    pub chi_square: Option<f64>,
    pub bic: Option<f64>,
    pub rmsr: f64,
    /// Off-diagonal fit of the full (unsimplified) model.
    pub fit_off_diagonal: f64,
}

/// Result of a VSS run: one row per factor count, in increasing k.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VssReport {
    pub rotation: Rotation,
    pub method: EstimationMethod,
    /// Average squared correlation, i.e. MAP with no component removed.
    pub map_baseline: f64,
    /// One row per factor count, `1..=max_factors`.
    pub rows: Vec<VssRow>,
}

impl VssReport {
    /// Factor count with the highest complexity-1 fit.
    pub fn best_complexity1(&self) -> Option<usize> {
        best_by(&self.rows, |r| r.vss_complexity1)
    }

    /// Factor count with the highest complexity-2 fit.
    pub fn best_complexity2(&self) -> Option<usize> {
        best_by(&self.rows, |r| r.vss_complexity2)
    }

    /// Number of components whose removal leaves the smallest average squared
    /// partial correlation. `Some(0)` when `map_baseline` is already below every
    /// row: the variables share no common factor.
    pub fn map_minimum(&self) -> Option<usize> {
        let k = best_by(&self.rows, |r| -r.map)?;
        let smallest = self.rows.iter().find(|r| r.k == k)?.map;
        if self.map_baseline <= smallest {
            Some(0)
        } else {
            Some(k)
        }
    }

    /// Factor count with the lowest BIC, when a sample size was known.
    pub fn bic_minimum(&self) -> Option<usize> {
        self.rows
            .iter()
            .filter_map(|r| r.bic.map(|b| (r.k, b)))
            .fold(None, |best: Option<(usize, f64)>, cur| match best {
                Some(b) if b.1 <= cur.1 => Some(b),
                _ => Some(cur),
            })
            .map(|(k, _)| k)
    }
}

fn best_by(rows: &[VssRow], key: impl Fn(&VssRow) -> f64) -> Option<usize> {
    rows.iter()
        .fold(None, |best: Option<(usize, f64)>, row| {
            let v = key(row);
            match best {
                Some(b) if b.1 >= v => Some(b),
                _ if v.is_nan() => best,
                _ => Some((row.k, v)),
            }
        })
        .map(|(k, _)| k)
}

impl fmt::Display for VssReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Very Simple Structure (method {}, rotation {})",
            self.method, self.rotation
        )?;
        writeln!(
            f,
            "{:>3} {:>8} {:>8} {:>8} {:>5} {:>10} {:>10} {:>8}",
            "k", "vss1", "vss2", "map", "dof", "chisq", "BIC", "RMSR"
        )?;
        for row in &self.rows {
            let opt = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |x| format!("{:.2}", x));
            writeln!(
                f,
                "{:>3} {:>8.4} {:>8.4} {:>8.4} {:>5} {:>10} {:>10} {:>8.4}",
                row.k,
                row.vss_complexity1,
                row.vss_complexity2,
                row.map,
                row.dof,
                opt(row.chi_square),
                opt(row.bic),
                row.rmsr
            )?;
        }
        if let Some(k) = self.best_complexity1() {
            write!(f, "VSS complexity 1 peaks at {} factor(s)", k)?;
        }
        match self.map_minimum() {
            Some(0) => write!(f, "; MAP is smallest with no factor removed")?,
            Some(k) => write!(f, "; MAP is smallest at {} factor(s)", k)?,
            None => {}
        }
        Ok(())
    }
}

/// Runs VSS on the correlations of a standardized dataset.
pub fn very_simple_structure_dataset(
    standardized: &StandardizedDataset,
    config: &VssConfig,
) -> Result<VssReport> {
    very_simple_structure(&CorrelationMatrix::from_standardized(standardized), config)
}

/// Fits models with 1..=`max_factors` factors and scores each one.
///
/// Any failing fit aborts the run.
pub fn very_simple_structure(correlation: &CorrelationMatrix, config: &VssConfig) -> Result<VssReport> {
    let p = correlation.dim();
    config.validate(p)?;
    correlation.ensure_nonsingular()?;

    let start_time = Instant::now();
    info!(
        "Running VSS for 1..={} factors on {} variables.",
        config.max_factors, p
    );

    let r = correlation.matrix().to_owned();
    let map = minimum_average_partial(&r, config.max_factors)?;

    let mut rows = Vec::with_capacity(config.max_factors);
    for k in 1..=config.max_factors {
        let fa_config = FactorAnalysisConfig {
            n_factors: k,
            method: config.method,
            rotation: config.rotation,
            n_obs: config.n_obs,
            ..FactorAnalysisConfig::default()
        };
        let model = FactorAnalysis::new(fa_config).fit(correlation)?;
        let loadings = model.loadings();
        let phi = model.phi();
        let vss_complexity1 = simple_structure_fit(&r, loadings, phi, 1, config.include_diagonal);
        let vss_complexity2 = simple_structure_fit(&r, loadings, phi, 2, config.include_diagonal);
        let fit = model.fit();
        debug!(
            "k = {}: vss1 {:.4}, vss2 {:.4}, map {:.4}",
            k, vss_complexity1, vss_complexity2, map[k]
        );
        rows.push(VssRow {
            k,
            vss_complexity1,
            vss_complexity2,
            map: map[k],
            dof: fit.dof,
            chi_square: fit.chi_square,
            bic: fit.bic,
            rmsr: fit.rmsr,
            fit_off_diagonal: fit.fit_off_diagonal,
        });
    }

    info!("VSS finished in {:?}.", start_time.elapsed());
    Ok(VssReport {
        rotation: config.rotation,
        method: config.method,
        map_baseline: map[0],
        rows,
    })
}

/// Fit of the simplified model that keeps the `complexity` largest loadings
/// (by magnitude) of each variable: `1 - Σ(R - SΦSᵀ)² / ΣR²`.
pub fn simple_structure_fit(
    r: &Array2<f64>,
    loadings: ArrayView2<'_, f64>,
    phi: ArrayView2<'_, f64>,
    complexity: usize,
    include_diagonal: bool,
) -> f64 {
    let simplified = simplify(loadings, complexity);
    let model = simplified.dot(&phi).dot(&simplified.t());
    let p = r.nrows();
    let mut residual_ss = 0.0;
    let mut total_ss = 0.0;
    for i in 0..p {
        for j in 0..p {
            if i == j && !include_diagonal {
                continue;
            }
            residual_ss += (r[[i, j]] - model[[i, j]]).powi(2);
            total_ss += r[[i, j]].powi(2);
        }
    }
    if total_ss > 0.0 {
        1.0 - residual_ss / total_ss
    } else {
        0.0
    }
}

/// Zeroes all but the `complexity` largest-magnitude loadings of each row.
fn simplify(loadings: ArrayView2<'_, f64>, complexity: usize) -> Array2<f64> {
    let mut simplified = Array2::zeros(loadings.raw_dim());
    for (i, row) in loadings.rows().into_iter().enumerate() {
        let mut order: Vec<usize> = (0..row.len()).collect();
        order.sort_by(|&a, &b| row[b].abs().total_cmp(&row[a].abs()));
        for &j in order.iter().take(complexity) {
            simplified[[i, j]] = row[j];
        }
    }
    simplified
}

/// Velicer's MAP values for m = 0..=max_components: the average squared
/// off-diagonal partial correlation once the first m principal components
/// are removed.
pub fn minimum_average_partial(r: &Array2<f64>, max_components: usize) -> Result<Vec<f64>> {
    let p = r.nrows();
    if max_components >= p {
        return Err(FactorError::Config(format!(
            "cannot partial out {} components from {} variables",
            max_components, p
        )));
    }
    let (values, vectors) = sorted_eigh(r)?;
    let mut residual = r.clone();
    let mut out = Vec::with_capacity(max_components + 1);
    for m in 0..=max_components {
        if m > 0 {
            let c = m - 1;
            let scale = values[c].max(0.0);
            for i in 0..p {
                for j in 0..p {
                    residual[[i, j]] -= vectors[[i, c]] * vectors[[j, c]] * scale;
                }
            }
        }
        out.push(average_squared_partial(&residual)?);
    }
    Ok(out)
}

fn average_squared_partial(residual: &Array2<f64>) -> Result<f64> {
    let p = residual.nrows();
    let d = residual.diag();
    if let Some(i) = d.iter().position(|&v| !(v > 0.0)) {
        return Err(FactorError::Numerical(format!(
            "residual variance of variable {} vanished while computing MAP",
            i
        )));
    }
    let mut sum = 0.0;
    for i in 0..p {
        for j in 0..p {
            if i != j {
                sum += residual[[i, j]].powi(2) / (d[i] * d[j]);
            }
        }
    }
    Ok(sum / (p * (p - 1)) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn two_cluster_correlation() -> CorrelationMatrix {
        let l = array![
            [0.8, 0.0],
            [0.7, 0.0],
            [0.7, 0.0],
            [0.6, 0.0],
            [0.0, 0.7],
            [0.0, 0.6],
            [0.0, 0.6],
            [0.0, 0.5]
        ];
        let mut r = l.dot(&l.t());
        r.diag_mut().fill(1.0);
        let names = (1..=8).map(|i| format!("v{}", i)).collect();
        CorrelationMatrix::from_matrix(names, r, Some(500)).unwrap()
    }

    #[test]
    fn simplify_keeps_largest_loadings() {
        let l = array![[0.2, -0.9, 0.4], [0.5, 0.1, 0.3]];
        let s1 = simplify(l.view(), 1);
        assert_eq!(s1, array![[0.0, -0.9, 0.0], [0.5, 0.0, 0.0]]);
        let s2 = simplify(l.view(), 2);
        assert_eq!(s2, array![[0.0, -0.9, 0.4], [0.5, 0.0, 0.3]]);
    }

    #[test]
    fn perfect_simple_structure_fits_exactly() {
        let corr = two_cluster_correlation();
        let l = array![
            [0.8, 0.0],
            [0.7, 0.0],
            [0.7, 0.0],
            [0.6, 0.0],
            [0.0, 0.7],
            [0.0, 0.6],
            [0.0, 0.6],
            [0.0, 0.5]
        ];
        let r = corr.matrix().to_owned();
        let eye = Array2::<f64>::eye(2);
        assert_abs_diff_eq!(simple_structure_fit(&r, l.view(), eye.view(), 1, false), 1.0, epsilon = 1e-12);
        assert!(simple_structure_fit(&r, l.view(), eye.view(), 1, true) < 1.0);
    }

    #[test]
    fn map_is_smallest_at_two_components() {
        let corr = two_cluster_correlation();
        let map = minimum_average_partial(&corr.matrix().to_owned(), 5).unwrap();
        assert_eq!(map.len(), 6);
        assert_abs_diff_eq!(map[0], 0.07983571428571427, epsilon = 1e-10);
        assert_abs_diff_eq!(map[2], 0.047696890444130134, epsilon = 1e-8);
        let argmin = (0..map.len())
            .min_by(|&a, &b| map[a].total_cmp(&map[b]))
            .unwrap();
        assert_eq!(argmin, 2);
    }

    fn row(k: usize, map: f64) -> VssRow {
        VssRow {
            k,
            vss_complexity1: 0.5,
            vss_complexity2: 0.5,
            map,
            dof: 0,
            chi_square: None,
            bic: None,
            rmsr: 0.1,
            fit_off_diagonal: 0.9,
        }
    }

    #[test]
    fn map_minimum_reports_zero_when_nothing_should_be_removed() {
        let mut report = VssReport {
            rotation: Rotation::Varimax,
            method: EstimationMethod::MinimumResidual,
            map_baseline: 0.010,
            rows: vec![row(1, 0.020), row(2, 0.015), row(3, 0.030)],
        };
        assert_eq!(report.map_minimum(), Some(0));
        assert!(report.to_string().contains("MAP is smallest with no factor removed"));

        report.map_baseline = 0.050;
        assert_eq!(report.map_minimum(), Some(2));

        report.rows.clear();
        assert_eq!(report.map_minimum(), None);
    }

    #[test]
    fn report_recovers_two_factors() {
        let corr = two_cluster_correlation();
        let config = VssConfig {
            max_factors: 2,
            ..VssConfig::default()
        };
        let report = very_simple_structure(&corr, &config).unwrap();
        assert_eq!(report.rows.len(), 2);
        assert_eq!(report.best_complexity1(), Some(2));
        assert_eq!(report.map_minimum(), Some(2));
        let vss1: Vec<f64> = report.rows.iter().map(|r| r.vss_complexity1).collect();
        assert!(vss1[1] > vss1[0] + 0.2);
        assert!(vss1[1] > 0.99);
        assert_eq!(report.rows[1].dof, 13);
        assert!(report.rows[1].chi_square.unwrap() < 1e-3);
        assert!(report.to_string().contains("MAP is smallest at 2"));
    }

    #[test]
    fn max_factors_is_validated() {
        let corr = two_cluster_correlation();
        for max_factors in [0, 8, 9, 5] {
            let config = VssConfig {
                max_factors,
                ..VssConfig::default()
            };
            assert!(matches!(
                very_simple_structure(&corr, &config),
                Err(FactorError::Config(_))
            ));
        }
    }
}
