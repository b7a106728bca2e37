// src/simulate.rs

//! Draws synthetic subjects from a known common factor model,
//! `x = L f + e` with `f ~ N(0, Φ)` and `e ~ N(0, diag(σ²))`.

use ndarray::{Array1, Array2, Axis};
use ndarray_rand::RandomExt;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::dataset::Dataset;
use crate::error::{FactorError, Result};
use crate::linalg_backends::sorted_eigh;

/// A population factor model to sample from.
#[derive(Clone, Debug)]
pub struct SimulationModel {
    names: Vec<String>,
    /// Shape: (p, k)
    loadings: Array2<f64>,
    phi: Array2<f64>,
    noise_sd: Array1<f64>,
}

impl SimulationModel {
    /// Orthogonal factors with unique variances `1 - h²`, so every simulated
    /// variable has unit population variance.
    ///
    /// # Errors
    /// `InvalidData` if the loadings are empty or some communality exceeds 1.
    pub fn new(loadings: Array2<f64>) -> Result<Self> {
        let (p, k) = loadings.dim();
        if p == 0 || k == 0 {
            return Err(FactorError::InvalidData("loading matrix is empty".into()));
        }
        if loadings.iter().any(|v| !v.is_finite()) {
            return Err(FactorError::InvalidData("loadings must be finite".into()));
        }
        let mut model = Self {
            names: (1..=p).map(|i| format!("V{}", i)).collect(),
            loadings,
            phi: Array2::eye(k),
            noise_sd: Array1::zeros(p),
        };
        model.noise_sd = model.unit_variance_noise()?;
        Ok(model)
    }

    /// Replaces the default `V1..Vp` variable names.
    ///
    /// # Errors
    /// `InvalidData` unless there is exactly one name per loading row.
    pub fn with_names(mut self, names: Vec<String>) -> Result<Self> {
        if names.len() != self.loadings.nrows() {
            return Err(FactorError::InvalidData(format!(
                "{} names given for {} variables",
                names.len(),
                self.loadings.nrows()
            )));
        }
        self.names = names;
        Ok(self)
    }

    /// Correlated factors. Noise scales are recomputed for unit variances.
    pub fn with_phi(mut self, phi: Array2<f64>) -> Result<Self> {
        let k = self.loadings.ncols();
        if phi.dim() != (k, k) {
            return Err(FactorError::InvalidData(format!(
                "factor correlation matrix must be {}x{}, got {:?}",
                k,
                k,
                phi.dim()
            )));
        }
        for i in 0..k {
            if (phi[[i, i]] - 1.0).abs() > 1e-12 {
                return Err(FactorError::InvalidData(
                    "factor correlation matrix must have a unit diagonal".into(),
                ));
            }
            for j in 0..i {
                if (phi[[i, j]] - phi[[j, i]]).abs() > 1e-12 {
                    return Err(FactorError::InvalidData(
                        "factor correlation matrix must be symmetric".into(),
                    ));
                }
            }
        }
        self.phi = phi;
        self.noise_sd = self.unit_variance_noise()?;
        Ok(self)
    }

    /// Explicit noise standard deviations, one per variable.
    pub fn with_noise(mut self, noise_sd: Array1<f64>) -> Result<Self> {
        if noise_sd.len() != self.loadings.nrows() {
            return Err(FactorError::InvalidData(format!(
                "{} noise scales given for {} variables",
                noise_sd.len(),
                self.loadings.nrows()
            )));
        }
        if noise_sd.iter().any(|&s| !(s >= 0.0) || !s.is_finite()) {
            return Err(FactorError::InvalidData(
                "noise scales must be finite and non-negative".into(),
            ));
        }
        self.noise_sd = noise_sd;
        Ok(self)
    }

    /// Names the sampled columns will carry.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// `diag(L Φ Lᵀ)`
    pub fn communalities(&self) -> Array1<f64> {
        self.loadings
            .dot(&self.phi)
            .dot(&self.loadings.t())
            .diag()
            .to_owned()
    }

    /// Population covariance `L Φ Lᵀ + diag(σ²)`.
    pub fn population_covariance(&self) -> Array2<f64> {
        let mut sigma = self.loadings.dot(&self.phi).dot(&self.loadings.t());
        sigma
            .diag_mut()
            .zip_mut_with(&self.noise_sd, |s, &sd| *s += sd * sd);
        sigma
    }

    fn unit_variance_noise(&self) -> Result<Array1<f64>> {
        let h2 = self.communalities();
        if let Some(i) = h2.iter().position(|&h| h > 1.0 + 1e-12) {
            return Err(FactorError::InvalidData(format!(
                "communality of variable {} is {:.4}, above 1",
                self.names[i], h2[i]
            )));
        }
        Ok(h2.mapv(|h| (1.0 - h).max(0.0).sqrt()))
    }

    /// Symmetric square root of Φ.
    fn phi_root(&self) -> Result<Array2<f64>> {
        let (values, vectors) = sorted_eigh(&self.phi)?;
        if let Some(&v) = values.iter().find(|&&v| v < -1e-12) {
            return Err(FactorError::InvalidData(format!(
                "factor correlation matrix is not positive semi-definite (eigenvalue {:.3e})",
                v
            )));
        }
        let scaled = &vectors * &values.mapv(|v| v.max(0.0).sqrt()).insert_axis(Axis(0));
        Ok(scaled.dot(&vectors.t()))
    }

    /// Draws `n_subjects` rows using `rng`; the same seed gives the same data.
    pub fn sample<R: Rng + ?Sized>(&self, n_subjects: usize, rng: &mut R) -> Result<Dataset> {
        let (p, k) = self.loadings.dim();
        let root = self.phi_root()?;
        let factors = Array2::<f64>::random_using((n_subjects, k), StandardNormal, rng).dot(&root);
        let noise = Array2::<f64>::random_using((n_subjects, p), StandardNormal, rng)
            * &self.noise_sd.view().insert_axis(Axis(0));
        let data = factors.dot(&self.loadings.t()) + noise;
        Dataset::new(self.names.clone(), data)
    }
}

/// Samples `n_subjects` from an orthogonal factor model with unit-variance variables.
pub fn simulate_factor_data<R: Rng + ?Sized>(
    loadings: Array2<f64>,
    n_subjects: usize,
    rng: &mut R,
) -> Result<Dataset> {
    SimulationModel::new(loadings)?.sample(n_subjects, rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::CorrelationMatrix;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn same_seed_gives_same_data() {
        let l = array![[0.8], [0.7], [0.6]];
        let a = simulate_factor_data(l.clone(), 50, &mut ChaCha8Rng::seed_from_u64(7)).unwrap();
        let b = simulate_factor_data(l.clone(), 50, &mut ChaCha8Rng::seed_from_u64(7)).unwrap();
        let c = simulate_factor_data(l, 50, &mut ChaCha8Rng::seed_from_u64(8)).unwrap();
        assert_eq!(a.data(), b.data());
        assert_ne!(a.data(), c.data());
        assert_eq!(a.names(), ["V1", "V2", "V3"]);
    }

    #[test]
    fn sample_correlations_approach_population() {
        let l = array![[0.8, 0.0], [0.7, 0.0], [0.0, 0.6], [0.0, 0.7]];
        let phi = array![[1.0, 0.3], [0.3, 1.0]];
        let model = SimulationModel::new(l).unwrap().with_phi(phi).unwrap();
        let population = model.population_covariance();
        for i in 0..4 {
            assert_abs_diff_eq!(population[[i, i]], 1.0, epsilon = 1e-12);
        }
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let data = model.sample(20_000, &mut rng).unwrap();
        let corr = CorrelationMatrix::from_dataset(&data).unwrap();
        for i in 0..4 {
            for j in 0..4 {
                assert_abs_diff_eq!(corr.matrix()[[i, j]], population[[i, j]], epsilon = 0.03);
            }
        }
    }

    #[test]
    fn rejects_impossible_models() {
        assert!(SimulationModel::new(array![[1.2], [0.5]]).is_err());
        let model = SimulationModel::new(array![[0.5, 0.5], [0.5, 0.5]]).unwrap();
        assert!(model.clone().with_phi(array![[1.0, 0.2], [0.3, 1.0]]).is_err());
        assert!(model.clone().with_noise(array![0.1]).is_err());
        assert!(model.with_names(vec!["x".into()]).is_err());
    }
}
