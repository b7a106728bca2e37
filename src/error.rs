// src/error.rs

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, FactorError>;

/// Errors raised while loading data or fitting factor models.
///
/// None of these are transient: every variant describes a deterministic
/// failure of the input, the configuration, or the numerics, so nothing in
/// the crate retries.
#[derive(Debug, Error)]
pub enum FactorError {
    /// The dataset could not be downloaded.
    #[error("failed to fetch dataset: {0}")]
    Fetch(#[from] reqwest::Error),

    /// Reading a local dataset failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The dataset text is malformed.
    #[error("parse error on line {line}: {message}")]
    Parse {
        /// 1-based line number in the input.
        line: usize,
        /// What was wrong with the line.
        message: String,
    },

    /// A column is constant, so it cannot be standardized.
    #[error("column '{column}' has zero variance")]
    ZeroVariance {
        /// Name of the offending column.
        column: String,
    },

    /// The correlation matrix is singular or nearly so (e.g. duplicated columns).
    #[error("correlation matrix is singular (smallest eigenvalue {min_eigenvalue:.3e})")]
    SingularCorrelation {
        /// Smallest eigenvalue found.
        min_eigenvalue: f64,
    },

    /// Input arrays are inconsistent or contain non-finite values.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// The requested model cannot be fitted with the given options.
    #[error("configuration error: {0}")]
    Config(String),

    /// An iterative procedure ran out of iterations.
    #[error("{stage} did not converge after {iterations} iterations (residual {residual:.3e})")]
    NonConvergence {
        /// Which procedure failed, e.g. "maximum likelihood" or "oblimin rotation".
        stage: String,
        /// Iterations performed.
        iterations: usize,
        /// Last convergence measure.
        residual: f64,
    },

    /// A computation produced NaN or infinity.
    #[error("numerical failure: {0}")]
    Numerical(String),

    /// The LAPACK backend reported an error.
    #[error("linear algebra backend error: {0}")]
    Linalg(String),
}

impl FactorError {
    pub(crate) fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }
}
