// Exploratory factor analysis (EFA)

#![doc = include_str!("../README.md")]

pub mod correlation;
pub mod dataset;
pub mod diagnostics;
pub mod error;
pub mod extraction;
pub mod linalg_backends;
pub mod model;
pub mod rotation;
pub mod simulate;
pub mod spectral;
pub mod standardize;
pub mod vss;

pub use correlation::{BartlettSphericity, CorrelationMatrix, KmoResult};
pub use dataset::Dataset;
pub use diagnostics::{FitStatistics, VarianceAccounted};
pub use error::{FactorError, Result};
pub use extraction::{degrees_of_freedom, EstimationMethod, FactorAnalysis, FactorAnalysisConfig};
pub use model::FactorModel;
pub use rotation::{rotate, Rotation, RotationOptions, RotationResult};
pub use simulate::{simulate_factor_data, SimulationModel};
pub use spectral::EigenDecomposition;
pub use standardize::StandardizedDataset;
pub use vss::{very_simple_structure, very_simple_structure_dataset, VssConfig, VssReport, VssRow};

#[cfg(test)]
mod factor_tests;
