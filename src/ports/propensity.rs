//! Propensity Port
//!
//! Capability interface for propensity-score models. The matcher and the
//! uplift estimator receive one fitted provider by injection, so every
//! consumer scores units with the same standardization and coefficients.

use crate::domain::{AnalysisError, UnitTable};

/// A fitted model of P(treatment = 1 | covariates)
#[cfg_attr(test, mockall::automock)]
pub trait PropensityProvider: Send + Sync {
    /// Probability of treatment for every row of `table`, each in (0, 1)
    fn predict(&self, table: &UnitTable) -> Result<Vec<f64>, AnalysisError>;
}

/// Fits a `PropensityProvider` from treatment labels and covariates
pub trait PropensityFit {
    type Provider: PropensityProvider;

    fn fit(&self, table: &UnitTable) -> Result<Self::Provider, AnalysisError>;
}
