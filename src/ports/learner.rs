//! Learner Port
//!
//! Base regressors used inside the two-stage uplift meta-learner. Any
//! learner that can fit `y ~ x` and predict for unseen rows can be plugged
//! into the X-learner.

use crate::domain::{AnalysisError, FeatureMatrix};

/// Untrained regressor configuration
pub trait Regressor: Send + Sync {
    type Fitted: FittedRegressor;

    /// Fit on `x` / `y`; `seed` drives any randomness in training
    fn fit(&self, x: &FeatureMatrix, y: &[f64], seed: u64) -> Result<Self::Fitted, AnalysisError>;
}

/// Trained regressor
pub trait FittedRegressor: Send + Sync {
    fn predict_row(&self, row: &[f64]) -> f64;

    fn predict(&self, x: &FeatureMatrix) -> Vec<f64> {
        x.rows().map(|row| self.predict_row(row)).collect()
    }
}
