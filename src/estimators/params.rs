//! Estimator Parameters
//!
//! Configuration structs for every estimation stage.
//! Defaults: seed 42, half of the rows for CUPED estimation, 5 neighbors
//! within a 0.05 caliper, a 20% validation split and 10 calibration buckets.

use serde::{Deserialize, Serialize};

use crate::domain::AnalysisError;

pub const DEFAULT_SEED: u64 = 42;

fn default_covariates(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Parameters for every stage of one analysis run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisParams {
    pub cuped: CupedConfig,
    pub propensity: PropensityConfig,
    pub matching: MatchingConfig,
    pub uplift: UpliftConfig,
}

impl AnalysisParams {
    /// Use one seed for every stochastic stage
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.cuped.seed = seed;
        self.uplift.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<(), ParamError> {
        self.cuped.validate()?;
        self.propensity.validate()?;
        self.matching.validate()?;
        self.uplift.validate()?;
        Ok(())
    }
}

/// CUPED variance reduction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CupedConfig {
    /// Share of rows used to estimate theta and the centering means
    pub estimation_fraction: f64,
    /// Candidate pre-treatment covariates
    pub covariates: Vec<String>,
    pub seed: u64,
}

impl Default for CupedConfig {
    fn default() -> Self {
        Self {
            estimation_fraction: 0.5,
            covariates: default_covariates(&["total_actions", "unique_actions", "total_secs_elapsed"]),
            seed: DEFAULT_SEED,
        }
    }
}

impl CupedConfig {
    pub fn with_covariates(mut self, covariates: &[&str]) -> Self {
        self.covariates = default_covariates(covariates);
        self
    }

    pub fn with_estimation_fraction(mut self, fraction: f64) -> Self {
        self.estimation_fraction = fraction;
        self
    }

    pub fn validate(&self) -> Result<(), ParamError> {
        if !(self.estimation_fraction > 0.0 && self.estimation_fraction <= 1.0) {
            return Err(ParamError::InvalidFraction("cuped.estimation_fraction", self.estimation_fraction));
        }
        if self.covariates.is_empty() {
            return Err(ParamError::EmptyCovariates("cuped"));
        }
        Ok(())
    }
}

/// Logistic propensity model settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropensityConfig {
    pub covariates: Vec<String>,
    /// Inverse regularization strength is `1 / l2_penalty` (intercept is not penalized)
    pub l2_penalty: f64,
    pub max_iter: usize,
    pub tolerance: f64,
}

impl Default for PropensityConfig {
    fn default() -> Self {
        Self {
            covariates: default_covariates(&["age", "unique_actions", "total_actions", "total_secs_elapsed"]),
            l2_penalty: 1.0,
            max_iter: 100,
            tolerance: 1e-8,
        }
    }
}

impl PropensityConfig {
    pub fn with_covariates(mut self, covariates: &[&str]) -> Self {
        self.covariates = default_covariates(covariates);
        self
    }

    pub fn validate(&self) -> Result<(), ParamError> {
        if self.covariates.is_empty() {
            return Err(ParamError::EmptyCovariates("propensity"));
        }
        if !(self.l2_penalty >= 0.0) || !self.l2_penalty.is_finite() {
            return Err(ParamError::InvalidPenalty(self.l2_penalty));
        }
        if self.max_iter == 0 {
            return Err(ParamError::InvalidIterations(self.max_iter));
        }
        if !(self.tolerance > 0.0) {
            return Err(ParamError::InvalidTolerance(self.tolerance));
        }
        Ok(())
    }
}

/// Nearest-neighbor propensity matching settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Candidate controls retrieved per treated unit
    pub n_neighbors: usize,
    /// Maximum allowed absolute propensity distance
    pub caliper: f64,
    /// Allow one control to serve several treated units
    pub with_replacement: bool,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            n_neighbors: 5,
            caliper: 0.05,
            with_replacement: true,
        }
    }
}

impl MatchingConfig {
    pub fn with_caliper(mut self, caliper: f64) -> Self {
        self.caliper = caliper;
        self
    }

    pub fn with_neighbors(mut self, n_neighbors: usize) -> Self {
        self.n_neighbors = n_neighbors;
        self
    }

    pub fn without_replacement(mut self) -> Self {
        self.with_replacement = false;
        self
    }

    pub fn validate(&self) -> Result<(), ParamError> {
        if self.n_neighbors == 0 {
            return Err(ParamError::InvalidNeighbors(self.n_neighbors));
        }
        // +inf is a valid caliper (plain nearest-neighbor matching)
        if self.caliper.is_nan() || self.caliper < 0.0 {
            return Err(ParamError::InvalidCaliper(self.caliper));
        }
        Ok(())
    }
}

/// Random forest base learner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestConfig {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    /// Features tried per split; `None` tries all of them
    pub max_features: Option<usize>,
    pub bootstrap: bool,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: 5,
            min_samples_leaf: 5,
            max_features: None,
            bootstrap: true,
        }
    }
}

impl ForestConfig {
    pub fn with_trees(mut self, n_trees: usize) -> Self {
        self.n_trees = n_trees;
        self
    }

    pub fn validate(&self) -> Result<(), ParamError> {
        if self.n_trees == 0 {
            return Err(ParamError::InvalidForest("n_trees must be > 0".to_string()));
        }
        if self.min_samples_leaf == 0 {
            return Err(ParamError::InvalidForest("min_samples_leaf must be > 0".to_string()));
        }
        if self.max_features == Some(0) {
            return Err(ParamError::InvalidForest("max_features must be > 0".to_string()));
        }
        Ok(())
    }
}

/// X-learner uplift settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpliftConfig {
    pub covariates: Vec<String>,
    /// Share of rows held out for validation
    pub test_fraction: f64,
    /// Number of calibration buckets (deciles by default)
    pub n_buckets: usize,
    /// Symmetric bound of the clipped uplift score
    pub clip_bound: f64,
    pub seed: u64,
    pub forest: ForestConfig,
}

impl Default for UpliftConfig {
    fn default() -> Self {
        Self {
            covariates: default_covariates(&["age", "total_actions", "unique_actions", "total_secs_elapsed"]),
            test_fraction: 0.2,
            n_buckets: 10,
            clip_bound: 0.2,
            seed: DEFAULT_SEED,
            forest: ForestConfig::default(),
        }
    }
}

impl UpliftConfig {
    pub fn with_covariates(mut self, covariates: &[&str]) -> Self {
        self.covariates = default_covariates(covariates);
        self
    }

    pub fn with_forest(mut self, forest: ForestConfig) -> Self {
        self.forest = forest;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<(), ParamError> {
        if self.covariates.is_empty() {
            return Err(ParamError::EmptyCovariates("uplift"));
        }
        if !(self.test_fraction > 0.0 && self.test_fraction < 1.0) {
            return Err(ParamError::InvalidFraction("uplift.test_fraction", self.test_fraction));
        }
        if self.n_buckets < 2 {
            return Err(ParamError::InvalidBuckets(self.n_buckets));
        }
        if !(self.clip_bound > 0.0) {
            return Err(ParamError::InvalidClip(self.clip_bound));
        }
        self.forest.validate()
    }
}

/// Parameter validation errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParamError {
    #[error("Invalid fraction for {0}: {1} (must be in (0, 1])")]
    InvalidFraction(&'static str, f64),
    #[error("No covariates configured for {0}")]
    EmptyCovariates(&'static str),
    #[error("Invalid L2 penalty: {0} (must be finite and >= 0)")]
    InvalidPenalty(f64),
    #[error("Invalid iteration limit: {0} (must be > 0)")]
    InvalidIterations(usize),
    #[error("Invalid tolerance: {0} (must be > 0)")]
    InvalidTolerance(f64),
    #[error("Invalid neighbor count: {0} (must be > 0)")]
    InvalidNeighbors(usize),
    #[error("Invalid caliper: {0} (must be >= 0)")]
    InvalidCaliper(f64),
    #[error("Invalid bucket count: {0} (minimum 2)")]
    InvalidBuckets(usize),
    #[error("Invalid clip bound: {0} (must be > 0)")]
    InvalidClip(f64),
    #[error("Invalid forest settings: {0}")]
    InvalidForest(String),
}

impl From<ParamError> for AnalysisError {
    fn from(err: ParamError) -> Self {
        AnalysisError::InvalidParameter(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params_are_valid() {
        let params = AnalysisParams::default();
        assert_eq!(params.cuped.estimation_fraction, 0.5);
        assert_eq!(params.matching.n_neighbors, 5);
        assert_eq!(params.matching.caliper, 0.05);
        assert_eq!(params.uplift.n_buckets, 10);
        assert_eq!(params.uplift.clip_bound, 0.2);
        assert_eq!(params.uplift.forest.n_trees, 100);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_with_seed_propagates() {
        let params = AnalysisParams::default().with_seed(7);
        assert_eq!(params.cuped.seed, 7);
        assert_eq!(params.uplift.seed, 7);
    }

    #[test]
    fn test_invalid_estimation_fraction() {
        let config = CupedConfig::default().with_estimation_fraction(0.0);
        assert!(matches!(config.validate(), Err(ParamError::InvalidFraction(_, _))));

        let config = CupedConfig::default().with_estimation_fraction(1.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_caliper_bounds() {
        assert!(MatchingConfig::default().with_caliper(0.0).validate().is_ok());
        assert!(MatchingConfig::default().with_caliper(f64::INFINITY).validate().is_ok());
        assert!(matches!(
            MatchingConfig::default().with_caliper(-0.1).validate(),
            Err(ParamError::InvalidCaliper(_))
        ));
        assert!(MatchingConfig::default().with_caliper(f64::NAN).validate().is_err());
    }

    #[test]
    fn test_zero_neighbors_rejected() {
        assert!(matches!(
            MatchingConfig::default().with_neighbors(0).validate(),
            Err(ParamError::InvalidNeighbors(0))
        ));
    }

    #[test]
    fn test_uplift_validation() {
        let mut config = UpliftConfig::default();
        config.n_buckets = 1;
        assert!(matches!(config.validate(), Err(ParamError::InvalidBuckets(1))));

        let mut config = UpliftConfig::default();
        config.test_fraction = 1.0;
        assert!(config.validate().is_err());

        let config = UpliftConfig::default().with_forest(ForestConfig::default().with_trees(0));
        assert!(matches!(config.validate(), Err(ParamError::InvalidForest(_))));
    }

    #[test]
    fn test_param_error_converts_to_analysis_error() {
        let err: AnalysisError = ParamError::InvalidClip(0.0).into();
        assert!(matches!(err, AnalysisError::InvalidParameter(_)));
    }
}
