//! Estimators - Statistical core of the analysis
//!
//! Each estimator reads an immutable `UnitTable` and returns its own result
//! type. None of them performs I/O.

pub mod calibration;
pub mod cuped;
pub mod forest;
pub mod hypothesis;
pub mod matching;
pub mod params;
pub mod propensity;
pub mod uplift;

pub use calibration::{decile_calibration, quantile_bins, spearman, CalibrationReport, CalibrationStatus};
pub use cuped::{CupedAdjuster, CupedModel, CupedResult};
pub use forest::RandomForestRegressor;
pub use hypothesis::{
    EvidenceStrength, HypothesisTester, MeanDifferenceResult, ProportionTestResult, Significance,
};
pub use matching::{CovariateBalance, MatchOutcome, PropensityMatcher};
pub use params::{
    AnalysisParams, CupedConfig, ForestConfig, MatchingConfig, ParamError, PropensityConfig,
    UpliftConfig, DEFAULT_SEED,
};
pub use propensity::{LogisticPropensity, LogisticPropensityFitter, PropensityDiagnostics};
pub use uplift::{UpliftResult, XLearner};
