//! Domain Layer - Experiment data types
//!
//! Pure data types with no I/O. Every estimator consumes a `UnitTable` and
//! reports failures through `AnalysisError`.
//!
//! - `matrix`: dense row-major covariate storage
//! - `table`: the immutable unit table and experimental arms
//! - `stats`: global statistics bundle and small descriptive helpers
//! - `simulate`: synthetic experiments with a known ground truth
//! - `error`: the analysis error taxonomy

pub mod error;
pub mod matrix;
pub mod simulate;
pub mod stats;
pub mod table;

pub use error::AnalysisError;
pub use matrix::FeatureMatrix;
pub use simulate::{simulate_experiment, SimulationConfig, SIMULATED_COVARIATES};
pub use stats::GlobalStats;
pub use table::{Arm, UnitTable};
