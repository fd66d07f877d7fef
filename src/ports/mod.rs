//! Ports Layer - Trait definitions for injected capabilities
//!
//! This module defines the interfaces (ports) that estimators and adapters
//! depend on:
//! - Propensity models shared by the matcher and the uplift estimator
//! - Base regressors for the uplift meta-learner
//! - Table loading behind a cacheable `load(path, as_of)` boundary

pub mod learner;
pub mod propensity;
pub mod table_source;

pub use learner::{FittedRegressor, Regressor};
pub use propensity::{PropensityFit, PropensityProvider};
pub use table_source::{LoadError, TableSource};

#[cfg(test)]
pub use propensity::MockPropensityProvider;
