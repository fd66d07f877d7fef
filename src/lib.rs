//! Causify - Causal analysis of randomized booking experiments
//!
//! Tests the booking lift of an experiment, reduces its variance with CUPED,
//! checks covariate balance through propensity score matching, estimates
//! per-unit uplift with an X-learner and reconciles everything into one
//! dashboard table.
//!
//! # Modules
//!
//! - `domain`: Unit table, covariate matrix, error taxonomy, simulator
//! - `ports`: Trait abstractions (PropensityProvider, Regressor, TableSource)
//! - `estimators`: CUPED, hypothesis test, propensity, matching, forest, uplift
//! - `application`: Pipeline orchestration, reconciliation and segments
//! - `adapters`: CSV input/output, table cache, CLI
//! - `config`: Configuration loading and validation

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod estimators;
pub mod ports;
