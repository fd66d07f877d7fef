//! Experiment Simulator
//!
//! Generates a synthetic booking experiment with behavioral covariates,
//! a known treatment lift and optional heterogeneity, confounding and
//! prognostic signal. Used by the `simulate` command and by tests that need
//! data with a known ground truth.
//!
//! Outcome model:
//! p(booking) = base_rate + prognostic * (engagement - 0.5)
//!            + treatment * (lift + heterogeneity * (age_position - 0.5))
//! where `age_position` and `engagement` are both scaled into [0, 1].

use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use statrs::distribution::Normal;

use super::error::AnalysisError;
use super::matrix::FeatureMatrix;
use super::table::UnitTable;

const MIN_AGE: f64 = 18.0;
const MAX_AGE: f64 = 65.0;

/// Covariates produced by the simulator, in column order
pub const SIMULATED_COVARIATES: [&str; 4] =
    ["age", "total_actions", "unique_actions", "total_secs_elapsed"];

/// Simulation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub n_units: usize,
    /// Target share of treated units
    pub treatment_rate: f64,
    /// Assign exactly `round(n * rate)` treated units instead of coin flips
    pub complete_randomization: bool,
    /// Control booking probability at average engagement
    pub base_rate: f64,
    /// Average additive lift in booking probability from treatment
    pub lift: f64,
    /// Slope of the lift in the unit's age position
    pub heterogeneity: f64,
    /// Slope of the baseline booking probability in engagement
    pub prognostic: f64,
    /// Log-odds slope of treatment assignment in age position (0 = randomized)
    pub confounding: f64,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            n_units: 1000,
            treatment_rate: 0.5,
            complete_randomization: true,
            base_rate: 0.15,
            lift: 0.10,
            heterogeneity: 0.0,
            prognostic: 0.0,
            confounding: 0.0,
            seed: 42,
        }
    }
}

impl SimulationConfig {
    pub fn with_units(mut self, n_units: usize) -> Self {
        self.n_units = n_units;
        self
    }

    pub fn with_lift(mut self, lift: f64) -> Self {
        self.lift = lift;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<(), AnalysisError> {
        if self.n_units < 2 {
            return Err(AnalysisError::InvalidParameter(format!(
                "n_units must be >= 2, got {}",
                self.n_units
            )));
        }
        for (name, value) in [
            ("treatment_rate", self.treatment_rate),
            ("base_rate", self.base_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(AnalysisError::InvalidParameter(format!(
                    "{} must be in [0, 1], got {}",
                    name, value
                )));
            }
        }
        for (name, value) in [
            ("lift", self.lift),
            ("heterogeneity", self.heterogeneity),
            ("prognostic", self.prognostic),
            ("confounding", self.confounding),
        ] {
            if !value.is_finite() {
                return Err(AnalysisError::InvalidParameter(format!(
                    "{} must be finite, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Draw a synthetic experiment table
pub fn simulate_experiment(config: &SimulationConfig) -> Result<UnitTable, AnalysisError> {
    config.validate()?;
    let n = config.n_units;
    let mut rng = StdRng::seed_from_u64(config.seed);

    let log_actions = Normal::new(4.0, 0.8)
        .map_err(|e| AnalysisError::InvalidParameter(e.to_string()))?;
    let log_secs_per_action = Normal::new(4.5, 0.5)
        .map_err(|e| AnalysisError::InvalidParameter(e.to_string()))?;

    let mut rows = Vec::with_capacity(n);
    let mut age_position = Vec::with_capacity(n);
    let mut engagement = Vec::with_capacity(n);
    for _ in 0..n {
        let pos: f64 = rng.gen();
        let age = (MIN_AGE + pos * (MAX_AGE - MIN_AGE)).round();
        let total_actions = log_actions.sample(&mut rng).exp().round().max(1.0);
        let share = 0.1 + 0.3 * rng.gen::<f64>();
        let unique_actions = (total_actions * share).round().max(1.0);
        let total_secs = (total_actions * log_secs_per_action.sample(&mut rng).exp()).round();

        age_position.push((age - MIN_AGE) / (MAX_AGE - MIN_AGE));
        engagement.push(((unique_actions / total_actions) - 0.1) / 0.3);
        rows.push(vec![age, total_actions, unique_actions, total_secs]);
    }

    let treatment = assign_treatment(config, &age_position, &mut rng);

    let outcome: Vec<u8> = (0..n)
        .map(|i| {
            let mut p = config.base_rate + config.prognostic * (engagement[i] - 0.5);
            if treatment[i] == 1 {
                p += config.lift + config.heterogeneity * (age_position[i] - 0.5);
            }
            u8::from(rng.gen::<f64>() < p.clamp(0.0, 1.0))
        })
        .collect();

    let ids = (0..n).map(|i| format!("u{:06}", i)).collect();
    let covariates = FeatureMatrix::from_rows(&rows)?;
    UnitTable::new(
        Some(ids),
        treatment,
        outcome,
        SIMULATED_COVARIATES.iter().map(|s| s.to_string()).collect(),
        covariates,
    )
}

fn assign_treatment(config: &SimulationConfig, age_position: &[f64], rng: &mut StdRng) -> Vec<u8> {
    let n = age_position.len();
    if config.confounding != 0.0 {
        let rate = config.treatment_rate.clamp(1e-6, 1.0 - 1e-6);
        let base_logit = (rate / (1.0 - rate)).ln();
        return age_position
            .iter()
            .map(|&pos| {
                let logit = base_logit + config.confounding * (pos - 0.5);
                let p = 1.0 / (1.0 + (-logit).exp());
                u8::from(rng.gen::<f64>() < p)
            })
            .collect();
    }

    if config.complete_randomization {
        let n_treated = (n as f64 * config.treatment_rate).round() as usize;
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(rng);
        let mut treatment = vec![0u8; n];
        for &i in &order[..n_treated.min(n)] {
            treatment[i] = 1;
        }
        treatment
    } else {
        (0..n)
            .map(|_| u8::from(rng.gen::<f64>() < config.treatment_rate))
            .collect()
    }
}
