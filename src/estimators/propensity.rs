//! Propensity Estimation
//!
//! Logistic regression of treatment on standardized covariates, fitted by
//! Newton-Raphson (IRLS) with an L2 penalty on the slopes. The intercept is
//! never penalized.
//!
//! The fitted `LogisticPropensity` carries its own standardizer so that
//! every consumer (matcher, uplift estimator, exported model) scores units
//! on the same scale it was trained on.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::domain::{AnalysisError, FeatureMatrix, UnitTable};
use crate::estimators::params::PropensityConfig;
use crate::ports::{PropensityFit, PropensityProvider};

/// Scores are kept this far away from 0 and 1
const PROBABILITY_FLOOR: f64 = 1e-6;
/// Columns with a standard deviation below this are left unscaled
const MIN_SCALE: f64 = 1e-12;

/// Per-column centering and scaling (population standard deviation)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
}

impl Standardizer {
    pub fn fit(x: &FeatureMatrix) -> Self {
        let n = x.n_rows() as f64;
        let mut means = Vec::with_capacity(x.n_cols());
        let mut scales = Vec::with_capacity(x.n_cols());
        for j in 0..x.n_cols() {
            let col = x.column(j);
            let m = col.iter().sum::<f64>() / n;
            let var = col.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n;
            let sd = var.sqrt();
            means.push(m);
            scales.push(if sd > MIN_SCALE { sd } else { 1.0 });
        }
        Self { means, scales }
    }

    pub fn transform_row(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.means.iter().zip(&self.scales))
            .map(|(v, (m, s))| (v - m) / s)
            .collect()
    }
}

/// Fitted logistic propensity model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticPropensity {
    pub covariates: Vec<String>,
    pub standardizer: Standardizer,
    pub intercept: f64,
    /// Coefficients on the standardized scale
    pub coefficients: Vec<f64>,
    pub iterations: usize,
    pub converged: bool,
}

impl LogisticPropensity {
    /// Probability of treatment for one raw covariate row
    pub fn score_row(&self, row: &[f64]) -> f64 {
        let z = self.standardizer.transform_row(row);
        let eta = self.intercept
            + z.iter()
                .zip(&self.coefficients)
                .map(|(x, b)| x * b)
                .sum::<f64>();
        sigmoid(eta).clamp(PROBABILITY_FLOOR, 1.0 - PROBABILITY_FLOOR)
    }
}

impl PropensityProvider for LogisticPropensity {
    fn predict(&self, table: &UnitTable) -> Result<Vec<f64>, AnalysisError> {
        table.require_complete(&self.covariates)?;
        let x = table.features(&self.covariates)?;
        Ok(x.rows().map(|row| self.score_row(row)).collect())
    }
}

/// Fits `LogisticPropensity` models
#[derive(Debug, Clone, Default)]
pub struct LogisticPropensityFitter {
    config: PropensityConfig,
}

impl LogisticPropensityFitter {
    pub fn new(config: PropensityConfig) -> Self {
        Self { config }
    }
}

impl PropensityFit for LogisticPropensityFitter {
    type Provider = LogisticPropensity;

    fn fit(&self, table: &UnitTable) -> Result<LogisticPropensity, AnalysisError> {
        self.config.validate()?;
        table.require_both_arms("propensity fit")?;
        table.require_complete(&self.config.covariates)?;

        let raw = table.features(&self.config.covariates)?;
        let standardizer = Standardizer::fit(&raw);
        let n = raw.n_rows();
        let p = raw.n_cols() + 1;

        // Column 0 is the intercept
        let x = DMatrix::from_fn(n, p, |i, j| {
            if j == 0 {
                1.0
            } else {
                (raw.get(i, j - 1) - standardizer.means[j - 1]) / standardizer.scales[j - 1]
            }
        });
        let y = DVector::from_iterator(n, table.treatment().iter().map(|&t| t as f64));

        let mut penalty = DMatrix::<f64>::identity(p, p) * self.config.l2_penalty;
        penalty[(0, 0)] = 0.0;

        let mut beta = DVector::<f64>::zeros(p);
        let mut converged = false;
        let mut iterations = 0;
        for iter in 0..self.config.max_iter {
            iterations = iter + 1;
            let eta = &x * &beta;
            let probs = eta.map(sigmoid);
            let weights = probs.map(|q| (q * (1.0 - q)).max(1e-12));

            let gradient = x.transpose() * (&probs - &y) + &penalty * &beta;
            let weighted = DMatrix::from_fn(n, p, |i, j| x[(i, j)] * weights[i]);
            let hessian = x.transpose() * weighted + &penalty;

            let step = match hessian.clone().cholesky() {
                Some(chol) => chol.solve(&gradient),
                None => hessian.lu().solve(&gradient).ok_or_else(|| {
                    AnalysisError::NumericalDegeneracy(
                        "propensity Hessian is singular".to_string(),
                    )
                })?,
            };
            beta -= &step;

            if beta.iter().any(|b| !b.is_finite()) {
                return Err(AnalysisError::NumericalDegeneracy(
                    "propensity coefficients diverged".to_string(),
                ));
            }
            if step.amax() < self.config.tolerance {
                converged = true;
                break;
            }
        }

        if !converged {
            tracing::warn!(
                "Propensity fit did not converge in {} iterations",
                self.config.max_iter
            );
        }

        let model = LogisticPropensity {
            covariates: self.config.covariates.clone(),
            standardizer,
            intercept: beta[0],
            coefficients: beta.iter().skip(1).copied().collect(),
            iterations,
            converged,
        };
        tracing::debug!(
            "Propensity fit: intercept {:.4}, coefficients {:?}, {} iterations",
            model.intercept,
            model.coefficients,
            iterations
        );
        Ok(model)
    }
}

/// Summary of propensity scores over a population
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropensityDiagnostics {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// `1 - 2|mean - 0.5|`: 1 for a balanced 50/50 design, 0 for a one-arm one
    pub randomization_balance: f64,
}

impl PropensityDiagnostics {
    pub fn from_scores(scores: &[f64]) -> Self {
        if scores.is_empty() {
            return Self {
                mean: f64::NAN,
                min: f64::NAN,
                max: f64::NAN,
                randomization_balance: f64::NAN,
            };
        }
        let mean = scores.iter().sum::<f64>() / scores.len() as f64;
        let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Self {
            mean,
            min,
            max,
            randomization_balance: 1.0 - 2.0 * (mean - 0.5).abs(),
        }
    }
}

fn sigmoid(eta: f64) -> f64 {
    if eta >= 0.0 {
        1.0 / (1.0 + (-eta).exp())
    } else {
        let e = eta.exp();
        e / (1.0 + e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{simulate_experiment, SimulationConfig};
    use approx::assert_relative_eq;

    #[test]
    fn test_randomized_design_scores_near_half() {
        let table = simulate_experiment(&SimulationConfig::default()).unwrap();
        let model = LogisticPropensityFitter::default().fit(&table).unwrap();
        let scores = model.predict(&table).unwrap();

        assert_eq!(scores.len(), table.len());
        assert!(scores.iter().all(|&s| s > 0.0 && s < 1.0));
        let diag = PropensityDiagnostics::from_scores(&scores);
        assert!((diag.mean - 0.5).abs() < 0.02, "mean {}", diag.mean);
        assert!(diag.randomization_balance > 0.96);
    }

    #[test]
    fn test_mean_score_matches_treated_share() {
        // Unpenalized intercept: the score-equation sets mean(p) = mean(t)
        let config = SimulationConfig {
            treatment_rate: 0.3,
            ..Default::default()
        };
        let table = simulate_experiment(&config).unwrap();
        let model = LogisticPropensityFitter::default().fit(&table).unwrap();
        assert!(model.converged);
        let scores = model.predict(&table).unwrap();
        let mean = scores.iter().sum::<f64>() / scores.len() as f64;
        assert_relative_eq!(mean, 0.3, epsilon = 1e-4);
    }

    #[test]
    fn test_confounded_assignment_recovers_direction() {
        let config = SimulationConfig {
            n_units: 3000,
            complete_randomization: false,
            confounding: 3.0,
            ..Default::default()
        };
        let table = simulate_experiment(&config).unwrap();
        let fitter = LogisticPropensityFitter::new(PropensityConfig::default().with_covariates(&["age"]));
        let model = fitter.fit(&table).unwrap();
        assert!(model.coefficients[0] > 0.3, "age coefficient {}", model.coefficients[0]);
    }

    #[test]
    fn test_constant_covariate_does_not_break_fit() {
        let rows: Vec<Vec<f64>> = (0..40).map(|i| vec![1.0, (i % 7) as f64]).collect();
        let treatment: Vec<u8> = (0..40).map(|i| (i % 2) as u8).collect();
        let table = UnitTable::new(
            None,
            treatment,
            vec![0; 40],
            vec!["flat".into(), "x".into()],
            FeatureMatrix::from_rows(&rows).unwrap(),
        )
        .unwrap();
        let fitter = LogisticPropensityFitter::new(PropensityConfig::default().with_covariates(&["flat", "x"]));
        let model = fitter.fit(&table).unwrap();
        assert_relative_eq!(model.standardizer.scales[0], 1.0);
        assert!(model.coefficients.iter().all(|b| b.is_finite()));
    }

    #[test]
    fn test_single_arm_rejected() {
        let config = SimulationConfig {
            treatment_rate: 0.0,
            n_units: 100,
            ..Default::default()
        };
        let table = simulate_experiment(&config).unwrap();
        assert!(matches!(
            LogisticPropensityFitter::default().fit(&table),
            Err(AnalysisError::EmptyGroup { .. })
        ));
    }

    #[test]
    fn test_missing_covariate_values_rejected() {
        let rows = vec![vec![1.0], vec![f64::NAN], vec![3.0], vec![4.0]];
        let table = UnitTable::new(
            None,
            vec![1, 0, 1, 0],
            vec![0, 0, 1, 1],
            vec!["age".into()],
            FeatureMatrix::from_rows(&rows).unwrap(),
        )
        .unwrap();
        let fitter = LogisticPropensityFitter::new(PropensityConfig::default().with_covariates(&["age"]));
        assert!(matches!(
            fitter.fit(&table),
            Err(AnalysisError::MissingValues { count: 1, .. })
        ));
    }

    #[test]
    fn test_diagnostics_balance() {
        let diag = PropensityDiagnostics::from_scores(&[0.7, 0.7, 0.7]);
        assert_relative_eq!(diag.randomization_balance, 0.6, epsilon = 1e-12);
        assert!(PropensityDiagnostics::from_scores(&[]).mean.is_nan());
    }
}
