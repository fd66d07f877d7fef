//! Uplift Estimation (X-Learner)
//!
//! Two-stage meta-learner for heterogeneous treatment effects:
//!
//! 1. Outcome models: mu0 on control units, mu1 on treated units.
//! 2. Imputed effects: d1 = y - mu0(x) for treated units,
//!    d0 = mu1(x) - y for control units.
//! 3. Effect models: tau1 fitted on d1, tau0 fitted on d0.
//! 4. Combination with the propensity g(x):
//!    tau(x) = g(x) * tau0(x) + (1 - g(x)) * tau1(x)
//!
//! tau0 dominates where treatment is likely and tau1 where it is unlikely.
//!
//! Models train on a seeded split; the held-out rows validate the scores.
//! The clipped score bounds ranking influence; diagnostics always use the
//! raw score.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::domain::stats::mean;
use crate::domain::{AnalysisError, UnitTable};
use crate::estimators::calibration::{decile_calibration, CalibrationReport};
use crate::estimators::forest::RandomForestRegressor;
use crate::estimators::params::UpliftConfig;
use crate::ports::{FittedRegressor, PropensityProvider, Regressor};

/// Propensities are clamped into [EPS, 1 - EPS] for the transformed outcome
const TRANSFORMED_OUTCOME_EPS: f64 = 1e-3;

/// Held-out validation of the uplift scores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpliftValidation {
    pub n: usize,
    pub mean_predicted: f64,
    /// Treated rate minus control rate on the validation rows
    pub observed_effect: f64,
    /// `mean_predicted - observed_effect`
    pub gap: f64,
    /// Mean squared error against the transformed outcome y(t - e) / (e(1 - e))
    pub transformed_outcome_mse: f64,
}

/// One unit in a ranking by uplift
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedUnit {
    pub row: usize,
    pub id: Option<String>,
    pub score: f64,
}

/// Scores for every row of the input table plus validation diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpliftResult {
    pub raw: Vec<f64>,
    pub clipped: Vec<f64>,
    pub clip_bound: f64,
    /// True for rows held out for validation
    pub validation_mask: Vec<bool>,
    pub validation: UpliftValidation,
    pub calibration: CalibrationReport,
}

impl UpliftResult {
    /// `n` rows with the highest clipped score (ties by row order)
    pub fn top(&self, table: &UnitTable, n: usize) -> Vec<RankedUnit> {
        self.ranked(table, n, true)
    }

    /// `n` rows with the lowest clipped score (ties by row order)
    pub fn bottom(&self, table: &UnitTable, n: usize) -> Vec<RankedUnit> {
        self.ranked(table, n, false)
    }

    fn ranked(&self, table: &UnitTable, n: usize, descending: bool) -> Vec<RankedUnit> {
        let mut order: Vec<usize> = (0..self.clipped.len()).collect();
        order.sort_by(|&a, &b| {
            let cmp = self.clipped[a].total_cmp(&self.clipped[b]);
            let cmp = if descending { cmp.reverse() } else { cmp };
            cmp.then(a.cmp(&b))
        });
        order
            .into_iter()
            .take(n)
            .map(|row| RankedUnit {
                row,
                id: table.id(row).map(str::to_string),
                score: self.clipped[row],
            })
            .collect()
    }
}

/// X-learner over any base regressor
#[derive(Debug, Clone)]
pub struct XLearner<R = RandomForestRegressor> {
    config: UpliftConfig,
    learner: R,
}

impl XLearner<RandomForestRegressor> {
    /// X-learner with random-forest base learners from `config.forest`
    pub fn new(config: UpliftConfig) -> Self {
        let learner = RandomForestRegressor::new(config.forest.clone());
        Self { config, learner }
    }
}

impl<R: Regressor> XLearner<R> {
    pub fn with_learner(config: UpliftConfig, learner: R) -> Self {
        Self { config, learner }
    }

    pub fn config(&self) -> &UpliftConfig {
        &self.config
    }

    /// Train on a seeded split of `table` and score every row
    pub fn fit_predict(
        &self,
        table: &UnitTable,
        propensity: &dyn PropensityProvider,
    ) -> Result<UpliftResult, AnalysisError> {
        self.config.validate()?;
        table.require_both_arms("uplift estimation")?;
        table.require_complete(&self.config.covariates)?;

        let n = table.len();
        let n_test = (n as f64 * self.config.test_fraction).ceil() as usize;
        if n_test == 0 || n_test >= n {
            return Err(AnalysisError::DataValidation(format!(
                "uplift split of {} rows leaves {} validation rows",
                n, n_test
            )));
        }
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(&mut StdRng::seed_from_u64(self.config.seed));
        let mut validation_mask = vec![false; n];
        for &i in &order[..n_test] {
            validation_mask[i] = true;
        }

        let train = table.subset(&order[n_test..]);
        train.require_both_arms("uplift training split")?;

        let x_train = train.features(&self.config.covariates)?;
        let y_train = train.outcome_f64();
        let (treated, control) = train.arm_indices();
        let pick = |rows: &[usize], values: &[f64]| rows.iter().map(|&i| values[i]).collect::<Vec<f64>>();

        let x_t = x_train.select_rows(&treated);
        let x_c = x_train.select_rows(&control);
        let y_t = pick(&treated, &y_train);
        let y_c = pick(&control, &y_train);

        let seed = self.config.seed;
        let mu0 = self.learner.fit(&x_c, &y_c, seed)?;
        let mu1 = self.learner.fit(&x_t, &y_t, seed.wrapping_add(1))?;

        let d_t: Vec<f64> = y_t.iter().zip(mu0.predict(&x_t)).map(|(y, m)| y - m).collect();
        let d_c: Vec<f64> = mu1.predict(&x_c).into_iter().zip(&y_c).map(|(m, y)| m - y).collect();

        let tau1 = self.learner.fit(&x_t, &d_t, seed.wrapping_add(2))?;
        let tau0 = self.learner.fit(&x_c, &d_c, seed.wrapping_add(3))?;

        let scores_g = propensity.predict(table)?;
        if scores_g.len() != n {
            return Err(AnalysisError::DataValidation(format!(
                "propensity provider returned {} scores for {} rows",
                scores_g.len(),
                n
            )));
        }

        let x_all = table.features(&self.config.covariates)?;
        let raw: Vec<f64> = x_all
            .rows()
            .zip(&scores_g)
            .map(|(row, &g)| g * tau0.predict_row(row) + (1.0 - g) * tau1.predict_row(row))
            .collect();
        let bound = self.config.clip_bound;
        let clipped: Vec<f64> = raw.iter().map(|s| s.clamp(-bound, bound)).collect();
        let n_clipped = raw.iter().filter(|s| s.abs() > bound).count();
        if n_clipped > 0 {
            tracing::debug!("Uplift: {} scores clipped to ±{}", n_clipped, bound);
        }

        let held_out: Vec<usize> = (0..n).filter(|&i| validation_mask[i]).collect();
        let validation = validate(table, &raw, &scores_g, &held_out);
        let calibration = decile_calibration(
            &pick(&held_out, &raw),
            &held_out.iter().map(|&i| table.treatment()[i]).collect::<Vec<_>>(),
            &held_out.iter().map(|&i| table.outcome()[i]).collect::<Vec<_>>(),
            self.config.n_buckets,
        )?;

        tracing::info!(
            "Uplift: mean predicted {:.4} vs observed {:.4} on {} validation rows, transformed-outcome MSE {:.4}",
            validation.mean_predicted,
            validation.observed_effect,
            validation.n,
            validation.transformed_outcome_mse
        );

        Ok(UpliftResult {
            raw,
            clipped,
            clip_bound: bound,
            validation_mask,
            validation,
            calibration,
        })
    }
}

fn validate(table: &UnitTable, raw: &[f64], propensity: &[f64], rows: &[usize]) -> UpliftValidation {
    let predicted: Vec<f64> = rows.iter().map(|&i| raw[i]).collect();
    let mean_predicted = mean(&predicted);

    let rate = |arm: u8| {
        let outcomes: Vec<f64> = rows
            .iter()
            .filter(|&&i| table.treatment()[i] == arm)
            .map(|&i| table.outcome()[i] as f64)
            .collect();
        mean(&outcomes)
    };
    let observed_effect = rate(1) - rate(0);
    if observed_effect.is_nan() {
        tracing::warn!("Uplift: validation split is missing an arm, observed effect undefined");
    }

    let transformed_outcome_mse = mean(
        &rows
            .iter()
            .map(|&i| {
                let e = propensity[i].clamp(TRANSFORMED_OUTCOME_EPS, 1.0 - TRANSFORMED_OUTCOME_EPS);
                let t = table.treatment()[i] as f64;
                let y = table.outcome()[i] as f64;
                let target = y * (t - e) / (e * (1.0 - e));
                (target - raw[i]).powi(2)
            })
            .collect::<Vec<f64>>(),
    );

    UpliftValidation {
        n: rows.len(),
        mean_predicted,
        observed_effect,
        gap: mean_predicted - observed_effect,
        transformed_outcome_mse,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{simulate_experiment, FeatureMatrix, SimulationConfig};
    use crate::estimators::params::ForestConfig;
    use crate::ports::MockPropensityProvider;
    use approx::assert_relative_eq;

    /// Regressor that always predicts the training mean
    struct MeanRegressor;

    struct FittedMean(f64);

    impl FittedRegressor for FittedMean {
        fn predict_row(&self, _row: &[f64]) -> f64 {
            self.0
        }
    }

    impl Regressor for MeanRegressor {
        type Fitted = FittedMean;

        fn fit(&self, _x: &FeatureMatrix, y: &[f64], _seed: u64) -> Result<FittedMean, AnalysisError> {
            Ok(FittedMean(mean(y)))
        }
    }

    fn constant_propensity(n: usize, value: f64) -> MockPropensityProvider {
        let mut provider = MockPropensityProvider::new();
        provider.expect_predict().returning(move |_| Ok(vec![value; n]));
        provider
    }

    fn small_forest() -> ForestConfig {
        ForestConfig {
            n_trees: 20,
            ..Default::default()
        }
    }

    #[test]
    fn test_mean_learner_recovers_difference_in_means() {
        // With constant base learners every score equals the training-split lift
        let table = simulate_experiment(&SimulationConfig::default()).unwrap();
        let learner = XLearner::with_learner(UpliftConfig::default(), MeanRegressor);
        let result = learner.fit_predict(&table, &constant_propensity(table.len(), 0.5)).unwrap();

        let rate = |arm: u8| {
            let rows: Vec<f64> = (0..table.len())
                .filter(|&i| !result.validation_mask[i] && table.treatment()[i] == arm)
                .map(|i| table.outcome()[i] as f64)
                .collect();
            mean(&rows)
        };
        let training_lift = rate(1) - rate(0);
        assert!(result.raw.iter().all(|&s| (s - training_lift).abs() < 1e-12));
    }

    #[test]
    fn test_propensity_weights_the_effect_models() {
        // g = 1 uses tau0 only: mean(mu1) - mean(y_c) = lift on the training split
        let table = simulate_experiment(&SimulationConfig::default()).unwrap();
        let learner = XLearner::with_learner(UpliftConfig::default(), MeanRegressor);
        let at_one = learner.fit_predict(&table, &constant_propensity(table.len(), 1.0)).unwrap();
        let at_zero = learner.fit_predict(&table, &constant_propensity(table.len(), 0.0)).unwrap();
        // Both effect models see the same training lift
        assert_relative_eq!(at_one.raw[0], at_zero.raw[0], epsilon = 1e-12);
    }

    #[test]
    fn test_split_is_seeded_and_sized() {
        let table = simulate_experiment(&SimulationConfig::default().with_units(500)).unwrap();
        let config = UpliftConfig::default().with_forest(small_forest());
        let provider = constant_propensity(table.len(), 0.5);
        let a = XLearner::new(config.clone()).fit_predict(&table, &provider).unwrap();
        let b = XLearner::new(config).fit_predict(&table, &provider).unwrap();

        assert_eq!(a.validation_mask.iter().filter(|&&m| m).count(), 100);
        assert_eq!(a.validation_mask, b.validation_mask);
        assert_eq!(a.raw, b.raw);
    }

    #[test]
    fn test_clipping_bounds_scores_but_keeps_raw() {
        let table = simulate_experiment(&SimulationConfig::default().with_units(600)).unwrap();
        let config = UpliftConfig {
            clip_bound: 0.01,
            ..UpliftConfig::default().with_forest(small_forest())
        };
        let result = XLearner::new(config)
            .fit_predict(&table, &constant_propensity(table.len(), 0.5))
            .unwrap();
        assert!(result.clipped.iter().all(|s| s.abs() <= 0.01));
        assert!(result.raw.iter().any(|s| s.abs() > 0.01));
    }

    #[test]
    fn test_top_and_bottom_rankings() {
        let table = simulate_experiment(&SimulationConfig::default().with_units(300)).unwrap();
        let result = XLearner::new(UpliftConfig::default().with_forest(small_forest()))
            .fit_predict(&table, &constant_propensity(table.len(), 0.5))
            .unwrap();
        let top = result.top(&table, 5);
        let bottom = result.bottom(&table, 5);
        assert_eq!(top.len(), 5);
        assert!(top.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(bottom.windows(2).all(|w| w[0].score <= w[1].score));
        assert!(top[0].score >= bottom[0].score);
        assert!(top[0].id.is_some());
    }

    #[test]
    fn test_zero_treated_units_rejected() {
        let config = SimulationConfig {
            treatment_rate: 0.0,
            n_units: 200,
            ..Default::default()
        };
        let table = simulate_experiment(&config).unwrap();
        let err = XLearner::new(UpliftConfig::default())
            .fit_predict(&table, &constant_propensity(200, 0.5))
            .unwrap_err();
        assert!(matches!(err, AnalysisError::EmptyGroup { .. }));
    }

    #[test]
    fn test_transformed_outcome_loss_is_finite() {
        let table = simulate_experiment(&SimulationConfig::default().with_units(400)).unwrap();
        let result = XLearner::new(UpliftConfig::default().with_forest(small_forest()))
            .fit_predict(&table, &constant_propensity(table.len(), 0.5))
            .unwrap();
        assert!(result.validation.transformed_outcome_mse.is_finite());
        assert_eq!(result.validation.n, 80);
    }
}
