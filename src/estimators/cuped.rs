//! CUPED Covariate Adjustment
//!
//! Controlled-experiment Using Pre-Experiment Data. Reduces outcome variance
//! by subtracting the part of the outcome explained by pre-treatment
//! covariates:
//!
//! adjusted = outcome - (X - mean_est) · theta
//! theta    = pinv(Xcᵀ Xc) · Xcᵀ yc     (estimation split only)
//!
//! Rows are split once with a fixed seed. Theta and the centering means come
//! from the estimation split alone and are applied to every row, so no
//! statistic of the scored population leaks back into the adjustment.

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::domain::stats::{mean, sample_variance};
use crate::domain::{AnalysisError, FeatureMatrix, UnitTable};
use crate::estimators::params::CupedConfig;

/// Covariates with variance below this on the estimation split are excluded
const MIN_COVARIATE_VARIANCE: f64 = 1e-12;
/// Singular values below this fraction of the largest are treated as zero
const PINV_RELATIVE_TOLERANCE: f64 = 1e-12;

/// Fitted adjustment: coefficients plus the estimation-split centering means
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CupedModel {
    pub covariates: Vec<String>,
    /// Estimation-split mean of each covariate
    pub means: Vec<f64>,
    /// One coefficient per covariate (0 for excluded covariates)
    pub theta: Vec<f64>,
    /// Estimation-split outcome mean
    pub outcome_mean: f64,
    /// Zero-variance covariates left out of the fit
    pub excluded: Vec<String>,
}

impl CupedModel {
    /// Linear adjustment for one row of covariates (same order as `covariates`)
    pub fn adjustment(&self, row: &[f64]) -> f64 {
        row.iter()
            .zip(&self.means)
            .zip(&self.theta)
            .map(|((x, m), t)| (x - m) * t)
            .sum()
    }

    pub fn adjust(&self, outcome: f64, row: &[f64]) -> f64 {
        outcome - self.adjustment(row)
    }
}

/// Output of one CUPED run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CupedResult {
    pub model: CupedModel,
    /// Source rows that had every covariate (input order)
    pub rows: Vec<usize>,
    /// Adjusted outcome, aligned with `rows`
    pub adjusted: Vec<f64>,
    pub dropped_rows: usize,
    pub estimation_rows: usize,
    pub treatment_mean: f64,
    pub control_mean: f64,
    pub lift: f64,
    pub original_variance: f64,
    pub adjusted_variance: f64,
    /// `100 * (1 - var(adjusted) / var(raw))`; NaN when the raw variance is zero
    pub variance_reduction_pct: f64,
    /// Why theta could not be estimated, when the outcome was left unadjusted
    pub degenerate: Option<String>,
}

/// CUPED adjuster
#[derive(Debug, Clone)]
pub struct CupedAdjuster {
    config: CupedConfig,
}

impl CupedAdjuster {
    pub fn new(config: CupedConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CupedConfig {
        &self.config
    }

    /// Estimate theta on the estimation split and adjust every complete row
    pub fn fit_apply(&self, table: &UnitTable) -> Result<CupedResult, AnalysisError> {
        self.config.validate()?;

        let rows = table.complete_rows(&self.config.covariates)?;
        let dropped_rows = table.len() - rows.len();
        if dropped_rows > 0 {
            tracing::warn!(
                "CUPED: dropped {} of {} rows with missing covariates",
                dropped_rows,
                table.len()
            );
        }
        if rows.len() < 2 {
            return Err(AnalysisError::DataValidation(format!(
                "CUPED needs at least 2 complete rows, got {}",
                rows.len()
            )));
        }

        let complete = table.subset(&rows);
        complete.require_both_arms("CUPED adjustment")?;

        let x = complete.features(&self.config.covariates)?;
        let y = complete.outcome_f64();

        let mut order: Vec<usize> = (0..complete.len()).collect();
        order.shuffle(&mut StdRng::seed_from_u64(self.config.seed));
        let n_est = (complete.len() as f64 * self.config.estimation_fraction) as usize;
        if n_est < 2 {
            return Err(AnalysisError::DataValidation(format!(
                "CUPED estimation split has {} rows (fraction {}), need at least 2",
                n_est, self.config.estimation_fraction
            )));
        }
        let estimation = &order[..n_est];

        let model = self.estimate(&x.select_rows(estimation), estimation.iter().map(|&i| y[i]))?;

        let adjusted: Vec<f64> = (0..complete.len())
            .map(|i| model.adjust(y[i], x.row(i)))
            .collect();

        let (treated, control) = complete.arm_indices();
        let treatment_mean = mean(&treated.iter().map(|&i| adjusted[i]).collect::<Vec<_>>());
        let control_mean = mean(&control.iter().map(|&i| adjusted[i]).collect::<Vec<_>>());

        let original_variance = sample_variance(&y);
        let adjusted_variance = sample_variance(&adjusted);
        let variance_reduction_pct = if original_variance > 0.0 {
            100.0 * (1.0 - adjusted_variance / original_variance)
        } else {
            tracing::warn!("CUPED: outcome has zero variance, variance reduction is undefined");
            f64::NAN
        };

        tracing::info!(
            "CUPED: theta={:?}, adjusted treatment mean {:.4}, control mean {:.4}, variance reduction {:.1}%",
            model.theta,
            treatment_mean,
            control_mean,
            variance_reduction_pct
        );

        Ok(CupedResult {
            model,
            rows,
            adjusted,
            dropped_rows,
            estimation_rows: n_est,
            treatment_mean,
            control_mean,
            lift: treatment_mean - control_mean,
            original_variance,
            adjusted_variance,
            variance_reduction_pct,
            degenerate: None,
        })
    }

    /// Same rows as `fit_apply`, outcome left unadjusted (theta = 0).
    ///
    /// Used when theta is numerically degenerate: the unadjusted statistics
    /// stay valid and the variance reduction is NaN.
    pub fn unadjusted(&self, table: &UnitTable, reason: impl Into<String>) -> Result<CupedResult, AnalysisError> {
        let rows = table.complete_rows(&self.config.covariates)?;
        let dropped_rows = table.len() - rows.len();
        let complete = table.subset(&rows);
        complete.require_both_arms("CUPED adjustment")?;

        let x = complete.features(&self.config.covariates)?;
        let y = complete.outcome_f64();
        let (treated, control) = complete.arm_indices();
        let treatment_mean = mean(&treated.iter().map(|&i| y[i]).collect::<Vec<_>>());
        let control_mean = mean(&control.iter().map(|&i| y[i]).collect::<Vec<_>>());
        let variance = sample_variance(&y);

        Ok(CupedResult {
            model: CupedModel {
                covariates: self.config.covariates.clone(),
                means: (0..x.n_cols()).map(|j| mean(&x.column(j))).collect(),
                theta: vec![0.0; x.n_cols()],
                outcome_mean: mean(&y),
                excluded: self.config.covariates.clone(),
            },
            rows,
            adjusted: y,
            dropped_rows,
            estimation_rows: 0,
            treatment_mean,
            control_mean,
            lift: treatment_mean - control_mean,
            original_variance: variance,
            adjusted_variance: variance,
            variance_reduction_pct: f64::NAN,
            degenerate: Some(reason.into()),
        })
    }

    /// Least squares on centered estimation-split data via the pseudo-inverse
    fn estimate(
        &self,
        x: &FeatureMatrix,
        y: impl Iterator<Item = f64>,
    ) -> Result<CupedModel, AnalysisError> {
        let y: Vec<f64> = y.collect();
        let n = x.n_rows();
        let p = x.n_cols();
        let outcome_mean = mean(&y);

        let columns: Vec<Vec<f64>> = (0..p).map(|j| x.column(j)).collect();
        let means: Vec<f64> = columns.iter().map(|c| mean(c)).collect();

        let mut active = Vec::with_capacity(p);
        let mut excluded = Vec::new();
        for (j, column) in columns.iter().enumerate() {
            if sample_variance(column) > MIN_COVARIATE_VARIANCE {
                active.push(j);
            } else {
                tracing::warn!(
                    "CUPED: covariate '{}' has zero variance on the estimation split, excluded",
                    self.config.covariates[j]
                );
                excluded.push(self.config.covariates[j].clone());
            }
        }

        let mut theta = vec![0.0; p];
        if active.is_empty() {
            tracing::warn!("CUPED: no usable covariates, outcome left unadjusted");
        } else {
            let xc = DMatrix::from_fn(n, active.len(), |i, k| {
                let j = active[k];
                columns[j][i] - means[j]
            });
            let yc = DVector::from_iterator(n, y.iter().map(|v| v - outcome_mean));

            let xtx = xc.transpose() * &xc;
            let svd = xtx.svd(true, true);
            let eps = svd.singular_values.max() * PINV_RELATIVE_TOLERANCE;
            let pinv = svd
                .pseudo_inverse(eps)
                .map_err(|e| AnalysisError::NumericalDegeneracy(format!("CUPED pseudo-inverse: {}", e)))?;
            let fitted = pinv * (xc.transpose() * yc);

            for (k, &j) in active.iter().enumerate() {
                theta[j] = fitted[k];
            }
            if theta.iter().any(|t| !t.is_finite()) {
                return Err(AnalysisError::NumericalDegeneracy(
                    "CUPED theta is not finite".to_string(),
                ));
            }
        }

        Ok(CupedModel {
            covariates: self.config.covariates.clone(),
            means,
            theta,
            outcome_mean,
            excluded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{simulate_experiment, SimulationConfig};
    use approx::assert_relative_eq;

    fn table_from(rows: Vec<Vec<f64>>, names: &[&str], treatment: Vec<u8>, outcome: Vec<u8>) -> UnitTable {
        UnitTable::new(
            None,
            treatment,
            outcome,
            names.iter().map(|s| s.to_string()).collect(),
            FeatureMatrix::from_rows(&rows).unwrap(),
        )
        .unwrap()
    }

    fn prognostic_table() -> UnitTable {
        let config = SimulationConfig {
            n_units: 2000,
            prognostic: 0.5,
            ..Default::default()
        };
        simulate_experiment(&config).unwrap()
    }

    #[test]
    fn test_perfect_covariate_removes_all_variance() {
        let outcome: Vec<u8> = (0..200).map(|i| u8::from(i % 3 == 0)).collect();
        let treatment: Vec<u8> = (0..200).map(|i| (i % 2) as u8).collect();
        let rows = outcome.iter().map(|&y| vec![y as f64]).collect();
        let table = table_from(rows, &["signal"], treatment, outcome);

        let adjuster = CupedAdjuster::new(CupedConfig::default().with_covariates(&["signal"]));
        let result = adjuster.fit_apply(&table).unwrap();

        assert_relative_eq!(result.model.theta[0], 1.0, epsilon = 1e-9);
        assert_relative_eq!(result.variance_reduction_pct, 100.0, epsilon = 1e-6);
    }

    #[test]
    fn test_informative_covariates_reduce_variance() {
        let outcome: Vec<u8> = (0..400).map(|i| u8::from((i * 7) % 10 < 3)).collect();
        let treatment: Vec<u8> = (0..400).map(|i| (i % 2) as u8).collect();
        let rows = outcome
            .iter()
            .enumerate()
            .map(|(i, &y)| vec![y as f64 + ((i * 37) % 100) as f64 / 100.0])
            .collect();
        let table = table_from(rows, &["noisy_signal"], treatment, outcome);

        let adjuster = CupedAdjuster::new(CupedConfig::default().with_covariates(&["noisy_signal"]));
        let result = adjuster.fit_apply(&table).unwrap();

        assert!(result.adjusted_variance <= result.original_variance);
        assert!(result.variance_reduction_pct > 20.0);
        assert_eq!(result.adjusted.len(), table.len());
    }

    #[test]
    fn test_centering_uses_estimation_split_means() {
        let table = prognostic_table();
        let adjuster = CupedAdjuster::new(CupedConfig::default().with_covariates(&["total_actions"]));
        let result = adjuster.fit_apply(&table).unwrap();

        // Recompute the estimation split and compare against the stored means
        let mut order: Vec<usize> = (0..table.len()).collect();
        order.shuffle(&mut StdRng::seed_from_u64(adjuster.config().seed));
        let est = &order[..result.estimation_rows];
        let values = table.column("total_actions").unwrap();
        let est_mean = mean(&est.iter().map(|&i| values[i]).collect::<Vec<_>>());
        assert_relative_eq!(result.model.means[0], est_mean, epsilon = 1e-9);

        let i = 17;
        let expected = table.outcome()[i] as f64 - (values[i] - est_mean) * result.model.theta[0];
        assert_relative_eq!(result.adjusted[i], expected, epsilon = 1e-9);
    }

    #[test]
    fn test_missing_covariates_dropped() {
        let rows = vec![
            vec![1.0],
            vec![f64::NAN],
            vec![2.0],
            vec![3.0],
            vec![4.0],
            vec![5.0],
        ];
        let table = table_from(rows, &["x"], vec![1, 0, 0, 1, 0, 1], vec![1, 0, 0, 1, 0, 0]);
        let adjuster = CupedAdjuster::new(CupedConfig::default().with_covariates(&["x"]));
        let result = adjuster.fit_apply(&table).unwrap();

        assert_eq!(result.dropped_rows, 1);
        assert_eq!(result.rows, vec![0, 2, 3, 4, 5]);
        assert_eq!(result.adjusted.len(), 5);
    }

    #[test]
    fn test_zero_variance_covariate_excluded() {
        let table = prognostic_table();
        let n = table.len();
        let mut rows = Vec::with_capacity(n);
        let actions = table.column("unique_actions").unwrap();
        for a in &actions {
            rows.push(vec![*a, 7.0]);
        }
        let table = table_from(
            rows,
            &["unique_actions", "constant"],
            table.treatment().to_vec(),
            table.outcome().to_vec(),
        );
        let adjuster = CupedAdjuster::new(CupedConfig::default().with_covariates(&["unique_actions", "constant"]));
        let result = adjuster.fit_apply(&table).unwrap();

        assert_eq!(result.model.excluded, vec!["constant".to_string()]);
        assert_eq!(result.model.theta[1], 0.0);
        assert!(result.model.theta[0].is_finite());
    }

    #[test]
    fn test_collinear_covariates_use_minimum_norm_solution() {
        let table = prognostic_table();
        let actions = table.column("unique_actions").unwrap();
        let rows = actions.iter().map(|a| vec![*a, *a]).collect();
        let table = table_from(rows, &["a", "b"], table.treatment().to_vec(), table.outcome().to_vec());

        let adjuster = CupedAdjuster::new(CupedConfig::default().with_covariates(&["a", "b"]));
        let result = adjuster.fit_apply(&table).unwrap();

        assert!(result.model.theta.iter().all(|t| t.is_finite()));
        assert_relative_eq!(result.model.theta[0], result.model.theta[1], epsilon = 1e-8);
    }

    #[test]
    fn test_deterministic_for_same_seed() {
        let table = prognostic_table();
        let adjuster = CupedAdjuster::new(CupedConfig::default());
        let a = adjuster.fit_apply(&table).unwrap();
        let b = adjuster.fit_apply(&table).unwrap();
        assert_eq!(a.adjusted, b.adjusted);
        assert_eq!(a.model, b.model);
    }

    #[test]
    fn test_missing_column_is_reported() {
        let table = prognostic_table();
        let adjuster = CupedAdjuster::new(CupedConfig::default().with_covariates(&["median_secs_elapsed"]));
        assert!(matches!(
            adjuster.fit_apply(&table),
            Err(AnalysisError::MissingColumn(ref c)) if c == "median_secs_elapsed"
        ));
    }

    #[test]
    fn test_overflowing_covariate_is_degenerate() {
        let base = prognostic_table();
        let rows = (0..base.len()).map(|i| vec![1e200 * (i % 7) as f64]).collect();
        let table = table_from(rows, &["huge"], base.treatment().to_vec(), base.outcome().to_vec());
        let adjuster = CupedAdjuster::new(CupedConfig::default().with_covariates(&["huge"]));

        let err = adjuster.fit_apply(&table).unwrap_err();
        assert!(matches!(err, AnalysisError::NumericalDegeneracy(_)));
        assert!(!err.is_structural());

        let fallback = adjuster.unadjusted(&table, err.to_string()).unwrap();
        assert_eq!(fallback.model.theta, vec![0.0]);
        assert_eq!(fallback.adjusted, table.outcome_f64());
        assert!(fallback.variance_reduction_pct.is_nan());
        assert!(fallback.degenerate.is_some());
        assert_relative_eq!(fallback.original_variance, fallback.adjusted_variance);
    }

    #[test]
    fn test_zero_treated_units_rejected() {
        let rows = (0..10).map(|i| vec![i as f64]).collect();
        let table = table_from(rows, &["x"], vec![0; 10], vec![0, 1, 0, 1, 0, 1, 0, 1, 0, 1]);
        let adjuster = CupedAdjuster::new(CupedConfig::default().with_covariates(&["x"]));
        assert!(matches!(
            adjuster.fit_apply(&table),
            Err(AnalysisError::EmptyGroup { .. })
        ));
    }
}
