//! Propensity Score Matching
//!
//! Pairs every treated unit with a control of similar propensity:
//!
//! 1. Controls are sorted by score once.
//! 2. For each treated unit (input order) the `n_neighbors` nearest
//!    available controls are found by expanding outward from a binary-search
//!    position. Equal distances prefer the lower-scored control.
//! 3. The closest candidate within the caliper is accepted. A caliper of 0
//!    accepts exact score matches only, an infinite caliper accepts any.
//!
//! With replacement a control may serve several treated units; without it a
//! matched control is removed from the pool.
//!
//! Balance is reported as the standardized mean difference of each
//! covariate before and after matching:
//! SMD = (mean_t - mean_c) / sqrt((var_t + var_c) / 2)

use serde::{Deserialize, Serialize};

use crate::domain::stats::{mean, sample_variance};
use crate::domain::{AnalysisError, Arm, UnitTable};
use crate::estimators::params::MatchingConfig;
use crate::ports::PropensityProvider;

/// |SMD| below this counts as well balanced
pub const BALANCE_THRESHOLD: f64 = 0.1;
/// Pooled standard deviations below this make the SMD undefined
const MIN_POOLED_SD: f64 = 1e-12;

/// One accepted treated/control pair (row indices into the matched table)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchedPair {
    pub treated_row: usize,
    pub control_row: usize,
    pub distance: f64,
}

/// Standardized mean difference of one covariate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateBalance {
    pub covariate: String,
    pub smd_before: f64,
    pub smd_after: f64,
    pub well_balanced: bool,
}

/// One row of the matched-sample export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedUnit {
    pub pair: usize,
    pub row: usize,
    pub group: Arm,
    pub propensity: f64,
    pub outcome: f64,
}

/// Result of matching one population
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchOutcome {
    pub pairs: Vec<MatchedPair>,
    pub treated_total: usize,
    /// Mean within-pair outcome difference (treated - control)
    pub ate: f64,
    /// Whether `ate` was computed on the adjusted outcome
    pub ate_on_adjusted: bool,
    pub balance: Vec<CovariateBalance>,
    pub units: Vec<MatchedUnit>,
}

impl MatchOutcome {
    pub fn n_matched(&self) -> usize {
        self.pairs.len()
    }

    pub fn match_rate(&self) -> f64 {
        if self.treated_total == 0 {
            return f64::NAN;
        }
        self.pairs.len() as f64 / self.treated_total as f64
    }

    pub fn unique_controls(&self) -> usize {
        let mut controls: Vec<usize> = self.pairs.iter().map(|p| p.control_row).collect();
        controls.sort_unstable();
        controls.dedup();
        controls.len()
    }
}

/// Nearest-neighbor matcher on propensity scores
#[derive(Debug, Clone, Default)]
pub struct PropensityMatcher {
    config: MatchingConfig,
}

impl PropensityMatcher {
    pub fn new(config: MatchingConfig) -> Self {
        Self { config }
    }

    /// Score `table` with `provider`, then match
    pub fn match_with(
        &self,
        table: &UnitTable,
        provider: &dyn PropensityProvider,
        adjusted: Option<&[f64]>,
        balance_covariates: &[String],
    ) -> Result<MatchOutcome, AnalysisError> {
        let scores = provider.predict(table)?;
        self.match_scores(table, &scores, adjusted, balance_covariates)
    }

    /// Match on precomputed scores aligned with the rows of `table`
    pub fn match_scores(
        &self,
        table: &UnitTable,
        scores: &[f64],
        adjusted: Option<&[f64]>,
        balance_covariates: &[String],
    ) -> Result<MatchOutcome, AnalysisError> {
        self.config.validate()?;
        if scores.len() != table.len() {
            return Err(AnalysisError::DataValidation(format!(
                "{} propensity scores for {} rows",
                scores.len(),
                table.len()
            )));
        }
        if let Some(values) = adjusted {
            if values.len() != table.len() {
                return Err(AnalysisError::DataValidation(format!(
                    "{} adjusted outcomes for {} rows",
                    values.len(),
                    table.len()
                )));
            }
        }
        if let Some(row) = scores.iter().position(|s| !s.is_finite()) {
            return Err(AnalysisError::DataValidation(format!(
                "propensity score at row {} is not finite",
                row
            )));
        }
        table.require_both_arms("propensity matching")?;

        let (treated, control) = table.arm_indices();
        let mut sorted: Vec<(f64, usize)> = control.iter().map(|&i| (scores[i], i)).collect();
        sorted.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        let mut used = vec![false; sorted.len()];

        let mut pairs = Vec::new();
        for &t in &treated {
            let candidates = k_nearest(&sorted, &used, scores[t], self.config.n_neighbors);
            let accepted = candidates
                .into_iter()
                .find(|&(_, distance)| distance <= self.config.caliper);
            if let Some((pos, distance)) = accepted {
                if !self.config.with_replacement {
                    used[pos] = true;
                }
                pairs.push(MatchedPair {
                    treated_row: t,
                    control_row: sorted[pos].1,
                    distance,
                });
            }
        }

        if pairs.is_empty() {
            return Err(AnalysisError::NoMatchesFound {
                treated: treated.len(),
                caliper: self.config.caliper,
            });
        }

        let raw = table.outcome_f64();
        let outcome = adjusted.unwrap_or(raw.as_slice());
        let ate = pairs
            .iter()
            .map(|p| outcome[p.treated_row] - outcome[p.control_row])
            .sum::<f64>()
            / pairs.len() as f64;

        let balance = covariate_balance(table, &pairs, balance_covariates)?;
        let poorly_balanced: Vec<&str> = balance
            .iter()
            .filter(|b| !b.well_balanced)
            .map(|b| b.covariate.as_str())
            .collect();
        if !poorly_balanced.is_empty() {
            tracing::warn!("Matching: covariates not balanced after matching: {:?}", poorly_balanced);
        }

        let units = pairs
            .iter()
            .enumerate()
            .flat_map(|(k, p)| {
                [(p.treated_row, Arm::Treated), (p.control_row, Arm::Control)]
                    .into_iter()
                    .map(move |(row, group)| (k, row, group))
            })
            .map(|(pair, row, group)| MatchedUnit {
                pair,
                row,
                group,
                propensity: scores[row],
                outcome: outcome[row],
            })
            .collect();

        let result = MatchOutcome {
            pairs,
            treated_total: treated.len(),
            ate,
            ate_on_adjusted: adjusted.is_some(),
            balance,
            units,
        };
        tracing::info!(
            "Matching: {}/{} treated matched ({} distinct controls), ATE {:.4}",
            result.n_matched(),
            result.treated_total,
            result.unique_controls(),
            result.ate
        );
        Ok(result)
    }
}

/// Up to `k` nearest available controls as (position in `sorted`, distance)
fn k_nearest(sorted: &[(f64, usize)], used: &[bool], target: f64, k: usize) -> Vec<(usize, f64)> {
    let split = sorted.partition_point(|&(s, _)| s < target);
    let mut left = split;
    let mut right = split;
    let mut found = Vec::with_capacity(k);

    let next_left = |mut pos: usize| -> Option<usize> {
        while pos > 0 {
            pos -= 1;
            if !used[pos] {
                return Some(pos);
            }
        }
        None
    };
    let next_right = |mut pos: usize| -> Option<usize> {
        while pos < sorted.len() {
            if !used[pos] {
                return Some(pos);
            }
            pos += 1;
        }
        None
    };

    while found.len() < k {
        let l = next_left(left);
        let r = next_right(right);
        let pick = match (l, r) {
            (None, None) => break,
            (Some(l), None) => l,
            (None, Some(r)) => r,
            (Some(l), Some(r)) => {
                if (target - sorted[l].0) <= (sorted[r].0 - target) {
                    l
                } else {
                    r
                }
            }
        };
        if Some(pick) == l {
            left = pick;
        } else {
            right = pick + 1;
        }
        found.push((pick, (sorted[pick].0 - target).abs()));
    }
    found
}

fn covariate_balance(
    table: &UnitTable,
    pairs: &[MatchedPair],
    covariates: &[String],
) -> Result<Vec<CovariateBalance>, AnalysisError> {
    let (treated, control) = table.arm_indices();
    let matched_treated: Vec<usize> = pairs.iter().map(|p| p.treated_row).collect();
    let matched_control: Vec<usize> = pairs.iter().map(|p| p.control_row).collect();

    covariates
        .iter()
        .map(|name| {
            let column = table.column(name)?;
            let pick = |rows: &[usize]| rows.iter().map(|&i| column[i]).collect::<Vec<f64>>();
            let smd_before = standardized_mean_difference(&pick(&treated), &pick(&control));
            let smd_after =
                standardized_mean_difference(&pick(&matched_treated), &pick(&matched_control));
            Ok(CovariateBalance {
                covariate: name.clone(),
                smd_before,
                smd_after,
                well_balanced: smd_after.abs() < BALANCE_THRESHOLD,
            })
        })
        .collect()
}

/// SMD with sample variances; NaN when the pooled deviation vanishes
pub fn standardized_mean_difference(treated: &[f64], control: &[f64]) -> f64 {
    let pooled_sd = ((sample_variance(treated) + sample_variance(control)) / 2.0).sqrt();
    if !(pooled_sd > MIN_POOLED_SD) {
        return f64::NAN;
    }
    (mean(treated) - mean(control)) / pooled_sd
}
