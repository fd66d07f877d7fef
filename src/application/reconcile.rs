//! Analytics Reconciler
//!
//! Joins every stage output back onto the analysis population:
//!
//! - Base rows are the units CUPED kept; every base row appears exactly once.
//! - Uplift scores are left-joined by unit id, or by the shared covariate
//!   values plus treatment and outcome when either table has no ids.
//!   Repeated keys pair up in order of occurrence.
//! - A base row without an uplift match keeps NaN scores and is counted.
//! - Global statistics are attached once and broadcast on export.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::application::segments::SegmentRule;
use crate::domain::stats::{quantile_sorted, sorted_finite};
use crate::domain::{AnalysisError, GlobalStats, UnitTable};
use crate::estimators::calibration::{quantile_bins, CalibrationReport, CalibrationStatus};
use crate::estimators::cuped::CupedResult;
use crate::estimators::hypothesis::ProportionTestResult;
use crate::estimators::propensity::PropensityDiagnostics;
use crate::estimators::uplift::UpliftResult;

/// Quantile of the uplift score above which a unit is flagged
const HIGH_UPLIFT_QUANTILE: f64 = 0.75;

/// Stage outputs consumed by the reconciler
#[derive(Debug, Clone, Copy)]
pub struct ReconcileInputs<'a> {
    /// Rows kept by CUPED
    pub base: &'a UnitTable,
    /// Adjusted outcome aligned with `base`
    pub adjusted: &'a [f64],
    /// Propensity score aligned with `base`
    pub propensity: &'a [f64],
    /// Table the uplift model scored
    pub scored: &'a UnitTable,
    /// Scores aligned with `scored`
    pub uplift: &'a UpliftResult,
    pub hypothesis: &'a ProportionTestResult,
}

/// One reconciled unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledRow {
    pub id: Option<String>,
    pub treatment: u8,
    pub outcome: u8,
    pub covariates: Vec<f64>,
    pub adjusted_outcome: f64,
    pub propensity_score: f64,
    pub uplift_score: f64,
    pub uplift_score_clipped: f64,
    pub uplift_decile: Option<usize>,
    pub high_uplift: Option<bool>,
    /// Wald interval of the unit's arm booking rate
    pub booking_rate_ci_lower: f64,
    pub booking_rate_ci_upper: f64,
    /// One label per segment rule
    pub segments: Vec<Option<String>>,
}

/// The reconciled unit table plus broadcast metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciledTable {
    pub covariate_names: Vec<String>,
    pub segment_names: Vec<String>,
    pub rows: Vec<ReconciledRow>,
    pub globals: GlobalStats,
    /// `calibrated` or `insufficient_data`
    pub calibration_status: String,
    /// Base rows with no uplift match
    pub unmatched_rows: usize,
    /// Scored rows that matched no base row
    pub orphan_rows: usize,
}

impl ReconciledTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Build the broadcast statistics from stage results
pub fn global_stats(
    hypothesis: &ProportionTestResult,
    cuped: &CupedResult,
    propensity: &PropensityDiagnostics,
    calibration: &CalibrationReport,
) -> GlobalStats {
    GlobalStats {
        treatment_rate: hypothesis.treated.rate,
        control_rate: hypothesis.control.rate,
        effect_size: hypothesis.effect_size,
        z_stat: hypothesis.z_stat,
        p_value: hypothesis.p_value,
        ci_lower: hypothesis.ci_lower,
        ci_upper: hypothesis.ci_upper,
        cohens_h: hypothesis.cohens_h,
        stderr: hypothesis.unpooled_se,
        original_variance: cuped.original_variance,
        cuped_variance: cuped.adjusted_variance,
        variance_reduction_pct: cuped.variance_reduction_pct,
        propensity_mean: propensity.mean,
        randomization_balance: propensity.randomization_balance,
        uplift_model_performance: calibration.performance(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum JoinKey {
    Id(String),
    Values { bits: Vec<u64>, treatment: u8, outcome: u8 },
}

fn canonical_bits(v: f64) -> u64 {
    if v.is_nan() {
        f64::NAN.to_bits()
    } else if v == 0.0 {
        0.0f64.to_bits()
    } else {
        v.to_bits()
    }
}

/// Builds `ReconciledTable`s
#[derive(Debug, Clone)]
pub struct Reconciler {
    segments: Vec<SegmentRule>,
    n_buckets: usize,
}

impl Reconciler {
    pub fn new(segments: Vec<SegmentRule>, n_buckets: usize) -> Self {
        Self { segments, n_buckets }
    }

    pub fn reconcile(
        &self,
        inputs: ReconcileInputs<'_>,
        globals: GlobalStats,
    ) -> Result<ReconciledTable, AnalysisError> {
        let base = inputs.base;
        let n = base.len();
        for (what, len) in [
            ("adjusted outcomes", inputs.adjusted.len()),
            ("propensity scores", inputs.propensity.len()),
        ] {
            if len != n {
                return Err(AnalysisError::DataValidation(format!(
                    "reconcile: {} {} for {} base rows",
                    len, what, n
                )));
            }
        }
        if inputs.uplift.raw.len() != inputs.scored.len() {
            return Err(AnalysisError::DataValidation(format!(
                "reconcile: {} uplift scores for {} scored rows",
                inputs.uplift.raw.len(),
                inputs.scored.len()
            )));
        }

        let matches = self.join(base, inputs.scored)?;
        let unmatched_rows = matches.iter().filter(|m| m.is_none()).count();
        let orphan_rows = inputs.scored.len() - (n - unmatched_rows);
        if unmatched_rows > 0 {
            tracing::warn!(
                "Reconcile: {} of {} base rows have no uplift score",
                unmatched_rows,
                n
            );
        }
        if orphan_rows > 0 {
            tracing::debug!("Reconcile: {} scored rows not in the base table", orphan_rows);
        }

        let raw: Vec<f64> = matches
            .iter()
            .map(|m| m.map_or(f64::NAN, |j| inputs.uplift.raw[j]))
            .collect();
        let clipped: Vec<f64> = matches
            .iter()
            .map(|m| m.map_or(f64::NAN, |j| inputs.uplift.clipped[j]))
            .collect();

        let deciles = quantile_bins(&raw, self.n_buckets);
        let finite = sorted_finite(&raw);
        let high_cut = quantile_sorted(&finite, HIGH_UPLIFT_QUANTILE);

        let segment_labels = self
            .segments
            .iter()
            .map(|rule| rule.apply(base))
            .collect::<Result<Vec<_>, _>>()?;

        let rows = (0..n)
            .map(|i| {
                let arm = inputs.hypothesis.arm_rate(base.arm(i));
                ReconciledRow {
                    id: base.id(i).map(str::to_string),
                    treatment: base.treatment()[i],
                    outcome: base.outcome()[i],
                    covariates: base.covariates().row(i).to_vec(),
                    adjusted_outcome: inputs.adjusted[i],
                    propensity_score: inputs.propensity[i],
                    uplift_score: raw[i],
                    uplift_score_clipped: clipped[i],
                    uplift_decile: deciles[i],
                    high_uplift: raw[i].is_finite().then(|| raw[i] > high_cut),
                    booking_rate_ci_lower: arm.ci_lower,
                    booking_rate_ci_upper: arm.ci_upper,
                    segments: segment_labels.iter().map(|labels| labels[i].clone()).collect(),
                }
            })
            .collect();

        let calibration_status = match inputs.uplift.calibration.status {
            CalibrationStatus::Calibrated { .. } => "calibrated",
            CalibrationStatus::InsufficientData { .. } => "insufficient_data",
        };

        tracing::info!(
            "Reconcile: {} rows, {} segments, {} unmatched",
            n,
            self.segments.len(),
            unmatched_rows
        );

        Ok(ReconciledTable {
            covariate_names: base.covariate_names().to_vec(),
            segment_names: self.segments.iter().map(|s| s.name().to_string()).collect(),
            rows,
            globals,
            calibration_status: calibration_status.to_string(),
            unmatched_rows,
            orphan_rows,
        })
    }

    /// For every base row, the scored row it joins to
    fn join(&self, base: &UnitTable, scored: &UnitTable) -> Result<Vec<Option<usize>>, AnalysisError> {
        let by_id = base.ids().is_some() && scored.ids().is_some();
        let shared: Vec<(usize, usize)> = if by_id {
            Vec::new()
        } else {
            base.covariate_names()
                .iter()
                .enumerate()
                .filter_map(|(i, name)| scored.column_index(name).ok().map(|j| (i, j)))
                .collect()
        };
        if !by_id && shared.is_empty() {
            return Err(AnalysisError::DataValidation(
                "reconcile: tables share neither ids nor covariates".to_string(),
            ));
        }

        let key = |table: &UnitTable, row: usize, side: usize| -> JoinKey {
            match table.id(row) {
                Some(id) if by_id => JoinKey::Id(id.to_string()),
                _ => JoinKey::Values {
                    bits: shared
                        .iter()
                        .map(|cols| {
                            let col = if side == 0 { cols.0 } else { cols.1 };
                            canonical_bits(table.covariates().get(row, col))
                        })
                        .collect(),
                    treatment: table.treatment()[row],
                    outcome: table.outcome()[row],
                },
            }
        };

        let mut pending: HashMap<JoinKey, VecDeque<usize>> = HashMap::new();
        for j in 0..scored.len() {
            pending.entry(key(scored, j, 1)).or_default().push_back(j);
        }
        Ok((0..base.len())
            .map(|i| pending.get_mut(&key(base, i, 0)).and_then(|q| q.pop_front()))
            .collect())
    }
}
