//! Analysis Pipeline
//!
//! Runs every stage over one immutable unit table:
//!
//! validate -> (CUPED || hypothesis test) -> propensity -> matching
//!          -> uplift -> reconcile
//!
//! CUPED and the hypothesis test only read the input table and run in
//! parallel. One propensity model is fitted and shared by the matcher and
//! the uplift estimator. Structural errors abort the run with the failing
//! stage attached. A degenerate CUPED fit leaves the outcome unadjusted and
//! a matching shortfall is recorded; in both cases the run continues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::application::reconcile::{global_stats, ReconcileInputs, ReconciledTable, Reconciler};
use crate::application::segments::SegmentRule;
use crate::domain::{AnalysisError, UnitTable};
use crate::estimators::cuped::{CupedAdjuster, CupedResult};
use crate::estimators::hypothesis::{HypothesisTester, MeanDifferenceResult, ProportionTestResult};
use crate::estimators::matching::{MatchOutcome, PropensityMatcher};
use crate::estimators::params::{AnalysisParams, ParamError};
use crate::estimators::propensity::{LogisticPropensity, LogisticPropensityFitter, PropensityDiagnostics};
use crate::estimators::uplift::{RankedUnit, UpliftResult, XLearner};
use crate::ports::{PropensityFit, PropensityProvider};

/// Units listed in the top / bottom uplift rankings by default
pub const DEFAULT_TOP_N: usize = 10;

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validation,
    Cuped,
    Hypothesis,
    Propensity,
    Matching,
    Uplift,
    Reconcile,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Validation => "validation",
            Stage::Cuped => "cuped",
            Stage::Hypothesis => "hypothesis",
            Stage::Propensity => "propensity",
            Stage::Matching => "matching",
            Stage::Uplift => "uplift",
            Stage::Reconcile => "reconcile",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: AnalysisError,
    },

    #[error("Invalid analysis parameters: {0}")]
    Params(#[from] ParamError),
}

impl PipelineError {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Stage { stage, .. } => Some(*stage),
            PipelineError::Params(_) => None,
        }
    }

    pub fn analysis_error(&self) -> Option<&AnalysisError> {
        match self {
            PipelineError::Stage { source, .. } => Some(source),
            PipelineError::Params(_) => None,
        }
    }
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, PipelineError>;
}

impl<T> AtStage<T> for Result<T, AnalysisError> {
    fn at(self, stage: Stage) -> Result<T, PipelineError> {
        self.map_err(|source| PipelineError::Stage { stage, source })
    }
}

/// Everything a run needs besides the data
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub params: AnalysisParams,
    pub segments: Vec<SegmentRule>,
    pub top_n: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            params: AnalysisParams::default(),
            segments: crate::application::segments::default_segments(),
            top_n: DEFAULT_TOP_N,
        }
    }
}

impl AnalysisConfig {
    pub fn with_params(mut self, params: AnalysisParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_segments(mut self, segments: Vec<SegmentRule>) -> Self {
        self.segments = segments;
        self
    }

    pub fn seed(&self) -> u64 {
        self.params.uplift.seed
    }
}

/// Matching stage result; a shortfall is a finding, not a failure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MatchingStatus {
    Matched(MatchOutcome),
    Insufficient {
        treated: usize,
        caliper: f64,
        reason: String,
    },
}

impl MatchingStatus {
    pub fn outcome(&self) -> Option<&MatchOutcome> {
        match self {
            MatchingStatus::Matched(outcome) => Some(outcome),
            MatchingStatus::Insufficient { .. } => None,
        }
    }
}

/// Everything one run produced
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub seed: u64,
    pub input_rows: usize,
    pub hypothesis: ProportionTestResult,
    /// Mean-difference test on the CUPED-adjusted outcome
    pub adjusted_test: MeanDifferenceResult,
    pub cuped: CupedResult,
    pub propensity_model: LogisticPropensity,
    pub propensity: PropensityDiagnostics,
    pub matching: MatchingStatus,
    pub uplift: UpliftResult,
    pub top_units: Vec<RankedUnit>,
    pub bottom_units: Vec<RankedUnit>,
    pub reconciled: ReconciledTable,
}

/// Run identifier: UTC start time plus seed
pub fn run_id(started_at: DateTime<Utc>, seed: u64) -> String {
    format!("{}_seed{}", started_at.format("%Y%m%dT%H%M%SZ"), seed)
}

pub struct AnalysisPipeline {
    config: AnalysisConfig,
    tester: HypothesisTester,
}

impl AnalysisPipeline {
    pub fn new(config: AnalysisConfig) -> Result<Self, PipelineError> {
        config.params.validate()?;
        for rule in &config.segments {
            rule.validate().at(Stage::Validation)?;
        }
        Ok(Self {
            config,
            tester: HypothesisTester::default(),
        })
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn run(&self, table: &UnitTable) -> Result<AnalysisReport, PipelineError> {
        self.run_at(table, Utc::now())
    }

    /// Run with an explicit start time (fixes the run id)
    pub fn run_at(
        &self,
        table: &UnitTable,
        started_at: DateTime<Utc>,
    ) -> Result<AnalysisReport, PipelineError> {
        let params = &self.config.params;
        let run_id = run_id(started_at, self.config.seed());
        tracing::info!("Starting analysis run {} on {} units", run_id, table.len());

        self.validate(table).at(Stage::Validation)?;

        let adjuster = CupedAdjuster::new(params.cuped.clone());
        let (cuped, hypothesis) =
            rayon::join(|| adjuster.fit_apply(table), || self.tester.test_table(table));
        let cuped = match cuped {
            Ok(result) => result,
            Err(err) if !err.is_structural() => {
                tracing::warn!("CUPED: {}; continuing with the unadjusted outcome", err);
                adjuster.unadjusted(table, err.to_string()).at(Stage::Cuped)?
            }
            Err(source) => {
                return Err(PipelineError::Stage {
                    stage: Stage::Cuped,
                    source,
                })
            }
        };
        let hypothesis = hypothesis.at(Stage::Hypothesis)?;

        let base = table.subset(&cuped.rows);
        let adjusted_test = self
            .tester
            .mean_difference(&cuped.adjusted, base.treatment())
            .at(Stage::Hypothesis)?;

        let propensity_model = LogisticPropensityFitter::new(params.propensity.clone())
            .fit(table)
            .at(Stage::Propensity)?;
        let base_scores = propensity_model.predict(&base).at(Stage::Propensity)?;
        let propensity = PropensityDiagnostics::from_scores(&base_scores);
        tracing::info!(
            "Propensity: mean {:.4}, range [{:.4}, {:.4}], randomization balance {:.3}",
            propensity.mean,
            propensity.min,
            propensity.max,
            propensity.randomization_balance
        );

        let matcher = PropensityMatcher::new(params.matching.clone());
        let matching = match matcher.match_scores(
            &base,
            &base_scores,
            Some(&cuped.adjusted),
            &params.propensity.covariates,
        ) {
            Ok(outcome) => MatchingStatus::Matched(outcome),
            Err(err @ AnalysisError::NoMatchesFound { treated, caliper }) => {
                tracing::warn!("Matching: {}", err);
                MatchingStatus::Insufficient {
                    treated,
                    caliper,
                    reason: err.to_string(),
                }
            }
            Err(source) => {
                return Err(PipelineError::Stage {
                    stage: Stage::Matching,
                    source,
                })
            }
        };

        let uplift = XLearner::new(params.uplift.clone())
            .fit_predict(table, &propensity_model)
            .at(Stage::Uplift)?;
        let top_units = uplift.top(table, self.config.top_n);
        let bottom_units = uplift.bottom(table, self.config.top_n);

        let globals = global_stats(&hypothesis, &cuped, &propensity, &uplift.calibration);
        let reconciled = Reconciler::new(self.config.segments.clone(), params.uplift.n_buckets)
            .reconcile(
                ReconcileInputs {
                    base: &base,
                    adjusted: &cuped.adjusted,
                    propensity: &base_scores,
                    scored: table,
                    uplift: &uplift,
                    hypothesis: &hypothesis,
                },
                globals,
            )
            .at(Stage::Reconcile)?;

        tracing::info!(
            "Run {} complete: effect {:.4} [{:.4}, {:.4}], {} reconciled rows",
            run_id,
            hypothesis.effect_size,
            hypothesis.ci_lower,
            hypothesis.ci_upper,
            reconciled.len()
        );

        Ok(AnalysisReport {
            run_id,
            started_at,
            seed: self.config.seed(),
            input_rows: table.len(),
            hypothesis,
            adjusted_test,
            cuped,
            propensity_model,
            propensity,
            matching,
            uplift,
            top_units,
            bottom_units,
            reconciled,
        })
    }

    fn validate(&self, table: &UnitTable) -> Result<(), AnalysisError> {
        if table.is_empty() {
            return Err(AnalysisError::DataValidation("input table has no rows".to_string()));
        }
        table.require_both_arms("input validation")?;

        let params = &self.config.params;
        for name in &params.cuped.covariates {
            table.column_index(name)?;
        }
        table.require_complete(&params.propensity.covariates)?;
        table.require_complete(&params.uplift.covariates)?;
        for rule in &self.config.segments {
            for column in rule.columns() {
                table.column_index(column)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{simulate_experiment, SimulationConfig};
    use crate::estimators::params::{ForestConfig, MatchingConfig};
    use chrono::TimeZone;

    fn fast_config() -> AnalysisConfig {
        let mut params = AnalysisParams::default();
        params.uplift.forest = ForestConfig::default().with_trees(10);
        AnalysisConfig::default().with_params(params)
    }

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_run_id_format() {
        assert_eq!(run_id(fixed_time(), 42), "20260301T120000Z_seed42");
    }

    #[test]
    fn test_full_run_produces_reconciled_table() {
        let table = simulate_experiment(&SimulationConfig::default().with_units(600)).unwrap();
        let pipeline = AnalysisPipeline::new(fast_config()).unwrap();
        let report = pipeline.run_at(&table, fixed_time()).unwrap();

        assert_eq!(report.run_id, "20260301T120000Z_seed42");
        assert_eq!(report.reconciled.len(), 600);
        assert_eq!(report.reconciled.unmatched_rows, 0);
        assert_eq!(report.top_units.len(), DEFAULT_TOP_N);
        assert!(report.matching.outcome().is_some());
        assert_eq!(report.reconciled.globals.effect_size, report.hypothesis.effect_size);
    }

    #[test]
    fn test_zero_caliper_records_insufficient_matching() {
        let table = simulate_experiment(&SimulationConfig::default().with_units(300)).unwrap();
        let mut config = fast_config();
        config.params.matching = MatchingConfig::default().with_caliper(0.0);
        let report = AnalysisPipeline::new(config)
            .unwrap()
            .run_at(&table, fixed_time())
            .unwrap();
        assert!(matches!(report.matching, MatchingStatus::Insufficient { .. }));
        assert_eq!(report.reconciled.len(), 300);
    }

    #[test]
    fn test_degenerate_cuped_falls_back_to_unadjusted_outcome() {
        let table = simulate_experiment(&SimulationConfig::default().with_units(300)).unwrap();
        let mut rows: Vec<Vec<f64>> = table.covariates().rows().map(|r| r.to_vec()).collect();
        for (i, row) in rows.iter_mut().enumerate() {
            row.push(1e200 * (i % 7) as f64);
        }
        let mut names = table.covariate_names().to_vec();
        names.push("huge".to_string());
        let table = UnitTable::new(
            table.ids().map(|ids| ids.to_vec()),
            table.treatment().to_vec(),
            table.outcome().to_vec(),
            names,
            crate::domain::FeatureMatrix::from_rows(&rows).unwrap(),
        )
        .unwrap();

        let mut config = fast_config();
        config.params.cuped.covariates = vec!["huge".to_string()];
        let report = AnalysisPipeline::new(config)
            .unwrap()
            .run_at(&table, fixed_time())
            .unwrap();

        assert!(report.cuped.degenerate.is_some());
        assert!(report.cuped.variance_reduction_pct.is_nan());
        assert!(report.reconciled.globals.variance_reduction_pct.is_nan());
        assert_eq!(report.cuped.adjusted, table.outcome_f64());
        // Unaffected statistics still computed
        assert_eq!(report.reconciled.len(), 300);
        assert!(report.hypothesis.z_stat.is_finite());
        assert!(report.matching.outcome().is_some());
    }

    #[test]
    fn test_single_arm_fails_validation() {
        let config = SimulationConfig {
            treatment_rate: 0.0,
            n_units: 100,
            ..Default::default()
        };
        let table = simulate_experiment(&config).unwrap();
        let err = AnalysisPipeline::new(fast_config())
            .unwrap()
            .run(&table)
            .unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Validation));
        assert!(matches!(err.analysis_error(), Some(AnalysisError::EmptyGroup { .. })));
    }

    #[test]
    fn test_invalid_params_rejected_up_front() {
        let mut config = fast_config();
        config.params.cuped.estimation_fraction = 1.5;
        assert!(matches!(
            AnalysisPipeline::new(config),
            Err(PipelineError::Params(_))
        ));
    }

    #[test]
    fn test_unknown_segment_column_fails_validation() {
        let table = simulate_experiment(&SimulationConfig::default().with_units(100)).unwrap();
        let config = fast_config().with_segments(vec![SegmentRule::Quantile {
            name: "region".into(),
            column: "region_code".into(),
            denominator: None,
            buckets: 4,
            labels: None,
        }]);
        let err = AnalysisPipeline::new(config).unwrap().run(&table).unwrap_err();
        assert!(matches!(
            err.analysis_error(),
            Some(AnalysisError::MissingColumn(name)) if name == "region_code"
        ));
    }
}
