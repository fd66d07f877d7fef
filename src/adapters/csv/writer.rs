//! Run Output Writer
//!
//! Every run is written to `<output_dir>/<run_id>/`. Files are staged in
//! `<output_dir>/<run_id>.tmp/` and the directory is renamed only after the
//! last file is flushed, so readers never see a partial run.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::{format_float, CsvSchema};
use crate::application::pipeline::{AnalysisReport, MatchingStatus};
use crate::domain::{GlobalStats, UnitTable};
use crate::estimators::hypothesis::{MeanDifferenceResult, ProportionTestResult};
use crate::estimators::propensity::PropensityDiagnostics;
use crate::estimators::uplift::{RankedUnit, UpliftValidation};

/// Reconciled per-unit table consumed by the dashboard
pub const DASHBOARD_FILE: &str = "final_dashboard_data.csv";
const MATCHED_FILE: &str = "matched_users.csv";
const BALANCE_FILE: &str = "balance.csv";
const CALIBRATION_FILE: &str = "calibration.csv";
const SUMMARY_FILE: &str = "summary.json";
const PROPENSITY_MODEL_FILE: &str = "propensity_model.json";

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Run output already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("Inconsistent report: {0}")]
    Inconsistent(String),
}

/// Writes the artifacts of one run
#[derive(Debug, Clone)]
pub struct RunWriter {
    output_dir: PathBuf,
    schema: CsvSchema,
}

impl RunWriter {
    pub fn new(output_dir: impl Into<PathBuf>, schema: CsvSchema) -> Self {
        Self {
            output_dir: output_dir.into(),
            schema,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Final directory of a run
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.output_dir.join(run_id)
    }

    /// Write every artifact and publish the run directory
    pub fn write(&self, report: &AnalysisReport) -> Result<PathBuf, WriteError> {
        let final_dir = self.run_dir(&report.run_id);
        if final_dir.exists() {
            return Err(WriteError::AlreadyExists(final_dir));
        }
        let staging = self.output_dir.join(format!("{}.tmp", report.run_id));
        if staging.exists() {
            tracing::warn!("Removing stale staging directory {}", staging.display());
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        if let Err(err) = self.write_all(&staging, report) {
            discard_staging(&staging);
            return Err(err);
        }

        publish(&staging, &final_dir)?;
        tracing::info!("Run {} written to {}", report.run_id, final_dir.display());
        Ok(final_dir)
    }

    fn write_all(&self, dir: &Path, report: &AnalysisReport) -> Result<(), WriteError> {
        self.write_dashboard(&dir.join(DASHBOARD_FILE), report)?;
        self.write_matched(&dir.join(MATCHED_FILE), report)?;
        write_balance(&dir.join(BALANCE_FILE), &report.matching)?;

        let mut wtr = csv::Writer::from_path(dir.join(CALIBRATION_FILE))?;
        for bucket in &report.uplift.calibration.buckets {
            wtr.serialize(bucket)?;
        }
        wtr.flush()?;

        let summary = RunSummary::from_report(report);
        fs::write(dir.join(SUMMARY_FILE), serde_json::to_string_pretty(&summary)?)?;
        fs::write(
            dir.join(PROPENSITY_MODEL_FILE),
            serde_json::to_string_pretty(&report.propensity_model)?,
        )?;
        Ok(())
    }

    fn write_dashboard(&self, path: &Path, report: &AnalysisReport) -> Result<(), WriteError> {
        let table = &report.reconciled;
        let globals = table.globals.columns();
        let has_ids = table.rows.iter().any(|r| r.id.is_some());
        let id_column = self.id_column();

        let mut header: Vec<String> = Vec::new();
        if has_ids {
            header.push(id_column.to_string());
        }
        header.push(self.schema.treatment_column.clone());
        header.push(self.schema.outcome_column.clone());
        header.extend(table.covariate_names.iter().cloned());
        header.extend(
            [
                "adjusted_outcome",
                "propensity_score",
                "uplift_score",
                "uplift_score_clipped",
                "uplift_decile",
                "high_uplift",
                "booking_rate_ci_lower",
                "booking_rate_ci_upper",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        header.extend(table.segment_names.iter().cloned());
        header.extend(globals.iter().map(|(name, _)| format!("global_{}", name)));
        header.push("uplift_calibration_status".to_string());

        // Broadcast columns are identical on every row
        let global_cells: Vec<String> = globals.iter().map(|(_, v)| format_float(*v)).collect();

        let mut wtr = csv::Writer::from_path(path)?;
        wtr.write_record(&header)?;
        for row in &table.rows {
            let mut record: Vec<String> = Vec::with_capacity(header.len());
            if has_ids {
                record.push(row.id.clone().unwrap_or_default());
            }
            record.push(row.treatment.to_string());
            record.push(row.outcome.to_string());
            record.extend(row.covariates.iter().map(|v| format_float(*v)));
            record.push(format_float(row.adjusted_outcome));
            record.push(format_float(row.propensity_score));
            record.push(format_float(row.uplift_score));
            record.push(format_float(row.uplift_score_clipped));
            record.push(row.uplift_decile.map(|d| d.to_string()).unwrap_or_default());
            record.push(row.high_uplift.map(|h| h.to_string()).unwrap_or_default());
            record.push(format_float(row.booking_rate_ci_lower));
            record.push(format_float(row.booking_rate_ci_upper));
            record.extend(row.segments.iter().map(|s| s.clone().unwrap_or_default()));
            record.extend(global_cells.iter().cloned());
            record.push(table.calibration_status.clone());
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
        Ok(())
    }

    fn write_matched(&self, path: &Path, report: &AnalysisReport) -> Result<(), WriteError> {
        let table = &report.reconciled;
        let has_ids = table.rows.iter().any(|r| r.id.is_some());

        let mut header: Vec<String> = vec!["pair_id".to_string()];
        header.push(if has_ids { self.id_column() } else { "row" }.to_string());
        header.push("group".to_string());
        header.push(self.schema.treatment_column.clone());
        header.push(self.schema.outcome_column.clone());
        header.extend(table.covariate_names.iter().cloned());
        header.push("propensity_score".to_string());
        header.push("adjusted_outcome".to_string());

        let mut wtr = csv::Writer::from_path(path)?;
        wtr.write_record(&header)?;
        if let Some(outcome) = report.matching.outcome() {
            for unit in &outcome.units {
                // Matched rows index the CUPED base, which the reconciled rows follow
                let row = table.rows.get(unit.row).ok_or_else(|| {
                    WriteError::Inconsistent(format!(
                        "matched row {} outside the {} reconciled rows",
                        unit.row,
                        table.rows.len()
                    ))
                })?;
                let mut record: Vec<String> = Vec::with_capacity(header.len());
                record.push(unit.pair.to_string());
                record.push(match &row.id {
                    Some(id) if has_ids => id.clone(),
                    _ => unit.row.to_string(),
                });
                record.push(unit.group.label().to_string());
                record.push(row.treatment.to_string());
                record.push(row.outcome.to_string());
                record.extend(row.covariates.iter().map(|v| format_float(*v)));
                record.push(format_float(unit.propensity));
                record.push(format_float(unit.outcome));
                wtr.write_record(&record)?;
            }
        }
        wtr.flush()?;
        Ok(())
    }

    fn id_column(&self) -> &str {
        self.schema.id_column.as_deref().unwrap_or("row")
    }
}

/// Rename the staging directory into place, discarding it on failure
fn publish(staging: &Path, final_dir: &Path) -> Result<(), WriteError> {
    if let Err(err) = fs::rename(staging, final_dir) {
        discard_staging(staging);
        return Err(err.into());
    }
    Ok(())
}

fn discard_staging(staging: &Path) {
    if let Err(cleanup) = fs::remove_dir_all(staging) {
        tracing::warn!("Could not remove {}: {}", staging.display(), cleanup);
    }
}

fn write_balance(path: &Path, matching: &MatchingStatus) -> Result<(), WriteError> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(["covariate", "smd_before", "smd_after", "well_balanced"])?;
    if let Some(outcome) = matching.outcome() {
        for b in &outcome.balance {
            wtr.write_record(&[
                b.covariate.clone(),
                format_float(b.smd_before),
                format_float(b.smd_after),
                b.well_balanced.to_string(),
            ])?;
        }
    }
    wtr.flush()?;
    Ok(())
}

/// Write a unit table in the layout `CsvTableSource` reads back
pub fn write_table(path: &Path, table: &UnitTable, schema: &CsvSchema) -> Result<(), WriteError> {
    let id_column = match (&schema.id_column, table.ids()) {
        (Some(name), Some(_)) => Some(name.as_str()),
        _ => None,
    };

    let mut wtr = csv::Writer::from_path(path)?;
    let mut header: Vec<&str> = Vec::new();
    header.extend(id_column);
    header.push(&schema.treatment_column);
    header.push(&schema.outcome_column);
    header.extend(table.covariate_names().iter().map(String::as_str));
    wtr.write_record(&header)?;

    for (row, values) in table.covariates().rows().enumerate() {
        let mut record: Vec<String> = Vec::with_capacity(header.len());
        if id_column.is_some() {
            record.push(table.id(row).unwrap_or_default().to_string());
        }
        record.push(table.treatment()[row].to_string());
        record.push(table.outcome()[row].to_string());
        record.extend(values.iter().map(|v| format_float(*v)));
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    tracing::info!("Wrote {} units to {}", table.len(), path.display());
    Ok(())
}

#[derive(Debug, Serialize)]
struct CupedSummary {
    covariates: Vec<String>,
    theta: Vec<f64>,
    excluded: Vec<String>,
    analyzed_rows: usize,
    dropped_rows: usize,
    estimation_rows: usize,
    lift: f64,
    original_variance: f64,
    adjusted_variance: f64,
    variance_reduction_pct: f64,
    degenerate: Option<String>,
}

#[derive(Debug, Serialize)]
struct MatchingSummary {
    status: &'static str,
    n_matched: usize,
    match_rate: f64,
    unique_controls: usize,
    ate: f64,
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct RunSummary<'a> {
    run_id: &'a str,
    started_at: String,
    seed: u64,
    input_rows: usize,
    hypothesis: &'a ProportionTestResult,
    evidence_strength: String,
    adjusted_test: &'a MeanDifferenceResult,
    cuped: CupedSummary,
    propensity: &'a PropensityDiagnostics,
    matching: MatchingSummary,
    uplift_validation: &'a UpliftValidation,
    calibration_status: &'a str,
    top_units: &'a [RankedUnit],
    bottom_units: &'a [RankedUnit],
    unmatched_rows: usize,
    orphan_rows: usize,
    globals: &'a GlobalStats,
}

impl<'a> RunSummary<'a> {
    fn from_report(report: &'a AnalysisReport) -> Self {
        let cuped = &report.cuped;
        let matching = match &report.matching {
            MatchingStatus::Matched(outcome) => MatchingSummary {
                status: "matched",
                n_matched: outcome.n_matched(),
                match_rate: outcome.match_rate(),
                unique_controls: outcome.unique_controls(),
                ate: outcome.ate,
                reason: None,
            },
            MatchingStatus::Insufficient { reason, .. } => MatchingSummary {
                status: "insufficient",
                n_matched: 0,
                match_rate: 0.0,
                unique_controls: 0,
                ate: f64::NAN,
                reason: Some(reason.clone()),
            },
        };

        Self {
            run_id: &report.run_id,
            started_at: report.started_at.to_rfc3339(),
            seed: report.seed,
            input_rows: report.input_rows,
            hypothesis: &report.hypothesis,
            evidence_strength: format!("{:?}", report.hypothesis.evidence_strength()),
            adjusted_test: &report.adjusted_test,
            cuped: CupedSummary {
                covariates: cuped.model.covariates.clone(),
                theta: cuped.model.theta.clone(),
                excluded: cuped.model.excluded.clone(),
                analyzed_rows: cuped.rows.len(),
                dropped_rows: cuped.dropped_rows,
                estimation_rows: cuped.estimation_rows,
                lift: cuped.lift,
                original_variance: cuped.original_variance,
                adjusted_variance: cuped.adjusted_variance,
                variance_reduction_pct: cuped.variance_reduction_pct,
                degenerate: cuped.degenerate.clone(),
            },
            propensity: &report.propensity,
            matching,
            uplift_validation: &report.uplift.validation,
            calibration_status: &report.reconciled.calibration_status,
            top_units: &report.top_units,
            bottom_units: &report.bottom_units,
            unmatched_rows: report.reconciled.unmatched_rows,
            orphan_rows: report.reconciled.orphan_rows,
            globals: &report.reconciled.globals,
        }
    }
}
