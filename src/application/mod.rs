//! Application Layer - Analysis use cases
//!
//! Orchestrates the estimators into one run and assembles the reconciled
//! output table.

pub mod pipeline;
pub mod reconcile;
pub mod segments;

pub use pipeline::{
    run_id, AnalysisConfig, AnalysisPipeline, AnalysisReport, MatchingStatus, PipelineError, Stage,
};
pub use reconcile::{ReconciledRow, ReconciledTable, Reconciler};
pub use segments::{default_segments, SegmentRule};
