//! Analysis Errors
//!
//! Error taxonomy shared by every estimator. Structural errors (bad input
//! shape, empty arms, invalid parameters) abort a pipeline run. Matching
//! insufficiency is a legitimate experimental finding and is reported as a
//! diagnostic instead.

use thiserror::Error;

use super::table::Arm;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("Data validation failed: {0}")]
    DataValidation(String),

    #[error("Required column '{0}' is missing")]
    MissingColumn(String),

    #[error("Column '{column}' has {count} missing values")]
    MissingValues { column: String, count: usize },

    #[error("Column '{column}' must be binary (0/1), found {value} at row {row}")]
    NonBinary { column: String, row: usize, value: String },

    #[error("{context}: the {arm} group has no units")]
    EmptyGroup { arm: Arm, context: String },

    #[error("Numerical degeneracy: {0}")]
    NumericalDegeneracy(String),

    #[error("No treated unit matched a control within caliper {caliper} ({treated} treated units tried)")]
    NoMatchesFound { treated: usize, caliper: f64 },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl AnalysisError {
    /// Structural errors abort the pipeline; diagnostic ones are recorded
    pub fn is_structural(&self) -> bool {
        !matches!(
            self,
            AnalysisError::NoMatchesFound { .. } | AnalysisError::NumericalDegeneracy(_)
        )
    }

    pub(crate) fn empty_group(arm: Arm, context: impl Into<String>) -> Self {
        AnalysisError::EmptyGroup {
            arm,
            context: context.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_classification() {
        assert!(AnalysisError::MissingColumn("age".into()).is_structural());
        assert!(AnalysisError::empty_group(Arm::Treated, "hypothesis test").is_structural());
        assert!(!AnalysisError::NoMatchesFound { treated: 10, caliper: 0.0 }.is_structural());
        assert!(!AnalysisError::NumericalDegeneracy("singular".into()).is_structural());
    }

    #[test]
    fn test_error_messages_name_context() {
        let err = AnalysisError::empty_group(Arm::Control, "propensity fit");
        assert_eq!(err.to_string(), "propensity fit: the control group has no units");

        let err = AnalysisError::NonBinary {
            column: "treatment".into(),
            row: 3,
            value: "2".into(),
        };
        assert!(err.to_string().contains("row 3"));
    }
}
