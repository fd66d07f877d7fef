//! CSV Adapter
//!
//! File-backed implementations around the analysis core:
//! - `CsvTableSource`: loads a unit table from a header-mapped CSV file
//! - `RunWriter`: writes every artifact of a run into a versioned directory
//! - `write_table`: dumps a unit table (used by `causify simulate`)
//!
//! Column roles are described once by `CsvSchema` so that a table written by
//! `write_table` loads back unchanged.

mod source;
mod writer;

pub use source::CsvTableSource;
pub use writer::{write_table, RunWriter, WriteError, DASHBOARD_FILE};

use serde::{Deserialize, Serialize};

pub const DEFAULT_TREATMENT_COLUMN: &str = "treatment";
pub const DEFAULT_OUTCOME_COLUMN: &str = "booked";
pub const DEFAULT_ID_COLUMN: &str = "user_id";

/// Which CSV columns hold the treatment, outcome and unit id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsvSchema {
    pub treatment_column: String,
    pub outcome_column: String,
    /// Absent or missing from the header: rows are joined by value
    pub id_column: Option<String>,
    /// Covariates to load; `None` loads every remaining column
    pub covariates: Option<Vec<String>>,
}

impl Default for CsvSchema {
    fn default() -> Self {
        Self {
            treatment_column: DEFAULT_TREATMENT_COLUMN.to_string(),
            outcome_column: DEFAULT_OUTCOME_COLUMN.to_string(),
            id_column: Some(DEFAULT_ID_COLUMN.to_string()),
            covariates: None,
        }
    }
}

impl CsvSchema {
    pub fn with_covariates(mut self, covariates: Vec<String>) -> Self {
        self.covariates = Some(covariates);
        self
    }

    pub fn without_id(mut self) -> Self {
        self.id_column = None;
        self
    }

    fn is_reserved(&self, name: &str) -> bool {
        name == self.treatment_column
            || name == self.outcome_column
            || self.id_column.as_deref() == Some(name)
    }
}

/// Empty cell for NaN, plain decimal otherwise
pub(crate) fn format_float(value: f64) -> String {
    if value.is_nan() {
        String::new()
    } else {
        value.to_string()
    }
}
