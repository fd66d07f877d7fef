//! Table Source Port
//!
//! Explicit data-loading boundary: `load(path, as_of)` returns the immutable
//! snapshot of a unit table. `as_of` identifies the snapshot version, so a
//! memoization layer can key on `(path, as_of)` instead of holding
//! process-wide state.

use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::domain::{AnalysisError, UnitTable};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Failed to read table: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed table: {0}")]
    Format(String),

    #[error("Required column '{0}' not found in header")]
    MissingColumn(String),

    #[error("Row {row}, column '{column}': cannot parse '{value}'")]
    Parse {
        row: usize,
        column: String,
        value: String,
    },

    #[error(transparent)]
    Invalid(#[from] AnalysisError),
}

/// Loads unit tables by path and snapshot time
pub trait TableSource: Send + Sync {
    fn load(&self, path: &Path, as_of: DateTime<Utc>) -> Result<Arc<UnitTable>, LoadError>;
}
