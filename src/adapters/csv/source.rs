//! CSV Table Source
//!
//! Reads a header-mapped CSV into an immutable `UnitTable`. Empty cells and
//! `NA`/`NaN` markers become missing covariate values; treatment and outcome
//! must be 0/1 on every row.

use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;

use super::CsvSchema;
use crate::domain::{AnalysisError, FeatureMatrix, UnitTable};
use crate::ports::{LoadError, TableSource};

/// Loads unit tables from CSV files
#[derive(Debug, Clone, Default)]
pub struct CsvTableSource {
    schema: CsvSchema,
}

impl CsvTableSource {
    pub fn new(schema: CsvSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &CsvSchema {
        &self.schema
    }

    fn read(&self, path: &Path) -> Result<UnitTable, LoadError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(csv_error)?;

        let headers: Vec<String> = reader
            .headers()
            .map_err(csv_error)?
            .iter()
            .map(str::to_string)
            .collect();
        let position = |name: &str| headers.iter().position(|h| h == name);

        let treatment_col = position(&self.schema.treatment_column)
            .ok_or_else(|| LoadError::MissingColumn(self.schema.treatment_column.clone()))?;
        let outcome_col = position(&self.schema.outcome_column)
            .ok_or_else(|| LoadError::MissingColumn(self.schema.outcome_column.clone()))?;
        let id_col = match &self.schema.id_column {
            Some(name) => {
                let col = position(name);
                if col.is_none() {
                    tracing::warn!(
                        "Id column '{}' not in {}; rows will be joined by value",
                        name,
                        path.display()
                    );
                }
                col
            }
            None => None,
        };

        let covariate_names: Vec<String> = match &self.schema.covariates {
            Some(names) => names.clone(),
            None => headers
                .iter()
                .filter(|h| !self.schema.is_reserved(h))
                .cloned()
                .collect(),
        };
        let covariate_cols = covariate_names
            .iter()
            .map(|name| position(name).ok_or_else(|| LoadError::MissingColumn(name.clone())))
            .collect::<Result<Vec<_>, _>>()?;

        let mut ids = Vec::new();
        let mut treatment = Vec::new();
        let mut outcome = Vec::new();
        let mut values = Vec::new();

        for (i, record) in reader.records().enumerate() {
            let record = record.map_err(csv_error)?;
            // 1-based data row, header excluded
            let row = i + 1;
            let cell = |col: usize| record.get(col).unwrap_or("");

            if let Some(col) = id_col {
                ids.push(cell(col).to_string());
            }
            treatment.push(parse_indicator(&self.schema.treatment_column, row, cell(treatment_col))?);
            outcome.push(parse_indicator(&self.schema.outcome_column, row, cell(outcome_col))?);
            for (name, &col) in covariate_names.iter().zip(&covariate_cols) {
                values.push(parse_value(name, row, cell(col))?);
            }
        }

        let n_rows = treatment.len();
        let covariates = FeatureMatrix::new(n_rows, covariate_names.len(), values)?;
        let ids = id_col.map(|_| ids);
        Ok(UnitTable::new(ids, treatment, outcome, covariate_names, covariates)?)
    }
}

impl TableSource for CsvTableSource {
    fn load(&self, path: &Path, as_of: DateTime<Utc>) -> Result<Arc<UnitTable>, LoadError> {
        if let Ok(modified) = std::fs::metadata(path).and_then(|m| m.modified()) {
            let modified: DateTime<Utc> = modified.into();
            if modified > as_of {
                tracing::warn!(
                    "{} was modified at {} after the requested snapshot {}",
                    path.display(),
                    modified,
                    as_of
                );
            }
        }

        let table = self.read(path)?;
        tracing::info!(
            "Loaded {} units with {} covariates from {}",
            table.len(),
            table.covariate_names().len(),
            path.display()
        );
        Ok(Arc::new(table))
    }
}

fn csv_error(err: csv::Error) -> LoadError {
    if err.is_io_error() {
        if let csv::ErrorKind::Io(io) = err.into_kind() {
            return LoadError::Io(io);
        }
        return LoadError::Format("I/O error".to_string());
    }
    LoadError::Format(err.to_string())
}

fn is_missing(cell: &str) -> bool {
    cell.is_empty() || matches!(cell, "NA" | "NaN" | "nan" | "null")
}

fn parse_value(column: &str, row: usize, cell: &str) -> Result<f64, LoadError> {
    if is_missing(cell) {
        return Ok(f64::NAN);
    }
    cell.parse::<f64>().map_err(|_| LoadError::Parse {
        row,
        column: column.to_string(),
        value: cell.to_string(),
    })
}

fn parse_indicator(column: &str, row: usize, cell: &str) -> Result<u8, LoadError> {
    let value = match cell.to_ascii_lowercase().as_str() {
        "1" | "1.0" | "true" => Some(1),
        "0" | "0.0" | "false" => Some(0),
        _ => None,
    };
    value.ok_or_else(|| {
        LoadError::Invalid(AnalysisError::NonBinary {
            column: column.to_string(),
            // 0-based like every other row index
            row: row - 1,
            value: if cell.is_empty() {
                "<missing>".to_string()
            } else {
                cell.to_string()
            },
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn csv_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_basic_table() {
        let file = csv_file(
            "user_id,treatment,booked,age,total_actions\n\
             u1,1,0,34,120\n\
             u2,0,1,51,\n\
             u3,1,1,22,NA\n",
        );
        let table = CsvTableSource::default().load(file.path(), Utc::now()).unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(table.treatment(), &[1, 0, 1]);
        assert_eq!(table.outcome(), &[0, 1, 1]);
        assert_eq!(table.id(1), Some("u2"));
        assert_eq!(table.covariate_names(), &["age".to_string(), "total_actions".to_string()]);
        let actions = table.column("total_actions").unwrap();
        assert_eq!(actions[0], 120.0);
        assert!(actions[1].is_nan());
        assert!(actions[2].is_nan());
    }

    #[test]
    fn test_selected_covariates_only() {
        let file = csv_file("treatment,booked,age,region\n1,0,30,north\n0,0,40,south\n");
        let source = CsvTableSource::new(
            CsvSchema::default().with_covariates(vec!["age".to_string()]),
        );
        let table = source.load(file.path(), Utc::now()).unwrap();
        assert_eq!(table.covariate_names(), &["age".to_string()]);
        assert!(table.ids().is_none());
    }

    #[test]
    fn test_missing_treatment_column() {
        let file = csv_file("group,booked,age\n1,0,30\n");
        let err = CsvTableSource::default().load(file.path(), Utc::now()).unwrap_err();
        assert!(matches!(err, LoadError::MissingColumn(name) if name == "treatment"));
    }

    #[test]
    fn test_non_binary_outcome_rejected() {
        let file = csv_file("treatment,booked,age\n1,0,30\n0,2,40\n");
        let err = CsvTableSource::default().load(file.path(), Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            LoadError::Invalid(AnalysisError::NonBinary { ref column, row: 1, .. }) if column == "booked"
        ));
    }

    #[test]
    fn test_unparseable_covariate() {
        let file = csv_file("treatment,booked,age\n1,0,thirty\n");
        let err = CsvTableSource::default().load(file.path(), Utc::now()).unwrap_err();
        assert!(matches!(err, LoadError::Parse { row: 1, .. }));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = CsvTableSource::default()
            .load(Path::new("/nonexistent/experiment.csv"), Utc::now())
            .unwrap_err();
        assert!(matches!(err, LoadError::Io(_)));
    }
}
