//! Unit Table
//!
//! One row per experimental unit: a binary treatment indicator, a binary
//! outcome indicator, named pre-treatment covariates and an optional id.
//! Tables are immutable once built; stages derive subsets and new columns
//! but never rewrite treatment or outcome.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::AnalysisError;
use super::matrix::FeatureMatrix;

/// Experimental arm of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arm {
    Treated,
    Control,
}

impl Arm {
    pub fn from_indicator(treatment: u8) -> Self {
        if treatment == 1 {
            Arm::Treated
        } else {
            Arm::Control
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Arm::Treated => "treated",
            Arm::Control => "control",
        }
    }
}

impl fmt::Display for Arm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Immutable experiment snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitTable {
    ids: Option<Vec<String>>,
    treatment: Vec<u8>,
    outcome: Vec<u8>,
    covariate_names: Vec<String>,
    covariates: FeatureMatrix,
}

impl UnitTable {
    /// Build a table, checking shapes and that treatment/outcome are binary
    pub fn new(
        ids: Option<Vec<String>>,
        treatment: Vec<u8>,
        outcome: Vec<u8>,
        covariate_names: Vec<String>,
        covariates: FeatureMatrix,
    ) -> Result<Self, AnalysisError> {
        let n = treatment.len();
        if outcome.len() != n || covariates.n_rows() != n {
            return Err(AnalysisError::DataValidation(format!(
                "column lengths differ: treatment={}, outcome={}, covariates={}",
                n,
                outcome.len(),
                covariates.n_rows()
            )));
        }
        if let Some(ids) = &ids {
            if ids.len() != n {
                return Err(AnalysisError::DataValidation(format!(
                    "id column has {} rows, expected {}",
                    ids.len(),
                    n
                )));
            }
        }
        if covariate_names.len() != covariates.n_cols() {
            return Err(AnalysisError::DataValidation(format!(
                "{} covariate names for {} covariate columns",
                covariate_names.len(),
                covariates.n_cols()
            )));
        }
        for (i, name) in covariate_names.iter().enumerate() {
            if covariate_names[..i].contains(name) {
                return Err(AnalysisError::DataValidation(format!(
                    "duplicate covariate column '{}'",
                    name
                )));
            }
        }
        check_binary("treatment", &treatment)?;
        check_binary("outcome", &outcome)?;

        Ok(Self {
            ids,
            treatment,
            outcome,
            covariate_names,
            covariates,
        })
    }

    pub fn len(&self) -> usize {
        self.treatment.len()
    }

    pub fn is_empty(&self) -> bool {
        self.treatment.is_empty()
    }

    pub fn ids(&self) -> Option<&[String]> {
        self.ids.as_deref()
    }

    pub fn id(&self, row: usize) -> Option<&str> {
        self.ids.as_ref().map(|ids| ids[row].as_str())
    }

    pub fn treatment(&self) -> &[u8] {
        &self.treatment
    }

    pub fn outcome(&self) -> &[u8] {
        &self.outcome
    }

    pub fn outcome_f64(&self) -> Vec<f64> {
        self.outcome.iter().map(|&y| y as f64).collect()
    }

    pub fn arm(&self, row: usize) -> Arm {
        Arm::from_indicator(self.treatment[row])
    }

    pub fn covariate_names(&self) -> &[String] {
        &self.covariate_names
    }

    pub fn covariates(&self) -> &FeatureMatrix {
        &self.covariates
    }

    pub fn column_index(&self, name: &str) -> Result<usize, AnalysisError> {
        self.covariate_names
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| AnalysisError::MissingColumn(name.to_string()))
    }

    pub fn column(&self, name: &str) -> Result<Vec<f64>, AnalysisError> {
        let idx = self.column_index(name)?;
        Ok(self.covariates.column(idx))
    }

    /// Matrix of the named covariates, in the order given
    pub fn features(&self, names: &[String]) -> Result<FeatureMatrix, AnalysisError> {
        let cols = names
            .iter()
            .map(|n| self.column_index(n))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.covariates.select_columns(&cols))
    }

    /// New table holding the given rows in the given order
    pub fn subset(&self, rows: &[usize]) -> UnitTable {
        UnitTable {
            ids: self
                .ids
                .as_ref()
                .map(|ids| rows.iter().map(|&r| ids[r].clone()).collect()),
            treatment: rows.iter().map(|&r| self.treatment[r]).collect(),
            outcome: rows.iter().map(|&r| self.outcome[r]).collect(),
            covariate_names: self.covariate_names.clone(),
            covariates: self.covariates.select_rows(rows),
        }
    }

    /// Row indices of the treated and control arms
    pub fn arm_indices(&self) -> (Vec<usize>, Vec<usize>) {
        let mut treated = Vec::new();
        let mut control = Vec::new();
        for (i, &t) in self.treatment.iter().enumerate() {
            if t == 1 {
                treated.push(i);
            } else {
                control.push(i);
            }
        }
        (treated, control)
    }

    pub fn arm_counts(&self) -> (usize, usize) {
        let treated = self.treatment.iter().filter(|&&t| t == 1).count();
        (treated, self.len() - treated)
    }

    /// Fail with `EmptyGroup` unless both arms have at least one unit
    pub fn require_both_arms(&self, context: &str) -> Result<(), AnalysisError> {
        let (n_t, n_c) = self.arm_counts();
        if n_t == 0 {
            return Err(AnalysisError::empty_group(Arm::Treated, context));
        }
        if n_c == 0 {
            return Err(AnalysisError::empty_group(Arm::Control, context));
        }
        Ok(())
    }

    /// Rows whose named covariates are all finite
    pub fn complete_rows(&self, names: &[String]) -> Result<Vec<usize>, AnalysisError> {
        let cols = names
            .iter()
            .map(|n| self.column_index(n))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((0..self.len())
            .filter(|&i| {
                let row = self.covariates.row(i);
                cols.iter().all(|&c| row[c].is_finite())
            })
            .collect())
    }

    /// Fail with `MissingValues` if any named covariate has a non-finite value
    pub fn require_complete(&self, names: &[String]) -> Result<(), AnalysisError> {
        for name in names {
            let idx = self.column_index(name)?;
            let count = (0..self.len())
                .filter(|&i| !self.covariates.get(i, idx).is_finite())
                .count();
            if count > 0 {
                return Err(AnalysisError::MissingValues {
                    column: name.clone(),
                    count,
                });
            }
        }
        Ok(())
    }
}

fn check_binary(column: &str, values: &[u8]) -> Result<(), AnalysisError> {
    match values.iter().position(|&v| v > 1) {
        Some(row) => Err(AnalysisError::NonBinary {
            column: column.to_string(),
            row,
            value: values[row].to_string(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> UnitTable {
        let covariates = FeatureMatrix::from_rows(&[
            vec![25.0, 10.0],
            vec![40.0, f64::NAN],
            vec![33.0, 7.0],
            vec![51.0, 3.0],
        ])
        .unwrap();
        UnitTable::new(
            Some(vec!["a".into(), "b".into(), "c".into(), "d".into()]),
            vec![1, 0, 1, 0],
            vec![1, 0, 0, 1],
            vec!["age".into(), "total_actions".into()],
            covariates,
        )
        .unwrap()
    }

    #[test]
    fn test_arm_indices_and_counts() {
        let table = sample_table();
        let (t, c) = table.arm_indices();
        assert_eq!(t, vec![0, 2]);
        assert_eq!(c, vec![1, 3]);
        assert_eq!(table.arm_counts(), (2, 2));
        assert!(table.require_both_arms("test").is_ok());
    }

    #[test]
    fn test_non_binary_treatment_rejected() {
        let covariates = FeatureMatrix::from_rows(&[vec![1.0], vec![2.0]]).unwrap();
        let result = UnitTable::new(None, vec![0, 2], vec![0, 1], vec!["x".into()], covariates);
        assert!(matches!(
            result,
            Err(AnalysisError::NonBinary { ref column, row: 1, .. }) if column == "treatment"
        ));
    }

    #[test]
    fn test_duplicate_covariates_rejected() {
        let covariates = FeatureMatrix::from_rows(&[vec![1.0, 2.0]]).unwrap();
        let result = UnitTable::new(None, vec![0], vec![0], vec!["x".into(), "x".into()], covariates);
        assert!(matches!(result, Err(AnalysisError::DataValidation(_))));
    }

    #[test]
    fn test_missing_column() {
        let table = sample_table();
        assert!(matches!(
            table.column("income"),
            Err(AnalysisError::MissingColumn(ref c)) if c == "income"
        ));
    }

    #[test]
    fn test_complete_rows_and_missing_values() {
        let table = sample_table();
        let rows = table.complete_rows(&["total_actions".to_string()]).unwrap();
        assert_eq!(rows, vec![0, 2, 3]);
        assert!(matches!(
            table.require_complete(&["total_actions".to_string()]),
            Err(AnalysisError::MissingValues { count: 1, .. })
        ));
        assert!(table.require_complete(&["age".to_string()]).is_ok());
    }

    #[test]
    fn test_subset_keeps_ids_and_order() {
        let table = sample_table();
        let sub = table.subset(&[3, 0]);
        assert_eq!(sub.len(), 2);
        assert_eq!(sub.id(0), Some("d"));
        assert_eq!(sub.treatment(), &[0, 1]);
        assert_eq!(sub.column("age").unwrap(), vec![51.0, 25.0]);
    }

    #[test]
    fn test_empty_treated_arm() {
        let covariates = FeatureMatrix::from_rows(&[vec![1.0], vec![2.0]]).unwrap();
        let table = UnitTable::new(None, vec![0, 0], vec![0, 1], vec!["x".into()], covariates).unwrap();
        assert!(matches!(
            table.require_both_arms("matching"),
            Err(AnalysisError::EmptyGroup { arm: Arm::Treated, .. })
        ));
    }
}
