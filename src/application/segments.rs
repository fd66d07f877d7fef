//! Presentation Segments
//!
//! Labels units for dashboard filtering: quantile buckets of a column
//! (age quintiles) or fixed right-inclusive bins (activity and engagement
//! levels). A segment may divide its column by another one, clipped below
//! at 1, to bin ratios such as `unique_actions / total_actions`.
//!
//! Segments are labels only. They never feed back into estimation.

use serde::{Deserialize, Serialize};

use crate::domain::{AnalysisError, UnitTable};
use crate::estimators::calibration::quantile_bins;

/// One labelling rule, deserialized from a `[[segments]]` config entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SegmentRule {
    /// Equal-frequency buckets; labels default to `Q1..Qn`
    Quantile {
        name: String,
        column: String,
        #[serde(default)]
        denominator: Option<String>,
        buckets: usize,
        #[serde(default)]
        labels: Option<Vec<String>>,
    },
    /// Fixed edges, each bin `(edges[i], edges[i + 1]]`
    Bins {
        name: String,
        column: String,
        #[serde(default)]
        denominator: Option<String>,
        edges: Vec<f64>,
        labels: Vec<String>,
    },
}

impl SegmentRule {
    pub fn name(&self) -> &str {
        match self {
            SegmentRule::Quantile { name, .. } | SegmentRule::Bins { name, .. } => name,
        }
    }

    fn source(&self) -> (&str, Option<&str>) {
        match self {
            SegmentRule::Quantile {
                column, denominator, ..
            }
            | SegmentRule::Bins {
                column, denominator, ..
            } => (column.as_str(), denominator.as_deref()),
        }
    }

    /// Columns the rule reads
    pub fn columns(&self) -> Vec<&str> {
        let (column, denominator) = self.source();
        std::iter::once(column).chain(denominator).collect()
    }

    pub fn validate(&self) -> Result<(), AnalysisError> {
        match self {
            SegmentRule::Quantile {
                name,
                buckets,
                labels,
                ..
            } => {
                if *buckets < 2 {
                    return Err(AnalysisError::InvalidParameter(format!(
                        "segment '{}' needs at least 2 buckets",
                        name
                    )));
                }
                if let Some(labels) = labels {
                    if labels.len() != *buckets {
                        return Err(AnalysisError::InvalidParameter(format!(
                            "segment '{}' has {} labels for {} buckets",
                            name,
                            labels.len(),
                            buckets
                        )));
                    }
                }
            }
            SegmentRule::Bins {
                name,
                edges,
                labels,
                ..
            } => {
                if edges.len() < 2 || labels.len() != edges.len() - 1 {
                    return Err(AnalysisError::InvalidParameter(format!(
                        "segment '{}' needs n + 1 edges for n labels, got {} edges and {} labels",
                        name,
                        edges.len(),
                        labels.len()
                    )));
                }
                if edges.iter().any(|e| e.is_nan()) || edges.windows(2).any(|w| w[1] <= w[0]) {
                    return Err(AnalysisError::InvalidParameter(format!(
                        "segment '{}' edges must be strictly increasing",
                        name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Label of every row of `table`; `None` where the value is missing or out of range
    pub fn apply(&self, table: &UnitTable) -> Result<Vec<Option<String>>, AnalysisError> {
        self.validate()?;
        let (column, denominator) = self.source();
        let mut values = table.column(column)?;
        if let Some(den) = denominator {
            for (v, d) in values.iter_mut().zip(table.column(den)?) {
                *v /= d.max(1.0);
            }
        }

        let labels: Vec<Option<String>> = match self {
            SegmentRule::Quantile {
                buckets, labels, ..
            } => {
                let names: Vec<String> = match labels {
                    Some(l) => l.clone(),
                    None => (1..=*buckets).map(|i| format!("Q{}", i)).collect(),
                };
                quantile_bins(&values, *buckets)
                    .into_iter()
                    .map(|b| b.map(|b| names[b - 1].clone()))
                    .collect()
            }
            SegmentRule::Bins { edges, labels, .. } => values
                .iter()
                .map(|&v| bin_index(edges, v).map(|i| labels[i].clone()))
                .collect(),
        };
        Ok(labels)
    }
}

/// Index of the right-inclusive bin holding `v`
fn bin_index(edges: &[f64], v: f64) -> Option<usize> {
    if !v.is_finite() && v != f64::INFINITY {
        return None;
    }
    let last = edges.len() - 1;
    if v <= edges[0] || v > edges[last] {
        return None;
    }
    Some(edges.partition_point(|&e| e < v) - 1)
}

/// Default dashboard segments over the simulated booking covariates
pub fn default_segments() -> Vec<SegmentRule> {
    let labels = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    vec![
        SegmentRule::Quantile {
            name: "age_quintile".to_string(),
            column: "age".to_string(),
            denominator: None,
            buckets: 5,
            labels: None,
        },
        SegmentRule::Bins {
            name: "activity_level".to_string(),
            column: "total_actions".to_string(),
            denominator: None,
            edges: vec![0.0, 50.0, 150.0, 300.0, f64::INFINITY],
            labels: labels(&["Low", "Medium", "High", "Very High"]),
        },
        SegmentRule::Bins {
            name: "engagement_level".to_string(),
            column: "unique_actions".to_string(),
            denominator: Some("total_actions".to_string()),
            edges: vec![0.0, 0.3, 0.7, 1.0],
            labels: labels(&["Low", "Medium", "High"]),
        },
    ]
}
