//! Uplift Calibration
//!
//! Checks whether predicted uplift ranks units the way the observed data
//! does. Units are bucketed by predicted score quantile; within each bucket
//! the observed uplift is `treated rate - control rate`. The Spearman rank
//! correlation between mean predicted and observed uplift across buckets
//! becomes a performance score in [0, 1]:
//!
//! performance = clamp(0.5 + 0.5 * spearman, 0, 1)
//!
//! Buckets missing either arm are skipped. With fewer than three usable
//! buckets the result is reported as insufficient data instead of scored.

use serde::{Deserialize, Serialize};

use crate::domain::stats::{mean, quantile_sorted, sorted_finite};
use crate::domain::AnalysisError;

/// Minimum usable buckets for a rank correlation
pub const MIN_CALIBRATION_BUCKETS: usize = 3;

/// Observed and predicted uplift in one score bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBucket {
    /// 1-based, lowest predicted uplift first
    pub bucket: usize,
    pub n: usize,
    pub n_treated: usize,
    pub n_control: usize,
    pub mean_predicted: f64,
    pub treated_rate: f64,
    pub control_rate: f64,
    /// NaN when either arm is missing
    pub observed_uplift: f64,
}

impl CalibrationBucket {
    pub fn is_usable(&self) -> bool {
        self.n_treated > 0 && self.n_control > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CalibrationStatus {
    Calibrated {
        spearman: f64,
        performance: f64,
        /// Observed uplift never decreases across usable buckets
        monotonic: bool,
    },
    InsufficientData {
        usable_buckets: usize,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub buckets: Vec<CalibrationBucket>,
    pub status: CalibrationStatus,
}

impl CalibrationReport {
    /// Performance score, NaN with insufficient data
    pub fn performance(&self) -> f64 {
        match self.status {
            CalibrationStatus::Calibrated { performance, .. } => performance,
            CalibrationStatus::InsufficientData { .. } => f64::NAN,
        }
    }

    pub fn is_calibrated(&self) -> bool {
        matches!(self.status, CalibrationStatus::Calibrated { .. })
    }
}

/// Quantile bucket (1-based) of every value; `None` for non-finite values.
///
/// Edges are the linear-interpolated quantiles at `i / n_buckets`. Repeated
/// edges collapse, so heavily tied data yields fewer buckets. A value equal
/// to an edge falls in the lower bucket, the minimum falls in bucket 1.
pub fn quantile_bins(values: &[f64], n_buckets: usize) -> Vec<Option<usize>> {
    let sorted = sorted_finite(values);
    if sorted.is_empty() || n_buckets == 0 {
        return vec![None; values.len()];
    }
    let mut edges: Vec<f64> = (0..=n_buckets)
        .map(|i| quantile_sorted(&sorted, i as f64 / n_buckets as f64))
        .collect();
    edges.dedup();
    let upper = &edges[1..];

    values
        .iter()
        .map(|&v| {
            if !v.is_finite() {
                return None;
            }
            if upper.is_empty() {
                return Some(1);
            }
            let pos = upper.partition_point(|&e| e < v);
            Some(pos.min(upper.len() - 1) + 1)
        })
        .collect()
}

/// Bucket units by predicted uplift and compare with observed uplift
pub fn decile_calibration(
    scores: &[f64],
    treatment: &[u8],
    outcome: &[u8],
    n_buckets: usize,
) -> Result<CalibrationReport, AnalysisError> {
    if scores.len() != treatment.len() || scores.len() != outcome.len() {
        return Err(AnalysisError::DataValidation(format!(
            "calibration inputs differ in length: {} scores, {} treatment, {} outcome",
            scores.len(),
            treatment.len(),
            outcome.len()
        )));
    }
    if n_buckets < 2 {
        return Err(AnalysisError::InvalidParameter(format!(
            "calibration needs at least 2 buckets, got {}",
            n_buckets
        )));
    }

    let bins = quantile_bins(scores, n_buckets);
    let n_found = bins.iter().flatten().copied().max().unwrap_or(0);

    let buckets: Vec<CalibrationBucket> = (1..=n_found)
        .map(|b| {
            let members: Vec<usize> = bins
                .iter()
                .enumerate()
                .filter(|(_, bin)| **bin == Some(b))
                .map(|(i, _)| i)
                .collect();
            let predicted: Vec<f64> = members.iter().map(|&i| scores[i]).collect();
            let (treated, control): (Vec<usize>, Vec<usize>) =
                members.iter().partition(|&&i| treatment[i] == 1);
            let rate = |rows: &[usize]| {
                if rows.is_empty() {
                    f64::NAN
                } else {
                    rows.iter().map(|&i| outcome[i] as f64).sum::<f64>() / rows.len() as f64
                }
            };
            let treated_rate = rate(&treated);
            let control_rate = rate(&control);
            CalibrationBucket {
                bucket: b,
                n: members.len(),
                n_treated: treated.len(),
                n_control: control.len(),
                mean_predicted: mean(&predicted),
                treated_rate,
                control_rate,
                observed_uplift: treated_rate - control_rate,
            }
        })
        .collect();

    let usable: Vec<&CalibrationBucket> = buckets.iter().filter(|b| b.is_usable()).collect();
    let skipped = buckets.len() - usable.len();
    if skipped > 0 {
        tracing::warn!("Calibration: skipped {} buckets missing an arm", skipped);
    }

    let status = if usable.len() < MIN_CALIBRATION_BUCKETS {
        CalibrationStatus::InsufficientData {
            usable_buckets: usable.len(),
            reason: format!(
                "{} usable buckets, need at least {}",
                usable.len(),
                MIN_CALIBRATION_BUCKETS
            ),
        }
    } else {
        let predicted: Vec<f64> = usable.iter().map(|b| b.mean_predicted).collect();
        let observed: Vec<f64> = usable.iter().map(|b| b.observed_uplift).collect();
        let rho = spearman(&predicted, &observed);
        if rho.is_nan() {
            CalibrationStatus::InsufficientData {
                usable_buckets: usable.len(),
                reason: "rank correlation undefined (constant predictions or outcomes)".to_string(),
            }
        } else {
            CalibrationStatus::Calibrated {
                spearman: rho,
                performance: (0.5 + 0.5 * rho).clamp(0.0, 1.0),
                monotonic: observed.windows(2).all(|w| w[1] >= w[0]),
            }
        }
    };

    match &status {
        CalibrationStatus::Calibrated {
            spearman,
            performance,
            ..
        } => tracing::info!(
            "Calibration: spearman {:.3}, performance {:.3} over {} buckets",
            spearman,
            performance,
            usable.len()
        ),
        CalibrationStatus::InsufficientData { reason, .. } => {
            tracing::warn!("Calibration: insufficient data ({})", reason)
        }
    }

    Ok(CalibrationReport { buckets, status })
}

/// Ranks with ties sharing their average rank (1-based)
fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = rank;
        }
        i = j + 1;
    }
    ranks
}

/// Spearman rank correlation; NaN when either side is constant
pub fn spearman(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.len() < 2 {
        return f64::NAN;
    }
    let ra = average_ranks(a);
    let rb = average_ranks(b);
    let ma = mean(&ra);
    let mb = mean(&rb);
    let cov: f64 = ra.iter().zip(&rb).map(|(x, y)| (x - ma) * (y - mb)).sum();
    let va: f64 = ra.iter().map(|x| (x - ma).powi(2)).sum();
    let vb: f64 = rb.iter().map(|y| (y - mb).powi(2)).sum();
    if va == 0.0 || vb == 0.0 {
        return f64::NAN;
    }
    cov / (va * vb).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_quantile_bins_are_balanced() {
        let values: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let bins = quantile_bins(&values, 10);
        for b in 1..=10 {
            assert_eq!(bins.iter().filter(|&&x| x == Some(b)).count(), 10);
        }
        assert_eq!(bins[0], Some(1));
        assert_eq!(bins[99], Some(10));
    }

    #[test]
    fn test_tied_values_collapse_buckets() {
        let mut values = vec![0.0; 80];
        values.extend((0..20).map(|i| 1.0 + i as f64));
        let bins = quantile_bins(&values, 10);
        // Every zero shares the lowest bucket
        assert!(bins[..80].iter().all(|&b| b == Some(1)));
        assert!(bins.iter().flatten().max().copied().unwrap() < 10);
    }

    #[test]
    fn test_nan_gets_no_bucket() {
        let bins = quantile_bins(&[1.0, f64::NAN, 2.0], 2);
        assert_eq!(bins[1], None);
        assert_eq!(bins[0], Some(1));
        assert_eq!(bins[2], Some(2));
    }

    #[test]
    fn test_spearman_with_ties() {
        assert_relative_eq!(spearman(&[1.0, 2.0, 3.0], &[10.0, 20.0, 30.0]), 1.0);
        assert_relative_eq!(spearman(&[1.0, 2.0, 3.0], &[3.0, 2.0, 1.0]), -1.0);
        assert_eq!(average_ranks(&[5.0, 1.0, 5.0]), vec![2.5, 1.0, 2.5]);
        assert!(spearman(&[1.0, 1.0], &[1.0, 2.0]).is_nan());
    }

    /// Scores rise with the row index; only treated units book, more often at higher rows
    fn ordered_population(n: usize) -> (Vec<f64>, Vec<u8>, Vec<u8>) {
        let scores: Vec<f64> = (0..n).map(|i| i as f64 / n as f64).collect();
        let treatment: Vec<u8> = (0..n).map(|i| (i % 2) as u8).collect();
        let outcome: Vec<u8> = (0..n)
            .map(|i| u8::from(treatment[i] == 1 && (i * 7) % n < i))
            .collect();
        (scores, treatment, outcome)
    }

    #[test]
    fn test_informative_scores_are_calibrated() {
        let (scores, treatment, outcome) = ordered_population(1000);
        let report = decile_calibration(&scores, &treatment, &outcome, 10).unwrap();
        assert_eq!(report.buckets.len(), 10);
        match report.status {
            CalibrationStatus::Calibrated { spearman, performance, .. } => {
                assert!(spearman > 0.8, "spearman {}", spearman);
                assert_relative_eq!(performance, 0.5 + 0.5 * spearman);
            }
            other => panic!("expected calibrated, got {:?}", other),
        }
    }

    #[test]
    fn test_single_arm_buckets_are_skipped() {
        // Treated units only in the lower half of scores
        let scores: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let treatment: Vec<u8> = (0..100).map(|i| u8::from(i < 50 && i % 2 == 0)).collect();
        let outcome = vec![0u8; 100];
        let report = decile_calibration(&scores, &treatment, &outcome, 10).unwrap();
        assert_eq!(report.buckets.iter().filter(|b| b.is_usable()).count(), 5);
        assert!(report.buckets[9].observed_uplift.is_nan());
    }

    #[test]
    fn test_too_few_usable_buckets_is_insufficient() {
        let scores: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let treatment: Vec<u8> = (0..100).map(|i| u8::from(i < 20 && i % 2 == 0)).collect();
        let outcome: Vec<u8> = (0..100).map(|i| (i % 3 == 0) as u8).collect();
        let report = decile_calibration(&scores, &treatment, &outcome, 10).unwrap();
        assert!(!report.is_calibrated());
        assert!(report.performance().is_nan());
        assert!(matches!(
            report.status,
            CalibrationStatus::InsufficientData { usable_buckets: 2, .. }
        ));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        assert!(decile_calibration(&[0.1, 0.2], &[1], &[0, 1], 10).is_err());
    }
}
