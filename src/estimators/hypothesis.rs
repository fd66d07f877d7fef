//! Two-Proportion Hypothesis Test
//!
//! Compares treated and control outcome rates.
//!
//! - Test statistic uses the pooled standard error:
//!   z = (p_t - p_c) / sqrt(p̄(1 - p̄)(1/n_t + 1/n_c))
//! - Confidence interval uses the unpooled standard error:
//!   (p_t - p_c) ± z_crit * sqrt(p_t(1 - p_t)/n_t + p_c(1 - p_c)/n_c)
//!
//! The two standard errors answer different questions and are kept apart.
//! Significance is decided by the interval alone: a result is significant
//! iff the interval excludes zero.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::domain::stats::{mean, sample_variance};
use crate::domain::{AnalysisError, Arm, UnitTable};

pub const DEFAULT_CONFIDENCE_LEVEL: f64 = 0.95;

/// |z| above which evidence is reported as high
const HIGH_EVIDENCE_Z: f64 = 2.8;
/// |z| above which evidence is reported as moderate
const MODERATE_EVIDENCE_Z: f64 = 1.96;

/// Interval-based verdict used by downstream consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Significance {
    /// Interval excludes zero
    Significant,
    /// Interval contains zero
    Inconclusive,
    /// Interval could not be computed
    Undefined,
}

impl Significance {
    fn from_interval(lower: f64, upper: f64) -> Self {
        if lower.is_nan() || upper.is_nan() {
            Significance::Undefined
        } else if lower > 0.0 || upper < 0.0 {
            Significance::Significant
        } else {
            Significance::Inconclusive
        }
    }
}

/// Rough strength of evidence from |z|
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceStrength {
    High,
    Moderate,
    Low,
    Undefined,
}

/// Outcome rate of one arm with its Wald interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmRate {
    pub arm: Arm,
    pub n: usize,
    pub successes: usize,
    pub rate: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
}

/// Result of the two-proportion test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProportionTestResult {
    pub treated: ArmRate,
    pub control: ArmRate,
    /// p_t - p_c
    pub effect_size: f64,
    pub pooled_rate: f64,
    pub pooled_se: f64,
    pub unpooled_se: f64,
    pub z_stat: f64,
    pub p_value: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub confidence_level: f64,
    pub cohens_h: f64,
    pub significance: Significance,
}

impl ProportionTestResult {
    pub fn is_significant(&self) -> bool {
        self.significance == Significance::Significant
    }

    pub fn evidence_strength(&self) -> EvidenceStrength {
        let z = self.z_stat.abs();
        if z.is_nan() {
            EvidenceStrength::Undefined
        } else if z > HIGH_EVIDENCE_Z {
            EvidenceStrength::High
        } else if z > MODERATE_EVIDENCE_Z {
            EvidenceStrength::Moderate
        } else {
            EvidenceStrength::Low
        }
    }

    /// Rate of the arm a unit belongs to
    pub fn arm_rate(&self, arm: Arm) -> &ArmRate {
        match arm {
            Arm::Treated => &self.treated,
            Arm::Control => &self.control,
        }
    }
}

/// Normal-approximation comparison of a continuous outcome (e.g. CUPED-adjusted)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeanDifferenceResult {
    pub treated_mean: f64,
    pub control_mean: f64,
    pub difference: f64,
    pub stderr: f64,
    pub z_stat: f64,
    pub p_value: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub significance: Significance,
}

/// Hypothesis tester at a fixed confidence level
#[derive(Debug, Clone)]
pub struct HypothesisTester {
    confidence_level: f64,
    critical_z: f64,
    normal: Normal,
}

impl Default for HypothesisTester {
    fn default() -> Self {
        Self::at_level(DEFAULT_CONFIDENCE_LEVEL)
    }
}

impl HypothesisTester {
    pub fn new(confidence_level: f64) -> Result<Self, AnalysisError> {
        if !(confidence_level > 0.0 && confidence_level < 1.0) {
            return Err(AnalysisError::InvalidParameter(format!(
                "confidence level must be in (0, 1), got {}",
                confidence_level
            )));
        }
        Ok(Self::at_level(confidence_level))
    }

    fn at_level(confidence_level: f64) -> Self {
        let normal = Normal::standard();
        let critical_z = normal.inverse_cdf(1.0 - (1.0 - confidence_level) / 2.0);
        Self {
            confidence_level,
            critical_z,
            normal,
        }
    }

    pub fn confidence_level(&self) -> f64 {
        self.confidence_level
    }

    pub fn critical_z(&self) -> f64 {
        self.critical_z
    }

    pub fn test_table(&self, table: &UnitTable) -> Result<ProportionTestResult, AnalysisError> {
        self.two_proportion(table.treatment(), table.outcome())
    }

    /// Two-proportion z-test with an unpooled interval and Cohen's h
    pub fn two_proportion(
        &self,
        treatment: &[u8],
        outcome: &[u8],
    ) -> Result<ProportionTestResult, AnalysisError> {
        if treatment.len() != outcome.len() {
            return Err(AnalysisError::DataValidation(format!(
                "treatment has {} rows, outcome has {}",
                treatment.len(),
                outcome.len()
            )));
        }

        let (mut n_t, mut s_t, mut n_c, mut s_c) = (0usize, 0usize, 0usize, 0usize);
        for (&t, &y) in treatment.iter().zip(outcome) {
            if t == 1 {
                n_t += 1;
                s_t += y as usize;
            } else {
                n_c += 1;
                s_c += y as usize;
            }
        }
        if n_t == 0 {
            return Err(AnalysisError::empty_group(Arm::Treated, "hypothesis test"));
        }
        if n_c == 0 {
            return Err(AnalysisError::empty_group(Arm::Control, "hypothesis test"));
        }

        let treated = self.arm_rate(Arm::Treated, n_t, s_t);
        let control = self.arm_rate(Arm::Control, n_c, s_c);
        let (p_t, p_c) = (treated.rate, control.rate);
        let (nt, nc) = (n_t as f64, n_c as f64);
        let diff = p_t - p_c;

        let pooled_rate = (s_t + s_c) as f64 / (nt + nc);
        let pooled_se = (pooled_rate * (1.0 - pooled_rate) * (1.0 / nt + 1.0 / nc)).sqrt();
        let (z_stat, p_value) = if pooled_se > 0.0 {
            let z = diff / pooled_se;
            (z, 2.0 * self.normal.sf(z.abs()))
        } else {
            tracing::warn!(
                "Hypothesis test: pooled variance is zero (pooled rate {}), z-statistic undefined",
                pooled_rate
            );
            (f64::NAN, f64::NAN)
        };

        let unpooled_se = (p_t * (1.0 - p_t) / nt + p_c * (1.0 - p_c) / nc).sqrt();
        let ci_lower = diff - self.critical_z * unpooled_se;
        let ci_upper = diff + self.critical_z * unpooled_se;

        let cohens_h = 2.0 * (p_t.sqrt().asin() - p_c.sqrt().asin());
        let significance = Significance::from_interval(ci_lower, ci_upper);

        tracing::info!(
            "Hypothesis test: treated {:.4} (n={}), control {:.4} (n={}), diff {:.4}, z={:.3}, p={:.3e}, CI [{:.4}, {:.4}], {:?}",
            p_t, n_t, p_c, n_c, diff, z_stat, p_value, ci_lower, ci_upper, significance
        );

        Ok(ProportionTestResult {
            treated,
            control,
            effect_size: diff,
            pooled_rate,
            pooled_se,
            unpooled_se,
            z_stat,
            p_value,
            ci_lower,
            ci_upper,
            confidence_level: self.confidence_level,
            cohens_h,
            significance,
        })
    }

    /// Difference in means of a continuous outcome with an unpooled standard error
    pub fn mean_difference(
        &self,
        values: &[f64],
        treatment: &[u8],
    ) -> Result<MeanDifferenceResult, AnalysisError> {
        if values.len() != treatment.len() {
            return Err(AnalysisError::DataValidation(format!(
                "values have {} rows, treatment has {}",
                values.len(),
                treatment.len()
            )));
        }
        let (treated, control): (Vec<(f64, u8)>, Vec<(f64, u8)>) = values
            .iter()
            .copied()
            .zip(treatment.iter().copied())
            .partition(|&(_, t)| t == 1);
        let treated: Vec<f64> = treated.into_iter().map(|(v, _)| v).collect();
        let control: Vec<f64> = control.into_iter().map(|(v, _)| v).collect();
        if treated.is_empty() {
            return Err(AnalysisError::empty_group(Arm::Treated, "mean difference test"));
        }
        if control.is_empty() {
            return Err(AnalysisError::empty_group(Arm::Control, "mean difference test"));
        }

        let treated_mean = mean(&treated);
        let control_mean = mean(&control);
        let difference = treated_mean - control_mean;
        // Sample variance is NaN for a single-unit arm and propagates
        let stderr = (sample_variance(&treated) / treated.len() as f64
            + sample_variance(&control) / control.len() as f64)
            .sqrt();
        let (z_stat, p_value) = if stderr > 0.0 {
            let z = difference / stderr;
            (z, 2.0 * self.normal.sf(z.abs()))
        } else {
            tracing::warn!("Mean difference test: standard error is zero or undefined");
            (f64::NAN, f64::NAN)
        };
        let ci_lower = difference - self.critical_z * stderr;
        let ci_upper = difference + self.critical_z * stderr;

        Ok(MeanDifferenceResult {
            treated_mean,
            control_mean,
            difference,
            stderr,
            z_stat,
            p_value,
            ci_lower,
            ci_upper,
            significance: Significance::from_interval(ci_lower, ci_upper),
        })
    }

    fn arm_rate(&self, arm: Arm, n: usize, successes: usize) -> ArmRate {
        let rate = successes as f64 / n as f64;
        let se = (rate * (1.0 - rate) / n as f64).sqrt();
        ArmRate {
            arm,
            n,
            successes,
            rate,
            ci_lower: rate - self.critical_z * se,
            ci_upper: rate + self.critical_z * se,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// `n_t` treated with `s_t` successes followed by `n_c` controls with `s_c`
    fn arms(n_t: usize, s_t: usize, n_c: usize, s_c: usize) -> (Vec<u8>, Vec<u8>) {
        let mut treatment = vec![1u8; n_t];
        treatment.extend(vec![0u8; n_c]);
        let mut outcome: Vec<u8> = (0..n_t).map(|i| u8::from(i < s_t)).collect();
        outcome.extend((0..n_c).map(|i| u8::from(i < s_c)));
        (treatment, outcome)
    }

    #[test]
    fn test_critical_value_for_95_percent() {
        let tester = HypothesisTester::default();
        assert_relative_eq!(tester.critical_z(), 1.959964, epsilon = 1e-5);
    }

    #[test]
    fn test_equal_rates_are_inconclusive() {
        let (t, y) = arms(500, 100, 500, 100);
        let result = HypothesisTester::default().two_proportion(&t, &y).unwrap();

        assert_relative_eq!(result.effect_size, 0.0);
        assert!(result.ci_lower <= 0.0 && result.ci_upper >= 0.0);
        assert_eq!(result.significance, Significance::Inconclusive);
        assert_relative_eq!(result.p_value, 1.0, epsilon = 1e-12);
        assert_eq!(result.evidence_strength(), EvidenceStrength::Low);
    }

    #[test]
    fn test_known_difference() {
        // 25% vs 15% on 1000 units per arm
        let (t, y) = arms(1000, 250, 1000, 150);
        let result = HypothesisTester::default().two_proportion(&t, &y).unwrap();

        assert_relative_eq!(result.effect_size, 0.10, epsilon = 1e-12);
        let pooled = 0.2;
        let pooled_se = (pooled * (1.0 - pooled) * (2.0 / 1000.0f64)).sqrt();
        assert_relative_eq!(result.pooled_se, pooled_se, epsilon = 1e-12);
        assert_relative_eq!(result.z_stat, 0.10 / pooled_se, epsilon = 1e-9);

        let unpooled = (0.25 * 0.75 / 1000.0 + 0.15 * 0.85 / 1000.0f64).sqrt();
        assert_relative_eq!(result.unpooled_se, unpooled, epsilon = 1e-12);
        assert_relative_eq!(result.ci_lower, 0.10 - result.ci_upper + 0.10, epsilon = 1e-12);
        assert!(result.ci_lower > 0.0);
        assert!(result.is_significant());
        assert_eq!(result.evidence_strength(), EvidenceStrength::High);

        let h = 2.0 * (0.25f64.sqrt().asin() - 0.15f64.sqrt().asin());
        assert_relative_eq!(result.cohens_h, h, epsilon = 1e-12);
    }

    #[test]
    fn test_pooled_and_unpooled_errors_differ() {
        let (t, y) = arms(200, 120, 800, 80);
        let result = HypothesisTester::default().two_proportion(&t, &y).unwrap();
        assert!((result.pooled_se - result.unpooled_se).abs() > 1e-4);
    }

    #[test]
    fn test_empty_treated_group_rejected() {
        let (t, y) = arms(0, 0, 50, 10);
        assert!(matches!(
            HypothesisTester::default().two_proportion(&t, &y),
            Err(AnalysisError::EmptyGroup { arm: Arm::Treated, .. })
        ));
    }

    #[test]
    fn test_zero_pooled_variance_is_nan() {
        let (t, y) = arms(40, 0, 40, 0);
        let result = HypothesisTester::default().two_proportion(&t, &y).unwrap();
        assert!(result.z_stat.is_nan());
        assert!(result.p_value.is_nan());
        assert_eq!(result.significance, Significance::Inconclusive);
    }

    #[test]
    fn test_arm_rates_have_wald_intervals() {
        let (t, y) = arms(100, 30, 100, 20);
        let result = HypothesisTester::default().two_proportion(&t, &y).unwrap();
        let treated = result.arm_rate(Arm::Treated);
        assert_eq!(treated.successes, 30);
        let se = (0.3 * 0.7 / 100.0f64).sqrt();
        assert_relative_eq!(treated.ci_upper - treated.rate, 1.959964 * se, epsilon = 1e-5);
    }

    #[test]
    fn test_mean_difference_on_adjusted_values() {
        let values: Vec<f64> = (0..200).map(|i| if i < 100 { 1.0 + (i % 5) as f64 * 0.1 } else { (i % 5) as f64 * 0.1 }).collect();
        let mut treatment = vec![1u8; 100];
        treatment.extend(vec![0u8; 100]);
        let result = HypothesisTester::default().mean_difference(&values, &treatment).unwrap();
        assert_relative_eq!(result.difference, 1.0, epsilon = 1e-12);
        assert_eq!(result.significance, Significance::Significant);
    }

    #[test]
    fn test_invalid_confidence_level() {
        assert!(HypothesisTester::new(1.0).is_err());
        assert!(HypothesisTester::new(0.0).is_err());
    }
}
