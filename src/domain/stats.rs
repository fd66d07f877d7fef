//! Global Statistics
//!
//! Scalar aggregates computed once over the analysis population and
//! broadcast as constant columns onto every reconciled row. They are run
//! metadata, not per-unit facts.

use serde::{Deserialize, Serialize};

/// Global statistics bundle broadcast onto every output row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalStats {
    pub treatment_rate: f64,
    pub control_rate: f64,
    /// Difference in outcome rates (treated - control)
    pub effect_size: f64,
    pub z_stat: f64,
    pub p_value: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub cohens_h: f64,
    /// Unpooled standard error of the rate difference
    pub stderr: f64,
    pub original_variance: f64,
    pub cuped_variance: f64,
    pub variance_reduction_pct: f64,
    pub propensity_mean: f64,
    /// `1 - 2|mean propensity - 0.5|`
    pub randomization_balance: f64,
    /// NaN when calibration had too few usable buckets
    pub uplift_model_performance: f64,
}

impl GlobalStats {
    /// Column suffixes and values, in output order
    pub fn columns(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("treatment_rate", self.treatment_rate),
            ("control_rate", self.control_rate),
            ("effect_size", self.effect_size),
            ("z_stat", self.z_stat),
            ("p_value", self.p_value),
            ("ci_lower", self.ci_lower),
            ("ci_upper", self.ci_upper),
            ("cohens_h", self.cohens_h),
            ("stderr", self.stderr),
            ("original_variance", self.original_variance),
            ("cuped_variance", self.cuped_variance),
            ("variance_reduction_pct", self.variance_reduction_pct),
            ("propensity_mean", self.propensity_mean),
            ("randomization_balance", self.randomization_balance),
            ("uplift_model_performance", self.uplift_model_performance),
        ]
    }
}

/// Arithmetic mean; NaN for an empty slice
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample variance with Bessel's correction; NaN below two values
pub fn sample_variance(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return f64::NAN;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (n - 1) as f64
}

/// Linear-interpolated quantile of an ascending slice, `q` in [0, 1]
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let h = (sorted.len() - 1) as f64 * q.clamp(0.0, 1.0);
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Finite values of `values`, sorted ascending
pub fn sorted_finite(values: &[f64]) -> Vec<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mean_and_variance() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert_relative_eq!(mean(&v), 2.5);
        assert_relative_eq!(sample_variance(&v), 5.0 / 3.0, epsilon = 1e-12);
        assert!(mean(&[]).is_nan());
        assert!(sample_variance(&[1.0]).is_nan());
    }

    #[test]
    fn test_quantile_interpolation() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_relative_eq!(quantile_sorted(&sorted, 0.0), 1.0);
        assert_relative_eq!(quantile_sorted(&sorted, 0.5), 3.0);
        assert_relative_eq!(quantile_sorted(&sorted, 0.75), 4.0);
        assert_relative_eq!(quantile_sorted(&[1.0, 2.0], 0.25), 1.25);
    }

    #[test]
    fn test_sorted_finite_drops_nan() {
        assert_eq!(sorted_finite(&[3.0, f64::NAN, 1.0]), vec![1.0, 3.0]);
    }

    #[test]
    fn test_columns_cover_every_field() {
        let stats = GlobalStats {
            treatment_rate: 0.25,
            control_rate: 0.15,
            effect_size: 0.10,
            z_stat: 4.0,
            p_value: 0.0001,
            ci_lower: 0.05,
            ci_upper: 0.15,
            cohens_h: 0.24,
            stderr: 0.025,
            original_variance: 0.16,
            cuped_variance: 0.12,
            variance_reduction_pct: 25.0,
            propensity_mean: 0.5,
            randomization_balance: 1.0,
            uplift_model_performance: f64::NAN,
        };
        let cols = stats.columns();
        assert_eq!(cols.len(), 15);
        assert_eq!(cols[2], ("effect_size", 0.10));
        assert!(cols[14].1.is_nan());
    }
}
