//! Robust statistics shared by the spike detector, the AR flagger and the
//! validator.
//!
//! Means and standard deviations come from `statrs`; order statistics are
//! computed here on sorted copies because every caller works on short
//! neighbourhood slices.

use statrs::statistics::Statistics;

/// Consistency constant turning a MAD into a normal-equivalent sigma.
pub const MAD_SCALE: f64 = 1.4826;

/// Median of a slice (non-destructive, clones and sorts). `None` when empty.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Median absolute deviation around `center`.
pub fn mad(values: &[f64], center: f64) -> Option<f64> {
    let deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    median(&deviations)
}

/// Normal-equivalent robust scale (`1.4826 * MAD`), floored at `floor`.
pub fn robust_scale(values: &[f64], floor: f64) -> Option<f64> {
    let center = median(values)?;
    let spread = mad(values, center)? * MAD_SCALE;
    Some(spread.max(floor))
}

/// Fraction of `reference` strictly below `x`.
pub fn empirical_cdf(reference: &[f64], x: f64) -> f64 {
    if reference.is_empty() {
        return f64::NAN;
    }
    let below = reference.iter().filter(|&&r| r < x).count();
    below as f64 / reference.len() as f64
}

/// Sample mean, `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().mean())
    }
}

/// Sample standard deviation (n - 1), `None` below two observations.
pub fn std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        None
    } else {
        Some(values.iter().std_dev())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_robust_scale_uses_floor_for_constant_data() {
        let scale = robust_scale(&[10.0, 10.0, 10.0, 10.0], 1.0).unwrap();
        assert!((scale - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_robust_scale_ignores_single_outlier() {
        let scale = robust_scale(&[1.0, 2.0, 3.0, 4.0, 1000.0], 0.0).unwrap();
        assert!(scale < 5.0, "scale {scale} should not be dominated by the outlier");
    }

    #[test]
    fn test_empirical_cdf() {
        let reference = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(empirical_cdf(&reference, 0.5), 0.0);
        assert_eq!(empirical_cdf(&reference, 2.5), 0.5);
        assert_eq!(empirical_cdf(&reference, 10.0), 1.0);
        assert!(empirical_cdf(&[], 1.0).is_nan());
    }

    #[test]
    fn test_mean_and_std() {
        assert_eq!(mean(&[1.0, 2.0, 3.0]), Some(2.0));
        assert!((std_dev(&[1.0, 2.0, 3.0]).unwrap() - 1.0).abs() < 1e-12);
        assert_eq!(std_dev(&[1.0]), None);
    }
}
