//! Least-squares AR(p) fit with intercept.
//!
//! Solved through the SVD so rank-deficient designs (more lags than
//! training rows, constant series) still produce the minimum-norm solution
//! instead of failing.

use nalgebra::{DMatrix, DVector};

/// Fitted AR coefficients: `coefficients[0]` is the intercept and
/// `coefficients[k]` multiplies the value `k` days back.
#[derive(Debug, Clone, PartialEq)]
pub struct ArFit {
    coefficients: DVector<f64>,
}

impl ArFit {
    /// Fit on targets `history[t]` for `t` in `targets`, each regressed on
    /// the `lags` values immediately before it.
    ///
    /// Callers guarantee every index `t - lags..t` is inside `history`.
    pub fn fit(history: &[f64], targets: std::ops::Range<usize>, lags: usize) -> Option<Self> {
        let rows = targets.len();
        if rows == 0 || lags == 0 || targets.start < lags {
            return None;
        }
        let x = DMatrix::from_fn(rows, lags + 1, |r, c| {
            if c == 0 {
                1.0
            } else {
                history[targets.start + r - c]
            }
        });
        let y = DVector::from_fn(rows, |r, _| history[targets.start + r]);

        let svd = x.svd(true, true);
        let largest = svd.singular_values.max();
        let eps = largest * (rows.max(lags + 1) as f64) * f64::EPSILON;
        let coefficients = svd.solve(&y, eps).ok()?;
        coefficients
            .iter()
            .all(|c| c.is_finite())
            .then_some(Self { coefficients })
    }

    /// One-step prediction given the `lags` most recent values, newest last.
    pub fn predict(&self, recent: &[f64]) -> f64 {
        self.lag_coefficients()
            .iter()
            .zip(recent.iter().rev())
            .fold(self.intercept(), |value, (c, x)| value + c * x)
    }

    pub fn intercept(&self) -> f64 {
        self.coefficients[0]
    }

    pub fn lag_coefficients(&self) -> &[f64] {
        &self.coefficients.as_slice()[1..]
    }
}
