//! Weekday Corrector
//!
//! Fits and removes day-of-week reporting effects.
//!
//! ## Model
//!
//! For each numerator column the counts are modelled as Poisson with
//!
//! ```text
//! log(num_t) = alpha_wd(t) + phi_t + log(den_t)
//! ```
//!
//! `alpha` holds six free weekday effects (Monday..Saturday) and Sunday is
//! fixed at `-sum(alpha)` so the seven effects multiply to one across a
//! week. `phi_t` is a per-day level kept smooth by an L2 penalty on its
//! third differences. Without a denominator `den_t = 1`.
//!
//! The penalty strength is picked from a grid by K-fold cross-validation
//! on held-out days (lowest mean Poisson deviance), then the model is
//! refit on every day. Grid candidates are independent and run on a rayon
//! pool of `num_threads` threads.
//!
//! ## Usage
//!
//! ```ignore
//! let params = weekday::get_params(&table, None, &cols, &[1.0, 10.0, 100.0], 4)?;
//! let adjusted = weekday::calc_adjustment(&params, &table, &cols)?;
//! ```

mod lbfgs;
pub mod weekend;

pub use lbfgs::{minimize, LbfgsConfig, Minimum};
pub use weekend::{weekend_corr, WeekendOutput};

use chrono::{Datelike, NaiveDate};
use rayon::prelude::*;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::series::SeriesTable;
use crate::stats;
use crate::types::{Flag, FlagKind};

/// Held-out folds used to score each penalty strength.
const CV_FOLDS: usize = 5;

/// Scale floor for log residuals in [`weekday_outliers`].
const MIN_LOG_SCALE: f64 = 0.05;

#[derive(Debug, Error)]
pub enum WeekdayError {
    #[error("column '{0}' not found")]
    UnknownColumn(String),

    #[error("no weekday parameters fitted for column '{0}'")]
    MissingParams(String),

    #[error("lambda grid is empty")]
    EmptyGrid,

    #[error("failed to build weekday thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Fitted parameters for one numerator column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnParams {
    pub name: String,
    /// Monday..Saturday log effects; Sunday is `-sum(alpha)`.
    pub alpha: [f64; 6],
    /// Per-day smooth level, empty for degenerate fits.
    pub phi: Vec<f64>,
    /// Penalty strength chosen by cross-validation.
    pub lambda: Option<f64>,
}

impl ColumnParams {
    pub fn zero(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alpha: [0.0; 6],
            phi: Vec::new(),
            lambda: None,
        }
    }

    /// Build from a raw coefficient vector laid out as
    /// `[alpha_mon..alpha_sat, phi_0, phi_1, ...]`.
    pub fn from_raw(name: impl Into<String>, raw: &[f64]) -> Self {
        let mut alpha = [0.0; 6];
        for (a, r) in alpha.iter_mut().zip(raw) {
            *a = *r;
        }
        Self {
            name: name.into(),
            alpha,
            phi: raw.get(6..).map(<[f64]>::to_vec).unwrap_or_default(),
            lambda: None,
        }
    }

    /// Log multiplicative effect for a weekday index (Monday = 0).
    pub fn effect(&self, weekday: usize) -> f64 {
        if weekday < 6 {
            self.alpha[weekday]
        } else {
            -self.alpha.iter().sum::<f64>()
        }
    }

    pub fn is_zero(&self) -> bool {
        self.alpha.iter().all(|a| *a == 0.0)
    }
}

/// Weekday parameters for every numerator column of a fit.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WeekdayParams {
    pub columns: Vec<ColumnParams>,
}

impl WeekdayParams {
    pub fn zeros(names: &[String]) -> Self {
        Self {
            columns: names.iter().map(ColumnParams::zero).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ColumnParams> {
        self.columns.iter().find(|c| c.name == name)
    }
}

fn weekday_index(date: NaiveDate) -> usize {
    date.weekday().num_days_from_monday() as usize
}

// ============================================================================
// Objective
// ============================================================================

/// Penalized negative Poisson log-likelihood for one column.
struct Problem<'a> {
    y: &'a [f64],
    offset: &'a [f64],
    weekday: &'a [usize],
    /// Days whose likelihood term is included.
    mask: Vec<bool>,
    lambda: f64,
}

impl Problem<'_> {
    fn n(&self) -> usize {
        self.y.len()
    }

    fn eta(&self, b: &[f64], t: usize) -> f64 {
        let wd = self.weekday[t];
        let a = if wd < 6 { b[wd] } else { -b[..6].iter().sum::<f64>() };
        a + b[6 + t] + self.offset[t]
    }

    fn value_grad(&self, b: &[f64], grad: &mut [f64]) -> f64 {
        let n = self.n();
        let n_obs = self.mask.iter().filter(|m| **m).count().max(1) as f64;
        grad.iter_mut().for_each(|g| *g = 0.0);

        let mut ll = 0.0;
        for t in 0..n {
            if !self.mask[t] {
                continue;
            }
            let eta = self.eta(b, t);
            let mu = eta.exp();
            ll += self.y[t] * eta - mu;
            let g = -(self.y[t] - mu) / n_obs;
            grad[6 + t] += g;
            let wd = self.weekday[t];
            if wd < 6 {
                grad[wd] += g;
            } else {
                for a in grad.iter_mut().take(6) {
                    *a -= g;
                }
            }
        }

        let phi = &b[6..];
        let scale = self.lambda / (n as f64 - 2.0).max(1.0);
        let mut penalty = 0.0;
        for k in 0..n.saturating_sub(3) {
            let d = phi[k + 3] - 3.0 * phi[k + 2] + 3.0 * phi[k + 1] - phi[k];
            penalty += d * d;
            let c = 2.0 * scale * d;
            grad[6 + k + 3] += c;
            grad[6 + k + 2] -= 3.0 * c;
            grad[6 + k + 1] += 3.0 * c;
            grad[6 + k] -= c;
        }

        -ll / n_obs + scale * penalty
    }

    /// Starting point: zero weekday effects, levels from the observed
    /// counts carried across days excluded by the mask.
    fn start(&self) -> Vec<f64> {
        let n = self.n();
        let mut b = vec![0.0; 6 + n];
        let first = (0..n).find(|&t| self.mask[t]).unwrap_or(0);
        let mut level = 0.0;
        for t in 0..n {
            if self.mask[t] || t < first {
                let src = t.max(first);
                level = self.y[src].max(0.5).ln() - self.offset[src];
            }
            b[6 + t] = level;
        }
        b
    }

    fn fit(&self) -> Option<Vec<f64>> {
        let result = minimize(
            |b, g| self.value_grad(b, g),
            self.start(),
            &LbfgsConfig::default(),
        );
        if !result.value.is_finite() || result.x.iter().any(|v| !v.is_finite()) {
            return None;
        }
        if !result.converged {
            debug!(iterations = result.iterations, "Weekday fit stopped before convergence");
        }
        Some(result.x)
    }

    /// Poisson deviance over the days where `held_out` is set.
    fn deviance(&self, b: &[f64], held_out: &[bool]) -> f64 {
        let mut total = 0.0;
        for t in 0..self.n() {
            if !held_out[t] {
                continue;
            }
            let mu = self.eta(b, t).exp();
            let y = self.y[t];
            let term = if y > 0.0 { y * (y / mu).ln() } else { 0.0 };
            total += 2.0 * (term - (y - mu));
        }
        total
    }
}

/// Mean held-out deviance for one penalty strength.
fn cv_deviance(y: &[f64], offset: &[f64], weekday: &[usize], observed: &[bool], lambda: f64) -> f64 {
    let observed_idx: Vec<usize> = (0..y.len()).filter(|&t| observed[t]).collect();
    let folds = CV_FOLDS.min(observed_idx.len());
    if folds < 2 {
        return f64::INFINITY;
    }
    let mut total = 0.0;
    for fold in 0..folds {
        let mut held_out = vec![false; y.len()];
        for (k, &t) in observed_idx.iter().enumerate() {
            if k % folds == fold {
                held_out[t] = true;
            }
        }
        let mask: Vec<bool> = (0..y.len()).map(|t| observed[t] && !held_out[t]).collect();
        let problem = Problem {
            y,
            offset,
            weekday,
            mask,
            lambda,
        };
        match problem.fit() {
            Some(b) => total += problem.deviance(&b, &held_out),
            None => return f64::INFINITY,
        }
    }
    total / folds as f64
}

// ============================================================================
// Public API
// ============================================================================

/// Fit weekday effects for each of `numerator_cols`.
///
/// `denominator_col`, when given, names a column of `data` used as the
/// Poisson exposure. Days with a missing numerator (or a missing or
/// non-positive denominator) are left out of the likelihood. A column
/// observed on fewer than seven distinct weekdays, or one that cannot be
/// fit, gets all-zero parameters so the adjustment is a no-op.
pub fn get_params(
    data: &SeriesTable,
    denominator_col: Option<&str>,
    numerator_cols: &[String],
    lambda_grid: &[f64],
    num_threads: usize,
) -> Result<WeekdayParams, WeekdayError> {
    if lambda_grid.is_empty() {
        return Err(WeekdayError::EmptyGrid);
    }
    let denominator = match denominator_col {
        Some(name) => Some(
            data.column(name)
                .ok_or_else(|| WeekdayError::UnknownColumn(name.to_string()))?,
        ),
        None => None,
    };
    let weekday: Vec<usize> = data.dates().iter().map(|d| weekday_index(*d)).collect();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads.max(1))
        .build()?;

    let mut columns = Vec::with_capacity(numerator_cols.len());
    for name in numerator_cols {
        let numerator = data
            .column(name)
            .ok_or_else(|| WeekdayError::UnknownColumn(name.clone()))?;

        let mut y = vec![0.0; data.len()];
        let mut offset = vec![0.0; data.len()];
        let mut observed = vec![false; data.len()];
        for t in 0..data.len() {
            let den = match denominator {
                Some(col) => col[t],
                None => Some(1.0),
            };
            if let (Some(num), Some(den)) = (numerator[t], den) {
                if num >= 0.0 && den > 0.0 {
                    y[t] = num;
                    offset[t] = den.ln();
                    observed[t] = true;
                }
            }
        }

        let distinct: HashSet<usize> = (0..data.len())
            .filter(|&t| observed[t])
            .map(|t| weekday[t])
            .collect();
        if distinct.len() < 7 {
            warn!(
                column = %name,
                weekdays = distinct.len(),
                "Too few weekdays to estimate weekday effects, using zero parameters"
            );
            columns.push(ColumnParams::zero(name.clone()));
            continue;
        }

        let scores: Vec<(f64, f64)> = pool.install(|| {
            lambda_grid
                .par_iter()
                .map(|&lambda| (lambda, cv_deviance(&y, &offset, &weekday, &observed, lambda)))
                .collect()
        });
        let best = scores
            .iter()
            .filter(|(_, dev)| dev.is_finite())
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(lambda, _)| *lambda);

        let fitted = best.and_then(|lambda| {
            let problem = Problem {
                y: &y,
                offset: &offset,
                weekday: &weekday,
                mask: observed.clone(),
                lambda,
            };
            problem.fit().map(|raw| {
                let mut params = ColumnParams::from_raw(name.clone(), &raw);
                params.lambda = Some(lambda);
                params
            })
        });

        match fitted {
            Some(params) => {
                debug!(column = %name, lambda = params.lambda, "Weekday effects fitted");
                columns.push(params);
            }
            None => {
                error!(column = %name, "Unable to calculate weekday correction");
                columns.push(ColumnParams::zero(name.clone()));
            }
        }
    }

    Ok(WeekdayParams { columns })
}

/// Divide each value of `cols` by its fitted weekday multiplier.
///
/// Other columns and the date axis are returned untouched; all-zero
/// parameters leave the table unchanged.
pub fn calc_adjustment(
    params: &WeekdayParams,
    data: &SeriesTable,
    cols: &[String],
) -> Result<SeriesTable, WeekdayError> {
    let mut selected: Vec<Option<&ColumnParams>> = vec![None; data.geographies().len()];
    for name in cols {
        let g = data
            .geography_index(name)
            .ok_or_else(|| WeekdayError::UnknownColumn(name.clone()))?;
        selected[g] = Some(
            params
                .get(name)
                .ok_or_else(|| WeekdayError::MissingParams(name.clone()))?,
        );
    }

    let dates = data.dates();
    Ok(data.map_columns(|g, column| match selected[g] {
        Some(p) if !p.is_zero() => column
            .iter()
            .zip(dates)
            .map(|(value, date)| value.map(|v| v / p.effect(weekday_index(*date)).exp()))
            .collect(),
        _ => column.to_vec(),
    }))
}

/// Days whose fitted log residual is extreme for their column.
///
/// Residuals `log(num_t) - (alpha_wd + phi_t)` are standardized by their
/// robust scale; `|z| > threshold` is flagged.
pub fn weekday_outliers(
    params: &WeekdayParams,
    data: &SeriesTable,
    threshold: f64,
    lag: &str,
    key: &str,
) -> Vec<Flag> {
    let mut flags = Vec::new();
    for p in &params.columns {
        let Some(column) = data.column(&p.name) else { continue };
        if p.phi.len() != data.len() {
            continue;
        }
        let residuals: Vec<(usize, f64)> = column
            .iter()
            .enumerate()
            .filter_map(|(t, v)| {
                let v = (*v)?;
                (v > 0.0).then(|| {
                    let fitted = p.effect(weekday_index(data.dates()[t])) + p.phi[t];
                    (t, v.ln() - fitted)
                })
            })
            .collect();
        let values: Vec<f64> = residuals.iter().map(|(_, r)| *r).collect();
        let Some(center) = stats::median(&values) else { continue };
        let Some(scale) = stats::robust_scale(&values, MIN_LOG_SCALE) else { continue };
        for (t, r) in residuals {
            let z = (r - center) / scale;
            if z.abs() > threshold {
                flags.push(Flag {
                    date: data.dates()[t],
                    geography: p.name.clone(),
                    kind: FlagKind::WeekdayOutlier,
                    lag: lag.to_string(),
                    key: key.to_string(),
                    score: Some(z),
                });
            }
        }
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jan(day: u64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 1, 1).unwrap() + chrono::Days::new(day)
    }

    fn num_den_table() -> SeriesTable {
        let dates: Vec<NaiveDate> = (0..10).map(jan).collect();
        SeriesTable::new(
            dates,
            vec!["num".into(), "den".into()],
            vec![
                (1..=10).map(|v| Some(f64::from(v))).collect(),
                (11..=20).map(|v| Some(f64::from(v))).collect(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_calc_adjustment_with_zero_parameters() {
        let data = num_den_table();
        let params = WeekdayParams::zeros(&["num".to_string()]);
        let result = calc_adjustment(&params, &data, &["num".to_string()]).unwrap();
        assert_eq!(result, data);
    }

    #[test]
    fn test_calc_adjustment() {
        let data = num_den_table();
        let params = WeekdayParams {
            columns: vec![ColumnParams::from_raw("num", &[1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0])],
        };
        let result = calc_adjustment(&params, &data, &["num".to_string()]).unwrap();

        let expected = [
            0.36787944, 5.43656366, 1.10363832, 10.87312731, 5.0, 2.20727665, 19.0279728,
            2.94303553, 24.46453646, 3.67879441,
        ];
        for (got, want) in result.column("num").unwrap().iter().zip(expected) {
            assert!((got.unwrap() - want).abs() < 1e-6, "{got:?} vs {want}");
        }
        assert_eq!(result.column("den"), data.column("den"));
        assert_eq!(result.dates(), data.dates());
    }

    fn weekly_pattern(weeks: u64) -> (SeriesTable, [f64; 6]) {
        let alpha = [0.3, 0.1, 0.0, 0.0, -0.1, -0.5];
        let sunday = -alpha.iter().sum::<f64>();
        let dates: Vec<NaiveDate> = (0..weeks * 7).map(jan).collect();
        let column = dates
            .iter()
            .map(|d| {
                let wd = weekday_index(*d);
                let effect = if wd < 6 { alpha[wd] } else { sunday };
                Some(1000.0 * effect.exp())
            })
            .collect();
        (
            SeriesTable::new(dates, vec!["ca".into()], vec![column]).unwrap(),
            alpha,
        )
    }

    #[test]
    fn test_get_params_recovers_weekday_effects() {
        let (table, alpha) = weekly_pattern(6);
        let params = get_params(&table, None, &["ca".to_string()], &[1.0, 10.0], 1).unwrap();
        let fitted = params.get("ca").unwrap();
        for (got, want) in fitted.alpha.iter().zip(alpha) {
            assert!((got - want).abs() < 0.05, "alpha {got} vs {want}");
        }

        let adjusted = calc_adjustment(&params, &table, &["ca".to_string()]).unwrap();
        let values: Vec<f64> = adjusted.column("ca").unwrap().iter().flatten().copied().collect();
        let max = values.iter().cloned().fold(f64::MIN, f64::max);
        let min = values.iter().cloned().fold(f64::MAX, f64::min);
        assert!(max / min < 1.1, "adjusted series not flat: {min}..{max}");
    }

    #[test]
    fn test_thread_count_does_not_change_result() {
        let (table, _) = weekly_pattern(4);
        let cols = ["ca".to_string()];
        let single = get_params(&table, None, &cols, &[1.0, 10.0, 100.0], 1).unwrap();
        let multi = get_params(&table, None, &cols, &[1.0, 10.0, 100.0], 3).unwrap();
        assert_eq!(single, multi);
    }

    #[test]
    fn test_too_few_weekdays_gives_zero_params() {
        let dates: Vec<NaiveDate> = (0..5).map(jan).collect();
        let table = SeriesTable::new(
            dates,
            vec!["ca".into()],
            vec![vec![Some(5.0), Some(6.0), Some(7.0), Some(8.0), Some(9.0)]],
        )
        .unwrap();
        let params = get_params(&table, None, &["ca".to_string()], &[1.0], 1).unwrap();
        assert!(params.get("ca").unwrap().is_zero());
        let adjusted = calc_adjustment(&params, &table, &["ca".to_string()]).unwrap();
        assert_eq!(adjusted, table);
    }

    #[test]
    fn test_unknown_column_is_error() {
        let data = num_den_table();
        assert!(matches!(
            get_params(&data, Some("missing"), &["num".to_string()], &[1.0], 1),
            Err(WeekdayError::UnknownColumn(_))
        ));
        assert!(matches!(
            get_params(&data, None, &["num".to_string()], &[], 1),
            Err(WeekdayError::EmptyGrid)
        ));
    }

    #[test]
    fn test_weekday_outlier_flagged() {
        let (table, _) = weekly_pattern(6);
        let cols = ["ca".to_string()];
        let params = get_params(&table, None, &cols, &[10.0], 1).unwrap();
        let mut values: Vec<Option<f64>> = table.column("ca").unwrap().to_vec();
        values[20] = values[20].map(|v| v * 20.0);
        let bumped = SeriesTable::new(table.dates().to_vec(), cols.to_vec(), vec![values]).unwrap();

        let flags = weekday_outliers(&params, &bumped, 5.0, "1", "num");
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].date, table.dates()[20]);
        assert_eq!(flags[0].kind, FlagKind::WeekdayOutlier);
    }
}
