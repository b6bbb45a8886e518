//! AR Residual Model
//!
//! Per-geography autoregressive forecasts whose residuals show when a day
//! breaks from its own recent history.
//!
//! ## Architecture
//!
//! Two entry points share one fitting routine ([`ArFit`]): for a target
//! day `d`, an AR(p) with intercept is fit by least squares on the
//! `n_train` days before `d` (each regressed on its `p` predecessors) and
//! `d` is predicted from its own `p` predecessors.
//!
//! - [`ar_method`]: rolling ranking. The last `n_valid` days are ranked
//!   against the residuals of the `n_test` days before them. Incremental:
//!   rows already present in the residual table are not recomputed.
//! - [`ar_results`] + [`calculate_report_flags`]: windowed backtest over a
//!   [`Window`], used by the flag cache.

mod ols;

pub use ols::ArFit;

use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::series::{SeriesError, SeriesTable};
use crate::stats;
use crate::types::{shift_days, Flag, FlagKind, Window};

/// Residual scale floor for [`ar_method`] flags.
const MIN_RESIDUAL_SCALE: f64 = 1e-6;

/// Default two-sided tail probability for [`calculate_report_flags`].
pub const REPORT_THRESHOLD: f64 = 0.025;

#[derive(Debug, Error)]
pub enum ArError {
    #[error("Need at least 1 lag for the AR model")]
    NoLags,

    #[error("Number of samples to train on must be at least {min}, got {got}")]
    TooFewTrainingDays { min: usize, got: usize },

    #[error("n_valid must be at least 1")]
    NoValidationDays,

    #[error("need {required} dates for n_test + n_valid, table has {available}")]
    NotEnoughDates { required: usize, available: usize },

    #[error("geography '{0}' not found in table")]
    UnknownGeography(String),

    #[error(
        "Necessary start date for AR parameters ({required}) is before the first data date ({available})"
    )]
    InsufficientHistory {
        required: NaiveDate,
        available: NaiveDate,
    },

    #[error(transparent)]
    Series(#[from] SeriesError),

    #[error("residual table I/O: {0}")]
    Csv(#[from] csv::Error),
}

/// Parameters for [`ar_method`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArParams {
    pub num_lags: usize,
    pub n_train: usize,
    pub n_test: usize,
    pub n_valid: usize,
    /// Series variant the residuals belong to, e.g. `num` or `ratio`.
    pub key: String,
    /// Robust z above which a validation-day residual is flagged.
    pub flag_multiple: f64,
}

/// One predicted (date, geography) point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidualRow {
    pub date: NaiveDate,
    pub geography: String,
    pub predicted: f64,
    pub actual: f64,
    pub residual: f64,
    #[serde(rename = "lag")]
    pub lags: usize,
    pub key: String,
}

impl ResidualRow {
    fn same_point(&self, date: NaiveDate, geography: &str, lags: usize, key: &str) -> bool {
        self.date == date && self.geography == geography && self.lags == lags && self.key == key
    }
}

/// A validation-day residual ranked against the test distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArFlag {
    pub date: NaiveDate,
    pub geography: String,
    pub residual: f64,
    /// Share of test residuals strictly below this one.
    pub cdf: f64,
    /// `min(cdf, 1 - cdf)`: smaller is more extreme.
    pub sort_prio: f64,
    #[serde(rename = "lag")]
    pub lags: usize,
    pub key: String,
}

impl ArFlag {
    pub fn to_flag(&self) -> Flag {
        Flag {
            date: self.date,
            geography: self.geography.clone(),
            kind: FlagKind::ArResidual,
            lag: self.lags.to_string(),
            key: self.key.clone(),
            score: Some(self.cdf),
        }
    }
}

pub fn write_residuals(path: &Path, rows: &[ResidualRow]) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_path(path)?;
    if rows.is_empty() {
        writer.write_record(["date", "geography", "predicted", "actual", "residual", "lag", "key"])?;
    }
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_residuals(path: &Path) -> Result<Vec<ResidualRow>, csv::Error> {
    let file = File::open(path)?;
    let mut reader = csv::Reader::from_reader(BufReader::new(file));
    reader.deserialize().collect()
}

// ============================================================================
// Fitting
// ============================================================================

/// Predict `column[index]` from the `n_train` preceding targets.
///
/// `None` when any value the fit needs is missing or the history does not
/// reach back `n_train + lags` days.
fn predict_at(column: &[Option<f64>], index: usize, lags: usize, n_train: usize) -> Option<f64> {
    let start = index.checked_sub(n_train.checked_add(lags)?)?;
    let history: Vec<f64> = column[start..index]
        .iter()
        .copied()
        .collect::<Option<Vec<f64>>>()?;
    let fit = ArFit::fit(&history, lags..history.len(), lags)?;
    Some(fit.predict(&history))
}

// ============================================================================
// Rolling ranking
// ============================================================================

/// Rank the latest days of each geography against recent AR residuals.
///
/// Returns the residual rows computed by this call and the flags raised
/// on validation days. Points already in `existing` (same date,
/// geography, lag count and key) are skipped, so a second call with the
/// first call's output returns two empty vectors.
pub fn ar_method(
    data: &SeriesTable,
    geographies: &[String],
    params: &ArParams,
    existing: &[ResidualRow],
) -> Result<(Vec<ResidualRow>, Vec<ArFlag>), ArError> {
    if params.num_lags == 0 {
        return Err(ArError::NoLags);
    }
    if params.n_train < 3 {
        return Err(ArError::TooFewTrainingDays {
            min: 3,
            got: params.n_train,
        });
    }
    if params.n_valid == 0 {
        return Err(ArError::NoValidationDays);
    }
    let dates = data.dates();
    let required = params.n_test.saturating_add(params.n_valid);
    if dates.len() < required {
        return Err(ArError::NotEnoughDates {
            required,
            available: dates.len(),
        });
    }

    let valid_from = dates.len() - params.n_valid;
    let test_from = valid_from - params.n_test;
    let columns = geographies
        .iter()
        .map(|g| {
            data.column(g)
                .ok_or_else(|| ArError::UnknownGeography(g.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut rows = Vec::new();
    for index in test_from..dates.len() {
        let date = dates[index];
        for (geography, column) in geographies.iter().zip(&columns) {
            if existing
                .iter()
                .any(|r| r.same_point(date, geography, params.num_lags, &params.key))
            {
                continue;
            }
            let Some(actual) = column[index] else { continue };
            let Some(predicted) = predict_at(column, index, params.num_lags, params.n_train)
            else {
                debug!(%date, geography = %geography, "Not enough history for AR prediction");
                continue;
            };
            rows.push(ResidualRow {
                date,
                geography: geography.clone(),
                predicted,
                actual,
                residual: actual - predicted,
                lags: params.num_lags,
                key: params.key.clone(),
            });
        }
    }

    if rows.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }

    let test_dates: HashSet<NaiveDate> = dates[test_from..valid_from].iter().copied().collect();
    let test_residuals: Vec<f64> = existing
        .iter()
        .filter(|r| r.lags == params.num_lags && r.key == params.key)
        .chain(&rows)
        .filter(|r| test_dates.contains(&r.date))
        .map(|r| r.residual)
        .collect();
    let scale = stats::robust_scale(&test_residuals, MIN_RESIDUAL_SCALE).unwrap_or(MIN_RESIDUAL_SCALE);

    let mut flags: Vec<ArFlag> = rows
        .iter()
        .filter(|r| r.date >= dates[valid_from])
        .filter(|r| (r.residual / scale).abs() > params.flag_multiple)
        .map(|r| {
            let cdf = if test_residuals.is_empty() {
                0.5
            } else {
                stats::empirical_cdf(&test_residuals, r.residual)
            };
            ArFlag {
                date: r.date,
                geography: r.geography.clone(),
                residual: r.residual,
                cdf,
                sort_prio: cdf.min(1.0 - cdf),
                lags: r.lags,
                key: r.key.clone(),
            }
        })
        .collect();
    flags.dedup();

    info!(
        residuals = rows.len(),
        flags = flags.len(),
        lags = params.num_lags,
        key = %params.key,
        "AR ranking complete"
    );
    Ok((rows, flags))
}

// ============================================================================
// Windowed backtest
// ============================================================================

/// Predictions and residuals over a window's residual and evaluation days.
#[derive(Debug, Clone, PartialEq)]
pub struct ArOutput {
    pub predictions: SeriesTable,
    /// `actual - predicted`; missing where either side is.
    pub residuals: SeriesTable,
}

/// An evaluation-day residual in the tail of the residual distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportFlag {
    pub date: NaiveDate,
    pub geography: String,
    pub cdf: f64,
    /// `min(cdf, 1 - cdf)`.
    pub tail: f64,
}

impl ReportFlag {
    pub fn to_flag(&self, lag: &str, key: &str) -> Flag {
        Flag {
            date: self.date,
            geography: self.geography.clone(),
            kind: FlagKind::ArResidual,
            lag: lag.to_string(),
            key: key.to_string(),
            score: Some(self.tail),
        }
    }
}

/// Predict every residual and evaluation day of `window` for every
/// geography of `table`.
///
/// `table` must be on a daily axis; each prediction needs
/// `n_train + ar_lags` days of history after the first data date.
pub fn ar_results(
    table: &SeriesTable,
    window: &Window,
    ar_lags: usize,
    n_train: usize,
) -> Result<ArOutput, ArError> {
    if n_train <= 1 {
        return Err(ArError::TooFewTrainingDays {
            min: 2,
            got: n_train,
        });
    }
    if ar_lags == 0 {
        return Err(ArError::NoLags);
    }
    let Some(first) = table.first_date() else {
        return Err(ArError::NotEnoughDates {
            required: 1,
            available: 0,
        });
    };

    let dates = window.prediction_dates();
    let history = n_train
        .checked_add(ar_lags)
        .and_then(|h| i64::try_from(h).ok())
        .unwrap_or(i64::MAX);
    for date in &dates {
        let required = shift_days(*date, -history).unwrap_or(NaiveDate::MIN);
        if required <= first {
            return Err(ArError::InsufficientHistory {
                required,
                available: first,
            });
        }
    }

    let mut predictions = Vec::with_capacity(table.geographies().len());
    let mut residuals = Vec::with_capacity(table.geographies().len());
    for (_, column) in table.columns() {
        let mut pred_col = Vec::with_capacity(dates.len());
        let mut resid_col = Vec::with_capacity(dates.len());
        for date in &dates {
            let (pred, actual) = match table.date_index(*date) {
                Some(index) => (predict_at(column, index, ar_lags, n_train), column[index]),
                None => (None, None),
            };
            pred_col.push(pred);
            resid_col.push(actual.zip(pred).map(|(a, p)| a - p));
        }
        predictions.push(pred_col);
        residuals.push(resid_col);
    }

    let geographies = table.geographies().to_vec();
    let build = |columns: Vec<Vec<Option<f64>>>| {
        SeriesTable::new(dates.clone(), geographies.clone(), columns)
    };
    Ok(ArOutput {
        predictions: build(predictions)?,
        residuals: build(residuals)?,
    })
}

/// Flag evaluation-day residuals far in either tail of the residual-range
/// distribution.
///
/// The reference distribution is every residual-range residual, missing
/// ones counted as zero. Each evaluation residual gets the share of the
/// reference strictly below it; `min(cdf, 1 - cdf) < thresh` is flagged.
/// Flags come back most extreme first.
pub fn calculate_report_flags(residuals: &SeriesTable, window: &Window, thresh: f64) -> Vec<ReportFlag> {
    let reference: Vec<f64> = residuals
        .dates()
        .iter()
        .enumerate()
        .filter(|(_, d)| window.resid_range.contains(**d))
        .flat_map(move |(i, _)| residuals.columns().map(move |(_, col)| col[i].unwrap_or(0.0)))
        .collect();
    if reference.is_empty() {
        return Vec::new();
    }

    let mut flags = Vec::new();
    for (i, date) in residuals.dates().iter().enumerate() {
        if !window.eval_range.contains(*date) {
            continue;
        }
        for (geography, column) in residuals.columns() {
            let Some(value) = column[i] else { continue };
            let cdf = stats::empirical_cdf(&reference, value);
            let tail = cdf.min(1.0 - cdf);
            if tail < thresh {
                flags.push(ReportFlag {
                    date: *date,
                    geography: geography.to_string(),
                    cdf,
                    tail,
                });
            }
        }
    }
    flags.sort_by(|a, b| a.tail.partial_cmp(&b.tail).unwrap_or(std::cmp::Ordering::Equal));
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DateRange;

    fn day(offset: u64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2022, 1, 1).unwrap() + chrono::Days::new(offset)
    }

    /// Two geographies: a gentle wave and a noisy-ish linear trend.
    fn table(days: u64) -> SeriesTable {
        let dates: Vec<NaiveDate> = (0..days).map(day).collect();
        let a = (0..days)
            .map(|i| Some(100.0 + 10.0 * (i as f64 / 3.0).sin()))
            .collect();
        let b = (0..days)
            .map(|i| Some(50.0 + i as f64 + if i % 3 == 0 { 1.5 } else { -0.5 }))
            .collect();
        SeriesTable::new(dates, vec!["ca".into(), "ny".into()], vec![a, b]).unwrap()
    }

    fn params() -> ArParams {
        ArParams {
            num_lags: 2,
            n_train: 4,
            n_test: 2,
            n_valid: 1,
            key: "num".into(),
            flag_multiple: 0.0,
        }
    }

    #[test]
    fn test_ar_method_rows_and_order() {
        let data = table(20);
        let geos = vec!["ca".to_string(), "ny".to_string()];
        let (rows, flags) = ar_method(&data, &geos, &params(), &[]).unwrap();

        // 3 days (2 test + 1 valid) x 2 geographies, geography order within a date
        assert_eq!(rows.len(), 6);
        assert_eq!(rows[0].date, day(17));
        assert_eq!(rows[0].geography, "ca");
        assert_eq!(rows[1].geography, "ny");
        assert_eq!(rows[5].date, day(19));
        for row in &rows {
            assert!((row.residual - (row.actual - row.predicted)).abs() < 1e-12);
            assert_eq!(row.lags, 2);
            assert_eq!(row.key, "num");
        }
        assert!(flags.iter().all(|f| f.date == day(19)));
        assert!(flags.iter().all(|f| (f.sort_prio - f.cdf.min(1.0 - f.cdf)).abs() < 1e-12));
    }

    #[test]
    fn test_ar_method_is_incremental() {
        let data = table(20);
        let geos = vec!["ca".to_string(), "ny".to_string()];
        let (rows, _) = ar_method(&data, &geos, &params(), &[]).unwrap();
        let (again, flags) = ar_method(&data, &geos, &params(), &rows).unwrap();
        assert!(again.is_empty());
        assert!(flags.is_empty());
    }

    #[test]
    fn test_ar_method_other_key_not_skipped() {
        let data = table(20);
        let geos = vec!["ca".to_string()];
        let (rows, _) = ar_method(&data, &geos, &params(), &[]).unwrap();
        let ratio = ArParams {
            key: "ratio".into(),
            ..params()
        };
        let (again, _) = ar_method(&data, &geos, &ratio, &rows).unwrap();
        assert_eq!(again.len(), rows.len());
    }

    #[test]
    fn test_ar_method_flags_jump_on_valid_day() {
        let mut values: Vec<Option<f64>> = (0..30).map(|i| Some(100.0 + f64::from(i % 2))).collect();
        values[29] = Some(400.0);
        let data = SeriesTable::new((0..30).map(day).collect(), vec!["ca".into()], vec![values]).unwrap();
        let p = ArParams {
            num_lags: 1,
            n_train: 6,
            n_test: 10,
            n_valid: 1,
            key: "num".into(),
            flag_multiple: 3.0,
        };
        let (_, flags) = ar_method(&data, &["ca".to_string()], &p, &[]).unwrap();
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].date, day(29));
        assert_eq!(flags[0].cdf, 1.0);
        assert_eq!(flags[0].sort_prio, 0.0);
        assert_eq!(flags[0].to_flag().lag, "1");
    }

    #[test]
    fn test_ar_method_more_lags_than_training_days() {
        let data = table(20);
        let p = ArParams {
            num_lags: 6,
            n_train: 3,
            ..params()
        };
        let (rows, _) = ar_method(&data, &["ca".to_string()], &p, &[]).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.predicted.is_finite()));
    }

    #[test]
    fn test_ar_method_preconditions() {
        let data = table(20);
        let geos = vec!["ca".to_string()];
        let bad = |p: ArParams| ar_method(&data, &geos, &p, &[]).unwrap_err();
        assert!(matches!(bad(ArParams { num_lags: 0, ..params() }), ArError::NoLags));
        assert!(matches!(
            bad(ArParams { n_train: 2, ..params() }),
            ArError::TooFewTrainingDays { .. }
        ));
        assert!(matches!(bad(ArParams { n_valid: 0, ..params() }), ArError::NoValidationDays));
        assert!(matches!(
            bad(ArParams { n_test: 30, ..params() }),
            ArError::NotEnoughDates { .. }
        ));
    }

    #[test]
    fn test_residual_csv_round_trip() {
        let data = table(20);
        let (rows, _) = ar_method(&data, &["ca".to_string()], &params(), &[]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resid.csv");
        write_residuals(&path, &rows).unwrap();
        let back = read_residuals(&path).unwrap();
        assert_eq!(back.len(), rows.len());
        assert_eq!(back[0].date, rows[0].date);
        assert_eq!(back[0].lags, 2);
    }

    fn window(resid: (u64, u64), eval: (u64, u64)) -> Window {
        Window::new(
            DateRange::new(day(0), day(39)).unwrap(),
            DateRange::new(day(resid.0), day(resid.1)).unwrap(),
            DateRange::new(day(eval.0), day(eval.1)).unwrap(),
            2,
            5,
        )
        .unwrap()
    }

    #[test]
    fn test_ar_results_shape() {
        let data = table(40);
        let w = window((20, 34), (35, 39));
        let out = ar_results(&data, &w, 2, 5).unwrap();
        assert_eq!(out.predictions.len(), 20);
        assert_eq!(out.predictions.geographies(), data.geographies());
        assert_eq!(out.residuals.first_date(), Some(day(20)));
    }

    #[test]
    fn test_ar_results_swapped_ranges() {
        let data = table(40);
        let w = window((30, 39), (15, 20));
        let out = ar_results(&data, &w, 2, 5).unwrap();
        assert_eq!(out.predictions.first_date(), Some(day(15)));
        assert_eq!(out.predictions.len(), 16);
    }

    #[test]
    fn test_ar_results_insufficient_history() {
        let data = table(40).slice_dates(DateRange::new(day(10), day(39)).unwrap());
        let w = window((12, 30), (31, 39));
        assert!(matches!(
            ar_results(&data, &w, 2, 5),
            Err(ArError::InsufficientHistory { .. })
        ));
        assert!(matches!(ar_results(&data, &w, 0, 5), Err(ArError::NoLags)));
        assert!(matches!(
            ar_results(&data, &w, 2, 1),
            Err(ArError::TooFewTrainingDays { .. })
        ));
    }

    #[test]
    fn test_ar_results_history_past_calendar() {
        let data = table(40);
        let w = window((20, 34), (35, 39));
        assert!(matches!(
            ar_results(&data, &w, 2, 100_000_000_000),
            Err(ArError::InsufficientHistory { required, .. }) if required == NaiveDate::MIN
        ));
        assert!(matches!(
            ar_results(&data, &w, usize::MAX, usize::MAX),
            Err(ArError::InsufficientHistory { .. })
        ));
    }

    #[test]
    fn test_report_flags_catch_eval_outlier() {
        let dates: Vec<NaiveDate> = (0..41).map(day).collect();
        let mut resid: Vec<Option<f64>> = (0..41).map(|i| Some(f64::from(i % 5) - 2.0)).collect();
        resid[40] = Some(50.0);
        let residuals = SeriesTable::new(dates, vec!["ca".into()], vec![resid]).unwrap();
        let w = Window::new(
            DateRange::new(day(0), day(40)).unwrap(),
            DateRange::new(day(10), day(39)).unwrap(),
            DateRange::new(day(40), day(40)).unwrap(),
            1,
            2,
        )
        .unwrap();
        let flags = calculate_report_flags(&residuals, &w, REPORT_THRESHOLD);
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].date, day(40));
        assert_eq!(flags[0].cdf, 1.0);
        assert_eq!(flags[0].to_flag("var", "num").kind, FlagKind::ArResidual);
    }
}
