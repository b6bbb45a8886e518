//! Checks that compare the exports with each other and with reference data.
//!
//! ## Architecture
//!
//! ```text
//! for each (geo_type, signal) known to the reference source:
//!     test rows ──► max-date lag bounds, missing values
//!     reference ──► spike scan (case/death count signals only)
//!     for each date of the window:
//!         reference slice before the date ──► max date, row count, average shift
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::NaiveDate;
use tracing::{debug, info};

use super::datafetcher::{GeoSignalFrames, Observation, ReferenceSource};
use super::errors::ValidationFailure;
use super::report::ValidationReport;
use super::time_window::TimeWindow;
use crate::config::ValidationParams;
use crate::stats::{mean, median, std_dev};
use crate::types::{shift_days, DateRange};

/// Signals scanned for positive and negative spikes.
pub const SPIKE_SIGNALS: [&str; 6] = [
    "confirmed_7dav_cumulative_num",
    "confirmed_7dav_incidence_num",
    "confirmed_cumulative_num",
    "confirmed_incidence_num",
    "deaths_7dav_cumulative_num",
    "deaths_cumulative_num",
];

/// Reference days before the first export used by the spike scan.
const OUTLIER_LOOKBEHIND: i64 = 14;
const SPIKE_WINDOW: usize = 14;
const SIZE_CUT: f64 = 5.0;
const SIG_CUT: f64 = 3.0;
const SIG_CONSEC: f64 = 2.25;
const STD_EPS: f64 = 1e-5;

const ROW_CHANGE_TOLERANCE: f64 = 0.35;
const MEAN_Z_THRESHOLD: f64 = 4.0;
const VAL_MEAN_Z_THRESHOLD: f64 = 3.5;
const MEAN_ABS_Z_THRESHOLD: f64 = 4.25;

const DEFAULT_MAX_LAG: u32 = 10;
const DEFAULT_MIN_LAG: u32 = 1;

#[derive(Debug, Clone)]
pub struct DynamicValidator {
    time_window: TimeWindow,
    generation_date: NaiveDate,
    max_check_lookbehind: u32,
    smoothed_signals: HashSet<String>,
    max_expected_lag: HashMap<String, u32>,
    min_expected_lag: HashMap<String, u32>,
    test_mode: bool,
}

impl DynamicValidator {
    pub fn new(params: &ValidationParams, time_window: TimeWindow, generation_date: NaiveDate) -> Self {
        let max_check_lookbehind = params
            .common
            .max_check_lookbehind
            .unwrap_or_else(|| params.dynamic.ref_window_size.max(7));
        Self {
            time_window,
            generation_date,
            max_check_lookbehind,
            smoothed_signals: params.dynamic.smoothed_signals.iter().cloned().collect(),
            max_expected_lag: params.common.max_expected_lag.clone(),
            min_expected_lag: params.common.min_expected_lag.clone(),
            test_mode: params.dynamic.test_mode,
        }
    }

    fn is_smoothed(&self, signal: &str) -> bool {
        self.smoothed_signals.contains(signal)
    }

    /// Reference days compared against each checking date.
    fn reference_days(&self, signal: &str) -> u32 {
        self.max_check_lookbehind
            .saturating_add(if self.is_smoothed(signal) { 7 } else { 0 })
    }

    fn max_lag(&self, signal: &str) -> i64 {
        i64::from(lag_for(&self.max_expected_lag, signal, DEFAULT_MAX_LAG))
    }

    fn min_lag(&self, signal: &str) -> i64 {
        i64::from(lag_for(&self.min_expected_lag, signal, DEFAULT_MIN_LAG))
    }

    pub fn validate(&self, frames: &GeoSignalFrames, source: &dyn ReferenceSource, report: &mut ValidationReport) {
        let combos = match source.geo_signal_combos() {
            Ok(combos) => combos,
            Err(e) => {
                report.add_raised_error(ValidationFailure::new("api_data_fetch_error", e.to_string()));
                report.increment_total_checks();
                return;
            }
        };
        info!(source = source.name(), combos = combos.len(), "Running dynamic checks");

        let empty = Vec::new();
        for (checked, (geo_type, signal)) in combos.iter().enumerate() {
            if self.test_mode && checked == 2 {
                break;
            }
            let test = frames.get(&(geo_type.clone(), signal.clone())).unwrap_or(&empty);
            self.check_combo(geo_type, signal, test, source, report);
        }
    }

    fn check_combo(
        &self,
        geo_type: &str,
        signal: &str,
        test: &[Observation],
        source: &dyn ReferenceSource,
        report: &mut ValidationReport,
    ) {
        report.increment_total_checks();
        let Some(max_date) = test.iter().map(|o| o.time_value).max() else {
            report.add_raised_error(ValidationFailure::for_combo(
                "check_missing_geo_sig_combo",
                geo_type,
                signal,
                "file with geo_type-signal combo does not exist",
            ));
            return;
        };

        self.check_min_allowed_max_date(max_date, geo_type, signal, report);
        self.check_max_allowed_max_date(max_date, geo_type, signal, report);
        self.check_na_vals(test, geo_type, signal, report);

        let lookback = OUTLIER_LOOKBEHIND.max(i64::from(self.reference_days(signal)));
        let fetch_range = DateRange {
            start: days_before(self.time_window.start_date, lookback),
            end: self.time_window.end_date,
        };
        report.increment_total_checks();
        let reference = match source.fetch(geo_type, signal, fetch_range) {
            Ok(reference) => reference,
            Err(e) => {
                report.add_raised_error(ValidationFailure::for_combo(
                    "api_data_fetch_error",
                    geo_type,
                    signal,
                    e.to_string(),
                ));
                return;
            }
        };
        debug!(geo_type, signal, test_rows = test.len(), reference_rows = reference.len(), "Comparing combo");

        if SPIKE_SIGNALS.contains(&signal) {
            let window = self.time_window.range();
            let source_rows: Vec<Observation> =
                test.iter().filter(|o| window.contains(o.time_value)).cloned().collect();
            let earliest = test.iter().map(|o| o.time_value).min().unwrap_or(max_date);
            let outlier_range = DateRange {
                start: days_before(earliest, OUTLIER_LOOKBEHIND),
                end: days_before(earliest, 1),
            };
            let outlier_reference: Vec<Observation> = reference
                .iter()
                .filter(|o| outlier_range.contains(o.time_value))
                .cloned()
                .collect();
            check_positive_negative_spikes(&source_rows, &outlier_reference, geo_type, signal, report);
        }

        for checking_date in self.time_window.date_seq() {
            let Some((recent, reference_slice)) =
                self.create_dfs(test, &reference, checking_date, geo_type, signal, report)
            else {
                continue;
            };
            check_max_date_vs_reference(&recent, &reference_slice, checking_date, geo_type, signal, report);
            check_rapid_change_num_rows(&recent, &reference_slice, checking_date, geo_type, signal, report);
            if !signal.contains("cumulative") {
                self.check_avg_val_vs_reference(&recent, &reference_slice, checking_date, geo_type, signal, report);
            }
        }
    }

    fn check_min_allowed_max_date(&self, max_date: NaiveDate, geo_type: &str, signal: &str, report: &mut ValidationReport) {
        if max_date < days_before(self.generation_date, self.max_lag(signal)) {
            report.add_raised_error(ValidationFailure::for_combo(
                "check_min_max_date",
                geo_type,
                signal,
                "date of most recent generated file seems too long ago",
            ));
        }
        report.increment_total_checks();
    }

    fn check_max_allowed_max_date(&self, max_date: NaiveDate, geo_type: &str, signal: &str, report: &mut ValidationReport) {
        if max_date > days_before(self.generation_date, self.min_lag(signal)) {
            report.add_raised_error(ValidationFailure::for_combo(
                "check_max_max_date",
                geo_type,
                signal,
                "date of most recent generated file seems too recent",
            ));
        }
        report.increment_total_checks();
    }

    /// Missing values inside the window. The first six days of each
    /// geography may be missing while a new geo id warms up.
    fn check_na_vals(&self, test: &[Observation], geo_type: &str, signal: &str, report: &mut ValidationReport) {
        let mut by_geo: BTreeMap<&str, Vec<&Observation>> = BTreeMap::new();
        for obs in test {
            by_geo.entry(obs.geo_id.as_str()).or_default().push(obs);
        }
        for (geo_id, rows) in by_geo {
            for obs in rows.iter().skip(6) {
                if obs.val.is_none() && obs.time_value >= self.time_window.start_date {
                    report.add_raised_error(ValidationFailure::for_date(
                        "check_val_missing",
                        obs.time_value,
                        geo_type,
                        signal,
                        format!("geo_id {geo_id}"),
                    ));
                }
            }
        }
        report.increment_total_checks();
    }

    /// Test rows on `checking_date` and the reference days before it.
    ///
    /// Reference days the source does not have yet are taken from the test
    /// rows themselves.
    fn create_dfs(
        &self,
        test: &[Observation],
        reference: &[Observation],
        checking_date: NaiveDate,
        geo_type: &str,
        signal: &str,
        report: &mut ValidationReport,
    ) -> Option<(Vec<Observation>, Vec<Observation>)> {
        report.increment_total_checks();
        let recent: Vec<Observation> = test.iter().filter(|o| o.time_value == checking_date).cloned().collect();
        if recent.is_empty() {
            if checking_date < days_before(self.generation_date, self.max_lag(signal)) {
                report.add_raised_error(ValidationFailure::for_date(
                    "check_missing_geo_sig_date_combo",
                    checking_date,
                    geo_type,
                    signal,
                    "test data for a given checking date-geo type-signal type combination is missing. \
                     Source data may be missing for one or more dates",
                ));
            }
            return None;
        }

        let reference_range = DateRange {
            start: days_before(checking_date, i64::from(self.reference_days(signal))),
            end: days_before(checking_date, 1),
        };
        let mut reference_slice: Vec<Observation> = reference
            .iter()
            .filter(|o| reference_range.contains(o.time_value))
            .cloned()
            .collect();

        report.increment_total_checks();
        let Some(reference_max) = reference_slice.iter().map(|o| o.time_value).max() else {
            report.add_raised_error(ValidationFailure::for_date(
                "empty_reference_data",
                checking_date,
                geo_type,
                signal,
                "reference data is empty; comparative checks could not be performed",
            ));
            return None;
        };

        if reference_max < reference_range.end {
            reference_slice.extend(
                test.iter()
                    .filter(|o| o.time_value > reference_max && o.time_value <= reference_range.end)
                    .cloned(),
            );
        }
        Some((recent, reference_slice))
    }

    /// Mean z-scores of the test rows against per-geography reference
    /// statistics, for `val`, `se` and `sample_size`.
    fn check_avg_val_vs_reference(
        &self,
        recent: &[Observation],
        reference: &[Observation],
        checking_date: NaiveDate,
        geo_type: &str,
        signal: &str,
        report: &mut ValidationReport,
    ) {
        let required = self.reference_days(signal) as usize;
        let variables: [(&str, fn(&Observation) -> Option<f64>); 3] = [
            ("val", |o| o.val),
            ("se", |o| o.se),
            ("sample_size", |o| o.sample_size),
        ];

        let mut high = false;
        for (variable, get) in variables {
            let stats = reference_stats(reference, get);

            let mut z_by_geo: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
            for obs in recent {
                let Some(stat) = stats.get(obs.geo_id.as_str()) else { continue };
                let (Some(value), Some(mean), Some(sd)) = (get(obs), stat.mean, stat.sd) else {
                    continue;
                };
                if stat.count != required {
                    continue;
                }
                let z = (value - mean) / sd;
                if z.is_finite() {
                    z_by_geo.entry(obs.geo_id.as_str()).or_default().push(z);
                }
            }
            if z_by_geo.is_empty() {
                continue;
            }

            let geo_z: Vec<f64> = z_by_geo.values().filter_map(|z| mean(z)).collect();
            let geo_abs_z: Vec<f64> = z_by_geo
                .values()
                .filter_map(|z| mean(&z.iter().map(|v| v.abs()).collect::<Vec<_>>()))
                .collect();
            let mean_z = mean(&geo_z).unwrap_or(0.0);
            let mean_abs_z = mean(&geo_abs_z).unwrap_or(0.0);

            let z_limit = if variable == "val" {
                VAL_MEAN_Z_THRESHOLD
            } else {
                MEAN_Z_THRESHOLD
            };
            if mean_z.abs() > z_limit || mean_abs_z > MEAN_ABS_Z_THRESHOLD {
                debug!(geo_type, signal, variable, mean_z, mean_abs_z, "Average shifted");
                high = true;
            }
        }

        if high {
            report.add_raised_warning(ValidationFailure::for_date(
                "check_test_vs_reference_avg_changed",
                checking_date,
                geo_type,
                signal,
                "Average differences in variables by geo_id between recent & reference data seem large \
                 --- either large increase tending toward one direction or large mean absolute difference, \
                 relative to average values of corresponding variables. For the former check, tolerances \
                 for `val` are more restrictive than those for other columns.",
            ));
        }
        report.increment_total_checks();
    }
}

fn lag_for(lags: &HashMap<String, u32>, signal: &str, default: u32) -> u32 {
    lags.get(signal)
        .or_else(|| lags.get("all"))
        .copied()
        .unwrap_or(default)
}

/// `days` before `date`, pinned to the first representable date.
fn days_before(date: NaiveDate, days: i64) -> NaiveDate {
    shift_days(date, -days).unwrap_or(NaiveDate::MIN)
}

#[derive(Debug, Clone, Copy)]
struct ReferenceStat {
    mean: Option<f64>,
    sd: Option<f64>,
    count: usize,
}

/// Per-geography mean, standard deviation and count of one variable.
/// Zero deviations are replaced by the median of the positive ones.
fn reference_stats<'a>(
    reference: &'a [Observation],
    get: fn(&Observation) -> Option<f64>,
) -> HashMap<&'a str, ReferenceStat> {
    let mut values: HashMap<&str, Vec<f64>> = HashMap::new();
    for obs in reference {
        let entry = values.entry(obs.geo_id.as_str()).or_default();
        if let Some(v) = get(obs) {
            entry.push(v);
        }
    }

    let mut stats: HashMap<&str, ReferenceStat> = values
        .iter()
        .map(|(geo, v)| {
            let sd = std_dev(v).map(|sd| (sd * 1e8).round() / 1e8);
            (
                *geo,
                ReferenceStat {
                    mean: mean(v),
                    sd,
                    count: v.len(),
                },
            )
        })
        .collect();

    let positive: Vec<f64> = stats.values().filter_map(|s| s.sd).filter(|sd| *sd > 0.0).collect();
    let replacement = median(&positive);
    for stat in stats.values_mut() {
        if stat.sd == Some(0.0) {
            stat.sd = replacement;
        }
    }
    stats
}

fn check_max_date_vs_reference(
    recent: &[Observation],
    reference: &[Observation],
    checking_date: NaiveDate,
    geo_type: &str,
    signal: &str,
    report: &mut ValidationReport,
) {
    let test_max = recent.iter().map(|o| o.time_value).max();
    let reference_max = reference.iter().map(|o| o.time_value).max();
    if test_max < reference_max {
        report.add_raised_error(ValidationFailure::for_date(
            "check_max_date_vs_reference",
            checking_date,
            geo_type,
            signal,
            "reference df has days beyond the max date in the =df_to_test=",
        ));
    }
    report.increment_total_checks();
}

/// `(x - y) / min(x, y)`.
pub fn relative_difference_by_min(x: f64, y: f64) -> f64 {
    (x - y) / x.min(y)
}

fn check_rapid_change_num_rows(
    recent: &[Observation],
    reference: &[Observation],
    checking_date: NaiveDate,
    geo_type: &str,
    signal: &str,
    report: &mut ValidationReport,
) {
    let test_rows = recent.len() as f64;
    let reference_dates: HashSet<NaiveDate> = reference.iter().map(|o| o.time_value).collect();
    let reference_rows = reference.len() as f64 / reference_dates.len().max(1) as f64;

    if relative_difference_by_min(test_rows, reference_rows).abs() > ROW_CHANGE_TOLERANCE {
        report.add_raised_error(ValidationFailure::for_date(
            "check_rapid_change_num_rows",
            checking_date,
            geo_type,
            signal,
            "Number of rows per day seems to have changed rapidly (reference vs test data)",
        ));
    }
    report.increment_total_checks();
}

// ============================================================================
// Spike scan
// ============================================================================

/// One row of the spike scan with its two rolling t-statistics.
#[derive(Debug, Clone)]
struct Scored {
    time_value: NaiveDate,
    val: f64,
    /// Against the trailing 14-day window.
    ftstat: f64,
    /// Against the centred 14-day window.
    ststat: f64,
}

impl Scored {
    fn is_outlier(&self) -> bool {
        let big = self.val.abs() > SIZE_CUT;
        (big && !self.ststat.is_nan() && self.ststat > SIG_CUT)
            || (big && self.ststat.is_nan() && !self.ftstat.is_nan() && self.ftstat > SIG_CUT)
            || (self.val < -SIZE_CUT && !self.ststat.is_nan() && !self.ftstat.is_nan())
    }

    fn is_near_outlier(&self) -> bool {
        if self.ststat.is_nan() {
            self.ftstat > SIG_CONSEC
        } else {
            self.ststat > SIG_CONSEC
        }
    }
}

/// Median and deviation of `vals[start..start + SPIKE_WINDOW]`, `None`
/// when the window leaves the series or holds a missing value.
fn window_stats(vals: &[f64], start: Option<usize>) -> Option<(f64, f64)> {
    let start = start?;
    let window = vals.get(start..start + SPIKE_WINDOW)?;
    if window.iter().any(|v| v.is_nan()) {
        return None;
    }
    Some((median(window)?, std_dev(window)?))
}

fn tstat(val: f64, stats: Option<(f64, f64)>) -> f64 {
    match stats {
        Some((median, sd)) => (val - median).abs() / (sd + STD_EPS),
        None => f64::NAN,
    }
}

/// Score every row of one geography, in date order.
fn score_geography(rows: &[&Observation]) -> Vec<Scored> {
    let vals: Vec<f64> = rows.iter().map(|o| o.val.unwrap_or(f64::NAN)).collect();
    let half = SPIKE_WINDOW / 2;
    rows.iter()
        .enumerate()
        .map(|(i, obs)| {
            // Trailing window ends at i; the centred one spans i-6..=i+7.
            let trailing = window_stats(&vals, (i + 1).checked_sub(SPIKE_WINDOW));
            let centred = window_stats(&vals, (i + 1).checked_sub(half));
            Scored {
                time_value: obs.time_value,
                val: vals[i],
                ftstat: tstat(vals[i], trailing),
                ststat: tstat(vals[i], centred),
            }
        })
        .collect()
}

/// Warn on every export date holding a value far from both its trailing and
/// centred 14-day medians, or next to such a value.
fn check_positive_negative_spikes(
    source: &[Observation],
    reference: &[Observation],
    geo_type: &str,
    signal: &str,
    report: &mut ValidationReport,
) {
    report.increment_total_checks();
    let (Some(source_start), Some(source_end)) = (
        source.iter().map(|o| o.time_value).min(),
        source.iter().map(|o| o.time_value).max(),
    ) else {
        return;
    };

    // Export rows replace reference rows for the same geography and day.
    let mut merged: BTreeMap<(&str, NaiveDate), &Observation> = BTreeMap::new();
    for obs in reference.iter().chain(source) {
        merged.insert((obs.geo_id.as_str(), obs.time_value), obs);
    }
    let mut by_geo: BTreeMap<&str, Vec<&Observation>> = BTreeMap::new();
    for ((geo_id, _), obs) in merged {
        by_geo.entry(geo_id).or_default().push(obs);
    }

    let day_before = days_before(source_start, 1);
    let scan_start = reference
        .iter()
        .map(|o| o.time_value)
        .max()
        .map_or(day_before, |max| max.min(day_before));
    let scan = DateRange {
        start: scan_start,
        end: source_end,
    };

    let mut flagged: BTreeMap<NaiveDate, BTreeSet<&str>> = BTreeMap::new();
    for (geo_id, rows) in &by_geo {
        let scored: Vec<Scored> = score_geography(rows)
            .into_iter()
            .filter(|s| scan.contains(s.time_value))
            .collect();
        for (i, row) in scored.iter().enumerate() {
            if !row.is_outlier() {
                continue;
            }
            flagged.entry(row.time_value).or_default().insert(*geo_id);
            let neighbours = [i.checked_sub(1), Some(i + 1)];
            for j in neighbours.into_iter().flatten() {
                if let Some(next) = scored.get(j).filter(|n| n.is_near_outlier()) {
                    flagged.entry(next.time_value).or_default().insert(*geo_id);
                }
            }
        }
    }

    let source_range = DateRange {
        start: source_start,
        end: source_end,
    };
    for (date, geo_ids) in flagged.into_iter().filter(|(d, _)| source_range.contains(*d)) {
        let geo_ids: Vec<&str> = geo_ids.into_iter().collect();
        report.add_raised_warning(ValidationFailure::for_date(
            "check_positive_negative_spikes",
            date,
            geo_type,
            signal,
            format!(
                "Source dates with flagged outliers based on the previous 14 days of data available (geo_id {})",
                geo_ids.join(", ")
            ),
        ));
    }
}
