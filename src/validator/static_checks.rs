//! Checks on each export file by itself.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;

use super::datafetcher::{ExportListing, ExportRow, LoadedFile};
use super::errors::ValidationFailure;
use super::report::ValidationReport;
use super::time_window::TimeWindow;
use crate::config::StaticParams;

/// Lag assumed when `max_expected_lag` is empty.
pub const DEFAULT_MAX_EXPECTED_LAG: u32 = 10;

const GEO_PATTERNS: [(&str, &str); 7] = [
    ("county", r"^\d{5}$"),
    ("hrr", r"^\d{1,3}$"),
    ("hhs", r"^\d{1,2}$"),
    ("msa", r"^\d{5}$"),
    ("dma", r"^\d{3}$"),
    ("state", r"^[a-zA-Z]{2}$"),
    ("nation", r"^[a-zA-Z]{2}$"),
];

/// Geo types whose ids are numeric codes.
const NUMERIC_GEO_TYPES: [&str; 4] = ["msa", "county", "hrr", "dma"];

fn geo_regex(geo_type: &str) -> Option<&'static Regex> {
    static TABLE: OnceLock<HashMap<&'static str, Regex>> = OnceLock::new();
    TABLE
        .get_or_init(|| {
            GEO_PATTERNS
                .iter()
                .filter_map(|(geo, pattern)| Regex::new(pattern).ok().map(|re| (*geo, re)))
                .collect()
        })
        .get(geo_type)
}

/// Width numeric ids are zero-padded to.
fn fill_len(geo_type: &str) -> Option<usize> {
    match geo_type {
        "msa" | "county" => Some(5),
        "dma" => Some(3),
        _ => None,
    }
}

/// Format and value checks on every loaded export file.
#[derive(Debug, Clone)]
pub struct StaticValidator {
    params: StaticParams,
    time_window: TimeWindow,
    max_expected_lag: HashMap<String, u32>,
}

impl StaticValidator {
    pub fn new(params: StaticParams, time_window: TimeWindow, max_expected_lag: HashMap<String, u32>) -> Self {
        Self {
            params,
            time_window,
            max_expected_lag,
        }
    }

    pub fn validate(&self, listing: &ExportListing, today: NaiveDate, report: &mut ValidationReport) {
        self.check_missing_date_files(&listing.files, today, report);

        for filename in &listing.unrecognized {
            report.add_raised_error(ValidationFailure::new(
                "check_filename_format",
                format!("nameformat not recognized: {filename}"),
            ));
            report.increment_total_checks();
        }

        for file in &listing.files {
            // Loaded files matched the export pattern when listed.
            report.increment_total_checks();

            let rows = match &file.data {
                Ok(rows) => rows,
                Err(e) => {
                    report.add_raised_error(file_failure(
                        file,
                        "check_file_data_format",
                        format!("expected an export table with geo_id, val, se, sample_size: {e}"),
                    ));
                    report.increment_total_checks();
                    continue;
                }
            };
            report.increment_total_checks();

            check_duplicate_rows(file, rows, report);
            self.check_bad_geo_id_format(file, rows, report);
            check_bad_val(file, rows, report);
            self.check_bad_se(file, rows, report);
            self.check_bad_sample_size(file, rows, report);
        }
    }

    /// Dates of the window old enough that their file must exist.
    fn check_missing_date_files(&self, files: &[LoadedFile], today: NaiveDate, report: &mut ValidationReport) {
        let seen: HashSet<NaiveDate> = files.iter().map(|f| f.name.date).collect();
        let max_lag = self
            .max_expected_lag
            .values()
            .copied()
            .max()
            .unwrap_or(DEFAULT_MAX_EXPECTED_LAG);

        let missing: Vec<NaiveDate> = self
            .time_window
            .date_seq()
            .into_iter()
            .filter(|d| (today - *d).num_days() > i64::from(max_lag))
            .filter(|d| !seen.contains(d))
            .collect();

        if !missing.is_empty() {
            tracing::debug!(?missing, "Export dates missing from the window");
            report.add_raised_error(ValidationFailure::new(
                "check_missing_date_files",
                "Missing dates are observed; if these dates are already in the API they would not be updated",
            ));
        }
        report.increment_total_checks();
    }

    fn check_bad_geo_id_format(&self, file: &LoadedFile, rows: &[ExportRow], report: &mut ValidationReport) {
        let geo_type = file.name.geo_type.as_str();
        let Some(re) = geo_regex(geo_type) else {
            report.add_raised_error(file_failure(
                file,
                "check_geo_type",
                format!("Unrecognized geo type {geo_type}"),
            ));
            report.increment_total_checks();
            return;
        };

        let mut ids: Vec<String> = rows.iter().map(|r| r.geo_id.clone()).collect();

        if NUMERIC_GEO_TYPES.contains(&geo_type) {
            let saved_as_float = ids
                .iter()
                .any(|id| id.split_once('.').is_some_and(|(head, _)| re.is_match(head)));
            if saved_as_float {
                report.add_raised_warning(file_failure(
                    file,
                    "check_geo_id_type",
                    "geo_ids saved as floats; strings preferred",
                ));
                for id in &mut ids {
                    if let Some((head, _)) = id.split_once('.') {
                        *id = head.to_string();
                    }
                }
            }
        }

        if let Some(width) = fill_len(geo_type) {
            for id in &mut ids {
                *id = format!("{id:0>width$}");
            }
        }

        let extra: HashSet<&str> = self
            .params
            .additional_valid_geo_values
            .get(geo_type)
            .map(|v| v.iter().map(String::as_str).collect())
            .unwrap_or_default();

        let unexpected: BTreeSet<&str> = ids
            .iter()
            .map(String::as_str)
            .filter(|id| !re.is_match(id) && !extra.contains(id))
            .collect();
        if !unexpected.is_empty() {
            report.add_raised_error(file_failure(
                file,
                "check_geo_id_format",
                format!("Non-conforming geo_ids {unexpected:?} found"),
            ));
        }
        report.increment_total_checks();

        let upper_case: Vec<&str> = rows
            .iter()
            .map(|r| r.geo_id.as_str())
            .filter(|id| id.to_lowercase() != *id)
            .collect();
        if !upper_case.is_empty() {
            report.add_raised_warning(file_failure(
                file,
                "check_geo_id_lowercase",
                format!("geo_ids {upper_case:?} contains uppercase characters. Lowercase is preferred."),
            ));
        }
        report.increment_total_checks();
    }

    fn check_bad_se(&self, file: &LoadedFile, rows: &[ExportRow], report: &mut ValidationReport) {
        if self.params.missing_se_allowed {
            if rows.iter().any(|r| r.se.is_some_and(|se| se < 0.0)) {
                report.add_raised_error(file_failure(
                    file,
                    "check_se_missing_or_in_range",
                    "se must be NA or non-negative",
                ));
            }
            report.increment_total_checks();
        } else {
            if rows.iter().any(|r| !r.se.is_some_and(|se| se >= 0.0)) {
                report.add_raised_error(file_failure(
                    file,
                    "check_se_not_missing_and_in_range",
                    "se must be non-negative and not missing",
                ));
            }
            report.increment_total_checks();

            let missing = rows.iter().filter(|r| r.se.is_none()).count();
            if !rows.is_empty() && missing * 2 > rows.len() {
                report.add_raised_error(file_failure(
                    file,
                    "check_se_many_missing",
                    "Recent se values are >50% NA",
                ));
            }
            report.increment_total_checks();
        }

        let zero_se_zero_val = rows.iter().any(|r| r.se == Some(0.0) && r.val == Some(0.0));
        let zero_se = rows.iter().any(|r| r.se == Some(0.0));
        if zero_se_zero_val {
            report.add_raised_error(file_failure(
                file,
                "check_se_0_when_val_0",
                "when signal value is 0, se must be non-zero. please use Jeffreys correction to \
                 generate an appropriate se (see wikipedia.org/wiki/Binomial_proportion_confidence\
                 _interval#Jeffreys_interval for details)",
            ));
        } else if zero_se {
            report.add_raised_error(file_failure(file, "check_se_0", "se must be non-zero"));
        }
        report.increment_total_checks();
    }

    fn check_bad_sample_size(&self, file: &LoadedFile, rows: &[ExportRow], report: &mut ValidationReport) {
        let minimum = self.params.minimum_sample_size;
        let below_min = rows.iter().any(|r| r.sample_size.is_some_and(|n| n < minimum));

        if self.params.missing_sample_size_allowed {
            if below_min {
                report.add_raised_error(file_failure(
                    file,
                    "check_n_missing_or_gt_min",
                    format!("sample size must be NA or >= {minimum}"),
                ));
            }
            report.increment_total_checks();
        } else {
            if rows.iter().any(|r| r.sample_size.is_none()) {
                report.add_raised_error(file_failure(file, "check_n_missing", "sample_size must not be NA"));
            }
            report.increment_total_checks();

            if below_min {
                report.add_raised_error(file_failure(
                    file,
                    "check_n_gt_min",
                    format!("sample size must be >= {minimum}"),
                ));
            }
            report.increment_total_checks();
        }
    }
}

fn file_failure(file: &LoadedFile, check_name: &str, message: impl Into<String>) -> ValidationFailure {
    ValidationFailure::for_date(
        check_name,
        file.name.date,
        &file.name.geo_type,
        &file.name.signal,
        message,
    )
}

fn check_duplicate_rows(file: &LoadedFile, rows: &[ExportRow], report: &mut ValidationReport) {
    let bits = |v: Option<f64>| v.map(f64::to_bits);
    let mut seen = HashSet::with_capacity(rows.len());
    let duplicated = rows
        .iter()
        .any(|r| !seen.insert((r.geo_id.as_str(), bits(r.val), bits(r.se), bits(r.sample_size))));
    if duplicated {
        report.add_raised_warning(file_failure(
            file,
            "check_duplicate_rows",
            "Some rows are duplicated, which may indicate data integrity issues",
        ));
    }
    report.increment_total_checks();
}

/// Range checks on `val`; `pct` and `prop` signals get an upper bound.
fn check_bad_val(file: &LoadedFile, rows: &[ExportRow], report: &mut ValidationReport) {
    let signal = file.name.signal.as_str();
    let any_val = |pred: &dyn Fn(f64) -> bool| rows.iter().any(|r| r.val.is_some_and(pred));

    if signal.contains("pct") {
        if any_val(&|v| v > 100.0) {
            report.add_raised_error(file_failure(
                file,
                "check_val_pct_gt_100",
                "val column can't have any cell greater than 100 for percents",
            ));
        }
        report.increment_total_checks();
    }

    if signal.contains("prop") {
        if any_val(&|v| v > 100_000.0) {
            report.add_raised_error(file_failure(
                file,
                "check_val_prop_gt_100k",
                "val column can't have any cell greater than 100000 for proportions",
            ));
        }
        report.increment_total_checks();
    }

    if any_val(&|v| v < 0.0) {
        report.add_raised_error(file_failure(
            file,
            "check_val_lt_0",
            "val column can't have any cell smaller than 0",
        ));
    }
    report.increment_total_checks();
}
