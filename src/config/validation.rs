//! Params validation: unknown-key detection with Levenshtein suggestions
//! and range checks.
//!
//! Two-pass parse: the raw document is walked as a `serde_json::Value`
//! (TOML files are converted first), every dotted key path is compared
//! against the known ones and typos get a "did you mean" suggestion. The
//! typed pass follows. Unknown keys never break a params file.

use std::collections::HashSet;

use super::Params;

/// Longest day count any params value may span: a century of history.
pub const MAX_SPAN_DAYS: u64 = 36_500;

/// A non-fatal params warning (typo, suspicious value).
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, ", did you mean '{s}'?")?;
        }
        Ok(())
    }
}

// ============================================================================
// Known Keys
// ============================================================================

const FLAG_JOB_KEYS: &[&str] = &[
    "n_train",
    "ar_lags",
    "df_start_date",
    "df_end_date",
    "resid_start_date",
    "resid_end_date",
    "eval_start_date",
    "eval_end_date",
    "input_dir",
    "output_dir",
    "lags",
    "raw_df",
    "sig_fold",
    "sig_str",
    "sig_type",
    "remote",
    "flagger_type",
    "lambda_grid",
    "num_threads",
    "lock_cache",
];

const FLAG_META_KEYS: &[&str] = &[
    "n_train",
    "ar_lags",
    "output_dir",
    "flagger_type",
    "remote",
    "lambda_grid",
    "num_threads",
    "lock_cache",
];

/// Keys whose children are free-form (signal names, geo types) or owned
/// by other tools sharing the params file.
const OPEN_KEYS: &[&str] = &[
    "indicator",
    "archive",
    "validation.common.suppressed_errors",
    "validation.common.max_expected_lag",
    "validation.common.min_expected_lag",
    "validation.static.additional_valid_geo_values",
];

/// Every valid dotted key path.
///
/// Maintained by hand to match the structs in `params.rs`.
pub fn known_config_keys() -> HashSet<String> {
    let mut keys: Vec<String> = [
        "common",
        "common.export_dir",
        "common.log_filename",
        "common.log_format",
        "flagging",
        "flagging_meta",
        "validation",
        "validation.common",
        "validation.common.data_source",
        "validation.common.span_length",
        "validation.common.end_date",
        "validation.common.suppressed_errors",
        "validation.common.max_expected_lag",
        "validation.common.min_expected_lag",
        "validation.common.max_check_lookbehind",
        "validation.common.dry_run",
        "validation.static",
        "validation.static.minimum_sample_size",
        "validation.static.missing_se_allowed",
        "validation.static.missing_sample_size_allowed",
        "validation.static.additional_valid_geo_values",
        "validation.dynamic",
        "validation.dynamic.ref_window_size",
        "validation.dynamic.smoothed_signals",
        "validation.dynamic.reference_dir",
        "validation.dynamic.test_mode",
    ]
    .iter()
    .map(|k| (*k).to_string())
    .collect();
    keys.extend(FLAG_JOB_KEYS.iter().map(|k| format!("flagging.{k}")));
    keys.extend(FLAG_META_KEYS.iter().map(|k| format!("flagging_meta.{k}")));
    keys.extend(OPEN_KEYS.iter().map(|k| (*k).to_string()));
    keys.into_iter().collect()
}

// ============================================================================
// Key Walking
// ============================================================================

/// Recursively collect dotted key paths.
///
/// Objects inside arrays are walked under the array's own path, so a
/// `flagging` list yields `flagging.n_train` once per distinct key. Keys in
/// [`OPEN_KEYS`] are reported but not descended into.
pub fn walk_keys(value: &serde_json::Value, prefix: &str) -> Vec<String> {
    let mut keys = Vec::new();
    match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                let path = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                if !keys.contains(&path) {
                    keys.push(path.clone());
                }
                if OPEN_KEYS.contains(&path.as_str()) {
                    continue;
                }
                for child in walk_keys(v, &path) {
                    if !keys.contains(&child) {
                        keys.push(child);
                    }
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                for child in walk_keys(item, prefix) {
                    if !keys.contains(&child) {
                        keys.push(child);
                    }
                }
            }
        }
        _ => {}
    }
    keys
}

// ============================================================================
// Levenshtein Distance
// ============================================================================

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Suggest the closest known key for an unknown key, if within edit distance 3.
pub fn suggest_correction(unknown: &str, known: &HashSet<String>) -> Option<String> {
    let mut best: Option<(&str, usize)> = None;
    for k in known {
        let dist = levenshtein(unknown, k);
        if dist > 3 {
            continue;
        }
        // Ties go to the lexically smaller key so output is stable
        let better = match best {
            None => true,
            Some((b, best_dist)) => dist < best_dist || (dist == best_dist && k.as_str() < b),
        };
        if better {
            best = Some((k, dist));
        }
    }
    best.map(|(k, _)| k.to_string())
}

// ============================================================================
// Unknown Key Validation (entry point)
// ============================================================================

/// Warnings for every key of `value` that no params struct reads.
pub fn validate_unknown_keys(value: &serde_json::Value) -> Vec<ValidationWarning> {
    let known = known_config_keys();
    walk_keys(value, "")
        .into_iter()
        .filter(|key| !known.contains(key))
        .map(|key| ValidationWarning {
            suggestion: suggest_correction(&key, &known),
            message: format!("Unknown params key '{key}'"),
            field: key,
        })
        .collect()
}

// ============================================================================
// Range Validation
// ============================================================================

/// Check values the typed pass cannot reject on its own.
///
/// Returns (errors, warnings): errors are values no run can use,
/// warnings are legal but likely mistakes.
pub fn validate_ranges(params: &Params) -> (Vec<String>, Vec<ValidationWarning>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let meta = params.flagging_meta.as_ref();
    if let Some(section) = &params.flagging {
        for (i, job) in section.jobs().iter().enumerate() {
            let n_train = job.n_train.or_else(|| meta.and_then(|m| m.n_train));
            let ar_lags = job.ar_lags.or_else(|| meta.and_then(|m| m.ar_lags));
            let grid = job
                .lambda_grid
                .as_ref()
                .or_else(|| meta.and_then(|m| m.lambda_grid.as_ref()));
            let threads = job.num_threads.or_else(|| meta.and_then(|m| m.num_threads));

            if let Some(n) = n_train.filter(|n| *n < 2) {
                errors.push(format!(
                    "flagging[{i}].n_train = {n}: number of samples to train on must be at least 2"
                ));
            }
            if ar_lags == Some(0) {
                errors.push(format!("flagging[{i}].ar_lags = 0: need at least 1 lag for the AR model"));
            }
            if let (Some(n), Some(k)) = (n_train, ar_lags) {
                if k > n {
                    warnings.push(ValidationWarning {
                        field: format!("flagging[{i}].ar_lags"),
                        message: format!(
                            "ar_lags = {k} exceeds n_train = {n}; the AR fit is underdetermined"
                        ),
                        suggestion: None,
                    });
                }
            }
            if let Some(grid) = grid {
                if grid.is_empty() {
                    errors.push(format!("flagging[{i}].lambda_grid must not be empty"));
                }
                if grid.iter().any(|l| !l.is_finite() || *l < 0.0) {
                    errors.push(format!(
                        "flagging[{i}].lambda_grid values must be finite and non-negative"
                    ));
                }
            }
            if threads == Some(0) {
                errors.push(format!("flagging[{i}].num_threads must be at least 1"));
            }
            for (name, value) in [("n_train", n_train), ("ar_lags", ar_lags)] {
                if let Some(v) = value {
                    check_span(&format!("flagging[{i}].{name}"), v as u64, &mut errors);
                }
            }
            for lag in &job.lags {
                check_span(&format!("flagging[{i}].lags"), u64::from(lag.days()), &mut errors);
            }
        }
    }

    if let Some(validation) = &params.validation {
        if let Some(span) = validation.common.span_length {
            if span > 365 {
                warnings.push(ValidationWarning {
                    field: "validation.common.span_length".to_string(),
                    message: format!("span_length = {span} days loads more than a year of exports"),
                    suggestion: None,
                });
            }
            check_span("validation.common.span_length", u64::from(span), &mut errors);
        }
        if let Some(back) = validation.common.end_date.trim().strip_prefix("today-") {
            if let Ok(days) = back.parse::<u64>() {
                check_span("validation.common.end_date", days, &mut errors);
            }
        }
        if let Some(lookbehind) = validation.common.max_check_lookbehind {
            check_span("validation.common.max_check_lookbehind", u64::from(lookbehind), &mut errors);
        }
        for (section, lags) in [
            ("max_expected_lag", &validation.common.max_expected_lag),
            ("min_expected_lag", &validation.common.min_expected_lag),
        ] {
            for (signal, days) in lags {
                check_span(&format!("validation.common.{section}.{signal}"), u64::from(*days), &mut errors);
            }
        }
        check_span(
            "validation.dynamic.ref_window_size",
            u64::from(validation.dynamic.ref_window_size),
            &mut errors,
        );
        let min_n = validation.static_checks.minimum_sample_size;
        if !min_n.is_finite() || min_n < 0.0 {
            errors.push(format!(
                "validation.static.minimum_sample_size = {min_n} must be a non-negative number"
            ));
        }
        if validation.dynamic.ref_window_size < 7 {
            warnings.push(ValidationWarning {
                field: "validation.dynamic.ref_window_size".to_string(),
                message: format!(
                    "ref_window_size = {} is below 7; seven reference days are used",
                    validation.dynamic.ref_window_size
                ),
                suggestion: None,
            });
        }
    }

    (errors, warnings)
}

fn check_span(field: &str, days: u64, errors: &mut Vec<String>) {
    if days > MAX_SPAN_DAYS {
        errors.push(format!("{field} = {days} exceeds the {MAX_SPAN_DAYS}-day limit"));
    }
}

// ============================================================================
// Tests
// ============================================================================
