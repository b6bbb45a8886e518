//! Config Validation Tests
//!
//! Typo detection on the raw params tree and range checks on the typed
//! params, exercised independently from flagging and validation.

use serde_json::json;

use epiflag::config::validation::{
    known_config_keys, suggest_correction, validate_ranges, validate_unknown_keys,
};
use epiflag::config::{ConfigError, FlaggerType, LagWindow, ParamsFormat};
use epiflag::Params;

fn parse(value: &serde_json::Value) -> Result<Params, ConfigError> {
    Params::from_str_with_format(&value.to_string(), ParamsFormat::Json)
}

fn flag_job() -> serde_json::Value {
    json!({
        "n_train": 10,
        "ar_lags": 2,
        "sig_fold": "chng",
        "sig_str": "covid",
        "raw_df": "raw.csv",
        "output_dir": "cache",
        "lags": [1, "var"]
    })
}

// ============================================================================
// Typo Detection
// ============================================================================

#[test]
fn typo_in_flagging_key_warns_with_suggestion() {
    let mut job = flag_job();
    job["n_trian"] = json!(10);
    let warnings = validate_unknown_keys(&json!({ "flagging": job }));
    assert_eq!(warnings.len(), 1, "Expected exactly 1 warning");
    assert_eq!(warnings[0].field, "flagging.n_trian");
    assert_eq!(warnings[0].suggestion.as_deref(), Some("flagging.n_train"));
}

#[test]
fn typo_in_validation_section_warns() {
    let doc = json!({
        "validation": {"common": {"span_lenght": 14}}
    });
    let warnings = validate_unknown_keys(&doc);
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].field.contains("span_lenght"));
    assert_eq!(
        warnings[0].suggestion.as_deref(),
        Some("validation.common.span_length")
    );
}

#[test]
fn valid_params_produce_zero_warnings() {
    let doc = json!({
        "common": {"export_dir": "receiving", "log_format": "json"},
        "flagging_meta": {"n_train": 10, "flagger_type": "flagger_io"},
        "flagging": [flag_job(), flag_job()],
        "validation": {
            "common": {
                "data_source": "chng",
                "span_length": 14,
                "end_date": "today",
                "suppressed_errors": [{"check_name": "check_val_missing"}],
                "max_expected_lag": {"all": 3, "covid": 4}
            },
            "static": {"minimum_sample_size": 100, "missing_se_allowed": true},
            "dynamic": {"ref_window_size": 7, "smoothed_signals": ["covid_7dav"]}
        }
    });
    let warnings = validate_unknown_keys(&doc);
    assert!(
        warnings.is_empty(),
        "Valid params should produce 0 warnings, got: {:?}",
        warnings.iter().map(|w| &w.field).collect::<Vec<_>>()
    );
}

#[test]
fn open_sections_are_not_descended() {
    let doc = json!({
        "indicator": {"anything": {"goes": 1}},
        "validation": {"common": {"max_expected_lag": {"some_new_signal": 2}}}
    });
    assert!(validate_unknown_keys(&doc).is_empty());
}

#[test]
fn unknown_section_warns() {
    let doc = json!({"smoothing": {"window": 7}});
    let warnings = validate_unknown_keys(&doc);
    assert!(warnings.iter().any(|w| w.field == "smoothing"));
}

#[test]
fn multiple_typos_all_warned() {
    let mut job = flag_job();
    job["sig_fodl"] = json!("chng");
    let doc = json!({
        "flagging": job,
        "common": {"export_dri": "receiving"}
    });
    let warnings = validate_unknown_keys(&doc);
    assert_eq!(
        warnings.len(),
        2,
        "Expected 2 warnings for 2 typos, got {}",
        warnings.len()
    );
}

#[test]
fn empty_document_produces_zero_warnings() {
    assert!(validate_unknown_keys(&json!({})).is_empty());
}

#[test]
fn suggest_correction_finds_close_match() {
    let known = known_config_keys();
    let s = suggest_correction("flagging.flager_type", &known);
    assert_eq!(s.as_deref(), Some("flagging.flagger_type"));
}

#[test]
fn suggest_correction_returns_none_for_garbage() {
    let known = known_config_keys();
    let s = suggest_correction("zzz_completely_invalid_xyz_12345", &known);
    assert!(s.is_none(), "Garbage string should not match anything");
}

#[test]
fn unknown_keys_never_break_loading() {
    let mut job = flag_job();
    job["legacy_option"] = json!(true);
    let params = parse(&json!({ "flagging": job })).unwrap();
    assert!(params.flagging.is_some());
}

// ============================================================================
// Range Validation
// ============================================================================

#[test]
fn n_train_below_two_is_error() {
    let mut job = flag_job();
    job["n_train"] = json!(1);
    let err = parse(&json!({ "flagging": job })).unwrap_err();
    assert!(
        err.to_string().contains("n_train = 1"),
        "unexpected error: {err}"
    );
}

#[test]
fn zero_ar_lags_is_error() {
    let mut job = flag_job();
    job["ar_lags"] = json!(0);
    let err = parse(&json!({ "flagging": job })).unwrap_err();
    assert!(matches!(err, ConfigError::Validation(ref e) if e.iter().any(|m| m.contains("ar_lags = 0"))));
}

#[test]
fn more_lags_than_training_days_is_warning() {
    let mut job = flag_job();
    job["n_train"] = json!(3);
    job["ar_lags"] = json!(5);
    let params = parse(&json!({ "flagging": job })).unwrap();
    let (errors, warnings) = validate_ranges(&params);
    assert!(errors.is_empty());
    assert!(warnings.iter().any(|w| w.field == "flagging[0].ar_lags"));
}

#[test]
fn bad_lambda_grid_is_error() {
    let mut job = flag_job();
    job["lambda_grid"] = json!([]);
    assert!(parse(&json!({ "flagging": job })).is_err());

    let mut job = flag_job();
    job["lambda_grid"] = json!([1.0, -2.0]);
    let err = parse(&json!({ "flagging": job })).unwrap_err();
    assert!(err.to_string().contains("non-negative"));
}

#[test]
fn meta_values_are_range_checked_too() {
    let mut job = flag_job();
    job.as_object_mut().unwrap().remove("n_train");
    let doc = json!({
        "flagging_meta": {"n_train": 0},
        "flagging": job
    });
    let err = parse(&doc).unwrap_err();
    assert!(err.to_string().contains("flagging[0].n_train"));
}

#[test]
fn small_reference_window_is_warning() {
    let doc = json!({
        "validation": {"dynamic": {"ref_window_size": 3}}
    });
    let params = parse(&doc).unwrap();
    let (errors, warnings) = validate_ranges(&params);
    assert!(errors.is_empty());
    assert!(warnings
        .iter()
        .any(|w| w.field == "validation.dynamic.ref_window_size"));
}

#[test]
fn negative_minimum_sample_size_is_error() {
    let doc = json!({
        "validation": {"static": {"minimum_sample_size": -1}}
    });
    assert!(matches!(parse(&doc), Err(ConfigError::Validation(_))));
}

#[test]
fn far_past_day_counts_are_errors_not_panics() {
    let doc = json!({
        "validation": {"common": {"span_length": 3, "end_date": "today-999999999"}}
    });
    let err = parse(&doc).unwrap_err();
    assert!(matches!(err, ConfigError::Validation(ref e) if e.iter().any(|m| m.contains("validation.common.end_date"))));

    let doc = json!({
        "validation": {"common": {"span_length": 4000000000u64}}
    });
    let err = parse(&doc).unwrap_err();
    assert!(err.to_string().contains("validation.common.span_length = 4000000000"));

    let mut job = flag_job();
    job["n_train"] = json!(100000000000u64);
    let err = parse(&json!({ "flagging": job })).unwrap_err();
    assert!(matches!(err, ConfigError::Validation(ref e) if e.iter().any(|m| m.contains("flagging[0].n_train"))));
}

#[test]
fn century_of_history_is_the_limit() {
    let mut job = flag_job();
    job["n_train"] = json!(36500);
    job["lags"] = json!([36501]);
    let err = parse(&json!({ "flagging": job })).unwrap_err();
    let ConfigError::Validation(errors) = err else {
        panic!("expected a validation error");
    };
    assert_eq!(errors, vec!["flagging[0].lags = 36501 exceeds the 36500-day limit".to_string()]);
}

#[test]
fn defaults_pass_validation() {
    let params = parse(&json!({ "flagging": flag_job() })).unwrap();
    let (errors, warnings) = validate_ranges(&params);
    assert!(errors.is_empty(), "Defaults should have 0 range errors: {errors:?}");
    assert!(
        warnings.is_empty(),
        "Defaults should have 0 range warnings: {:?}",
        warnings.iter().map(|w| &w.field).collect::<Vec<_>>()
    );
}

// ============================================================================
// Typed Parsing
// ============================================================================

#[test]
fn toml_and_json_parse_to_the_same_jobs() {
    let toml_str = r#"
[flagging]
n_train = 10
ar_lags = 2
sig_fold = "chng"
sig_str = "covid"
raw_df = "raw.csv"
output_dir = "cache"
lags = [1, "var"]
"#;
    let from_toml = Params::from_str_with_format(toml_str, ParamsFormat::Toml).unwrap();
    let from_json = parse(&json!({ "flagging": flag_job() })).unwrap();

    let lags = |p: &Params| p.flagging.as_ref().unwrap().jobs()[0].lags.clone();
    assert_eq!(lags(&from_toml), vec![LagWindow::Days(1), LagWindow::Var]);
    assert_eq!(lags(&from_toml), lags(&from_json));
}

#[test]
fn single_lag_and_job_list_forms_are_accepted() {
    let mut job = flag_job();
    job["lags"] = json!("var");
    let params = parse(&json!({ "flagging": [job.clone(), job] })).unwrap();
    let jobs = params.flagging.as_ref().unwrap().jobs();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].lags, vec![LagWindow::Var]);
}

#[test]
fn flagger_type_values() {
    for (raw, expected) in [
        ("", FlaggerType::Regenerate),
        ("flagger_df", FlaggerType::Regenerate),
        ("flagger_io", FlaggerType::Reuse),
    ] {
        let mut job = flag_job();
        job["flagger_type"] = json!(raw);
        let params = parse(&json!({ "flagging": job })).unwrap();
        assert_eq!(
            params.flagging.as_ref().unwrap().jobs()[0].flagger_type,
            Some(expected)
        );
    }

    let mut job = flag_job();
    job["flagger_type"] = json!("flagger_s3");
    assert!(matches!(
        parse(&json!({ "flagging": job })),
        Err(ConfigError::Parse { .. })
    ));
}

#[test]
fn job_inherits_from_flagging_meta() {
    let mut job = flag_job();
    let obj = job.as_object_mut().unwrap();
    obj.remove("n_train");
    obj.remove("output_dir");
    let doc = json!({
        "flagging_meta": {"n_train": 12, "output_dir": "shared", "flagger_type": "flagger_io"},
        "flagging": job
    });
    let params = parse(&doc).unwrap();
    let today = chrono::NaiveDate::from_ymd_opt(2022, 6, 1).unwrap();
    let runs = params.flag_jobs(today).unwrap();
    assert_eq!(runs[0].n_train, 12);
    assert_eq!(runs[0].output_dir, std::path::PathBuf::from("shared"));
    assert_eq!(runs[0].strategy, FlaggerType::Reuse);
}

#[test]
fn remote_cache_is_rejected() {
    let mut job = flag_job();
    job["remote"] = json!(true);
    let params = parse(&json!({ "flagging": job })).unwrap();
    let today = chrono::NaiveDate::from_ymd_opt(2022, 6, 1).unwrap();
    let err = params.flag_jobs(today).unwrap_err();
    assert!(err.to_string().contains("remote cache storage is not supported"));
}

#[test]
fn partial_dates_are_rejected() {
    let mut job = flag_job();
    job["df_start_date"] = json!("05/01/2022");
    let params = parse(&json!({ "flagging": job })).unwrap();
    let today = chrono::NaiveDate::from_ymd_opt(2022, 6, 1).unwrap();
    let err = params.flag_jobs(today).unwrap_err();
    assert!(err.to_string().contains("all six"));
}
