//! Params document types and loading.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{de, Deserialize, Deserializer};
use thiserror::Error;
use tracing::{debug, warn};

use super::validation;
use crate::reference::ReferenceConfig;
use crate::types::{parse_date, shift_days, DateRange, Window, WindowError};

/// Residual-distribution length used when dates are derived from today.
pub const DEFAULT_RESID_DAYS: i64 = 100;
/// Evaluation length used when dates are derived from today.
pub const DEFAULT_EVAL_DAYS: i64 = 1;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config I/O error ({}): {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config parse error ({}): {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("{}", format_errors(.0))]
    Validation(Vec<String>),
}

fn format_errors(errors: &[String]) -> String {
    let mut out = String::from("Config validation failed:");
    for e in errors {
        out.push_str("\n  - ");
        out.push_str(e);
    }
    out
}

// ============================================================================
// Top level
// ============================================================================

/// Syntax of a params file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamsFormat {
    Json,
    Toml,
}

impl ParamsFormat {
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::Toml,
            _ => Self::Json,
        }
    }
}

/// The whole params document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Params {
    #[serde(default)]
    pub common: CommonParams,

    /// One flagging job or a list of them.
    #[serde(default)]
    pub flagging: Option<FlaggingSection>,

    /// Settings shared by every flagging job; a job's own value wins.
    #[serde(default)]
    pub flagging_meta: Option<FlaggingMeta>,

    #[serde(default)]
    pub validation: Option<ValidationParams>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CommonParams {
    pub export_dir: Option<PathBuf>,
    pub log_filename: Option<PathBuf>,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl Params {
    /// Load a params file, JSON or TOML by extension.
    ///
    /// Unknown keys are logged as warnings; out-of-range values fail with
    /// [`ConfigError::Validation`].
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let params = Self::parse(&contents, ParamsFormat::for_path(path), path)?;
        debug!(path = %path.display(), "Loaded params");
        Ok(params)
    }

    /// Parse a params document held in memory.
    pub fn from_str_with_format(contents: &str, format: ParamsFormat) -> Result<Self, ConfigError> {
        Self::parse(contents, format, Path::new("<inline>"))
    }

    fn parse(contents: &str, format: ParamsFormat, origin: &Path) -> Result<Self, ConfigError> {
        let parse_err = |message: String| ConfigError::Parse {
            path: origin.to_path_buf(),
            message,
        };

        // Both syntaxes go through one JSON value so the key walk and the
        // typed pass see the same tree.
        let value: serde_json::Value = match format {
            ParamsFormat::Json => serde_json::from_str(contents).map_err(|e| parse_err(e.to_string()))?,
            ParamsFormat::Toml => {
                let raw: toml::Value = toml::from_str(contents).map_err(|e| parse_err(e.to_string()))?;
                serde_json::to_value(raw).map_err(|e| parse_err(e.to_string()))?
            }
        };

        for w in validation::validate_unknown_keys(&value) {
            warn!("{}", w);
        }

        let params: Self = serde_json::from_value(value).map_err(|e| parse_err(e.to_string()))?;

        let (errors, warnings) = validation::validate_ranges(&params);
        for w in &warnings {
            warn!("{}", w);
        }
        if !errors.is_empty() {
            return Err(ConfigError::Validation(errors));
        }
        Ok(params)
    }

    /// The flagging jobs, each resolved against `flagging_meta` and with
    /// absent dates derived from `today`.
    pub fn flag_jobs(&self, today: NaiveDate) -> Result<Vec<FlagRun>, ConfigError> {
        let Some(section) = &self.flagging else {
            return Ok(Vec::new());
        };
        let default_meta = FlaggingMeta::default();
        let meta = self.flagging_meta.as_ref().unwrap_or(&default_meta);

        let mut runs = Vec::new();
        let mut errors = Vec::new();
        for (i, job) in section.jobs().iter().enumerate() {
            match job.resolve(meta, today) {
                Ok(run) => runs.push(run),
                Err(mut e) => {
                    for msg in &mut e {
                        *msg = format!("flagging[{i}]: {msg}");
                    }
                    errors.extend(e);
                }
            }
        }
        if errors.is_empty() {
            Ok(runs)
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Flagging
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FlaggingSection {
    Single(FlagJob),
    Many(Vec<FlagJob>),
}

impl FlaggingSection {
    pub fn jobs(&self) -> &[FlagJob] {
        match self {
            Self::Single(job) => std::slice::from_ref(job),
            Self::Many(jobs) => jobs,
        }
    }
}

/// Data-vintage window: rows of the raw dump reported `n` days after the
/// fact, or the latest values (`var`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LagWindow {
    Days(u32),
    Var,
}

impl LagWindow {
    /// Day offset `var` stands for when deriving dates.
    pub const VAR_DAYS: u32 = 60;

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw == "var" {
            return Some(Self::Var);
        }
        // Raw dumps written by dataframe tools may carry "3.0"
        let raw = raw.strip_suffix(".0").unwrap_or(raw);
        raw.parse().ok().map(Self::Days)
    }

    pub fn days(self) -> u32 {
        match self {
            Self::Days(n) => n,
            Self::Var => Self::VAR_DAYS,
        }
    }
}

impl fmt::Display for LagWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Days(n) => write!(f, "{n}"),
            Self::Var => f.write_str("var"),
        }
    }
}

impl<'de> Deserialize<'de> for LagWindow {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u32),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(Self::Days(n)),
            Raw::Text(s) => Self::parse(&s).ok_or_else(|| {
                de::Error::custom(format!("invalid lag '{s}', expected a day count or \"var\""))
            }),
        }
    }
}

fn de_lags<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<LagWindow>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(LagWindow),
        Many(Vec<LagWindow>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(lag) => vec![lag],
        OneOrMany::Many(lags) => lags,
    })
}

fn de_opt_date<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<NaiveDate>, D::Error> {
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => parse_date(s)
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("invalid date '{s}', expected MM/DD/YYYY or YYYY-MM-DD"))),
    }
}

/// Where the raw series came from; part of the cache path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SigType {
    Api,
    #[default]
    Local,
    Raw,
    Ratio,
}

impl SigType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Local => "local",
            Self::Raw => "raw",
            Self::Ratio => "ratio",
        }
    }
}

impl fmt::Display for SigType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlaggerType {
    /// `flagger_df` or empty: rebuild every leaf.
    #[default]
    Regenerate,
    /// `flagger_io`: rebuild only what is missing.
    Reuse,
}

impl<'de> Deserialize<'de> for FlaggerType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.as_str() {
            "" | "flagger_df" => Ok(Self::Regenerate),
            "flagger_io" => Ok(Self::Reuse),
            other => Err(de::Error::custom(format!(
                "unknown flagger_type '{other}', expected \"flagger_df\", \"flagger_io\" or \"\""
            ))),
        }
    }
}

/// Settings a job may inherit from `flagging_meta`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FlaggingMeta {
    pub n_train: Option<usize>,
    pub ar_lags: Option<usize>,
    pub output_dir: Option<PathBuf>,
    pub flagger_type: Option<FlaggerType>,
    pub remote: Option<bool>,
    pub lambda_grid: Option<Vec<f64>>,
    pub num_threads: Option<usize>,
    pub lock_cache: Option<bool>,
}

/// One `flagging` entry as written in the params file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FlagJob {
    pub n_train: Option<usize>,
    pub ar_lags: Option<usize>,
    #[serde(deserialize_with = "de_opt_date")]
    pub df_start_date: Option<NaiveDate>,
    #[serde(deserialize_with = "de_opt_date")]
    pub df_end_date: Option<NaiveDate>,
    #[serde(deserialize_with = "de_opt_date")]
    pub resid_start_date: Option<NaiveDate>,
    #[serde(deserialize_with = "de_opt_date")]
    pub resid_end_date: Option<NaiveDate>,
    #[serde(deserialize_with = "de_opt_date")]
    pub eval_start_date: Option<NaiveDate>,
    #[serde(deserialize_with = "de_opt_date")]
    pub eval_end_date: Option<NaiveDate>,
    pub input_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    #[serde(deserialize_with = "de_lags")]
    pub lags: Vec<LagWindow>,
    pub raw_df: Option<PathBuf>,
    pub sig_fold: String,
    pub sig_str: String,
    pub sig_type: SigType,
    pub remote: Option<bool>,
    pub flagger_type: Option<FlaggerType>,
    pub lambda_grid: Option<Vec<f64>>,
    pub num_threads: Option<usize>,
    pub lock_cache: Option<bool>,
}

/// Where a flagging job reads its raw counts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawSource {
    /// `raw_df`: one wide CSV with a `lag` column.
    File(PathBuf),
    /// `input_dir`: dated long-format vintages, assembled per lag window.
    InputDir(PathBuf),
}

impl RawSource {
    pub fn path(&self) -> &Path {
        match self {
            Self::File(p) | Self::InputDir(p) => p,
        }
    }
}

/// A flagging job with every setting decided.
#[derive(Debug, Clone)]
pub struct FlagRun {
    pub sig_fold: String,
    pub sig_str: String,
    pub sig_type: SigType,
    pub lags: Vec<LagWindow>,
    pub n_train: usize,
    pub ar_lags: usize,
    pub window: Window,
    pub raw: RawSource,
    pub output_dir: PathBuf,
    pub strategy: FlaggerType,
    pub reference: ReferenceConfig,
    pub lock_cache: bool,
}

impl FlagJob {
    fn resolve(&self, meta: &FlaggingMeta, today: NaiveDate) -> Result<FlagRun, Vec<String>> {
        let mut errors = Vec::new();

        let n_train = self.n_train.or(meta.n_train);
        let ar_lags = self.ar_lags.or(meta.ar_lags);
        let output_dir = self.output_dir.clone().or_else(|| meta.output_dir.clone());
        if n_train.is_none() {
            errors.push("n_train is required".to_string());
        }
        if ar_lags.is_none() {
            errors.push("ar_lags is required".to_string());
        }
        if output_dir.is_none() {
            errors.push("output_dir is required".to_string());
        }
        // raw_df wins when both are set.
        let raw = match (&self.raw_df, &self.input_dir) {
            (Some(file), _) => Some(RawSource::File(file.clone())),
            (None, Some(dir)) => Some(RawSource::InputDir(dir.clone())),
            (None, None) => {
                errors.push("raw_df or input_dir is required".to_string());
                None
            }
        };
        if self.lags.is_empty() {
            errors.push("lags must name at least one lag window".to_string());
        }
        if self.sig_fold.is_empty() || self.sig_str.is_empty() {
            errors.push("sig_fold and sig_str are required".to_string());
        }
        if self.remote.or(meta.remote).unwrap_or(false) {
            errors.push("remote cache storage is not supported; set remote = false".to_string());
        }

        let (Some(n_train), Some(ar_lags), Some(output_dir), Some(raw), true) = (
            n_train,
            ar_lags,
            output_dir,
            raw,
            errors.is_empty(),
        ) else {
            return Err(errors);
        };

        let window = self
            .window(n_train, ar_lags, today)
            .map_err(|e| vec![e])?;

        let mut reference = ReferenceConfig::default();
        if let Some(grid) = self.lambda_grid.clone().or_else(|| meta.lambda_grid.clone()) {
            reference.lambda_grid = grid;
        }
        if let Some(threads) = self.num_threads.or(meta.num_threads) {
            reference.num_threads = threads;
        }

        Ok(FlagRun {
            sig_fold: self.sig_fold.clone(),
            sig_str: self.sig_str.clone(),
            sig_type: self.sig_type,
            lags: self.lags.clone(),
            n_train,
            ar_lags,
            window,
            raw,
            output_dir,
            strategy: self.flagger_type.or(meta.flagger_type).unwrap_or_default(),
            reference,
            lock_cache: self.lock_cache.or(meta.lock_cache).unwrap_or(false),
        })
    }

    fn window(&self, n_train: usize, ar_lags: usize, today: NaiveDate) -> Result<Window, String> {
        let dates = [
            self.df_start_date,
            self.df_end_date,
            self.resid_start_date,
            self.resid_end_date,
            self.eval_start_date,
            self.eval_end_date,
        ];
        let (df, resid, eval) = match dates {
            [Some(a), Some(b), Some(c), Some(d), Some(e), Some(f)] => {
                let range = |start, end| DateRange::new(start, end).map_err(|e| e.to_string());
                (range(a, b)?, range(c, d)?, range(e, f)?)
            }
            [None, None, None, None, None, None] => {
                let derived = params_meta(&self.lags, n_train, ar_lags, today).map_err(|e| e.to_string())?;
                debug!(
                    df = %derived.0,
                    resid = %derived.1,
                    eval = %derived.2,
                    "Derived flagging dates from today"
                );
                derived
            }
            _ => {
                return Err(
                    "set all six of df/resid/eval start and end dates, or none of them".to_string(),
                )
            }
        };
        Window::new(df, resid, eval, ar_lags, n_train).map_err(|e| e.to_string())
    }
}

/// Data, residual and evaluation ranges for a rolling daily run.
///
/// The data ends `min(lags)` days before `today` and starts far enough
/// back to fit `DEFAULT_RESID_DAYS` residual days after `n_train + ar_lags`
/// days of training history. `var` counts as [`LagWindow::VAR_DAYS`]. The
/// residual range starts one day after the earliest date the AR history
/// allows and is clipped to the data end.
pub fn params_meta(
    lags: &[LagWindow],
    n_train: usize,
    ar_lags: usize,
    today: NaiveDate,
) -> Result<(DateRange, DateRange, DateRange), WindowError> {
    let offsets: Vec<i64> = lags.iter().map(|l| i64::from(l.days())).collect();
    let min_lag = offsets.iter().copied().min().unwrap_or(0);
    let max_lag = offsets.iter().copied().max().unwrap_or(0);
    let n_train = i64::try_from(n_train).unwrap_or(i64::MAX);
    let ar_lags = i64::try_from(ar_lags).unwrap_or(i64::MAX);
    let history = n_train.saturating_add(ar_lags);

    let shift = |date: NaiveDate, days: i64| {
        shift_days(date, days).ok_or(WindowError::OutOfRange { date, days })
    };

    let end = shift(today, -min_lag)?;
    let back = (DEFAULT_RESID_DAYS + DEFAULT_EVAL_DAYS)
        .saturating_add(n_train)
        .saturating_sub(ar_lags)
        .saturating_add(max_lag);
    let start = shift(today, back.saturating_neg())?;

    let resid_start = shift(start, history.saturating_add(1))?;
    let resid_end = shift(start, history.saturating_add(DEFAULT_RESID_DAYS))?.min(end);
    let eval_start = shift(end, -DEFAULT_EVAL_DAYS)?;

    Ok((
        DateRange::new(start, end)?,
        DateRange::new(resid_start, resid_end)?,
        DateRange::new(eval_start, end)?,
    ))
}

// ============================================================================
// Validation
// ============================================================================

/// The `validation` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ValidationParams {
    #[serde(default)]
    pub common: ValidationCommon,
    #[serde(default, rename = "static")]
    pub static_checks: StaticParams,
    #[serde(default)]
    pub dynamic: DynamicParams,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationCommon {
    pub data_source: String,
    pub span_length: Option<u32>,
    /// `today`, `today-N` or `YYYY-MM-DD`.
    pub end_date: String,
    /// Kept untyped: shape errors are reported by the validator itself.
    pub suppressed_errors: serde_json::Value,
    /// Days a signal may lag behind today; `all` is the fallback key.
    pub max_expected_lag: HashMap<String, u32>,
    pub min_expected_lag: HashMap<String, u32>,
    /// Overrides the reference lookbehind derived from `ref_window_size`.
    pub max_check_lookbehind: Option<u32>,
    pub dry_run: bool,
}

impl Default for ValidationCommon {
    fn default() -> Self {
        Self {
            data_source: String::new(),
            span_length: None,
            end_date: "today".to_string(),
            suppressed_errors: serde_json::Value::Null,
            max_expected_lag: HashMap::new(),
            min_expected_lag: HashMap::new(),
            max_check_lookbehind: None,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StaticParams {
    pub minimum_sample_size: f64,
    pub missing_se_allowed: bool,
    pub missing_sample_size_allowed: bool,
    /// Extra geo ids accepted per geo type regardless of format.
    pub additional_valid_geo_values: HashMap<String, Vec<String>>,
}

impl Default for StaticParams {
    fn default() -> Self {
        Self {
            minimum_sample_size: 100.0,
            missing_se_allowed: false,
            missing_sample_size_allowed: false,
            additional_valid_geo_values: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DynamicParams {
    pub ref_window_size: u32,
    pub smoothed_signals: Vec<String>,
    /// Archive of previously published exports used as reference data.
    /// Without it the dynamic checks are skipped.
    pub reference_dir: Option<PathBuf>,
    /// Stop after two geo/signal combos.
    pub test_mode: bool,
}

impl Default for DynamicParams {
    fn default() -> Self {
        Self {
            ref_window_size: 14,
            smoothed_signals: Vec::new(),
            reference_dir: None,
            test_mode: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    const FLAG_PARAMS: &str = r#"{
        "common": {"export_dir": "./receiving", "log_filename": "flag.log"},
        "flagging": {
            "n_train": 2,
            "ar_lags": 1,
            "df_start_date": "05/01/2022",
            "df_end_date": "05/30/2022",
            "resid_start_date": "05/10/2022",
            "resid_end_date": "05/12/2022",
            "eval_start_date": "05/12/2022",
            "eval_end_date": "05/14/2022",
            "output_dir": "flags",
            "lags": ["0", "1", "var"],
            "raw_df": "raw.csv",
            "sig_fold": "test",
            "sig_str": "basic_sig",
            "sig_type": "local",
            "remote": false,
            "flagger_type": "flagger_io"
        }
    }"#;

    #[test]
    fn test_single_flagging_object_resolves() {
        let params = Params::from_str_with_format(FLAG_PARAMS, ParamsFormat::Json).unwrap();
        let runs = params.flag_jobs(d("2022-06-01")).unwrap();
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert_eq!(run.lags, vec![LagWindow::Days(0), LagWindow::Days(1), LagWindow::Var]);
        assert_eq!(run.strategy, FlaggerType::Reuse);
        assert_eq!(run.sig_type, SigType::Local);
        assert_eq!(run.window.df_range.start, d("2022-05-01"));
        assert_eq!(run.window.eval_range.end, d("2022-05-14"));
        assert!(!run.lock_cache);
        assert_eq!(run.raw, RawSource::File(PathBuf::from("raw.csv")));
    }

    #[test]
    fn test_raw_source_falls_back_to_input_dir() {
        let with_dir = FLAG_PARAMS.replace(r#""raw_df": "raw.csv","#, r#""input_dir": "cache_in","#);
        let params = Params::from_str_with_format(&with_dir, ParamsFormat::Json).unwrap();
        let runs = params.flag_jobs(d("2022-06-01")).unwrap();
        assert_eq!(runs[0].raw, RawSource::InputDir(PathBuf::from("cache_in")));

        let both = FLAG_PARAMS.replace(r#""raw_df": "raw.csv","#, r#""raw_df": "raw.csv", "input_dir": "cache_in","#);
        let params = Params::from_str_with_format(&both, ParamsFormat::Json).unwrap();
        assert_eq!(params.flag_jobs(d("2022-06-01")).unwrap()[0].raw.path(), Path::new("raw.csv"));

        let neither = FLAG_PARAMS.replace(r#""raw_df": "raw.csv","#, "");
        let params = Params::from_str_with_format(&neither, ParamsFormat::Json).unwrap();
        let err = params.flag_jobs(d("2022-06-01")).unwrap_err();
        assert!(err.to_string().contains("raw_df or input_dir is required"));
    }

    #[test]
    fn test_flagging_list_inherits_meta() {
        let raw = r#"{
            "flagging_meta": {"n_train": 3, "ar_lags": 2, "output_dir": "out", "flagger_type": ""},
            "flagging": [
                {"sig_fold": "a", "sig_str": "s", "raw_df": "a.csv", "lags": "var"},
                {"sig_fold": "b", "sig_str": "s", "raw_df": "b.csv", "lags": [1, 2], "n_train": 5}
            ]
        }"#;
        let params = Params::from_str_with_format(raw, ParamsFormat::Json).unwrap();
        let runs = params.flag_jobs(d("2022-06-01")).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].n_train, 3);
        assert_eq!(runs[0].lags, vec![LagWindow::Var]);
        assert_eq!(runs[0].strategy, FlaggerType::Regenerate);
        assert_eq!(runs[1].n_train, 5);
        assert_eq!(runs[1].output_dir, PathBuf::from("out"));
    }

    #[test]
    fn test_params_meta_dates() {
        let today = d("2022-06-01");
        let lags = [LagWindow::Days(1), LagWindow::Days(3)];
        let (df, resid, eval) = params_meta(&lags, 5, 2, today).unwrap();
        assert_eq!(df.end, d("2022-05-31"));
        // 100 + 1 + 5 - 2 + 3 days back
        assert_eq!(df.start, today - Duration::days(107));
        assert_eq!(resid.start, df.start + Duration::days(8));
        assert_eq!(eval.start, d("2022-05-30"));
        assert_eq!(eval.end, df.end);
        assert!(Window::new(df, resid, eval, 2, 5).is_ok());
    }

    #[test]
    fn test_params_meta_far_history_is_an_error() {
        let today = d("2022-06-01");
        let err = params_meta(&[LagWindow::Days(1)], 100_000_000_000, 2, today).unwrap_err();
        assert!(matches!(err, WindowError::OutOfRange { .. }));
        assert!(params_meta(&[LagWindow::Days(1)], usize::MAX, usize::MAX, today).is_err());
        assert!(err.to_string().contains("supported calendar"));
    }

    #[test]
    fn test_var_counts_as_sixty_days() {
        let today = d("2022-06-01");
        let (df, _, _) = params_meta(&[LagWindow::Var, LagWindow::Days(0)], 2, 1, today).unwrap();
        assert_eq!(df.end, today);
        assert_eq!(df.start, today - Duration::days(101 + 1 + 60));
    }

    #[test]
    fn test_partial_dates_rejected() {
        let raw = r#"{"flagging": {"n_train": 2, "ar_lags": 1, "output_dir": "o", "raw_df": "r.csv",
            "sig_fold": "f", "sig_str": "s", "lags": [0], "df_start_date": "2022-05-01"}}"#;
        let params = Params::from_str_with_format(raw, ParamsFormat::Json).unwrap();
        let err = params.flag_jobs(d("2022-06-01")).unwrap_err();
        assert!(err.to_string().contains("flagging[0]"));
    }

    #[test]
    fn test_remote_rejected() {
        let raw = FLAG_PARAMS.replace("\"remote\": false", "\"remote\": true");
        let params = Params::from_str_with_format(&raw, ParamsFormat::Json).unwrap();
        let err = params.flag_jobs(d("2022-06-01")).unwrap_err();
        assert!(err.to_string().contains("remote"));
    }

    #[test]
    fn test_unknown_flagger_type_is_parse_error() {
        let raw = FLAG_PARAMS.replace("flagger_io", "flagger_xyz");
        let err = Params::from_str_with_format(&raw, ParamsFormat::Json).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_toml_params() {
        let raw = r#"
[common]
export_dir = "receiving"
log_format = "json"

[validation.common]
data_source = "usa-facts"
span_length = 3
end_date = "2020-09-01"

[validation.static]
minimum_sample_size = 50
"#;
        let params = Params::from_str_with_format(raw, ParamsFormat::Toml).unwrap();
        assert_eq!(params.common.log_format, LogFormat::Json);
        let validation = params.validation.unwrap();
        assert_eq!(validation.common.span_length, Some(3));
        assert!((validation.static_checks.minimum_sample_size - 50.0).abs() < f64::EPSILON);
        assert_eq!(validation.dynamic.ref_window_size, 14);
    }

    #[test]
    fn test_lag_window_parse() {
        assert_eq!(LagWindow::parse("var"), Some(LagWindow::Var));
        assert_eq!(LagWindow::parse("3"), Some(LagWindow::Days(3)));
        assert_eq!(LagWindow::parse("3.0"), Some(LagWindow::Days(3)));
        assert_eq!(LagWindow::parse("x"), None);
        assert_eq!(LagWindow::Var.to_string(), "var");
    }
}
