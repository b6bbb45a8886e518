//! Flag Cache
//!
//! Persists the reference frames and AR outputs of every flagging job so
//! daily runs only compute what changed.
//!
//! ## Architecture
//!
//! ```text
//! raw_df ─► split by lag ─────┐
//! input_dir ─► vintage per lag ┴─► FlagStrategy::plan ─┬─ Regenerate ─► gen_ref_dfs ─► AR ─► leaf
//!                                                     ├─ RefreshAr ──► wkdy_corr.csv ─► AR ─► leaf
//!                                                     └─ Keep
//! ```
//!
//! - [`Regenerate`] (`flagger_df`): every lag found in the raw dump is
//!   rebuilt and overwritten.
//! - [`Reuse`] (`flagger_io`): only the configured lags are visited. A
//!   window whose `raw.csv` lacks the data start or end date is rebuilt; a
//!   window whose `ar_output.csv` lacks the evaluation dates gets fresh AR
//!   outputs from the cached `wkdy_corr.csv`; anything else is kept as is.
//!
//! Leaves are written in place with no cross-leaf transaction. Jobs that
//! share a cache key should enable `lock_cache`.

pub mod layout;
mod lockfile;
pub mod rel_files;

pub use layout::{CacheKey, Manifest};
pub use lockfile::{CacheLock, LockError};
pub use rel_files::{raw_from_input_dir, rel_files_table, RelFile};

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::ar::{self, ArError, REPORT_THRESHOLD};
use crate::config::{ConfigError, FlagRun, FlaggerType, LagWindow, Params, RawSource};
use crate::reference::{gen_ref_dfs, ReferenceError};
use crate::series::{csv_io, SeriesError, SeriesTable};
use crate::types::{group_by_date, write_flags, Flag, WindowError};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error ({}): {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error ({}): {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("manifest error ({}): {source}", path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("raw data file {} not found", .0.display())]
    RawMissing(PathBuf),

    #[error("no '{signal}' input files dated in {}", dir.display())]
    NoInputFiles { dir: PathBuf, signal: String },

    #[error("{}: lag window '{lag}' has no rows", path.display())]
    MissingLag { lag: String, path: PathBuf },

    #[error("{}: lag '{lag}' is neither a day count nor \"var\"", path.display())]
    BadLag { lag: String, path: PathBuf },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Series(#[from] SeriesError),

    #[error(transparent)]
    Reference(#[from] ReferenceError),

    #[error(transparent)]
    Ar(#[from] ArError),

    #[error(transparent)]
    Window(#[from] WindowError),
}

// ============================================================================
// Strategies
// ============================================================================

/// What a strategy decided for one lag window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LagAction {
    /// Reference frames and AR outputs recomputed.
    Regenerated,
    /// AR outputs recomputed from the cached weekday-corrected frame.
    ArRefreshed,
    /// Nothing written.
    Reused,
}

/// Chooses which lag windows to visit and how much of each to rebuild.
pub trait FlagStrategy {
    fn name(&self) -> &'static str;

    /// Lags to visit, given the lags present in the raw dump in
    /// first-seen order.
    fn lags(&self, run: &FlagRun, raw_lags: &[LagWindow]) -> Vec<LagWindow>;

    fn plan(&self, key: &CacheKey, run: &FlagRun) -> Result<LagAction, CacheError>;
}

/// `flagger_df`: rebuild everything the raw dump holds.
#[derive(Debug, Clone, Copy, Default)]
pub struct Regenerate;

impl FlagStrategy for Regenerate {
    fn name(&self) -> &'static str {
        "flagger_df"
    }

    fn lags(&self, _run: &FlagRun, raw_lags: &[LagWindow]) -> Vec<LagWindow> {
        raw_lags.to_vec()
    }

    fn plan(&self, _key: &CacheKey, _run: &FlagRun) -> Result<LagAction, CacheError> {
        Ok(LagAction::Regenerated)
    }
}

/// `flagger_io`: rebuild only missing or incomplete leaves.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reuse;

impl FlagStrategy for Reuse {
    fn name(&self) -> &'static str {
        "flagger_io"
    }

    fn lags(&self, run: &FlagRun, _raw_lags: &[LagWindow]) -> Vec<LagWindow> {
        run.lags.clone()
    }

    fn plan(&self, key: &CacheKey, run: &FlagRun) -> Result<LagAction, CacheError> {
        let window = &run.window;
        let ref_dir = key.ref_dir(&run.output_dir);
        if !layout::covers(
            &ref_dir.join(layout::RAW_FILE),
            window.df_range.start,
            window.df_range.end,
        )? || !ref_dir.join(layout::WEEKDAY_FILE).exists()
        {
            return Ok(LagAction::Regenerated);
        }

        let ar_dir = key.ar_dir(&run.output_dir);
        if !layout::covers(
            &ar_dir.join(layout::AR_OUTPUT_FILE),
            window.eval_range.start,
            window.eval_range.end,
        )? {
            return Ok(LagAction::ArRefreshed);
        }

        match Manifest::read(&ar_dir.join(layout::MANIFEST_FILE))? {
            Some(m) if m.window_params_hash != key.params_hash() => {
                warn!(
                    dir = %ar_dir.display(),
                    "Cache manifest belongs to different parameters, refreshing AR outputs"
                );
                Ok(LagAction::ArRefreshed)
            }
            _ => Ok(LagAction::Reused),
        }
    }
}

fn strategy_for(kind: FlaggerType) -> Box<dyn FlagStrategy> {
    match kind {
        FlaggerType::Regenerate => Box::new(Regenerate),
        FlaggerType::Reuse => Box::new(Reuse),
    }
}

// ============================================================================
// Summaries
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct LagOutcome {
    pub lag: LagWindow,
    pub action: LagAction,
    pub window_dir: PathBuf,
    pub spike_flags: usize,
    pub weekday_flags: usize,
    pub ar_flags: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobSummary {
    pub sig_fold: String,
    pub sig_str: String,
    pub strategy: &'static str,
    pub lags: Vec<LagOutcome>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlaggingSummary {
    pub jobs: Vec<JobSummary>,
}

impl FlaggingSummary {
    pub fn total_flags(&self) -> usize {
        self.jobs
            .iter()
            .flat_map(|j| &j.lags)
            .map(|l| l.spike_flags + l.weekday_flags + l.ar_flags)
            .sum()
    }
}

// ============================================================================
// Entry points
// ============================================================================

/// Run every flagging job in `params`, dates derived from today where
/// the params leave them out.
pub fn flagging(params: &Params) -> Result<FlaggingSummary, CacheError> {
    let today = chrono::Local::now().date_naive();
    let runs = params.flag_jobs(today)?;
    let mut summary = FlaggingSummary::default();
    for run in &runs {
        summary.jobs.push(run_job(run)?);
    }
    Ok(summary)
}

/// Run one resolved flagging job.
pub fn run_job(run: &FlagRun) -> Result<JobSummary, CacheError> {
    let strategy = strategy_for(run.strategy);

    let first_key = CacheKey::new(run, run.lags.first().copied().unwrap_or(LagWindow::Var));
    let _lock = if run.lock_cache {
        Some(CacheLock::acquire(first_key.signal_dir(&run.output_dir))?)
    } else {
        None
    };

    let groups = load_raw(run)?;
    let raw_lags: Vec<LagWindow> = groups.iter().map(|(l, _)| *l).collect();

    info!(
        sig_fold = %run.sig_fold,
        sig_str = %run.sig_str,
        strategy = strategy.name(),
        window = %run.window.eval_range,
        "Flagging job started"
    );

    let mut lags = Vec::new();
    for lag in strategy.lags(run, &raw_lags) {
        let key = CacheKey::new(run, lag);
        let action = strategy.plan(&key, run)?;
        let outcome = match action {
            LagAction::Regenerated => {
                let raw = groups
                    .iter()
                    .find(|(l, _)| *l == lag)
                    .map(|(_, t)| t)
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| CacheError::MissingLag {
                        lag: lag.to_string(),
                        path: run.raw.path().to_path_buf(),
                    })?;
                regenerate(&key, run, raw)?
            }
            LagAction::ArRefreshed => {
                let path = key.ref_dir(&run.output_dir).join(layout::WEEKDAY_FILE);
                let corrected = csv_io::read_wide(&path)?;
                let ar_flags = write_ar_leaf(&key, run, &corrected)?;
                LagOutcome {
                    lag,
                    action,
                    window_dir: key.window_dir(&run.output_dir),
                    spike_flags: 0,
                    weekday_flags: 0,
                    ar_flags,
                }
            }
            LagAction::Reused => LagOutcome {
                lag,
                action,
                window_dir: key.window_dir(&run.output_dir),
                spike_flags: 0,
                weekday_flags: 0,
                ar_flags: 0,
            },
        };
        info!(
            lag = %lag,
            action = ?outcome.action,
            dir = %outcome.window_dir.display(),
            "Lag window done"
        );
        lags.push(outcome);
    }

    Ok(JobSummary {
        sig_fold: run.sig_fold.clone(),
        sig_str: run.sig_str.clone(),
        strategy: strategy.name(),
        lags,
    })
}

/// Raw frames per lag window, from the `raw_df` dump or assembled from
/// the vintages in `input_dir`.
fn load_raw(run: &FlagRun) -> Result<Vec<(LagWindow, SeriesTable)>, CacheError> {
    match &run.raw {
        RawSource::File(path) => {
            if !path.exists() {
                return Err(CacheError::RawMissing(path.clone()));
            }
            let mut groups = Vec::new();
            for (lag, table) in csv_io::read_wide_by_lag(path)? {
                let parsed = LagWindow::parse(&lag).ok_or_else(|| CacheError::BadLag {
                    lag: lag.clone(),
                    path: path.clone(),
                })?;
                groups.push((parsed, table));
            }
            Ok(groups)
        }
        RawSource::InputDir(dir) => {
            if !dir.is_dir() {
                return Err(CacheError::RawMissing(dir.clone()));
            }
            raw_from_input_dir(dir, run.window.df_range, &run.lags, &run.sig_str)
        }
    }
}

// ============================================================================
// Leaf writers
// ============================================================================

fn create_dir(path: &Path) -> Result<(), CacheError> {
    std::fs::create_dir_all(path).map_err(|source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn save_flags(path: &Path, flags: &[Flag]) -> Result<(), CacheError> {
    write_flags(path, flags).map_err(|source| CacheError::Csv {
        path: path.to_path_buf(),
        source,
    })
}

fn regenerate(key: &CacheKey, run: &FlagRun, raw: &SeriesTable) -> Result<LagOutcome, CacheError> {
    let lag = key.lag.to_string();
    let frames = gen_ref_dfs(&raw.slice_dates(run.window.df_range), &run.reference, &lag, &run.sig_str)?;

    let ref_dir = key.ref_dir(&run.output_dir);
    create_dir(&ref_dir)?;
    csv_io::write_wide(&ref_dir.join(layout::RAW_FILE), &frames.raw)?;
    csv_io::write_wide(&ref_dir.join(layout::SPIKES_FILE), &frames.spikes)?;
    csv_io::write_wide(&ref_dir.join(layout::WEEKEND_FILE), &frames.weekend)?;
    csv_io::write_wide(&ref_dir.join(layout::WEEKDAY_FILE), &frames.weekday_corrected)?;

    let spike_flags: Vec<Flag> = frames
        .spike_flags
        .iter()
        .map(|f| f.to_flag(&lag, &run.sig_str))
        .collect();
    save_flags(&ref_dir.join(layout::SPIKE_FLAGS_FILE), &spike_flags)?;
    save_flags(&ref_dir.join(layout::WEEKDAY_FLAGS_FILE), &frames.weekday_flags)?;
    log_flags("Large Change Spike Flag", &spike_flags);
    log_flags("Weekday Outlier Flag", &frames.weekday_flags);

    let ar_flags = write_ar_leaf(key, run, &frames.weekday_corrected)?;

    Ok(LagOutcome {
        lag: key.lag,
        action: LagAction::Regenerated,
        window_dir: key.window_dir(&run.output_dir),
        spike_flags: spike_flags.len(),
        weekday_flags: frames.weekday_flags.len(),
        ar_flags,
    })
}

/// Fit the windowed AR model on `corrected` and write the AR leaf.
/// Returns the number of flags written.
fn write_ar_leaf(key: &CacheKey, run: &FlagRun, corrected: &SeriesTable) -> Result<usize, CacheError> {
    let output = ar::ar_results(corrected, &run.window, run.ar_lags, run.n_train)?;
    let lag = key.lag.to_string();
    let flags: Vec<Flag> = ar::calculate_report_flags(&output.residuals, &run.window, REPORT_THRESHOLD)
        .iter()
        .map(|f| f.to_flag(&lag, &run.sig_str))
        .collect();

    let ar_dir = key.ar_dir(&run.output_dir);
    create_dir(&ar_dir)?;
    csv_io::write_wide(&ar_dir.join(layout::AR_OUTPUT_FILE), &output.predictions)?;
    save_flags(&ar_dir.join(layout::AR_FLAGS_FILE), &flags)?;
    Manifest::new(key, run).write(&ar_dir.join(layout::MANIFEST_FILE))?;
    log_flags("Autoregressive Model Flag", &flags);
    Ok(flags.len())
}

/// Log non-empty flag tables grouped by date, fifty geographies per line.
fn log_flags(event: &str, flags: &[Flag]) {
    for (date, group) in group_by_date(flags) {
        for (part, chunk) in group.chunks(50).enumerate() {
            let geographies = chunk
                .iter()
                .map(|f| match f.score {
                    Some(score) => format!("{}={score:.2}", f.geography),
                    None => f.geography.clone(),
                })
                .collect::<Vec<_>>()
                .join(",");
            info!(
                event,
                date = %date,
                contd = part,
                hits = flags.len(),
                geographies = %geographies,
                "Flags raised"
            );
        }
    }
}
