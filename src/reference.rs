//! Reference frames for one lag window.
//!
//! The raw per-geography table is cleaned and run through the correction
//! stages in order; every intermediate table is kept because the flag
//! cache stores each of them:
//!
//! ```text
//! raw ─► ffill/bfill ─► daily reindex ─► spikes ─► weekend ─► weekday ─► wkdy_corr
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::series::{Fill, SeriesError, SeriesTable};
use crate::spike::{identify_correct_spikes, SpikeConfig, SpikeError, SpikeFlag};
use crate::types::Flag;
use crate::weekday::{self, WeekdayError, WeekdayParams};

/// The weekday fit needs at least one full week.
pub const MIN_REFERENCE_DAYS: usize = 7;

#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("Need at least seven dates for the weekday correction, got {0}")]
    TooFewDates(usize),

    #[error(transparent)]
    Series(#[from] SeriesError),

    #[error(transparent)]
    Spike(#[from] SpikeError),

    #[error(transparent)]
    Weekday(#[from] WeekdayError),
}

/// Tuning for [`gen_ref_dfs`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    pub spike: SpikeConfig,
    pub lambda_grid: Vec<f64>,
    pub num_threads: usize,
    /// Robust z of a log residual that makes a weekday outlier.
    pub outlier_threshold: f64,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            spike: SpikeConfig::default(),
            lambda_grid: vec![1.0, 10.0, 100.0, 1000.0],
            num_threads: 1,
            outlier_threshold: 5.0,
        }
    }
}

/// Every stage's table for one lag window.
#[derive(Debug, Clone)]
pub struct ReferenceFrames {
    /// Filled, deduplicated, daily input.
    pub raw: SeriesTable,
    pub spikes: SeriesTable,
    pub weekend: SeriesTable,
    /// Weekday-corrected series, missing values as zero.
    pub weekday_corrected: SeriesTable,
    pub spike_flags: Vec<SpikeFlag>,
    pub weekday_params: WeekdayParams,
    pub weekday_flags: Vec<Flag>,
}

/// Build the reference frames for one lag window of raw data.
///
/// `lag` and `key` are stamped on the weekday-outlier flags.
pub fn gen_ref_dfs(
    raw: &SeriesTable,
    config: &ReferenceConfig,
    lag: &str,
    key: &str,
) -> Result<ReferenceFrames, ReferenceError> {
    let raw = raw.fill_forward_backward().reindex_daily(Fill::Forward);
    if raw.len() < MIN_REFERENCE_DAYS || raw.geographies().is_empty() {
        return Err(ReferenceError::TooFewDates(raw.len()));
    }

    let (spikes, spike_flags) = identify_correct_spikes(&raw, &config.spike)?;
    let weekend = weekday::weekend_corr(&spikes);
    if !weekend.applied {
        debug!(lag, "Weekend correction skipped");
    }

    let columns = raw.geographies().to_vec();
    let weekday_params = weekday::get_params(
        &weekend.table,
        None,
        &columns,
        &config.lambda_grid,
        config.num_threads,
    )?;
    let weekday_corrected = weekday::calc_adjustment(&weekday_params, &weekend.table, &columns)?
        .map_columns(|_, column| column.iter().map(|v| Some(v.unwrap_or(0.0))).collect());
    let weekday_flags = weekday::weekday_outliers(
        &weekday_params,
        &weekend.table,
        config.outlier_threshold,
        lag,
        key,
    );

    info!(
        lag,
        days = raw.len(),
        geographies = columns.len(),
        spikes = spike_flags.len(),
        weekday_outliers = weekday_flags.len(),
        "Reference frames built"
    );

    Ok(ReferenceFrames {
        raw,
        spikes,
        weekend: weekend.table,
        weekday_corrected,
        spike_flags,
        weekday_params,
        weekday_flags,
    })
}
