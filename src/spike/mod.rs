//! Spike Detector
//!
//! Finds isolated single-day jumps in each geography's series and replaces
//! them with the average of the neighbouring days.
//!
//! ## Detection
//!
//! For every observed day the non-missing neighbours within `half_window`
//! days on either side (the day itself excluded) give a local median and a
//! robust scale (`1.4826 * MAD`, floored). A day deviating from the local
//! median by more than `threshold` scales is a candidate.
//!
//! Candidates are then filtered twice:
//! - runs of two or more consecutive candidate days are level shifts, not
//!   spikes, and are left alone;
//! - when a large share of geographies have candidates in the same ISO
//!   week the whole week is treated as a real wave and nothing is flagged.

use chrono::{Datelike, IsoWeek, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, info};

use crate::series::SeriesTable;
use crate::stats;
use crate::types::{Flag, FlagKind};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpikeError {
    #[error("cannot detect spikes in an empty table")]
    EmptyInput,
}

/// Tuning for [`identify_correct_spikes`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpikeConfig {
    /// Days on each side of a point used for its neighbourhood.
    pub half_window: usize,
    /// Minimum observed neighbours before a point can be judged.
    pub min_neighbors: usize,
    /// Deviation, in robust scales, that makes a point a candidate.
    pub threshold: f64,
    /// Scale floor as a fraction of the local median.
    pub rel_floor: f64,
    /// Absolute scale floor.
    pub abs_floor: f64,
    /// Share of geographies spiking in one week that marks a real wave.
    pub mass_fraction: f64,
    /// Below this many geographies the wave guard is off.
    pub mass_min_geographies: usize,
}

impl Default for SpikeConfig {
    fn default() -> Self {
        Self {
            half_window: 3,
            min_neighbors: 3,
            threshold: 5.0,
            rel_floor: 0.1,
            abs_floor: 1.0,
            mass_fraction: 0.5,
            mass_min_geographies: 3,
        }
    }
}

/// One corrected spike.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeFlag {
    pub date: NaiveDate,
    pub geography: String,
    /// Raw value before correction.
    pub value: f64,
    /// Value the point was corrected to.
    pub end: f64,
    /// Weekday, Monday = 0.
    pub day: u32,
}

impl SpikeFlag {
    pub fn to_flag(&self, lag: &str, key: &str) -> Flag {
        Flag {
            date: self.date,
            geography: self.geography.clone(),
            kind: FlagKind::Spike,
            lag: lag.to_string(),
            key: key.to_string(),
            score: Some(self.end),
        }
    }
}

/// Candidate spike positions for one column.
fn candidates(column: &[Option<f64>], config: &SpikeConfig) -> Vec<bool> {
    let n = column.len();
    let mut out = vec![false; n];
    for i in 0..n {
        let Some(value) = column[i] else { continue };
        let lo = i.saturating_sub(config.half_window);
        let hi = (i + config.half_window).min(n - 1);
        let neighbours: Vec<f64> = (lo..=hi)
            .filter(|&j| j != i)
            .filter_map(|j| column[j])
            .collect();
        if neighbours.len() < config.min_neighbors {
            continue;
        }
        let Some(center) = stats::median(&neighbours) else { continue };
        let floor = (config.rel_floor * center.abs()).max(config.abs_floor);
        let Some(scale) = stats::robust_scale(&neighbours, floor) else { continue };
        out[i] = (value - center).abs() > config.threshold * scale;
    }
    out
}

/// Keep only candidates whose neighbours on both sides are not candidates.
fn isolated(flags: &[bool]) -> Vec<bool> {
    (0..flags.len())
        .map(|i| {
            flags[i]
                && !(i > 0 && flags[i - 1])
                && !(i + 1 < flags.len() && flags[i + 1])
        })
        .collect()
}

/// Replacement value: mean of the observed adjacent days.
fn correction(column: &[Option<f64>], i: usize) -> Option<f64> {
    let before = i.checked_sub(1).and_then(|j| column[j]);
    let after = column.get(i + 1).copied().flatten();
    match (before, after) {
        (Some(a), Some(b)) => Some((a + b) / 2.0),
        (Some(a), None) | (None, Some(a)) => Some(a),
        (None, None) => None,
    }
}

/// Detect and correct isolated single-day spikes.
///
/// Returns the corrected table (same shape) and one [`SpikeFlag`] per
/// corrected point, ordered by geography then date.
pub fn identify_correct_spikes(
    table: &SeriesTable,
    config: &SpikeConfig,
) -> Result<(SeriesTable, Vec<SpikeFlag>), SpikeError> {
    if table.is_empty() {
        return Err(SpikeError::EmptyInput);
    }
    let dates = table.dates();

    let per_geo: Vec<Vec<bool>> = table
        .columns()
        .map(|(_, column)| isolated(&candidates(column, config)))
        .collect();

    // Weeks where too many geographies move together are real waves.
    let mut wave_weeks: HashSet<IsoWeek> = HashSet::new();
    let n_geo = per_geo.len();
    if n_geo >= config.mass_min_geographies {
        let mut geos_by_week: HashMap<IsoWeek, HashSet<usize>> = HashMap::new();
        for (g, flags) in per_geo.iter().enumerate() {
            for (i, _) in flags.iter().enumerate().filter(|(_, f)| **f) {
                geos_by_week.entry(dates[i].iso_week()).or_default().insert(g);
            }
        }
        for (week, geos) in geos_by_week {
            if geos.len() as f64 >= config.mass_fraction * n_geo as f64 {
                debug!(
                    year = week.year(),
                    week = week.week(),
                    geographies = geos.len(),
                    "Simultaneous jumps across geographies, not flagging week"
                );
                wave_weeks.insert(week);
            }
        }
    }

    let mut flags = Vec::new();
    let corrected = table.map_columns(|g, column| {
        let mut out = column.to_vec();
        for (i, is_spike) in per_geo[g].iter().enumerate() {
            if !*is_spike || wave_weeks.contains(&dates[i].iso_week()) {
                continue;
            }
            let (Some(raw), Some(fixed)) = (column[i], correction(column, i)) else {
                continue;
            };
            out[i] = Some(fixed);
            flags.push(SpikeFlag {
                date: dates[i],
                geography: table.geographies()[g].clone(),
                value: raw,
                end: fixed,
                day: dates[i].weekday().num_days_from_monday(),
            });
        }
        out
    });

    if !flags.is_empty() {
        info!(
            spikes = flags.len(),
            geographies = n_geo,
            "Corrected isolated spikes"
        );
    }
    Ok((corrected, flags))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::LongRow;

    fn day(offset: u64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2022, 5, 2).unwrap() + chrono::Days::new(offset)
    }

    fn single(values: &[f64]) -> SeriesTable {
        SeriesTable::new(
            (0..values.len() as u64).map(day).collect(),
            vec!["A".to_string()],
            vec![values.iter().map(|v| Some(*v)).collect()],
        )
        .unwrap()
    }

    #[test]
    fn test_isolated_spike_flagged_and_corrected() {
        let table = single(&[10.0, 10.0, 10.0, 10.0, 100.0, 10.0, 10.0, 10.0, 10.0, 10.0]);
        let (corrected, flags) = identify_correct_spikes(&table, &SpikeConfig::default()).unwrap();

        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].date, day(4));
        assert_eq!(flags[0].geography, "A");
        assert_eq!(flags[0].value, 100.0);
        let fixed = corrected.column("A").unwrap()[4].unwrap();
        assert!((fixed - 10.0).abs() < 1e-9);
        assert_eq!(corrected.len(), table.len());
    }

    #[test]
    fn test_level_shift_not_flagged() {
        let table = single(&[10.0, 10.0, 10.0, 10.0, 100.0, 100.0, 100.0, 100.0, 100.0, 100.0]);
        let (corrected, flags) = identify_correct_spikes(&table, &SpikeConfig::default()).unwrap();
        assert!(flags.is_empty());
        assert_eq!(corrected, table);
    }

    #[test]
    fn test_simultaneous_jump_across_geographies_not_flagged() {
        let mut rows = Vec::new();
        for geo in ["a", "b", "c", "d"] {
            for i in 0..14u64 {
                let value = if i == 9 { 90.0 } else { 10.0 };
                rows.push(LongRow {
                    date: day(i),
                    geography: geo.to_string(),
                    value: Some(value),
                });
            }
        }
        let table = SeriesTable::from_long(rows).unwrap();
        let (_, flags) = identify_correct_spikes(&table, &SpikeConfig::default()).unwrap();
        assert!(flags.is_empty(), "wave week flagged: {flags:?}");
    }

    #[test]
    fn test_single_geography_in_wide_table_still_flagged() {
        let mut rows = Vec::new();
        for geo in ["a", "b", "c", "d"] {
            for i in 0..14u64 {
                let value = if geo == "b" && i == 9 { 90.0 } else { 10.0 };
                rows.push(LongRow {
                    date: day(i),
                    geography: geo.to_string(),
                    value: Some(value),
                });
            }
        }
        let table = SeriesTable::from_long(rows).unwrap();
        let (_, flags) = identify_correct_spikes(&table, &SpikeConfig::default()).unwrap();
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].geography, "b");
    }

    #[test]
    fn test_empty_table_is_error() {
        assert_eq!(
            identify_correct_spikes(&SeriesTable::empty(), &SpikeConfig::default()).unwrap_err(),
            SpikeError::EmptyInput
        );
    }

    #[test]
    fn test_short_series_passes_through() {
        let table = single(&[10.0, 50.0, 10.0]);
        let (corrected, flags) = identify_correct_spikes(&table, &SpikeConfig::default()).unwrap();
        assert!(flags.is_empty());
        assert_eq!(corrected, table);
    }

    #[test]
    fn test_to_flag_carries_lag_and_key() {
        let spike = SpikeFlag {
            date: day(0),
            geography: "A".into(),
            value: 100.0,
            end: 10.0,
            day: 0,
        };
        let flag = spike.to_flag("var", "num");
        assert_eq!(flag.kind, FlagKind::Spike);
        assert_eq!(flag.lag, "var");
        assert_eq!(flag.score, Some(10.0));
    }
}
