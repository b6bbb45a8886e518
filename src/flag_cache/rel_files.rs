//! Which input file serves each day of a processing range, and the raw
//! frames assembled from those files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::Serialize;
use tracing::debug;

use super::CacheError;
use crate::config::LagWindow;
use crate::filename::leading_date;
use crate::series::csv_io::{self, LongColumns};
use crate::series::{LongRow, SeriesTable};
use crate::types::{shift_days, DateRange, WindowError};

/// One day of a [`rel_files_table`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelFile {
    pub date: NaiveDate,
    /// Most recent matching file dated on or before `date`.
    pub fname: Option<PathBuf>,
    /// Earlier days of the range that `fname` already served.
    pub win_sub: usize,
}

/// Map every day of `range` to the input file that covers it.
///
/// Candidates are the files in `input_dir` whose name contains `signal`
/// and starts with a `YYYYMMDD` segment. Each day takes the latest
/// candidate dated on or before it; when two files share a date the
/// lexically last name wins. Days before the first candidate have no file.
pub fn rel_files_table(
    input_dir: &Path,
    range: DateRange,
    signal: &str,
) -> Result<Vec<RelFile>, CacheError> {
    let entries = std::fs::read_dir(input_dir).map_err(|source| CacheError::Io {
        path: input_dir.to_path_buf(),
        source,
    })?;

    let mut files: Vec<(NaiveDate, PathBuf)> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| CacheError::Io {
            path: input_dir.to_path_buf(),
            source,
        })?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.contains(signal) {
            continue;
        }
        if let Some(date) = leading_date(&name) {
            files.push((date, entry.path()));
        }
    }
    files.sort();

    let mut table = Vec::with_capacity(range.len());
    let mut next = 0;
    let mut current: Option<&PathBuf> = None;
    let mut win_sub = 0;
    for date in range.days() {
        let mut switched = false;
        while next < files.len() && files[next].0 <= date {
            current = Some(&files[next].1);
            next += 1;
            switched = true;
        }
        if switched {
            win_sub = 0;
        } else if current.is_some() {
            win_sub += 1;
        }
        table.push(RelFile {
            date,
            fname: current.cloned(),
            win_sub,
        });
    }
    Ok(table)
}

/// Raw frames for `lags` built from the dated vintages in `input_dir`.
///
/// Every candidate file is a long CSV (`date,geography,value`) issued on
/// its leading date. Day `t` at lag `n` comes from the file serving day
/// `t + n`; `var` reads every day from the file serving the last day of
/// the processing range. Days a vintage does not hold are left out.
pub fn raw_from_input_dir(
    input_dir: &Path,
    df_range: DateRange,
    lags: &[LagWindow],
    signal: &str,
) -> Result<Vec<(LagWindow, SeriesTable)>, CacheError> {
    let max_lag = lags
        .iter()
        .filter_map(|l| match l {
            LagWindow::Days(n) => Some(i64::from(*n)),
            LagWindow::Var => None,
        })
        .max()
        .unwrap_or(0);
    let issue_end = shift_days(df_range.end, max_lag).ok_or(WindowError::OutOfRange {
        date: df_range.end,
        days: max_lag,
    })?;
    let issue_range = DateRange::new(df_range.start, issue_end)?;
    let table = rel_files_table(input_dir, issue_range, signal)?;

    let columns = LongColumns::default();
    let mut vintages: HashMap<&Path, SeriesTable> = HashMap::new();
    for path in table.iter().filter_map(|r| r.fname.as_deref()) {
        if !vintages.contains_key(path) {
            vintages.insert(path, csv_io::read_long(path, &columns)?);
        }
    }
    if vintages.is_empty() {
        return Err(CacheError::NoInputFiles {
            dir: input_dir.to_path_buf(),
            signal: signal.to_string(),
        });
    }
    debug!(
        dir = %input_dir.display(),
        files = vintages.len(),
        range = %issue_range,
        "Loaded input vintages"
    );

    let serving = |issue: NaiveDate| {
        let offset = usize::try_from((issue - issue_range.start).num_days()).ok()?;
        let path = table.get(offset)?.fname.as_deref()?;
        vintages.get(path)
    };
    let newest = serving(issue_range.end);

    let mut out = Vec::with_capacity(lags.len());
    for &lag in lags {
        let mut rows = Vec::new();
        for date in df_range.days() {
            let vintage = match lag {
                LagWindow::Days(n) => shift_days(date, i64::from(n)).and_then(serving),
                LagWindow::Var => newest,
            };
            let Some((vintage, index)) = vintage.and_then(|v| Some((v, v.date_index(date)?))) else {
                continue;
            };
            rows.extend(vintage.columns().map(|(geography, column)| LongRow {
                date,
                geography: geography.to_string(),
                value: column[index],
            }));
        }
        out.push((lag, SeriesTable::from_long(rows)?));
    }
    Ok(out)
}
