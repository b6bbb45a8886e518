//! Loading export files and reference data.
//!
//! Export files follow `{YYYYMMDD}_{geo_type}_{signal}.csv` and carry the
//! columns `geo_id, val, se, sample_size` (the last two may be absent).
//! Reference data comes through a [`ReferenceSource`]; the shipped
//! implementation reads an archive directory of previously published
//! exports laid out the same way.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use thiserror::Error;

use crate::filename::{leading_date, ExportName};
use crate::series::csv_io::parse_value;
use crate::types::DateRange;

pub const FILENAME_PATTERN: &str = r"^(?P<date>\d{8})_(?P<geo_type>\w+?)_(?P<signal>\w+)\.csv$";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error in {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{} has no '{column}' column", path.display())]
    MissingColumn { path: PathBuf, column: &'static str },

    #[error("{}:{line}: '{value}' is not a number", path.display())]
    Value {
        path: PathBuf,
        line: u64,
        value: String,
    },
}

/// One row of an export file.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRow {
    pub geo_id: String,
    pub val: Option<f64>,
    pub se: Option<f64>,
    pub sample_size: Option<f64>,
}

/// An export file in the validation window.
#[derive(Debug)]
pub struct LoadedFile {
    pub filename: String,
    pub name: ExportName,
    /// `Err` when the contents are not a readable export table.
    pub data: Result<Vec<ExportRow>, FetchError>,
}

/// Files of an export directory within the validation window.
#[derive(Debug, Default)]
pub struct ExportListing {
    pub files: Vec<LoadedFile>,
    /// `.csv` files dated inside the window whose names do not follow the
    /// export convention.
    pub unrecognized: Vec<String>,
}

/// One export row placed on its date.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub time_value: NaiveDate,
    pub geo_id: String,
    pub val: Option<f64>,
    pub se: Option<f64>,
    pub sample_size: Option<f64>,
}

impl Observation {
    fn new(time_value: NaiveDate, row: &ExportRow) -> Self {
        Self {
            time_value,
            geo_id: row.geo_id.clone(),
            val: row.val,
            se: row.se,
            sample_size: row.sample_size,
        }
    }
}

/// Observations keyed by `(geo_type, signal)`.
pub type GeoSignalFrames = BTreeMap<(String, String), Vec<Observation>>;

fn filename_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(FILENAME_PATTERN).ok()).as_ref()
}

/// Parse a bare filename that follows the export convention.
pub fn match_export_name(filename: &str) -> Option<ExportName> {
    if !filename_regex()?.is_match(filename) {
        return None;
    }
    ExportName::parse(filename).ok()
}

/// Plain files in `dir`, sorted by name.
pub fn read_filenames(dir: &Path) -> Result<Vec<String>, FetchError> {
    let io_err = |source| FetchError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if entry.file_type().map_err(io_err)?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Load every export file in `dir` dated inside `window`.
pub fn load_all_files(dir: &Path, window: DateRange) -> Result<ExportListing, FetchError> {
    let mut listing = ExportListing::default();
    for filename in read_filenames(dir)? {
        match match_export_name(&filename) {
            Some(name) if window.contains(name.date) => {
                let data = load_csv(&dir.join(&filename));
                listing.files.push(LoadedFile {
                    filename,
                    name,
                    data,
                });
            }
            Some(_) => {}
            None => {
                let dated_in_window = leading_date(&filename).is_some_and(|d| window.contains(d));
                if filename.ends_with(".csv") && dated_in_window {
                    listing.unrecognized.push(filename);
                }
            }
        }
    }
    tracing::debug!(
        dir = %dir.display(),
        files = listing.files.len(),
        unrecognized = listing.unrecognized.len(),
        "Loaded export files"
    );
    Ok(listing)
}

/// Read one export CSV.
pub fn load_csv(path: &Path) -> Result<Vec<ExportRow>, FetchError> {
    let csv_err = |source| FetchError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::Reader::from_path(path).map_err(csv_err)?;
    let headers = reader.headers().map_err(csv_err)?.clone();
    let index = |column: &str| headers.iter().position(|h| h.trim() == column);

    let geo_idx = index("geo_id").ok_or(FetchError::MissingColumn {
        path: path.to_path_buf(),
        column: "geo_id",
    })?;
    let val_idx = index("val").ok_or(FetchError::MissingColumn {
        path: path.to_path_buf(),
        column: "val",
    })?;
    let se_idx = index("se");
    let n_idx = index("sample_size");

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        let line = record.position().map_or(0, csv::Position::line);
        let cell = |idx: Option<usize>| -> Result<Option<f64>, FetchError> {
            let Some(raw) = idx.and_then(|i| record.get(i)) else {
                return Ok(None);
            };
            parse_value(raw).map_err(|_| FetchError::Value {
                path: path.to_path_buf(),
                line,
                value: raw.to_string(),
            })
        };
        rows.push(ExportRow {
            geo_id: record.get(geo_idx).unwrap_or_default().trim().to_string(),
            val: cell(Some(val_idx))?,
            se: cell(se_idx)?,
            sample_size: cell(n_idx)?,
        });
    }
    Ok(rows)
}

/// Group the readable files' rows by geo type and signal.
pub fn aggregate_frames(files: &[LoadedFile]) -> GeoSignalFrames {
    let mut frames = GeoSignalFrames::new();
    for file in files {
        let Ok(rows) = &file.data else { continue };
        frames
            .entry((file.name.geo_type.clone(), file.name.signal.clone()))
            .or_default()
            .extend(rows.iter().map(|row| Observation::new(file.name.date, row)));
    }
    for observations in frames.values_mut() {
        observations.sort_by(|a, b| a.time_value.cmp(&b.time_value));
    }
    frames
}

// ============================================================================
// Reference data
// ============================================================================

/// Where previously published values for comparison come from.
pub trait ReferenceSource {
    /// Short label for logs.
    fn name(&self) -> &str;

    /// Every `(geo_type, signal)` pair the source knows about.
    fn geo_signal_combos(&self) -> Result<Vec<(String, String)>, FetchError>;

    /// Observations for one pair dated inside `range`, sorted by date.
    fn fetch(&self, geo_type: &str, signal: &str, range: DateRange) -> Result<Vec<Observation>, FetchError>;
}

/// A directory of earlier exports.
#[derive(Debug, Clone)]
pub struct ArchiveDirectory {
    dir: PathBuf,
    label: String,
}

impl ArchiveDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let label = dir.display().to_string();
        Self { dir, label }
    }

    fn export_names(&self) -> Result<Vec<(String, ExportName)>, FetchError> {
        Ok(read_filenames(&self.dir)?
            .into_iter()
            .filter_map(|f| match_export_name(&f).map(|name| (f, name)))
            .collect())
    }
}

impl ReferenceSource for ArchiveDirectory {
    fn name(&self) -> &str {
        &self.label
    }

    fn geo_signal_combos(&self) -> Result<Vec<(String, String)>, FetchError> {
        let combos: BTreeSet<(String, String)> = self
            .export_names()?
            .into_iter()
            .map(|(_, name)| (name.geo_type, name.signal))
            .collect();
        Ok(combos.into_iter().collect())
    }

    fn fetch(&self, geo_type: &str, signal: &str, range: DateRange) -> Result<Vec<Observation>, FetchError> {
        let mut observations = Vec::new();
        for (filename, name) in self.export_names()? {
            if name.geo_type != geo_type || name.signal != signal || !range.contains(name.date) {
                continue;
            }
            let rows = load_csv(&self.dir.join(&filename))?;
            observations.extend(rows.iter().map(|row| Observation::new(name.date, row)));
        }
        observations.sort_by(|a, b| a.time_value.cmp(&b.time_value));
        Ok(observations)
    }
}
