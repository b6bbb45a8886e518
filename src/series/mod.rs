//! Time Series Store
//!
//! Per-geography daily numeric tables, the common currency between the
//! indicator exports and every detection stage.
//!
//! ## Architecture
//!
//! - `SeriesTable`: wide geography × date table with a sorted date axis,
//!   reindexing and gap filling
//! - `LocationSeries`: one geography's ordered date → value mapping
//! - `csv_io`: wide (optionally split by data vintage) and long CSV files
//!
//! Stages never mutate a table in place; each returns a new table.

mod location;
mod table;
pub mod csv_io;

pub use location::LocationSeries;
pub use table::{Fill, LongRow, SeriesTable};

use std::path::PathBuf;

use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SeriesError {
    #[error("Unable to proceed, multiple dates with conflicting values ({geography} on {date})")]
    ConflictingDuplicate { date: NaiveDate, geography: String },

    #[error("geography '{0}' appears more than once")]
    DuplicateGeography(String),

    #[error("geography '{0}' not found in table")]
    UnknownGeography(String),

    #[error("column {geography} has {got} values, expected {expected}")]
    ShapeMismatch {
        geography: String,
        got: usize,
        expected: usize,
    },

    #[error("{}: missing '{column}' column", path.display())]
    MissingColumn { path: PathBuf, column: String },

    #[error("{}: unexpected '{column}' column", path.display())]
    UnexpectedColumn { path: PathBuf, column: String },

    #[error("{}:{line}: cannot parse '{value}' as a {what}", path.display())]
    Parse {
        path: PathBuf,
        line: u64,
        value: String,
        what: &'static str,
    },

    #[error("CSV error ({}): {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("I/O error ({}): {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
