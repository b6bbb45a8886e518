//! CSV persistence for series tables, wide and long.
//!
//! Wide files carry a date column first and one column per geography.
//! Raw indicator dumps additionally carry a `lag` column naming the data
//! vintage each row belongs to; [`read_wide_by_lag`] splits those apart.

use std::collections::HashMap;
use std::path::Path;

use chrono::NaiveDate;

use super::{LongRow, SeriesError, SeriesTable};
use crate::types::parse_date;

/// Name of the data-vintage column in raw indicator dumps.
pub const LAG_COLUMN: &str = "lag";

/// Column names for long-format files.
#[derive(Debug, Clone)]
pub struct LongColumns {
    pub date: String,
    pub geography: String,
    pub value: String,
}

impl Default for LongColumns {
    fn default() -> Self {
        Self {
            date: "date".to_string(),
            geography: "geography".to_string(),
            value: "value".to_string(),
        }
    }
}

fn csv_err(path: &Path) -> impl FnOnce(csv::Error) -> SeriesError + '_ {
    move |source| SeriesError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

/// Parse a numeric cell; blank and NaN spellings are missing values.
pub fn parse_value(raw: &str) -> Result<Option<f64>, std::num::ParseFloatError> {
    let trimmed = raw.trim();
    match trimmed {
        "" | "nan" | "NaN" | "NA" | "None" | "null" => Ok(None),
        _ => trimmed.parse::<f64>().map(|v| if v.is_nan() { None } else { Some(v) }),
    }
}

pub fn format_value(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn parse_cell_date(path: &Path, line: u64, raw: &str) -> Result<NaiveDate, SeriesError> {
    parse_date(raw).ok_or_else(|| SeriesError::Parse {
        path: path.to_path_buf(),
        line,
        value: raw.to_string(),
        what: "date",
    })
}

fn parse_cell_value(path: &Path, line: u64, raw: &str) -> Result<Option<f64>, SeriesError> {
    parse_value(raw).map_err(|_| SeriesError::Parse {
        path: path.to_path_buf(),
        line,
        value: raw.to_string(),
        what: "number",
    })
}

/// Read a wide table. A `lag` column, if present, is rejected; use
/// [`read_wide_by_lag`] for raw dumps.
pub fn read_wide(path: &Path) -> Result<SeriesTable, SeriesError> {
    let mut groups = read_wide_by_lag(path)?;
    match groups.len() {
        0 => Ok(SeriesTable::empty()),
        1 if groups[0].0.is_empty() => Ok(groups.remove(0).1),
        _ => Err(SeriesError::UnexpectedColumn {
            path: path.to_path_buf(),
            column: LAG_COLUMN.to_string(),
        }),
    }
}

/// Read a wide table and split it by the `lag` column.
///
/// Lags are returned in first-seen order. Without a `lag` column the
/// whole file is one group with an empty lag name.
pub fn read_wide_by_lag(path: &Path) -> Result<Vec<(String, SeriesTable)>, SeriesError> {
    let mut reader = csv::Reader::from_path(path).map_err(csv_err(path))?;
    let headers = reader.headers().map_err(csv_err(path))?.clone();
    if headers.is_empty() {
        return Ok(Vec::new());
    }

    let lag_col = headers.iter().position(|h| h == LAG_COLUMN);
    let geo_cols: Vec<usize> = (1..headers.len()).filter(|&i| Some(i) != lag_col).collect();
    let geographies: Vec<String> = geo_cols.iter().map(|&i| headers[i].to_string()).collect();

    let mut lag_order: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, (Vec<NaiveDate>, Vec<Vec<Option<f64>>>)> = HashMap::new();

    for (row_no, record) in reader.records().enumerate() {
        let record = record.map_err(csv_err(path))?;
        let line = row_no as u64 + 2;
        let date = parse_cell_date(path, line, record.get(0).unwrap_or_default())?;
        let lag = lag_col
            .and_then(|i| record.get(i))
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        let entry = grouped.entry(lag.clone()).or_insert_with(|| {
            lag_order.push(lag.clone());
            (Vec::new(), vec![Vec::new(); geo_cols.len()])
        });
        entry.0.push(date);
        for (slot, &col) in geo_cols.iter().enumerate() {
            let value = parse_cell_value(path, line, record.get(col).unwrap_or_default())?;
            entry.1[slot].push(value);
        }
    }

    let mut out = Vec::with_capacity(lag_order.len());
    for lag in lag_order {
        if let Some((dates, columns)) = grouped.remove(&lag) {
            out.push((lag, SeriesTable::new(dates, geographies.clone(), columns)?));
        }
    }
    Ok(out)
}

/// Write a wide table with a leading `date` column.
pub fn write_wide(path: &Path, table: &SeriesTable) -> Result<(), SeriesError> {
    let mut writer = csv::Writer::from_path(path).map_err(csv_err(path))?;
    let mut header = vec!["date".to_string()];
    header.extend(table.geographies().iter().cloned());
    writer.write_record(&header).map_err(csv_err(path))?;

    for (d, date) in table.dates().iter().enumerate() {
        let mut record = vec![date.to_string()];
        record.extend(
            (0..table.geographies().len()).map(|g| format_value(table.column_at(g)[d])),
        );
        writer.write_record(&record).map_err(csv_err(path))?;
    }
    writer.flush().map_err(|source| SeriesError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Read long-format `{date, geography, value}` rows.
pub fn read_long(path: &Path, columns: &LongColumns) -> Result<SeriesTable, SeriesError> {
    let mut reader = csv::Reader::from_path(path).map_err(csv_err(path))?;
    let headers = reader.headers().map_err(csv_err(path))?.clone();
    let find = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| SeriesError::MissingColumn {
                path: path.to_path_buf(),
                column: name.to_string(),
            })
    };
    let date_col = find(&columns.date)?;
    let geo_col = find(&columns.geography)?;
    let value_col = find(&columns.value)?;

    let mut rows = Vec::new();
    for (row_no, record) in reader.records().enumerate() {
        let record = record.map_err(csv_err(path))?;
        let line = row_no as u64 + 2;
        rows.push(LongRow {
            date: parse_cell_date(path, line, record.get(date_col).unwrap_or_default())?,
            geography: record.get(geo_col).unwrap_or_default().to_string(),
            value: parse_cell_value(path, line, record.get(value_col).unwrap_or_default())?,
        });
    }
    SeriesTable::from_long(rows)
}

/// Write long-format rows with the given column names.
pub fn write_long(path: &Path, table: &SeriesTable, columns: &LongColumns) -> Result<(), SeriesError> {
    let mut writer = csv::Writer::from_path(path).map_err(csv_err(path))?;
    writer
        .write_record([&columns.date, &columns.geography, &columns.value])
        .map_err(csv_err(path))?;
    for row in table.to_long() {
        writer
            .write_record([row.date.to_string(), row.geography, format_value(row.value)])
            .map_err(csv_err(path))?;
    }
    writer.flush().map_err(|source| SeriesError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_wide_roundtrip_keeps_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raw.csv");
        fs::write(&path, "date,ca,ny\n2022-05-02,2,\n2022-05-01,1,3.5\n").unwrap();

        let table = read_wide(&path).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.column("ny").unwrap(), &[Some(3.5), None]);

        let out = dir.path().join("out.csv");
        write_wide(&out, &table).unwrap();
        assert_eq!(read_wide(&out).unwrap(), table);
    }

    #[test]
    fn test_read_by_lag_groups_in_first_seen_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("basic_lags.csv");
        fs::write(
            &path,
            ",ca,ny,lag\n\
             05/01/2022,1,2,1\n\
             05/02/2022,1,2,1\n\
             05/01/2022,5,6,var\n",
        )
        .unwrap();

        let groups = read_wide_by_lag(&path).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "1");
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].0, "var");
        assert_eq!(groups[1].1.geographies(), &["ca".to_string(), "ny".to_string()]);
        assert!(read_wide(&path).is_err());
    }

    #[test]
    fn test_bad_number_reports_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, "date,ca\n2022-05-01,abc\n").unwrap();
        match read_wide(&path) {
            Err(SeriesError::Parse { line, what, .. }) => {
                assert_eq!(line, 2);
                assert_eq!(what, "number");
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_long_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("long.csv");
        fs::write(
            &path,
            "geo_id,time_value,val\nca,2022-05-01,1\nny,2022-05-01,2\nca,2022-05-02,3\n",
        )
        .unwrap();
        let columns = LongColumns {
            date: "time_value".into(),
            geography: "geo_id".into(),
            value: "val".into(),
        };
        let table = read_long(&path, &columns).unwrap();
        assert_eq!(table.value(NaiveDate::from_ymd_opt(2022, 5, 2).unwrap(), "ca"), Some(3.0));

        let out = dir.path().join("long_out.csv");
        write_long(&out, &table, &LongColumns::default()).unwrap();
        let back = read_long(&out, &LongColumns::default()).unwrap();
        assert_eq!(back, table);
    }
}
