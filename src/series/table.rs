//! Wide per-geography daily table.

use std::collections::HashMap;

use chrono::{Duration, NaiveDate};

use super::{LocationSeries, SeriesError};
use crate::types::DateRange;

/// Gap handling for [`SeriesTable::reindex_daily`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// Inserted days stay missing.
    Missing,
    /// Inserted days take the last observed value of the column.
    Forward,
}

/// One `{date, geography, value}` observation in long format.
#[derive(Debug, Clone, PartialEq)]
pub struct LongRow {
    pub date: NaiveDate,
    pub geography: String,
    pub value: Option<f64>,
}

/// Geography × date table with a sorted, duplicate-free date axis.
///
/// Columns are stored per geography in the order geographies were first
/// seen; every column has one entry per date.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SeriesTable {
    dates: Vec<NaiveDate>,
    geographies: Vec<String>,
    columns: Vec<Vec<Option<f64>>>,
}

fn same_value(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => x == y || (x.is_nan() && y.is_nan()),
        _ => false,
    }
}

impl SeriesTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from wide rows. Dates may arrive unsorted; rows repeated with
    /// identical values are collapsed, repeated dates that disagree in any
    /// column are rejected.
    pub fn new(
        dates: Vec<NaiveDate>,
        geographies: Vec<String>,
        columns: Vec<Vec<Option<f64>>>,
    ) -> Result<Self, SeriesError> {
        if columns.len() != geographies.len() {
            return Err(SeriesError::ShapeMismatch {
                geography: "<columns>".to_string(),
                got: columns.len(),
                expected: geographies.len(),
            });
        }
        for (geo, column) in geographies.iter().zip(&columns) {
            if column.len() != dates.len() {
                return Err(SeriesError::ShapeMismatch {
                    geography: geo.clone(),
                    got: column.len(),
                    expected: dates.len(),
                });
            }
        }
        let mut seen = std::collections::HashSet::new();
        for geo in &geographies {
            if !seen.insert(geo.as_str()) {
                return Err(SeriesError::DuplicateGeography(geo.clone()));
            }
        }

        let mut order: Vec<usize> = (0..dates.len()).collect();
        order.sort_by_key(|&i| dates[i]);

        let mut out_dates: Vec<NaiveDate> = Vec::with_capacity(dates.len());
        let mut out_columns: Vec<Vec<Option<f64>>> =
            vec![Vec::with_capacity(dates.len()); geographies.len()];
        let mut last_row: Option<usize> = None;

        for &row in &order {
            let date = dates[row];
            if let Some(prev) = last_row {
                if dates[prev] == date {
                    for (g, column) in columns.iter().enumerate() {
                        if !same_value(column[prev], column[row]) {
                            return Err(SeriesError::ConflictingDuplicate {
                                date,
                                geography: geographies[g].clone(),
                            });
                        }
                    }
                    continue;
                }
            }
            out_dates.push(date);
            for (g, column) in columns.iter().enumerate() {
                out_columns[g].push(column[row]);
            }
            last_row = Some(row);
        }

        Ok(Self {
            dates: out_dates,
            geographies,
            columns: out_columns,
        })
    }

    /// Build from long-format rows. Geographies keep first-seen order.
    pub fn from_long<I>(rows: I) -> Result<Self, SeriesError>
    where
        I: IntoIterator<Item = LongRow>,
    {
        let mut geographies: Vec<String> = Vec::new();
        let mut geo_index: HashMap<String, usize> = HashMap::new();
        let mut cells: HashMap<(NaiveDate, usize), Option<f64>> = HashMap::new();
        let mut dates: Vec<NaiveDate> = Vec::new();

        for row in rows {
            let g = match geo_index.get(&row.geography) {
                Some(&g) => g,
                None => {
                    geographies.push(row.geography.clone());
                    geo_index.insert(row.geography.clone(), geographies.len() - 1);
                    geographies.len() - 1
                }
            };
            match cells.get(&(row.date, g)) {
                Some(existing) if !same_value(*existing, row.value) => {
                    return Err(SeriesError::ConflictingDuplicate {
                        date: row.date,
                        geography: row.geography,
                    });
                }
                Some(_) => {}
                None => {
                    cells.insert((row.date, g), row.value);
                    dates.push(row.date);
                }
            }
        }

        dates.sort();
        dates.dedup();
        let columns = (0..geographies.len())
            .map(|g| {
                dates
                    .iter()
                    .map(|d| cells.get(&(*d, g)).copied().flatten())
                    .collect()
            })
            .collect();

        Ok(Self {
            dates,
            geographies,
            columns,
        })
    }

    /// Assemble a table from per-geography series over the union of their dates.
    pub fn from_series(series: &[LocationSeries]) -> Result<Self, SeriesError> {
        Self::from_long(series.iter().flat_map(|s| {
            s.points().iter().map(move |(date, value)| LongRow {
                date: *date,
                geography: s.geography().to_string(),
                value: *value,
            })
        }))
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn geographies(&self) -> &[String] {
        &self.geographies
    }

    /// Number of dates.
    pub fn len(&self) -> usize {
        self.dates.len()
    }

    /// True when there is no date or no geography to work on.
    pub fn is_empty(&self) -> bool {
        self.dates.is_empty() || self.geographies.is_empty()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.dates.first().copied()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.dates.last().copied()
    }

    pub fn date_index(&self, date: NaiveDate) -> Option<usize> {
        self.dates.binary_search(&date).ok()
    }

    pub fn geography_index(&self, geography: &str) -> Option<usize> {
        self.geographies.iter().position(|g| g == geography)
    }

    pub fn column(&self, geography: &str) -> Option<&[Option<f64>]> {
        self.geography_index(geography)
            .map(|g| self.columns[g].as_slice())
    }

    pub fn column_at(&self, index: usize) -> &[Option<f64>] {
        &self.columns[index]
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &[Option<f64>])> {
        self.geographies
            .iter()
            .map(String::as_str)
            .zip(self.columns.iter().map(Vec::as_slice))
    }

    pub fn value(&self, date: NaiveDate, geography: &str) -> Option<f64> {
        let d = self.date_index(date)?;
        self.column(geography).and_then(|c| c[d])
    }

    /// One geography as a standalone series.
    pub fn series(&self, geography: &str, signal: &str) -> Option<LocationSeries> {
        let column = self.column(geography)?;
        let points = self.dates.iter().copied().zip(column.iter().copied()).collect();
        LocationSeries::new(geography, signal, points).ok()
    }

    /// Same axis and geographies, new column values.
    ///
    /// `f` receives the column index and the column and must return a
    /// column of the same length.
    pub fn map_columns<F>(&self, mut f: F) -> Self
    where
        F: FnMut(usize, &[Option<f64>]) -> Vec<Option<f64>>,
    {
        let columns = self
            .columns
            .iter()
            .enumerate()
            .map(|(g, column)| {
                let mapped = f(g, column);
                debug_assert_eq!(mapped.len(), column.len());
                mapped
            })
            .collect();
        Self {
            dates: self.dates.clone(),
            geographies: self.geographies.clone(),
            columns,
        }
    }

    /// Restrict to the given geographies, in the given order.
    pub fn select(&self, geographies: &[String]) -> Result<Self, SeriesError> {
        let mut columns = Vec::with_capacity(geographies.len());
        for geo in geographies {
            let column = self
                .column(geo)
                .ok_or_else(|| SeriesError::UnknownGeography(geo.clone()))?;
            columns.push(column.to_vec());
        }
        Ok(Self {
            dates: self.dates.clone(),
            geographies: geographies.to_vec(),
            columns,
        })
    }

    /// Rows whose date falls inside `range`.
    pub fn slice_dates(&self, range: DateRange) -> Self {
        let keep: Vec<usize> = (0..self.dates.len())
            .filter(|&i| range.contains(self.dates[i]))
            .collect();
        Self {
            dates: keep.iter().map(|&i| self.dates[i]).collect(),
            geographies: self.geographies.clone(),
            columns: self
                .columns
                .iter()
                .map(|c| keep.iter().map(|&i| c[i]).collect())
                .collect(),
        }
    }

    /// Calendar days between the first and last date that have no row.
    pub fn missing_dates(&self) -> Vec<NaiveDate> {
        let (Some(first), Some(last)) = (self.first_date(), self.last_date()) else {
            return Vec::new();
        };
        first
            .iter_days()
            .take_while(|d| *d <= last)
            .filter(|d| self.date_index(*d).is_none())
            .collect()
    }

    /// Reindex onto every day from the first to the last date.
    pub fn reindex_daily(&self, fill: Fill) -> Self {
        let (Some(first), Some(last)) = (self.first_date(), self.last_date()) else {
            return self.clone();
        };
        self.reindex_range(first, last, fill)
    }

    /// Reindex onto every day of `[start, end]`, dropping rows outside it.
    pub fn reindex_range(&self, start: NaiveDate, end: NaiveDate, fill: Fill) -> Self {
        let axis: Vec<NaiveDate> = start.iter_days().take_while(|d| *d <= end).collect();
        let columns = self
            .columns
            .iter()
            .map(|column| {
                let mut last: Option<f64> = None;
                axis.iter()
                    .map(|d| match self.date_index(*d) {
                        Some(i) => {
                            if column[i].is_some() {
                                last = column[i];
                            }
                            match (column[i], fill) {
                                (None, Fill::Forward) => last,
                                (value, _) => value,
                            }
                        }
                        None => match fill {
                            Fill::Forward => last,
                            Fill::Missing => None,
                        },
                    })
                    .collect()
            })
            .collect();
        Self {
            dates: axis,
            geographies: self.geographies.clone(),
            columns,
        }
    }

    /// Forward-fill interior gaps, then back-fill leading ones.
    pub fn fill_forward_backward(&self) -> Self {
        self.map_columns(|_, column| {
            let mut out: Vec<Option<f64>> = Vec::with_capacity(column.len());
            let mut last = None;
            for value in column {
                if value.is_some() {
                    last = *value;
                }
                out.push(last);
            }
            let first_seen = out.iter().find_map(|v| *v);
            for value in out.iter_mut() {
                if value.is_some() {
                    break;
                }
                *value = first_seen;
            }
            out
        })
    }

    /// Long-format rows in date-major, geography-minor order.
    pub fn to_long(&self) -> Vec<LongRow> {
        let mut rows = Vec::with_capacity(self.dates.len() * self.geographies.len());
        for (d, date) in self.dates.iter().enumerate() {
            for (g, geo) in self.geographies.iter().enumerate() {
                rows.push(LongRow {
                    date: *date,
                    geography: geo.clone(),
                    value: self.columns[g][d],
                });
            }
        }
        rows
    }

    /// True when the axis has one row per calendar day.
    pub fn is_daily(&self) -> bool {
        self.dates
            .windows(2)
            .all(|w| w[1] - w[0] == Duration::days(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2022, 5, day).unwrap()
    }

    fn long(day: u32, geo: &str, value: Option<f64>) -> LongRow {
        LongRow {
            date: d(day),
            geography: geo.to_string(),
            value,
        }
    }

    #[test]
    fn test_new_sorts_and_dedupes_identical_rows() {
        let table = SeriesTable::new(
            vec![d(3), d(1), d(3)],
            vec!["ca".into()],
            vec![vec![Some(3.0), Some(1.0), Some(3.0)]],
        )
        .unwrap();
        assert_eq!(table.dates(), &[d(1), d(3)]);
        assert_eq!(table.column("ca").unwrap(), &[Some(1.0), Some(3.0)]);
    }

    #[test]
    fn test_new_rejects_conflicting_duplicates() {
        let err = SeriesTable::new(
            vec![d(1), d(1)],
            vec!["ca".into()],
            vec![vec![Some(1.0), Some(2.0)]],
        )
        .unwrap_err();
        assert!(matches!(err, SeriesError::ConflictingDuplicate { .. }));
    }

    #[test]
    fn test_from_long_conflict_and_dedupe() {
        let ok = SeriesTable::from_long(vec![
            long(1, "ca", Some(1.0)),
            long(1, "ca", Some(1.0)),
            long(2, "ny", Some(5.0)),
        ])
        .unwrap();
        assert_eq!(ok.len(), 2);
        assert_eq!(ok.geographies(), &["ca".to_string(), "ny".to_string()]);
        assert_eq!(ok.value(d(2), "ca"), None);

        let err = SeriesTable::from_long(vec![long(1, "ca", Some(1.0)), long(1, "ca", Some(2.0))]);
        assert!(err.is_err());
    }

    #[test]
    fn test_reindex_daily_forward_fill() {
        let table = SeriesTable::new(
            vec![d(1), d(4)],
            vec!["ca".into()],
            vec![vec![Some(1.0), Some(4.0)]],
        )
        .unwrap();
        assert_eq!(table.missing_dates(), vec![d(2), d(3)]);

        let filled = table.reindex_daily(Fill::Forward);
        assert!(filled.is_daily());
        assert_eq!(
            filled.column("ca").unwrap(),
            &[Some(1.0), Some(1.0), Some(1.0), Some(4.0)]
        );

        let gaps = table.reindex_daily(Fill::Missing);
        assert_eq!(gaps.column("ca").unwrap()[1], None);
    }

    #[test]
    fn test_fill_forward_backward() {
        let table = SeriesTable::new(
            vec![d(1), d(2), d(3), d(4)],
            vec!["ca".into()],
            vec![vec![None, Some(2.0), None, Some(4.0)]],
        )
        .unwrap();
        let filled = table.fill_forward_backward();
        assert_eq!(
            filled.column("ca").unwrap(),
            &[Some(2.0), Some(2.0), Some(2.0), Some(4.0)]
        );
    }

    #[test]
    fn test_select_unknown_geography() {
        let table = SeriesTable::from_long(vec![long(1, "ca", Some(1.0))]).unwrap();
        assert!(table.select(&["tx".to_string()]).is_err());
    }

    #[test]
    fn test_empty_table() {
        assert!(SeriesTable::empty().is_empty());
        let no_geo = SeriesTable::new(vec![d(1)], vec![], vec![]).unwrap();
        assert!(no_geo.is_empty());
    }
}
