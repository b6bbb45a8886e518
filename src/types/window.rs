//! Date ranges and the AR training/evaluation window.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Date formats accepted in params files and CSV date columns.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y%m%d"];

/// Parse a calendar date in any of the accepted formats.
///
/// Timestamps written by spreadsheet tools (`2022-05-01 00:00:00`) are
/// truncated to their date part.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    let date_part = trimmed.split([' ', 'T']).next().unwrap_or(trimmed);
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date_part, fmt).ok())
}

/// `date` moved by `days` (negative goes back), or `None` when the result
/// falls off the calendar chrono can represent.
pub fn shift_days(date: NaiveDate, days: i64) -> Option<NaiveDate> {
    Duration::try_days(days).and_then(|delta| date.checked_add_signed(delta))
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WindowError {
    #[error("date range starts {start} after it ends {end}")]
    Inverted { start: NaiveDate, end: NaiveDate },

    #[error("{name} range ends {end}, after the available data ends {data_end}")]
    BeyondData {
        name: &'static str,
        end: NaiveDate,
        data_end: NaiveDate,
    },

    #[error(
        "Necessary start date for AR parameters ({required}) is before that provided in the data ({available})"
    )]
    Insufficient {
        required: NaiveDate,
        available: NaiveDate,
    },

    #[error("moving {date} by {days} days leaves the supported calendar")]
    OutOfRange { date: NaiveDate, days: i64 },
}

/// Inclusive calendar range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, WindowError> {
        if start > end {
            return Err(WindowError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    /// Every day of the range in order.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Number of days, both ends included.
    pub fn len(&self) -> usize {
        usize::try_from((self.end - self.start).num_days() + 1).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// The three ranges an AR flagging run works over.
///
/// `resid_range` supplies the residual distribution and `eval_range` the
/// dates being judged against it. The two may come in either chronological
/// order, which is how backtests replay old evaluation periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub df_range: DateRange,
    pub resid_range: DateRange,
    pub eval_range: DateRange,
}

impl Window {
    /// Build a window, checking that every predicted date has
    /// `ar_lags + n_train` days of history after the first data date.
    pub fn new(
        df_range: DateRange,
        resid_range: DateRange,
        eval_range: DateRange,
        ar_lags: usize,
        n_train: usize,
    ) -> Result<Self, WindowError> {
        for (name, range) in [("resid", resid_range), ("eval", eval_range)] {
            if range.end > df_range.end {
                return Err(WindowError::BeyondData {
                    name,
                    end: range.end,
                    data_end: df_range.end,
                });
            }
        }

        let earliest = resid_range.start.min(eval_range.start);
        let history = ar_lags
            .checked_add(n_train)
            .and_then(|h| i64::try_from(h).ok())
            .unwrap_or(i64::MAX);
        // History reaching off the calendar is as insufficient as it gets.
        let required = shift_days(earliest, -history).unwrap_or(NaiveDate::MIN);
        if required <= df_range.start {
            return Err(WindowError::Insufficient {
                required,
                available: df_range.start,
            });
        }

        Ok(Self {
            df_range,
            resid_range,
            eval_range,
        })
    }

    /// Dates the AR model must predict: residual and evaluation days,
    /// sorted and without repeats.
    pub fn prediction_dates(&self) -> Vec<NaiveDate> {
        let mut dates: Vec<NaiveDate> = self
            .resid_range
            .days()
            .chain(self.eval_range.days())
            .collect();
        dates.sort();
        dates.dedup();
        dates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    fn range(a: &str, b: &str) -> DateRange {
        DateRange::new(d(a), d(b)).unwrap()
    }

    #[test]
    fn test_parse_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2022, 5, 1).unwrap();
        assert_eq!(parse_date("2022-05-01"), Some(expected));
        assert_eq!(parse_date("05/01/2022"), Some(expected));
        assert_eq!(parse_date("20220501"), Some(expected));
        assert_eq!(parse_date("2022-05-01 00:00:00"), Some(expected));
        assert_eq!(parse_date("May 1st"), None);
    }

    #[test]
    fn test_range_days_inclusive() {
        let r = range("2022-05-01", "2022-05-04");
        assert_eq!(r.len(), 4);
        assert_eq!(r.days().count(), 4);
        assert!(r.contains(d("2022-05-04")));
        assert!(!r.contains(d("2022-05-05")));
    }

    #[test]
    fn test_inverted_range_rejected() {
        assert!(matches!(
            DateRange::new(d("2022-05-04"), d("2022-05-01")),
            Err(WindowError::Inverted { .. })
        ));
    }

    #[test]
    fn test_window_swapped_ranges_allowed() {
        let df = range("2022-05-01", "2022-05-20");
        let resid = range("2022-05-15", "2022-05-17");
        let eval = range("2022-05-10", "2022-05-12");
        let window = Window::new(df, resid, eval, 2, 4).unwrap();
        assert_eq!(window.prediction_dates().len(), 6);
    }

    #[test]
    fn test_window_insufficient_history() {
        let df = range("2022-05-01", "2022-05-20");
        let resid = range("2022-05-05", "2022-05-10");
        let eval = range("2022-05-10", "2022-05-12");
        let err = Window::new(df, resid, eval, 4, 2).unwrap_err();
        assert!(matches!(err, WindowError::Insufficient { .. }));
    }

    #[test]
    fn test_window_history_must_be_strictly_after_start() {
        let df = range("2022-05-01", "2022-05-20");
        let eval = range("2022-05-10", "2022-05-12");
        // 2022-05-07 - 6 days lands exactly on the first data date
        let resid = range("2022-05-07", "2022-05-09");
        assert!(Window::new(df, resid, eval, 4, 2).is_err());
        let resid = range("2022-05-08", "2022-05-09");
        assert!(Window::new(df, resid, eval, 4, 2).is_ok());
    }

    #[test]
    fn test_shift_days_off_calendar() {
        assert_eq!(shift_days(d("2022-05-01"), -3), Some(d("2022-04-28")));
        assert_eq!(shift_days(d("2022-05-01"), 1), Some(d("2022-05-02")));
        assert_eq!(shift_days(d("2022-05-01"), -999_999_999), None);
        assert_eq!(shift_days(d("2022-05-01"), i64::MIN), None);
        assert_eq!(shift_days(d("2022-05-01"), i64::MAX), None);
    }

    #[test]
    fn test_window_huge_history_is_insufficient() {
        let df = range("2022-05-01", "2022-05-20");
        let resid = range("2022-05-15", "2022-05-17");
        let eval = range("2022-05-18", "2022-05-20");
        let err = Window::new(df, resid, eval, usize::MAX, usize::MAX).unwrap_err();
        assert!(matches!(err, WindowError::Insufficient { required, .. } if required == NaiveDate::MIN));
        let err = Window::new(df, resid, eval, 1, 100_000_000_000).unwrap_err();
        assert!(matches!(err, WindowError::Insufficient { .. }));
    }

    #[test]
    fn test_window_eval_beyond_data() {
        let df = range("2022-05-01", "2022-05-10");
        let resid = range("2022-05-08", "2022-05-09");
        let eval = range("2022-05-10", "2022-05-12");
        assert!(matches!(
            Window::new(df, resid, eval, 1, 2),
            Err(WindowError::BeyondData { name: "eval", .. })
        ));
    }
}
