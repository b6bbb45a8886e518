//! The span of export dates a validation run looks at.

use chrono::NaiveDate;

use super::errors::ValidationError;
use crate::types::{shift_days, DateRange};

/// `span_length` days ending on `end_date`, both ends included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub span_length: u32,
}

impl TimeWindow {
    pub fn new(end_date: NaiveDate, span_length: u32) -> Result<Self, ValidationError> {
        let start_date = shift_days(end_date, -i64::from(span_length)).ok_or(ValidationError::SpanLength {
            end_date,
            span_length,
        })?;
        Ok(Self {
            start_date,
            end_date,
            span_length,
        })
    }

    /// `end_date` is `today`, `today-N` or `YYYY-MM-DD`.
    pub fn from_params(end_date: &str, span_length: u32, today: NaiveDate) -> Result<Self, ValidationError> {
        Self::new(resolve_end_date(end_date, today)?, span_length)
    }

    /// Every date of the window, `span_length + 1` of them.
    pub fn date_seq(&self) -> Vec<NaiveDate> {
        self.range().days().collect()
    }

    pub fn range(&self) -> DateRange {
        DateRange {
            start: self.start_date,
            end: self.end_date,
        }
    }
}

fn resolve_end_date(raw: &str, today: NaiveDate) -> Result<NaiveDate, ValidationError> {
    let raw = raw.trim();
    if raw == "today" {
        return Ok(today);
    }
    if let Some(back) = raw.strip_prefix("today-") {
        let days: u32 = back
            .parse()
            .map_err(|_| ValidationError::EndDate(raw.to_string()))?;
        return shift_days(today, -i64::from(days)).ok_or_else(|| ValidationError::EndDate(raw.to_string()));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| ValidationError::EndDate(raw.to_string()))
}
