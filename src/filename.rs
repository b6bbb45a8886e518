//! Export filename convention `{date}_{geo_type}_{signal}.{extension}`.
//!
//! This is the only place the convention is parsed or formatted; the flag
//! cache, `rel_files_table` and the validator all go through it.

use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilenameError {
    #[error(
        "`filename` argument expected to be in \"{{date}}_{{geo_type}}_{{signal}}.{{extension}}\" format, got '{0}'"
    )]
    Format(String),

    #[error("date in `filename` must be in \"YYYYMMDD\" format, got '{0}'")]
    Date(String),
}

/// The pieces of an export filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportName {
    pub date: NaiveDate,
    pub geo_type: String,
    pub signal: String,
    pub extension: String,
}

impl ExportName {
    /// Parse a bare filename (no directory part).
    ///
    /// The stem is split on the first two underscores, so signals may
    /// themselves contain underscores. Geo types may not.
    pub fn parse(filename: &str) -> Result<Self, FilenameError> {
        let (stem, extension) = match filename.split_once('.') {
            Some((stem, rest)) => (stem, rest),
            None => (filename, ""),
        };
        let mut parts = stem.splitn(3, '_');
        let (Some(date), Some(geo_type), Some(signal)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(FilenameError::Format(filename.to_string()));
        };
        let date = parse_compact_date(date).ok_or_else(|| FilenameError::Date(date.to_string()))?;
        Ok(Self {
            date,
            geo_type: geo_type.to_string(),
            signal: signal.to_string(),
            extension: extension.to_string(),
        })
    }

    pub fn file_name(&self) -> String {
        format_filename(self.date, &self.geo_type, &self.signal, &self.extension)
    }
}

/// Inverse of [`ExportName::parse`].
pub fn format_filename(date: NaiveDate, geo_type: &str, signal: &str, extension: &str) -> String {
    format!("{}_{geo_type}_{signal}.{extension}", date.format("%Y%m%d"))
}

/// Parse exactly eight digits as `YYYYMMDD`.
pub fn parse_compact_date(raw: &str) -> Option<NaiveDate> {
    if raw.len() != 8 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(raw, "%Y%m%d").ok()
}

/// Date embedded in the leading `_`-delimited segment of a filename, if any.
pub fn leading_date(filename: &str) -> Option<NaiveDate> {
    let head = filename.split('_').next()?;
    let head = head.split('.').next()?;
    parse_compact_date(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_name() {
        let name = ExportName::parse("20200408_state_signal.csv").unwrap();
        assert_eq!(name.date, NaiveDate::from_ymd_opt(2020, 4, 8).unwrap());
        assert_eq!(name.geo_type, "state");
        assert_eq!(name.signal, "signal");
        assert_eq!(name.extension, "csv");
    }

    #[test]
    fn test_signal_keeps_underscores() {
        let name = ExportName::parse("20200408_county_smoothed_adj_cli.csv").unwrap();
        assert_eq!(name.geo_type, "county");
        assert_eq!(name.signal, "smoothed_adj_cli");
        assert_eq!(name.file_name(), "20200408_county_smoothed_adj_cli.csv");
    }

    #[test]
    fn test_too_few_segments_is_format_error() {
        let err = ExportName::parse("20200408_state.csv").unwrap_err();
        assert!(matches!(err, FilenameError::Format(_)));
        assert!(err.to_string().contains("{date}_{geo_type}_{signal}.{extension}"));
    }

    #[test]
    fn test_bad_date_is_date_error() {
        let err = ExportName::parse("2020048_state_signal.csv").unwrap_err();
        assert!(matches!(err, FilenameError::Date(_)));
        assert!(err.to_string().contains("YYYYMMDD"));
        assert!(ExportName::parse("20201308_state_signal.csv").is_err());
    }

    #[test]
    fn test_leading_date() {
        assert_eq!(
            leading_date("20220502_state_doses_admin_7dav.csv"),
            NaiveDate::from_ymd_opt(2022, 5, 2)
        );
        assert_eq!(leading_date("readme_state_doses.csv"), None);
    }
}
