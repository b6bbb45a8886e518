//! Validation failures and the hard errors that stop a validation run.

use std::fmt;
use std::path::PathBuf;

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

use super::datafetcher::FetchError;
use crate::filename::{ExportName, FilenameError};

/// Hard errors: the battery could not run at all.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("params must have a top-level 'validation' object to run validation")]
    MissingSection,

    #[error("common.export_dir is required to run validation")]
    MissingExportDir,

    #[error("validation.common.span_length is required to run validation")]
    MissingSpanLength,

    #[error("suppressed_errors must be a list of objects")]
    SuppressedNotObjects,

    #[error(r#"suppressed_errors may only have fields "check_name", "date", "geo_type", "signal""#)]
    SuppressedFields,

    #[error("suppressed_errors entry has invalid {field} '{value}'")]
    SuppressedValue { field: &'static str, value: String },

    #[error("invalid end_date '{0}': expected \"today\", \"today-N\" or YYYY-MM-DD")]
    EndDate(String),

    #[error("span_length {span_length} reaches back past the supported calendar from {end_date}")]
    SpanLength { end_date: NaiveDate, span_length: u32 },

    #[error("cannot list export directory {}: {source}", path.display())]
    ExportDir {
        path: PathBuf,
        #[source]
        source: FetchError,
    },
}

/// One finding of one check.
///
/// `None` context fields mean the failure is not tied to that dimension.
/// When used as a suppression template, a `None` field matches anything;
/// see [`ValidationFailure::matches`]. Structural equality stays exact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationFailure {
    pub check_name: Option<String>,
    pub date: Option<NaiveDate>,
    pub geo_type: Option<String>,
    pub signal: Option<String>,
    pub message: String,
}

impl ValidationFailure {
    pub fn new(check_name: &str, message: impl Into<String>) -> Self {
        Self {
            check_name: Some(check_name.to_string()),
            date: None,
            geo_type: None,
            signal: None,
            message: message.into(),
        }
    }

    /// Failure tied to one geo type and signal.
    pub fn for_combo(check_name: &str, geo_type: &str, signal: &str, message: impl Into<String>) -> Self {
        Self {
            geo_type: Some(geo_type.to_string()),
            signal: Some(signal.to_string()),
            ..Self::new(check_name, message)
        }
    }

    /// Failure tied to one date of one geo type and signal.
    pub fn for_date(
        check_name: &str,
        date: NaiveDate,
        geo_type: &str,
        signal: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            date: Some(date),
            ..Self::for_combo(check_name, geo_type, signal, message)
        }
    }

    /// Failure whose context comes from an export filename
    /// `{date}_{geo_type}_{signal}.{extension}`.
    pub fn from_filename(
        check_name: &str,
        filename: &str,
        message: impl Into<String>,
    ) -> Result<Self, FilenameError> {
        let name = ExportName::parse(filename)?;
        Ok(Self::for_date(
            check_name,
            name.date,
            &name.geo_type,
            &name.signal,
            message,
        ))
    }

    /// Build a suppression template from one `suppressed_errors` entry.
    pub fn from_template(
        entry: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, ValidationError> {
        const FIELDS: [&str; 4] = ["check_name", "date", "geo_type", "signal"];
        if entry.keys().any(|k| !FIELDS.contains(&k.as_str())) {
            return Err(ValidationError::SuppressedFields);
        }

        let text = |field: &'static str| -> Result<Option<String>, ValidationError> {
            match entry.get(field) {
                None | Some(serde_json::Value::Null) => Ok(None),
                Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
                Some(other) => Err(ValidationError::SuppressedValue {
                    field,
                    value: other.to_string(),
                }),
            }
        };

        let date = text("date")?
            .map(|raw| {
                NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                    .map_err(|_| ValidationError::SuppressedValue { field: "date", value: raw })
            })
            .transpose()?;

        Ok(Self {
            check_name: text("check_name")?,
            date,
            geo_type: text("geo_type")?,
            signal: text("signal")?,
            message: String::new(),
        })
    }

    /// Wildcard match: each context field must be equal or `None` on
    /// either side. Messages are ignored.
    pub fn matches(&self, template: &Self) -> bool {
        fn field<T: PartialEq>(a: Option<&T>, b: Option<&T>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        }
        field(self.check_name.as_ref(), template.check_name.as_ref())
            && field(self.date.as_ref(), template.date.as_ref())
            && field(self.geo_type.as_ref(), template.geo_type.as_ref())
            && field(self.signal.as_ref(), template.signal.as_ref())
    }

    pub fn is_suppressed(&self, templates: &[Self]) -> bool {
        templates.iter().any(|t| self.matches(t))
    }

    pub fn check_name_str(&self) -> &str {
        self.check_name.as_deref().unwrap_or("*")
    }

    pub fn signal_str(&self) -> &str {
        self.signal.as_deref().unwrap_or("*")
    }

    pub fn geo_type_str(&self) -> &str {
        self.geo_type.as_deref().unwrap_or("*")
    }

    pub fn date_str(&self) -> String {
        self.date.map_or_else(|| "*".to_string(), |d| d.to_string())
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed for {} at resolution {} on {}: {}",
            self.check_name_str(),
            self.signal_str(),
            self.geo_type_str(),
            self.date_str(),
            self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn template(value: serde_json::Value) -> Result<ValidationFailure, ValidationError> {
        match value {
            serde_json::Value::Object(map) => ValidationFailure::from_template(&map),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_from_filename_fills_context() {
        let failure =
            ValidationFailure::from_filename("check", "20200408_state_signal.csv", "msg").unwrap();
        assert_eq!(failure.date, Some(d(2020, 4, 8)));
        assert_eq!(failure.geo_type.as_deref(), Some("state"));
        assert_eq!(failure.signal.as_deref(), Some("signal"));
    }

    #[test]
    fn test_from_filename_errors() {
        assert!(matches!(
            ValidationFailure::from_filename("check", "20200408_state.csv", ""),
            Err(FilenameError::Format(_))
        ));
        assert!(matches!(
            ValidationFailure::from_filename("check", "2020408_state_signal.csv", ""),
            Err(FilenameError::Date(_))
        ));
    }

    #[test]
    fn test_matches_with_wildcards() {
        let failure = ValidationFailure::for_date("check", d(2020, 4, 8), "state", "signal", "m");
        let by_signal = template(json!({"signal": "signal"})).unwrap();
        let by_date = template(json!({"check_name": "check", "date": "2020-04-08"})).unwrap();
        let other_geo = template(json!({"geo_type": "county"})).unwrap();

        assert!(failure.matches(&by_signal));
        assert!(failure.matches(&by_date));
        assert!(!failure.matches(&other_geo));
        assert!(failure.is_suppressed(&[other_geo, by_signal]));
    }

    #[test]
    fn test_equality_is_exact() {
        let a = ValidationFailure::for_combo("check", "state", "signal", "m");
        let b = ValidationFailure::new("check", "m");
        assert!(a.matches(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_template_rejects_unknown_fields() {
        let err = template(json!({"check_name": "c", "message": "m"})).unwrap_err();
        assert!(err.to_string().contains(r#"may only have fields "check_name""#));
    }

    #[test]
    fn test_display() {
        let failure = ValidationFailure::for_date("check_val_lt_0", d(2020, 4, 8), "state", "sig", "bad");
        assert_eq!(
            failure.to_string(),
            "check_val_lt_0 failed for sig at resolution state on 2020-04-08: bad"
        );
        let undated = ValidationFailure::new("check_missing_date_files", "gap");
        assert_eq!(
            undated.to_string(),
            "check_missing_date_files failed for * at resolution * on *: gap"
        );
    }
}
