//! Export validation.
//!
//! ## Architecture
//!
//! ```text
//! Params ──► Validator::new ──► (suppression templates, time window)
//!                 │
//!                 ▼
//! export_dir ──► load_all_files ──► StaticValidator  ──┐
//!                     │                                 ├──► ValidationReport<Checking>
//!                     └──► aggregate_frames ──► DynamicValidator ◄── ReferenceSource
//!                                                        │
//!                                                        ▼
//!                                             ValidationReport<Reported>
//! ```
//!
//! Every check increments `total_checks` whether or not it fails, and no
//! check stops the battery. Suppressed errors are counted but do not make
//! the run unsuccessful.

pub mod datafetcher;
pub mod dynamic_checks;
pub mod errors;
pub mod report;
pub mod static_checks;
pub mod time_window;

use std::path::PathBuf;

use chrono::{Local, NaiveDate};
use tracing::info;

use crate::config::Params;

pub use datafetcher::{ArchiveDirectory, ReferenceSource};
pub use dynamic_checks::DynamicValidator;
pub use errors::{ValidationError, ValidationFailure};
pub use report::{Checking, Reported, ValidationReport};
pub use static_checks::StaticValidator;
pub use time_window::TimeWindow;

/// A configured validation run over one export directory.
pub struct Validator {
    export_dir: PathBuf,
    suppressed_errors: Vec<ValidationFailure>,
    time_window: TimeWindow,
    data_source: String,
    dry_run: bool,
    today: NaiveDate,
    static_validation: StaticValidator,
    dynamic_validation: DynamicValidator,
    reference: Option<Box<dyn ReferenceSource>>,
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("export_dir", &self.export_dir)
            .field("time_window", &self.time_window)
            .field("data_source", &self.data_source)
            .field("dry_run", &self.dry_run)
            .field("reference", &self.reference.as_ref().map(|r| r.name().to_string()))
            .finish_non_exhaustive()
    }
}

impl Validator {
    pub fn new(params: &Params) -> Result<Self, ValidationError> {
        Self::with_today(params, Local::now().date_naive())
    }

    /// As [`Validator::new`], resolving `today`-relative dates against
    /// `today`.
    pub fn with_today(params: &Params, today: NaiveDate) -> Result<Self, ValidationError> {
        let validation = params.validation.as_ref().ok_or(ValidationError::MissingSection)?;
        let export_dir = params
            .common
            .export_dir
            .clone()
            .ok_or(ValidationError::MissingExportDir)?;

        let suppressed_errors = parse_suppressed(&validation.common.suppressed_errors)?;

        let span_length = validation
            .common
            .span_length
            .ok_or(ValidationError::MissingSpanLength)?;
        let time_window = TimeWindow::from_params(&validation.common.end_date, span_length, today)?;

        let static_validation = StaticValidator::new(
            validation.static_checks.clone(),
            time_window,
            validation.common.max_expected_lag.clone(),
        );
        let dynamic_validation = DynamicValidator::new(validation, time_window, today);

        let reference = validation
            .dynamic
            .reference_dir
            .as_ref()
            .map(|dir| Box::new(ArchiveDirectory::new(dir)) as Box<dyn ReferenceSource>);

        Ok(Self {
            export_dir,
            suppressed_errors,
            time_window,
            data_source: validation.common.data_source.clone(),
            dry_run: validation.common.dry_run,
            today,
            static_validation,
            dynamic_validation,
            reference,
        })
    }

    /// Compare against `source` instead of the configured reference
    /// directory.
    #[must_use]
    pub fn with_reference(mut self, source: Box<dyn ReferenceSource>) -> Self {
        self.reference = Some(source);
        self
    }

    /// Force a dry run: errors are reported but never fail the run.
    #[must_use]
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run |= dry_run;
        self
    }

    pub fn time_window(&self) -> TimeWindow {
        self.time_window
    }

    /// Run every check and return the finished report.
    pub fn validate(&self) -> Result<ValidationReport<Reported>, ValidationError> {
        info!(
            export_dir = %self.export_dir.display(),
            start = %self.time_window.start_date,
            end = %self.time_window.end_date,
            "Validating exports"
        );
        let mut report = ValidationReport::new(self.suppressed_errors.clone(), &self.data_source, self.dry_run);

        let listing = datafetcher::load_all_files(&self.export_dir, self.time_window.range()).map_err(
            |source| ValidationError::ExportDir {
                path: self.export_dir.clone(),
                source,
            },
        )?;
        self.static_validation.validate(&listing, self.today, &mut report);

        match &self.reference {
            Some(source) => {
                let frames = datafetcher::aggregate_frames(&listing.files);
                self.dynamic_validation.validate(&frames, source.as_ref(), &mut report);
            }
            None => info!("No reference source configured, skipping dynamic checks"),
        }

        Ok(report.finish())
    }
}

fn parse_suppressed(value: &serde_json::Value) -> Result<Vec<ValidationFailure>, ValidationError> {
    match value {
        serde_json::Value::Null => Ok(Vec::new()),
        serde_json::Value::Array(entries) => entries
            .iter()
            .map(|entry| match entry {
                serde_json::Value::Object(map) => ValidationFailure::from_template(map),
                _ => Err(ValidationError::SuppressedNotObjects),
            })
            .collect(),
        _ => Err(ValidationError::SuppressedNotObjects),
    }
}
