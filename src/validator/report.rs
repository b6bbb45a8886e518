//! Collected outcome of one validation run.
//!
//! A report is `Checking` while the battery runs and becomes `Reported`
//! through [`ValidationReport::finish`]; only a finished report can be
//! logged.

use std::marker::PhantomData;

use tracing::{error, info, warn};

use super::errors::ValidationFailure;

/// The battery is still adding results.
#[derive(Debug)]
pub struct Checking;

/// Every check has run.
#[derive(Debug)]
pub struct Reported;

#[derive(Debug)]
pub struct ValidationReport<S = Checking> {
    errors_to_suppress: Vec<ValidationFailure>,
    data_source: String,
    dry_run: bool,
    num_suppressed: usize,
    total_checks: usize,
    raised_errors: Vec<ValidationFailure>,
    raised_warnings: Vec<ValidationFailure>,
    unsuppressed_errors: Vec<ValidationFailure>,
    _state: PhantomData<S>,
}

impl ValidationReport<Checking> {
    pub fn new(errors_to_suppress: Vec<ValidationFailure>, data_source: &str, dry_run: bool) -> Self {
        Self {
            errors_to_suppress,
            data_source: data_source.to_string(),
            dry_run,
            num_suppressed: 0,
            total_checks: 0,
            raised_errors: Vec::new(),
            raised_warnings: Vec::new(),
            unsuppressed_errors: Vec::new(),
            _state: PhantomData,
        }
    }

    pub fn add_raised_error(&mut self, failure: ValidationFailure) {
        if failure.is_suppressed(&self.errors_to_suppress) {
            self.num_suppressed += 1;
        } else {
            self.unsuppressed_errors.push(failure.clone());
        }
        self.raised_errors.push(failure);
    }

    pub fn add_raised_warning(&mut self, failure: ValidationFailure) {
        self.raised_warnings.push(failure);
    }

    pub fn increment_total_checks(&mut self) {
        self.total_checks += 1;
    }

    pub fn finish(self) -> ValidationReport<Reported> {
        ValidationReport {
            errors_to_suppress: self.errors_to_suppress,
            data_source: self.data_source,
            dry_run: self.dry_run,
            num_suppressed: self.num_suppressed,
            total_checks: self.total_checks,
            raised_errors: self.raised_errors,
            raised_warnings: self.raised_warnings,
            unsuppressed_errors: self.unsuppressed_errors,
            _state: PhantomData,
        }
    }
}

impl<S> ValidationReport<S> {
    pub fn data_source(&self) -> &str {
        &self.data_source
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn total_checks(&self) -> usize {
        self.total_checks
    }

    pub fn num_suppressed(&self) -> usize {
        self.num_suppressed
    }

    pub fn errors_to_suppress(&self) -> &[ValidationFailure] {
        &self.errors_to_suppress
    }

    pub fn raised_errors(&self) -> &[ValidationFailure] {
        &self.raised_errors
    }

    pub fn raised_warnings(&self) -> &[ValidationFailure] {
        &self.raised_warnings
    }

    pub fn unsuppressed_errors(&self) -> &[ValidationFailure] {
        &self.unsuppressed_errors
    }

    /// No unsuppressed errors, or a dry run.
    pub fn success(&self) -> bool {
        self.unsuppressed_errors.is_empty() || self.dry_run
    }
}

impl ValidationReport<Reported> {
    pub fn summary(&self) -> String {
        format!(
            "{} checks run\n{} checks failed\n{} checks suppressed\n{} warnings\n",
            self.total_checks,
            self.unsuppressed_errors.len(),
            self.num_suppressed,
            self.raised_warnings.len()
        )
    }

    pub fn log(&self) {
        let outcome = if self.success() {
            "Validation run successful"
        } else {
            "Validation run unsuccessful"
        };
        info!(
            data_source = %self.data_source,
            checks_run = self.total_checks,
            checks_failed = self.unsuppressed_errors.len(),
            checks_suppressed = self.num_suppressed,
            warnings = self.raised_warnings.len(),
            phase = "validation",
            "{outcome}"
        );

        for failure in &self.unsuppressed_errors {
            error!(
                phase = "validation",
                error_name = failure.check_name_str(),
                signal = failure.signal_str(),
                resolution = failure.geo_type_str(),
                date = %failure.date_str(),
                "{failure}"
            );
        }
        for failure in &self.raised_warnings {
            warn!(
                phase = "validation",
                error_name = failure.check_name_str(),
                signal = failure.signal_str(),
                resolution = failure.geo_type_str(),
                date = %failure.date_str(),
                "{failure}"
            );
        }
    }
}
