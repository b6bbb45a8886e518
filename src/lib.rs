//! epiflag: outlier flagging and export validation for daily indicator data
//!
//! ## Architecture
//!
//! - **Spike detector**: isolated one-day jumps per geography, corrected in place
//! - **Weekday corrector**: Poisson day-of-week effects with a smooth trend
//! - **AR residual model**: rolling autoregressive fits and tail flags
//! - **Flag cache**: per-lag-window reference frames and AR outputs on disk
//! - **Validator**: static and dynamic checks over published export files

pub mod ar;
pub mod config;
pub mod filename;
pub mod flag_cache;
pub mod logging;
pub mod reference;
pub mod series;
pub mod spike;
pub mod stats;
pub mod types;
pub mod validator;
pub mod weekday;

// Re-export configuration
pub use config::{ConfigError, Params};

// Re-export commonly used types
pub use series::{LocationSeries, SeriesError, SeriesTable};
pub use types::{DateRange, Flag, FlagKind, Window};

// Re-export the two entry points
pub use flag_cache::{flagging, FlaggingSummary};
pub use validator::{ValidationFailure, ValidationReport, Validator};
