//! Run Parameters
//!
//! One params document drives every entry point: the flagging jobs, the
//! validation battery and the shared `common` section (export directory,
//! log destination).
//!
//! ## Loading
//!
//! ```ignore
//! let params = Params::load_from_file(Path::new("params.json"))?;
//! for job in params.flag_jobs(chrono::Local::now().date_naive())? {
//!     // ...
//! }
//! ```
//!
//! Files ending in `.toml` are read as TOML, everything else as JSON.
//! Unknown keys are reported as warnings with a "did you mean" suggestion
//! and never fail the load; impossible values do.

mod params;
pub mod validation;

pub use params::*;
