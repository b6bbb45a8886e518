//! Shared data structures for the flagging pipeline
//!
//! - `Flag` / `FlagKind`: append-only detection outputs
//! - `DateRange` / `Window`: the data, residual and evaluation ranges an
//!   AR run works over

mod flag;
mod window;

pub use flag::*;
pub use window::*;
