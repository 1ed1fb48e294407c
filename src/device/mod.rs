//! Device module - exclusive accelerator leasing for a stage run.

mod lease;
mod query;

pub use lease::*;
pub use query::*;
