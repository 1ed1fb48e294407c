//! Executor module - runs pending work items through an external tool.

mod runner;
mod tool;

pub use runner::*;
pub use tool::*;
