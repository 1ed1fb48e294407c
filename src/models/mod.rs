//! Core data models for tiltflow.
//!
//! Epistemic mapping:
//! - K_i (Knowledge): Concrete types with compile-time guarantees
//! - B_i (Beliefs): Wrapped in Result/Option
//! - I^R (Resolvable): Config parameters
//! - I^B (Bounded): Error variants with explicit policies

mod config;
mod error;
mod work;

pub use config::*;
pub use error::*;
pub use work::*;
