//! Catalog module - declares the work a stage run wants done.
//!
//! Raw images are discovered once into a master catalog; each stage then
//! derives its TargetSet from the master catalog or an upstream ledger.

mod builder;
mod metadata;
mod strategy;

pub use builder::*;
pub use metadata::*;
pub use strategy::*;
