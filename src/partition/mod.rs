//! Partition module - reversible quarantine of outlier frames.
//!
//! A split tilt series is a pair of stacks (kept, quarantined) plus an
//! index map; recombining restores the original stack and angle list exactly.

mod files;
mod stack;
mod transform;

pub use files::*;
pub use stack::*;
pub use transform::*;
