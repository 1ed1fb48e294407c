//! Checkpoint module for resumable stage execution.
//!
//! Provides:
//! - `CompletionLedger` / `LedgerStore`: Durable record of completed work items
//! - `reconcile`: Pending work = declared targets minus re-verified ledger records
//! - `write_atomic`: Crash-safe file replacement shared by every persisted artifact

mod atomic;
mod ledger;
mod reconcile;

pub use atomic::*;
pub use ledger::*;
pub use reconcile::*;
