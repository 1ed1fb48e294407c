//! Reconciliation of declared targets against the completion ledger.
//!
//! Epistemic foundation:
//! - K_i: The ledger is a cache of filesystem truth, not a source of truth
//! - K_i: pending = targets − {ledger records whose output still exists}
//! - B_i: A recorded output may have been deleted since → record goes stale
//!
//! Pure over its inputs: nothing is read or written except through the
//! supplied existence oracle.

use super::ledger::CompletionLedger;
use crate::models::{LedgerRecord, PendingSet, TargetSet};
use std::path::Path;

/// Outcome of reconciling one stage run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    /// Targets still to run, in execution order
    pub pending: PendingSet,

    /// Ledger records whose outputs were re-verified on disk
    pub confirmed: CompletionLedger,

    /// Records dropped because their output is gone
    pub stale: Vec<LedgerRecord>,

    /// Targets already satisfied by a confirmed record
    pub already_done: usize,
}

impl Reconciliation {
    /// Whether the stage has nothing left to run.
    pub fn is_nothing_to_do(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Existence oracle backed by the real filesystem.
pub fn file_exists(path: &Path) -> bool {
    path.is_file()
}

/// Compute the pending work for a stage run.
///
/// Records kept in `confirmed` include ones outside `targets`: a narrower
/// process list must not forget work done for other series.
pub fn reconcile<F>(targets: &TargetSet, ledger: &CompletionLedger, exists: F) -> Reconciliation
where
    F: Fn(&Path) -> bool,
{
    let mut confirmed = CompletionLedger::new();
    let mut stale = Vec::new();

    for record in ledger.iter() {
        if exists(&record.output) {
            confirmed.insert(record.clone());
        } else {
            stale.push(record.clone());
        }
    }

    let pending = PendingSet::from_items(
        targets
            .iter()
            .filter(|item| !confirmed.contains(&item.key))
            .cloned(),
    );
    let already_done = targets.len() - pending.len();

    Reconciliation {
        pending,
        confirmed,
        stale,
        already_done,
    }
}
