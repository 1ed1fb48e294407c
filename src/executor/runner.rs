//! Checkpointed executor.
//!
//! Epistemic foundation:
//! - K_i: One item in flight at a time, in ascending key order
//! - K_i: The ledger is rewritten after every success, before the next item
//! - K_i: On crash, the ledger holds exactly the completed prefix
//! - B_i: A tool run may fail → recoverable (skip, stays pending) or fatal
//!   (abort), decided by the stage's failure policy
//! - I^B: No retries within a run; the next run re-reconciles

use super::tool::{classify, Outcome, ToolInvoker};
use crate::checkpoint::{file_exists, CompletionLedger, LedgerStore};
use crate::models::{
    ExecutionReport, ItemFailure, LedgerRecord, PendingSet, Result, TiltflowError,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// What a tool failure does to the rest of the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log, leave the item pending and continue
    #[default]
    Recoverable,
    /// Abort the run on the first failure
    FatalOnFirst,
}

impl FailurePolicy {
    pub fn from_flag(fatal_on_failure: bool) -> Self {
        if fatal_on_failure {
            Self::FatalOnFirst
        } else {
            Self::Recoverable
        }
    }
}

/// Runs pending work items through a tool, checkpointing after each.
pub struct CheckpointedExecutor<'a, T: ToolInvoker> {
    tool: &'a T,
    store: &'a LedgerStore,
    policy: FailurePolicy,
    show_progress: bool,
    device: Option<String>,
}

impl<'a, T: ToolInvoker> CheckpointedExecutor<'a, T> {
    pub fn new(tool: &'a T, store: &'a LedgerStore) -> Self {
        Self {
            tool,
            store,
            policy: FailurePolicy::default(),
            show_progress: false,
            device: None,
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Record the leased device in the report.
    pub fn with_device(mut self, device: Option<String>) -> Self {
        self.device = device;
        self
    }

    /// Run every pending item.
    ///
    /// `ledger` is the confirmed ledger from reconciliation; it is extended
    /// and persisted in place as items complete.
    pub async fn run(
        &self,
        pending: &PendingSet,
        ledger: &mut CompletionLedger,
    ) -> Result<ExecutionReport> {
        let start = Instant::now();
        let mut report = ExecutionReport {
            device: self.device.clone(),
            ..Default::default()
        };

        if pending.is_empty() {
            info!(stage = %self.store.stage(), "Nothing to do");
            return Ok(report);
        }

        let pb = self.progress_bar(pending.len());
        info!(
            stage = %self.store.stage(),
            pending = pending.len(),
            policy = ?self.policy,
            "Starting execution"
        );

        for item in pending.iter() {
            pb.set_message(item.key.to_string());
            report.attempted += 1;

            let outcome = match self.tool.invoke(item).await {
                Ok(output) => {
                    debug!(
                        key = %item.key,
                        exit_code = ?output.exit_code,
                        elapsed_ms = output.duration.as_millis() as u64,
                        "Tool finished"
                    );
                    classify(&output, &item.output, file_exists)
                }
                Err(TiltflowError::ToolInvocation {
                    exit_code, message, ..
                }) => Outcome::Failed { exit_code, message },
                Err(e) => {
                    pb.abandon();
                    return Err(e);
                }
            };

            match outcome {
                Outcome::Succeeded => {
                    ledger.insert(LedgerRecord::completed(item));
                    self.store.save(ledger)?;
                    report.succeeded += 1;
                    debug!(key = %item.key, "Checkpointed");
                }
                Outcome::Failed { exit_code, message } => {
                    if self.policy == FailurePolicy::FatalOnFirst {
                        pb.abandon();
                        error!(
                            key = %item.key,
                            completed = report.succeeded,
                            "Aborting stage on tool failure"
                        );
                        return Err(TiltflowError::tool(item.key, exit_code, message));
                    }
                    warn!(key = %item.key, exit_code = ?exit_code, %message, "Item failed, left pending");
                    report.failed += 1;
                    report.failures.push(ItemFailure {
                        key: item.key,
                        exit_code,
                        message,
                    });
                }
            }
            pb.inc(1);
        }

        pb.finish_with_message("done");
        report.runtime_secs = start.elapsed().as_secs_f64();

        info!(
            stage = %self.store.stage(),
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            "Execution complete"
        );
        Ok(report)
    }

    fn progress_bar(&self, total: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-"),
        );
        pb
    }
}
