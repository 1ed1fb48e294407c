//! tiltflow - Resumable, checkpointed batch stages for tilt-series pipelines.
//!
//! ## Architecture
//!
//! Every pipeline stage runs the same engine:
//! - **Catalog**: declares the TargetSet from the master catalog or an upstream ledger
//! - **Reconciliation**: diffs targets against a ledger re-verified on disk
//! - **Executor**: runs pending items one at a time, checkpointing after each
//! - **Device leasing**: binds a stage run to one free accelerator
//!
//! Alongside the stages, the **partition** transform quarantines outlier
//! frames of a tilt stack and restores them exactly on recombine.
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Compile-time enforced invariants (types, enums)
//! - B_i (Beliefs): Runtime fallible operations (Result, Option)
//! - I^R (Resolvable): User-configurable parameters
//! - I^B (Bounded): Host uncertainties (tool failures, busy devices, crashes)

pub mod catalog;
pub mod checkpoint;
pub mod device;
pub mod executor;
pub mod models;
pub mod partition;
pub mod pipeline;

// Re-exports for convenience
pub use checkpoint::{reconcile, CompletionLedger, LedgerStore, Reconciliation};
pub use device::{LeaseManager, NvidiaSmi};
pub use executor::{CheckpointedExecutor, FailurePolicy, ToolInvoker};
pub use models::{Config, Result, TiltflowError, WorkItem, WorkKey};
pub use partition::{recombine, split, Partition, ThresholdRule, TiltStack};
pub use pipeline::{Stage, StageSummary};
