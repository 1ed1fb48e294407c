//! Error types for tiltflow.
//!
//! Epistemic taxonomy:
//! - B_i falsified: Expected failures (tool exited badly, inputs inconsistent)
//! - I^B materialized: Host failures (no free accelerator, device query failed, IO)
//! - K_i violated: Durable state no longer trustworthy (corrupt ledger) or internal bugs
//!
//! An absent ledger is not represented here: a first run loads an empty ledger.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for tiltflow.
#[derive(Debug, Error)]
pub enum TiltflowError {
    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED: Belief proven wrong (expected failures)
    // ═══════════════════════════════════════════════════════════════════
    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Tool failed on {key} (exit code {}): {message}", display_code(.exit_code))]
    ToolInvocation {
        key: String,
        exit_code: Option<i32>,
        message: String,
    },

    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("Stack format error: {0}")]
    StackFormat(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED: Bounded ignorance became known-bad
    // ═══════════════════════════════════════════════════════════════════
    #[error("No free accelerator: {busy} of {total} devices are busy")]
    ResourceUnavailable { total: usize, busy: usize },

    #[error("Device query failed: {0}")]
    DeviceQuery(String),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // K_i VIOLATED: Invariant broken
    // ═══════════════════════════════════════════════════════════════════
    #[error("Ledger {path} is corrupt: {message}")]
    LedgerCorruption { path: PathBuf, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TiltflowError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a tool failure for a work item.
    pub fn tool(key: impl ToString, exit_code: Option<i32>, message: impl Into<String>) -> Self {
        Self::ToolInvocation {
            key: key.to_string(),
            exit_code,
            message: message.into(),
        }
    }

    /// Whether this error aborts a stage outright.
    ///
    /// Tool failures are classified per stage by the executor's failure
    /// policy, so they are never fatal on their own.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::ToolInvocation { .. })
    }
}

fn display_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "none".to_string(), |c| c.to_string())
}

/// Result type alias for tiltflow.
pub type Result<T> = std::result::Result<T, TiltflowError>;
