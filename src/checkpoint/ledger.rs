//! Completion ledger and its durable store.
//!
//! Epistemic foundation:
//! - K_i: The ledger records which work items completed in earlier runs
//! - K_i: The whole ledger is rewritten atomically (write-then-rename)
//! - B_i: Ledger file may not exist yet → empty ledger, not an error
//! - B_i: Ledger file may be unparseable → LedgerCorruption, never discarded
//! - I^B: Crash during write → previous version intact, plus a backup copy

use super::atomic::write_json_atomic;
use crate::models::{Config, LedgerRecord, Result, TiltflowError, WorkKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Ordered record of completed work items.
///
/// K_i: At most one record per key; re-inserting a key supersedes the old record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionLedger {
    records: Vec<LedgerRecord>,
}

impl CompletionLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from records, keeping the last record for each key.
    pub fn from_records(records: impl IntoIterator<Item = LedgerRecord>) -> Self {
        let mut ledger = Self::new();
        for record in records {
            ledger.insert(record);
        }
        ledger
    }

    /// Append a record, superseding any earlier record with the same key.
    pub fn insert(&mut self, record: LedgerRecord) {
        self.records.retain(|r| r.key != record.key);
        self.records.push(record);
    }

    pub fn get(&self, key: &WorkKey) -> Option<&LedgerRecord> {
        self.records.iter().find(|r| &r.key == key)
    }

    pub fn contains(&self, key: &WorkKey) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &LedgerRecord> {
        self.records.iter()
    }

    pub fn records(&self) -> &[LedgerRecord] {
        &self.records
    }
}

/// On-disk representation of a ledger.
#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    project: String,
    stage: String,
    updated_at: DateTime<Utc>,
    records: Vec<LedgerRecord>,
}

/// Durable store for one (project, stage) ledger.
///
/// Assumes a single writer; concurrent runs of the same stage must be
/// excluded by the caller.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    /// Path to the ledger file
    path: PathBuf,
    /// Copy of the previous version, refreshed before every save
    backup_path: PathBuf,
    project: String,
    stage: String,
}

impl LedgerStore {
    /// Create a store for an explicit ledger path.
    pub fn new(path: impl Into<PathBuf>, project: &str, stage: &str) -> Self {
        let path = path.into();
        let backup_path = path.with_extension("backup.json");
        Self {
            path,
            backup_path,
            project: project.to_string(),
            stage: stage.to_string(),
        }
    }

    /// Create the store a configured stage uses.
    pub fn for_stage(config: &Config, stage: &str) -> Self {
        Self::new(config.ledger_path(stage), &config.project.name, stage)
    }

    /// Check if a ledger has been written.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Load the ledger; an absent file is an empty ledger.
    pub fn load(&self) -> Result<CompletionLedger> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(stage = %self.stage, "No ledger yet, starting fresh");
                return Ok(CompletionLedger::new());
            }
            Err(e) => {
                return Err(TiltflowError::io(
                    format!("reading ledger {}", self.path.display()),
                    e,
                ))
            }
        };

        let file: LedgerFile =
            serde_json::from_str(&content).map_err(|e| self.corruption(e.to_string()))?;
        if file.stage != self.stage {
            return Err(self.corruption(format!(
                "ledger belongs to stage '{}', expected '{}'",
                file.stage, self.stage
            )));
        }

        let ledger = CompletionLedger::from_records(file.records);
        debug!(stage = %self.stage, records = ledger.len(), "Ledger loaded");
        Ok(ledger)
    }

    /// Rewrite the whole ledger atomically.
    pub fn save(&self, ledger: &CompletionLedger) -> Result<()> {
        // Backup existing ledger
        if self.path.exists() {
            fs::copy(&self.path, &self.backup_path)
                .map_err(|e| TiltflowError::io("backing up ledger", e))?;
        }

        let file = LedgerFile {
            project: self.project.clone(),
            stage: self.stage.clone(),
            updated_at: Utc::now(),
            records: ledger.records().to_vec(),
        };
        write_json_atomic(&self.path, &file)?;

        debug!(stage = %self.stage, records = ledger.len(), "Ledger saved");
        Ok(())
    }

    fn corruption(&self, message: String) -> TiltflowError {
        let message = if self.backup_path.exists() {
            format!("{message} (previous version at {})", self.backup_path.display())
        } else {
            message
        };
        TiltflowError::LedgerCorruption {
            path: self.path.clone(),
            message,
        }
    }
}
