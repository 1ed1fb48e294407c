//! Work item and ledger record types for tiltflow.
//!
//! K_i: These types represent the core data flow through a stage:
//! TargetSet → PendingSet → (tool) → LedgerRecord → next stage's TargetSet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Stable identity of a work item.
///
/// K_i: Ordering is numeric (series, then image index), so iteration over
/// keys is the deterministic execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkKey {
    /// Tilt-series number
    pub series: u32,

    /// Image index within the series (absent for whole-series items)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

impl WorkKey {
    /// Key for a whole tilt series.
    pub fn series(series: u32) -> Self {
        Self {
            series,
            index: None,
        }
    }

    /// Key for one image of a tilt series.
    pub fn image(series: u32, index: u32) -> Self {
        Self {
            series,
            index: Some(index),
        }
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{:03}_{index:04}", self.series),
            None => write!(f, "{:03}", self.series),
        }
    }
}

/// A single unit of stage work.
///
/// K_i: Immutable once built by the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Identity key
    pub key: WorkKey,

    /// Input files, in the order the tool expects them
    pub inputs: Vec<PathBuf>,

    /// The single file this item is expected to produce
    pub output: PathBuf,

    /// Tilt angle (image items only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub angle: Option<f64>,
}

/// The set of work items a stage run declares.
///
/// Duplicate keys collapse last-wins, so no item can be scheduled twice.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetSet {
    items: BTreeMap<WorkKey, WorkItem>,
}

impl TargetSet {
    /// Create an empty target set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an item, returning the item it replaced.
    pub fn insert(&mut self, item: WorkItem) -> Option<WorkItem> {
        self.items.insert(item.key, item)
    }

    pub fn get(&self, key: &WorkKey) -> Option<&WorkItem> {
        self.items.get(key)
    }

    pub fn contains(&self, key: &WorkKey) -> bool {
        self.items.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Keys in ascending order.
    pub fn keys(&self) -> impl Iterator<Item = &WorkKey> {
        self.items.keys()
    }

    /// Items in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.values()
    }
}

impl FromIterator<WorkItem> for TargetSet {
    fn from_iter<I: IntoIterator<Item = WorkItem>>(iter: I) -> Self {
        let mut set = Self::new();
        for item in iter {
            set.insert(item);
        }
        set
    }
}

/// Work still to be done in this run, in execution order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingSet {
    items: Vec<WorkItem>,
}

impl PendingSet {
    /// Build from items; sorts by key and drops duplicate keys (last wins).
    pub fn from_items(items: impl IntoIterator<Item = WorkItem>) -> Self {
        let items: TargetSet = items.into_iter().collect();
        Self {
            items: items.iter().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn keys(&self) -> Vec<WorkKey> {
        self.items.iter().map(|item| item.key).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.iter()
    }
}

/// Record of one completed work item.
///
/// K_i: At write time, `output` existed on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// Identity key of the completed item
    pub key: WorkKey,

    /// Output file written by the tool
    pub output: PathBuf,

    /// Inputs the item was built from
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<PathBuf>,

    /// Tilt angle carried forward to downstream stages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub angle: Option<f64>,

    /// When the item completed
    pub completed_at: DateTime<Utc>,
}

impl LedgerRecord {
    /// Record the completion of a work item now.
    pub fn completed(item: &WorkItem) -> Self {
        Self {
            key: item.key,
            output: item.output.clone(),
            inputs: item.inputs.clone(),
            angle: item.angle,
            completed_at: Utc::now(),
        }
    }
}

/// A work item that failed during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemFailure {
    pub key: WorkKey,
    pub exit_code: Option<i32>,
    pub message: String,
}

/// Summary of one executor run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Items the tool was invoked for
    pub attempted: usize,

    /// Items that completed and were checkpointed
    pub succeeded: usize,

    /// Items that failed recoverably and remain pending
    pub failed: usize,

    /// Details of each failure
    pub failures: Vec<ItemFailure>,

    /// Accelerator the run was bound to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    /// Total runtime in seconds
    pub runtime_secs: f64,
}

impl ExecutionReport {
    /// Whether every attempted item succeeded.
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(series: u32, index: u32, output: &str) -> WorkItem {
        WorkItem {
            key: WorkKey::image(series, index),
            inputs: vec![PathBuf::from(format!("raw/{series}_{index}.tif"))],
            output: PathBuf::from(output),
            angle: Some(0.0),
        }
    }

    #[test]
    fn test_key_order_is_numeric() {
        let mut keys = vec![
            WorkKey::image(10, 1),
            WorkKey::image(2, 11),
            WorkKey::image(2, 3),
            WorkKey::series(2),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                WorkKey::series(2),
                WorkKey::image(2, 3),
                WorkKey::image(2, 11),
                WorkKey::image(10, 1),
            ]
        );
    }

    #[test]
    fn test_key_display() {
        assert_eq!(WorkKey::image(3, 12).to_string(), "003_0012");
        assert_eq!(WorkKey::series(42).to_string(), "042");
    }

    #[test]
    fn test_target_set_last_wins() {
        let set: TargetSet = vec![item(1, 1, "a.mrc"), item(1, 1, "b.mrc"), item(1, 2, "c.mrc")]
            .into_iter()
            .collect();
        assert_eq!(set.len(), 2);
        assert_eq!(
            set.get(&WorkKey::image(1, 1)).unwrap().output,
            PathBuf::from("b.mrc")
        );
    }

    #[test]
    fn test_pending_set_sorted() {
        let pending = PendingSet::from_items(vec![item(2, 1, "x"), item(1, 5, "y"), item(1, 2, "z")]);
        assert_eq!(
            pending.keys(),
            vec![WorkKey::image(1, 2), WorkKey::image(1, 5), WorkKey::image(2, 1)]
        );
    }

    #[test]
    fn test_record_serialization_skips_empty() {
        let record = LedgerRecord {
            key: WorkKey::series(7),
            output: PathBuf::from("stack_007.st"),
            inputs: vec![],
            angle: None,
            completed_at: Utc::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("inputs").is_none());
        assert!(json.get("angle").is_none());
        assert_eq!(json["key"]["series"], 7);
    }
}
