//! TargetSet construction.
//!
//! Epistemic foundation:
//! - K_i: A stage reads either the master catalog or the persisted ledger of
//!   another stage; there is no live hand-off between stages
//! - K_i: Series items list their inputs sorted by tilt angle
//! - B_i: The source ledger may be empty → empty TargetSet, nothing to do

use super::metadata::MasterCatalog;
use super::strategy::{SourceEntry, TemplateStrategy, WorkStrategy};
use crate::checkpoint::LedgerStore;
use crate::models::{Config, Granularity, Result, StageConfig, TargetSet, WorkItem, WorkKey, MASTER_SOURCE};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Entries offered by a stage's source.
pub fn source_entries(config: &Config, stage: &StageConfig) -> Result<Vec<SourceEntry>> {
    if stage.source == MASTER_SOURCE {
        let catalog = MasterCatalog::load(&config.master_catalog_path())?;
        return Ok(catalog.images.iter().map(SourceEntry::from).collect());
    }

    let ledger = LedgerStore::for_stage(config, &stage.source).load()?;
    if ledger.is_empty() {
        warn!(source = %stage.source, "Source stage has no completed items");
    }
    Ok(ledger.iter().map(SourceEntry::from).collect())
}

/// Group source entries into work items.
///
/// `process_list` restricts entries to the listed tilt series; empty keeps all.
pub fn build_targets<S: WorkStrategy>(
    entries: Vec<SourceEntry>,
    process_list: &[u32],
    strategy: &S,
) -> Result<TargetSet> {
    let mut groups: BTreeMap<WorkKey, Vec<SourceEntry>> = BTreeMap::new();
    for entry in entries {
        if !process_list.is_empty() && !process_list.contains(&entry.key.series) {
            continue;
        }
        let key = strategy.key_for(&entry);
        match strategy.granularity() {
            // Duplicate source keys collapse, last wins.
            Granularity::Image => {
                groups.insert(key, vec![entry]);
            }
            Granularity::Series => groups.entry(key).or_default().push(entry),
        }
    }

    let mut targets = TargetSet::new();
    for (key, mut inputs) in groups {
        inputs.sort_by(|a, b| match (a.angle, b.angle) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        });
        let output = strategy.output_for(&key, &inputs)?;
        let angle = match (strategy.granularity(), inputs.as_slice()) {
            (Granularity::Image, [entry]) => entry.angle,
            _ => None,
        };
        targets.insert(WorkItem {
            key,
            inputs: inputs.into_iter().map(|e| e.path).collect(),
            output,
            angle,
        });
    }

    debug!(targets = targets.len(), "TargetSet built");
    Ok(targets)
}

/// Build the TargetSet of a configured stage.
pub fn stage_targets(config: &Config, name: &str) -> Result<TargetSet> {
    let stage = config.stage(name)?;
    let strategy = TemplateStrategy::for_stage(name, stage, &config.project.name)?;
    build_targets(source_entries(config, stage)?, &stage.process_list, &strategy)
}
