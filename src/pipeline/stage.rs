//! Stage orchestration: catalog → reconcile → lease → execute.
//!
//! Epistemic foundation:
//! - K_i: Every stage runs the same engine; stages differ only in strategy,
//!   command template and failure policy
//! - K_i: No device is leased and no tool runs when nothing is pending
//! - B_i: No free device → ResourceUnavailable before any item is attempted

use super::template::StageCommand;
use crate::catalog::stage_targets;
use crate::checkpoint::{file_exists, reconcile, LedgerStore, Reconciliation};
use crate::device::{DeviceLease, DeviceQuery, LeaseManager};
use crate::executor::{CheckpointedExecutor, FailurePolicy, ProcessTool, ToolInvoker};
use crate::models::{Config, ExecutionReport, Result, StageConfig, TargetSet, TiltflowError};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::info;

/// Reconciled view of a stage before anything runs.
#[derive(Debug, Clone)]
pub struct StagePlan {
    pub targets: TargetSet,
    pub reconciliation: Reconciliation,
}

/// What a stage run did.
#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub stage: String,
    pub targets: usize,
    pub already_done: usize,
    /// Ledger records whose outputs had disappeared
    pub stale: usize,
    pub report: ExecutionReport,
}

impl StageSummary {
    pub fn is_success(&self) -> bool {
        self.report.is_success()
    }
}

/// One configured stage.
pub struct Stage<'a> {
    config: &'a Config,
    name: &'a str,
    stage: &'a StageConfig,
    store: LedgerStore,
}

impl<'a> Stage<'a> {
    pub fn new(config: &'a Config, name: &'a str) -> Result<Self> {
        let stage = config.stage(name)?;
        Ok(Self {
            config,
            name,
            stage,
            store: LedgerStore::for_stage(config, name),
        })
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    /// Build targets and reconcile them against the ledger, running nothing.
    pub fn plan(&self) -> Result<StagePlan> {
        let targets = stage_targets(self.config, self.name)?;
        let ledger = self.store.load()?;
        let reconciliation = reconcile(&targets, &ledger, file_exists);

        info!(
            stage = self.name,
            targets = targets.len(),
            done = reconciliation.already_done,
            stale = reconciliation.stale.len(),
            pending = reconciliation.pending.len(),
            "Stage reconciled"
        );
        Ok(StagePlan {
            targets,
            reconciliation,
        })
    }

    /// Run the stage with its configured external tool.
    pub async fn run<Q: DeviceQuery>(&self, query: Q, show_progress: bool) -> Result<StageSummary> {
        let prefix = self.stage.prefix_or(&self.config.project.name);
        self.execute(
            query,
            |lease| {
                let device = lease.map(DeviceLease::device_id);
                let command = StageCommand::new(self.name, self.stage, prefix, device)?;
                Ok(ProcessTool::new(command))
            },
            show_progress,
        )
        .await
    }

    /// Run the stage with a tool built once the lease (if any) is known.
    pub async fn execute<Q, T, F>(
        &self,
        query: Q,
        make_tool: F,
        show_progress: bool,
    ) -> Result<StageSummary>
    where
        Q: DeviceQuery,
        T: ToolInvoker,
        F: FnOnce(Option<&DeviceLease>) -> Result<T>,
    {
        let plan = self.plan()?;
        let mut summary = StageSummary {
            stage: self.name.to_string(),
            targets: plan.targets.len(),
            already_done: plan.reconciliation.already_done,
            stale: plan.reconciliation.stale.len(),
            report: ExecutionReport::default(),
        };

        if plan.reconciliation.is_nothing_to_do() {
            info!(stage = self.name, "All targets complete, nothing to do");
            return Ok(summary);
        }

        let lease = if self.stage.requires_device && self.config.devices.enabled {
            Some(LeaseManager::new(query).acquire().await?)
        } else {
            None
        };
        let tool = make_tool(lease.as_ref())?;

        // Output patterns may place items in subfolders of output_dir.
        let dirs: BTreeSet<&Path> = std::iter::once(self.stage.output_dir.as_path())
            .chain(
                plan.reconciliation
                    .pending
                    .iter()
                    .filter_map(|item| item.output.parent()),
            )
            .collect();
        for dir in dirs {
            fs::create_dir_all(dir).map_err(|e| {
                TiltflowError::io(format!("creating output dir {}", dir.display()), e)
            })?;
        }

        let Reconciliation {
            pending,
            mut confirmed,
            ..
        } = plan.reconciliation;
        summary.report = CheckpointedExecutor::new(&tool, &self.store)
            .with_policy(FailurePolicy::from_flag(self.stage.fatal_on_failure))
            .with_progress(show_progress)
            .with_device(lease.as_ref().map(DeviceLease::device_id))
            .run(&pending, &mut confirmed)
            .await?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MasterCatalog, RawImage};
    use crate::device::Accelerator;
    use crate::executor::ToolOutput;
    use crate::models::WorkItem;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Devices {
        busy: Vec<String>,
    }

    #[async_trait]
    impl DeviceQuery for Devices {
        async fn list_devices(&self) -> Result<Vec<Accelerator>> {
            Ok(vec![Accelerator {
                id: 0,
                uuid: "GPU-0".into(),
                name: "Test".into(),
            }])
        }

        async fn busy_devices(&self) -> Result<Vec<String>> {
            Ok(self.busy.clone())
        }
    }

    #[derive(Default)]
    struct CountingTool {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ToolInvoker for CountingTool {
        async fn invoke(&self, item: &WorkItem) -> Result<ToolOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            fs::write(&item.output, b"ok").unwrap();
            Ok(ToolOutput {
                exit_code: Some(0),
                ..Default::default()
            })
        }
    }

    fn setup(dir: &Path) -> Config {
        let toml = format!(
            r#"
[project]
name = "demo"
state_dir = "{root}/state"

[catalog]
source_folder = "{root}/raw"
file_prefix = "TS"

[stages.mc]
output_dir = "{root}/mc"
output_pattern = "{{prefix}}_{{key}}.mrc"
command = ["MotionCor2", "-Gpu", "{{device}}"]
requires_device = true
"#,
            root = dir.display()
        );
        let config = Config::from_toml(&toml).unwrap();
        let images = (1..=3)
            .map(|i| RawImage {
                path: PathBuf::from(format!("/raw/TS_1_{i}_0.0.tif")),
                series: 1,
                index: i,
                angle: 0.0,
            })
            .collect();
        MasterCatalog {
            project: "demo".into(),
            created_at: Utc::now(),
            images,
        }
        .save(&config.master_catalog_path())
        .unwrap();
        config
    }

    #[tokio::test]
    async fn test_run_then_nothing_to_do() {
        let dir = TempDir::new().unwrap();
        let config = setup(dir.path());
        let stage = Stage::new(&config, "mc").unwrap();
        let tool = CountingTool::default();

        let summary = stage
            .execute(Devices { busy: vec![] }, |lease| {
                assert_eq!(lease.unwrap().device_id(), "0");
                Ok(&tool)
            }, false)
            .await
            .unwrap();
        assert_eq!(summary.report.succeeded, 3);
        assert_eq!(summary.report.device.as_deref(), Some("0"));

        // Second run: every device busy, but nothing is pending so no lease is needed.
        let summary = stage
            .execute(Devices { busy: vec!["GPU-0".into()] }, |_| Ok(&tool), false)
            .await
            .unwrap();
        assert_eq!(summary.already_done, 3);
        assert_eq!(summary.report.attempted, 0);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_free_device_invokes_nothing() {
        let dir = TempDir::new().unwrap();
        let config = setup(dir.path());
        let stage = Stage::new(&config, "mc").unwrap();
        let tool = CountingTool::default();

        let err = stage
            .execute(Devices { busy: vec!["GPU-0".into()] }, |_| Ok(&tool), false)
            .await
            .unwrap_err();

        assert!(matches!(err, TiltflowError::ResourceUnavailable { .. }));
        assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
        assert!(!stage.store().exists());
    }

    #[tokio::test]
    async fn test_device_placeholder_without_devices_is_config_error() {
        let dir = TempDir::new().unwrap();
        let mut config = setup(dir.path());
        config.devices.enabled = false;
        let stage = Stage::new(&config, "mc").unwrap();

        let err = stage.run(Devices { busy: vec![] }, false).await.unwrap_err();
        assert!(matches!(err, TiltflowError::Config(_)));
    }
}
