//! tiltflow CLI - Resumable batch stages for tilt-series processing.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tiltflow::catalog::MasterCatalog;
use tiltflow::partition::{self, PartitionPlan, RecombineOutcome};
use tiltflow::{Config, NvidiaSmi, Stage, StageSummary, ThresholdRule};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "tiltflow")]
#[command(version)]
#[command(about = "Resumable, checkpointed batch stages for tilt-series processing")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "tiltflow.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write plain-text logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover raw images and write the master catalog
    Catalog,

    /// Reconcile a stage against its ledger without running anything
    Plan {
        /// Stage name
        stage: String,
    },

    /// Run a stage's pending work items
    Run {
        /// Stage name
        stage: String,

        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// Quarantine outlier frames of every tilt series under a folder
    Split {
        /// Folder holding one subfolder per tilt series
        folder: PathBuf,

        /// Sigma factor (overrides the configured rule)
        #[arg(short, long)]
        factor: Option<f64>,

        /// Only compute the selection and write a plan
        #[arg(long)]
        dry_run: bool,

        /// Plan file to write (with --dry-run) or apply
        #[arg(long)]
        plan: Option<PathBuf>,
    },

    /// Restore quarantined frames of every tilt series under a folder
    Recombine {
        /// Folder holding one subfolder per tilt series
        folder: PathBuf,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let console = fmt::layer().with_target(false).compact();
    let file = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {path:?}"))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .context("Failed to set subscriber")?;
    Ok(())
}

fn print_example_config() {
    let example = r#"# tiltflow configuration file

[project]
name = "lamella_01"
state_dir = ".tiltflow"        # ledgers and the master catalog live here

[catalog]
source_folder = "raw"
file_prefix = "TS"
ts_folder_prefix = "Position"  # "*" = any subfolder, "" = no subfolders
filetype = "tif"
stack_field = 0                # field positions after the file prefix
index_field = 1
angle_field = 2

[devices]
enabled = true
list_command = ["nvidia-smi", "--list-gpus"]
busy_command = ["nvidia-smi", "--query-compute-apps=gpu_uuid", "--format=csv"]

[stages.motioncorr]
source = "master"
output_dir = "motioncorr"
output_pattern = "{prefix}_{ts:03}_{idx:03}_{angle}.mrc"
command = ["${MOTIONCOR2}", "-InTiff", "{input}", "-OutMrc", "{output}", "-Gpu", "{device}"]
requires_device = true
# process_list = [1, 2, 5]

[stages.ctffind]
source = "motioncorr"
output_dir = "ctffind"
output_pattern = "{stem}.ctf.mrc"
command = ["ctffind"]
stdin = ["{input}", "no", "{output}", "1.0", "300.0"]

[stages.stack]
source = "motioncorr"
granularity = "series"
output_dir = "stacks"
output_pattern = "{prefix}_{ts:03}/{prefix}_{ts:03}.st"
command = ["newstack", "-fileinlist", "{inputs}", "-output", "{output}"]
fatal_on_failure = true

[partition]
rule = { kind = "sigma", factor = 2.0 }
# rule = { kind = "percentile", low = 1.0, high = 99.0 }
stack_ext = "st"
angle_ext = "rawtlt"
excluded_ext = "excl"
"#;
    println!("{example}");
}

fn load_config(path: &Path) -> Result<Config> {
    Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))
}

fn print_stage_summary(summary: &StageSummary) {
    let report = &summary.report;
    println!("\n=== Stage '{}' Complete ===", summary.stage);
    println!("Targets:     {}", summary.targets);
    println!("Done before: {}", summary.already_done);
    println!("Stale:       {}", summary.stale);
    println!("Attempted:   {}", report.attempted);
    println!("Succeeded:   {}", report.succeeded);
    println!("Failed:      {}", report.failed);
    println!("Runtime:     {:.1}s", report.runtime_secs);
    println!(
        "Device:      {}",
        report.device.as_deref().unwrap_or("none")
    );
    for failure in &report.failures {
        println!("  ✗ {}: {}", failure.key, failure.message);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.log_file.as_deref())?;

    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;

            info!("Configuration is valid");
            info!("  Project: {}", config.project.name);
            info!("  State dir: {:?}", config.project.state_dir);
            for (name, stage) in &config.stages {
                info!(
                    "  Stage {name}: source={} granularity={:?} device={} fatal_on_failure={}",
                    stage.source, stage.granularity, stage.requires_device, stage.fatal_on_failure
                );
            }
            info!("  Partition rule: {:?}", config.partition.rule);
            return Ok(());
        }

        Commands::Catalog => {
            let config = load_config(&cli.config)?;
            let Some(catalog_config) = &config.catalog else {
                bail!("No [catalog] section in {:?}", cli.config);
            };

            let catalog = MasterCatalog::discover(&config.project.name, catalog_config)?;
            let path = config.master_catalog_path();
            catalog.save(&path)?;

            println!("\n=== Master Catalog ===");
            println!("Images:      {}", catalog.images.len());
            println!("Series:      {}", catalog.series().len());
            println!("Output:      {path:?}");
        }

        Commands::Plan { stage } => {
            let config = load_config(&cli.config)?;
            let plan = Stage::new(&config, &stage)?.plan()?;
            let rec = &plan.reconciliation;

            println!("\n=== Stage '{stage}' Plan ===");
            println!("Targets:     {}", plan.targets.len());
            println!("Done:        {}", rec.already_done);
            println!("Stale:       {}", rec.stale.len());
            println!("Pending:     {}", rec.pending.len());
            for item in rec.pending.iter() {
                println!("  {} → {}", item.key, item.output.display());
            }
        }

        Commands::Run { stage, no_progress } => {
            let config = load_config(&cli.config)?;
            let runner = Stage::new(&config, &stage)?;
            let query = NvidiaSmi::from_config(&config.devices);

            let summary = runner.run(query, !no_progress).await?;
            print_stage_summary(&summary);

            if !summary.is_success() {
                bail!(
                    "{} of {} items failed; rerun '{stage}' to retry them",
                    summary.report.failed,
                    summary.report.attempted
                );
            }
        }

        Commands::Split {
            folder,
            factor,
            dry_run,
            plan,
        } => {
            let mut config = load_config(&cli.config)?;
            if let Some(factor) = factor {
                let rule = ThresholdRule::sigma(factor);
                if let Err(reason) = rule.validate() {
                    bail!(reason);
                }
                config.partition.rule = rule;
            }

            if dry_run {
                let series = partition::discover_series(&folder, &config.partition)?;
                let selection = partition::plan_partition(&series, &config.partition.rule)?;
                let path = plan.unwrap_or_else(|| config.partition_plan_path());
                selection.save(&path)?;

                println!("\n=== Partition Plan ===");
                println!("Series:      {}", selection.series.len());
                println!("Quarantine:  {} frames", selection.total_quarantined());
                for (stack, ordinals) in &selection.series {
                    println!("  {}: {:?}", stack.display(), ordinals);
                }
                println!("Plan:        {path:?}");
                return Ok(());
            }

            let saved = plan
                .as_deref()
                .map(PartitionPlan::load)
                .transpose()
                .context("Failed to load partition plan")?;
            let summaries = partition::split_all(&folder, &config.partition, saved.as_ref())?;

            println!("\n=== Split Complete ===");
            println!("Series:      {}", summaries.len());
            for s in &summaries {
                println!(
                    "  {}: quarantined {} of {} {:?}",
                    s.stem,
                    s.quarantined.len(),
                    s.original_depth,
                    s.quarantined_angles
                );
            }
        }

        Commands::Recombine { folder } => {
            let config = load_config(&cli.config)?;
            let outcomes = partition::recombine_all(&folder, &config.partition)?;

            println!("\n=== Recombine Complete ===");
            for (stem, outcome) in &outcomes {
                match outcome {
                    RecombineOutcome::Restored { restored, depth } => {
                        println!("  {stem}: restored {restored} frames (depth {depth})")
                    }
                    RecombineOutcome::NotSplit => println!("  {stem}: not split"),
                    RecombineOutcome::DiscardedIncomplete => {
                        println!("  {stem}: discarded incomplete split")
                    }
                }
            }
        }
    }

    Ok(())
}
