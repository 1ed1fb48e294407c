//! Configuration models for tiltflow.
//!
//! All I^R (resolvable ignorance) is parameterized here.
//! The user resolves these unknowns at runtime via config file.

use crate::partition::ThresholdRule;
use crate::pipeline::{check_placeholders, placeholders, COMMAND_PLACEHOLDERS, OUTPUT_PLACEHOLDERS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Name of the built-in stage source backed by the master catalog.
pub const MASTER_SOURCE: &str = "master";

/// Top-level configuration for tiltflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Project identity and state location
    pub project: ProjectConfig,

    /// Raw image discovery (required by stages sourcing from the master catalog)
    #[serde(default)]
    pub catalog: Option<CatalogConfig>,

    /// Accelerator discovery
    #[serde(default)]
    pub devices: DeviceConfig,

    /// Pipeline stages keyed by name
    #[serde(default)]
    pub stages: BTreeMap<String, StageConfig>,

    /// Bad-frame quarantine settings
    #[serde(default)]
    pub partition: PartitionConfig,
}

/// Project configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project name, used to namespace ledgers and catalogs
    pub name: String,

    /// Directory holding ledgers and the master catalog
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".tiltflow")
}

/// Raw image discovery configuration.
///
/// K_i: Raw file names look like `<prefix>_<series>_<index>_<angle>.<ext>`;
/// field positions are counted after the prefix's own `_`-separated parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Folder containing raw images (or per-series subfolders)
    pub source_folder: PathBuf,

    /// File name prefix shared by all raw images
    pub file_prefix: String,

    /// Per-series subfolder prefix: "*" for any, "" for no subfolders
    #[serde(default = "default_ts_folder_prefix")]
    pub ts_folder_prefix: String,

    /// Raw image extension
    #[serde(default = "default_filetype")]
    pub filetype: String,

    /// Field holding the tilt-series number
    #[serde(default)]
    pub stack_field: usize,

    /// Field holding the image index within a series
    #[serde(default = "default_index_field")]
    pub index_field: usize,

    /// Field holding the tilt angle
    #[serde(default = "default_angle_field")]
    pub angle_field: usize,
}

fn default_ts_folder_prefix() -> String {
    "*".to_string()
}

fn default_filetype() -> String {
    "tif".to_string()
}

fn default_index_field() -> usize {
    1
}

fn default_angle_field() -> usize {
    2
}

/// Accelerator discovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Query devices at all (disable on CPU-only hosts)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Command listing every accelerator
    #[serde(default = "default_list_command")]
    pub list_command: Vec<String>,

    /// Command listing accelerators bound to a compute process
    #[serde(default = "default_busy_command")]
    pub busy_command: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_list_command() -> Vec<String> {
    vec!["nvidia-smi".to_string(), "--list-gpus".to_string()]
}

fn default_busy_command() -> Vec<String> {
    vec![
        "nvidia-smi".to_string(),
        "--query-compute-apps=gpu_uuid".to_string(),
        "--format=csv".to_string(),
    ]
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            list_command: default_list_command(),
            busy_command: default_busy_command(),
        }
    }
}

/// How a stage groups its source entries into work items.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// One work item per image
    #[default]
    Image,
    /// One work item per tilt series
    Series,
}

/// Configuration of one pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// "master" or the name of the stage whose ledger feeds this one
    #[serde(default = "default_source")]
    pub source: String,

    /// Work item granularity
    #[serde(default)]
    pub granularity: Granularity,

    /// Tilt series to process (empty = all)
    #[serde(default)]
    pub process_list: Vec<u32>,

    /// Directory receiving this stage's outputs
    pub output_dir: PathBuf,

    /// Output file name template
    pub output_pattern: String,

    /// Prefix substituted for `{prefix}` (defaults to the project name)
    #[serde(default)]
    pub prefix: Option<String>,

    /// External tool argv template
    pub command: Vec<String>,

    /// Lines piped to the tool's standard input
    #[serde(default)]
    pub stdin: Vec<String>,

    /// Abort the stage on the first tool failure
    #[serde(default)]
    pub fatal_on_failure: bool,

    /// Lease an accelerator before running
    #[serde(default)]
    pub requires_device: bool,
}

fn default_source() -> String {
    MASTER_SOURCE.to_string()
}

/// Bad-frame quarantine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Frame selection rule
    #[serde(default)]
    pub rule: ThresholdRule,

    /// Stack file extension
    #[serde(default = "default_stack_ext")]
    pub stack_ext: String,

    /// Angle list extension
    #[serde(default = "default_angle_ext")]
    pub angle_ext: String,

    /// Quarantined stack extension
    #[serde(default = "default_excluded_ext")]
    pub excluded_ext: String,
}

fn default_stack_ext() -> String {
    "st".to_string()
}

fn default_angle_ext() -> String {
    "rawtlt".to_string()
}

fn default_excluded_ext() -> String {
    "excl".to_string()
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            rule: ThresholdRule::default(),
            stack_ext: default_stack_ext(),
            angle_ext: default_angle_ext(),
            excluded_ext: default_excluded_ext(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_owned(),
                source,
            },
            other => other,
        })
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants the TOML schema cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project.name.trim().is_empty() {
            return Err(ConfigError::Invalid("project.name must not be empty".into()));
        }
        if let Some(bad) = self
            .project
            .name
            .chars()
            .find(|c| matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        {
            return Err(ConfigError::Invalid(format!(
                "project.name contains illegal character '{bad}'"
            )));
        }

        for (name, stage) in &self.stages {
            if name == MASTER_SOURCE {
                return Err(ConfigError::InvalidStage {
                    stage: name.clone(),
                    reason: format!("'{MASTER_SOURCE}' is reserved"),
                });
            }
            if stage.command.is_empty() {
                return Err(ConfigError::InvalidStage {
                    stage: name.clone(),
                    reason: "command must not be empty".into(),
                });
            }
            if stage.output_pattern.trim().is_empty() {
                return Err(ConfigError::InvalidStage {
                    stage: name.clone(),
                    reason: "output_pattern must not be empty".into(),
                });
            }
            let invalid = |e: ConfigError| ConfigError::InvalidStage {
                stage: name.clone(),
                reason: e.to_string(),
            };
            check_placeholders(&stage.output_pattern, OUTPUT_PLACEHOLDERS).map_err(invalid)?;
            let mut uses_device = false;
            for template in stage.command.iter().chain(&stage.stdin) {
                check_placeholders(template, COMMAND_PLACEHOLDERS).map_err(invalid)?;
                uses_device |= placeholders(template)
                    .map_err(invalid)?
                    .iter()
                    .any(|p| p == "device");
            }
            if uses_device && !stage.requires_device {
                return Err(ConfigError::InvalidStage {
                    stage: name.clone(),
                    reason: "command uses {device} but requires_device is false".into(),
                });
            }

            if stage.source == MASTER_SOURCE {
                if self.catalog.is_none() {
                    return Err(ConfigError::InvalidStage {
                        stage: name.clone(),
                        reason: "sources the master catalog but [catalog] is missing".into(),
                    });
                }
            } else if !self.stages.contains_key(&stage.source) {
                return Err(ConfigError::UnknownStage(stage.source.clone()));
            }
        }

        // Stage sources must bottom out at the master catalog.
        for name in self.stages.keys() {
            let mut current = name.as_str();
            let mut reaches_master = false;
            for _ in 0..=self.stages.len() {
                match self.stages.get(current) {
                    Some(stage) if stage.source == MASTER_SOURCE => {
                        reaches_master = true;
                        break;
                    }
                    Some(stage) => current = &stage.source,
                    None => break,
                }
            }
            if !reaches_master {
                return Err(ConfigError::InvalidStage {
                    stage: name.clone(),
                    reason: "stage sources form a cycle".into(),
                });
            }
        }

        self.partition.rule.validate().map_err(ConfigError::Invalid)?;
        Ok(())
    }

    /// Look up a stage by name.
    pub fn stage(&self, name: &str) -> Result<&StageConfig, ConfigError> {
        self.stages
            .get(name)
            .ok_or_else(|| ConfigError::UnknownStage(name.to_string()))
    }

    /// Path of a stage's completion ledger.
    pub fn ledger_path(&self, stage: &str) -> PathBuf {
        self.project
            .state_dir
            .join(format!("{}_{stage}_ledger.json", self.project.name))
    }

    /// Path of the master catalog.
    pub fn master_catalog_path(&self) -> PathBuf {
        self.project
            .state_dir
            .join(format!("{}_master.json", self.project.name))
    }

    /// Path of the partition dry-run plan.
    pub fn partition_plan_path(&self) -> PathBuf {
        self.project
            .state_dir
            .join(format!("{}_partition_plan.json", self.project.name))
    }
}

impl StageConfig {
    /// Prefix substituted for `{prefix}`.
    pub fn prefix_or<'a>(&'a self, project: &'a str) -> &'a str {
        self.prefix.as_deref().unwrap_or(project)
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return s.to_string();
    };

    let mut result = s.to_string();
    for cap in re.captures_iter(s) {
        if let Ok(value) = std::env::var(&cap[1]) {
            result = result.replace(&cap[0], &value);
        }
    }
    result
}

/// Configuration errors.
///
/// Epistemic origin:
/// - B_i falsified: File not found, parse error
/// - I^B materialized: Missing or contradictory values
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Stage not found: '{0}'")]
    UnknownStage(String),

    #[error("Invalid stage '{stage}': {reason}")]
    InvalidStage { stage: String, reason: String },

    #[error("Template error: {0}")]
    Template(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
