//! Per-stage work item strategies.
//!
//! A strategy decides which work item a source entry belongs to and where
//! that item's output goes; everything else about a stage run is shared.

use crate::catalog::RawImage;
use crate::models::{ConfigError, Granularity, LedgerRecord, Result, StageConfig, WorkKey};
use crate::pipeline::{check_placeholders, render, Value, Vars, OUTPUT_PLACEHOLDERS};
use std::path::PathBuf;

/// One input file offered to a stage by its source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceEntry {
    /// Key the entry had in its source
    pub key: WorkKey,
    pub path: PathBuf,
    pub angle: Option<f64>,
}

impl From<&RawImage> for SourceEntry {
    fn from(image: &RawImage) -> Self {
        Self {
            key: WorkKey::image(image.series, image.index),
            path: image.path.clone(),
            angle: Some(image.angle),
        }
    }
}

impl From<&LedgerRecord> for SourceEntry {
    fn from(record: &LedgerRecord) -> Self {
        Self {
            key: record.key,
            path: record.output.clone(),
            angle: record.angle,
        }
    }
}

/// Key extraction and output derivation for one stage.
pub trait WorkStrategy {
    /// Granularity items are grouped at.
    fn granularity(&self) -> Granularity;

    /// Key of the work item `entry` feeds.
    fn key_for(&self, entry: &SourceEntry) -> WorkKey {
        match self.granularity() {
            Granularity::Image => entry.key,
            Granularity::Series => WorkKey::series(entry.key.series),
        }
    }

    /// Output path of the item with `key`, built from its sorted inputs.
    fn output_for(&self, key: &WorkKey, inputs: &[SourceEntry]) -> Result<PathBuf>;
}

/// Strategy rendering `output_pattern` under `output_dir`.
#[derive(Debug, Clone)]
pub struct TemplateStrategy {
    granularity: Granularity,
    output_dir: PathBuf,
    pattern: String,
    prefix: String,
}

impl TemplateStrategy {
    pub fn new(
        granularity: Granularity,
        output_dir: impl Into<PathBuf>,
        pattern: impl Into<String>,
        prefix: impl Into<String>,
    ) -> std::result::Result<Self, ConfigError> {
        let pattern = pattern.into();
        check_placeholders(&pattern, OUTPUT_PLACEHOLDERS)?;
        Ok(Self {
            granularity,
            output_dir: output_dir.into(),
            pattern,
            prefix: prefix.into(),
        })
    }

    /// Strategy of a configured stage.
    pub fn for_stage(
        name: &str,
        stage: &StageConfig,
        project: &str,
    ) -> std::result::Result<Self, ConfigError> {
        Self::new(
            stage.granularity,
            stage.output_dir.clone(),
            stage.output_pattern.clone(),
            stage.prefix_or(project),
        )
        .map_err(|e| ConfigError::InvalidStage {
            stage: name.to_string(),
            reason: e.to_string(),
        })
    }
}

impl WorkStrategy for TemplateStrategy {
    fn granularity(&self) -> Granularity {
        self.granularity
    }

    fn output_for(&self, key: &WorkKey, inputs: &[SourceEntry]) -> Result<PathBuf> {
        let stem = inputs
            .first()
            .and_then(|e| e.path.file_stem())
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut vars = Vars::new()
            .text("prefix", self.prefix.clone())
            .text("key", key.to_string())
            .text("stem", stem)
            .set("ts", Value::Number(key.series));
        if let Some(index) = key.index {
            vars = vars.set("idx", Value::Number(index));
        }
        if let ([entry], Granularity::Image) = (inputs, self.granularity) {
            if let Some(angle) = entry.angle {
                vars = vars.set("angle", Value::Angle(angle));
            }
        }

        let name = render(&self.pattern, &vars)?;
        Ok(self.output_dir.join(name))
    }
}
