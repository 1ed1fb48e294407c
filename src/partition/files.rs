//! File-level quarantine of tilt series.
//!
//! Epistemic foundation:
//! - K_i: Split writes the quarantined stack and its record before touching
//!   the original stack, so the index map survives any crash after the first
//!   replacement
//! - K_i: A record on disk means "this series is currently split"
//! - B_i: Stack and angle files may not pair up → Consistency, nothing written
//! - I^B: A crash between writing the record and replacing the stack leaves a
//!   record for an unsplit series; recombine detects and discards it
//! - I^B: A crash between replacing the stack and the angle list (in either
//!   direction) leaves one file split and one full; the record's depths say
//!   which, and recombine restores only the split one

use super::stack::TiltStack;
use super::transform::{recombine, select_quarantine, split_at, Partition, ThresholdRule};
use crate::checkpoint::{write_atomic, write_json_atomic};
use crate::models::{PartitionConfig, Result, TiltflowError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Suffix of the side record kept next to a split stack.
pub const RECORD_SUFFIX: &str = "quarantine.json";

/// Paired stack and angle-list files of one tilt series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesFiles {
    /// Shared file stem, e.g. `Position_1`
    pub stem: String,
    pub stack: PathBuf,
    pub angles: PathBuf,
}

impl SeriesFiles {
    /// Where the quarantined frames are written.
    pub fn excluded_path(&self, config: &PartitionConfig) -> PathBuf {
        self.stack.with_extension(&config.excluded_ext)
    }

    /// Where the quarantine record is written.
    pub fn record_path(&self) -> PathBuf {
        self.stack.with_extension(RECORD_SUFFIX)
    }
}

/// Side record retained while a series is split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    /// Stack holding the kept frames
    pub stack: PathBuf,
    /// Stack holding the quarantined frames
    pub excluded_stack: PathBuf,
    /// Depth before the split
    pub original_depth: usize,
    /// Original ordinal of each quarantined frame
    pub index_map: Vec<usize>,
    /// Angles of the quarantined frames
    pub quarantined_angles: Vec<f64>,
    /// Rule that selected the frames (absent when applied from a plan)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<ThresholdRule>,
    pub created_at: DateTime<Utc>,
}

impl QuarantineRecord {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| TiltflowError::io(format!("reading {}", path.display()), e))?;
        serde_json::from_str(&content).map_err(|e| {
            TiltflowError::Consistency(format!("Unreadable quarantine record {}: {e}", path.display()))
        })
    }
}

/// Quarantine selection computed without modifying any file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionPlan {
    pub rule: ThresholdRule,
    pub created_at: DateTime<Utc>,
    /// Stack path → quarantined ordinals
    pub series: BTreeMap<PathBuf, Vec<usize>>,
}

impl PartitionPlan {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| TiltflowError::io(format!("reading plan {}", path.display()), e))?;
        serde_json::from_str(&content)
            .map_err(|e| TiltflowError::ParseError(format!("Plan {}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    /// Total frames the plan would quarantine.
    pub fn total_quarantined(&self) -> usize {
        self.series.values().map(Vec::len).sum()
    }
}

/// Outcome of splitting one series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SplitSummary {
    pub stem: String,
    pub original_depth: usize,
    pub quarantined: Vec<usize>,
    pub quarantined_angles: Vec<f64>,
}

/// Outcome of recombining one series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RecombineOutcome {
    /// Frames were merged back
    Restored { restored: usize, depth: usize },
    /// No record: the series was never split
    NotSplit,
    /// A record was left by a split that never replaced the stack
    DiscardedIncomplete,
}

/// Read an angle list: one value per non-blank line.
pub fn read_angles(path: &Path) -> Result<Vec<f64>> {
    let content = fs::read_to_string(path)
        .map_err(|e| TiltflowError::io(format!("reading angles {}", path.display()), e))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            line.trim().parse::<f64>().map_err(|e| {
                TiltflowError::ParseError(format!("{}:{}: {e}", path.display(), n + 1))
            })
        })
        .collect()
}

/// Atomically write an angle list; values round-trip exactly.
pub fn write_angles(path: &Path, angles: &[f64]) -> Result<()> {
    let mut content = String::new();
    for angle in angles {
        content.push_str(&format!("{angle:?}\n"));
    }
    write_atomic(path, content.as_bytes())
}

/// Find series under `folder`: `*/<stem>.<stack_ext>` paired with `*/<stem>.<angle_ext>`.
pub fn discover_series(folder: &Path, config: &PartitionConfig) -> Result<Vec<SeriesFiles>> {
    let stacks = glob_sorted(folder, &config.stack_ext)?;
    let angles = glob_sorted(folder, &config.angle_ext)?;

    if stacks.len() != angles.len() {
        return Err(TiltflowError::Consistency(format!(
            "Found {} .{} stacks but {} .{} angle lists under {}",
            stacks.len(),
            config.stack_ext,
            angles.len(),
            config.angle_ext,
            folder.display()
        )));
    }

    let mut series = Vec::with_capacity(stacks.len());
    for (stack, angle_file) in stacks.into_iter().zip(angles) {
        if stack.with_extension("") != angle_file.with_extension("") {
            return Err(TiltflowError::Consistency(format!(
                "Unpaired series files: {} and {}",
                stack.display(),
                angle_file.display()
            )));
        }
        let stem = stack
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        series.push(SeriesFiles {
            stem,
            stack,
            angles: angle_file,
        });
    }

    debug!(count = series.len(), folder = %folder.display(), "Series discovered");
    Ok(series)
}

fn glob_sorted(folder: &Path, ext: &str) -> Result<Vec<PathBuf>> {
    let pattern = format!("{}/*/*.{ext}", folder.display());
    let paths = glob::glob(&pattern)
        .map_err(|e| TiltflowError::Internal(format!("Invalid pattern {pattern}: {e}")))?;

    let mut found = Vec::new();
    for entry in paths {
        let path = entry.map_err(|e| TiltflowError::io("scanning series folder", e.into_error()))?;
        found.push(path);
    }
    found.sort();
    Ok(found)
}

/// Compute the quarantine selection for every series.
pub fn plan_partition(series: &[SeriesFiles], rule: &ThresholdRule) -> Result<PartitionPlan> {
    let mut plan = PartitionPlan {
        rule: *rule,
        created_at: Utc::now(),
        series: BTreeMap::new(),
    };

    for files in series {
        let stack = TiltStack::read(&files.stack)?;
        let angles = read_angles(&files.angles)?;
        if stack.depth() != angles.len() {
            return Err(depth_mismatch(files, stack.depth(), angles.len()));
        }
        let ordinals = select_quarantine(&stack, rule);
        info!(series = %files.stem, quarantined = ?ordinals, "Planned");
        plan.series.insert(files.stack.clone(), ordinals);
    }
    Ok(plan)
}

/// Split one series on disk.
///
/// With `ordinals` the selection is taken as given (from a saved plan);
/// otherwise `config.rule` decides.
pub fn split_series(
    files: &SeriesFiles,
    config: &PartitionConfig,
    ordinals: Option<&[usize]>,
) -> Result<SplitSummary> {
    let record_path = files.record_path();
    if record_path.exists() {
        return Err(TiltflowError::Consistency(format!(
            "{} is already split ({} exists); recombine it first",
            files.stem,
            record_path.display()
        )));
    }

    let stack = TiltStack::read(&files.stack)?;
    let angles = read_angles(&files.angles)?;
    if stack.depth() != angles.len() {
        return Err(depth_mismatch(files, stack.depth(), angles.len()));
    }

    let (ordinals, rule) = match ordinals {
        Some(ordinals) => (ordinals.to_vec(), None),
        None => (select_quarantine(&stack, &config.rule), Some(config.rule)),
    };
    let partition = split_at(&stack, &angles, &ordinals)?;

    let summary = SplitSummary {
        stem: files.stem.clone(),
        original_depth: stack.depth(),
        quarantined: partition.index_map.clone(),
        quarantined_angles: partition.quarantined_angles.clone(),
    };
    if partition.index_map.is_empty() {
        info!(series = %files.stem, "No frames quarantined");
        return Ok(summary);
    }

    let excluded = files.excluded_path(config);
    partition.quarantined.write(&excluded)?;

    let record = QuarantineRecord {
        stack: files.stack.clone(),
        excluded_stack: excluded,
        original_depth: stack.depth(),
        index_map: partition.index_map.clone(),
        quarantined_angles: partition.quarantined_angles.clone(),
        rule,
        created_at: Utc::now(),
    };
    write_json_atomic(&record_path, &record)?;

    partition.kept.write(&files.stack)?;
    write_angles(&files.angles, &partition.kept_angles)?;

    info!(
        series = %files.stem,
        quarantined = ?partition.index_map,
        kept = partition.kept.depth(),
        "Series split"
    );
    Ok(summary)
}

/// Merge a split series back into its original stack and angle list.
pub fn recombine_series(files: &SeriesFiles) -> Result<RecombineOutcome> {
    let record_path = files.record_path();
    let record = match fs::metadata(&record_path) {
        Ok(_) => QuarantineRecord::load(&record_path)?,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(series = %files.stem, "No quarantine record, skipping");
            return Ok(RecombineOutcome::NotSplit);
        }
        Err(e) => return Err(TiltflowError::io("checking quarantine record", e)),
    };

    let full = record.original_depth;
    let restored = record.index_map.len();
    let split_depth = full.checked_sub(restored).ok_or_else(|| {
        TiltflowError::Consistency(format!(
            "{}: record quarantines {restored} frames of {full}",
            files.stem
        ))
    })?;

    let stack = TiltStack::read(&files.stack)?;
    let angles = read_angles(&files.angles)?;
    let stack_state = file_state(files, "stack", stack.depth(), full, split_depth)?;
    let angles_state = file_state(files, "angle list", angles.len(), full, split_depth)?;

    if stack_state == FileState::Full && angles_state == FileState::Full {
        warn!(series = %files.stem, "Stack and angles already full depth, discarding record");
        remove_split_artifacts(&record.excluded_stack, &record_path)?;
        return Ok(RecombineOutcome::DiscardedIncomplete);
    }
    if stack_state != angles_state {
        warn!(
            series = %files.stem,
            stack = ?stack_state,
            angles = ?angles_state,
            "Interrupted split or recombine, restoring the split file only"
        );
    }

    let kept = match stack_state {
        FileState::Split => stack,
        FileState::Full => {
            let frames = without_ordinals(stack.frames(), &record.index_map);
            stack.with_frames(frames)
        }
    };
    let kept_angles = match angles_state {
        FileState::Split => angles,
        FileState::Full => without_ordinals(&angles, &record.index_map),
    };
    let quarantined = TiltStack::read(&record.excluded_stack)?;
    let partition = Partition {
        kept,
        kept_angles,
        quarantined,
        quarantined_angles: record.quarantined_angles.clone(),
        index_map: record.index_map.clone(),
    };

    // A file already at full depth is left byte-for-byte as it is.
    let (stack, angles) = recombine(&partition)?;
    if stack_state == FileState::Split {
        stack.write(&files.stack)?;
    }
    if angles_state == FileState::Split {
        write_angles(&files.angles, &angles)?;
    }
    remove_split_artifacts(&record.excluded_stack, &record_path)?;

    info!(series = %files.stem, restored, depth = stack.depth(), "Series recombined");
    Ok(RecombineOutcome::Restored {
        restored,
        depth: stack.depth(),
    })
}

/// Split every series under `folder`, optionally applying a saved plan.
pub fn split_all(
    folder: &Path,
    config: &PartitionConfig,
    plan: Option<&PartitionPlan>,
) -> Result<Vec<SplitSummary>> {
    let series = discover_series(folder, config)?;
    let mut summaries = Vec::with_capacity(series.len());
    for files in &series {
        let ordinals = match plan {
            Some(plan) => Some(plan.series.get(&files.stack).map(Vec::as_slice).ok_or_else(
                || {
                    TiltflowError::Consistency(format!(
                        "Plan has no entry for {}",
                        files.stack.display()
                    ))
                },
            )?),
            None => None,
        };
        summaries.push(split_series(files, config, ordinals)?);
    }
    Ok(summaries)
}

/// Recombine every series under `folder`.
pub fn recombine_all(
    folder: &Path,
    config: &PartitionConfig,
) -> Result<Vec<(String, RecombineOutcome)>> {
    let series = discover_series(folder, config)?;
    series
        .iter()
        .map(|files| Ok((files.stem.clone(), recombine_series(files)?)))
        .collect()
}

fn remove_split_artifacts(excluded: &Path, record: &Path) -> Result<()> {
    for path in [excluded, record] {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(TiltflowError::io(format!("removing {}", path.display()), e))
            }
        }
    }
    Ok(())
}

/// Depth of a series file relative to its quarantine record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileState {
    Full,
    Split,
}

fn file_state(
    files: &SeriesFiles,
    what: &str,
    depth: usize,
    full: usize,
    split: usize,
) -> Result<FileState> {
    if depth == split {
        Ok(FileState::Split)
    } else if depth == full {
        Ok(FileState::Full)
    } else {
        Err(TiltflowError::Consistency(format!(
            "{}: {what} has {depth} entries, record expects {split} (split) or {full} (full)",
            files.stem
        )))
    }
}

fn without_ordinals<T: Clone>(items: &[T], ordinals: &[usize]) -> Vec<T> {
    items
        .iter()
        .enumerate()
        .filter(|(i, _)| ordinals.binary_search(i).is_err())
        .map(|(_, item)| item.clone())
        .collect()
}

fn depth_mismatch(files: &SeriesFiles, depth: usize, angles: usize) -> TiltflowError {
    TiltflowError::Consistency(format!(
        "{}: stack has {depth} frames but {} lists {angles} angles",
        files.stem,
        files.angles.display()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_series(root: &Path, stem: &str, means: &[f32]) -> SeriesFiles {
        let dir = root.join(stem);
        fs::create_dir_all(&dir).unwrap();
        let frames: Vec<Vec<f32>> = means.iter().map(|&m| vec![m; 4]).collect();
        let stack = TiltStack::from_f32_frames(2, 2, &frames).unwrap();
        let files = SeriesFiles {
            stem: stem.to_string(),
            stack: dir.join(format!("{stem}.st")),
            angles: dir.join(format!("{stem}.rawtlt")),
        };
        stack.write(&files.stack).unwrap();
        let n = means.len();
        let angles: Vec<f64> = (0..n)
            .map(|i| -60.0 + 120.0 * i as f64 / (n.max(2) - 1) as f64)
            .collect();
        write_angles(&files.angles, &angles).unwrap();
        files
    }

    fn outlier_means() -> Vec<f32> {
        let mut means = vec![200.0; 10];
        means[0] = 1.0;
        means[9] = 1.0;
        means
    }

    fn config() -> PartitionConfig {
        PartitionConfig {
            rule: ThresholdRule::sigma(1.5),
            ..PartitionConfig::default()
        }
    }

    #[test]
    fn test_angles_round_trip_exactly() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.rawtlt");
        let angles = vec![-60.0, -0.1 + 0.2, 1e-7, 57.333333333333336];
        write_angles(&path, &angles).unwrap();
        assert_eq!(read_angles(&path).unwrap(), angles);
    }

    #[test]
    fn test_bad_angle_line_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.rawtlt");
        fs::write(&path, "1.0\nabc\n").unwrap();
        assert!(matches!(
            read_angles(&path),
            Err(TiltflowError::ParseError(_))
        ));
    }

    #[test]
    fn test_split_then_recombine_restores_files() {
        let dir = TempDir::new().unwrap();
        let files = write_series(dir.path(), "Position_1", &outlier_means());
        let original_stack = fs::read(&files.stack).unwrap();
        let original_angles = fs::read(&files.angles).unwrap();

        let summary = split_series(&files, &config(), None).unwrap();
        assert_eq!(summary.quarantined, vec![0, 9]);
        assert_eq!(summary.quarantined_angles, vec![-60.0, 60.0]);
        assert_eq!(TiltStack::read(&files.stack).unwrap().depth(), 8);
        assert_eq!(read_angles(&files.angles).unwrap().len(), 8);
        assert!(files.record_path().exists());
        assert!(files.excluded_path(&config()).exists());

        let outcome = recombine_series(&files).unwrap();
        assert_eq!(
            outcome,
            RecombineOutcome::Restored {
                restored: 2,
                depth: 10
            }
        );
        assert_eq!(fs::read(&files.stack).unwrap(), original_stack);
        assert_eq!(fs::read(&files.angles).unwrap(), original_angles);
        assert!(!files.record_path().exists());
        assert!(!files.excluded_path(&config()).exists());
    }

    #[test]
    fn test_split_twice_is_rejected() {
        let dir = TempDir::new().unwrap();
        let files = write_series(dir.path(), "Position_1", &outlier_means());
        split_series(&files, &config(), None).unwrap();
        assert!(matches!(
            split_series(&files, &config(), None),
            Err(TiltflowError::Consistency(_))
        ));
    }

    #[test]
    fn test_depth_mismatch_leaves_files_untouched() {
        let dir = TempDir::new().unwrap();
        let files = write_series(dir.path(), "Position_1", &outlier_means());
        write_angles(&files.angles, &[0.0; 8]).unwrap();
        let before = fs::read(&files.stack).unwrap();

        let err = split_series(&files, &config(), None).unwrap_err();
        assert!(matches!(err, TiltflowError::Consistency(_)));
        assert_eq!(fs::read(&files.stack).unwrap(), before);
        assert!(!files.record_path().exists());
    }

    #[test]
    fn test_clean_series_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let files = write_series(dir.path(), "Position_2", &[100.0; 5]);
        let summary = split_series(&files, &config(), None).unwrap();
        assert!(summary.quarantined.is_empty());
        assert!(!files.record_path().exists());
        assert_eq!(recombine_series(&files).unwrap(), RecombineOutcome::NotSplit);
    }

    #[test]
    fn test_incomplete_split_record_discarded() {
        let dir = TempDir::new().unwrap();
        let files = write_series(dir.path(), "Position_1", &outlier_means());
        let before = fs::read(&files.stack).unwrap();

        // Simulate a crash after the record was written.
        let stack = TiltStack::read(&files.stack).unwrap();
        let angles = read_angles(&files.angles).unwrap();
        let partition = split_at(&stack, &angles, &[0, 9]).unwrap();
        let excluded = files.excluded_path(&config());
        partition.quarantined.write(&excluded).unwrap();
        let record = QuarantineRecord {
            stack: files.stack.clone(),
            excluded_stack: excluded.clone(),
            original_depth: 10,
            index_map: vec![0, 9],
            quarantined_angles: partition.quarantined_angles.clone(),
            rule: None,
            created_at: Utc::now(),
        };
        write_json_atomic(&files.record_path(), &record).unwrap();

        assert_eq!(
            recombine_series(&files).unwrap(),
            RecombineOutcome::DiscardedIncomplete
        );
        assert_eq!(fs::read(&files.stack).unwrap(), before);
        assert!(!excluded.exists());
    }

    #[test]
    fn test_crash_between_stack_and_angles_on_split() {
        let dir = TempDir::new().unwrap();
        let files = write_series(dir.path(), "Position_1", &outlier_means());
        let original_stack = fs::read(&files.stack).unwrap();
        let original_angles = fs::read(&files.angles).unwrap();

        split_series(&files, &config(), None).unwrap();
        // The kept stack landed but the angle list was never replaced.
        fs::write(&files.angles, &original_angles).unwrap();

        assert_eq!(
            recombine_series(&files).unwrap(),
            RecombineOutcome::Restored {
                restored: 2,
                depth: 10
            }
        );
        assert_eq!(fs::read(&files.stack).unwrap(), original_stack);
        assert_eq!(fs::read(&files.angles).unwrap(), original_angles);
        assert!(!files.record_path().exists());
    }

    #[test]
    fn test_crash_between_stack_and_angles_on_recombine() {
        let dir = TempDir::new().unwrap();
        let files = write_series(dir.path(), "Position_1", &outlier_means());
        let original_stack = fs::read(&files.stack).unwrap();
        let original_angles = fs::read(&files.angles).unwrap();

        split_series(&files, &config(), None).unwrap();
        // The full stack was restored but the angle list is still split.
        fs::write(&files.stack, &original_stack).unwrap();

        assert!(matches!(
            recombine_series(&files).unwrap(),
            RecombineOutcome::Restored { restored: 2, .. }
        ));
        assert_eq!(fs::read(&files.stack).unwrap(), original_stack);
        assert_eq!(fs::read(&files.angles).unwrap(), original_angles);
        assert!(!files.excluded_path(&config()).exists());

        // The series can be split again afterwards.
        let summary = split_series(&files, &config(), None).unwrap();
        assert_eq!(summary.quarantined, vec![0, 9]);
    }

    #[test]
    fn test_unexpected_depth_is_rejected() {
        let dir = TempDir::new().unwrap();
        let files = write_series(dir.path(), "Position_1", &outlier_means());
        split_series(&files, &config(), None).unwrap();
        write_angles(&files.angles, &[0.0; 5]).unwrap();

        assert!(matches!(
            recombine_series(&files),
            Err(TiltflowError::Consistency(_))
        ));
        assert!(files.record_path().exists());
    }

    #[test]
    fn test_discover_pairs_by_stem() {
        let dir = TempDir::new().unwrap();
        write_series(dir.path(), "Position_2", &[1.0; 3]);
        write_series(dir.path(), "Position_1", &[1.0; 3]);

        let series = discover_series(dir.path(), &config()).unwrap();
        let stems: Vec<_> = series.iter().map(|s| s.stem.as_str()).collect();
        assert_eq!(stems, vec!["Position_1", "Position_2"]);

        fs::remove_file(&series[1].angles).unwrap();
        assert!(matches!(
            discover_series(dir.path(), &config()),
            Err(TiltflowError::Consistency(_))
        ));
    }

    #[test]
    fn test_plan_then_apply() {
        let dir = TempDir::new().unwrap();
        let files = write_series(dir.path(), "Position_1", &outlier_means());
        let before = fs::read(&files.stack).unwrap();

        let series = discover_series(dir.path(), &config()).unwrap();
        let plan = plan_partition(&series, &config().rule).unwrap();
        assert_eq!(plan.total_quarantined(), 2);
        assert_eq!(fs::read(&files.stack).unwrap(), before);

        let plan_path = dir.path().join("plan.json");
        plan.save(&plan_path).unwrap();
        let plan = PartitionPlan::load(&plan_path).unwrap();

        let summaries = split_all(dir.path(), &config(), Some(&plan)).unwrap();
        assert_eq!(summaries[0].quarantined, vec![0, 9]);
        let record = QuarantineRecord::load(&files.record_path()).unwrap();
        assert_eq!(record.rule, None);

        let outcomes = recombine_all(dir.path(), &config()).unwrap();
        assert!(matches!(outcomes[0].1, RecombineOutcome::Restored { .. }));
    }
}
