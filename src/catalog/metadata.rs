//! Raw image discovery and the master catalog.
//!
//! Epistemic foundation:
//! - K_i: Raw file names encode tilt series, image index and tilt angle at
//!   configured `_`-separated field positions after the file prefix
//! - B_i: A name may not parse → Catalog error naming the file
//! - I^B: Discovery sees the folder as it is now; re-run `catalog` after
//!   new images arrive

use crate::checkpoint::write_json_atomic;
use crate::models::{CatalogConfig, Result, TiltflowError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One raw image found on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawImage {
    /// Absolute path
    pub path: PathBuf,
    /// Tilt series number
    pub series: u32,
    /// Image index within the series
    pub index: u32,
    /// Tilt angle in degrees
    pub angle: f64,
}

/// Every raw image of a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterCatalog {
    pub project: String,
    pub created_at: DateTime<Utc>,
    /// Images sorted by path
    pub images: Vec<RawImage>,
}

impl MasterCatalog {
    /// Discover raw images under the configured source folder.
    pub fn discover(project: &str, config: &CatalogConfig) -> Result<Self> {
        let pattern = discovery_pattern(config);
        debug!(%pattern, "Discovering raw images");

        let entries = glob::glob(&pattern)
            .map_err(|e| TiltflowError::Catalog(format!("Invalid pattern {pattern}: {e}")))?;
        let mut paths = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| TiltflowError::io("scanning raw images", e.into_error()))?;
            paths.push(absolute(&path)?);
        }
        if paths.is_empty() {
            return Err(TiltflowError::Catalog(format!(
                "No raw images match {pattern}"
            )));
        }
        paths.sort();

        let images = paths
            .iter()
            .map(|path| parse_image_name(path, config))
            .collect::<Result<Vec<_>>>()?;

        info!(
            images = images.len(),
            series = images.iter().map(|i| i.series).collect::<BTreeSet<_>>().len(),
            "Master catalog built"
        );
        Ok(Self {
            project: project.to_string(),
            created_at: Utc::now(),
            images,
        })
    }

    /// Load a previously saved catalog.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(TiltflowError::Catalog(format!(
                    "No master catalog at {}; run `tiltflow catalog` first",
                    path.display()
                )))
            }
            Err(e) => return Err(TiltflowError::io(format!("reading {}", path.display()), e)),
        };
        serde_json::from_str(&content)
            .map_err(|e| TiltflowError::Catalog(format!("Unreadable {}: {e}", path.display())))
    }

    /// Atomically persist the catalog.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    /// Tilt series numbers present.
    pub fn series(&self) -> BTreeSet<u32> {
        self.images.iter().map(|i| i.series).collect()
    }
}

/// Glob pattern matching the configured raw images.
pub fn discovery_pattern(config: &CatalogConfig) -> String {
    let folder = config.source_folder.display().to_string();
    let folder = folder.trim_end_matches('/');
    let file = format!("{}_*.{}", config.file_prefix, config.filetype);
    match config.ts_folder_prefix.as_str() {
        "" => format!("{folder}/{file}"),
        "*" => format!("{folder}/*/{file}"),
        prefix => format!("{folder}/{prefix}_*/{file}"),
    }
}

/// Read series, index and angle from a raw image file name.
pub fn parse_image_name(path: &Path, config: &CatalogConfig) -> Result<RawImage> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().replace('[', "_"))
        .ok_or_else(|| TiltflowError::Catalog(format!("No file name in {}", path.display())))?;
    let fields: Vec<&str> = name.split('_').collect();
    let offset = config.file_prefix.split('_').count();

    let field = |position: usize, what: &str| {
        fields.get(position + offset).copied().ok_or_else(|| {
            TiltflowError::Catalog(format!("No {what} field in {}", path.display()))
        })
    };
    let number = |position: usize, what: &str| -> Result<u32> {
        let digits: String = field(position, what)?
            .chars()
            .filter(char::is_ascii_digit)
            .collect();
        digits.parse().map_err(|_| {
            TiltflowError::Catalog(format!("Failed to read {what} from {}", path.display()))
        })
    };

    let series = number(config.stack_field, "tilt series")?;
    let index = number(config.index_field, "image index")?;
    let angle_text = field(config.angle_field, "tilt angle")?
        .replace(&format!(".{}", config.filetype), "")
        .replace(['[', ']'], "");
    let angle = angle_text.parse::<f64>().map_err(|_| {
        TiltflowError::Catalog(format!("Failed to read tilt angle from {}", path.display()))
    })?;

    Ok(RawImage {
        path: path.to_path_buf(),
        series,
        index,
        angle,
    })
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| TiltflowError::io("resolving current dir", e))?;
    Ok(cwd.join(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(source: &Path, ts_folder_prefix: &str) -> CatalogConfig {
        CatalogConfig {
            source_folder: source.to_path_buf(),
            file_prefix: "TS".into(),
            ts_folder_prefix: ts_folder_prefix.into(),
            filetype: "tif".into(),
            stack_field: 0,
            index_field: 1,
            angle_field: 2,
        }
    }

    #[test]
    fn test_discovery_pattern_variants() {
        let root = Path::new("/data/raw/");
        assert_eq!(discovery_pattern(&config(root, "*")), "/data/raw/*/TS_*.tif");
        assert_eq!(discovery_pattern(&config(root, "")), "/data/raw/TS_*.tif");
        assert_eq!(
            discovery_pattern(&config(root, "Position")),
            "/data/raw/Position_*/TS_*.tif"
        );
    }

    #[test]
    fn test_parse_image_name() {
        let cfg = config(Path::new("/raw"), "*");
        let image = parse_image_name(Path::new("/raw/p1/TS_001_012_-45.0.tif"), &cfg).unwrap();
        assert_eq!((image.series, image.index, image.angle), (1, 12, -45.0));

        // Bracketed angles, e.g. `TS_003_004[30.00].tif`
        let image = parse_image_name(Path::new("/raw/p3/TS_003_004[30.00].tif"), &cfg).unwrap();
        assert_eq!((image.series, image.index, image.angle), (3, 4, 30.0));
    }

    #[test]
    fn test_multi_part_prefix_offsets_fields() {
        let mut cfg = config(Path::new("/raw"), "");
        cfg.file_prefix = "grid_A".into();
        let image = parse_image_name(Path::new("/raw/grid_A_7_2_10.5.tif"), &cfg).unwrap();
        assert_eq!((image.series, image.index, image.angle), (7, 2, 10.5));
    }

    #[test]
    fn test_unparseable_name_is_catalog_error() {
        let cfg = config(Path::new("/raw"), "");
        let err = parse_image_name(Path::new("/raw/TS_001.tif"), &cfg).unwrap_err();
        assert!(matches!(err, TiltflowError::Catalog(_)));

        let err = parse_image_name(Path::new("/raw/TS_1_2_flat.tif"), &cfg).unwrap_err();
        assert!(matches!(err, TiltflowError::Catalog(_)));
    }

    #[test]
    fn test_discover_and_persist() {
        let dir = TempDir::new().unwrap();
        for (folder, name) in [
            ("Position_2", "TS_002_001_0.0.tif"),
            ("Position_1", "TS_001_002_3.0.tif"),
            ("Position_1", "TS_001_001_-3.0.tif"),
        ] {
            fs::create_dir_all(dir.path().join(folder)).unwrap();
            fs::write(dir.path().join(folder).join(name), b"").unwrap();
        }

        let catalog = MasterCatalog::discover("demo", &config(dir.path(), "Position")).unwrap();
        assert_eq!(catalog.images.len(), 3);
        assert_eq!(catalog.images[0].index, 1);
        assert_eq!(catalog.series().into_iter().collect::<Vec<_>>(), vec![1, 2]);

        let path = dir.path().join("state/demo_master.json");
        catalog.save(&path).unwrap();
        assert_eq!(MasterCatalog::load(&path).unwrap(), catalog);
    }

    #[test]
    fn test_empty_discovery_and_missing_catalog() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            MasterCatalog::discover("demo", &config(dir.path(), "*")),
            Err(TiltflowError::Catalog(_))
        ));
        assert!(matches!(
            MasterCatalog::load(&dir.path().join("none.json")),
            Err(TiltflowError::Catalog(_))
        ));
    }
}
