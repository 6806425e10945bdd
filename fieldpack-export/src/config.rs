//! Packaging configuration.
//!
//! Loaded from an optional TOML file. A missing or unreadable file yields
//! the defaults; unknown keys are ignored.

use fieldpack_storage::DEFAULT_BATCH_SIZE;
use fieldpack_types::{Extent, LayerId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Settings for one packaging run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Package title; defaults to the project title.
    pub title: Option<String>,
    /// Layers to package. Empty means all.
    pub include: Vec<LayerId>,
    /// Layers never packaged, even when included.
    pub exclude: Vec<LayerId>,
    /// Per-layer offline editing opt-in, overriding the layer's own flag.
    pub offline: BTreeMap<LayerId, bool>,
    /// Features per streamed batch.
    pub batch_size: usize,
    /// Bound on every source probe or connection, in seconds.
    pub probe_timeout_secs: u64,
    /// Also write `<package>.zip` next to the package directory.
    pub archive: bool,
    /// Copy the project's attachment directories into the package.
    pub copy_attachment_dirs: bool,
    /// Restricts converted spatial layers to features inside this area.
    pub area_of_interest: Option<AreaOfInterest>,
}

/// A rectangular area of interest.
///
/// A feature is packaged when its geometry's bounding box intersects the
/// area. Coordinates are not reprojected: a layer declaring a different
/// CRS than the area is packaged whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaOfInterest {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crs: Option<String>,
}

impl AreaOfInterest {
    #[must_use]
    pub fn new(extent: Extent, crs: Option<String>) -> Self {
        Self {
            min_x: extent.min_x,
            min_y: extent.min_y,
            max_x: extent.max_x,
            max_y: extent.max_y,
            crs,
        }
    }

    #[must_use]
    pub const fn extent(&self) -> Extent {
        Extent::new(self.min_x, self.min_y, self.max_x, self.max_y)
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            title: None,
            include: Vec::new(),
            exclude: Vec::new(),
            offline: BTreeMap::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            probe_timeout_secs: 10,
            archive: false,
            copy_attachment_dirs: true,
            area_of_interest: None,
        }
    }
}

impl ExportConfig {
    /// Loads configuration from an explicit path.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            info!("No export config at {:?}, using defaults", path);
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(text) => match toml::from_str::<Self>(&text) {
                Ok(config) => {
                    info!("Loaded export config from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!(
                        "Failed to parse export config {:?}: {}. Falling back to defaults.",
                        path, e
                    );
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read export config {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    /// Whether the caller selected the layer.
    #[must_use]
    pub fn is_selected(&self, id: &LayerId) -> bool {
        (self.include.is_empty() || self.include.contains(id)) && !self.exclude.contains(id)
    }

    #[must_use]
    pub fn offline_override(&self, id: &LayerId) -> Option<bool> {
        self.offline.get(id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_config_from_str(toml_content: &str) -> ExportConfig {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.toml");
        std::fs::write(&path, toml_content).unwrap();
        ExportConfig::load_from(&path)
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExportConfig::load_from(&dir.path().join("nope.toml"));
        assert_eq!(config, ExportConfig::default());
    }

    #[test]
    fn partial_file_fills_defaults_and_ignores_unknown_keys() {
        let config = load_config_from_str(
            r#"
            exclude = ["scratch"]
            batch_size = 50
            future_option = true

            [offline]
            roads = false
            "#,
        );
        assert_eq!(config.batch_size(), 50);
        assert_eq!(config.probe_timeout(), Duration::from_secs(10));
        assert!(!config.is_selected(&LayerId::new("scratch")));
        assert!(config.is_selected(&LayerId::new("roads")));
        assert_eq!(config.offline_override(&LayerId::new("roads")), Some(false));
    }

    #[test]
    fn malformed_file_falls_back() {
        let config = load_config_from_str("batch_size = \"many\"");
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn area_of_interest_is_read_from_a_table() {
        let config = load_config_from_str(
            r#"
            [area_of_interest]
            min_x = 7.0
            min_y = 46.0
            max_x = 8.5
            max_y = 47.5
            crs = "EPSG:4326"
            "#,
        );
        let aoi = config.area_of_interest.unwrap();
        assert_eq!(aoi.extent(), Extent::new(7.0, 46.0, 8.5, 47.5));
        assert_eq!(aoi.crs.as_deref(), Some("EPSG:4326"));
    }

    #[test]
    fn include_list_restricts_selection() {
        let config = ExportConfig {
            include: vec![LayerId::new("a")],
            ..ExportConfig::default()
        };
        assert!(config.is_selected(&LayerId::new("a")));
        assert!(!config.is_selected(&LayerId::new("b")));
    }
}
