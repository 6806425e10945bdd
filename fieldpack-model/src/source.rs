use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a layer's features live.
///
/// Read-only input to the pipelines; descriptors are never rewritten. Local
/// file paths may be relative to the project home.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataSourceDescriptor {
    LocalFile {
        path: String,
        format: FileFormat,
        /// Table inside a multi-layer file.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        layer_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        csv: Option<CsvOptions>,
    },
    Database {
        driver: String,
        /// Driver-specific connection string; a file path for `sqlite`.
        connection: String,
        table: String,
        /// Column holding GeoJSON geometry text.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        geometry_column: Option<String>,
        /// SQL predicate selecting the layer's features.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<String>,
    },
    RemoteService {
        url: String,
        protocol: ServiceProtocol,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<String>,
    },
}

impl DataSourceDescriptor {
    /// Short label for logs and diagnostics.
    #[must_use]
    pub fn kind_name(&self) -> String {
        match self {
            Self::LocalFile { format, .. } => format!("{format} file"),
            Self::Database { driver, .. } => format!("{driver} database"),
            Self::RemoteService { protocol, .. } => format!("{protocol} service"),
        }
    }

    /// The active feature filter, if the descriptor carries one.
    #[must_use]
    pub fn filter(&self) -> Option<&str> {
        match self {
            Self::Database { filter, .. } | Self::RemoteService { filter, .. } => filter.as_deref(),
            Self::LocalFile { .. } => None,
        }
    }

    #[must_use]
    pub const fn is_remote(&self) -> bool {
        matches!(self, Self::RemoteService { .. })
    }

    /// File path for local file sources.
    #[must_use]
    pub fn local_path(&self) -> Option<&str> {
        match self {
            Self::LocalFile { path, .. } => Some(path),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    /// A fieldpack container (SQLite with container metadata).
    Container,
    #[serde(rename = "geojson")]
    GeoJson,
    Csv,
    Raster,
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Container => "container",
            Self::GeoJson => "geojson",
            Self::Csv => "csv",
            Self::Raster => "raster",
        })
    }
}

/// Options for delimited-text point layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsvOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_field: Option<String>,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Declared text encoding. Only UTF-8 is read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

impl CsvOptions {
    /// True unless an encoding other than UTF-8 is declared.
    #[must_use]
    pub fn is_utf8(&self) -> bool {
        self.encoding.as_deref().is_none_or(|e| {
            let e = e.to_ascii_lowercase();
            e == "utf-8" || e == "utf8"
        })
    }
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            x_field: None,
            y_field: None,
            delimiter: default_delimiter(),
            encoding: None,
        }
    }
}

fn default_delimiter() -> char {
    ','
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceProtocol {
    /// Feature endpoint returning a GeoJSON FeatureCollection.
    #[serde(rename = "geojson")]
    GeoJson,
    Wfs,
    Wms,
    Wmts,
    Xyz,
}

impl ServiceProtocol {
    /// Map and tile services can only ever be linked, never embedded.
    #[must_use]
    pub const fn is_tiled(self) -> bool {
        matches!(self, Self::Wms | Self::Wmts | Self::Xyz)
    }
}

impl fmt::Display for ServiceProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::GeoJson => "geojson",
            Self::Wfs => "wfs",
            Self::Wms => "wms",
            Self::Wmts => "wmts",
            Self::Xyz => "xyz",
        })
    }
}
