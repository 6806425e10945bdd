//! Opening and verifying a returned package.

use crate::archive::file_sha256;
use crate::error::{PackageError, PackageResult};
use crate::manifest::{LayerEntry, MANIFEST_FILE, Manifest};
use crate::paths::check_relative;
use fieldpack_storage::{Container, ContainerLayer, Snapshot};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A package directory with its parsed manifest.
#[derive(Debug)]
pub struct Package {
    root: PathBuf,
    manifest: Manifest,
}

impl Package {
    /// Opens a package and verifies that everything its manifest references
    /// is present. A package that fails verification cannot be synced.
    pub fn open(root: &Path) -> PackageResult<Self> {
        let manifest_path = root.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Err(PackageError::PackageCorrupt(format!(
                "{} has no {MANIFEST_FILE}",
                root.display()
            )));
        }
        let text = std::fs::read_to_string(&manifest_path)?;
        let manifest = Manifest::from_toml_str(&text)
            .map_err(|e| PackageError::PackageCorrupt(format!("unreadable manifest: {e}")))?;
        manifest.validate()?;
        let package = Self {
            root: root.to_path_buf(),
            manifest,
        };
        package.verify()?;
        info!(
            "Opened package {} ({}) with {} layers",
            package.manifest.title,
            package.manifest.package_id,
            package.manifest.layers.len()
        );
        Ok(package)
    }

    /// Checks referenced files exist and the snapshot is unchanged.
    pub fn verify(&self) -> PackageResult<()> {
        for layer in &self.manifest.layers {
            let Some(path) = &layer.path else {
                continue;
            };
            if !self.root.join(path).is_file() {
                return Err(PackageError::PackageCorrupt(format!(
                    "layer {} references missing file {path}",
                    layer.id
                )));
            }
        }
        for attachment in self.manifest.attachments.iter().filter(|a| a.present) {
            if !self.root.join(&attachment.package_path).is_file() {
                return Err(PackageError::PackageCorrupt(format!(
                    "missing attachment {}",
                    attachment.package_path
                )));
            }
        }
        let snapshot = self.root.join(&self.manifest.snapshot.path);
        if !snapshot.is_file() {
            return Err(PackageError::PackageCorrupt("missing base snapshot".into()));
        }
        let digest = file_sha256(&snapshot)?;
        if digest != self.manifest.snapshot.sha256 {
            return Err(PackageError::PackageCorrupt(
                "base snapshot does not match its recorded digest".into(),
            ));
        }
        debug!("Verified package {:?}", self.root);
        Ok(())
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Absolute location of a package path.
    pub fn resolve(&self, package_path: &str) -> PackageResult<PathBuf> {
        check_relative(package_path)?;
        Ok(self.root.join(package_path))
    }

    /// Opens a layer's container and its table description.
    pub fn open_container(&self, layer: &LayerEntry) -> PackageResult<(Container, ContainerLayer)> {
        let (Some(path), Some(table)) = (&layer.path, &layer.table) else {
            return Err(PackageError::ManifestInvalid(format!(
                "layer {} has no container",
                layer.id
            )));
        };
        let container = Container::open(&self.resolve(path)?)
            .map_err(|e| PackageError::PackageCorrupt(format!("container {path}: {e}")))?;
        let table = container
            .layer(table)
            .map_err(|e| PackageError::PackageCorrupt(format!("container {path}: {e}")))?;
        Ok((container, table))
    }

    /// Opens the base snapshot read-only.
    pub fn open_snapshot(&self) -> PackageResult<Snapshot> {
        let path = self.resolve(&self.manifest.snapshot.path)?;
        Snapshot::open(&path).map_err(|e| PackageError::PackageCorrupt(format!("base snapshot: {e}")))
    }
}
