//! Atomic package assembly.
//!
//! A package is built in a hidden staging directory next to its final
//! location. Files are copied in first and the manifest is written last;
//! only a fully verified staging directory is renamed into place. Dropping
//! an unfinished assembler removes the staging directory, so an
//! interrupted run never leaves a manifest pointing at missing files.

use crate::archive::file_sha256;
use crate::error::{PackageError, PackageResult};
use crate::manifest::{AttachmentEntry, MANIFEST_FILE, Manifest};
use crate::paths::{PathAllocator, check_relative, join, slugify};
use fieldpack_storage::write_atomic;
use fieldpack_types::LayerId;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// SQLite sidecar files copied along with a container.
const SIDECARS: [&str; 2] = ["-wal", "-shm"];

pub struct PackageAssembler {
    root: PathBuf,
    staging: PathBuf,
    paths: PathAllocator,
    manifest: Manifest,
    /// Source directories copied whole, with their package directory.
    copied_dirs: Vec<(PathBuf, String)>,
    finished: bool,
}

impl PackageAssembler {
    /// Starts a package at `root`. `root` must not exist, or be an empty
    /// directory.
    pub fn begin(root: &Path, manifest: Manifest) -> PackageResult<Self> {
        if root.exists() && std::fs::read_dir(root)?.next().is_some() {
            return Err(PackageError::AlreadyExists(root.to_path_buf()));
        }
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "package".into());
        let parent = root.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        let staging = parent.join(format!(".{name}.staging-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&staging)?;

        let mut paths = PathAllocator::new();
        paths.reserve(MANIFEST_FILE);
        debug!("Assembling package {:?} in {:?}", root, staging);
        Ok(Self {
            root: root.to_path_buf(),
            staging,
            paths,
            manifest,
            copied_dirs: Vec::new(),
            finished: false,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }

    #[must_use]
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn manifest_mut(&mut self) -> &mut Manifest {
        &mut self.manifest
    }

    /// Allocates a fresh package path `dir/<slug of name>.ext`.
    pub fn allocate(&mut self, dir: &str, name: &str, ext: &str) -> String {
        self.paths.allocate(dir, &slugify(name), ext)
    }

    /// Where a package path lives while staging. Creates parent
    /// directories.
    pub fn staged_path(&self, package_path: &str) -> PackageResult<PathBuf> {
        check_relative(package_path)?;
        let path = self.staging.join(package_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(path)
    }

    /// Copies a source file into the package, once per source file.
    /// Returns its package path.
    pub fn copy_file(&mut self, source: &Path, dir: &str) -> PackageResult<String> {
        let (stem, ext) = split_name(source);
        let (package_path, fresh) = self.paths.allocate_for(source, dir, &slugify(&stem), &ext);
        if fresh {
            let target = self.staged_path(&package_path)?;
            std::fs::copy(source, &target)?;
            debug!("Copied {:?} to {}", source, package_path);
        }
        Ok(package_path)
    }

    /// Copies a SQLite container together with its `-wal`/`-shm` sidecars.
    pub fn copy_container(&mut self, source: &Path, dir: &str) -> PackageResult<String> {
        let (stem, ext) = split_name(source);
        let (package_path, fresh) = self.paths.allocate_for(source, dir, &slugify(&stem), &ext);
        if fresh {
            let target = self.staged_path(&package_path)?;
            std::fs::copy(source, &target)?;
            for suffix in SIDECARS {
                let sidecar = sibling_with_suffix(source, suffix);
                if sidecar.is_file() {
                    std::fs::copy(&sidecar, sibling_with_suffix(&target, suffix))?;
                }
            }
            debug!("Copied container {:?} to {}", source, package_path);
        }
        Ok(package_path)
    }

    /// Copies a directory tree into the package under `package_dir`.
    /// Returns the number of files copied.
    pub fn copy_dir(&mut self, source: &Path, package_dir: &str) -> PackageResult<usize> {
        check_relative(package_dir)?;
        let mut copied = 0;
        for (rel, path) in crate::archive::package_files(source)? {
            let package_path = join(package_dir, &rel);
            self.paths.reserve(&package_path);
            let target = self.staged_path(&package_path)?;
            std::fs::copy(&path, &target)?;
            copied += 1;
        }
        self.manifest.attachment_dirs.push(package_dir.to_string());
        self.copied_dirs.push((source.to_path_buf(), package_dir.to_string()));
        info!("Copied {} files from {:?} into {}", copied, source, package_dir);
        Ok(copied)
    }

    /// Brings one attachment into the package and records its mapping.
    ///
    /// `source_value` is what the source stores; `file` is that value
    /// resolved to a file. Files inside an already copied attachment
    /// directory are referenced where they were copied to. A missing file
    /// still gets a package path so the value stays package-relative, but
    /// is recorded as not present.
    pub fn add_attachment(
        &mut self,
        layer: &LayerId,
        source_value: &str,
        file: &Path,
        dir: &str,
    ) -> PackageResult<String> {
        if let Some(existing) = self
            .manifest
            .attachments
            .iter()
            .find(|a| &a.layer == layer && a.source_value == source_value)
        {
            return Ok(existing.package_path.clone());
        }
        let present = file.is_file();
        let in_copied_dir = self.copied_dirs.iter().find_map(|(dir, package_dir)| {
            let rel = file.strip_prefix(dir).ok()?;
            if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
                return None;
            }
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            Some(join(package_dir, &rel))
        });
        let package_path = if let Some(path) = in_copied_dir.filter(|_| present) {
            path
        } else if present {
            self.copy_file(file, dir)?
        } else {
            warn!(
                "Attachment {} of layer {} not found at {:?}",
                source_value, layer, file
            );
            let (stem, ext) = split_name(file);
            self.paths.allocate(dir, &slugify(&stem), &ext)
        };
        self.manifest.attachments.push(AttachmentEntry {
            layer: layer.clone(),
            package_path: package_path.clone(),
            source_value: source_value.to_string(),
            present,
        });
        Ok(package_path)
    }

    /// Checks every file the manifest references exists in staging.
    fn verify_staged(&self) -> PackageResult<()> {
        for path in self.manifest.referenced_paths() {
            let present = self
                .manifest
                .attachments
                .iter()
                .find(|a| a.package_path == path)
                .is_none_or(|a| a.present);
            if present && !self.staging.join(path).exists() {
                return Err(PackageError::PackageCorrupt(format!(
                    "manifest references missing file {path}"
                )));
            }
        }
        Ok(())
    }

    /// Writes the manifest and moves the package into place.
    pub fn finish(mut self) -> PackageResult<PathBuf> {
        self.manifest.validate()?;
        self.verify_staged()?;
        self.manifest.snapshot.sha256 = file_sha256(&self.staging.join(&self.manifest.snapshot.path))?;

        let text = self.manifest.to_toml_string()?;
        write_atomic(&self.staging.join(MANIFEST_FILE), text.as_bytes())?;

        if self.root.exists() {
            std::fs::remove_dir(&self.root)?;
        }
        std::fs::rename(&self.staging, &self.root)?;
        self.finished = true;
        info!(
            "Package {} written to {:?} ({} layers, {} attachments)",
            self.manifest.package_id,
            self.root,
            self.manifest.layers.len(),
            self.manifest.attachments.len()
        );
        Ok(self.root.clone())
    }
}

impl Drop for PackageAssembler {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match std::fs::remove_dir_all(&self.staging) {
            Ok(()) => debug!("Discarded unfinished package staging {:?}", self.staging),
            Err(e) => warn!("Failed to remove staging directory {:?}: {}", self.staging, e),
        }
    }
}

fn split_name(path: &Path) -> (String, String) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    (stem, ext)
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
