//! Zip archives of finished packages, and content hashing.
//!
//! Archives are written deterministically: entries sorted by path, fixed
//! timestamps, deflate compression. The content hash covers every file of
//! the package and is independent of the archive container.

use crate::error::{PackageError, PackageResult};
use crate::manifest::MANIFEST_FILE;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

/// Lists every regular file under `root` as (package path, file path),
/// sorted by package path.
pub fn package_files(root: &Path) -> PackageResult<Vec<(String, PathBuf)>> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) -> PackageResult<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                walk(root, &path, out)?;
            } else {
                let rel = path
                    .strip_prefix(root)
                    .map_err(|_| PackageError::UnsafePath(path.display().to_string()))?;
                let name = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push((name, path));
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    walk(root, root, &mut files)?;
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

/// SHA-256 of one file, hex encoded.
pub fn file_sha256(path: &Path) -> PackageResult<String> {
    let mut hasher = Sha256::new();
    let mut file = File::open(path)?;
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Deterministic SHA-256 over every file of a package directory.
/// Entries are hashed in path order as name, length, content.
pub fn content_hash(root: &Path) -> PackageResult<String> {
    let mut hasher = Sha256::new();
    for (name, path) in package_files(root)? {
        let data = std::fs::read(&path)?;
        hasher.update(name.as_bytes());
        hasher.update((data.len() as u64).to_le_bytes());
        hasher.update(&data);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Packs a package directory into a zip archive at `out`.
///
/// The archive is written next to `out` and renamed into place. Returns
/// the package content hash.
pub fn pack(root: &Path, out: &Path) -> PackageResult<String> {
    if !root.join(MANIFEST_FILE).is_file() {
        return Err(PackageError::MissingEntry(MANIFEST_FILE.into()));
    }
    let tmp = out.with_extension("zip.partial");
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());

    let result = (|| -> PackageResult<()> {
        let mut zip = ZipWriter::new(File::create(&tmp)?);
        for (name, path) in package_files(root)? {
            zip.start_file(name.as_str(), options)?;
            let mut file = File::open(&path)?;
            std::io::copy(&mut file, &mut zip)?;
        }
        let mut file = zip.finish()?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    })();
    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    std::fs::rename(&tmp, out)?;

    let hash = content_hash(root)?;
    info!("Packed {:?} into {:?} (content {})", root, out, &hash[..12]);
    Ok(hash)
}

/// Extracts a package archive into `dest`, which must not exist.
///
/// Entries whose names would land outside `dest` are rejected before
/// anything is written.
pub fn extract(archive: &Path, dest: &Path) -> PackageResult<PathBuf> {
    if dest.exists() {
        return Err(PackageError::AlreadyExists(dest.to_path_buf()));
    }
    let mut zip = ZipArchive::new(File::open(archive)?)?;

    let mut names = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let file = zip.by_index(i)?;
        let rel = file
            .enclosed_name()
            .ok_or_else(|| PackageError::UnsafePath(file.name().to_string()))?;
        names.push((i, rel, file.is_dir()));
    }
    if !names.iter().any(|(_, rel, _)| rel == Path::new(MANIFEST_FILE)) {
        return Err(PackageError::MissingEntry(MANIFEST_FILE.into()));
    }

    std::fs::create_dir_all(dest)?;
    for (i, rel, is_dir) in names {
        let target = dest.join(&rel);
        if is_dir {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut entry = zip.by_index(i)?;
        let mut data = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or_default());
        entry.read_to_end(&mut data)?;
        std::fs::write(&target, data)?;
        debug!("Extracted {:?}", rel);
    }
    info!("Extracted {:?} into {:?}", archive, dest);
    Ok(dest.to_path_buf())
}
