//! Package-relative path handling.
//!
//! Every path stored in a manifest is relative to the package root, uses
//! `/` as separator and never climbs out of the root.

use crate::error::{PackageError, PackageResult};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path};

/// Lower-case ASCII slug of a display name: runs of anything that is not
/// a letter or digit become one `_`.
#[must_use]
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let trimmed = slug.trim_matches('_');
    if trimmed.is_empty() {
        "layer".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Rejects absolute paths, drive prefixes, backslashes and `..` segments.
pub fn check_relative(path: &str) -> PackageResult<()> {
    let unsafe_path = || PackageError::UnsafePath(path.to_string());
    if path.is_empty() || path.starts_with('/') || path.contains('\\') {
        return Err(unsafe_path());
    }
    if path.len() >= 2 && path.as_bytes()[1] == b':' {
        return Err(unsafe_path());
    }
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(unsafe_path()),
        }
    }
    Ok(())
}

/// Joins package path segments with `/`.
#[must_use]
pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

/// Hands out collision-free package paths.
///
/// The same source file always maps to the same package path, so layers
/// sharing a file share one copy of it.
#[derive(Debug, Default)]
pub struct PathAllocator {
    taken: HashSet<String>,
    by_source: HashMap<String, String>,
}

impl PathAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates `dir/stem.ext`, or `dir/stem_1.ext`, `dir/stem_2.ext`, ...
    /// when taken. Comparison ignores ASCII case so packages survive
    /// case-insensitive file systems.
    pub fn allocate(&mut self, dir: &str, stem: &str, ext: &str) -> String {
        let file = |suffix: Option<usize>| {
            let stem = match suffix {
                Some(n) => format!("{stem}_{n}"),
                None => stem.to_string(),
            };
            if ext.is_empty() {
                join(dir, &stem)
            } else {
                join(dir, &format!("{stem}.{ext}"))
            }
        };
        let path = std::iter::once(None)
            .chain((1..).map(Some))
            .map(file)
            .find(|candidate| !self.taken.contains(&candidate.to_ascii_lowercase()))
            .unwrap_or_default();
        self.taken.insert(path.to_ascii_lowercase());
        path
    }

    /// Path for a given source file. Returns the path and whether it was
    /// newly allocated (the caller then needs to copy the file).
    pub fn allocate_for(&mut self, source: &Path, dir: &str, stem: &str, ext: &str) -> (String, bool) {
        let key = source.to_string_lossy().into_owned();
        if let Some(existing) = self.by_source.get(&key) {
            return (existing.clone(), false);
        }
        let path = self.allocate(dir, stem, ext);
        self.by_source.insert(key, path.clone());
        (path, true)
    }

    /// Marks a path as used without allocating it.
    pub fn reserve(&mut self, path: &str) {
        self.taken.insert(path.to_ascii_lowercase());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("Roads & Paths (2024)"), "roads_paths_2024");
        assert_eq!(slugify("  "), "layer");
        assert_eq!(slugify("Bäume"), "b_ume");
    }

    #[test]
    fn join_skips_empty_dir() {
        assert_eq!(join("", "a.sqlite"), "a.sqlite");
        assert_eq!(join("data/", "a.sqlite"), "data/a.sqlite");
    }
}
