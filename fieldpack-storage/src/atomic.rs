//! Atomic file replacement for file-backed sources.

use crate::error::StorageResult;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp.{}", uuid::Uuid::new_v4().simple()))
}

/// Replaces `path` with `bytes` so readers see either the old or the new
/// content, never a torn file.
///
/// The temporary file lives next to the target so the final rename stays on
/// one file system.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let temp = temp_path_for(path);
    let result = (|| -> StorageResult<()> {
        let mut file = std::fs::File::create(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&temp, path)?;
        Ok(())
    })();
    match result {
        Ok(()) => {
            debug!("Atomically replaced {:?} ({} bytes)", path, bytes.len());
            Ok(())
        }
        Err(e) => {
            if temp.exists() {
                if let Err(cleanup) = std::fs::remove_file(&temp) {
                    warn!("Failed to remove temp file {:?}: {}", temp, cleanup);
                }
            }
            Err(e)
        }
    }
}
