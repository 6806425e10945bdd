//! Project checks run before packaging.
//!
//! Nothing found here stops a run; every finding is a warning the user
//! should see before taking the package into the field.

use fieldpack_model::{DataSourceDescriptor, FileFormat, Project};
use fieldpack_types::{Diagnostics, Severity};
use std::path::Path;
use tracing::warn;

/// Checks a project for settings that are known to cause trouble in the
/// field client.
#[must_use]
pub fn check_project(project: &Project) -> Diagnostics {
    let mut diagnostics = Diagnostics::default();

    for dir in &project.attachment_dirs {
        if Path::new(dir).is_absolute() {
            diagnostics.push(
                None,
                Severity::Warning,
                format!("attachment directory {dir} is absolute; it is copied by its last name only"),
            );
        }
    }

    for layer in &project.layers {
        if let Some(path) = layer.source.local_path() {
            let name = Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !name.is_ascii() {
                diagnostics.warning(
                    &layer.id,
                    format!("file name {name} contains non-ASCII characters"),
                );
            }
        }
        if let DataSourceDescriptor::LocalFile {
            format: FileFormat::Csv,
            csv: Some(options),
            ..
        } = &layer.source
        {
            if !options.is_utf8() {
                diagnostics.warning(
                    &layer.id,
                    format!(
                        "declared encoding {} is not UTF-8",
                        options.encoding.as_deref().unwrap_or_default()
                    ),
                );
            }
        }
    }

    for d in diagnostics.iter() {
        warn!("Project check: {}", d);
    }
    diagnostics
}
