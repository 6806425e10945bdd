//! Shared pieces of the `fieldpack` binary: argument parsing helpers and
//! the outcome tables it prints.

use anyhow::{Context, Result, bail};
use fieldpack_export::ExportSummary;
use fieldpack_package::{Package, extract};
use fieldpack_sync::{ConflictReport, Decision, SyncSummary};
use fieldpack_types::Value;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Parses a conflict decision.
///
/// `keep-local`, `keep-remote`, `null`, `value:<text>` or `json:<json>`.
pub fn parse_decision(text: &str) -> Result<Decision> {
    match text {
        "keep-local" | "local" => return Ok(Decision::KeepLocal),
        "keep-remote" | "remote" => return Ok(Decision::KeepRemote),
        "null" => return Ok(Decision::Overwrite(Value::Null)),
        _ => {}
    }
    if let Some(value) = text.strip_prefix("value:") {
        return Ok(Decision::Overwrite(Value::from(value)));
    }
    if let Some(json) = text.strip_prefix("json:") {
        let parsed: serde_json::Value =
            serde_json::from_str(json).with_context(|| format!("invalid JSON in decision {text:?}"))?;
        return Ok(Decision::Overwrite(Value::from_json(&parsed)));
    }
    bail!("unknown decision {text:?}; expected keep-local, keep-remote, null, value:<text> or json:<json>")
}

/// Parses `ID=DECISION`.
pub fn parse_assignment(text: &str) -> Result<(u64, Decision)> {
    let (id, decision) = text
        .split_once('=')
        .with_context(|| format!("expected ID=DECISION, got {text:?}"))?;
    let id = id
        .trim()
        .parse()
        .with_context(|| format!("invalid conflict id {id:?}"))?;
    Ok((id, parse_decision(decision.trim())?))
}

/// Opens a returned package; a `.zip` archive is first extracted next to
/// itself.
pub fn open_package(path: &Path) -> Result<Package> {
    let root = if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("zip")) {
        let dest = unpacked_dir(path);
        if dest.exists() {
            info!("Using previously extracted package {:?}", dest);
        } else {
            extract(path, &dest).with_context(|| format!("failed to extract {}", path.display()))?;
        }
        dest
    } else {
        path.to_path_buf()
    };
    Package::open(&root).with_context(|| format!("failed to open package {}", root.display()))
}

fn unpacked_dir(archive: &Path) -> PathBuf {
    archive.with_extension("")
}

fn row(out: &mut String, id: &str, name: &str, outcome: &str) {
    let _ = writeln!(out, "  {id:<20} {name:<24} {outcome}");
}

/// Per-layer outcome table of a packaging run, followed by diagnostics.
#[must_use]
pub fn export_table(summary: &ExportSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Package {} ({})", summary.package.display(), summary.package_id);
    row(&mut out, "LAYER", "NAME", "OUTCOME");
    for layer in &summary.layers {
        row(&mut out, layer.layer_id.as_str(), &layer.name, &layer.outcome.to_string());
    }
    if let Some(archive) = &summary.archive {
        let _ = writeln!(out, "Archive {} (sha256 {})", archive.path.display(), archive.sha256);
    }
    if !summary.diagnostics.is_empty() {
        let _ = writeln!(out, "Diagnostics:");
        for diagnostic in summary.diagnostics.iter() {
            let _ = writeln!(out, "  {diagnostic}");
        }
    }
    out
}

/// Per-layer outcome table of a synchronization or resolution run.
#[must_use]
pub fn sync_table(summary: &SyncSummary) -> String {
    let mut out = String::new();
    row(&mut out, "LAYER", "NAME", "OUTCOME");
    for layer in &summary.layers {
        row(&mut out, layer.layer_id.as_str(), &layer.name, &layer.outcome.to_string());
    }
    let pending = summary.report.unresolved().count();
    if pending > 0 {
        let _ = writeln!(out, "{pending} conflicts need a decision (fieldpack resolve --list)");
    }
    out
}

/// Lists the records of a conflict report.
#[must_use]
pub fn conflict_table(report: &ConflictReport) -> String {
    let mut out = String::new();
    if report.is_empty() {
        let _ = writeln!(out, "No conflicts.");
        return out;
    }
    for record in &report.records {
        let decision = match &record.decision {
            Some(Decision::KeepLocal) => "keep-local".to_string(),
            Some(Decision::KeepRemote) => "keep-remote".to_string(),
            Some(Decision::Overwrite(value)) => format!("overwrite with {value}"),
            None => "undecided".to_string(),
        };
        let _ = writeln!(
            out,
            "#{:<4} {}/{} {}: base {} | local {} | remote {} [{}]",
            record.id, record.layer_id, record.key, record.target, record.base, record.local, record.remote, decision
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decisions_parse() {
        assert_eq!(parse_decision("keep-local").unwrap(), Decision::KeepLocal);
        assert_eq!(parse_decision("remote").unwrap(), Decision::KeepRemote);
        assert_eq!(
            parse_decision("value:red oak").unwrap(),
            Decision::Overwrite(Value::from("red oak"))
        );
        assert_eq!(parse_decision("json:12").unwrap(), Decision::Overwrite(Value::from(12i64)));
        assert!(parse_decision("maybe").is_err());
        assert!(parse_decision("json:{").is_err());
    }

    #[test]
    fn assignments_parse() {
        let (id, decision) = parse_assignment("3 = keep-remote").unwrap();
        assert_eq!(id, 3);
        assert_eq!(decision, Decision::KeepRemote);
        assert!(parse_assignment("keep-local").is_err());
        assert!(parse_assignment("x=keep-local").is_err());
    }

    #[test]
    fn archives_unpack_beside_themselves() {
        assert_eq!(
            unpacked_dir(Path::new("/tmp/field.zip")),
            PathBuf::from("/tmp/field")
        );
    }
}
