//! Diagnostics emitted by the packaging pipeline.
//!
//! A diagnostic never aborts a run. Layers that are skipped, fields that are
//! dropped and relationships that are demoted all end up here so the caller
//! can show exactly what did not make it into the package.

use crate::ids::LayerId;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

/// A single (layer, severity, reason) entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// `None` for project-wide findings.
    pub layer_id: Option<LayerId>,
    pub severity: Severity,
    pub reason: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.layer_id {
            Some(id) => write!(f, "[{}] {}: {}", self.severity, id, self.reason),
            None => write!(f, "[{}] {}", self.severity, self.reason),
        }
    }
}

/// Ordered diagnostics stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Diagnostics(Vec<Diagnostic>);

impl Diagnostics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, layer_id: Option<&LayerId>, severity: Severity, reason: impl Into<String>) {
        self.0.push(Diagnostic {
            layer_id: layer_id.cloned(),
            severity,
            reason: reason.into(),
        });
    }

    pub fn info(&mut self, layer_id: &LayerId, reason: impl Into<String>) {
        self.push(Some(layer_id), Severity::Info, reason);
    }

    pub fn warning(&mut self, layer_id: &LayerId, reason: impl Into<String>) {
        self.push(Some(layer_id), Severity::Warning, reason);
    }

    pub fn error(&mut self, layer_id: &LayerId, reason: impl Into<String>) {
        self.push(Some(layer_id), Severity::Error, reason);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.0.extend(other.0);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter()
    }

    /// All entries concerning one layer, in emission order.
    pub fn for_layer<'a>(&'a self, layer_id: &'a LayerId) -> impl Iterator<Item = &'a Diagnostic> {
        self.0
            .iter()
            .filter(move |d| d.layer_id.as_ref() == Some(layer_id))
    }

    #[must_use]
    pub fn has_severity(&self, severity: Severity) -> bool {
        self.0.iter().any(|d| d.severity == severity)
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.0
    }
}

impl<'a> IntoIterator for &'a Diagnostics {
    type Item = &'a Diagnostic;
    type IntoIter = std::slice::Iter<'a, Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
