//! Diagnostic model: severity, stable codes, related locations.

use crate::{Location, Range};
use serde::Serialize;
use std::fmt;

/// Diagnostic severity, ordered from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Severity {
    Error,
    Warning,
    Note,
    Hint,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Note => "note",
            Severity::Hint => "hint",
        };
        f.write_str(s)
    }
}

/// Extra location attached to a diagnostic (e.g. the other definition in a
/// redefinition report).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelatedInfo {
    pub location: Location,
    pub message: String,
}

/// One reported problem.
///
/// `code` is a stable short identifier grouped by taxonomy prefix:
/// `LEX*` lexical, `SYN*` syntactic, `SEM*` semantic-immediate,
/// `DEF*` semantic-deferred, `MNT*` advisory (MNOTE). Message wording is
/// free-form and not part of any compatibility contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub uri: String,
    pub range: Range,
    pub severity: Severity,
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<RelatedInfo>,
}

impl Diagnostic {
    pub fn new(
        severity: Severity,
        code: &'static str,
        range: Range,
        message: impl Into<String>,
    ) -> Self {
        Self {
            uri: String::new(),
            range,
            severity,
            code,
            message: message.into(),
            related: Vec::new(),
        }
    }

    pub fn error(code: &'static str, range: Range, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, code, range, message)
    }

    pub fn warning(code: &'static str, range: Range, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, code, range, message)
    }

    pub fn note(code: &'static str, range: Range, message: impl Into<String>) -> Self {
        Self::new(Severity::Note, code, range, message)
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    pub fn with_related(mut self, location: Location, message: impl Into<String>) -> Self {
        self.related.push(RelatedInfo {
            location,
            message: message.into(),
        });
        self
    }
}

/// Ordered sink for diagnostics.
///
/// Layers that can produce diagnostics take `&mut DiagnosticCollector`
/// rather than returning them, so a statement's errors stay attached to the
/// statement that produced them while the stream keeps flowing.
#[derive(Debug, Default)]
pub struct DiagnosticCollector {
    diags: Vec<Diagnostic>,
    default_uri: String,
}

impl DiagnosticCollector {
    pub fn new(default_uri: impl Into<String>) -> Self {
        Self {
            diags: Vec::new(),
            default_uri: default_uri.into(),
        }
    }

    pub fn add(&mut self, mut diag: Diagnostic) {
        if diag.uri.is_empty() {
            diag.uri = self.default_uri.clone();
        }
        self.diags.push(diag);
    }

    pub fn extend(&mut self, diags: impl IntoIterator<Item = Diagnostic>) {
        for d in diags {
            self.add(d);
        }
    }

    pub fn diags(&self) -> &[Diagnostic] {
        &self.diags
    }

    pub fn is_empty(&self) -> bool {
        self.diags.is_empty()
    }

    pub fn take(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diags)
    }

    /// Highest severity seen so far, if any diagnostic was reported.
    pub fn max_severity(&self) -> Option<Severity> {
        self.diags.iter().map(|d| d.severity).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Position;

    #[test]
    fn collector_fills_default_uri() {
        let mut sink = DiagnosticCollector::new("file:///a.hlasm");
        sink.add(Diagnostic::error(
            "SEM001",
            Range::at(Position::new(0, 0)),
            "symbol already defined",
        ));
        assert_eq!(sink.diags()[0].uri, "file:///a.hlasm");
    }

    #[test]
    fn explicit_uri_wins_over_default() {
        let mut sink = DiagnosticCollector::new("file:///a.hlasm");
        sink.add(
            Diagnostic::warning("MNT002", Range::default(), "mnote").with_uri("hlasm://1/x.hlasm"),
        );
        assert_eq!(sink.diags()[0].uri, "hlasm://1/x.hlasm");
    }

    #[test]
    fn max_severity_prefers_errors() {
        let mut sink = DiagnosticCollector::new("u");
        sink.add(Diagnostic::note("MNT000", Range::default(), "n"));
        sink.add(Diagnostic::error("DEF001", Range::default(), "e"));
        sink.add(Diagnostic::warning("LEX001", Range::default(), "w"));
        assert_eq!(sink.max_severity(), Some(Severity::Error));
    }
}
