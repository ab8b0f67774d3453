use serde::{Deserialize, Serialize};

// ── Severity ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

// ── Source ranges ─────────────────────────────────────────────────────────────

/// Where in configuration a problem originates. Supplied by the external
/// loader; the core only carries it through for sorting and display.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceRange {
    pub filename: String,
    pub start_line: u32,
    pub end_line: u32,
}

impl SourceRange {
    pub fn new(filename: impl Into<String>, start_line: u32, end_line: u32) -> Self {
        SourceRange { filename: filename.into(), start_line, end_line }
    }
}

impl std::fmt::Display for SourceRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.filename, self.start_line)
    }
}

// ── Diagnostics ───────────────────────────────────────────────────────────────

/// One typed problem report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub summary: String,
    pub detail: String,
    /// Canonical address of the object the problem concerns, when known.
    pub address: Option<String>,
    pub source: Option<SourceRange>,
    /// RPC-friendly extra metadata carried through untouched.
    pub extra: Option<serde_json::Value>,
}

impl Diagnostic {
    pub fn error(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            summary: summary.into(),
            detail: detail.into(),
            address: None,
            source: None,
            extra: None,
        }
    }

    pub fn warning(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Warning,
            summary: summary.into(),
            detail: detail.into(),
            address: None,
            source: None,
            extra: None,
        }
    }

    pub fn with_address(mut self, address: impl std::fmt::Display) -> Self {
        self.address = Some(address.to_string());
        self
    }

    pub fn with_source(mut self, source: SourceRange) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = Some(extra);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.severity, self.summary)?;
        if !self.detail.is_empty() {
            write!(f, ": {}", self.detail)?;
        }
        if let Some(addr) = &self.address {
            write!(f, " (at {})", addr)?;
        }
        Ok(())
    }
}

/// Append-only collection of diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics(Vec<Diagnostic>);

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics::default()
    }

    pub fn push(&mut self, diag: Diagnostic) -> &mut Self {
        self.0.push(diag);
        self
    }

    pub fn error(&mut self, summary: impl Into<String>, detail: impl Into<String>) -> &mut Self {
        self.push(Diagnostic::error(summary, detail))
    }

    pub fn warning(&mut self, summary: impl Into<String>, detail: impl Into<String>) -> &mut Self {
        self.push(Diagnostic::warning(summary, detail))
    }

    pub fn append(&mut self, mut other: Diagnostics) -> &mut Self {
        self.0.append(&mut other.0);
        self
    }

    /// Append another collection, attaching the given address to any
    /// diagnostic that does not already carry one. Used to contextualize
    /// provider RPC diagnostics with the resource they concern.
    pub fn append_with_address(
        &mut self,
        other: Diagnostics,
        address: impl std::fmt::Display,
    ) -> &mut Self {
        let address = address.to_string();
        for mut diag in other.0 {
            if diag.address.is_none() {
                diag.address = Some(address.clone());
            }
            self.0.push(diag);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn has_errors(&self) -> bool {
        self.0.iter().any(Diagnostic::is_error)
    }

    pub fn error_count(&self) -> usize {
        self.0.iter().filter(|d| d.is_error()).count()
    }

    pub fn warning_count(&self) -> usize {
        self.0.len() - self.error_count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter()
    }

    /// Partition into (errors, warnings), preserving relative order.
    pub fn partition(self) -> (Vec<Diagnostic>, Vec<Diagnostic>) {
        self.0.into_iter().partition(Diagnostic::is_error)
    }

    /// Deterministic order regardless of execution interleaving: by source
    /// range (rangeless first), then summary, then detail.
    pub fn sort(&mut self) {
        self.0.sort_by(|a, b| {
            a.source
                .cmp(&b.source)
                .then_with(|| a.summary.cmp(&b.summary))
                .then_with(|| a.detail.cmp(&b.detail))
        });
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.0
    }
}

impl FromIterator<Diagnostic> for Diagnostics {
    fn from_iter<I: IntoIterator<Item = Diagnostic>>(iter: I) -> Self {
        Diagnostics(iter.into_iter().collect())
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_errors_distinguishes_severity() {
        let mut diags = Diagnostics::new();
        diags.warning("slow", "");
        assert!(!diags.has_errors());
        diags.error("broken", "badly");
        assert!(diags.has_errors());
        assert_eq!(diags.error_count(), 1);
        assert_eq!(diags.warning_count(), 1);
    }

    #[test]
    fn sort_is_deterministic() {
        let mut diags = Diagnostics::new();
        diags.push(
            Diagnostic::error("b", "").with_source(SourceRange::new("main.cfg", 10, 10)),
        );
        diags.push(Diagnostic::error("z", ""));
        diags.push(
            Diagnostic::error("a", "").with_source(SourceRange::new("main.cfg", 2, 2)),
        );
        diags.sort();

        let summaries: Vec<_> = diags.iter().map(|d| d.summary.as_str()).collect();
        // Rangeless first, then by file position.
        assert_eq!(summaries, vec!["z", "a", "b"]);
    }

    #[test]
    fn append_with_address_fills_missing_only() {
        let mut inner = Diagnostics::new();
        inner.push(Diagnostic::error("plain", ""));
        inner.push(Diagnostic::error("addressed", "").with_address("other.addr"));

        let mut outer = Diagnostics::new();
        outer.append_with_address(inner, "test_object.a");

        let addrs: Vec<_> = outer.iter().map(|d| d.address.clone().unwrap()).collect();
        assert_eq!(addrs, vec!["test_object.a".to_string(), "other.addr".to_string()]);
    }
}
