//! Pure aggregation over enriched diagnostics.
//!
//! No I/O and no session access: a [`RunSummary`] is a deterministic
//! function of its input slice, so callers can summarize a full run,
//! a filtered subset, or merged runs interchangeably.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::types::{BusinessSeverity, EnrichedDiagnostic};

/// Severity, file, and symbol rollups for a set of diagnostics.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    total: usize,
    by_severity: BTreeMap<BusinessSeverity, usize>,
    by_file: BTreeMap<PathBuf, usize>,
    /// Keyed by qualified symbol name ("Class::method" or "function").
    by_symbol: BTreeMap<String, usize>,
    /// Diagnostics at module scope, outside any known symbol.
    unattributed: usize,
}

/// Roll up counts by business severity, file, and enclosing symbol.
#[must_use]
pub fn summarize(diagnostics: &[EnrichedDiagnostic]) -> RunSummary {
    let mut summary = RunSummary {
        total: diagnostics.len(),
        ..RunSummary::default()
    };
    for diagnostic in diagnostics {
        *summary
            .by_severity
            .entry(diagnostic.business_severity())
            .or_insert(0) += 1;
        *summary
            .by_file
            .entry(diagnostic.file().to_path_buf())
            .or_insert(0) += 1;
        match diagnostic.symbol() {
            Some(symbol) => {
                *summary.by_symbol.entry(symbol.qualified_name()).or_insert(0) += 1;
            }
            None => summary.unattributed += 1,
        }
    }
    summary
}

impl RunSummary {
    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }

    #[must_use]
    pub fn count_for(&self, severity: BusinessSeverity) -> usize {
        self.by_severity.get(&severity).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn critical_count(&self) -> usize {
        self.count_for(BusinessSeverity::Critical)
    }

    #[must_use]
    pub fn major_count(&self) -> usize {
        self.count_for(BusinessSeverity::Major)
    }

    #[must_use]
    pub fn minor_count(&self) -> usize {
        self.count_for(BusinessSeverity::Minor)
    }

    #[must_use]
    pub fn info_count(&self) -> usize {
        self.count_for(BusinessSeverity::Info)
    }

    #[must_use]
    pub fn count_for_file(&self, file: &Path) -> usize {
        self.by_file.get(file).copied().unwrap_or(0)
    }

    /// Per-file counts, ordered by path.
    #[must_use]
    pub fn by_file(&self) -> &BTreeMap<PathBuf, usize> {
        &self.by_file
    }

    /// Per-symbol counts, keyed by qualified name.
    #[must_use]
    pub fn by_symbol(&self) -> &BTreeMap<String, usize> {
        &self.by_symbol
    }

    /// Diagnostics not attributable to any symbol (module scope).
    #[must_use]
    pub fn unattributed(&self) -> usize {
        self.unattributed
    }

    /// Worst severity present, or `None` for an empty set.
    #[must_use]
    pub fn worst(&self) -> Option<BusinessSeverity> {
        self.by_severity
            .iter()
            .rev()
            .find(|(_, count)| **count > 0)
            .map(|(severity, _)| *severity)
    }

    /// One-line report, e.g. `12 diagnostics: 1 critical, 4 major, 7 minor`.
    #[must_use]
    pub fn headline(&self) -> String {
        if self.total == 0 {
            return "no diagnostics".to_string();
        }
        let mut parts = Vec::new();
        for severity in [
            BusinessSeverity::Critical,
            BusinessSeverity::Major,
            BusinessSeverity::Minor,
            BusinessSeverity::Info,
        ] {
            let count = self.count_for(severity);
            if count > 0 {
                parts.push(format!("{count} {}", severity.label()));
            }
        }
        format!("{} diagnostics: {}", self.total, parts.join(", "))
    }
}
