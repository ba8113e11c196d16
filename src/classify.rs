//! Business-severity classification.
//!
//! A pure function from `(raw diagnostic, enclosing symbol)` to a
//! business-impact tier. No state, no I/O — the whole policy is the
//! pattern tables below plus an entry-point escalation rule.

use crate::types::{BusinessSeverity, ProtocolSeverity, RawDiagnostic, SymbolContext};

/// Anything matching these in the message or code is business-critical:
/// security issues, crash classes, resource exhaustion.
const CRITICAL_PATTERNS: &[&str] = &[
    "security",
    "vulnerability",
    "injection",
    "exploit",
    "unsafe",
    "null pointer",
    "nullptr",
    "segmentation fault",
    "segfault",
    "buffer overflow",
    "stack overflow",
    "out of memory",
    "memory leak",
    "resource exhaust",
    "deadlock",
    "infinite loop",
];

/// Raises to Major (never lowers): deprecation, performance, typing.
const MAJOR_PATTERNS: &[&str] = &[
    "deprecated",
    "deprecation",
    "performance",
    "inefficient",
    "type mismatch",
    "mismatched types",
    "incompatible type",
];

/// Lowers to Minor (never raises): cosmetic findings.
const MINOR_PATTERNS: &[&str] = &[
    "style",
    "format",
    "formatting",
    "whitespace",
    "naming",
    "convention",
    "snake_case",
    "camelcase",
];

/// Symbols whose diagnostics deserve an extra tier of attention.
const ENTRY_POINT_NAMES: &[&str] = &["main", "__main__", "init", "__init__", "setup", "start", "run"];

fn base_severity(protocol: Option<ProtocolSeverity>) -> BusinessSeverity {
    match protocol {
        Some(ProtocolSeverity::Error) => BusinessSeverity::Major,
        Some(ProtocolSeverity::Warning) => BusinessSeverity::Minor,
        Some(ProtocolSeverity::Information | ProtocolSeverity::Hint) | None => {
            BusinessSeverity::Info
        }
    }
}

fn matches_any(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| haystack.contains(p))
}

fn is_entry_point(symbol: Option<&SymbolContext>) -> bool {
    symbol.is_some_and(|s| {
        let name = s.name().to_lowercase();
        ENTRY_POINT_NAMES.contains(&name.as_str())
    })
}

/// Classify one diagnostic.
///
/// Base tier comes from the protocol severity; the pattern overrides are
/// evaluated in order with first match winning (critical always wins,
/// major can only raise, minor can only lower). Diagnostics at protocol
/// Error/Warning inside an entry-point symbol are escalated one tier
/// afterwards, capped at Critical.
#[must_use]
pub fn classify(raw: &RawDiagnostic, symbol: Option<&SymbolContext>) -> BusinessSeverity {
    let base = base_severity(raw.severity());

    let mut text = raw.message().to_lowercase();
    if let Some(code) = raw.code() {
        text.push(' ');
        text.push_str(&code.to_lowercase());
    }

    let classified = if matches_any(&text, CRITICAL_PATTERNS) {
        BusinessSeverity::Critical
    } else if matches_any(&text, MAJOR_PATTERNS) {
        base.max(BusinessSeverity::Major)
    } else if matches_any(&text, MINOR_PATTERNS) {
        base.min(BusinessSeverity::Minor)
    } else {
        base
    };

    let escalatable = matches!(
        raw.severity(),
        Some(ProtocolSeverity::Error | ProtocolSeverity::Warning)
    );
    if escalatable && is_entry_point(symbol) {
        classified.escalate()
    } else {
        classified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SymbolKind;

    fn diag(severity: Option<u64>, message: &str) -> RawDiagnostic {
        RawDiagnostic::new(0, 0, severity, message, None, None)
    }

    fn in_symbol(name: &str) -> SymbolContext {
        SymbolContext::new(name, SymbolKind::Function, None, 1, 100)
    }

    #[test]
    fn test_base_mapping() {
        assert_eq!(
            classify(&diag(Some(1), "something broke"), None),
            BusinessSeverity::Major
        );
        assert_eq!(
            classify(&diag(Some(2), "something iffy"), None),
            BusinessSeverity::Minor
        );
        assert_eq!(
            classify(&diag(Some(3), "fyi"), None),
            BusinessSeverity::Info
        );
        assert_eq!(
            classify(&diag(Some(4), "hint"), None),
            BusinessSeverity::Info
        );
        assert_eq!(classify(&diag(None, "no severity"), None), BusinessSeverity::Info);
    }

    #[test]
    fn test_determinism() {
        let d = diag(Some(2), "possible SQL injection in query builder");
        let ctx = in_symbol("build_query");
        assert_eq!(classify(&d, Some(&ctx)), classify(&d, Some(&ctx)));
    }

    #[test]
    fn test_critical_patterns_always_win() {
        // Even a Hint gets Critical if it smells like a security issue.
        assert_eq!(
            classify(&diag(Some(4), "potential security vulnerability"), None),
            BusinessSeverity::Critical
        );
        assert_eq!(
            classify(&diag(Some(1), "null pointer dereference"), None),
            BusinessSeverity::Critical
        );
        assert_eq!(
            classify(&diag(Some(3), "possible memory leak in handler"), None),
            BusinessSeverity::Critical
        );
    }

    #[test]
    fn test_major_patterns_raise_but_never_lower() {
        // Warning base is Minor; "deprecated" raises it to Major.
        assert_eq!(
            classify(&diag(Some(2), "use of deprecated API"), None),
            BusinessSeverity::Major
        );
        // Error base is already Major; stays Major.
        assert_eq!(
            classify(&diag(Some(1), "mismatched types in assignment"), None),
            BusinessSeverity::Major
        );
    }

    #[test]
    fn test_minor_patterns_lower_but_never_raise() {
        // Error base Major lowered to Minor by a style match.
        assert_eq!(
            classify(&diag(Some(1), "line formatting does not match style"), None),
            BusinessSeverity::Minor
        );
        // Info base stays Info — minor patterns never raise.
        assert_eq!(
            classify(&diag(Some(3), "naming convention: prefer snake_case"), None),
            BusinessSeverity::Info
        );
    }

    #[test]
    fn test_code_participates_in_matching() {
        let d = RawDiagnostic::new(
            0,
            0,
            Some(2),
            "bad call",
            Some("security/audit-001".to_string()),
            None,
        );
        assert_eq!(classify(&d, None), BusinessSeverity::Critical);
    }

    #[test]
    fn test_entry_point_escalation() {
        let main = in_symbol("main");
        // Warning + "deprecated API" is Major; inside main it's Critical.
        assert_eq!(
            classify(&diag(Some(2), "deprecated API"), None),
            BusinessSeverity::Major
        );
        assert_eq!(
            classify(&diag(Some(2), "deprecated API"), Some(&main)),
            BusinessSeverity::Critical
        );
        // Plain Warning (Minor) inside main becomes Major.
        assert_eq!(
            classify(&diag(Some(2), "unused variable"), Some(&main)),
            BusinessSeverity::Major
        );
    }

    #[test]
    fn test_escalation_requires_error_or_warning() {
        let setup = in_symbol("setup");
        // Info/Hint severities do not escalate even in entry points.
        assert_eq!(
            classify(&diag(Some(3), "note"), Some(&setup)),
            BusinessSeverity::Info
        );
        assert_eq!(
            classify(&diag(Some(4), "hint"), Some(&setup)),
            BusinessSeverity::Info
        );
    }

    #[test]
    fn test_escalation_caps_at_critical() {
        let init = in_symbol("init");
        assert_eq!(
            classify(&diag(Some(1), "buffer overflow risk"), Some(&init)),
            BusinessSeverity::Critical
        );
    }

    #[test]
    fn test_non_entry_point_does_not_escalate() {
        let helper = in_symbol("parse_headers");
        assert_eq!(
            classify(&diag(Some(2), "unused variable"), Some(&helper)),
            BusinessSeverity::Minor
        );
    }

    #[test]
    fn test_entry_point_name_case_insensitive() {
        let ctx = in_symbol("Main");
        assert_eq!(
            classify(&diag(Some(2), "unused variable"), Some(&ctx)),
            BusinessSeverity::Major
        );
    }
}
