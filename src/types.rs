//! Public data model for harvested diagnostics.
//!
//! These types define the interface between the engine and its callers:
//! the caller supplies a file list and receives a [`CollectionRun`] of
//! [`EnrichedDiagnostic`]s plus [`Progress`] events along the way.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Severity as defined by the protocol (1=Error .. 4=Hint).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl ProtocolSeverity {
    /// Convert from the wire's numeric severity.
    ///
    /// Returns `None` for values outside the defined range.
    /// Callers (boundary code) decide the fallback policy.
    #[must_use]
    pub fn from_wire(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

/// Business-impact tier derived by the classifier.
///
/// Ordered: `Info < Minor < Major < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BusinessSeverity {
    Info,
    Minor,
    Major,
    Critical,
}

impl BusinessSeverity {
    /// One tier up, saturating at `Critical`.
    #[must_use]
    pub fn escalate(self) -> Self {
        match self {
            Self::Info => Self::Minor,
            Self::Minor => Self::Major,
            Self::Major | Self::Critical => Self::Critical,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Major => "major",
            Self::Minor => "minor",
            Self::Info => "info",
        }
    }
}

/// Wire diagnostic tags (1 = Unnecessary, 2 = Deprecated).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticTag {
    Unnecessary,
    Deprecated,
}

impl DiagnosticTag {
    #[must_use]
    pub fn from_wire(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Unnecessary),
            2 => Some(Self::Deprecated),
            _ => None,
        }
    }
}

/// Diagnostic codes arrive as either a string or an integer on the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum WireCode {
    Int(i64),
    Str(String),
}

impl WireCode {
    fn normalize(&self) -> String {
        match self {
            Self::Int(n) => n.to_string(),
            Self::Str(s) => s.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub(crate) struct WirePosition {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub(crate) struct WireRange {
    pub start: WirePosition,
    #[allow(dead_code)]
    pub end: WirePosition,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WireRelatedInformation {
    pub message: String,
}

/// A diagnostic exactly as received from the protocol, validated once at
/// the boundary. Positions are wire 0-based; immutable after parse.
#[derive(Debug, Clone, Deserialize)]
pub struct RawDiagnostic {
    pub(crate) range: WireRange,
    pub(crate) severity: Option<u64>,
    pub(crate) message: String,
    pub(crate) code: Option<WireCode>,
    pub(crate) source: Option<String>,
    #[serde(default)]
    pub(crate) tags: Vec<u64>,
    #[serde(rename = "relatedInformation", default)]
    pub(crate) related_information: Vec<WireRelatedInformation>,
}

impl RawDiagnostic {
    /// Construct a raw diagnostic directly, bypassing the wire.
    /// Intended for tests and for callers feeding pre-parsed data.
    #[must_use]
    pub fn new(
        line: u32,
        character: u32,
        severity: Option<u64>,
        message: impl Into<String>,
        code: Option<String>,
        source: Option<String>,
    ) -> Self {
        let position = WirePosition { line, character };
        Self {
            range: WireRange {
                start: position,
                end: position,
            },
            severity,
            message: message.into(),
            code: code.map(WireCode::Str),
            source,
            tags: Vec::new(),
            related_information: Vec::new(),
        }
    }

    /// 0-based wire line of the diagnostic start.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.range.start.line
    }

    /// 0-based wire column of the diagnostic start.
    #[must_use]
    pub fn character(&self) -> u32 {
        self.range.start.character
    }

    /// Protocol severity, if the server sent one in the defined range.
    #[must_use]
    pub fn severity(&self) -> Option<ProtocolSeverity> {
        self.severity.and_then(ProtocolSeverity::from_wire)
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Normalized diagnostic code (integer codes become their decimal form).
    #[must_use]
    pub fn code(&self) -> Option<String> {
        self.code.as_ref().map(WireCode::normalize)
    }

    #[must_use]
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    #[must_use]
    pub fn tags(&self) -> Vec<DiagnosticTag> {
        self.tags
            .iter()
            .filter_map(|t| DiagnosticTag::from_wire(*t))
            .collect()
    }

    /// Messages of secondary locations, if the server attached any.
    #[must_use]
    pub fn related_messages(&self) -> Vec<&str> {
        self.related_information
            .iter()
            .map(|r| r.message.as_str())
            .collect()
    }
}

/// Kind of the symbol enclosing a diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    Module,
    Function,
    Method,
    Class,
}

impl SymbolKind {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Module => "module",
            Self::Function => "function",
            Self::Method => "method",
            Self::Class => "class",
        }
    }
}

/// The enclosing function/method/class for a span of source lines.
///
/// Built once per file per run by the context index; looked up by line,
/// never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolContext {
    name: String,
    kind: SymbolKind,
    enclosing_class: Option<String>,
    /// 1-based inclusive span.
    line_start: u32,
    line_end: u32,
}

impl SymbolContext {
    /// Construct a symbol context. `line_start` must be <= `line_end`;
    /// a reversed span is normalized rather than rejected.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        kind: SymbolKind,
        enclosing_class: Option<String>,
        line_start: u32,
        line_end: u32,
    ) -> Self {
        let (line_start, line_end) = if line_start <= line_end {
            (line_start, line_end)
        } else {
            (line_end, line_start)
        };
        Self {
            name: name.into(),
            kind,
            enclosing_class,
            line_start,
            line_end,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> SymbolKind {
        self.kind
    }

    #[must_use]
    pub fn enclosing_class(&self) -> Option<&str> {
        self.enclosing_class.as_deref()
    }

    #[must_use]
    pub fn line_start(&self) -> u32 {
        self.line_start
    }

    #[must_use]
    pub fn line_end(&self) -> u32 {
        self.line_end
    }

    /// Whether a 1-based line falls inside this symbol's span.
    #[must_use]
    pub fn contains(&self, line: u32) -> bool {
        self.line_start <= line && line <= self.line_end
    }

    /// Span length in lines; smaller means more deeply nested.
    #[must_use]
    pub fn span_len(&self) -> u32 {
        self.line_end - self.line_start + 1
    }

    /// Qualified label like `Cache::get` or plain `main`.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        match &self.enclosing_class {
            Some(class) => format!("{class}::{}", self.name),
            None => self.name.clone(),
        }
    }
}

/// Deduplication key: `(file, line, column, message, code)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    file: PathBuf,
    line: u32,
    column: u32,
    message: String,
    code: Option<String>,
}

/// A fully attributed, classified diagnostic.
///
/// Fields are private; construction is restricted to the collector.
/// Positions are 1-based — wire 0-based values never leave the boundary.
#[derive(Debug, Clone)]
pub struct EnrichedDiagnostic {
    /// Repository-relative path.
    file: PathBuf,
    /// 1-based line.
    line: u32,
    /// 1-based column.
    column: u32,
    protocol_severity: ProtocolSeverity,
    business_severity: BusinessSeverity,
    message: String,
    code: Option<String>,
    /// Originating checker (e.g. "rustc", "pyright"); "unknown" when the
    /// server omitted it.
    source: String,
    symbol: Option<SymbolContext>,
}

impl EnrichedDiagnostic {
    pub(crate) fn new(
        file: PathBuf,
        line: u32,
        column: u32,
        protocol_severity: ProtocolSeverity,
        business_severity: BusinessSeverity,
        message: String,
        code: Option<String>,
        source: String,
        symbol: Option<SymbolContext>,
    ) -> Self {
        Self {
            file,
            line,
            column,
            protocol_severity,
            business_severity,
            message,
            code,
            source,
            symbol,
        }
    }

    #[must_use]
    pub fn file(&self) -> &Path {
        &self.file
    }

    /// 1-based line.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    /// 1-based column.
    #[must_use]
    pub fn column(&self) -> u32 {
        self.column
    }

    #[must_use]
    pub fn protocol_severity(&self) -> ProtocolSeverity {
        self.protocol_severity
    }

    #[must_use]
    pub fn business_severity(&self) -> BusinessSeverity {
        self.business_severity
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn symbol(&self) -> Option<&SymbolContext> {
        self.symbol.as_ref()
    }

    #[must_use]
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            file: self.file.clone(),
            line: self.line,
            column: self.column,
            message: self.message.clone(),
            code: self.code.clone(),
        }
    }

    /// Format as `path:line:col: severity: [source] message`.
    #[must_use]
    pub fn display(&self) -> String {
        format!(
            "{}:{}:{}: {}: [{}] {}",
            self.file.display(),
            self.line,
            self.column,
            self.business_severity.label(),
            self.source,
            self.message,
        )
    }
}

/// The aggregate result of one harvesting pass.
///
/// Created at the start of a pass, mutated only by the collector's
/// aggregation loop, frozen when returned.
#[derive(Debug)]
pub struct CollectionRun {
    total_files: usize,
    processed_files: usize,
    failed_files: usize,
    retried_files: usize,
    diagnostics: Vec<EnrichedDiagnostic>,
    errors_by_file: BTreeMap<PathBuf, String>,
    elapsed: Duration,
}

impl CollectionRun {
    pub(crate) fn new(total_files: usize) -> Self {
        Self {
            total_files,
            processed_files: 0,
            failed_files: 0,
            retried_files: 0,
            diagnostics: Vec::new(),
            errors_by_file: BTreeMap::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub(crate) fn record_processed(&mut self, diagnostics: Vec<EnrichedDiagnostic>) {
        self.processed_files += 1;
        self.diagnostics.extend(diagnostics);
    }

    pub(crate) fn record_failed(&mut self, file: PathBuf, reason: String) {
        self.failed_files += 1;
        self.errors_by_file.insert(file, reason);
    }

    pub(crate) fn record_retry(&mut self) {
        self.retried_files += 1;
    }

    pub(crate) fn set_elapsed(&mut self, elapsed: Duration) {
        self.elapsed = elapsed;
    }

    #[must_use]
    pub fn total_files(&self) -> usize {
        self.total_files
    }

    #[must_use]
    pub fn processed_files(&self) -> usize {
        self.processed_files
    }

    #[must_use]
    pub fn failed_files(&self) -> usize {
        self.failed_files
    }

    /// Number of files that needed at least one retry (counted once per
    /// file, regardless of how many attempts it took).
    #[must_use]
    pub fn retried_files(&self) -> usize {
        self.retried_files
    }

    #[must_use]
    pub fn diagnostics(&self) -> &[EnrichedDiagnostic] {
        &self.diagnostics
    }

    /// Files that could not be analyzed, with the terminal reason.
    /// Always distinct from "no diagnostics found".
    #[must_use]
    pub fn errors_by_file(&self) -> &BTreeMap<PathBuf, String> {
        &self.errors_by_file
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Every file accounted for exactly once.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.processed_files + self.failed_files == self.total_files
    }
}

/// A progress snapshot emitted while a run is in flight.
#[derive(Debug, Clone)]
pub struct Progress {
    pub processed: usize,
    pub total: usize,
    pub elapsed: Duration,
    /// Linear estimate; `None` until at least one file has finished.
    pub estimated_remaining: Option<Duration>,
}
