//! Diagnostic harvesting over the Language Server Protocol.
//!
//! Spawns a language server, drives one JSON-RPC session against it, and
//! turns server diagnostics into symbol-attributed, severity-classified
//! results suitable for whole-repository reporting.

pub mod aggregate;
pub mod codec;
pub mod collector;
pub mod context;
pub mod error;
pub mod session;
pub mod transport;
pub mod types;

pub(crate) mod classify;
pub(crate) mod protocol;

pub use aggregate::{RunSummary, summarize};
pub use collector::{CancelFlag, CollectorConfig, DiagnosticCollector};
pub use context::{ContextLanguage, SyntaxContextIndex};
pub use error::{SessionError, TransportError};
pub use session::{ProtocolSession, SessionState};
pub use transport::{ServerLaunch, ServerProcess};
pub use types::{
    BusinessSeverity, CollectionRun, EnrichedDiagnostic, Progress, ProtocolSeverity, RawDiagnostic,
    SymbolContext, SymbolKind,
};
