//! Typed error taxonomy for the harvesting engine.
//!
//! Transport and session errors are returned to callers, never swallowed.
//! The collector is the single place that decides retry-vs-fail, via
//! [`SessionError::is_transient`].

use thiserror::Error;

/// JSON-RPC error codes that mean "try again later" rather than "this
/// request is wrong": RequestCancelled, ContentModified, ServerCancelled.
const TRANSIENT_REMOTE_CODES: [i64; 3] = [-32800, -32801, -32803];

/// Errors from the framing layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying pipe is gone (child exited or closed its stdio).
    #[error("transport closed")]
    Closed,

    /// Malformed frame: bad header, missing Content-Length, truncated
    /// body, oversized frame, or an unparseable JSON payload.
    #[error("frame error: {0}")]
    Frame(String),

    /// No complete frame arrived within the read deadline.
    #[error("transport read timed out")]
    Timeout,
}

/// Errors from a protocol session on top of the transport.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A call was issued outside the Ready state. Sequencing bug —
    /// never expected in normal operation.
    #[error("session not ready (state: {0})")]
    NotReady(&'static str),

    /// The server did not answer a request within its timeout.
    #[error("request '{method}' timed out")]
    RequestTimeout { method: String },

    /// The server answered with a JSON-RPC error object.
    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The writer or reader task is gone; the session is dead.
    #[error("session channel closed")]
    ChannelClosed,
}

impl SessionError {
    /// Whether the collector may retry the file that hit this error.
    ///
    /// Timeouts and transport hiccups are worth another attempt; a remote
    /// error is retried only for the cancelled/content-modified family.
    /// `NotReady` is a sequencing bug and never retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RequestTimeout { .. } => true,
            Self::Remote { code, .. } => TRANSIENT_REMOTE_CODES.contains(code),
            Self::Transport(TransportError::Timeout) => true,
            Self::Transport(TransportError::Closed | TransportError::Frame(_)) => false,
            Self::NotReady(_) | Self::ChannelClosed => false,
        }
    }
}
