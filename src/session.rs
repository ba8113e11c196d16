//! Protocol session — correlated request/response/notification traffic on
//! top of a framed byte stream.
//!
//! One session per server process. A background reader task is the sole
//! reader of the transport: responses are routed to their pending slot by
//! ID and unsolicited `publishDiagnostics` notifications land in a per-URI
//! inbox. Diagnostic fetches race a direct pull request against that inbox
//! because servers vary in which path they actually answer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::Instant;

use crate::codec::{FrameReader, FrameWriter};
use crate::error::SessionError;
use crate::protocol::{
    self, DocumentDiagnosticReport, Notification, PublishDiagnosticsParams, Request,
};
use crate::transport::{ServerLaunch, ServerProcess};
use crate::types::RawDiagnostic;

const INIT_TIMEOUT: Duration = Duration::from_secs(30);

const SHUTDOWN_CALL_TIMEOUT: Duration = Duration::from_secs(5);

const WRITER_CHANNEL_CAPACITY: usize = 64;

enum WriterCommand {
    Send(serde_json::Value),
    Shutdown,
}

/// Handshake / shutdown state machine.
///
/// `Uninitialized → Initializing → Ready → ShuttingDown → Closed`;
/// any failure before `Ready` is terminal for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    ShuttingDown,
    Closed,
}

impl SessionState {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::ShuttingDown => "shutting down",
            Self::Closed => "closed",
        }
    }
}

enum IncomingFrame {
    Response {
        id: u64,
        body: serde_json::Value,
    },
    ServerRequest {
        id: serde_json::Value,
        method: String,
    },
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

fn parse_incoming(frame: &serde_json::Value) -> Option<IncomingFrame> {
    let id = frame.get("id");
    let method = frame
        .get("method")
        .and_then(|m| m.as_str())
        .map(String::from);
    let has_result_or_error = frame.get("result").is_some() || frame.get("error").is_some();

    match (id, method, has_result_or_error) {
        (Some(id_val), None, true) => Some(IncomingFrame::Response {
            id: id_val.as_u64()?,
            body: frame.clone(),
        }),
        (Some(id_val), Some(method), _) => Some(IncomingFrame::ServerRequest {
            id: id_val.clone(),
            method,
        }),
        (None, Some(method), _) => Some(IncomingFrame::Notification {
            method,
            params: frame.get("params").cloned(),
        }),
        _ => None,
    }
}

/// URIs arrive with whatever escaping the server chose; normalize so
/// inbox keys match the URIs we produced ourselves.
fn canonical_uri(uri: &str) -> String {
    url::Url::parse(uri)
        .map(String::from)
        .unwrap_or_else(|_| uri.to_string())
}

/// Per-URI mailbox for pushed diagnostics.
///
/// The reader task is the only writer; waiters take entries out. A later
/// publish for the same URI overwrites an unconsumed earlier one.
struct Inbox {
    published: StdMutex<HashMap<String, Vec<RawDiagnostic>>>,
    changed: Notify,
}

impl Inbox {
    fn new() -> Self {
        Self {
            published: StdMutex::new(HashMap::new()),
            changed: Notify::new(),
        }
    }

    fn push(&self, uri: String, diagnostics: Vec<RawDiagnostic>) {
        self.published
            .lock()
            .expect("inbox lock poisoned")
            .insert(uri, diagnostics);
        self.changed.notify_waiters();
    }

    fn take(&self, uri: &str) -> Option<Vec<RawDiagnostic>> {
        self.published
            .lock()
            .expect("inbox lock poisoned")
            .remove(uri)
    }

    /// Wait until diagnostics for `uri` arrive or the deadline passes.
    async fn wait_for(&self, uri: &str, deadline: Instant) -> Option<Vec<RawDiagnostic>> {
        loop {
            // Register for wakeup before checking, so a push between the
            // check and the await is not lost.
            let notified = self.changed.notified();
            if let Some(diagnostics) = self.take(uri) {
                return Some(diagnostics);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.take(uri);
            }
        }
    }
}

/// Clears a pending-request slot when its call future completes or is
/// dropped. A pull abandoned mid-flight (the publish path won the race,
/// or the caller gave up) must not leave its entry in the map.
struct PendingGuard<'a> {
    pending: &'a StdMutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&self.id);
    }
}

/// A correlated JSON-RPC session over a framed transport.
///
/// All methods take `&self`; the request-ID counter and pending-response
/// table are the only shared mutable state and each is individually
/// synchronized so collector workers can share one session.
pub struct ProtocolSession {
    state: Arc<StdMutex<SessionState>>,
    next_id: AtomicU64,
    pending: Arc<StdMutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>>,
    inbox: Arc<Inbox>,
    writer_tx: mpsc::Sender<WriterCommand>,
    #[allow(dead_code)]
    reader_handle: tokio::task::JoinHandle<()>,
    #[allow(dead_code)]
    writer_handle: tokio::task::JoinHandle<()>,
}

impl ProtocolSession {
    /// Stand up reader/writer tasks over an arbitrary byte-stream pair.
    ///
    /// The session starts `Uninitialized`; drive [`Self::initialize`]
    /// before issuing calls.
    pub fn connect<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let state = Arc::new(StdMutex::new(SessionState::Uninitialized));
        let pending: Arc<StdMutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>> =
            Arc::new(StdMutex::new(HashMap::new()));
        let inbox = Arc::new(Inbox::new());

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let writer_handle = tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            tracing::warn!("session write error: {e}");
                            break;
                        }
                    }
                    WriterCommand::Shutdown => break,
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_inbox = inbox.clone();
        let reader_writer_tx = writer_tx.clone();
        let reader_state = state.clone();
        let reader_handle = tokio::spawn(async move {
            let mut reader = FrameReader::new(reader);
            loop {
                match reader.read_frame().await {
                    Ok(Some(frame)) => {
                        Self::dispatch_frame(
                            &frame,
                            &reader_pending,
                            &reader_inbox,
                            &reader_writer_tx,
                        )
                        .await;
                    }
                    Ok(None) => {
                        tracing::info!("server closed its output stream");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("session read error: {e}");
                        break;
                    }
                }
            }
            // The transport is gone: fail every pending call and wake
            // inbox waiters so nothing blocks until its timeout.
            *reader_state.lock().expect("state lock poisoned") = SessionState::Closed;
            reader_pending.lock().expect("pending lock poisoned").clear();
            reader_inbox.changed.notify_waiters();
        });

        Self {
            state,
            next_id: AtomicU64::new(1),
            pending,
            inbox,
            writer_tx,
            reader_handle,
            writer_handle,
        }
    }

    /// Spawn the server described by `launch` and connect a session over
    /// its piped stdio. The returned [`ServerProcess`] owns the child;
    /// drop or [`ServerProcess::stop`] it after [`Self::shutdown`].
    pub fn spawn(launch: &ServerLaunch) -> anyhow::Result<(Self, ServerProcess)> {
        let (process, stdin, stdout) = launch.spawn()?;
        Ok((Self::connect(stdout, stdin), process))
    }

    async fn dispatch_frame(
        frame: &serde_json::Value,
        pending: &StdMutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>,
        inbox: &Inbox,
        writer_tx: &mpsc::Sender<WriterCommand>,
    ) {
        let Some(incoming) = parse_incoming(frame) else {
            tracing::trace!("ignoring malformed JSON-RPC frame");
            return;
        };

        match incoming {
            IncomingFrame::Response { id, body } => {
                let sender = pending.lock().expect("pending lock poisoned").remove(&id);
                if let Some(tx) = sender {
                    let _ = tx.send(body);
                } else {
                    tracing::debug!(id, "response for unknown or expired request");
                }
            }
            IncomingFrame::ServerRequest { id, method } => {
                // Servers send client/registerCapability, workspace/configuration,
                // etc. and may block until they get an answer.
                tracing::debug!("server request {method} — replying method not found");
                let response = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {
                        "code": -32601,
                        "message": format!("Method not found: {method}")
                    }
                });
                let _ = writer_tx.send(WriterCommand::Send(response)).await;
            }
            IncomingFrame::Notification { method, params } => {
                if method == "textDocument/publishDiagnostics" {
                    let Some(params) = params else { return };
                    match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                        Ok(publish) => {
                            tracing::trace!(uri = %publish.uri, count = publish.diagnostics.len(),
                                "diagnostics pushed");
                            inbox.push(canonical_uri(&publish.uri), publish.diagnostics);
                        }
                        Err(e) => {
                            tracing::debug!("failed to parse publishDiagnostics: {e}");
                        }
                    }
                } else {
                    tracing::trace!("ignoring notification: {method}");
                }
            }
        }
    }

    /// Current point in the session lifecycle.
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn set_state(&self, next: SessionState) {
        *self.state.lock().expect("state lock poisoned") = next;
    }

    fn require_ready(&self) -> Result<(), SessionError> {
        let state = self.current_state();
        if state == SessionState::Ready {
            Ok(())
        } else {
            Err(SessionError::NotReady(state.label()))
        }
    }

    /// Drive the handshake: `initialize` call, then the `initialized`
    /// notification. Failure leaves the session `Closed`.
    pub async fn initialize(&self, root_uri: &str) -> Result<(), SessionError> {
        let state = self.current_state();
        if state != SessionState::Uninitialized {
            return Err(SessionError::NotReady(state.label()));
        }
        self.set_state(SessionState::Initializing);

        let params = protocol::initialize_params(root_uri);
        let outcome = self
            .raw_call("initialize", Some(params), INIT_TIMEOUT)
            .await;
        match outcome {
            Ok(_) => {
                self.raw_notify("initialized", Some(serde_json::json!({})))
                    .await?;
                self.set_state(SessionState::Ready);
                tracing::info!("session ready");
                Ok(())
            }
            Err(e) => {
                self.set_state(SessionState::Closed);
                Err(e)
            }
        }
    }

    /// Issue a request and await its correlated response.
    ///
    /// Fails with [`SessionError::NotReady`] outside the Ready state.
    pub async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, SessionError> {
        self.require_ready()?;
        self.raw_call(method, params, timeout).await
    }

    /// Fire-and-forget notification.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), SessionError> {
        self.require_ready()?;
        self.raw_notify(method, params).await
    }

    async fn raw_call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, SessionError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id, tx);
        // Covers every exit: error return, timeout, and this future being
        // dropped when the other side of a select loses.
        let _slot = PendingGuard {
            pending: &self.pending,
            id,
        };

        let request = Request::new(id, method, params);
        let frame = serde_json::to_value(&request).expect("request serialization is infallible");
        if self
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .is_err()
        {
            return Err(SessionError::ChannelClosed);
        }

        let body = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(body)) => body,
            Ok(Err(_)) => {
                // Reader task dropped the sender; the session is dead.
                return Err(SessionError::ChannelClosed);
            }
            Err(_) => {
                return Err(SessionError::RequestTimeout {
                    method: method.to_string(),
                });
            }
        };

        if let Some(error) = body.get("error") {
            return Err(SessionError::Remote {
                code: error.get("code").and_then(serde_json::Value::as_i64).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }
        Ok(body.get("result").cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn raw_notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), SessionError> {
        let notification = Notification::new(method, params);
        let frame =
            serde_json::to_value(&notification).expect("notification serialization is infallible");
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| SessionError::ChannelClosed)
    }

    /// Fetch diagnostics for one file.
    ///
    /// `didOpen` with the full text, then race a `textDocument/diagnostic`
    /// pull against the publish inbox for that URI — first to arrive wins.
    /// Servers that don't implement the pull (method not found) fall back
    /// to the inbox for the remainder of the timeout. `didClose` releases
    /// server-side state either way.
    pub async fn collect_file_diagnostics(
        &self,
        uri: &str,
        language_id: &str,
        text: &str,
        timeout: Duration,
    ) -> Result<Vec<RawDiagnostic>, SessionError> {
        self.require_ready()?;

        let uri = canonical_uri(uri);
        let deadline = Instant::now() + timeout;

        // Drop any stale publish from a previous pass over this URI.
        let _ = self.inbox.take(&uri);

        self.raw_notify(
            "textDocument/didOpen",
            Some(protocol::did_open_params(&uri, language_id, 1, text)),
        )
        .await?;

        let result = self.race_for_diagnostics(&uri, deadline).await;

        // Best effort: the fetch result stands even if the close fails.
        let _ = self
            .raw_notify(
                "textDocument/didClose",
                Some(protocol::did_close_params(&uri)),
            )
            .await;

        result
    }

    async fn race_for_diagnostics(
        &self,
        uri: &str,
        deadline: Instant,
    ) -> Result<Vec<RawDiagnostic>, SessionError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let pull = self.raw_call(
            "textDocument/diagnostic",
            Some(protocol::document_diagnostic_params(uri)),
            remaining,
        );
        let push = self.inbox.wait_for(uri, deadline);

        tokio::select! {
            pulled = pull => match pulled {
                Ok(result) => {
                    let report: DocumentDiagnosticReport = serde_json::from_value(result)
                        .unwrap_or(DocumentDiagnosticReport { kind: None, items: Vec::new() });
                    Ok(report.into_items())
                }
                Err(SessionError::Remote { code: -32601, .. }) => {
                    // Pull model unsupported; the push path is all we have.
                    match self.inbox.wait_for(uri, deadline).await {
                        Some(diagnostics) => Ok(diagnostics),
                        None => Err(SessionError::RequestTimeout {
                            method: "textDocument/publishDiagnostics".to_string(),
                        }),
                    }
                }
                Err(SessionError::RequestTimeout { method }) => {
                    // A push may have raced in just as the pull expired.
                    match self.inbox.take(uri) {
                        Some(diagnostics) => Ok(diagnostics),
                        None => Err(SessionError::RequestTimeout { method }),
                    }
                }
                Err(e) => Err(e),
            },
            pushed = push => match pushed {
                Some(diagnostics) => Ok(diagnostics),
                None => Err(SessionError::RequestTimeout {
                    method: "textDocument/publishDiagnostics".to_string(),
                }),
            },
        }
    }

    /// Graceful teardown: `shutdown` call, `exit` notification, writer
    /// stopped. The session is `Closed` afterwards regardless of how much
    /// of that sequence the server honored.
    pub async fn shutdown(&self) {
        self.set_state(SessionState::ShuttingDown);

        if self
            .raw_call("shutdown", None, SHUTDOWN_CALL_TIMEOUT)
            .await
            .is_ok()
        {
            let _ = self.raw_notify("exit", None).await;
        }

        let _ = self.writer_tx.send(WriterCommand::Shutdown).await;
        self.set_state(SessionState::Closed);
    }
}
