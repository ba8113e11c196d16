//! Diagnostic collector — turns a file list into a [`CollectionRun`].
//!
//! Files are processed in adaptive batches with a bounded worker pool;
//! workers share one [`ProtocolSession`] to overlap round-trip waiting.
//! Transient failures are retried with exponential backoff; all run
//! bookkeeping (dedup set included) lives in the single aggregation loop,
//! so workers never touch shared mutable state.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::classify;
use crate::context::SyntaxContextIndex;
use crate::error::SessionError;
use crate::protocol;
use crate::session::ProtocolSession;
use crate::types::{CollectionRun, DedupKey, EnrichedDiagnostic, Progress, ProtocolSeverity};

/// Emit progress roughly every 2% of files.
const PROGRESS_STEPS: usize = 50;

fn default_concurrency() -> usize {
    4
}

fn default_file_timeout_secs() -> u64 {
    30
}

fn default_retry_budget() -> u32 {
    2
}

fn default_batch_pause_ms() -> u64 {
    500
}

fn default_retry_base_delay_ms() -> u64 {
    250
}

/// Collector tuning knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    /// Root the file list is relative to; also the workspace sent to the
    /// server at initialize time.
    pub workspace_root: PathBuf,
    /// Language identifier sent with `didOpen` (e.g. "rust", "python").
    pub language_id: String,
    /// Worker-pool width within a batch.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_file_timeout_secs")]
    pub file_timeout_secs: u64,
    /// Extra attempts granted to a file after a transient failure.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    /// Breather between batches so a slow server isn't swamped.
    #[serde(default = "default_batch_pause_ms")]
    pub batch_pause_ms: u64,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl CollectorConfig {
    #[must_use]
    pub fn new(workspace_root: impl Into<PathBuf>, language_id: impl Into<String>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            language_id: language_id.into(),
            concurrency: default_concurrency(),
            file_timeout_secs: default_file_timeout_secs(),
            retry_budget: default_retry_budget(),
            batch_pause_ms: default_batch_pause_ms(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }

    #[must_use]
    pub fn file_timeout(&self) -> Duration {
        Duration::from_secs(self.file_timeout_secs)
    }

    #[must_use]
    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        // base * 2^(attempt-1)
        Duration::from_millis(self.retry_base_delay_ms << attempt.saturating_sub(1).min(8))
    }
}

/// Cooperative cancellation flag.
///
/// Checked before each batch and before each file; in-flight calls finish
/// or hit their timeout, so cancellation latency is bounded by one
/// timeout interval.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Adaptive batch size: keep at most 50 files in flight against one
/// server, but never fewer than one per batch.
pub(crate) fn batch_size(total: usize) -> usize {
    (total / 10).clamp(1, 50)
}

enum FileOutcome {
    Processed(Vec<EnrichedDiagnostic>),
    Transient(String),
    Fatal(String),
}

/// Orchestrates one harvesting pass over a file set.
pub struct DiagnosticCollector {
    config: CollectorConfig,
    context: Arc<SyntaxContextIndex>,
    progress_tx: Option<mpsc::Sender<Progress>>,
    cancel: CancelFlag,
}

impl DiagnosticCollector {
    #[must_use]
    pub fn new(config: CollectorConfig) -> Self {
        Self {
            config,
            context: Arc::new(SyntaxContextIndex::new()),
            progress_tx: None,
            cancel: CancelFlag::new(),
        }
    }

    /// Use a custom context index (e.g. with extra languages registered).
    #[must_use]
    pub fn with_context_index(mut self, context: SyntaxContextIndex) -> Self {
        self.context = Arc::new(context);
        self
    }

    /// Receive progress snapshots while the run is in flight.
    #[must_use]
    pub fn with_progress(mut self, tx: mpsc::Sender<Progress>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    /// Share a cancellation flag with the caller.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Harvest diagnostics for every file in `files` (repository-relative
    /// paths). Returns when each file is either processed or has
    /// exhausted its retry budget — one bad file never aborts the run.
    pub async fn run(&self, session: Arc<ProtocolSession>, files: Vec<PathBuf>) -> CollectionRun {
        let started = Instant::now();
        let total = files.len();
        let mut run = CollectionRun::new(total);
        let mut seen: HashSet<DedupKey> = HashSet::new();
        let mut retried: HashSet<PathBuf> = HashSet::new();
        let mut done = 0usize;
        let progress_step = (total / PROGRESS_STEPS).max(1);

        // Round 0 is the full file list; later rounds hold retries.
        let mut round: Vec<(PathBuf, u32)> = files.into_iter().map(|f| (f, 0)).collect();
        let mut round_index = 0u32;

        while !round.is_empty() {
            if round_index > 0 {
                let delay = self.config.retry_delay(round_index);
                tracing::debug!(
                    round = round_index,
                    files = round.len(),
                    ?delay,
                    "retrying transient failures"
                );
                tokio::time::sleep(delay).await;
            }

            let mut next_round = Vec::new();
            let batch_len = batch_size(round.len());
            let batches: Vec<Vec<(PathBuf, u32)>> = round
                .drain(..)
                .collect::<Vec<_>>()
                .chunks(batch_len)
                .map(<[(PathBuf, u32)]>::to_vec)
                .collect();

            for (batch_index, batch) in batches.into_iter().enumerate() {
                if self.cancel.is_cancelled() {
                    for (file, _) in batch {
                        run.record_failed(file, "cancelled before analysis".to_string());
                        done += 1;
                    }
                    continue;
                }
                if batch_index > 0 {
                    tokio::time::sleep(self.config.batch_pause()).await;
                }

                let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
                let mut workers: JoinSet<(PathBuf, u32, FileOutcome)> = JoinSet::new();
                let mut in_flight: HashMap<tokio::task::Id, PathBuf> = HashMap::new();

                for (file, attempt) in batch {
                    if self.cancel.is_cancelled() {
                        run.record_failed(file, "cancelled before analysis".to_string());
                        done += 1;
                        continue;
                    }
                    let session = session.clone();
                    let context = self.context.clone();
                    let config = self.config.clone();
                    let semaphore = semaphore.clone();
                    let task_file = file.clone();
                    let handle = workers.spawn(async move {
                        let _permit = semaphore
                            .acquire_owned()
                            .await
                            .expect("semaphore never closed");
                        let outcome = analyze_file(&session, &context, &config, &file).await;
                        (file, attempt, outcome)
                    });
                    in_flight.insert(handle.id(), task_file);
                }

                // Single aggregating owner: dedup and run bookkeeping
                // happen only here.
                while let Some(joined) = workers.join_next_with_id().await {
                    let (file, attempt, outcome) = match joined {
                        Ok((task_id, result)) => {
                            in_flight.remove(&task_id);
                            result
                        }
                        Err(join_error) => {
                            // A panicking worker still counts against the
                            // run; otherwise the completion invariant breaks.
                            if let Some(file) = in_flight.remove(&join_error.id()) {
                                tracing::warn!(file = %file.display(), "analysis worker panicked");
                                run.record_failed(file, "analysis worker panicked".to_string());
                                done += 1;
                                if done % progress_step == 0 || done == total {
                                    self.emit_progress(done, total, started);
                                }
                            } else {
                                tracing::warn!("analysis worker panicked");
                            }
                            continue;
                        }
                    };
                    match outcome {
                        FileOutcome::Processed(diagnostics) => {
                            let unique: Vec<EnrichedDiagnostic> = diagnostics
                                .into_iter()
                                .filter(|d| seen.insert(d.dedup_key()))
                                .collect();
                            run.record_processed(unique);
                            done += 1;
                        }
                        FileOutcome::Transient(reason) => {
                            if attempt < self.config.retry_budget {
                                if retried.insert(file.clone()) {
                                    run.record_retry();
                                }
                                tracing::debug!(file = %file.display(), attempt, %reason,
                                    "queued for retry");
                                next_round.push((file, attempt + 1));
                            } else {
                                tracing::warn!(file = %file.display(), %reason,
                                    "retry budget exhausted");
                                run.record_failed(file, reason);
                                done += 1;
                            }
                        }
                        FileOutcome::Fatal(reason) => {
                            tracing::warn!(file = %file.display(), %reason, "file failed");
                            run.record_failed(file, reason);
                            done += 1;
                        }
                    }

                    if done % progress_step == 0 || done == total {
                        self.emit_progress(done, total, started);
                    }
                }
            }

            round = next_round;
            round_index += 1;
        }

        // Final snapshot, covering files accounted outside the join loop.
        self.emit_progress(done, total, started);
        run.set_elapsed(started.elapsed());
        debug_assert!(run.is_complete());
        run
    }

    fn emit_progress(&self, done: usize, total: usize, started: Instant) {
        let Some(tx) = &self.progress_tx else { return };
        let elapsed = started.elapsed();
        let estimated_remaining = if done > 0 && done <= total {
            Some(elapsed.mul_f64((total - done) as f64 / done as f64))
        } else {
            None
        };
        let progress = Progress {
            processed: done,
            total,
            elapsed,
            estimated_remaining,
        };
        // Never stall the run on a slow consumer; a dropped snapshot is
        // superseded by the next one anyway.
        if tx.try_send(progress).is_err() {
            tracing::trace!("progress receiver lagging, snapshot dropped");
        }
    }
}

/// One attempt at one file: read, fetch raw diagnostics, enrich.
async fn analyze_file(
    session: &ProtocolSession,
    context: &SyntaxContextIndex,
    config: &CollectorConfig,
    file: &Path,
) -> FileOutcome {
    let absolute = config.workspace_root.join(file);

    let text = match tokio::fs::read_to_string(&absolute).await {
        Ok(text) => text,
        Err(e) => return FileOutcome::Fatal(format!("cannot read file: {e}")),
    };

    let uri = match protocol::path_to_file_uri(&absolute) {
        Ok(uri) => uri.to_string(),
        Err(e) => return FileOutcome::Fatal(e.to_string()),
    };

    let raw = match session
        .collect_file_diagnostics(&uri, &config.language_id, &text, config.file_timeout())
        .await
    {
        Ok(raw) => raw,
        Err(e) if e.is_transient() => return FileOutcome::Transient(e.to_string()),
        Err(e) => {
            if matches!(e, SessionError::NotReady(_)) {
                tracing::error!(file = %file.display(), "call issued outside Ready state: {e}");
            }
            return FileOutcome::Fatal(e.to_string());
        }
    };

    let enriched = raw
        .into_iter()
        .map(|diagnostic| {
            // Wire positions are 0-based; they never leave this boundary.
            let line = diagnostic.line() + 1;
            let column = diagnostic.character() + 1;
            let symbol = context.lookup_line(&absolute, line);
            let business = classify::classify(&diagnostic, symbol.as_ref());
            EnrichedDiagnostic::new(
                file.to_path_buf(),
                line,
                column,
                diagnostic.severity().unwrap_or(ProtocolSeverity::Warning),
                business,
                diagnostic.message().to_string(),
                diagnostic.code(),
                diagnostic.source().unwrap_or("unknown").to_string(),
                symbol,
            )
        })
        .collect();

    FileOutcome::Processed(enriched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FrameReader, FrameWriter};
    use std::collections::HashMap;
    use std::io::Write as _;

    #[test]
    fn test_batch_size_formula() {
        assert_eq!(batch_size(1), 1);
        assert_eq!(batch_size(5), 1);
        assert_eq!(batch_size(10), 1);
        assert_eq!(batch_size(100), 10);
        assert_eq!(batch_size(500), 50);
        assert_eq!(batch_size(10_000), 50);
    }

    #[test]
    fn test_config_defaults() {
        let config: CollectorConfig = serde_json::from_value(serde_json::json!({
            "workspace_root": "/repo",
            "language_id": "python"
        }))
        .unwrap();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.retry_budget, 2);
        assert_eq!(config.file_timeout(), Duration::from_secs(30));
        assert_eq!(config.batch_pause(), Duration::from_millis(500));
    }

    #[test]
    fn test_retry_delay_doubles() {
        let config = CollectorConfig::new("/repo", "python");
        assert_eq!(config.retry_delay(1), Duration::from_millis(250));
        assert_eq!(config.retry_delay(2), Duration::from_millis(500));
        assert_eq!(config.retry_delay(3), Duration::from_millis(1000));
    }

    /// Scripted far end: handles the handshake and answers every pull
    /// request via `on_pull(uri, nth_request_for_uri)`.
    fn spawn_scripted_server<F>(
        reader: tokio::io::DuplexStream,
        writer: tokio::io::DuplexStream,
        mut on_pull: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: FnMut(&str, u32) -> serde_json::Value + Send + 'static,
    {
        tokio::spawn(async move {
            let mut reader = FrameReader::new(reader);
            let mut writer = FrameWriter::new(writer);
            let mut pull_counts: HashMap<String, u32> = HashMap::new();
            while let Ok(Some(frame)) = reader.read_frame().await {
                let method = frame["method"].as_str().unwrap_or_default().to_string();
                match method.as_str() {
                    "initialize" => {
                        let response = serde_json::json!({
                            "jsonrpc": "2.0",
                            "id": frame["id"],
                            "result": { "capabilities": {} }
                        });
                        writer.write_frame(&response).await.unwrap();
                    }
                    "shutdown" => {
                        let response = serde_json::json!({
                            "jsonrpc": "2.0",
                            "id": frame["id"],
                            "result": null
                        });
                        writer.write_frame(&response).await.unwrap();
                    }
                    "textDocument/diagnostic" => {
                        let uri = frame["params"]["textDocument"]["uri"]
                            .as_str()
                            .unwrap()
                            .to_string();
                        let count = pull_counts.entry(uri.clone()).or_insert(0);
                        *count += 1;
                        let mut response = on_pull(&uri, *count);
                        response["jsonrpc"] = "2.0".into();
                        response["id"] = frame["id"].clone();
                        writer.write_frame(&response).await.unwrap();
                    }
                    _ => {}
                }
            }
        })
    }

    async fn ready_session(
        on_pull: impl FnMut(&str, u32) -> serde_json::Value + Send + 'static,
    ) -> Arc<ProtocolSession> {
        let (client_in, server_out) = tokio::io::duplex(64 * 1024);
        let (server_in, client_out) = tokio::io::duplex(64 * 1024);
        spawn_scripted_server(server_in, server_out, on_pull);
        let session = ProtocolSession::connect(client_in, client_out);
        session.initialize("file:///repo").await.unwrap();
        Arc::new(session)
    }

    fn full_report(items: serde_json::Value) -> serde_json::Value {
        serde_json::json!({ "result": { "kind": "full", "items": items } })
    }

    fn fast_config(root: &Path) -> CollectorConfig {
        let mut config = CollectorConfig::new(root, "python");
        config.file_timeout_secs = 5;
        config.batch_pause_ms = 1;
        config.retry_base_delay_ms = 5;
        config
    }

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        PathBuf::from(name)
    }

    #[tokio::test]
    async fn test_duplicate_diagnostics_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let rel = write_file(dir.path(), "a.py", "x = undefined_name\n");

        let dup = serde_json::json!([
            {
                "range": { "start": { "line": 0, "character": 4 },
                           "end": { "line": 0, "character": 18 } },
                "severity": 1,
                "message": "name 'undefined_name' is not defined"
            },
            {
                "range": { "start": { "line": 0, "character": 4 },
                           "end": { "line": 0, "character": 18 } },
                "severity": 1,
                "message": "name 'undefined_name' is not defined"
            }
        ]);
        let session = ready_session(move |_, _| full_report(dup.clone())).await;

        let collector = DiagnosticCollector::new(fast_config(dir.path()));
        let run = collector.run(session, vec![rel]).await;

        assert_eq!(run.processed_files(), 1);
        assert_eq!(run.diagnostics().len(), 1, "dedup key must collapse the pair");
        // 0-based wire position became 1-based.
        assert_eq!(run.diagnostics()[0].line(), 1);
        assert_eq!(run.diagnostics()[0].column(), 5);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let rel = write_file(dir.path(), "flaky.py", "pass\n");

        // Server always answers "request cancelled" — transient every time.
        let session = ready_session(|_, _| {
            serde_json::json!({ "error": { "code": -32800, "message": "request cancelled" } })
        })
        .await;

        let collector = DiagnosticCollector::new(fast_config(dir.path()));
        let run = collector.run(session, vec![rel.clone()]).await;

        assert_eq!(run.total_files(), 1);
        assert_eq!(run.processed_files(), 0);
        assert_eq!(run.failed_files(), 1);
        assert_eq!(run.retried_files(), 1);
        assert!(run.diagnostics().is_empty());
        assert!(run.errors_by_file().contains_key(&rel));
        assert!(run.is_complete());
    }

    #[tokio::test]
    async fn test_terminal_remote_error_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let rel = write_file(dir.path(), "bad.py", "pass\n");

        let session = ready_session(|_, count| {
            assert_eq!(count, 1, "terminal failures must not be retried");
            serde_json::json!({ "error": { "code": -32602, "message": "invalid params" } })
        })
        .await;

        let collector = DiagnosticCollector::new(fast_config(dir.path()));
        let run = collector.run(session, vec![rel]).await;

        assert_eq!(run.failed_files(), 1);
        assert_eq!(run.retried_files(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_file_recorded_as_failed() {
        let dir = tempfile::tempdir().unwrap();
        let session = ready_session(|_, _| full_report(serde_json::json!([]))).await;

        let collector = DiagnosticCollector::new(fast_config(dir.path()));
        let run = collector
            .run(session, vec![PathBuf::from("missing.py")])
            .await;

        assert_eq!(run.failed_files(), 1);
        assert_eq!(run.retried_files(), 0);
        let reason = run
            .errors_by_file()
            .get(Path::new("missing.py"))
            .unwrap();
        assert!(reason.contains("cannot read file"));
    }

    #[tokio::test]
    async fn test_worker_panic_is_recorded_as_failed() {
        let dir = tempfile::tempdir().unwrap();
        let rel = write_file(dir.path(), "hostile.py", "pass\n");

        // A start line at u32::MAX overflows the 1-based conversion in
        // the worker under debug assertions. The file must still be
        // accounted for; the run must complete rather than lose it.
        let items = serde_json::json!([{
            "range": { "start": { "line": u32::MAX, "character": 0 },
                       "end": { "line": u32::MAX, "character": 1 } },
            "severity": 2,
            "message": "bad position"
        }]);
        let session = ready_session(move |_, _| full_report(items.clone())).await;

        let collector = DiagnosticCollector::new(fast_config(dir.path()));
        let run = collector.run(session, vec![rel.clone()]).await;

        assert_eq!(run.total_files(), 1);
        assert!(run.is_complete());
        if cfg!(debug_assertions) {
            assert_eq!(run.failed_files(), 1);
            let reason = run.errors_by_file().get(&rel).unwrap();
            assert!(reason.contains("panicked"));
        }
    }

    #[tokio::test]
    async fn test_cancellation_fails_remaining_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = Vec::new();
        for i in 0..4 {
            files.push(write_file(dir.path(), &format!("f{i}.py"), "pass\n"));
        }

        let session = ready_session(|_, _| full_report(serde_json::json!([]))).await;

        let cancel = CancelFlag::new();
        cancel.cancel(); // cancelled before the run even starts
        let collector =
            DiagnosticCollector::new(fast_config(dir.path())).with_cancel(cancel);
        let run = collector.run(session, files).await;

        assert_eq!(run.processed_files(), 0);
        assert_eq!(run.failed_files(), 4);
        assert!(run.is_complete());
        for reason in run.errors_by_file().values() {
            assert!(reason.contains("cancelled"));
        }
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_reaches_total() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = Vec::new();
        for i in 0..6 {
            files.push(write_file(dir.path(), &format!("p{i}.py"), "pass\n"));
        }

        let session = ready_session(|_, _| full_report(serde_json::json!([]))).await;

        let (tx, mut rx) = mpsc::channel(64);
        let collector = DiagnosticCollector::new(fast_config(dir.path())).with_progress(tx);
        let run = collector.run(session, files).await;
        assert_eq!(run.processed_files(), 6);

        let mut last = 0;
        let mut final_seen = false;
        while let Ok(progress) = rx.try_recv() {
            assert!(progress.processed >= last, "progress must be monotonic");
            assert_eq!(progress.total, 6);
            last = progress.processed;
            final_seen = progress.processed == 6;
        }
        assert!(final_seen, "a final snapshot at processed == total is required");
    }

    #[tokio::test]
    async fn test_symbol_attribution_flows_into_results() {
        let dir = tempfile::tempdir().unwrap();
        let rel = write_file(
            dir.path(),
            "svc.py",
            "class Service:\n    def handle(self):\n        return broken\n",
        );

        let items = serde_json::json!([{
            "range": { "start": { "line": 2, "character": 15 },
                       "end": { "line": 2, "character": 21 } },
            "severity": 1,
            "message": "name 'broken' is not defined",
            "source": "pyright"
        }]);
        let session = ready_session(move |_, _| full_report(items.clone())).await;

        let collector = DiagnosticCollector::new(fast_config(dir.path()));
        let run = collector.run(session, vec![rel]).await;

        let diagnostic = &run.diagnostics()[0];
        assert_eq!(diagnostic.line(), 3);
        assert_eq!(diagnostic.source(), "pyright");
        let symbol = diagnostic.symbol().expect("should attribute to handle()");
        assert_eq!(symbol.name(), "handle");
        assert_eq!(symbol.enclosing_class(), Some("Service"));
    }
}
