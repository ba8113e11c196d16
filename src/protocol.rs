//! JSON-RPC message serde types and LSP parameter builders.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::RawDiagnostic;

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

#[derive(Debug, Serialize)]
pub(crate) struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }
}

pub(crate) fn initialize_params(root_uri: &str) -> serde_json::Value {
    serde_json::json!({
        "processId": std::process::id(),
        "rootUri": root_uri,
        "capabilities": {
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": false
                },
                "publishDiagnostics": {
                    "relatedInformation": true
                },
                "diagnostic": {
                    "dynamicRegistration": false
                }
            }
        },
        "workspaceFolders": [{
            "uri": root_uri,
            "name": "workspace"
        }]
    })
}

pub(crate) fn did_open_params(
    uri: &str,
    language_id: &str,
    version: i32,
    text: &str,
) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_close_params(uri: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri }
    })
}

/// Params for the pull-model `textDocument/diagnostic` request.
pub(crate) fn document_diagnostic_params(uri: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri }
    })
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    pub diagnostics: Vec<RawDiagnostic>,
}

/// Result of a `textDocument/diagnostic` request.
///
/// A full report carries items; an "unchanged" report carries none (the
/// server is telling us nothing moved since `resultId`, which we never
/// send, so in practice it means empty).
#[derive(Debug, Deserialize)]
pub(crate) struct DocumentDiagnosticReport {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub items: Vec<RawDiagnostic>,
}

impl DocumentDiagnosticReport {
    pub fn into_items(self) -> Vec<RawDiagnostic> {
        match self.kind.as_deref() {
            None | Some("full") => self.items,
            _ => Vec::new(),
        }
    }
}

pub(crate) fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}
