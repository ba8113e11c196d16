//! Syntax context index — maps diagnostic lines to their enclosing symbol.
//!
//! Files are parsed with tree-sitter and walked into a flat list of
//! [`SymbolContext`] spans, cached by modification time. Overlapping spans
//! are expected; the innermost one wins at lookup time. Parse failures
//! degrade to "no context" — diagnostics are still reported, just without
//! a function label.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::SystemTime;

use tree_sitter::{Node, Parser};

use crate::types::{SymbolContext, SymbolKind};

/// Per-language parsing capability: a grammar plus the node kinds that
/// produce symbols. Unsupported languages simply yield no context data.
#[derive(Clone)]
pub struct ContextLanguage {
    language: tree_sitter::Language,
    function_kinds: &'static [&'static str],
    class_kinds: &'static [&'static str],
    module_kinds: &'static [&'static str],
    name_field: &'static str,
}

impl ContextLanguage {
    #[must_use]
    pub fn new(
        language: tree_sitter::Language,
        function_kinds: &'static [&'static str],
        class_kinds: &'static [&'static str],
        module_kinds: &'static [&'static str],
        name_field: &'static str,
    ) -> Self {
        Self {
            language,
            function_kinds,
            class_kinds,
            module_kinds,
            name_field,
        }
    }

    #[must_use]
    pub fn rust() -> Self {
        Self::new(
            tree_sitter_rust::LANGUAGE.into(),
            &["function_item"],
            &["struct_item", "enum_item", "trait_item", "impl_item"],
            &["mod_item"],
            "name",
        )
    }

    #[must_use]
    pub fn python() -> Self {
        Self::new(
            tree_sitter_python::LANGUAGE.into(),
            &["function_definition"],
            &["class_definition"],
            &[],
            "name",
        )
    }
}

struct CacheEntry {
    mtime: SystemTime,
    symbols: Arc<Vec<SymbolContext>>,
}

/// Line → enclosing-symbol lookup over a set of source files.
pub struct SyntaxContextIndex {
    /// Extension (without dot) → language capability.
    languages: HashMap<String, ContextLanguage>,
    cache: StdMutex<HashMap<PathBuf, CacheEntry>>,
}

impl Default for SyntaxContextIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntaxContextIndex {
    /// An index with the built-in Rust and Python grammars registered.
    #[must_use]
    pub fn new() -> Self {
        let mut languages = HashMap::new();
        languages.insert("rs".to_string(), ContextLanguage::rust());
        languages.insert("py".to_string(), ContextLanguage::python());
        languages.insert("pyi".to_string(), ContextLanguage::python());
        Self {
            languages,
            cache: StdMutex::new(HashMap::new()),
        }
    }

    /// Register (or replace) the language used for an extension.
    #[must_use]
    pub fn with_language(mut self, extension: impl Into<String>, language: ContextLanguage) -> Self {
        self.languages.insert(extension.into(), language);
        self
    }

    /// Parse `path` (or reuse the cached result when the modification time
    /// is unchanged) and return its symbol spans.
    pub fn build_for_file(&self, path: &Path) -> Arc<Vec<SymbolContext>> {
        let Some(language) = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(|ext| self.languages.get(ext))
        else {
            return Arc::new(Vec::new());
        };

        let mtime = match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) => {
                tracing::debug!(path = %path.display(), "cannot stat file: {e}");
                return Arc::new(Vec::new());
            }
        };

        {
            let cache = self.cache.lock().expect("context cache lock poisoned");
            if let Some(entry) = cache.get(path) {
                if entry.mtime == mtime {
                    return entry.symbols.clone();
                }
            }
        }

        let symbols = Arc::new(parse_symbols(path, language));
        self.cache
            .lock()
            .expect("context cache lock poisoned")
            .insert(
                path.to_path_buf(),
                CacheEntry {
                    mtime,
                    symbols: symbols.clone(),
                },
            );
        symbols
    }

    /// The smallest-span symbol containing a 1-based line, or `None` at
    /// module scope.
    pub fn lookup_line(&self, path: &Path, line: u32) -> Option<SymbolContext> {
        let symbols = self.build_for_file(path);
        innermost(&symbols, line).cloned()
    }
}

/// Smallest containing span wins; ties go to the most recently added
/// entry (traversal pushes parents before children, so that is the
/// innermost).
pub(crate) fn innermost(symbols: &[SymbolContext], line: u32) -> Option<&SymbolContext> {
    let mut best: Option<&SymbolContext> = None;
    for symbol in symbols {
        if !symbol.contains(line) {
            continue;
        }
        match best {
            Some(current) if symbol.span_len() > current.span_len() => {}
            _ => best = Some(symbol),
        }
    }
    best
}

fn parse_symbols(path: &Path, language: &ContextLanguage) -> Vec<SymbolContext> {
    let source = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!(path = %path.display(), "cannot read file: {e}");
            return Vec::new();
        }
    };

    let mut parser = Parser::new();
    if let Err(e) = parser.set_language(&language.language) {
        tracing::debug!(path = %path.display(), "grammar rejected: {e}");
        return Vec::new();
    }

    let Some(tree) = parser.parse(&source, None) else {
        tracing::debug!(path = %path.display(), "parse produced no tree");
        return Vec::new();
    };

    collect_symbols(tree.root_node(), &source, language, None)
}

fn node_name(node: Node<'_>, source: &[u8], name_field: &str) -> Option<String> {
    node.child_by_field_name(name_field)
        .or_else(|| node.child_by_field_name("type"))
        .and_then(|n| n.utf8_text(source).ok())
        .map(String::from)
}

/// Pure recursive traversal: every function/method/class node contributes
/// an entry; parents are emitted before their children.
fn collect_symbols(
    node: Node<'_>,
    source: &[u8],
    language: &ContextLanguage,
    enclosing_class: Option<&str>,
) -> Vec<SymbolContext> {
    let mut symbols = Vec::new();
    let kind = node.kind();
    let line_start = node.start_position().row as u32 + 1;
    let line_end = node.end_position().row as u32 + 1;

    let mut class_for_children: Option<String> = enclosing_class.map(String::from);

    if language.class_kinds.contains(&kind) {
        if let Some(name) = node_name(node, source, language.name_field) {
            symbols.push(SymbolContext::new(
                &name,
                SymbolKind::Class,
                enclosing_class.map(String::from),
                line_start,
                line_end,
            ));
            class_for_children = Some(name);
        }
    } else if language.function_kinds.contains(&kind) {
        if let Some(name) = node_name(node, source, language.name_field) {
            let symbol_kind = if enclosing_class.is_some() {
                SymbolKind::Method
            } else {
                SymbolKind::Function
            };
            symbols.push(SymbolContext::new(
                name,
                symbol_kind,
                enclosing_class.map(String::from),
                line_start,
                line_end,
            ));
        }
    } else if language.module_kinds.contains(&kind) {
        if let Some(name) = node_name(node, source, language.name_field) {
            symbols.push(SymbolContext::new(
                name,
                SymbolKind::Module,
                None,
                line_start,
                line_end,
            ));
        }
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        symbols.extend(collect_symbols(
            child,
            source,
            language,
            class_for_children.as_deref(),
        ));
    }
    symbols
}
