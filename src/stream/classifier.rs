//! Vendor path/value chunk classification.
//!
//! Each upstream chunk is a `{p?, o?, v}` diff against the vendor's response
//! document. [`PathClassifier`] turns it into zero or more [`ContentPart`]s
//! tagged as reasoning or answer text, or into a terminal signal. The
//! fragment type (`THINK` / `RESPONSE`) is sticky across chunks: untyped
//! content inherits the last type seen.

use std::sync::Arc;

use serde_json::Value;

use crate::config::ClassifierConfig;

const FINISHED: &str = "FINISHED";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    Thinking,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentPart {
    pub text: String,
    pub kind: PartKind,
}

impl ContentPart {
    fn new(text: &str, kind: PartKind) -> Self {
        Self {
            text: text.to_owned(),
            kind,
        }
    }
}

/// Terminal signals carried by a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Finished,
    ContentFilter,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub parts: Vec<ContentPart>,
    pub terminal: Option<Terminal>,
}

impl ChunkOutcome {
    fn terminal(terminal: Terminal) -> Self {
        Self {
            parts: Vec::new(),
            terminal: Some(terminal),
        }
    }
}

/// Metadata paths whose chunks never carry content.
#[derive(Debug, Clone, Default)]
pub struct SkipPaths {
    patterns: Vec<String>,
    exact: Vec<String>,
}

impl SkipPaths {
    #[must_use]
    pub fn new(patterns: Vec<String>, exact: Vec<String>) -> Self {
        Self { patterns, exact }
    }

    #[must_use]
    pub fn from_config(config: &ClassifierConfig) -> Self {
        Self::new(config.skip_path_patterns.clone(), config.skip_exact_paths.clone())
    }

    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        self.exact.iter().any(|exact| exact == path)
            || self
                .patterns
                .iter()
                .any(|pattern| !pattern.is_empty() && path.contains(pattern.as_str()))
    }
}

/// Per-stream classifier holding the running fragment type.
#[derive(Debug)]
pub struct PathClassifier {
    skip: Arc<SkipPaths>,
    thinking_enabled: bool,
    current: PartKind,
}

impl PathClassifier {
    #[must_use]
    pub fn new(skip: Arc<SkipPaths>, thinking_enabled: bool) -> Self {
        let current = if thinking_enabled {
            PartKind::Thinking
        } else {
            PartKind::Text
        };
        Self {
            skip,
            thinking_enabled,
            current,
        }
    }

    #[must_use]
    pub fn current_kind(&self) -> PartKind {
        self.current
    }

    pub fn classify(&mut self, chunk: &Value) -> ChunkOutcome {
        let Some(object) = chunk.as_object() else {
            return ChunkOutcome::default();
        };
        if object.contains_key("error")
            || object.get("code").and_then(Value::as_str) == Some("content_filter")
        {
            return ChunkOutcome::terminal(Terminal::ContentFilter);
        }
        let Some(value) = object.get("v") else {
            return ChunkOutcome::default();
        };
        let path = field_str(chunk, "p");
        if self.skip.matches(path) {
            return ChunkOutcome::default();
        }
        if path == "response/status" && scalar_str(value) == FINISHED {
            return ChunkOutcome::terminal(Terminal::Finished);
        }

        let mut parts = Vec::new();
        let operator = field_str(chunk, "o");

        if path == "response/fragments" && operator.eq_ignore_ascii_case("APPEND") {
            if let Some(fragments) = value.as_array() {
                for fragment in fragments {
                    let content = field_content(fragment);
                    if content.is_empty() {
                        continue;
                    }
                    let kind = self.observe_fragment_type(fragment).unwrap_or(PartKind::Text);
                    parts.push(ContentPart::new(content, kind));
                }
            }
        }

        // Batched diffs under `response` announce type switches without
        // carrying content themselves.
        if path == "response" {
            if let Some(items) = value.as_array() {
                for item in items {
                    if field_str(item, "p") == "fragments" && field_str(item, "o") == "APPEND" {
                        for fragment in item.get("v").and_then(Value::as_array).into_iter().flatten() {
                            self.observe_fragment_type(fragment);
                        }
                    }
                }
            }
        }

        let default_kind = self.default_kind_for(path);

        match value {
            Value::String(text) => {
                if text == FINISHED && (path.is_empty() || path == "status") {
                    return ChunkOutcome::terminal(Terminal::Finished);
                }
                if !text.is_empty() {
                    parts.push(ContentPart::new(text, default_kind));
                }
            }
            Value::Array(items) => {
                if !self.extract_nested(items, default_kind, &mut parts) {
                    return ChunkOutcome::terminal(Terminal::Finished);
                }
            }
            Value::Object(object) => {
                let response = object
                    .get("response")
                    .filter(|inner| inner.is_object())
                    .unwrap_or(value);
                let fragments = response.get("fragments").and_then(Value::as_array);
                for fragment in fragments.into_iter().flatten() {
                    let content = field_content(fragment);
                    if content.is_empty() {
                        continue;
                    }
                    let kind = self.observe_fragment_type(fragment).unwrap_or(default_kind);
                    parts.push(ContentPart::new(content, kind));
                }
            }
            _ => {}
        }

        ChunkOutcome {
            parts,
            terminal: None,
        }
    }

    fn default_kind_for(&self, path: &str) -> PartKind {
        match path {
            "response/thinking_content" => PartKind::Thinking,
            "response/content" => PartKind::Text,
            _ if path.contains("response/fragments") && path.contains("/content") => self.current,
            "" if self.thinking_enabled => self.current,
            _ => PartKind::Text,
        }
    }

    /// Update the running type from a fragment's `type`, returning the kind
    /// it names, if any.
    fn observe_fragment_type(&mut self, fragment: &Value) -> Option<PartKind> {
        let kind = fragment_kind(fragment)?;
        self.current = kind;
        Some(kind)
    }

    /// Walk an array of nested diffs. Returns `false` when a nested
    /// `status: FINISHED` sentinel ends the stream.
    fn extract_nested(&self, items: &[Value], default_kind: PartKind, parts: &mut Vec<ContentPart>) -> bool {
        let mut found = Vec::new();
        for item in items {
            let Some(item_value) = item.as_object().and_then(|object| object.get("v")) else {
                continue;
            };
            let item_path = field_str(item, "p");
            if item_path == "status" && scalar_str(item_value) == FINISHED {
                return false;
            }
            if self.skip.matches(item_path) {
                continue;
            }

            let content = field_content(item);
            if !content.is_empty() {
                let kind = fragment_kind(item).unwrap_or(default_kind);
                found.push(ContentPart::new(content, kind));
                continue;
            }

            let kind = if item_path.contains("thinking") {
                PartKind::Thinking
            } else if item_path.contains("content") || item_path == "response" || item_path == "fragments" {
                PartKind::Text
            } else {
                default_kind
            };

            match item_value {
                Value::String(text) => {
                    if !text.is_empty() && text != FINISHED {
                        found.push(ContentPart::new(text, kind));
                    }
                }
                Value::Array(inner_items) => {
                    for inner in inner_items {
                        match inner {
                            Value::String(text) if !text.is_empty() => {
                                found.push(ContentPart::new(text, kind));
                            }
                            Value::Object(_) if !is_search_result(inner) => {
                                let content = field_content(inner);
                                if !content.is_empty() {
                                    let inner_kind = fragment_kind(inner).unwrap_or(kind);
                                    found.push(ContentPart::new(content, inner_kind));
                                }
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
        parts.extend(found);
        true
    }
}

/// Whether a text part is a search citation marker.
#[must_use]
pub fn is_citation(text: &str) -> bool {
    text.trim_start().starts_with("[citation:")
}

fn fragment_kind(fragment: &Value) -> Option<PartKind> {
    let kind = field_str(fragment, "type");
    if kind.eq_ignore_ascii_case("THINK") || kind.eq_ignore_ascii_case("THINKING") {
        Some(PartKind::Thinking)
    } else if kind.eq_ignore_ascii_case("RESPONSE") {
        Some(PartKind::Text)
    } else {
        None
    }
}

/// Search results arrive as `{url, title, ...}` entries next to content.
fn is_search_result(value: &Value) -> bool {
    value.get("url").is_some() && value.get("title").is_some()
}

fn field_str<'v>(value: &'v Value, key: &str) -> &'v str {
    value.get(key).and_then(Value::as_str).map_or("", str::trim)
}

/// Fragment content is kept verbatim; only its presence is checked.
fn field_content(value: &Value) -> &str {
    value.get("content").and_then(Value::as_str).unwrap_or_default()
}

fn scalar_str(value: &Value) -> &str {
    value.as_str().map_or("", str::trim)
}
