/// Tool-call payload parser.
///
/// Turns JSON text emitted by the model into [`ParsedToolCall`]s. Two entry
/// points exist:
/// - [`parse_standalone_tool_calls`] accepts only text that *is* a payload
///   (optionally surrounded by whitespace). Used by the sieve on a captured
///   object and by the end-of-stream fallback.
/// - [`parse_tool_calls`] digs payloads out of mixed prose through a list of
///   candidate slices. Fenced code blocks are removed first.
///
/// Field resolution is an ordered rule list evaluated against
/// `serde_json::Value`; the order is load-bearing for vendor compatibility.
use std::sync::LazyLock;

use memchr::{memchr, memmem, memrchr};
use regex_lite::Regex;
use rustc_hash::FxHashSet;
use serde_json::{Map, Value};

use crate::json_scan::{find_object_end, find_tool_calls_key, TOOL_CALLS_KEY};

const FENCE: &[u8] = b"```";

/// Keys that may carry a call's arguments, after `input` and
/// `function.arguments`.
const ARGUMENT_FALLBACK_KEYS: [&str; 4] = ["arguments", "args", "parameters", "params"];

static FENCED_BLOCK: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)```.*?```").ok());
static FENCED_JSON: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").ok());
static LEGACY_TOOL_CALLS: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"\{\s*["']tool_calls["']\s*:\s*\[(.*?)\]\s*\}"#).ok());

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A tool call recovered from model output.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub name: String,
    /// Always a JSON object; non-object inputs are normalised.
    pub input: Map<String, Value>,
}

impl ParsedToolCall {
    /// Compact JSON text of the input, as sent in `function.arguments`.
    #[must_use]
    pub fn arguments_json(&self) -> String {
        serde_json::to_string(&self.input).unwrap_or_else(|_| "{}".to_owned())
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Parse `text` only if the whole (trimmed) text is a tool-call payload.
///
/// Text containing a code fence is treated as an example and rejected.
#[must_use]
pub fn parse_standalone_tool_calls(text: &str, tool_names: &[String]) -> Vec<ParsedToolCall> {
    let parsed = parse_standalone_unfiltered(text);
    if parsed.is_empty() {
        return parsed;
    }
    filter_tool_calls(parsed, tool_names)
}

/// [`parse_standalone_tool_calls`] without the allow-list, in payload order.
pub(crate) fn parse_standalone_unfiltered(text: &str) -> Vec<ParsedToolCall> {
    let trimmed = text.trim();
    if trimmed.is_empty() || memmem::find(trimmed.as_bytes(), FENCE).is_some() {
        return Vec::new();
    }
    if !trimmed.starts_with('{') && !trimmed.starts_with('[') {
        return Vec::new();
    }
    parse_payload(trimmed)
}

/// Best-effort extraction of a tool-call payload embedded in prose.
#[must_use]
pub fn parse_tool_calls(text: &str, tool_names: &[String]) -> Vec<ParsedToolCall> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let stripped = strip_fenced_blocks(text);
    if stripped.trim().is_empty() {
        return Vec::new();
    }

    for candidate in build_candidates(&stripped) {
        let parsed = parse_payload(&candidate);
        if !parsed.is_empty() {
            return filter_tool_calls(parsed, tool_names);
        }
    }
    Vec::new()
}

/// Keep calls whose name is declared. When that would drop every call, the
/// unfiltered named calls are kept so the payload is still intercepted.
#[must_use]
pub fn filter_tool_calls(parsed: Vec<ParsedToolCall>, tool_names: &[String]) -> Vec<ParsedToolCall> {
    if tool_names.is_empty() || parsed.is_empty() {
        return parsed;
    }
    let allowed: FxHashSet<&str> = tool_names.iter().map(String::as_str).collect();
    if parsed.iter().any(|call| allowed.contains(call.name.as_str())) {
        return parsed
            .into_iter()
            .filter(|call| allowed.contains(call.name.as_str()))
            .collect();
    }
    tracing::debug!(
        calls = parsed.len(),
        "tool call names outside declared tools; keeping them to avoid leaking raw payload"
    );
    parsed
}

// ---------------------------------------------------------------------------
// Payload decoding
// ---------------------------------------------------------------------------

fn parse_payload(payload: &str) -> Vec<ParsedToolCall> {
    let Ok(decoded) = serde_json::from_str::<Value>(payload) else {
        return Vec::new();
    };
    match decoded {
        Value::Object(mut object) => {
            if let Some(list) = object.remove("tool_calls") {
                return parse_call_list(&list);
            }
            parse_call_item(&object).into_iter().collect()
        }
        Value::Array(_) => parse_call_list(&decoded),
        _ => Vec::new(),
    }
}

fn parse_call_list(value: &Value) -> Vec<ParsedToolCall> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(Value::as_object)
        .filter_map(parse_call_item)
        .collect()
}

fn parse_call_item(item: &Map<String, Value>) -> Option<ParsedToolCall> {
    let function = item.get("function").and_then(Value::as_object);

    let mut name = item.get("name").and_then(Value::as_str).unwrap_or_default();
    if name.is_empty() {
        name = function
            .and_then(|f| f.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default();
    }
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let input = item
        .get("input")
        .or_else(|| function.and_then(|f| f.get("arguments")))
        .or_else(|| ARGUMENT_FALLBACK_KEYS.iter().find_map(|key| item.get(*key)));

    Some(ParsedToolCall {
        name: name.to_owned(),
        input: normalize_input(input),
    })
}

fn normalize_input(value: Option<&Value>) -> Map<String, Value> {
    match value {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(object)) => object.clone(),
        Some(Value::String(raw)) => {
            let raw = raw.trim();
            if raw.is_empty() {
                return Map::new();
            }
            match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(object)) => object,
                _ => {
                    let mut wrapped = Map::new();
                    wrapped.insert("_raw".to_owned(), Value::String(raw.to_owned()));
                    wrapped
                }
            }
        }
        Some(_) => Map::new(),
    }
}

// ---------------------------------------------------------------------------
// Candidate extraction for mixed text
// ---------------------------------------------------------------------------

fn strip_fenced_blocks(text: &str) -> String {
    match FENCED_BLOCK.as_ref() {
        Some(re) => re.replace_all(text, " ").into_owned(),
        None => text.to_owned(),
    }
}

fn build_candidates(text: &str) -> Vec<String> {
    let trimmed = text.trim();
    let mut candidates = vec![trimmed.to_owned()];

    if let Some(re) = FENCED_JSON.as_ref() {
        for caps in re.captures_iter(trimmed) {
            if let Some(body) = caps.get(1) {
                candidates.push(body.as_str().trim().to_owned());
            }
        }
    }

    candidates.extend(objects_around_key(trimmed));

    let bytes = trimmed.as_bytes();
    if let (Some(first), Some(last)) = (memchr(b'{', bytes), memrchr(b'}', bytes)) {
        if last > first {
            candidates.push(trimmed[first..=last].trim().to_owned());
        }
    }

    if let Some(caps) = LEGACY_TOOL_CALLS.as_ref().and_then(|re| re.captures(trimmed)) {
        if let Some(inner) = caps.get(1) {
            candidates.push(format!("{{\"tool_calls\":[{}]}}", inner.as_str()));
        }
    }

    let mut seen = FxHashSet::default();
    candidates.retain(|candidate| !candidate.is_empty() && seen.insert(candidate.clone()));
    candidates
}

/// Balanced objects enclosing each `tool_calls` occurrence. For every key,
/// successively earlier `{` are tried until one closes.
fn objects_around_key(text: &str) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut offset = 0;
    while let Some(key) = find_tool_calls_key(bytes, offset) {
        let mut search_end = key;
        let mut advanced = false;
        while let Some(start) = memrchr(b'{', &bytes[..search_end]) {
            if let Some(end) = find_object_end(bytes, start) {
                out.push(text[start..end].trim().to_owned());
                offset = end.max(key + TOOL_CALLS_KEY.len());
                advanced = true;
                break;
            }
            search_end = start;
        }
        if !advanced {
            offset = key + TOOL_CALLS_KEY.len();
        }
    }
    out
}

/// Tool names declared by a client request's `tools` array.
///
/// Unnamed tools count as `"unknown"` so that declaring any tool still
/// enables interception.
#[must_use]
pub fn tool_names_from_request(tools: Option<&Value>) -> Vec<String> {
    let Some(tools) = tools.and_then(Value::as_array) else {
        return Vec::new();
    };
    tools
        .iter()
        .map(|tool| {
            let name = tool
                .get("function")
                .and_then(|f| f.get("name"))
                .or_else(|| tool.get("name"))
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or_default();
            if name.is_empty() {
                "unknown".to_owned()
            } else {
                name.to_owned()
            }
        })
        .collect()
}

#[cfg(test)]
#[path = "parser_tests.rs"]
mod tests;
