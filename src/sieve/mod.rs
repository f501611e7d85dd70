//! Incremental tool-call sieve.
//!
//! [`ToolSieve`] consumes the answer-text stream fragment by fragment and
//! splits it into visible text and tool calls. Ordinary prose passes through
//! with at most a short hold-back; a span that opens a `tool_calls` object is
//! withheld until it either parses as tool calls (absorbed) or proves not to
//! be one (released as text). Payloads shown inside fenced code blocks are
//! never intercepted.

mod incremental;
pub mod parser;
pub(crate) mod state;

use memchr::{memchr, memmem, memrchr};
use smallvec::SmallVec;

use crate::json_scan::{enclosing_object_start, find_object_end, find_tool_calls_key, skip_ws};

pub use parser::{
    filter_tool_calls, parse_standalone_tool_calls, parse_tool_calls, tool_names_from_request,
    ParsedToolCall,
};
pub use state::SieveLimits;

use state::{inside_code_fence, SieveState};

/// One partial update for a streamed tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallDelta {
    pub index: usize,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Output of the sieve, in discovery order.
#[derive(Debug, Clone, PartialEq)]
pub enum SieveEvent {
    Text(String),
    ToolCallDeltas(Vec<ToolCallDelta>),
    ToolCalls(Vec<ParsedToolCall>),
}

pub type SieveEvents = SmallVec<[SieveEvent; 4]>;

/// Result of trying to resolve the current capture.
struct Consumed {
    /// Capture text released before the resolved span.
    prefix: String,
    calls: Vec<ParsedToolCall>,
    /// Capture text after the resolved span, fed back as pending.
    suffix: String,
}

/// Per-stream sieve. Never shared between requests.
#[derive(Debug)]
pub struct ToolSieve {
    state: SieveState,
    tool_names: Vec<String>,
    limits: SieveLimits,
    incremental: bool,
}

impl ToolSieve {
    /// `incremental` enables early name/argument deltas for call #0.
    #[must_use]
    pub fn new(tool_names: Vec<String>, limits: SieveLimits, incremental: bool) -> Self {
        Self {
            state: SieveState::default(),
            tool_names,
            limits,
            incremental,
        }
    }

    #[must_use]
    pub fn tool_names(&self) -> &[String] {
        &self.tool_names
    }

    /// Whether a candidate span is currently withheld.
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.state.capturing
    }

    #[must_use]
    pub fn process(&mut self, chunk: &str) -> SieveEvents {
        let mut events = SieveEvents::new();
        self.process_into(chunk, &mut events);
        events
    }

    /// Feed one text fragment, appending the resulting events to `out`.
    pub fn process_into(&mut self, chunk: &str, out: &mut SieveEvents) {
        self.state.pending.push_str(chunk);
        loop {
            if self.state.capturing {
                if !self.step_capture(out) {
                    break;
                }
                continue;
            }
            if self.state.pending.is_empty() || !self.step_scan(out) {
                break;
            }
        }
    }

    #[must_use]
    pub fn flush(&mut self) -> SieveEvents {
        let mut events = SieveEvents::new();
        self.flush_into(&mut events);
        events
    }

    /// End of stream: resolve or release everything still held.
    pub fn flush_into(&mut self, out: &mut SieveEvents) {
        self.process_into("", out);
        if self.state.capturing {
            match self.consume_capture() {
                Some(consumed) => {
                    self.emit_text(consumed.prefix, out);
                    if !consumed.calls.is_empty() {
                        out.push(SieveEvent::ToolCalls(consumed.calls));
                    }
                    self.emit_text(consumed.suffix, out);
                }
                None => {
                    let capture = std::mem::take(&mut self.state.capture);
                    self.emit_text(capture, out);
                }
            }
            self.state.reset_capture();
        }
        let pending = std::mem::take(&mut self.state.pending);
        self.emit_text(pending, out);
    }

    // -----------------------------------------------------------------------
    // Capturing
    // -----------------------------------------------------------------------

    /// One pass in capture mode. Returns `false` when more input is needed.
    fn step_capture(&mut self, out: &mut SieveEvents) -> bool {
        if !self.state.pending.is_empty() {
            let pending = std::mem::take(&mut self.state.pending);
            self.state.capture.push_str(&pending);
        }

        if self.incremental {
            let deltas = incremental::incremental_deltas(&mut self.state);
            if !deltas.is_empty() {
                out.push(SieveEvent::ToolCallDeltas(deltas));
            }
        }

        let Some(consumed) = self.consume_capture() else {
            if self.state.capture.len() > self.limits.capture_limit {
                tracing::debug!(
                    capture_bytes = self.state.capture.len(),
                    limit = self.limits.capture_limit,
                    "tool call capture overflowed; releasing as text"
                );
                let capture = std::mem::take(&mut self.state.capture);
                self.state.reset_capture();
                self.emit_text(capture, out);
                return true;
            }
            return false;
        };

        self.state.reset_capture();
        self.emit_text(consumed.prefix, out);
        if !consumed.calls.is_empty() {
            out.push(SieveEvent::ToolCalls(consumed.calls));
        }
        self.state.pending.push_str(&consumed.suffix);
        true
    }

    /// Try to resolve the capture. `None` while the candidate object is not
    /// closed yet.
    fn consume_capture(&self) -> Option<Consumed> {
        let captured = self.state.capture.as_str();
        let bytes = captured.as_bytes();
        let key = find_tool_calls_key(bytes, 0)?;
        let start = enclosing_object_start(bytes, key)?;
        let end = find_object_end(bytes, start)?;

        let whole = || Consumed {
            prefix: captured.to_owned(),
            calls: Vec::new(),
            suffix: String::new(),
        };

        let prefix = &captured[..start];
        if self.state.fenced_after_tail(prefix) {
            return Some(whole());
        }

        // Call #0 is dropped before filtering: when it already went out as
        // deltas, the batch must still carry every later call.
        let mut parsed = parser::parse_standalone_unfiltered(&captured[start..end]);
        let name_sent = self.state.cursor.name_sent;
        if parsed.is_empty() && !name_sent {
            return Some(whole());
        }
        if name_sent && !parsed.is_empty() {
            parsed.remove(0);
        }
        Some(Consumed {
            prefix: prefix.to_owned(),
            calls: filter_tool_calls(parsed, &self.tool_names),
            suffix: captured[end..].to_owned(),
        })
    }

    // -----------------------------------------------------------------------
    // Scanning
    // -----------------------------------------------------------------------

    /// One pass in scan mode. Returns `false` when nothing more can be
    /// released without further input.
    fn step_scan(&mut self, out: &mut SieveEvents) -> bool {
        if let Some(start) = find_segment_start(&self.state.pending) {
            let mut pending = std::mem::take(&mut self.state.pending);
            let capture = pending.split_off(start);
            self.emit_text(pending, out);
            self.state.reset_capture();
            self.state.capture = capture;
            self.state.capturing = true;
            return true;
        }

        let mut split = safe_split_point(&self.state.pending, self.limits.hold_window);
        if let Some(start) = self.open_object_hold() {
            split = split.min(start);
        }
        if split == 0 {
            return false;
        }
        let hold = self.state.pending.split_off(split);
        let safe = std::mem::replace(&mut self.state.pending, hold);
        self.emit_text(safe, out);
        true
    }

    /// An unclosed JSON object in `pending` is held whole, up to the capture
    /// limit, so a `tool_calls` key arriving after a long leading field can
    /// still be captured together with its opening brace.
    fn open_object_hold(&self) -> Option<usize> {
        let pending = self.state.pending.as_str();
        let start = open_object_start(pending.as_bytes())?;
        if pending.len() - start > self.limits.capture_limit || self.state.fenced_after_tail(&pending[..start]) {
            return None;
        }
        Some(start)
    }

    fn emit_text(&mut self, text: String, out: &mut SieveEvents) {
        if text.is_empty() {
            return;
        }
        self.state.note_text(&text, self.limits.context_tail);
        out.push(SieveEvent::Text(text));
    }
}

/// Start of a capture: the `{` still open at a `tool_calls` key (or the key
/// itself), skipping keys that sit inside a fenced example.
fn find_segment_start(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut offset = 0;
    while let Some(key) = find_tool_calls_key(bytes, offset) {
        let candidate = enclosing_object_start(bytes, key).unwrap_or(key);
        if !inside_code_fence(&text[..candidate]) {
            return Some(candidate);
        }
        offset = key + crate::json_scan::TOOL_CALLS_KEY.len();
    }
    None
}

/// First `{` that opens a JSON-looking object (next token is a quoted key,
/// or nothing yet) which is still open at the end of `text`.
fn open_object_start(text: &[u8]) -> Option<usize> {
    let mut from = 0;
    while let Some(offset) = memchr(b'{', &text[from..]) {
        let start = from + offset;
        let next = skip_ws(text, start + 1);
        if next < text.len() && !matches!(text[next], b'"' | b'\'') {
            from = start + 1;
            continue;
        }
        match find_object_end(text, start) {
            Some(end) => from = end,
            None => return Some(start),
        }
    }
    None
}

/// Byte offset up to which `text` can be released now.
///
/// Text from the last `{`, `[` or fence marker onward is held back, unless
/// that tail already exceeds the hold window.
fn safe_split_point(text: &str, hold_window: usize) -> usize {
    let bytes = text.as_bytes();
    let marker = [
        memrchr(b'{', bytes),
        memrchr(b'[', bytes),
        memmem::rfind(bytes, b"```"),
    ]
    .into_iter()
    .flatten()
    .max();
    let Some(marker) = marker else {
        return text.len();
    };
    if text[marker..].chars().count() > hold_window {
        return text.len();
    }
    marker
}
