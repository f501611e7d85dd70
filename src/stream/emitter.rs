//! OpenAI `chat.completion.chunk` framing.
//!
//! [`FrameEmitter`] owns the per-stream envelope (id, model, creation time),
//! injects `role: "assistant"` into the first delta only, assigns stable
//! `call_<hex>` ids per tool-call index and writes the terminal frame
//! followed by `data: [DONE]`. Once finished, every method returns `None`.

use bytes::Bytes;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::observability::token_counter::Usage;
use crate::sieve::{ParsedToolCall, ToolCallDelta};
use crate::util::new_call_id;

const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    ContentFilter,
}

impl FinishReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::ToolCalls => "tool_calls",
            Self::ContentFilter => "content_filter",
        }
    }
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChunkFrame<'a> {
    id: &'a str,
    object: &'static str,
    created: u64,
    model: &'a str,
    choices: [Choice<'a>; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<&'a Usage>,
}

#[derive(Serialize)]
struct Choice<'a> {
    index: u32,
    delta: Delta<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finish_reason: Option<&'static str>,
}

#[derive(Serialize, Default)]
struct Delta<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ToolCallEntry<'a>>>,
}

#[derive(Serialize)]
struct ToolCallEntry<'a> {
    index: usize,
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: FunctionEntry<'a>,
}

#[derive(Serialize)]
struct FunctionEntry<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<String>,
}

// ---------------------------------------------------------------------------
// Emitter
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FrameEmitter {
    id: String,
    model: String,
    created: u64,
    first_delta_sent: bool,
    call_ids: FxHashMap<usize, String>,
    next_call_index: usize,
    tool_calls_emitted: bool,
    finished: bool,
}

impl FrameEmitter {
    #[must_use]
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: u64) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created,
            first_delta_sent: false,
            call_ids: FxHashMap::default(),
            next_call_index: 0,
            tool_calls_emitted: false,
            finished: false,
        }
    }

    /// Whether any tool-call delta or batch has been emitted.
    #[must_use]
    pub fn tool_calls_emitted(&self) -> bool {
        self.tool_calls_emitted
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn content(&mut self, text: &str) -> Option<Bytes> {
        if text.is_empty() {
            return None;
        }
        self.delta_frame(Delta {
            content: Some(text),
            ..Delta::default()
        })
    }

    pub fn reasoning(&mut self, text: &str) -> Option<Bytes> {
        if text.is_empty() {
            return None;
        }
        self.delta_frame(Delta {
            reasoning_content: Some(text),
            ..Delta::default()
        })
    }

    /// Incremental name/argument updates. Entries carrying neither are
    /// dropped; `None` when nothing remains.
    pub fn tool_call_deltas(&mut self, deltas: &[ToolCallDelta]) -> Option<Bytes> {
        if self.finished {
            return None;
        }
        let mut entries = Vec::with_capacity(deltas.len());
        for delta in deltas {
            if delta.name.is_none() && delta.arguments.is_none() {
                continue;
            }
            self.next_call_index = self.next_call_index.max(delta.index + 1);
            entries.push(ToolCallEntry {
                index: delta.index,
                id: self.call_id(delta.index),
                kind: "function",
                function: FunctionEntry {
                    name: delta.name.as_deref(),
                    arguments: delta.arguments.clone(),
                },
            });
        }
        if entries.is_empty() {
            return None;
        }
        self.tool_calls_emitted = true;
        self.delta_frame(Delta {
            tool_calls: Some(entries),
            ..Delta::default()
        })
    }

    /// Fully parsed calls, indexed after any call already streamed.
    pub fn tool_calls(&mut self, calls: &[ParsedToolCall]) -> Option<Bytes> {
        if self.finished || calls.is_empty() {
            return None;
        }
        let first = self.next_call_index;
        let entries = calls
            .iter()
            .enumerate()
            .map(|(offset, call)| ToolCallEntry {
                index: first + offset,
                id: self.call_id(first + offset),
                kind: "function",
                function: FunctionEntry {
                    name: Some(call.name.as_str()),
                    arguments: Some(call.arguments_json()),
                },
            })
            .collect::<Vec<_>>();
        self.next_call_index = first + calls.len();
        self.tool_calls_emitted = true;
        self.delta_frame(Delta {
            tool_calls: Some(entries),
            ..Delta::default()
        })
    }

    /// Terminal frame plus `[DONE]`. `finish_reason` becomes `tool_calls`
    /// whenever a tool call went out. Only the first call produces output.
    pub fn finish(&mut self, reason: FinishReason, usage: &Usage) -> Option<Bytes> {
        if self.finished {
            return None;
        }
        self.finished = true;
        let reason = self.effective_reason(reason);
        let frame = ChunkFrame {
            id: &self.id,
            object: "chat.completion.chunk",
            created: self.created,
            model: &self.model,
            choices: [Choice {
                index: 0,
                delta: Delta::default(),
                finish_reason: Some(reason.as_str()),
            }],
            usage: Some(usage),
        };
        let mut out = encode_data_frame(&frame)?;
        out.extend_from_slice(DONE_FRAME);
        Some(Bytes::from(out))
    }

    #[must_use]
    pub fn effective_reason(&self, reason: FinishReason) -> FinishReason {
        if self.tool_calls_emitted {
            FinishReason::ToolCalls
        } else {
            reason
        }
    }

    fn call_id(&mut self, index: usize) -> String {
        self.call_ids.entry(index).or_insert_with(new_call_id).clone()
    }

    fn delta_frame(&mut self, mut delta: Delta<'_>) -> Option<Bytes> {
        if self.finished {
            return None;
        }
        if !self.first_delta_sent {
            delta.role = Some("assistant");
            self.first_delta_sent = true;
        }
        let frame = ChunkFrame {
            id: &self.id,
            object: "chat.completion.chunk",
            created: self.created,
            model: &self.model,
            choices: [Choice {
                index: 0,
                delta,
                finish_reason: None,
            }],
            usage: None,
        };
        encode_data_frame(&frame).map(Bytes::from)
    }
}

fn encode_data_frame<T: Serialize>(frame: &T) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(b"data: ");
    if let Err(error) = serde_json::to_writer(&mut out, frame) {
        tracing::debug!(%error, "failed to encode chunk frame");
        return None;
    }
    out.extend_from_slice(b"\n\n");
    Some(out)
}
