use serde::Serialize;
use std::time::Duration;
use tracing::info;

/// Approximate token count without a tokenizer.
///
/// ASCII characters count a quarter token each; other characters are
/// weighted closer to CJK tokenization density. Non-empty (after trimming)
/// text is at least one token.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    let text = text.trim();
    if text.is_empty() {
        return 0;
    }
    let (ascii, other) = text.chars().fold((0u64, 0u64), |(ascii, other), ch| {
        if ch.is_ascii() {
            (ascii + 1, other)
        } else {
            (ascii, other + 1)
        }
    });
    (ascii / 4 + (other * 10 + 7) / 13).max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompletionTokensDetails {
    pub reasoning_tokens: u64,
}

/// The `usage` block of the terminal chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    /// Reasoning plus answer tokens.
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub completion_tokens_details: CompletionTokensDetails,
}

#[must_use]
pub fn build_usage(prompt: &str, thinking: &str, output: &str) -> Usage {
    let prompt_tokens = estimate_tokens(prompt);
    let reasoning_tokens = estimate_tokens(thinking);
    let completion_tokens = reasoning_tokens + estimate_tokens(output);
    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
        completion_tokens_details: CompletionTokensDetails { reasoning_tokens },
    }
}

/// Log a finished stream at INFO level.
pub fn log_stream_usage(
    model: &str,
    session_id: &str,
    finish_reason: &str,
    usage: &Usage,
    tool_calls_emitted: bool,
    duration: Duration,
) {
    info!(
        model = model,
        session_id = session_id,
        finish_reason = finish_reason,
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        reasoning_tokens = usage.completion_tokens_details.reasoning_tokens,
        tool_calls_emitted = tool_calls_emitted,
        duration_seconds = duration.as_secs_f64(),
        "stream completed"
    );
}
