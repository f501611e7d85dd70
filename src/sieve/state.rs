use memchr::memmem;

const FENCE: &[u8] = b"```";

/// Tunables for one sieve instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SieveLimits {
    /// Bytes a capture may grow to before it is given up as plain text.
    pub capture_limit: usize,
    /// Characters the scanning heuristic may hold back after a `{`, `[`
    /// or fence marker.
    pub hold_window: usize,
    /// Characters of emitted text remembered for the fence heuristic.
    pub context_tail: usize,
}

impl Default for SieveLimits {
    fn default() -> Self {
        Self {
            capture_limit: 8 * 1024,
            hold_window: 64,
            context_tail: 256,
        }
    }
}

/// Progress of the single in-flight incremental tool call (index 0).
///
/// Offsets index into the capture buffer, which only grows while capturing.
#[derive(Debug, Default, Clone)]
pub(crate) struct IncrementalCursor {
    pub(crate) name_sent: bool,
    pub(crate) name: Option<String>,
    pub(crate) args_start: Option<usize>,
    pub(crate) args_sent: usize,
    pub(crate) args_string: bool,
    pub(crate) args_done: bool,
}

#[derive(Debug, Default)]
pub(crate) struct SieveState {
    pub(crate) pending: String,
    pub(crate) capture: String,
    pub(crate) capturing: bool,
    pub(crate) recent_tail: String,
    pub(crate) cursor: IncrementalCursor,
}

impl SieveState {
    /// Leave capture mode, dropping the capture buffer and cursor.
    pub(crate) fn reset_capture(&mut self) {
        self.capture.clear();
        self.capturing = false;
        self.cursor = IncrementalCursor::default();
    }

    /// Remember emitted text for the fence heuristic. Whitespace-only text
    /// does not move the tail.
    pub(crate) fn note_text(&mut self, text: &str, limit: usize) {
        if text.trim().is_empty() {
            return;
        }
        self.recent_tail.push_str(text);
        keep_last_chars(&mut self.recent_tail, limit);
    }

    /// Whether `text`, read after the remembered tail, ends inside a fence.
    pub(crate) fn fenced_after_tail(&self, text: &str) -> bool {
        let mut joined = String::with_capacity(self.recent_tail.len() + text.len());
        joined.push_str(&self.recent_tail);
        joined.push_str(text);
        inside_code_fence(&joined)
    }
}

/// Odd number of triple-backtick markers means the end of `text` sits inside
/// a fenced block.
pub(crate) fn inside_code_fence(text: &str) -> bool {
    count_fences(text) % 2 == 1
}

fn count_fences(text: &str) -> usize {
    memmem::find_iter(text.as_bytes(), FENCE).count()
}

fn keep_last_chars(text: &mut String, limit: usize) {
    if limit == 0 {
        text.clear();
        return;
    }
    let char_count = text.chars().count();
    if char_count <= limit {
        return;
    }
    let cut = text
        .char_indices()
        .nth(char_count - limit)
        .map_or(text.len(), |(at, _)| at);
    text.drain(..cut);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_parity() {
        assert!(!inside_code_fence(""));
        assert!(inside_code_fence("see ```json\n{"));
        assert!(!inside_code_fence("```a``` done"));
    }

    #[test]
    fn fence_split_between_tail_and_text() {
        let mut state = SieveState::default();
        state.note_text("example:\n```json\n", 256);
        assert!(state.fenced_after_tail("{"));
        assert!(!state.fenced_after_tail("{}\n```\n"));
    }

    #[test]
    fn tail_is_bounded_on_char_boundaries() {
        let mut state = SieveState::default();
        state.note_text("前置正文abc", 5);
        assert_eq!(state.recent_tail, "正文abc");
        state.note_text("   ", 5);
        assert_eq!(state.recent_tail, "正文abc");
    }

    #[test]
    fn reset_clears_cursor() {
        let mut state = SieveState::default();
        state.capturing = true;
        state.capture.push_str("{\"tool_calls\"");
        state.cursor.name_sent = true;
        state.cursor.args_start = Some(3);
        state.reset_capture();
        assert!(!state.capturing);
        assert!(state.capture.is_empty());
        assert!(!state.cursor.name_sent);
        assert_eq!(state.cursor.args_start, None);
    }
}
