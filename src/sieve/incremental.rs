// Early extraction of the first tool call while its JSON is still arriving.
//
// Only call #0 is streamed: once its `name` and the start of its arguments
// field are both visible, a one-time name delta goes out, followed by
// argument deltas carrying exactly the newly received part of the value.
// String-valued arguments are unescaped on the fly so that the client sees
// the JSON text the string encodes; an escape sequence cut by a chunk
// boundary is held back until it completes.

use super::state::{inside_code_fence, SieveState};
use super::ToolCallDelta;
use crate::json_scan::{
    enclosing_object_start, find_field_value_start, find_tool_calls_key, parse_string_literal,
    scan_value_progress, skip_ws, TOOL_CALLS_KEY,
};

const ARGUMENT_KEYS: [&str; 5] = ["input", "arguments", "args", "parameters", "params"];

pub(crate) fn incremental_deltas(state: &mut SieveState) -> Vec<ToolCallDelta> {
    let mut deltas = Vec::new();
    if state.capture.is_empty() || inside_code_fence(&state.recent_tail) {
        return deltas;
    }
    let bytes = state.capture.as_bytes();
    let Some(key) = find_tool_calls_key(bytes, 0) else {
        return deltas;
    };
    let Some(start) = enclosing_object_start(bytes, key) else {
        return deltas;
    };
    if state.fenced_after_tail(&state.capture[..start]) {
        return deltas;
    }
    let Some(call_start) = first_call_object_start(bytes, key) else {
        return deltas;
    };

    let capture = state.capture.as_str();
    let cursor = &mut state.cursor;

    if cursor.name.is_none() {
        let Some(name) = extract_call_name(bytes, call_start) else {
            return deltas;
        };
        cursor.name = Some(name);
    }

    if cursor.args_start.is_none() {
        if let Some((value_start, string_mode)) = find_args_start(bytes, call_start) {
            let args_start = if string_mode { value_start + 1 } else { value_start };
            cursor.args_string = string_mode;
            cursor.args_start = Some(args_start);
            cursor.args_sent = args_start;
        }
    }

    if !cursor.name_sent {
        if cursor.args_start.is_none() {
            return deltas;
        }
        cursor.name_sent = true;
        deltas.push(ToolCallDelta {
            index: 0,
            name: cursor.name.clone(),
            arguments: None,
        });
    }

    let Some(args_start) = cursor.args_start else {
        return deltas;
    };
    if cursor.args_done {
        return deltas;
    }
    let Some(progress) = scan_value_progress(bytes, args_start, cursor.args_string) else {
        return deltas;
    };

    if progress.end > cursor.args_sent {
        let raw = &capture[cursor.args_sent..progress.end];
        let (fragment, consumed) = if cursor.args_string {
            decode_string_fragment(raw, progress.complete)
        } else {
            (raw.to_owned(), raw.len())
        };
        cursor.args_sent += consumed;
        if !fragment.is_empty() {
            deltas.push(ToolCallDelta {
                index: 0,
                name: None,
                arguments: Some(fragment),
            });
        }
    }
    if progress.complete && cursor.args_sent >= progress.end {
        cursor.args_done = true;
    }
    deltas
}

/// `tool_calls` `:` `[` `{` with only whitespace between the last three.
fn first_call_object_start(bytes: &[u8], key: usize) -> Option<usize> {
    let after_key = key + TOOL_CALLS_KEY.len();
    let colon = after_key + memchr::memchr(b':', bytes.get(after_key..)?)?;
    let array = skip_ws(bytes, colon + 1);
    if bytes.get(array) != Some(&b'[') {
        return None;
    }
    let object = skip_ws(bytes, array + 1);
    (bytes.get(object) == Some(&b'{')).then_some(object)
}

fn function_object_start(bytes: &[u8], call_start: usize) -> Option<usize> {
    let at = find_field_value_start(bytes, call_start, &["function"])?;
    (bytes.get(at) == Some(&b'{')).then_some(at)
}

fn extract_call_name(bytes: &[u8], call_start: usize) -> Option<String> {
    let direct = find_field_value_start(bytes, call_start, &["name"])
        .filter(|&at| bytes.get(at) == Some(&b'"'));
    let at = match direct {
        Some(at) => at,
        None => {
            let function = function_object_start(bytes, call_start)?;
            find_field_value_start(bytes, function, &["name"])
                .filter(|&at| bytes.get(at) == Some(&b'"'))?
        }
    };
    let (name, _) = parse_string_literal(bytes, at)?;
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_owned())
}

/// Offset of the arguments value and whether it is a string literal.
fn find_args_start(bytes: &[u8], call_start: usize) -> Option<(usize, bool)> {
    let at = match find_field_value_start(bytes, call_start, &ARGUMENT_KEYS) {
        Some(at) => at,
        None => {
            let function = function_object_start(bytes, call_start)?;
            find_field_value_start(bytes, function, &ARGUMENT_KEYS)?
        }
    };
    match bytes.get(at)? {
        b'{' | b'[' => Some((at, false)),
        b'"' => Some((at, true)),
        _ => None,
    }
}

/// Unescape the body of a JSON string literal received so far.
///
/// Returns the decoded text and how many bytes of `raw` it covers. While the
/// literal is still open, a trailing partial escape is left unconsumed.
fn decode_string_fragment(raw: &str, complete: bool) -> (String, usize) {
    let bytes = raw.as_bytes();
    let mut out = String::with_capacity(raw.len());
    let mut i = 0;
    let mut plain_from = 0;

    while let Some(rel) = memchr::memchr(b'\\', &bytes[i..]) {
        let at = i + rel;
        out.push_str(&raw[plain_from..at]);
        match decode_escape(raw, at) {
            Escape::Decoded(ch, len) => {
                out.push(ch);
                i = at + len;
            }
            Escape::Incomplete if !complete => return (out, at),
            Escape::Incomplete => {
                out.push_str(&raw[at..]);
                return (out, raw.len());
            }
        }
        plain_from = i;
    }
    out.push_str(&raw[plain_from..]);
    (out, raw.len())
}

enum Escape {
    Decoded(char, usize),
    Incomplete,
}

fn decode_escape(raw: &str, at: usize) -> Escape {
    let bytes = raw.as_bytes();
    let Some(&marker) = bytes.get(at + 1) else {
        return Escape::Incomplete;
    };
    let simple = match marker {
        b'n' => '\n',
        b't' => '\t',
        b'r' => '\r',
        b'b' => '\u{8}',
        b'f' => '\u{c}',
        b'u' => return decode_unicode_escape(raw, at),
        other if other.is_ascii() => char::from(other),
        _ => {
            // Escaped multi-byte character: keep it verbatim.
            let ch = raw[at + 1..].chars().next().unwrap_or('\u{fffd}');
            return Escape::Decoded(ch, 1 + ch.len_utf8());
        }
    };
    Escape::Decoded(simple, 2)
}

fn decode_unicode_escape(raw: &str, at: usize) -> Escape {
    let Some(high) = hex4(raw, at + 2) else {
        return if raw.len() < at + 6 {
            Escape::Incomplete
        } else {
            Escape::Decoded('\u{fffd}', 2)
        };
    };
    if !(0xD800..0xDC00).contains(&high) {
        return Escape::Decoded(char::from_u32(high).unwrap_or('\u{fffd}'), 6);
    }
    if raw.len() < at + 12 {
        return Escape::Incomplete;
    }
    if raw.as_bytes().get(at + 6..at + 8) == Some(b"\\u".as_slice()) {
        if let Some(low) = hex4(raw, at + 8).filter(|low| (0xDC00..0xE000).contains(low)) {
            let code = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
            return Escape::Decoded(char::from_u32(code).unwrap_or('\u{fffd}'), 12);
        }
    }
    Escape::Decoded('\u{fffd}', 6)
}

fn hex4(raw: &str, from: usize) -> Option<u32> {
    let digits = raw.get(from..from + 4)?;
    u32::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(state: &mut SieveState, text: &str) -> Vec<ToolCallDelta> {
        state.capturing = true;
        state.capture.push_str(text);
        incremental_deltas(state)
    }

    fn joined_arguments(deltas: &[ToolCallDelta]) -> String {
        deltas
            .iter()
            .filter_map(|delta| delta.arguments.as_deref())
            .collect()
    }

    #[test]
    fn name_waits_for_arguments_field() {
        let mut state = SieveState::default();
        assert!(feed(&mut state, r#"{"tool_calls":[{"name":"read_file""#).is_empty());
        let deltas = feed(&mut state, r#","input":{"path":"RE"#);
        assert_eq!(deltas[0].name.as_deref(), Some("read_file"));
        assert_eq!(deltas[1].arguments.as_deref(), Some(r#"{"path":"RE"#));
    }

    #[test]
    fn object_arguments_stream_without_replay() {
        let mut state = SieveState::default();
        let mut all = feed(&mut state, r#"{"tool_calls":[{"name":"read_file","input":{"path":"READ"#);
        all.extend(feed(&mut state, r#"ME.MD","mode":"head"}}]}"#));
        assert_eq!(joined_arguments(&all), r#"{"path":"README.MD","mode":"head"}"#);
        assert!(state.cursor.args_done);
        assert!(feed(&mut state, " trailing").is_empty());
    }

    #[test]
    fn nested_function_shape() {
        let mut state = SieveState::default();
        let deltas = feed(
            &mut state,
            r#"{"tool_calls":[{"type":"function","function":{"name":"search","arguments":{"q":"rust"}}}]}"#,
        );
        assert_eq!(deltas[0].name.as_deref(), Some("search"));
        assert_eq!(joined_arguments(&deltas), r#"{"q":"rust"}"#);
    }

    #[test]
    fn string_arguments_are_unescaped_across_chunks() {
        let mut state = SieveState::default();
        let mut all = feed(&mut state, r#"{"tool_calls":[{"name":"run","arguments":"{\"cmd\":\"l"#);
        all.extend(feed(&mut state, r#"s\"#));
        all.extend(feed(&mut state, r#"né\"}"}]}"#));
        assert_eq!(joined_arguments(&all), "{\"cmd\":\"ls\né\"}");
        assert!(state.cursor.args_done);
    }

    #[test]
    fn fenced_tail_suppresses_deltas() {
        let mut state = SieveState::default();
        state.note_text("example:\n```json\n", 256);
        let deltas = feed(&mut state, r#"{"tool_calls":[{"name":"read_file","input":{}}]}"#);
        assert!(deltas.is_empty());
    }

    #[test]
    fn surrogate_pair_held_until_complete() {
        let (text, used) = decode_string_fragment(r"a\ud83d", false);
        assert_eq!((text.as_str(), used), ("a", 1));
        let (text, used) = decode_string_fragment(r"a\ud83d\ude00b", false);
        assert_eq!(text, "a😀b");
        assert_eq!(used, 14);
    }
}
