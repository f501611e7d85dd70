// Byte-level scanners over partially received JSON-ish text.
//
// None of these functions validate JSON. They only track enough structure
// (brace depth, quoted spans, backslash escapes) to locate boundaries inside
// text that may still be growing. Both `'` and `"` open a quoted span, since
// model output frequently uses single-quoted pseudo-JSON. Every returned
// offset points at an ASCII byte (or the end of input), so it is always a
// valid `str` char boundary.

use memchr::{memchr2, memrchr_iter};

pub(crate) const TOOL_CALLS_KEY: &[u8] = b"tool_calls";

#[inline]
pub(crate) fn skip_ws(bytes: &[u8], mut i: usize) -> usize {
    let len = bytes.len();
    while i < len {
        match bytes[i] {
            b' ' | b'\n' | b'\r' | b'\t' => i += 1,
            _ => break,
        }
    }
    i
}

/// Find the next ASCII case-insensitive occurrence of `tool_calls` at or after `from`.
#[inline]
pub(crate) fn find_tool_calls_key(bytes: &[u8], from: usize) -> Option<usize> {
    let key_len = TOOL_CALLS_KEY.len();
    let mut i = from;
    while i + key_len <= bytes.len() {
        let rel = memchr2(b't', b'T', &bytes[i..=bytes.len() - key_len])?;
        let at = i + rel;
        if bytes[at..at + key_len].eq_ignore_ascii_case(TOOL_CALLS_KEY) {
            return Some(at);
        }
        i = at + 1;
    }
    None
}

/// Tracks whether the scanner is inside a quoted span.
#[derive(Default)]
struct QuoteTracker {
    quote: Option<u8>,
    escaped: bool,
}

impl QuoteTracker {
    /// Feed one byte. Returns `true` when the byte belongs to a quoted span
    /// (including the opening and closing quote) and must not be treated as
    /// structure.
    #[inline]
    fn consume(&mut self, byte: u8) -> bool {
        if let Some(quote) = self.quote {
            if self.escaped {
                self.escaped = false;
            } else if byte == b'\\' {
                self.escaped = true;
            } else if byte == quote {
                self.quote = None;
            }
            return true;
        }
        if byte == b'"' || byte == b'\'' {
            self.quote = Some(byte);
            return true;
        }
        false
    }
}

/// Start of the innermost `{` that is still open at `end`.
pub(crate) fn enclosing_object_start(bytes: &[u8], end: usize) -> Option<usize> {
    let head = &bytes[..end];
    memrchr_iter(b'{', head).find(|&start| find_object_end(head, start).is_none())
}

/// Return the exclusive end of the `{...}` object opening at `start`, or
/// `None` when the object is not closed yet.
pub(crate) fn find_object_end(bytes: &[u8], start: usize) -> Option<usize> {
    if bytes.get(start) != Some(&b'{') {
        return None;
    }
    let mut depth = 0usize;
    let mut quotes = QuoteTracker::default();
    for (i, &byte) in bytes.iter().enumerate().skip(start) {
        if quotes.consume(byte) {
            continue;
        }
        match byte {
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// How far a value starting at `start` has been received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ValueProgress {
    /// Exclusive end of the observed part of the value.
    pub(crate) end: usize,
    /// The value's terminator has been seen.
    pub(crate) complete: bool,
}

/// Measure the growth of a value.
///
/// In string mode `start` points just past the opening `"` and the scan stops
/// at the first unescaped `"` (exclusive). Otherwise `start` must point at `{`
/// or `[` and the scan stops after the bracket that balances it.
pub(crate) fn scan_value_progress(
    bytes: &[u8],
    start: usize,
    string_mode: bool,
) -> Option<ValueProgress> {
    if start > bytes.len() {
        return None;
    }
    if string_mode {
        let mut escaped = false;
        for (i, &byte) in bytes.iter().enumerate().skip(start) {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                return Some(ValueProgress {
                    end: i,
                    complete: true,
                });
            }
        }
        return Some(ValueProgress {
            end: bytes.len(),
            complete: false,
        });
    }

    if !matches!(bytes.get(start), Some(b'{' | b'[')) {
        return None;
    }
    let mut depth = 0usize;
    let mut quotes = QuoteTracker::default();
    for (i, &byte) in bytes.iter().enumerate().skip(start) {
        if quotes.consume(byte) {
            continue;
        }
        match byte {
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(ValueProgress {
                        end: i + 1,
                        complete: true,
                    });
                }
            }
            _ => {}
        }
    }
    Some(ValueProgress {
        end: bytes.len(),
        complete: false,
    })
}

/// Parse a double-quoted string literal opening at `start`.
///
/// Returns the literal's content (escape markers dropped, escaped characters
/// kept verbatim) and the exclusive end offset. `None` while unterminated.
pub(crate) fn parse_string_literal(bytes: &[u8], start: usize) -> Option<(String, usize)> {
    if bytes.get(start) != Some(&b'"') {
        return None;
    }
    let mut out = Vec::new();
    let mut escaped = false;
    for (i, &byte) in bytes.iter().enumerate().skip(start + 1) {
        if escaped {
            out.push(byte);
            escaped = false;
            continue;
        }
        match byte {
            b'\\' => escaped = true,
            b'"' => return String::from_utf8(out).ok().map(|value| (value, i + 1)),
            _ => out.push(byte),
        }
    }
    None
}

/// Locate the value of the first depth-1 key of the object at `obj_start`
/// whose name is one of `keys`, returning the offset of the value's first
/// non-whitespace byte.
///
/// Keys are matched in document order; the caller's `keys` order only
/// matters when several candidate keys are present, in which case the first
/// key in `keys` that occurs wins.
pub(crate) fn find_field_value_start(bytes: &[u8], obj_start: usize, keys: &[&str]) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    walk_top_level_keys(bytes, obj_start, |name, value_start| {
        if let Some(rank) = keys.iter().position(|key| *key == name) {
            if best.map_or(true, |(best_rank, _)| rank < best_rank) {
                best = Some((rank, value_start));
            }
            rank == 0
        } else {
            false
        }
    });
    best.map(|(_, value_start)| value_start)
}

/// Visit each `"key": value` pair at depth 1 of the object at `obj_start`.
/// The visitor returns `true` to stop early.
fn walk_top_level_keys<F>(bytes: &[u8], obj_start: usize, mut visit: F)
where
    F: FnMut(&str, usize) -> bool,
{
    if bytes.get(obj_start) != Some(&b'{') {
        return;
    }
    let mut depth = 0usize;
    let mut quotes = QuoteTracker::default();
    let mut i = obj_start;
    while i < bytes.len() {
        let byte = bytes[i];
        if depth == 1 && quotes.quote.is_none() && byte == b'"' {
            let Some((name, name_end)) = parse_string_literal(bytes, i) else {
                return;
            };
            let colon = skip_ws(bytes, name_end);
            if bytes.get(colon) != Some(&b':') {
                i = name_end;
                continue;
            }
            let value_start = skip_ws(bytes, colon + 1);
            if value_start >= bytes.len() {
                return;
            }
            if visit(&name, value_start) {
                return;
            }
            i = value_start;
            continue;
        }
        if quotes.consume(byte) {
            i += 1;
            continue;
        }
        match byte {
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return;
                }
            }
            _ => {}
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_key_case_insensitively() {
        let text = b"prefix {\"Tool_Calls\": []}";
        assert_eq!(find_tool_calls_key(text, 0), Some(9));
        assert_eq!(find_tool_calls_key(text, 10), None);
        assert_eq!(find_tool_calls_key(b"tool_call", 0), None);
    }

    #[test]
    fn object_end_ignores_braces_inside_strings() {
        let text = br#"{"a":"}{","b":'}'}tail"#;
        let end = find_object_end(text, 0).unwrap();
        assert_eq!(&text[end..], b"tail");
    }

    #[test]
    fn object_end_honors_escaped_quotes() {
        let text = br#"{"a":"\"}"}x"#;
        let end = find_object_end(text, 0).unwrap();
        assert_eq!(&text[end..], b"x");
    }

    #[test]
    fn object_end_incomplete() {
        assert_eq!(find_object_end(br#"{"a":{"b":1}"#, 0), None);
        assert_eq!(find_object_end(b"x{}", 0), None);
    }

    #[test]
    fn progress_structured_value() {
        let text = br#"{"path":"a}b","n":[1,2]}, rest"#;
        let progress = scan_value_progress(text, 0, false).unwrap();
        assert!(progress.complete);
        assert_eq!(&text[..progress.end], br#"{"path":"a}b","n":[1,2]}"#);

        let partial = br#"{"path":"REA"#;
        let progress = scan_value_progress(partial, 0, false).unwrap();
        assert!(!progress.complete);
        assert_eq!(progress.end, partial.len());
    }

    #[test]
    fn progress_string_value() {
        let text = br#""a\"b" tail"#;
        let progress = scan_value_progress(text, 1, true).unwrap();
        assert!(progress.complete);
        assert_eq!(&text[1..progress.end], br#"a\"b"#);
    }

    #[test]
    fn field_value_only_matches_depth_one() {
        let text = br#"{"function":{"name":"inner"},"name":"outer"}"#;
        let at = find_field_value_start(text, 0, &["name"]).unwrap();
        let (value, _) = parse_string_literal(text, at).unwrap();
        assert_eq!(value, "outer");
    }

    #[test]
    fn field_value_respects_key_priority() {
        let text = br#"{"params":{"a":1},"input":{"b":2}}"#;
        let keys = ["input", "arguments", "args", "parameters", "params"];
        let at = find_field_value_start(text, 0, &keys).unwrap();
        assert_eq!(&text[at..at + 6], br#"{"b":2"#);
    }

    #[test]
    fn field_value_ignores_string_values_that_look_like_keys() {
        let text = br#"{"note":"name","name":"real"}"#;
        let at = find_field_value_start(text, 0, &["name"]).unwrap();
        let (value, _) = parse_string_literal(text, at).unwrap();
        assert_eq!(value, "real");
    }

    #[test]
    fn field_value_missing_while_partial() {
        assert_eq!(find_field_value_start(br#"{"name":"#, 0, &["name"]), None);
        assert_eq!(find_field_value_start(br#"{"na"#, 0, &["name"]), None);
    }

    #[test]
    fn enclosing_object_skips_closed_siblings() {
        let text = br#"{"meta":{"a":1},"tool_calls":["#;
        let key = find_tool_calls_key(text, 0).unwrap();
        assert_eq!(enclosing_object_start(text, key), Some(0));
        let text = br#"{"tool_calls":["#;
        assert_eq!(enclosing_object_start(text, 2), Some(0));
        assert_eq!(enclosing_object_start(br#"{"a":1} "tool_calls""#, 9), None);
    }
}
