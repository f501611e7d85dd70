use std::sync::Arc;

use serde_json::json;
use streamsieve::config::ClassifierConfig;
use streamsieve::observability::token_counter::estimate_tokens;
use streamsieve::sieve::{parse_standalone_tool_calls, SieveEvent, SieveLimits, ToolSieve};
use streamsieve::stream::{PartKind, PathClassifier, SkipPaths, Terminal};

const PAYLOAD: &str = r#"{"tool_calls":[{"name":"read_file","input":{"path":"README.MD"}}]}"#;

fn names() -> Vec<String> {
    vec!["read_file".to_string(), "search".to_string()]
}

fn run(chunks: &[&str], incremental: bool) -> Vec<SieveEvent> {
    let mut sieve = ToolSieve::new(names(), SieveLimits::default(), incremental);
    let mut events = Vec::new();
    for chunk in chunks {
        events.extend(sieve.process(chunk));
    }
    events.extend(sieve.flush());
    events
}

fn text_of(events: &[SieveEvent]) -> String {
    events
        .iter()
        .filter_map(|event| match event {
            SieveEvent::Text(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

fn has_tool_events(events: &[SieveEvent]) -> bool {
    events
        .iter()
        .any(|event| !matches!(event, SieveEvent::Text(_)))
}

fn call_names(events: &[SieveEvent]) -> Vec<String> {
    let mut names = Vec::new();
    for event in events {
        match event {
            SieveEvent::ToolCallDeltas(deltas) => {
                names.extend(deltas.iter().filter_map(|delta| delta.name.clone()));
            }
            SieveEvent::ToolCalls(calls) => names.extend(calls.iter().map(|call| call.name.clone())),
            SieveEvent::Text(_) => {}
        }
    }
    names
}

fn assert_no_leak(text: &str) {
    assert!(
        !text.to_ascii_lowercase().contains("tool_calls"),
        "payload leaked into text: {text:?}"
    );
    assert!(!text.contains('{'), "unmatched brace leaked into text: {text:?}");
}

#[test]
fn test_no_leak_for_every_split_point() {
    let input = format!("Reading it now. {PAYLOAD} Done.");
    for split in 1..input.len() {
        if !input.is_char_boundary(split) {
            continue;
        }
        for incremental in [false, true] {
            let events = run(&[&input[..split], &input[split..]], incremental);
            let text = text_of(&events);
            assert_no_leak(&text);
            assert_eq!(text, "Reading it now.  Done.", "split at {split}");
            assert_eq!(call_names(&events), vec!["read_file"], "split at {split}");
        }
    }
}

#[test]
fn test_no_leak_with_long_leading_field_streamed_per_char() {
    let input = format!(
        r#"{{"reason":"{}","tool_calls":[{{"name":"read_file","input":{{"path":"a"}}}}]}}"#,
        "x".repeat(80)
    );
    let chunks: Vec<String> = input.chars().map(String::from).collect();
    let chunks: Vec<&str> = chunks.iter().map(String::as_str).collect();
    for incremental in [false, true] {
        let events = run(&chunks, incremental);
        assert_eq!(text_of(&events), "");
        assert_eq!(call_names(&events), vec!["read_file"]);
    }
}

#[test]
fn test_fenced_payload_in_prose_is_text() {
    let input = format!("Here is an example:\n```json\n{PAYLOAD}\n```\nThat is all.");
    for incremental in [false, true] {
        let events = run(&[&input], incremental);
        assert!(!has_tool_events(&events));
        assert_eq!(text_of(&events), input);
    }
}

#[test]
fn test_standalone_versus_prose() {
    let calls = parse_standalone_tool_calls(PAYLOAD, &names());
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].name, "read_file");
    assert_eq!(serde_json::Value::Object(calls[0].input.clone()), json!({"path": "README.MD"}));

    let prose = format!("For example you could send {PAYLOAD} to read a file.");
    assert!(parse_standalone_tool_calls(&prose, &names()).is_empty());
}

#[test]
fn test_split_key_across_three_chunks() {
    let chunks = [
        "{\"",
        r#"tool_calls":[{"name":"read_file","input":{"path":"README.MD"}}]}"#,
        "后置正文。",
    ];
    for incremental in [false, true] {
        let events = run(&chunks, incremental);
        let text = text_of(&events);
        assert_no_leak(&text);
        assert!(text.contains("后置正文。"));
        assert_eq!(call_names(&events), vec!["read_file"]);
    }
}

#[test]
fn test_incremental_deltas_assemble_arguments() {
    let events = run(
        &[
            r#"{"tool_calls":[{"name":"read_file","input":{"path":"READ"#,
            r#"ME.MD","mode":"head"}}]}"#,
        ],
        true,
    );
    let deltas: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            SieveEvent::ToolCallDeltas(deltas) => Some(deltas.iter()),
            _ => None,
        })
        .flatten()
        .collect();
    assert!(deltas.iter().any(|delta| delta.name.as_deref() == Some("read_file")));
    assert!(deltas.iter().all(|delta| delta.index == 0));
    let arguments: String = deltas
        .iter()
        .filter_map(|delta| delta.arguments.as_deref())
        .collect();
    let parsed: serde_json::Value = serde_json::from_str(&arguments).expect("arguments are valid JSON");
    assert_eq!(parsed, json!({"path": "README.MD", "mode": "head"}));
    assert_eq!(text_of(&events), "");
}

#[test]
fn test_malformed_payload_is_released_as_text() {
    let input = r#"see {"tool_calls": "nothing to call"} here"#;
    let events = run(&[input], false);
    assert!(!has_tool_events(&events));
    assert_eq!(text_of(&events), input);
}

#[test]
fn test_undeclared_name_is_still_intercepted() {
    let input = r#"{"tool_calls":[{"name":"delete_everything","input":{}}]}"#;
    let events = run(&[input], false);
    assert_no_leak(&text_of(&events));
    assert_eq!(call_names(&events), vec!["delete_everything"]);
}

#[test]
fn test_usage_estimator_properties() {
    assert_eq!(estimate_tokens(""), 0);
    assert_eq!(estimate_tokens("   "), 0);
    assert_eq!(estimate_tokens("a"), 1);
    assert_eq!(estimate_tokens("你"), 1);
    assert_eq!(estimate_tokens(&"x".repeat(400)), 100);

    let mut previous = 0;
    let sample = "token estimation 是近似的, but monotonic. ";
    let mut text = String::new();
    for ch in sample.chars().cycle().take(200) {
        text.push(ch);
        let current = estimate_tokens(&text);
        assert!(current >= previous, "estimate shrank at {text:?}");
        previous = current;
    }
}

#[test]
fn test_classifier_path_priority() {
    let skip = Arc::new(SkipPaths::from_config(&ClassifierConfig::default()));
    let mut classifier = PathClassifier::new(skip, true);

    let finished = classifier.classify(&json!({
        "p": "response/status",
        "v": "FINISHED",
        "content": "ignored",
        "type": "RESPONSE"
    }));
    assert_eq!(finished.terminal, Some(Terminal::Finished));
    assert!(finished.parts.is_empty());

    for path in ["response/elapsed_secs", "response/quasi_status", "response/search_status"] {
        let outcome = classifier.classify(&json!({"p": path, "v": "visible?", "content": "visible?"}));
        assert!(outcome.parts.is_empty(), "{path} should be dropped");
        assert_eq!(outcome.terminal, None);
    }

    let thinking = classifier.classify(&json!({"p": "response/thinking_content", "v": "hmm"}));
    assert_eq!(thinking.parts[0].kind, PartKind::Thinking);
    let answer = classifier.classify(&json!({"p": "response/content", "v": "ok"}));
    assert_eq!(answer.parts[0].kind, PartKind::Text);
}
