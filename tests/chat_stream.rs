use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use streamsieve::config::parse_config;
use streamsieve::routing::dispatch::dispatch_request;
use streamsieve::state::AppState;
use streamsieve::transport::UpstreamTransport;

#[derive(Clone)]
struct Mock {
    prepare_status: StatusCode,
    prepare_body: Value,
    completion_status: StatusCode,
    completion_body: String,
    prepare_calls: Arc<AtomicUsize>,
    completion_calls: Arc<AtomicUsize>,
    releases: Arc<Mutex<Vec<String>>>,
    seen_headers: Arc<Mutex<Vec<(String, String)>>>,
}

impl Mock {
    fn new(completion_body: String) -> Self {
        Self {
            prepare_status: StatusCode::OK,
            prepare_body: json!({
                "model": "deepseek-chat",
                "session_id": "chatcmpl-mock",
                "lease_id": "lease-1",
                "deepseek_token": "vendor-token",
                "pow_header": "pow-value",
                "payload": {"chat_session_id": "s1", "prompt": "hi"},
                "final_prompt": "hi there",
                "thinking_enabled": false,
                "search_enabled": false
            }),
            completion_status: StatusCode::OK,
            completion_body,
            prepare_calls: Arc::new(AtomicUsize::new(0)),
            completion_calls: Arc::new(AtomicUsize::new(0)),
            releases: Arc::new(Mutex::new(Vec::new())),
            seen_headers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn record(&self, route: &str, headers: &HeaderMap, names: &[&str]) {
        let mut seen = self.seen_headers.lock().unwrap();
        for name in names {
            if let Some(value) = headers.get(*name).and_then(|v| v.to_str().ok()) {
                seen.push((format!("{route}:{name}"), value.to_string()));
            }
        }
    }

    fn header(&self, key: &str) -> Option<String> {
        self.seen_headers
            .lock()
            .unwrap()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    fn releases(&self) -> Vec<String> {
        self.releases.lock().unwrap().clone()
    }
}

async fn prepare_route(State(mock): State<Mock>, headers: HeaderMap, _body: Bytes) -> Response {
    mock.prepare_calls.fetch_add(1, Ordering::SeqCst);
    mock.record("prepare", &headers, &["authorization", "x-ds2-internal-token"]);
    (mock.prepare_status, Json(mock.prepare_body.clone())).into_response()
}

async fn completion_route(State(mock): State<Mock>, headers: HeaderMap, body: Bytes) -> Response {
    mock.completion_calls.fetch_add(1, Ordering::SeqCst);
    mock.record(
        "completion",
        &headers,
        &["authorization", "x-ds-pow-response", "x-client-platform"],
    );
    let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    assert_eq!(payload["chat_session_id"], "s1");
    (
        mock.completion_status,
        [("content-type", "text/event-stream")],
        mock.completion_body.clone(),
    )
        .into_response()
}

async fn release_route(State(mock): State<Mock>, Json(body): Json<Value>) -> StatusCode {
    let lease_id = body["lease_id"].as_str().unwrap_or_default().to_string();
    mock.releases.lock().unwrap().push(lease_id);
    StatusCode::OK
}

async fn start_mock(mock: Mock) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let app = Router::new()
        .route("/prepare", post(prepare_route))
        .route("/completion", post(completion_route))
        .route("/release", post(release_route))
        .with_state(mock);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock collaborator");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, server)
}

fn build_state(addr: std::net::SocketAddr, extra_server: &str) -> Arc<AppState> {
    let yaml = format!(
        "server:\n  port: 8000\n{extra_server}\
prepare:\n  url: http://{addr}/prepare\n  release_url: http://{addr}/release\n  internal_token: secret\n\
vendor:\n  completion_url: http://{addr}/completion\n"
    );
    let config = parse_config(&yaml).expect("valid test config");
    let transport = UpstreamTransport::new(&config).expect("transport");
    Arc::new(AppState::new(config, transport))
}

fn sse(chunks: &[Value]) -> String {
    let mut body = String::new();
    for chunk in chunks {
        body.push_str("data: ");
        body.push_str(&chunk.to_string());
        body.push_str("\n\n");
    }
    body
}

fn chat_request(payload: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer client-key")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(payload).expect("serialize request")))
        .expect("build request")
}

async fn read_body(response: Response) -> String {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    String::from_utf8(body.to_vec()).expect("utf-8 body")
}

fn decode_frames(body: &str) -> Vec<Value> {
    body.split("\n\n")
        .filter_map(|event| event.strip_prefix("data: "))
        .filter(|data| *data != "[DONE]")
        .map(|data| serde_json::from_str(data).expect("chunk json"))
        .collect()
}

fn content(frames: &[Value]) -> String {
    frames
        .iter()
        .filter_map(|frame| frame["choices"][0]["delta"]["content"].as_str())
        .collect()
}

#[tokio::test]
async fn test_text_stream_end_to_end() {
    let upstream = format!(
        "{}data: not json\n\n{}",
        sse(&[
            json!({"p": "response/content", "v": "Hello"}),
            json!({"p": "response/elapsed_secs", "v": 1.5}),
        ]),
        sse(&[
            json!({"v": " there"}),
            json!({"p": "response/status", "v": "FINISHED"}),
            json!({"v": "after finish"}),
        ])
    );
    let mock = Mock::new(upstream);
    let (addr, server) = start_mock(mock.clone()).await;
    let state = build_state(addr, "");

    let response = dispatch_request(
        state,
        Arc::<str>::from(""),
        chat_request(&json!({"model": "deepseek-chat", "stream": true, "messages": []})),
    )
    .await
    .expect("dispatch");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    assert_eq!(response.headers()["cache-control"], "no-cache, no-transform");
    assert_eq!(response.headers()["x-accel-buffering"], "no");

    let body = read_body(response).await;
    assert!(body.ends_with("data: [DONE]\n\n"));
    let frames = decode_frames(&body);
    assert_eq!(content(&frames), "Hello there");
    assert_eq!(frames[0]["id"], "chatcmpl-mock");
    assert_eq!(frames[0]["model"], "deepseek-chat");
    assert_eq!(frames[0]["choices"][0]["delta"]["role"], "assistant");

    let last = frames.last().unwrap();
    assert_eq!(last["choices"][0]["finish_reason"], "stop");
    assert_eq!(last["usage"]["prompt_tokens"], 2);
    assert_eq!(last["usage"]["completion_tokens"], 2);
    assert_eq!(last["usage"]["total_tokens"], 4);

    assert_eq!(mock.releases(), vec!["lease-1"]);
    assert_eq!(mock.header("prepare:authorization").as_deref(), Some("Bearer client-key"));
    assert_eq!(mock.header("prepare:x-ds2-internal-token").as_deref(), Some("secret"));
    assert_eq!(mock.header("completion:authorization").as_deref(), Some("Bearer vendor-token"));
    assert_eq!(mock.header("completion:x-ds-pow-response").as_deref(), Some("pow-value"));
    assert_eq!(mock.header("completion:x-client-platform").as_deref(), Some("android"));

    server.abort();
}

#[tokio::test]
async fn test_tool_call_stream_end_to_end() {
    let upstream = sse(&[
        json!({"p": "response/content", "v": "Let me look. "}),
        json!({"p": "response/content", "v": "{\"tool_calls\":[{\"name\":\"read_file\",\"input\":{\"path\":\"REA"}),
        json!({"p": "response/content", "v": "DME.MD\"}}]}"}),
        json!({"p": "response/status", "v": "FINISHED"}),
    ]);
    let mock = Mock::new(upstream);
    let (addr, server) = start_mock(mock.clone()).await;
    let state = build_state(addr, "");

    let payload = json!({
        "model": "deepseek-chat",
        "stream": true,
        "messages": [],
        "tools": [{"type": "function", "function": {"name": "read_file", "parameters": {}}}]
    });
    let response = dispatch_request(state, Arc::<str>::from(""), chat_request(&payload))
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::OK);

    let frames = decode_frames(&read_body(response).await);
    let visible = content(&frames);
    assert_eq!(visible, "Let me look. ");

    let entries: Vec<&Value> = frames
        .iter()
        .filter_map(|frame| frame["choices"][0]["delta"]["tool_calls"].as_array())
        .flatten()
        .collect();
    assert!(entries.iter().any(|entry| entry["function"]["name"] == "read_file"));
    let arguments: String = entries
        .iter()
        .filter_map(|entry| entry["function"]["arguments"].as_str())
        .collect();
    let arguments: Value = serde_json::from_str(&arguments).expect("arguments form one JSON object");
    assert_eq!(arguments, json!({"path": "README.MD"}));
    let ids: Vec<&str> = entries.iter().filter_map(|entry| entry["id"].as_str()).collect();
    assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
    assert!(entries.iter().all(|entry| entry["index"] == 0));

    assert_eq!(frames.last().unwrap()["choices"][0]["finish_reason"], "tool_calls");
    assert_eq!(mock.releases(), vec!["lease-1"]);

    server.abort();
}

#[tokio::test]
async fn test_prepare_failure_is_relayed() {
    let mut mock = Mock::new(String::new());
    mock.prepare_status = StatusCode::UNAUTHORIZED;
    mock.prepare_body = json!({"error": {"message": "bad key", "type": "authentication_error"}});
    let (addr, server) = start_mock(mock.clone()).await;
    let state = build_state(addr, "");

    let response = dispatch_request(
        state,
        Arc::<str>::from(""),
        chat_request(&json!({"model": "m", "stream": true})),
    )
    .await
    .expect("dispatch");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = serde_json::from_str(&read_body(response).await).unwrap();
    assert_eq!(body["error"]["message"], "bad key");
    assert_eq!(mock.completion_calls.load(Ordering::SeqCst), 0);
    assert!(mock.releases().is_empty());

    server.abort();
}

#[tokio::test]
async fn test_invalid_prepare_releases_lease() {
    let mut mock = Mock::new(String::new());
    mock.prepare_body = json!({"model": "deepseek-chat", "lease_id": "lease-9", "deepseek_token": "t"});
    let (addr, server) = start_mock(mock.clone()).await;
    let state = build_state(addr, "");

    let response = dispatch_request(
        state,
        Arc::<str>::from(""),
        chat_request(&json!({"model": "m", "stream": true})),
    )
    .await
    .expect("dispatch");
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = serde_json::from_str(&read_body(response).await).unwrap();
    assert_eq!(body["error"]["type"], "api_error");
    assert_eq!(body["error"]["message"], "invalid prepare response");
    assert_eq!(mock.releases(), vec!["lease-9"]);
    assert_eq!(mock.completion_calls.load(Ordering::SeqCst), 0);

    server.abort();
}

#[tokio::test]
async fn test_vendor_error_maps_status_and_releases_lease() {
    let mut mock = Mock::new("slow down".to_string());
    mock.completion_status = StatusCode::TOO_MANY_REQUESTS;
    let (addr, server) = start_mock(mock.clone()).await;
    let state = build_state(addr, "");

    let response = dispatch_request(
        state,
        Arc::<str>::from(""),
        chat_request(&json!({"model": "m", "stream": true})),
    )
    .await
    .expect("dispatch");
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["content-type"], "application/json");
    let body: Value = serde_json::from_str(&read_body(response).await).unwrap();
    assert_eq!(body["error"]["type"], "rate_limit_error");
    assert_eq!(body["error"]["message"], "Failed to get completion: slow down");
    assert_eq!(mock.releases(), vec!["lease-1"]);

    server.abort();
}

#[tokio::test]
async fn test_request_validation_happens_before_prepare() {
    let mock = Mock::new(String::new());
    let (addr, server) = start_mock(mock.clone()).await;
    let state = build_state(addr, "");

    let response = dispatch_request(
        Arc::clone(&state),
        Arc::<str>::from(""),
        chat_request(&json!({"model": "m", "stream": false})),
    )
    .await
    .expect("dispatch");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_str(&read_body(response).await).unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");

    let response = dispatch_request(
        state,
        Arc::<str>::from(""),
        chat_request(&json!(["not", "an", "object"])),
    )
    .await
    .expect("dispatch");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(mock.prepare_calls.load(Ordering::SeqCst), 0);

    server.abort();
}

#[tokio::test]
async fn test_routes_and_body_limit() {
    let mock = Mock::new(String::new());
    let (addr, server) = start_mock(mock).await;
    let state = build_state(addr, "  body_limit_bytes: 64\n");

    let health = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = dispatch_request(Arc::clone(&state), Arc::<str>::from(""), health)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&read_body(response).await).unwrap();
    assert_eq!(body["status"], "streamsieve-rs is running");
    assert_eq!(body["config"]["internal_token_configured"], true);

    let missing = Request::builder().uri("/v1/models").body(Body::empty()).unwrap();
    let response = dispatch_request(Arc::clone(&state), Arc::<str>::from(""), missing)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let wrong_method = Request::builder()
        .uri("/v1/chat/completions")
        .body(Body::empty())
        .unwrap();
    let response = dispatch_request(Arc::clone(&state), Arc::<str>::from(""), wrong_method)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let big = json!({"model": "m", "stream": true, "padding": "x".repeat(256)});
    let response = dispatch_request(state, Arc::<str>::from(""), chat_request(&big))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    server.abort();
}
