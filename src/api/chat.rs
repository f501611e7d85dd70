use std::sync::Arc;

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use super::prepare::{relay_prepare_failure, PreparedStream};
use crate::error::GatewayError;
use crate::session::{SessionOptions, StreamSession};
use crate::state::AppState;
use crate::stream::upstream_frame_stream;
use crate::util::unix_now_secs;

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// `POST /v1/chat/completions`.
pub async fn handler(state: Arc<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    match handler_inner(state, headers, body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handler_inner(state: Arc<AppState>, headers: HeaderMap, body: Bytes) -> Result<Response, GatewayError> {
    let client_payload: Value = serde_json::from_slice(&body)
        .ok()
        .filter(Value::is_object)
        .ok_or_else(|| GatewayError::InvalidRequest("Request body must be a JSON object".into()))?;
    if client_payload.get("stream") != Some(&Value::Bool(true)) {
        return Err(GatewayError::InvalidRequest(
            "only streaming chat completions are supported".into(),
        ));
    }

    let reply = state.transport.prepare(&headers, body).await?;
    if !reply.is_success() {
        debug!(status = reply.status.as_u16(), "prepare refused request");
        return Ok(relay_prepare_failure(&reply));
    }
    let reply_json: Value = serde_json::from_slice(&reply.body).unwrap_or(Value::Null);

    let prepared = match PreparedStream::from_json(&reply_json, &client_payload, &state.config.features) {
        Ok(prepared) => prepared,
        Err(invalid) => {
            warn!(missing = invalid.missing, "invalid prepare response");
            state.lease_guard(invalid.lease_id).release().await;
            return Err(GatewayError::Prepare {
                status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                message: "invalid prepare response".into(),
            });
        }
    };

    let mut lease = state.lease_guard(Some(prepared.lease_id.clone()));
    let upstream = match state
        .transport
        .open_completion(&prepared.vendor_token, &prepared.pow_header, &prepared.payload)
        .await
    {
        Ok(response) => response,
        Err(err) => {
            warn!(session_id = %prepared.session_id, error = %err, "vendor completion failed");
            lease.release().await;
            return Err(err);
        }
    };

    let options = SessionOptions {
        session_id: prepared.session_id,
        model: prepared.model,
        prompt: prepared.final_prompt,
        thinking_enabled: prepared.thinking_enabled,
        search_enabled: prepared.search_enabled,
        tool_names: prepared.tool_names,
        emit_early_tool_deltas: prepared.emit_early_tool_deltas,
        final_text_fallback: state.config.features.final_text_fallback,
        sieve_limits: state.config.sieve.limits(),
        created: unix_now_secs(),
    };
    let session = StreamSession::new(options, Arc::clone(&state.skip_paths), lease);
    let frames = upstream_frame_stream(upstream.bytes_stream());
    Ok(sse_ok_response(Body::from_stream(session.into_sse_stream(frames))))
}

fn sse_ok_response(body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache, no-transform"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(X_ACCEL_BUFFERING, HeaderValue::from_static("no"));
    response
}
