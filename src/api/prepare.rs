//! Prepare-step contract.
//!
//! The collaborator authenticates the client, leases a vendor account and
//! assembles the vendor payload. Its JSON answer is decoded into a
//! [`PreparedStream`]; missing mandatory fields abort the request.

use axum::response::{IntoResponse, Response};
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use serde_json::{Map, Value};

use crate::config::FeaturesConfig;
use crate::error::error_response;
use crate::sieve::tool_names_from_request;
use crate::transport::PrepareReply;
use crate::util::fallback_session_id;

/// Validated prepare answer.
#[derive(Debug, Clone)]
pub struct PreparedStream {
    pub model: String,
    pub session_id: String,
    pub lease_id: String,
    pub vendor_token: String,
    pub pow_header: String,
    pub payload: Value,
    pub final_prompt: String,
    pub thinking_enabled: bool,
    pub search_enabled: bool,
    /// Empty when the sieve is disabled for this request.
    pub tool_names: Vec<String>,
    pub emit_early_tool_deltas: bool,
}

/// The prepare answer lacked a mandatory field. Carries the lease id when one
/// was issued so the caller can still give it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidPrepare {
    pub lease_id: Option<String>,
    pub missing: &'static str,
}

impl PreparedStream {
    /// Decode the collaborator's answer for a client request.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidPrepare`] naming the first mandatory field that is
    /// missing or blank (`model`, `lease_id`, `deepseek_token`, `pow_header`,
    /// or an object-valued `payload`).
    pub fn from_json(
        reply: &Value,
        client_payload: &Value,
        features: &FeaturesConfig,
    ) -> Result<Self, InvalidPrepare> {
        let empty = Map::new();
        let body = reply.as_object().unwrap_or(&empty);

        let lease_id = as_string(body.get("lease_id"));
        let invalid = |missing: &'static str| InvalidPrepare {
            lease_id: (!lease_id.is_empty()).then(|| lease_id.clone()),
            missing,
        };

        let mut model = as_string(body.get("model"));
        if model.is_empty() {
            model = as_string(client_payload.get("model"));
        }
        if model.is_empty() {
            return Err(invalid("model"));
        }
        if lease_id.is_empty() {
            return Err(invalid("lease_id"));
        }
        let vendor_token = as_string(body.get("deepseek_token"));
        if vendor_token.is_empty() {
            return Err(invalid("deepseek_token"));
        }
        let pow_header = as_string(body.get("pow_header"));
        if pow_header.is_empty() {
            return Err(invalid("pow_header"));
        }
        let Some(payload) = body.get("payload").filter(|value| value.is_object()) else {
            return Err(invalid("payload"));
        };

        let mut session_id = as_string(body.get("session_id"));
        if session_id.is_empty() {
            session_id = fallback_session_id();
        }

        Ok(Self {
            model,
            session_id,
            vendor_token,
            pow_header,
            payload: payload.clone(),
            final_prompt: as_string(body.get("final_prompt")),
            thinking_enabled: body.get("thinking_enabled") == Some(&Value::Bool(true)),
            search_enabled: body.get("search_enabled") == Some(&Value::Bool(true)),
            tool_names: resolve_tool_names(body, client_payload),
            emit_early_tool_deltas: body
                .get("toolcall_early_emit_high")
                .and_then(Value::as_bool)
                .unwrap_or(features.emit_early_tool_deltas),
            lease_id,
        })
    }
}

/// Tool names the sieve filters against. Explicit `tool_names` from the
/// collaborator win over the client's `tools`; `toolcall_feature_match:
/// false` turns the sieve off.
fn resolve_tool_names(body: &Map<String, Value>, client_payload: &Value) -> Vec<String> {
    if body.get("toolcall_feature_match").and_then(Value::as_bool) == Some(false) {
        return Vec::new();
    }
    let explicit: Vec<String> = body
        .get("tool_names")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect();
    if !explicit.is_empty() {
        return explicit;
    }
    tool_names_from_request(client_payload.get("tools"))
}

/// Loose string coercion: strings are trimmed, numbers and booleans are
/// rendered, a list yields its first element.
fn as_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(text)) => text.trim().to_owned(),
        Some(Value::Number(number)) => number.to_string(),
        Some(Value::Bool(flag)) => flag.to_string(),
        Some(Value::Array(items)) => as_string(items.first()),
        _ => String::new(),
    }
}

/// Relay a non-2xx prepare answer. JSON bodies pass through untouched with
/// the collaborator's status; anything else becomes an OpenAI error.
pub(crate) fn relay_prepare_failure(reply: &PrepareReply) -> Response {
    let status = if reply.status.is_success() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        reply.status
    };
    if serde_json::from_slice::<Value>(&reply.body).is_ok() {
        let content_type = reply
            .content_type
            .clone()
            .unwrap_or_else(|| HeaderValue::from_static("application/json"));
        return (status, [(CONTENT_TYPE, content_type)], reply.body.clone()).into_response();
    }
    let detail = String::from_utf8_lossy(&reply.body);
    let detail = detail.trim();
    let message = if detail.is_empty() { "prepare failed" } else { detail };
    error_response(status, message)
}
