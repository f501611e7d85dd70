use std::sync::Arc;

use axum::response::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// Health check handler.
/// Returns JSON with status and config summary; secrets are never echoed.
pub fn health_handler(state: &Arc<AppState>) -> Json<Value> {
    let config = &state.config;
    Json(json!({
        "status": "streamsieve-rs is running",
        "config": {
            "vendor_completion_url": config.vendor.completion_url,
            "internal_token_configured": config.prepare.internal_token.is_some(),
            "sieve": {
                "capture_limit_bytes": config.sieve.capture_limit_bytes,
                "hold_window_chars": config.sieve.hold_window_chars,
                "context_tail_chars": config.sieve.context_tail_chars,
            },
            "features": {
                "log_level": config.features.log_level,
                "log_format": config.features.log_format,
                "emit_early_tool_deltas": config.features.emit_early_tool_deltas,
                "final_text_fallback": config.features.final_text_fallback,
            }
        }
    }))
}
