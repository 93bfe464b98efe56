//! Telegram webhook: inbound updates pushed by the Bot API.

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{AppState, error_body};
use crate::channels::telegram::parse_update;

pub fn routes() -> Router<AppState> {
    Router::new().route("/api/telegram/webhook", post(telegram_webhook))
}

/// Answers 200 for every well-formed update, handled or not, so Telegram
/// does not redeliver it.
async fn telegram_webhook(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    if !state.bot_configured {
        return error_body(
            StatusCode::SERVICE_UNAVAILABLE,
            "Telegram bot is not configured",
        );
    }
    let update: Value = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            warn!(error = %e, "Webhook body is not valid JSON");
            return error_body(StatusCode::BAD_REQUEST, "Invalid JSON");
        }
    };

    match parse_update(&update) {
        Some(event) => state.inbound.handle(event).await,
        None => {
            let update_id = update.get("update_id").and_then(|v| v.as_i64());
            debug!(update_id, "Ignoring unsupported update");
        }
    }
    (StatusCode::OK, Json(json!({ "ok": true })))
}
