//! Cron-triggered sweeps, guarded by a shared secret.

use std::collections::HashMap;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use secrecy::ExposeSecret;
use serde_json::json;
use tracing::warn;

use super::{ApiResponse, AppState, dispatch_error, error_body};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/cron/dispatch-timeout", get(dispatch_timeout))
        .route("/api/cron/send-reminders", get(send_reminders))
}

/// Byte-wise comparison that does not stop at the first mismatch.
fn secrets_match(given: &str, expected: &str) -> bool {
    let (a, b) = (given.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Accept `Authorization: Bearer <secret>` or `?secret=<secret>`.
fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<(), ApiResponse> {
    let Some(secret) = state.cron_secret.as_ref() else {
        return Err(error_body(
            StatusCode::SERVICE_UNAVAILABLE,
            "CRON_SECRET is not configured",
        ));
    };
    let expected = secret.expose_secret();

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let from_query = query.get("secret").map(String::as_str);

    let ok = [bearer, from_query]
        .into_iter()
        .flatten()
        .any(|given| secrets_match(given, expected));
    if ok {
        Ok(())
    } else {
        warn!("Rejected cron request with a bad secret");
        Err(error_body(StatusCode::UNAUTHORIZED, "Unauthorized"))
    }
}

async fn dispatch_timeout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if let Err(denied) = authorize(&state, &headers, &query) {
        return denied;
    }
    match state.resolver.sweep_timeouts(chrono::Utc::now()).await {
        Ok(report) => (
            StatusCode::OK,
            Json(json!({
                "ok": true,
                "timed_out": report.timed_out,
                "jobs_checked": report.jobs_checked,
                "dispatched": report.dispatched,
                "no_eligible": report.no_eligible,
                "failed": report.failed,
            })),
        ),
        Err(e) => dispatch_error(&e),
    }
}

async fn send_reminders(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if let Err(denied) = authorize(&state, &headers, &query) {
        return denied;
    }
    match state.reminders.sweep_reminders(chrono::Utc::now()).await {
        Ok(report) => (
            StatusCode::OK,
            Json(json!({
                "ok": true,
                "reminders_sent": report.reminders_sent,
                "jobs_checked": report.jobs_checked,
            })),
        ),
        Err(e) => dispatch_error(&e),
    }
}
