//! Job and CRUD endpoints.

use std::collections::HashMap;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use super::{ApiResponse, AppState, dispatch_error, error_body};
use crate::error::DispatchError;
use crate::jobs::{Cleaner, JobEdit, Landlord, NewJob, Property, PropertyCleaner};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/landlords", post(create_landlord))
        .route("/api/properties", post(create_property))
        .route("/api/properties/{id}/cleaners", post(link_cleaner))
        .route("/api/cleaners", post(create_cleaner))
        .route("/api/cleaners/{id}", patch(update_cleaner))
        .route("/api/jobs", get(list_jobs).post(create_job))
        .route("/api/jobs/{id}", get(get_job).patch(edit_job).delete(delete_job))
        .route("/api/jobs/{id}/attempts", get(list_attempts))
        .route("/api/jobs/{id}/dispatch", post(dispatch_job))
        .route("/api/jobs/{id}/assign", post(assign_job))
        .route("/api/jobs/{id}/start", post(start_job))
        .route("/api/jobs/{id}/mark-done", post(mark_done))
        .route("/api/jobs/{id}/review", post(review_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/jobs/{id}/send-reminder", post(send_reminder))
}

fn parse_id(raw: &str, what: &str) -> Result<Uuid, ApiResponse> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| error_body(StatusCode::BAD_REQUEST, format!("Invalid {what} ID")))
}

fn required_name(name: &str, what: &str) -> Result<String, ApiResponse> {
    let name = name.trim();
    if name.is_empty() {
        Err(error_body(
            StatusCode::BAD_REQUEST,
            format!("{what} name is required"),
        ))
    } else {
        Ok(name.to_string())
    }
}

fn ok_json<T: serde::Serialize>(status: StatusCode, value: &T) -> ApiResponse {
    (status, Json(json!(value)))
}

// ── CRUD ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateLandlordRequest {
    name: String,
    chat_id: Option<String>,
}

async fn create_landlord(
    State(state): State<AppState>,
    Json(body): Json<CreateLandlordRequest>,
) -> impl IntoResponse {
    let name = match required_name(&body.name, "Landlord") {
        Ok(name) => name,
        Err(resp) => return resp,
    };
    let mut landlord = Landlord::new(name);
    landlord.chat_id = body.chat_id.map(|c| c.trim().to_string()).filter(|c| !c.is_empty());

    match state.db.insert_landlord(&landlord).await {
        Ok(()) => ok_json(StatusCode::CREATED, &landlord),
        Err(e) => dispatch_error(&DispatchError::from(e)),
    }
}

#[derive(Deserialize)]
struct CreatePropertyRequest {
    landlord_id: String,
    name: String,
    address: Option<String>,
}

async fn create_property(
    State(state): State<AppState>,
    Json(body): Json<CreatePropertyRequest>,
) -> impl IntoResponse {
    let landlord_id = match parse_id(&body.landlord_id, "landlord") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let name = match required_name(&body.name, "Property") {
        Ok(name) => name,
        Err(resp) => return resp,
    };
    match state.db.get_landlord(landlord_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_body(StatusCode::NOT_FOUND, "Landlord not found"),
        Err(e) => return dispatch_error(&DispatchError::from(e)),
    }

    let mut property = Property::new(landlord_id, name);
    property.address = body.address.map(|a| a.trim().to_string()).filter(|a| !a.is_empty());
    match state.db.insert_property(&property).await {
        Ok(()) => ok_json(StatusCode::CREATED, &property),
        Err(e) => dispatch_error(&DispatchError::from(e)),
    }
}

#[derive(Deserialize)]
struct CreateCleanerRequest {
    landlord_id: String,
    name: String,
    chat_id: Option<String>,
    notes: Option<String>,
    #[serde(default = "default_true")]
    active: bool,
}

fn default_true() -> bool {
    true
}

async fn create_cleaner(
    State(state): State<AppState>,
    Json(body): Json<CreateCleanerRequest>,
) -> impl IntoResponse {
    let landlord_id = match parse_id(&body.landlord_id, "landlord") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let name = match required_name(&body.name, "Cleaner") {
        Ok(name) => name,
        Err(resp) => return resp,
    };
    match state.db.get_landlord(landlord_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_body(StatusCode::NOT_FOUND, "Landlord not found"),
        Err(e) => return dispatch_error(&DispatchError::from(e)),
    }

    let mut cleaner = Cleaner::new(landlord_id, name);
    cleaner.chat_id = body.chat_id.map(|c| c.trim().to_string()).filter(|c| !c.is_empty());
    cleaner.notes = body.notes;
    cleaner.active = body.active;
    match state.db.insert_cleaner(&cleaner).await {
        Ok(()) => ok_json(StatusCode::CREATED, &cleaner),
        Err(e) => dispatch_error(&DispatchError::from(e)),
    }
}

/// Nullable text field of a partial update: absent keeps `current`, null or
/// blank clears it.
fn patched_text(body: &Value, field: &str, current: Option<String>) -> Option<String> {
    match body.get(field) {
        None => current,
        Some(Value::String(s)) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Some(_) => None,
    }
}

/// Partial update: `name`, `chat_id`, `notes`, `active`. Deactivating or
/// unlinking a cleaner takes them out of every later dispatch.
async fn update_cleaner(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let cleaner_id = match parse_id(&id, "cleaner") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let mut cleaner = match state.db.get_cleaner(cleaner_id).await {
        Ok(Some(c)) => c,
        Ok(None) => return dispatch_error(&DispatchError::CleanerNotFound { id: cleaner_id }),
        Err(e) => return dispatch_error(&DispatchError::from(e)),
    };

    if let Some(name) = body.get("name") {
        cleaner.name = match required_name(name.as_str().unwrap_or(""), "Cleaner") {
            Ok(name) => name,
            Err(resp) => return resp,
        };
    }
    match body.get("active") {
        None => {}
        Some(Value::Bool(active)) => cleaner.active = *active,
        Some(_) => return error_body(StatusCode::BAD_REQUEST, "active must be a boolean"),
    }
    cleaner.chat_id = patched_text(&body, "chat_id", cleaner.chat_id.take());
    cleaner.notes = patched_text(&body, "notes", cleaner.notes.take());

    match state.db.update_cleaner(&cleaner).await {
        Ok(true) => {
            info!(cleaner_id = %cleaner.id, active = cleaner.active, "Cleaner updated");
            ok_json(StatusCode::OK, &cleaner)
        }
        Ok(false) => dispatch_error(&DispatchError::CleanerNotFound { id: cleaner_id }),
        Err(e) => dispatch_error(&DispatchError::from(e)),
    }
}

#[derive(Deserialize)]
struct LinkCleanerRequest {
    cleaner_id: String,
    #[serde(default)]
    priority: i64,
    #[serde(default)]
    is_primary: bool,
}

async fn link_cleaner(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<LinkCleanerRequest>,
) -> impl IntoResponse {
    let (property_id, cleaner_id) = match (
        parse_id(&id, "property"),
        parse_id(&body.cleaner_id, "cleaner"),
    ) {
        (Ok(p), Ok(c)) => (p, c),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };

    let property = match state.db.get_property(property_id).await {
        Ok(Some(p)) => p,
        Ok(None) => return error_body(StatusCode::NOT_FOUND, "Property not found"),
        Err(e) => return dispatch_error(&DispatchError::from(e)),
    };
    match state.db.get_cleaner(cleaner_id).await {
        Ok(Some(c)) if c.landlord_id == property.landlord_id => {}
        Ok(_) => return dispatch_error(&DispatchError::CleanerNotFound { id: cleaner_id }),
        Err(e) => return dispatch_error(&DispatchError::from(e)),
    }

    let link = PropertyCleaner {
        property_id,
        cleaner_id,
        priority: body.priority,
        is_primary: body.is_primary,
    };
    match state.db.link_property_cleaner(&link).await {
        Ok(()) => ok_json(StatusCode::OK, &link),
        Err(e) => dispatch_error(&DispatchError::from(e)),
    }
}

// ── Jobs ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateJobRequest {
    landlord_id: String,
    property_id: String,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    booking_ref: Option<String>,
    #[serde(default)]
    auto_dispatch: bool,
}

async fn create_job(
    State(state): State<AppState>,
    Json(body): Json<CreateJobRequest>,
) -> impl IntoResponse {
    let (landlord_id, property_id) = match (
        parse_id(&body.landlord_id, "landlord"),
        parse_id(&body.property_id, "property"),
    ) {
        (Ok(l), Ok(p)) => (l, p),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };

    let input = NewJob {
        landlord_id,
        property_id,
        window_start: body.window_start,
        window_end: body.window_end,
        booking_ref: body.booking_ref,
        auto_dispatch: body.auto_dispatch,
    };
    match state.lifecycle.create_job(input).await {
        Ok(created) => ok_json(StatusCode::CREATED, &created),
        Err(e) => dispatch_error(&e),
    }
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(raw) = query.get("landlord_id") else {
        return error_body(StatusCode::BAD_REQUEST, "landlord_id is required");
    };
    let landlord_id = match parse_id(raw, "landlord") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.db.list_jobs_by_landlord(landlord_id).await {
        Ok(jobs) => ok_json(StatusCode::OK, &jobs),
        Err(e) => dispatch_error(&DispatchError::from(e)),
    }
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let job_id = match parse_id(&id, "job") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.db.get_job(job_id).await {
        Ok(Some(job)) => ok_json(StatusCode::OK, &job),
        Ok(None) => dispatch_error(&DispatchError::JobNotFound { id: job_id }),
        Err(e) => dispatch_error(&DispatchError::from(e)),
    }
}

#[derive(Deserialize)]
struct EditJobRequest {
    window_start: Option<DateTime<Utc>>,
    window_end: Option<DateTime<Utc>>,
    booking_ref: Option<String>,
}

/// Window and booking reference only; status moves through the dedicated
/// endpoints.
async fn edit_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<EditJobRequest>,
) -> impl IntoResponse {
    let job_id = match parse_id(&id, "job") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let edit = JobEdit {
        window_start: body.window_start,
        window_end: body.window_end,
        booking_ref: body.booking_ref,
    };
    match state.lifecycle.edit(job_id, edit).await {
        Ok(job) => ok_json(StatusCode::OK, &job),
        Err(e) => dispatch_error(&e),
    }
}

async fn delete_job(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let job_id = match parse_id(&id, "job") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.lifecycle.delete(job_id).await {
        Ok(_) => (StatusCode::OK, Json(json!({ "ok": true }))),
        Err(e) => dispatch_error(&e),
    }
}

async fn list_attempts(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let job_id = match parse_id(&id, "job") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.db.get_job(job_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return dispatch_error(&DispatchError::JobNotFound { id: job_id }),
        Err(e) => return dispatch_error(&DispatchError::from(e)),
    }
    match state.db.list_attempts_for_job(job_id).await {
        Ok(attempts) => ok_json(StatusCode::OK, &attempts),
        Err(e) => dispatch_error(&DispatchError::from(e)),
    }
}

/// Manual (re)dispatch. Running out of cleaners is a 200 with
/// `"outcome": "no_eligible_cleaner"`.
async fn dispatch_job(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let job_id = match parse_id(&id, "job") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.dispatcher.dispatch(job_id).await {
        Ok(outcome) => {
            info!(%job_id, "Manual dispatch");
            ok_json(StatusCode::OK, &outcome)
        }
        Err(e) => dispatch_error(&e),
    }
}

#[derive(Deserialize)]
struct CleanerRequest {
    cleaner_id: String,
}

async fn assign_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CleanerRequest>,
) -> impl IntoResponse {
    let (job_id, cleaner_id) = match (parse_id(&id, "job"), parse_id(&body.cleaner_id, "cleaner")) {
        (Ok(j), Ok(c)) => (j, c),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };
    match state.lifecycle.assign(job_id, cleaner_id).await {
        Ok(job) => ok_json(StatusCode::OK, &job),
        Err(e) => dispatch_error(&e),
    }
}

async fn start_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CleanerRequest>,
) -> impl IntoResponse {
    let (job_id, cleaner_id) = match (parse_id(&id, "job"), parse_id(&body.cleaner_id, "cleaner")) {
        (Ok(j), Ok(c)) => (j, c),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };
    match state.lifecycle.start(job_id, cleaner_id).await {
        Ok(job) => ok_json(StatusCode::OK, &job),
        Err(e) => dispatch_error(&e),
    }
}

async fn mark_done(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CleanerRequest>,
) -> impl IntoResponse {
    let (job_id, cleaner_id) = match (parse_id(&id, "job"), parse_id(&body.cleaner_id, "cleaner")) {
        (Ok(j), Ok(c)) => (j, c),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };
    match state.lifecycle.mark_done(job_id, cleaner_id).await {
        Ok(job) => ok_json(StatusCode::OK, &job),
        Err(e) => dispatch_error(&e),
    }
}

#[derive(Deserialize)]
struct ReviewRequest {
    rating: i64,
    #[serde(default)]
    tags: Vec<String>,
    comment: Option<String>,
}

async fn review_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReviewRequest>,
) -> impl IntoResponse {
    let job_id = match parse_id(&id, "job") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state
        .lifecycle
        .review(job_id, body.rating, &body.tags, body.comment.as_deref())
        .await
    {
        Ok(review) => ok_json(StatusCode::OK, &review),
        Err(e) => dispatch_error(&e),
    }
}

async fn cancel_job(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let job_id = match parse_id(&id, "job") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.lifecycle.cancel(job_id).await {
        Ok(job) => ok_json(StatusCode::OK, &job),
        Err(e) => dispatch_error(&e),
    }
}

async fn send_reminder(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let job_id = match parse_id(&id, "job") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.lifecycle.send_reminder(job_id).await {
        Ok(job) => (
            StatusCode::OK,
            Json(json!({ "ok": true, "message": "Reminder sent", "job": job })),
        ),
        Err(e) => dispatch_error(&e),
    }
}
