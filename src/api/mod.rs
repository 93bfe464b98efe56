//! HTTP surface: health, cron sweeps, the Telegram webhook and the job /
//! CRUD endpoints used by the dashboard.

pub mod cron;
pub mod routes;
pub mod webhook;

use std::sync::Arc;

use axum::{Json, Router, http::StatusCode, routing::get};
use secrecy::SecretString;
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::channels::NotificationChannel;
use crate::config::DispatchConfig;
use crate::dispatch::{Dispatcher, EligibilityResolver, Notifier, OfferManager, ResponseResolver};
use crate::error::{DatabaseError, DispatchError};
use crate::inbound::InboundHandler;
use crate::jobs::{JobLifecycle, ReminderSweep};
use crate::store::Database;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub dispatcher: Dispatcher,
    pub resolver: ResponseResolver,
    pub lifecycle: JobLifecycle,
    pub reminders: ReminderSweep,
    pub inbound: InboundHandler,
    /// Shared secret for the cron endpoints (None disables them).
    pub cron_secret: Option<SecretString>,
    /// Whether a real bot sits behind `channel`; the webhook refuses
    /// updates otherwise.
    pub bot_configured: bool,
}

impl AppState {
    /// Wire the dispatch engine together over one store and one channel.
    pub fn new(
        db: Arc<dyn Database>,
        channel: Arc<dyn NotificationChannel>,
        config: &DispatchConfig,
    ) -> Self {
        let offers = OfferManager::new(db.clone(), channel.clone(), config.response_minutes);
        let dispatcher = Dispatcher::new(db.clone(), EligibilityResolver::new(db.clone()), offers);
        let notifier = Notifier::new(db.clone(), channel.clone(), config.public_base_url.clone());
        let resolver = ResponseResolver::new(
            db.clone(),
            dispatcher.clone(),
            notifier.clone(),
            config.response_window(),
        );
        let lifecycle = JobLifecycle::new(db.clone(), dispatcher.clone(), notifier.clone());
        let reminders = ReminderSweep::new(db.clone(), notifier, config.reminder_hours_ahead);
        let inbound = InboundHandler::new(db.clone(), channel, resolver.clone());

        Self {
            db,
            dispatcher,
            resolver,
            lifecycle,
            reminders,
            inbound,
            cron_secret: config.cron_secret.clone(),
            bot_configured: config.telegram_bot_token.is_some(),
        }
    }
}

/// Build the full router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .merge(cron::routes())
        .merge(webhook::routes())
        .merge(routes::routes())
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "cleaner-dispatch"
    }))
}

pub(crate) type ApiResponse = (StatusCode, Json<Value>);

pub(crate) fn error_body(status: StatusCode, message: impl Into<String>) -> ApiResponse {
    (status, Json(json!({ "error": message.into() })))
}

/// Map a dispatch error onto an HTTP status.
pub(crate) fn dispatch_error(err: &DispatchError) -> ApiResponse {
    let status = match err {
        DispatchError::JobNotFound { .. } | DispatchError::CleanerNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        DispatchError::InvalidJobState { .. }
        | DispatchError::NotAssigned { .. }
        | DispatchError::Validation(_) => StatusCode::BAD_REQUEST,
        DispatchError::Channel(_) => StatusCode::BAD_GATEWAY,
        DispatchError::Database(DatabaseError::Constraint(_)) => StatusCode::CONFLICT,
        DispatchError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %err, "Request failed");
    }
    error_body(status, err.to_string())
}

/// Run both sweeps every `interval_secs` seconds.
pub fn spawn_sweeper(state: AppState, interval_secs: u64) -> tokio::task::JoinHandle<()> {
    info!(interval_secs, "In-process sweeper started");
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            let now = chrono::Utc::now();
            if let Err(e) = state.resolver.sweep_timeouts(now).await {
                warn!(error = %e, "Timeout sweep failed");
            }
            if let Err(e) = state.reminders.sweep_reminders(now).await {
                warn!(error = %e, "Reminder sweep failed");
            }
        }
    })
}
