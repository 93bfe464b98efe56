use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use cleaner_dispatch::api::{self, AppState};
use cleaner_dispatch::channels::{MemoryChannel, NotificationChannel, TelegramChannel};
use cleaner_dispatch::config::{DispatchConfig, TelegramMode};
use cleaner_dispatch::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DispatchConfig::from_env();

    // Initialize tracing; keep the guard alive so buffered file logs flush.
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "cleaner-dispatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    eprintln!("🧹 Cleaner Dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Response window: {} min", config.response_minutes);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Channel ──────────────────────────────────────────────────────────
    let telegram = config
        .telegram_bot_token
        .clone()
        .map(|token| Arc::new(TelegramChannel::new(token)));
    let channel: Arc<dyn NotificationChannel> = match &telegram {
        Some(tg) => {
            if let Err(e) = tg.health_check().await {
                tracing::warn!(error = %e, "Telegram health check failed");
            }
            tg.clone() as Arc<dyn NotificationChannel>
        }
        None => {
            eprintln!("   Telegram: not configured, messages are kept in memory");
            Arc::new(MemoryChannel::new())
        }
    };

    let state = AppState::new(Arc::clone(&db), channel, &config);

    if let Some(tg) = &telegram {
        match config.telegram_mode {
            TelegramMode::Poll => {
                tg.delete_webhook()
                    .await
                    .context("Failed to remove Telegram webhook before polling")?;
                tokio::spawn(state.inbound.clone().run(tg.listen()));
                eprintln!("   Telegram: long-polling");
            }
            TelegramMode::Webhook => match &config.public_base_url {
                Some(base) => {
                    let url = format!("{base}/api/telegram/webhook");
                    if let Err(e) = tg.set_webhook(&url).await {
                        tracing::warn!(error = %e, "Failed to register Telegram webhook");
                    }
                    eprintln!("   Telegram: webhook at {url}");
                }
                None => eprintln!("   Telegram: webhook (register it manually, PUBLIC_BASE_URL unset)"),
            },
        }
    }

    if config.cron_secret.is_none() {
        eprintln!("   Cron: CRON_SECRET unset, sweep endpoints disabled");
    }
    let _sweeper = (config.sweep_interval_secs > 0)
        .then(|| api::spawn_sweeper(state.clone(), config.sweep_interval_secs));

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "HTTP server started");
    eprintln!("   HTTP: http://0.0.0.0:{}", config.port);

    axum::serve(listener, app).await.context("HTTP server failed")?;
    Ok(())
}
