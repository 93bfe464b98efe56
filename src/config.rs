//! Configuration types.

use std::path::PathBuf;

use secrecy::SecretString;

/// Offer response window used when `RESPONSE_MINUTES` is unset or invalid.
pub const DEFAULT_RESPONSE_MINUTES: i64 = 10;

/// How inbound Telegram updates reach the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelegramMode {
    /// Telegram POSTs updates to `/api/telegram/webhook`.
    Webhook,
    /// The service long-polls `getUpdates`.
    Poll,
}

impl TelegramMode {
    fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "poll" | "polling" | "long-poll" => Self::Poll,
            _ => Self::Webhook,
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// HTTP listen port.
    pub port: u16,
    /// How long a cleaner has to answer an offer before the sweep may move on.
    pub response_minutes: i64,
    /// Shared secret for the cron endpoints. Unset disables them.
    pub cron_secret: Option<SecretString>,
    /// Bot token. Unset means offers go to the in-memory channel.
    pub telegram_bot_token: Option<SecretString>,
    pub telegram_mode: TelegramMode,
    /// Base URL of the dashboard, used for link buttons and the webhook.
    pub public_base_url: Option<String>,
    /// In-process sweep interval. 0 disables the ticker.
    pub sweep_interval_secs: u64,
    /// Reminder look-ahead.
    pub reminder_hours_ahead: i64,
    /// Directory for daily rolling log files. Unset logs to stderr only.
    pub log_dir: Option<PathBuf>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/cleaner-dispatch.db"),
            port: 8080,
            response_minutes: DEFAULT_RESPONSE_MINUTES,
            cron_secret: None,
            telegram_bot_token: None,
            telegram_mode: TelegramMode::Webhook,
            public_base_url: None,
            sweep_interval_secs: 0,
            reminder_hours_ahead: 24,
            log_dir: None,
        }
    }
}

impl DispatchConfig {
    /// Build from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        Self {
            db_path: get("DISPATCH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            port: get("DISPATCH_PORT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            response_minutes: parse_response_minutes(get("RESPONSE_MINUTES").as_deref()),
            cron_secret: get("CRON_SECRET").map(SecretString::from),
            telegram_bot_token: get("TELEGRAM_BOT_TOKEN").map(SecretString::from),
            telegram_mode: get("TELEGRAM_MODE")
                .map(|s| TelegramMode::parse(&s))
                .unwrap_or(defaults.telegram_mode),
            public_base_url: get("PUBLIC_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string()),
            sweep_interval_secs: get("SWEEP_INTERVAL_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.sweep_interval_secs),
            reminder_hours_ahead: get("REMINDER_HOURS_AHEAD")
                .and_then(|s| s.parse::<i64>().ok())
                .filter(|h| *h > 0)
                .unwrap_or(defaults.reminder_hours_ahead),
            log_dir: get("DISPATCH_LOG_DIR").map(PathBuf::from),
        }
    }

    pub fn response_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.response_minutes)
    }
}

/// Non-positive or unparseable values fall back to the default window.
pub fn parse_response_minutes(raw: Option<&str>) -> i64 {
    raw.and_then(|s| s.trim().parse::<i64>().ok())
        .filter(|m| *m > 0)
        .unwrap_or(DEFAULT_RESPONSE_MINUTES)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> DispatchConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DispatchConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = config(&[]);
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.response_minutes, 10);
        assert!(cfg.cron_secret.is_none());
        assert!(cfg.telegram_bot_token.is_none());
        assert_eq!(cfg.telegram_mode, TelegramMode::Webhook);
        assert_eq!(cfg.sweep_interval_secs, 0);
        assert_eq!(cfg.reminder_hours_ahead, 24);
    }

    #[test]
    fn response_minutes_fallbacks() {
        assert_eq!(parse_response_minutes(Some("15")), 15);
        assert_eq!(parse_response_minutes(Some("0")), 10);
        assert_eq!(parse_response_minutes(Some("-5")), 10);
        assert_eq!(parse_response_minutes(Some("soon")), 10);
        assert_eq!(parse_response_minutes(None), 10);
    }

    #[test]
    fn reads_values_and_ignores_blanks() {
        let cfg = config(&[
            ("DISPATCH_PORT", "9090"),
            ("CRON_SECRET", " s3cret "),
            ("TELEGRAM_BOT_TOKEN", "   "),
            ("TELEGRAM_MODE", "Poll"),
            ("PUBLIC_BASE_URL", "https://dispatch.example/"),
            ("SWEEP_INTERVAL_SECS", "60"),
        ]);
        assert_eq!(cfg.port, 9090);
        assert_eq!(cfg.cron_secret.unwrap().expose_secret(), "s3cret");
        assert!(cfg.telegram_bot_token.is_none());
        assert_eq!(cfg.telegram_mode, TelegramMode::Poll);
        assert_eq!(cfg.public_base_url.as_deref(), Some("https://dispatch.example"));
        assert_eq!(cfg.sweep_interval_secs, 60);
    }
}
