//! Telegram channel: Bot API client for offers, replies and callbacks.
//!
//! Outbound messages use HTML parse mode and inline keyboards. Inbound
//! updates arrive either through the webhook route or through the
//! `getUpdates` long-poll loop in [`TelegramChannel::listen`]; both are
//! normalized by [`parse_update`].

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use crate::channels::{
    ActionButton, InboundEvent, InboundStream, MAX_ACTION_PAYLOAD_BYTES, NotificationChannel,
};
use crate::error::ChannelError;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Long-poll timeout passed to `getUpdates`, in seconds.
const POLL_TIMEOUT_SECS: u64 = 30;

/// Telegram Bot API channel.
pub struct TelegramChannel {
    bot_token: SecretString,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            api_base: DEFAULT_API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Point the client at another Bot API server (self-hosted or a test double).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    fn send_error(reason: impl Into<String>) -> ChannelError {
        ChannelError::SendFailed {
            name: "telegram".into(),
            reason: reason.into(),
        }
    }

    /// POST a Bot API method and return its `result` field.
    async fn call(&self, method: &str, body: &Value) -> Result<Value, ChannelError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| Self::send_error(format!("{method}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let err = resp.text().await.unwrap_or_default();
            tracing::warn!(method, %status, "Telegram API call failed");
            return Err(Self::send_error(format!("{method} returned {status}: {err}")));
        }

        let data: Value = resp
            .json()
            .await
            .map_err(|e| ChannelError::Http(format!("{method} response: {e}")))?;
        if data.get("ok").and_then(Value::as_bool) != Some(true) {
            let description = data
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(Self::send_error(format!("{method}: {description}")));
        }
        Ok(data.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        reply_markup: Option<Value>,
    ) -> Result<(), ChannelError> {
        let chat_id = chat_id.trim();
        if chat_id.is_empty() {
            return Err(ChannelError::InvalidMessage("empty chat id".into()));
        }

        let mut body = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
        });
        if let Some(markup) = reply_markup {
            body["reply_markup"] = markup;
        }

        self.call("sendMessage", &body).await?;
        tracing::debug!(chat_id, "Telegram message sent");
        Ok(())
    }

    /// Register `url` as the webhook for inbound updates.
    pub async fn set_webhook(&self, url: &str) -> Result<(), ChannelError> {
        self.call(
            "setWebhook",
            &json!({ "url": url, "allowed_updates": ["message", "callback_query"] }),
        )
        .await
        .map_err(|e| ChannelError::StartupFailed {
            name: "telegram".into(),
            reason: e.to_string(),
        })?;
        tracing::info!(url, "Telegram webhook registered");
        Ok(())
    }

    /// Remove any webhook so `getUpdates` can be used.
    pub async fn delete_webhook(&self) -> Result<(), ChannelError> {
        self.call("deleteWebhook", &json!({}))
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    /// Start the `getUpdates` long-poll loop and return the inbound events.
    pub fn listen(&self) -> InboundStream {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let url = self.api_url("getUpdates");
        let client = self.client.clone();

        tokio::spawn(async move {
            let mut offset: i64 = 0;

            tracing::info!("Telegram channel listening for updates...");

            loop {
                let body = json!({
                    "offset": offset,
                    "timeout": POLL_TIMEOUT_SECS,
                    "allowed_updates": ["message", "callback_query"]
                });

                let resp = match client.post(&url).json(&body).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Telegram poll error: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let data: Value = match resp.json().await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!("Telegram parse error: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let Some(results) = data.get("result").and_then(Value::as_array) else {
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    continue;
                };

                for update in results {
                    if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                        offset = uid + 1;
                    }
                    let Some(event) = parse_update(update) else {
                        continue;
                    };
                    if tx.send(event).is_err() {
                        tracing::info!("Telegram listener channel closed");
                        return;
                    }
                }
            }
        });

        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        }))
    }
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send_text(&self, address: &str, body: &str) -> Result<(), ChannelError> {
        self.send_message(address, body, None).await
    }

    async fn send_with_two_actions(
        &self,
        address: &str,
        body: &str,
        first: &ActionButton,
        second: &ActionButton,
    ) -> Result<(), ChannelError> {
        for action in [first, second] {
            if action.payload.len() > MAX_ACTION_PAYLOAD_BYTES {
                return Err(ChannelError::InvalidMessage(format!(
                    "callback_data is {} bytes, limit is {MAX_ACTION_PAYLOAD_BYTES}",
                    action.payload.len()
                )));
            }
        }
        let markup = json!({
            "inline_keyboard": [[
                { "text": first.label, "callback_data": first.payload },
                { "text": second.label, "callback_data": second.payload },
            ]]
        });
        self.send_message(address, body, Some(markup)).await
    }

    async fn send_with_link_action(
        &self,
        address: &str,
        body: &str,
        label: &str,
        url: &str,
    ) -> Result<(), ChannelError> {
        let markup = json!({ "inline_keyboard": [[{ "text": label, "url": url }]] });
        self.send_message(address, body, Some(markup)).await
    }

    async fn answer_callback(
        &self,
        callback_id: &str,
        text: Option<&str>,
        alert: bool,
    ) -> Result<(), ChannelError> {
        let mut body = json!({
            "callback_query_id": callback_id,
            "show_alert": alert,
        });
        if let Some(text) = text {
            body["text"] = Value::String(text.to_string());
        }
        self.call("answerCallbackQuery", &body).await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: format!("getMe returned {}", resp.status()),
            })
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Normalize a Bot API update into an [`InboundEvent`].
///
/// Returns `None` for update kinds we do not handle (edits, stickers,
/// callbacks without data, ...).
pub fn parse_update(update: &Value) -> Option<InboundEvent> {
    if let Some(query) = update.get("callback_query") {
        let callback_id = query.get("id").and_then(Value::as_str)?;
        let data = query.get("data").and_then(Value::as_str)?;
        let chat_id = query
            .get("message")
            .and_then(|m| m.get("chat"))
            .and_then(|c| c.get("id"))
            .and_then(Value::as_i64)
            .map(|id| id.to_string());
        return Some(InboundEvent::Callback {
            callback_id: callback_id.to_string(),
            chat_id,
            data: data.trim().to_string(),
        });
    }

    let message = update.get("message")?;
    let chat_id = message
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(Value::as_i64)?;
    let text = message.get("text").and_then(Value::as_str)?;
    Some(InboundEvent::Text {
        chat_id: chat_id.to_string(),
        text: text.trim().to_string(),
    })
}

// ── Tests ───────────────────────────────────────────────────────────
