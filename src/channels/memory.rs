//! In-process channel that records everything it is asked to send.
//!
//! Used when no bot token is configured and by the tests. Addresses can be
//! marked as failing to exercise transport-error paths.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::channels::{ActionButton, NotificationChannel};
use crate::error::ChannelError;

/// One recorded outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub address: String,
    pub body: String,
    pub actions: Vec<ActionButton>,
    /// `(label, url)` of a link action, if any.
    pub link: Option<(String, String)>,
}

/// One recorded callback acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackAnswer {
    pub callback_id: String,
    pub text: Option<String>,
    pub alert: bool,
}

#[derive(Default)]
pub struct MemoryChannel {
    sent: Mutex<Vec<SentMessage>>,
    answers: Mutex<Vec<CallbackAnswer>>,
    failing: Mutex<HashSet<String>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every send to `address` fail until [`MemoryChannel::heal`].
    pub async fn fail_address(&self, address: &str) {
        self.failing.lock().await.insert(address.to_string());
    }

    pub async fn heal(&self, address: &str) {
        self.failing.lock().await.remove(address);
    }

    pub async fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_to(&self, address: &str) -> Vec<SentMessage> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|m| m.address == address)
            .cloned()
            .collect()
    }

    pub async fn answers(&self) -> Vec<CallbackAnswer> {
        self.answers.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.sent.lock().await.clear();
        self.answers.lock().await.clear();
    }

    async fn record(&self, message: SentMessage) -> Result<(), ChannelError> {
        if self.failing.lock().await.contains(&message.address) {
            return Err(ChannelError::SendFailed {
                name: "memory".into(),
                reason: format!("address {} is marked as failing", message.address),
            });
        }
        tracing::debug!(address = %message.address, "Memory channel message recorded");
        self.sent.lock().await.push(message);
        Ok(())
    }
}

#[async_trait]
impl NotificationChannel for MemoryChannel {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send_text(&self, address: &str, body: &str) -> Result<(), ChannelError> {
        self.record(SentMessage {
            address: address.to_string(),
            body: body.to_string(),
            actions: Vec::new(),
            link: None,
        })
        .await
    }

    async fn send_with_two_actions(
        &self,
        address: &str,
        body: &str,
        first: &ActionButton,
        second: &ActionButton,
    ) -> Result<(), ChannelError> {
        self.record(SentMessage {
            address: address.to_string(),
            body: body.to_string(),
            actions: vec![first.clone(), second.clone()],
            link: None,
        })
        .await
    }

    async fn send_with_link_action(
        &self,
        address: &str,
        body: &str,
        label: &str,
        url: &str,
    ) -> Result<(), ChannelError> {
        self.record(SentMessage {
            address: address.to_string(),
            body: body.to_string(),
            actions: Vec::new(),
            link: Some((label.to_string(), url.to_string())),
        })
        .await
    }

    async fn answer_callback(
        &self,
        callback_id: &str,
        text: Option<&str>,
        alert: bool,
    ) -> Result<(), ChannelError> {
        self.answers.lock().await.push(CallbackAnswer {
            callback_id: callback_id.to_string(),
            text: text.map(String::from),
            alert,
        });
        Ok(())
    }
}
