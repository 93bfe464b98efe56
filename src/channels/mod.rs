//! Notification channels: outbound messages to cleaners and landlords, and
//! the inbound events (button presses, chat commands) coming back.

pub mod memory;
pub mod telegram;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;

use crate::error::ChannelError;

pub use memory::MemoryChannel;
pub use telegram::TelegramChannel;

/// Maximum size of an action payload on the wire (Telegram `callback_data`).
pub const MAX_ACTION_PAYLOAD_BYTES: usize = 64;

/// A button attached to an outbound message. Pressing it delivers
/// `payload` back through [`InboundEvent::Callback`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionButton {
    pub label: String,
    pub payload: String,
}

impl ActionButton {
    pub fn new(label: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            payload: payload.into(),
        }
    }
}

/// Something a user did in a chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// An action button was pressed.
    Callback {
        callback_id: String,
        /// Chat the button lives in, when the platform reports it.
        chat_id: Option<String>,
        data: String,
    },
    /// A plain text message (commands such as `/start cleaner_<id>`).
    Text { chat_id: String, text: String },
}

/// Stream of inbound events from a long-polling channel.
pub type InboundStream = Pin<Box<dyn Stream<Item = InboundEvent> + Send>>;

/// Transport used to reach cleaners and landlords.
///
/// `address` is the channel-specific chat id stored on the cleaner or
/// landlord. Every send fails loudly on transport errors.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Short identifier used in logs and errors.
    fn name(&self) -> &str;

    async fn send_text(&self, address: &str, body: &str) -> Result<(), ChannelError>;

    /// Send a message carrying two side-by-side action buttons.
    async fn send_with_two_actions(
        &self,
        address: &str,
        body: &str,
        first: &ActionButton,
        second: &ActionButton,
    ) -> Result<(), ChannelError>;

    /// Send a message with a single button that opens `url`.
    async fn send_with_link_action(
        &self,
        address: &str,
        body: &str,
        label: &str,
        url: &str,
    ) -> Result<(), ChannelError>;

    /// Acknowledge a button press, dismissing the client's loading state.
    /// `text` is shown as a toast, or as a modal alert when `alert` is set.
    async fn answer_callback(
        &self,
        callback_id: &str,
        text: Option<&str>,
        alert: bool,
    ) -> Result<(), ChannelError>;

    async fn health_check(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}
