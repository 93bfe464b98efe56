//! Single entry point for everything users send back through a chat:
//! offer button presses and `/start` linking commands.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channels::{InboundEvent, InboundStream, NotificationChannel};
use crate::dispatch::token::parse_action_payload;
use crate::dispatch::{ResponseResolver, messages};
use crate::error::DispatchError;
use crate::store::Database;

const CLEANER_PREFIX: &str = "cleaner_";
const LANDLORD_PREFIX: &str = "landlord_";

/// What a `/start` command asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkRequest {
    Cleaner(String),
    Landlord(String),
    /// `/start` with no payload or one we don't recognise.
    Unknown,
}

fn parse_start(text: &str) -> Option<LinkRequest> {
    let mut parts = text.split_whitespace();
    let command = parts.next()?;
    // Telegram appends the bot name in group chats: `/start@SomeBot`.
    if command != "/start" && !command.starts_with("/start@") {
        return None;
    }
    let payload = parts.next().unwrap_or_default();
    Some(if let Some(id) = payload.strip_prefix(CLEANER_PREFIX) {
        LinkRequest::Cleaner(id.to_string())
    } else if let Some(id) = payload.strip_prefix(LANDLORD_PREFIX) {
        LinkRequest::Landlord(id.to_string())
    } else {
        LinkRequest::Unknown
    })
}

#[derive(Clone)]
pub struct InboundHandler {
    db: Arc<dyn Database>,
    channel: Arc<dyn NotificationChannel>,
    resolver: ResponseResolver,
}

impl InboundHandler {
    pub fn new(
        db: Arc<dyn Database>,
        channel: Arc<dyn NotificationChannel>,
        resolver: ResponseResolver,
    ) -> Self {
        Self {
            db,
            channel,
            resolver,
        }
    }

    /// Handle one event. Never fails: every problem is logged and, where
    /// possible, reported to the user.
    pub async fn handle(&self, event: InboundEvent) {
        match event {
            InboundEvent::Callback {
                callback_id, data, ..
            } => self.handle_callback(&callback_id, &data).await,
            InboundEvent::Text { chat_id, text } => self.handle_text(&chat_id, &text).await,
        }
    }

    /// Consume a long-poll stream until it ends.
    pub async fn run(self, mut stream: InboundStream) {
        while let Some(event) = stream.next().await {
            self.handle(event).await;
        }
        warn!(channel = self.channel.name(), "Inbound stream ended");
    }

    async fn handle_callback(&self, callback_id: &str, data: &str) {
        let Some((action, token)) = parse_action_payload(data) else {
            debug!(data, "Ignoring callback with unknown payload");
            self.answer(callback_id, None, false).await;
            return;
        };

        match self.resolver.resolve(token, action).await {
            Ok(outcome) => {
                debug!(outcome = outcome.kind(), action = action.as_str(), "Callback resolved");
                self.answer(callback_id, Some(outcome.ack_text()), outcome.ack_alert())
                    .await;
            }
            Err(e) => {
                error!(action = action.as_str(), error = %e, "Callback handling failed");
                self.answer(callback_id, Some(messages::ACK_FAILED), true).await;
            }
        }
    }

    async fn answer(&self, callback_id: &str, text: Option<&str>, alert: bool) {
        if let Err(e) = self.channel.answer_callback(callback_id, text, alert).await {
            warn!(callback_id, error = %e, "Failed to answer callback");
        }
    }

    async fn handle_text(&self, chat_id: &str, text: &str) {
        let Some(request) = parse_start(text.trim()) else {
            return;
        };
        let reply = match self.link(chat_id, request).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(chat_id, error = %e, "Chat linking failed");
                messages::LINK_FAILED.to_string()
            }
        };
        if let Err(e) = self.channel.send_text(chat_id, &reply).await {
            warn!(chat_id, error = %e, "Failed to reply to /start");
        }
    }

    /// Store `chat_id` on the referenced cleaner or landlord and return the
    /// reply to send.
    async fn link(&self, chat_id: &str, request: LinkRequest) -> Result<String, DispatchError> {
        match request {
            LinkRequest::Unknown => Ok(messages::LINK_HELP.to_string()),
            LinkRequest::Cleaner(raw) => {
                let Ok(id) = Uuid::parse_str(&raw) else {
                    return Ok(messages::LINK_INVALID.to_string());
                };
                let Some(cleaner) = self.db.get_cleaner(id).await? else {
                    return Ok(messages::LINK_INVALID.to_string());
                };
                self.db.set_cleaner_chat_id(cleaner.id, chat_id).await?;
                info!(cleaner_id = %cleaner.id, chat_id, "Cleaner chat linked");
                Ok(messages::cleaner_linked(&cleaner.name))
            }
            LinkRequest::Landlord(raw) => {
                let Ok(id) = Uuid::parse_str(&raw) else {
                    return Ok(messages::LINK_INVALID.to_string());
                };
                if !self.db.set_landlord_chat_id(id, chat_id).await? {
                    return Ok(messages::LINK_INVALID.to_string());
                }
                info!(landlord_id = %id, chat_id, "Landlord chat linked");
                Ok(messages::LINK_LANDLORD_OK.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::MemoryChannel;
    use crate::dispatch::token::action_payload;
    use crate::dispatch::{
        DispatchOutcome, Dispatcher, EligibilityResolver, Notifier, OfferManager,
    };
    use crate::jobs::model::{Cleaner, Job, JobStatus, Landlord, OfferAction, Property};
    use crate::store::LibSqlBackend;
    use chrono::{Duration, Utc};

    struct Fixture {
        db: Arc<dyn Database>,
        channel: Arc<MemoryChannel>,
        dispatcher: Dispatcher,
        handler: InboundHandler,
        landlord: Landlord,
        property: Property,
    }

    async fn fixture() -> Fixture {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let channel = Arc::new(MemoryChannel::new());
        let landlord = Landlord::new("Lena");
        db.insert_landlord(&landlord).await.unwrap();
        let property = Property::new(landlord.id, "Loft");
        db.insert_property(&property).await.unwrap();

        let dispatcher = Dispatcher::new(
            db.clone(),
            EligibilityResolver::new(db.clone()),
            OfferManager::new(db.clone(), channel.clone(), 10),
        );
        let resolver = ResponseResolver::new(
            db.clone(),
            dispatcher.clone(),
            Notifier::new(db.clone(), channel.clone(), None),
            Duration::minutes(10),
        );
        let handler = InboundHandler::new(db.clone(), channel.clone(), resolver);
        Fixture {
            db,
            channel,
            dispatcher,
            handler,
            landlord,
            property,
        }
    }

    fn text(chat: &str, body: &str) -> InboundEvent {
        InboundEvent::Text {
            chat_id: chat.into(),
            text: body.into(),
        }
    }

    fn press(id: &str, data: String) -> InboundEvent {
        InboundEvent::Callback {
            callback_id: id.into(),
            chat_id: Some("1".into()),
            data,
        }
    }

    #[test]
    fn start_payloads() {
        assert_eq!(
            parse_start("/start cleaner_abc"),
            Some(LinkRequest::Cleaner("abc".into()))
        );
        assert_eq!(
            parse_start("/start@DispatchBot landlord_x"),
            Some(LinkRequest::Landlord("x".into()))
        );
        assert_eq!(parse_start("/start"), Some(LinkRequest::Unknown));
        assert_eq!(parse_start("/starting"), None);
        assert_eq!(parse_start("hello"), None);
    }

    #[tokio::test]
    async fn start_links_cleaner() {
        let f = fixture().await;
        let mut cleaner = Cleaner::new(f.landlord.id, "Ana <3");
        cleaner.chat_id = None;
        f.db.insert_cleaner(&cleaner).await.unwrap();

        f.handler
            .handle(text("42", &format!("/start cleaner_{}", cleaner.id)))
            .await;

        let stored = f.db.get_cleaner(cleaner.id).await.unwrap().unwrap();
        assert_eq!(stored.chat_id.as_deref(), Some("42"));
        let reply = f.channel.sent_to("42").await;
        assert!(reply[0].body.contains("Ana &lt;3"));
    }

    #[tokio::test]
    async fn start_links_landlord_and_rejects_unknown_ids() {
        let f = fixture().await;
        f.handler
            .handle(text("77", &format!("/start landlord_{}", f.landlord.id)))
            .await;
        assert_eq!(
            f.db.get_landlord(f.landlord.id).await.unwrap().unwrap().chat_id.as_deref(),
            Some("77")
        );
        f.handler
            .handle(text("78", &format!("/start cleaner_{}", Uuid::new_v4())))
            .await;
        f.handler.handle(text("79", "/start cleaner_not-a-uuid")).await;
        f.handler.handle(text("80", "/start")).await;
        f.handler.handle(text("81", "just chatting")).await;

        assert_eq!(f.channel.sent_to("77").await[0].body, messages::LINK_LANDLORD_OK);
        assert_eq!(f.channel.sent_to("78").await[0].body, messages::LINK_INVALID);
        assert_eq!(f.channel.sent_to("79").await[0].body, messages::LINK_INVALID);
        assert_eq!(f.channel.sent_to("80").await[0].body, messages::LINK_HELP);
        assert!(f.channel.sent_to("81").await.is_empty());
    }

    #[tokio::test]
    async fn callback_accept_is_acknowledged() {
        let f = fixture().await;
        let ana = Cleaner::new(f.landlord.id, "Ana").with_chat_id("1");
        f.db.insert_cleaner(&ana).await.unwrap();
        let start = Utc::now() + Duration::days(1);
        let job = Job::new(f.landlord.id, f.property.id, start, start + Duration::hours(1)).unwrap();
        f.db.insert_job(&job).await.unwrap();
        let DispatchOutcome::Offered { attempt, .. } = f.dispatcher.dispatch(job.id).await.unwrap()
        else {
            panic!("expected an offer");
        };

        f.handler
            .handle(press("cb-1", action_payload(OfferAction::Accept, &attempt.offer_token)))
            .await;
        f.handler
            .handle(press("cb-2", action_payload(OfferAction::Accept, &attempt.offer_token)))
            .await;
        f.handler.handle(press("cb-3", "accept:unknown".into())).await;
        f.handler.handle(press("cb-4", "garbage".into())).await;

        let answers = f.channel.answers().await;
        assert_eq!(answers.len(), 4);
        assert_eq!(answers[0].text.as_deref(), Some(messages::ACK_ACCEPTED));
        assert_eq!(answers[1].text.as_deref(), Some(messages::ACK_ALREADY_ANSWERED));
        assert_eq!(answers[2].text.as_deref(), Some(messages::ACK_EXPIRED));
        assert!(answers[2].alert);
        assert_eq!(answers[3].text, None);

        assert_eq!(
            f.db.get_job(job.id).await.unwrap().unwrap().status,
            JobStatus::Accepted
        );
    }
}
