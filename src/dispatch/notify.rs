//! Follow-up messages to cleaners and landlords.
//!
//! Everything here runs after a state change has been committed, so
//! delivery failures are logged and never fail the caller.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channels::NotificationChannel;
use crate::dispatch::messages;
use crate::error::DispatchError;
use crate::jobs::model::{DispatchAttempt, Job};
use crate::store::Database;

/// What happened after a decline, as reported to the landlord.
#[derive(Debug, Clone)]
pub enum Fallback {
    /// The job was offered to the named cleaner.
    Offered { cleaner_name: String },
    NoEligibleCleaner,
    /// Re-dispatch failed (channel down, job moved on, ...).
    Failed { reason: String },
}

#[derive(Clone)]
pub struct Notifier {
    db: Arc<dyn Database>,
    channel: Arc<dyn NotificationChannel>,
    public_base_url: Option<String>,
}

impl Notifier {
    pub fn new(
        db: Arc<dyn Database>,
        channel: Arc<dyn NotificationChannel>,
        public_base_url: Option<String>,
    ) -> Self {
        Self {
            db,
            channel,
            public_base_url: public_base_url
                .map(|u| u.trim().trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty()),
        }
    }

    /// Dashboard link for a job, when a public base URL is configured.
    pub fn job_url(&self, job_id: Uuid) -> Option<String> {
        self.public_base_url
            .as_ref()
            .map(|base| format!("{base}/dashboard/jobs/{job_id}"))
    }

    /// Send `text` to a cleaner's linked chat, if any.
    pub async fn tell_cleaner(&self, cleaner_id: Uuid, text: &str) {
        let cleaner = match self.db.get_cleaner(cleaner_id).await {
            Ok(Some(cleaner)) => cleaner,
            Ok(None) => return,
            Err(e) => {
                warn!(%cleaner_id, error = %e, "Cleaner lookup failed");
                return;
            }
        };
        let Some(chat) = cleaner.linked_chat() else {
            debug!(%cleaner_id, "Cleaner has no linked chat, skipping message");
            return;
        };
        if let Err(e) = self.channel.send_text(chat, text).await {
            warn!(%cleaner_id, error = %e, "Failed to message cleaner");
        }
    }

    /// Send `text` to the landlord, with a link button when `link_label` is
    /// given and a job URL is available.
    async fn tell_landlord(&self, job: &Job, text: &str, link_label: Option<&str>) {
        let landlord = match self.db.get_landlord(job.landlord_id).await {
            Ok(Some(landlord)) => landlord,
            Ok(None) => return,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Landlord lookup failed");
                return;
            }
        };
        let Some(chat) = landlord
            .chat_id
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
        else {
            return;
        };

        let result = match (link_label, self.job_url(job.id)) {
            (Some(label), Some(url)) => {
                self.channel
                    .send_with_link_action(chat, text, label, &url)
                    .await
            }
            _ => self.channel.send_text(chat, text).await,
        };
        if let Err(e) = result {
            warn!(job_id = %job.id, error = %e, "Failed to notify landlord");
        }
    }

    async fn property_name(&self, job: &Job) -> String {
        match self.db.get_property(job.property_id).await {
            Ok(Some(property)) => property.name,
            _ => "Your property".to_string(),
        }
    }

    async fn cleaner_name(&self, cleaner_id: Uuid) -> String {
        match self.db.get_cleaner(cleaner_id).await {
            Ok(Some(cleaner)) => cleaner.name,
            _ => "The cleaner".to_string(),
        }
    }

    /// Winner confirmation, loser notices and the landlord update.
    pub async fn offer_accepted(
        &self,
        job: &Job,
        winner: &DispatchAttempt,
        cancelled: &[DispatchAttempt],
    ) {
        self.tell_cleaner(winner.cleaner_id, messages::CLEANER_ACCEPTED)
            .await;

        join_all(
            cancelled
                .iter()
                .map(|lost| self.tell_cleaner(lost.cleaner_id, messages::CLEANER_LOST_RACE)),
        )
        .await;

        let property = self.property_name(job).await;
        let cleaner = self.cleaner_name(winner.cleaner_id).await;
        self.tell_landlord(
            job,
            &messages::landlord_accepted(&property, &cleaner),
            Some(messages::VIEW_JOB_LABEL),
        )
        .await;
    }

    /// Direct assignment by the landlord: tell the assignee, and withdraw
    /// any offers that were still open.
    pub async fn job_assigned(&self, job: &Job, cancelled: &[DispatchAttempt]) {
        if let Some(assignee) = job.assigned_cleaner_id {
            let property = self.property_name(job).await;
            self.tell_cleaner(
                assignee,
                &messages::assigned(&property, job.window_start, job.window_end),
            )
            .await;
        }
        join_all(
            cancelled
                .iter()
                .map(|lost| self.tell_cleaner(lost.cleaner_id, messages::CLEANER_LOST_RACE)),
        )
        .await;
    }

    /// New window for cleaners holding a live offer.
    pub async fn offer_rescheduled(&self, job: &Job, live: &[DispatchAttempt]) {
        if live.is_empty() {
            return;
        }
        let property = self.property_name(job).await;
        let text = messages::offer_rescheduled(&property, job.window_start, job.window_end);
        join_all(live.iter().map(|a| self.tell_cleaner(a.cleaner_id, &text))).await;
    }

    pub async fn offer_declined(&self, job: &Job, cleaner_id: Uuid, fallback: &Fallback) {
        let property = self.property_name(job).await;
        let cleaner = self.cleaner_name(cleaner_id).await;
        let next = match fallback {
            Fallback::Offered { cleaner_name } => Some(cleaner_name.as_str()),
            Fallback::NoEligibleCleaner | Fallback::Failed { .. } => None,
        };
        self.tell_landlord(
            job,
            &messages::landlord_declined(&property, &cleaner, next),
            Some(messages::VIEW_JOB_LABEL),
        )
        .await;
    }

    pub async fn job_done(&self, job: &Job, cleaner_id: Uuid) {
        let property = self.property_name(job).await;
        let cleaner = self.cleaner_name(cleaner_id).await;
        self.tell_landlord(
            job,
            &messages::landlord_done(&property, &cleaner),
            Some(messages::REVIEW_LABEL),
        )
        .await;
    }

    /// Tell the assignee and anyone holding a live offer that the job is gone.
    pub async fn job_withdrawn(&self, job: &Job, withdrawn: &[DispatchAttempt]) {
        let property = self.property_name(job).await;
        let text = messages::job_withdrawn(&property);

        let mut recipients: Vec<Uuid> = withdrawn.iter().map(|a| a.cleaner_id).collect();
        if let Some(assignee) = job.assigned_cleaner_id {
            recipients.push(assignee);
        }
        recipients.sort();
        recipients.dedup();

        join_all(recipients.into_iter().map(|id| self.tell_cleaner(id, &text))).await;
    }

    /// Send the pre-window reminder. Unlike the other notices this one
    /// reports failure, because the caller records whether it went out.
    pub async fn send_reminder(&self, job: &Job) -> Result<(), DispatchError> {
        let cleaner_id = job.assigned_cleaner_id.ok_or(DispatchError::InvalidJobState {
            id: job.id,
            status: job.status,
            operation: "send reminder".into(),
        })?;
        let cleaner = self
            .db
            .get_cleaner(cleaner_id)
            .await?
            .ok_or(DispatchError::CleanerNotFound { id: cleaner_id })?;
        let chat = cleaner.linked_chat().ok_or_else(|| {
            DispatchError::Validation(format!("Cleaner {} has no linked chat", cleaner.id))
        })?;
        let property = self.property_name(job).await;
        self.channel
            .send_text(
                chat,
                &messages::reminder(&property, job.window_start, job.window_end),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::MemoryChannel;
    use crate::jobs::model::{Cleaner, Landlord, Property};
    use crate::store::LibSqlBackend;

    async fn setup(base_url: Option<&str>) -> (Notifier, Arc<MemoryChannel>, Job, Cleaner) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mut landlord = Landlord::new("Lena");
        landlord.chat_id = Some("500".into());
        db.insert_landlord(&landlord).await.unwrap();
        let property = Property::new(landlord.id, "Loft");
        db.insert_property(&property).await.unwrap();
        let cleaner = Cleaner::new(landlord.id, "Ana").with_chat_id("100");
        db.insert_cleaner(&cleaner).await.unwrap();
        let start = chrono::Utc::now() + chrono::Duration::days(1);
        let job = Job::new(landlord.id, property.id, start, start + chrono::Duration::hours(2)).unwrap();
        db.insert_job(&job).await.unwrap();

        let channel = Arc::new(MemoryChannel::new());
        let notifier = Notifier::new(db, channel.clone(), base_url.map(String::from));
        (notifier, channel, job, cleaner)
    }

    #[tokio::test]
    async fn declined_notice_without_base_url_is_plain_text() {
        let (notifier, channel, job, cleaner) = setup(None).await;
        notifier
            .offer_declined(
                &job,
                cleaner.id,
                &Fallback::Offered {
                    cleaner_name: "Ben".into(),
                },
            )
            .await;

        let sent = channel.sent_to("500").await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].link.is_none());
        assert!(sent[0].body.contains("Ana declined"));
        assert!(sent[0].body.contains("<b>Ben</b>"));
    }

    #[tokio::test]
    async fn landlord_notice_carries_view_link() {
        let (notifier, channel, job, cleaner) = setup(Some("https://dispatch.example/")).await;
        let attempt = DispatchAttempt::new_sent(job.id, cleaner.id, "t".into());
        notifier.offer_accepted(&job, &attempt, &[]).await;

        let to_landlord = channel.sent_to("500").await;
        assert_eq!(
            to_landlord[0].link,
            Some((
                "View job".to_string(),
                format!("https://dispatch.example/dashboard/jobs/{}", job.id)
            ))
        );
        let to_cleaner = channel.sent_to("100").await;
        assert_eq!(to_cleaner[0].body, messages::CLEANER_ACCEPTED);
    }

    #[tokio::test]
    async fn failing_landlord_chat_does_not_panic() {
        let (notifier, channel, job, cleaner) = setup(None).await;
        channel.fail_address("500").await;
        notifier.job_done(&job, cleaner.id).await;
        assert!(channel.sent().await.is_empty());
    }
}
