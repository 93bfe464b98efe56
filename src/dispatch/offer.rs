//! Offer manager: persist one attempt, then deliver it.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::channels::{ActionButton, NotificationChannel};
use crate::dispatch::messages;
use crate::dispatch::token::{action_payload, generate_offer_token};
use crate::error::DispatchError;
use crate::jobs::model::{Cleaner, DispatchAttempt, Job, OfferAction, OfferStatus, Property};
use crate::store::Database;

/// Sends a single time-boxed offer to a single cleaner.
#[derive(Clone)]
pub struct OfferManager {
    db: Arc<dyn Database>,
    channel: Arc<dyn NotificationChannel>,
    response_minutes: i64,
}

impl OfferManager {
    pub fn new(
        db: Arc<dyn Database>,
        channel: Arc<dyn NotificationChannel>,
        response_minutes: i64,
    ) -> Self {
        Self {
            db,
            channel,
            response_minutes,
        }
    }

    /// Offer `job` to `cleaner`.
    ///
    /// The attempt row is written before anything is sent, and only while
    /// the job is still dispatchable; otherwise `InvalidJobState` comes back
    /// and nothing is sent. If delivery fails the attempt is closed as
    /// `cancelled` (it still counts as tried) and the channel error is
    /// returned. A duplicate (job, cleaner) pair surfaces as
    /// `DispatchError::Database(DatabaseError::Constraint)`.
    pub async fn send_offer(
        &self,
        job: &Job,
        property: &Property,
        cleaner: &Cleaner,
    ) -> Result<DispatchAttempt, DispatchError> {
        let Some(address) = cleaner.linked_chat() else {
            return Err(DispatchError::Validation(format!(
                "Cleaner {} has no linked chat",
                cleaner.id
            )));
        };

        let token = generate_offer_token();
        let attempt = DispatchAttempt::new_sent(job.id, cleaner.id, token.clone());
        if !self.db.insert_offer_attempt(&attempt).await? {
            debug!(job_id = %job.id, "Job moved on before the offer was stored");
            return Err(self.moved_on(job).await);
        }

        let body = messages::offer(
            &property.name,
            job.window_start,
            job.window_end,
            self.response_minutes,
        );
        let accept = ActionButton::new(
            messages::ACCEPT_LABEL,
            action_payload(OfferAction::Accept, &token),
        );
        let decline = ActionButton::new(
            messages::DECLINE_LABEL,
            action_payload(OfferAction::Decline, &token),
        );

        if let Err(e) = self
            .channel
            .send_with_two_actions(address, &body, &accept, &decline)
            .await
        {
            warn!(
                job_id = %job.id,
                cleaner_id = %cleaner.id,
                error = %e,
                "Offer delivery failed, withdrawing attempt"
            );
            self.withdraw(&attempt).await;
            return Err(DispatchError::Channel(e));
        }

        if !self.db.mark_job_offered(job.id).await? {
            // Accepted elsewhere or cancelled while we were sending.
            warn!(job_id = %job.id, "Job no longer dispatchable after offer was sent");
            self.withdraw(&attempt).await;
            return Err(self.moved_on(job).await);
        }

        info!(
            job_id = %job.id,
            cleaner_id = %cleaner.id,
            attempt_id = %attempt.id,
            "Offer sent"
        );
        Ok(attempt)
    }

    async fn withdraw(&self, attempt: &DispatchAttempt) {
        match self
            .db
            .close_attempt(attempt.id, OfferStatus::Cancelled, Utc::now())
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(attempt_id = %attempt.id, "Attempt already resolved"),
            Err(e) => warn!(attempt_id = %attempt.id, error = %e, "Failed to withdraw attempt"),
        }
    }

    /// State error carrying the job's current status.
    async fn moved_on(&self, job: &Job) -> DispatchError {
        let status = match self.db.get_job(job.id).await {
            Ok(Some(current)) => current.status,
            Ok(None) => return DispatchError::JobNotFound { id: job.id },
            Err(e) => return e.into(),
        };
        DispatchError::InvalidJobState {
            id: job.id,
            status,
            operation: "dispatch".into(),
        }
    }

    pub fn response_minutes(&self) -> i64 {
        self.response_minutes
    }
}
