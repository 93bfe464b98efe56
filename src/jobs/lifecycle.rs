//! Job lifecycle operations outside the offer loop: creation, direct
//! assignment, start, completion, review, cancellation and manual reminders.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dispatch::token::generate_offer_token;
use crate::dispatch::{DispatchOutcome, Dispatcher, Notifier};
use crate::error::DispatchError;
use crate::jobs::model::{Job, JobStatus, OfferStatus, Review};
use crate::store::{AssignResult, CancelResult, Database, DeleteResult};

/// Input for [`JobLifecycle::create_job`].
#[derive(Debug, Clone)]
pub struct NewJob {
    pub landlord_id: Uuid,
    pub property_id: Uuid,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub booking_ref: Option<String>,
    /// Run a dispatch right after the job is stored.
    pub auto_dispatch: bool,
}

/// Landlord edit of a job that has not been taken yet. `None` keeps the
/// current value; an empty `booking_ref` clears it.
#[derive(Debug, Clone, Default)]
pub struct JobEdit {
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub booking_ref: Option<String>,
}

/// A freshly created job and, when requested, what its first dispatch did.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedJob {
    pub job: Job,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch: Option<DispatchOutcome>,
    /// Set when auto-dispatch was requested but failed. The job itself is
    /// stored either way.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch_error: Option<String>,
}

#[derive(Clone)]
pub struct JobLifecycle {
    db: Arc<dyn Database>,
    dispatcher: Dispatcher,
    notifier: Notifier,
}

impl JobLifecycle {
    pub fn new(db: Arc<dyn Database>, dispatcher: Dispatcher, notifier: Notifier) -> Self {
        Self {
            db,
            dispatcher,
            notifier,
        }
    }

    async fn load(&self, job_id: Uuid) -> Result<Job, DispatchError> {
        self.db
            .get_job(job_id)
            .await?
            .ok_or(DispatchError::JobNotFound { id: job_id })
    }

    /// Re-read a job after a conditional write lost, and report its state.
    async fn lost_transition(&self, job_id: Uuid, operation: &str) -> DispatchError {
        match self.db.get_job(job_id).await {
            Ok(Some(job)) => DispatchError::InvalidJobState {
                id: job.id,
                status: job.status,
                operation: operation.to_string(),
            },
            Ok(None) => DispatchError::JobNotFound { id: job_id },
            Err(e) => e.into(),
        }
    }

    pub async fn create_job(&self, input: NewJob) -> Result<CreatedJob, DispatchError> {
        let property = self
            .db
            .get_property(input.property_id)
            .await?
            .filter(|p| p.landlord_id == input.landlord_id)
            .ok_or_else(|| {
                DispatchError::Validation(format!(
                    "Property {} does not belong to landlord {}",
                    input.property_id, input.landlord_id
                ))
            })?;

        let mut job = Job::new(
            input.landlord_id,
            property.id,
            input.window_start,
            input.window_end,
        )?;
        if let Some(booking_ref) = input
            .booking_ref
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
        {
            job = job.with_booking_ref(booking_ref);
        }
        self.db.insert_job(&job).await?;
        info!(job_id = %job.id, property_id = %property.id, "Job created");

        if !input.auto_dispatch {
            return Ok(CreatedJob {
                job,
                dispatch: None,
                dispatch_error: None,
            });
        }

        let (dispatch, dispatch_error) = match self.dispatcher.dispatch(job.id).await {
            Ok(outcome) => (Some(outcome), None),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Auto-dispatch failed");
                (None, Some(e.to_string()))
            }
        };
        let job = self.load(job.id).await?;
        Ok(CreatedJob {
            job,
            dispatch,
            dispatch_error,
        })
    }

    /// Landlord override: give the job to `cleaner_id` without waiting for
    /// an offer round-trip. Goes through the same "still unassigned" check
    /// as an accept, so it cannot produce a second winner.
    pub async fn assign(&self, job_id: Uuid, cleaner_id: Uuid) -> Result<Job, DispatchError> {
        let job = self.load(job_id).await?;
        let cleaner = self
            .db
            .get_cleaner(cleaner_id)
            .await?
            .filter(|c| c.landlord_id == job.landlord_id)
            .ok_or(DispatchError::CleanerNotFound { id: cleaner_id })?;
        job.ensure_transition(JobStatus::Accepted, "assign")?;

        let token = generate_offer_token();
        match self
            .db
            .assign_directly(job.id, cleaner.id, &token, Utc::now())
            .await?
        {
            AssignResult::JobMissing => Err(DispatchError::JobNotFound { id: job_id }),
            AssignResult::JobUnavailable { job } => Err(DispatchError::InvalidJobState {
                id: job.id,
                status: job.status,
                operation: "assign".into(),
            }),
            AssignResult::Assigned { job, cancelled, .. } => {
                info!(
                    job_id = %job.id,
                    cleaner_id = %cleaner.id,
                    withdrawn = cancelled.len(),
                    "Job assigned directly"
                );
                self.notifier.job_assigned(&job, &cancelled).await;
                Ok(job)
            }
        }
    }

    fn ensure_assignee(job: &Job, cleaner_id: Uuid) -> Result<(), DispatchError> {
        if job.assigned_cleaner_id == Some(cleaner_id) {
            Ok(())
        } else {
            Err(DispatchError::NotAssigned {
                job_id: job.id,
                cleaner_id,
            })
        }
    }

    /// `accepted → in_progress`, by the assigned cleaner.
    pub async fn start(&self, job_id: Uuid, cleaner_id: Uuid) -> Result<Job, DispatchError> {
        let job = self.load(job_id).await?;
        Self::ensure_assignee(&job, cleaner_id)?;
        job.ensure_transition(JobStatus::InProgress, "start")?;

        if !self
            .db
            .transition_job(job.id, job.status, JobStatus::InProgress)
            .await?
        {
            return Err(self.lost_transition(job.id, "start").await);
        }
        info!(job_id = %job.id, %cleaner_id, "Job started");
        self.load(job.id).await
    }

    /// `accepted | in_progress → done_awaiting_review`, by the assigned
    /// cleaner. The landlord is asked for a review.
    pub async fn mark_done(&self, job_id: Uuid, cleaner_id: Uuid) -> Result<Job, DispatchError> {
        let job = self.load(job_id).await?;
        Self::ensure_assignee(&job, cleaner_id)?;
        job.ensure_transition(JobStatus::DoneAwaitingReview, "mark done")?;

        if !self
            .db
            .transition_job(job.id, job.status, JobStatus::DoneAwaitingReview)
            .await?
        {
            return Err(self.lost_transition(job.id, "mark done").await);
        }
        info!(job_id = %job.id, %cleaner_id, "Job marked done");

        let job = self.load(job.id).await?;
        self.notifier.job_done(&job, cleaner_id).await;
        Ok(job)
    }

    /// Rate the assigned cleaner and close the job. One review per job.
    pub async fn review(
        &self,
        job_id: Uuid,
        rating: i64,
        tags: &[String],
        comment: Option<&str>,
    ) -> Result<Review, DispatchError> {
        let job = self.load(job_id).await?;
        job.ensure_transition(JobStatus::Completed, "review")?;
        let cleaner_id = job.assigned_cleaner_id.ok_or(DispatchError::InvalidJobState {
            id: job.id,
            status: job.status,
            operation: "review".into(),
        })?;

        let review = Review::new(job.id, cleaner_id, rating, tags, comment)?;
        if !self.db.complete_with_review(&review).await? {
            if self.db.get_review_for_job(job.id).await?.is_some() {
                return Err(DispatchError::Validation(
                    "This job has already been reviewed".into(),
                ));
            }
            return Err(self.lost_transition(job.id, "review").await);
        }
        info!(job_id = %job.id, rating = review.rating, "Job reviewed");
        Ok(review)
    }

    /// Cancel a non-terminal job. Open offers are withdrawn and the
    /// affected cleaners told.
    pub async fn cancel(&self, job_id: Uuid) -> Result<Job, DispatchError> {
        match self.db.cancel_job(job_id, Utc::now()).await? {
            CancelResult::JobMissing => Err(DispatchError::JobNotFound { id: job_id }),
            CancelResult::NotCancellable { status } => Err(DispatchError::InvalidJobState {
                id: job_id,
                status,
                operation: "cancel".into(),
            }),
            CancelResult::Cancelled {
                previous,
                withdrawn,
            } => {
                info!(
                    job_id = %job_id,
                    previous = %previous.status,
                    withdrawn = withdrawn.len(),
                    "Job cancelled"
                );
                self.notifier.job_withdrawn(&previous, &withdrawn).await;
                self.load(job_id).await
            }
        }
    }

    /// Move the window or change the booking reference. Only jobs nobody
    /// has taken yet can be edited; cleaners holding a live offer are sent
    /// the new window.
    pub async fn edit(&self, job_id: Uuid, edit: JobEdit) -> Result<Job, DispatchError> {
        let job = self.load(job_id).await?;
        if !job.status.is_dispatchable() {
            return Err(DispatchError::InvalidJobState {
                id: job.id,
                status: job.status,
                operation: "edit".into(),
            });
        }
        let window_start = edit.window_start.unwrap_or(job.window_start);
        let window_end = edit.window_end.unwrap_or(job.window_end);
        if window_end <= window_start {
            return Err(DispatchError::Validation(
                "Window end must be after window start".into(),
            ));
        }
        let booking_ref = match edit.booking_ref.as_deref().map(str::trim) {
            Some("") => None,
            Some(r) => Some(r),
            None => job.booking_ref.as_deref(),
        };

        if !self
            .db
            .reschedule_job(job.id, window_start, window_end, booking_ref, Utc::now())
            .await?
        {
            return Err(self.lost_transition(job.id, "edit").await);
        }
        let job = self.load(job.id).await?;
        info!(job_id = %job.id, "Job edited");

        let live: Vec<_> = self
            .db
            .list_attempts_for_job(job.id)
            .await?
            .into_iter()
            .filter(|a| a.status == OfferStatus::Sent)
            .collect();
        self.notifier.offer_rescheduled(&job, &live).await;
        Ok(job)
    }

    /// Remove a job with its history. Open offers stop working and anyone
    /// still expecting to clean it is told.
    pub async fn delete(&self, job_id: Uuid) -> Result<Job, DispatchError> {
        match self.db.delete_job(job_id).await? {
            DeleteResult::JobMissing => Err(DispatchError::JobNotFound { id: job_id }),
            DeleteResult::Deleted { job, withdrawn } => {
                info!(
                    job_id = %job_id,
                    status = %job.status,
                    withdrawn = withdrawn.len(),
                    "Job deleted"
                );
                if !matches!(
                    job.status,
                    JobStatus::DoneAwaitingReview | JobStatus::Completed
                ) {
                    self.notifier.job_withdrawn(&job, &withdrawn).await;
                }
                Ok(job)
            }
        }
    }

    /// Send the pre-window reminder now instead of waiting for the sweep.
    pub async fn send_reminder(&self, job_id: Uuid) -> Result<Job, DispatchError> {
        let job = self.load(job_id).await?;
        if !matches!(job.status, JobStatus::Accepted | JobStatus::InProgress) {
            return Err(DispatchError::InvalidJobState {
                id: job.id,
                status: job.status,
                operation: "send reminder".into(),
            });
        }
        if job.reminder_sent_at.is_some() {
            return Err(DispatchError::Validation(
                "Reminder already sent for this job".into(),
            ));
        }

        self.notifier.send_reminder(&job).await?;
        if !self.db.mark_reminder_sent(job.id, Utc::now()).await? {
            warn!(job_id = %job.id, "Reminder marker was set concurrently");
        }
        info!(job_id = %job.id, "Reminder sent");
        self.load(job.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::MemoryChannel;
    use crate::dispatch::{EligibilityResolver, OfferManager, messages};
    use crate::jobs::model::{Cleaner, Landlord, OfferStatus, Property};
    use crate::store::LibSqlBackend;
    use chrono::Duration;

    struct Fixture {
        db: Arc<dyn Database>,
        channel: Arc<MemoryChannel>,
        lifecycle: JobLifecycle,
        landlord: Landlord,
        property: Property,
    }

    async fn fixture() -> Fixture {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let channel = Arc::new(MemoryChannel::new());
        let mut landlord = Landlord::new("Lena");
        landlord.chat_id = Some("900".into());
        db.insert_landlord(&landlord).await.unwrap();
        let property = Property::new(landlord.id, "Loft");
        db.insert_property(&property).await.unwrap();

        let dispatcher = Dispatcher::new(
            db.clone(),
            EligibilityResolver::new(db.clone()),
            OfferManager::new(db.clone(), channel.clone(), 10),
        );
        let notifier = Notifier::new(db.clone(), channel.clone(), None);
        let lifecycle = JobLifecycle::new(db.clone(), dispatcher, notifier);
        Fixture {
            db,
            channel,
            lifecycle,
            landlord,
            property,
        }
    }

    async fn cleaner(f: &Fixture, name: &str, chat: &str) -> Cleaner {
        let c = Cleaner::new(f.landlord.id, name).with_chat_id(chat);
        f.db.insert_cleaner(&c).await.unwrap();
        c
    }

    fn new_job(f: &Fixture, auto_dispatch: bool) -> NewJob {
        let start = Utc::now() + Duration::hours(6);
        NewJob {
            landlord_id: f.landlord.id,
            property_id: f.property.id,
            window_start: start,
            window_end: start + Duration::hours(2),
            booking_ref: Some("  HM-123 ".into()),
            auto_dispatch,
        }
    }

    #[tokio::test]
    async fn create_rejects_foreign_property() {
        let f = fixture().await;
        let mut input = new_job(&f, false);
        input.landlord_id = Uuid::new_v4();
        let err = f.lifecycle.create_job(input).await.unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }

    #[tokio::test]
    async fn create_rejects_inverted_window() {
        let f = fixture().await;
        let mut input = new_job(&f, false);
        std::mem::swap(&mut input.window_start, &mut input.window_end);
        let err = f.lifecycle.create_job(input).await.unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }

    #[tokio::test]
    async fn create_with_auto_dispatch_offers_job() {
        let f = fixture().await;
        cleaner(&f, "Ana", "1").await;
        let created = f.lifecycle.create_job(new_job(&f, true)).await.unwrap();
        assert_eq!(created.job.status, JobStatus::Offered);
        assert_eq!(created.job.booking_ref.as_deref(), Some("HM-123"));
        assert!(matches!(created.dispatch, Some(DispatchOutcome::Offered { .. })));
        assert!(created.dispatch_error.is_none());
    }

    #[tokio::test]
    async fn auto_dispatch_failure_still_stores_job() {
        let f = fixture().await;
        cleaner(&f, "Ana", "1").await;
        f.channel.fail_address("1").await;
        let created = f.lifecycle.create_job(new_job(&f, true)).await.unwrap();
        assert_eq!(created.job.status, JobStatus::New);
        assert!(created.dispatch.is_none());
        assert!(created.dispatch_error.is_some());
    }

    #[tokio::test]
    async fn assign_withdraws_open_offer() {
        let f = fixture().await;
        let ana = cleaner(&f, "Ana", "1").await;
        let ben = cleaner(&f, "Ben", "2").await;
        let created = f.lifecycle.create_job(new_job(&f, true)).await.unwrap();

        let job = f.lifecycle.assign(created.job.id, ben.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Accepted);
        assert_eq!(job.assigned_cleaner_id, Some(ben.id));

        let attempts = f.db.list_attempts_for_job(job.id).await.unwrap();
        let to_ana = attempts.iter().find(|a| a.cleaner_id == ana.id).unwrap();
        assert_eq!(to_ana.status, OfferStatus::Cancelled);
        let to_ben = attempts.iter().find(|a| a.cleaner_id == ben.id).unwrap();
        assert_eq!(to_ben.status, OfferStatus::Accepted);

        let ana_msgs = f.channel.sent_to("1").await;
        assert_eq!(ana_msgs.last().unwrap().body, messages::CLEANER_LOST_RACE);
        assert!(f.channel.sent_to("2").await[0].body.contains("assigned"));

        // A second assignment cannot produce another winner.
        let err = f.lifecycle.assign(job.id, ana.id).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidJobState { .. }));
    }

    #[tokio::test]
    async fn assign_rejects_other_landlords_cleaner() {
        let f = fixture().await;
        let other = Landlord::new("Olga");
        f.db.insert_landlord(&other).await.unwrap();
        let stranger = Cleaner::new(other.id, "Sam").with_chat_id("7");
        f.db.insert_cleaner(&stranger).await.unwrap();
        let created = f.lifecycle.create_job(new_job(&f, false)).await.unwrap();

        let err = f.lifecycle.assign(created.job.id, stranger.id).await.unwrap_err();
        assert!(matches!(err, DispatchError::CleanerNotFound { .. }));
    }

    #[tokio::test]
    async fn full_lifecycle_through_review() {
        let f = fixture().await;
        let ana = cleaner(&f, "Ana", "1").await;
        let ben = cleaner(&f, "Ben", "2").await;
        let created = f.lifecycle.create_job(new_job(&f, false)).await.unwrap();
        let id = created.job.id;
        f.lifecycle.assign(id, ana.id).await.unwrap();

        let err = f.lifecycle.start(id, ben.id).await.unwrap_err();
        assert!(matches!(err, DispatchError::NotAssigned { .. }));

        let job = f.lifecycle.start(id, ana.id).await.unwrap();
        assert_eq!(job.status, JobStatus::InProgress);

        let job = f.lifecycle.mark_done(id, ana.id).await.unwrap();
        assert_eq!(job.status, JobStatus::DoneAwaitingReview);
        assert!(
            f.channel.sent_to("900").await[0]
                .body
                .contains("marked the job as done")
        );

        let review = f
            .lifecycle
            .review(id, 5, &["excellent".into(), "bogus".into()], Some(" great "))
            .await
            .unwrap();
        assert_eq!(review.cleaner_id, ana.id);
        assert_eq!(review.tags, vec!["excellent".to_string()]);
        assert_eq!(
            f.db.get_job(id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );

        let err = f.lifecycle.review(id, 4, &[], None).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidJobState { .. }));
    }

    #[tokio::test]
    async fn mark_done_straight_from_accepted() {
        let f = fixture().await;
        let ana = cleaner(&f, "Ana", "1").await;
        let created = f.lifecycle.create_job(new_job(&f, false)).await.unwrap();
        f.lifecycle.assign(created.job.id, ana.id).await.unwrap();
        let job = f.lifecycle.mark_done(created.job.id, ana.id).await.unwrap();
        assert_eq!(job.status, JobStatus::DoneAwaitingReview);
    }

    #[tokio::test]
    async fn review_rating_out_of_range_changes_nothing() {
        let f = fixture().await;
        let ana = cleaner(&f, "Ana", "1").await;
        let created = f.lifecycle.create_job(new_job(&f, false)).await.unwrap();
        f.lifecycle.assign(created.job.id, ana.id).await.unwrap();
        f.lifecycle.mark_done(created.job.id, ana.id).await.unwrap();

        let err = f.lifecycle.review(created.job.id, 9, &[], None).await.unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
        assert_eq!(
            f.db.get_job(created.job.id).await.unwrap().unwrap().status,
            JobStatus::DoneAwaitingReview
        );
    }

    #[tokio::test]
    async fn cancel_tells_assignee_and_is_final() {
        let f = fixture().await;
        let ana = cleaner(&f, "Ana", "1").await;
        let created = f.lifecycle.create_job(new_job(&f, false)).await.unwrap();
        f.lifecycle.assign(created.job.id, ana.id).await.unwrap();

        let job = f.lifecycle.cancel(created.job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.assigned_cleaner_id.is_none());
        assert!(
            f.channel.sent_to("1").await.last().unwrap().body.contains("cancelled")
        );

        let err = f.lifecycle.cancel(created.job.id).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::InvalidJobState {
                status: JobStatus::Cancelled,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn manual_reminder_once() {
        let f = fixture().await;
        let ana = cleaner(&f, "Ana", "1").await;
        let created = f.lifecycle.create_job(new_job(&f, false)).await.unwrap();

        let err = f.lifecycle.send_reminder(created.job.id).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidJobState { .. }));

        f.lifecycle.assign(created.job.id, ana.id).await.unwrap();
        let job = f.lifecycle.send_reminder(created.job.id).await.unwrap();
        assert!(job.reminder_sent_at.is_some());
        assert!(f.channel.sent_to("1").await.last().unwrap().body.contains("Reminder"));

        let err = f.lifecycle.send_reminder(created.job.id).await.unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }

    #[tokio::test]
    async fn edit_moves_window_and_tells_offer_holder() {
        let f = fixture().await;
        cleaner(&f, "Ana", "1").await;
        let created = f.lifecycle.create_job(new_job(&f, true)).await.unwrap();

        let start = Utc::now() + Duration::days(2);
        let job = f
            .lifecycle
            .edit(
                created.job.id,
                JobEdit {
                    window_start: Some(start),
                    window_end: Some(start + Duration::hours(3)),
                    booking_ref: Some("".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Offered);
        assert!(job.booking_ref.is_none());
        assert!(job.window_end > job.window_start);

        let to_ana = f.channel.sent_to("1").await;
        assert_eq!(to_ana.len(), 2);
        assert!(to_ana[1].body.contains("Offer updated"));
    }

    #[tokio::test]
    async fn edit_validates_window_and_state() {
        let f = fixture().await;
        let ana = cleaner(&f, "Ana", "1").await;
        let created = f.lifecycle.create_job(new_job(&f, false)).await.unwrap();

        let inverted = JobEdit {
            window_end: Some(created.job.window_start - Duration::hours(1)),
            ..JobEdit::default()
        };
        let err = f.lifecycle.edit(created.job.id, inverted).await.unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));

        f.lifecycle.assign(created.job.id, ana.id).await.unwrap();
        let err = f
            .lifecycle
            .edit(
                created.job.id,
                JobEdit {
                    booking_ref: Some("X".into()),
                    ..JobEdit::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::InvalidJobState {
                status: JobStatus::Accepted,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn delete_kills_open_offer() {
        let f = fixture().await;
        cleaner(&f, "Ana", "1").await;
        let created = f.lifecycle.create_job(new_job(&f, true)).await.unwrap();
        let Some(DispatchOutcome::Offered { attempt, .. }) = created.dispatch else {
            panic!("expected an offer");
        };

        let deleted = f.lifecycle.delete(created.job.id).await.unwrap();
        assert_eq!(deleted.id, created.job.id);
        assert!(f.db.get_job(created.job.id).await.unwrap().is_none());
        assert!(f.db.get_attempt_by_token(&attempt.offer_token).await.unwrap().is_none());
        assert_eq!(
            f.channel.sent_to("1").await.last().unwrap().body,
            messages::job_withdrawn("Loft")
        );

        let err = f.lifecycle.delete(created.job.id).await.unwrap_err();
        assert!(matches!(err, DispatchError::JobNotFound { .. }));
    }
}
