//! Response resolver: accept/decline callbacks and the timeout sweep.
//!
//! Both entry points may run concurrently with each other and with
//! themselves. Every decision about who wins an attempt or a job is taken
//! inside a single store unit (`accept_offer`, `close_attempt`,
//! `timeout_stale_attempts`); whichever lands first wins and later callers
//! observe a non-`sent` attempt.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::messages;
use crate::dispatch::notify::{Fallback, Notifier};
use crate::dispatch::orchestrator::{DispatchOutcome, Dispatcher};
use crate::error::DispatchError;
use crate::jobs::model::{DispatchAttempt, Job, OfferAction, OfferStatus};
use crate::store::{AcceptResult, Database};

/// What a single accept/decline resolved to.
#[derive(Debug, Clone)]
pub enum ResolveOutcome {
    Accepted {
        job: Job,
        attempt: DispatchAttempt,
    },
    Declined {
        job_id: Uuid,
        fallback: Fallback,
    },
    /// The attempt had already been resolved; nothing changed.
    AlreadyAnswered,
    /// Another cleaner holds the job; this attempt is now `cancelled`.
    JobTaken,
    /// Unknown token.
    Expired,
}

impl ResolveOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Accepted { .. } => "accepted",
            Self::Declined { .. } => "declined",
            Self::AlreadyAnswered => "already_answered",
            Self::JobTaken => "job_taken",
            Self::Expired => "expired",
        }
    }

    /// Short acknowledgment for the responder.
    pub fn ack_text(&self) -> &'static str {
        match self {
            Self::Accepted { .. } => messages::ACK_ACCEPTED,
            Self::Declined { .. } => messages::ACK_DECLINED,
            Self::AlreadyAnswered => messages::ACK_ALREADY_ANSWERED,
            Self::JobTaken => messages::ACK_TAKEN,
            Self::Expired => messages::ACK_EXPIRED,
        }
    }

    /// Whether the acknowledgment deserves a modal alert instead of a toast.
    pub fn ack_alert(&self) -> bool {
        matches!(self, Self::JobTaken | Self::Expired)
    }
}

/// Counts reported by one timeout sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub timed_out: usize,
    pub jobs_checked: usize,
    pub dispatched: usize,
    pub no_eligible: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct ResponseResolver {
    db: Arc<dyn Database>,
    dispatcher: Dispatcher,
    notifier: Notifier,
    response_window: Duration,
}

impl ResponseResolver {
    pub fn new(
        db: Arc<dyn Database>,
        dispatcher: Dispatcher,
        notifier: Notifier,
        response_window: Duration,
    ) -> Self {
        Self {
            db,
            dispatcher,
            notifier,
            response_window,
        }
    }

    pub fn response_window(&self) -> Duration {
        self.response_window
    }

    /// Resolve an explicit response carrying `token`.
    pub async fn resolve(
        &self,
        token: &str,
        action: OfferAction,
    ) -> Result<ResolveOutcome, DispatchError> {
        let Some(attempt) = self.db.get_attempt_by_token(token).await? else {
            info!(action = action.as_str(), "Response for unknown offer token");
            return Ok(ResolveOutcome::Expired);
        };
        if attempt.status != OfferStatus::Sent {
            debug!(
                attempt_id = %attempt.id,
                status = %attempt.status,
                "Response for an attempt that is already resolved"
            );
            return self.closed_outcome(&attempt, attempt.status).await;
        }

        match action {
            OfferAction::Accept => self.accept(attempt).await,
            OfferAction::Decline => self.decline(attempt).await,
        }
    }

    /// Outcome for a response to an attempt that is no longer `sent`. An
    /// offer withdrawn because another cleaner won reads as `JobTaken`;
    /// anything else is a repeat answer. Nothing is written either way.
    async fn closed_outcome(
        &self,
        attempt: &DispatchAttempt,
        status: OfferStatus,
    ) -> Result<ResolveOutcome, DispatchError> {
        if status == OfferStatus::Cancelled {
            let taken = self
                .db
                .get_job(attempt.job_id)
                .await?
                .and_then(|job| job.assigned_cleaner_id)
                .is_some_and(|winner| winner != attempt.cleaner_id);
            if taken {
                return Ok(ResolveOutcome::JobTaken);
            }
        }
        Ok(ResolveOutcome::AlreadyAnswered)
    }

    async fn accept(&self, attempt: DispatchAttempt) -> Result<ResolveOutcome, DispatchError> {
        match self.db.accept_offer(attempt.id, Utc::now()).await? {
            AcceptResult::AttemptMissing => Ok(ResolveOutcome::Expired),
            AcceptResult::AttemptClosed { status } => {
                debug!(attempt_id = %attempt.id, %status, "Accept lost to an earlier resolution");
                self.closed_outcome(&attempt, status).await
            }
            AcceptResult::JobUnavailable { job } => {
                info!(
                    job_id = %job.id,
                    attempt_id = %attempt.id,
                    status = %job.status,
                    "Late accept, job no longer available"
                );
                self.notifier
                    .tell_cleaner(attempt.cleaner_id, messages::CLEANER_TAKEN)
                    .await;
                Ok(ResolveOutcome::JobTaken)
            }
            AcceptResult::Accepted {
                job,
                attempt,
                cancelled,
            } => {
                info!(
                    job_id = %job.id,
                    cleaner_id = %attempt.cleaner_id,
                    withdrawn = cancelled.len(),
                    "Offer accepted"
                );
                self.notifier
                    .offer_accepted(&job, &attempt, &cancelled)
                    .await;
                Ok(ResolveOutcome::Accepted { job, attempt })
            }
        }
    }

    async fn decline(&self, attempt: DispatchAttempt) -> Result<ResolveOutcome, DispatchError> {
        if !self
            .db
            .close_attempt(attempt.id, OfferStatus::Declined, Utc::now())
            .await?
        {
            return Ok(ResolveOutcome::AlreadyAnswered);
        }
        info!(job_id = %attempt.job_id, cleaner_id = %attempt.cleaner_id, "Offer declined");
        self.notifier
            .tell_cleaner(attempt.cleaner_id, messages::CLEANER_DECLINED)
            .await;

        let fallback = match self.dispatcher.dispatch(attempt.job_id).await {
            Ok(DispatchOutcome::Offered { cleaner, .. }) => Fallback::Offered {
                cleaner_name: cleaner.name,
            },
            Ok(DispatchOutcome::NoEligibleCleaner) => Fallback::NoEligibleCleaner,
            Err(e) => {
                warn!(job_id = %attempt.job_id, error = %e, "Fallback dispatch failed");
                Fallback::Failed {
                    reason: e.to_string(),
                }
            }
        };

        if let Some(job) = self.db.get_job(attempt.job_id).await? {
            self.notifier
                .offer_declined(&job, attempt.cleaner_id, &fallback)
                .await;
        }

        Ok(ResolveOutcome::Declined {
            job_id: attempt.job_id,
            fallback,
        })
    }

    /// Time out every offer left unanswered for longer than the response
    /// window, then fall back to the next cleaner for each affected job.
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> Result<SweepReport, DispatchError> {
        let cutoff = now - self.response_window;
        let swept = self.db.timeout_stale_attempts(cutoff).await?;

        let mut report = SweepReport {
            timed_out: swept.len(),
            ..SweepReport::default()
        };

        let mut seen = HashSet::new();
        let jobs: Vec<Uuid> = swept
            .iter()
            .map(|a| a.job_id)
            .filter(|id| seen.insert(*id))
            .collect();

        for job_id in jobs {
            report.jobs_checked += 1;
            match self.dispatcher.dispatch(job_id).await {
                Ok(DispatchOutcome::Offered { .. }) => report.dispatched += 1,
                Ok(DispatchOutcome::NoEligibleCleaner) => report.no_eligible += 1,
                Err(DispatchError::InvalidJobState { status, .. }) => {
                    // Another offer for the job was accepted, or it was cancelled.
                    debug!(%job_id, %status, "Timed-out job no longer dispatchable");
                }
                Err(e) => {
                    warn!(%job_id, error = %e, "Fallback dispatch after timeout failed");
                    report.failed += 1;
                }
            }
        }

        if report.timed_out > 0 {
            info!(
                timed_out = report.timed_out,
                jobs_checked = report.jobs_checked,
                dispatched = report.dispatched,
                no_eligible = report.no_eligible,
                failed = report.failed,
                "Timeout sweep finished"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::MemoryChannel;
    use crate::dispatch::eligibility::EligibilityResolver;
    use crate::dispatch::offer::OfferManager;
    use crate::jobs::model::{Cleaner, JobStatus, Landlord, Property, PropertyCleaner};
    use crate::store::LibSqlBackend;

    struct Fixture {
        db: Arc<dyn Database>,
        channel: Arc<MemoryChannel>,
        dispatcher: Dispatcher,
        resolver: ResponseResolver,
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
        let resolver = ResponseResolver::new(
            db.clone(),
            dispatcher.clone(),
            notifier,
            Duration::minutes(10),
        );
        Fixture {
            db,
            channel,
            dispatcher,
            resolver,
            landlord,
            property,
        }
    }

    async fn ranked(f: &Fixture, name: &str, chat: &str, priority: i64) -> Cleaner {
        let c = Cleaner::new(f.landlord.id, name).with_chat_id(chat);
        f.db.insert_cleaner(&c).await.unwrap();
        f.db.link_property_cleaner(&PropertyCleaner {
            property_id: f.property.id,
            cleaner_id: c.id,
            priority,
            is_primary: priority == 0,
        })
        .await
        .unwrap();
        c
    }

    async fn job(f: &Fixture) -> Job {
        let start = Utc::now() + Duration::days(1);
        let job = Job::new(f.landlord.id, f.property.id, start, start + Duration::hours(2)).unwrap();
        f.db.insert_job(&job).await.unwrap();
        job
    }

    async fn offer(f: &Fixture, job: &Job) -> DispatchAttempt {
        match f.dispatcher.dispatch(job.id).await.unwrap() {
            DispatchOutcome::Offered { attempt, .. } => attempt,
            DispatchOutcome::NoEligibleCleaner => panic!("expected an offer"),
        }
    }

    #[tokio::test]
    async fn unknown_token_is_expired() {
        let f = fixture().await;
        let outcome = f.resolver.resolve("garbage", OfferAction::Accept).await.unwrap();
        assert!(matches!(outcome, ResolveOutcome::Expired));
        assert!(outcome.ack_alert());
    }

    #[tokio::test]
    async fn accept_assigns_and_notifies() {
        let f = fixture().await;
        let a = ranked(&f, "Ana", "1", 0).await;
        let j = job(&f).await;
        let attempt = offer(&f, &j).await;

        let outcome = f
            .resolver
            .resolve(&attempt.offer_token, OfferAction::Accept)
            .await
            .unwrap();
        let ResolveOutcome::Accepted { job, attempt } = outcome else {
            panic!("expected Accepted");
        };
        assert_eq!(job.status, JobStatus::Accepted);
        assert_eq!(job.assigned_cleaner_id, Some(a.id));
        assert_eq!(attempt.status, OfferStatus::Accepted);

        let to_cleaner = f.channel.sent_to("1").await;
        assert_eq!(to_cleaner.last().unwrap().body, messages::CLEANER_ACCEPTED);
        let to_landlord = f.channel.sent_to("900").await;
        assert!(to_landlord[0].body.contains("Ana has accepted"));
    }

    #[tokio::test]
    async fn decline_falls_back_and_tells_landlord() {
        let f = fixture().await;
        ranked(&f, "Ana", "1", 0).await;
        let b = ranked(&f, "Ben", "2", 1).await;
        let j = job(&f).await;
        let first = offer(&f, &j).await;

        let outcome = f
            .resolver
            .resolve(&first.offer_token, OfferAction::Decline)
            .await
            .unwrap();
        let ResolveOutcome::Declined { fallback, .. } = outcome else {
            panic!("expected Declined");
        };
        assert!(matches!(fallback, Fallback::Offered { ref cleaner_name } if cleaner_name == "Ben"));

        let attempts = f.db.list_attempts_for_job(j.id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].status, OfferStatus::Declined);
        assert_eq!(attempts[1].cleaner_id, b.id);
        assert_eq!(attempts[1].status, OfferStatus::Sent);

        assert_eq!(f.db.get_job(j.id).await.unwrap().unwrap().status, JobStatus::Offered);
        let to_landlord = f.channel.sent_to("900").await;
        assert!(to_landlord[0].body.contains("We've offered the job to <b>Ben</b>."));
    }

    #[tokio::test]
    async fn last_decline_reports_no_eligible_cleaner() {
        let f = fixture().await;
        ranked(&f, "Ana", "1", 0).await;
        let j = job(&f).await;
        let only = offer(&f, &j).await;

        let outcome = f
            .resolver
            .resolve(&only.offer_token, OfferAction::Decline)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ResolveOutcome::Declined {
                fallback: Fallback::NoEligibleCleaner,
                ..
            }
        ));
        let to_landlord = f.channel.sent_to("900").await;
        assert!(to_landlord[0].body.contains("No other cleaner available"));
    }

    #[tokio::test]
    async fn second_response_is_already_answered() {
        let f = fixture().await;
        ranked(&f, "Ana", "1", 0).await;
        let j = job(&f).await;
        let attempt = offer(&f, &j).await;

        f.resolver
            .resolve(&attempt.offer_token, OfferAction::Accept)
            .await
            .unwrap();
        let before = f.db.get_job(j.id).await.unwrap().unwrap();

        for action in [OfferAction::Accept, OfferAction::Decline] {
            let outcome = f.resolver.resolve(&attempt.offer_token, action).await.unwrap();
            assert!(matches!(outcome, ResolveOutcome::AlreadyAnswered));
        }
        let after = f.db.get_job(j.id).await.unwrap().unwrap();
        assert_eq!(before.updated_at, after.updated_at);
        assert_eq!(f.db.list_attempts_for_job(j.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn withdrawn_offer_reports_job_taken() {
        let f = fixture().await;
        ranked(&f, "Ana", "1", 0).await;
        let b = ranked(&f, "Ben", "2", 1).await;
        let j = job(&f).await;
        let to_a = offer(&f, &j).await;
        let to_b = offer(&f, &j).await;

        let outcome = f
            .resolver
            .resolve(&to_b.offer_token, OfferAction::Accept)
            .await
            .unwrap();
        assert!(matches!(outcome, ResolveOutcome::Accepted { .. }));

        let late = f
            .resolver
            .resolve(&to_a.offer_token, OfferAction::Accept)
            .await
            .unwrap();
        assert!(matches!(late, ResolveOutcome::JobTaken));
        let job = f.db.get_job(j.id).await.unwrap().unwrap();
        assert_eq!(job.assigned_cleaner_id, Some(b.id));
        let a_attempt = f.db.get_attempt(to_a.id).await.unwrap().unwrap();
        assert_eq!(a_attempt.status, OfferStatus::Cancelled);
    }

    #[tokio::test]
    async fn sweep_times_out_and_redispatches() {
        let f = fixture().await;
        ranked(&f, "Ana", "1", 0).await;
        let b = ranked(&f, "Ben", "2", 1).await;
        let j = job(&f).await;
        let first = offer(&f, &j).await;

        // Nothing is stale yet.
        let report = f.resolver.sweep_timeouts(Utc::now()).await.unwrap();
        assert_eq!(report, SweepReport::default());

        let later = Utc::now() + Duration::minutes(11);
        let report = f.resolver.sweep_timeouts(later).await.unwrap();
        assert_eq!(report.timed_out, 1);
        assert_eq!(report.jobs_checked, 1);
        assert_eq!(report.dispatched, 1);

        let attempts = f.db.list_attempts_for_job(j.id).await.unwrap();
        assert_eq!(attempts[0].id, first.id);
        assert_eq!(attempts[0].status, OfferStatus::Timeout);
        assert_eq!(attempts[1].cleaner_id, b.id);

        // A late accept on the timed-out offer changes nothing.
        let outcome = f
            .resolver
            .resolve(&first.offer_token, OfferAction::Accept)
            .await
            .unwrap();
        assert!(matches!(outcome, ResolveOutcome::AlreadyAnswered));
    }

    #[tokio::test]
    async fn sweep_skips_jobs_that_were_accepted() {
        let f = fixture().await;
        let a = ranked(&f, "Ana", "1", 0).await;
        ranked(&f, "Ben", "2", 1).await;
        let j = job(&f).await;
        offer(&f, &j).await;
        let second = offer(&f, &j).await;
        f.resolver
            .resolve(&second.offer_token, OfferAction::Accept)
            .await
            .unwrap();

        // First offer was cancelled by the accept, so nothing is left to sweep.
        let report = f
            .resolver
            .sweep_timeouts(Utc::now() + Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(report.timed_out, 0);
        let job = f.db.get_job(j.id).await.unwrap().unwrap();
        assert_ne!(job.assigned_cleaner_id, Some(a.id));
    }

    #[test]
    fn outcome_acknowledgments() {
        assert_eq!(ResolveOutcome::AlreadyAnswered.ack_text(), "Already answered.");
        assert!(!ResolveOutcome::AlreadyAnswered.ack_alert());
        assert!(ResolveOutcome::JobTaken.ack_alert());
        assert_eq!(ResolveOutcome::JobTaken.kind(), "job_taken");
    }
}
